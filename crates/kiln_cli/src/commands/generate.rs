//! Generate command - stream a new project and run it.

use anyhow::Result;
use clap::Args;
use kiln_chat::GenerationRequest;
use kiln_core::EngineStart;
use tracing::info;

use super::session::{run_session, SessionArgs};

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// What to build
    pub prompt: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

pub async fn execute(args: GenerateArgs, quiet: bool) -> Result<()> {
    info!("Generating: {}", args.prompt);

    let mut request = GenerationRequest::new(args.prompt);
    if let Some(model) = &args.session.model {
        request = request.with_model(model);
    }
    run_session(args.session, EngineStart::Generate(request), quiet).await
}

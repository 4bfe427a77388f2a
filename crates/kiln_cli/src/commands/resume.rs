//! Resume command - restore the saved session of a workspace.

use anyhow::Result;
use clap::Args;
use kiln_core::EngineStart;

use super::session::{run_session, SessionArgs};

#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub session: SessionArgs,
}

pub async fn execute(args: ResumeArgs, quiet: bool) -> Result<()> {
    println!("🔄 Resuming session in {}", args.session.workspace.display());
    run_session(args.session, EngineStart::Resume, quiet).await
}

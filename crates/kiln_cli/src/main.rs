//! Kiln CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Generation error
//! - 4: Sandbox error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const GENERATION_ERROR: u8 = 3;
    pub const SANDBOX_ERROR: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "kiln=debug" } else { "kiln=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(default_level.parse().unwrap())
        .add_directive("warn".parse().unwrap());
    let log_result = if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .try_init()
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let result = match cli.command {
        Commands::Generate(args) => commands::generate::execute(args, cli.quiet).await,
        Commands::Resume(args) => commands::resume::execute(args, cli.quiet).await,
        Commands::Parse(args) => commands::parse::execute(args),
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let msg = format!("{:#}", e).to_lowercase();

    if msg.contains("sandbox") || msg.contains("host") {
        ExitCodes::SANDBOX_ERROR
    } else if msg.contains("llm") || msg.contains("generation") || msg.contains("stream") || msg.contains("resume") {
        ExitCodes::GENERATION_ERROR
    } else if msg.contains("argument") || msg.contains("not found") || msg.contains("unknown provider") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

//! CLI command definitions.

use clap::{Parser, Subcommand};

pub mod generate;
pub mod parse;
pub mod resume;
pub mod session;

/// Kiln - prompt-to-project generator with a self-healing sandbox
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Kiln - prompt-to-project generator with a self-healing sandbox")]
#[command(long_about = r#"
Kiln streams a project from a language model, projects it into a file tree,
and runs it in a local sandbox. Install failures and runtime errors are fed
back to the model as a regeneration request.

COMMANDS:
  generate  → Generate a project from a prompt and run it
  resume    → Restore the saved session of a workspace
  parse     → Parse artifact markup into steps and a file tree

While a session runs, type an instruction to regenerate, `/edit <path> <file>`
to replace a file with local content, or `/quit` to stop.

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Generation error
  4 - Sandbox error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress sandbox process output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a project from a prompt
    Generate(generate::GenerateArgs),

    /// Resume the saved session of a workspace
    Resume(resume::ResumeArgs),

    /// Parse artifact markup from a file or stdin
    Parse(parse::ParseArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_generate_args() {
        let cli = Cli::try_parse_from(["kiln", "generate", "a todo app", "--model", "gpt-5-mini", "-q"]).unwrap();
        assert!(cli.quiet);
        match cli.command {
            Commands::Generate(args) => {
                assert_eq!(args.prompt, "a todo app");
                assert_eq!(args.session.model.as_deref(), Some("gpt-5-mini"));
            }
            _ => panic!("expected generate"),
        }
    }
}

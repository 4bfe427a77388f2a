//! Sandbox command configuration.

use serde::{Deserialize, Serialize};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command line as typed in a shell.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// What the orchestrator runs inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Root-level dependency manifest watched for reinstalls
    pub manifest_file: String,
    /// Dependency install command
    pub install: CommandSpec,
    /// Long-running development server command
    pub dev: CommandSpec,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            manifest_file: "package.json".to_string(),
            install: CommandSpec::new("npm").arg("install"),
            dev: CommandSpec::new("npm").arg("run").arg("dev"),
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest_file(mut self, name: impl Into<String>) -> Self {
        self.manifest_file = name.into();
        self
    }

    pub fn install(mut self, command: CommandSpec) -> Self {
        self.install = command;
        self
    }

    pub fn dev(mut self, command: CommandSpec) -> Self {
        self.dev = command;
        self
    }
}

//! # kiln_sandbox
//!
//! Sandbox hosts for running generated projects.
//!
//! A host exposes five primitives: mount a file tree, spawn a process, make a
//! directory, write a file, and announce when a server is ready. The engine
//! talks to the [`SandboxHost`] trait only.
//!
//! - [`LocalHost`] runs processes with `tokio::process` in a local directory
//! - [`MockHost`] records calls and replays scripted processes for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_sandbox::{LocalHost, SandboxConfig, SandboxHost};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = LocalHost::new("/tmp/kiln-demo")?;
//!     let config = SandboxConfig::default();
//!
//!     host.write_file("package.json", "{}").await?;
//!     let install = host.spawn(&config.install.program, &config.install.args).await?;
//!     let code = install.wait_with_output(|line| println!("{}", line.message)).await?;
//!     println!("Exit code: {}", code);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod local;
pub mod mock;

pub use config::{CommandSpec, SandboxConfig};
pub use error::{HostError, HostResult};
pub use host::{
    detect_server_ready, strip_ansi, KillHandle, LogLine, LogStream, SandboxHost, ServerReady,
    SpawnedProcess,
};
pub use local::LocalHost;
pub use mock::{CapturedCall, MockHost, MockProcess, KILLED_EXIT_CODE};

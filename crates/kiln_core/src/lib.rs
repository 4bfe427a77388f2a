//! # kiln_core
//!
//! Runs a generation session against a sandbox and keeps it healthy.
//!
//! ## Components
//!
//! - **Orchestrator**: boot cycle (mount, install, dev server) and
//!   incremental sync of later tree changes
//! - **FailureMonitor**: error detection with a per-cycle latch, repeat
//!   suppression and a recovery budget
//! - **Engine**: single task tying the session controller, the orchestrator
//!   and user commands together
//! - **KilnConfig**: `.kiln/config.toml`
//!
//! ## Boot cycle
//!
//! ```text
//! Idle ─▶ Mounting ─▶ Installing ─┬─▶ Running ─▶ ErrorDetected ─┐
//!                                 └─▶ InstallFailed ────────────┤
//!   ▲                                                           ▼
//!   └──────────────────────────────────────────────────── Regenerating
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod orchestrator;

pub use config::{GenerationConfig, KilnConfig, MonitorConfig, CONFIG_FILE};
pub use engine::{Engine, EngineCommand, EngineHandle, EngineStart, DEFAULT_DEBOUNCE};
pub use error::{CoreError, CoreResult};
pub use monitor::{
    error_signature, FailureMonitor, RecoveryCause, RecoveryTrigger, SuppressReason, Verdict,
    DEFAULT_ERROR_KEYWORDS, DEFAULT_MAX_AUTO_RECOVERIES,
};
pub use orchestrator::{BootPhase, BootState, DevServer, Orchestrator, ProcessKind, SandboxEvent, TreeOutcome};

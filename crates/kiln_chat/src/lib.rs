//! # kiln_chat - Generation sessions
//!
//! This crate owns everything between a prompt and a file tree:
//! - Streaming text sources (OpenAI, Anthropic, plain-text relay)
//! - Incremental SSE and UTF-8 decoding of response bodies
//! - The session controller that feeds chunks through the artifact parser,
//!   tracks the active file and handles fallback and regeneration
//! - Persistence of the minimal state needed to resume
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  chunks  ┌───────────────────┐  steps  ┌─────────────┐
//! │  TextSource  │─────────▶│ SessionController │────────▶│  File tree  │
//! └──────────────┘          └─────────┬─────────┘         └─────────────┘
//!        ▲ fallback                   │
//!        │                            ▼
//! ┌──────────────┐          ┌───────────────────┐
//! │  TextSource  │          │   SessionStore    │
//! └──────────────┘          └───────────────────┘
//! ```

pub mod error;
pub mod llm;
pub mod mock;
pub mod persistence;
pub mod prompts;
pub mod session;
pub mod sse;
pub mod types;

pub use error::*;
pub use llm::*;
pub use mock::*;
pub use persistence::*;
pub use prompts::*;
pub use session::*;
pub use sse::*;
pub use types::*;

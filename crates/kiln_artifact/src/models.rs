//! Data models for parsed artifact output.

use serde::{Deserialize, Serialize};

/// What a step does once it is applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Synthetic first step, one per artifact.
    ProjectInit,
    /// Create (or overwrite) a file.
    CreateFile,
    /// Run a shell command.
    RunCommand,
}

/// Step status while the response is streaming.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Still being written.
    #[default]
    Pending,
    /// Closing delimiter seen, or a later step has begun.
    Completed,
}

/// A single unit of generated output, in stream order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    /// Monotonically increasing, unique within a session
    pub id: u32,
    /// Step kind
    pub kind: StepKind,
    /// Human-readable label
    pub title: String,
    /// Relative, slash-delimited path (file steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// File contents or shell command text
    #[serde(default)]
    pub code: String,
    /// Pending while still streaming
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    /// Create the synthetic project-init step.
    pub fn project_init(id: u32, title: impl Into<String>) -> Self {
        Self {
            id,
            kind: StepKind::ProjectInit,
            title: title.into(),
            path: None,
            code: String::new(),
            status: StepStatus::Pending,
        }
    }

    /// Create a file step. An empty path is kept but is not placeable in a tree.
    pub fn create_file(
        id: u32,
        path: impl Into<String>,
        code: impl Into<String>,
        status: StepStatus,
    ) -> Self {
        let path = path.into();
        let title = if path.is_empty() {
            "Create file".to_string()
        } else {
            format!("Create {}", path)
        };
        Self {
            id,
            kind: StepKind::CreateFile,
            title,
            path: Some(path),
            code: code.into(),
            status,
        }
    }

    /// Create a shell command step.
    pub fn run_command(id: u32, code: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id,
            kind: StepKind::RunCommand,
            title: "Run command".to_string(),
            path: None,
            code: code.into(),
            status,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Path usable for tree placement, if any.
    pub fn placeable_path(&self) -> Option<&str> {
        self.path.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// Shift the id past an existing prefix of steps.
    pub fn offset_id(mut self, offset: u32) -> Self {
        self.id += offset;
        self
    }
}

/// Highest id in a step sequence, or 0 when empty.
pub fn last_step_id(steps: &[Step]) -> u32 {
    steps.iter().map(|s| s.id).max().unwrap_or(0)
}

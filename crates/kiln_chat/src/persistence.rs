//! Session persistence layer.
//!
//! The minimal state needed to resume lives in the workspace under
//! `.kiln/session/`:
//!
//! ```text
//! .kiln/session/
//! ├── steps.json     # Prompts and Step sequence of the last finished stream
//! └── request.json   # Seed prompts + model of a generation still in flight
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_artifact::Step;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChatResult;
use crate::types::GenerationRequest;

const STEPS_FILE: &str = "steps.json";
const REQUEST_FILE: &str = "request.json";

/// A finished session as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub saved_at: DateTime<Utc>,
    pub request: GenerationRequest,
    pub steps: Vec<Step>,
}

/// Persistence manager for the current generation session
#[derive(Debug, Clone)]
pub struct SessionStore {
    workspace_root: PathBuf,
}

impl SessionStore {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn session_dir(&self) -> PathBuf {
        self.workspace_root.join(".kiln").join("session")
    }

    /// Save the Step sequence together with the prompts that produced it.
    pub fn save_session(&self, request: &GenerationRequest, steps: &[Step]) -> ChatResult<()> {
        let saved = SavedSession {
            saved_at: Utc::now(),
            request: request.clone(),
            steps: steps.to_vec(),
        };
        self.write_json(STEPS_FILE, &saved)?;
        debug!("Saved {} steps", steps.len());
        Ok(())
    }

    pub fn load_session(&self) -> ChatResult<Option<SavedSession>> {
        self.read_json(STEPS_FILE)
    }

    /// Record a generation that has started but not yet finished.
    pub fn save_request(&self, request: &GenerationRequest) -> ChatResult<()> {
        self.write_json(REQUEST_FILE, request)
    }

    pub fn load_request(&self) -> ChatResult<Option<GenerationRequest>> {
        self.read_json(REQUEST_FILE)
    }

    /// Remove the in-flight request marker.
    pub fn clear_request(&self) -> ChatResult<()> {
        let path = self.session_dir().join(REQUEST_FILE);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Forget everything persisted for this workspace.
    pub fn clear(&self) -> ChatResult<()> {
        let dir = self.session_dir();
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> ChatResult<()> {
        let dir = self.session_dir();
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(value)?;
        fs::write(dir.join(file), content)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> ChatResult<Option<T>> {
        let path = self.session_dir().join(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

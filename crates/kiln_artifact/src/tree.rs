//! File tree projection of a step sequence.
//!
//! The tree holds no state of its own: it is rebuilt from the steps every time
//! the sequence grows. Children keep first-seen insertion order.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Step;

/// Node type in the projected tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// A file or folder in the projected tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileNode {
    /// Last path segment
    pub name: String,
    /// Slash-joined path from the root
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// File contents (files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Children in insertion order (folders only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::File,
            content: Some(content.into()),
            children: Vec::new(),
        }
    }

    pub fn folder(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::Folder,
            content: None,
            children: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// File contents, or an empty string for folders.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Normalise a step path into its segments.
///
/// Leading `/`, `./` and empty segments are dropped. Returns `None` when
/// nothing placeable remains.
pub fn path_segments(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// Canonical form of a path, as stored on tree nodes.
pub fn normalize_path(path: &str) -> Option<String> {
    path_segments(path).map(|segments| segments.join("/"))
}

/// Build the file tree for a step sequence.
///
/// Only steps with both a placeable path and non-blank code contribute, so
/// shell commands never appear. Blank is judged on trimmed code, matching how
/// completed bodies are trimmed, so a node never vanishes when its block closes. A path seen again updates the existing node.
pub fn build_file_tree(steps: &[Step]) -> Vec<FileNode> {
    let mut roots = Vec::new();
    for step in steps {
        let Some(path) = step.placeable_path() else {
            continue;
        };
        if step.code.trim().is_empty() {
            continue;
        }
        if !upsert_file(&mut roots, path, &step.code) {
            debug!("Skipping step {} with conflicting path {}", step.id, path);
        }
    }
    roots
}

/// Create or update the file at `path`, creating folders on the way.
///
/// Returns `false` if the path collides with an existing node of the other
/// kind (a file where a folder is needed, or the reverse).
pub fn upsert_file(roots: &mut Vec<FileNode>, path: &str, content: &str) -> bool {
    let Some(segments) = path_segments(path) else {
        return false;
    };

    let last = segments.len() - 1;
    let mut current = roots;
    let mut node_path = String::new();

    for (index, segment) in segments.iter().enumerate() {
        if !node_path.is_empty() {
            node_path.push('/');
        }
        node_path.push_str(segment);

        let kind = if index == last {
            NodeKind::File
        } else {
            NodeKind::Folder
        };

        let position = match current.iter().position(|n| n.name == *segment) {
            Some(position) => {
                if current[position].kind != kind {
                    return false;
                }
                position
            }
            None => {
                current.push(match kind {
                    NodeKind::File => FileNode::file(*segment, node_path.clone(), ""),
                    NodeKind::Folder => FileNode::folder(*segment, node_path.clone()),
                });
                current.len() - 1
            }
        };

        if kind == NodeKind::File {
            current[position].content = Some(content.to_string());
            return true;
        }
        current = &mut current[position].children;
    }

    false
}

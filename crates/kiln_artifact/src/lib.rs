//! # kiln_artifact
//!
//! Streaming artifact parsing and file tree projection for kiln.
//!
//! A language model streams a markup envelope describing a project. This crate
//! turns the accumulated text into ordered [`Step`]s and projects those steps
//! into a hierarchical [`FileNode`] tree.
//!
//! ## Features
//!
//! - **Incremental**: re-parsing a longer buffer only extends or promotes the
//!   trailing step; completed steps never change
//! - **Tolerant**: partial or malformed markup yields fewer steps, never an error
//! - **Pure projection**: the tree is a deterministic function of the steps
//!
//! ## Example
//!
//! ```rust
//! use kiln_artifact::{build_file_tree, find_file_by_path, parse_artifact};
//!
//! let steps = parse_artifact(
//!     r#"<artifact title="Demo"><action type="file" path="a/b.txt">hello</action></artifact>"#,
//! );
//! assert_eq!(steps[0].title, "Demo");
//!
//! let tree = build_file_tree(&steps);
//! let file = find_file_by_path(&tree, "a/b.txt").unwrap();
//! assert_eq!(file.content.as_deref(), Some("hello"));
//! ```

pub mod models;
pub mod navigator;
pub mod parser;
pub mod tree;

pub use models::{last_step_id, Step, StepKind, StepStatus};
pub use navigator::{
    file_count, find_changed_file, find_file_by_path, find_file_by_path_mut, find_first_file,
    find_root_file, walk, Walk,
};
pub use parser::{parse_artifact, ArtifactParser, DEFAULT_ARTIFACT_TITLE};
pub use tree::{build_file_tree, normalize_path, path_segments, upsert_file, FileNode, NodeKind};

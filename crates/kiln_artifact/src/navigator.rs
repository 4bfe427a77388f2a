//! Read-only lookups over a projected file tree.
//!
//! Nodes are never removed from a tree built from a growing step sequence, so
//! these can be re-run after every rebuild without special handling.

use crate::tree::{normalize_path, FileNode};

/// First file in depth-first, insertion order.
pub fn find_first_file(nodes: &[FileNode]) -> Option<&FileNode> {
    walk(nodes).find(|n| n.is_file())
}

/// File with exactly this path (after normalisation).
pub fn find_file_by_path<'a>(nodes: &'a [FileNode], path: &str) -> Option<&'a FileNode> {
    let path = normalize_path(path)?;
    walk(nodes).find(|n| n.is_file() && n.path == path)
}

/// Mutable variant of [`find_file_by_path`].
pub fn find_file_by_path_mut<'a>(nodes: &'a mut [FileNode], path: &str) -> Option<&'a mut FileNode> {
    let path = normalize_path(path)?;
    find_mut(nodes, &path)
}

fn find_mut<'a>(nodes: &'a mut [FileNode], path: &str) -> Option<&'a mut FileNode> {
    for node in nodes.iter_mut() {
        if node.is_file() && node.path == path {
            return Some(node);
        }
        if node.is_folder() && path.starts_with(&format!("{}/", node.path)) {
            return find_mut(&mut node.children, path);
        }
    }
    None
}

/// The file at `path`, but only if its content differs from `known`.
///
/// Used to refresh a view that already shows `known` without redrawing when
/// nothing changed.
pub fn find_changed_file<'a>(nodes: &'a [FileNode], path: &str, known: &str) -> Option<&'a FileNode> {
    find_file_by_path(nodes, path).filter(|n| n.content_str() != known)
}

/// Top-level file by name, e.g. the dependency manifest.
pub fn find_root_file<'a>(nodes: &'a [FileNode], name: &str) -> Option<&'a FileNode> {
    nodes.iter().find(|n| n.is_file() && n.name == name)
}

/// Number of files in the tree.
pub fn file_count(nodes: &[FileNode]) -> usize {
    walk(nodes).filter(|n| n.is_file()).count()
}

/// Depth-first pre-order traversal: each folder comes before its children.
pub fn walk(nodes: &[FileNode]) -> Walk<'_> {
    Walk {
        stack: vec![nodes.iter()],
    }
}

/// Iterator returned by [`walk`].
pub struct Walk<'a> {
    stack: Vec<std::slice::Iter<'a, FileNode>>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a FileNode;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(node) => {
                    if !node.children.is_empty() {
                        self.stack.push(node.children.iter());
                    }
                    return Some(node);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

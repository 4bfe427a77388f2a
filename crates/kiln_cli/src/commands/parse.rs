//! Parse command - show the steps and file tree of artifact markup.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kiln_artifact::{build_file_tree, parse_artifact, FileNode, Step, StepKind, StepStatus};
use serde_json::json;

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// File containing a model response (reads stdin when omitted)
    pub file: Option<PathBuf>,

    /// Print steps and tree as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ParseArgs) -> Result<()> {
    let input = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Input file not found: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    let steps = parse_artifact(&input);
    let tree = build_file_tree(&steps);

    if args.json {
        let output = json!({ "steps": steps, "fileTree": tree });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!("No artifact found.");
        return Ok(());
    }

    println!("📋 Steps");
    for step in &steps {
        println!("{}", describe_step(step));
    }
    println!();
    println!("📁 File tree");
    for line in render_tree(&tree) {
        println!("{}", line);
    }
    Ok(())
}

fn describe_step(step: &Step) -> String {
    let marker = match step.status {
        StepStatus::Completed => "✓",
        StepStatus::Pending => "…",
    };
    let detail = match step.kind {
        StepKind::RunCommand => format!(" $ {}", step.code.trim()),
        _ => String::new(),
    };
    format!("  {} {:>3}  {}{}", marker, step.id, step.title, detail)
}

fn render_tree(nodes: &[FileNode]) -> Vec<String> {
    let mut lines = Vec::new();
    render_level(nodes, 1, &mut lines);
    lines
}

fn render_level(nodes: &[FileNode], depth: usize, lines: &mut Vec<String>) {
    for node in nodes {
        let indent = "  ".repeat(depth);
        if node.is_folder() {
            lines.push(format!("{}{}/", indent, node.name));
            render_level(&node.children, depth + 1, lines);
        } else {
            lines.push(format!("{}{} ({} bytes)", indent, node.name, node.content_str().len()));
        }
    }
}

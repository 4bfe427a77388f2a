//! Incremental parsing of artifact markup.
//!
//! The model streams a single artifact envelope containing action blocks:
//!
//! ```text
//! <artifact title="Demo">
//!   <action type="file" path="src/main.ts">...</action>
//!   <action type="shell">npm install</action>
//! </artifact>
//! ```
//!
//! The `boltArtifact` / `boltAction filePath="..."` dialect is accepted as well.
//! Parsing is a pure function of the accumulated buffer: calling it again with a
//! longer buffer reproduces every completed step and only extends or promotes
//! the trailing pending one.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{Step, StepStatus};

/// Title used when the artifact marker carries none.
pub const DEFAULT_ARTIFACT_TITLE: &str = "Project Files";

static ARTIFACT_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(boltArtifact|artifact)(\s[^>]*)?>").unwrap());

static ACTION_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(boltAction|action)(\s[^>]*)?>").unwrap());

static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Interior of the artifact envelope.
struct ArtifactRegion<'a> {
    title: String,
    body: &'a str,
    closed: bool,
}

/// Parse an accumulated (possibly incomplete) response into steps.
///
/// Never fails: missing or malformed markup yields an empty or shorter
/// sequence.
pub fn parse_artifact(buffer: &str) -> Vec<Step> {
    let Some(region) = locate_artifact(buffer) else {
        return Vec::new();
    };

    let mut steps = vec![Step::project_init(1, region.title)];
    let mut next_id = 2;
    let mut pos = 0;

    while let Some(caps) = ACTION_OPEN_REGEX.captures_at(region.body, pos) {
        let Some(tag) = caps.get(0) else { break };
        let name = caps.get(1).map_or("action", |m| m.as_str());
        let attrs = parse_attributes(caps.get(2).map_or("", |m| m.as_str()));
        let close = format!("</{}>", name);
        let body_start = tag.end();

        match region.body[body_start..].find(&close) {
            Some(len) => {
                let content = &region.body[body_start..body_start + len];
                if let Some(step) = action_step(next_id, &attrs, content.trim(), StepStatus::Completed) {
                    steps.push(step);
                    next_id += 1;
                }
                pos = body_start + len + close.len();
            }
            None => {
                // Keep the tail verbatim; only a half-written closing tag is held back.
                let partial = strip_leading_newline(&region.body[body_start..]);
                let partial = strip_partial_close(partial, &close);
                if let Some(step) = action_step(next_id, &attrs, partial, StepStatus::Pending) {
                    steps.push(step);
                }
                break;
            }
        }
    }

    if steps.len() > 1 || region.closed {
        steps[0].status = StepStatus::Completed;
    }

    steps
}

/// Accumulates streamed chunks and re-parses the whole buffer on each push.
#[derive(Debug, Clone, Default)]
pub struct ArtifactParser {
    buffer: String,
}

impl ArtifactParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the full step sequence for the buffer so far.
    pub fn push(&mut self, chunk: &str) -> Vec<Step> {
        self.buffer.push_str(chunk);
        self.steps()
    }

    /// Steps for the current buffer.
    pub fn steps(&self) -> Vec<Step> {
        parse_artifact(&self.buffer)
    }

    /// Raw text received so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn into_buffer(self) -> String {
        self.buffer
    }
}

fn locate_artifact(buffer: &str) -> Option<ArtifactRegion<'_>> {
    let caps = ARTIFACT_OPEN_REGEX.captures(buffer)?;
    let tag = caps.get(0)?;
    let name = caps.get(1)?.as_str();
    let attrs = parse_attributes(caps.get(2).map_or("", |m| m.as_str()));

    let title = attrs
        .get("title")
        .filter(|t| !t.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_ARTIFACT_TITLE.to_string());

    let rest = &buffer[tag.end()..];
    let close = format!("</{}>", name);
    let (body, closed) = match rest.find(&close) {
        Some(end) => (&rest[..end], true),
        None => (rest, false),
    };

    Some(ArtifactRegion {
        title,
        body,
        closed,
    })
}

fn parse_attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE_REGEX
        .captures_iter(raw)
        .filter_map(|cap| {
            let key = cap.get(1)?.as_str().to_string();
            let value = cap.get(2).or_else(|| cap.get(3))?.as_str().to_string();
            Some((key, value))
        })
        .collect()
}

fn action_step(
    id: u32,
    attrs: &HashMap<String, String>,
    code: &str,
    status: StepStatus,
) -> Option<Step> {
    match attrs.get("type").map(String::as_str) {
        Some("file") => {
            let path = attrs
                .get("path")
                .or_else(|| attrs.get("filePath"))
                .map(String::as_str)
                .unwrap_or_default();
            Some(Step::create_file(id, path, code, status))
        }
        Some("shell") => Some(Step::run_command(id, code, status)),
        _ => None,
    }
}

fn strip_leading_newline(s: &str) -> &str {
    s.strip_prefix("\r\n")
        .or_else(|| s.strip_prefix('\n'))
        .unwrap_or(s)
}

/// Drop a trailing proper prefix of `close` (e.g. `</act`) from a streaming body.
fn strip_partial_close<'a>(s: &'a str, close: &str) -> &'a str {
    for len in (1..close.len()).rev() {
        if s.ends_with(&close[..len]) {
            return &s[..s.len() - len];
        }
    }
    s
}

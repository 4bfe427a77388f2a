//! Failure monitor.
//!
//! Scans sandbox output for known error signatures and decides whether an
//! automatic regeneration may run. At most one trigger per boot cycle; an
//! identical error right after an automatic attempt, or an exhausted budget,
//! is reported as suppressed instead.

use std::sync::LazyLock;

use kiln_sandbox::strip_ansi;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Case-insensitive substrings that mark a dev-server failure.
pub const DEFAULT_ERROR_KEYWORDS: &[&str] = &[
    "uncaught referenceerror",
    "syntaxerror",
    "cannot find module",
    "failed to resolve import",
    "internal server error",
];

pub const DEFAULT_MAX_AUTO_RECOVERIES: u32 = 3;

const INSTALL_FAILED_INSTRUCTION: &str = "The previous dependency installation failed. Please review the package.json and fix any conflicting or missing dependencies.";

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryCause {
    InstallFailed { exit_code: i64 },
    RuntimeError { line: String },
}

/// A request to regenerate with a corrective instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTrigger {
    pub cause: RecoveryCause,
    pub instruction: String,
    /// Normalised error text used to spot repeats
    pub signature: String,
}

impl RecoveryTrigger {
    /// Runtime errors wait for the debounce; install failures do not.
    pub fn is_debounced(&self) -> bool {
        matches!(self.cause, RecoveryCause::RuntimeError { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Same error as the last automatic attempt
    RepeatedError,
    /// Session-wide automatic recovery cap reached
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Recover(RecoveryTrigger),
    Suppressed {
        reason: SuppressReason,
        trigger: RecoveryTrigger,
    },
}

#[derive(Debug, Clone)]
pub struct FailureMonitor {
    keywords: Vec<String>,
    max_auto_recoveries: u32,
    auto_recoveries: u32,
    last_signature: Option<String>,
    latched: bool,
}

impl Default for FailureMonitor {
    fn default() -> Self {
        Self::new(
            DEFAULT_ERROR_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            DEFAULT_MAX_AUTO_RECOVERIES,
        )
    }
}

impl FailureMonitor {
    pub fn new(keywords: Vec<String>, max_auto_recoveries: u32) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            max_auto_recoveries,
            auto_recoveries: 0,
            last_signature: None,
            latched: false,
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn auto_recoveries(&self) -> u32 {
        self.auto_recoveries
    }

    /// A new boot cycle started: allow one more trigger.
    pub fn begin_cycle(&mut self) {
        self.latched = false;
    }

    /// The user asked for a regeneration: forget previous attempts.
    pub fn reset_budget(&mut self) {
        self.auto_recoveries = 0;
        self.last_signature = None;
    }

    /// The keyword a line matches, if any.
    pub fn matching_keyword(&self, line: &str) -> Option<&str> {
        let lower = strip_ansi(line).to_lowercase();
        self.keywords
            .iter()
            .find(|k| lower.contains(k.as_str()))
            .map(String::as_str)
    }

    /// Inspect one line of dev-server output.
    pub fn observe_line(&mut self, line: &str) -> Option<Verdict> {
        if self.latched {
            return None;
        }
        let keyword = self.matching_keyword(line)?;
        debug!("Output matched '{}'", keyword);

        let clean = strip_ansi(line).trim().to_string();
        let trigger = RecoveryTrigger {
            instruction: format!("I encountered this error during execution: {}. Please fix it.", clean),
            signature: error_signature(&clean),
            cause: RecoveryCause::RuntimeError { line: clean },
        };
        Some(self.arm(trigger))
    }

    /// The dependency install exited non-zero. `output` is the tail of its log.
    pub fn install_failed(&mut self, exit_code: i64, output: &[String]) -> Option<Verdict> {
        if self.latched {
            return None;
        }

        let mut instruction = INSTALL_FAILED_INSTRUCTION.to_string();
        if !output.is_empty() {
            instruction.push_str(" Installer output:\n");
            instruction.push_str(&output.join("\n"));
        }
        let last_line = output
            .iter()
            .rev()
            .map(|l| strip_ansi(l).trim().to_string())
            .find(|l| !l.is_empty())
            .unwrap_or_default();

        let trigger = RecoveryTrigger {
            cause: RecoveryCause::InstallFailed { exit_code },
            instruction,
            signature: format!("install:{}:{}", exit_code, error_signature(&last_line)),
        };
        Some(self.arm(trigger))
    }

    fn arm(&mut self, trigger: RecoveryTrigger) -> Verdict {
        self.latched = true;

        if self.last_signature.as_deref() == Some(trigger.signature.as_str()) {
            warn!("Same error after automatic regeneration, not retrying");
            return Verdict::Suppressed {
                reason: SuppressReason::RepeatedError,
                trigger,
            };
        }
        if self.auto_recoveries >= self.max_auto_recoveries {
            warn!(
                "Automatic regeneration limit ({}) reached",
                self.max_auto_recoveries
            );
            return Verdict::Suppressed {
                reason: SuppressReason::BudgetExhausted,
                trigger,
            };
        }

        self.auto_recoveries += 1;
        self.last_signature = Some(trigger.signature.clone());
        info!(
            "Automatic regeneration {}/{} armed",
            self.auto_recoveries, self.max_auto_recoveries
        );
        Verdict::Recover(trigger)
    }
}

/// Lowercased line with digit runs collapsed, so timestamps and ports do
/// not make the same error look new.
pub fn error_signature(line: &str) -> String {
    DIGITS
        .replace_all(&strip_ansi(line).trim().to_lowercase(), "#")
        .into_owned()
}

//! Stage segmentation and verdicts for a finished pipeline log.
//!
//! A stage opens on a line like `[Pipeline] { (Build)` and closes on
//! `[Pipeline] // stage`. Verdicts come from an ordered rule list; the first
//! rule that yields a verdict wins:
//!
//! 1. [`VerdictRule::SuccessPhrase`]: an explicit success phrase ⇒ pass
//! 2. [`VerdictRule::NoFailureKeyword`]: nothing that looks like a failure ⇒ pass
//! 3. [`VerdictRule::SuppressedErrors`]: every failure line is followed by
//!    the ignore-errors sentinel within [`SENTINEL_WINDOW`] lines ⇒ pass
//! 4. [`VerdictRule::Failure`] ⇒ fail
//!
//! Afterwards, a log that ends in a pipeline failure but has no failing
//! stage gets its last stage flipped to failed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Closes the currently open stage.
pub const CLOSE_MARKER: &str = "[Pipeline] // stage";

/// Line the shell step prints for `cmd || true`.
pub const IGNORE_ERRORS_SENTINEL: &str = "+ true";

/// How many lines after a failure line the sentinel may appear.
pub const SENTINEL_WINDOW: usize = 5;

/// Pipeline-level failure, printed once at the very end of the log.
pub const PIPELINE_FAILURE_MARKER: &str = "Finished: FAILURE";

pub const SUCCESS_PHRASES: &[&str] = &["BUILD SUCCESS", "Finished: SUCCESS"];

fn open_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[Pipeline\] \{ \((.+)\)\s*$").expect("open marker pattern"))
}

fn failure_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(error|exception|fatal|failed|failure)\b")
            .expect("failure keyword pattern")
    })
}

/// `"status": "FAILED"` style fields from echoed JSON payloads.
fn payload_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""[A-Za-z_][\w.-]*"\s*:\s*"[^"]*"|'[A-Za-z_][\w.-]*'\s*:\s*'[^']*'"#)
            .expect("payload field pattern")
    })
}

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBlock {
    /// 1-based position in encounter order
    pub order_index: usize,
    pub name: String,
    pub log: String,
    pub success: bool,
}

/// The rule that decided a stage's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictRule {
    SuccessPhrase,
    NoFailureKeyword,
    SuppressedErrors,
    Failure,
}

/// Verdict plus the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub rule: VerdictRule,
}

type Rule = fn(&[&str]) -> Option<bool>;

const RULES: &[(VerdictRule, Rule)] = &[
    (VerdictRule::SuccessPhrase, rule_success_phrase),
    (VerdictRule::NoFailureKeyword, rule_no_failure_keyword),
    (VerdictRule::SuppressedErrors, rule_suppressed_errors),
    (VerdictRule::Failure, rule_failure),
];

/// Whether `line` mentions a failure once echoed payload fields are removed.
pub fn is_failure_line(line: &str) -> bool {
    let scrubbed = payload_field().replace_all(line, "");
    failure_keyword().is_match(&scrubbed)
}

fn rule_success_phrase(lines: &[&str]) -> Option<bool> {
    lines
        .iter()
        .any(|line| SUCCESS_PHRASES.iter().any(|phrase| line.contains(phrase)))
        .then_some(true)
}

fn rule_no_failure_keyword(lines: &[&str]) -> Option<bool> {
    (!lines.iter().any(|line| is_failure_line(line))).then_some(true)
}

fn rule_suppressed_errors(lines: &[&str]) -> Option<bool> {
    let all_suppressed = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_failure_line(line))
        .all(|(i, _)| {
            lines
                .iter()
                .skip(i + 1)
                .take(SENTINEL_WINDOW)
                .any(|next| *next == IGNORE_ERRORS_SENTINEL)
        });
    all_suppressed.then_some(true)
}

fn rule_failure(_lines: &[&str]) -> Option<bool> {
    Some(false)
}

/// Classify one stage's text.
pub fn classify(stage_log: &str) -> Verdict {
    let lines: Vec<&str> = stage_log.lines().collect();
    for (rule, apply) in RULES {
        if let Some(success) = apply(lines.as_slice()) {
            return Verdict {
                success,
                rule: *rule,
            };
        }
    }
    // RULES ends with an unconditional rule.
    Verdict {
        success: false,
        rule: VerdictRule::Failure,
    }
}

struct OpenStage {
    name: String,
    log: String,
}

fn close(stages: &mut Vec<StageBlock>, open: OpenStage) {
    let verdict = classify(&open.log);
    stages.push(StageBlock {
        order_index: stages.len() + 1,
        name: open.name,
        log: open.log,
        success: verdict.success,
    });
}

/// Split a finished, sanitized log into stages.
pub fn parse(full_log: &str) -> Vec<StageBlock> {
    let mut stages = Vec::new();
    let mut current: Option<OpenStage> = None;

    for (line_no, line) in full_log.lines().enumerate() {
        if let Some(caps) = open_marker().captures(line) {
            if let Some(previous) = current.take() {
                debug!(
                    event = "stage.force_closed",
                    stage = %previous.name,
                    line = line_no + 1,
                    "stage reopened before close marker"
                );
                close(&mut stages, previous);
            }
            current = Some(OpenStage {
                name: caps[1].to_string(),
                log: String::new(),
            });
        } else if line.trim_end() == CLOSE_MARKER {
            if let Some(open) = current.take() {
                close(&mut stages, open);
            }
        } else if let Some(open) = current.as_mut() {
            open.log.push_str(line);
            open.log.push('\n');
        }
    }

    if let Some(open) = current.take() {
        debug!(event = "stage.force_closed", stage = %open.name, "log ended inside a stage");
        close(&mut stages, open);
    }

    apply_global_failure(full_log, &mut stages);
    stages
}

/// Flip the last stage when the pipeline failed outside any failing stage.
fn apply_global_failure(full_log: &str, stages: &mut [StageBlock]) {
    let pipeline_failed = full_log
        .lines()
        .any(|l| l.trim_end() == PIPELINE_FAILURE_MARKER);
    if pipeline_failed && stages.iter().all(|s| s.success) {
        if let Some(last) = stages.last_mut() {
            last.success = false;
        }
    }
}

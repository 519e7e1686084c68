//! The default prompt-validator predicate `assign_task` consumes before
//! enqueueing a task. The full security scanner (XSS/SQLi/path-traversal
//! detection, HTML escaping) is an external collaborator, out of scope for
//! this crate; this module only implements the minimal predicate contract
//! the tool surface calls.

use regex::Regex;
use std::sync::OnceLock;

pub const MAX_PROMPT_LENGTH: usize = 10_000;

static DANGEROUS_PATTERNS: &[&str] = &["<script", "javascript:", "$(rm", "`rm", "; rm -rf"];

fn blocklist_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        let pattern = DANGEROUS_PATTERNS
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!("(?i){pattern}")).expect("static pattern set is valid")
    })
}

/// A prompt-validator predicate: `assign_task` rejects the prompt and never
/// enqueues when this returns `false`.
pub trait PromptValidator: Send + Sync {
    fn is_valid(&self, prompt: &str) -> bool;
}

/// Length bound plus a small blocklist, standing in for the real scanner.
#[derive(Debug, Default)]
pub struct DefaultPromptValidator;

impl PromptValidator for DefaultPromptValidator {
    fn is_valid(&self, prompt: &str) -> bool {
        if prompt.is_empty() || prompt.len() > MAX_PROMPT_LENGTH {
            return false;
        }
        !blocklist_regex().is_match(prompt)
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// A compiled allowlist pattern.
///
/// Rule keys are either a command prefix (`ls`, `git status`) or a regex
/// literal written `/pattern/flags`.  The two forms have different matching
/// semantics, so they are kept as distinct variants rather than compiling
/// everything down to a regex.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches when the sub-command's base executable equals the text, or
    /// when the sub-command starts with the text (covers multi-word
    /// commands like `git status`).
    Exact(String),
    Regex(Regex),
}

impl Pattern {
    /// Parse a rule key.  `/…/flags` becomes [`Pattern::Regex`]; anything
    /// else is an exact command pattern.  Returns `None` for a regex literal
    /// that fails to compile — the caller logs and skips the rule.
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(literal) = as_regex_literal(text) {
            let (pattern, flags) = literal;
            let mut builder = RegexBuilder::new(pattern);
            for flag in flags.chars() {
                match flag {
                    'i' => {
                        builder.case_insensitive(true);
                    }
                    'm' => {
                        builder.multi_line(true);
                    }
                    's' => {
                        builder.dot_matches_new_line(true);
                    }
                    other => {
                        warn!(flag = %other, rule = text, "ignoring unsupported regex flag");
                    }
                }
            }
            match builder.build() {
                Ok(re) => Some(Self::Regex(re)),
                Err(e) => {
                    warn!(rule = text, error = %e, "invalid regex in allowlist rule; skipping");
                    None
                }
            }
        } else {
            Some(Self::Exact(text.to_string()))
        }
    }

    /// Test against one atomic sub-command.
    pub fn matches_subcommand(&self, subcommand: &str) -> bool {
        match self {
            Self::Exact(prefix) => {
                base_executable(subcommand) == prefix.as_str()
                    || subcommand.starts_with(prefix.as_str())
            }
            Self::Regex(re) => re.is_match(subcommand),
        }
    }

    /// Test against the entire command line (full-line regex rules).
    pub fn matches_command_line(&self, line: &str) -> bool {
        match self {
            Self::Exact(prefix) => line.starts_with(prefix.as_str()),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

/// Split `/pattern/flags` into `(pattern, flags)`; `None` when the text is
/// not a regex literal.
fn as_regex_literal(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let close = rest.rfind('/')?;
    // An empty pattern (`//i`) is still a literal, just a useless one.
    Some((&rest[..close], &rest[close + 1..]))
}

/// The leading token of a sub-command with surrounding quotes and any path
/// prefix stripped: `"/usr/bin/ls" -la` → `ls`.
pub fn base_executable(subcommand: &str) -> &str {
    let first = subcommand.split_whitespace().next().unwrap_or("");
    let unquoted = first.trim_matches(|c| c == '"' || c == '\'');
    match unquoted.rsplit_once('/') {
        Some((_, base)) => base,
        None => unquoted,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

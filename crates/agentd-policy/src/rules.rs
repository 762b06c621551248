// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Allowlist rule set and decision algorithm.
//!
//! A rule set is an *ordered* mapping from pattern to effect.  Evaluation
//! walks the rules in order against every atomic sub-command (and against
//! the full command line for rules marked `match_command_line`), recording
//! per-scope effects.  Within a scope the last matching rule wins, except
//! that a deny is sticky.  The final decision:
//!
//! - any deny anywhere → **deny**
//! - full-line approve → **approve**
//! - every sub-command approved → **approve**
//! - otherwise → **ask**
//!
//! The evaluator is a pure function of `(rule set, command line)`.

use std::path::Path;

use serde_yaml::Value;
use tracing::warn;

use crate::pattern::Pattern;
use crate::split::split_subcommands;

/// Effect attached to a rule, as written in the allowlist file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEffect {
    /// `true` — auto-approve the matched scope.
    Allow,
    /// `false` — deny the matched scope.
    Deny,
    /// `null` — no effect; later rules may still match.
    Unset,
    /// `{approve, match_command_line}` — when `match_command_line` is set
    /// the rule applies to the whole command line only and never
    /// participates in sub-command checks.
    Scoped {
        approve: bool,
        match_command_line: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// The pattern key as written, used in decision reasons.
    pub text: String,
    pattern: Pattern,
    pub effect: RuleEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Deny,
    Ask,
}

/// Outcome of evaluating one command line.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    /// Human-readable explanation naming the deciding rule(s).
    pub reason: String,
}

impl Decision {
    fn ask(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Ask,
            reason: reason.into(),
        }
    }
}

/// Per-scope accumulator during rule iteration.
#[derive(Debug, Clone, PartialEq)]
enum ScopeState {
    Unmatched,
    Approved(String),
    Denied(String),
}

impl ScopeState {
    fn record(&mut self, approve: bool, rule: &str) {
        // A deny is sticky: once a scope is denied no later rule can
        // resurrect it.
        if matches!(self, Self::Denied(_)) {
            return;
        }
        *self = if approve {
            Self::Approved(rule.to_string())
        } else {
            Self::Denied(rule.to_string())
        };
    }
}

/// An ordered shell-policy rule set.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Parse the §allowlist file schema: a top-level map from pattern to
    /// `true | false | null | {approve, match_command_line}`.
    /// Invalid regex literals are logged and skipped; unknown effect shapes
    /// are rejected.
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let doc: Value = serde_yaml::from_str(text)?;
        let Value::Mapping(map) = doc else {
            anyhow::bail!("allowlist must be a mapping of pattern to effect");
        };

        let mut rules = Vec::with_capacity(map.len());
        for (key, value) in map {
            let Value::String(text) = key else {
                anyhow::bail!("allowlist pattern keys must be strings");
            };
            let effect = parse_effect(&text, &value)?;
            let Some(pattern) = Pattern::parse(&text) else {
                // Invalid regex literal: warning already logged by the parser.
                continue;
            };
            rules.push(Rule {
                text,
                pattern,
                effect,
            });
        }
        Ok(Self::new(rules))
    }

    /// Load from a file, falling back to the built-in defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default_rules());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Built-in rules: read-only inspection commands auto-approve, `rm` and
    /// file-reading grep flags deny, everything else asks.
    pub fn default_rules() -> Self {
        let yaml = r#"
ls: true
cat: true
echo: true
pwd: true
head: true
tail: true
wc: true
git status: true
git log: true
git diff: true
grep: true
rm: false
/^grep\b.*-(f|P)\b/: false
"#;
        Self::from_yaml(yaml).expect("built-in allowlist rules are valid")
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide whether `line` may run, must be denied, or needs a human.
    pub fn evaluate(&self, line: &str) -> Decision {
        let line = line.trim();
        if line.is_empty() {
            return Decision::ask("empty command");
        }

        let subcommands = split_subcommands(line);
        let mut full_line = ScopeState::Unmatched;
        let mut per_sub = vec![ScopeState::Unmatched; subcommands.len()];

        for rule in &self.rules {
            match rule.effect {
                RuleEffect::Unset => {}
                RuleEffect::Scoped {
                    approve,
                    match_command_line: true,
                } => {
                    if rule.pattern.matches_command_line(line) {
                        full_line.record(approve, &rule.text);
                    }
                }
                RuleEffect::Allow
                | RuleEffect::Deny
                | RuleEffect::Scoped {
                    match_command_line: false,
                    ..
                } => {
                    let approve = matches!(
                        rule.effect,
                        RuleEffect::Allow | RuleEffect::Scoped { approve: true, .. }
                    );
                    for (state, sub) in per_sub.iter_mut().zip(&subcommands) {
                        if rule.pattern.matches_subcommand(sub) {
                            state.record(approve, &rule.text);
                        }
                    }
                }
            }
        }

        if let ScopeState::Denied(rule) = &full_line {
            return Decision {
                verdict: Verdict::Deny,
                reason: format!("rule `{rule}`"),
            };
        }
        if let Some(ScopeState::Denied(rule)) =
            per_sub.iter().find(|s| matches!(s, ScopeState::Denied(_)))
        {
            return Decision {
                verdict: Verdict::Deny,
                reason: format!("rule `{rule}`"),
            };
        }
        if let ScopeState::Approved(rule) = &full_line {
            return Decision {
                verdict: Verdict::Approve,
                reason: format!("rule `{rule}`"),
            };
        }
        if per_sub
            .iter()
            .all(|s| matches!(s, ScopeState::Approved(_)))
        {
            let mut rules: Vec<&str> = per_sub
                .iter()
                .filter_map(|s| match s {
                    ScopeState::Approved(r) => Some(r.as_str()),
                    _ => None,
                })
                .collect();
            rules.dedup();
            return Decision {
                verdict: Verdict::Approve,
                reason: format!("rule `{}`", rules.join("`, `")),
            };
        }

        let unmatched = per_sub
            .iter()
            .zip(&subcommands)
            .find(|(s, _)| matches!(s, ScopeState::Unmatched))
            .map(|(_, sub)| sub.as_str())
            .unwrap_or(line);
        Decision::ask(format!("no rule matched `{unmatched}`"))
    }
}

fn parse_effect(rule: &str, value: &Value) -> anyhow::Result<RuleEffect> {
    match value {
        Value::Bool(true) => Ok(RuleEffect::Allow),
        Value::Bool(false) => Ok(RuleEffect::Deny),
        Value::Null => Ok(RuleEffect::Unset),
        Value::Mapping(m) => {
            let mut approve = false;
            let mut match_command_line = false;
            for (key, val) in m {
                match key.as_str() {
                    Some("approve") => approve = val.as_bool().unwrap_or(false),
                    Some("match_command_line") => {
                        match_command_line = val.as_bool().unwrap_or(false)
                    }
                    _ => warn!(rule, ?key, "unknown key in allowlist effect"),
                }
            }
            Ok(RuleEffect::Scoped {
                approve,
                match_command_line,
            })
        }
        other => anyhow::bail!("rule {rule:?}: unsupported effect {other:?}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

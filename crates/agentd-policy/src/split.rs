// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shell command-line decomposition.
//!
//! A command line is reduced to its atomic sub-commands: the segments
//! between `||`, `&&`, `;` and `|`, plus the contents of inline
//! substitutions (`$(…)`, backticks, `<(…)`, `>(…)`).  Each atom is policy
//! checked independently.  Nested substitutions beyond one level are out of
//! scope.

use std::sync::OnceLock;

use regex::Regex;

fn separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `||` must be listed before `|` so the alternation consumes the pair.
    RE.get_or_init(|| Regex::new(r"\|\||&&|;|\|").unwrap())
}

fn substitutions() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\(([^()]*)\)|`([^`]*)`|<\(([^()]*)\)|>\(([^()]*)\)").unwrap())
}

/// Split a command line into trimmed, non-empty atomic sub-commands.
///
/// Substitution contents are appended after the pipeline segments, so
/// `echo $(whoami)` yields `["echo $(whoami)", "whoami"]`.
pub fn split_subcommands(line: &str) -> Vec<String> {
    let mut atoms: Vec<String> = separators()
        .split(line)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    for caps in substitutions().captures_iter(line) {
        let inner = caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str())
            .unwrap_or("");
        // The extracted command may itself be a pipeline.
        for atom in separators()
            .split(inner)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            atoms.push(atom.to_string());
        }
    }

    atoms
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_command_is_one_atom() {
        assert_eq!(split_subcommands("ls -la"), vec!["ls -la"]);
    }

    #[test]
    fn splits_on_all_separators() {
        assert_eq!(
            split_subcommands("ls && cat a | grep -P foo"),
            vec!["ls", "cat a", "grep -P foo"]
        );
        assert_eq!(split_subcommands("a || b ; c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert_eq!(split_subcommands("ls ;; cat"), vec!["ls", "cat"]);
        assert!(split_subcommands("").is_empty());
        assert!(split_subcommands("  ;  ").is_empty());
    }

    #[test]
    fn dollar_substitution_is_extracted() {
        assert_eq!(
            split_subcommands("echo $(whoami)"),
            vec!["echo $(whoami)", "whoami"]
        );
    }

    #[test]
    fn backtick_substitution_is_extracted() {
        let atoms = split_subcommands("echo `date`");
        assert!(atoms.contains(&"date".to_string()));
    }

    #[test]
    fn process_substitutions_are_extracted() {
        let atoms = split_subcommands("diff <(sort a) >(tee log)");
        assert!(atoms.contains(&"sort a".to_string()));
        assert!(atoms.contains(&"tee log".to_string()));
    }

    #[test]
    fn substitution_pipeline_is_split_too() {
        let atoms = split_subcommands("echo $(cat a | wc -l)");
        assert!(atoms.contains(&"cat a".to_string()));
        assert!(atoms.contains(&"wc -l".to_string()));
    }
}

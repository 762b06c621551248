// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod pattern;
mod rules;
mod split;

pub use pattern::{base_executable, Pattern};
pub use rules::{Decision, Rule, RuleEffect, Ruleset, Verdict};
pub use split::split_subcommands;

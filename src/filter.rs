//! Capture filtering: trace mode, allow/deny sets, argument-content rules.
//!
//! Filtering is re-evaluated at both syscall edges with the same config, so
//! an enter that passed and an exit that would not still resolve their
//! shared correlation state. The deny set always wins: a number present in
//! both sets is denied.

use crate::arch::Abi;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Errors for filter construction
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid argument rule pattern: {0}")]
    BadPattern(#[from] regex::Error),
}

/// Which syscalls are candidates for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Only numbers in the allow set are captured.
    Listed,
    /// Everything is captured except the deny set.
    AllExceptDenied,
}

/// Outcome of the list checks for one syscall number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// `Listed` mode and the number is not in the allow set.
    AllowMiss,
    Denied,
}

/// The two explicit syscall sets.
#[derive(Debug, Clone, Default)]
pub struct SyscallLists {
    allow: HashSet<u32>,
    deny: HashSet<u32>,
}

impl SyscallLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, nr: u32) -> &mut Self {
        self.allow.insert(nr);
        self
    }

    pub fn deny(&mut self, nr: u32) -> &mut Self {
        self.deny.insert(nr);
        self
    }

    pub fn allow_all<I: IntoIterator<Item = u32>>(&mut self, nrs: I) -> &mut Self {
        self.allow.extend(nrs);
        self
    }

    pub fn deny_all<I: IntoIterator<Item = u32>>(&mut self, nrs: I) -> &mut Self {
        self.deny.extend(nrs);
        self
    }

    pub fn allowed_len(&self) -> usize {
        self.allow.len()
    }

    /// Evaluate the list checks in their fixed order: allow membership under
    /// `Listed` mode first, then the deny set.
    pub fn verdict(&self, mode: TraceMode, nr: u32) -> Verdict {
        if mode == TraceMode::Listed && !self.allow.contains(&nr) {
            return Verdict::AllowMiss;
        }
        if self.deny.contains(&nr) {
            return Verdict::Denied;
        }
        Verdict::Admit
    }
}

/// What a matching argument rule does to the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgAction {
    /// Capture only invocations where some armed string matches.
    Keep,
    /// Reject the invocation when a string matches.
    Drop,
}

/// One content rule, applied to string payloads emitted while the
/// descriptor marked for probing is being captured.
#[derive(Debug, Clone)]
pub struct ArgRule {
    pub pattern: Regex,
    pub action: ArgAction,
}

impl ArgRule {
    pub fn new(pattern: &str, action: ArgAction) -> Result<Self, FilterError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            action,
        })
    }
}

/// Read-mostly capture policy, owned outside the engine and shared by
/// reference into every invocation.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub mode: TraceMode,
    pub lists: SyscallLists,
    /// Delivered to the task after each successful enter capture.
    pub signal: Option<i32>,
    pub abi: Abi,
    pub arg_rules: Vec<ArgRule>,
}

impl FilterConfig {
    pub fn new(mode: TraceMode) -> Self {
        Self {
            mode,
            lists: SyscallLists::new(),
            signal: None,
            abi: Abi::default(),
            arg_rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    #[must_use]
    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: ArgRule) -> Self {
        self.arg_rules.push(rule);
        self
    }

    pub fn verdict(&self, nr: u32) -> Verdict {
        self.lists.verdict(self.mode, nr)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::new(TraceMode::AllExceptDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listed_mode_requires_allow() {
        let mut lists = SyscallLists::new();
        lists.allow(56);
        assert_eq!(lists.verdict(TraceMode::Listed, 56), Verdict::Admit);
        assert_eq!(lists.verdict(TraceMode::Listed, 57), Verdict::AllowMiss);
    }

    #[test]
    fn test_all_except_denied_admits_unlisted() {
        let lists = SyscallLists::new();
        assert_eq!(lists.verdict(TraceMode::AllExceptDenied, 999), Verdict::Admit);
    }

    #[test]
    fn test_deny_applies_in_both_modes() {
        let mut lists = SyscallLists::new();
        lists.allow(56).deny(56);
        assert_eq!(lists.verdict(TraceMode::Listed, 56), Verdict::Denied);
        assert_eq!(lists.verdict(TraceMode::AllExceptDenied, 56), Verdict::Denied);
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let mut lists = SyscallLists::new();
        lists.allow_all([10, 11, 12]).deny(11);
        assert_eq!(lists.verdict(TraceMode::Listed, 10), Verdict::Admit);
        assert_eq!(lists.verdict(TraceMode::Listed, 11), Verdict::Denied);
        assert_eq!(lists.verdict(TraceMode::Listed, 12), Verdict::Admit);
    }

    #[test]
    fn test_arg_rule_matches_bytes() {
        let rule = ArgRule::new("^/data/", ArgAction::Keep).unwrap();
        assert!(rule.pattern.is_match(b"/data/app/base.apk"));
        assert!(!rule.pattern.is_match(b"/system/lib64"));
    }

    #[test]
    fn test_arg_rule_bad_pattern_errors() {
        assert!(ArgRule::new("([unclosed", ArgAction::Drop).is_err());
    }

    #[test]
    fn test_config_builders() {
        let config = FilterConfig::new(TraceMode::Listed)
            .with_signal(19)
            .with_abi(Abi::Aarch32)
            .with_rule(ArgRule::new("x", ArgAction::Drop).unwrap());
        assert_eq!(config.mode, TraceMode::Listed);
        assert_eq!(config.signal, Some(19));
        assert_eq!(config.abi, Abi::Aarch32);
        assert_eq!(config.arg_rules.len(), 1);
    }

    #[test]
    fn test_config_verdict_delegates_to_lists() {
        let mut config = FilterConfig::new(TraceMode::Listed);
        config.lists.allow(63);
        assert_eq!(config.verdict(63), Verdict::Admit);
        assert_eq!(config.verdict(64), Verdict::AllowMiss);
    }
}

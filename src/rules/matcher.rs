//! Rule types and matching

use once_cell::sync::OnceCell;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Pattern kind of a [`Rule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Exact domain equality
    Domain,
    /// The pattern itself or any subdomain of it
    Namespace,
    /// Glob with `*` (any run, including empty) and `?` (exactly one char)
    Wildcard,
    /// Case-insensitive regular expression, unanchored unless the pattern
    /// anchors itself
    Regex,
    /// IPv4 subnet; drives the reconciler, never matches a domain
    Subnet,
    /// IPv6 subnet; drives the reconciler, never matches a domain
    Subnet6,
}

/// A single matching rule within a group.
///
/// Candidates are expected lower-case without a trailing dot; the DNS
/// pipeline normalizes names before they reach the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier, unique within the owning group
    pub id: Id,
    /// Display name
    pub name: String,
    /// Pattern kind
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Pattern text
    pub rule: String,
    /// Disabled rules never match and contribute nothing to sync
    pub enable: bool,

    /// Memoized compiled regex. `Some(None)` records a failed compilation,
    /// which makes the rule match nothing from then on.
    #[serde(skip)]
    compiled: OnceCell<Option<Regex>>,
}

impl Rule {
    /// Create a rule.
    #[must_use]
    pub fn new(id: Id, name: impl Into<String>, kind: RuleKind, rule: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            rule: rule.into(),
            enable: true,
            compiled: OnceCell::new(),
        }
    }

    /// Whether the rule participates in matching and sync.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enable
    }

    /// Test a domain name against the rule pattern.
    ///
    /// Subnet kinds always return false here; they are consumed by the
    /// reconciler's subnet path instead.
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        match self.kind {
            RuleKind::Domain => domain == self.rule,
            RuleKind::Namespace => {
                domain == self.rule
                    || (domain.len() > self.rule.len() + 1
                        && domain.ends_with(self.rule.as_str())
                        && domain.as_bytes()[domain.len() - self.rule.len() - 1] == b'.')
            }
            RuleKind::Wildcard => wildcard_match(self.rule.as_bytes(), domain.as_bytes()),
            RuleKind::Regex => self
                .compiled_regex()
                .as_ref()
                .is_some_and(|re| re.is_match(domain)),
            RuleKind::Subnet | RuleKind::Subnet6 => false,
        }
    }

    /// Compile the regex pattern once. Concurrent first callers serialize on
    /// the cell; the outcome, including failure, is reused afterwards.
    fn compiled_regex(&self) -> &Option<Regex> {
        self.compiled.get_or_init(|| {
            RegexBuilder::new(&self.rule)
                .case_insensitive(true)
                .build()
                .map_err(|err| {
                    tracing::warn!(rule = %self.id, pattern = %self.rule, %err,
                        "regex compilation failed, rule will never match");
                })
                .ok()
        })
    }
}

/// Glob matching with `*` (any run, including empty) and `?` (exactly one
/// byte). Case-sensitive against the pattern as given.
///
/// Iterative two-pointer walk with star backtracking; no recursion, no
/// allocation.
#[must_use]
pub fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Grow the last star's span by one and retry.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

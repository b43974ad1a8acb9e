//! Rule model and domain matchers
//!
//! A rule pairs a pattern with a kind; domain-shaped kinds decide whether an
//! observed domain name belongs to a group, subnet kinds feed the
//! reconciler's static-subnet path and never match a domain. Matching is
//! deterministic and side-effect free apart from the lazily memoized regex
//! compilation.

mod matcher;

pub use matcher::{wildcard_match, Rule, RuleKind};

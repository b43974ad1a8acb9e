//! Group data model

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::rules::Rule;

/// The persisted shape of a group: identity, egress binding and rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupModel {
    /// Stable identifier, unique within the process
    pub id: Id,
    /// Display name
    pub name: String,
    /// Colour tag for the UI
    #[serde(default)]
    pub color: String,
    /// Egress interface name, or the `blackhole` sentinel
    pub interface: String,
    /// Disabled groups claim no kernel resources
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Ordered rule list; ids are unique within the group
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_enable() -> bool {
    true
}

impl GroupModel {
    /// Whether any two rules share an id.
    #[must_use]
    pub fn has_duplicate_rule_ids(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.rules.iter().any(|rule| !seen.insert(rule.id))
    }
}

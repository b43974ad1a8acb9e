//! Chain policies
//!
//! A registered chain carries one of three policies describing how its
//! queued mutations relate to whatever is live in the kernel. `compile`
//! is pure: given the live rules it produces the minimal command sequence
//! and a priority that orders commands within a commit (override first,
//! patch in the middle, delete last).

use std::collections::HashMap;

use parking_lot::RwLock;

use super::rules::{Command, Rule};

/// Commit ordering priority; lower runs earlier.
pub type Priority = i8;

/// Common contract of the three chain policies.
pub trait ChainPolicy: Send + Sync {
    /// Produce the commands that reconcile the live chain with the policy's
    /// intent. `live` is `None` when the chain does not exist.
    fn compile(&self, chain: &str, live: Option<&[Rule]>) -> (Vec<Command>, Priority);

    /// Queue an append.
    fn append(&self, rule: Rule);

    /// Queue an insert at a 1-based position.
    fn insert(&self, position: usize, rule: Rule);

    /// Queue a delete.
    fn delete(&self, rule: Rule);
}

/// Chain that must not exist after commit. Rule mutations are ignored.
#[derive(Debug, Default)]
pub struct DeleteChain;

impl ChainPolicy for DeleteChain {
    fn compile(&self, chain: &str, live: Option<&[Rule]>) -> (Vec<Command>, Priority) {
        if live.is_none() {
            return (Vec::new(), 127);
        }
        (
            vec![
                Command::Flush {
                    chain: chain.to_string(),
                },
                Command::DeleteChain {
                    chain: chain.to_string(),
                },
            ],
            127,
        )
    }

    fn append(&self, _rule: Rule) {}
    fn insert(&self, _position: usize, _rule: Rule) {}
    fn delete(&self, _rule: Rule) {}
}

/// Chain that must contain exactly the queued rules in queued order.
#[derive(Debug, Default)]
pub struct OverrideChain {
    rules: RwLock<Vec<Rule>>,
}

impl ChainPolicy for OverrideChain {
    fn compile(&self, chain: &str, live: Option<&[Rule]>) -> (Vec<Command>, Priority) {
        let rules = self.rules.read();

        if let Some(live) = live {
            if live.len() == rules.len() && live.iter().zip(rules.iter()).all(|(a, b)| a == b) {
                return (Vec::new(), -128);
            }
        }

        let mut out = Vec::with_capacity(rules.len() + 1);
        out.push(Command::Flush {
            chain: chain.to_string(),
        });
        for rule in rules.iter() {
            out.push(Command::Append {
                chain: chain.to_string(),
                rule: rule.clone(),
            });
        }
        (out, -128)
    }

    fn append(&self, rule: Rule) {
        self.rules.write().push(rule);
    }

    fn insert(&self, position: usize, rule: Rule) {
        let mut rules = self.rules.write();
        if position < 1 || position > rules.len() + 1 {
            return;
        }
        rules.insert(position - 1, rule);
    }

    fn delete(&self, rule: Rule) {
        let mut rules = self.rules.write();
        if let Some(pos) = rules.iter().position(|r| *r == rule) {
            rules.remove(pos);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchOp {
    Append,
    Insert(usize),
    Delete,
}

#[derive(Debug, Clone)]
struct PatchEntry {
    op: PatchOp,
    rule: Rule,
}

/// Chain whose queued mutations merge with the live rules.
///
/// For the same rule only the last queued operation is kept. Insert behaves
/// as insert-unique, not positional insert. Live duplicates of a queued rule
/// are collapsed to a single copy before the operation itself applies.
#[derive(Debug, Default)]
pub struct PatchChain {
    entries: RwLock<Vec<PatchEntry>>,
}

impl PatchChain {
    fn add_entry(&self, entry: PatchEntry) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.rule != entry.rule);
        entries.push(entry);
    }
}

impl ChainPolicy for PatchChain {
    fn compile(&self, chain: &str, live: Option<&[Rule]>) -> (Vec<Command>, Priority) {
        let entries = self.entries.read();

        let mut live_counts: HashMap<String, usize> = HashMap::new();
        for rule in live.unwrap_or_default() {
            *live_counts.entry(rule.to_string()).or_default() += 1;
        }

        let mut out = Vec::new();
        for entry in entries.iter() {
            let mut count = live_counts
                .get(&entry.rule.to_string())
                .copied()
                .unwrap_or(0);

            // Collapse duplicates down to one copy.
            while count > 1 {
                out.push(Command::Delete {
                    chain: chain.to_string(),
                    rule: entry.rule.clone(),
                });
                count -= 1;
            }

            match entry.op {
                PatchOp::Append => {
                    if count == 0 {
                        out.push(Command::Append {
                            chain: chain.to_string(),
                            rule: entry.rule.clone(),
                        });
                    }
                }
                PatchOp::Insert(position) => {
                    if count == 0 {
                        out.push(Command::Insert {
                            chain: chain.to_string(),
                            position,
                            rule: entry.rule.clone(),
                        });
                    }
                }
                PatchOp::Delete => {
                    if count >= 1 {
                        out.push(Command::Delete {
                            chain: chain.to_string(),
                            rule: entry.rule.clone(),
                        });
                    }
                }
            }
        }
        (out, 0)
    }

    fn append(&self, rule: Rule) {
        self.add_entry(PatchEntry {
            op: PatchOp::Append,
            rule,
        });
    }

    fn insert(&self, position: usize, rule: Rule) {
        self.add_entry(PatchEntry {
            op: PatchOp::Insert(position),
            rule,
        });
    }

    fn delete(&self, rule: Rule) {
        self.add_entry(PatchEntry {
            op: PatchOp::Delete,
            rule,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(line: &str) -> Rule {
        Rule::from_line(line)
    }

    // ==================== DeleteChain ====================

    #[test]
    fn test_delete_absent_chain_emits_nothing() {
        let chain = DeleteChain;
        let (commands, priority) = chain.compile("MR_x", None);
        assert!(commands.is_empty());
        assert_eq!(priority, 127);
    }

    #[test]
    fn test_delete_existing_chain_flush_then_delete() {
        let chain = DeleteChain;
        let live = vec![r("-j ACCEPT")];
        let (commands, priority) = chain.compile("MR_x", Some(&live));
        assert_eq!(priority, 127);
        assert_eq!(
            commands,
            vec![
                Command::Flush {
                    chain: "MR_x".into()
                },
                Command::DeleteChain {
                    chain: "MR_x".into()
                },
            ]
        );
    }

    #[test]
    fn test_delete_ignores_rule_mutations() {
        let chain = DeleteChain;
        chain.append(r("-j ACCEPT"));
        chain.insert(1, r("-j DROP"));
        chain.delete(r("-j ACCEPT"));
        let live = vec![];
        let (commands, _) = chain.compile("MR_x", Some(&live));
        assert_eq!(commands.len(), 2);
    }

    // ==================== OverrideChain ====================

    #[test]
    fn test_override_emits_flush_then_appends() {
        let chain = OverrideChain::default();
        chain.append(r("-j MARK --set-mark 10"));
        chain.append(r("-j CONNMARK --save-mark"));

        let (commands, priority) = chain.compile("MR_x", None);
        assert_eq!(priority, -128);
        assert_eq!(commands.len(), 3);
        assert!(matches!(commands[0], Command::Flush { .. }));
        assert_eq!(
            commands[1],
            Command::Append {
                chain: "MR_x".into(),
                rule: r("-j MARK --set-mark 10")
            }
        );
    }

    #[test]
    fn test_override_noop_when_live_matches() {
        let chain = OverrideChain::default();
        chain.append(r("-j ACCEPT"));
        chain.append(r("-j DROP"));

        let live = vec![r("-j ACCEPT"), r("-j DROP")];
        let (commands, _) = chain.compile("MR_x", Some(&live));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_override_rewrites_on_order_mismatch() {
        let chain = OverrideChain::default();
        chain.append(r("-j ACCEPT"));
        chain.append(r("-j DROP"));

        let live = vec![r("-j DROP"), r("-j ACCEPT")];
        let (commands, _) = chain.compile("MR_x", Some(&live));
        assert_eq!(commands.len(), 3);
    }

    #[test]
    fn test_override_insert_positions() {
        let chain = OverrideChain::default();
        chain.append(r("-j B"));
        chain.insert(1, r("-j A"));
        chain.insert(3, r("-j C"));
        // Out-of-range positions are ignored.
        chain.insert(0, r("-j X"));
        chain.insert(10, r("-j Y"));

        let (commands, _) = chain.compile("MR_x", None);
        let appended: Vec<String> = commands
            .iter()
            .filter_map(|c| match c {
                Command::Append { rule, .. } => Some(rule.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(appended, vec!["-j A", "-j B", "-j C"]);
    }

    #[test]
    fn test_override_delete_removes_queued_rule() {
        let chain = OverrideChain::default();
        chain.append(r("-j A"));
        chain.append(r("-j B"));
        chain.delete(r("-j A"));

        let (commands, _) = chain.compile("MR_x", None);
        assert_eq!(commands.len(), 2); // flush + one append
    }

    // ==================== PatchChain ====================

    #[test]
    fn test_patch_append_skips_present_rule() {
        let chain = PatchChain::default();
        chain.append(r("-j ACCEPT"));

        let live = vec![r("-j ACCEPT")];
        let (commands, priority) = chain.compile("FORWARD", Some(&live));
        assert_eq!(priority, 0);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_patch_append_adds_missing_rule() {
        let chain = PatchChain::default();
        chain.append(r("-j MR_x"));

        let live = vec![r("-i eth0 -j ACCEPT")];
        let (commands, _) = chain.compile("FORWARD", Some(&live));
        assert_eq!(
            commands,
            vec![Command::Append {
                chain: "FORWARD".into(),
                rule: r("-j MR_x")
            }]
        );
    }

    #[test]
    fn test_patch_collapses_duplicates_to_one() {
        let chain = PatchChain::default();
        chain.append(r("-j MR_x"));

        let live = vec![r("-j MR_x"), r("-j MR_x"), r("-j MR_x")];
        let (commands, _) = chain.compile("FORWARD", Some(&live));
        // Two deletes bring three copies down to one; the append then skips.
        assert_eq!(
            commands,
            vec![
                Command::Delete {
                    chain: "FORWARD".into(),
                    rule: r("-j MR_x")
                },
                Command::Delete {
                    chain: "FORWARD".into(),
                    rule: r("-j MR_x")
                },
            ]
        );
    }

    #[test]
    fn test_patch_delete_only_when_present() {
        let chain = PatchChain::default();
        chain.delete(r("-j MR_x"));

        let (commands, _) = chain.compile("FORWARD", Some(&[]));
        assert!(commands.is_empty());

        let live = vec![r("-j MR_x")];
        let (commands, _) = chain.compile("FORWARD", Some(&live));
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Delete { .. }));
    }

    #[test]
    fn test_patch_insert_is_insert_unique() {
        let chain = PatchChain::default();
        chain.insert(1, r("-j MR_x"));

        // Present: nothing emitted despite the position.
        let live = vec![r("-j other"), r("-j MR_x")];
        let (commands, _) = chain.compile("PREROUTING", Some(&live));
        assert!(commands.is_empty());

        // Absent: inserted at the requested position.
        let (commands, _) = chain.compile("PREROUTING", Some(&[]));
        assert_eq!(
            commands,
            vec![Command::Insert {
                chain: "PREROUTING".into(),
                position: 1,
                rule: r("-j MR_x")
            }]
        );
    }

    #[test]
    fn test_patch_last_write_wins_per_rule() {
        let chain = PatchChain::default();
        chain.append(r("-j MR_x"));
        chain.delete(r("-j MR_x"));

        let live = vec![r("-j MR_x")];
        let (commands, _) = chain.compile("FORWARD", Some(&live));
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Delete { .. }));
    }

    #[test]
    fn test_patch_processes_in_queue_order() {
        let chain = PatchChain::default();
        chain.append(r("-j A"));
        chain.append(r("-j B"));
        chain.delete(r("-j C"));

        let live = vec![r("-j C")];
        let (commands, _) = chain.compile("FORWARD", Some(&live));
        assert_eq!(
            commands.iter().map(Command::to_line).collect::<Vec<_>>(),
            vec!["-A FORWARD -j A", "-A FORWARD -j B", "-D FORWARD -j C"]
        );
    }
}

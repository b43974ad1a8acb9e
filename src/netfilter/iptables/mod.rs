//! Declarative packet-filter chain management
//!
//! Chains are registered with one of three policies (override, patch,
//! delete); `commit` reads the live state once through the save primitive,
//! lets every registered chain compile the minimal command sequence against
//! it, and applies the whole batch through a single no-flush restore.
//!
//! Rules are token sequences; see [`rules::Rule`]. The representation
//! round-trips through the save/restore text format, which is what makes
//! the diffing exact.

mod backend;
mod chains;
mod rules;

pub use backend::{Backend, ExecBackend, FakeBackend, Protocol};
pub use chains::{ChainPolicy, DeleteChain, OverrideChain, PatchChain, Priority};
pub use rules::{Command, Rule};

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::NetfilterError;

/// Live rules per table and chain, as read from the save primitive.
pub type LiveRules = HashMap<String, HashMap<String, Vec<Rule>>>;

/// Declarative view over one family's packet-filter tables.
pub struct IpTables {
    chains: RwLock<HashMap<String, HashMap<String, Arc<dyn ChainPolicy>>>>,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for IpTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpTables")
            .field("proto", &self.backend.proto())
            .field("tables", &self.chains.read().len())
            .finish()
    }
}

impl IpTables {
    /// Create a view over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            backend,
        }
    }

    /// The address family of the underlying backend.
    #[must_use]
    pub fn proto(&self) -> Protocol {
        self.backend.proto()
    }

    fn register(&self, table: &str, chain: &str, policy: Arc<dyn ChainPolicy>) {
        self.chains
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(chain.to_string(), policy);
    }

    /// Register a chain that must not exist after the next commit.
    pub fn register_chain_delete(&self, table: &str, chain: &str) {
        self.register(table, chain, Arc::new(DeleteChain));
    }

    /// Register a chain whose content is fully owned by this process.
    pub fn register_chain_override(&self, table: &str, chain: &str) {
        self.register(table, chain, Arc::new(OverrideChain::default()));
    }

    /// Register a chain whose queued mutations merge with foreign rules.
    pub fn register_chain_patch(&self, table: &str, chain: &str) {
        self.register(table, chain, Arc::new(PatchChain::default()));
    }

    fn chain(&self, table: &str, chain: &str) -> Result<Arc<dyn ChainPolicy>, NetfilterError> {
        self.chains
            .read()
            .get(table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .ok_or_else(|| NetfilterError::chain_not_registered(table, chain))
    }

    /// Queue an append on a registered chain.
    pub fn append(&self, table: &str, chain: &str, rule: Rule) -> Result<(), NetfilterError> {
        self.chain(table, chain)?.append(rule);
        Ok(())
    }

    /// Queue an insert-at-position on a registered chain.
    pub fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: Rule,
    ) -> Result<(), NetfilterError> {
        self.chain(table, chain)?.insert(position, rule);
        Ok(())
    }

    /// Queue a delete on a registered chain.
    pub fn delete(&self, table: &str, chain: &str, rule: Rule) -> Result<(), NetfilterError> {
        self.chain(table, chain)?.delete(rule);
        Ok(())
    }

    /// Read and parse the live state of every table.
    ///
    /// Chains appear in the result with an empty rule list when declared but
    /// empty; absent chains are simply missing, which is how the delete
    /// policy distinguishes "flush then delete" from "nothing to do".
    pub fn current_rules(&self) -> Result<LiveRules, NetfilterError> {
        let data = self.backend.save()?;
        let text = std::str::from_utf8(&data)
            .map_err(|e| NetfilterError::parse(format!("save output not UTF-8: {e}")))?;

        let mut live: LiveRules = HashMap::new();
        let mut current: Option<String> = None;

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(table) = line.strip_prefix('*') {
                current = Some(table.to_string());
                live.entry(table.to_string()).or_default();
                continue;
            }
            if line == "COMMIT" {
                current = None;
                continue;
            }
            let Some(table) = current.as_ref() else {
                return Err(NetfilterError::parse(format!(
                    "rule outside of table: {line:?}"
                )));
            };
            let chains = live.get_mut(table).expect("table entry created above");

            if let Some(decl) = line.strip_prefix(':') {
                let chain = decl
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| NetfilterError::parse("invalid chain declaration"))?;
                chains.entry(chain.to_string()).or_default();
                continue;
            }
            if let Some(rest) = line.strip_prefix("-A ") {
                let mut parts = rest.split_whitespace();
                let chain = parts
                    .next()
                    .ok_or_else(|| NetfilterError::parse(format!("invalid rule: {line:?}")))?;
                let rule = Rule::new(parts.map(|t| t.as_bytes().to_vec()));
                chains.entry(chain.to_string()).or_default().push(rule);
                continue;
            }
            return Err(NetfilterError::parse(format!(
                "unknown save line: {line:?}"
            )));
        }

        Ok(live)
    }

    /// Render the restore payload that reconciles the live state with every
    /// registered chain. Empty when nothing has to change.
    pub fn build_payload(&self) -> Result<String, NetfilterError> {
        let live = self.current_rules()?;
        let chains = self.chains.read();
        let mut payload = String::new();

        for (table_name, table_chains) in chains.iter() {
            let live_table = live.get(table_name);

            // priority -> commands, ascending
            let mut prioritized: BTreeMap<Priority, Vec<Command>> = BTreeMap::new();
            let mut headers: Vec<&str> = Vec::new();

            for (chain_name, policy) in table_chains {
                let live_chain = live_table
                    .and_then(|t| t.get(chain_name))
                    .map(Vec::as_slice);
                let (commands, priority) = policy.compile(chain_name, live_chain);
                if commands.is_empty() {
                    continue;
                }
                headers.push(chain_name.as_str());
                prioritized.entry(priority).or_default().extend(commands);
            }

            if prioritized.is_empty() {
                continue;
            }

            let _ = writeln!(payload, "*{table_name}");
            headers.sort_unstable();
            for chain in headers {
                let _ = writeln!(payload, ":{chain} - [0:0]");
            }
            for commands in prioritized.values() {
                for command in commands {
                    let _ = writeln!(payload, "{}", command.to_line());
                }
            }
            payload.push_str("COMMIT\n");
        }

        Ok(payload)
    }

    /// Reconcile the kernel with every registered chain in one restore.
    pub fn commit(&self) -> Result<(), NetfilterError> {
        let payload = self.build_payload()?;
        if payload.is_empty() {
            trace!(proto = ?self.proto(), "commit: nothing to apply");
            return Ok(());
        }
        debug!(proto = ?self.proto(), bytes = payload.len(), "applying restore payload");
        self.backend.restore(payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(line: &str) -> Rule {
        Rule::from_line(line)
    }

    fn setup() -> (Arc<FakeBackend>, IpTables) {
        let backend = Arc::new(FakeBackend::new(Protocol::Ipv4));
        let ipt = IpTables::new(backend.clone());
        (backend, ipt)
    }

    #[test]
    fn test_unregistered_chain_errors() {
        let (_, ipt) = setup();
        let err = ipt.append("filter", "FORWARD", r("-j ACCEPT")).unwrap_err();
        assert!(matches!(err, NetfilterError::ChainNotRegistered { .. }));
    }

    #[test]
    fn test_override_creates_chain_content() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("mangle", "PREROUTING", []);

        ipt.register_chain_override("mangle", "MR_g1");
        ipt.append("mangle", "MR_g1", r("-j MARK --set-mark 10")).unwrap();
        ipt.append("mangle", "MR_g1", r("-j CONNMARK --save-mark")).unwrap();
        ipt.commit().unwrap();

        assert_eq!(
            backend.rules("mangle", "MR_g1").unwrap(),
            vec![r("-j MARK --set-mark 10"), r("-j CONNMARK --save-mark")]
        );
    }

    #[test]
    fn test_override_converges_from_any_start() {
        let (backend, ipt) = setup();
        backend.set_initial_rules(
            "mangle",
            "MR_g1",
            [r("-j stale"), r("-j MARK --set-mark 10"), r("-j stale2")],
        );

        ipt.register_chain_override("mangle", "MR_g1");
        ipt.append("mangle", "MR_g1", r("-j MARK --set-mark 10")).unwrap();
        ipt.commit().unwrap();

        assert_eq!(
            backend.rules("mangle", "MR_g1").unwrap(),
            vec![r("-j MARK --set-mark 10")]
        );
    }

    #[test]
    fn test_override_second_commit_is_empty_payload() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("nat", "PREROUTING", []);

        ipt.register_chain_override("nat", "MR_dns");
        ipt.append("nat", "MR_dns", r("-p udp -j DNAT --to-destination :3553"))
            .unwrap();
        ipt.commit().unwrap();

        let payload = ipt.build_payload().unwrap();
        assert!(payload.is_empty(), "expected empty payload, got {payload:?}");
    }

    #[test]
    fn test_patch_preserves_foreign_rules() {
        let (backend, ipt) = setup();
        backend.set_initial_rules(
            "filter",
            "FORWARD",
            [r("-i eth0 -j ACCEPT"), r("-i eth1 -j DROP")],
        );

        ipt.register_chain_patch("filter", "FORWARD");
        ipt.append("filter", "FORWARD", r("-j MR_g1")).unwrap();
        ipt.commit().unwrap();

        assert_eq!(
            backend.rules("filter", "FORWARD").unwrap(),
            vec![r("-i eth0 -j ACCEPT"), r("-i eth1 -j DROP"), r("-j MR_g1")]
        );
    }

    #[test]
    fn test_patch_commit_is_idempotent() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("filter", "FORWARD", [r("-j MR_g1"), r("-j MR_g1")]);

        ipt.register_chain_patch("filter", "FORWARD");
        ipt.append("filter", "FORWARD", r("-j MR_g1")).unwrap();
        ipt.commit().unwrap();
        assert_eq!(
            backend.rules("filter", "FORWARD").unwrap(),
            vec![r("-j MR_g1")],
            "duplicates collapse to one"
        );

        ipt.commit().unwrap();
        assert_eq!(
            backend.rules("filter", "FORWARD").unwrap(),
            vec![r("-j MR_g1")]
        );
    }

    #[test]
    fn test_delete_chain_removed() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("nat", "MR_old", [r("-j MASQUERADE")]);

        ipt.register_chain_delete("nat", "MR_old");
        ipt.commit().unwrap();

        assert!(!backend.chain_exists("nat", "MR_old"));
    }

    #[test]
    fn test_delete_absent_chain_is_noop() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("nat", "PREROUTING", []);

        ipt.register_chain_delete("nat", "MR_never_existed");
        assert!(ipt.build_payload().unwrap().is_empty());
    }

    #[test]
    fn test_commit_orders_by_priority() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("filter", "FORWARD", [r("-j MR_old")]);
        backend.set_initial_rules("filter", "MR_old", [r("-j ACCEPT")]);

        // Override (-128) must run before patch (0), delete (127) last.
        ipt.register_chain_override("filter", "MR_new");
        ipt.append("filter", "MR_new", r("-j ACCEPT")).unwrap();
        ipt.register_chain_patch("filter", "FORWARD");
        ipt.append("filter", "FORWARD", r("-j MR_new")).unwrap();
        ipt.delete("filter", "FORWARD", r("-j MR_old")).unwrap();
        ipt.register_chain_delete("filter", "MR_old");

        let payload = ipt.build_payload().unwrap();
        let f_new = payload.find("-F MR_new").unwrap();
        let a_fwd = payload.find("-A FORWARD -j MR_new").unwrap();
        let x_old = payload.find("-X MR_old").unwrap();
        assert!(f_new < a_fwd && a_fwd < x_old, "bad order:\n{payload}");

        ipt.commit().unwrap();
        assert!(!backend.chain_exists("filter", "MR_old"));
        assert_eq!(
            backend.rules("filter", "FORWARD").unwrap(),
            vec![r("-j MR_new")]
        );
    }

    #[test]
    fn test_commit_skips_untouched_tables() {
        let (backend, ipt) = setup();
        backend.set_initial_rules("filter", "FORWARD", []);
        backend.set_initial_rules("nat", "PREROUTING", [r("-j MR_dns")]);

        ipt.register_chain_patch("filter", "FORWARD");
        ipt.register_chain_patch("nat", "PREROUTING");
        // Only the filter table gets a queued change.
        ipt.append("filter", "FORWARD", r("-j MR_g1")).unwrap();

        let payload = ipt.build_payload().unwrap();
        assert!(payload.contains("*filter"));
        assert!(!payload.contains("*nat"));
    }

    #[test]
    fn test_save_parse_roundtrip_preserves_tokens() {
        let (backend, ipt) = setup();
        let rule = r("-m set --match-set mr_ab01cd23_4 dst -o wg0 -j ACCEPT");
        backend.set_initial_rules("filter", "MR_x", [rule.clone()]);

        let live = ipt.current_rules().unwrap();
        assert_eq!(live["filter"]["MR_x"], vec![rule]);
    }
}

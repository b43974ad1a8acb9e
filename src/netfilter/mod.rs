//! Kernel binding layer
//!
//! Declarative, idempotent management of packet-filter chains, address
//! sets, policy rules and routes. Everything reaches the kernel through
//! narrow seams ([`iptables::Backend`], [`ipset::IpsetBackend`],
//! [`route::RouteOps`]) with exec-backed real implementations and
//! in-memory fakes for tests.

pub mod ipset;
pub mod ipset_to_link;
pub mod iptables;
pub mod port_remap;
pub mod route;

pub use ipset::{IpSet, IpsetBackend, SetTimeout, DEFAULT_SET_TIMEOUT};
pub use ipset_to_link::{IpsetToLink, BLACKHOLE};
pub use iptables::{IpTables, Protocol};
pub use port_remap::PortRemap;
pub use route::{LinkState, PolicyRule, Route, RouteFamily, RouteKind, RouteOps};

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::error::NetfilterError;

/// Built-in chains this daemon hooks into, registered with the patch
/// policy so foreign rules survive every commit.
pub const BUILTIN_HOOKS: [(&str, &str); 4] = [
    ("filter", "FORWARD"),
    ("mangle", "PREROUTING"),
    ("nat", "PREROUTING"),
    ("nat", "POSTROUTING"),
];

/// Factory for the kernel bindings, carrying naming prefixes, family
/// toggles and the backend handles.
pub struct NetfilterHelper {
    /// Prefix for owned chains
    pub chain_prefix: String,
    /// Prefix for owned address sets
    pub ipset_prefix: String,
    /// First candidate for the mark/table search
    pub start_index: u32,

    /// IPv4 chain view, absent when the family is disabled
    pub ipt4: Option<Arc<IpTables>>,
    /// IPv6 chain view, absent when the family is disabled
    pub ipt6: Option<Arc<IpTables>>,

    ipset_backend: Arc<dyn IpsetBackend>,
    route_ops: Arc<dyn RouteOps>,
}

impl std::fmt::Debug for NetfilterHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetfilterHelper")
            .field("chain_prefix", &self.chain_prefix)
            .field("ipset_prefix", &self.ipset_prefix)
            .field("ipv4", &self.ipt4.is_some())
            .field("ipv6", &self.ipt6.is_some())
            .finish()
    }
}

impl NetfilterHelper {
    /// Helper over the host's real tooling.
    #[must_use]
    pub fn new(
        chain_prefix: String,
        ipset_prefix: String,
        disable_ipv4: bool,
        disable_ipv6: bool,
        start_index: u32,
    ) -> Self {
        let ipt4 = (!disable_ipv4).then(|| {
            Arc::new(IpTables::new(Arc::new(iptables::ExecBackend::new(
                Protocol::Ipv4,
            ))))
        });
        let ipt6 = (!disable_ipv6).then(|| {
            Arc::new(IpTables::new(Arc::new(iptables::ExecBackend::new(
                Protocol::Ipv6,
            ))))
        });
        Self {
            chain_prefix,
            ipset_prefix,
            start_index,
            ipt4,
            ipt6,
            ipset_backend: Arc::new(ipset::ExecIpsetBackend),
            route_ops: Arc::new(route::IpRouteOps),
        }
    }

    /// Helper over injected backends; what tests use.
    #[must_use]
    pub fn with_backends(
        chain_prefix: String,
        ipset_prefix: String,
        start_index: u32,
        ipt4: Option<Arc<IpTables>>,
        ipt6: Option<Arc<IpTables>>,
        ipset_backend: Arc<dyn IpsetBackend>,
        route_ops: Arc<dyn RouteOps>,
    ) -> Self {
        Self {
            chain_prefix,
            ipset_prefix,
            start_index,
            ipt4,
            ipt6,
            ipset_backend,
            route_ops,
        }
    }

    /// The routing seam, shared with the link monitor and interface listing.
    #[must_use]
    pub fn route_ops(&self) -> Arc<dyn RouteOps> {
        self.route_ops.clone()
    }

    /// Register the patch policies for the built-in chains the bindings
    /// jump from. Must run once before any binding is enabled.
    pub fn register_builtin_chains(&self) {
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            for (table, chain) in BUILTIN_HOOKS {
                ipt.register_chain_patch(table, chain);
            }
        }
    }

    /// Address-set binding named `<ipset_prefix><name>`.
    #[must_use]
    pub fn ipset(&self, name: &str) -> IpSet {
        IpSet::new(
            format!("{}{name}", self.ipset_prefix),
            self.ipt4.is_some(),
            self.ipt6.is_some(),
            self.ipset_backend.clone(),
        )
    }

    /// Set-to-interface binding named `<chain_prefix><name>` over the given
    /// address sets.
    #[must_use]
    pub fn ipset_to_link(&self, name: &str, iface_name: &str, ipset: &IpSet) -> IpsetToLink {
        IpsetToLink::new(
            format!("{}{name}", self.chain_prefix),
            iface_name.to_string(),
            ipset.set_name().to_string(),
            self.start_index,
            self.ipt4.clone(),
            self.ipt6.clone(),
            self.route_ops.clone(),
        )
    }

    /// Port-remap binding named `<chain_prefix><name>`.
    #[must_use]
    pub fn port_remap(&self, name: &str, from: u16, to: u16, addresses: Vec<IpAddr>) -> PortRemap {
        PortRemap::new(
            format!("{}{name}", self.chain_prefix),
            from,
            to,
            addresses,
            self.ipt4.clone(),
            self.ipt6.clone(),
        )
    }

    /// Sweep chains left behind by a previous instance: every chain whose
    /// name carries the owned prefix is deleted, and every rule jumping
    /// into such a chain from a foreign chain is removed.
    pub fn clean_iptables(&self) -> Result<(), NetfilterError> {
        let jump_needle = format!("-j {}", self.chain_prefix);

        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            let live = ipt.current_rules()?;

            for (table, chains) in &live {
                for (chain, rules) in chains {
                    if chain.starts_with(&self.chain_prefix) {
                        ipt.register_chain_delete(table, chain);
                        debug!(table, chain, "queueing leftover chain for deletion");
                        continue;
                    }
                    for rule in rules {
                        if !rule.contains(&jump_needle) {
                            continue;
                        }
                        if ipt.delete(table, chain, rule.clone()).is_err() {
                            // Foreign chain not registered yet: patch it in
                            // and retry.
                            ipt.register_chain_patch(table, chain);
                            ipt.delete(table, chain, rule.clone())?;
                        }
                        debug!(table, chain, rule = %rule, "queueing leftover jump for removal");
                    }
                }
            }

            ipt.commit()?;
        }
        Ok(())
    }
}

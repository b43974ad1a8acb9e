//! Port-remap binding
//!
//! Redirects a local destination port to another via DNAT rules in a
//! dedicated nat chain, jumped to from the top of PREROUTING. Scoped to a
//! list of local addresses, filtered per family. Used to steer intercepted
//! DNS from port 53 to the local proxy port.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::iptables::{IpTables, Protocol, Rule};
use crate::error::NetfilterError;

/// DNAT redirect of one local port to another.
pub struct PortRemap {
    enabled: AtomicBool,
    locker: Mutex<()>,

    chain_name: String,
    addresses: Vec<IpAddr>,
    from: u16,
    to: u16,

    ipt4: Option<Arc<IpTables>>,
    ipt6: Option<Arc<IpTables>>,
}

impl std::fmt::Debug for PortRemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRemap")
            .field("chain", &self.chain_name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl PortRemap {
    pub(crate) fn new(
        chain_name: String,
        from: u16,
        to: u16,
        addresses: Vec<IpAddr>,
        ipt4: Option<Arc<IpTables>>,
        ipt6: Option<Arc<IpTables>>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            locker: Mutex::new(()),
            chain_name,
            addresses,
            from,
            to,
            ipt4,
            ipt6,
        }
    }

    fn insert_iptables_rules(&self, ipt: &IpTables) -> Result<(), NetfilterError> {
        let chain = self.chain_name.as_str();
        ipt.register_chain_override("nat", chain);

        let from = self.from.to_string();
        let to = format!(":{}", self.to);
        for addr in &self.addresses {
            let family_matches = match ipt.proto() {
                Protocol::Ipv4 => addr.is_ipv4(),
                Protocol::Ipv6 => addr.is_ipv6(),
            };
            if !family_matches {
                continue;
            }
            let addr_text = addr.to_string();
            for proto in ["tcp", "udp"] {
                ipt.append(
                    "nat",
                    chain,
                    Rule::new([
                        "-p", proto, "-d", addr_text.as_str(), "--dport", from.as_str(), "-j",
                        "DNAT", "--to-destination", to.as_str(),
                    ]),
                )?;
            }
        }

        ipt.insert("nat", "PREROUTING", 1, Rule::new(["-j", chain]))?;
        ipt.commit()
    }

    fn delete_iptables_rules(&self, ipt: &IpTables) -> Result<(), NetfilterError> {
        let chain = self.chain_name.as_str();
        let mut first_err = None;

        ipt.register_chain_delete("nat", chain);
        if let Err(err) = ipt.delete("nat", "PREROUTING", Rule::new(["-j", chain])) {
            error!(%err, "failed to queue remap jump removal");
            first_err.get_or_insert(err);
        }
        if let Err(err) = ipt.commit() {
            error!(%err, "failed to commit remap teardown");
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn enable_inner(&self) -> Result<(), NetfilterError> {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            self.insert_iptables_rules(ipt)?;
        }
        Ok(())
    }

    /// Install the redirect. Idempotent; failure rolls back.
    pub fn enable(&self) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        let result = self.enable_inner();
        if result.is_err() {
            let _ = self.disable_inner();
        }
        result
    }

    fn disable_inner(&self) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err = None;
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            if let Err(err) = self.delete_iptables_rules(ipt) {
                first_err.get_or_insert(err);
            }
        }
        self.enabled.store(false, Ordering::SeqCst);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove the redirect. Idempotent.
    pub fn disable(&self) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        self.disable_inner()
    }
}

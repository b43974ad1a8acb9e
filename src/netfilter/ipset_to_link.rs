//! Set-to-interface binding
//!
//! Couples a group's address sets to a dedicated routing table and firewall
//! mark. On enable, in order: claim an unused (mark, table) pair, install
//! the `fwmark -> table` policy rules, install blackhole plus half-default
//! routes, install the filter/mangle/nat chains with their jump stubs.
//! Disable tears down in reverse. The egress sentinel `blackhole` drops
//! traffic via the blackhole route alone.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::iptables::{IpTables, Rule};
use super::route::{PolicyRule, Route, RouteFamily, RouteKind, RouteOps};
use crate::error::NetfilterError;

/// Egress sentinel that drops traffic instead of forwarding it.
pub const BLACKHOLE: &str = "blackhole";

/// Reserved routing tables never claimed by the allocator.
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// Upper bound on allocation retries when installs race with other writers.
const MAX_ALLOCATION_ATTEMPTS: u32 = 8;

#[derive(Debug, Default)]
struct LinkInner {
    mark: u32,
    table: u32,
    rules: Vec<PolicyRule>,
    // slot 0: blackhole default, slots 1-2: half-defaults via the device
    routes_v4: [Option<Route>; 3],
    routes_v6: [Option<Route>; 3],
}

/// Binding between a group's address sets and its egress interface.
pub struct IpsetToLink {
    enabled: AtomicBool,

    chain_name: String,
    iface_name: String,
    set_name: String,
    start_index: u32,

    ipt4: Option<Arc<IpTables>>,
    ipt6: Option<Arc<IpTables>>,
    route_ops: Arc<dyn RouteOps>,

    inner: Mutex<LinkInner>,
}

impl std::fmt::Debug for IpsetToLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpsetToLink")
            .field("chain", &self.chain_name)
            .field("iface", &self.iface_name)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl IpsetToLink {
    pub(crate) fn new(
        chain_name: String,
        iface_name: String,
        set_name: String,
        start_index: u32,
        ipt4: Option<Arc<IpTables>>,
        ipt6: Option<Arc<IpTables>>,
        route_ops: Arc<dyn RouteOps>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            chain_name,
            iface_name,
            set_name,
            start_index,
            ipt4,
            ipt6,
            route_ops,
            inner: Mutex::new(LinkInner::default()),
        }
    }

    /// The claimed (mark, table) pair, while enabled.
    #[must_use]
    pub fn mark_and_table(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.mark, inner.table)
    }

    /// Owned chain name.
    #[must_use]
    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    /// Smallest integer >= `from` not present among live marks, live route
    /// tables, or the reserved tables.
    fn find_unused_index(&self, from: u32) -> Result<u32, NetfilterError> {
        let mut used: std::collections::HashSet<u32> = RESERVED_TABLES.into_iter().collect();
        for rule in self.route_ops.list_rules()? {
            used.insert(rule.mark);
            used.insert(rule.table);
        }
        for table in self.route_ops.list_route_tables()? {
            used.insert(table);
        }

        let mut idx = from;
        while used.contains(&idx) {
            idx = idx.checked_add(1).ok_or(NetfilterError::AllocationFailed {
                attempts: 0,
            })?;
        }
        Ok(idx)
    }

    fn families(&self) -> Vec<RouteFamily> {
        let mut families = Vec::with_capacity(2);
        if self.ipt4.is_some() {
            families.push(RouteFamily::V4);
        }
        if self.ipt6.is_some() {
            families.push(RouteFamily::V6);
        }
        families
    }

    /// Install the policy rules for the claimed pair. An `AlreadyExists`
    /// from the kernel means another writer took the pair between the scan
    /// and the install; the partial install is undone and the error
    /// propagated so the caller can retry with the next candidate.
    fn install_ip_rules(&self, inner: &mut LinkInner) -> Result<(), NetfilterError> {
        for family in self.families() {
            let rule = PolicyRule {
                mark: inner.mark,
                table: inner.table,
                family,
            };
            match self.route_ops.add_rule(&rule) {
                Ok(()) => inner.rules.push(rule),
                Err(err) => {
                    self.remove_ip_rules(inner);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn remove_ip_rules(&self, inner: &mut LinkInner) {
        for rule in inner.rules.drain(..) {
            if let Err(err) = self.route_ops.del_rule(&rule) {
                error!(mark = rule.mark, table = rule.table, %err, "failed to delete policy rule");
            }
        }
    }

    fn add_route_tolerant(&self, route: Route, slot: &mut Option<Route>) -> Result<(), NetfilterError> {
        match self.route_ops.add_route(&route) {
            Ok(()) | Err(NetfilterError::AlreadyExists(_)) => {
                *slot = Some(route);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Install the table's routes: a blackhole default per family, and the
    /// two half-defaults via the egress device when it exists and is up.
    /// A missing or down interface leaves the device routes for a later
    /// link event.
    fn install_ip_routes(&self, inner: &mut LinkInner) -> Result<(), NetfilterError> {
        let table = inner.table;

        if self.ipt4.is_some() {
            let default: Ipv4Net = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("/0 is valid");
            let mut slot0 = inner.routes_v4[0].take();
            self.add_route_tolerant(
                Route {
                    family: RouteFamily::V4,
                    dst: IpNet::V4(default),
                    table,
                    kind: RouteKind::Blackhole,
                },
                &mut slot0,
            )?;
            inner.routes_v4[0] = slot0;
        }
        if self.ipt6.is_some() {
            let default: Ipv6Net = Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0).expect("/0 is valid");
            let mut slot0 = inner.routes_v6[0].take();
            self.add_route_tolerant(
                Route {
                    family: RouteFamily::V6,
                    dst: IpNet::V6(default),
                    table,
                    kind: RouteKind::Blackhole,
                },
                &mut slot0,
            )?;
            inner.routes_v6[0] = slot0;
        }

        if self.iface_name == BLACKHOLE {
            return Ok(());
        }

        let Some(link) = self.route_ops.link_state(&self.iface_name)? else {
            warn!(iface = %self.iface_name, "interface not found, routes deferred to a link event");
            return Ok(());
        };
        if !link.up {
            warn!(iface = %self.iface_name, "interface is down, routes deferred to a link event");
            return Ok(());
        }

        if self.ipt4.is_some() {
            let halves = [
                Ipv4Net::new(Ipv4Addr::new(0, 0, 0, 0), 1).expect("/1 is valid"),
                Ipv4Net::new(Ipv4Addr::new(128, 0, 0, 0), 1).expect("/1 is valid"),
            ];
            for (slot, half) in (1..).zip(halves) {
                let mut taken = inner.routes_v4[slot].take();
                self.add_route_tolerant(
                    Route {
                        family: RouteFamily::V4,
                        dst: IpNet::V4(half),
                        table,
                        kind: RouteKind::Device(self.iface_name.clone()),
                    },
                    &mut taken,
                )?;
                inner.routes_v4[slot] = taken;
            }
        }
        if self.ipt6.is_some() {
            let halves = [
                Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 1).expect("/1 is valid"),
                Ipv6Net::new(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0), 1).expect("/1 is valid"),
            ];
            for (slot, half) in (1..).zip(halves) {
                let mut taken = inner.routes_v6[slot].take();
                self.add_route_tolerant(
                    Route {
                        family: RouteFamily::V6,
                        dst: IpNet::V6(half),
                        table,
                        kind: RouteKind::Device(self.iface_name.clone()),
                    },
                    &mut taken,
                )?;
                inner.routes_v6[slot] = taken;
            }
        }

        Ok(())
    }

    fn remove_ip_routes(&self, inner: &mut LinkInner) {
        for slot in (0..3).rev() {
            for routes in [&mut inner.routes_v4, &mut inner.routes_v6] {
                if let Some(route) = routes[slot].take() {
                    if let Err(err) = self.route_ops.del_route(&route) {
                        if !err.is_not_found() {
                            error!(dst = %route.dst, table = route.table, %err, "failed to delete route");
                        }
                    }
                }
            }
        }
    }

    fn set_name_for(&self, ipt: &IpTables) -> String {
        match ipt.proto() {
            super::iptables::Protocol::Ipv4 => format!("{}_4", self.set_name),
            super::iptables::Protocol::Ipv6 => format!("{}_6", self.set_name),
        }
    }

    /// Install (or re-issue) the owned chains and their jump stubs.
    /// `only_table` restricts the work to one table, for the refresh hook.
    fn install_iptables_rules(
        &self,
        ipt: &IpTables,
        mark: u32,
        only_table: Option<&str>,
    ) -> Result<(), NetfilterError> {
        let set_name = self.set_name_for(ipt);
        let set_name = set_name.as_str();
        let chain = self.chain_name.as_str();
        let iface = self.iface_name.as_str();
        let wants = |table: &str| only_table.is_none() || only_table == Some(table);

        if wants("filter") {
            ipt.register_chain_override("filter", chain);
            if iface != BLACKHOLE {
                ipt.append(
                    "filter",
                    chain,
                    Rule::new([
                        "-m", "set", "--match-set", set_name, "dst", "-o", iface, "-j", "ACCEPT",
                    ]),
                )?;
            }
            ipt.append("filter", "FORWARD", Rule::new(["-j", chain]))?;
        }

        if wants("mangle") {
            let mark_text = mark.to_string();
            ipt.register_chain_override("mangle", chain);
            ipt.append(
                "mangle",
                chain,
                Rule::new([
                    "-m", "set", "--match-set", set_name, "dst", "-j", "MARK", "--set-mark",
                    mark_text.as_str(),
                ]),
            )?;
            ipt.append(
                "mangle",
                chain,
                Rule::new([
                    "-m", "set", "--match-set", set_name, "dst", "-j", "CONNMARK", "--save-mark",
                ]),
            )?;
            ipt.append("mangle", "PREROUTING", Rule::new(["-j", chain]))?;
        }

        if wants("nat") {
            ipt.register_chain_override("nat", chain);
            ipt.append(
                "nat",
                chain,
                Rule::new(["-m", "set", "--match-set", set_name, "dst", "-j", "MASQUERADE"]),
            )?;
            ipt.append("nat", "POSTROUTING", Rule::new(["-j", chain]))?;
        }

        ipt.commit()
    }

    /// Queue removal of the owned chains and jump stubs, then commit.
    /// Absent chains and rules compile to nothing, so teardown of a
    /// half-installed state is safe.
    fn remove_iptables_rules(&self, ipt: &IpTables) -> Result<(), NetfilterError> {
        let chain = self.chain_name.as_str();
        let mut first_err = None;

        ipt.register_chain_delete("filter", chain);
        ipt.register_chain_delete("mangle", chain);
        ipt.register_chain_delete("nat", chain);

        for (table, builtin) in [
            ("filter", "FORWARD"),
            ("mangle", "PREROUTING"),
            ("nat", "POSTROUTING"),
        ] {
            if let Err(err) = ipt.delete(table, builtin, Rule::new(["-j", chain])) {
                error!(table, builtin, %err, "failed to queue jump removal");
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = ipt.commit() {
            error!(%err, "failed to commit chain teardown");
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn enable_inner(&self, inner: &mut LinkInner) -> Result<(), NetfilterError> {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        // Claim a (mark, table) pair. Another writer can take the candidate
        // between the scan and the install; retry with the next one.
        let mut from = self.start_index;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let idx = self.find_unused_index(from)?;
            inner.mark = idx;
            inner.table = idx;
            match self.install_ip_rules(inner) {
                Ok(()) => break,
                Err(err) if err.is_already_exists() && attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(index = idx, "mark/table candidate taken, retrying with next");
                    from = idx + 1;
                }
                Err(err) if err.is_already_exists() => {
                    return Err(NetfilterError::AllocationFailed { attempts: attempt });
                }
                Err(err) => return Err(err),
            }
        }

        self.install_ip_routes(inner)?;

        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            self.install_iptables_rules(ipt, inner.mark, None)?;
        }

        debug!(table = inner.table, mark = inner.mark, chain = %self.chain_name,
            "using routing table and mark");
        Ok(())
    }

    /// Bring the binding up. A failure rolls back whatever was installed
    /// and surfaces the error.
    pub fn enable(&self) -> Result<(), NetfilterError> {
        let mut inner = self.inner.lock();
        let result = self.enable_inner(&mut inner);
        if result.is_err() {
            let _ = self.disable_inner(&mut inner);
        }
        result
    }

    fn disable_inner(&self, inner: &mut LinkInner) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_err = None;
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            if let Err(err) = self.remove_iptables_rules(ipt) {
                first_err.get_or_insert(err);
            }
        }
        self.remove_ip_routes(inner);
        self.remove_ip_rules(inner);

        self.enabled.store(false, Ordering::SeqCst);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tear the binding down in reverse order of enable.
    pub fn disable(&self) -> Result<(), NetfilterError> {
        let mut inner = self.inner.lock();
        self.disable_inner(&mut inner)
    }

    /// Remove leftovers of a previous instance while the binding itself is
    /// not enabled. Used once before enable to clear residue.
    pub fn clear_if_disabled(&self) -> Result<(), NetfilterError> {
        let mut inner = self.inner.lock();
        if self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_err = None;
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            if let Err(err) = self.remove_iptables_rules(ipt) {
                first_err.get_or_insert(err);
            }
        }
        self.remove_ip_routes(&mut inner);
        self.remove_ip_rules(&mut inner);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// React to a link event for the egress interface by re-running the
    /// route step. Events for other interfaces are ignored.
    pub fn link_update_hook(&self, iface: &str) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) || iface != self.iface_name {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.install_ip_routes(&mut inner)
    }

    /// Re-issue the owned chains and jump stubs after an external agent
    /// reset firewall state. `table` restricts the refresh to one table.
    pub fn firewall_refresh_hook(&self, table: Option<&str>) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.lock();
        for ipt in [self.ipt4.as_deref(), self.ipt6.as_deref()].into_iter().flatten() {
            self.install_iptables_rules(ipt, inner.mark, table)?;
        }
        Ok(())
    }
}

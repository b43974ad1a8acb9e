//! Groups and reconciliation
//!
//! A group owns an ordered rule list and an egress binding. While enabled
//! it holds kernel resources (address sets, then the set-to-interface
//! binding); `sync` recomputes the desired set contents from the rules and
//! the records cache and applies the difference to the live sets.
//!
//! One mutex per group linearizes every mutating operation; an atomic
//! enabled flag lets hot read paths bail out without taking the lock.
//! Cross-group work never holds two group locks at once.

mod model;

pub use model::GroupModel;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::GroupError;
use crate::netfilter::{IpSet, IpsetToLink, NetfilterHelper, SetTimeout};
use crate::records::RecordsCache;
use crate::rules::RuleKind;

struct GroupInner {
    model: GroupModel,
    ipset: Option<IpSet>,
    link: Option<IpsetToLink>,
}

/// A rule group with its kernel bindings and reconciler.
pub struct Group {
    enabled: AtomicBool,
    inner: Mutex<GroupInner>,

    cache: Arc<RecordsCache>,
    netfilter: Arc<NetfilterHelper>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Group")
            .field("id", &inner.model.id)
            .field("name", &inner.model.name)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Group {
    /// Wrap a model with the runtime state it needs.
    #[must_use]
    pub fn new(
        model: GroupModel,
        cache: Arc<RecordsCache>,
        netfilter: Arc<NetfilterHelper>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: Mutex::new(GroupInner {
                model,
                ipset: None,
                link: None,
            }),
            cache,
            netfilter,
        }
    }

    /// Whether the group currently holds kernel bindings.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Snapshot of the group's model.
    #[must_use]
    pub fn model(&self) -> GroupModel {
        self.inner.lock().model.clone()
    }

    /// Group id without locking overhead concerns for callers.
    #[must_use]
    pub fn id(&self) -> crate::id::Id {
        self.inner.lock().model.id
    }

    /// Egress interface name.
    #[must_use]
    pub fn interface(&self) -> String {
        self.inner.lock().model.interface.clone()
    }

    /// Replace the rule list (API surface); the caller follows up with
    /// [`Group::sync`].
    pub fn set_rules(&self, rules: Vec<crate::rules::Rule>) {
        self.inner.lock().model.rules = rules;
    }

    fn enable_inner(&self, inner: &mut GroupInner) -> Result<(), GroupError> {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if !inner.model.enable {
            return Ok(());
        }

        let id_hex = inner.model.id.to_string();
        let ipset = self.netfilter.ipset(&id_hex);
        let link = self
            .netfilter
            .ipset_to_link(&id_hex, &inner.model.interface, &ipset);

        link.clear_if_disabled().map_err(GroupError::LinkSetup)?;
        ipset.enable().map_err(GroupError::IpsetSetup)?;
        inner.ipset = Some(ipset);

        link.enable().map_err(GroupError::LinkSetup)?;
        inner.link = Some(link);

        info!(group = %id_hex, name = %inner.model.name, iface = %inner.model.interface,
            "group enabled");
        Ok(())
    }

    /// Claim the group's kernel resources: address sets first, then the
    /// interface binding. A failure rolls back the partial enable and
    /// surfaces the error. Re-entrant.
    pub fn enable(&self) -> Result<(), GroupError> {
        let mut inner = self.inner.lock();
        let result = self.enable_inner(&mut inner);
        if result.is_err() {
            let _ = self.disable_inner(&mut inner);
        }
        result
    }

    fn disable_inner(&self, inner: &mut GroupInner) -> Result<(), GroupError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut first_err: Option<GroupError> = None;
        if let Some(link) = inner.link.take() {
            if let Err(err) = link.disable() {
                first_err.get_or_insert(GroupError::Teardown(err));
            }
        }
        if let Some(ipset) = inner.ipset.take() {
            if let Err(err) = ipset.disable() {
                first_err.get_or_insert(GroupError::Teardown(err));
            }
        }
        self.enabled.store(false, Ordering::SeqCst);

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release the kernel resources in reverse order. Re-entrant; returns
    /// the first teardown error after attempting everything.
    pub fn disable(&self) -> Result<(), GroupError> {
        let mut inner = self.inner.lock();
        self.disable_inner(&mut inner)
    }

    /// Fast-path insert of a single IPv4 address. No-op while disabled.
    pub fn add_subnet_v4(&self, subnet: Ipv4Net, ttl: SetTimeout) -> Result<(), GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(());
        }
        if let Some(ipset) = inner.ipset.as_ref() {
            ipset
                .add_subnet_v4(subnet, ttl)
                .map_err(GroupError::IpsetSetup)?;
        }
        Ok(())
    }

    /// Fast-path insert of a single IPv6 address. No-op while disabled.
    pub fn add_subnet_v6(&self, subnet: Ipv6Net, ttl: SetTimeout) -> Result<(), GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(());
        }
        if let Some(ipset) = inner.ipset.as_ref() {
            ipset
                .add_subnet_v6(subnet, ttl)
                .map_err(GroupError::IpsetSetup)?;
        }
        Ok(())
    }

    /// Best-effort insert of an observed address when any enabled rule
    /// matches any of the given names (the owner domain and everything
    /// aliasing it). Returns whether the address was inserted. Correctness
    /// is guaranteed by the next [`Group::sync`] either way.
    pub fn add_if_matched(
        &self,
        names: &[String],
        addr: IpAddr,
        ttl: u32,
    ) -> Result<bool, GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(false);
        }
        let matched = inner
            .model
            .rules
            .iter()
            .filter(|rule| rule.is_enabled())
            .any(|rule| names.iter().any(|name| rule.matches(name)));
        if !matched {
            return Ok(false);
        }
        let Some(ipset) = inner.ipset.as_ref() else {
            return Ok(false);
        };
        match addr {
            IpAddr::V4(v4) => ipset
                .add_subnet_v4(Ipv4Net::new(v4, 32).expect("/32 is valid"), Some(ttl))
                .map_err(GroupError::IpsetSetup)?,
            IpAddr::V6(v6) => ipset
                .add_subnet_v6(Ipv6Net::new(v6, 128).expect("/128 is valid"), Some(ttl))
                .map_err(GroupError::IpsetSetup)?,
        }
        Ok(true)
    }

    /// Re-run the interface route step after a link event for this group's
    /// egress interface.
    pub fn link_update_hook(&self, iface: &str) -> Result<(), GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(());
        }
        if let Some(link) = inner.link.as_ref() {
            link.link_update_hook(iface).map_err(GroupError::LinkSetup)?;
        }
        Ok(())
    }

    /// Re-issue chains after an external firewall reset.
    pub fn firewall_refresh_hook(&self, table: Option<&str>) -> Result<(), GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(());
        }
        if let Some(link) = inner.link.as_ref() {
            link.firewall_refresh_hook(table)
                .map_err(GroupError::LinkSetup)?;
        }
        Ok(())
    }

    /// Full reconciliation: compute the desired set contents from the
    /// enabled rules and the records cache, then apply the difference to
    /// the live sets. No-op while disabled.
    pub fn sync(&self) -> Result<(), GroupError> {
        let inner = self.inner.lock();
        if !self.is_enabled() || !inner.model.enable {
            return Ok(());
        }
        self.sync_inner(&inner)
    }

    fn sync_inner(&self, inner: &GroupInner) -> Result<(), GroupError> {
        let Some(ipset) = inner.ipset.as_ref() else {
            return Ok(());
        };

        let (desired_v4, desired_v6) = desired_state(&inner.model, &self.cache, Instant::now());

        let live_v4 = ipset.list_subnets_v4().map_err(GroupError::ListSets)?;
        apply_diff(
            &desired_v4,
            &live_v4,
            |subnet, ttl| ipset.add_subnet_v4(*subnet, ttl),
            |subnet| ipset.del_subnet_v4(*subnet),
        );

        let live_v6 = ipset.list_subnets_v6().map_err(GroupError::ListSets)?;
        apply_diff(
            &desired_v6,
            &live_v6,
            |subnet, ttl| ipset.add_subnet_v6(*subnet, ttl),
            |subnet| ipset.del_subnet_v6(*subnet),
        );

        Ok(())
    }
}

/// Merge an entry into a desired map: `None` beats `Some`, larger TTL beats
/// smaller.
fn merge_desired<K: std::hash::Hash + Eq>(map: &mut HashMap<K, SetTimeout>, key: K, ttl: SetTimeout) {
    match (map.get(&key), ttl) {
        (Some(None), _) => {}
        (Some(Some(old)), Some(new)) if new <= *old => {}
        _ => {
            map.insert(key, ttl);
        }
    }
}

/// Compute the desired v4/v6 subnet maps for a group's enabled rules in
/// declaration order.
fn desired_state(
    model: &GroupModel,
    cache: &RecordsCache,
    now: Instant,
) -> (
    HashMap<Ipv4Net, SetTimeout>,
    HashMap<Ipv6Net, SetTimeout>,
) {
    let mut v4: HashMap<Ipv4Net, SetTimeout> = HashMap::new();
    let mut v6: HashMap<Ipv6Net, SetTimeout> = HashMap::new();
    let known_domains = cache.list_known_domains();

    for rule in &model.rules {
        if !rule.is_enabled() {
            continue;
        }
        match rule.kind {
            RuleKind::Subnet => {
                let Some(net) = parse_subnet_v4(&rule.rule) else {
                    continue;
                };
                // Some platforms refuse an all-zeros set entry; expand the
                // default route into the two halves.
                if net.prefix_len() == 0 {
                    for half in split_default_v4() {
                        v4.insert(half, None);
                    }
                } else {
                    v4.insert(net, None);
                }
            }
            RuleKind::Subnet6 => {
                let Some(net) = parse_subnet_v6(&rule.rule) else {
                    continue;
                };
                if net.prefix_len() == 0 {
                    for half in split_default_v6() {
                        v6.insert(half, None);
                    }
                } else {
                    v6.insert(net, None);
                }
            }
            _ => {
                for domain in &known_domains {
                    if !rule.matches(domain) {
                        continue;
                    }
                    for record in cache.get_addresses(domain) {
                        let ttl = record.remaining_ttl(now);
                        if ttl == 0 {
                            continue;
                        }
                        match record.addr {
                            IpAddr::V4(addr) => merge_desired(
                                &mut v4,
                                Ipv4Net::new(addr, 32).expect("/32 is valid"),
                                Some(ttl),
                            ),
                            IpAddr::V6(addr) => merge_desired(
                                &mut v6,
                                Ipv6Net::new(addr, 128).expect("/128 is valid"),
                                Some(ttl),
                            ),
                        }
                    }
                }
            }
        }
    }

    (v4, v6)
}

/// The two half-default IPv4 prefixes standing in for `0.0.0.0/0`.
fn split_default_v4() -> [Ipv4Net; 2] {
    [
        Ipv4Net::new(std::net::Ipv4Addr::new(0, 0, 0, 0), 1).expect("/1 is valid"),
        Ipv4Net::new(std::net::Ipv4Addr::new(128, 0, 0, 0), 1).expect("/1 is valid"),
    ]
}

/// The two half-default IPv6 prefixes standing in for `::/0`.
fn split_default_v6() -> [Ipv6Net; 2] {
    [
        Ipv6Net::new(std::net::Ipv6Addr::UNSPECIFIED, 1).expect("/1 is valid"),
        Ipv6Net::new(std::net::Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0), 1)
            .expect("/1 is valid"),
    ]
}

/// Parse a subnet rule pattern: CIDR, or a bare address implying /32.
/// Malformed values yield `None` and the rule contributes nothing.
fn parse_subnet_v4(pattern: &str) -> Option<Ipv4Net> {
    if let Ok(net) = pattern.parse::<Ipv4Net>() {
        return Some(net.trunc());
    }
    pattern
        .parse::<std::net::Ipv4Addr>()
        .ok()
        .map(|addr| Ipv4Net::new(addr, 32).expect("/32 is valid"))
}

/// Parse a subnet6 rule pattern: CIDR, or a bare address implying /128.
fn parse_subnet_v6(pattern: &str) -> Option<Ipv6Net> {
    if let Ok(net) = pattern.parse::<Ipv6Net>() {
        return Some(net.trunc());
    }
    pattern
        .parse::<std::net::Ipv6Addr>()
        .ok()
        .map(|addr| Ipv6Net::new(addr, 128).expect("/128 is valid"))
}

/// Apply the desired-vs-live difference for one family. Per-subnet failures
/// are logged and do not abort the sweep.
fn apply_diff<K, A, D>(
    desired: &HashMap<K, SetTimeout>,
    live: &HashMap<K, SetTimeout>,
    add: A,
    del: D,
) where
    K: std::hash::Hash + Eq + std::fmt::Display,
    A: Fn(&K, SetTimeout) -> Result<(), crate::error::NetfilterError>,
    D: Fn(&K) -> Result<(), crate::error::NetfilterError>,
{
    for (subnet, ttl) in desired {
        if let Some(live_ttl) = live.get(subnet) {
            let keep = match (live_ttl, ttl) {
                // A permanent live entry beats any refresh.
                (None, _) => true,
                // An upgrade to permanent always applies.
                (Some(_), None) => false,
                // Both finite: only a strictly larger deadline refreshes.
                (Some(live), Some(new)) => new <= live,
            };
            if keep {
                continue;
            }
        }
        match add(subnet, *ttl) {
            Ok(()) => debug!(%subnet, ?ttl, "added subnet"),
            Err(err) => error!(%subnet, %err, "failed to add subnet"),
        }
    }

    for subnet in live.keys() {
        if desired.contains_key(subnet) {
            continue;
        }
        match del(subnet) {
            Ok(()) => debug!(%subnet, "deleted subnet"),
            Err(err) => warn!(%subnet, %err, "failed to delete subnet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::netfilter::ipset::FakeIpsetBackend;
    use crate::netfilter::iptables::{FakeBackend, IpTables, Protocol};
    use crate::netfilter::route::FakeRouteOps;
    use crate::rules::Rule;
    use std::time::Duration;

    fn v4net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    struct Fixture {
        cache: Arc<RecordsCache>,
        route_ops: Arc<FakeRouteOps>,
        netfilter: Arc<NetfilterHelper>,
    }

    fn fixture() -> Fixture {
        let backend4 = Arc::new(FakeBackend::new(Protocol::Ipv4));
        backend4.set_initial_rules("filter", "FORWARD", []);
        backend4.set_initial_rules("mangle", "PREROUTING", []);
        backend4.set_initial_rules("nat", "PREROUTING", []);
        backend4.set_initial_rules("nat", "POSTROUTING", []);
        let ipt4 = Arc::new(IpTables::new(backend4));

        let route_ops = Arc::new(FakeRouteOps::new());
        route_ops.set_link("wg0", 3, true);

        let netfilter = Arc::new(NetfilterHelper::with_backends(
            "MR_".into(),
            "mr_".into(),
            100,
            Some(ipt4),
            None,
            Arc::new(FakeIpsetBackend::new()),
            route_ops.clone(),
        ));
        netfilter.register_builtin_chains();

        Fixture {
            cache: Arc::new(RecordsCache::new()),
            route_ops,
            netfilter,
        }
    }

    fn group_with_rules(fx: &Fixture, rules: Vec<Rule>) -> Group {
        let model = GroupModel {
            id: Id::new([0xab, 0x01, 0xcd, 0x23]),
            name: "streaming".into(),
            color: "#30a0c0".into(),
            interface: "wg0".into(),
            enable: true,
            rules,
        };
        Group::new(model, fx.cache.clone(), fx.netfilter.clone())
    }

    fn namespace_rule(pattern: &str) -> Rule {
        Rule::new(Id::new([0, 0, 0, 1]), "ns", RuleKind::Namespace, pattern)
    }

    fn subnet_rule(pattern: &str) -> Rule {
        Rule::new(Id::new([0, 0, 0, 2]), "net", RuleKind::Subnet, pattern)
    }

    #[test]
    fn test_enable_claims_bindings_in_order() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![]);
        group.enable().unwrap();
        assert!(group.is_enabled());
        assert_eq!(fx.route_ops.rules().len(), 1);

        group.disable().unwrap();
        assert!(!group.is_enabled());
        assert!(fx.route_ops.rules().is_empty());
    }

    #[test]
    fn test_disabled_model_claims_nothing() {
        let fx = fixture();
        let mut model = group_with_rules(&fx, vec![]).model();
        model.enable = false;
        let group = Group::new(model, fx.cache.clone(), fx.netfilter.clone());
        group.enable().unwrap();
        // Runtime flag is set, but no kernel state was claimed.
        assert!(fx.route_ops.rules().is_empty());
    }

    #[test]
    fn test_sync_populates_from_cache() {
        let fx = fixture();
        fx.cache
            .add_address("www.example.com", "100.64.0.2".parse().unwrap(), 120);
        fx.cache
            .add_address("other.net", "100.64.0.9".parse().unwrap(), 120);

        let group = group_with_rules(&fx, vec![namespace_rule("example.com")]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert_eq!(live.len(), 1);
        let (subnet, ttl) = live.iter().next().unwrap();
        assert_eq!(*subnet, v4net("100.64.0.2/32"));
        let ttl = ttl.expect("finite ttl");
        assert!(ttl > 0 && ttl <= 120);
    }

    #[test]
    fn test_sync_subnet_rules_are_permanent() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![subnet_rule("10.0.0.0/24")]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert_eq!(live[&v4net("10.0.0.0/24")], None);
    }

    #[test]
    fn test_sync_expands_default_route() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![subnet_rule("0.0.0.0/0")]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[&v4net("0.0.0.0/1")], None);
        assert_eq!(live[&v4net("128.0.0.0/1")], None);
    }

    #[test]
    fn test_sync_bare_address_implies_host_prefix() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![subnet_rule("192.0.2.7")]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert!(live.contains_key(&v4net("192.0.2.7/32")));
    }

    #[test]
    fn test_sync_ignores_malformed_subnets() {
        let fx = fixture();
        let group = group_with_rules(
            &fx,
            vec![subnet_rule("not-a-subnet"), subnet_rule("10.1.0.0/24")],
        );
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_sync_removes_stale_and_upgrades_to_permanent() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![subnet_rule("10.0.0.0/24")]);
        group.enable().unwrap();

        // Live state diverges: the desired subnet has a finite timeout, and
        // a stale entry lingers.
        {
            let inner = group.inner.lock();
            let ipset = inner.ipset.as_ref().unwrap();
            ipset.add_subnet_v4(v4net("10.0.0.0/24"), Some(60)).unwrap();
            ipset.add_subnet_v4(v4net("10.0.1.0/24"), Some(120)).unwrap();
        }

        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[&v4net("10.0.0.0/24")], None);
    }

    #[test]
    fn test_sync_is_monotonic() {
        let fx = fixture();
        fx.cache
            .add_address("www.example.com", "100.64.0.2".parse().unwrap(), 600);
        let group = group_with_rules(
            &fx,
            vec![namespace_rule("example.com"), subnet_rule("10.0.0.0/24")],
        );
        group.enable().unwrap();
        group.sync().unwrap();

        let first = {
            let inner = group.inner.lock();
            inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap()
        };
        group.sync().unwrap();
        let second = {
            let inner = group.inner.lock();
            inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap()
        };

        // Same subnets; the permanent entry untouched and the finite entry
        // not refreshed upward by the second pass.
        assert_eq!(first.keys().collect::<std::collections::HashSet<_>>(),
                   second.keys().collect::<std::collections::HashSet<_>>());
        assert_eq!(second[&v4net("10.0.0.0/24")], None);
        assert!(second[&v4net("100.64.0.2/32")].unwrap() <= first[&v4net("100.64.0.2/32")].unwrap());
    }

    #[test]
    fn test_sync_skips_disabled_rules() {
        let fx = fixture();
        let mut rule = subnet_rule("10.0.0.0/24");
        rule.enable = false;
        let group = group_with_rules(&fx, vec![rule]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        assert!(inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap().is_empty());
    }

    #[test]
    fn test_sync_via_alias_chain() {
        let fx = fixture();
        fx.cache.add_alias("www.example.com", "front.cdn.net", 300);
        fx.cache
            .add_address("front.cdn.net", "100.64.0.2".parse().unwrap(), 300);

        let group = group_with_rules(&fx, vec![namespace_rule("example.com")]);
        group.enable().unwrap();
        group.sync().unwrap();

        let inner = group.inner.lock();
        let live = inner.ipset.as_ref().unwrap().list_subnets_v4().unwrap();
        assert!(live.contains_key(&v4net("100.64.0.2/32")),
            "rule matches www.example.com, whose addresses resolve through the alias");
    }

    #[test]
    fn test_merge_keeps_larger_ttl_and_none_wins() {
        let mut map: HashMap<Ipv4Net, SetTimeout> = HashMap::new();
        let key = v4net("1.1.1.1/32");
        merge_desired(&mut map, key, Some(60));
        merge_desired(&mut map, key, Some(30));
        assert_eq!(map[&key], Some(60));
        merge_desired(&mut map, key, Some(90));
        assert_eq!(map[&key], Some(90));
        merge_desired(&mut map, key, None);
        assert_eq!(map[&key], None);
        merge_desired(&mut map, key, Some(3600));
        assert_eq!(map[&key], None);
    }

    #[test]
    fn test_fast_path_noop_when_disabled() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![]);
        group
            .add_subnet_v4(v4net("100.64.0.2/32"), Some(60))
            .unwrap();
        // Nothing was claimed, nothing inserted.
        assert!(!group.is_enabled());
    }

    #[test]
    fn test_link_hook_reinstalls_routes() {
        let fx = fixture();
        let group = group_with_rules(&fx, vec![]);
        group.enable().unwrap();
        let initial = fx.route_ops.routes().len();

        group.link_update_hook("wg0").unwrap();
        assert_eq!(fx.route_ops.routes().len(), initial);
    }

    #[test]
    fn test_address_ttl_expiry_excluded_from_desired() {
        let fx = fixture();
        fx.cache
            .add_address("www.example.com", "100.64.0.2".parse().unwrap(), 0);

        let model = GroupModel {
            id: Id::new([1, 2, 3, 4]),
            name: "g".into(),
            color: String::new(),
            interface: "wg0".into(),
            enable: true,
            rules: vec![namespace_rule("example.com")],
        };
        let (v4, _) = desired_state(&model, &fx.cache, Instant::now() + Duration::from_secs(1));
        assert!(v4.is_empty());
    }
}

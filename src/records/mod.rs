//! Records cache
//!
//! In-memory graph of observed DNS answers: per-domain address lists (A and
//! AAAA side by side), per-domain CNAME aliases, and a reverse alias index
//! for transitive "who points at me" queries. Entries expire on an absolute
//! deadline; a background sweep removes them, while lookups merely filter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default interval of the background expiry sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// An observed A/AAAA record: the literal address plus its expiry deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    /// The literal v4 or v6 address
    pub addr: IpAddr,
    /// Absolute expiry deadline
    pub deadline: Instant,
}

impl AddressRecord {
    /// Seconds until the deadline, clamped to zero once passed.
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        u32::try_from(self.deadline.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone)]
struct AliasRecord {
    target: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    addresses: HashMap<String, Vec<AddressRecord>>,
    aliases: HashMap<String, AliasRecord>,
    // target domain -> domains that alias to it
    reverse_aliases: HashMap<String, Vec<String>>,
}

impl Inner {
    fn remove_reverse_alias(&mut self, target: &str, owner: &str) {
        if let Some(owners) = self.reverse_aliases.get_mut(target) {
            if let Some(pos) = owners.iter().position(|d| d == owner) {
                owners.swap_remove(pos);
            }
            if owners.is_empty() {
                self.reverse_aliases.remove(target);
            }
        }
    }
}

/// Concurrent cache of address and alias observations.
#[derive(Debug, Default)]
pub struct RecordsCache {
    inner: RwLock<Inner>,
}

impl RecordsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address for `owner` with the given TTL.
    ///
    /// If the owner already holds this exact address the deadline is
    /// extended; otherwise the address is appended. Addresses are never
    /// deduplicated across families.
    pub fn add_address(&self, owner: &str, addr: IpAddr, ttl_secs: u32) {
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl_secs));
        let mut inner = self.inner.write();

        let records = inner.addresses.entry(owner.to_string()).or_default();
        if let Some(existing) = records.iter_mut().find(|r| r.addr == addr) {
            existing.deadline = deadline;
            return;
        }
        records.push(AddressRecord { addr, deadline });
    }

    /// Record that `owner` is an alias for `target`.
    ///
    /// A self-alias is silently rejected. Any prior alias for `owner` is
    /// replaced, with the reverse index updated to drop the old back-link
    /// before the new one is installed.
    pub fn add_alias(&self, owner: &str, target: &str, ttl_secs: u32) {
        if owner == target {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl_secs));
        let mut inner = self.inner.write();

        if let Some(old) = inner.aliases.get(owner).map(|a| a.target.clone()) {
            inner.remove_reverse_alias(&old, owner);
        }

        inner.aliases.insert(
            owner.to_string(),
            AliasRecord {
                target: target.to_string(),
                deadline,
            },
        );
        inner
            .reverse_aliases
            .entry(target.to_string())
            .or_default()
            .push(owner.to_string());
    }

    /// Resolve `owner` to its non-expired addresses, following the alias
    /// chain when the owner has none of its own.
    ///
    /// An expired alias hop, or a hop that re-enters a domain already
    /// visited, yields an empty result.
    #[must_use]
    pub fn get_addresses(&self, owner: &str) -> Vec<AddressRecord> {
        let inner = self.inner.read();
        let now = Instant::now();

        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = owner;
        seen.insert(current);

        loop {
            if let Some(records) = inner.addresses.get(current) {
                let valid: Vec<AddressRecord> = records
                    .iter()
                    .filter(|r| r.deadline > now)
                    .copied()
                    .collect();
                if !valid.is_empty() {
                    return valid;
                }
            }

            let Some(alias) = inner.aliases.get(current) else {
                return Vec::new();
            };
            if alias.deadline <= now {
                return Vec::new();
            }
            // Cycle guard.
            if !seen.insert(alias.target.as_str()) {
                return Vec::new();
            }
            current = alias.target.as_str();
        }
    }

    /// All domains that directly or transitively alias to `owner`, plus
    /// `owner` itself. Iterative breadth-first walk over the reverse index,
    /// safe for arbitrarily deep chains.
    #[must_use]
    pub fn get_aliases(&self, owner: &str) -> Vec<String> {
        let inner = self.inner.read();

        let mut result = vec![owner.to_string()];
        let mut queue: VecDeque<&str> = VecDeque::from([owner]);
        let mut seen: HashSet<&str> = HashSet::from([owner]);

        while let Some(current) = queue.pop_front() {
            if let Some(pointing) = inner.reverse_aliases.get(current) {
                for domain in pointing {
                    if seen.insert(domain.as_str()) {
                        result.push(domain.clone());
                        queue.push_back(domain.as_str());
                    }
                }
            }
        }

        result
    }

    /// Snapshot of every domain present in the address or alias map.
    #[must_use]
    pub fn list_known_domains(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut domains: HashSet<&String> = inner.addresses.keys().collect();
        domains.extend(inner.aliases.keys());
        domains.into_iter().cloned().collect()
    }

    /// Drop expired addresses (deleting emptied owners) and expired aliases
    /// together with their reverse links.
    pub fn cleanup(&self) {
        let mut inner = self.inner.write();
        let now = Instant::now();

        inner.addresses.retain(|_, records| {
            records.retain(|r| r.deadline > now);
            !records.is_empty()
        });

        let expired: Vec<(String, String)> = inner
            .aliases
            .iter()
            .filter(|(_, alias)| alias.deadline <= now)
            .map(|(owner, alias)| (owner.clone(), alias.target.clone()))
            .collect();
        for (owner, target) in expired {
            inner.remove_reverse_alias(&target, &owner);
            inner.aliases.remove(&owner);
        }

        trace!(
            addresses = inner.addresses.len(),
            aliases = inner.aliases.len(),
            "records cleanup pass"
        );
    }

    /// Spawn the background sweep, running every `interval` until the token
    /// is cancelled.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the sweep cadence
            // starts one interval from now.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.cleanup(),
                    () = token.cancelled() => {
                        debug!("records cleanup task stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(s: &str) -> IpAddr {
        IpAddr::V4(s.parse::<Ipv4Addr>().unwrap())
    }

    fn v6(s: &str) -> IpAddr {
        IpAddr::V6(s.parse::<Ipv6Addr>().unwrap())
    }

    #[test]
    fn test_add_and_get_address() {
        let cache = RecordsCache::new();
        cache.add_address("example.com", v4("1.2.3.4"), 60);

        let records = cache.get_addresses("example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, v4("1.2.3.4"));
    }

    #[test]
    fn test_add_address_extends_deadline() {
        let cache = RecordsCache::new();
        cache.add_address("example.com", v4("1.2.3.4"), 1);
        let first = cache.get_addresses("example.com")[0].deadline;
        cache.add_address("example.com", v4("1.2.3.4"), 600);
        let records = cache.get_addresses("example.com");
        assert_eq!(records.len(), 1, "same address must not duplicate");
        assert!(records[0].deadline > first);
    }

    #[test]
    fn test_families_kept_side_by_side() {
        let cache = RecordsCache::new();
        cache.add_address("example.com", v4("1.2.3.4"), 60);
        cache.add_address("example.com", v6("2001:db8::1"), 60);
        assert_eq!(cache.get_addresses("example.com").len(), 2);
    }

    #[test]
    fn test_expired_address_not_returned() {
        let cache = RecordsCache::new();
        cache.add_address("example.com", v4("1.2.3.4"), 0);
        assert!(cache.get_addresses("example.com").is_empty());
    }

    #[test]
    fn test_self_alias_rejected() {
        let cache = RecordsCache::new();
        cache.add_alias("example.com", "example.com", 60);
        assert_eq!(cache.get_aliases("example.com"), vec!["example.com"]);
        assert!(cache.list_known_domains().is_empty());
    }

    #[test]
    fn test_alias_resolution() {
        let cache = RecordsCache::new();
        cache.add_alias("www.example.com", "front.cdn.net", 60);
        cache.add_address("front.cdn.net", v4("100.64.0.2"), 60);

        let records = cache.get_addresses("www.example.com");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, v4("100.64.0.2"));
    }

    #[test]
    fn test_alias_chain_resolution() {
        let cache = RecordsCache::new();
        cache.add_alias("a.example.com", "b.example.com", 60);
        cache.add_alias("b.example.com", "c.example.com", 60);
        cache.add_address("c.example.com", v4("9.9.9.9"), 60);
        assert_eq!(cache.get_addresses("a.example.com")[0].addr, v4("9.9.9.9"));
    }

    #[test]
    fn test_expired_alias_hop_is_empty() {
        let cache = RecordsCache::new();
        cache.add_alias("www.example.com", "front.cdn.net", 0);
        cache.add_address("front.cdn.net", v4("100.64.0.2"), 60);
        assert!(cache.get_addresses("www.example.com").is_empty());
    }

    #[test]
    fn test_alias_cycle_is_empty() {
        let cache = RecordsCache::new();
        cache.add_alias("a.example.com", "b.example.com", 60);
        cache.add_alias("b.example.com", "a.example.com", 60);
        assert!(cache.get_addresses("a.example.com").is_empty());
    }

    #[test]
    fn test_reverse_aliases_transitive() {
        let cache = RecordsCache::new();
        cache.add_alias("www.example.com", "front.cdn.net", 60);
        cache.add_alias("m.example.com", "www.example.com", 60);

        let mut aliases = cache.get_aliases("front.cdn.net");
        aliases.sort();
        assert_eq!(
            aliases,
            vec!["front.cdn.net", "m.example.com", "www.example.com"]
        );
    }

    #[test]
    fn test_get_aliases_always_contains_owner() {
        let cache = RecordsCache::new();
        assert_eq!(cache.get_aliases("unknown.example"), vec!["unknown.example"]);
    }

    #[test]
    fn test_alias_replacement_fixes_reverse_index() {
        let cache = RecordsCache::new();
        cache.add_alias("www.example.com", "old.cdn.net", 60);
        cache.add_alias("www.example.com", "new.cdn.net", 60);

        assert_eq!(cache.get_aliases("old.cdn.net"), vec!["old.cdn.net"]);
        let mut aliases = cache.get_aliases("new.cdn.net");
        aliases.sort();
        assert_eq!(aliases, vec!["new.cdn.net", "www.example.com"]);
    }

    #[test]
    fn test_deep_alias_chain_no_overflow() {
        let cache = RecordsCache::new();
        for i in 0..10_000 {
            cache.add_alias(&format!("d{i}.example"), &format!("d{}.example", i + 1), 600);
        }
        let aliases = cache.get_aliases("d10000.example");
        assert_eq!(aliases.len(), 10_001);
    }

    #[test]
    fn test_list_known_domains_union() {
        let cache = RecordsCache::new();
        cache.add_address("a.example", v4("1.1.1.1"), 60);
        cache.add_alias("b.example", "c.example", 60);

        let mut domains = cache.list_known_domains();
        domains.sort();
        assert_eq!(domains, vec!["a.example", "b.example"]);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let cache = RecordsCache::new();
        cache.add_address("gone.example", v4("1.1.1.1"), 0);
        cache.add_address("kept.example", v4("2.2.2.2"), 600);
        cache.add_alias("stale.example", "gone.example", 0);
        cache.add_alias("fresh.example", "kept.example", 600);

        cache.cleanup();

        let mut domains = cache.list_known_domains();
        domains.sort();
        assert_eq!(domains, vec!["fresh.example", "kept.example"]);
        // Reverse link of the expired alias is gone too.
        assert_eq!(cache.get_aliases("gone.example"), vec!["gone.example"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_cancel() {
        let cache = Arc::new(RecordsCache::new());
        let token = CancellationToken::new();
        let handle = cache.clone().spawn_cleanup(Duration::from_secs(30), token.clone());

        token.cancel();
        handle.await.unwrap();
    }
}

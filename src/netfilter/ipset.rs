//! Address-set binding
//!
//! Every group owns a pair of `hash:net` sets, one per address family,
//! named `<prefix><group_id_hex>_4` / `_6`. Entries carry per-entry
//! timeouts; a `None` timeout is encoded as timeout 0 (no expiry) at the
//! set level and decoded back to `None` on listing.

use std::collections::HashMap;
use std::process::Command as Process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::NetfilterError;

/// Per-entry timeout in seconds; `None` means no expiry.
pub type SetTimeout = Option<u32>;

/// Default per-set timeout applied when an add does not override it.
pub const DEFAULT_SET_TIMEOUT: u32 = 300;

/// Address family of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFamily {
    /// `family inet`
    Inet,
    /// `family inet6`
    Inet6,
}

/// Kernel seam for address-set manipulation.
///
/// Timeouts cross this boundary raw: 0 means no expiry.
pub trait IpsetBackend: Send + Sync {
    /// Create a `hash:net` set with the given default timeout.
    fn create(&self, name: &str, family: SetFamily, default_timeout: u32)
        -> Result<(), NetfilterError>;

    /// Destroy a set. Returns [`NetfilterError::NotFound`] when absent.
    fn destroy(&self, name: &str) -> Result<(), NetfilterError>;

    /// Upsert an entry with the given timeout.
    fn add(&self, name: &str, entry: IpNet, timeout: u32) -> Result<(), NetfilterError>;

    /// Remove an entry. Missing entries surface as errors.
    fn del(&self, name: &str, entry: IpNet) -> Result<(), NetfilterError>;

    /// Enumerate entries with their raw timeouts.
    fn list(&self, name: &str) -> Result<Vec<(IpNet, u32)>, NetfilterError>;
}

/// Backend driving the host's `ipset` executable.
#[derive(Debug, Default)]
pub struct ExecIpsetBackend;

impl ExecIpsetBackend {
    fn run(args: &[&str]) -> Result<Vec<u8>, NetfilterError> {
        let output = Process::new("ipset").args(args).output()?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = if stderr.contains("does not exist") {
            NetfilterError::NotFound(format!("set {}", args.get(1).unwrap_or(&"?")))
        } else {
            NetfilterError::command_failed(
                "ipset",
                output.status.code().unwrap_or(-1),
                stderr.trim(),
            )
        };
        Err(err)
    }
}

impl IpsetBackend for ExecIpsetBackend {
    fn create(
        &self,
        name: &str,
        family: SetFamily,
        default_timeout: u32,
    ) -> Result<(), NetfilterError> {
        let family = match family {
            SetFamily::Inet => "inet",
            SetFamily::Inet6 => "inet6",
        };
        let timeout = default_timeout.to_string();
        Self::run(&[
            "create", name, "hash:net", "family", family, "timeout", &timeout,
        ])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), NetfilterError> {
        Self::run(&["destroy", name])?;
        Ok(())
    }

    fn add(&self, name: &str, entry: IpNet, timeout: u32) -> Result<(), NetfilterError> {
        let entry = entry.to_string();
        let timeout = timeout.to_string();
        Self::run(&["add", name, &entry, "timeout", &timeout, "-exist"])?;
        Ok(())
    }

    fn del(&self, name: &str, entry: IpNet) -> Result<(), NetfilterError> {
        let entry = entry.to_string();
        Self::run(&["del", name, &entry])?;
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<(IpNet, u32)>, NetfilterError> {
        let output = Self::run(&["list", name, "-output", "save"])?;
        let text = String::from_utf8_lossy(&output);
        let mut entries = Vec::new();
        for line in text.lines() {
            // save format: "add <set> <cidr> timeout <secs>"
            let mut parts = line.split_whitespace();
            if parts.next() != Some("add") {
                continue;
            }
            let _set = parts.next();
            let Some(cidr) = parts.next() else { continue };
            let net: IpNet = if let Ok(net) = cidr.parse() {
                net
            } else if let Ok(addr) = cidr.parse::<std::net::IpAddr>() {
                IpNet::from(addr)
            } else {
                return Err(NetfilterError::parse(format!("bad set entry {cidr:?}")));
            };
            let mut timeout = 0u32;
            if parts.next() == Some("timeout") {
                timeout = parts
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| NetfilterError::parse("bad timeout in set entry"))?;
            }
            entries.push((net, timeout));
        }
        Ok(entries)
    }
}

/// In-memory address-set backend for tests.
#[derive(Debug, Default)]
pub struct FakeIpsetBackend {
    sets: Mutex<HashMap<String, HashMap<IpNet, u32>>>,
}

impl FakeIpsetBackend {
    /// Create an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a set exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.sets.lock().contains_key(name)
    }
}

impl IpsetBackend for FakeIpsetBackend {
    fn create(
        &self,
        name: &str,
        _family: SetFamily,
        _default_timeout: u32,
    ) -> Result<(), NetfilterError> {
        let mut sets = self.sets.lock();
        if sets.contains_key(name) {
            return Err(NetfilterError::AlreadyExists(format!("set {name}")));
        }
        sets.insert(name.to_string(), HashMap::new());
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), NetfilterError> {
        self.sets
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| NetfilterError::NotFound(format!("set {name}")))
    }

    fn add(&self, name: &str, entry: IpNet, timeout: u32) -> Result<(), NetfilterError> {
        let mut sets = self.sets.lock();
        let set = sets
            .get_mut(name)
            .ok_or_else(|| NetfilterError::NotFound(format!("set {name}")))?;
        set.insert(entry, timeout);
        Ok(())
    }

    fn del(&self, name: &str, entry: IpNet) -> Result<(), NetfilterError> {
        let mut sets = self.sets.lock();
        let set = sets
            .get_mut(name)
            .ok_or_else(|| NetfilterError::NotFound(format!("set {name}")))?;
        set.remove(&entry)
            .map(|_| ())
            .ok_or_else(|| NetfilterError::NotFound(format!("entry {entry} in {name}")))
    }

    fn list(&self, name: &str) -> Result<Vec<(IpNet, u32)>, NetfilterError> {
        let sets = self.sets.lock();
        let set = sets
            .get(name)
            .ok_or_else(|| NetfilterError::NotFound(format!("set {name}")))?;
        Ok(set.iter().map(|(net, t)| (*net, *t)).collect())
    }
}

/// A group's pair of address sets with an enable/disable lifecycle.
///
/// All operations silently no-op while the binding is disabled. A disabled
/// family (global config) makes its half of every operation a no-op too.
pub struct IpSet {
    enabled: AtomicBool,
    locker: Mutex<()>,

    set_name: String,
    ipv4: bool,
    ipv6: bool,
    backend: Arc<dyn IpsetBackend>,
}

impl std::fmt::Debug for IpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpSet")
            .field("set_name", &self.set_name)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl IpSet {
    /// Create a disabled binding over `<set_name>_4` / `<set_name>_6`.
    #[must_use]
    pub fn new(set_name: String, ipv4: bool, ipv6: bool, backend: Arc<dyn IpsetBackend>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            locker: Mutex::new(()),
            set_name,
            ipv4,
            ipv6,
            backend,
        }
    }

    /// Base name; the family suffix is appended per set.
    #[must_use]
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Name of the IPv4 set.
    #[must_use]
    pub fn name_v4(&self) -> String {
        format!("{}_4", self.set_name)
    }

    /// Name of the IPv6 set.
    #[must_use]
    pub fn name_v6(&self) -> String {
        format!("{}_6", self.set_name)
    }

    fn destroy_residual(&self) -> Result<(), NetfilterError> {
        for name in [self.name_v4(), self.name_v6()] {
            match self.backend.destroy(&name) {
                Ok(()) => debug!(set = %name, "destroyed residual set"),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn enable_inner(&self) -> Result<(), NetfilterError> {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        self.destroy_residual()?;

        if self.ipv4 {
            self.backend
                .create(&self.name_v4(), SetFamily::Inet, DEFAULT_SET_TIMEOUT)?;
        }
        if self.ipv6 {
            self.backend
                .create(&self.name_v6(), SetFamily::Inet6, DEFAULT_SET_TIMEOUT)?;
        }
        Ok(())
    }

    /// Destroy any residual sets with the same names, then create both.
    ///
    /// # Errors
    ///
    /// Creation failure is fatal for the binding; the caller rolls back via
    /// [`IpSet::disable`].
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
        let result = self.destroy_residual();
        self.enabled.store(false, Ordering::SeqCst);
        result
    }

    /// Destroy both sets; missing sets are not an error.
    pub fn disable(&self) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        self.disable_inner()
    }

    /// Upsert an IPv4 entry. `None` timeout means no expiry.
    pub fn add_subnet_v4(&self, subnet: Ipv4Net, timeout: SetTimeout) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv4 {
            return Ok(());
        }
        self.backend
            .add(&self.name_v4(), IpNet::V4(subnet), timeout.unwrap_or(0))
    }

    /// Upsert an IPv6 entry. `None` timeout means no expiry.
    pub fn add_subnet_v6(&self, subnet: Ipv6Net, timeout: SetTimeout) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv6 {
            return Ok(());
        }
        self.backend
            .add(&self.name_v6(), IpNet::V6(subnet), timeout.unwrap_or(0))
    }

    /// Remove an IPv4 entry; a missing entry surfaces as an error.
    pub fn del_subnet_v4(&self, subnet: Ipv4Net) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv4 {
            return Ok(());
        }
        self.backend.del(&self.name_v4(), IpNet::V4(subnet))
    }

    /// Remove an IPv6 entry; a missing entry surfaces as an error.
    pub fn del_subnet_v6(&self, subnet: Ipv6Net) -> Result<(), NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv6 {
            return Ok(());
        }
        self.backend.del(&self.name_v6(), IpNet::V6(subnet))
    }

    /// Enumerate the IPv4 set; zero timeouts decode to `None`.
    pub fn list_subnets_v4(&self) -> Result<HashMap<Ipv4Net, SetTimeout>, NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv4 {
            return Ok(HashMap::new());
        }
        let entries = self.backend.list(&self.name_v4())?;
        Ok(entries
            .into_iter()
            .filter_map(|(net, timeout)| match net {
                IpNet::V4(v4) => Some((v4, (timeout != 0).then_some(timeout))),
                IpNet::V6(_) => None,
            })
            .collect())
    }

    /// Enumerate the IPv6 set; zero timeouts decode to `None`.
    pub fn list_subnets_v6(&self) -> Result<HashMap<Ipv6Net, SetTimeout>, NetfilterError> {
        let _guard = self.locker.lock();
        if !self.enabled.load(Ordering::SeqCst) || !self.ipv6 {
            return Ok(HashMap::new());
        }
        let entries = self.backend.list(&self.name_v6())?;
        Ok(entries
            .into_iter()
            .filter_map(|(net, timeout)| match net {
                IpNet::V6(v6) => Some((v6, (timeout != 0).then_some(timeout))),
                IpNet::V4(_) => None,
            })
            .collect())
    }
}

//! Policy rules, routes and link state
//!
//! Semantic-level seam over the host's routing machinery: list marks and
//! tables (for the allocator), install `fwmark -> table` policy rules,
//! install blackhole and device routes in numbered tables, and query link
//! state. The real implementation drives the `ip` tool and parses its JSON
//! output; the fake keeps everything in memory for tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Command as Process;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::NetfilterError;

/// Address family selector for routing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteFamily {
    /// IPv4 (`ip`)
    V4,
    /// IPv6 (`ip -6`)
    V6,
}

/// A policy-database entry mapping a firewall mark to a routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
    /// Firewall mark to match
    pub mark: u32,
    /// Routing table to consult
    pub table: u32,
    /// Address family the rule applies to
    pub family: RouteFamily,
}

/// Route target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// Discard matching traffic
    Blackhole,
    /// Send matching traffic out of the named device
    Device(String),
}

/// A route inside a numbered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Address family
    pub family: RouteFamily,
    /// Destination prefix
    pub dst: IpNet,
    /// Routing table id
    pub table: u32,
    /// Blackhole or device target
    pub kind: RouteKind,
}

/// Link state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// Interface name
    pub name: String,
    /// Interface index
    pub index: u32,
    /// Administratively and operationally up
    pub up: bool,
    /// Point-to-point interface flag
    pub point_to_point: bool,
}

/// Seam over the routing policy database, route tables and links.
pub trait RouteOps: Send + Sync {
    /// All policy rules across both families.
    fn list_rules(&self) -> Result<Vec<PolicyRule>, NetfilterError>;

    /// Table ids referenced by any route, across both families.
    fn list_route_tables(&self) -> Result<Vec<u32>, NetfilterError>;

    /// Install a policy rule. Returns [`NetfilterError::AlreadyExists`] on a
    /// duplicate.
    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError>;

    /// Remove a policy rule.
    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError>;

    /// Install a route. Returns [`NetfilterError::AlreadyExists`] when the
    /// kernel reports the route is already there.
    fn add_route(&self, route: &Route) -> Result<(), NetfilterError>;

    /// Remove a route.
    fn del_route(&self, route: &Route) -> Result<(), NetfilterError>;

    /// Link state for a named interface, `None` when it does not exist.
    fn link_state(&self, name: &str) -> Result<Option<LinkState>, NetfilterError>;

    /// All links on the host.
    fn list_links(&self) -> Result<Vec<LinkState>, NetfilterError>;

    /// Addresses assigned to a named interface.
    fn link_addresses(&self, name: &str) -> Result<Vec<IpAddr>, NetfilterError>;
}

// ---------------------------------------------------------------------------
// iproute2 implementation

#[derive(Debug, Deserialize)]
struct IpRuleJson {
    #[serde(default)]
    fwmark: Option<String>,
    #[serde(default)]
    table: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpRouteJson {
    #[serde(default)]
    table: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifname: String,
    ifindex: u32,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfoJson {
    #[serde(default)]
    addr_info: Vec<IpAddrEntryJson>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntryJson {
    local: Option<String>,
}

/// Well-known table aliases used by iproute2 text output.
fn table_id(name: &str) -> Option<u32> {
    match name {
        "default" => Some(253),
        "main" => Some(254),
        "local" => Some(255),
        other => other.parse().ok(),
    }
}

fn mark_id(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// [`RouteOps`] implementation over the `ip` tool.
#[derive(Debug, Default)]
pub struct IpRouteOps;

impl IpRouteOps {
    fn run(args: &[&str]) -> Result<Vec<u8>, NetfilterError> {
        let output = Process::new("ip").args(args).output()?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = if stderr.contains("File exists") {
            NetfilterError::AlreadyExists(format!("ip {}", args.join(" ")))
        } else if stderr.contains("No such") || stderr.contains("does not exist") {
            NetfilterError::NotFound(format!("ip {}", args.join(" ")))
        } else {
            NetfilterError::command_failed("ip", output.status.code().unwrap_or(-1), stderr.trim())
        };
        Err(err)
    }

    fn family_flag(family: RouteFamily) -> &'static str {
        match family {
            RouteFamily::V4 => "-4",
            RouteFamily::V6 => "-6",
        }
    }

    fn rule_args(rule: &PolicyRule, op: &str) -> Vec<String> {
        vec![
            Self::family_flag(rule.family).to_string(),
            "rule".to_string(),
            op.to_string(),
            "fwmark".to_string(),
            rule.mark.to_string(),
            "table".to_string(),
            rule.table.to_string(),
        ]
    }

    fn route_args(route: &Route, op: &str) -> Vec<String> {
        let mut args = vec![
            Self::family_flag(route.family).to_string(),
            "route".to_string(),
            op.to_string(),
        ];
        match &route.kind {
            RouteKind::Blackhole => {
                args.push("blackhole".to_string());
                args.push(route.dst.to_string());
            }
            RouteKind::Device(dev) => {
                args.push(route.dst.to_string());
                args.push("dev".to_string());
                args.push(dev.clone());
            }
        }
        args.push("table".to_string());
        args.push(route.table.to_string());
        args
    }

    fn run_owned(args: &[String]) -> Result<Vec<u8>, NetfilterError> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::run(&refs)
    }
}

impl RouteOps for IpRouteOps {
    fn list_rules(&self) -> Result<Vec<PolicyRule>, NetfilterError> {
        let mut rules = Vec::new();
        for family in [RouteFamily::V4, RouteFamily::V6] {
            let output = Self::run(&[Self::family_flag(family), "-j", "rule", "list"])?;
            let parsed: Vec<IpRuleJson> = serde_json::from_slice(&output)
                .map_err(|e| NetfilterError::parse(format!("ip rule json: {e}")))?;
            for entry in parsed {
                let (Some(fwmark), Some(table)) = (entry.fwmark, entry.table) else {
                    continue;
                };
                let (Some(mark), Some(table)) = (mark_id(&fwmark), table_id(&table)) else {
                    continue;
                };
                rules.push(PolicyRule {
                    mark,
                    table,
                    family,
                });
            }
        }
        Ok(rules)
    }

    fn list_route_tables(&self) -> Result<Vec<u32>, NetfilterError> {
        let mut tables = Vec::new();
        for family in [RouteFamily::V4, RouteFamily::V6] {
            let output = Self::run(&[
                Self::family_flag(family),
                "-j",
                "route",
                "show",
                "table",
                "all",
            ])?;
            let parsed: Vec<IpRouteJson> = serde_json::from_slice(&output)
                .map_err(|e| NetfilterError::parse(format!("ip route json: {e}")))?;
            for entry in parsed {
                let id = match entry.table {
                    Some(serde_json::Value::Number(n)) => {
                        n.as_u64().and_then(|n| u32::try_from(n).ok())
                    }
                    Some(serde_json::Value::String(s)) => table_id(&s),
                    // Routes without an explicit table live in main.
                    _ => Some(254),
                };
                if let Some(id) = id {
                    tables.push(id);
                }
            }
        }
        Ok(tables)
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError> {
        Self::run_owned(&Self::rule_args(rule, "add"))?;
        Ok(())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError> {
        Self::run_owned(&Self::rule_args(rule, "del"))?;
        Ok(())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetfilterError> {
        Self::run_owned(&Self::route_args(route, "add"))?;
        Ok(())
    }

    fn del_route(&self, route: &Route) -> Result<(), NetfilterError> {
        Self::run_owned(&Self::route_args(route, "del"))?;
        Ok(())
    }

    fn link_state(&self, name: &str) -> Result<Option<LinkState>, NetfilterError> {
        let output = match Self::run(&["-j", "link", "show", "dev", name]) {
            Ok(output) => output,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(NetfilterError::CommandFailed { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let parsed: Vec<IpLinkJson> = serde_json::from_slice(&output)
            .map_err(|e| NetfilterError::parse(format!("ip link json: {e}")))?;
        Ok(parsed.into_iter().next().map(link_from_json))
    }

    fn list_links(&self) -> Result<Vec<LinkState>, NetfilterError> {
        let output = Self::run(&["-j", "link", "show"])?;
        let parsed: Vec<IpLinkJson> = serde_json::from_slice(&output)
            .map_err(|e| NetfilterError::parse(format!("ip link json: {e}")))?;
        Ok(parsed.into_iter().map(link_from_json).collect())
    }

    fn link_addresses(&self, name: &str) -> Result<Vec<IpAddr>, NetfilterError> {
        let output = Self::run(&["-j", "addr", "show", "dev", name])?;
        let parsed: Vec<IpAddrInfoJson> = serde_json::from_slice(&output)
            .map_err(|e| NetfilterError::parse(format!("ip addr json: {e}")))?;
        Ok(parsed
            .into_iter()
            .flat_map(|link| link.addr_info)
            .filter_map(|entry| entry.local.and_then(|a| a.parse().ok()))
            .collect())
    }
}

fn link_from_json(link: IpLinkJson) -> LinkState {
    LinkState {
        up: link.flags.iter().any(|f| f == "LOWER_UP")
            && link.flags.iter().any(|f| f == "UP"),
        point_to_point: link.flags.iter().any(|f| f == "POINTOPOINT"),
        name: link.ifname,
        index: link.ifindex,
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation for tests

#[derive(Debug, Default)]
struct FakeRouteState {
    rules: Vec<PolicyRule>,
    routes: Vec<Route>,
    links: HashMap<String, LinkState>,
    link_addrs: HashMap<String, Vec<IpAddr>>,
}

/// In-memory [`RouteOps`] for tests.
#[derive(Debug, Default)]
pub struct FakeRouteOps {
    state: Mutex<FakeRouteState>,
}

impl FakeRouteOps {
    /// Create an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link with the given state.
    pub fn set_link(&self, name: &str, index: u32, up: bool) {
        self.state.lock().links.insert(
            name.to_string(),
            LinkState {
                name: name.to_string(),
                index,
                up,
                point_to_point: true,
            },
        );
    }

    /// Assign addresses to a link.
    pub fn set_link_addresses(&self, name: &str, addrs: Vec<IpAddr>) {
        self.state.lock().link_addrs.insert(name.to_string(), addrs);
    }

    /// Seed a policy rule, marking its mark/table pair as occupied.
    pub fn seed_rule(&self, mark: u32, table: u32, family: RouteFamily) {
        self.state.lock().rules.push(PolicyRule {
            mark,
            table,
            family,
        });
    }

    /// Snapshot of installed routes.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.clone()
    }

    /// Snapshot of installed policy rules.
    #[must_use]
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.state.lock().rules.clone()
    }
}

impl RouteOps for FakeRouteOps {
    fn list_rules(&self) -> Result<Vec<PolicyRule>, NetfilterError> {
        Ok(self.state.lock().rules.clone())
    }

    fn list_route_tables(&self) -> Result<Vec<u32>, NetfilterError> {
        Ok(self.state.lock().routes.iter().map(|r| r.table).collect())
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        if state.rules.contains(rule) {
            return Err(NetfilterError::AlreadyExists(format!(
                "rule fwmark {} table {}",
                rule.mark, rule.table
            )));
        }
        state.rules.push(*rule);
        Ok(())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let pos = state
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| NetfilterError::NotFound(format!("rule fwmark {}", rule.mark)))?;
        state.rules.remove(pos);
        Ok(())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        if state.routes.contains(route) {
            return Err(NetfilterError::AlreadyExists(format!(
                "route {} table {}",
                route.dst, route.table
            )));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    fn del_route(&self, route: &Route) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let pos = state
            .routes
            .iter()
            .position(|r| r == route)
            .ok_or_else(|| NetfilterError::NotFound(format!("route {}", route.dst)))?;
        state.routes.remove(pos);
        Ok(())
    }

    fn link_state(&self, name: &str) -> Result<Option<LinkState>, NetfilterError> {
        Ok(self.state.lock().links.get(name).cloned())
    }

    fn list_links(&self) -> Result<Vec<LinkState>, NetfilterError> {
        Ok(self.state.lock().links.values().cloned().collect())
    }

    fn link_addresses(&self, name: &str) -> Result<Vec<IpAddr>, NetfilterError> {
        Ok(self
            .state
            .lock()
            .link_addrs
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

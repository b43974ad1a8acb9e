//! Configuration data model

use serde::{Deserialize, Serialize};

use crate::group::GroupModel;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// DNS proxy settings
    pub dns_proxy: DnsProxyConfig,

    /// Netfilter settings (chains, sets, mark/table allocation)
    pub netfilter: NetfilterConfig,

    /// Groups registered at startup
    pub groups: Vec<GroupModel>,

    /// Local interfaces whose addresses anchor the port-53 remap
    pub link: Vec<String>,

    /// List every interface instead of only point-to-point candidates
    pub show_all_interfaces: bool,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dns_proxy: DnsProxyConfig::default(),
            netfilter: NetfilterConfig::default(),
            groups: Vec::new(),
            link: vec!["br0".to_string()],
            show_all_interfaces: false,
            log_level: "info".to_string(),
        }
    }
}

/// DNS proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsProxyConfig {
    /// Listen address for the proxy
    pub host: DnsProxyServerConfig,

    /// Upstream forwarder
    pub upstream: DnsProxyServerConfig,

    /// Skip installing the 53 -> proxy port remap
    pub disable_remap53: bool,

    /// Disable synthesized NXDOMAIN answers for PTR questions
    #[serde(rename = "disableFakePTR")]
    pub disable_fake_ptr: bool,

    /// Pass AAAA answers through unchanged
    #[serde(rename = "disableDropAAAA")]
    pub disable_drop_aaaa: bool,

    /// Maximum idle upstream connections per transport
    pub max_idle_conns: usize,

    /// Maximum concurrent in-flight requests
    pub max_concurrent: usize,

    /// Per-request deadline in seconds (dial and I/O)
    pub timeout_secs: u64,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            host: DnsProxyServerConfig {
                address: "::".to_string(),
                port: 3553,
            },
            upstream: DnsProxyServerConfig {
                address: "127.0.0.1".to_string(),
                port: 53,
            },
            disable_remap53: false,
            disable_fake_ptr: false,
            disable_drop_aaaa: false,
            max_idle_conns: 10,
            max_concurrent: 100,
            timeout_secs: 5,
        }
    }
}

/// Address/port pair for a DNS endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsProxyServerConfig {
    /// IP address (v4 or v6 literal)
    pub address: String,
    /// UDP/TCP port
    pub port: u16,
}

/// Netfilter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetfilterConfig {
    /// Chain naming
    pub ip_tables: IptablesConfig,

    /// Address-set naming and TTL handling
    pub ip_set: IpsetConfig,

    /// Disable IPv4 handling end-to-end
    #[serde(rename = "disableIPv4")]
    pub disable_ipv4: bool,

    /// Disable IPv6 handling end-to-end
    #[serde(rename = "disableIPv6")]
    pub disable_ipv6: bool,

    /// Starting integer for the mark/table search
    pub start_mark_table_index: u32,
}

impl Default for NetfilterConfig {
    fn default() -> Self {
        Self {
            ip_tables: IptablesConfig::default(),
            ip_set: IpsetConfig::default(),
            disable_ipv4: false,
            disable_ipv6: false,
            start_mark_table_index: 0x4d52_0000,
        }
    }
}

/// Chain naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IptablesConfig {
    /// Prefix for chains owned by this daemon
    pub chain_prefix: String,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            chain_prefix: "MR_".to_string(),
        }
    }
}

/// Address-set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpsetConfig {
    /// Prefix for address sets owned by this daemon
    pub table_prefix: String,

    /// Seconds added to the observed DNS TTL before set insertion
    #[serde(rename = "additionalTTL")]
    pub additional_ttl: u32,
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            table_prefix: "mr_".to_string(),
            additional_ttl: 3600,
        }
    }
}

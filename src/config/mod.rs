//! Configuration types and loading
//!
//! The daemon is configured from a single JSON file. Every field has a
//! default, so an empty object is a valid configuration; the defaults match
//! a router-style deployment (proxy on `[::]:3553`, upstream on the local
//! resolver, netfilter objects prefixed `MR_`/`mr_`).

mod loader;
mod types;

pub use loader::load_config;
pub use types::{
    AppConfig, DnsProxyConfig, DnsProxyServerConfig, IpsetConfig, IptablesConfig, NetfilterConfig,
};

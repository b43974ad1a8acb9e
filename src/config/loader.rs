//! Configuration file loading and validation

use std::net::IpAddr;
use std::path::Path;

use tracing::info;

use super::types::AppConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file.
///
/// A missing file is an error; to run with defaults, pass a file containing
/// `{}`. The parsed configuration is validated before being returned.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file is missing, unparsable, or fails
/// validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    validate(&config)?;

    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Validate a configuration, catching values that would only fail later at
/// enable time.
pub(crate) fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    config
        .dns_proxy
        .host
        .address
        .parse::<IpAddr>()
        .map_err(|_| {
            ConfigError::validation(format!(
                "dnsProxy.host.address {:?} is not an IP literal",
                config.dns_proxy.host.address
            ))
        })?;
    config
        .dns_proxy
        .upstream
        .address
        .parse::<IpAddr>()
        .map_err(|_| {
            ConfigError::validation(format!(
                "dnsProxy.upstream.address {:?} is not an IP literal",
                config.dns_proxy.upstream.address
            ))
        })?;

    if config.dns_proxy.host.port == 0 {
        return Err(ConfigError::validation("dnsProxy.host.port must not be 0"));
    }
    if config.dns_proxy.upstream.port == 0 {
        return Err(ConfigError::validation(
            "dnsProxy.upstream.port must not be 0",
        ));
    }
    if config.dns_proxy.max_concurrent == 0 {
        return Err(ConfigError::validation(
            "dnsProxy.maxConcurrent must be at least 1",
        ));
    }
    if config.netfilter.ip_tables.chain_prefix.is_empty() {
        return Err(ConfigError::validation(
            "netfilter.ipTables.chainPrefix must not be empty",
        ));
    }
    if config.netfilter.ip_set.table_prefix.is_empty() {
        return Err(ConfigError::validation(
            "netfilter.ipSet.tablePrefix must not be empty",
        ));
    }
    if config.netfilter.disable_ipv4 && config.netfilter.disable_ipv6 {
        return Err(ConfigError::validation(
            "netfilter: at least one address family must stay enabled",
        ));
    }

    Ok(())
}

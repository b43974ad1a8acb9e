//! Error types for markroute
//!
//! One error enum per subsystem, all convertible into the top-level
//! [`MarkrouteError`]. Per-entry kernel failures are logged where they occur
//! and do not normally travel through these types; the enums here cover the
//! failures that callers have to react to.

use std::io;

use thiserror::Error;

/// Top-level error type for markroute
#[derive(Debug, Error)]
pub enum MarkrouteError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Netfilter layer errors (iptables, address sets, routes)
    #[error("Netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// DNS proxy errors
    #[error("DNS proxy error: {0}")]
    DnsProxy(#[from] DnsProxyError),

    /// Group lifecycle errors
    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    /// Application lifecycle errors
    #[error("Application error: {0}")]
    App(#[from] AppError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Errors from the netfilter layer: the declarative chain model, address
/// sets, policy rules and routes.
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// A chain was used before being registered with a policy
    #[error("chain {table}/{chain} not registered")]
    ChainNotRegistered { table: String, chain: String },

    /// An external tool exited with a failure status
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The referenced kernel object does not exist
    #[error("{0} does not exist")]
    NotFound(String),

    /// The kernel object already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// No free mark/table pair could be claimed
    #[error("mark/table allocation failed after {attempts} attempts")]
    AllocationFailed { attempts: u32 },

    /// Output of a save/list primitive could not be parsed
    #[error("failed to parse kernel state: {0}")]
    Parse(String),

    /// I/O error talking to the kernel tooling
    #[error("netfilter I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetfilterError {
    /// Create a chain-not-registered error
    pub fn chain_not_registered(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self::ChainNotRegistered {
            table: table.into(),
            chain: chain.into(),
        }
    }

    /// Create a command-failed error
    pub fn command_failed(program: impl Into<String>, status: i32, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            program: program.into(),
            status,
            stderr: stderr.into(),
        }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// True when the error signals that the kernel object was absent.
    ///
    /// Teardown paths swallow these: destroying a set or route that is
    /// already gone is success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the error signals that the kernel object already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// DNS proxy errors
#[derive(Debug, Error)]
pub enum DnsProxyError {
    /// Failed to bind a listener
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Malformed DNS message on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A registered hook failed
    #[error("hook error: {0}")]
    Hook(String),

    /// The upstream exchange failed
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The per-request deadline elapsed
    #[error("request deadline exceeded")]
    Timeout,

    /// The connection pool has been shut down
    #[error("connection pool is closed")]
    PoolClosed,

    /// The message exceeds the transport's size limit
    #[error("message of {0} bytes exceeds maximum size")]
    MessageTooLarge(usize),

    /// I/O error on a client or upstream socket
    #[error("DNS proxy I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DnsProxyError {
    /// Create a protocol error
    pub fn protocol(msg: impl ToString) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create an upstream error
    pub fn upstream(msg: impl ToString) -> Self {
        Self::Upstream(msg.to_string())
    }
}

/// Group lifecycle errors
#[derive(Debug, Error)]
pub enum GroupError {
    /// Failed to bring up the group's address sets
    #[error("failed to initialize address sets: {0}")]
    IpsetSetup(#[source] NetfilterError),

    /// Failed to wire the address sets to the egress interface
    #[error("failed to bind address sets to interface: {0}")]
    LinkSetup(#[source] NetfilterError),

    /// Failed to read live set contents during reconciliation
    #[error("failed to list live set contents: {0}")]
    ListSets(#[source] NetfilterError),

    /// Teardown failure (first error of the bulk disable)
    #[error("teardown failed: {0}")]
    Teardown(#[source] NetfilterError),
}

/// Application lifecycle errors
#[derive(Debug, Error)]
pub enum AppError {
    /// The core is already running
    #[error("already running")]
    AlreadyRunning,

    /// A group with this id is already registered
    #[error("group id conflict")]
    GroupIdConflict,

    /// A rule id appears twice within one group
    #[error("rule id conflict")]
    RuleIdConflict,

    /// A stale PID file belongs to a live instance
    #[error("another instance is running (pid {0})")]
    InstanceRunning(u32),
}

/// Type alias for Result with [`MarkrouteError`]
pub type Result<T> = std::result::Result<T, MarkrouteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(NetfilterError::NotFound("set mr_x_4".into()).is_not_found());
        assert!(!NetfilterError::AlreadyExists("rule".into()).is_not_found());
        assert!(NetfilterError::AlreadyExists("rule".into()).is_already_exists());
    }

    #[test]
    fn test_error_display() {
        let err = NetfilterError::command_failed("iptables-restore", 2, "line 3 failed");
        let msg = err.to_string();
        assert!(msg.contains("iptables-restore"));
        assert!(msg.contains("line 3 failed"));

        let err = AppError::AlreadyRunning;
        assert_eq!(err.to_string(), "already running");
    }

    #[test]
    fn test_conversion_to_top_level() {
        let nf = NetfilterError::NotFound("table".into());
        let top: MarkrouteError = nf.into();
        assert!(matches!(top, MarkrouteError::Netfilter(_)));
    }
}

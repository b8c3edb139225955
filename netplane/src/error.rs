//! Error types for netplane

use std::io;
use thiserror::Error;

use netplane_nl::NetlinkError;

/// Result type alias for netplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconfiguring host networking
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel netlink error
    #[error("netlink error: {0}")]
    Netlink(#[from] NetlinkError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Route discovery failed
    #[error("route discovery failed: {0}")]
    Discovery(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// DNS management error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Packet filter error
    #[error("packet filter error: {0}")]
    Filter(String),

    /// Interface not found
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Source and destination prefixes disagree on address family
    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    /// No rules are installed under this key
    #[error("unknown filter key: {0}")]
    UnknownKey(String),

    /// A rule was committed but could not be found afterwards
    #[error("rule missing after commit in {table} {chain}")]
    MissingRule { table: String, chain: String },

    /// External command failed
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Timeout error
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            Error::Netlink(e) => e.is_permission_denied(),
            _ => false,
        }
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::InterfaceNotFound(_) | Error::UnknownKey(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Error::Netlink(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if the kernel reported that the object already exists
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Netlink(e) if e.is_exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(Error::Netlink(NetlinkError::Kernel(libc::EPERM)).is_permission_denied());
        assert!(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_permission_denied());
        assert!(Error::UnknownKey("k".into()).is_not_found());
        assert!(Error::Netlink(NetlinkError::Kernel(libc::EEXIST)).is_exists());
        assert!(!Error::Config("x".into()).is_not_found());
    }

    #[test]
    fn test_missing_rule_message() {
        let err = Error::MissingRule {
            table: "ip netplane".into(),
            chain: "input".into(),
        };
        assert_eq!(err.to_string(), "rule missing after commit in ip netplane input");
    }
}

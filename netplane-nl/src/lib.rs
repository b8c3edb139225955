//! Pure Rust netlink plumbing for routes and nftables.
//!
//! This crate speaks the two kernel protocols the control plane needs:
//!
//! - **rtnetlink** ([`rtnl`]): route dumps, route add/delete, interface
//!   addresses and link flags.
//! - **nf_tables** ([`nftables`]): tables, chains, rules with their
//!   expressions, verdict maps and their elements, applied in batches.
//!
//! The message builder, the parsers and the nftables object model compile on
//! every platform. `rtnl` exists only on Linux; elsewhere the nftables commit
//! and dump calls return [`NetlinkError::UnsupportedPlatform`].

pub mod netlink;
pub mod nftables;

#[cfg(target_os = "linux")]
pub mod rtnl;

use thiserror::Error;

/// Error type for netlink operations.
#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid address family")]
    InvalidAddressFamily,

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// errno reported by the kernel (positive value)
    #[error("kernel rejected request: {}", std::io::Error::from_raw_os_error(*.0))]
    Kernel(i32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("truncated netlink message")]
    Truncated,

    /// Encoded attribute length in bytes, header included.
    #[error("netlink attribute too large: {0} bytes")]
    AttributeTooLarge(usize),

    #[error("unexpected netlink payload: {0}")]
    Protocol(String),

    #[error("unsupported platform: netlink is only available on Linux")]
    UnsupportedPlatform,
}

impl NetlinkError {
    /// The kernel reported `EEXIST`.
    pub fn is_exists(&self) -> bool {
        matches!(self, NetlinkError::Kernel(errno) if *errno == libc::EEXIST)
    }

    /// The kernel reported `ENOENT`/`ESRCH`, or the object was not found locally.
    pub fn is_not_found(&self) -> bool {
        match self {
            NetlinkError::NotFound(_) => true,
            NetlinkError::Kernel(errno) => *errno == libc::ENOENT || *errno == libc::ESRCH,
            _ => false,
        }
    }

    /// The kernel reported `EPERM`/`EACCES`.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            NetlinkError::Kernel(errno) => *errno == libc::EPERM || *errno == libc::EACCES,
            NetlinkError::Socket(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

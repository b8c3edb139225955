//! DNS redirection while the tunnel is up.
//!
//! Each platform has its own [`DnsManager`]:
//!
//! - macOS: [`NetworkSetupDns`] overrides the default network service with
//!   `networksetup` and restores the captured settings on clear.
//! - Linux: [`ResolvedDns`] configures the tunnel link in
//!   systemd-resolved through a [`ResolverBus`].
//! - Windows: [`NoopDns`].

mod networksetup;
mod resolved;

pub use networksetup::NetworkSetupDns;
pub use resolved::{MemoryResolver, ResolvectlBus, ResolvedDns, ResolverBus, ResolverCall};

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;

/// Default deadline for a resolver bus call
pub const DEFAULT_BUS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Host DNS configuration override
#[async_trait]
pub trait DnsManager: Send + Sync {
    /// Use `servers` for name resolution. Malformed entries are skipped.
    async fn add_dns_servers(&self, servers: &[String]) -> Result<()>;

    async fn add_search_domains(&self, domains: &[String]) -> Result<()>;

    /// Undo every change made by this manager
    async fn clear(&self) -> Result<()>;
}

/// DNS manager for platforms without DNS control
#[derive(Debug, Default)]
pub struct NoopDns;

#[async_trait]
impl DnsManager for NoopDns {
    async fn add_dns_servers(&self, servers: &[String]) -> Result<()> {
        log::debug!("DNS control unavailable, ignoring {} servers", servers.len());
        Ok(())
    }

    async fn add_search_domains(&self, _domains: &[String]) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Parse server addresses, logging and skipping the malformed ones
pub(crate) fn parse_servers(servers: &[String]) -> Vec<IpAddr> {
    servers
        .iter()
        .filter_map(|s| match s.trim().parse::<IpAddr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                log::warn!("Skipping malformed DNS server '{}'", s);
                None
            }
        })
        .collect()
}

/// Fully-qualified form of a search domain (`corp.example.`). Empty input
/// yields `None`.
pub(crate) fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }
    Some(format!("{}.", domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_servers_skips_garbage() {
        let servers = vec!["10.0.0.1".into(), "nope".into(), " fd00::1 ".into()];
        assert_eq!(
            parse_servers(&servers),
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "fd00::1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("corp.example").as_deref(), Some("corp.example."));
        assert_eq!(normalize_domain("corp.example.").as_deref(), Some("corp.example."));
        assert_eq!(normalize_domain("  "), None);
        assert_eq!(normalize_domain("bad domain"), None);
    }

    #[tokio::test]
    async fn test_noop_dns() {
        let dns = NoopDns;
        dns.add_dns_servers(&["10.0.0.1".into()]).await.unwrap();
        dns.clear().await.unwrap();
    }
}

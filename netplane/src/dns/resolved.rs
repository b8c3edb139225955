//! Linux DNS through systemd-resolved's per-link settings.

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{normalize_domain, parse_servers, DnsManager, DEFAULT_BUS_TIMEOUT};
use crate::command::CommandRunner;
use crate::context::InterfaceRegistry;
use crate::error::{Error, Result};

/// The systemd-resolved link API (`org.freedesktop.resolve1.Manager`)
#[async_trait]
pub trait ResolverBus: Send + Sync {
    async fn set_link_dns(&self, ifindex: u32, servers: &[IpAddr]) -> Result<()>;

    /// Whether the link is used for domains no other link claims
    async fn set_link_default_route(&self, ifindex: u32, enable: bool) -> Result<()>;

    /// Search domains as `(domain, routing_only)` pairs
    async fn set_link_domains(&self, ifindex: u32, domains: &[(String, bool)]) -> Result<()>;

    async fn flush_caches(&self) -> Result<()>;

    /// Drop every per-link setting
    async fn revert_link(&self, ifindex: u32) -> Result<()>;
}

/// Linux `AF_INET`, as the resolver bus expects it
pub const BUS_AF_INET: i32 = 2;
/// Linux `AF_INET6`
pub const BUS_AF_INET6: i32 = 10;

/// Address family and raw bytes of a `SetLinkDNS` entry
pub fn link_dns_entry(addr: &IpAddr) -> (i32, Vec<u8>) {
    match addr {
        IpAddr::V4(a) => (BUS_AF_INET, a.octets().to_vec()),
        IpAddr::V6(a) => (BUS_AF_INET6, a.octets().to_vec()),
    }
}

/// Drives systemd-resolved through `resolvectl`
pub struct ResolvectlBus {
    runner: Arc<dyn CommandRunner>,
}

impl ResolvectlBus {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn resolvectl(&self, args: &[&str]) -> Result<()> {
        self.runner.run_checked("resolvectl", args).await.map(|_| ())
    }
}

#[async_trait]
impl ResolverBus for ResolvectlBus {
    async fn set_link_dns(&self, ifindex: u32, servers: &[IpAddr]) -> Result<()> {
        let link = ifindex.to_string();
        let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
        let mut args = vec!["dns", link.as_str()];
        args.extend(servers.iter().map(String::as_str));
        self.resolvectl(&args).await
    }

    async fn set_link_default_route(&self, ifindex: u32, enable: bool) -> Result<()> {
        let link = ifindex.to_string();
        let value = if enable { "yes" } else { "no" };
        self.resolvectl(&["default-route", &link, value]).await
    }

    async fn set_link_domains(&self, ifindex: u32, domains: &[(String, bool)]) -> Result<()> {
        let link = ifindex.to_string();
        let domains: Vec<String> = domains
            .iter()
            .map(|(d, routing_only)| {
                if *routing_only {
                    format!("~{}", d)
                } else {
                    d.clone()
                }
            })
            .collect();
        let mut args = vec!["domain", link.as_str()];
        args.extend(domains.iter().map(String::as_str));
        self.resolvectl(&args).await
    }

    async fn flush_caches(&self) -> Result<()> {
        self.resolvectl(&["flush-caches"]).await
    }

    async fn revert_link(&self, ifindex: u32) -> Result<()> {
        let link = ifindex.to_string();
        self.resolvectl(&["revert", &link]).await
    }
}

/// Per-link DNS on the context's first tunnel interface.
///
/// Clearing reverts the whole link, including settings made by others.
pub struct ResolvedDns {
    bus: Arc<dyn ResolverBus>,
    interfaces: InterfaceRegistry,
    timeout: Duration,
    touched: Mutex<Option<u32>>,
}

impl ResolvedDns {
    pub fn new(bus: Arc<dyn ResolverBus>, interfaces: InterfaceRegistry) -> Self {
        Self::with_timeout(bus, interfaces, DEFAULT_BUS_TIMEOUT)
    }

    pub fn with_timeout(
        bus: Arc<dyn ResolverBus>,
        interfaces: InterfaceRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            interfaces,
            timeout,
            touched: Mutex::new(None),
        }
    }

    fn link_index(&self) -> Result<u32> {
        self.interfaces
            .first()
            .map(|link| link.index)
            .ok_or_else(|| Error::InterfaceNotFound("no tunnel interface for DNS".into()))
    }

    async fn bounded<F>(&self, call: &str, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("resolver {}", call))),
        }
    }

    /// Run a bus call, logging a failure instead of returning it
    async fn apply<F>(&self, call: &str, fut: F)
    where
        F: Future<Output = Result<()>>,
    {
        if let Err(e) = self.bounded(call, fut).await {
            log::warn!("resolver {} failed: {}", call, e);
        }
    }
}

#[async_trait]
impl DnsManager for ResolvedDns {
    async fn add_dns_servers(&self, servers: &[String]) -> Result<()> {
        let ifindex = self.link_index()?;
        let servers = parse_servers(servers);
        if servers.is_empty() {
            return Ok(());
        }

        *self.touched.lock().await = Some(ifindex);
        self.apply("SetLinkDNS", self.bus.set_link_dns(ifindex, &servers))
            .await;
        self.apply(
            "SetLinkDefaultRoute",
            self.bus.set_link_default_route(ifindex, true),
        )
        .await;
        self.apply("FlushCaches", self.bus.flush_caches()).await;
        log::info!("DNS on link {} set to {} servers", ifindex, servers.len());
        Ok(())
    }

    async fn add_search_domains(&self, domains: &[String]) -> Result<()> {
        let ifindex = self.link_index()?;
        let mut entries: Vec<(String, bool)> = domains
            .iter()
            .filter_map(|d| match normalize_domain(d) {
                Some(domain) => Some((domain, false)),
                None => {
                    log::warn!("Skipping malformed search domain '{}'", d);
                    None
                }
            })
            .collect();
        // route every query through this link
        entries.push((".".to_string(), true));

        *self.touched.lock().await = Some(ifindex);
        self.apply("SetLinkDomains", self.bus.set_link_domains(ifindex, &entries))
            .await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let Some(ifindex) = self.touched.lock().await.take() else {
            return Ok(());
        };
        self.bounded("RevertLink", self.bus.revert_link(ifindex))
            .await?;
        log::info!("DNS on link {} reverted", ifindex);
        Ok(())
    }
}

/// A recorded [`ResolverBus`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverCall {
    SetLinkDns {
        ifindex: u32,
        entries: Vec<(i32, Vec<u8>)>,
    },
    SetLinkDefaultRoute {
        ifindex: u32,
        enable: bool,
    },
    SetLinkDomains {
        ifindex: u32,
        domains: Vec<(String, bool)>,
    },
    FlushCaches,
    RevertLink {
        ifindex: u32,
    },
}

/// Records bus calls for tests. Calls can be delayed to exercise the
/// deadline.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    calls: StdMutex<Vec<ResolverCall>>,
    delay: Option<Duration>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before being recorded
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ResolverCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn record(&self, call: ResolverCall) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        Ok(())
    }
}

#[async_trait]
impl ResolverBus for MemoryResolver {
    async fn set_link_dns(&self, ifindex: u32, servers: &[IpAddr]) -> Result<()> {
        let entries = servers.iter().map(link_dns_entry).collect();
        self.record(ResolverCall::SetLinkDns { ifindex, entries }).await
    }

    async fn set_link_default_route(&self, ifindex: u32, enable: bool) -> Result<()> {
        self.record(ResolverCall::SetLinkDefaultRoute { ifindex, enable })
            .await
    }

    async fn set_link_domains(&self, ifindex: u32, domains: &[(String, bool)]) -> Result<()> {
        self.record(ResolverCall::SetLinkDomains {
            ifindex,
            domains: domains.to_vec(),
        })
        .await
    }

    async fn flush_caches(&self) -> Result<()> {
        self.record(ResolverCall::FlushCaches).await
    }

    async fn revert_link(&self, ifindex: u32) -> Result<()> {
        self.record(ResolverCall::RevertLink { ifindex }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use crate::route::Link;

    fn registry() -> InterfaceRegistry {
        let interfaces = InterfaceRegistry::default();
        interfaces.register(Link::new(7, "wg0"));
        interfaces
    }

    #[tokio::test]
    async fn test_servers_split_by_family() {
        let bus = Arc::new(MemoryResolver::new());
        let dns = ResolvedDns::new(bus.clone(), registry());
        dns.add_dns_servers(&["10.8.0.1".into(), "junk".into(), "fd00::53".into()])
            .await
            .unwrap();

        let calls = bus.calls();
        assert_eq!(
            calls[0],
            ResolverCall::SetLinkDns {
                ifindex: 7,
                entries: vec![
                    (BUS_AF_INET, vec![10, 8, 0, 1]),
                    (
                        BUS_AF_INET6,
                        "fd00::53".parse::<std::net::Ipv6Addr>().unwrap().octets().to_vec()
                    ),
                ],
            }
        );
        assert_eq!(
            calls[1],
            ResolverCall::SetLinkDefaultRoute {
                ifindex: 7,
                enable: true
            }
        );
        assert_eq!(calls[2], ResolverCall::FlushCaches);
    }

    #[tokio::test]
    async fn test_search_domains_add_catch_all() {
        let bus = Arc::new(MemoryResolver::new());
        let dns = ResolvedDns::new(bus.clone(), registry());
        dns.add_search_domains(&["corp.example".into(), "lab.example.".into()])
            .await
            .unwrap();
        assert_eq!(
            bus.calls(),
            vec![ResolverCall::SetLinkDomains {
                ifindex: 7,
                domains: vec![
                    ("corp.example.".into(), false),
                    ("lab.example.".into(), false),
                    (".".into(), true),
                ],
            }]
        );
    }

    #[tokio::test]
    async fn test_clear_reverts_once() {
        let bus = Arc::new(MemoryResolver::new());
        let dns = ResolvedDns::new(bus.clone(), registry());
        dns.add_dns_servers(&["10.8.0.1".into()]).await.unwrap();
        dns.clear().await.unwrap();
        dns.clear().await.unwrap();
        let reverts = bus
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ResolverCall::RevertLink { ifindex: 7 }))
            .count();
        assert_eq!(reverts, 1);
    }

    #[tokio::test]
    async fn test_missing_interface_is_an_error() {
        let bus = Arc::new(MemoryResolver::new());
        let dns = ResolvedDns::new(bus.clone(), InterfaceRegistry::default());
        let err = dns.add_dns_servers(&["10.8.0.1".into()]).await.unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound(_)));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_slow_bus_times_out() {
        let bus = Arc::new(MemoryResolver::with_delay(Duration::from_secs(30)));
        let dns = ResolvedDns::with_timeout(bus.clone(), registry(), Duration::from_millis(20));
        // apply failures are logged, not returned
        dns.add_dns_servers(&["10.8.0.1".into()]).await.unwrap();
        assert!(matches!(dns.clear().await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_resolvectl_arguments() {
        let runner = Arc::new(ScriptedRunner::new());
        let bus = ResolvectlBus::new(runner.clone());
        bus.set_link_dns(7, &["10.8.0.1".parse().unwrap()]).await.unwrap();
        bus.set_link_domains(7, &[("corp.example.".into(), false), (".".into(), true)])
            .await
            .unwrap();
        bus.revert_link(7).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "resolvectl dns 7 10.8.0.1",
                "resolvectl domain 7 corp.example. ~.",
                "resolvectl revert 7",
            ]
        );
    }
}

//! The network context: discovered state plus every manager created from
//! it, torn down together.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::discovery::Discovery;
use crate::dns::{DnsManager, DEFAULT_BUS_TIMEOUT};
use crate::driver::{DnsScope, PlatformNetworkDriver};
use crate::error::{Error, Result};
use crate::route::{Link, NetworkState};
use crate::routing::RouteManager;

/// Tunnel interfaces registered by a context's route managers, in
/// creation order
#[derive(Debug, Clone, Default)]
pub struct InterfaceRegistry {
    links: Arc<StdMutex<Vec<Link>>>,
}

impl InterfaceRegistry {
    pub fn register(&self, link: Link) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if !links.contains(&link) {
            links.push(link);
        }
    }

    /// The first registered interface
    pub fn first(&self) -> Option<Link> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub fn all(&self) -> Vec<Link> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Settings a context hands to the managers it creates
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub filter_table: String,
    pub dns_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            filter_table: "netplane".to_string(),
            dns_timeout: DEFAULT_BUS_TIMEOUT,
        }
    }
}

impl From<&Config> for ContextOptions {
    fn from(config: &Config) -> Self {
        Self {
            filter_table: config.filter.table.clone(),
            dns_timeout: config.dns.bus_timeout(),
        }
    }
}

#[derive(Default)]
struct Children {
    cleared: bool,
    dns_managers: Vec<Arc<dyn DnsManager>>,
    route_managers: Vec<Arc<RouteManager>>,
    /// Device whose IPv6 was turned off
    ipv6_disabled: Option<String>,
}

/// Owner of the host's original network state and of every change made
/// on top of it
pub struct NetworkContext {
    driver: Arc<dyn PlatformNetworkDriver>,
    state: Arc<NetworkState>,
    options: ContextOptions,
    interfaces: InterfaceRegistry,
    children: Mutex<Children>,
}

impl NetworkContext {
    /// Wait for `discovery` and build a context on its result
    pub async fn new(discovery: &Discovery) -> Result<Self> {
        Self::with_options(discovery, ContextOptions::default()).await
    }

    pub async fn with_options(discovery: &Discovery, options: ContextOptions) -> Result<Self> {
        let state = discovery.wait().await?;
        Ok(Self {
            driver: discovery.driver(),
            state,
            options,
            interfaces: InterfaceRegistry::default(),
            children: Mutex::new(Children::default()),
        })
    }

    /// The state captured by discovery
    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn default_device_name(&self) -> Option<&str> {
        self.state.device_name.as_deref()
    }

    /// Interface of the default route, IPv4 preferred
    pub fn default_interface(&self) -> Option<&Link> {
        self.state.default_route().and_then(|r| r.link.as_ref())
    }

    /// Gateway of the default route, IPv4 preferred
    pub fn default_gateway(&self) -> Option<IpAddr> {
        self.state
            .default_v4
            .as_ref()
            .and_then(|r| r.gateway)
            .or_else(|| self.state.default_v6.as_ref().and_then(|r| r.gateway))
    }

    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    fn check_active(children: &Children) -> Result<()> {
        if children.cleared {
            return Err(Error::InvalidState("network context has been cleared".into()));
        }
        Ok(())
    }

    pub async fn new_dns_manager(&self) -> Result<Arc<dyn DnsManager>> {
        let mut children = self.children.lock().await;
        Self::check_active(&children)?;
        let manager = self.driver.dns_manager(DnsScope {
            device_name: self.state.device_name.clone(),
            interfaces: self.interfaces.clone(),
            timeout: self.options.dns_timeout,
        });
        children.dns_managers.push(manager.clone());
        Ok(manager)
    }

    pub async fn new_route_manager(&self) -> Result<Arc<RouteManager>> {
        let mut children = self.children.lock().await;
        Self::check_active(&children)?;
        let manager = Arc::new(RouteManager::new(
            self.driver.clone(),
            self.state.clone(),
            self.interfaces.clone(),
            self.options.filter_table.clone(),
        ));
        children.route_managers.push(manager.clone());
        Ok(manager)
    }

    /// Turn IPv6 off on the default device until [`NetworkContext::clear`]
    pub async fn disable_ipv6(&self) -> Result<()> {
        let mut children = self.children.lock().await;
        Self::check_active(&children)?;
        if children.ipv6_disabled.is_some() {
            return Ok(());
        }
        let device = self
            .default_device_name()
            .ok_or_else(|| Error::InterfaceNotFound("no default device".into()))?
            .to_string();
        self.driver.set_ipv6_disabled(&device, true).await?;
        log::info!("IPv6 disabled on {}", device);
        children.ipv6_disabled = Some(device);
        Ok(())
    }

    /// Undo every change: IPv6, then DNS, then routes. Failures are logged
    /// and the rest still runs. Calling it again does nothing.
    pub async fn clear(&self) {
        let mut children = self.children.lock().await;
        if children.cleared {
            return;
        }
        children.cleared = true;

        if let Some(device) = children.ipv6_disabled.take() {
            match self.driver.set_ipv6_disabled(&device, false).await {
                Ok(()) => log::info!("IPv6 restored on {}", device),
                Err(e) => log::warn!("Failed to restore IPv6 on {}: {}", device, e),
            }
        }

        for dns in children.dns_managers.drain(..) {
            if let Err(e) = dns.clear().await {
                log::warn!("Failed to restore DNS: {}", e);
            }
        }

        for routes in children.route_managers.drain(..) {
            routes.clear().await;
        }
        log::info!("Network context cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::route::{AddressFamily, Route};

    async fn context() -> (Arc<MemoryDriver>, NetworkContext) {
        let driver = Arc::new(MemoryDriver::new());
        let eth0 = driver.kernel.add_link("eth0").await;
        driver.kernel.add_link("wg0").await;
        driver
            .kernel
            .seed_route(
                Route::new(AddressFamily::V6.any())
                    .via("fe80::1".parse().unwrap())
                    .with_link(eth0.clone()),
            )
            .await;
        driver
            .kernel
            .seed_route(
                Route::new(AddressFamily::V4.any())
                    .via("192.168.1.1".parse().unwrap())
                    .with_link(eth0),
            )
            .await;
        let discovery = Discovery::spawn(driver.clone());
        let ctx = NetworkContext::new(&discovery).await.unwrap();
        (driver, ctx)
    }

    #[tokio::test]
    async fn test_accessors_prefer_ipv4() {
        let (_driver, ctx) = context().await;
        assert_eq!(ctx.default_device_name(), Some("eth0"));
        assert_eq!(ctx.default_interface().unwrap().name, "eth0");
        assert_eq!(
            ctx.default_gateway(),
            Some("192.168.1.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_ipv6_toggle_reverted_on_clear() {
        let (driver, ctx) = context().await;
        ctx.disable_ipv6().await.unwrap();
        ctx.disable_ipv6().await.unwrap();
        ctx.clear().await;
        ctx.clear().await;
        assert_eq!(
            driver.ipv6_toggles(),
            vec![("eth0".to_string(), true), ("eth0".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_cleared_context_refuses_managers() {
        let (_driver, ctx) = context().await;
        ctx.clear().await;
        assert!(matches!(
            ctx.new_route_manager().await,
            Err(Error::InvalidState(_))
        ));
        assert!(ctx.new_dns_manager().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_discovery_propagates() {
        struct Broken;

        #[async_trait::async_trait]
        impl PlatformNetworkDriver for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            async fn discover_default_route(&self) -> Result<NetworkState> {
                Err(Error::Discovery("netlink unavailable".into()))
            }
            fn dns_manager(&self, _scope: DnsScope) -> Arc<dyn DnsManager> {
                Arc::new(crate::dns::NoopDns)
            }
            fn kernel(&self) -> Arc<dyn crate::kernel::KernelNetwork> {
                Arc::new(crate::kernel::MemoryKernel::new())
            }
            fn packet_filter(&self) -> Result<Arc<dyn crate::filter::PacketFilter>> {
                Err(Error::NotSupported("filter".into()))
            }
            async fn set_ipv6_disabled(&self, _device: &str, _disabled: bool) -> Result<()> {
                Ok(())
            }
        }

        let discovery = Discovery::spawn(Arc::new(Broken));
        let err = NetworkContext::new(&discovery).await.err().unwrap();
        assert!(err.to_string().contains("netlink unavailable"));
        // the failure is memoized
        assert!(NetworkContext::new(&discovery).await.is_err());
    }

    #[test]
    fn test_registry_keeps_first() {
        let registry = InterfaceRegistry::default();
        registry.register(Link::new(3, "wg0"));
        registry.register(Link::new(4, "wg1"));
        registry.register(Link::new(3, "wg0"));
        assert_eq!(registry.first().unwrap().name, "wg0");
        assert_eq!(registry.all().len(), 2);
    }
}

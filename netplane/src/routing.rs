//! Tunnel interfaces and the routes around them.
//!
//! A [`RoutableInterface`] is an existing tunnel link that has been given
//! an address and a gateway. Making it the default path installs the two
//! `/1` halves of the address space through its gateway. Both are more
//! specific than the real default route, so the original route never has
//! to be touched, except on Linux where it is removed and put back on
//! clear. Hosts that must stay reachable outside the tunnel (the VPN
//! server) get host routes via the original gateway.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::Mutex;

use crate::context::InterfaceRegistry;
use crate::driver::PlatformNetworkDriver;
use crate::error::{Error, Result};
use crate::filter::FilterRouter;
use crate::kernel::{blocking, KernelNetwork};
use crate::route::{AddressFamily, Link, NetworkState, Route, Scope};

/// Parse `10.8.0.2/24` or a bare address (host prefix)
pub fn parse_interface_address(address: &str) -> Result<IpNet> {
    let address = address.trim();
    if let Ok(net) = address.parse::<IpNet>() {
        return Ok(net);
    }
    address
        .parse::<IpAddr>()
        .map(AddressFamily::host)
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// Gateway of an interface address: the network address plus one. Host
/// prefixes are widened to /24 or /120 first.
pub fn derive_gateway(address: &IpNet) -> IpAddr {
    let prefix = if address.prefix_len() == address.max_prefix_len() {
        match address {
            IpNet::V4(_) => 24,
            IpNet::V6(_) => 120,
        }
    } else {
        address.prefix_len()
    };
    match address {
        IpNet::V4(net) => {
            let network =
                u32::from(net.addr()) & u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(network.wrapping_add(1)))
        }
        IpNet::V6(net) => {
            let network =
                u128::from(net.addr()) & u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(network.wrapping_add(1)))
        }
    }
}

fn ignore_exists(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default)]
struct InterfaceRoutes {
    /// The split default routes installed through this interface
    defaults: Vec<Route>,
    /// Original default routes deleted to make room for them
    replaced: Vec<Route>,
}

/// A tunnel link with an address and a derived gateway
pub struct RoutableInterface {
    kernel: Arc<dyn KernelNetwork>,
    original: Arc<NetworkState>,
    link: Link,
    address: IpNet,
    gateway: IpAddr,
    replaces_default: bool,
    routes: Mutex<InterfaceRoutes>,
}

impl RoutableInterface {
    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn name(&self) -> &str {
        &self.link.name
    }

    pub fn address(&self) -> IpNet {
        self.address
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    fn gateway_route(&self) -> Route {
        Route::host(self.gateway)
            .with_link(self.link.clone())
            .with_scope(Scope::Link)
    }

    /// Route all traffic of the interface's family through it
    pub async fn make_default_route(&self) -> Result<()> {
        let family = AddressFamily::of_addr(&self.gateway);
        let mut routes = self.routes.lock().await;
        if !routes.defaults.is_empty() {
            return Ok(());
        }

        if self.replaces_default {
            if let Some(original) = self.original.default_for(family) {
                match self.kernel.delete_route(original).await {
                    Ok(()) => {
                        log::info!("Removed default route {}", original);
                        routes.replaced.push(original.clone());
                    }
                    Err(e) if e.is_not_found() => {
                        log::debug!("Default route {} already gone", original);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for net in family.split_default() {
            let route = Route::new(net)
                .via(self.gateway)
                .with_link(self.link.clone());
            if ignore_exists(self.kernel.add_route(&route).await)? {
                log::info!("Added route {}", route);
            }
            routes.defaults.push(route);
        }
        Ok(())
    }

    /// Remove the split defaults and bring the link down. Returns the
    /// original default routes to restore.
    async fn teardown(&self) -> Vec<Route> {
        let mut routes = self.routes.lock().await;
        for route in routes.defaults.drain(..) {
            match self.kernel.delete_route(&route).await {
                Ok(()) => log::debug!("Deleted route {}", route),
                Err(e) if e.is_not_found() => {}
                Err(e) => log::warn!("Failed to delete route {}: {}", route, e),
            }
        }
        match self.kernel.delete_route(&self.gateway_route()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("Failed to delete gateway route on {}: {}", self.link, e),
        }
        if let Err(e) = self.kernel.set_link_down(&self.link).await {
            log::warn!("Failed to bring {} down: {}", self.link, e);
        }
        std::mem::take(&mut routes.replaced)
    }
}

impl std::fmt::Debug for RoutableInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutableInterface")
            .field("link", &self.link)
            .field("address", &self.address)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Default)]
struct ManagerState {
    cleared: bool,
    interfaces: Vec<Arc<RoutableInterface>>,
    external_routes: Vec<Route>,
    filter_routers: Vec<Arc<FilterRouter>>,
}

/// Creates routable interfaces, external host routes and packet filter
/// routers, and undoes all of it on [`RouteManager::clear`].
pub struct RouteManager {
    driver: Arc<dyn PlatformNetworkDriver>,
    kernel: Arc<dyn KernelNetwork>,
    original: Arc<NetworkState>,
    registry: InterfaceRegistry,
    filter_table: String,
    state: Mutex<ManagerState>,
}

impl RouteManager {
    pub(crate) fn new(
        driver: Arc<dyn PlatformNetworkDriver>,
        original: Arc<NetworkState>,
        registry: InterfaceRegistry,
        filter_table: String,
    ) -> Self {
        Self {
            kernel: driver.kernel(),
            driver,
            original,
            registry,
            filter_table,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn check_active(state: &ManagerState) -> Result<()> {
        if state.cleared {
            return Err(Error::InvalidState("route manager has been cleared".into()));
        }
        Ok(())
    }

    /// Configure the existing link `name` with `address` ("10.8.0.2/24"):
    /// assign the address, bring the link up and add a link-scoped route
    /// to the derived gateway.
    pub async fn new_routable_interface(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<RoutableInterface>> {
        let mut state = self.state.lock().await;
        Self::check_active(&state)?;

        let address = parse_interface_address(address)?;
        let gateway = derive_gateway(&address);
        let link = self.kernel.link_by_name(name).await?;

        if !ignore_exists(self.kernel.add_link_address(&link, address).await)? {
            log::debug!("{} already has {}", link, address);
        }
        self.kernel.set_link_up(&link).await?;

        let iface = Arc::new(RoutableInterface {
            kernel: self.kernel.clone(),
            original: self.original.clone(),
            link: link.clone(),
            address,
            gateway,
            replaces_default: self.driver.replaces_default_route(),
            routes: Mutex::new(InterfaceRoutes::default()),
        });
        ignore_exists(self.kernel.add_route(&iface.gateway_route()).await)?;

        self.registry.register(link);
        state.interfaces.push(iface.clone());
        log::info!("Interface {} up with {} via {}", name, address, gateway);
        Ok(iface)
    }

    /// Keep `ips` reachable through the original default gateway of their
    /// family. Hosts without such a gateway are skipped.
    pub async fn add_external_route_to_ips(&self, ips: &[IpAddr]) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_active(&state)?;

        for ip in ips {
            let Some(default) = self.original.default_for(AddressFamily::of_addr(ip)) else {
                log::warn!("No original default route for {}, skipping", ip);
                continue;
            };
            let mut route = Route::host(*ip);
            route.gateway = default.gateway;
            route.link = default.link.clone();
            if state.external_routes.contains(&route) {
                continue;
            }
            match self.kernel.add_route(&route).await {
                Ok(()) => {
                    log::info!("Added external route {}", route);
                    state.external_routes.push(route);
                }
                Err(e) if e.is_exists() => log::debug!("Route {} already present", route),
                Err(e) => log::warn!("Failed to add external route {}: {}", route, e),
            }
        }
        Ok(())
    }

    /// Build a packet filter router on the platform filter. It is cleared
    /// with this manager.
    pub async fn new_filter_router(&self) -> Result<Arc<FilterRouter>> {
        let mut state = self.state.lock().await;
        Self::check_active(&state)?;

        let filter = self.driver.packet_filter()?;
        let table = self.filter_table.clone();
        let router = blocking(move || FilterRouter::new(filter, &table)).await?;
        let router = Arc::new(router);
        state.filter_routers.push(router.clone());
        Ok(router)
    }

    /// Interfaces created so far
    pub async fn interfaces(&self) -> Vec<Arc<RoutableInterface>> {
        self.state.lock().await.interfaces.clone()
    }

    /// Undo everything in reverse: filter routers, interfaces, external
    /// routes, then the replaced default routes. Errors are logged.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if state.cleared {
            return;
        }
        state.cleared = true;

        for router in state.filter_routers.drain(..) {
            if let Err(e) = blocking(move || router.clear()).await {
                log::warn!("Failed to clear packet filter: {}", e);
            }
        }

        let mut replaced = Vec::new();
        for iface in state.interfaces.drain(..) {
            replaced.extend(iface.teardown().await);
        }

        for route in state.external_routes.drain(..) {
            match self.kernel.delete_route(&route).await {
                Ok(()) => log::debug!("Deleted external route {}", route),
                Err(e) if e.is_not_found() => {}
                Err(e) => log::warn!("Failed to delete external route {}: {}", route, e),
            }
        }

        for route in replaced {
            match ignore_exists(self.kernel.add_route(&route).await) {
                Ok(_) => log::info!("Restored default route {}", route),
                Err(e) => log::warn!("Failed to restore default route {}: {}", route, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::kernel::MemoryKernel;

    #[test]
    fn test_derive_gateway() {
        let gw = |s: &str| derive_gateway(&parse_interface_address(s).unwrap()).to_string();
        assert_eq!(gw("10.8.0.2/32"), "10.8.0.1");
        assert_eq!(gw("10.8.0.2"), "10.8.0.1");
        assert_eq!(gw("10.9.3.200/16"), "10.9.0.1");
        assert_eq!(gw("172.16.5.6/30"), "172.16.5.5");
        assert_eq!(gw("fd00::1:2/128"), "fd00::1:1");
        assert_eq!(gw("fd00:1::99/64"), "fd00:1::1");
    }

    #[test]
    fn test_bad_address() {
        assert!(matches!(
            parse_interface_address("10.8.0"),
            Err(Error::InvalidAddress(_))
        ));
    }

    async fn manager(driver: MemoryDriver) -> (Arc<MemoryKernel>, RouteManager) {
        let kernel = driver.kernel.clone();
        let eth0 = kernel.add_link("eth0").await;
        kernel.add_link("wg0").await;
        kernel
            .seed_route(
                Route::new(AddressFamily::V4.any())
                    .via("192.168.1.1".parse().unwrap())
                    .with_link(eth0),
            )
            .await;
        let state = crate::discovery::discover_with_kernel(kernel.as_ref())
            .await
            .unwrap();
        let manager = RouteManager::new(
            Arc::new(driver),
            Arc::new(state),
            InterfaceRegistry::default(),
            "netplane".into(),
        );
        (kernel, manager)
    }

    #[tokio::test]
    async fn test_interface_setup() {
        let (kernel, manager) = manager(MemoryDriver::new()).await;
        let iface = manager
            .new_routable_interface("wg0", "10.8.0.2/32")
            .await
            .unwrap();
        assert_eq!(iface.gateway(), "10.8.0.1".parse::<IpAddr>().unwrap());

        let link = kernel.link_state("wg0").await.unwrap();
        assert!(link.up);
        assert_eq!(link.addresses, vec!["10.8.0.2/32".parse::<IpNet>().unwrap()]);
        let routes = kernel.routes().await;
        assert!(routes
            .iter()
            .any(|r| r.destination == "10.8.0.1/32".parse::<IpNet>().unwrap()
                && r.scope == Scope::Link));
        assert_eq!(manager.registry.first().unwrap().name, "wg0");
    }

    #[tokio::test]
    async fn test_missing_link_fails() {
        let (_kernel, manager) = manager(MemoryDriver::new()).await;
        let err = manager
            .new_routable_interface("tun9", "10.8.0.2/24")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_make_default_and_restore() {
        let (kernel, manager) = manager(MemoryDriver::new()).await;
        let original = kernel.routes().await;
        let iface = manager
            .new_routable_interface("wg0", "10.8.0.2/32")
            .await
            .unwrap();
        manager
            .add_external_route_to_ips(&["203.0.113.10".parse().unwrap()])
            .await
            .unwrap();
        iface.make_default_route().await.unwrap();
        iface.make_default_route().await.unwrap();

        let routes = kernel.routes().await;
        assert!(!routes.iter().any(|r| r.is_default()), "universal default removed");
        for half in AddressFamily::V4.split_default() {
            assert_eq!(routes.iter().filter(|r| r.destination == half).count(), 1);
        }
        let external = routes
            .iter()
            .find(|r| r.destination == "203.0.113.10/32".parse::<IpNet>().unwrap())
            .unwrap();
        assert_eq!(external.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(external.link_name(), Some("eth0"));

        manager.clear().await;
        manager.clear().await;
        assert_eq!(kernel.routes().await, original);
        assert!(!kernel.link_state("wg0").await.unwrap().up);
        assert!(matches!(
            manager.new_routable_interface("wg0", "10.8.0.2/32").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_default_kept_without_replacement() {
        let (kernel, manager) = manager(MemoryDriver::new().keeping_default_route()).await;
        let iface = manager
            .new_routable_interface("wg0", "10.8.0.2/24")
            .await
            .unwrap();
        iface.make_default_route().await.unwrap();
        assert!(kernel.routes().await.iter().any(|r| r.is_default()));
        manager.clear().await;
        assert_eq!(kernel.routes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_external_route_without_default_is_skipped() {
        let (kernel, manager) = manager(MemoryDriver::new()).await;
        let before = kernel.routes().await.len();
        manager
            .add_external_route_to_ips(&["2001:db8::1".parse().unwrap()])
            .await
            .unwrap();
        assert_eq!(kernel.routes().await.len(), before);
    }

    #[tokio::test]
    async fn test_filter_router_cleared_with_manager() {
        let driver = MemoryDriver::new();
        let filter = driver.filter.clone();
        let (_kernel, manager) = manager(driver).await;
        let router = manager.new_filter_router().await.unwrap();
        let table = router.tables()[0].clone();
        assert!(filter.has_table(&table));
        manager.clear().await;
        assert!(!filter.has_table(&table));
        assert!(router.is_cleared());
    }

    #[tokio::test]
    async fn test_filter_router_commits_off_the_runtime_thread() {
        let driver = MemoryDriver::new();
        let filter = driver.filter.clone();
        let (_kernel, manager) = manager(driver).await;
        manager.new_filter_router().await.unwrap();
        let worker = filter.last_commit_thread().unwrap();
        assert_ne!(worker, std::thread::current().id());

        manager.clear().await;
        assert_ne!(filter.last_commit_thread().unwrap(), std::thread::current().id());
    }
}

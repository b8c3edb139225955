//! Kernel routing and interface operations.
//!
//! [`KernelNetwork`] is the seam between the route manager and the host.
//! Linux talks rtnetlink directly ([`NetlinkKernel`]); macOS drives the BSD
//! `route` and `ifconfig` utilities ([`BsdRouteCommands`]); tests use the
//! in-memory [`MemoryKernel`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;

use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::route::{AddressFamily, Link, Route, Scope};

/// Routing table and link operations
#[async_trait]
pub trait KernelNetwork: Send + Sync {
    /// List the main routing table for one family
    async fn list_routes(&self, family: AddressFamily) -> Result<Vec<Route>>;

    async fn add_route(&self, route: &Route) -> Result<()>;

    async fn delete_route(&self, route: &Route) -> Result<()>;

    /// Assign `address` (with its prefix length) to `link`
    async fn add_link_address(&self, link: &Link, address: IpNet) -> Result<()>;

    async fn set_link_up(&self, link: &Link) -> Result<()>;

    async fn set_link_down(&self, link: &Link) -> Result<()>;

    async fn link_by_name(&self, name: &str) -> Result<Link>;

    async fn link_by_index(&self, index: u32) -> Result<Link>;

    /// Addresses assigned to `link`, IPv4 first
    async fn interface_addresses(&self, link: &Link) -> Result<Vec<IpNet>>;
}

/// Run a call that blocks on a netlink socket off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

#[cfg(target_os = "linux")]
pub use self::netlink::NetlinkKernel;

#[cfg(target_os = "linux")]
mod netlink {
    use super::*;

    use netplane_nl::rtnl::{self, RtRoute, RT_SCOPE_HOST, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE};

    fn af(family: AddressFamily) -> u8 {
        match family {
            AddressFamily::V4 => libc::AF_INET as u8,
            AddressFamily::V6 => libc::AF_INET6 as u8,
        }
    }

    fn to_rt(route: &Route) -> RtRoute {
        let mut rt = RtRoute::new(af(route.family()));
        if !route.is_default() {
            rt.dst = Some(route.destination.network());
        }
        rt.dst_len = route.destination.prefix_len();
        rt.gateway = route.gateway;
        rt.prefsrc = route.source;
        rt.oif = route.link.as_ref().map(|l| l.index);
        rt.priority = route.metric;
        rt.scope = match route.scope {
            Scope::Universe => RT_SCOPE_UNIVERSE,
            Scope::Link => RT_SCOPE_LINK,
            Scope::Host => RT_SCOPE_HOST,
        };
        rt
    }

    fn from_rt(family: AddressFamily, rt: RtRoute) -> Result<Route> {
        let destination = match rt.dst {
            Some(dst) => IpNet::new(dst, rt.dst_len)
                .map_err(|e| Error::InvalidPrefix(e.to_string()))?,
            None => family.any(),
        };
        let link = rt.oif.map(|index| {
            let name = rtnl::if_indextoname(index).unwrap_or_else(|_| format!("if{}", index));
            Link::new(index, name)
        });
        Ok(Route {
            destination,
            gateway: rt.gateway,
            source: rt.prefsrc,
            link,
            scope: match rt.scope {
                RT_SCOPE_LINK => Scope::Link,
                RT_SCOPE_HOST => Scope::Host,
                _ => Scope::Universe,
            },
            metric: rt.priority,
        })
    }

    /// rtnetlink backend
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NetlinkKernel;

    impl NetlinkKernel {
        pub fn new() -> Self {
            Self
        }
    }

    // rtnetlink calls block on the socket
    #[async_trait]
    impl KernelNetwork for NetlinkKernel {
        async fn list_routes(&self, family: AddressFamily) -> Result<Vec<Route>> {
            blocking(move || {
                rtnl::list_routes(af(family))?
                    .into_iter()
                    .map(|rt| from_rt(family, rt))
                    .collect()
            })
            .await
        }

        async fn add_route(&self, route: &Route) -> Result<()> {
            let rt = to_rt(route);
            blocking(move || Ok(rtnl::add_route(&rt)?)).await?;
            log::info!("Added route: {}", route);
            Ok(())
        }

        async fn delete_route(&self, route: &Route) -> Result<()> {
            let rt = to_rt(route);
            blocking(move || Ok(rtnl::del_route(&rt)?)).await?;
            log::info!("Deleted route: {}", route);
            Ok(())
        }

        async fn add_link_address(&self, link: &Link, address: IpNet) -> Result<()> {
            let index = link.index;
            blocking(move || Ok(rtnl::add_address(index, address.addr(), address.prefix_len())?))
                .await?;
            log::info!("Assigned {} to {}", address, link);
            Ok(())
        }

        async fn set_link_up(&self, link: &Link) -> Result<()> {
            let index = link.index;
            blocking(move || Ok(rtnl::set_link_up(index, true)?)).await
        }

        async fn set_link_down(&self, link: &Link) -> Result<()> {
            let index = link.index;
            blocking(move || Ok(rtnl::set_link_up(index, false)?)).await
        }

        async fn link_by_name(&self, name: &str) -> Result<Link> {
            let index = rtnl::if_nametoindex(name)
                .map_err(|_| Error::InterfaceNotFound(name.to_string()))?;
            Ok(Link::new(index, name))
        }

        async fn link_by_index(&self, index: u32) -> Result<Link> {
            let name = rtnl::if_indextoname(index)
                .map_err(|_| Error::InterfaceNotFound(format!("index {}", index)))?;
            Ok(Link::new(index, name))
        }

        async fn interface_addresses(&self, link: &Link) -> Result<Vec<IpNet>> {
            let index = link.index;
            blocking(move || {
                let mut nets = Vec::new();
                for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
                    for addr in rtnl::list_addresses(family)? {
                        if addr.index == index {
                            nets.push(
                                IpNet::new(addr.address, addr.prefix_len)
                                    .map_err(|e| Error::InvalidPrefix(e.to_string()))?,
                            );
                        }
                    }
                }
                Ok(nets)
            })
            .await
        }
    }
}

#[cfg(unix)]
fn if_nametoindex(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    (index != 0).then_some(index)
}

#[cfg(not(unix))]
fn if_nametoindex(_name: &str) -> Option<u32> {
    None
}

/// Route and interface changes through the BSD `route` and `ifconfig`
/// utilities.
///
/// `list_routes` only reports the default route of the family, which is
/// all `route -n get` exposes.
pub struct BsdRouteCommands {
    runner: Arc<dyn CommandRunner>,
}

impl BsdRouteCommands {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn family_flag(family: AddressFamily) -> &'static str {
        match family {
            AddressFamily::V4 => "-inet",
            AddressFamily::V6 => "-inet6",
        }
    }

    fn route_args(verb: &'static str, route: &Route) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            verb.to_string(),
            Self::family_flag(route.family()).to_string(),
        ];
        let is_host = route.destination.prefix_len() == route.destination.max_prefix_len();
        if is_host {
            args.push("-host".into());
            args.push(route.destination.addr().to_string());
        } else {
            args.push("-net".into());
            args.push(route.destination.to_string());
        }
        match (&route.gateway, &route.link) {
            (Some(gw), _) => args.push(gw.to_string()),
            (None, Some(link)) => {
                args.push("-interface".into());
                args.push(link.name.clone());
            }
            (None, None) => {}
        }
        args
    }
}

/// Parse `route -n get default` output into a default route.
pub(crate) fn parse_route_get(family: AddressFamily, output: &str) -> Option<Route> {
    let mut gateway = None;
    let mut interface = None;
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key.trim() {
            "gateway" => {
                // Link-local IPv6 gateways carry a zone suffix ("fe80::1%en0").
                let value = value.trim();
                let addr = value.split('%').next().unwrap_or(value);
                gateway = addr.parse::<IpAddr>().ok();
            }
            "interface" => interface = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let name = interface?;
    let index = if_nametoindex(&name).unwrap_or(0);
    let mut route = Route::new(family.any()).with_link(Link::new(index, name));
    if let Some(gw) = gateway {
        route = route.via(gw);
    }
    Some(route)
}

/// Parse the `inet`/`inet6` lines of `ifconfig <name>` output.
pub(crate) fn parse_ifconfig_addresses(output: &str) -> Vec<IpNet> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["inet", addr, rest @ ..] => {
                let Ok(addr) = addr.parse() else { continue };
                // netmask is printed as hex ("0xffffff00")
                let prefix = rest
                    .windows(2)
                    .find(|w| w[0] == "netmask")
                    .and_then(|w| u32::from_str_radix(w[1].trim_start_matches("0x"), 16).ok())
                    .map(|mask| mask.count_ones() as u8)
                    .unwrap_or(32);
                if let Ok(net) = IpNet::new(IpAddr::V4(addr), prefix) {
                    v4.push(net);
                }
            }
            ["inet6", addr, rest @ ..] => {
                let addr = addr.split('%').next().unwrap_or(*addr);
                let Ok(addr) = addr.parse() else { continue };
                let prefix = rest
                    .windows(2)
                    .find(|w| w[0] == "prefixlen")
                    .and_then(|w| w[1].parse().ok())
                    .unwrap_or(128);
                if let Ok(net) = IpNet::new(IpAddr::V6(addr), prefix) {
                    v6.push(net);
                }
            }
            _ => {}
        }
    }
    v4.extend(v6);
    v4
}

#[async_trait]
impl KernelNetwork for BsdRouteCommands {
    async fn list_routes(&self, family: AddressFamily) -> Result<Vec<Route>> {
        let args: &[&str] = match family {
            AddressFamily::V4 => &["-n", "get", "default"],
            AddressFamily::V6 => &["-n", "get", "-inet6", "default"],
        };
        let output = self.runner.run("route", args).await?;
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(parse_route_get(family, &output.stdout).into_iter().collect())
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        let args = Self::route_args("add", route);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run_checked("route", &args).await?;
        log::info!("Added route: {}", route);
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        let args = Self::route_args("delete", route);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run_checked("route", &args).await?;
        log::info!("Deleted route: {}", route);
        Ok(())
    }

    async fn add_link_address(&self, link: &Link, address: IpNet) -> Result<()> {
        let addr = address.addr().to_string();
        match address {
            IpNet::V4(_) => {
                let cidr = address.to_string();
                // point-to-point interfaces need a destination; use the local address
                self.runner
                    .run_checked("ifconfig", &[&link.name, "inet", &cidr, &addr, "alias"])
                    .await?;
            }
            IpNet::V6(_) => {
                let prefix = address.prefix_len().to_string();
                self.runner
                    .run_checked(
                        "ifconfig",
                        &[&link.name, "inet6", &addr, "prefixlen", &prefix, "alias"],
                    )
                    .await?;
            }
        }
        log::info!("Assigned {} to {}", address, link);
        Ok(())
    }

    async fn set_link_up(&self, link: &Link) -> Result<()> {
        self.runner.run_checked("ifconfig", &[&link.name, "up"]).await?;
        Ok(())
    }

    async fn set_link_down(&self, link: &Link) -> Result<()> {
        self.runner.run_checked("ifconfig", &[&link.name, "down"]).await?;
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        if_nametoindex(name)
            .map(|index| Link::new(index, name))
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        Err(Error::NotSupported(format!(
            "interface lookup by index ({}) via route commands",
            index
        )))
    }

    async fn interface_addresses(&self, link: &Link) -> Result<Vec<IpNet>> {
        let stdout = self.runner.run_checked("ifconfig", &[&link.name]).await?;
        Ok(parse_ifconfig_addresses(&stdout))
    }
}

/// State of one interface inside [`MemoryKernel`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLink {
    pub index: u32,
    pub up: bool,
    pub addresses: Vec<IpNet>,
}

/// In-memory kernel for tests: a flat route list and a set of links.
///
/// Adding a duplicate route fails with `EEXIST` and deleting a missing one
/// with `ESRCH`, like the real kernel.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    routes: Mutex<Vec<Route>>,
    links: Mutex<HashMap<String, MemoryLink>>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an interface that is down and has no addresses
    pub async fn add_link(&self, name: &str) -> Link {
        let mut links = self.links.lock().await;
        let index = links.len() as u32 + 1;
        let entry = links.entry(name.to_string()).or_insert(MemoryLink {
            index,
            ..Default::default()
        });
        Link::new(entry.index, name)
    }

    /// Install a route without going through `add_route`'s checks
    pub async fn seed_route(&self, route: Route) {
        self.routes.lock().await.push(route);
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.routes.lock().await.clone()
    }

    pub async fn link_state(&self, name: &str) -> Option<MemoryLink> {
        self.links.lock().await.get(name).cloned()
    }

    fn same_route(a: &Route, b: &Route) -> bool {
        a.destination == b.destination
            && a.gateway == b.gateway
            && (a.link.is_none() || b.link.is_none() || a.link_name() == b.link_name())
    }
}

#[async_trait]
impl KernelNetwork for MemoryKernel {
    async fn list_routes(&self, family: AddressFamily) -> Result<Vec<Route>> {
        Ok(self
            .routes
            .lock()
            .await
            .iter()
            .filter(|r| r.family() == family)
            .cloned()
            .collect())
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.lock().await;
        if routes.iter().any(|r| Self::same_route(r, route)) {
            return Err(netplane_nl::NetlinkError::Kernel(libc::EEXIST).into());
        }
        routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.lock().await;
        let before = routes.len();
        routes.retain(|r| !Self::same_route(r, route));
        if routes.len() == before {
            return Err(netplane_nl::NetlinkError::Kernel(libc::ESRCH).into());
        }
        Ok(())
    }

    async fn add_link_address(&self, link: &Link, address: IpNet) -> Result<()> {
        let mut links = self.links.lock().await;
        let state = links
            .get_mut(&link.name)
            .ok_or_else(|| Error::InterfaceNotFound(link.name.clone()))?;
        if state.addresses.contains(&address) {
            return Err(netplane_nl::NetlinkError::Kernel(libc::EEXIST).into());
        }
        state.addresses.push(address);
        Ok(())
    }

    async fn set_link_up(&self, link: &Link) -> Result<()> {
        let mut links = self.links.lock().await;
        let state = links
            .get_mut(&link.name)
            .ok_or_else(|| Error::InterfaceNotFound(link.name.clone()))?;
        state.up = true;
        Ok(())
    }

    async fn set_link_down(&self, link: &Link) -> Result<()> {
        {
            let mut links = self.links.lock().await;
            let state = links
                .get_mut(&link.name)
                .ok_or_else(|| Error::InterfaceNotFound(link.name.clone()))?;
            state.up = false;
        }
        // the kernel drops every route through a link that goes down
        self.routes
            .lock()
            .await
            .retain(|r| r.link_name() != Some(link.name.as_str()));
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        self.links
            .lock()
            .await
            .get(name)
            .map(|l| Link::new(l.index, name))
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        self.links
            .lock()
            .await
            .iter()
            .find(|(_, l)| l.index == index)
            .map(|(name, l)| Link::new(l.index, name.clone()))
            .ok_or_else(|| Error::InterfaceNotFound(format!("index {}", index)))
    }

    async fn interface_addresses(&self, link: &Link) -> Result<Vec<IpNet>> {
        self.links
            .lock()
            .await
            .get(&link.name)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| Error::InterfaceNotFound(link.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    const ROUTE_GET: &str = "   route to: default
destination: default
       mask: default
    gateway: 192.168.1.1
  interface: en0
      flags: <UP,GATEWAY,DONE,STATIC,PRCLONING,GLOBAL>
";

    const IFCONFIG: &str = "en0: flags=8863<UP,BROADCAST,SMART,RUNNING,SIMPLEX,MULTICAST> mtu 1500
\tether 3c:22:fb:00:00:01
\tinet6 fe80::1c2b:3a4d:5e6f:7081%en0 prefixlen 64 secured scopeid 0x6
\tinet 192.168.1.23 netmask 0xffffff00 broadcast 192.168.1.255
\tstatus: active
";

    #[test]
    fn test_parse_route_get() {
        let route = parse_route_get(AddressFamily::V4, ROUTE_GET).unwrap();
        assert!(route.is_default());
        assert_eq!(route.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(route.link_name(), Some("en0"));
    }

    #[test]
    fn test_parse_route_get_strips_zone() {
        let out = "gateway: fe80::1%en0\n  interface: en0\n";
        let route = parse_route_get(AddressFamily::V6, out).unwrap();
        assert_eq!(route.gateway, Some("fe80::1".parse().unwrap()));
        assert_eq!(route.destination, AddressFamily::V6.any());
    }

    #[test]
    fn test_parse_route_get_without_interface() {
        assert!(parse_route_get(AddressFamily::V4, "route: writing to routing socket: not in table").is_none());
    }

    #[test]
    fn test_parse_ifconfig_addresses() {
        let addrs = parse_ifconfig_addresses(IFCONFIG);
        assert_eq!(
            addrs,
            vec![
                "192.168.1.23/24".parse::<IpNet>().unwrap(),
                "fe80::1c2b:3a4d:5e6f:7081/64".parse::<IpNet>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_bsd_route_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let kernel = BsdRouteCommands::new(runner.clone());
        let route = Route::new("0.0.0.0/1".parse().unwrap()).via("10.8.0.1".parse().unwrap());
        kernel.add_route(&route).await.unwrap();
        let host = Route::host("203.0.113.10".parse().unwrap()).via("192.168.1.1".parse().unwrap());
        kernel.delete_route(&host).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "route -n add -inet -net 0.0.0.0/1 10.8.0.1",
                "route -n delete -inet -host 203.0.113.10 192.168.1.1",
            ]
        );
    }

    #[tokio::test]
    async fn test_bsd_route_failure_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("route -n add", CommandOutput::failed("route: writing to routing socket: File exists"));
        let kernel = BsdRouteCommands::new(runner);
        let route = Route::new("0.0.0.0/1".parse().unwrap()).via("10.8.0.1".parse().unwrap());
        assert!(matches!(kernel.add_route(&route).await, Err(Error::Command { .. })));
    }

    #[tokio::test]
    async fn test_memory_kernel_link_down_drops_routes() {
        let kernel = MemoryKernel::new();
        let tun = kernel.add_link("tun0").await;
        kernel.set_link_up(&tun).await.unwrap();
        let route = Route::new("10.8.0.0/24".parse().unwrap()).with_link(tun.clone());
        kernel.add_route(&route).await.unwrap();
        assert!(kernel.add_route(&route).await.unwrap_err().is_exists());

        kernel.set_link_down(&tun).await.unwrap();
        assert!(kernel.routes().await.is_empty());
        assert!(!kernel.link_state("tun0").await.unwrap().up);
        assert!(kernel.delete_route(&route).await.unwrap_err().is_not_found());
    }
}

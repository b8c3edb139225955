//! Route model shared by discovery, the route manager and kernel backends.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    /// The zero-length prefix of this family (`0.0.0.0/0` or `::/0`)
    pub fn any(self) -> IpNet {
        match self {
            AddressFamily::V4 => IpNet::V4(Ipv4Net::default()),
            AddressFamily::V6 => IpNet::V6(Ipv6Net::default()),
        }
    }

    /// The two `/1` halves covering the whole address space
    pub fn split_default(self) -> [IpNet; 2] {
        match self {
            AddressFamily::V4 => [
                IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(0, 0, 0, 0), 1)),
                IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(128, 0, 0, 0), 1)),
            ],
            AddressFamily::V6 => [
                IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 1)),
                IpNet::V6(Ipv6Net::new_assert(
                    Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0),
                    1,
                )),
            ],
        }
    }

    /// Full-length host prefix for `addr`
    pub fn host(addr: IpAddr) -> IpNet {
        match addr {
            IpAddr::V4(a) => IpNet::V4(Ipv4Net::new_assert(a, 32)),
            IpAddr::V6(a) => IpNet::V6(Ipv6Net::new_assert(a, 128)),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "inet"),
            AddressFamily::V6 => write!(f, "inet6"),
        }
    }
}

/// A network interface identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Route scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    /// Reachable through a gateway
    #[default]
    Universe,
    /// Directly reachable on the link
    Link,
    /// Local to this host
    Host,
}

/// A routing table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for direct/link routes)
    pub gateway: Option<IpAddr>,
    /// Preferred source address
    pub source: Option<IpAddr>,
    /// Outgoing interface
    pub link: Option<Link>,
    pub scope: Scope,
    /// Route metric/priority (lower = higher priority)
    pub metric: Option<u32>,
}

impl Route {
    /// Create a route to `destination` with nothing else set
    pub fn new(destination: IpNet) -> Self {
        Self {
            destination,
            gateway: None,
            source: None,
            link: None,
            scope: Scope::Universe,
            metric: None,
        }
    }

    /// Host route to a single address
    pub fn host(addr: IpAddr) -> Self {
        Self::new(AddressFamily::host(addr))
    }

    /// Set the gateway for this route
    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the interface for this route
    pub fn with_link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the metric for this route
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of_net(&self.destination)
    }

    /// Interface name, if the route is bound to one
    pub fn link_name(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.name.as_str())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "default")?;
        } else {
            write!(f, "{}", self.destination)?;
        }
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref link) = self.link {
            write!(f, " dev {}", link)?;
        }
        match self.scope {
            Scope::Universe => {}
            Scope::Link => write!(f, " scope link")?,
            Scope::Host => write!(f, " scope host")?,
        }
        if let Some(ref src) = self.source {
            write!(f, " src {}", src)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// Host routing state captured by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    /// Name of the default device. On macOS this is the network-service
    /// name ("Wi-Fi"), elsewhere the interface name.
    pub device_name: Option<String>,
    pub default_v4: Option<Route>,
    pub default_v6: Option<Route>,
    /// Additional zero-length-prefix routes
    pub scoped_defaults: Vec<Route>,
    pub static_routes: Vec<Route>,
}

impl NetworkState {
    /// Classify a route dump. The first default route of each family wins;
    /// later ones are kept as scoped defaults.
    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut state = NetworkState::default();
        for route in routes {
            if !route.is_default() {
                state.static_routes.push(route);
                continue;
            }
            let slot = match route.family() {
                AddressFamily::V4 => &mut state.default_v4,
                AddressFamily::V6 => &mut state.default_v6,
            };
            if slot.is_none() {
                *slot = Some(route);
            } else {
                state.scoped_defaults.push(route);
            }
        }
        state.device_name = state
            .default_route()
            .and_then(|r| r.link_name())
            .map(str::to_string);
        state
    }

    pub fn default_for(&self, family: AddressFamily) -> Option<&Route> {
        match family {
            AddressFamily::V4 => self.default_v4.as_ref(),
            AddressFamily::V6 => self.default_v6.as_ref(),
        }
    }

    /// The IPv4 default route, falling back to IPv6
    pub fn default_route(&self) -> Option<&Route> {
        self.default_v4.as_ref().or(self.default_v6.as_ref())
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "device: {}",
            self.device_name.as_deref().unwrap_or("(none)")
        )?;
        for (label, route) in [("ipv4", &self.default_v4), ("ipv6", &self.default_v6)] {
            match route {
                Some(r) => writeln!(f, "{} default: {}", label, r)?,
                None => writeln!(f, "{} default: (none)", label)?,
            }
        }
        for route in &self.scoped_defaults {
            writeln!(f, "scoped: {}", route)?;
        }
        for route in &self.static_routes {
            writeln!(f, "static: {}", route)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_route_display() {
        let route = Route::new(net("10.0.0.0/24"))
            .via(ip("192.168.1.1"))
            .with_link(Link::new(3, "tun0"))
            .with_metric(100);

        let display = route.to_string();
        assert_eq!(display, "10.0.0.0/24 via 192.168.1.1 dev tun0 metric 100");
        let default = Route::new(AddressFamily::V4.any()).via(ip("192.168.1.1"));
        assert_eq!(default.to_string(), "default via 192.168.1.1");
    }

    #[test]
    fn test_split_default_covers_everything() {
        let [low, high] = AddressFamily::V4.split_default();
        assert!(low.contains(&ip("1.2.3.4")));
        assert!(high.contains(&ip("200.1.1.1")));
        let [low6, high6] = AddressFamily::V6.split_default();
        assert!(low6.contains(&ip("2001:db8::1")));
        assert!(high6.contains(&ip("fe80::1")));
    }

    #[test]
    fn test_classify_routes() {
        let eth0 = Link::new(2, "eth0");
        let state = NetworkState::from_routes(vec![
            Route::new(net("192.168.1.0/24")).with_link(eth0.clone()),
            Route::new(net("0.0.0.0/0"))
                .via(ip("192.168.1.1"))
                .with_link(eth0.clone()),
            Route::new(net("0.0.0.0/0"))
                .via(ip("10.0.0.1"))
                .with_link(Link::new(4, "wlan0")),
            Route::new(net("::/0")).via(ip("fe80::1")).with_link(eth0),
        ]);

        assert_eq!(state.default_v4.as_ref().unwrap().gateway, Some(ip("192.168.1.1")));
        assert_eq!(state.scoped_defaults.len(), 1);
        assert_eq!(state.static_routes.len(), 1);
        assert!(state.default_v6.is_some());
        assert_eq!(state.device_name.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_default_route_falls_back_to_v6() {
        let state = NetworkState::from_routes(vec![Route::new(net("::/0"))
            .via(ip("fe80::1"))
            .with_link(Link::new(2, "eth0"))]);
        assert_eq!(state.default_route().unwrap().family(), AddressFamily::V6);
    }
}

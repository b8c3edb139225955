//! Platforms without route or DNS control. Discovery reports an empty
//! state and every change is refused.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{DnsScope, PlatformNetworkDriver};
use crate::dns::{DnsManager, NoopDns};
use crate::error::{Error, Result};
use crate::filter::PacketFilter;
use crate::kernel::KernelNetwork;
use crate::route::{AddressFamily, Link, NetworkState, Route};

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsDriver;

struct UnsupportedKernel;

fn unsupported<T>(what: &str) -> Result<T> {
    Err(Error::NotSupported(what.to_string()))
}

#[async_trait]
impl KernelNetwork for UnsupportedKernel {
    async fn list_routes(&self, _family: AddressFamily) -> Result<Vec<Route>> {
        Ok(Vec::new())
    }

    async fn add_route(&self, _route: &Route) -> Result<()> {
        unsupported("adding routes")
    }

    async fn delete_route(&self, _route: &Route) -> Result<()> {
        unsupported("deleting routes")
    }

    async fn add_link_address(&self, _link: &Link, _address: IpNet) -> Result<()> {
        unsupported("assigning addresses")
    }

    async fn set_link_up(&self, _link: &Link) -> Result<()> {
        unsupported("changing link state")
    }

    async fn set_link_down(&self, _link: &Link) -> Result<()> {
        unsupported("changing link state")
    }

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        Err(Error::InterfaceNotFound(name.to_string()))
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        Err(Error::InterfaceNotFound(format!("index {}", index)))
    }

    async fn interface_addresses(&self, _link: &Link) -> Result<Vec<IpNet>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl PlatformNetworkDriver for WindowsDriver {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn discover_default_route(&self) -> Result<NetworkState> {
        Ok(NetworkState::default())
    }

    fn dns_manager(&self, _scope: DnsScope) -> Arc<dyn DnsManager> {
        Arc::new(NoopDns)
    }

    fn kernel(&self) -> Arc<dyn KernelNetwork> {
        Arc::new(UnsupportedKernel)
    }

    fn packet_filter(&self) -> Result<Arc<dyn PacketFilter>> {
        unsupported("packet filtering")
    }

    async fn set_ipv6_disabled(&self, _device: &str, _disabled: bool) -> Result<()> {
        unsupported("toggling IPv6")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_discovery() {
        let state = WindowsDriver.discover_default_route().await.unwrap();
        assert!(state.default_route().is_none());
        assert!(state.device_name.is_none());
        assert!(WindowsDriver.packet_filter().is_err());
    }
}

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{DnsScope, PlatformNetworkDriver};
use crate::discovery::discover_with_kernel;
use crate::dns::{DnsManager, MemoryResolver, ResolvedDns};
use crate::error::Result;
use crate::filter::{MemoryFilter, PacketFilter};
use crate::kernel::{KernelNetwork, MemoryKernel};
use crate::route::NetworkState;

/// Driver over the in-memory backends, for tests.
///
/// Behaves like Linux unless built with [`MemoryDriver::keeping_default_route`].
pub struct MemoryDriver {
    pub kernel: Arc<MemoryKernel>,
    pub filter: Arc<MemoryFilter>,
    pub resolver: Arc<MemoryResolver>,
    replaces_default: bool,
    ipv6_toggles: Mutex<Vec<(String, bool)>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            kernel: Arc::new(MemoryKernel::new()),
            filter: Arc::new(MemoryFilter::new()),
            resolver: Arc::new(MemoryResolver::new()),
            replaces_default: true,
            ipv6_toggles: Mutex::new(Vec::new()),
        }
    }

    /// Leave the universal default route in place, like macOS
    pub fn keeping_default_route(mut self) -> Self {
        self.replaces_default = false;
        self
    }

    /// `(device, disabled)` for every IPv6 toggle, in order
    pub fn ipv6_toggles(&self) -> Vec<(String, bool)> {
        self.ipv6_toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformNetworkDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn discover_default_route(&self) -> Result<NetworkState> {
        discover_with_kernel(self.kernel.as_ref()).await
    }

    fn dns_manager(&self, scope: DnsScope) -> Arc<dyn DnsManager> {
        Arc::new(ResolvedDns::with_timeout(
            self.resolver.clone(),
            scope.interfaces,
            scope.timeout,
        ))
    }

    fn kernel(&self) -> Arc<dyn KernelNetwork> {
        self.kernel.clone()
    }

    fn packet_filter(&self) -> Result<Arc<dyn PacketFilter>> {
        Ok(self.filter.clone())
    }

    async fn set_ipv6_disabled(&self, device: &str, disabled: bool) -> Result<()> {
        self.ipv6_toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device.to_string(), disabled));
        Ok(())
    }

    fn replaces_default_route(&self) -> bool {
        self.replaces_default
    }
}

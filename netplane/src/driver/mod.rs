//! Platform drivers.
//!
//! A [`PlatformNetworkDriver`] bundles everything the control plane needs
//! from one operating system. The core never branches on the target OS;
//! it asks the driver chosen by [`default_driver`].

#[cfg(target_os = "linux")]
mod linux;
mod macos;
mod memory;
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxDriver;
pub use macos::{parse_hardware_ports, MacosDriver};
pub use memory::MemoryDriver;
pub use windows::WindowsDriver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::InterfaceRegistry;
use crate::dns::DnsManager;
use crate::error::Result;
use crate::filter::PacketFilter;
use crate::kernel::KernelNetwork;
use crate::route::NetworkState;

/// What a DNS manager is bound to
#[derive(Debug, Clone)]
pub struct DnsScope {
    /// Default device (macOS network service)
    pub device_name: Option<String>,
    /// Tunnel interfaces of the owning context
    pub interfaces: InterfaceRegistry,
    /// Deadline for each resolver call
    pub timeout: Duration,
}

#[async_trait]
pub trait PlatformNetworkDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capture the current default routes
    async fn discover_default_route(&self) -> Result<NetworkState>;

    fn dns_manager(&self, scope: DnsScope) -> Arc<dyn DnsManager>;

    fn kernel(&self) -> Arc<dyn KernelNetwork>;

    /// Packet filter backend, where the platform has one
    fn packet_filter(&self) -> Result<Arc<dyn PacketFilter>>;

    async fn set_ipv6_disabled(&self, device: &str, disabled: bool) -> Result<()>;

    /// Whether the universal default route must be deleted before the
    /// split default routes are installed
    fn replaces_default_route(&self) -> bool {
        false
    }
}

/// The driver for the running operating system
pub fn default_driver() -> Arc<dyn PlatformNetworkDriver> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxDriver::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacosDriver::new(Arc::new(
            crate::command::SystemCommandRunner,
        )))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(WindowsDriver)
    }
}

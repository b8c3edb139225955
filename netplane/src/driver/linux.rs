use std::sync::Arc;

use async_trait::async_trait;

use super::{DnsScope, PlatformNetworkDriver};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::discovery::discover_with_kernel;
use crate::dns::{DnsManager, ResolvectlBus, ResolvedDns};
use crate::error::Result;
use crate::filter::{NftablesFilter, PacketFilter};
use crate::kernel::{KernelNetwork, NetlinkKernel};
use crate::route::NetworkState;

/// rtnetlink routes, nftables, systemd-resolved
pub struct LinuxDriver {
    kernel: Arc<NetlinkKernel>,
    runner: Arc<dyn CommandRunner>,
}

impl LinuxDriver {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            kernel: Arc::new(NetlinkKernel::new()),
            runner,
        }
    }
}

impl Default for LinuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformNetworkDriver for LinuxDriver {
    fn name(&self) -> &'static str {
        "linux"
    }

    async fn discover_default_route(&self) -> Result<NetworkState> {
        discover_with_kernel(self.kernel.as_ref()).await
    }

    fn dns_manager(&self, scope: DnsScope) -> Arc<dyn DnsManager> {
        let bus = Arc::new(ResolvectlBus::new(self.runner.clone()));
        Arc::new(ResolvedDns::with_timeout(bus, scope.interfaces, scope.timeout))
    }

    fn kernel(&self) -> Arc<dyn KernelNetwork> {
        self.kernel.clone()
    }

    fn packet_filter(&self) -> Result<Arc<dyn PacketFilter>> {
        Ok(Arc::new(NftablesFilter::new()))
    }

    async fn set_ipv6_disabled(&self, device: &str, disabled: bool) -> Result<()> {
        let setting = format!(
            "net.ipv6.conf.{}.disable_ipv6={}",
            device,
            if disabled { 1 } else { 0 }
        );
        self.runner.run_checked("sysctl", &["-w", &setting]).await?;
        Ok(())
    }

    fn replaces_default_route(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;

    #[tokio::test]
    async fn test_ipv6_toggle_uses_sysctl() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = LinuxDriver::with_runner(runner.clone());
        driver.set_ipv6_disabled("eth0", true).await.unwrap();
        driver.set_ipv6_disabled("eth0", false).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "sysctl -w net.ipv6.conf.eth0.disable_ipv6=1",
                "sysctl -w net.ipv6.conf.eth0.disable_ipv6=0"
            ]
        );
        assert!(driver.replaces_default_route());
    }
}

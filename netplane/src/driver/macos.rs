//! macOS: BSD `route`/`ifconfig` and `networksetup`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DnsScope, PlatformNetworkDriver};
use crate::command::CommandRunner;
use crate::discovery::discover_with_kernel;
use crate::dns::{DnsManager, NetworkSetupDns, NoopDns};
use crate::error::{Error, Result};
use crate::filter::PacketFilter;
use crate::kernel::{BsdRouteCommands, KernelNetwork};
use crate::route::NetworkState;

/// Map an interface ("en0") to its hardware port name ("Wi-Fi") from
/// `networksetup -listallhardwareports` output.
pub fn parse_hardware_ports(output: &str, device: &str) -> Option<String> {
    let mut port = None;
    for line in output.lines() {
        if let Some(name) = line.strip_prefix("Hardware Port:") {
            port = Some(name.trim().to_string());
        } else if let Some(dev) = line.strip_prefix("Device:") {
            if dev.trim() == device {
                return port;
            }
        }
    }
    None
}

pub struct MacosDriver {
    runner: Arc<dyn CommandRunner>,
    kernel: Arc<BsdRouteCommands>,
}

impl MacosDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            kernel: Arc::new(BsdRouteCommands::new(runner.clone())),
            runner,
        }
    }
}

#[async_trait]
impl PlatformNetworkDriver for MacosDriver {
    fn name(&self) -> &'static str {
        "macos"
    }

    async fn discover_default_route(&self) -> Result<NetworkState> {
        let mut state = discover_with_kernel(self.kernel.as_ref()).await?;
        let Some(device) = state.device_name.take() else {
            return Ok(state);
        };

        let ports = self
            .runner
            .run_checked("networksetup", &["-listallhardwareports"])
            .await?;
        state.device_name = parse_hardware_ports(&ports, &device);
        if state.device_name.is_none() {
            log::warn!("No network service found for {}", device);
        }
        Ok(state)
    }

    fn dns_manager(&self, scope: DnsScope) -> Arc<dyn DnsManager> {
        match scope.device_name {
            Some(service) => Arc::new(NetworkSetupDns::new(self.runner.clone(), service)),
            None => {
                log::warn!("No default network service, DNS will not be changed");
                Arc::new(NoopDns)
            }
        }
    }

    fn kernel(&self) -> Arc<dyn KernelNetwork> {
        self.kernel.clone()
    }

    fn packet_filter(&self) -> Result<Arc<dyn PacketFilter>> {
        Err(Error::NotSupported("packet filtering on macOS".into()))
    }

    async fn set_ipv6_disabled(&self, device: &str, disabled: bool) -> Result<()> {
        let flag = if disabled { "-setv6off" } else { "-setv6automatic" };
        self.runner.run_checked("networksetup", &[flag, device]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    const HARDWARE_PORTS: &str = "
Hardware Port: Ethernet
Device: en1
Ethernet Address: 3c:22:fb:00:00:02

Hardware Port: Wi-Fi
Device: en0
Ethernet Address: 3c:22:fb:00:00:01
";

    #[test]
    fn test_parse_hardware_ports() {
        assert_eq!(
            parse_hardware_ports(HARDWARE_PORTS, "en0").as_deref(),
            Some("Wi-Fi")
        );
        assert_eq!(parse_hardware_ports(HARDWARE_PORTS, "en9"), None);
    }

    #[tokio::test]
    async fn test_discovery_maps_service_name() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "route -n get default",
            CommandOutput::ok("gateway: 192.168.1.1\ninterface: en0\n"),
        );
        runner.respond(
            "route -n get -inet6 default",
            CommandOutput::failed("not in table"),
        );
        runner.respond(
            "ifconfig en0",
            CommandOutput::ok("\tinet 192.168.1.23 netmask 0xffffff00\n"),
        );
        runner.respond("networksetup -listallhardwareports", CommandOutput::ok(HARDWARE_PORTS));

        let driver = MacosDriver::new(runner.clone());
        let state = driver.discover_default_route().await.unwrap();
        assert_eq!(state.device_name.as_deref(), Some("Wi-Fi"));
        let default = state.default_v4.unwrap();
        assert_eq!(default.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(default.source, Some("192.168.1.23".parse().unwrap()));
        assert!(state.default_v6.is_none());
    }

    #[tokio::test]
    async fn test_ipv6_toggle_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = MacosDriver::new(runner.clone());
        driver.set_ipv6_disabled("Wi-Fi", true).await.unwrap();
        driver.set_ipv6_disabled("Wi-Fi", false).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "networksetup -setv6off Wi-Fi",
                "networksetup -setv6automatic Wi-Fi"
            ]
        );
    }
}

//! Configuration types for a tunnel profile

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::filter::{PortForward, Protocol, SecurityGroup, TrafficForward};

/// Main configuration structure
///
/// The profile is a TOML file. `[filter]` and `[dns]` tune the control
/// plane itself; `[tunnel]` describes the interface to bring up and the
/// policy to install on it.
///
/// # Example Configuration
///
/// ```toml
/// [filter]
/// table = "netplane"
///
/// [dns]
/// bus_timeout_secs = 5
///
/// [tunnel]
/// interface = "wg0"
/// address = "10.8.0.2/32"
/// make_default = true
/// dns_servers = ["10.8.0.1"]
///
/// [[tunnel.security_groups]]
/// interface = "wg0"
/// src = "10.0.0.0/24"
/// ports = [{ protocol = "tcp", from_port = 22, to_port = 22 }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Tunnel profile; `None` only inspects the host
    pub tunnel: Option<TunnelConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.dns.validate()?;
        if let Some(ref tunnel) = self.tunnel {
            tunnel.validate()?;
        }
        Ok(())
    }

    /// Get the tunnel configuration, or error if not present
    pub fn tunnel_config(&self) -> Result<&TunnelConfig> {
        self.tunnel
            .as_ref()
            .ok_or_else(|| Error::Config("[tunnel] section is required".into()))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# netplane tunnel profile

# Packet filter settings (Linux only)
[filter]
# Name of the nftables tables created for this profile (ip and ip6).
# Existing tables with this name are replaced on startup.
table = "netplane"

# DNS settings
[dns]
# Deadline for each call to systemd-resolved, in seconds (default: 5)
bus_timeout_secs = 5

[tunnel]
# Tunnel interface; it must already exist (created by the VPN client)
interface = "wg0"

# Address to assign, with prefix. Host prefixes (/32, /128) are widened
# to /24 or /120 to derive the gateway (network address + 1).
address = "10.8.0.2/32"

# Route all traffic through the tunnel using 0.0.0.0/1 + 128.0.0.0/1
make_default = true

# Turn IPv6 off on the default device while the tunnel is up
disable_ipv6 = false

# Addresses that must stay reachable outside the tunnel (VPN servers)
external_ips = ["203.0.113.10"]

# DNS servers and search domains to use while connected
dns_servers = ["10.8.0.1"]
search_domains = ["corp.example"]

# Security groups. `interface` binds the group to inbound traffic on one
# interface; without `dst` the rules filter traffic to this host,
# with `dst` they filter forwarded traffic.
[[tunnel.security_groups]]
interface = "wg0"
src = "10.0.0.0/24"
deny = false
ports = [
    { protocol = "tcp", from_port = 22, to_port = 22 },
    { protocol = "icmp" },
]

# Destination NAT: connections to `port` (optionally only on `dst_ip`)
# go to forward_ip:forward_port
[[tunnel.port_forwards]]
port = 443
forward_ip = "10.0.0.5"
forward_port = 8443
protocol = "tcp"

# Forward traffic between interfaces, masquerading it when `nat` is set
[[tunnel.traffic_forwards]]
src_interface = "wg0"
src = "10.8.0.0/24"
dst_interface = "eth0"
dst = "0.0.0.0/0"
nat = true
"#
        .to_string()
    }
}

/// Packet filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// nftables table name
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() || self.table.len() >= 256 {
            return Err(Error::Config(format!(
                "invalid filter table name '{}'",
                self.table
            )));
        }
        Ok(())
    }
}

/// DNS manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Deadline for each resolver bus call, in seconds
    #[serde(default = "default_bus_timeout")]
    pub bus_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bus_timeout_secs: default_bus_timeout(),
        }
    }
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bus_timeout_secs == 0 {
            return Err(Error::Config("bus_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_secs(self.bus_timeout_secs)
    }
}

/// A security group optionally bound to an inbound interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupEntry {
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(flatten)]
    pub group: SecurityGroup,
}

/// The tunnel to bring up and the policy to apply to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Existing tunnel interface name
    pub interface: String,

    /// Address with prefix to assign to the interface
    pub address: IpNet,

    /// Make the tunnel the default path
    #[serde(default)]
    pub make_default: bool,

    /// Disable IPv6 on the default device while up
    #[serde(default)]
    pub disable_ipv6: bool,

    /// Hosts routed via the original default gateway
    #[serde(default)]
    pub external_ips: Vec<IpAddr>,

    #[serde(default)]
    pub dns_servers: Vec<String>,

    #[serde(default)]
    pub search_domains: Vec<String>,

    #[serde(default)]
    pub security_groups: Vec<SecurityGroupEntry>,

    #[serde(default)]
    pub port_forwards: Vec<PortForward>,

    #[serde(default)]
    pub traffic_forwards: Vec<TrafficForward>,
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(Error::Config("tunnel interface is required".into()));
        }

        for entry in &self.security_groups {
            entry.group.validate()?;
            for pg in &entry.group.ports {
                if pg.protocol == Protocol::Icmp && (pg.from_port != 0 || pg.to_port != 0) {
                    log::warn!("ports on an icmp entry are ignored");
                }
            }
        }

        for pf in &self.port_forwards {
            pf.validate()?;
        }

        for tf in &self.traffic_forwards {
            tf.validate()?;
        }

        Ok(())
    }

    /// Whether any packet filter policy is configured
    pub fn has_filter_policy(&self) -> bool {
        !self.security_groups.is_empty()
            || !self.port_forwards.is_empty()
            || !self.traffic_forwards.is_empty()
    }
}

fn default_table() -> String {
    "netplane".to_string()
}

fn default_bus_timeout() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PortGroup;

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        let tunnel = config.tunnel_config().unwrap();
        assert_eq!(config.filter.table, "netplane");
        assert_eq!(config.dns.bus_timeout(), Duration::from_secs(5));
        assert_eq!(tunnel.interface, "wg0");
        assert_eq!(tunnel.address, "10.8.0.2/32".parse::<IpNet>().unwrap());
        assert!(tunnel.make_default);

        let sg = &tunnel.security_groups[0];
        assert_eq!(sg.interface.as_deref(), Some("wg0"));
        assert_eq!(
            sg.group.ports,
            vec![PortGroup::new(Protocol::Tcp, 22, 22), PortGroup::icmp()]
        );
        assert_eq!(tunnel.port_forwards[0].forward_port, 8443);
        assert!(tunnel.traffic_forwards[0].nat);
        assert!(tunnel.has_filter_policy());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.filter.table, "netplane");
        assert_eq!(config.dns.bus_timeout_secs, 5);
        assert!(config.tunnel.is_none());
        assert!(config.tunnel_config().is_err());
    }

    #[test]
    fn test_zero_timeout_fails() {
        let result = Config::from_toml("[dns]\nbus_timeout_secs = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_table_fails() {
        let result = Config::from_toml("[filter]\ntable = \"\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_mixed_family_group_fails() {
        let toml = r#"
[tunnel]
interface = "wg0"
address = "10.8.0.2/24"

[[tunnel.security_groups]]
src = "10.0.0.0/24"
dst = "fd00::/64"
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(Error::FamilyMismatch(_))
        ));
    }

    #[test]
    fn test_reversed_port_range_fails() {
        let toml = r#"
[tunnel]
interface = "wg0"
address = "10.8.0.2/24"

[[tunnel.security_groups]]
ports = [{ protocol = "udp", from_port = 60, to_port = 50 }]
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(&path, "[filter]\ntable = \"corp\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.filter.table, "corp");

        let missing = Config::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_bad_address_is_parse_error() {
        let toml = "[tunnel]\ninterface = \"wg0\"\naddress = \"not-an-ip\"\n";
        assert!(matches!(
            Config::from_toml(toml),
            Err(Error::ConfigParse(_))
        ));
    }
}

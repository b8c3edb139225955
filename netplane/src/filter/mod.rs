//! Stateful packet filter: security groups, port forwarding and
//! inter-interface traffic forwarding compiled into nftables objects.
//!
//! [`FilterRouter`] owns the policy model and talks to the kernel through
//! the [`PacketFilter`] trait. [`NftablesFilter`] is the Linux backend;
//! [`MemoryFilter`] is an in-memory stand-in for tests.

mod keys;
mod memory;
mod refcount;
mod router;

#[cfg(target_os = "linux")]
mod nftables;

pub use keys::{port_forward_key, port_vmap_names, sg_key, traffic_forward_key};
pub use memory::MemoryFilter;
pub use refcount::{RefCounts, RuleRef};
pub use router::{iif_chain, port_element_key, FilterRouter};

#[cfg(target_os = "linux")]
pub use self::nftables::NftablesFilter;

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use netplane_nl::nftables::{Chain, Rule, Set, SetElement, Table, TableFamily};

use crate::error::{Error, Result};
use crate::route::AddressFamily;

/// Batched access to the kernel packet filter.
///
/// Mutations are queued and take effect atomically on [`PacketFilter::commit`].
/// Reads always see committed state.
pub trait PacketFilter: Send + Sync {
    fn add_table(&self, table: &Table) -> Result<()>;

    fn del_table(&self, table: &Table) -> Result<()>;

    fn add_chain(&self, chain: &Chain) -> Result<()>;

    /// Append a rule to the end of its chain
    fn add_rule(&self, rule: &Rule) -> Result<()>;

    /// Delete a committed rule by handle
    fn del_rule(&self, rule: &Rule) -> Result<()>;

    fn add_set(&self, set: &Set) -> Result<()>;

    fn del_set(&self, set: &Set) -> Result<()>;

    /// Remove every element of a set
    fn flush_set(&self, set: &Set) -> Result<()>;

    fn set_add_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()>;

    fn set_delete_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()>;

    /// Rules of one chain with their kernel handles
    fn get_rules(&self, table: &Table, chain: &str) -> Result<Vec<Rule>>;

    fn get_set_elements(&self, set: &Set) -> Result<Vec<SetElement>>;

    /// Apply every queued mutation in one transaction
    fn commit(&self) -> Result<()>;

    /// Drop queued mutations without applying them
    fn discard(&self);
}

/// Transport protocol of a port group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// IP protocol number for a table family (ICMP is ICMPv6 in `ip6`)
    pub fn number(self, family: TableFamily) -> u8 {
        match (self, family) {
            (Protocol::Tcp, _) => 6,
            (Protocol::Udp, _) => 17,
            (Protocol::Icmp, TableFamily::Ipv6) => 58,
            (Protocol::Icmp, _) => 1,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// A protocol with an inclusive destination port range. ICMP ignores ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortGroup {
    pub protocol: Protocol,
    #[serde(default)]
    pub from_port: u16,
    #[serde(default)]
    pub to_port: u16,
}

impl PortGroup {
    pub fn new(protocol: Protocol, from_port: u16, to_port: u16) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
        }
    }

    pub fn icmp() -> Self {
        Self::new(Protocol::Icmp, 0, 0)
    }
}

/// Allowed or denied traffic by network scope and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SecurityGroup {
    #[serde(default)]
    pub src: Option<IpNet>,
    #[serde(default)]
    pub dst: Option<IpNet>,
    #[serde(default)]
    pub ports: Vec<PortGroup>,
    #[serde(default)]
    pub deny: bool,
}

impl SecurityGroup {
    /// Check the family and port-range invariants
    pub fn validate(&self) -> Result<()> {
        if let (Some(src), Some(dst)) = (&self.src, &self.dst) {
            if AddressFamily::of_net(src) != AddressFamily::of_net(dst) {
                return Err(Error::FamilyMismatch(format!(
                    "security group src {} and dst {}",
                    src, dst
                )));
            }
        }
        for pg in &self.ports {
            if pg.protocol != Protocol::Icmp && pg.from_port > pg.to_port {
                return Err(Error::Config(format!(
                    "port range {}-{} for {} is reversed",
                    pg.from_port, pg.to_port, pg.protocol
                )));
            }
        }
        Ok(())
    }

    /// Table families this group applies to
    pub fn families(&self) -> Vec<TableFamily> {
        match self.src.as_ref().or(self.dst.as_ref()) {
            Some(net) => vec![table_family(AddressFamily::of_net(net))],
            None => vec![TableFamily::Ipv4, TableFamily::Ipv6],
        }
    }
}

/// A destination NAT entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForward {
    /// Match only traffic to this address
    #[serde(default)]
    pub dst_ip: Option<IpAddr>,
    pub port: u16,
    pub forward_ip: IpAddr,
    pub forward_port: u16,
    pub protocol: Protocol,
}

impl PortForward {
    pub fn validate(&self) -> Result<()> {
        if self.protocol == Protocol::Icmp {
            return Err(Error::Config("port forwards need tcp or udp".into()));
        }
        if let Some(dst) = &self.dst_ip {
            if AddressFamily::of_addr(dst) != AddressFamily::of_addr(&self.forward_ip) {
                return Err(Error::FamilyMismatch(format!(
                    "port forward {} -> {}",
                    dst, self.forward_ip
                )));
            }
        }
        Ok(())
    }
}

/// Forwarding between two interfaces, optionally masqueraded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficForward {
    pub src_interface: String,
    pub src: IpNet,
    pub dst_interface: String,
    pub dst: IpNet,
    #[serde(default)]
    pub nat: bool,
}

impl TrafficForward {
    pub fn validate(&self) -> Result<()> {
        if AddressFamily::of_net(&self.src) != AddressFamily::of_net(&self.dst) {
            return Err(Error::FamilyMismatch(format!(
                "traffic forward {} -> {}",
                self.src, self.dst
            )));
        }
        Ok(())
    }
}

pub(crate) fn table_family(family: AddressFamily) -> TableFamily {
    match family {
        AddressFamily::V4 => TableFamily::Ipv4,
        AddressFamily::V6 => TableFamily::Ipv6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_family_mismatch() {
        let group = SecurityGroup {
            src: Some("10.0.0.0/24".parse().unwrap()),
            dst: Some("fd00::/64".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(group.validate(), Err(Error::FamilyMismatch(_))));
    }

    #[test]
    fn test_group_families() {
        let any = SecurityGroup::default();
        assert_eq!(any.families(), vec![TableFamily::Ipv4, TableFamily::Ipv6]);
        let v6 = SecurityGroup {
            dst: Some("fd00::/64".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(v6.families(), vec![TableFamily::Ipv6]);
    }

    #[test]
    fn test_reversed_ports_rejected() {
        let group = SecurityGroup {
            ports: vec![PortGroup::new(Protocol::Tcp, 90, 80)],
            ..Default::default()
        };
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_icmp_number_per_family() {
        assert_eq!(Protocol::Icmp.number(TableFamily::Ipv4), 1);
        assert_eq!(Protocol::Icmp.number(TableFamily::Ipv6), 58);
        assert_eq!(Protocol::Udp.number(TableFamily::Ipv6), 17);
    }

    #[test]
    fn test_port_forward_validation() {
        let pf = PortForward {
            dst_ip: None,
            port: 53,
            forward_ip: "10.0.0.5".parse().unwrap(),
            forward_port: 53,
            protocol: Protocol::Icmp,
        };
        assert!(pf.validate().is_err());
    }
}

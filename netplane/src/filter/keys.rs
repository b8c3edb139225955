//! Deterministic identifiers for installed rule groups.

use std::net::IpAddr;

use ipnet::IpNet;
use sha2::{Digest, Sha256};

use super::{Protocol, SecurityGroup};

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

fn opt<T: ToString>(value: Option<&T>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

/// Key of the rules installed for one security group.
///
/// Covers the scope (interface, src, dst), the sorted port list and the
/// verdict, so two groups differing in any of them never collide.
pub fn sg_key(iif: Option<&str>, group: &SecurityGroup) -> String {
    let mut ports = group.ports.clone();
    ports.sort();
    let ports = ports
        .iter()
        .map(|p| format!("{}:{}-{}", p.protocol, p.from_port, p.to_port))
        .collect::<Vec<_>>()
        .join(",");
    let verdict = if group.deny { "deny" } else { "accept" };
    format!(
        "sg-{}",
        digest(&[
            iif.unwrap_or(""),
            &opt(group.src.as_ref()),
            &opt(group.dst.as_ref()),
            &ports,
            verdict,
        ])
    )
}

/// Names of the IPv4 and IPv6 port maps shared by every group with the
/// same interface and prefixes.
pub fn port_vmap_names(iif: Option<&str>, group: &SecurityGroup) -> (String, String) {
    let hash = digest(&[
        iif.unwrap_or(""),
        &opt(group.src.as_ref()),
        &opt(group.dst.as_ref()),
    ]);
    (format!("pm4-{}", hash), format!("pm6-{}", hash))
}

pub fn port_forward_key(
    dst_ip: Option<IpAddr>,
    port: u16,
    forward_ip: IpAddr,
    forward_port: u16,
    protocol: Protocol,
) -> String {
    format!(
        "pf-{}",
        digest(&[
            &opt(dst_ip.as_ref()),
            &port.to_string(),
            &forward_ip.to_string(),
            &forward_port.to_string(),
            &protocol.to_string(),
        ])
    )
}

pub fn traffic_forward_key(src_if: &str, src: &IpNet, dst_if: &str, dst: &IpNet) -> String {
    format!(
        "tf-{}",
        digest(&[src_if, &src.to_string(), dst_if, &dst.to_string()])
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PortGroup;

    fn group(ports: Vec<PortGroup>) -> SecurityGroup {
        SecurityGroup {
            src: Some("10.0.0.0/24".parse().unwrap()),
            ports,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_scope_shares_port_map() {
        let ssh = group(vec![PortGroup::new(Protocol::Tcp, 22, 22)]);
        let web = group(vec![PortGroup::new(Protocol::Tcp, 80, 80)]);

        assert_ne!(sg_key(Some("wg0"), &ssh), sg_key(Some("wg0"), &web));
        assert_eq!(
            port_vmap_names(Some("wg0"), &ssh),
            port_vmap_names(Some("wg0"), &web)
        );
        assert_ne!(
            port_vmap_names(Some("wg0"), &ssh),
            port_vmap_names(Some("wg1"), &ssh)
        );
    }

    #[test]
    fn test_sg_key_ignores_port_order() {
        let a = group(vec![
            PortGroup::new(Protocol::Udp, 53, 53),
            PortGroup::new(Protocol::Tcp, 22, 22),
        ]);
        let b = group(vec![
            PortGroup::new(Protocol::Tcp, 22, 22),
            PortGroup::new(Protocol::Udp, 53, 53),
        ]);
        assert_eq!(sg_key(None, &a), sg_key(None, &b));
    }

    #[test]
    fn test_names_fit_nftables_limits() {
        let (v4, v6) = port_vmap_names(None, &group(vec![]));
        assert_eq!(v4.len(), 20);
        assert!(v6.starts_with("pm6-"));
    }
}

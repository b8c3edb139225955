//! rtnetlink requests: routes, interface addresses and link state.

use std::ffi::{CStr, CString};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::netlink::{
    attr_u32, AttrIter, MsgBuffer, NetlinkSocket, NLMSG_ALIGNTO, NETLINK_ROUTE, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use crate::{NetlinkError, Result};

const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const RTM_GETADDR: u16 = 22;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_GETROUTE: u16 = 26;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;
const RTA_PREFSRC: u16 = 7;
const RTA_TABLE: u16 = 15;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RT_TABLE_MAIN: u32 = 254;
const RTPROT_STATIC: u8 = 4;
const RTN_UNICAST: u8 = 1;

const RTMSG_SIZE: usize = 12;
const IFADDRMSG_SIZE: usize = 8;
const IFINFOMSG_SIZE: usize = 16;

pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;
pub const RT_SCOPE_HOST: u8 = 254;

/// A route as carried by `RTM_NEWROUTE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtRoute {
    pub family: u8,
    pub dst: Option<IpAddr>,
    pub dst_len: u8,
    pub gateway: Option<IpAddr>,
    pub prefsrc: Option<IpAddr>,
    pub oif: Option<u32>,
    pub scope: u8,
    pub table: u32,
    pub priority: Option<u32>,
}

impl RtRoute {
    /// An empty main-table unicast route for `family`.
    pub fn new(family: u8) -> Self {
        Self {
            family,
            dst: None,
            dst_len: 0,
            gateway: None,
            prefsrc: None,
            oif: None,
            scope: RT_SCOPE_UNIVERSE,
            table: RT_TABLE_MAIN,
            priority: None,
        }
    }
}

/// An interface address as carried by `RTM_NEWADDR`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtAddr {
    pub index: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
}

fn family_of(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn parse_addr(family: u8, payload: &[u8]) -> Option<IpAddr> {
    if family == libc::AF_INET as u8 {
        let octets: [u8; 4] = payload.get(..4)?.try_into().ok()?;
        Some(IpAddr::V4(Ipv4Addr::from(octets)))
    } else if family == libc::AF_INET6 as u8 {
        let octets: [u8; 16] = payload.get(..16)?.try_into().ok()?;
        Some(IpAddr::V6(Ipv6Addr::from(octets)))
    } else {
        None
    }
}

fn check_family(family: u8) -> Result<()> {
    if family == libc::AF_INET as u8 || family == libc::AF_INET6 as u8 {
        Ok(())
    } else {
        Err(NetlinkError::InvalidAddressFamily)
    }
}

fn put_rtmsg(buf: &mut MsgBuffer, route: &RtRoute, protocol: u8, rtype: u8) {
    buf.put_u8(route.family);
    buf.put_u8(route.dst_len);
    buf.put_u8(0); // src_len
    buf.put_u8(0); // tos
    buf.put_u8(if route.table < 256 { route.table as u8 } else { 0 });
    buf.put_u8(protocol);
    buf.put_u8(route.scope);
    buf.put_u8(rtype);
    buf.put_u32(0); // flags
}

/// Decode one `RTM_NEWROUTE` payload.
pub fn decode_route(payload: &[u8]) -> Result<RtRoute> {
    if payload.len() < RTMSG_SIZE {
        return Err(NetlinkError::Truncated);
    }
    let family = payload[0];
    let mut route = RtRoute::new(family);
    route.dst_len = payload[1];
    route.table = payload[4] as u32;
    route.scope = payload[6];

    for (ty, p) in AttrIter::new(&payload[RTMSG_SIZE..]) {
        match ty {
            RTA_DST => route.dst = parse_addr(family, p),
            RTA_GATEWAY => route.gateway = parse_addr(family, p),
            RTA_PREFSRC => route.prefsrc = parse_addr(family, p),
            RTA_OIF => route.oif = Some(attr_u32(p)?),
            RTA_PRIORITY => route.priority = Some(attr_u32(p)?),
            RTA_TABLE => route.table = attr_u32(p)?,
            _ => {}
        }
    }
    Ok(route)
}

/// Decode one `RTM_NEWADDR` payload. Returns `None` for families other
/// than IPv4/IPv6.
pub fn decode_addr(payload: &[u8]) -> Result<Option<RtAddr>> {
    if payload.len() < IFADDRMSG_SIZE {
        return Err(NetlinkError::Truncated);
    }
    let family = payload[0];
    let prefix_len = payload[1];
    let index = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);

    let mut local = None;
    let mut address = None;
    for (ty, p) in AttrIter::new(&payload[IFADDRMSG_SIZE..]) {
        match ty {
            IFA_LOCAL => local = parse_addr(family, p),
            IFA_ADDRESS => address = parse_addr(family, p),
            _ => {}
        }
    }

    // IFA_LOCAL is the interface's own address on point-to-point links.
    Ok(local.or(address).map(|address| RtAddr {
        index,
        address,
        prefix_len,
    }))
}

/// Dump the main-table unicast routes of `family` (`AF_INET`/`AF_INET6`).
pub fn list_routes(family: u8) -> Result<Vec<RtRoute>> {
    check_family(family)?;
    let mut buf = MsgBuffer::new(64);
    let msg = buf.put_nlmsghdr(RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP, 1);
    put_rtmsg(&mut buf, &RtRoute::new(family), 0, 0);
    buf.finalize_nlmsg_at(msg);

    let socket = NetlinkSocket::new(NETLINK_ROUTE)?;
    let mut routes = Vec::new();
    for reply in socket.dump(buf.as_slice())? {
        if reply.msg_type != RTM_NEWROUTE {
            continue;
        }
        if reply.payload.len() >= RTMSG_SIZE && reply.payload[7] != RTN_UNICAST {
            continue;
        }
        let route = decode_route(&reply.payload)?;
        if route.table == RT_TABLE_MAIN {
            routes.push(route);
        }
    }
    Ok(routes)
}

fn route_request(msg_type: u16, flags: u16, route: &RtRoute) -> Result<()> {
    check_family(route.family)?;
    let mut buf = MsgBuffer::new(128);
    let msg = buf.put_nlmsghdr(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, 1);
    put_rtmsg(&mut buf, route, RTPROT_STATIC, RTN_UNICAST);
    if let Some(dst) = &route.dst {
        buf.put_attr_bytes(RTA_DST, &addr_bytes(dst))?;
    }
    if let Some(gateway) = &route.gateway {
        buf.put_attr_bytes(RTA_GATEWAY, &addr_bytes(gateway))?;
    }
    if let Some(src) = &route.prefsrc {
        buf.put_attr_bytes(RTA_PREFSRC, &addr_bytes(src))?;
    }
    if let Some(oif) = route.oif {
        buf.put_attr_u32(RTA_OIF, oif);
    }
    if let Some(priority) = route.priority {
        buf.put_attr_u32(RTA_PRIORITY, priority);
    }
    if route.table >= 256 {
        buf.put_attr_u32(RTA_TABLE, route.table);
    }
    buf.finalize_nlmsg_at(msg);

    NetlinkSocket::new(NETLINK_ROUTE)?.transact(buf.as_slice(), 1)
}

/// Add a route. Fails with `EEXIST` if an identical route is present.
pub fn add_route(route: &RtRoute) -> Result<()> {
    route_request(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL, route)
}

pub fn del_route(route: &RtRoute) -> Result<()> {
    route_request(RTM_DELROUTE, 0, route)
}

/// Dump the interface addresses of `family`.
pub fn list_addresses(family: u8) -> Result<Vec<RtAddr>> {
    check_family(family)?;
    let mut buf = MsgBuffer::new(64);
    let msg = buf.put_nlmsghdr(RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP, 1);
    buf.put_u8(family);
    buf.put_bytes(&[0; IFADDRMSG_SIZE - 1]);
    buf.finalize_nlmsg_at(msg);

    let socket = NetlinkSocket::new(NETLINK_ROUTE)?;
    let mut addrs = Vec::new();
    for reply in socket.dump(buf.as_slice())? {
        if reply.msg_type == RTM_NEWADDR {
            addrs.extend(decode_addr(&reply.payload)?);
        }
    }
    Ok(addrs)
}

/// Assign `address/prefix_len` to the interface with `index`.
pub fn add_address(index: u32, address: IpAddr, prefix_len: u8) -> Result<()> {
    let mut buf = MsgBuffer::new(64);
    let msg = buf.put_nlmsghdr(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        1,
    );
    buf.put_u8(family_of(&address));
    buf.put_u8(prefix_len);
    buf.put_u8(0); // flags
    buf.put_u8(RT_SCOPE_UNIVERSE);
    buf.put_u32(index);
    let bytes = addr_bytes(&address);
    buf.put_attr_bytes(IFA_LOCAL, &bytes)?;
    buf.put_attr_bytes(IFA_ADDRESS, &bytes)?;
    buf.finalize_nlmsg_at(msg);

    NetlinkSocket::new(NETLINK_ROUTE)?.transact(buf.as_slice(), 1)
}

/// Set or clear `IFF_UP` on the interface with `index`.
pub fn set_link_up(index: u32, up: bool) -> Result<()> {
    let mut buf = MsgBuffer::new(64);
    let msg = buf.put_nlmsghdr(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, 1);
    buf.put_u8(libc::AF_UNSPEC as u8);
    buf.put_u8(0);
    buf.put_u16(0); // type
    buf.put_i32(index as i32);
    buf.put_u32(if up { libc::IFF_UP as u32 } else { 0 });
    buf.put_u32(libc::IFF_UP as u32);
    debug_assert_eq!(buf.len() % NLMSG_ALIGNTO, 0);
    debug_assert_eq!(buf.len(), 16 + IFINFOMSG_SIZE);
    buf.finalize_nlmsg_at(msg);

    NetlinkSocket::new(NETLINK_ROUTE)?.transact(buf.as_slice(), 1)
}

pub fn if_nametoindex(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| NetlinkError::InvalidName(name.to_string()))?;
    // SAFETY: c_name is a valid NUL-terminated string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(NetlinkError::NotFound(format!(
            "interface '{}': {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}

pub fn if_indextoname(index: u32) -> Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: buf holds IF_NAMESIZE bytes as if_indextoname requires
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return Err(NetlinkError::NotFound(format!("interface index {}", index)));
    }
    // SAFETY: on success the buffer holds a NUL-terminated name
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::parse_messages;

    fn encoded(route: &RtRoute) -> Vec<u8> {
        let mut buf = MsgBuffer::new(128);
        let msg = buf.put_nlmsghdr(RTM_NEWROUTE, NLM_F_REQUEST, 1);
        put_rtmsg(&mut buf, route, RTPROT_STATIC, RTN_UNICAST);
        if let Some(dst) = &route.dst {
            buf.put_attr_bytes(RTA_DST, &addr_bytes(dst)).unwrap();
        }
        if let Some(gw) = &route.gateway {
            buf.put_attr_bytes(RTA_GATEWAY, &addr_bytes(gw)).unwrap();
        }
        if let Some(oif) = route.oif {
            buf.put_attr_u32(RTA_OIF, oif);
        }
        buf.finalize_nlmsg_at(msg);
        buf.into_vec()
    }

    #[test]
    fn test_decode_split_default_route() {
        let mut route = RtRoute::new(libc::AF_INET as u8);
        route.dst = Some("128.0.0.0".parse().unwrap());
        route.dst_len = 1;
        route.gateway = Some("10.8.0.1".parse().unwrap());
        route.oif = Some(7);

        let messages = parse_messages(&encoded(&route)).unwrap();
        let decoded = decode_route(&messages[0].payload).unwrap();
        assert_eq!(decoded, route);
    }

    #[test]
    fn test_decode_ipv6_default_route() {
        let mut route = RtRoute::new(libc::AF_INET6 as u8);
        route.gateway = Some("fe80::1".parse().unwrap());
        route.oif = Some(2);

        let messages = parse_messages(&encoded(&route)).unwrap();
        let decoded = decode_route(&messages[0].payload).unwrap();
        assert_eq!(decoded.dst, None);
        assert_eq!(decoded.dst_len, 0);
        assert_eq!(decoded.gateway, route.gateway);
    }

    #[test]
    fn test_decode_addr_prefers_local() {
        let mut buf = MsgBuffer::new(64);
        buf.put_u8(libc::AF_INET as u8);
        buf.put_u8(32);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u32(5);
        buf.put_attr_bytes(IFA_ADDRESS, &[10, 8, 0, 1]).unwrap();
        buf.put_attr_bytes(IFA_LOCAL, &[10, 8, 0, 2]).unwrap();

        let addr = decode_addr(buf.as_slice()).unwrap().unwrap();
        assert_eq!(addr.index, 5);
        assert_eq!(addr.address, "10.8.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.prefix_len, 32);
    }

    #[test]
    fn test_unknown_family_rejected() {
        assert!(matches!(
            list_routes(libc::AF_PACKET as u8),
            Err(NetlinkError::InvalidAddressFamily)
        ));
    }

    #[test]
    fn test_loopback_index_lookup() {
        let index = if_nametoindex("lo").unwrap();
        assert_eq!(if_indextoname(index).unwrap(), "lo");
        assert!(if_nametoindex("does-not-exist0").unwrap_err().is_not_found());
    }
}

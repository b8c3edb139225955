//! Netlink message building and parsing.
//!
//! [`MsgBuffer`] and the parsing helpers are platform independent so the
//! nftables expression codec can be used for rule comparison everywhere.
//! [`NetlinkSocket`] is only available on Linux.

use std::mem;

use crate::{NetlinkError, Result};

// Netlink protocols
pub const NETLINK_ROUTE: i32 = 0;
pub const NETLINK_NETFILTER: i32 = 12;

// Netlink message header flags
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

// Netlink message types
pub const NLMSG_ERROR: u16 = 0x02;
pub const NLMSG_DONE: u16 = 0x03;
pub const NLMSG_MIN_TYPE: u16 = 0x10;

// Netlink attribute flags
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

// Netfilter netlink subsystem and batch messages
pub const NFNL_SUBSYS_NFTABLES: u8 = 10;
pub const NFNL_MSG_BATCH_BEGIN: u16 = NLMSG_MIN_TYPE;
pub const NFNL_MSG_BATCH_END: u16 = NLMSG_MIN_TYPE + 1;

pub const NLMSG_ALIGNTO: usize = 4;
pub const NLA_ALIGNTO: usize = 4;

#[inline]
pub fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

#[inline]
pub fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Netlink message header (struct nlmsghdr)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

const _: () = assert!(mem::size_of::<NlMsgHdr>() == 16);

impl NlMsgHdr {
    pub const SIZE: usize = mem::size_of::<NlMsgHdr>();

    /// Decode a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            nlmsg_len: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            nlmsg_type: u16::from_ne_bytes([buf[4], buf[5]]),
            nlmsg_flags: u16::from_ne_bytes([buf[6], buf[7]]),
            nlmsg_seq: u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            nlmsg_pid: u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Size of the netfilter generic message header (struct nfgenmsg).
pub const NFGENMSG_SIZE: usize = 4;

/// A single message received from the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NlMessage {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    /// Bytes following the netlink header.
    pub payload: Vec<u8>,
}

/// Buffer for building netlink messages.
#[derive(Clone, Debug, Default)]
pub struct MsgBuffer {
    data: Vec<u8>,
}

impl MsgBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, val: u8) {
        self.data.push(val);
    }

    pub fn put_u16(&mut self, val: u16) {
        self.data.extend_from_slice(&val.to_ne_bytes());
    }

    pub fn put_u32(&mut self, val: u32) {
        self.data.extend_from_slice(&val.to_ne_bytes());
    }

    pub fn put_i32(&mut self, val: i32) {
        self.data.extend_from_slice(&val.to_ne_bytes());
    }

    /// Pad to attribute alignment.
    pub fn align(&mut self) {
        let aligned = nla_align(self.data.len());
        self.data.resize(aligned, 0);
    }

    /// Start a netlink message. Returns the offset of its header, to be
    /// passed to [`MsgBuffer::finalize_nlmsg_at`].
    pub fn put_nlmsghdr(&mut self, msg_type: u16, flags: u16, seq: u32) -> usize {
        let offset = self.data.len();
        self.put_u32(0); // length, patched on finalize
        self.put_u16(msg_type);
        self.put_u16(flags);
        self.put_u32(seq);
        self.put_u32(0);
        offset
    }

    /// Add the netfilter generic message header.
    pub fn put_nfgenmsg(&mut self, family: u8, version: u8, res_id: u16) {
        self.put_u8(family);
        self.put_u8(version);
        self.data.extend_from_slice(&res_id.to_be_bytes());
    }

    /// Update the length of the message whose header starts at `offset`.
    pub fn finalize_nlmsg_at(&mut self, offset: usize) {
        let len = (self.data.len() - offset) as u32;
        self.data[offset..offset + 4].copy_from_slice(&len.to_ne_bytes());
    }

    fn put_attr_len(&mut self, attr_type: u16, len: u16) {
        self.put_u16(len);
        self.put_u16(attr_type);
    }

    /// Attribute lengths are 16 bits on the wire.
    fn put_attr_header(&mut self, attr_type: u16, payload_len: usize) -> Result<()> {
        let len = u16::try_from(4 + payload_len)
            .map_err(|_| NetlinkError::AttributeTooLarge(4 + payload_len))?;
        self.put_attr_len(attr_type, len);
        Ok(())
    }

    pub fn put_attr_u8(&mut self, attr_type: u16, val: u8) {
        self.put_attr_len(attr_type, 4 + 1);
        self.put_u8(val);
        self.align();
    }

    pub fn put_attr_u32(&mut self, attr_type: u16, val: u32) {
        self.put_attr_len(attr_type, 4 + 4);
        self.put_u32(val);
        self.align();
    }

    /// Big-endian u32 without `NLA_F_NET_BYTEORDER`, as nftables expects.
    pub fn put_attr_u32_be(&mut self, attr_type: u16, val: u32) {
        self.put_attr_len(attr_type, 4 + 4);
        self.data.extend_from_slice(&val.to_be_bytes());
        self.align();
    }

    /// Big-endian u64 without `NLA_F_NET_BYTEORDER`, as nftables expects.
    pub fn put_attr_u64_be(&mut self, attr_type: u16, val: u64) {
        self.put_attr_len(attr_type, 4 + 8);
        self.data.extend_from_slice(&val.to_be_bytes());
        self.align();
    }

    /// Null-terminated string attribute.
    pub fn put_attr_str(&mut self, attr_type: u16, val: &str) -> Result<()> {
        let bytes = val.as_bytes();
        self.put_attr_header(attr_type, bytes.len() + 1)?;
        self.put_bytes(bytes);
        self.put_u8(0);
        self.align();
        Ok(())
    }

    pub fn put_attr_bytes(&mut self, attr_type: u16, val: &[u8]) -> Result<()> {
        self.put_attr_header(attr_type, val.len())?;
        self.put_bytes(val);
        self.align();
        Ok(())
    }

    /// Start a nested attribute. Returns the offset where the length will be stored.
    pub fn start_nested(&mut self, attr_type: u16) -> usize {
        let offset = self.data.len();
        self.put_u16(0);
        self.put_u16(attr_type | NLA_F_NESTED);
        offset
    }

    /// End a nested attribute by updating its length.
    ///
    /// Fails with [`NetlinkError::AttributeTooLarge`] once the nested payload
    /// no longer fits the 16-bit length field; the buffer is left as is.
    pub fn end_nested(&mut self, offset: usize) -> Result<()> {
        let len = self.data.len() - offset;
        let len = u16::try_from(len).map_err(|_| NetlinkError::AttributeTooLarge(len))?;
        self.data[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
        Ok(())
    }
}

/// Iterator over netlink attributes in a byte slice.
///
/// Yields the attribute type with the nested/byte-order flags masked off,
/// together with its payload.
pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let attr_type = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        if len < 4 || len > self.buf.len() {
            return None;
        }
        let payload = &self.buf[4..len];
        let advance = nla_align(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((attr_type, payload))
    }
}

/// Read a null-terminated string attribute payload.
pub fn attr_str(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

pub fn attr_u32(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(NetlinkError::Truncated)?;
    Ok(u32::from_ne_bytes(bytes))
}

pub fn attr_u32_be(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(NetlinkError::Truncated)?;
    Ok(u32::from_be_bytes(bytes))
}

pub fn attr_u64_be(payload: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = payload
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(NetlinkError::Truncated)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Split a receive buffer into the messages it contains.
pub fn parse_messages(buf: &[u8]) -> Result<Vec<NlMessage>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NlMsgHdr::SIZE <= buf.len() {
        let hdr = NlMsgHdr::parse(&buf[offset..]).ok_or(NetlinkError::Truncated)?;
        let len = hdr.nlmsg_len as usize;
        if len < NlMsgHdr::SIZE || offset + len > buf.len() {
            return Err(NetlinkError::Truncated);
        }
        messages.push(NlMessage {
            msg_type: hdr.nlmsg_type,
            flags: hdr.nlmsg_flags,
            seq: hdr.nlmsg_seq,
            payload: buf[offset + NlMsgHdr::SIZE..offset + len].to_vec(),
        });
        offset += nlmsg_align(len);
    }

    Ok(messages)
}

/// Decode the errno carried by an `NLMSG_ERROR` payload. Zero is an ACK.
pub fn parse_error_payload(payload: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(NetlinkError::Truncated)?;
    Ok(i32::from_ne_bytes(bytes))
}

#[cfg(target_os = "linux")]
pub use socket::NetlinkSocket;

#[cfg(target_os = "linux")]
mod socket {
    use std::io;
    use std::mem;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::time::Duration;

    use super::*;

    const RECV_BUF_SZ: usize = 64 * 1024;

    /// A netlink socket bound to one protocol family.
    pub struct NetlinkSocket {
        fd: RawFd,
    }

    fn kernel_addr() -> libc::sockaddr_nl {
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr
    }

    fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::EINTR)
        ) || err.raw_os_error() == Some(libc::EWOULDBLOCK)
    }

    impl NetlinkSocket {
        /// Open a socket for `protocol` (`NETLINK_ROUTE`, `NETLINK_NETFILTER`).
        pub fn new(protocol: i32) -> Result<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    protocol,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let addr = kernel_addr();
            let ret = unsafe {
                libc::bind(
                    fd,
                    &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_nl>() as u32,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err.into());
            }

            Ok(Self { fd })
        }

        pub fn send(&self, msg: &[u8]) -> Result<()> {
            let addr = kernel_addr();
            let mut retries = 3;
            loop {
                let sent = unsafe {
                    libc::sendto(
                        self.fd,
                        msg.as_ptr() as *const libc::c_void,
                        msg.len(),
                        0,
                        &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_nl>() as u32,
                    )
                };
                if sent < 0 {
                    let err = io::Error::last_os_error();
                    if retries > 0 && is_transient(&err) {
                        retries -= 1;
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    return Err(err.into());
                }
                if sent as usize != msg.len() {
                    return Err(io::Error::other("incomplete send").into());
                }
                return Ok(());
            }
        }

        fn recv_messages(&self) -> Result<Vec<NlMessage>> {
            let mut buf = vec![0u8; RECV_BUF_SZ];
            let mut retries = 3;
            loop {
                let received = unsafe {
                    libc::recv(
                        self.fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if received < 0 {
                    let err = io::Error::last_os_error();
                    if retries > 0 && is_transient(&err) {
                        retries -= 1;
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    return Err(err.into());
                }
                return parse_messages(&buf[..received as usize]);
            }
        }

        /// Send a request and wait for `expected_acks` acknowledgements.
        ///
        /// The first non-zero error aborts with [`NetlinkError::Kernel`].
        pub fn transact(&self, msg: &[u8], expected_acks: usize) -> Result<()> {
            self.send(msg)?;

            let mut acks = 0;
            while acks < expected_acks {
                for message in self.recv_messages()? {
                    if message.msg_type == NLMSG_ERROR {
                        let errno = parse_error_payload(&message.payload)?;
                        if errno != 0 {
                            return Err(NetlinkError::Kernel(-errno));
                        }
                        acks += 1;
                    } else if message.msg_type == NLMSG_DONE {
                        return Ok(());
                    }
                }
            }
            Ok(())
        }

        /// Send a dump request and collect every reply up to `NLMSG_DONE`.
        pub fn dump(&self, msg: &[u8]) -> Result<Vec<NlMessage>> {
            self.send(msg)?;

            let mut replies = Vec::new();
            loop {
                for message in self.recv_messages()? {
                    match message.msg_type {
                        NLMSG_DONE => return Ok(replies),
                        NLMSG_ERROR => {
                            let errno = parse_error_payload(&message.payload)?;
                            if errno != 0 {
                                return Err(NetlinkError::Kernel(-errno));
                            }
                            return Ok(replies);
                        }
                        _ => {
                            let multi = message.flags & NLM_F_MULTI != 0;
                            replies.push(message);
                            if !multi {
                                return Ok(replies);
                            }
                        }
                    }
                }
            }
        }
    }

    impl AsRawFd for NetlinkSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    impl Drop for NetlinkSocket {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_roundtrip_through_iter() {
        let mut buf = MsgBuffer::new(64);
        buf.put_attr_str(1, "filter").unwrap();
        buf.put_attr_u32_be(2, 0xdead_beef);
        let nested = buf.start_nested(3);
        buf.put_attr_u8(1, 7);
        buf.end_nested(nested).unwrap();

        let attrs: Vec<_> = AttrIter::new(buf.as_slice()).collect();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].0, 1);
        assert_eq!(attr_str(attrs[0].1), "filter");
        assert_eq!(attr_u32_be(attrs[1].1).unwrap(), 0xdead_beef);
        assert_eq!(attrs[2].0, 3, "nested flag is masked off");
        let inner: Vec<_> = AttrIter::new(attrs[2].1).collect();
        assert_eq!(inner, vec![(1, &[7u8][..])]);
    }

    #[test]
    fn test_oversized_attributes_are_rejected() {
        let mut buf = MsgBuffer::new(64);
        let payload = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            buf.put_attr_bytes(1, &payload),
            Err(NetlinkError::AttributeTooLarge(len)) if len == payload.len() + 4
        ));
        assert!(buf.is_empty(), "nothing is written for a rejected attribute");

        // The largest payload that still fits.
        buf.put_attr_bytes(1, &payload[..u16::MAX as usize - 4]).unwrap();
        let attrs: Vec<_> = AttrIter::new(buf.as_slice()).collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].1.len(), u16::MAX as usize - 4);
    }

    #[test]
    fn test_oversized_nested_attribute_is_rejected() {
        let mut buf = MsgBuffer::new(64);
        let nested = buf.start_nested(1);
        for _ in 0..20 {
            buf.put_attr_bytes(2, &[0u8; 4000]).unwrap();
        }
        assert!(matches!(
            buf.end_nested(nested),
            Err(NetlinkError::AttributeTooLarge(len)) if len > u16::MAX as usize
        ));
    }

    #[test]
    fn test_parse_messages_splits_buffer() {
        let mut buf = MsgBuffer::new(64);
        let first = buf.put_nlmsghdr(NLMSG_MIN_TYPE, NLM_F_MULTI, 1);
        buf.put_attr_u32(1, 5);
        buf.finalize_nlmsg_at(first);
        let second = buf.put_nlmsghdr(NLMSG_DONE, 0, 1);
        buf.put_i32(0);
        buf.finalize_nlmsg_at(second);

        let messages = parse_messages(buf.as_slice()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, NLMSG_MIN_TYPE);
        assert_eq!(messages[0].payload.len(), 8);
        assert_eq!(messages[1].msg_type, NLMSG_DONE);
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let mut buf = MsgBuffer::new(32);
        let off = buf.put_nlmsghdr(NLMSG_MIN_TYPE, 0, 0);
        buf.put_u32(1);
        buf.finalize_nlmsg_at(off);
        let bytes = buf.as_slice();
        assert!(matches!(
            parse_messages(&bytes[..bytes.len() - 2]),
            Err(NetlinkError::Truncated)
        ));
    }

    #[test]
    fn test_nfgenmsg_res_id_is_big_endian() {
        let mut buf = MsgBuffer::new(8);
        buf.put_nfgenmsg(2, 0, NFNL_SUBSYS_NFTABLES as u16);
        assert_eq!(buf.as_slice(), &[2, 0, 0, 10]);
    }
}

//! nftables objects and batched netlink transactions.
//!
//! Changes are collected in a [`Batch`] and applied atomically by
//! [`Batch::commit`]. Rules and set elements can be read back with
//! [`get_rules`] and [`get_set_elements`].

mod expr;

pub use expr::{
    CmpOp, CtKey, Expr, ImmediateData, MetaKey, NatType, PayloadBase, NFT_REG32_01,
    NFT_REG_1, NFT_REG_2, NFT_REG_VERDICT,
};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::netlink::{
    attr_str, attr_u64_be, AttrIter, MsgBuffer, NFGENMSG_SIZE, NFNL_MSG_BATCH_BEGIN,
    NFNL_MSG_BATCH_END, NFNL_SUBSYS_NFTABLES, NLM_F_ACK, NLM_F_APPEND, NLM_F_CREATE,
    NLM_F_REQUEST,
};
use crate::{NetlinkError, Result};
use expr::{decode_data, decode_list, put_verdict};

// nftables message types
pub(crate) const NFT_MSG_NEWTABLE: u16 = 0;
pub(crate) const NFT_MSG_DELTABLE: u16 = 2;
pub(crate) const NFT_MSG_NEWCHAIN: u16 = 3;
pub(crate) const NFT_MSG_NEWRULE: u16 = 6;
pub(crate) const NFT_MSG_GETRULE: u16 = 7;
pub(crate) const NFT_MSG_DELRULE: u16 = 8;
pub(crate) const NFT_MSG_NEWSET: u16 = 9;
pub(crate) const NFT_MSG_DELSET: u16 = 11;
pub(crate) const NFT_MSG_NEWSETELEM: u16 = 12;
pub(crate) const NFT_MSG_GETSETELEM: u16 = 13;
pub(crate) const NFT_MSG_DELSETELEM: u16 = 14;

const NFTA_TABLE_NAME: u16 = 1;

const NFTA_CHAIN_TABLE: u16 = 1;
const NFTA_CHAIN_NAME: u16 = 3;
const NFTA_CHAIN_HOOK: u16 = 4;
const NFTA_CHAIN_POLICY: u16 = 5;
const NFTA_CHAIN_TYPE: u16 = 7;
const NFTA_HOOK_HOOKNUM: u16 = 1;
const NFTA_HOOK_PRIORITY: u16 = 2;

const NFTA_RULE_TABLE: u16 = 1;
const NFTA_RULE_CHAIN: u16 = 2;
const NFTA_RULE_HANDLE: u16 = 3;
const NFTA_RULE_EXPRESSIONS: u16 = 4;
const NFTA_RULE_USERDATA: u16 = 7;

const NFTA_SET_TABLE: u16 = 1;
const NFTA_SET_NAME: u16 = 2;
const NFTA_SET_FLAGS: u16 = 3;
const NFTA_SET_KEY_TYPE: u16 = 4;
const NFTA_SET_KEY_LEN: u16 = 5;
const NFTA_SET_DATA_TYPE: u16 = 6;
const NFTA_SET_DATA_LEN: u16 = 7;
const NFTA_SET_ID: u16 = 10;

const NFTA_SET_ELEM_LIST_TABLE: u16 = 1;
const NFTA_SET_ELEM_LIST_SET: u16 = 2;
const NFTA_SET_ELEM_LIST_ELEMENTS: u16 = 3;
const NFTA_LIST_ELEM: u16 = 1;
const NFTA_SET_ELEM_KEY: u16 = 1;
const NFTA_SET_ELEM_DATA: u16 = 2;
const NFTA_DATA_VALUE: u16 = 1;

const NFT_SET_CONSTANT: u32 = 0x2;
const NFT_SET_INTERVAL: u32 = 0x4;
const NFT_SET_MAP: u32 = 0x8;

/// Magic data type marking verdict maps.
const NFT_DATA_VERDICT: u32 = 0xffff_ff00;

const NFPROTO_INET: u8 = 1;
const NFPROTO_IPV4: u8 = 2;
const NFPROTO_IPV6: u8 = 10;

pub const NFT_NAME_MAXLEN: usize = 256;

/// Element bytes per `NFT_MSG_NEWSETELEM`/`NFT_MSG_DELSETELEM` message. One
/// element never exceeds a few hundred bytes, so a list closed after this
/// mark still fits its 16-bit attribute length.
pub const ELEM_LIST_CHUNK: usize = 32 * 1024;

/// Interface names are compared as full `IFNAMSIZ` buffers.
pub const IFNAMSIZ: usize = 16;

static SET_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Next transaction-local set ID.
pub fn next_set_id() -> u32 {
    SET_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn nft_msg_type(cmd: u16) -> u16 {
    ((NFNL_SUBSYS_NFTABLES as u16) << 8) | cmd
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= NFT_NAME_MAXLEN {
        return Err(NetlinkError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Pad an interface name to `IFNAMSIZ` bytes for `meta iifname` matches and
/// interface-name map keys.
pub fn ifname_bytes(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.truncate(IFNAMSIZ - 1);
    bytes.resize(IFNAMSIZ, 0);
    bytes
}

/// nftables table family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableFamily {
    Ipv4,
    Ipv6,
    Inet,
}

impl TableFamily {
    pub fn nfproto(self) -> u8 {
        match self {
            TableFamily::Ipv4 => NFPROTO_IPV4,
            TableFamily::Ipv6 => NFPROTO_IPV6,
            TableFamily::Inet => NFPROTO_INET,
        }
    }

    pub fn from_nfproto(proto: u8) -> Result<Self> {
        match proto {
            NFPROTO_IPV4 => Ok(TableFamily::Ipv4),
            NFPROTO_IPV6 => Ok(TableFamily::Ipv6),
            NFPROTO_INET => Ok(TableFamily::Inet),
            _ => Err(NetlinkError::InvalidAddressFamily),
        }
    }

    /// Keyword used by the `nft` tool.
    pub fn as_str(self) -> &'static str {
        match self {
            TableFamily::Ipv4 => "ip",
            TableFamily::Ipv6 => "ip6",
            TableFamily::Inet => "inet",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    pub name: String,
    pub family: TableFamily,
}

impl Table {
    pub fn new(name: impl Into<String>, family: TableFamily) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family.as_str(), self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainType {
    Filter,
    Nat,
}

impl ChainType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainType::Filter => "filter",
            ChainType::Nat => "nat",
        }
    }
}

/// Netfilter hook a base chain attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Hook {
    fn value(self) -> u32 {
        match self {
            Hook::Prerouting => 0,
            Hook::Input => 1,
            Hook::Forward => 2,
            Hook::Output => 3,
            Hook::Postrouting => 4,
        }
    }
}

/// Standard chain priorities.
pub mod priority {
    pub const FILTER: i32 = 0;
    pub const DSTNAT: i32 = -100;
    pub const SRCNAT: i32 = 100;
}

/// Hook attachment of a base chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BaseChain {
    pub hook: Hook,
    pub priority: i32,
    pub chain_type: ChainType,
    pub policy: Verdict,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Chain {
    pub table: Table,
    pub name: String,
    /// `None` for regular (jump target) chains.
    pub base: Option<BaseChain>,
}

impl Chain {
    pub fn base(table: Table, name: impl Into<String>, base: BaseChain) -> Self {
        Self {
            table,
            name: name.into(),
            base: Some(base),
        }
    }

    pub fn regular(table: Table, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
            base: None,
        }
    }
}

/// Verdict of a rule or a verdict-map element.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    Continue,
    Return,
    Jump(String),
    Goto(String),
}

impl Verdict {
    pub(crate) fn code(&self) -> i32 {
        match self {
            Verdict::Accept => expr::NF_ACCEPT,
            Verdict::Drop => expr::NF_DROP,
            Verdict::Continue => expr::NFT_CONTINUE,
            Verdict::Return => expr::NFT_RETURN,
            Verdict::Jump(_) => expr::NFT_JUMP,
            Verdict::Goto(_) => expr::NFT_GOTO,
        }
    }

    pub(crate) fn chain(&self) -> Option<&str> {
        match self {
            Verdict::Jump(c) | Verdict::Goto(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn from_code(code: i32, chain: Option<String>) -> Result<Self> {
        match code {
            expr::NF_ACCEPT => Ok(Verdict::Accept),
            expr::NF_DROP => Ok(Verdict::Drop),
            expr::NFT_CONTINUE => Ok(Verdict::Continue),
            expr::NFT_RETURN => Ok(Verdict::Return),
            expr::NFT_JUMP | expr::NFT_GOTO => {
                let chain =
                    chain.ok_or_else(|| NetlinkError::Protocol("jump without chain".into()))?;
                Ok(if code == expr::NFT_JUMP {
                    Verdict::Jump(chain)
                } else {
                    Verdict::Goto(chain)
                })
            }
            other => Err(NetlinkError::Protocol(format!("unknown verdict {}", other))),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Drop => write!(f, "drop"),
            Verdict::Continue => write!(f, "continue"),
            Verdict::Return => write!(f, "return"),
            Verdict::Jump(c) => write!(f, "jump {}", c),
            Verdict::Goto(c) => write!(f, "goto {}", c),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    /// Kernel-assigned handle; zero until committed.
    pub handle: u64,
    pub exprs: Vec<Expr>,
    pub user_data: Option<Vec<u8>>,
}

impl Rule {
    pub fn new(table: Table, chain: impl Into<String>, exprs: Vec<Expr>) -> Self {
        Self {
            table,
            chain: chain.into(),
            handle: 0,
            exprs,
            user_data: None,
        }
    }

    /// Whether two rules have the same match expressions and user data,
    /// comparing their wire encodings.
    pub fn same_as(&self, other: &Rule) -> bool {
        self.exprs.len() == other.exprs.len()
            && self.user_data == other.user_data
            && self
                .exprs
                .iter()
                .zip(&other.exprs)
                .all(|(a, b)| matches!((a.to_bytes(), b.to_bytes()), (Ok(x), Ok(y)) if x == y))
    }
}

/// nftables data type of a set key or value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataType {
    pub nft_type: u32,
    pub len: u32,
}

impl DataType {
    pub const IPADDR: DataType = DataType { nft_type: 7, len: 4 };
    pub const IP6ADDR: DataType = DataType { nft_type: 8, len: 16 };
    pub const INET_PROTO: DataType = DataType { nft_type: 12, len: 1 };
    pub const INET_SERVICE: DataType = DataType { nft_type: 13, len: 2 };
    pub const CT_STATE: DataType = DataType { nft_type: 26, len: 4 };
    pub const IFNAME: DataType = DataType { nft_type: 41, len: IFNAMSIZ as u32 };
    pub const VERDICT: DataType = DataType { nft_type: NFT_DATA_VERDICT, len: 0 };

    /// Concatenation of `parts`; each component occupies a 4-byte aligned slot.
    pub fn concat(parts: &[DataType]) -> DataType {
        let mut nft_type = 0u32;
        let mut len = 0u32;
        for part in parts {
            nft_type = (nft_type << 6) | part.nft_type;
            len += (part.len + 3) & !3;
        }
        DataType { nft_type, len }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Set {
    pub table: Table,
    pub name: String,
    pub id: u32,
    pub key: DataType,
    /// Value type when the set is a map.
    pub data: Option<DataType>,
    pub constant: bool,
    pub interval: bool,
}

impl Set {
    /// Verdict map keyed by `key`.
    pub fn verdict_map(table: Table, name: impl Into<String>, key: DataType) -> Self {
        Self {
            table,
            name: name.into(),
            id: next_set_id(),
            key,
            data: Some(DataType::VERDICT),
            constant: false,
            interval: false,
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.constant {
            flags |= NFT_SET_CONSTANT;
        }
        if self.interval {
            flags |= NFT_SET_INTERVAL;
        }
        if self.data.is_some() {
            flags |= NFT_SET_MAP;
        }
        flags
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetElement {
    pub key: Vec<u8>,
    pub verdict: Option<Verdict>,
}

impl SetElement {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key, verdict: None }
    }

    pub fn with_verdict(key: Vec<u8>, verdict: Verdict) -> Self {
        Self {
            key,
            verdict: Some(verdict),
        }
    }
}

/// An nftables transaction under construction.
pub struct Batch {
    buf: MsgBuffer,
    seq: u32,
    messages: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        let mut buf = MsgBuffer::new(4096);
        let begin = buf.put_nlmsghdr(NFNL_MSG_BATCH_BEGIN, NLM_F_REQUEST, 0);
        buf.put_nfgenmsg(libc::AF_UNSPEC as u8, 0, NFNL_SUBSYS_NFTABLES as u16);
        buf.finalize_nlmsg_at(begin);
        Self {
            buf,
            seq: 1,
            messages: 0,
        }
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    fn begin(&mut self, cmd: u16, flags: u16, family: TableFamily) -> usize {
        let offset = self
            .buf
            .put_nlmsghdr(nft_msg_type(cmd), NLM_F_REQUEST | NLM_F_ACK | flags, self.seq);
        self.buf.put_nfgenmsg(family.nfproto(), 0, 0);
        self.seq += 1;
        self.messages += 1;
        offset
    }

    pub fn add_table(&mut self, table: &Table) -> Result<()> {
        check_name(&table.name)?;
        let msg = self.begin(NFT_MSG_NEWTABLE, NLM_F_CREATE, table.family);
        self.buf.put_attr_str(NFTA_TABLE_NAME, &table.name)?;
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn del_table(&mut self, table: &Table) -> Result<()> {
        check_name(&table.name)?;
        let msg = self.begin(NFT_MSG_DELTABLE, 0, table.family);
        self.buf.put_attr_str(NFTA_TABLE_NAME, &table.name)?;
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn add_chain(&mut self, chain: &Chain) -> Result<()> {
        check_name(&chain.name)?;
        let msg = self.begin(NFT_MSG_NEWCHAIN, NLM_F_CREATE, chain.table.family);
        self.buf.put_attr_str(NFTA_CHAIN_TABLE, &chain.table.name)?;
        self.buf.put_attr_str(NFTA_CHAIN_NAME, &chain.name)?;
        if let Some(base) = &chain.base {
            let hook = self.buf.start_nested(NFTA_CHAIN_HOOK);
            self.buf.put_attr_u32_be(NFTA_HOOK_HOOKNUM, base.hook.value());
            self.buf
                .put_attr_u32_be(NFTA_HOOK_PRIORITY, base.priority as u32);
            self.buf.end_nested(hook)?;
            self.buf
                .put_attr_u32_be(NFTA_CHAIN_POLICY, base.policy.code() as u32);
            self.buf
                .put_attr_str(NFTA_CHAIN_TYPE, base.chain_type.as_str())?;
        }
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        check_name(&rule.chain)?;
        let msg = self.begin(
            NFT_MSG_NEWRULE,
            NLM_F_CREATE | NLM_F_APPEND,
            rule.table.family,
        );
        encode_rule_body(&mut self.buf, rule)?;
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn del_rule(&mut self, rule: &Rule) -> Result<()> {
        if rule.handle == 0 {
            return Err(NetlinkError::NotFound(format!(
                "rule in chain {} has no handle",
                rule.chain
            )));
        }
        let msg = self.begin(NFT_MSG_DELRULE, 0, rule.table.family);
        self.buf.put_attr_str(NFTA_RULE_TABLE, &rule.table.name)?;
        self.buf.put_attr_str(NFTA_RULE_CHAIN, &rule.chain)?;
        self.buf.put_attr_u64_be(NFTA_RULE_HANDLE, rule.handle);
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn add_set(&mut self, set: &Set) -> Result<()> {
        check_name(&set.name)?;
        let msg = self.begin(NFT_MSG_NEWSET, NLM_F_CREATE, set.table.family);
        self.buf.put_attr_str(NFTA_SET_TABLE, &set.table.name)?;
        self.buf.put_attr_str(NFTA_SET_NAME, &set.name)?;
        self.buf.put_attr_u32_be(NFTA_SET_FLAGS, set.flags());
        self.buf.put_attr_u32_be(NFTA_SET_KEY_TYPE, set.key.nft_type);
        self.buf.put_attr_u32_be(NFTA_SET_KEY_LEN, set.key.len);
        if let Some(data) = &set.data {
            self.buf.put_attr_u32_be(NFTA_SET_DATA_TYPE, data.nft_type);
            if data.len != 0 {
                self.buf.put_attr_u32_be(NFTA_SET_DATA_LEN, data.len);
            }
        }
        self.buf.put_attr_u32_be(NFTA_SET_ID, set.id);
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn del_set(&mut self, set: &Set) -> Result<()> {
        check_name(&set.name)?;
        let msg = self.begin(NFT_MSG_DELSET, 0, set.table.family);
        self.buf.put_attr_str(NFTA_SET_TABLE, &set.table.name)?;
        self.buf.put_attr_str(NFTA_SET_NAME, &set.name)?;
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    /// Remove every element of `set`.
    pub fn flush_set(&mut self, set: &Set) -> Result<()> {
        check_name(&set.name)?;
        let msg = self.begin(NFT_MSG_DELSETELEM, 0, set.table.family);
        self.buf.put_attr_str(NFTA_SET_ELEM_LIST_TABLE, &set.table.name)?;
        self.buf.put_attr_str(NFTA_SET_ELEM_LIST_SET, &set.name)?;
        self.buf.finalize_nlmsg_at(msg);
        Ok(())
    }

    pub fn add_elements(&mut self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.elements(NFT_MSG_NEWSETELEM, NLM_F_CREATE, set, elements)
    }

    pub fn del_elements(&mut self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.elements(NFT_MSG_DELSETELEM, 0, set, elements)
    }

    /// Queue `elements` as one or more element messages. A message carries
    /// at most [`ELEM_LIST_CHUNK`] bytes of elements so the list attribute
    /// stays within its 16-bit length.
    fn elements(&mut self, cmd: u16, flags: u16, set: &Set, elements: &[SetElement]) -> Result<()> {
        check_name(&set.name)?;
        let mut pending = elements.iter().peekable();
        while pending.peek().is_some() {
            let msg = self.begin(cmd, flags, set.table.family);
            self.buf.put_attr_str(NFTA_SET_ELEM_LIST_TABLE, &set.table.name)?;
            self.buf.put_attr_str(NFTA_SET_ELEM_LIST_SET, &set.name)?;
            let list = self.buf.start_nested(NFTA_SET_ELEM_LIST_ELEMENTS);
            while let Some(element) =
                pending.next_if(|_| self.buf.len() - list < ELEM_LIST_CHUNK)
            {
                self.put_element(element)?;
            }
            self.buf.end_nested(list)?;
            self.buf.finalize_nlmsg_at(msg);
        }
        Ok(())
    }

    fn put_element(&mut self, element: &SetElement) -> Result<()> {
        let elem = self.buf.start_nested(NFTA_LIST_ELEM);
        let key = self.buf.start_nested(NFTA_SET_ELEM_KEY);
        self.buf.put_attr_bytes(NFTA_DATA_VALUE, &element.key)?;
        self.buf.end_nested(key)?;
        if let Some(verdict) = &element.verdict {
            let data = self.buf.start_nested(NFTA_SET_ELEM_DATA);
            put_verdict(&mut self.buf, verdict)?;
            self.buf.end_nested(data)?;
        }
        self.buf.end_nested(elem)
    }

    /// Close the batch and return its wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let end = self.buf.put_nlmsghdr(NFNL_MSG_BATCH_END, NLM_F_REQUEST, self.seq);
        self.buf
            .put_nfgenmsg(libc::AF_UNSPEC as u8, 0, NFNL_SUBSYS_NFTABLES as u16);
        self.buf.finalize_nlmsg_at(end);
        self.buf.into_vec()
    }

    /// Apply the batch atomically.
    #[cfg(target_os = "linux")]
    pub fn commit(self) -> Result<()> {
        use crate::netlink::{NetlinkSocket, NETLINK_NETFILTER};

        if self.is_empty() {
            return Ok(());
        }
        let expected = self.messages;
        let bytes = self.finish();
        let socket = NetlinkSocket::new(NETLINK_NETFILTER)?;
        socket.transact(&bytes, expected)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn commit(self) -> Result<()> {
        Err(NetlinkError::UnsupportedPlatform)
    }
}

fn encode_rule_body(buf: &mut MsgBuffer, rule: &Rule) -> Result<()> {
    buf.put_attr_str(NFTA_RULE_TABLE, &rule.table.name)?;
    buf.put_attr_str(NFTA_RULE_CHAIN, &rule.chain)?;
    let list = buf.start_nested(NFTA_RULE_EXPRESSIONS);
    for expr in &rule.exprs {
        expr.encode(buf)?;
    }
    buf.end_nested(list)?;
    if let Some(data) = &rule.user_data {
        buf.put_attr_bytes(NFTA_RULE_USERDATA, data)?;
    }
    Ok(())
}

/// Decode the payload of an `NFT_MSG_NEWRULE` message (nfgenmsg included).
pub fn decode_rule(payload: &[u8]) -> Result<Rule> {
    if payload.len() < NFGENMSG_SIZE {
        return Err(NetlinkError::Truncated);
    }
    let family = TableFamily::from_nfproto(payload[0])?;
    let mut table = String::new();
    let mut chain = String::new();
    let mut handle = 0;
    let mut exprs = Vec::new();
    let mut user_data = None;

    for (ty, p) in AttrIter::new(&payload[NFGENMSG_SIZE..]) {
        match ty {
            NFTA_RULE_TABLE => table = attr_str(p),
            NFTA_RULE_CHAIN => chain = attr_str(p),
            NFTA_RULE_HANDLE => handle = attr_u64_be(p)?,
            NFTA_RULE_EXPRESSIONS => exprs = decode_list(p)?,
            NFTA_RULE_USERDATA => user_data = Some(p.to_vec()),
            _ => {}
        }
    }

    Ok(Rule {
        table: Table::new(table, family),
        chain,
        handle,
        exprs,
        user_data,
    })
}

/// Decode the elements carried by an `NFT_MSG_NEWSETELEM` message.
pub fn decode_set_elements(payload: &[u8]) -> Result<Vec<SetElement>> {
    if payload.len() < NFGENMSG_SIZE {
        return Err(NetlinkError::Truncated);
    }
    let mut elements = Vec::new();
    for (ty, p) in AttrIter::new(&payload[NFGENMSG_SIZE..]) {
        if ty != NFTA_SET_ELEM_LIST_ELEMENTS {
            continue;
        }
        for (_, elem) in AttrIter::new(p) {
            let mut key = Vec::new();
            let mut verdict = None;
            for (ety, ep) in AttrIter::new(elem) {
                match ety {
                    NFTA_SET_ELEM_KEY => {
                        if let Some((_, value)) =
                            AttrIter::new(ep).find(|(t, _)| *t == NFTA_DATA_VALUE)
                        {
                            key = value.to_vec();
                        }
                    }
                    NFTA_SET_ELEM_DATA => {
                        if let ImmediateData::Verdict(v) = decode_data(ep)? {
                            verdict = Some(v);
                        }
                    }
                    _ => {}
                }
            }
            elements.push(SetElement { key, verdict });
        }
    }
    Ok(elements)
}

/// Read every rule of `chain` in `table`, with kernel-assigned handles.
#[cfg(target_os = "linux")]
pub fn get_rules(table: &Table, chain: &str) -> Result<Vec<Rule>> {
    use crate::netlink::{NetlinkSocket, NETLINK_NETFILTER, NLM_F_DUMP};

    check_name(&table.name)?;
    let mut buf = MsgBuffer::new(256);
    let msg = buf.put_nlmsghdr(nft_msg_type(NFT_MSG_GETRULE), NLM_F_REQUEST | NLM_F_DUMP, 1);
    buf.put_nfgenmsg(table.family.nfproto(), 0, 0);
    buf.put_attr_str(NFTA_RULE_TABLE, &table.name)?;
    buf.put_attr_str(NFTA_RULE_CHAIN, chain)?;
    buf.finalize_nlmsg_at(msg);

    let socket = NetlinkSocket::new(NETLINK_NETFILTER)?;
    let mut rules = Vec::new();
    for reply in socket.dump(buf.as_slice())? {
        if reply.msg_type != nft_msg_type(NFT_MSG_NEWRULE) {
            continue;
        }
        let rule = decode_rule(&reply.payload)?;
        if rule.table == *table && rule.chain == chain {
            rules.push(rule);
        }
    }
    Ok(rules)
}

#[cfg(not(target_os = "linux"))]
pub fn get_rules(_table: &Table, _chain: &str) -> Result<Vec<Rule>> {
    Err(NetlinkError::UnsupportedPlatform)
}

/// Read the elements of `set`.
#[cfg(target_os = "linux")]
pub fn get_set_elements(set: &Set) -> Result<Vec<SetElement>> {
    use crate::netlink::{NetlinkSocket, NETLINK_NETFILTER, NLM_F_DUMP};

    check_name(&set.name)?;
    let mut buf = MsgBuffer::new(256);
    let msg = buf.put_nlmsghdr(
        nft_msg_type(NFT_MSG_GETSETELEM),
        NLM_F_REQUEST | NLM_F_DUMP,
        1,
    );
    buf.put_nfgenmsg(set.table.family.nfproto(), 0, 0);
    buf.put_attr_str(NFTA_SET_ELEM_LIST_TABLE, &set.table.name)?;
    buf.put_attr_str(NFTA_SET_ELEM_LIST_SET, &set.name)?;
    buf.finalize_nlmsg_at(msg);

    let socket = NetlinkSocket::new(NETLINK_NETFILTER)?;
    let mut elements = Vec::new();
    for reply in socket.dump(buf.as_slice())? {
        if reply.msg_type == nft_msg_type(NFT_MSG_NEWSETELEM) {
            elements.extend(decode_set_elements(&reply.payload)?);
        }
    }
    Ok(elements)
}

#[cfg(not(target_os = "linux"))]
pub fn get_set_elements(_set: &Set) -> Result<Vec<SetElement>> {
    Err(NetlinkError::UnsupportedPlatform)
}

//! nf_tables rule expressions.
//!
//! Each [`Expr`] encodes to exactly the attributes the kernel echoes back in
//! a rule dump, so `Expr::to_bytes` of a decoded expression equals the bytes
//! of the expression that created it. Rule deduplication relies on that.

use crate::netlink::{attr_str, attr_u32_be, AttrIter, MsgBuffer};
use crate::{NetlinkError, Result};

use super::{TableFamily, Verdict};

const NFTA_LIST_ELEM: u16 = 1;
const NFTA_EXPR_NAME: u16 = 1;
const NFTA_EXPR_DATA: u16 = 2;

const NFTA_DATA_VALUE: u16 = 1;
const NFTA_DATA_VERDICT: u16 = 2;
const NFTA_VERDICT_CODE: u16 = 1;
const NFTA_VERDICT_CHAIN: u16 = 2;

const NFTA_META_DREG: u16 = 1;
const NFTA_META_KEY: u16 = 2;

const NFTA_PAYLOAD_DREG: u16 = 1;
const NFTA_PAYLOAD_BASE: u16 = 2;
const NFTA_PAYLOAD_OFFSET: u16 = 3;
const NFTA_PAYLOAD_LEN: u16 = 4;

const NFTA_CMP_SREG: u16 = 1;
const NFTA_CMP_OP: u16 = 2;
const NFTA_CMP_DATA: u16 = 3;

const NFTA_RANGE_SREG: u16 = 1;
const NFTA_RANGE_OP: u16 = 2;
const NFTA_RANGE_FROM_DATA: u16 = 3;
const NFTA_RANGE_TO_DATA: u16 = 4;

const NFTA_LOOKUP_SET: u16 = 1;
const NFTA_LOOKUP_SREG: u16 = 2;
const NFTA_LOOKUP_DREG: u16 = 3;
const NFTA_LOOKUP_FLAGS: u16 = 5;
const NFT_LOOKUP_F_INV: u32 = 1;

const NFTA_IMMEDIATE_DREG: u16 = 1;
const NFTA_IMMEDIATE_DATA: u16 = 2;

const NFTA_CT_DREG: u16 = 1;
const NFTA_CT_KEY: u16 = 2;

const NFTA_NAT_TYPE: u16 = 1;
const NFTA_NAT_FAMILY: u16 = 2;
const NFTA_NAT_REG_ADDR_MIN: u16 = 3;
const NFTA_NAT_REG_PROTO_MIN: u16 = 5;

/// Verdict register.
pub const NFT_REG_VERDICT: u32 = 0;
/// First 128-bit data register.
pub const NFT_REG_1: u32 = 1;
/// Second 128-bit data register.
pub const NFT_REG_2: u32 = 2;
/// 32-bit register overlapping the second word of `NFT_REG_1`.
pub const NFT_REG32_01: u32 = 9;

// Verdict codes
pub(crate) const NF_DROP: i32 = 0;
pub(crate) const NF_ACCEPT: i32 = 1;
pub(crate) const NFT_CONTINUE: i32 = -1;
pub(crate) const NFT_JUMP: i32 = -3;
pub(crate) const NFT_GOTO: i32 = -4;
pub(crate) const NFT_RETURN: i32 = -5;

/// `meta` keys used by the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaKey {
    IifName,
    OifName,
    NfProto,
    L4Proto,
    Other(u32),
}

impl MetaKey {
    fn value(self) -> u32 {
        match self {
            MetaKey::IifName => 6,
            MetaKey::OifName => 7,
            MetaKey::NfProto => 15,
            MetaKey::L4Proto => 16,
            MetaKey::Other(v) => v,
        }
    }

    fn from_value(value: u32) -> Self {
        match value {
            6 => MetaKey::IifName,
            7 => MetaKey::OifName,
            15 => MetaKey::NfProto,
            16 => MetaKey::L4Proto,
            v => MetaKey::Other(v),
        }
    }
}

/// Header a `payload` expression reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadBase {
    LinkLayer,
    Network,
    Transport,
}

impl PayloadBase {
    fn value(self) -> u32 {
        match self {
            PayloadBase::LinkLayer => 0,
            PayloadBase::Network => 1,
            PayloadBase::Transport => 2,
        }
    }

    fn from_value(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PayloadBase::LinkLayer),
            1 => Ok(PayloadBase::Network),
            2 => Ok(PayloadBase::Transport),
            v => Err(NetlinkError::Protocol(format!("unknown payload base {}", v))),
        }
    }
}

/// Comparison operator for `cmp` and `range`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Neq,
}

impl CmpOp {
    fn value(self) -> u32 {
        match self {
            CmpOp::Eq => 0,
            CmpOp::Neq => 1,
        }
    }

    fn from_value(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CmpOp::Eq),
            1 => Ok(CmpOp::Neq),
            v => Err(NetlinkError::Protocol(format!("unsupported cmp op {}", v))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CtKey {
    State,
    Other(u32),
}

impl CtKey {
    fn value(self) -> u32 {
        match self {
            CtKey::State => 0,
            CtKey::Other(v) => v,
        }
    }

    fn from_value(value: u32) -> Self {
        match value {
            0 => CtKey::State,
            v => CtKey::Other(v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NatType {
    Snat,
    Dnat,
}

/// Payload of an `immediate` expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImmediateData {
    Value(Vec<u8>),
    Verdict(Verdict),
}

/// A single nf_tables expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Meta {
        key: MetaKey,
        dreg: u32,
    },
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: u32,
    },
    Cmp {
        op: CmpOp,
        sreg: u32,
        data: Vec<u8>,
    },
    Range {
        op: CmpOp,
        sreg: u32,
        from: Vec<u8>,
        to: Vec<u8>,
    },
    Lookup {
        set: String,
        sreg: u32,
        dreg: Option<u32>,
        invert: bool,
    },
    Immediate {
        dreg: u32,
        data: ImmediateData,
    },
    Ct {
        key: CtKey,
        dreg: u32,
    },
    Nat {
        nat_type: NatType,
        family: TableFamily,
        reg_addr_min: Option<u32>,
        reg_proto_min: Option<u32>,
    },
    Masq,
    /// Expression this crate does not model, kept verbatim.
    Raw {
        name: String,
        data: Vec<u8>,
    },
}

impl Expr {
    /// Shorthand for a verdict-setting `immediate`.
    pub fn verdict(verdict: Verdict) -> Self {
        Expr::Immediate {
            dreg: NFT_REG_VERDICT,
            data: ImmediateData::Verdict(verdict),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Expr::Meta { .. } => "meta",
            Expr::Payload { .. } => "payload",
            Expr::Cmp { .. } => "cmp",
            Expr::Range { .. } => "range",
            Expr::Lookup { .. } => "lookup",
            Expr::Immediate { .. } => "immediate",
            Expr::Ct { .. } => "ct",
            Expr::Nat { .. } => "nat",
            Expr::Masq => "masq",
            Expr::Raw { name, .. } => name,
        }
    }

    /// Canonical wire encoding of this expression as a list element.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = MsgBuffer::new(64);
        self.encode(&mut buf)?;
        Ok(buf.into_vec())
    }

    /// Append this expression to an `NFTA_RULE_EXPRESSIONS` list.
    pub fn encode(&self, buf: &mut MsgBuffer) -> Result<()> {
        let elem = buf.start_nested(NFTA_LIST_ELEM);
        buf.put_attr_str(NFTA_EXPR_NAME, self.name())?;
        if let Expr::Raw { data, .. } = self {
            let nested = buf.start_nested(NFTA_EXPR_DATA);
            buf.put_bytes(data);
            buf.end_nested(nested)?;
            return buf.end_nested(elem);
        }

        let data = buf.start_nested(NFTA_EXPR_DATA);
        match self {
            Expr::Meta { key, dreg } => {
                buf.put_attr_u32_be(NFTA_META_KEY, key.value());
                buf.put_attr_u32_be(NFTA_META_DREG, *dreg);
            }
            Expr::Payload {
                base,
                offset,
                len,
                dreg,
            } => {
                buf.put_attr_u32_be(NFTA_PAYLOAD_DREG, *dreg);
                buf.put_attr_u32_be(NFTA_PAYLOAD_BASE, base.value());
                buf.put_attr_u32_be(NFTA_PAYLOAD_OFFSET, *offset);
                buf.put_attr_u32_be(NFTA_PAYLOAD_LEN, *len);
            }
            Expr::Cmp { op, sreg, data } => {
                buf.put_attr_u32_be(NFTA_CMP_SREG, *sreg);
                buf.put_attr_u32_be(NFTA_CMP_OP, op.value());
                put_data_value(buf, NFTA_CMP_DATA, data)?;
            }
            Expr::Range { op, sreg, from, to } => {
                buf.put_attr_u32_be(NFTA_RANGE_SREG, *sreg);
                buf.put_attr_u32_be(NFTA_RANGE_OP, op.value());
                put_data_value(buf, NFTA_RANGE_FROM_DATA, from)?;
                put_data_value(buf, NFTA_RANGE_TO_DATA, to)?;
            }
            Expr::Lookup {
                set,
                sreg,
                dreg,
                invert,
            } => {
                buf.put_attr_str(NFTA_LOOKUP_SET, set)?;
                buf.put_attr_u32_be(NFTA_LOOKUP_SREG, *sreg);
                if let Some(dreg) = dreg {
                    buf.put_attr_u32_be(NFTA_LOOKUP_DREG, *dreg);
                }
                if *invert {
                    buf.put_attr_u32_be(NFTA_LOOKUP_FLAGS, NFT_LOOKUP_F_INV);
                }
            }
            Expr::Immediate { dreg, data } => {
                buf.put_attr_u32_be(NFTA_IMMEDIATE_DREG, *dreg);
                match data {
                    ImmediateData::Value(value) => {
                        put_data_value(buf, NFTA_IMMEDIATE_DATA, value)?;
                    }
                    ImmediateData::Verdict(verdict) => {
                        let outer = buf.start_nested(NFTA_IMMEDIATE_DATA);
                        put_verdict(buf, verdict)?;
                        buf.end_nested(outer)?;
                    }
                }
            }
            Expr::Ct { key, dreg } => {
                buf.put_attr_u32_be(NFTA_CT_KEY, key.value());
                buf.put_attr_u32_be(NFTA_CT_DREG, *dreg);
            }
            Expr::Nat {
                nat_type,
                family,
                reg_addr_min,
                reg_proto_min,
            } => {
                let ty = match nat_type {
                    NatType::Snat => 0,
                    NatType::Dnat => 1,
                };
                buf.put_attr_u32_be(NFTA_NAT_TYPE, ty);
                buf.put_attr_u32_be(NFTA_NAT_FAMILY, family.nfproto() as u32);
                if let Some(reg) = reg_addr_min {
                    buf.put_attr_u32_be(NFTA_NAT_REG_ADDR_MIN, *reg);
                }
                if let Some(reg) = reg_proto_min {
                    buf.put_attr_u32_be(NFTA_NAT_REG_PROTO_MIN, *reg);
                }
            }
            Expr::Masq | Expr::Raw { .. } => {}
        }
        buf.end_nested(data)?;
        buf.end_nested(elem)
    }

    /// Decode one `NFTA_LIST_ELEM` payload.
    pub fn decode(elem: &[u8]) -> Result<Self> {
        let mut name = None;
        let mut data: &[u8] = &[];
        for (ty, payload) in AttrIter::new(elem) {
            match ty {
                NFTA_EXPR_NAME => name = Some(attr_str(payload)),
                NFTA_EXPR_DATA => data = payload,
                _ => {}
            }
        }
        let name = name.ok_or_else(|| NetlinkError::Protocol("expression without name".into()))?;

        let expr = match name.as_str() {
            "meta" => {
                let mut key = 0;
                let mut dreg = 0;
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_META_KEY => key = attr_u32_be(p)?,
                        NFTA_META_DREG => dreg = attr_u32_be(p)?,
                        _ => {}
                    }
                }
                Expr::Meta {
                    key: MetaKey::from_value(key),
                    dreg,
                }
            }
            "payload" => {
                let (mut base, mut offset, mut len, mut dreg) = (0, 0, 0, 0);
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_PAYLOAD_DREG => dreg = attr_u32_be(p)?,
                        NFTA_PAYLOAD_BASE => base = attr_u32_be(p)?,
                        NFTA_PAYLOAD_OFFSET => offset = attr_u32_be(p)?,
                        NFTA_PAYLOAD_LEN => len = attr_u32_be(p)?,
                        _ => {}
                    }
                }
                Expr::Payload {
                    base: PayloadBase::from_value(base)?,
                    offset,
                    len,
                    dreg,
                }
            }
            "cmp" => {
                let (mut op, mut sreg, mut value) = (0, 0, Vec::new());
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_CMP_SREG => sreg = attr_u32_be(p)?,
                        NFTA_CMP_OP => op = attr_u32_be(p)?,
                        NFTA_CMP_DATA => value = data_value(p),
                        _ => {}
                    }
                }
                Expr::Cmp {
                    op: CmpOp::from_value(op)?,
                    sreg,
                    data: value,
                }
            }
            "range" => {
                let (mut op, mut sreg) = (0, 0);
                let (mut from, mut to) = (Vec::new(), Vec::new());
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_RANGE_SREG => sreg = attr_u32_be(p)?,
                        NFTA_RANGE_OP => op = attr_u32_be(p)?,
                        NFTA_RANGE_FROM_DATA => from = data_value(p),
                        NFTA_RANGE_TO_DATA => to = data_value(p),
                        _ => {}
                    }
                }
                Expr::Range {
                    op: CmpOp::from_value(op)?,
                    sreg,
                    from,
                    to,
                }
            }
            "lookup" => {
                let mut set = String::new();
                let mut sreg = 0;
                let mut dreg = None;
                let mut flags = 0;
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_LOOKUP_SET => set = attr_str(p),
                        NFTA_LOOKUP_SREG => sreg = attr_u32_be(p)?,
                        NFTA_LOOKUP_DREG => dreg = Some(attr_u32_be(p)?),
                        NFTA_LOOKUP_FLAGS => flags = attr_u32_be(p)?,
                        _ => {}
                    }
                }
                Expr::Lookup {
                    set,
                    sreg,
                    dreg,
                    invert: flags & NFT_LOOKUP_F_INV != 0,
                }
            }
            "immediate" => {
                let mut dreg = 0;
                let mut imm = ImmediateData::Value(Vec::new());
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_IMMEDIATE_DREG => dreg = attr_u32_be(p)?,
                        NFTA_IMMEDIATE_DATA => imm = decode_data(p)?,
                        _ => {}
                    }
                }
                Expr::Immediate { dreg, data: imm }
            }
            "ct" => {
                let (mut key, mut dreg) = (0, 0);
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_CT_KEY => key = attr_u32_be(p)?,
                        NFTA_CT_DREG => dreg = attr_u32_be(p)?,
                        _ => {}
                    }
                }
                Expr::Ct {
                    key: CtKey::from_value(key),
                    dreg,
                }
            }
            "nat" => {
                let mut ty_val = 0;
                let mut family = TableFamily::Ipv4;
                let mut reg_addr_min = None;
                let mut reg_proto_min = None;
                for (ty, p) in AttrIter::new(data) {
                    match ty {
                        NFTA_NAT_TYPE => ty_val = attr_u32_be(p)?,
                        NFTA_NAT_FAMILY => family = TableFamily::from_nfproto(attr_u32_be(p)? as u8)?,
                        NFTA_NAT_REG_ADDR_MIN => reg_addr_min = Some(attr_u32_be(p)?),
                        NFTA_NAT_REG_PROTO_MIN => reg_proto_min = Some(attr_u32_be(p)?),
                        _ => {}
                    }
                }
                Expr::Nat {
                    nat_type: if ty_val == 1 { NatType::Dnat } else { NatType::Snat },
                    family,
                    reg_addr_min,
                    reg_proto_min,
                }
            }
            "masq" => Expr::Masq,
            _ => Expr::Raw {
                name,
                data: data.to_vec(),
            },
        };

        Ok(expr)
    }
}

fn put_data_value(buf: &mut MsgBuffer, attr: u16, value: &[u8]) -> Result<()> {
    let outer = buf.start_nested(attr);
    buf.put_attr_bytes(NFTA_DATA_VALUE, value)?;
    buf.end_nested(outer)
}

/// Write an `NFTA_DATA_VERDICT` attribute.
pub(crate) fn put_verdict(buf: &mut MsgBuffer, verdict: &Verdict) -> Result<()> {
    let nested = buf.start_nested(NFTA_DATA_VERDICT);
    buf.put_attr_u32_be(NFTA_VERDICT_CODE, verdict.code() as u32);
    if let Some(chain) = verdict.chain() {
        buf.put_attr_str(NFTA_VERDICT_CHAIN, chain)?;
    }
    buf.end_nested(nested)
}

fn data_value(payload: &[u8]) -> Vec<u8> {
    AttrIter::new(payload)
        .find(|(ty, _)| *ty == NFTA_DATA_VALUE)
        .map(|(_, v)| v.to_vec())
        .unwrap_or_default()
}

/// Decode an `nft_data` payload (value or verdict).
pub(crate) fn decode_data(payload: &[u8]) -> Result<ImmediateData> {
    for (ty, p) in AttrIter::new(payload) {
        match ty {
            NFTA_DATA_VALUE => return Ok(ImmediateData::Value(p.to_vec())),
            NFTA_DATA_VERDICT => {
                let mut code = None;
                let mut chain = None;
                for (vty, vp) in AttrIter::new(p) {
                    match vty {
                        NFTA_VERDICT_CODE => code = Some(attr_u32_be(vp)? as i32),
                        NFTA_VERDICT_CHAIN => chain = Some(attr_str(vp)),
                        _ => {}
                    }
                }
                let code = code.ok_or_else(|| NetlinkError::Protocol("verdict without code".into()))?;
                return Verdict::from_code(code, chain).map(ImmediateData::Verdict);
            }
            _ => {}
        }
    }
    Err(NetlinkError::Protocol("empty data attribute".into()))
}

/// Decode an `NFTA_RULE_EXPRESSIONS` list.
pub(crate) fn decode_list(payload: &[u8]) -> Result<Vec<Expr>> {
    AttrIter::new(payload)
        .filter(|(ty, _)| *ty == NFTA_LIST_ELEM)
        .map(|(_, elem)| Expr::decode(elem))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(expr: &Expr) -> Expr {
        let bytes = expr.to_bytes().unwrap();
        let (_, elem) = AttrIter::new(&bytes).next().unwrap();
        Expr::decode(elem).unwrap()
    }

    #[test]
    fn test_decoded_expressions_keep_their_bytes() {
        let exprs = vec![
            Expr::Meta {
                key: MetaKey::L4Proto,
                dreg: NFT_REG_1,
            },
            Expr::Payload {
                base: PayloadBase::Transport,
                offset: 2,
                len: 2,
                dreg: NFT_REG32_01,
            },
            Expr::Range {
                op: CmpOp::Eq,
                sreg: NFT_REG_1,
                from: vec![10, 0, 0, 0],
                to: vec![10, 0, 0, 255],
            },
            Expr::Lookup {
                set: "pm4-abc".into(),
                sreg: NFT_REG_1,
                dreg: Some(NFT_REG_VERDICT),
                invert: false,
            },
            Expr::verdict(Verdict::Jump("iif-wg0".into())),
            Expr::Nat {
                nat_type: NatType::Dnat,
                family: TableFamily::Ipv4,
                reg_addr_min: Some(NFT_REG_1),
                reg_proto_min: Some(NFT_REG_2),
            },
            Expr::Masq,
        ];

        for expr in &exprs {
            let decoded = decode_one(expr);
            assert_eq!(&decoded, expr);
            assert_eq!(decoded.to_bytes().unwrap(), expr.to_bytes().unwrap());
        }
    }

    #[test]
    fn test_unknown_expression_is_kept_raw() {
        let raw = Expr::Raw {
            name: "counter".into(),
            data: vec![],
        };
        assert_eq!(decode_one(&raw), raw);
    }

    #[test]
    fn test_different_verdicts_encode_differently() {
        let accept = Expr::verdict(Verdict::Accept).to_bytes().unwrap();
        let drop = Expr::verdict(Verdict::Drop).to_bytes().unwrap();
        assert_ne!(accept, drop);
    }
}

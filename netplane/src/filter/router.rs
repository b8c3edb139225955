//! Compiles security groups, port forwards and traffic forwards into
//! nftables tables, chains, verdict maps and rules.
//!
//! # Layout
//!
//! One table per family (`ip <name>`, `ip6 <name>`), each with five base
//! chains:
//!
//! | chain             | type   | hook        | priority |
//! |-------------------|--------|-------------|----------|
//! | `input`           | filter | input       | 0        |
//! | `forward`         | filter | forward     | 0        |
//! | `output`          | filter | output      | 0        |
//! | `nat-prerouting`  | nat    | prerouting  | -100     |
//! | `nat-postrouting` | nat    | postrouting | 100      |
//!
//! `input` and `forward` start with a `ct state` verdict map lookup
//! (invalid drops, established and related accept). `input` then looks up
//! the inbound interface name in `iifs`, which accepts `lo` and jumps to a
//! per-interface chain `iif-<name>` for every interface a security group
//! was bound to.
//!
//! TCP and UDP port groups share one lookup rule per chain and scope that
//! evaluates `meta l4proto . th dport` against a verdict map; each port is
//! one element. Elements carry ownership counts so that groups sharing a
//! map only remove what they added.
//!
//! # Sharing
//!
//! Every rule a logical entry needs is first compared against the rules
//! already committed in its chain. Identical rules are reused, and each
//! physical rule carries a reference count; it is deleted when the last
//! entry using it goes away.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use ipnet::IpNet;

use netplane_nl::nftables::{
    ifname_bytes, priority, BaseChain, Chain, ChainType, CmpOp, CtKey, DataType, Expr, Hook,
    ImmediateData, MetaKey, NatType, PayloadBase, Rule, Set, SetElement, Table, TableFamily,
    Verdict, IFNAMSIZ, NFT_REG32_01, NFT_REG_1, NFT_REG_2, NFT_REG_VERDICT,
};

use super::keys::{port_forward_key, port_vmap_names, sg_key, traffic_forward_key};
use super::refcount::{RefCounts, RuleRef};
use super::{table_family, PacketFilter, PortForward, Protocol, SecurityGroup, TrafficForward};
use crate::error::{Error, Result};
use crate::route::AddressFamily;

pub(crate) const CHAIN_INPUT: &str = "input";
pub(crate) const CHAIN_FORWARD: &str = "forward";
pub(crate) const CHAIN_OUTPUT: &str = "output";
pub(crate) const CHAIN_PREROUTING: &str = "nat-prerouting";
pub(crate) const CHAIN_POSTROUTING: &str = "nat-postrouting";

const CT_STATE_MAP: &str = "ct-state";
const IIF_MAP: &str = "iifs";

const CT_STATE_INVALID: u32 = 1;
const CT_STATE_ESTABLISHED: u32 = 2;
const CT_STATE_RELATED: u32 = 4;

/// Upper bound on comparison threads per save
const MAX_COMPARE_WORKERS: usize = 8;

/// Name of the inbound chain of interface `name`
pub fn iif_chain(name: &str) -> String {
    format!("iif-{}", name)
}

#[derive(Clone, Copy)]
enum Direction {
    Src,
    Dst,
}

fn addr_field(family: TableFamily, dir: Direction) -> (u32, u32) {
    match (family, dir) {
        (TableFamily::Ipv6, Direction::Src) => (8, 16),
        (TableFamily::Ipv6, Direction::Dst) => (24, 16),
        (_, Direction::Src) => (12, 4),
        (_, Direction::Dst) => (16, 4),
    }
}

fn ip_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn load_addr(family: TableFamily, dir: Direction) -> Expr {
    let (offset, len) = addr_field(family, dir);
    Expr::Payload {
        base: PayloadBase::Network,
        offset,
        len,
        dreg: NFT_REG_1,
    }
}

/// `ip saddr/daddr` within `net`, as a range rather than a masked compare
fn match_addr_range(family: TableFamily, dir: Direction, net: &IpNet) -> Vec<Expr> {
    vec![
        load_addr(family, dir),
        Expr::Range {
            op: CmpOp::Eq,
            sreg: NFT_REG_1,
            from: ip_bytes(net.network()),
            to: ip_bytes(net.broadcast()),
        },
    ]
}

fn match_addr(family: TableFamily, dir: Direction, addr: IpAddr) -> Vec<Expr> {
    vec![
        load_addr(family, dir),
        Expr::Cmp {
            op: CmpOp::Eq,
            sreg: NFT_REG_1,
            data: ip_bytes(addr),
        },
    ]
}

fn match_meta(key: MetaKey, data: Vec<u8>) -> Vec<Expr> {
    vec![
        Expr::Meta {
            key,
            dreg: NFT_REG_1,
        },
        Expr::Cmp {
            op: CmpOp::Eq,
            sreg: NFT_REG_1,
            data,
        },
    ]
}

fn match_iifname(name: &str) -> Vec<Expr> {
    match_meta(MetaKey::IifName, ifname_bytes(name))
}

fn match_oifname(name: &str) -> Vec<Expr> {
    match_meta(MetaKey::OifName, ifname_bytes(name))
}

fn match_l4proto(proto: u8) -> Vec<Expr> {
    match_meta(MetaKey::L4Proto, vec![proto])
}

fn match_dport(port: u16) -> Vec<Expr> {
    vec![
        Expr::Payload {
            base: PayloadBase::Transport,
            offset: 2,
            len: 2,
            dreg: NFT_REG_1,
        },
        Expr::Cmp {
            op: CmpOp::Eq,
            sreg: NFT_REG_1,
            data: port.to_be_bytes().to_vec(),
        },
    ]
}

fn lookup(set: &str, sreg: u32) -> Expr {
    Expr::Lookup {
        set: set.to_string(),
        sreg,
        dreg: Some(NFT_REG_VERDICT),
        invert: false,
    }
}

/// Key of a `meta l4proto . th dport` map element. Each component of a
/// concatenation occupies a 4-byte register slot.
pub fn port_element_key(proto: u8, port: u16) -> Vec<u8> {
    let mut key = vec![proto, 0, 0, 0];
    key.extend_from_slice(&port.to_be_bytes());
    key.extend_from_slice(&[0, 0]);
    key
}

fn port_map_key_type() -> DataType {
    DataType::concat(&[DataType::INET_PROTO, DataType::INET_SERVICE])
}

fn ct_state_key(state: u32) -> Vec<u8> {
    state.to_ne_bytes().to_vec()
}

fn rule_ref(rule: &Rule) -> RuleRef {
    RuleRef::new(rule.table.clone(), rule.handle)
}

fn check_ifname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= IFNAMSIZ {
        return Err(Error::Config(format!("invalid interface name '{}'", name)));
    }
    Ok(())
}

/// Fail if another group already maps one of `record`'s port entries to a
/// different verdict. A map element holds exactly one verdict.
fn check_port_conflicts(
    state: &RouterState,
    record: &GroupRecord,
    verdict: &Verdict,
) -> Result<()> {
    for (map, key) in &record.entries {
        let Some(owner) = state.port_maps.get(map).and_then(|m| m.owners.get(key)) else {
            continue;
        };
        if owner.verdict != *verdict {
            return Err(Error::Filter(format!(
                "{}: port {}/{} already mapped to {}",
                map,
                u16::from_be_bytes([key[4], key[5]]),
                key[0],
                owner.verdict
            )));
        }
    }
    Ok(())
}

/// Set handle used to reference an existing map by name
fn map_ref(table: &Table, name: &str, key: DataType) -> Set {
    Set::verdict_map(table.clone(), name, key)
}

type ChainId = (Table, String);

/// Find a committed rule identical to each candidate. Candidates are split
/// across scoped threads; every thread only reads the snapshot.
fn find_existing(candidates: &[Rule], snapshot: &HashMap<ChainId, Vec<Rule>>) -> Vec<Option<Rule>> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_COMPARE_WORKERS);
    let chunk = candidates.len().div_ceil(workers);

    thread::scope(|s| {
        let handles: Vec<_> = candidates
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || {
                    part.iter()
                        .map(|candidate| {
                            snapshot
                                .get(&(candidate.table.clone(), candidate.chain.clone()))?
                                .iter()
                                .find(|r| r.same_as(candidate))
                                .cloned()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

#[derive(Debug, Clone)]
struct PortOwner {
    verdict: Verdict,
    count: usize,
}

#[derive(Debug, Clone)]
struct PortMap {
    set: Set,
    owners: HashMap<Vec<u8>, PortOwner>,
}

/// Port-map elements claimed by one security group
#[derive(Debug, Clone, Default)]
struct GroupRecord {
    entries: BTreeSet<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
struct RouterState {
    cleared: bool,
    iif_chains: BTreeSet<String>,
    rule_map: BTreeMap<String, Vec<Rule>>,
    refs: RefCounts,
    port_maps: BTreeMap<String, PortMap>,
    groups: HashMap<String, GroupRecord>,
}

/// Packet filter router over a [`PacketFilter`] backend.
///
/// All mutations are serialized by an internal lock. A failed operation
/// leaves the bookkeeping as it was before the call.
pub struct FilterRouter {
    filter: Arc<dyn PacketFilter>,
    tables: [Table; 2],
    state: Mutex<RouterState>,
}

impl FilterRouter {
    /// Create the tables, base chains and maps, replacing any leftovers
    /// with the same name.
    pub fn new(filter: Arc<dyn PacketFilter>, table_name: &str) -> Result<Self> {
        let router = Self {
            filter,
            tables: [
                Table::new(table_name, TableFamily::Ipv4),
                Table::new(table_name, TableFamily::Ipv6),
            ],
            state: Mutex::new(RouterState::default()),
        };
        router.init()?;
        log::info!("Packet filter tables '{}' initialized", table_name);
        Ok(router)
    }

    fn init(&self) -> Result<()> {
        self.filter.discard();
        // add-then-delete removes a stale table without failing on a fresh host
        for table in &self.tables {
            self.filter.add_table(table)?;
            self.filter.del_table(table)?;
        }
        self.filter.commit()?;

        for table in &self.tables {
            self.init_table(table)?;
        }
        self.filter.commit()
    }

    fn init_table(&self, table: &Table) -> Result<()> {
        let filter = &self.filter;
        filter.add_table(table)?;

        let base = |hook, priority, chain_type| BaseChain {
            hook,
            priority,
            chain_type,
            policy: Verdict::Accept,
        };
        let chains = [
            (CHAIN_INPUT, base(Hook::Input, priority::FILTER, ChainType::Filter)),
            (CHAIN_FORWARD, base(Hook::Forward, priority::FILTER, ChainType::Filter)),
            (CHAIN_OUTPUT, base(Hook::Output, priority::FILTER, ChainType::Filter)),
            (CHAIN_PREROUTING, base(Hook::Prerouting, priority::DSTNAT, ChainType::Nat)),
            (CHAIN_POSTROUTING, base(Hook::Postrouting, priority::SRCNAT, ChainType::Nat)),
        ];
        for (name, base) in chains {
            filter.add_chain(&Chain::base(table.clone(), name, base))?;
        }

        let ct_map = Set::verdict_map(table.clone(), CT_STATE_MAP, DataType::CT_STATE);
        filter.add_set(&ct_map)?;
        filter.set_add_elements(
            &ct_map,
            &[
                SetElement::with_verdict(ct_state_key(CT_STATE_INVALID), Verdict::Drop),
                SetElement::with_verdict(ct_state_key(CT_STATE_ESTABLISHED), Verdict::Accept),
                SetElement::with_verdict(ct_state_key(CT_STATE_RELATED), Verdict::Accept),
            ],
        )?;

        let iif_map = Set::verdict_map(table.clone(), IIF_MAP, DataType::IFNAME);
        filter.add_set(&iif_map)?;
        filter.set_add_elements(
            &iif_map,
            &[SetElement::with_verdict(ifname_bytes("lo"), Verdict::Accept)],
        )?;

        let ct_lookup = vec![
            Expr::Ct {
                key: CtKey::State,
                dreg: NFT_REG_1,
            },
            lookup(CT_STATE_MAP, NFT_REG_1),
        ];
        filter.add_rule(&Rule::new(table.clone(), CHAIN_INPUT, ct_lookup.clone()))?;
        filter.add_rule(&Rule::new(table.clone(), CHAIN_FORWARD, ct_lookup))?;
        filter.add_rule(&Rule::new(
            table.clone(),
            CHAIN_INPUT,
            vec![
                Expr::Meta {
                    key: MetaKey::IifName,
                    dreg: NFT_REG_1,
                },
                lookup(IIF_MAP, NFT_REG_1),
            ],
        ))?;
        filter.add_rule(&Rule::new(
            table.clone(),
            CHAIN_OUTPUT,
            vec![Expr::verdict(Verdict::Accept)],
        ))?;
        Ok(())
    }

    /// The IPv4 and IPv6 tables
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, family: TableFamily) -> &Table {
        match family {
            TableFamily::Ipv6 => &self.tables[1],
            _ => &self.tables[0],
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the state, restoring it and dropping queued
    /// mutations if `f` fails.
    fn transact<T>(&self, f: impl FnOnce(&mut RouterState) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        if state.cleared {
            return Err(Error::InvalidState("filter router has been cleared".into()));
        }
        let saved = state.clone();
        let result = f(&mut *state);
        if result.is_err() {
            self.filter.discard();
            *state = saved;
        }
        result
    }

    fn ensure_iif_chain(&self, state: &mut RouterState, name: &str) -> Result<()> {
        if state.iif_chains.contains(name) {
            return Ok(());
        }
        check_ifname(name)?;
        let chain = iif_chain(name);
        for table in &self.tables {
            self.filter.add_chain(&Chain::regular(table.clone(), &chain))?;
            self.filter.set_add_elements(
                &map_ref(table, IIF_MAP, DataType::IFNAME),
                &[SetElement::with_verdict(
                    ifname_bytes(name),
                    Verdict::Jump(chain.clone()),
                )],
            )?;
        }
        self.filter.commit()?;
        state.iif_chains.insert(name.to_string());
        log::debug!("Created inbound chain {}", chain);
        Ok(())
    }

    fn ensure_port_map(&self, state: &mut RouterState, table: &Table, name: &str) -> Result<()> {
        if state.port_maps.contains_key(name) {
            return Ok(());
        }
        let set = Set::verdict_map(table.clone(), name, port_map_key_type());
        self.filter.add_set(&set)?;
        self.filter.commit()?;
        state.port_maps.insert(
            name.to_string(),
            PortMap {
                set,
                owners: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Install `candidates` under `key`, reusing identical committed rules,
    /// and take one reference on every rule used.
    fn save_filter_rules(
        &self,
        state: &mut RouterState,
        key: &str,
        candidates: Vec<Rule>,
    ) -> Result<()> {
        let mut snapshot: HashMap<ChainId, Vec<Rule>> = HashMap::new();
        for candidate in &candidates {
            let id = (candidate.table.clone(), candidate.chain.clone());
            if !snapshot.contains_key(&id) {
                let rules = self.filter.get_rules(&candidate.table, &candidate.chain)?;
                snapshot.insert(id, rules);
            }
        }

        let existing = find_existing(&candidates, &snapshot);

        let mut installed = Vec::with_capacity(candidates.len());
        let mut added = Vec::new();
        for (candidate, found) in candidates.into_iter().zip(existing) {
            match found {
                Some(rule) => {
                    log::debug!("{}: reusing rule {}", key, rule_ref(&rule));
                    installed.push(rule);
                }
                None => {
                    self.filter.add_rule(&candidate)?;
                    added.push(candidate);
                }
            }
        }

        if !added.is_empty() {
            self.filter.commit()?;

            let mut claimed: HashSet<RuleRef> = snapshot
                .values()
                .flatten()
                .map(rule_ref)
                .collect();
            let mut fresh: HashMap<ChainId, Vec<Rule>> = HashMap::new();
            for candidate in added {
                let id = (candidate.table.clone(), candidate.chain.clone());
                if !fresh.contains_key(&id) {
                    let rules = self.filter.get_rules(&candidate.table, &candidate.chain)?;
                    fresh.insert(id.clone(), rules);
                }
                let committed = fresh[&id]
                    .iter()
                    .find(|r| !claimed.contains(&rule_ref(r)) && r.same_as(&candidate))
                    .cloned()
                    .ok_or_else(|| Error::MissingRule {
                        table: candidate.table.to_string(),
                        chain: candidate.chain.clone(),
                    })?;
                claimed.insert(rule_ref(&committed));
                installed.push(committed);
            }
        }

        for rule in &installed {
            state.refs.acquire(rule_ref(rule));
        }
        state
            .rule_map
            .entry(key.to_string())
            .or_default()
            .extend(installed);
        Ok(())
    }

    /// Drop the references held by `key` and queue deletion of every rule
    /// nobody else uses. Does not commit.
    fn release_rules(&self, state: &mut RouterState, key: &str) -> Result<usize> {
        let rules = state
            .rule_map
            .remove(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        let mut deleted = 0;
        for rule in &rules {
            if state.refs.release(&rule_ref(rule)) == 0 {
                self.filter.del_rule(rule)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn delete_filter_rules(&self, state: &mut RouterState, key: &str) -> Result<()> {
        let deleted = self.release_rules(state, key)?;
        self.filter.commit()?;
        log::debug!("{}: deleted {} rules", key, deleted);
        Ok(())
    }

    /// Install security groups. Groups already installed are left alone.
    ///
    /// With `iif` and no destination prefix, rules go to the interface's
    /// own inbound chain; without `iif` or destination they go to `input`;
    /// with a destination prefix they go to `forward`.
    pub fn set_security_groups(&self, iif: Option<&str>, groups: &[SecurityGroup]) -> Result<()> {
        for group in groups {
            self.transact(|state| self.add_security_group(state, iif, group))?;
        }
        Ok(())
    }

    fn add_security_group(
        &self,
        state: &mut RouterState,
        iif: Option<&str>,
        group: &SecurityGroup,
    ) -> Result<()> {
        group.validate()?;
        let key = sg_key(iif, group);
        if state.groups.contains_key(&key) {
            log::debug!("Security group {} already installed", key);
            return Ok(());
        }
        if group.ports.is_empty() {
            log::debug!("Security group {} has no port entries", key);
            return Ok(());
        }
        let (map_v4, map_v6) = port_vmap_names(iif, group);

        let chain = match (iif, &group.dst) {
            (Some(name), None) => {
                self.ensure_iif_chain(state, name)?;
                iif_chain(name)
            }
            (None, None) => CHAIN_INPUT.to_string(),
            (iif, Some(_)) => {
                if let Some(name) = iif {
                    check_ifname(name)?;
                }
                CHAIN_FORWARD.to_string()
            }
        };
        let verdict = if group.deny {
            Verdict::Drop
        } else {
            Verdict::Accept
        };
        let has_icmp = group.ports.iter().any(|p| p.protocol == Protocol::Icmp);
        let port_groups: Vec<_> = group
            .ports
            .iter()
            .filter(|p| p.protocol != Protocol::Icmp)
            .collect();

        let mut candidates = Vec::new();
        let mut record = GroupRecord::default();
        let mut new_maps = Vec::new();
        for family in group.families() {
            let table = self.table(family).clone();

            let mut matches = Vec::new();
            if let (Some(name), Some(_)) = (iif, &group.dst) {
                matches.extend(match_iifname(name));
            }
            if let Some(src) = &group.src {
                matches.extend(match_addr_range(family, Direction::Src, src));
            }
            if let Some(dst) = &group.dst {
                matches.extend(match_addr_range(family, Direction::Dst, dst));
            }

            if has_icmp {
                let mut exprs = matches.clone();
                exprs.extend(match_l4proto(Protocol::Icmp.number(family)));
                exprs.push(Expr::verdict(verdict.clone()));
                candidates.push(Rule::new(table.clone(), chain.as_str(), exprs));
            }

            if !port_groups.is_empty() {
                let map = match family {
                    TableFamily::Ipv6 => &map_v6,
                    _ => &map_v4,
                };
                new_maps.push((table.clone(), map.clone()));

                let mut exprs = matches;
                exprs.push(Expr::Meta {
                    key: MetaKey::L4Proto,
                    dreg: NFT_REG_1,
                });
                exprs.push(Expr::Payload {
                    base: PayloadBase::Transport,
                    offset: 2,
                    len: 2,
                    dreg: NFT_REG32_01,
                });
                exprs.push(lookup(map, NFT_REG_1));
                candidates.push(Rule::new(table.clone(), chain.as_str(), exprs));

                for pg in &port_groups {
                    let proto = pg.protocol.number(family);
                    for port in pg.from_port..=pg.to_port {
                        record
                            .entries
                            .insert((map.clone(), port_element_key(proto, port)));
                    }
                }
            }
        }

        check_port_conflicts(state, &record, &verdict)?;
        for (table, map) in &new_maps {
            self.ensure_port_map(state, table, map)?;
        }
        self.save_filter_rules(state, &key, candidates)?;
        self.add_port_elements(state, &record, &verdict)?;
        log::info!(
            "Installed security group {} in {} ({} port entries)",
            key,
            chain,
            record.entries.len()
        );
        state.groups.insert(key, record);
        Ok(())
    }

    fn add_port_elements(
        &self,
        state: &mut RouterState,
        record: &GroupRecord,
        verdict: &Verdict,
    ) -> Result<()> {
        let mut new_elements: BTreeMap<&str, Vec<SetElement>> = BTreeMap::new();
        for (map, key) in &record.entries {
            let port_map = state
                .port_maps
                .get(map)
                .ok_or_else(|| Error::Filter(format!("port map {} missing", map)))?;
            if !port_map.owners.contains_key(key) {
                new_elements
                    .entry(map.as_str())
                    .or_default()
                    .push(SetElement::with_verdict(key.clone(), verdict.clone()));
            }
        }

        for (map, elements) in &new_elements {
            let set = &state.port_maps[*map].set;
            self.filter.set_add_elements(set, elements)?;
        }
        if !new_elements.is_empty() {
            self.filter.commit()?;
        }

        for (map, key) in &record.entries {
            if let Some(port_map) = state.port_maps.get_mut(map) {
                port_map
                    .owners
                    .entry(key.clone())
                    .or_insert_with(|| PortOwner {
                        verdict: verdict.clone(),
                        count: 0,
                    })
                    .count += 1;
            }
        }
        Ok(())
    }

    /// Remove security groups installed by [`FilterRouter::set_security_groups`].
    ///
    /// Only the port entries each group owns are removed; a port map is
    /// deleted once no group uses it.
    pub fn delete_security_groups(
        &self,
        iif: Option<&str>,
        groups: &[SecurityGroup],
    ) -> Result<()> {
        for group in groups {
            self.transact(|state| self.remove_security_group(state, iif, group))?;
        }
        Ok(())
    }

    fn remove_security_group(
        &self,
        state: &mut RouterState,
        iif: Option<&str>,
        group: &SecurityGroup,
    ) -> Result<()> {
        let key = sg_key(iif, group);
        let record = state
            .groups
            .remove(&key)
            .ok_or_else(|| Error::UnknownKey(key.clone()))?;

        // rules first: a map cannot be deleted while a rule looks it up
        self.release_rules(state, &key)?;

        let mut removed: BTreeMap<String, Vec<SetElement>> = BTreeMap::new();
        for (map, elem_key) in &record.entries {
            let Some(port_map) = state.port_maps.get_mut(map) else {
                continue;
            };
            let Some(owner) = port_map.owners.get_mut(elem_key) else {
                continue;
            };
            owner.count -= 1;
            if owner.count == 0 {
                port_map.owners.remove(elem_key);
                removed
                    .entry(map.clone())
                    .or_default()
                    .push(SetElement::new(elem_key.clone()));
            }
        }

        for (map, elements) in removed {
            let Some(port_map) = state.port_maps.get(&map) else {
                continue;
            };
            if port_map.owners.is_empty() {
                self.filter.flush_set(&port_map.set)?;
                self.filter.del_set(&port_map.set)?;
                state.port_maps.remove(&map);
                log::debug!("Deleted port map {}", map);
            } else {
                self.filter.set_delete_elements(&port_map.set, &elements)?;
            }
        }

        self.filter.commit()?;
        log::info!("Deleted security group {}", key);
        Ok(())
    }

    /// Forward `port` on every local address to `forward_ip:forward_port`
    pub fn forward_port(
        &self,
        port: u16,
        forward_port: u16,
        forward_ip: IpAddr,
        protocol: Protocol,
    ) -> Result<()> {
        self.add_port_forward(PortForward {
            dst_ip: None,
            port,
            forward_ip,
            forward_port,
            protocol,
        })
    }

    /// Forward `dst_ip:port` to `forward_ip:forward_port`.
    ///
    /// Installs a DNAT rule in `nat-prerouting`, a masquerade rule in
    /// `nat-postrouting` and an accept rule in `forward`. The last two
    /// match only the forward address and are shared between forwards to
    /// the same host.
    pub fn forward_port_on_ip(
        &self,
        dst_ip: IpAddr,
        port: u16,
        forward_port: u16,
        forward_ip: IpAddr,
        protocol: Protocol,
    ) -> Result<()> {
        self.add_port_forward(PortForward {
            dst_ip: Some(dst_ip),
            port,
            forward_ip,
            forward_port,
            protocol,
        })
    }

    pub fn delete_forward_port(
        &self,
        port: u16,
        forward_port: u16,
        forward_ip: IpAddr,
        protocol: Protocol,
    ) -> Result<()> {
        let key = port_forward_key(None, port, forward_ip, forward_port, protocol);
        self.transact(|state| self.delete_filter_rules(state, &key))
    }

    pub fn delete_forward_port_on_ip(
        &self,
        dst_ip: IpAddr,
        port: u16,
        forward_port: u16,
        forward_ip: IpAddr,
        protocol: Protocol,
    ) -> Result<()> {
        let key = port_forward_key(Some(dst_ip), port, forward_ip, forward_port, protocol);
        self.transact(|state| self.delete_filter_rules(state, &key))
    }

    /// Install a [`PortForward`] as configured
    pub fn add_port_forward(&self, pf: PortForward) -> Result<()> {
        pf.validate()?;
        let key = port_forward_key(pf.dst_ip, pf.port, pf.forward_ip, pf.forward_port, pf.protocol);
        self.transact(|state| {
            if state.rule_map.contains_key(&key) {
                log::debug!("Port forward {} already installed", key);
                return Ok(());
            }
            let family = table_family(AddressFamily::of_addr(&pf.forward_ip));
            let table = self.table(family).clone();
            let proto = pf.protocol.number(family);

            let mut dnat = Vec::new();
            if let Some(dst) = pf.dst_ip {
                dnat.extend(match_addr(family, Direction::Dst, dst));
            }
            dnat.extend(match_l4proto(proto));
            dnat.extend(match_dport(pf.port));
            dnat.push(Expr::Immediate {
                dreg: NFT_REG_1,
                data: ImmediateData::Value(ip_bytes(pf.forward_ip)),
            });
            dnat.push(Expr::Immediate {
                dreg: NFT_REG_2,
                data: ImmediateData::Value(pf.forward_port.to_be_bytes().to_vec()),
            });
            dnat.push(Expr::Nat {
                nat_type: NatType::Dnat,
                family,
                reg_addr_min: Some(NFT_REG_1),
                reg_proto_min: Some(NFT_REG_2),
            });

            let mut masq = match_addr(family, Direction::Dst, pf.forward_ip);
            masq.push(Expr::Masq);

            let mut accept = match_addr(family, Direction::Dst, pf.forward_ip);
            accept.push(Expr::verdict(Verdict::Accept));

            self.save_filter_rules(
                state,
                &key,
                vec![
                    Rule::new(table.clone(), CHAIN_PREROUTING, dnat),
                    Rule::new(table.clone(), CHAIN_POSTROUTING, masq),
                    Rule::new(table, CHAIN_FORWARD, accept),
                ],
            )?;
            log::info!(
                "Forwarding {} port {}{} to {}:{}",
                pf.protocol,
                pf.port,
                pf.dst_ip.map(|ip| format!(" on {}", ip)).unwrap_or_default(),
                pf.forward_ip,
                pf.forward_port
            );
            Ok(())
        })
    }

    /// Accept traffic from `src` arriving on `src_if` and leaving through
    /// `dst_if` towards `dst`; masquerade it when `nat` is set.
    ///
    /// A zero-length `dst` matches any destination.
    pub fn forward_traffic(
        &self,
        src_if: &str,
        src: IpNet,
        dst_if: &str,
        dst: IpNet,
        nat: bool,
    ) -> Result<()> {
        self.add_traffic_forward(TrafficForward {
            src_interface: src_if.to_string(),
            src,
            dst_interface: dst_if.to_string(),
            dst,
            nat,
        })
    }

    /// Install a [`TrafficForward`] as configured
    pub fn add_traffic_forward(&self, tf: TrafficForward) -> Result<()> {
        tf.validate()?;
        check_ifname(&tf.src_interface)?;
        check_ifname(&tf.dst_interface)?;
        let key = traffic_forward_key(&tf.src_interface, &tf.src, &tf.dst_interface, &tf.dst);
        self.transact(|state| {
            if state.rule_map.contains_key(&key) {
                log::debug!("Traffic forward {} already installed", key);
                return Ok(());
            }
            let family = table_family(AddressFamily::of_net(&tf.src));
            let table = self.table(family).clone();

            let mut forward = match_iifname(&tf.src_interface);
            forward.extend(match_oifname(&tf.dst_interface));
            forward.extend(match_addr_range(family, Direction::Src, &tf.src));
            if tf.dst.prefix_len() != 0 {
                forward.extend(match_addr_range(family, Direction::Dst, &tf.dst));
            }
            forward.push(Expr::verdict(Verdict::Accept));

            let mut rules = vec![Rule::new(table.clone(), CHAIN_FORWARD, forward)];
            if tf.nat {
                let mut masq = match_oifname(&tf.dst_interface);
                masq.extend(match_addr_range(family, Direction::Src, &tf.src));
                masq.push(Expr::Masq);
                rules.push(Rule::new(table, CHAIN_POSTROUTING, masq));
            }
            self.save_filter_rules(state, &key, rules)?;
            log::info!(
                "Forwarding {} ({}) -> {} ({}){}",
                tf.src,
                tf.src_interface,
                tf.dst,
                tf.dst_interface,
                if tf.nat { " with masquerade" } else { "" }
            );
            Ok(())
        })
    }

    pub fn delete_forward_traffic(
        &self,
        src_if: &str,
        src: IpNet,
        dst_if: &str,
        dst: IpNet,
    ) -> Result<()> {
        let key = traffic_forward_key(src_if, &src, dst_if, &dst);
        self.transact(|state| self.delete_filter_rules(state, &key))
    }

    /// Delete both tables in one transaction. Calling it again is a no-op.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        if state.cleared {
            return Ok(());
        }
        self.filter.discard();
        for table in &self.tables {
            self.filter.del_table(table)?;
        }
        if let Err(err) = self.filter.commit() {
            if !err.is_not_found() {
                return Err(err);
            }
            // one of the tables is already gone; delete the other on its own
            for table in &self.tables {
                self.filter.del_table(table)?;
                match self.filter.commit() {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
            }
        }
        *state = RouterState {
            cleared: true,
            ..Default::default()
        };
        log::info!("Packet filter tables '{}' deleted", self.tables[0].name);
        Ok(())
    }

    pub fn is_cleared(&self) -> bool {
        self.lock().cleared
    }

    /// Keys of every installed entry, sorted
    pub fn installed_keys(&self) -> Vec<String> {
        self.lock().rule_map.keys().cloned().collect()
    }

    /// Rules held under `key`
    pub fn rules_for(&self, key: &str) -> Vec<Rule> {
        self.lock().rule_map.get(key).cloned().unwrap_or_default()
    }

    /// References held on the rule `handle` in `table`
    pub fn ref_count(&self, table: &Table, handle: u64) -> usize {
        self.lock()
            .refs
            .count(&RuleRef::new(table.clone(), handle))
    }

    /// Names of the port maps currently in use
    pub fn port_maps(&self) -> Vec<String> {
        self.lock().port_maps.keys().cloned().collect()
    }
}

impl fmt::Display for FilterRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        writeln!(f, "filter router {} / {}", self.tables[0], self.tables[1])?;
        if state.cleared {
            return writeln!(f, "  (cleared)");
        }
        if !state.iif_chains.is_empty() {
            let names: Vec<_> = state.iif_chains.iter().map(String::as_str).collect();
            writeln!(f, "  interfaces: {}", names.join(", "))?;
        }
        for (key, rules) in &state.rule_map {
            writeln!(f, "  {}: {} rules", key, rules.len())?;
        }
        for (name, map) in &state.port_maps {
            writeln!(f, "  {} ({}): {} ports", name, map.set.table, map.owners.len())?;
        }
        let mut shared: Vec<_> = state.refs.iter().filter(|(_, c)| *c > 1).collect();
        shared.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        for (rule, count) in shared {
            writeln!(f, "  shared {} x{}", rule, count)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FilterRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRouter")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

//! In-memory packet filter for tests.
//!
//! Mirrors the kernel's transactional behaviour closely enough for the
//! router's bookkeeping to be checked: operations are queued, `commit`
//! applies them all or none, rules get increasing handles, and the usual
//! errno values are reported for missing or conflicting objects.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use netplane_nl::nftables::{Chain, Rule, Set, SetElement, Table};
use netplane_nl::NetlinkError;

use super::PacketFilter;
use crate::error::Result;

#[derive(Debug, Clone)]
enum Op {
    AddTable(Table),
    DelTable(Table),
    AddChain(Chain),
    AddRule(Rule),
    DelRule(Rule),
    AddSet(Set),
    DelSet(Set),
    FlushSet(Set),
    AddElements(Set, Vec<SetElement>),
    DelElements(Set, Vec<SetElement>),
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    chains: BTreeMap<String, Vec<Rule>>,
    sets: BTreeMap<String, Vec<SetElement>>,
}

#[derive(Debug, Clone, Default)]
struct Ruleset {
    tables: HashMap<Table, MemTable>,
    next_handle: u64,
}

fn errno(code: i32) -> crate::error::Error {
    NetlinkError::Kernel(code).into()
}

impl Ruleset {
    fn table(&mut self, table: &Table) -> Result<&mut MemTable> {
        self.tables.get_mut(table).ok_or_else(|| errno(libc::ENOENT))
    }

    fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::AddTable(table) => {
                self.tables.entry(table).or_default();
            }
            Op::DelTable(table) => {
                self.tables.remove(&table).ok_or_else(|| errno(libc::ENOENT))?;
            }
            Op::AddChain(chain) => {
                self.table(&chain.table)?
                    .chains
                    .entry(chain.name)
                    .or_default();
            }
            Op::AddRule(mut rule) => {
                self.next_handle += 1;
                rule.handle = self.next_handle;
                let table = self.table(&rule.table)?;
                for expr in &rule.exprs {
                    if let netplane_nl::nftables::Expr::Lookup { set, .. } = expr {
                        if !table.sets.contains_key(set) {
                            return Err(errno(libc::ENOENT));
                        }
                    }
                }
                table
                    .chains
                    .get_mut(&rule.chain)
                    .ok_or_else(|| errno(libc::ENOENT))?
                    .push(rule);
            }
            Op::DelRule(rule) => {
                let rules = self
                    .table(&rule.table)?
                    .chains
                    .get_mut(&rule.chain)
                    .ok_or_else(|| errno(libc::ENOENT))?;
                let pos = rules
                    .iter()
                    .position(|r| r.handle == rule.handle)
                    .ok_or_else(|| errno(libc::ENOENT))?;
                rules.remove(pos);
            }
            Op::AddSet(set) => {
                self.table(&set.table)?.sets.entry(set.name).or_default();
            }
            Op::DelSet(set) => {
                let table = self.table(&set.table)?;
                let in_use = table.chains.values().flatten().any(|r| {
                    r.exprs.iter().any(|e| {
                        matches!(e, netplane_nl::nftables::Expr::Lookup { set: name, .. } if *name == set.name)
                    })
                });
                if in_use {
                    return Err(errno(libc::EBUSY));
                }
                table.sets.remove(&set.name).ok_or_else(|| errno(libc::ENOENT))?;
            }
            Op::FlushSet(set) => {
                self.table(&set.table)?
                    .sets
                    .get_mut(&set.name)
                    .ok_or_else(|| errno(libc::ENOENT))?
                    .clear();
            }
            Op::AddElements(set, elements) => {
                let existing = self
                    .table(&set.table)?
                    .sets
                    .get_mut(&set.name)
                    .ok_or_else(|| errno(libc::ENOENT))?;
                for element in elements {
                    match existing.iter().find(|e| e.key == element.key) {
                        Some(e) if e.verdict == element.verdict => {}
                        Some(_) => return Err(errno(libc::EEXIST)),
                        None => existing.push(element),
                    }
                }
            }
            Op::DelElements(set, elements) => {
                let existing = self
                    .table(&set.table)?
                    .sets
                    .get_mut(&set.name)
                    .ok_or_else(|| errno(libc::ENOENT))?;
                for element in elements {
                    let pos = existing
                        .iter()
                        .position(|e| e.key == element.key)
                        .ok_or_else(|| errno(libc::ENOENT))?;
                    existing.remove(pos);
                }
            }
        }
        Ok(())
    }
}

/// Transactional in-memory ruleset
#[derive(Debug, Default)]
pub struct MemoryFilter {
    committed: Mutex<Ruleset>,
    pending: Mutex<Vec<Op>>,
    commits: Mutex<usize>,
    last_commit_thread: Mutex<Option<ThreadId>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, op: Op) -> Result<()> {
        lock(&self.pending).push(op);
        Ok(())
    }

    pub fn has_table(&self, table: &Table) -> bool {
        lock(&self.committed).tables.contains_key(table)
    }

    /// Committed rules of a chain; empty if the chain does not exist
    pub fn rules(&self, table: &Table, chain: &str) -> Vec<Rule> {
        lock(&self.committed)
            .tables
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_names(&self, table: &Table) -> Vec<String> {
        lock(&self.committed)
            .tables
            .get(table)
            .map(|t| t.chains.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_names(&self, table: &Table) -> Vec<String> {
        lock(&self.committed)
            .tables
            .get(table)
            .map(|t| t.sets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed elements of a set, or `None` if it does not exist
    pub fn elements(&self, table: &Table, set: &str) -> Option<Vec<SetElement>> {
        lock(&self.committed)
            .tables
            .get(table)
            .and_then(|t| t.sets.get(set))
            .cloned()
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> usize {
        *lock(&self.commits)
    }

    /// Thread that ran the latest successful commit
    pub fn last_commit_thread(&self) -> Option<ThreadId> {
        *lock(&self.last_commit_thread)
    }

    /// Total committed rule count across every table
    pub fn rule_count(&self) -> usize {
        lock(&self.committed)
            .tables
            .values()
            .flat_map(|t| t.chains.values())
            .map(Vec::len)
            .sum()
    }
}

impl PacketFilter for MemoryFilter {
    fn add_table(&self, table: &Table) -> Result<()> {
        self.queue(Op::AddTable(table.clone()))
    }

    fn del_table(&self, table: &Table) -> Result<()> {
        self.queue(Op::DelTable(table.clone()))
    }

    fn add_chain(&self, chain: &Chain) -> Result<()> {
        self.queue(Op::AddChain(chain.clone()))
    }

    fn add_rule(&self, rule: &Rule) -> Result<()> {
        self.queue(Op::AddRule(rule.clone()))
    }

    fn del_rule(&self, rule: &Rule) -> Result<()> {
        self.queue(Op::DelRule(rule.clone()))
    }

    fn add_set(&self, set: &Set) -> Result<()> {
        self.queue(Op::AddSet(set.clone()))
    }

    fn del_set(&self, set: &Set) -> Result<()> {
        self.queue(Op::DelSet(set.clone()))
    }

    fn flush_set(&self, set: &Set) -> Result<()> {
        self.queue(Op::FlushSet(set.clone()))
    }

    fn set_add_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.queue(Op::AddElements(set.clone(), elements.to_vec()))
    }

    fn set_delete_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.queue(Op::DelElements(set.clone(), elements.to_vec()))
    }

    fn get_rules(&self, table: &Table, chain: &str) -> Result<Vec<Rule>> {
        lock(&self.committed)
            .tables
            .get(table)
            .ok_or_else(|| errno(libc::ENOENT))?
            .chains
            .get(chain)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn get_set_elements(&self, set: &Set) -> Result<Vec<SetElement>> {
        lock(&self.committed)
            .tables
            .get(&set.table)
            .and_then(|t| t.sets.get(&set.name))
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn commit(&self) -> Result<()> {
        let ops = std::mem::take(&mut *lock(&self.pending));
        if ops.is_empty() {
            return Ok(());
        }
        let mut committed = lock(&self.committed);
        let mut next = committed.clone();
        for op in ops {
            next.apply(op)?;
        }
        *committed = next;
        *lock(&self.commits) += 1;
        *lock(&self.last_commit_thread) = Some(thread::current().id());
        Ok(())
    }

    fn discard(&self) {
        lock(&self.pending).clear();
    }
}

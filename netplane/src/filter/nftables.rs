//! nf_tables backend over raw netlink.

use std::sync::{Mutex, PoisonError};

use netplane_nl::nftables::{self, Batch, Chain, Rule, Set, SetElement, Table};

use super::PacketFilter;
use crate::error::Result;

/// Queues changes in a netlink batch and sends it on commit
#[derive(Default)]
pub struct NftablesFilter {
    batch: Mutex<Batch>,
}

impl NftablesFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> netplane_nl::Result<()>,
    {
        let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut batch)?)
    }
}

impl PacketFilter for NftablesFilter {
    fn add_table(&self, table: &Table) -> Result<()> {
        self.with_batch(|b| b.add_table(table))
    }

    fn del_table(&self, table: &Table) -> Result<()> {
        self.with_batch(|b| b.del_table(table))
    }

    fn add_chain(&self, chain: &Chain) -> Result<()> {
        self.with_batch(|b| b.add_chain(chain))
    }

    fn add_rule(&self, rule: &Rule) -> Result<()> {
        self.with_batch(|b| b.add_rule(rule))
    }

    fn del_rule(&self, rule: &Rule) -> Result<()> {
        self.with_batch(|b| b.del_rule(rule))
    }

    fn add_set(&self, set: &Set) -> Result<()> {
        self.with_batch(|b| b.add_set(set))
    }

    fn del_set(&self, set: &Set) -> Result<()> {
        self.with_batch(|b| b.del_set(set))
    }

    fn flush_set(&self, set: &Set) -> Result<()> {
        self.with_batch(|b| b.flush_set(set))
    }

    fn set_add_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.with_batch(|b| b.add_elements(set, elements))
    }

    fn set_delete_elements(&self, set: &Set, elements: &[SetElement]) -> Result<()> {
        self.with_batch(|b| b.del_elements(set, elements))
    }

    fn get_rules(&self, table: &Table, chain: &str) -> Result<Vec<Rule>> {
        Ok(nftables::get_rules(table, chain)?)
    }

    fn get_set_elements(&self, set: &Set) -> Result<Vec<SetElement>> {
        Ok(nftables::get_set_elements(set)?)
    }

    fn commit(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.batch.lock().unwrap_or_else(PoisonError::into_inner));
        let queued = batch.len();
        batch.commit()?;
        if queued > 0 {
            log::debug!("nftables: committed {} operations", queued);
        }
        Ok(())
    }

    fn discard(&self) {
        let dropped = std::mem::take(&mut *self.batch.lock().unwrap_or_else(PoisonError::into_inner));
        if !dropped.is_empty() {
            log::debug!("nftables: discarded {} queued operations", dropped.len());
        }
    }
}

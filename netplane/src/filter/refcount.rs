//! Reference counts for physical rules shared by several logical entries.

use std::collections::HashMap;
use std::fmt;

use netplane_nl::nftables::Table;

/// Identity of a committed rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub table: Table,
    pub handle: u64,
}

impl RuleRef {
    pub fn new(table: Table, handle: u64) -> Self {
        Self { table, handle }
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.handle)
    }
}

/// Counts keyed by [`RuleRef`]. A rule may be deleted once its count
/// returns to zero.
#[derive(Debug, Default, Clone)]
pub struct RefCounts {
    counts: HashMap<RuleRef, usize>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference; returns the new count
    pub fn acquire(&mut self, rule: RuleRef) -> usize {
        let count = self.counts.entry(rule).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a reference; returns the remaining count. Unknown rules report
    /// zero.
    pub fn release(&mut self, rule: &RuleRef) -> usize {
        match self.counts.get_mut(rule) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.counts.remove(rule);
                0
            }
            None => 0,
        }
    }

    pub fn count(&self, rule: &RuleRef) -> usize {
        self.counts.get(rule).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RuleRef, usize)> {
        self.counts.iter().map(|(r, c)| (r, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_nl::nftables::TableFamily;

    #[test]
    fn test_release_reaches_zero_once() {
        let r = RuleRef::new(Table::new("netplane", TableFamily::Ipv4), 7);
        let mut refs = RefCounts::new();
        assert_eq!(refs.acquire(r.clone()), 1);
        assert_eq!(refs.acquire(r.clone()), 2);
        assert_eq!(refs.release(&r), 1);
        assert_eq!(refs.release(&r), 0);
        assert!(refs.is_empty());
        assert_eq!(refs.release(&r), 0);
    }

    #[test]
    fn test_same_handle_in_other_table_is_distinct() {
        let v4 = RuleRef::new(Table::new("netplane", TableFamily::Ipv4), 3);
        let v6 = RuleRef::new(Table::new("netplane", TableFamily::Ipv6), 3);
        let mut refs = RefCounts::new();
        refs.acquire(v4.clone());
        assert_eq!(refs.count(&v6), 0);
        assert_eq!(refs.count(&v4), 1);
    }
}

//! Candidate index plus the sargability facts derived for one keyspace term.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::spans::SargSpans;
use crate::datastore::{Index, IndexIdentity};
use crate::query::expr::Expr;

/// Clauses an index scan can satisfy by itself.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PushDownProperty(u8);

impl PushDownProperty {
    /// ORDER BY served by index order.
    pub const ORDER: Self = Self(1);
    /// LIMIT pushed into the scan.
    pub const LIMIT: Self = Self(1 << 1);
    /// OFFSET pushed into the scan.
    pub const OFFSET: Self = Self(1 << 2);
    /// GROUP BY and aggregates computed by the index.
    pub const GROUP_AGGS: Self = Self(1 << 3);

    /// No push-down.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// True when no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PushDownProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ORDER, "order"),
            (Self::LIMIT, "limit"),
            (Self::OFFSET, "offset"),
            (Self::GROUP_AGGS, "group_aggs"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Candidate index for one keyspace term.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    /// Index handle.
    pub index: Arc<dyn Index>,
    /// Key expressions qualified with the term alias.
    pub keys: Vec<Expr>,
    /// Leading sargable prefix of `keys`.
    pub sarg_keys: Vec<Expr>,
    /// Keys both sargable and needed; the sargable prefix length for AND
    /// predicates, the shortest disjunct prefix for OR predicates.
    pub min_keys: usize,
    /// Sargability score summed over the evaluated keys.
    pub sum_keys: usize,
    /// Partial-index condition, qualified and normalised.
    pub cond: Option<Expr>,
    /// Partial-index condition as declared, qualified.
    pub orig_cond: Option<Expr>,
    /// Spans, once computed.
    pub spans: Option<SargSpans>,
    /// True when `spans` need no residual filter.
    pub exact_spans: bool,
    /// Clauses this index can absorb.
    pub push_down: PushDownProperty,
}

impl IndexEntry {
    /// Entry with its sargable prefix already determined.
    pub fn new(
        index: Arc<dyn Index>,
        keys: Vec<Expr>,
        min_keys: usize,
        sum_keys: usize,
        cond: Option<Expr>,
        orig_cond: Option<Expr>,
    ) -> Self {
        let sarg_keys = keys.iter().take(min_keys).cloned().collect();
        Self {
            index,
            keys,
            sarg_keys,
            min_keys,
            sum_keys,
            cond,
            orig_cond,
            spans: None,
            exact_spans: false,
            push_down: PushDownProperty::empty(),
        }
    }

    /// Index name.
    pub fn name(&self) -> &str {
        self.index.name()
    }

    /// Identity key for candidate maps.
    pub fn identity(&self) -> IndexIdentity {
        IndexIdentity::of(&self.index)
    }

    /// True for the primary index.
    pub fn is_primary(&self) -> bool {
        self.index.is_primary()
    }

    /// True when the leading key is an array comprehension.
    pub fn has_array_key(&self) -> bool {
        self.keys.iter().any(|k| k.as_array_key().is_some())
    }

    /// Number of sarged keys.
    pub fn sarg_len(&self) -> usize {
        self.sarg_keys.len()
    }
}

/// Candidates keyed by index identity.
pub type IndexMap = FxHashMap<IndexIdentity, IndexEntry>;

/// Entries of `map` in name order.
pub fn sorted_entries(map: &IndexMap) -> Vec<&IndexEntry> {
    let mut entries: Vec<&IndexEntry> = map.values().collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));
    entries
}

//! Candidate discovery and minimisation.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::index_entry::{sorted_entries, IndexEntry, IndexMap};
use super::sarg::{sargable_for, SargScope};
use crate::datastore::{Index, IndexIdentity, IndexState};
use crate::query::expr::{Dnf, Expr, FilterCovers};

/// Scratch filter-cover maps reused across planning calls.
#[derive(Debug, Default)]
pub struct FilterCoversPool {
    free: Mutex<Vec<FilterCovers>>,
}

const POOL_RETAIN: usize = 16;

impl FilterCoversPool {
    /// Takes a cleared map; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> PooledCovers<'_> {
        let covers = self.free.lock().pop().unwrap_or_default();
        PooledCovers { pool: self, covers }
    }

    /// Maps currently parked in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Scoped loan of a [`FilterCovers`] map.
pub struct PooledCovers<'p> {
    pool: &'p FilterCoversPool,
    covers: FilterCovers,
}

impl Deref for PooledCovers<'_> {
    type Target = FilterCovers;

    fn deref(&self) -> &FilterCovers {
        &self.covers
    }
}

impl DerefMut for PooledCovers<'_> {
    fn deref_mut(&mut self) -> &mut FilterCovers {
        &mut self.covers
    }
}

impl Drop for PooledCovers<'_> {
    fn drop(&mut self) {
        let mut covers = std::mem::take(&mut self.covers);
        covers.clear();
        let mut free = self.pool.free.lock();
        if free.len() < POOL_RETAIN {
            free.push(covers);
        }
    }
}

/// Tie-break between two candidates that cover each other's sarged keys.
///
/// Implementations must be monotone in the sarged prefix: an entry with
/// more sarged keys never compares below one with fewer.
pub trait IndexPreference: Send + Sync + fmt::Debug {
    /// `Greater` when `a` is preferable to `b`.
    fn compare(&self, a: &IndexEntry, b: &IndexEntry, shortest: bool) -> Ordering;
}

/// Default preference: longer sarged prefix, then higher `sum_keys`, then
/// (in shortest mode) fewer declared keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct SumKeysPreference;

impl IndexPreference for SumKeysPreference {
    fn compare(&self, a: &IndexEntry, b: &IndexEntry, shortest: bool) -> Ordering {
        a.sarg_len()
            .cmp(&b.sarg_len())
            .then(a.sum_keys.cmp(&b.sum_keys))
            .then_with(|| {
                if shortest {
                    b.keys.len().cmp(&a.keys.len())
                } else {
                    Ordering::Equal
                }
            })
    }
}

/// Online indexes of the term whose condition the predicate implies and
/// whose leading key the predicate constrains.
pub fn sargable_indexes(
    indexes: &[Arc<dyn Index>],
    pred: &Expr,
    scope: SargScope<'_>,
    dnf: &Dnf,
) -> IndexMap {
    let mut out = IndexMap::default();
    for index in indexes {
        match index.state() {
            Ok((IndexState::Online, _)) => {}
            Ok((state, _)) => {
                debug!(index = index.name(), %state, "planner.index.not_online");
                continue;
            }
            Err(err) => {
                warn!(index = index.name(), error = %err, "planner.index.state_failed");
                continue;
            }
        }
        let keys: Vec<Expr> = if index.is_primary() {
            vec![Expr::meta_id(scope.alias)]
        } else {
            index
                .range_key()
                .iter()
                .map(|k| k.formalize(scope.alias))
                .collect()
        };
        let orig_cond = index.condition().map(|c| c.formalize(scope.alias));
        let cond = orig_cond.as_ref().map(|c| dnf.normalize(c));
        if let Some(cond) = &cond {
            if !pred.subset_of(cond) {
                continue;
            }
        }
        let (min, sum) = sargable_for(pred, &keys, scope);
        if min == 0 {
            continue;
        }
        let entry = IndexEntry::new(index.clone(), keys, min, sum, cond, orig_cond);
        out.insert(IndexIdentity::of(index), entry);
    }
    out
}

/// True when `a` can replace `b`: a's sarged keys account for every sarged
/// key of b (directly or through a's condition) and a's condition is at
/// least as narrow as b's.
pub fn narrower_or_equivalent(a: &IndexEntry, b: &IndexEntry, pool: &FilterCoversPool) -> bool {
    let mut covers = pool.acquire();
    if let Some(cond) = &a.cond {
        cond.filter_covers(&mut covers);
    }
    let keys_covered = b.sarg_keys.iter().all(|kb| {
        a.sarg_keys.iter().any(|ka| ka.depends_on(kb)) || covers.contains_key(&kb.to_string())
    });
    if !keys_covered {
        return false;
    }
    match (&a.cond, &b.cond) {
        (_, None) => true,
        (Some(ac), Some(bc)) => ac.subset_of(bc),
        (None, Some(_)) => false,
    }
}

/// Drops every candidate dominated by another remaining candidate.
///
/// Candidates are visited in name order so that mutually dominating
/// (equivalent) indexes resolve to the same survivor every time.
pub fn minimal_indexes(
    candidates: &IndexMap,
    shortest: bool,
    preference: &dyn IndexPreference,
    pool: &FilterCoversPool,
) -> IndexMap {
    let entries = sorted_entries(candidates);
    let mut removed: FxHashSet<IndexIdentity> = FxHashSet::default();
    for a in &entries {
        if removed.contains(&a.identity()) {
            continue;
        }
        for b in &entries {
            if a.identity() == b.identity() || removed.contains(&b.identity()) {
                continue;
            }
            if narrower_or_equivalent(a, b, pool)
                && preference.compare(a, b, shortest) != Ordering::Less
            {
                removed.insert(b.identity());
            }
        }
    }
    candidates
        .iter()
        .filter(|(id, _)| !removed.contains(*id))
        .map(|(id, e)| (*id, e.clone()))
        .collect()
}

/// Best covering candidate for the given expressions, if any.
///
/// Array indexes never cover: their entries hold elements, not the arrays.
pub fn covering_index<'e>(
    candidates: &'e IndexMap,
    exprs: &[Expr],
    alias: &str,
    pool: &FilterCoversPool,
) -> Option<&'e IndexEntry> {
    let mut entries = sorted_entries(candidates);
    entries.sort_by(|a, b| b.sarg_len().cmp(&a.sarg_len()));
    entries.into_iter().find(|entry| {
        if entry.has_array_key() {
            return false;
        }
        let mut covers = pool.acquire();
        if let Some(cond) = &entry.cond {
            cond.filter_covers(&mut covers);
        }
        exprs
            .iter()
            .all(|e| e.covered_by(alias, &entry.keys, &covers))
    })
}

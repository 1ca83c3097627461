#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use docql::datastore::memory::MemoryDatastore;
use docql::datastore::{Index, Indexer, Keyspace};
use docql::query::expr::{Dnf, Expr};
use docql::query::planner::{
    minimal_indexes, sargable_indexes, FilterCoversPool, IndexMap, SargScope, SumKeysPreference,
};
use proptest::prelude::*;

const FIELDS: [&str; 3] = ["a", "b", "c"];

fn p(field: &str) -> Expr {
    Expr::path("p", &[field])
}

fn names(map: &IndexMap) -> BTreeSet<String> {
    map.values().map(|e| e.name().to_owned()).collect()
}

/// Online indexes of a fresh `product` keyspace with the given key lists
/// (field positions into `FIELDS`).
fn indexes(defs: &[Vec<usize>]) -> Vec<Arc<dyn Index>> {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    for (i, keys) in defs.iter().enumerate() {
        let keys = keys.iter().map(|&k| Expr::ident(FIELDS[k])).collect();
        ks.create_index(&format!("ix{i}"), keys, None);
    }
    let indexers = ks.indexers().expect("indexers");
    indexers[0].indexes().expect("indexes")
}

fn candidates(indexes: &[Arc<dyn Index>], pred: &Expr) -> IndexMap {
    sargable_indexes(indexes, pred, SargScope::new("p"), &Dnf::new(64))
}

fn arb_index_defs() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(0usize..3, 1..=3), 1..=6)
}

proptest! {
    #[test]
    fn minimal_indexes_is_idempotent(
        defs in arb_index_defs(),
        constrained in prop::collection::btree_set(0usize..3, 1..=3),
        shortest in any::<bool>(),
    ) {
        let pred = Expr::and(
            constrained
                .iter()
                .map(|&f| Expr::eq(p(FIELDS[f]), Expr::lit(f as i64)))
                .collect(),
        );
        let indexes = indexes(&defs);
        let cands = candidates(&indexes, &pred);
        let pool = FilterCoversPool::default();

        let once = minimal_indexes(&cands, shortest, &SumKeysPreference, &pool);
        let twice = minimal_indexes(&once, shortest, &SumKeysPreference, &pool);
        prop_assert_eq!(names(&once), names(&twice));
        prop_assert_eq!(cands.is_empty(), once.is_empty());
        prop_assert!(names(&once).is_subset(&names(&cands)));
    }
}

#[test]
fn disjoint_candidates_are_both_kept() {
    let indexes = indexes(&[vec![0], vec![1]]);
    let pred = Expr::and(vec![
        Expr::eq(p("a"), Expr::lit(1i64)),
        Expr::eq(p("b"), Expr::lit(2i64)),
    ]);
    let cands = candidates(&indexes, &pred);
    assert_eq!(names(&cands), BTreeSet::from(["ix0".to_owned(), "ix1".to_owned()]));
    let pool = FilterCoversPool::default();
    let kept = minimal_indexes(&cands, false, &SumKeysPreference, &pool);
    assert_eq!(names(&kept), names(&cands));
}

#[test]
fn wider_sarged_prefix_dominates() {
    // ix0 (a), ix1 (a, b)
    let indexes = indexes(&[vec![0], vec![0, 1]]);
    let pred = Expr::and(vec![
        Expr::eq(p("a"), Expr::lit(1i64)),
        Expr::eq(p("b"), Expr::lit(2i64)),
    ]);
    let pool = FilterCoversPool::default();
    let kept = minimal_indexes(&candidates(&indexes, &pred), false, &SumKeysPreference, &pool);
    assert_eq!(names(&kept), BTreeSet::from(["ix1".to_owned()]));
}

#[test]
fn shortest_mode_prefers_fewer_declared_keys_on_a_tie() {
    // Both sarg only `a`; ix1 declares an extra key.
    let indexes = indexes(&[vec![0], vec![0, 2]]);
    let pred = Expr::eq(p("a"), Expr::lit(1i64));
    let pool = FilterCoversPool::default();
    let cands = candidates(&indexes, &pred);
    let shortest = minimal_indexes(&cands, true, &SumKeysPreference, &pool);
    assert_eq!(names(&shortest), BTreeSet::from(["ix0".to_owned()]));
}

#[test]
fn covers_pool_is_returned_after_use() {
    let indexes = indexes(&[vec![0], vec![1], vec![0, 1]]);
    let pred = Expr::and(vec![
        Expr::eq(p("a"), Expr::lit(1i64)),
        Expr::eq(p("b"), Expr::lit(2i64)),
    ]);
    let pool = FilterCoversPool::default();
    let _ = minimal_indexes(&candidates(&indexes, &pred), false, &SumKeysPreference, &pool);
    assert!(pool.available() >= 1);
}

#![allow(missing_docs)]

use std::sync::Arc;

use docql::config::PlannerConfig;
use docql::datastore::memory::{MemoryDatastore, MemoryKeyspace};
use docql::query::expr::Expr;
use docql::query::planner::{sargable_for, SargScope};
use docql::query::{Executor, Planner, PlannerOutput, QueryBuilder, QueryStatus};
use docql::query::value::Value;
use serde_json::json;

fn review_list_key() -> Expr {
    Expr::distinct_array(Expr::ident("r"), "r", Expr::ident("reviewList"))
}

fn store() -> (Arc<MemoryDatastore>, Arc<MemoryKeyspace>) {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    ks.create_index("reviewlistidx", vec![review_list_key()], None);
    ks.insert("p1", json!({"reviewList": ["r1", "r9", "r9"]}));
    ks.insert("p2", json!({"reviewList": ["r2"]}));
    ks.insert("p3", json!({"reviewList": ["r9", "r3"]}));
    ks.insert("p4", json!({"reviewList": []}));
    ks.insert("p5", json!({"name": "no reviews"}));
    (store, ks)
}

fn reviews() -> Expr {
    Expr::path("p", &["reviewList"])
}

fn x_is(value: &str) -> Expr {
    Expr::eq(Expr::ident("x"), Expr::lit(value))
}

fn plan(store: &Arc<MemoryDatastore>, filter: Expr) -> PlannerOutput {
    let query = QueryBuilder::select_from("product", "p")
        .filter(filter)
        .build()
        .expect("query");
    Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan")
}

async fn matching_keys(store: &Arc<MemoryDatastore>, filter: Expr) -> Vec<String> {
    let out = plan(store, filter);
    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("array")).finish().await;
    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.errors);
    let mut keys: Vec<String> = result
        .rows
        .iter()
        .map(|row| row.meta_id().expect("meta").to_owned())
        .collect();
    keys.sort();
    keys
}

#[test]
fn any_over_the_indexed_collection_is_sargable() {
    let keys = vec![review_list_key().formalize("p")];
    let any = Expr::any("x", reviews(), x_is("r9"));
    assert_eq!(sargable_for(&any, &keys, SargScope::new("p")).0, 1);
    let every = Expr::every("x", reviews(), x_is("r9"));
    assert_eq!(sargable_for(&every, &keys, SargScope::new("p")).0, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn any_uses_the_array_index_and_returns_each_document_once() {
    let (store, ks) = store();
    let filter = Expr::any("x", reviews(), x_is("r9"));
    let out = plan(&store, filter.clone());
    let scan = out.explain.root.find("IndexScan").expect("index scan");
    assert_eq!(scan.prop("index"), Some("reviewlistidx"));
    assert_eq!(scan.prop("exact"), Some("false"));
    assert!(out.explain.root.find("Filter").is_some());

    assert_eq!(matching_keys(&store, filter).await, ["p1", "p3"]);
    let request = ks
        .index("reviewlistidx")
        .expect("index")
        .requests()
        .pop()
        .expect("request");
    assert!(request.distinct);
}

#[tokio::test(flavor = "multi_thread")]
async fn any_or_is_covered_by_one_array_scan() {
    let (store, _) = store();
    let filter = Expr::any(
        "x",
        reviews(),
        Expr::or(vec![x_is("r2"), x_is("r3")]),
    );
    assert_eq!(matching_keys(&store, filter).await, ["p2", "p3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn whole_array_equality_falls_back_to_the_primary_index() {
    let (store, _) = store();
    let filter = Expr::eq(reviews(), Expr::lit(Value::Array(vec![Value::from("r2")])));
    let out = plan(&store, filter.clone());
    assert!(out.explain.root.find("PrimaryScan").is_some());
    assert!(out.explain.root.find("IndexScan").is_none());
    assert_eq!(matching_keys(&store, filter).await, ["p2"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_falls_back_and_keeps_empty_arrays() {
    let (store, _) = store();
    let filter = Expr::every("x", reviews(), x_is("r2"));
    let out = plan(&store, filter.clone());
    assert!(out.explain.root.find("PrimaryScan").is_some());
    // EVERY holds vacuously for the empty list.
    assert_eq!(matching_keys(&store, filter).await, ["p2", "p4"]);
}

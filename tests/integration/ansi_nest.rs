#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use docql::config::PlannerConfig;
use docql::datastore::memory::MemoryDatastore;
use docql::query::expr::Expr;
use docql::query::{Executor, Planner, QueryBuilder, QueryResult, QueryStatus};
use serde_json::json;

fn store() -> Arc<MemoryDatastore> {
    let store = MemoryDatastore::new();
    let product = store.create_keyspace("product");
    product.create_primary_index("#primary");
    product.insert("p1", json!({"name": "lamp", "reviewId": "r1"}));
    product.insert("p2", json!({"name": "desk"}));
    product.insert("p3", json!({"name": "chair", "reviewId": "r9"}));

    let review = store.create_keyspace("review");
    review.create_primary_index("#primary");
    review.create_index("ix_pid", vec![Expr::ident("productId")], None);
    review.insert("r1", json!({"productId": "p1", "rating": 5}));
    review.insert("r2", json!({"productId": "p1", "rating": 2}));
    review.insert("r3", json!({"productId": "p3", "rating": 4}));
    store
}

fn join_on() -> Expr {
    Expr::eq(Expr::path("r", &["productId"]), Expr::meta_id("p"))
}

async fn run(store: &Arc<MemoryDatastore>, builder: QueryBuilder) -> QueryResult {
    let query = builder.build().expect("query");
    let out = Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan");
    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("nest")).finish().await;
    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.errors);
    result
}

/// Product key to the sorted review ratings nested under it.
fn nested_ratings(result: &QueryResult) -> BTreeMap<String, Vec<i64>> {
    result
        .rows
        .iter()
        .map(|row| {
            let value = row.value().to_json();
            let mut ratings: Vec<i64> = value["r"]
                .as_array()
                .expect("nested array")
                .iter()
                .map(|r| r["rating"].as_i64().expect("rating"))
                .collect();
            ratings.sort_unstable();
            (row.meta_id().expect("meta").to_owned(), ratings)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn outer_nest_keeps_products_without_reviews() {
    let store = store();
    let result = run(
        &store,
        QueryBuilder::select_from("product", "p").outer_nest("review", "r", join_on()),
    )
    .await;
    let got = nested_ratings(&result);
    assert_eq!(
        got,
        BTreeMap::from([
            ("p1".to_owned(), vec![2, 5]),
            ("p2".to_owned(), vec![]),
            ("p3".to_owned(), vec![4]),
        ])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn inner_nest_drops_products_without_reviews() {
    let store = store();
    let result = run(
        &store,
        QueryBuilder::select_from("product", "p").inner_nest("review", "r", join_on()),
    )
    .await;
    let got = nested_ratings(&result);
    assert_eq!(got.keys().collect::<Vec<_>>(), ["p1", "p3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn extra_on_terms_filter_the_nested_documents() {
    let store = store();
    let on = Expr::and(vec![
        join_on(),
        Expr::gt(Expr::path("r", &["rating"]), Expr::lit(3i64)),
    ]);
    let result = run(
        &store,
        QueryBuilder::select_from("product", "p").outer_nest("review", "r", on),
    )
    .await;
    let got = nested_ratings(&result);
    assert_eq!(got["p1"], vec![5]);
    assert_eq!(got["p2"], Vec::<i64>::new());
    assert_eq!(got["p3"], vec![4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn where_terms_on_the_outer_term_still_apply() {
    let store = store();
    let builder = QueryBuilder::select_from("product", "p")
        .outer_nest("review", "r", join_on())
        .filter(Expr::eq(
            Expr::path("p", &["name"]),
            Expr::lit("lamp"),
        ));
    let result = run(&store, builder).await;
    assert_eq!(nested_ratings(&result).keys().collect::<Vec<_>>(), ["p1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn key_lookup_nest_fetches_by_document_key() {
    let store = store();
    let builder = QueryBuilder::select_from("product", "p").inner_nest(
        "review",
        "r",
        Expr::eq(Expr::meta_id("r"), Expr::path("p", &["reviewId"])),
    );
    let query = builder.build().expect("query");
    let out = Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan");
    assert!(out.explain.root.find("Nest").is_some());
    assert!(out.explain.root.find("AnsiNest").is_none());

    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("key-nest")).finish().await;
    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.errors);
    // p2 has no key and p3 points at a missing review.
    assert_eq!(
        nested_ratings(&result),
        BTreeMap::from([("p1".to_owned(), vec![5])])
    );
}

/// Reviews tagged with a kind, indexed with the given key lists and
/// optional partial-index condition.
fn keyed_store(indexes: &[(&str, Vec<Expr>, Option<Expr>)]) -> Arc<MemoryDatastore> {
    let store = MemoryDatastore::new();
    let product = store.create_keyspace("product");
    product.create_primary_index("#primary");
    product.insert("p1", json!({"reviewId": "r1"}));
    product.insert("p2", json!({"reviewId": "r2"}));

    let review = store.create_keyspace("review");
    review.create_primary_index("#primary");
    for (name, keys, cond) in indexes {
        review.create_index(name, keys.clone(), cond.clone());
    }
    review.insert("r1", json!({"kind": "review", "rating": 5}));
    review.insert("r2", json!({"kind": "draft", "rating": 1}));
    store
}

fn keyed_on() -> Expr {
    Expr::and(vec![
        Expr::eq(Expr::meta_id("r"), Expr::path("p", &["reviewId"])),
        Expr::eq(Expr::path("r", &["kind"]), Expr::lit("review")),
    ])
}

async fn keyed_nest(store: &Arc<MemoryDatastore>) -> (Vec<String>, BTreeMap<String, Vec<i64>>) {
    let query = QueryBuilder::select_from("product", "p")
        .inner_nest("review", "r", keyed_on())
        .build()
        .expect("query");
    let out = Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan");
    let ops = out.explain.root.ops().into_iter().map(str::to_owned).collect();
    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("keyed")).finish().await;
    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.errors);
    (ops, nested_ratings(&result))
}

#[tokio::test(flavor = "multi_thread")]
async fn filtered_index_without_the_document_key_does_not_drive_a_key_nest() {
    let kind = Expr::eq(Expr::ident("kind"), Expr::lit("review"));
    let store = keyed_store(&[("ix_kind", vec![Expr::ident("kind")], Some(kind))]);
    let (ops, got) = keyed_nest(&store).await;
    assert!(ops.iter().any(|op| op == "Nest"), "{ops:?}");
    assert!(!ops.iter().any(|op| op == "AnsiNest"), "{ops:?}");
    assert_eq!(got, BTreeMap::from([("p1".to_owned(), vec![5])]));
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_document_key_index_does_not_drive_a_key_nest() {
    let store = keyed_store(&[("ix_id", vec![Expr::meta_id("")], None)]);
    let (ops, got) = keyed_nest(&store).await;
    assert!(ops.iter().any(|op| op == "Nest"), "{ops:?}");
    assert!(!ops.iter().any(|op| op == "AnsiNest"), "{ops:?}");
    assert_eq!(got, BTreeMap::from([("p1".to_owned(), vec![5])]));
}

#[tokio::test(flavor = "multi_thread")]
async fn document_key_with_a_second_sarged_key_drives_an_ansi_nest() {
    let store = keyed_store(&[(
        "ix_id_kind",
        vec![Expr::meta_id(""), Expr::ident("kind")],
        None,
    )]);
    let (ops, got) = keyed_nest(&store).await;
    assert!(ops.iter().any(|op| op == "AnsiNest"), "{ops:?}");
    assert_eq!(got, BTreeMap::from([("p1".to_owned(), vec![5])]));
}

#![allow(missing_docs)]

use std::sync::Arc;

use docql::config::PlannerConfig;
use docql::datastore::memory::{MemoryDatastore, MemoryKeyspace};
use docql::datastore::IndexState;
use docql::query::aggregate::AggFunc;
use docql::query::errors::PlanError;
use docql::query::expr::Expr;
use docql::query::{Executor, Planner, PlannerOutput, QueryBuilder, QueryStatus};
use docql::QueryError;

fn p(field: &str) -> Expr {
    Expr::path("p", &[field])
}

fn product(indexes: &[(&str, &[&str])]) -> (Arc<MemoryDatastore>, Arc<MemoryKeyspace>) {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    for (name, keys) in indexes {
        ks.create_index(name, keys.iter().map(|k| Expr::ident(*k)).collect(), None);
    }
    for i in 0..20i64 {
        ks.insert(
            format!("p{i:02}"),
            serde_json::json!({"a": i % 4, "b": i % 5, "c": i}),
        );
    }
    (store, ks)
}

fn plan(store: &Arc<MemoryDatastore>, builder: QueryBuilder) -> PlannerOutput {
    plan_with(store, PlannerConfig::default(), builder).expect("plan")
}

fn plan_with(
    store: &Arc<MemoryDatastore>,
    config: PlannerConfig,
    builder: QueryBuilder,
) -> Result<PlannerOutput, QueryError> {
    let query = builder.build().expect("query");
    Planner::new(config, store.clone()).plan(&query)
}

fn plan_error(store: &Arc<MemoryDatastore>, builder: QueryBuilder) -> PlanError {
    match plan_with(store, PlannerConfig::default(), builder) {
        Err(QueryError::Plan(err)) => err,
        other => panic!("expected a plan error, got {other:?}"),
    }
}

fn ops(out: &PlannerOutput) -> Vec<String> {
    out.explain.root.ops().into_iter().map(str::to_owned).collect()
}

fn has(out: &PlannerOutput, op: &str) -> bool {
    out.explain.root.find(op).is_some()
}

#[test]
fn covering_index_skips_fetch_and_rewrites_the_filter() {
    let (store, _) = product(&[("ix_ab", &["a", "b"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::eq(p("a"), Expr::lit(1i64)))
            .project(p("b"), "b"),
    );
    assert!(has(&out, "IndexScan(covering)"), "{:?}", ops(&out));
    assert!(!has(&out, "Fetch"));
    let filter = out.explain.root.find("Filter").expect("filter");
    assert!(filter.prop("condition").is_some_and(|c| c.contains("cover(p.a)")));
}

#[test]
fn disjoint_indexes_intersect() {
    let (store, _) = product(&[("ix_a", &["a"]), ("ix_b", &["b"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::eq(p("a"), Expr::lit(1i64)))
            .filter(Expr::eq(p("b"), Expr::lit(2i64))),
    );
    let intersect = out.explain.root.find("IntersectScan").expect("intersect");
    assert_eq!(intersect.prop("branches"), Some("2"));
    assert!(has(&out, "Fetch"));
}

#[test]
fn order_index_leads_an_ordered_intersect_and_serialises_the_pipeline() {
    let (store, _) = product(&[("ix_a", &["a"]), ("ix_b", &["b"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::ge(p("a"), Expr::lit(1i64)))
            .filter(Expr::eq(p("b"), Expr::lit(2i64)))
            .order_by(p("a"), false),
    );
    let ordered = out
        .explain
        .root
        .find("OrderedIntersectScan")
        .expect("ordered intersect");
    assert_eq!(ordered.inputs[0].prop("index"), Some("ix_a"));
    assert!(!has(&out, "Order"));
    let parallel = out.explain.root.find("Parallel").expect("parallel");
    assert_eq!(parallel.prop("max_parallelism"), Some("1"));
}

#[test]
fn exact_single_scan_absorbs_order_and_limit() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::gt(p("a"), Expr::lit(0i64)))
            .order_by(p("a"), false)
            .limit(3),
    );
    let scan = out.explain.root.find("IndexScan").expect("scan");
    assert_eq!(scan.prop("limit"), Some("3"));
    assert!(scan.prop("push_down").is_some_and(|p| p.contains("order")));
    assert!(!has(&out, "Order"));
    assert!(has(&out, "Limit"));
}

#[test]
fn descending_order_is_not_pushed() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::gt(p("a"), Expr::lit(0i64)))
            .order_by(p("a"), true),
    );
    assert!(has(&out, "Order"));
    assert_eq!(
        out.explain.root.find("Parallel").and_then(|n| n.prop("max_parallelism")),
        Some(PlannerConfig::default().max_parallelism.to_string().as_str())
    );
}

#[test]
fn count_star_without_where_uses_the_keyspace_count() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .aggregate(AggFunc::Count, None, "n")
            .project(Expr::Aggregate("n".into()), "n"),
    );
    assert_eq!(ops(&out)[..2], ["Sequence", "CountScan"]);
    assert!(!has(&out, "Group"));
}

#[test]
fn grouping_on_a_covering_prefix_is_pushed_into_the_scan() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::ge(p("a"), Expr::lit(0i64)))
            .group_by(vec![p("a")])
            .aggregate(AggFunc::Count, None, "n")
            .project(p("a"), "a")
            .project(Expr::Aggregate("n".into()), "n"),
    );
    let scan = out.explain.root.find("IndexScan(covering)").expect("covering");
    assert_eq!(scan.prop("group"), Some("p.a"));
    assert!(!has(&out, "Group"));
    assert!(!has(&out, "Filter"));
}

#[test]
fn disjunction_across_indexes_becomes_a_union() {
    let (store, _) = product(&[("ix_a", &["a"]), ("ix_b", &["b"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::or(vec![
            Expr::eq(p("a"), Expr::lit(1i64)),
            Expr::eq(p("b"), Expr::lit(2i64)),
        ])),
    );
    let union = out.explain.root.find("UnionScan").expect("union");
    assert_eq!(union.prop("branches"), Some("2"));
}

#[test]
fn unindexed_predicate_falls_back_to_the_primary_index() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::eq(p("c"), Expr::lit(3i64))),
    );
    assert_eq!(ops(&out)[..3], ["Sequence", "PrimaryScan", "Fetch"]);
    assert!(has(&out, "Filter"));
}

#[test]
fn missing_primary_index_is_reported() {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_index("ix_a", vec![Expr::ident("a")], None);
    let err = plan_error(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::eq(p("c"), Expr::lit(3i64))),
    );
    assert_eq!(
        err.to_string(),
        "No primary index on keyspace product. Use CREATE PRIMARY INDEX to create one."
    );
    assert_eq!(err.code(), 4000);
}

#[test]
fn offline_primary_index_is_reported() {
    let (store, ks) = product(&[]);
    ks.index("#primary").expect("primary").set_state(IndexState::Offline);
    let err = plan_error(&store, QueryBuilder::select_from("product", "p"));
    assert_eq!(err.to_string(), "Primary index #primary not online.");
}

#[test]
fn offline_secondary_index_is_ignored() {
    let (store, ks) = product(&[("ix_a", &["a"])]);
    ks.index("ix_a").expect("ix_a").set_state(IndexState::Building);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::eq(p("a"), Expr::lit(1i64))),
    );
    assert!(has(&out, "PrimaryScan"));
}

#[test]
fn too_many_intersect_branches_fail_planning() {
    let (store, _) = product(&[("ix_a", &["a"]), ("ix_b", &["b"]), ("ix_c", &["c"])]);
    let config = PlannerConfig {
        max_intersect_scans: 2,
        ..PlannerConfig::default()
    };
    let err = plan_with(
        &store,
        config,
        QueryBuilder::select_from("product", "p")
            .filter(Expr::eq(p("a"), Expr::lit(1i64)))
            .filter(Expr::eq(p("b"), Expr::lit(1i64)))
            .filter(Expr::eq(p("c"), Expr::lit(1i64))),
    )
    .expect_err("too many branches");
    assert_eq!(err.code(), 4070);
}

#[test]
fn intersect_limit_is_capped_at_the_branch_mask_width() {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    let fields: Vec<String> = (0..70).map(|i| format!("f{i:02}")).collect();
    for f in &fields {
        ks.create_index(&format!("ix_{f}"), vec![Expr::ident(f.as_str())], None);
    }
    let config = PlannerConfig {
        max_intersect_scans: 500,
        ..PlannerConfig::default()
    };
    assert_eq!(config.intersect_limit(), 64);
    let filter = Expr::and(
        fields
            .iter()
            .map(|f| Expr::eq(p(f), Expr::lit(1i64)))
            .collect(),
    );
    let err = match plan_with(
        &store,
        config,
        QueryBuilder::select_from("product", "p").filter(filter),
    ) {
        Err(QueryError::Plan(err)) => err,
        other => panic!("expected a plan error, got {other:?}"),
    };
    assert!(
        matches!(err, PlanError::TooManyIntersectScans { count: 70, max: 64 }),
        "{err:?}"
    );
}

#[test]
fn unknown_keyspace_is_reported() {
    let (store, _) = product(&[]);
    let err = plan_error(&store, QueryBuilder::select_from("nope", "n"));
    assert!(matches!(err, PlanError::UnknownKeyspace { .. }));
}

#[test]
fn nest_without_a_usable_index_fails() {
    let (store, _) = product(&[]);
    let review = store.create_keyspace("review");
    review.create_primary_index("#primary");
    let err = plan_error(
        &store,
        QueryBuilder::select_from("product", "p").outer_nest(
            "review",
            "r",
            Expr::eq(Expr::path("r", &["productId"]), Expr::meta_id("p")),
        ),
    );
    assert_eq!(err.to_string(), "No index available for ANSI NEST term r");
}

#[test]
fn nest_on_the_nested_primary_key_uses_key_lookup() {
    let (store, _) = product(&[]);
    let review = store.create_keyspace("review");
    review.create_primary_index("#primary");
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").inner_nest(
            "review",
            "r",
            Expr::eq(Expr::meta_id("r"), p("reviewIds")),
        ),
    );
    assert!(has(&out, "Nest"));
    assert!(!has(&out, "AnsiNest"));
}

#[test]
fn nest_with_a_join_index_plans_an_ansi_nest() {
    let (store, _) = product(&[]);
    let review = store.create_keyspace("review");
    review.create_primary_index("#primary");
    review.create_index("ix_pid", vec![Expr::ident("productId")], None);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").outer_nest(
            "review",
            "r",
            Expr::eq(Expr::path("r", &["productId"]), Expr::meta_id("p")),
        ),
    );
    let nest = out.explain.root.find("AnsiNest").expect("ansi nest");
    assert_eq!(nest.prop("outer"), Some("true"));
    assert_eq!(nest.ops()[..4], ["AnsiNest", "Sequence", "IndexScan", "Fetch"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn constant_false_where_plans_a_dummy_scan_and_returns_nothing() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let out = plan(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::lit(false)),
    );
    assert!(has(&out, "DummyScan"));
    assert!(!has(&out, "Fetch"));
    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("false")).finish().await;
    assert_eq!(result.status, QueryStatus::Success);
    assert!(result.rows.is_empty());
}

#[test]
fn plan_hash_is_stable_and_explain_serialises() {
    let (store, _) = product(&[("ix_a", &["a"])]);
    let build = || {
        QueryBuilder::select_from("product", "p").filter(Expr::eq(p("a"), Expr::lit(1i64)))
    };
    let first = plan(&store, build());
    let second = plan(&store, build());
    assert_eq!(first.plan_hash, second.plan_hash);

    let other = plan(
        &store,
        QueryBuilder::select_from("product", "p").filter(Expr::eq(p("a"), Expr::lit(2i64))),
    );
    assert_ne!(first.plan_hash, other.plan_hash);

    let json = serde_json::to_value(&first.explain).expect("explain json");
    assert_eq!(json["root"]["op"], "Sequence");
    assert_eq!(json["plan_hash"], first.plan_hash);
}

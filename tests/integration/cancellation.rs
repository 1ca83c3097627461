#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use docql::config::{ExecConfig, PlannerConfig};
use docql::datastore::memory::{MemoryDatastore, MemoryKeyspace};
use docql::query::expr::Expr;
use docql::query::{Executor, Planner, PlannerOutput, QueryBuilder, QueryStatus};
use docql::QueryError;

const DOCS: i64 = 2000;

fn slow_store() -> (Arc<MemoryDatastore>, Arc<MemoryKeyspace>) {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    let index = ks.create_index("ix_a", vec![Expr::ident("a")], None);
    index.set_entry_delay(Some(Duration::from_millis(1)));
    for i in 0..DOCS {
        ks.insert(format!("d{i:04}"), serde_json::json!({"a": i, "b": i % 3}));
    }
    (store, ks)
}

fn plan(store: &Arc<MemoryDatastore>) -> PlannerOutput {
    let query = QueryBuilder::select_from("product", "p")
        .filter(Expr::and(vec![
            Expr::ge(Expr::path("p", &["a"]), Expr::lit(0i64)),
            Expr::eq(Expr::path("p", &["b"]), Expr::lit(1i64)),
        ]))
        .build()
        .expect("query");
    Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan")
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_ends_a_running_request_promptly() {
    let (store, _ks) = slow_store();
    let out = plan(&store);
    assert!(out.explain.root.find("IndexScan").is_some());
    assert!(out.explain.root.find("Filter").is_some());

    let exec = Executor::default();
    let mut stream = exec.execute(&out.plan, exec.context("cancel"));
    for _ in 0..3 {
        let row = stream.next().await.expect("row before stop");
        assert_eq!(row.value().to_json()["p"]["b"], 1);
    }
    stream.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), stream.finish())
        .await
        .expect("request stops well before the scan would end");
    assert_eq!(result.status, QueryStatus::Cancelled);
    assert!(result.errors.contains(&QueryError::Cancelled));
    assert!((result.rows.len() as i64) < DOCS / 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_deadline_reports_timeout() {
    let (store, _ks) = slow_store();
    let out = plan(&store);
    let exec = Executor::new(ExecConfig {
        request_timeout: Some(Duration::from_millis(50)),
        ..ExecConfig::default()
    });
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        exec.execute(&out.plan, exec.context("deadline")).finish(),
    )
    .await
    .expect("deadline stops the request");
    assert_eq!(result.status, QueryStatus::Timeout);
    assert!((result.rows.len() as i64) < DOCS / 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_stream_releases_the_scan() {
    let (store, ks) = slow_store();
    let out = plan(&store);
    let exec = Executor::default();
    let mut stream = exec.execute(&out.plan, exec.context("drop"));
    let _ = stream.next().await;
    drop(stream);

    // A fresh request still completes with the delay removed.
    let index = ks.index("ix_a").expect("ix_a");
    index.set_entry_delay(None);
    let result = exec
        .execute(&out.plan, exec.context("after-drop"))
        .finish()
        .await;
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(result.rows.len() as i64, (0..DOCS).filter(|i| i % 3 == 1).count() as i64);
}

//! Row operators and the composition nodes (`Sequence`, `Parallel`).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::context::Context;
use super::operator::{join_all, spawn, Links, Operator, Port};
use crate::datastore::Keyspace;
use crate::query::aggregate::Accumulator;
use crate::query::ast::{OrderTerm, ResultTerm};
use crate::query::expr::Expr;
use crate::query::physical::{AnsiNestNode, FetchNode, GroupNode, KeyNestNode, PlanNode};
use crate::query::profile::Phase;
use crate::query::value::{AnnotatedValue, Value};
use crate::types::QueryError;

/// Fetches documents on a blocking thread. Per-key failures are recorded on
/// the context; the documents that could be read are returned.
async fn fetch_docs(ctx: &Context, keyspace: &Arc<dyn Keyspace>, keys: Vec<String>) -> Option<FxHashMap<String, Value>> {
    let keyspace = keyspace.clone();
    let (docs, errors) = match tokio::task::spawn_blocking(move || keyspace.fetch(&keys)).await {
        Ok(result) => result,
        Err(err) => {
            ctx.fatal(QueryError::internal(format!("fetch task failed: {err}")));
            return None;
        }
    };
    for err in errors {
        ctx.report(err);
    }
    Some(docs.into_iter().collect())
}

pub(crate) async fn fetch(ctx: &Arc<Context>, node: &FetchNode, port: Port) {
    let batch_size = ctx.config().pipeline_batch;
    let alias = node.term.alias.as_str();
    while let Some(first) = port.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match port.try_recv() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        let start = Instant::now();
        let mut keys = Vec::with_capacity(batch.len());
        for item in &batch {
            match item.meta_id() {
                Some(id) => keys.push(id.to_owned()),
                None => {
                    return ctx.fatal(QueryError::internal(format!(
                        "fetch on {alias}: item without document key"
                    )))
                }
            }
        }
        let Some(mut docs) = fetch_docs(ctx, &node.term.keyspace, keys).await else {
            return;
        };
        ctx.phases().add_count(Phase::Fetch, docs.len() as u64);
        ctx.phases().record(Phase::Fetch, start);
        for mut item in batch {
            let Some(doc) = item.meta_id().and_then(|id| docs.remove(id)) else {
                // Deleted between scan and fetch.
                continue;
            };
            item.set_field(alias, doc);
            if !port.send(item).await {
                return;
            }
        }
    }
}

pub(crate) async fn filter(ctx: &Arc<Context>, cond: &Expr, port: Port) {
    while let Some(item) = port.recv().await {
        let start = Instant::now();
        let keep = match cond.test(&item) {
            Ok(keep) => keep,
            Err(err) => return ctx.fatal(err),
        };
        ctx.phases().add_count(Phase::Filter, 1);
        ctx.phases().record(Phase::Filter, start);
        if keep && !port.send(item).await {
            return;
        }
    }
}

/// Left row with the nested matches attached, or `None` for an unmatched
/// inner nest.
fn nested_row(parent: Arc<AnnotatedValue>, alias: &str, matches: Vec<Value>, outer: bool) -> Option<AnnotatedValue> {
    if matches.is_empty() && !outer {
        return None;
    }
    let mut row = Arc::try_unwrap(parent).unwrap_or_else(|shared| (*shared).clone());
    row.set_field(alias, Value::Array(matches));
    Some(row)
}

pub(crate) async fn ansi_nest(ctx: &Arc<Context>, node: &AnsiNestNode, port: Port) {
    let alias = node.alias.as_str();
    while let Some(left) = port.recv().await {
        let start = Instant::now();
        let parent = Arc::new(left);
        let (tx, rx) = async_channel::bounded(ctx.config().pipeline_cap);
        let child_stop = port.stop.child_token();
        let handle = spawn(
            Operator::new(node.child.clone()),
            ctx.clone(),
            Links {
                input: None,
                output: tx,
                stop: child_stop.clone(),
                parent: Some(parent.clone()),
            },
        );

        let mut matches = Vec::new();
        let mut failed = false;
        loop {
            let right = tokio::select! {
                biased;
                _ = port.stop.cancelled() => None,
                right = rx.recv() => right.ok(),
            };
            let Some(right) = right else {
                break;
            };
            match node.on.test(&right) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    ctx.fatal(err);
                    failed = true;
                    break;
                }
            }
            match right.value().get_field(alias) {
                Some(doc) => matches.push(doc.clone()),
                None => {
                    ctx.fatal(QueryError::internal(format!(
                        "annotated value not found for alias {alias}"
                    )));
                    failed = true;
                    break;
                }
            }
        }
        child_stop.cancel();
        drop(rx);
        join_all(ctx, vec![handle]).await;
        ctx.phases().add_count(Phase::Nest, 1);
        ctx.phases().record(Phase::Nest, start);
        if failed || port.stopped() {
            return;
        }
        if let Some(row) = nested_row(parent, alias, matches, node.outer) {
            if !port.send(row).await {
                return;
            }
        }
    }
}

fn lookup_keys(value: Value) -> Vec<String> {
    match value {
        Value::String(key) => vec![key],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(key) => Some(key),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) async fn key_nest(ctx: &Arc<Context>, node: &KeyNestNode, port: Port) {
    let alias = node.term.alias.as_str();
    while let Some(left) = port.recv().await {
        let start = Instant::now();
        let keys = match node.keys.evaluate(&left) {
            Ok(v) => lookup_keys(v),
            Err(err) => return ctx.fatal(err),
        };
        let parent = Arc::new(left);
        let mut matches = Vec::new();
        if !keys.is_empty() {
            let Some(mut docs) = fetch_docs(ctx, &node.term.keyspace, keys.clone()).await else {
                return;
            };
            for key in keys {
                let Some(doc) = docs.remove(&key) else {
                    continue;
                };
                let mut right = AnnotatedValue::scoped(Some(parent.clone()));
                right.set_field(alias, doc.clone());
                right.set_meta(alias, key);
                match node.on.test(&right) {
                    Ok(true) => matches.push(doc),
                    Ok(false) => {}
                    Err(err) => return ctx.fatal(err),
                }
            }
        }
        ctx.phases().add_count(Phase::Nest, 1);
        ctx.phases().record(Phase::Nest, start);
        if let Some(row) = nested_row(parent, alias, matches, node.outer) {
            if !port.send(row).await {
                return;
            }
        }
    }
}

struct GroupState {
    first: AnnotatedValue,
    accumulators: Vec<Accumulator>,
}

pub(crate) async fn group(ctx: &Arc<Context>, node: &GroupNode, port: Port) {
    let mut groups: BTreeMap<Vec<Value>, GroupState> = BTreeMap::new();
    let mut processed: u64 = 0;
    while let Some(item) = port.recv().await {
        let start = Instant::now();
        let mut key = Vec::with_capacity(node.keys.len());
        for expr in &node.keys {
            match expr.evaluate(&item) {
                Ok(v) => key.push(v),
                Err(err) => return ctx.fatal(err),
            }
        }
        let mut inputs = Vec::with_capacity(node.aggregates.len());
        for agg in &node.aggregates {
            match &agg.operand {
                Some(expr) => match expr.evaluate(&item) {
                    Ok(v) => inputs.push(Some(v)),
                    Err(err) => return ctx.fatal(err),
                },
                None => inputs.push(None),
            }
        }
        let state = groups.entry(key).or_insert_with(|| GroupState {
            first: item,
            accumulators: node
                .aggregates
                .iter()
                .map(|a| Accumulator::new(a.func))
                .collect(),
        });
        for (acc, input) in state.accumulators.iter_mut().zip(&inputs) {
            acc.add(input.as_ref());
        }
        processed += 1;
        ctx.phases().record(Phase::Group, start);
    }
    ctx.phases().add_count(Phase::Group, processed);
    if port.stopped() {
        return;
    }
    if groups.is_empty() && node.keys.is_empty() {
        groups.insert(
            Vec::new(),
            GroupState {
                first: port.scope(),
                accumulators: node
                    .aggregates
                    .iter()
                    .map(|a| Accumulator::new(a.func))
                    .collect(),
            },
        );
    }
    for (key, state) in groups {
        let mut row = state.first;
        for (expr, value) in node.keys.iter().zip(key) {
            let text = match expr {
                Expr::Cover(text, _) => text.clone(),
                other => other.to_string(),
            };
            row.set_cover(text, value);
        }
        for (agg, acc) in node.aggregates.iter().zip(&state.accumulators) {
            row.set_aggregate(agg.alias.clone(), acc.finish());
        }
        if !port.send(row).await {
            return;
        }
    }
}

fn compare_keys(a: &[Value], b: &[Value], terms: &[OrderTerm]) -> Ordering {
    for ((x, y), term) in a.iter().zip(b).zip(terms) {
        let ord = x.collate(y);
        let ord = if term.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub(crate) async fn order(ctx: &Arc<Context>, terms: &[OrderTerm], port: Port) {
    let mut rows: Vec<(Vec<Value>, AnnotatedValue)> = Vec::new();
    while let Some(item) = port.recv().await {
        let mut key = Vec::with_capacity(terms.len());
        for term in terms {
            match term.expr.evaluate(&item) {
                Ok(v) => key.push(v),
                Err(err) => return ctx.fatal(err),
            }
        }
        rows.push((key, item));
    }
    if port.stopped() {
        return;
    }
    let start = Instant::now();
    rows.sort_by(|a, b| compare_keys(&a.0, &b.0, terms));
    ctx.phases().add_count(Phase::Sort, rows.len() as u64);
    ctx.phases().record(Phase::Sort, start);
    for (_, row) in rows {
        if !port.send(row).await {
            return;
        }
    }
}

pub(crate) async fn offset(offset: u64, port: Port) {
    let mut skipped = 0;
    while let Some(item) = port.recv().await {
        if skipped < offset {
            skipped += 1;
            continue;
        }
        if !port.send(item).await {
            return;
        }
    }
}

pub(crate) async fn limit(limit: u64, port: Port) {
    let mut passed = 0;
    while passed < limit {
        let Some(item) = port.recv().await else {
            return;
        };
        if !port.send(item).await {
            return;
        }
        passed += 1;
    }
    debug!(limit, "executor.limit.reached");
}

pub(crate) async fn project(ctx: &Arc<Context>, terms: &[ResultTerm], port: Port) {
    while let Some(item) = port.recv().await {
        let start = Instant::now();
        let mut out = Value::empty_object();
        for term in terms {
            match term.expr.evaluate(&item) {
                Ok(v) if v.is_missing() => {}
                Ok(v) => out.set_field(term.alias.clone(), v),
                Err(err) => return ctx.fatal(err),
            }
        }
        let mut row = AnnotatedValue::new(out);
        if let Some(meta) = item.meta() {
            row.set_meta(meta.alias.clone(), meta.id.clone());
        }
        ctx.phases().add_count(Phase::Project, 1);
        ctx.phases().record(Phase::Project, start);
        if !port.send(row).await {
            return;
        }
    }
}

/// Chains children with bounded channels; every child runs as its own task
/// under a child stop token.
pub(crate) async fn sequence(ctx: &Arc<Context>, children: &[Arc<PlanNode>], port: Port) {
    let Links {
        input,
        output,
        stop,
        parent,
    } = port.into_links();
    let mut upstream = input;
    let mut handles = Vec::with_capacity(children.len());
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let (tx, next) = if last {
            (output.clone(), None)
        } else {
            let (tx, rx) = async_channel::bounded(ctx.config().pipeline_cap);
            (tx, Some(rx))
        };
        let links = Links {
            input: upstream.take(),
            output: tx,
            stop: stop.child_token(),
            parent: parent.clone(),
        };
        handles.push(spawn(Operator::new(child.clone()), ctx.clone(), links));
        upstream = next;
    }
    drop(output);
    join_all(ctx, handles).await;
}

/// Runs `replicas` copies of `child` over a shared input. Without an input
/// the child is a producer and runs once.
pub(crate) async fn parallel(ctx: &Arc<Context>, child: &Arc<PlanNode>, replicas: usize, port: Port) {
    let Links {
        input,
        output,
        stop,
        parent,
    } = port.into_links();
    let replicas = if input.is_some() { replicas.max(1) } else { 1 };
    let template = Operator::new(child.clone());
    let mut handles = Vec::with_capacity(replicas);
    for _ in 0..replicas {
        let links = Links {
            input: input.clone(),
            output: output.clone(),
            stop: stop.child_token(),
            parent: parent.clone(),
        };
        handles.push(spawn(template.copy(), ctx.clone(), links));
    }
    drop(input);
    drop(output);
    join_all(ctx, handles).await;
}

//! Leaf operators: index, primary, count and dummy scans plus the
//! intersect/union combinators over child scans.

use std::sync::Arc;
use std::time::Instant;

use async_channel::Receiver;
use futures::stream::{self, StreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::context::Context;
use super::operator::{join_all, spawn, Links, Operator, Port};
use crate::config::MAX_INTERSECT_SCANS;
use crate::datastore::{
    Index, IndexConnection, IndexProjection, Keyspace, PrimaryIndex, ScanEntry, ScanRequest,
};
use crate::query::physical::{IndexScanNode, MultiScan, PrimaryScanNode, ScanTerm};
use crate::query::profile::Phase;
use crate::query::value::{AnnotatedValue, Value};
use crate::types::QueryError;

pub(crate) async fn dummy_scan(port: Port) {
    let item = port.scope();
    port.send(item).await;
}

pub(crate) async fn count_scan(ctx: &Arc<Context>, term: &ScanTerm, aggregates: &[String], port: Port) {
    let start = Instant::now();
    let keyspace = term.keyspace.clone();
    let count = match tokio::task::spawn_blocking(move || keyspace.count()).await {
        Ok(Ok(n)) => n,
        Ok(Err(err)) => return ctx.fatal(err),
        Err(err) => return ctx.fatal(QueryError::internal(format!("count task failed: {err}"))),
    };
    ctx.phases().add_count(Phase::Count, 1);
    ctx.phases().record(Phase::Count, start);
    let mut item = port.scope();
    for alias in aggregates {
        item.set_aggregate(alias.clone(), Value::from(count));
    }
    port.send(item).await;
}

/// Scan capability a driver runs on a blocking thread.
#[derive(Clone)]
enum ScanTarget {
    Secondary(Arc<dyn Index>),
    Primary(Arc<dyn PrimaryIndex>),
}

impl ScanTarget {
    fn name(&self) -> &str {
        match self {
            ScanTarget::Secondary(index) => index.name(),
            ScanTarget::Primary(index) => index.name(),
        }
    }

    fn run(&self, request: &ScanRequest, conn: &IndexConnection) {
        match self {
            ScanTarget::Secondary(index) => index.scan(request, conn),
            ScanTarget::Primary(index) => index.scan_entries(request, conn),
        }
    }
}

/// Runs one index scan, restarting it in chunks when the index reports a
/// timeout and the query shape allows it.
struct ScanDriver<'a> {
    ctx: &'a Arc<Context>,
    keyspace: &'a Arc<dyn Keyspace>,
    target: ScanTarget,
    phase: Phase,
    chunkable: bool,
    distinct: bool,
}

enum ChunkEnd {
    Exhausted,
    TimedOut,
    Halted,
}

impl ScanDriver<'_> {
    fn connection(&self, stop: CancellationToken) -> (IndexConnection, Receiver<ScanEntry>) {
        let cap = self.ctx.config().pipeline_cap;
        match self.keyspace.count() {
            Ok(expected) => IndexConnection::sized(expected, cap, stop),
            Err(err) => {
                error!(
                    keyspace = self.keyspace.name(),
                    error = %err,
                    "executor.scan.count_failed"
                );
                IndexConnection::new(cap, stop)
            }
        }
    }

    /// Scans `request`, turning entries into items with `make_item`.
    /// Returns false when the pipeline should stop.
    async fn run(
        &self,
        mut request: ScanRequest,
        port: &Port,
        make_item: &(dyn Fn(&ScanEntry) -> AnnotatedValue + Send + Sync),
    ) -> bool {
        let user_limit = request.limit;
        let flush_every = self.ctx.config().phase_update_count;
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut emitted: u64 = 0;
        let mut chunk_limit: Option<u64> = None;
        let mut last: Option<ScanEntry> = None;
        let mut pending: u64 = 0;
        let mut chunk = 0usize;
        let start = Instant::now();

        let keep_going = loop {
            chunk += 1;
            let scan_stop = port.stop.child_token();
            let (conn, rx) = self.connection(scan_stop.clone());
            let conn = Arc::new(conn);
            let producer = {
                let conn = conn.clone();
                let target = self.target.clone();
                let request = request.clone();
                tokio::task::spawn_blocking(move || {
                    target.run(&request, &conn);
                    conn.close();
                })
            };

            let mut received: u64 = 0;
            let halted;
            loop {
                let entry = tokio::select! {
                    biased;
                    _ = port.stop.cancelled() => None,
                    entry = rx.recv() => entry.ok(),
                };
                let Some(entry) = entry else {
                    halted = port.stopped();
                    break;
                };
                received += 1;
                pending += 1;
                if pending >= flush_every {
                    self.ctx.phases().add_count(self.phase, pending);
                    pending = 0;
                }
                let fresh = !self.distinct || seen.insert(entry.primary_key.clone());
                let item = fresh.then(|| make_item(&entry));
                last = Some(entry);
                if let Some(item) = item {
                    if !port.send(item).await {
                        halted = true;
                        break;
                    }
                    emitted += 1;
                }
            }
            if halted {
                scan_stop.cancel();
            }
            drop(rx);
            if let Err(err) = producer.await {
                self.ctx
                    .fatal(QueryError::internal(format!("scan task failed: {err}")));
                break false;
            }
            if let Some(err) = conn.take_error() {
                self.ctx.fatal(err);
                break false;
            }

            let end = if halted {
                ChunkEnd::Halted
            } else if conn.timed_out() {
                ChunkEnd::TimedOut
            } else {
                ChunkEnd::Exhausted
            };
            match end {
                ChunkEnd::Halted => break false,
                ChunkEnd::TimedOut => {
                    if !self.chunkable || received == 0 {
                        self.ctx.fatal(QueryError::ScanTimeout {
                            index: self.target.name().to_owned(),
                        });
                        break false;
                    }
                    warn!(
                        index = self.target.name(),
                        chunk,
                        received,
                        "executor.scan.chunked_restart"
                    );
                    if chunk_limit.is_none() {
                        self.ctx.add_warning(format!(
                            "scan of index {} timed out; resumed in chunks of {received}",
                            self.target.name()
                        ));
                    }
                    chunk_limit = Some(received);
                }
                ChunkEnd::Exhausted => {
                    // A chunk cut by its own limit may have more behind it.
                    if chunk_limit.map_or(true, |l| received < l) {
                        break true;
                    }
                }
            }

            let remaining = user_limit.map(|l| l.saturating_sub(emitted));
            if remaining == Some(0) {
                break true;
            }
            request.start_after = last.clone();
            request.limit = match (chunk_limit, remaining) {
                (Some(c), Some(r)) => Some(c.min(r)),
                (c, r) => c.or(r),
            };
            debug!(
                index = self.target.name(),
                chunk,
                received,
                next_limit = ?request.limit,
                "executor.scan.chunk"
            );
        };

        self.ctx.phases().add_count(self.phase, pending);
        self.ctx.phases().record(self.phase, start);
        keep_going
    }
}

fn base_request(ctx: &Context, keyspace: &str) -> ScanRequest {
    ScanRequest {
        request_id: ctx.request_id().to_string(),
        consistency: ctx.consistency(),
        vector: ctx.scan_vector(keyspace),
        ..ScanRequest::default()
    }
}

pub(crate) async fn primary_scan(ctx: &Arc<Context>, node: &PrimaryScanNode, port: Port) {
    let mut request = base_request(ctx, node.term.keyspace.name());
    request.limit = node.limit;
    request.offset = node.offset;
    let driver = ScanDriver {
        ctx,
        keyspace: &node.term.keyspace,
        target: ScanTarget::Primary(node.index.clone()),
        phase: Phase::PrimaryScan,
        chunkable: node.chunkable,
        distinct: false,
    };
    let alias = node.term.alias.as_str();
    let parent = port.parent.clone();
    let make_item = move |entry: &ScanEntry| {
        let mut item = AnnotatedValue::scoped(parent.clone());
        item.set_meta(alias, entry.primary_key.clone());
        item
    };
    driver.run(request, &port, &make_item).await;
}

pub(crate) async fn index_scan(ctx: &Arc<Context>, node: &IndexScanNode, port: Port) {
    let outer = port.scope();
    let spans = match node.spans.evaluate(&outer) {
        Ok(spans) => spans,
        Err(err) => return ctx.fatal(err),
    };
    if !node.spans.spans.is_empty() && spans.is_empty() {
        debug!(index = node.index.name(), "executor.scan.empty_spans");
        return;
    }
    let mut request = base_request(ctx, node.term.keyspace.name());
    request.spans = spans;
    request.distinct = node.distinct;
    request.limit = node.limit;
    request.offset = node.offset;
    if let Some(cover) = &node.cover {
        request.projection = Some(IndexProjection {
            entry_keys: (0..cover.keys.len()).collect(),
            primary_key: true,
        });
    }
    request.group_aggs = node.group.as_ref().map(|g| g.aggs.clone());

    let driver = ScanDriver {
        ctx,
        keyspace: &node.term.keyspace,
        target: ScanTarget::Secondary(node.index.clone()),
        phase: Phase::IndexScan,
        chunkable: node.chunkable,
        distinct: node.distinct && node.group.is_none(),
    };
    let parent = port.parent.clone();
    let make_item = move |entry: &ScanEntry| scan_item(node, entry, parent.clone());
    driver.run(request, &port, &make_item).await;
}

fn key_at(entry: &ScanEntry, pos: usize) -> Value {
    entry.entry_key.get(pos).cloned().unwrap_or(Value::Missing)
}

/// Item for one index entry: covered values for covering scans, group keys
/// and aggregates for grouped scans, otherwise only the document key.
fn scan_item(node: &IndexScanNode, entry: &ScanEntry, parent: Option<Arc<AnnotatedValue>>) -> AnnotatedValue {
    let mut item = AnnotatedValue::scoped(parent);
    if let Some(group) = &node.group {
        let width = group.group_keys.len();
        for (pos, text) in group.group_keys.iter().enumerate() {
            item.set_cover(text.clone(), key_at(entry, pos));
        }
        for (i, alias) in group.aggregate_aliases.iter().enumerate() {
            item.set_aggregate(alias.clone(), key_at(entry, width + i));
        }
        return item;
    }
    item.set_meta(node.term.alias.clone(), entry.primary_key.clone());
    if let Some(cover) = &node.cover {
        for (pos, text) in cover.keys.iter().enumerate() {
            item.set_cover(text.clone(), key_at(entry, pos));
        }
        for (text, value) in &cover.filter_covers {
            item.set_cover(text.clone(), value.clone());
        }
    }
    item
}

/// Runs every branch of `multi` and merges their items tagged with the
/// branch position.
struct Branches {
    stop: CancellationToken,
    receivers: Vec<Receiver<AnnotatedValue>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Branches {
    fn start(ctx: &Arc<Context>, multi: &MultiScan, port: &Port) -> Self {
        let stop = port.stop.child_token();
        let mut receivers = Vec::with_capacity(multi.scans.len());
        let mut handles = Vec::with_capacity(multi.scans.len());
        for scan in &multi.scans {
            let (tx, rx) = async_channel::bounded(ctx.config().pipeline_cap);
            let links = Links {
                input: None,
                output: tx,
                stop: stop.child_token(),
                parent: port.parent.clone(),
            };
            handles.push(spawn(Operator::new(scan.clone()), ctx.clone(), links));
            receivers.push(rx);
        }
        Self {
            stop,
            receivers,
            handles,
        }
    }

    /// Feeds `(branch, item)` pairs to `on_item` until every branch ends,
    /// `on_item` returns false, or the port stops.
    async fn merge(
        self,
        ctx: &Context,
        port: &Port,
        mut on_item: impl FnMut(usize, AnnotatedValue) -> MergeStep,
    ) -> Vec<AnnotatedValue> {
        let Branches {
            stop,
            receivers,
            handles,
        } = self;
        let mut merged = stream::select_all(
            receivers
                .into_iter()
                .enumerate()
                .map(|(i, rx)| rx.map(move |item| (i, item)).boxed()),
        );
        let mut out = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = port.stop.cancelled() => None,
                next = merged.next() => next,
            };
            let Some((branch, item)) = next else {
                break;
            };
            match on_item(branch, item) {
                MergeStep::Skip => {}
                MergeStep::Emit(item) => {
                    if !port.send(item).await {
                        break;
                    }
                }
                MergeStep::Buffer(item) => out.push(item),
                MergeStep::Finish(item) => {
                    if let Some(item) = item {
                        port.send(item).await;
                    }
                    break;
                }
            }
        }
        stop.cancel();
        drop(merged);
        join_all(ctx, handles).await;
        out
    }
}

enum MergeStep {
    Skip,
    Emit(AnnotatedValue),
    Buffer(AnnotatedValue),
    Finish(Option<AnnotatedValue>),
}

/// Mask with one bit per branch, or a fatal error when the branches do not
/// fit in it.
fn full_mask(ctx: &Context, branches: usize) -> Option<u64> {
    match branches {
        MAX_INTERSECT_SCANS => Some(u64::MAX),
        n if n < MAX_INTERSECT_SCANS => Some((1u64 << n) - 1),
        n => {
            ctx.fatal(QueryError::internal(format!(
                "intersect scan over {n} branches exceeds {MAX_INTERSECT_SCANS}"
            )));
            None
        }
    }
}

fn doc_key(ctx: &Context, item: &AnnotatedValue) -> Option<String> {
    match item.meta_id() {
        Some(id) => Some(id.to_owned()),
        None => {
            ctx.fatal(QueryError::internal("scan item without document key"));
            None
        }
    }
}

pub(crate) async fn intersect_scan(ctx: &Arc<Context>, multi: &MultiScan, port: Port) {
    let Some(full) = full_mask(ctx, multi.scans.len()) else {
        return;
    };
    let limit = multi.limit;
    let mut masks: FxHashMap<String, u64> = FxHashMap::default();
    let mut emitted: u64 = 0;
    let branches = Branches::start(ctx, multi, &port);
    branches
        .merge(ctx, &port, |branch, item| {
            let Some(key) = doc_key(ctx, &item) else {
                return MergeStep::Finish(None);
            };
            let mask = masks.entry(key).or_insert(0);
            let before = *mask;
            *mask |= 1u64 << branch;
            if before == full || *mask != full {
                return MergeStep::Skip;
            }
            emitted += 1;
            if limit.is_some_and(|l| emitted >= l) {
                MergeStep::Finish(Some(item))
            } else {
                MergeStep::Emit(item)
            }
        })
        .await;
}

pub(crate) async fn ordered_intersect_scan(ctx: &Arc<Context>, multi: &MultiScan, port: Port) {
    let Some(full) = full_mask(ctx, multi.scans.len()) else {
        return;
    };
    let mut masks: FxHashMap<String, u64> = FxHashMap::default();
    let mut failed = false;
    let branches = Branches::start(ctx, multi, &port);
    let ordered = branches
        .merge(ctx, &port, |branch, item| {
            let Some(key) = doc_key(ctx, &item) else {
                failed = true;
                return MergeStep::Finish(None);
            };
            let mask = masks.entry(key).or_insert(0);
            let first_from_driver = branch == 0 && *mask & 1 == 0;
            *mask |= 1u64 << branch;
            if first_from_driver {
                MergeStep::Buffer(item)
            } else {
                MergeStep::Skip
            }
        })
        .await;
    if failed || port.stopped() {
        return;
    }
    let mut emitted: u64 = 0;
    for item in ordered {
        let complete = item
            .meta_id()
            .and_then(|id| masks.get(id))
            .is_some_and(|m| *m == full);
        if !complete {
            continue;
        }
        if !port.send(item).await {
            return;
        }
        emitted += 1;
        if multi.limit.is_some_and(|l| emitted >= l) {
            return;
        }
    }
}

pub(crate) async fn union_scan(ctx: &Arc<Context>, multi: &MultiScan, port: Port) {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut emitted: u64 = 0;
    let limit = multi.limit;
    let branches = Branches::start(ctx, multi, &port);
    branches
        .merge(ctx, &port, |_, item| {
            let Some(key) = doc_key(ctx, &item) else {
                return MergeStep::Finish(None);
            };
            if !seen.insert(key) {
                return MergeStep::Skip;
            }
            emitted += 1;
            if limit.is_some_and(|l| emitted >= l) {
                MergeStep::Finish(Some(item))
            } else {
                MergeStep::Emit(item)
            }
        })
        .await;
}

//! Operator instances, their run-once lifecycle and channel ports.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::context::Context;
use super::{ops, scan};
use crate::query::physical::PlanNode;
use crate::query::value::AnnotatedValue;
use crate::types::QueryError;

/// Lifecycle of one operator instance.
///
/// `Created -> Active -> (Streaming <-> WaitingOnChild) -> Closing ->
/// Stopped | Done`. Closing is always entered before a terminal state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatorState {
    /// Not started.
    Created = 0,
    /// Started, no item exchanged yet.
    Active = 1,
    /// Delivering items.
    Streaming = 2,
    /// Blocked on an input or child.
    WaitingOnChild = 3,
    /// Releasing resources.
    Closing = 4,
    /// Terminated by a stop signal.
    Stopped = 5,
    /// Input exhausted.
    Done = 6,
}

impl OperatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OperatorState::Created,
            1 => OperatorState::Active,
            2 => OperatorState::Streaming,
            3 => OperatorState::WaitingOnChild,
            4 => OperatorState::Closing,
            5 => OperatorState::Stopped,
            _ => OperatorState::Done,
        }
    }

    /// True for `Stopped` and `Done`.
    pub fn is_terminal(self) -> bool {
        matches!(self, OperatorState::Stopped | OperatorState::Done)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(OperatorState::Created as u8))
    }

    fn get(&self) -> OperatorState {
        OperatorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Created -> Active; false when the operator already ran.
    fn start(&self) -> bool {
        self.0
            .compare_exchange(
                OperatorState::Created as u8,
                OperatorState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves between the running states; never leaves Closing or a
    /// terminal state.
    fn running(&self, state: OperatorState) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            (cur < OperatorState::Closing as u8).then_some(state as u8)
        });
    }

    fn close(&self, terminal: OperatorState) {
        self.0.store(OperatorState::Closing as u8, Ordering::Release);
        self.0.store(terminal as u8, Ordering::Release);
    }
}

/// Channel handles for one activation.
///
/// Every activation receives fresh handles; nothing is rewired on a running
/// operator.
pub struct Links {
    /// Upstream items; `None` for scans and other leaf operators.
    pub input: Option<Receiver<AnnotatedValue>>,
    /// Downstream sink. Dropping every sender ends the stream.
    pub output: Sender<AnnotatedValue>,
    /// Stop signal for this operator and its children.
    pub stop: CancellationToken,
    /// Outer item for correlated subplans.
    pub parent: Option<Arc<AnnotatedValue>>,
}

/// Operator-side view of [`Links`] with state tracking at every
/// suspension point.
pub(crate) struct Port {
    input: Option<Receiver<AnnotatedValue>>,
    output: Sender<AnnotatedValue>,
    pub stop: CancellationToken,
    pub parent: Option<Arc<AnnotatedValue>>,
    state: Arc<StateCell>,
}

impl Port {
    fn new(links: Links, state: Arc<StateCell>) -> Self {
        Self {
            input: links.input,
            output: links.output,
            stop: links.stop,
            parent: links.parent,
            state,
        }
    }

    /// Next upstream item; `None` at end of input or on stop.
    pub async fn recv(&self) -> Option<AnnotatedValue> {
        let input = self.input.as_ref()?;
        self.state.running(OperatorState::WaitingOnChild);
        let item = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            item = input.recv() => item.ok(),
        };
        self.state.running(OperatorState::Streaming);
        item
    }

    /// Buffered upstream item, without waiting.
    pub fn try_recv(&self) -> Option<AnnotatedValue> {
        self.input.as_ref()?.try_recv().ok()
    }

    /// Delivers one item; `false` once downstream is gone or on stop.
    pub async fn send(&self, item: AnnotatedValue) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.state.running(OperatorState::Streaming);
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.output.send(item) => sent.is_ok(),
        }
    }

    /// True once a stop was requested.
    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Item the correlated subplan is evaluated against.
    pub fn scope(&self) -> AnnotatedValue {
        AnnotatedValue::scoped(self.parent.clone())
    }

    /// Splits the port for operators that fan out their links.
    pub fn into_links(self) -> Links {
        Links {
            input: self.input,
            output: self.output,
            stop: self.stop,
            parent: self.parent,
        }
    }
}

/// Runs the close transition whichever way the activation ends.
struct CloseGuard {
    state: Arc<StateCell>,
    stop: CancellationToken,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let terminal = if self.stop.is_cancelled() {
            OperatorState::Stopped
        } else {
            OperatorState::Done
        };
        self.state.close(terminal);
    }
}

/// One executable instance of a plan node.
pub struct Operator {
    plan: Arc<PlanNode>,
    state: Arc<StateCell>,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("op", &self.plan.op_name())
            .field("state", &self.state())
            .finish()
    }
}

impl Operator {
    /// Fresh instance of `plan`.
    pub fn new(plan: Arc<PlanNode>) -> Self {
        Self {
            plan,
            state: Arc::new(StateCell::new()),
        }
    }

    /// Independent instance sharing the same plan node.
    pub fn copy(&self) -> Self {
        Self::new(self.plan.clone())
    }

    /// Plan node this operator executes.
    pub fn plan(&self) -> &Arc<PlanNode> {
        &self.plan
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperatorState {
        self.state.get()
    }

    /// Runs the operator to completion. Only the first call does any work;
    /// later calls return immediately.
    ///
    /// A panic inside the operator is converted into a fatal internal error
    /// on the context, which stops the rest of the pipeline.
    pub fn run_once(&self, ctx: Arc<Context>, links: Links) -> BoxFuture<'static, ()> {
        let op = self.plan.op_name();
        if !self.state.start() {
            debug!(op, "executor.operator.rerun_ignored");
            return futures::future::ready(()).boxed();
        }
        let plan = self.plan.clone();
        let state = self.state.clone();
        async move {
            let _guard = CloseGuard {
                state: state.clone(),
                stop: links.stop.clone(),
            };
            let port = Port::new(links, state);
            let outcome = AssertUnwindSafe(dispatch(plan, ctx.clone(), port))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                let reason = panic_message(panic.as_ref());
                error!(op, request_id = %ctx.request_id(), reason = %reason, "executor.operator.fault");
                ctx.fatal(QueryError::internal(format!("operator {op} faulted: {reason}")));
            }
        }
        .boxed()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Spawns `operator` on the runtime.
pub(crate) fn spawn(
    operator: Operator,
    ctx: Arc<Context>,
    links: Links,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(operator.run_once(ctx, links))
}

/// Awaits spawned operators, converting a lost task into a fatal error.
pub(crate) async fn join_all(ctx: &Context, handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            ctx.fatal(QueryError::internal(format!("operator task failed: {err}")));
        }
    }
}

async fn dispatch(plan: Arc<PlanNode>, ctx: Arc<Context>, port: Port) {
    match plan.as_ref() {
        PlanNode::DummyScan => scan::dummy_scan(port).await,
        PlanNode::CountScan { term, aggregates } => {
            scan::count_scan(&ctx, term, aggregates, port).await
        }
        PlanNode::PrimaryScan(node) => scan::primary_scan(&ctx, node, port).await,
        PlanNode::IndexScan(node) => scan::index_scan(&ctx, node, port).await,
        PlanNode::IntersectScan(multi) => scan::intersect_scan(&ctx, multi, port).await,
        PlanNode::OrderedIntersectScan(multi) => {
            scan::ordered_intersect_scan(&ctx, multi, port).await
        }
        PlanNode::UnionScan(multi) => scan::union_scan(&ctx, multi, port).await,
        PlanNode::Fetch(node) => ops::fetch(&ctx, node, port).await,
        PlanNode::Filter { cond } => ops::filter(&ctx, cond, port).await,
        PlanNode::AnsiNest(node) => ops::ansi_nest(&ctx, node, port).await,
        PlanNode::Nest(node) => ops::key_nest(&ctx, node, port).await,
        PlanNode::Group(node) => ops::group(&ctx, node, port).await,
        PlanNode::Order { terms } => ops::order(&ctx, terms, port).await,
        PlanNode::Offset { offset } => ops::offset(*offset, port).await,
        PlanNode::Limit { limit } => ops::limit(*limit, port).await,
        PlanNode::Project { terms } => ops::project(&ctx, terms, port).await,
        PlanNode::Sequence(children) => ops::sequence(&ctx, children, port).await,
        PlanNode::Parallel {
            child,
            max_parallelism,
        } => ops::parallel(&ctx, child, *max_parallelism, port).await,
    }
}

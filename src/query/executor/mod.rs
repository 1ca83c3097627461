//! Streaming execution of physical plans.
//!
//! Every plan node runs as its own tokio task connected to its neighbours
//! by bounded `async-channel` channels. A tree of cancellation tokens
//! mirrors the plan: stopping the request cancels the root token and every
//! operator observes it at its next suspension point.

mod context;
mod operator;
mod ops;
mod scan;

use std::fmt;
use std::sync::Arc;

use async_channel::Receiver;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ExecConfig;
use crate::query::physical::PhysicalPlan;
use crate::query::profile::PhaseSnapshot;
use crate::query::value::AnnotatedValue;
use crate::types::QueryError;

pub use context::Context;
pub use operator::{Links, Operator, OperatorState};

/// How a request ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Every operator ran to completion.
    Success,
    /// The request deadline fired.
    Timeout,
    /// The caller stopped the request.
    Cancelled,
    /// An operator reported a fatal error.
    Fatal,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryStatus::Success => "success",
            QueryStatus::Timeout => "timeout",
            QueryStatus::Cancelled => "cancelled",
            QueryStatus::Fatal => "fatal",
        })
    }
}

/// Materialised outcome of a request.
#[derive(Debug)]
pub struct QueryResult {
    /// Rows delivered before the stream ended.
    pub rows: Vec<AnnotatedValue>,
    /// End-of-stream status.
    pub status: QueryStatus,
    /// Fatal error first, then per-key errors.
    pub errors: Vec<QueryError>,
    /// Warnings.
    pub warnings: Vec<String>,
    /// Phase counters.
    pub phases: PhaseSnapshot,
}

/// Runs physical plans.
#[derive(Clone, Debug, Default)]
pub struct Executor {
    config: ExecConfig,
}

impl Executor {
    /// Executor with the given settings.
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    /// Context for a new request using this executor's settings.
    pub fn context(&self, request_id: &str) -> Arc<Context> {
        Arc::new(Context::new(request_id, self.config.clone()))
    }

    /// Starts the plan. Must be called from within a tokio runtime.
    pub fn execute(&self, plan: &PhysicalPlan, ctx: Arc<Context>) -> ResultStream {
        debug!(request_id = %ctx.request_id(), op = plan.root.op_name(), "executor.request.start");
        let (tx, rx) = async_channel::bounded(self.config.pipeline_cap);
        if let Some(timeout) = self.config.request_timeout {
            let deadline = tokio::time::Instant::now() + timeout;
            let watchdog = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!(request_id = %watchdog.request_id(), "executor.request.deadline");
                        watchdog.expire();
                    }
                    _ = watchdog.stop_token().cancelled() => {}
                }
            });
        }
        let links = Links {
            input: None,
            output: tx,
            stop: ctx.stop_token().child_token(),
            parent: None,
        };
        let root = Operator::new(plan.root.clone());
        let handle = tokio::spawn(root.run_once(ctx.clone(), links));
        ResultStream {
            rows: rx,
            ctx,
            handle: Some(handle),
        }
    }
}

/// Lazily consumed output of a running request.
///
/// Dropping an unfinished stream stops the request.
pub struct ResultStream {
    rows: Receiver<AnnotatedValue>,
    ctx: Arc<Context>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("ctx", &self.ctx)
            .field("buffered", &self.rows.len())
            .finish()
    }
}

impl ResultStream {
    /// Next row, or `None` once the pipeline has ended.
    pub async fn next(&mut self) -> Option<AnnotatedValue> {
        self.rows.recv().await.ok()
    }

    /// Stops the request; rows already buffered stay readable.
    pub fn stop(&self) {
        debug!(request_id = %self.ctx.request_id(), "executor.request.stop");
        self.ctx.cancel();
    }

    /// Request context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Drains the remaining rows and waits for every operator to finish.
    pub async fn finish(mut self) -> QueryResult {
        let mut rows = Vec::new();
        while let Ok(row) = self.rows.recv().await {
            rows.push(row);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                self.ctx
                    .fatal(QueryError::internal(format!("pipeline task failed: {err}")));
            }
        }
        let fatal = self.ctx.fatal_error();
        let status = if fatal.is_some() {
            QueryStatus::Fatal
        } else if self.ctx.timed_out() {
            QueryStatus::Timeout
        } else if self.ctx.cancelled() {
            QueryStatus::Cancelled
        } else {
            QueryStatus::Success
        };
        let mut errors: Vec<QueryError> = fatal.into_iter().collect();
        errors.extend(self.ctx.errors());
        if status == QueryStatus::Cancelled {
            errors.push(QueryError::Cancelled);
        }
        // Releases the deadline watchdog.
        self.ctx.stop_token().cancel();
        debug!(
            request_id = %self.ctx.request_id(),
            %status,
            rows = rows.len(),
            "executor.request.finish"
        );
        QueryResult {
            rows,
            status,
            errors,
            warnings: self.ctx.warnings(),
            phases: self.ctx.phases().snapshot(),
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.ctx.stop_token().cancel();
        }
    }
}

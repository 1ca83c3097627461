//! Per-request execution state shared by every operator of a pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ExecConfig;
use crate::datastore::{ScanConsistency, ScanVector, ScanVectorSource};
use crate::query::profile::PhaseStats;
use crate::types::{QueryError, RequestId};

/// Request context: identity, scan settings, cancellation and error sinks.
///
/// A context belongs to exactly one execution. Operators hold it through an
/// `Arc` and report into it; nothing in it is reset once the request runs.
pub struct Context {
    request_id: RequestId,
    consistency: ScanConsistency,
    vectors: Option<Arc<dyn ScanVectorSource>>,
    config: ExecConfig,
    stop: CancellationToken,
    timed_out: AtomicBool,
    cancelled: AtomicBool,
    fatal: Mutex<Option<QueryError>>,
    errors: Mutex<Vec<QueryError>>,
    warnings: Mutex<Vec<String>>,
    phases: PhaseStats,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("consistency", &self.consistency)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Context {
    /// Context using the consistency configured in `config`.
    pub fn new(request_id: impl Into<RequestId>, config: ExecConfig) -> Self {
        Self {
            request_id: request_id.into(),
            consistency: config.scan_consistency,
            vectors: None,
            config,
            stop: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            fatal: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            phases: PhaseStats::default(),
        }
    }

    /// Overrides the scan consistency.
    pub fn with_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Supplies scan vectors for `AtPlus` scans.
    pub fn with_scan_vectors(mut self, vectors: Arc<dyn ScanVectorSource>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    /// Request identifier.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Scan consistency.
    pub fn consistency(&self) -> ScanConsistency {
        self.consistency
    }

    /// Scan vector for `keyspace`; only `AtPlus` scans carry one.
    pub fn scan_vector(&self, keyspace: &str) -> Option<ScanVector> {
        if self.consistency != ScanConsistency::AtPlus {
            return None;
        }
        self.vectors.as_ref().and_then(|v| v.scan_vector(keyspace))
    }

    /// Executor settings.
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Root stop token; every operator token descends from it.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Phase counters.
    pub fn phases(&self) -> &PhaseStats {
        &self.phases
    }

    /// Records a request-fatal error and stops the pipeline. Only the first
    /// fatal error is kept.
    pub fn fatal(&self, err: QueryError) {
        {
            let mut slot = self.fatal.lock();
            if slot.is_some() {
                debug!(request_id = %self.request_id, error = %err, "executor.request.fatal_suppressed");
                return;
            }
            error!(request_id = %self.request_id, code = err.code(), error = %err, "executor.request.fatal");
            *slot = Some(err);
        }
        self.stop.cancel();
    }

    /// Records an error, stopping the request when it is fatal.
    pub fn report(&self, err: QueryError) {
        if err.is_fatal() {
            self.fatal(err);
        } else {
            self.add_error(err);
        }
    }

    /// Records a non-fatal error returned alongside the results.
    pub fn add_error(&self, err: QueryError) {
        debug!(request_id = %self.request_id, error = %err, "executor.request.error");
        self.errors.lock().push(err);
    }

    /// Records a warning.
    pub fn add_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    /// Marks the request as past its deadline and stops it.
    pub fn expire(&self) {
        self.timed_out.store(true, Ordering::Release);
        self.stop.cancel();
    }

    /// Stops the request on behalf of the caller.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.stop.cancel();
    }

    /// True once the deadline fired.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// True once the caller stopped the request.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// First fatal error, if any.
    pub fn fatal_error(&self) -> Option<QueryError> {
        self.fatal.lock().clone()
    }

    /// Non-fatal errors recorded so far.
    pub fn errors(&self) -> Vec<QueryError> {
        self.errors.lock().clone()
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

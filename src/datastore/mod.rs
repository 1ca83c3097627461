//! Storage capabilities consumed by the planner and the executor.
//!
//! The engine never looks inside a keyspace or an index: it lists indexes,
//! reads their key expressions and state, asks them to scan spans into an
//! [`IndexConnection`], and fetches documents by key.

mod connection;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::aggregate::AggFunc;
use crate::query::expr::Expr;
use crate::query::value::Value;
use crate::types::{QueryError, Result};

pub use connection::IndexConnection;

/// Consistency requested for index scans.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    /// Return whatever the index currently holds.
    #[default]
    NotBounded,
    /// Wait until the index has caught up with the supplied scan vector.
    AtPlus,
    /// Wait until the index has caught up with the request time.
    RequestPlus,
}

/// Per-partition sequence numbers an `AtPlus` scan must observe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanVector {
    /// Partition id to `(sequence number, partition uuid)`.
    pub entries: BTreeMap<u32, (u64, String)>,
}

/// Supplies scan vectors per keyspace.
pub trait ScanVectorSource: Send + Sync + fmt::Debug {
    /// Scan vector for `keyspace`, if the request carries one.
    fn scan_vector(&self, keyspace: &str) -> Option<ScanVector>;
}

/// Lifecycle state of an index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Created but not built.
    Deferred,
    /// Being built.
    Building,
    /// Waiting on another build.
    Pending,
    /// Usable.
    Online,
    /// Unusable.
    Offline,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IndexState::Deferred => "deferred",
            IndexState::Building => "building",
            IndexState::Pending => "pending",
            IndexState::Online => "online",
            IndexState::Offline => "offline",
        };
        f.write_str(text)
    }
}

/// Evaluated restriction on one key position.
#[derive(Clone, Debug, PartialEq)]
pub struct Range {
    /// Lower bound.
    pub low: Bound<Value>,
    /// Upper bound.
    pub high: Bound<Value>,
}

impl Range {
    /// Unrestricted range.
    pub fn full() -> Self {
        Self {
            low: Bound::Unbounded,
            high: Bound::Unbounded,
        }
    }

    /// `[v, v]`
    pub fn point(v: Value) -> Self {
        Self {
            low: Bound::Included(v.clone()),
            high: Bound::Included(v),
        }
    }

    /// Range that matches nothing.
    pub fn empty() -> Self {
        Self {
            low: Bound::Excluded(Value::Null),
            high: Bound::Excluded(Value::Null),
        }
    }

    /// True when `v` lies inside the range.
    pub fn contains(&self, v: &Value) -> bool {
        let low_ok = match &self.low {
            Bound::Unbounded => true,
            Bound::Included(l) => v >= l,
            Bound::Excluded(l) => v > l,
        };
        let high_ok = match &self.high {
            Bound::Unbounded => true,
            Bound::Included(h) => v <= h,
            Bound::Excluded(h) => v < h,
        };
        low_ok && high_ok
    }
}

/// Conjunction of per-key ranges over the leading key positions.
#[derive(Clone, Debug, PartialEq)]
pub struct Span {
    /// One range per leading key position.
    pub ranges: Vec<Range>,
}

impl Span {
    /// Creates a span.
    pub fn new(ranges: Vec<Range>) -> Self {
        Self { ranges }
    }

    /// True when every constrained position of `key` lies in its range.
    pub fn matches(&self, key: &[Value]) -> bool {
        self.ranges.iter().enumerate().all(|(i, range)| {
            let v = key.get(i).unwrap_or(&Value::Missing);
            range.contains(v)
        })
    }
}

/// One index entry delivered by a scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanEntry {
    /// Index key values; for grouped scans, group keys followed by
    /// aggregate results.
    pub entry_key: Vec<Value>,
    /// Document key.
    pub primary_key: String,
}

/// Which index data the scan must return.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexProjection {
    /// Key positions to return.
    pub entry_keys: Vec<usize>,
    /// Whether the document key is needed.
    pub primary_key: bool,
}

/// Aggregate computed by the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexAggregate {
    /// Aggregate function.
    pub func: AggFunc,
    /// Key position aggregated; `None` for `COUNT(*)`.
    pub key_pos: Option<usize>,
}

/// Grouping and aggregation pushed into the scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexGroupAggs {
    /// Leading key positions to group by.
    pub group_keys: Vec<usize>,
    /// Aggregates, in output order after the group keys.
    pub aggregates: Vec<IndexAggregate>,
}

/// Parameters of one index scan.
#[derive(Clone, Debug, Default)]
pub struct ScanRequest {
    /// Request identifier for diagnostics.
    pub request_id: String,
    /// Spans to scan; empty means the whole index.
    pub spans: Vec<Span>,
    /// Return each document key at most once.
    pub distinct: bool,
    /// Entries to skip.
    pub offset: Option<u64>,
    /// Maximum entries to return.
    pub limit: Option<u64>,
    /// Scan consistency.
    pub consistency: ScanConsistency,
    /// Scan vector for `AtPlus`.
    pub vector: Option<ScanVector>,
    /// Data the caller needs back.
    pub projection: Option<IndexProjection>,
    /// Resume strictly after this entry.
    pub start_after: Option<ScanEntry>,
    /// Grouping/aggregation push-down.
    pub group_aggs: Option<IndexGroupAggs>,
}

/// Index capability.
pub trait Index: Send + Sync + fmt::Debug {
    /// Unique identifier.
    fn id(&self) -> &str;
    /// Index name.
    fn name(&self) -> &str;
    /// Owning keyspace.
    fn keyspace_id(&self) -> &str;
    /// Declared key expressions, relative to the keyspace.
    fn range_key(&self) -> &[Expr];
    /// Partial-index condition.
    fn condition(&self) -> Option<&Expr>;
    /// True for primary indexes.
    fn is_primary(&self) -> bool;
    /// Current state and message.
    fn state(&self) -> Result<(IndexState, String)>;
    /// Scans `request.spans` into `conn`. Runs on a blocking thread; must
    /// stop early when [`IndexConnection::send`] returns false.
    fn scan(&self, request: &ScanRequest, conn: &IndexConnection);
    /// Primary-scan view of this index.
    fn as_primary(self: Arc<Self>) -> Option<Arc<dyn PrimaryIndex>>;
}

/// Primary index capability: full scans over document keys.
pub trait PrimaryIndex: Index {
    /// Scans every document key, honouring offset, limit and resume.
    fn scan_entries(&self, request: &ScanRequest, conn: &IndexConnection);
}

/// Source of indexes for a keyspace.
pub trait Indexer: Send + Sync + fmt::Debug {
    /// Indexer name.
    fn name(&self) -> &str;
    /// All indexes, primary included.
    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>>;
    /// Primary indexes only.
    fn primary_indexes(&self) -> Result<Vec<Arc<dyn Index>>>;
}

/// Keyspace capability.
pub trait Keyspace: Send + Sync + fmt::Debug {
    /// Keyspace name.
    fn name(&self) -> &str;
    /// Best-effort document count.
    fn count(&self) -> Result<i64>;
    /// Fetches documents by key. Missing keys are skipped; per-key failures
    /// are returned alongside the documents that could be read.
    fn fetch(&self, keys: &[String]) -> (Vec<(String, Value)>, Vec<QueryError>);
    /// Indexers serving this keyspace.
    fn indexers(&self) -> Result<Vec<Arc<dyn Indexer>>>;
}

/// Keyspace lookup.
pub trait Datastore: Send + Sync + fmt::Debug {
    /// Resolves a keyspace by name.
    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>>;
}

/// Stable identity of an index object, used to key candidate maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexIdentity(usize);

impl IndexIdentity {
    /// Identity of the index behind `index`.
    pub fn of(index: &Arc<dyn Index>) -> Self {
        IndexIdentity(Arc::as_ptr(index) as *const () as usize)
    }
}

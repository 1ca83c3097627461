//! In-memory datastore.
//!
//! Documents live in an ordered map per keyspace. Index entries are derived
//! on every scan by evaluating the index keys against the current documents,
//! so scans always observe the latest writes. Failure knobs (scan timeouts,
//! fetch errors, count errors, scan delays) let tests drive the executor's
//! recovery paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use tracing::debug;

use super::{
    Datastore, Index, IndexConnection, IndexGroupAggs, IndexState, Indexer, Keyspace,
    PrimaryIndex, ScanEntry, ScanRequest,
};
use crate::query::aggregate::Accumulator;
use crate::query::errors::PlanError;
use crate::query::expr::Expr;
use crate::query::value::{AnnotatedValue, Value};
use crate::types::{QueryError, Result};

type Documents = Arc<RwLock<BTreeMap<String, Value>>>;

/// Datastore holding keyspaces in memory.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    keyspaces: RwLock<BTreeMap<String, Arc<MemoryKeyspace>>>,
}

impl MemoryDatastore {
    /// Empty datastore.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates (or returns the existing) keyspace `name`.
    pub fn create_keyspace(&self, name: &str) -> Arc<MemoryKeyspace> {
        self.keyspaces
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryKeyspace::new(name)))
            .clone()
    }

    /// Typed handle to a keyspace.
    pub fn memory_keyspace(&self, name: &str) -> Option<Arc<MemoryKeyspace>> {
        self.keyspaces.read().get(name).cloned()
    }
}

impl Datastore for MemoryDatastore {
    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>> {
        match self.keyspaces.read().get(name) {
            Some(ks) => Ok(ks.clone() as Arc<dyn Keyspace>),
            None => Err(PlanError::UnknownKeyspace {
                keyspace: name.to_owned(),
            }
            .into()),
        }
    }
}

/// One keyspace: documents plus the indexes over them.
pub struct MemoryKeyspace {
    name: String,
    docs: Documents,
    indexer: Arc<MemoryIndexer>,
    fail_count: AtomicBool,
    fail_indexes: AtomicBool,
    fetch_failures: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for MemoryKeyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKeyspace")
            .field("name", &self.name)
            .field("docs", &self.docs.read().len())
            .finish()
    }
}

impl MemoryKeyspace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            docs: Arc::new(RwLock::new(BTreeMap::new())),
            indexer: Arc::new(MemoryIndexer {
                name: format!("{name}.memory"),
                indexes: RwLock::new(Vec::new()),
            }),
            fail_count: AtomicBool::new(false),
            fail_indexes: AtomicBool::new(false),
            fetch_failures: Mutex::new(BTreeSet::new()),
        }
    }

    /// Inserts or replaces a document.
    pub fn insert(&self, key: impl Into<String>, doc: impl Into<Value>) {
        self.docs.write().insert(key.into(), doc.into());
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// True when the keyspace holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Creates an online primary index.
    pub fn create_primary_index(&self, name: &str) -> Arc<MemoryIndex> {
        self.add_index(name, vec![Expr::Meta(String::new()).field("id")], None, true)
    }

    /// Creates an online secondary index over `keys`, optionally partial.
    ///
    /// Keys are written relative to the keyspace (`a.b`, not `alias.a.b`).
    pub fn create_index(
        &self,
        name: &str,
        keys: Vec<Expr>,
        condition: Option<Expr>,
    ) -> Arc<MemoryIndex> {
        self.add_index(name, keys, condition, false)
    }

    fn add_index(
        &self,
        name: &str,
        keys: Vec<Expr>,
        condition: Option<Expr>,
        primary: bool,
    ) -> Arc<MemoryIndex> {
        let formal_keys = keys.iter().map(|k| k.formalize(&self.name)).collect();
        let formal_condition = condition.as_ref().map(|c| c.formalize(&self.name));
        let index = Arc::new(MemoryIndex {
            id: format!("{}:{name}", self.name),
            name: name.to_owned(),
            keyspace: self.name.clone(),
            keys,
            formal_keys,
            condition,
            formal_condition,
            primary,
            docs: self.docs.clone(),
            state: Mutex::new(IndexState::Online),
            timeout: Mutex::new(None),
            delay: Mutex::new(None),
            scan_error: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            scans: AtomicUsize::new(0),
        });
        let mut indexes = self.indexer.indexes.write();
        indexes.retain(|i| i.name != name);
        indexes.push(index.clone());
        index
    }

    /// Typed handle to an index by name.
    pub fn index(&self, name: &str) -> Option<Arc<MemoryIndex>> {
        self.indexer
            .indexes
            .read()
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Makes [`Keyspace::count`] fail.
    pub fn fail_count(&self, fail: bool) {
        self.fail_count.store(fail, Ordering::Release);
    }

    /// Makes index listing fail.
    pub fn fail_index_listing(&self, fail: bool) {
        self.fail_indexes.store(fail, Ordering::Release);
    }

    /// Makes fetches of `key` report a per-key error.
    pub fn fail_fetch(&self, key: impl Into<String>) {
        self.fetch_failures.lock().insert(key.into());
    }
}

impl Keyspace for MemoryKeyspace {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> Result<i64> {
        if self.fail_count.load(Ordering::Acquire) {
            return Err(QueryError::Datastore(format!(
                "count unavailable for {}",
                self.name
            )));
        }
        Ok(self.docs.read().len() as i64)
    }

    fn fetch(&self, keys: &[String]) -> (Vec<(String, Value)>, Vec<QueryError>) {
        let docs = self.docs.read();
        let failures = self.fetch_failures.lock();
        let mut found = Vec::with_capacity(keys.len());
        let mut errors = Vec::new();
        for key in keys {
            if failures.contains(key) {
                errors.push(QueryError::KeyFetch {
                    key: key.clone(),
                    reason: "document unavailable".into(),
                });
                continue;
            }
            if let Some(doc) = docs.get(key) {
                found.push((key.clone(), doc.clone()));
            }
        }
        (found, errors)
    }

    fn indexers(&self) -> Result<Vec<Arc<dyn Indexer>>> {
        if self.fail_indexes.load(Ordering::Acquire) {
            return Err(QueryError::Datastore(format!(
                "index metadata unavailable for {}",
                self.name
            )));
        }
        Ok(vec![self.indexer.clone() as Arc<dyn Indexer>])
    }
}

/// Indexer owning a keyspace's indexes.
#[derive(Debug)]
pub struct MemoryIndexer {
    name: String,
    indexes: RwLock<Vec<Arc<MemoryIndex>>>,
}

impl Indexer for MemoryIndexer {
    fn name(&self) -> &str {
        &self.name
    }

    fn indexes(&self) -> Result<Vec<Arc<dyn Index>>> {
        Ok(self
            .indexes
            .read()
            .iter()
            .map(|i| i.clone() as Arc<dyn Index>)
            .collect())
    }

    fn primary_indexes(&self) -> Result<Vec<Arc<dyn Index>>> {
        Ok(self
            .indexes
            .read()
            .iter()
            .filter(|i| i.primary)
            .map(|i| i.clone() as Arc<dyn Index>)
            .collect())
    }
}

/// Injected scan timeout: cut scans short after `after` entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Entries delivered before the scan reports a timeout.
    pub after: usize,
    /// Number of scans affected; `None` for all.
    pub times: Option<usize>,
}

/// Index over a [`MemoryKeyspace`].
pub struct MemoryIndex {
    id: String,
    name: String,
    keyspace: String,
    keys: Vec<Expr>,
    formal_keys: Vec<Expr>,
    condition: Option<Expr>,
    formal_condition: Option<Expr>,
    primary: bool,
    docs: Documents,
    state: Mutex<IndexState>,
    timeout: Mutex<Option<TimeoutPolicy>>,
    delay: Mutex<Option<Duration>>,
    scan_error: Mutex<Option<String>>,
    requests: Mutex<Vec<ScanRequest>>,
    scans: AtomicUsize,
}

impl fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIndex")
            .field("name", &self.name)
            .field("keyspace", &self.keyspace)
            .field("primary", &self.primary)
            .finish()
    }
}

impl MemoryIndex {
    /// Changes the reported state.
    pub fn set_state(&self, state: IndexState) {
        *self.state.lock() = state;
    }

    /// Installs (or clears) an injected scan timeout.
    pub fn set_timeout_policy(&self, policy: Option<TimeoutPolicy>) {
        *self.timeout.lock() = policy;
    }

    /// Sleeps this long before delivering each entry.
    pub fn set_entry_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Makes the next scan fail with a datastore error.
    pub fn fail_next_scan(&self, reason: impl Into<String>) {
        *self.scan_error.lock() = Some(reason.into());
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ScanRequest> {
        self.requests.lock().clone()
    }

    /// Number of scans started.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Acquire)
    }

    /// All entries, ordered by key then document key.
    fn entries(&self) -> Vec<ScanEntry> {
        let docs = self.docs.read();
        let mut out = Vec::with_capacity(docs.len());
        for (pk, doc) in docs.iter() {
            if self.primary {
                out.push(ScanEntry {
                    entry_key: vec![Value::from(pk.as_str())],
                    primary_key: pk.clone(),
                });
                continue;
            }
            let mut item = AnnotatedValue::default();
            item.set_field(self.keyspace.clone(), doc.clone());
            item.set_meta(self.keyspace.clone(), pk.clone());
            if let Some(cond) = &self.formal_condition {
                if !matches!(cond.test(&item), Ok(true)) {
                    continue;
                }
            }
            let mut key = Vec::with_capacity(self.formal_keys.len());
            let mut array_pos = None;
            for (pos, formal) in self.formal_keys.iter().enumerate() {
                if self.keys[pos].as_array_key().is_some() {
                    array_pos = Some(pos);
                }
                key.push(formal.evaluate(&item).unwrap_or(Value::Missing));
            }
            let keys = match array_pos {
                Some(pos) => {
                    let elements = match &key[pos] {
                        Value::Array(elems) => elems.clone(),
                        other => vec![other.clone()],
                    };
                    elements
                        .into_iter()
                        .map(|elem| {
                            let mut k = key.clone();
                            k[pos] = elem;
                            k
                        })
                        .collect()
                }
                None => vec![key],
            };
            for key in keys {
                if key.first().map_or(true, Value::is_missing) {
                    continue;
                }
                out.push(ScanEntry {
                    entry_key: key,
                    primary_key: pk.clone(),
                });
            }
        }
        out.sort_by(|a, b| {
            a.entry_key
                .cmp(&b.entry_key)
                .then_with(|| a.primary_key.cmp(&b.primary_key))
        });
        out
    }

    fn run_scan(&self, request: &ScanRequest, conn: &IndexConnection) {
        self.scans.fetch_add(1, Ordering::AcqRel);
        self.requests.lock().push(request.clone());
        if let Some(reason) = self.scan_error.lock().take() {
            conn.report_error(QueryError::Datastore(reason));
            return;
        }

        let mut seen = FxHashSet::default();
        let selected = self.entries().into_iter().filter(|e| {
            request.spans.is_empty() || request.spans.iter().any(|s| s.matches(&e.entry_key))
        });
        let selected = selected.filter(|e| match &request.start_after {
            Some(after) => {
                (&e.entry_key, &e.primary_key) > (&after.entry_key, &after.primary_key)
            }
            None => true,
        });
        let selected: Vec<ScanEntry> = selected
            .filter(|e| !request.distinct || seen.insert(e.primary_key.clone()))
            .collect();
        let selected = match &request.group_aggs {
            Some(group) => grouped(selected, group),
            None => selected,
        };

        let offset = request.offset.unwrap_or(0) as usize;
        let limit = request.limit.map_or(usize::MAX, |l| l as usize);
        let window: Vec<ScanEntry> = selected.into_iter().skip(offset).take(limit).collect();

        let cut = self.take_timeout();
        let delay = *self.delay.lock();
        let total = window.len();
        for (sent, entry) in window.into_iter().enumerate() {
            if cut == Some(sent) {
                debug!(index = %self.name, sent, total, "datastore.memory.scan_timeout");
                conn.set_timed_out();
                return;
            }
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if !conn.send(entry) {
                return;
            }
        }
    }

    /// Consumes one use of the timeout policy.
    fn take_timeout(&self) -> Option<usize> {
        let mut slot = self.timeout.lock();
        let policy = (*slot)?;
        match policy.times {
            Some(0) => {
                *slot = None;
                None
            }
            Some(n) => {
                *slot = Some(TimeoutPolicy {
                    times: Some(n - 1),
                    ..policy
                });
                Some(policy.after)
            }
            None => Some(policy.after),
        }
    }
}

/// Groups ordered entries on the leading key positions and evaluates the
/// pushed aggregates; one entry per group.
fn grouped(entries: Vec<ScanEntry>, group: &IndexGroupAggs) -> Vec<ScanEntry> {
    let mut groups: BTreeMap<Vec<Value>, Vec<Accumulator>> = BTreeMap::new();
    let mut first_pk: BTreeMap<Vec<Value>, String> = BTreeMap::new();
    for entry in entries {
        let key: Vec<Value> = group
            .group_keys
            .iter()
            .map(|&pos| entry.entry_key.get(pos).cloned().unwrap_or(Value::Missing))
            .collect();
        first_pk
            .entry(key.clone())
            .or_insert_with(|| entry.primary_key.clone());
        let accs = groups.entry(key).or_insert_with(|| {
            group
                .aggregates
                .iter()
                .map(|a| Accumulator::new(a.func))
                .collect()
        });
        for (acc, agg) in accs.iter_mut().zip(&group.aggregates) {
            acc.add(agg.key_pos.and_then(|pos| entry.entry_key.get(pos)));
        }
    }
    if groups.is_empty() && group.group_keys.is_empty() {
        groups.insert(
            Vec::new(),
            group
                .aggregates
                .iter()
                .map(|a| Accumulator::new(a.func))
                .collect(),
        );
    }
    groups
        .into_iter()
        .map(|(mut key, accs)| {
            let primary_key = first_pk.remove(&key).unwrap_or_default();
            key.extend(accs.iter().map(Accumulator::finish));
            ScanEntry {
                entry_key: key,
                primary_key,
            }
        })
        .collect()
}

impl Index for MemoryIndex {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn keyspace_id(&self) -> &str {
        &self.keyspace
    }

    fn range_key(&self) -> &[Expr] {
        &self.keys
    }

    fn condition(&self) -> Option<&Expr> {
        self.condition.as_ref()
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn state(&self) -> Result<(IndexState, String)> {
        let state = *self.state.lock();
        Ok((state, String::new()))
    }

    fn scan(&self, request: &ScanRequest, conn: &IndexConnection) {
        self.run_scan(request, conn);
    }

    fn as_primary(self: Arc<Self>) -> Option<Arc<dyn PrimaryIndex>> {
        if self.primary {
            Some(self as Arc<dyn PrimaryIndex>)
        } else {
            None
        }
    }
}

impl PrimaryIndex for MemoryIndex {
    fn scan_entries(&self, request: &ScanRequest, conn: &IndexConnection) {
        self.run_scan(request, conn);
    }
}

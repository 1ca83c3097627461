//! Scan selection for one keyspace term.
//!
//! Order of preference: a covering index scan, then one secondary scan (or
//! an intersection of the minimal candidate set), then a union of
//! per-disjunct scans for OR predicates, and finally the primary index.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::index_entry::{sorted_entries, IndexEntry, PushDownProperty};
use super::keyspace::{is_constant_false, primary_key_lookup};
use super::sarg::{sarg_for, sarg_for_filters, SargScope};
use super::select::{covering_index, minimal_indexes, sargable_indexes, FilterCoversPool, IndexPreference};
use super::spans::SargSpans;
use crate::config::PlannerConfig;
use crate::datastore::{Index, IndexAggregate, IndexGroupAggs, IndexState};
use crate::query::aggregate::AggFunc;
use crate::query::ast::{GroupClause, NestClause, OrderTerm};
use crate::query::errors::PlanError;
use crate::query::expr::{conjuncts, Dnf, Expr, FilterCovers};
use crate::query::physical::{
    AnsiNestNode, CoverSpec, FetchNode, IndexGroupPlan, IndexScanNode, KeyNestNode, MultiScan,
    PlanNode, PrimaryScanNode, ScanTerm,
};

/// Query facts that decide push-downs for the driving term.
#[derive(Debug, Default)]
pub(crate) struct QueryShape<'q> {
    pub order: &'q [OrderTerm],
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub group: Option<&'q GroupClause>,
    pub has_nests: bool,
    pub inner_nests: bool,
    /// WHERE conjuncts evaluated after the nests.
    pub post_filter: bool,
    /// Every expression of the query referencing the term.
    pub exprs: Vec<Expr>,
    /// No ORDER, OFFSET or GROUP BY.
    pub chunkable: bool,
    /// `SELECT COUNT(*)` over the whole keyspace.
    pub count_only: Option<Vec<String>>,
}

/// Result of scan selection.
#[derive(Debug)]
pub(crate) struct ScanChoice {
    pub node: PlanNode,
    /// A Fetch must follow the scan.
    pub fetch: bool,
    /// Keys and condition facts of a covering index.
    pub cover: Option<(Vec<Expr>, FilterCovers)>,
    pub push_down: PushDownProperty,
    /// The scan delivers rows in ORDER BY order.
    pub order_index: bool,
}

impl ScanChoice {
    fn fetched(node: PlanNode) -> Self {
        Self {
            node,
            fetch: true,
            cover: None,
            push_down: PushDownProperty::empty(),
            order_index: false,
        }
    }
}

/// `offset + limit`, the row count a multi-branch scan must produce so a
/// downstream OFFSET still sees enough rows.
pub fn offset_plus_limit(limit: u64, offset: u64) -> u64 {
    limit.saturating_add(offset)
}

/// Scan planning for one keyspace term.
pub(crate) struct ScanBuilder<'p> {
    pub term: ScanTerm,
    pub config: &'p PlannerConfig,
    pub dnf: &'p Dnf,
    pub preference: &'p dyn IndexPreference,
    pub pool: &'p FilterCoversPool,
}

struct IndexLists {
    all: Vec<Arc<dyn Index>>,
    primaries: Vec<Arc<dyn Index>>,
}

impl<'p> ScanBuilder<'p> {
    fn alias(&self) -> &str {
        &self.term.alias
    }

    fn list_indexes(&self) -> Result<IndexLists, PlanError> {
        let keyspace = self.term.keyspace.name().to_owned();
        let metadata = |err: crate::types::QueryError| PlanError::IndexMetadata {
            keyspace: keyspace.clone(),
            reason: err.to_string(),
        };
        let mut lists = IndexLists {
            all: Vec::new(),
            primaries: Vec::new(),
        };
        for indexer in self.term.keyspace.indexers().map_err(metadata)? {
            lists.all.extend(indexer.indexes().map_err(metadata)?);
            lists.primaries.extend(indexer.primary_indexes().map_err(metadata)?);
        }
        lists.all.sort_by(|a, b| a.name().cmp(b.name()));
        lists.primaries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(lists)
    }

    /// Chooses the scan for the driving term.
    pub fn build_scan(&self, pred: Option<&Expr>, shape: &QueryShape<'_>) -> Result<ScanChoice, PlanError> {
        if pred.is_some_and(is_constant_false) {
            return Ok(ScanChoice {
                fetch: false,
                ..ScanChoice::fetched(PlanNode::DummyScan)
            });
        }
        if let Some(aggregates) = &shape.count_only {
            let mut push_down = PushDownProperty::empty();
            push_down.insert(PushDownProperty::GROUP_AGGS);
            return Ok(ScanChoice {
                node: PlanNode::CountScan {
                    term: self.term.clone(),
                    aggregates: aggregates.clone(),
                },
                fetch: false,
                cover: None,
                push_down,
                order_index: false,
            });
        }
        let lists = self.list_indexes()?;
        if let Some(pred) = pred {
            if let Some(choice) = self.build_secondary_scan(pred, &lists.all, shape)? {
                return Ok(choice);
            }
            if let Some(choice) = self.build_union_scan(pred, &lists.all, shape)? {
                return Ok(choice);
            }
        }
        self.build_primary_scan(&lists.primaries, pred.is_none(), shape)
    }

    fn sarg_entry(&self, entry: &mut IndexEntry, pred: &Expr, scope: SargScope<'_>) -> bool {
        let spans = match pred {
            Expr::Or(_) => sarg_for(pred, &entry.keys, entry.min_keys, scope, entry.name()),
            _ => sarg_for_filters(&conjuncts(pred), &entry.keys, entry.min_keys, scope, entry.name()),
        };
        match spans {
            Ok(spans) => {
                entry.exact_spans = spans.exact;
                entry.spans = Some(spans);
                true
            }
            Err(err) => {
                error!(index = entry.name(), error = %err, "planner.sarg.not_sarged");
                false
            }
        }
    }

    fn build_secondary_scan(
        &self,
        pred: &Expr,
        indexes: &[Arc<dyn Index>],
        shape: &QueryShape<'_>,
    ) -> Result<Option<ScanChoice>, PlanError> {
        let scope = SargScope::new(self.alias());
        let candidates = sargable_indexes(indexes, pred, scope, self.dnf);
        if candidates.is_empty() {
            return Ok(None);
        }

        if !shape.has_nests {
            if let Some(entry) = covering_index(&candidates, &shape.exprs, self.alias(), self.pool) {
                let mut entry = entry.clone();
                if self.sarg_entry(&mut entry, pred, scope) {
                    debug!(index = entry.name(), "planner.scan.covering");
                    return Ok(Some(self.covering_scan(entry, shape)));
                }
            }
        }

        let minimal = minimal_indexes(&candidates, true, self.preference, self.pool);
        let mut entries: Vec<IndexEntry> = sorted_entries(&minimal).into_iter().cloned().collect();
        let first = entries.first().map(|e| e.name().to_owned());
        entries.retain_mut(|e| self.sarg_entry(e, pred, scope));
        let Some(first) = first else {
            return Ok(None);
        };
        if entries.is_empty() {
            return Err(PlanError::SargableNotSarged { index: first });
        }

        let order_pos = if shape.order.is_empty() || shape.group.is_some() {
            None
        } else {
            entries.iter().position(|e| order_pushable(e, shape.order))
        };
        if entries.len() == 1 {
            let entry = entries.remove(0);
            return Ok(Some(self.single_scan(entry, order_pos.is_some(), shape)));
        }
        let max_branches = self.config.intersect_limit();
        if entries.len() > max_branches {
            return Err(PlanError::TooManyIntersectScans {
                count: entries.len(),
                max: max_branches,
            });
        }
        if let Some(pos) = order_pos {
            let order = entries.remove(pos);
            entries.insert(0, order);
        }
        let exact = entries.iter().all(|e| e.exact_spans);
        let limit = if limit_pushable(shape, exact, order_pos.is_some()) {
            shape
                .limit
                .map(|l| offset_plus_limit(l, shape.offset.unwrap_or(0)))
        } else {
            None
        };
        let scans = entries
            .into_iter()
            .enumerate()
            .map(|(i, mut e)| {
                let mut push_down = PushDownProperty::empty();
                if i == 0 && order_pos.is_some() {
                    push_down.insert(PushDownProperty::ORDER);
                }
                let spans = e.spans.take().unwrap_or_else(SargSpans::full);
                Arc::new(PlanNode::IndexScan(IndexScanNode {
                    term: self.term.clone(),
                    distinct: spans.spans.len() > 1 || e.has_array_key(),
                    index: e.index,
                    spans,
                    limit: None,
                    offset: None,
                    push_down,
                    cover: None,
                    group: None,
                    chunkable: shape.chunkable,
                }))
            })
            .collect();
        let multi = MultiScan { scans, limit };
        let mut choice = match order_pos {
            Some(_) => ScanChoice::fetched(PlanNode::OrderedIntersectScan(multi)),
            None => ScanChoice::fetched(PlanNode::IntersectScan(multi)),
        };
        if order_pos.is_some() {
            choice.push_down.insert(PushDownProperty::ORDER);
            choice.order_index = true;
        }
        Ok(Some(choice))
    }

    fn scan_node(&self, mut entry: IndexEntry, push_down: PushDownProperty, shape: &QueryShape<'_>) -> IndexScanNode {
        let spans = entry.spans.take().unwrap_or_else(SargSpans::full);
        IndexScanNode {
            term: self.term.clone(),
            distinct: spans.spans.len() > 1 || entry.has_array_key(),
            index: entry.index,
            spans,
            limit: None,
            offset: None,
            push_down,
            cover: None,
            group: None,
            chunkable: shape.chunkable,
        }
    }

    fn single_scan(&self, entry: IndexEntry, order: bool, shape: &QueryShape<'_>) -> ScanChoice {
        let mut push_down = PushDownProperty::empty();
        if order {
            push_down.insert(PushDownProperty::ORDER);
        }
        let single_span = entry.spans.as_ref().map_or(true, |s| s.spans.len() <= 1);
        let (limit, offset) = pushed_window(shape, entry.exact_spans, order, single_span, &mut push_down);
        let mut node = self.scan_node(entry, push_down, shape);
        node.limit = limit;
        node.offset = offset;
        ScanChoice {
            node: PlanNode::IndexScan(node),
            fetch: true,
            cover: None,
            push_down,
            order_index: order,
        }
    }

    fn covering_scan(&self, entry: IndexEntry, shape: &QueryShape<'_>) -> ScanChoice {
        let mut covers = FilterCovers::default();
        if let Some(cond) = &entry.cond {
            cond.filter_covers(&mut covers);
        }
        let keys = entry.keys.clone();
        let cover = CoverSpec {
            keys: keys.iter().map(ToString::to_string).collect(),
            filter_covers: {
                let mut facts: Vec<_> = covers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                facts.sort_by(|a, b| a.0.cmp(&b.0));
                facts
            },
        };
        let group = group_push_down(&entry, shape);
        let order = group.is_none() && !shape.order.is_empty() && order_pushable(&entry, shape.order);
        let mut push_down = PushDownProperty::empty();
        if group.is_some() {
            push_down.insert(PushDownProperty::GROUP_AGGS);
        }
        if order {
            push_down.insert(PushDownProperty::ORDER);
        }
        let single_span = entry.spans.as_ref().map_or(true, |s| s.spans.len() <= 1);
        let (limit, offset) = pushed_window(shape, entry.exact_spans, order, single_span, &mut push_down);
        let mut node = self.scan_node(entry, push_down, shape);
        node.limit = limit;
        node.offset = offset;
        node.cover = Some(cover);
        node.group = group;
        ScanChoice {
            node: PlanNode::IndexScan(node),
            fetch: false,
            cover: Some((keys, covers)),
            push_down,
            order_index: order,
        }
    }

    fn best_entry(&self, mut entries: Vec<IndexEntry>) -> Option<IndexEntry> {
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        let mut best: Option<IndexEntry> = None;
        for entry in entries {
            let better = match &best {
                None => true,
                Some(current) => self.preference.compare(&entry, current, true) == Ordering::Greater,
            };
            if better {
                best = Some(entry);
            }
        }
        best
    }

    fn build_union_scan(
        &self,
        pred: &Expr,
        indexes: &[Arc<dyn Index>],
        shape: &QueryShape<'_>,
    ) -> Result<Option<ScanChoice>, PlanError> {
        let Expr::Or(disjuncts) = pred else {
            return Ok(None);
        };
        let scope = SargScope::new(self.alias());
        let mut scans = Vec::with_capacity(disjuncts.len());
        for disjunct in disjuncts {
            let candidates = sargable_indexes(indexes, disjunct, scope, self.dnf);
            let minimal = minimal_indexes(&candidates, true, self.preference, self.pool);
            let entries: Vec<IndexEntry> = sorted_entries(&minimal).into_iter().cloned().collect();
            let Some(mut entry) = self.best_entry(entries) else {
                return Ok(None);
            };
            if !self.sarg_entry(&mut entry, disjunct, scope) {
                return Err(PlanError::SargableNotSarged {
                    index: entry.name().to_owned(),
                });
            }
            scans.push(Arc::new(PlanNode::IndexScan(self.scan_node(
                entry,
                PushDownProperty::empty(),
                shape,
            ))));
        }
        debug!(branches = scans.len(), "planner.scan.union");
        Ok(Some(ScanChoice::fetched(PlanNode::UnionScan(MultiScan {
            scans,
            limit: None,
        }))))
    }

    fn build_primary_scan(
        &self,
        primaries: &[Arc<dyn Index>],
        unfiltered: bool,
        shape: &QueryShape<'_>,
    ) -> Result<ScanChoice, PlanError> {
        let Some(first) = primaries.first() else {
            return Err(PlanError::NoPrimaryIndex {
                keyspace: self.term.keyspace.name().to_owned(),
            });
        };
        let online = primaries.iter().find(|index| match index.state() {
            Ok((IndexState::Online, _)) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(index = index.name(), error = %err, "planner.index.state_failed");
                false
            }
        });
        let Some(index) = online else {
            return Err(PlanError::PrimaryIndexOffline {
                index: first.name().to_owned(),
            });
        };
        let name = index.name().to_owned();
        let Some(primary) = index.clone().as_primary() else {
            return Err(PlanError::IndexCast { index: name });
        };
        let mut push_down = PushDownProperty::empty();
        let (limit, offset) = pushed_window(shape, unfiltered, false, true, &mut push_down);
        debug!(index = %name, "planner.scan.primary");
        Ok(ScanChoice {
            node: PlanNode::PrimaryScan(PrimaryScanNode {
                term: self.term.clone(),
                index_name: name,
                index: primary,
                limit,
                offset,
                chunkable: shape.chunkable,
            }),
            fetch: true,
            cover: None,
            push_down,
            order_index: false,
        })
    }

    /// Plans the right-hand side of a NEST whose alias is this builder's
    /// term.
    pub fn build_nest(&self, nest: &NestClause) -> Result<PlanNode, PlanError> {
        let alias = self.alias().to_owned();
        let on = self.dnf.normalize(&nest.on);
        let lists = self.list_indexes()?;
        let secondaries: Vec<Arc<dyn Index>> =
            lists.all.into_iter().filter(|i| !i.is_primary()).collect();
        let scope = SargScope::join(&alias);
        let candidates = sargable_indexes(&secondaries, &on, scope, self.dnf);
        let minimal = minimal_indexes(&candidates, true, self.preference, self.pool);
        let mut entries: Vec<IndexEntry> = sorted_entries(&minimal).into_iter().cloned().collect();

        let key_lookup = primary_key_lookup(&on, &alias);
        if key_lookup.is_some() {
            let pk = Expr::meta_id(alias.as_str());
            entries.retain(|e| {
                // A lone META().id key without a condition spans the whole keyspace.
                let has_pk = e.sarg_keys.iter().any(|k| k.equivalent_to(&pk));
                let ok = has_pk && (e.sarg_keys.len() > 1 || e.cond.is_some());
                if !ok {
                    debug!(index = e.name(), "planner.nest.excluded_primary_join");
                }
                ok
            });
        }
        entries.retain_mut(|e| self.sarg_entry(e, &on, scope));

        if let Some(entry) = self.best_entry(entries) {
            let node = self.scan_node(
                entry,
                PushDownProperty::empty(),
                &QueryShape {
                    chunkable: true,
                    ..QueryShape::default()
                },
            );
            let child = PlanNode::Sequence(vec![
                Arc::new(PlanNode::IndexScan(node)),
                Arc::new(PlanNode::Fetch(FetchNode {
                    term: self.term.clone(),
                })),
            ]);
            return Ok(PlanNode::AnsiNest(AnsiNestNode {
                alias,
                on: nest.on.clone(),
                outer: nest.outer,
                child: Arc::new(child),
            }));
        }
        if let Some(keys) = key_lookup {
            let residual: Vec<Expr> = conjuncts(&on)
                .into_iter()
                .filter(|term| primary_key_lookup(term, &alias).is_none())
                .collect();
            return Ok(PlanNode::Nest(KeyNestNode {
                term: self.term.clone(),
                keys,
                on: if residual.is_empty() {
                    Expr::lit(true)
                } else {
                    Expr::and(residual)
                },
                outer: nest.outer,
            }));
        }
        Err(PlanError::NoIndexForNest { alias })
    }
}

/// ORDER BY served by the index order: ascending terms matching the leading
/// keys, a single span and no array key.
fn order_pushable(entry: &IndexEntry, order: &[OrderTerm]) -> bool {
    if entry.has_array_key() || order.len() > entry.keys.len() {
        return false;
    }
    if entry.spans.as_ref().is_some_and(|s| s.spans.len() > 1) {
        return false;
    }
    order
        .iter()
        .zip(&entry.keys)
        .all(|(term, key)| !term.descending && term.expr.equivalent_to(key))
}

fn limit_pushable(shape: &QueryShape<'_>, exact: bool, order_pushed: bool) -> bool {
    (shape.limit.is_some() || shape.offset.is_some())
        && exact
        && shape.group.is_none()
        && !shape.inner_nests
        && !shape.post_filter
        && (shape.order.is_empty() || order_pushed)
}

/// LIMIT/OFFSET a single scan can absorb. OFFSET is pushed only over one
/// span; otherwise it is folded into the limit and applied downstream.
fn pushed_window(
    shape: &QueryShape<'_>,
    exact: bool,
    order_pushed: bool,
    single_span: bool,
    push_down: &mut PushDownProperty,
) -> (Option<u64>, Option<u64>) {
    if !limit_pushable(shape, exact, order_pushed) {
        return (None, None);
    }
    match (shape.limit, shape.offset) {
        (Some(limit), Some(offset)) if single_span => {
            push_down.insert(PushDownProperty::LIMIT);
            push_down.insert(PushDownProperty::OFFSET);
            (Some(limit), Some(offset))
        }
        (Some(limit), Some(offset)) => {
            push_down.insert(PushDownProperty::LIMIT);
            (Some(offset_plus_limit(limit, offset)), None)
        }
        (Some(limit), None) => {
            push_down.insert(PushDownProperty::LIMIT);
            (Some(limit), None)
        }
        (None, Some(offset)) if single_span => {
            push_down.insert(PushDownProperty::OFFSET);
            (None, Some(offset))
        }
        _ => (None, None),
    }
}

/// GROUP BY over a leading key prefix with aggregates on index keys, on a
/// covering scan with exact spans.
fn group_push_down(entry: &IndexEntry, shape: &QueryShape<'_>) -> Option<IndexGroupPlan> {
    let group = shape.group?;
    if shape.has_nests || shape.post_filter || !entry.exact_spans || entry.has_array_key() {
        return None;
    }
    if group.keys.len() > entry.keys.len() {
        return None;
    }
    if !group
        .keys
        .iter()
        .zip(&entry.keys)
        .all(|(g, k)| g.equivalent_to(k))
    {
        return None;
    }
    let mut aggregates = Vec::with_capacity(group.aggregates.len());
    for agg in &group.aggregates {
        let key_pos = match &agg.operand {
            None if agg.func == AggFunc::Count => None,
            None => return None,
            Some(operand) => Some(entry.keys.iter().position(|k| k.equivalent_to(operand))?),
        };
        aggregates.push(IndexAggregate {
            func: agg.func,
            key_pos,
        });
    }
    Some(IndexGroupPlan {
        aggs: IndexGroupAggs {
            group_keys: (0..group.keys.len()).collect(),
            aggregates,
        },
        group_keys: group.keys.iter().map(ToString::to_string).collect(),
        aggregate_aliases: group.aggregates.iter().map(|a| a.alias.clone()).collect(),
    })
}

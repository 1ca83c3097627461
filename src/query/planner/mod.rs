//! Index selection and plan construction.
//!
//! The planner resolves the driving keyspace, normalises the WHERE clause,
//! picks a scan for the driving term (see [`scan`]), plans every NEST and
//! stacks the row operators on top. The resulting tree is immutable and is
//! returned together with its EXPLAIN rendering and a stable hash.

mod explain;
mod index_entry;
mod keyspace;
mod sarg;
mod scan;
mod select;
mod spans;

use std::sync::Arc;

use tracing::debug;

use crate::config::PlannerConfig;
use crate::datastore::Datastore;
use crate::query::aggregate::AggFunc;
use crate::query::ast::{AggregateTerm, OrderTerm, ResultTerm, SelectQuery};
use crate::query::builder::validate;
use crate::query::errors::PlanError;
use crate::query::expr::{Dnf, Expr};
use crate::query::physical::{FetchNode, GroupNode, PhysicalPlan, PlanNode, ScanTerm};
use crate::types::Result;

pub use explain::{explain_plan, ExplainNode, ExplainProp, PlanExplain};
pub use index_entry::{sorted_entries, IndexEntry, IndexMap, PushDownProperty};
pub use sarg::{sarg_for, sarg_for_filters, sargable_for, SargScope};
pub use scan::offset_plus_limit;
pub use select::{
    covering_index, minimal_indexes, narrower_or_equivalent, sargable_indexes, FilterCoversPool,
    IndexPreference, PooledCovers, SumKeysPreference,
};
pub use spans::{PlanSpan, SargSpans, SpanRange};

use keyspace::split_where;
use scan::{QueryShape, ScanBuilder, ScanChoice};

/// Output of the planner.
#[derive(Clone, Debug)]
pub struct PlannerOutput {
    /// The generated physical query plan
    pub plan: PhysicalPlan,
    /// Human-readable explain tree
    pub explain: PlanExplain,
    /// Deterministic plan hash for explain/caching.
    pub plan_hash: u64,
}

/// Query planner bound to a datastore.
#[derive(Debug)]
pub struct Planner {
    datastore: Arc<dyn Datastore>,
    config: PlannerConfig,
    dnf: Dnf,
    preference: Arc<dyn IndexPreference>,
    covers: FilterCoversPool,
}

impl Planner {
    /// Creates a new planner with the given configuration and datastore.
    pub fn new(config: PlannerConfig, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            dnf: Dnf::new(config.dnf_max_terms),
            config,
            preference: Arc::new(SumKeysPreference),
            covers: FilterCoversPool::default(),
        }
    }

    /// Replaces the comparator used to break ties between candidates.
    pub fn with_preference(mut self, preference: Arc<dyn IndexPreference>) -> Self {
        self.preference = preference;
        self
    }

    /// Scratch map pool shared by planning calls.
    pub fn covers_pool(&self) -> &FilterCoversPool {
        &self.covers
    }

    fn term(&self, keyspace: &str, alias: &str) -> Result<ScanTerm, PlanError> {
        let keyspace = self
            .datastore
            .keyspace(keyspace)
            .map_err(|_| PlanError::UnknownKeyspace {
                keyspace: keyspace.to_owned(),
            })?;
        Ok(ScanTerm {
            keyspace,
            alias: alias.to_owned(),
        })
    }

    fn builder(&self, term: ScanTerm) -> ScanBuilder<'_> {
        ScanBuilder {
            term,
            config: &self.config,
            dnf: &self.dnf,
            preference: self.preference.as_ref(),
            pool: &self.covers,
        }
    }

    /// Compiles a query into a physical plan.
    pub fn plan(&self, query: &SelectQuery) -> Result<PlannerOutput> {
        validate(query)?;
        let alias = query.from.alias.as_str();
        let term = self.term(&query.from.keyspace, alias)?;

        let normalized = query.filter.as_ref().map(|f| self.dnf.normalize(f));
        let filters = split_where(normalized.as_ref(), alias);

        let shape = query_shape(query, filters.scan.as_ref(), filters.post_nest.is_some());
        let choice = self.builder(term.clone()).build_scan(filters.scan.as_ref(), &shape)?;

        let mut nests = Vec::with_capacity(query.nests.len());
        for nest in &query.nests {
            let right = self.term(&nest.right.keyspace, &nest.right.alias)?;
            nests.push(Arc::new(self.builder(right).build_nest(nest)?));
        }

        let plan = self.compose(query, term, choice, filters.scan, filters.post_nest, nests);
        let explain = explain_plan(&plan);
        let plan_hash = explain.plan_hash;
        debug!(
            keyspace = %query.from.keyspace,
            plan_hash,
            ops = explain.root.ops().len(),
            "planner.plan.done"
        );
        Ok(PlannerOutput {
            plan,
            explain,
            plan_hash,
        })
    }

    fn compose(
        &self,
        query: &SelectQuery,
        term: ScanTerm,
        choice: ScanChoice,
        scan_filter: Option<Expr>,
        post_nest: Option<Expr>,
        nests: Vec<Arc<PlanNode>>,
    ) -> PhysicalPlan {
        let ScanChoice {
            node,
            fetch,
            cover,
            push_down,
            order_index,
        } = choice;
        let rewrite = |e: &Expr| match &cover {
            Some((keys, covers)) => e.rewrite_covers(keys, covers),
            None => e.clone(),
        };
        let group_pushed = push_down.contains(PushDownProperty::GROUP_AGGS);

        let mut ops = vec![Arc::new(node)];
        if fetch {
            ops.push(Arc::new(PlanNode::Fetch(FetchNode { term })));
        }

        let mut row_ops = Vec::new();
        if let Some(cond) = scan_filter.as_ref().filter(|_| !group_pushed) {
            row_ops.push(Arc::new(PlanNode::Filter {
                cond: rewrite(cond),
            }));
        }
        row_ops.extend(nests);
        if let Some(cond) = &post_nest {
            row_ops.push(Arc::new(PlanNode::Filter { cond: cond.clone() }));
        }
        if !row_ops.is_empty() {
            // Replicas would interleave rows an ordered scan already sorted.
            let max_parallelism = if order_index { 1 } else { self.config.max_parallelism };
            ops.push(Arc::new(PlanNode::Parallel {
                child: Arc::new(PlanNode::Sequence(row_ops)),
                max_parallelism,
            }));
        }

        if let Some(group) = query.group.as_ref().filter(|_| !group_pushed) {
            ops.push(Arc::new(PlanNode::Group(GroupNode {
                keys: group.keys.iter().map(&rewrite).collect(),
                aggregates: group
                    .aggregates
                    .iter()
                    .map(|a| AggregateTerm {
                        func: a.func,
                        operand: a.operand.as_ref().map(&rewrite),
                        alias: a.alias.clone(),
                    })
                    .collect(),
            })));
        }
        if !query.order.is_empty() && !push_down.contains(PushDownProperty::ORDER) {
            ops.push(Arc::new(PlanNode::Order {
                terms: query
                    .order
                    .iter()
                    .map(|t| OrderTerm {
                        expr: rewrite(&t.expr),
                        descending: t.descending,
                    })
                    .collect(),
            }));
        }
        if let Some(offset) = query.offset {
            if !push_down.contains(PushDownProperty::OFFSET) {
                ops.push(Arc::new(PlanNode::Offset { offset }));
            }
        }
        if let Some(limit) = query.limit {
            ops.push(Arc::new(PlanNode::Limit { limit }));
        }
        if !query.projection.is_empty() {
            ops.push(Arc::new(PlanNode::Project {
                terms: query
                    .projection
                    .iter()
                    .map(|t| ResultTerm {
                        expr: rewrite(&t.expr),
                        alias: t.alias.clone(),
                    })
                    .collect(),
            }));
        }
        PhysicalPlan::new(PlanNode::Sequence(ops))
    }
}

/// Facts about the query that decide push-downs and covering.
fn query_shape<'q>(query: &'q SelectQuery, scan_filter: Option<&Expr>, post_filter: bool) -> QueryShape<'q> {
    let alias = query.from.alias.as_str();
    let mut exprs: Vec<Expr> = scan_filter.into_iter().cloned().collect();
    if query.projection.is_empty() {
        exprs.push(Expr::ident(alias));
    }
    exprs.extend(query.projection.iter().map(|t| t.expr.clone()));
    exprs.extend(query.order.iter().map(|t| t.expr.clone()));
    if let Some(group) = &query.group {
        exprs.extend(group.keys.iter().cloned());
        exprs.extend(group.aggregates.iter().filter_map(|a| a.operand.clone()));
    }
    // Projections of aggregate results reference no document field.
    exprs.retain(|e| !matches!(e, Expr::Aggregate(_)));

    let count_only = match &query.group {
        Some(group)
            if scan_filter.is_none()
                && !post_filter
                && query.nests.is_empty()
                && group.keys.is_empty()
                && !group.aggregates.is_empty()
                && group
                    .aggregates
                    .iter()
                    .all(|a| a.func == AggFunc::Count && a.operand.is_none()) =>
        {
            Some(group.aggregates.iter().map(|a| a.alias.clone()).collect())
        }
        _ => None,
    };

    QueryShape {
        order: &query.order,
        offset: query.offset,
        limit: query.limit,
        group: query.group.as_ref(),
        has_nests: !query.nests.is_empty(),
        inner_nests: query.has_inner_nest(),
        post_filter,
        exprs,
        chunkable: query.order.is_empty() && query.offset.is_none() && query.group.is_none(),
        count_only,
    }
}

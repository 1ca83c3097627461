//! Physical operator tree selected by the planner.
//!
//! Plan nodes form a closed set; the executor dispatches on the variant.
//! Every node is immutable once planning completes and is shared by all
//! operator instances (including data-parallel replicas) through `Arc`.

use std::fmt;
use std::sync::Arc;

use crate::datastore::{Index, IndexGroupAggs, Keyspace, PrimaryIndex};
use crate::query::ast::{AggregateTerm, OrderTerm, ResultTerm};
use crate::query::expr::Expr;
use crate::query::planner::{PushDownProperty, SargSpans};
use crate::query::value::Value;

/// Physical plan produced by the planner.
#[derive(Clone, Debug)]
pub struct PhysicalPlan {
    /// The root node of the physical plan tree.
    pub root: Arc<PlanNode>,
}

impl PhysicalPlan {
    /// Creates a new physical plan with the given root node.
    pub fn new(root: PlanNode) -> Self {
        Self {
            root: Arc::new(root),
        }
    }
}

/// Keyspace term a scan or fetch reads from.
#[derive(Clone)]
pub struct ScanTerm {
    /// Keyspace handle.
    pub keyspace: Arc<dyn Keyspace>,
    /// Alias items are bound to.
    pub alias: String,
}

impl fmt::Debug for ScanTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTerm")
            .field("keyspace", &self.keyspace.name())
            .field("alias", &self.alias)
            .finish()
    }
}

/// Full scan of a primary index.
#[derive(Clone)]
pub struct PrimaryScanNode {
    /// Term being scanned.
    pub term: ScanTerm,
    /// Primary index name.
    pub index_name: String,
    /// Primary scan capability.
    pub index: Arc<dyn PrimaryIndex>,
    /// Pushed LIMIT.
    pub limit: Option<u64>,
    /// Pushed OFFSET.
    pub offset: Option<u64>,
    /// A timed-out scan may restart from the last delivered key.
    pub chunkable: bool,
}

impl fmt::Debug for PrimaryScanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryScanNode")
            .field("term", &self.term)
            .field("index", &self.index_name)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Values a covering scan supplies in place of the document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoverSpec {
    /// Text of each index key, by key position.
    pub keys: Vec<String>,
    /// Equality facts implied by the index condition.
    pub filter_covers: Vec<(String, Value)>,
}

/// Group and aggregate evaluation pushed into an index scan.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexGroupPlan {
    /// Request sent to the index.
    pub aggs: IndexGroupAggs,
    /// Text of each group key, covered on the emitted item.
    pub group_keys: Vec<String>,
    /// Alias of each pushed aggregate.
    pub aggregate_aliases: Vec<String>,
}

/// Range scan of a secondary (or primary) index.
#[derive(Clone)]
pub struct IndexScanNode {
    /// Term being scanned.
    pub term: ScanTerm,
    /// Index handle.
    pub index: Arc<dyn Index>,
    /// Spans; bounds may reference the outer item.
    pub spans: SargSpans,
    /// Remove duplicate document keys.
    pub distinct: bool,
    /// Pushed LIMIT.
    pub limit: Option<u64>,
    /// Pushed OFFSET.
    pub offset: Option<u64>,
    /// Clauses absorbed by this scan.
    pub push_down: PushDownProperty,
    /// Present for covering scans.
    pub cover: Option<CoverSpec>,
    /// Present when GROUP BY runs inside the index.
    pub group: Option<IndexGroupPlan>,
    /// A timed-out scan may restart from the last delivered key.
    pub chunkable: bool,
}

impl fmt::Debug for IndexScanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexScanNode")
            .field("term", &self.term)
            .field("index", &self.index.name())
            .field("spans", &self.spans.to_string())
            .field("distinct", &self.distinct)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("push_down", &self.push_down)
            .field("covering", &self.cover.is_some())
            .finish()
    }
}

/// Branches of an intersect or union scan.
#[derive(Clone, Debug)]
pub struct MultiScan {
    /// Child scans; for ordered intersection, branch 0 drives the order.
    pub scans: Vec<Arc<PlanNode>>,
    /// Stop after this many results.
    pub limit: Option<u64>,
}

/// Document fetch by key.
#[derive(Clone, Debug)]
pub struct FetchNode {
    /// Term whose documents are fetched.
    pub term: ScanTerm,
}

/// `NEST` driven by an index scan on the right-hand keyspace.
#[derive(Clone, Debug)]
pub struct AnsiNestNode {
    /// Alias of the nested term.
    pub alias: String,
    /// Full ON clause, evaluated on every right-hand item.
    pub on: Expr,
    /// Keep left rows without matches.
    pub outer: bool,
    /// Right-hand subplan, run once per left row.
    pub child: Arc<PlanNode>,
}

/// `NEST` by document key lookup.
#[derive(Clone, Debug)]
pub struct KeyNestNode {
    /// Right-hand term.
    pub term: ScanTerm,
    /// Evaluates (against the left row) to a key or an array of keys.
    pub keys: Expr,
    /// ON terms other than the key lookup, tested per fetched document.
    pub on: Expr,
    /// Keep left rows without matches.
    pub outer: bool,
}

/// GROUP BY evaluated by the executor.
#[derive(Clone, Debug)]
pub struct GroupNode {
    /// Group key expressions.
    pub keys: Vec<Expr>,
    /// Aggregates to compute.
    pub aggregates: Vec<AggregateTerm>,
}

/// Physical operators.
#[derive(Clone, Debug)]
pub enum PlanNode {
    /// Emits one item (scoped under the outer item, if any).
    DummyScan,
    /// Emits one item holding the keyspace document count.
    CountScan {
        /// Term counted.
        term: ScanTerm,
        /// Aggregate aliases the count is stored under.
        aggregates: Vec<String>,
    },
    /// Full primary index scan.
    PrimaryScan(PrimaryScanNode),
    /// Secondary index range scan.
    IndexScan(IndexScanNode),
    /// Keys produced by every branch.
    IntersectScan(MultiScan),
    /// Intersection in branch-0 order.
    OrderedIntersectScan(MultiScan),
    /// Keys produced by any branch.
    UnionScan(MultiScan),
    /// Fetches documents for scanned keys.
    Fetch(FetchNode),
    /// Drops items failing the condition.
    Filter {
        /// Condition.
        cond: Expr,
    },
    /// Index-driven nest.
    AnsiNest(AnsiNestNode),
    /// Key-lookup nest.
    Nest(KeyNestNode),
    /// Grouping and aggregation.
    Group(GroupNode),
    /// Sorts all input.
    Order {
        /// Sort terms.
        terms: Vec<OrderTerm>,
    },
    /// Skips leading items.
    Offset {
        /// Items to skip.
        offset: u64,
    },
    /// Stops after a number of items.
    Limit {
        /// Items to pass.
        limit: u64,
    },
    /// Builds result objects.
    Project {
        /// Result columns.
        terms: Vec<ResultTerm>,
    },
    /// Runs children as a pipeline.
    Sequence(Vec<Arc<PlanNode>>),
    /// Runs copies of the child draining a shared input.
    Parallel {
        /// Replicated subplan.
        child: Arc<PlanNode>,
        /// Replica count.
        max_parallelism: usize,
    },
}

impl PlanNode {
    /// Operator name used by EXPLAIN and logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            PlanNode::DummyScan => "DummyScan",
            PlanNode::CountScan { .. } => "CountScan",
            PlanNode::PrimaryScan(_) => "PrimaryScan",
            PlanNode::IndexScan(node) if node.cover.is_some() => "IndexScan(covering)",
            PlanNode::IndexScan(_) => "IndexScan",
            PlanNode::IntersectScan(_) => "IntersectScan",
            PlanNode::OrderedIntersectScan(_) => "OrderedIntersectScan",
            PlanNode::UnionScan(_) => "UnionScan",
            PlanNode::Fetch(_) => "Fetch",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::AnsiNest(_) => "AnsiNest",
            PlanNode::Nest(_) => "Nest",
            PlanNode::Group(_) => "Group",
            PlanNode::Order { .. } => "Order",
            PlanNode::Offset { .. } => "Offset",
            PlanNode::Limit { .. } => "Limit",
            PlanNode::Project { .. } => "Project",
            PlanNode::Sequence(_) => "Sequence",
            PlanNode::Parallel { .. } => "Parallel",
        }
    }

    /// Child plans, in execution order.
    pub fn children(&self) -> Vec<&Arc<PlanNode>> {
        match self {
            PlanNode::IntersectScan(m)
            | PlanNode::OrderedIntersectScan(m)
            | PlanNode::UnionScan(m) => m.scans.iter().collect(),
            PlanNode::AnsiNest(n) => vec![&n.child],
            PlanNode::Sequence(children) => children.iter().collect(),
            PlanNode::Parallel { child, .. } => vec![child],
            _ => Vec::new(),
        }
    }

    /// True for nodes that produce items without consuming input.
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            PlanNode::DummyScan
                | PlanNode::CountScan { .. }
                | PlanNode::PrimaryScan(_)
                | PlanNode::IndexScan(_)
                | PlanNode::IntersectScan(_)
                | PlanNode::OrderedIntersectScan(_)
                | PlanNode::UnionScan(_)
        )
    }

    /// Depth-first search for the first node matching `pred`.
    pub fn find(&self, pred: &dyn Fn(&PlanNode) -> bool) -> Option<&PlanNode> {
        if pred(self) {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find(pred))
    }
}

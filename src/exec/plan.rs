//! Bound physical plans: the contract between the (external) binder and
//! the execution core. Every reference is already resolved to catalog
//! ids, column positions, and value types.

use crate::types::{Direction, TableId};
use crate::vector::{LogicalType, Value};

/// Typed expression over the columns of the operator's input chunk.
#[derive(Clone, Debug)]
pub enum BoundExpr {
    /// Input column by position.
    Column(usize),
    Literal(Value),
    /// Named statement parameter, substituted at execute time.
    Parameter(String),
    /// Scalar function application, resolved against the registry by
    /// `(name, argument types)` when the plan is instantiated.
    Call {
        name: String,
        args: Vec<BoundExpr>,
        /// Binder-resolved result type for functions whose registry
        /// signature cannot express it: extraction from an untyped LIST
        /// returns the element type, which only the binder knows. `None`
        /// falls back to the registered result type, with the output
        /// vector re-tagged from the produced values when the function
        /// is registered dynamic.
        result: Option<LogicalType>,
    },
}

impl BoundExpr {
    pub fn call(name: &str, args: Vec<BoundExpr>) -> Self {
        BoundExpr::Call {
            name: name.to_string(),
            args,
            result: None,
        }
    }

    /// A call with its result type pinned by the binder.
    pub fn call_returning(name: &str, args: Vec<BoundExpr>, result: LogicalType) -> Self {
        BoundExpr::Call {
            name: name.to_string(),
            args,
            result: Some(result),
        }
    }
}

#[derive(Clone, Debug)]
pub enum AggregateSpec {
    /// `count(*)`; counts input multiplicity.
    CountStar,
    Count { arg: BoundExpr, distinct: bool },
    Sum { arg: BoundExpr, distinct: bool },
    Min { arg: BoundExpr },
    Max { arg: BoundExpr },
    Avg { arg: BoundExpr, distinct: bool },
}

/// What the recursive join materializes per reached destination.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PathEmission {
    /// Each destination once per length.
    DstOnly,
    /// Each destination repeated by its path multiplicity.
    DstWithMultiplicity,
    /// Full `(node, rel, node, …)` tuples.
    Paths,
}

#[derive(Clone, Debug)]
pub enum BoundPlan {
    /// Scans a node table, emitting the node id column followed by the
    /// requested property columns. Morsel-parallel source.
    ScanNodes {
        table: TableId,
        /// Property column positions to project after the id column.
        columns: Vec<usize>,
    },
    /// Scans a rel table without a node anchor by walking the adjacency
    /// lists of its bound nodes in `direction`. Emits src-id, dst-id,
    /// and rel-id columns followed by the requested property columns;
    /// either direction yields the same rel multiset. Morsel-parallel
    /// over the bound node offsets.
    ScanRels {
        table: TableId,
        direction: Direction,
        columns: Vec<usize>,
    },
    /// Expands adjacency from an id column, appending neighbor-id and
    /// rel-id columns.
    Expand {
        child: Box<BoundPlan>,
        from_column: usize,
        rel_table: TableId,
        direction: Direction,
    },
    Filter {
        child: Box<BoundPlan>,
        predicate: BoundExpr,
    },
    Project {
        child: Box<BoundPlan>,
        exprs: Vec<BoundExpr>,
    },
    /// Pipeline breaker: group-by plus aggregates. Output columns are
    /// the group expressions followed by one column per aggregate.
    Aggregate {
        child: Box<BoundPlan>,
        groups: Vec<BoundExpr>,
        aggregates: Vec<AggregateSpec>,
    },
    /// Hash join; the right child is the build side. Output columns are
    /// the probe columns followed by the build columns.
    HashJoin {
        probe: Box<BoundPlan>,
        build: Box<BoundPlan>,
        probe_key: usize,
        build_key: usize,
    },
    /// Variable-length recursive extension `[*lower..upper]` from an id
    /// column. Appends a destination-id column, a path column (LIST, for
    /// `Paths` emission) and a path-length column.
    RecursiveExtend {
        child: Box<BoundPlan>,
        from_column: usize,
        rel_table: TableId,
        direction: Direction,
        lower: u64,
        upper: u64,
        emit: PathEmission,
        /// Restricts reachable destinations; empty means every node.
        target_mask: Vec<u64>,
    },
    Limit {
        child: Box<BoundPlan>,
        count: u64,
    },
}

impl BoundPlan {
    pub fn filter(self, predicate: BoundExpr) -> Self {
        BoundPlan::Filter {
            child: Box::new(self),
            predicate,
        }
    }

    pub fn project(self, exprs: Vec<BoundExpr>) -> Self {
        BoundPlan::Project {
            child: Box::new(self),
            exprs,
        }
    }

    pub fn aggregate(self, groups: Vec<BoundExpr>, aggregates: Vec<AggregateSpec>) -> Self {
        BoundPlan::Aggregate {
            child: Box::new(self),
            groups,
            aggregates,
        }
    }

    pub fn limit(self, count: u64) -> Self {
        BoundPlan::Limit {
            child: Box::new(self),
            count,
        }
    }
}

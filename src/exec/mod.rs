//! Vectorized, pull-based execution.
//!
//! A bound plan is *prepared* into an executable tree: pipeline breakers
//! (aggregate, hash-join build, limit) run eagerly at prepare time and
//! leave a materialized source behind, so what remains is a streaming
//! chain from one source to the sink. Each worker instantiates its own
//! copy of the chain (operators exclusively own their children) and
//! pulls batches; sources are shared through morsel dispensers, breaker
//! state through reference-counted handles. The interrupt flag is polled
//! at every morsel boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{QuiverError, Result};
use crate::function::FunctionRegistry;
use crate::storage::TableSet;
use crate::transaction::Transaction;
use crate::types::{Direction, TableId, VECTOR_CAPACITY};
use crate::vector::{LogicalType, Value};

pub mod aggregate;
pub mod expr;
pub mod hash_join;
pub mod operators;
pub mod plan;
pub mod recursive_join;

use aggregate::{AggFunction, AggregateHashTable};
use expr::CompiledExpr;
use hash_join::JoinTable;
use plan::{AggregateSpec, BoundExpr, BoundPlan, PathEmission};

/// Rows per morsel handed to a worker.
pub const MORSEL_SIZE: u64 = VECTOR_CAPACITY as u64;

/// Per-execution state shared by every operator.
pub struct ExecContext {
    pub tx: Arc<Transaction>,
    pub tables: Arc<TableSet>,
    pub registry: Arc<FunctionRegistry>,
    pub interrupt: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(QuiverError::Interrupted);
        }
        Ok(())
    }
}

/// Splits a dense offset range into morsels.
pub struct MorselDispenser {
    next: AtomicU64,
    total: u64,
}

impl MorselDispenser {
    pub fn new(total: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            total,
        }
    }

    pub fn next_morsel(&self) -> Option<(u64, u64)> {
        loop {
            let start = self.next.load(Ordering::Relaxed);
            if start >= self.total {
                return None;
            }
            let count = MORSEL_SIZE.min(self.total - start);
            if self
                .next
                .compare_exchange(start, start + count, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some((start, count));
            }
        }
    }
}

/// Materialized rows acting as a shared pipeline source.
pub struct MaterializedSource {
    pub types: Vec<LogicalType>,
    pub rows: Vec<Vec<Value>>,
    cursor: AtomicUsize,
}

impl MaterializedSource {
    pub fn new(types: Vec<LogicalType>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            types,
            rows,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_batch(&self) -> Option<&[Vec<Value>]> {
        loop {
            let start = self.cursor.load(Ordering::Relaxed);
            if start >= self.rows.len() {
                return None;
            }
            let end = (start + VECTOR_CAPACITY).min(self.rows.len());
            if self
                .cursor
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(&self.rows[start..end]);
            }
        }
    }
}

/// Prepared executable plan: breakers already evaluated, sources shared.
pub enum ExecPlan {
    ScanNodes {
        table: TableId,
        columns: Vec<usize>,
        dispenser: Arc<MorselDispenser>,
        types: Vec<LogicalType>,
    },
    ScanRels {
        table: TableId,
        direction: Direction,
        columns: Vec<usize>,
        /// Morsels over the bound node offsets of `direction`.
        dispenser: Arc<MorselDispenser>,
        types: Vec<LogicalType>,
    },
    Materialized {
        source: Arc<MaterializedSource>,
    },
    Expand {
        child: Box<ExecPlan>,
        rel_table: TableId,
        direction: Direction,
        from_column: usize,
        types: Vec<LogicalType>,
    },
    Filter {
        child: Box<ExecPlan>,
        predicate: Arc<CompiledExpr>,
    },
    Project {
        child: Box<ExecPlan>,
        exprs: Arc<Vec<CompiledExpr>>,
        types: Vec<LogicalType>,
    },
    HashJoinProbe {
        child: Box<ExecPlan>,
        table: Arc<JoinTable>,
        probe_key: usize,
        types: Vec<LogicalType>,
    },
    RecursiveExtend {
        child: Box<ExecPlan>,
        rel_table: TableId,
        direction: Direction,
        from_column: usize,
        lower: u64,
        upper: u64,
        emit: PathEmission,
        target_mask: Arc<Vec<u64>>,
        types: Vec<LogicalType>,
    },
}

impl ExecPlan {
    pub fn output_types(&self) -> &[LogicalType] {
        match self {
            ExecPlan::ScanNodes { types, .. } => types,
            ExecPlan::ScanRels { types, .. } => types,
            ExecPlan::Materialized { source } => &source.types,
            ExecPlan::Expand { types, .. } => types,
            ExecPlan::Filter { child, .. } => child.output_types(),
            ExecPlan::Project { types, .. } => types,
            ExecPlan::HashJoinProbe { types, .. } => types,
            ExecPlan::RecursiveExtend { types, .. } => types,
        }
    }
}

/// Materialized query output.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub types: Vec<LogicalType>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Executes a bound plan with up to `num_workers` parallel workers.
pub fn execute(
    plan: &BoundPlan,
    ctx: &ExecContext,
    num_workers: usize,
    params: &std::collections::HashMap<String, Value>,
) -> Result<QueryResult> {
    let prepared = prepare(plan, ctx, num_workers, params)?;
    let types = prepared.output_types().to_vec();
    let rows = run_to_rows(&prepared, ctx, num_workers)?;
    debug!(rows = rows.len(), "query execution finished");
    Ok(QueryResult { types, rows })
}

/// Lowers a bound plan to an executable one, running every pipeline
/// breaker it contains.
fn prepare(
    plan: &BoundPlan,
    ctx: &ExecContext,
    num_workers: usize,
    params: &std::collections::HashMap<String, Value>,
) -> Result<ExecPlan> {
    match plan {
        BoundPlan::ScanNodes { table, columns } => {
            let node_table = ctx.tables.node_table(*table)?;
            let mut types = vec![LogicalType::InternalId];
            for &column in columns {
                types.push(node_table.column(column).ty().clone());
            }
            let total = node_table.num_nodes(ctx.tx.kind());
            Ok(ExecPlan::ScanNodes {
                table: *table,
                columns: columns.clone(),
                dispenser: Arc::new(MorselDispenser::new(total)),
                types,
            })
        }
        BoundPlan::ScanRels {
            table,
            direction,
            columns,
        } => {
            let rel_table = ctx.tables.rel_table(*table)?;
            let mut types = vec![
                LogicalType::InternalId,
                LogicalType::InternalId,
                LogicalType::InternalId,
            ];
            for &column in columns {
                types.push(rel_table.column(column).ty().clone());
            }
            let bound_table = match direction {
                Direction::Fwd => rel_table.src_table(),
                Direction::Bwd => rel_table.dst_table(),
            };
            let total = ctx.tables.node_table(bound_table)?.num_nodes(ctx.tx.kind());
            Ok(ExecPlan::ScanRels {
                table: *table,
                direction: *direction,
                columns: columns.clone(),
                dispenser: Arc::new(MorselDispenser::new(total)),
                types,
            })
        }
        BoundPlan::Expand {
            child,
            from_column,
            rel_table,
            direction,
        } => {
            let child = prepare(child, ctx, num_workers, params)?;
            let mut types = child.output_types().to_vec();
            require_id_column(&types, *from_column)?;
            types.push(LogicalType::InternalId);
            types.push(LogicalType::InternalId);
            Ok(ExecPlan::Expand {
                child: Box::new(child),
                rel_table: *rel_table,
                direction: *direction,
                from_column: *from_column,
                types,
            })
        }
        BoundPlan::Filter { child, predicate } => {
            let child = prepare(child, ctx, num_workers, params)?;
            let (compiled, ty) = expr::compile(predicate, child.output_types(), &ctx.registry, params)?;
            if ty != LogicalType::Bool {
                return Err(QuiverError::Binder(format!(
                    "filter predicate must be BOOL, found {ty}"
                )));
            }
            Ok(ExecPlan::Filter {
                child: Box::new(child),
                predicate: Arc::new(compiled),
            })
        }
        BoundPlan::Project { child, exprs } => {
            let child = prepare(child, ctx, num_workers, params)?;
            let mut compiled = Vec::with_capacity(exprs.len());
            let mut types = Vec::with_capacity(exprs.len());
            for expr in exprs {
                let (c, ty) = expr::compile(expr, child.output_types(), &ctx.registry, params)?;
                compiled.push(c);
                types.push(ty);
            }
            Ok(ExecPlan::Project {
                child: Box::new(child),
                exprs: Arc::new(compiled),
                types,
            })
        }
        BoundPlan::Aggregate {
            child,
            groups,
            aggregates,
        } => {
            let prepared_child = prepare(child, ctx, num_workers, params)?;
            let source = run_aggregate(&prepared_child, groups, aggregates, ctx, num_workers, params)?;
            Ok(ExecPlan::Materialized {
                source: Arc::new(source),
            })
        }
        BoundPlan::HashJoin {
            probe,
            build,
            probe_key,
            build_key,
        } => {
            let build_plan = prepare(build, ctx, num_workers, params)?;
            let build_types = build_plan.output_types().to_vec();
            require_column(&build_types, *build_key)?;
            let build_rows = run_to_rows(&build_plan, ctx, num_workers)?;
            let table = JoinTable::build(build_types, build_rows, *build_key)?;

            let child = prepare(probe, ctx, num_workers, params)?;
            require_column(child.output_types(), *probe_key)?;
            let mut types = child.output_types().to_vec();
            types.extend(table.payload_types().iter().cloned());
            Ok(ExecPlan::HashJoinProbe {
                child: Box::new(child),
                table: Arc::new(table),
                probe_key: *probe_key,
                types,
            })
        }
        BoundPlan::RecursiveExtend {
            child,
            from_column,
            rel_table,
            direction,
            lower,
            upper,
            emit,
            target_mask,
        } => {
            if lower > upper {
                return Err(QuiverError::Binder(format!(
                    "invalid recursive bounds {lower}..{upper}"
                )));
            }
            let child = prepare(child, ctx, num_workers, params)?;
            let mut types = child.output_types().to_vec();
            require_id_column(&types, *from_column)?;
            types.push(LogicalType::InternalId);
            if *emit == PathEmission::Paths {
                types.push(LogicalType::List);
            }
            types.push(LogicalType::Int64);
            Ok(ExecPlan::RecursiveExtend {
                child: Box::new(child),
                rel_table: *rel_table,
                direction: *direction,
                from_column: *from_column,
                lower: *lower,
                upper: *upper,
                emit: *emit,
                target_mask: Arc::new(target_mask.clone()),
                types,
            })
        }
        BoundPlan::Limit { child, count } => {
            let prepared = prepare(child, ctx, num_workers, params)?;
            let types = prepared.output_types().to_vec();
            let mut rows = run_to_rows(&prepared, ctx, num_workers)?;
            rows.truncate(*count as usize);
            Ok(ExecPlan::Materialized {
                source: Arc::new(MaterializedSource::new(types, rows)),
            })
        }
    }
}

fn require_column(types: &[LogicalType], idx: usize) -> Result<()> {
    if idx >= types.len() {
        return Err(QuiverError::Binder(format!("column {idx} out of range")));
    }
    Ok(())
}

fn require_id_column(types: &[LogicalType], idx: usize) -> Result<()> {
    require_column(types, idx)?;
    if types[idx] != LogicalType::InternalId {
        return Err(QuiverError::Binder(format!(
            "column {idx} is not a node id column"
        )));
    }
    Ok(())
}

/// Drives one streaming pipeline into a row sink with a bounded worker
/// pool. Every worker instantiates its own operator chain; the sink
/// merges under a mutex.
fn run_to_rows(plan: &ExecPlan, ctx: &ExecContext, num_workers: usize) -> Result<Vec<Vec<Value>>> {
    let sink: Mutex<Vec<Vec<Value>>> = Mutex::new(Vec::new());
    let error: Mutex<Option<QuiverError>> = Mutex::new(None);
    let workers = num_workers.max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let result = drive_worker(plan, ctx, &sink);
                if let Err(err) = result {
                    let mut slot = error.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    // Tell the other workers to stop at their next morsel.
                    ctx.interrupt.store(true, Ordering::Relaxed);
                }
            });
        }
    });

    if let Some(err) = error.into_inner() {
        // Interrupt raised by a failing sibling is not the root cause.
        return Err(err);
    }
    Ok(sink.into_inner())
}

fn drive_worker(plan: &ExecPlan, ctx: &ExecContext, sink: &Mutex<Vec<Vec<Value>>>) -> Result<()> {
    let mut root = operators::instantiate(plan, ctx)?;
    while let Some(chunk) = root.next(ctx)? {
        let mut rows: Vec<Vec<Value>> = Vec::with_capacity(chunk.cardinality());
        for pos in chunk.state.selected() {
            rows.push(chunk.row(pos));
        }
        sink.lock().append(&mut rows);
    }
    Ok(())
}

/// Parallel aggregate build: worker-local tables merged serially, then
/// finalized into a materialized source.
fn run_aggregate(
    child: &ExecPlan,
    groups: &[BoundExpr],
    aggregates: &[AggregateSpec],
    ctx: &ExecContext,
    num_workers: usize,
    params: &std::collections::HashMap<String, Value>,
) -> Result<MaterializedSource> {
    let input_types = child.output_types().to_vec();
    let mut group_exprs = Vec::with_capacity(groups.len());
    let mut group_types = Vec::with_capacity(groups.len());
    for group in groups {
        let (compiled, ty) = expr::compile(group, &input_types, &ctx.registry, params)?;
        group_exprs.push(compiled);
        group_types.push(ty);
    }
    let mut agg_exprs: Vec<Option<CompiledExpr>> = Vec::with_capacity(aggregates.len());
    let mut agg_functions = Vec::with_capacity(aggregates.len());
    for spec in aggregates {
        let arg = match spec {
            AggregateSpec::CountStar => None,
            AggregateSpec::Count { arg, .. }
            | AggregateSpec::Sum { arg, .. }
            | AggregateSpec::Min { arg }
            | AggregateSpec::Max { arg }
            | AggregateSpec::Avg { arg, .. } => Some(arg),
        };
        match arg {
            None => {
                agg_exprs.push(None);
                agg_functions.push(AggFunction::from_spec(spec, None));
            }
            Some(arg) => {
                let (compiled, ty) = expr::compile(arg, &input_types, &ctx.registry, params)?;
                agg_exprs.push(Some(compiled));
                agg_functions.push(AggFunction::from_spec(spec, Some(ty)));
            }
        }
    }

    let merged: Mutex<AggregateHashTable> = Mutex::new(AggregateHashTable::new(
        group_types.clone(),
        agg_functions.clone(),
    ));
    let error: Mutex<Option<QuiverError>> = Mutex::new(None);
    let workers = num_workers.max(1);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let result = (|| -> Result<()> {
                    let mut local =
                        AggregateHashTable::new(group_types.clone(), agg_functions.clone());
                    let mut root = operators::instantiate(child, ctx)?;
                    while let Some(chunk) = root.next(ctx)? {
                        let positions = chunk.state.selected();
                        let key_vectors = group_exprs
                            .iter()
                            .map(|e| expr::evaluate(e, &chunk))
                            .collect::<Result<Vec<_>>>()?;
                        let arg_vectors = agg_exprs
                            .iter()
                            .map(|e| e.as_ref().map(|e| expr::evaluate(e, &chunk)).transpose())
                            .collect::<Result<Vec<_>>>()?;
                        let key_refs: Vec<_> = key_vectors.iter().collect();
                        let arg_refs: Vec<_> = arg_vectors.iter().map(|v| v.as_ref()).collect();
                        local.append(&key_refs, &arg_refs, &positions, 1)?;
                    }
                    merged.lock().merge(local)?;
                    Ok(())
                })();
                if let Err(err) = result {
                    let mut slot = error.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    ctx.interrupt.store(true, Ordering::Relaxed);
                }
            });
        }
    });

    if let Some(err) = error.into_inner() {
        return Err(err);
    }

    let table = merged.into_inner();
    let mut rows = Vec::with_capacity(table.num_entries());
    // No groups means one global group, even over empty input.
    if groups.is_empty() && table.num_entries() == 0 {
        let mut row = Vec::new();
        for function in &agg_functions {
            row.push(match function.kind {
                aggregate::AggKind::CountStar | aggregate::AggKind::Count => Value::Int64(0),
                _ => Value::Null,
            });
        }
        rows.push(row);
    } else {
        for (keys, results) in table.finalize()? {
            let mut row = keys;
            row.extend(results);
            rows.push(row);
        }
    }

    let mut types = group_types;
    for function in &agg_functions {
        types.push(function.result_type());
    }
    Ok(MaterializedSource::new(types, rows))
}

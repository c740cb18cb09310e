//! Physical operator instances.
//!
//! Parents pull batches from the children they own until the source runs
//! dry. Contracts: every operator here consumes and produces *unflat*
//! chunks; single-row binding happens inside the expand and recursive
//! operators, which iterate their input positions one at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{QuiverError, Result};
use crate::exec::expr::{self, CompiledExpr};
use crate::exec::hash_join::JoinTable;
use crate::exec::plan::PathEmission;
use crate::exec::recursive_join::{
    BfsState, DstNodeScanner, DstNodeWithMultiplicityScanner, FrontierScanner, FrontiersScanner,
    PathRow, PathScanner, TargetMask,
};
use crate::exec::{ExecContext, ExecPlan, MaterializedSource, MorselDispenser};
use crate::storage::{NodeTable, RelTable};
use crate::types::{Direction, TableId, VECTOR_CAPACITY};
use crate::vector::{ChunkState, DataChunk, LogicalType, Value};

pub trait Operator {
    /// Pulls the next batch; `None` when the source is exhausted.
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>>;
}

/// Builds this worker's instance of the operator chain.
pub fn instantiate<'p>(plan: &'p ExecPlan, ctx: &ExecContext) -> Result<Box<dyn Operator + 'p>> {
    Ok(match plan {
        ExecPlan::ScanNodes {
            table,
            columns,
            dispenser,
            types,
        } => Box::new(ScanNodesOp {
            table: ctx.tables.node_table(*table)?,
            table_id: *table,
            columns: columns.clone(),
            dispenser: Arc::clone(dispenser),
            types: types.clone(),
        }),
        ExecPlan::ScanRels {
            table,
            direction,
            columns,
            dispenser,
            types,
        } => Box::new(ScanRelsOp {
            rel: ctx.tables.rel_table(*table)?,
            rel_table: *table,
            direction: *direction,
            columns: columns.clone(),
            dispenser: Arc::clone(dispenser),
            types: types.clone(),
            queue: VecDeque::new(),
        }),
        ExecPlan::Materialized { source } => Box::new(MaterializedScanOp {
            source: Arc::clone(source),
        }),
        ExecPlan::Expand {
            child,
            rel_table,
            direction,
            from_column,
            types,
        } => Box::new(ExpandOp {
            child: instantiate(child, ctx)?,
            rel: ctx.tables.rel_table(*rel_table)?,
            rel_table: *rel_table,
            direction: *direction,
            from_column: *from_column,
            types: types.clone(),
            queue: VecDeque::new(),
            done: false,
        }),
        ExecPlan::Filter { child, predicate } => Box::new(FilterOp {
            child: instantiate(child, ctx)?,
            predicate: Arc::clone(predicate),
        }),
        ExecPlan::Project {
            child,
            exprs,
            types,
        } => Box::new(ProjectOp {
            child: instantiate(child, ctx)?,
            exprs: Arc::clone(exprs),
            types: types.clone(),
        }),
        ExecPlan::HashJoinProbe {
            child,
            table,
            probe_key,
            types,
        } => Box::new(HashJoinProbeOp {
            child: instantiate(child, ctx)?,
            table: Arc::clone(table),
            probe_key: *probe_key,
            types: types.clone(),
            queue: VecDeque::new(),
            done: false,
        }),
        ExecPlan::RecursiveExtend {
            child,
            rel_table,
            direction,
            from_column,
            lower,
            upper,
            emit,
            target_mask,
            types,
        } => Box::new(RecursiveExtendOp {
            child: instantiate(child, ctx)?,
            rel: ctx.tables.rel_table(*rel_table)?,
            rel_table: *rel_table,
            direction: *direction,
            from_column: *from_column,
            lower: *lower,
            upper: *upper,
            emit: *emit,
            target_mask: Arc::clone(target_mask),
            types: types.clone(),
            queue: VecDeque::new(),
            done: false,
        }),
    })
}

/// Packs owned rows into an unflat chunk.
pub fn rows_to_chunk(types: &[LogicalType], rows: &mut VecDeque<Vec<Value>>) -> Option<DataChunk> {
    if rows.is_empty() {
        return None;
    }
    let count = rows.len().min(VECTOR_CAPACITY);
    let mut chunk = DataChunk::new(types);
    for pos in 0..count {
        let row = rows.pop_front().expect("row available");
        for (vector, value) in chunk.vectors.iter_mut().zip(row) {
            vector.set_value(pos, value);
        }
    }
    chunk.state = ChunkState::unflat(count);
    Some(chunk)
}

/// Morsel-parallel node table scan. Emits the node id column followed by
/// the projected property columns.
struct ScanNodesOp {
    table: Arc<NodeTable>,
    table_id: TableId,
    columns: Vec<usize>,
    dispenser: Arc<MorselDispenser>,
    types: Vec<LogicalType>,
}

impl Operator for ScanNodesOp {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        ctx.check_interrupt()?;
        let Some((start, count)) = self.dispenser.next_morsel() else {
            return Ok(None);
        };
        let kind = ctx.tx.kind();
        let mut chunk = DataChunk::new(&self.types);
        for i in 0..count as usize {
            chunk.vectors[0].set_value(
                i,
                Value::InternalId {
                    table: self.table_id,
                    offset: start + i as u64,
                },
            );
        }
        for (out_idx, &column) in self.columns.iter().enumerate() {
            self.table.column(column).scan_into(
                start,
                count as usize,
                kind,
                &mut chunk.vectors[out_idx + 1],
            )?;
        }
        chunk.state = ChunkState::unflat(count as usize);
        Ok(Some(chunk))
    }
}

/// Anchor-free rel table scan: walks the adjacency lists of the bound
/// nodes claimed from the morsel dispenser and emits one row per rel,
/// `[src id, dst id, rel id, props…]`, with properties read through the
/// rel-offset columns.
struct ScanRelsOp {
    rel: Arc<RelTable>,
    rel_table: TableId,
    direction: Direction,
    columns: Vec<usize>,
    dispenser: Arc<MorselDispenser>,
    types: Vec<LogicalType>,
    queue: VecDeque<Vec<Value>>,
}

impl Operator for ScanRelsOp {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        let kind = ctx.tx.kind();
        while self.queue.len() < VECTOR_CAPACITY {
            ctx.check_interrupt()?;
            let Some((start, count)) = self.dispenser.next_morsel() else {
                break;
            };
            for node in start..start + count {
                for (neighbor, rel) in self.rel.adjacency(node, self.direction, kind)? {
                    let (src, dst) = match self.direction {
                        Direction::Fwd => (node, neighbor),
                        Direction::Bwd => (neighbor, node),
                    };
                    let mut row = vec![
                        Value::InternalId {
                            table: self.rel.src_table(),
                            offset: src,
                        },
                        Value::InternalId {
                            table: self.rel.dst_table(),
                            offset: dst,
                        },
                        Value::InternalId {
                            table: self.rel_table,
                            offset: rel,
                        },
                    ];
                    for &column in &self.columns {
                        row.push(self.rel.column(column).get_value(rel, kind)?);
                    }
                    self.queue.push_back(row);
                }
            }
        }
        Ok(rows_to_chunk(&self.types, &mut self.queue))
    }
}

struct MaterializedScanOp {
    source: Arc<MaterializedSource>,
}

impl Operator for MaterializedScanOp {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        ctx.check_interrupt()?;
        let Some(rows) = self.source.next_batch() else {
            return Ok(None);
        };
        let mut chunk = DataChunk::new(&self.source.types);
        for (pos, row) in rows.iter().enumerate() {
            for (vector, value) in chunk.vectors.iter_mut().zip(row) {
                vector.set_value(pos, value.clone());
            }
        }
        chunk.state = ChunkState::unflat(rows.len());
        Ok(Some(chunk))
    }
}

/// One-hop expansion: appends neighbor-id and rel-id columns for every
/// adjacency entry of the bound row.
struct ExpandOp<'p> {
    child: Box<dyn Operator + 'p>,
    rel: Arc<RelTable>,
    rel_table: TableId,
    direction: Direction,
    from_column: usize,
    types: Vec<LogicalType>,
    queue: VecDeque<Vec<Value>>,
    done: bool,
}

impl ExpandOp<'_> {
    fn neighbor_table(&self) -> TableId {
        match self.direction {
            Direction::Fwd => self.rel.dst_table(),
            Direction::Bwd => self.rel.src_table(),
        }
    }
}

impl Operator for ExpandOp<'_> {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        let kind = ctx.tx.kind();
        while self.queue.len() < VECTOR_CAPACITY && !self.done {
            ctx.check_interrupt()?;
            let Some(chunk) = self.child.next(ctx)? else {
                self.done = true;
                break;
            };
            for pos in chunk.state.selected() {
                let vector = &chunk.vectors[self.from_column];
                if vector.is_null(pos) {
                    continue;
                }
                let offset = match vector.value(pos) {
                    Value::InternalId { offset, .. } => *offset,
                    _ => {
                        return Err(QuiverError::Internal(
                            "expand over a non-id column".into(),
                        ))
                    }
                };
                for (neighbor, rel) in self.rel.adjacency(offset, self.direction, kind)? {
                    let mut row = chunk.row(pos);
                    row.push(Value::InternalId {
                        table: self.neighbor_table(),
                        offset: neighbor,
                    });
                    row.push(Value::InternalId {
                        table: self.rel_table,
                        offset: rel,
                    });
                    self.queue.push_back(row);
                }
            }
        }
        Ok(rows_to_chunk(&self.types, &mut self.queue))
    }
}

/// Shrinks the selection to the rows where the predicate holds.
struct FilterOp<'p> {
    child: Box<dyn Operator + 'p>,
    predicate: Arc<CompiledExpr>,
}

impl Operator for FilterOp<'_> {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        loop {
            ctx.check_interrupt()?;
            let Some(mut chunk) = self.child.next(ctx)? else {
                return Ok(None);
            };
            let mask = expr::evaluate(&self.predicate, &chunk)?;
            let mut positions = Vec::new();
            for pos in chunk.state.selected() {
                if !mask.is_null(pos) && mask.value(pos).as_bool()? {
                    positions.push(pos as u32);
                }
            }
            if positions.is_empty() {
                continue;
            }
            chunk.state.sel = crate::vector::SelVector::filtered(positions);
            chunk.state.flat_pos = None;
            return Ok(Some(chunk));
        }
    }
}

struct ProjectOp<'p> {
    child: Box<dyn Operator + 'p>,
    exprs: Arc<Vec<CompiledExpr>>,
    types: Vec<LogicalType>,
}

impl Operator for ProjectOp<'_> {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        ctx.check_interrupt()?;
        let Some(chunk) = self.child.next(ctx)? else {
            return Ok(None);
        };
        let mut out = DataChunk::new(&self.types);
        for (idx, expr) in self.exprs.iter().enumerate() {
            out.vectors[idx] = expr::evaluate(expr, &chunk)?;
        }
        out.state = chunk.state.clone();
        Ok(Some(out))
    }
}

/// Probe side of the hash join: append matching build rows per probe row.
struct HashJoinProbeOp<'p> {
    child: Box<dyn Operator + 'p>,
    table: Arc<JoinTable>,
    probe_key: usize,
    types: Vec<LogicalType>,
    queue: VecDeque<Vec<Value>>,
    done: bool,
}

impl Operator for HashJoinProbeOp<'_> {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        while self.queue.len() < VECTOR_CAPACITY && !self.done {
            ctx.check_interrupt()?;
            let Some(chunk) = self.child.next(ctx)? else {
                self.done = true;
                break;
            };
            for pos in chunk.state.selected() {
                let key = chunk.vectors[self.probe_key].value(pos);
                if key.is_null() {
                    continue;
                }
                for payload in self.table.probe(key)? {
                    let mut row = chunk.row(pos);
                    row.extend(payload.iter().cloned());
                    self.queue.push_back(row);
                }
            }
        }
        Ok(rows_to_chunk(&self.types, &mut self.queue))
    }
}

/// Variable-length extension: drives its own BFS per bound source row
/// and drains the frontier scanners into output rows.
struct RecursiveExtendOp<'p> {
    child: Box<dyn Operator + 'p>,
    rel: Arc<RelTable>,
    rel_table: TableId,
    direction: Direction,
    from_column: usize,
    lower: u64,
    upper: u64,
    emit: PathEmission,
    target_mask: Arc<Vec<u64>>,
    types: Vec<LogicalType>,
    queue: VecDeque<Vec<Value>>,
    done: bool,
}

impl RecursiveExtendOp<'_> {
    fn destination_table(&self) -> TableId {
        match self.direction {
            Direction::Fwd => self.rel.dst_table(),
            Direction::Bwd => self.rel.src_table(),
        }
    }

    fn extend_source(
        &mut self,
        input_row: &[Value],
        source: u64,
        ctx: &ExecContext,
    ) -> Result<()> {
        let kind = ctx.tx.kind();
        let state = BfsState::run(
            &self.rel,
            self.direction,
            source,
            self.upper,
            kind,
            &ctx.interrupt,
        )?;
        let mask = TargetMask::new(&self.target_mask);
        let node_table = self.destination_table();

        let mut scanners: Vec<Box<dyn FrontierScanner + '_>> = Vec::new();
        for k in self.lower..=self.upper {
            scanners.push(match self.emit {
                PathEmission::DstOnly => Box::new(DstNodeScanner::new(&state, &mask, k as usize)),
                PathEmission::DstWithMultiplicity => Box::new(
                    DstNodeWithMultiplicityScanner::new(&state, &mask, k as usize),
                ),
                PathEmission::Paths => Box::new(PathScanner::new(
                    &state,
                    &mask,
                    node_table,
                    self.rel_table,
                    k as usize,
                )),
            });
        }
        let mut scanner = FrontiersScanner::new(scanners);
        let mut batch: Vec<PathRow> = Vec::new();
        loop {
            ctx.check_interrupt()?;
            batch.clear();
            if scanner.scan(&mut batch, VECTOR_CAPACITY)? == 0 {
                break;
            }
            for emitted in batch.drain(..) {
                let mut row = input_row.to_vec();
                row.push(Value::InternalId {
                    table: node_table,
                    offset: emitted.dst,
                });
                if self.emit == PathEmission::Paths {
                    row.push(emitted.path.unwrap_or(Value::Null));
                }
                row.push(Value::Int64(emitted.length as i64));
                self.queue.push_back(row);
            }
        }
        Ok(())
    }
}

impl Operator for RecursiveExtendOp<'_> {
    fn next(&mut self, ctx: &ExecContext) -> Result<Option<DataChunk>> {
        while self.queue.len() < VECTOR_CAPACITY && !self.done {
            ctx.check_interrupt()?;
            let Some(chunk) = self.child.next(ctx)? else {
                self.done = true;
                break;
            };
            for pos in chunk.state.selected() {
                let vector = &chunk.vectors[self.from_column];
                if vector.is_null(pos) {
                    continue;
                }
                let source = match vector.value(pos) {
                    Value::InternalId { offset, .. } => *offset,
                    _ => {
                        return Err(QuiverError::Internal(
                            "recursive extend over a non-id column".into(),
                        ))
                    }
                };
                let input_row = chunk.row(pos);
                self.extend_source(&input_row, source, ctx)?;
            }
        }
        Ok(rows_to_chunk(&self.types, &mut self.queue))
    }
}

//! Level-synchronized BFS and variable-length path enumeration.
//!
//! The BFS records, per depth, the set of discovered `(node, incoming
//! rel)` pairs together with back-edges to their parents in the previous
//! frontier and the number of distinct paths reaching each node. Frontier
//! scanners then drain matches per target depth: destinations once, with
//! multiplicity, or as full `(node, rel, …, node)` tuples. The path
//! scanner walks the back-edge graph with explicit neighbor/cursor
//! stacks so it can pause at a full output batch and resume exactly
//! where it stopped. Variable-length joins iterate the scanners for
//! `k..=l` in order, so emitted paths come out grouped by length.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{QuiverError, Result};
use crate::storage::RelTable;
use crate::transaction::TransactionKind;
use crate::types::{Direction, NodeOffset, TableId};
use crate::vector::Value;

/// One BFS level: discovery order, back-edges, and path multiplicity.
#[derive(Default)]
pub struct Frontier {
    /// Nodes in discovery order.
    pub nodes: Vec<NodeOffset>,
    /// Back-edges to the previous frontier: `(parent node, rel)`.
    pub parents: HashMap<NodeOffset, Vec<(NodeOffset, u64)>>,
    /// Number of distinct paths from the source to each node.
    pub multiplicity: HashMap<NodeOffset, u64>,
}

impl Frontier {
    fn source(node: NodeOffset) -> Self {
        let mut frontier = Frontier::default();
        frontier.nodes.push(node);
        frontier.multiplicity.insert(node, 1);
        frontier
    }
}

/// Frontiers accumulated for one source node, levels `0..=max_depth`.
pub struct BfsState {
    pub source: NodeOffset,
    pub frontiers: Vec<Frontier>,
}

impl BfsState {
    /// Runs the level-synchronous BFS: scan every adjacency list of the
    /// previous frontier, deposit new `(dst, rel)` pairs, and record a
    /// back-edge for each discovery.
    pub fn run(
        rel_table: &RelTable,
        direction: Direction,
        source: NodeOffset,
        max_depth: u64,
        kind: TransactionKind,
        interrupt: &Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut frontiers = vec![Frontier::source(source)];
        for depth in 1..=max_depth {
            if interrupt.load(Ordering::Relaxed) {
                return Err(QuiverError::Interrupted);
            }
            let previous = &frontiers[(depth - 1) as usize];
            let mut next = Frontier::default();
            for &node in &previous.nodes {
                let node_multiplicity = previous.multiplicity[&node];
                for (dst, rel) in rel_table.adjacency(node, direction, kind)? {
                    if !next.parents.contains_key(&dst) {
                        next.nodes.push(dst);
                    }
                    next.parents.entry(dst).or_default().push((node, rel));
                    *next.multiplicity.entry(dst).or_insert(0) += node_multiplicity;
                }
            }
            if next.nodes.is_empty() {
                frontiers.push(next);
                break;
            }
            frontiers.push(next);
        }
        Ok(Self { source, frontiers })
    }

    fn frontier(&self, depth: usize) -> Option<&Frontier> {
        self.frontiers.get(depth)
    }
}

/// Destination filter; empty means every node matches.
pub struct TargetMask {
    nodes: HashSet<NodeOffset>,
}

impl TargetMask {
    pub fn new(nodes: &[NodeOffset]) -> Self {
        Self {
            nodes: nodes.iter().copied().collect(),
        }
    }

    pub fn matches(&self, node: NodeOffset) -> bool {
        self.nodes.is_empty() || self.nodes.contains(&node)
    }
}

/// One emitted match.
pub struct PathRow {
    pub dst: NodeOffset,
    pub length: u64,
    /// `(node, rel, node, …)` tuple for path emission; `None` otherwise.
    pub path: Option<Value>,
}

/// Scans matches of one fixed length out of the accumulated frontiers.
pub trait FrontierScanner {
    /// Appends up to `max` rows to `out`; returns how many were written.
    /// Calling again resumes where the previous call paused.
    fn scan(&mut self, out: &mut Vec<PathRow>, max: usize) -> Result<usize>;
}

/// Emits each destination in the k'th frontier exactly once.
pub struct DstNodeScanner<'a> {
    state: &'a BfsState,
    target: &'a TargetMask,
    k: usize,
    cursor: usize,
}

impl<'a> DstNodeScanner<'a> {
    pub fn new(state: &'a BfsState, target: &'a TargetMask, k: usize) -> Self {
        Self {
            state,
            target,
            k,
            cursor: 0,
        }
    }
}

impl FrontierScanner for DstNodeScanner<'_> {
    fn scan(&mut self, out: &mut Vec<PathRow>, max: usize) -> Result<usize> {
        let Some(frontier) = self.state.frontier(self.k) else {
            return Ok(0);
        };
        let mut written = 0;
        while written < max && self.cursor < frontier.nodes.len() {
            let node = frontier.nodes[self.cursor];
            self.cursor += 1;
            if self.target.matches(node) {
                out.push(PathRow {
                    dst: node,
                    length: self.k as u64,
                    path: None,
                });
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Emits each destination repeated by its path multiplicity.
pub struct DstNodeWithMultiplicityScanner<'a> {
    state: &'a BfsState,
    target: &'a TargetMask,
    k: usize,
    cursor: usize,
    /// Remaining repetitions of the current node; pause point.
    remaining: u64,
}

impl<'a> DstNodeWithMultiplicityScanner<'a> {
    pub fn new(state: &'a BfsState, target: &'a TargetMask, k: usize) -> Self {
        Self {
            state,
            target,
            k,
            cursor: 0,
            remaining: 0,
        }
    }
}

impl FrontierScanner for DstNodeWithMultiplicityScanner<'_> {
    fn scan(&mut self, out: &mut Vec<PathRow>, max: usize) -> Result<usize> {
        let Some(frontier) = self.state.frontier(self.k) else {
            return Ok(0);
        };
        let mut written = 0;
        loop {
            if self.remaining == 0 {
                loop {
                    if self.cursor >= frontier.nodes.len() {
                        return Ok(written);
                    }
                    let node = frontier.nodes[self.cursor];
                    if self.target.matches(node) {
                        self.remaining = frontier.multiplicity[&node];
                        break;
                    }
                    self.cursor += 1;
                }
            }
            let node = frontier.nodes[self.cursor];
            while self.remaining > 0 && written < max {
                out.push(PathRow {
                    dst: node,
                    length: self.k as u64,
                    path: None,
                });
                self.remaining -= 1;
                written += 1;
            }
            if self.remaining > 0 {
                return Ok(written);
            }
            self.cursor += 1;
        }
    }
}

/// Enumerates full paths of length k by a DFS over the back-edge graph,
/// rooted at each destination in the k'th frontier. The DFS keeps
/// explicit neighbor and cursor stacks (no recursion) so it can pause
/// when the output batch fills and resume on the next call.
pub struct PathScanner<'a> {
    state: &'a BfsState,
    target: &'a TargetMask,
    node_table: TableId,
    rel_table_id: TableId,
    k: usize,
    dst_cursor: usize,
    /// Nodes on the current partial path, destination first.
    nodes: SmallVec<[NodeOffset; 8]>,
    /// Rels on the current partial path, aligned with `nodes` transitions.
    rels: SmallVec<[u64; 8]>,
    /// Parent lists per depth, innermost last.
    nbrs_stack: Vec<&'a [(NodeOffset, u64)]>,
    cursor_stack: Vec<usize>,
}

impl<'a> PathScanner<'a> {
    pub fn new(
        state: &'a BfsState,
        target: &'a TargetMask,
        node_table: TableId,
        rel_table_id: TableId,
        k: usize,
    ) -> Self {
        Self {
            state,
            target,
            node_table,
            rel_table_id,
            k,
            dst_cursor: 0,
            nodes: SmallVec::new(),
            rels: SmallVec::new(),
            nbrs_stack: Vec::new(),
            cursor_stack: Vec::new(),
        }
    }

    /// Prepares the DFS stacks for the destination at `dst_cursor`.
    fn init_dfs(&mut self, dst: NodeOffset) {
        self.nodes.clear();
        self.rels.clear();
        self.nbrs_stack.clear();
        self.cursor_stack.clear();
        self.nodes.push(dst);
        if self.k > 0 {
            let parents = self.state.frontiers[self.k]
                .parents
                .get(&dst)
                .map(|p| p.as_slice())
                .unwrap_or(&[]);
            self.nbrs_stack.push(parents);
            self.cursor_stack.push(0);
        }
    }

    /// Materializes the current complete path, source first.
    fn emit(&self) -> PathRow {
        let mut tuple = Vec::with_capacity(2 * self.k + 1);
        for i in (0..self.nodes.len()).rev() {
            tuple.push(Value::InternalId {
                table: self.node_table,
                offset: self.nodes[i],
            });
            if i > 0 {
                tuple.push(Value::InternalId {
                    table: self.rel_table_id,
                    offset: self.rels[i - 1],
                });
            }
        }
        PathRow {
            dst: self.nodes[0],
            length: self.k as u64,
            path: Some(Value::List(tuple)),
        }
    }
}

impl FrontierScanner for PathScanner<'_> {
    fn scan(&mut self, out: &mut Vec<PathRow>, max: usize) -> Result<usize> {
        let Some(frontier) = self.state.frontier(self.k) else {
            return Ok(0);
        };
        let mut written = 0;
        while written < max {
            if self.nbrs_stack.is_empty() {
                // Advance to the next matching destination.
                let node = loop {
                    if self.dst_cursor >= frontier.nodes.len() {
                        return Ok(written);
                    }
                    let node = frontier.nodes[self.dst_cursor];
                    self.dst_cursor += 1;
                    if self.target.matches(node) {
                        break node;
                    }
                };
                if self.k == 0 {
                    self.nodes.clear();
                    self.rels.clear();
                    self.nodes.push(node);
                    out.push(self.emit());
                    written += 1;
                    continue;
                }
                self.init_dfs(node);
            }

            // Pop-and-continue over the saved (neighbors, cursor) frames.
            let depth = self.nbrs_stack.len() - 1;
            let cursor = self.cursor_stack[depth];
            if cursor >= self.nbrs_stack[depth].len() {
                self.nbrs_stack.pop();
                self.cursor_stack.pop();
                self.nodes.pop();
                if !self.rels.is_empty() {
                    self.rels.pop();
                }
                if self.nbrs_stack.is_empty() {
                    // Destination exhausted; the outer loop advances.
                    self.nodes.clear();
                    self.rels.clear();
                }
                continue;
            }
            let (parent, rel) = self.nbrs_stack[depth][cursor];
            self.cursor_stack[depth] = cursor + 1;

            if self.nbrs_stack.len() == self.k {
                // Parent is the source level: a complete path.
                self.nodes.push(parent);
                self.rels.push(rel);
                out.push(self.emit());
                written += 1;
                self.nodes.pop();
                self.rels.pop();
            } else {
                let level = self.k - self.nbrs_stack.len();
                let parents = self.state.frontiers[level]
                    .parents
                    .get(&parent)
                    .map(|p| p.as_slice())
                    .unwrap_or(&[]);
                self.nodes.push(parent);
                self.rels.push(rel);
                self.nbrs_stack.push(parents);
                self.cursor_stack.push(0);
            }
        }
        Ok(written)
    }
}

/// Iterates scanners for lengths `lower..=upper` in order.
pub struct FrontiersScanner<'a> {
    scanners: Vec<Box<dyn FrontierScanner + 'a>>,
    cursor: usize,
}

impl<'a> FrontiersScanner<'a> {
    pub fn new(scanners: Vec<Box<dyn FrontierScanner + 'a>>) -> Self {
        Self {
            scanners,
            cursor: 0,
        }
    }

    pub fn scan(&mut self, out: &mut Vec<PathRow>, max: usize) -> Result<usize> {
        let mut written = 0;
        while written < max && self.cursor < self.scanners.len() {
            let n = self.scanners[self.cursor].scan(out, max - written)?;
            if n == 0 {
                self.cursor += 1;
            }
            written += n;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Diamond: 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3 (rels 0..=3).
    fn diamond() -> BfsState {
        let mut f1 = Frontier::default();
        f1.nodes = vec![1, 2];
        f1.parents.insert(1, vec![(0, 0)]);
        f1.parents.insert(2, vec![(0, 1)]);
        f1.multiplicity.insert(1, 1);
        f1.multiplicity.insert(2, 1);

        let mut f2 = Frontier::default();
        f2.nodes = vec![3];
        f2.parents.insert(3, vec![(1, 2), (2, 3)]);
        f2.multiplicity.insert(3, 2);

        BfsState {
            source: 0,
            frontiers: vec![Frontier::source(0), f1, f2],
        }
    }

    #[test]
    fn dst_scanner_emits_each_destination_once() {
        let state = diamond();
        let mask = TargetMask::new(&[]);
        let mut scanner = DstNodeScanner::new(&state, &mask, 2);
        let mut rows = Vec::new();
        scanner.scan(&mut rows, 100).expect("scan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dst, 3);
        assert_eq!(rows[0].length, 2);
    }

    #[test]
    fn multiplicity_scanner_repeats_by_path_count() {
        let state = diamond();
        let mask = TargetMask::new(&[]);
        let mut scanner = DstNodeWithMultiplicityScanner::new(&state, &mask, 2);
        let mut rows = Vec::new();
        // Drain one row at a time to exercise the pause point.
        while scanner.scan(&mut rows, 1).expect("scan") > 0 {}
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.dst == 3));
    }

    #[test]
    fn path_scanner_enumerates_both_diamond_paths() {
        let state = diamond();
        let mask = TargetMask::new(&[]);
        let mut scanner = PathScanner::new(&state, &mask, TableId(0), TableId(1), 2);
        let mut rows = Vec::new();
        while scanner.scan(&mut rows, 1).expect("scan") > 0 {}
        assert_eq!(rows.len(), 2);
        let paths: Vec<Vec<u64>> = rows
            .iter()
            .map(|r| match r.path.as_ref().expect("path") {
                Value::List(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::InternalId { offset, .. } => *offset,
                        _ => panic!("non-id in path"),
                    })
                    .collect(),
                _ => panic!("non-list path"),
            })
            .collect();
        assert!(paths.contains(&vec![0, 0, 1, 2, 3]));
        assert!(paths.contains(&vec![0, 1, 2, 3, 3]));
    }

    #[test]
    fn zero_length_returns_source_iff_it_matches() {
        let state = diamond();
        let matching = TargetMask::new(&[0]);
        let mut scanner = DstNodeScanner::new(&state, &matching, 0);
        let mut rows = Vec::new();
        scanner.scan(&mut rows, 10).expect("scan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dst, 0);
        assert_eq!(rows[0].length, 0);

        let excluded = TargetMask::new(&[9]);
        let mut scanner = DstNodeScanner::new(&state, &excluded, 0);
        let mut rows = Vec::new();
        scanner.scan(&mut rows, 10).expect("scan");
        assert!(rows.is_empty());
    }

    #[test]
    fn variable_length_output_grouped_by_length() {
        let state = diamond();
        let mask = TargetMask::new(&[]);
        let mut scanner = FrontiersScanner::new(vec![
            Box::new(DstNodeWithMultiplicityScanner::new(&state, &mask, 1)),
            Box::new(DstNodeWithMultiplicityScanner::new(&state, &mask, 2)),
        ]);
        let mut rows = Vec::new();
        while scanner.scan(&mut rows, 2).expect("scan") > 0 {}
        let lengths: Vec<u64> = rows.iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![1, 1, 2, 2]);
    }
}

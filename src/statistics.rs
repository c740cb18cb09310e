//! Per-table statistics: node counts and per-direction rel counts.
//!
//! Counts double as offset allocators: inserting a node claims the next
//! dense offset by bumping the table's shadow count. The shadow copy is
//! installed at commit through the same resource protocol as the disk
//! arrays; the serialized form rides in the commit's catalog record and
//! is written to `statistics.db` at checkpoint.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::transaction::TransactionKind;
use crate::types::{Direction, NodeOffset, RelOffset, TableId};

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct NodeTableStats {
    pub num_nodes: u64,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct RelTableStats {
    pub num_rels: u64,
    /// Rels bound per direction (fwd, bwd). Equal for a single table pair
    /// but tracked separately for the scan planner.
    pub num_rels_per_direction: [u64; 2],
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct StatisticsData {
    pub node_tables: HashMap<u32, NodeTableStats>,
    pub rel_tables: HashMap<u32, RelTableStats>,
}

struct State {
    canonical: StatisticsData,
    shadow: Option<StatisticsData>,
}

pub struct Statistics {
    state: RwLock<State>,
}

impl Statistics {
    pub fn new(data: StatisticsData) -> Self {
        Self {
            state: RwLock::new(State {
                canonical: data,
                shadow: None,
            }),
        }
    }

    pub fn num_nodes(&self, table: TableId, kind: TransactionKind) -> u64 {
        let state = self.state.read();
        let data = match (kind, &state.shadow) {
            (TransactionKind::Write, Some(shadow)) => shadow,
            _ => &state.canonical,
        };
        data.node_tables.get(&table.0).map_or(0, |s| s.num_nodes)
    }

    pub fn num_rels(&self, table: TableId, kind: TransactionKind) -> u64 {
        let state = self.state.read();
        let data = match (kind, &state.shadow) {
            (TransactionKind::Write, Some(shadow)) => shadow,
            _ => &state.canonical,
        };
        data.rel_tables.get(&table.0).map_or(0, |s| s.num_rels)
    }

    /// Claims the next dense node offset of `table` in the shadow.
    pub fn allocate_node_offset(&self, table: TableId) -> NodeOffset {
        let mut state = self.state.write();
        let shadow = Self::shadow_mut(&mut state);
        let stats = shadow.node_tables.entry(table.0).or_default();
        let offset = stats.num_nodes;
        stats.num_nodes += 1;
        offset
    }

    /// Claims the next dense rel offset and counts it in both directions.
    pub fn allocate_rel_offset(&self, table: TableId) -> RelOffset {
        let mut state = self.state.write();
        let shadow = Self::shadow_mut(&mut state);
        let stats = shadow.rel_tables.entry(table.0).or_default();
        let offset = stats.num_rels;
        stats.num_rels += 1;
        for direction in Direction::BOTH {
            stats.num_rels_per_direction[direction as usize] += 1;
        }
        offset
    }

    pub fn register_node_table(&self, table: TableId) {
        let mut state = self.state.write();
        Self::shadow_mut(&mut state).node_tables.entry(table.0).or_default();
    }

    pub fn register_rel_table(&self, table: TableId) {
        let mut state = self.state.write();
        Self::shadow_mut(&mut state).rel_tables.entry(table.0).or_default();
    }

    /// Serializable view for the commit record / checkpoint: the shadow
    /// when one exists, otherwise the canonical data.
    pub fn current(&self) -> StatisticsData {
        let state = self.state.read();
        state.shadow.clone().unwrap_or_else(|| state.canonical.clone())
    }

    pub fn has_shadow(&self) -> bool {
        self.state.read().shadow.is_some()
    }

    pub fn install_shadow(&self) {
        let mut state = self.state.write();
        if let Some(shadow) = state.shadow.take() {
            state.canonical = shadow;
        }
    }

    pub fn discard_shadow(&self) {
        self.state.write().shadow = None;
    }

    fn shadow_mut(state: &mut State) -> &mut StatisticsData {
        if state.shadow.is_none() {
            state.shadow = Some(state.canonical.clone());
        }
        state.shadow.as_mut().expect("shadow just installed")
    }
}

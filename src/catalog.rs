//! Table and property definitions, serialized to `catalog.db`.
//!
//! DDL under a write transaction mutates a shadow copy; the commit
//! record carries the serialized shadow so recovery can rebuild the file,
//! and checkpoint rewrites `catalog.db` itself.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::storage::column::ColumnLocator;
use crate::storage::lists::ListsLocator;
use crate::transaction::TransactionKind;
use crate::types::{PropertyId, TableId};
use crate::vector::LogicalType;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyDef {
    pub id: PropertyId,
    pub name: String,
    pub ty: LogicalType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeTableDef {
    pub id: TableId,
    pub name: String,
    pub properties: Vec<PropertyDef>,
    /// Property holding the primary key; backed by the hash index.
    pub pk_property: PropertyId,
    /// Column locators parallel to `properties`.
    pub columns: Vec<ColumnLocator>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelTableDef {
    pub id: TableId,
    pub name: String,
    pub src_table: TableId,
    pub dst_table: TableId,
    pub properties: Vec<PropertyDef>,
    pub columns: Vec<ColumnLocator>,
    pub fwd_lists: ListsLocator,
    pub bwd_lists: ListsLocator,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct CatalogData {
    pub next_table_id: u32,
    pub node_tables: Vec<NodeTableDef>,
    pub rel_tables: Vec<RelTableDef>,
}

impl CatalogData {
    pub fn node_table(&self, name: &str) -> Option<&NodeTableDef> {
        self.node_tables.iter().find(|t| t.name == name)
    }

    pub fn rel_table(&self, name: &str) -> Option<&RelTableDef> {
        self.rel_tables.iter().find(|t| t.name == name)
    }
}

struct State {
    canonical: CatalogData,
    shadow: Option<CatalogData>,
}

pub struct Catalog {
    state: RwLock<State>,
}

impl Catalog {
    pub fn new(data: CatalogData) -> Self {
        Self {
            state: RwLock::new(State {
                canonical: data,
                shadow: None,
            }),
        }
    }

    /// Snapshot visible to the transaction kind.
    pub fn snapshot(&self, kind: TransactionKind) -> CatalogData {
        let state = self.state.read();
        match (kind, &state.shadow) {
            (TransactionKind::Write, Some(shadow)) => shadow.clone(),
            _ => state.canonical.clone(),
        }
    }

    pub fn allocate_table_id(&self) -> TableId {
        let mut state = self.state.write();
        let shadow = Self::shadow_mut(&mut state);
        let id = TableId(shadow.next_table_id);
        shadow.next_table_id += 1;
        id
    }

    pub fn add_node_table(&self, def: NodeTableDef) -> Result<()> {
        let mut state = self.state.write();
        let shadow = Self::shadow_mut(&mut state);
        if shadow.node_table(&def.name).is_some() || shadow.rel_table(&def.name).is_some() {
            return Err(QuiverError::Binder(format!(
                "table {} already exists",
                def.name
            )));
        }
        shadow.node_tables.push(def);
        Ok(())
    }

    pub fn add_rel_table(&self, def: RelTableDef) -> Result<()> {
        let mut state = self.state.write();
        let shadow = Self::shadow_mut(&mut state);
        if shadow.node_table(&def.name).is_some() || shadow.rel_table(&def.name).is_some() {
            return Err(QuiverError::Binder(format!(
                "table {} already exists",
                def.name
            )));
        }
        shadow.rel_tables.push(def);
        Ok(())
    }

    /// Serializable view for the commit record / checkpoint.
    pub fn current(&self) -> CatalogData {
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

    fn shadow_mut(state: &mut State) -> &mut CatalogData {
        if state.shadow.is_none() {
            state.shadow = Some(state.canonical.clone());
        }
        state.shadow.as_mut().expect("shadow just installed")
    }
}

/// Resolve a property by name within a definition.
pub fn property_index(properties: &[PropertyDef], name: &str) -> Result<usize> {
    properties
        .iter()
        .position(|p| p.name == name)
        .ok_or_else(|| QuiverError::Binder(format!("unknown property {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_def(id: TableId) -> NodeTableDef {
        NodeTableDef {
            id,
            name: "Person".into(),
            properties: vec![PropertyDef {
                id: PropertyId(0),
                name: "name".into(),
                ty: LogicalType::String,
            }],
            pk_property: PropertyId(0),
            columns: Vec::new(),
        }
    }

    #[test]
    fn ddl_stays_in_shadow_until_install() {
        let catalog = Catalog::new(CatalogData::default());
        let id = catalog.allocate_table_id();
        catalog.add_node_table(person_def(id)).expect("add");

        assert!(catalog
            .snapshot(TransactionKind::ReadOnly)
            .node_table("Person")
            .is_none());
        assert!(catalog
            .snapshot(TransactionKind::Write)
            .node_table("Person")
            .is_some());

        catalog.install_shadow();
        assert!(catalog
            .snapshot(TransactionKind::ReadOnly)
            .node_table("Person")
            .is_some());
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let catalog = Catalog::new(CatalogData::default());
        let id = catalog.allocate_table_id();
        catalog.add_node_table(person_def(id)).expect("add");
        let id2 = catalog.allocate_table_id();
        assert!(matches!(
            catalog.add_node_table(person_def(id2)),
            Err(QuiverError::Binder(_))
        ));
    }
}

use crate::catalog::schema::{ColumnDef, SchemaVersion};
use crate::catalog::types::{IndexId, JobId, TableEngine, TableId};
use crate::error::{FeError, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TableState {
    #[default]
    Normal,
    SchemaChange,
    Rollup,
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableState::Normal => write!(f, "NORMAL"),
            TableState::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            TableState::Rollup => write!(f, "ROLLUP"),
        }
    }
}

/// A named relation: one base index plus any number of rollup indexes, each
/// described by a shared, immutable [`SchemaVersion`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    id: TableId,
    name: String,
    engine: TableEngine,
    state: TableState,
    pending_job: Option<JobId>,
    base_index_id: IndexId,
    index_id_to_meta: BTreeMap<IndexId, Arc<SchemaVersion>>,
    index_name_to_id: BTreeMap<String, IndexId>,
}

impl Table {
    pub fn new(id: TableId, name: impl Into<String>, engine: TableEngine, base: SchemaVersion) -> Self {
        let name = name.into();
        let base_index_id = base.index_id;
        let mut index_id_to_meta = BTreeMap::new();
        index_id_to_meta.insert(base_index_id, Arc::new(base));
        let mut index_name_to_id = BTreeMap::new();
        index_name_to_id.insert(name.clone(), base_index_id);
        Self {
            id,
            name,
            engine,
            state: TableState::Normal,
            pending_job: None,
            base_index_id,
            index_id_to_meta,
            index_name_to_id,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> TableEngine {
        self.engine
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn pending_job(&self) -> Option<JobId> {
        self.pending_job
    }

    pub fn base_index_id(&self) -> IndexId {
        self.base_index_id
    }

    pub fn base_index_meta(&self) -> Arc<SchemaVersion> {
        // Constructor and every mutator keep the base id resolvable.
        Arc::clone(&self.index_id_to_meta[&self.base_index_id])
    }

    pub fn base_schema(&self) -> &[ColumnDef] {
        &self.index_id_to_meta[&self.base_index_id].columns
    }

    pub fn index_meta(&self, index_id: IndexId) -> Option<&Arc<SchemaVersion>> {
        self.index_id_to_meta.get(&index_id)
    }

    pub fn index_id_by_name(&self, name: &str) -> Option<IndexId> {
        self.index_name_to_id.get(name).copied()
    }

    pub fn index_name_by_id(&self, index_id: IndexId) -> Option<&str> {
        self.index_name_to_id
            .iter()
            .find(|(_, id)| **id == index_id)
            .map(|(name, _)| name.as_str())
    }

    pub fn index_count(&self) -> usize {
        self.index_id_to_meta.len()
    }

    /// `(index name, schema)` pairs, base index first.
    pub fn indexes(&self) -> Vec<(&str, &Arc<SchemaVersion>)> {
        let mut out: Vec<(&str, &Arc<SchemaVersion>)> = self
            .index_name_to_id
            .iter()
            .filter_map(|(name, id)| self.index_id_to_meta.get(id).map(|m| (name.as_str(), m)))
            .collect();
        out.sort_by_key(|(_, meta)| meta.index_id != self.base_index_id);
        out
    }

    /// Checks the index bookkeeping of a table that did not come from
    /// [`Table::new`], such as one decoded from the journal or an image.
    pub(crate) fn check_consistency(&self) -> Result<(), FeError> {
        let corrupt = |what: String| FeError::Corruption {
            message: format!("table '{}': {what}", self.name),
        };
        if !self.index_id_to_meta.contains_key(&self.base_index_id) {
            return Err(corrupt(format!("base index {} has no schema", self.base_index_id)));
        }
        if self.index_name_to_id.get(&self.name) != Some(&self.base_index_id) {
            return Err(corrupt("base index is not named after the table".into()));
        }
        for (index_id, meta) in &self.index_id_to_meta {
            if meta.index_id != *index_id {
                return Err(corrupt(format!("index {index_id} carries schema of {}", meta.index_id)));
            }
        }
        if let Some((name, id)) = self
            .index_name_to_id
            .iter()
            .find(|(_, id)| !self.index_id_to_meta.contains_key(id))
        {
            return Err(corrupt(format!("index '{name}' points at missing index {id}")));
        }
        Ok(())
    }

    pub fn ensure_normal(&self) -> Result<(), FeError> {
        if self.state == TableState::Normal {
            return Ok(());
        }
        Err(FeError::ConcurrentModification {
            table: self.name.clone(),
            state: self.state.to_string(),
            job_id: self.pending_job.unwrap_or_default(),
        })
    }

    pub(crate) fn begin_job(&mut self, job_id: JobId, state: TableState) -> Result<(), FeError> {
        self.ensure_normal()?;
        self.state = state;
        self.pending_job = Some(job_id);
        Ok(())
    }

    /// Returns the table to NORMAL if `job_id` is the job that owns it.
    pub(crate) fn end_job(&mut self, job_id: JobId) -> bool {
        if self.pending_job != Some(job_id) {
            return false;
        }
        self.state = TableState::Normal;
        self.pending_job = None;
        true
    }

    /// Swaps `origin_index_id` for `shadow`, keeping the index name.
    pub(crate) fn replace_index(
        &mut self,
        origin_index_id: IndexId,
        shadow: SchemaVersion,
    ) -> Result<(), FeError> {
        let name = self
            .index_name_by_id(origin_index_id)
            .map(str::to_string)
            .ok_or_else(|| {
                FeError::not_found(
                    ResourceType::Index,
                    format!("{}.{origin_index_id}", self.name),
                )
            })?;
        let shadow_id = shadow.index_id;
        if self.index_id_to_meta.contains_key(&shadow_id) {
            return Err(FeError::already_exists(
                ResourceType::Index,
                format!("{}.{shadow_id}", self.name),
            ));
        }
        self.index_id_to_meta.remove(&origin_index_id);
        self.index_id_to_meta.insert(shadow_id, Arc::new(shadow));
        self.index_name_to_id.insert(name, shadow_id);
        if self.base_index_id == origin_index_id {
            self.base_index_id = shadow_id;
        }
        Ok(())
    }

    pub(crate) fn add_index(&mut self, name: &str, meta: SchemaVersion) -> Result<(), FeError> {
        if self.index_name_to_id.contains_key(name)
            || self.index_id_to_meta.contains_key(&meta.index_id)
        {
            return Err(FeError::already_exists(
                ResourceType::Index,
                format!("{}.{name}", self.name),
            ));
        }
        self.index_name_to_id.insert(name.to_string(), meta.index_id);
        self.index_id_to_meta.insert(meta.index_id, Arc::new(meta));
        Ok(())
    }

    pub(crate) fn remove_index(&mut self, name: &str) -> Result<IndexId, FeError> {
        let index_id = self.index_id_by_name(name).ok_or_else(|| {
            FeError::not_found(ResourceType::Index, format!("{}.{name}", self.name))
        })?;
        if index_id == self.base_index_id {
            return Err(FeError::Validation(format!(
                "cannot drop base index of table '{}'",
                self.name
            )));
        }
        self.index_name_to_id.remove(name);
        self.index_id_to_meta.remove(&index_id);
        Ok(index_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Table, TableState};
    use crate::catalog::schema::{ColumnDef, SchemaVersion};
    use crate::catalog::types::{ColumnType, TableEngine};
    use crate::error::FeError;

    fn table() -> Table {
        Table::new(
            2,
            "tbl1",
            TableEngine::Olap,
            SchemaVersion::new(3, 0, vec![ColumnDef::key("k1", ColumnType::Int)]),
        )
    }

    #[test]
    fn base_index_is_named_after_table() {
        let t = table();
        assert_eq!(t.index_name_by_id(t.base_index_id()), Some("tbl1"));
        assert_eq!(t.base_schema().len(), 1);
    }

    #[test]
    fn replace_base_index_moves_pointer_and_keeps_name() {
        let mut t = table();
        let old = t.base_index_meta();
        let shadow = old.evolve(
            9,
            vec![
                ColumnDef::key("k1", ColumnType::Int),
                ColumnDef::value("k2", ColumnType::Int),
            ],
        );
        t.replace_index(3, shadow).expect("replace");
        assert_eq!(t.base_index_id(), 9);
        assert_eq!(t.index_name_by_id(9), Some("tbl1"));
        assert_eq!(t.index_count(), 1);
        assert_eq!(t.base_schema().len(), 2);
        assert_eq!(old.columns.len(), 1, "readers holding the old Arc see the old layout");
    }

    #[test]
    fn second_job_on_busy_table_is_rejected() {
        let mut t = table();
        t.begin_job(100, TableState::SchemaChange).expect("first");
        let err = t
            .begin_job(101, TableState::Rollup)
            .expect_err("second must fail");
        assert!(matches!(err, FeError::ConcurrentModification { job_id: 100, .. }));
        assert!(!t.end_job(101));
        assert!(t.end_job(100));
        assert_eq!(t.state(), TableState::Normal);
    }

    #[test]
    fn base_index_cannot_be_removed() {
        let mut t = table();
        assert!(t.remove_index("tbl1").is_err());
        t.add_index(
            "r1",
            SchemaVersion::new(7, 0, vec![ColumnDef::key("k1", ColumnType::Int)]),
        )
        .expect("add");
        assert_eq!(t.indexes()[0].0, "tbl1");
        assert_eq!(t.remove_index("r1").expect("remove"), 7);
    }
}

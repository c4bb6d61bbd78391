pub mod database;
pub mod schema;
pub mod table;
pub mod types;

use crate::catalog::database::{Database, DatabaseState};
use crate::catalog::schema::{ColumnDef, SchemaVersion};
use crate::catalog::table::Table;
use crate::catalog::types::{DbId, IndexId, TableEngine, TableId};
use crate::error::{FeError, ResourceType};
use crate::journal::{Journal, JournalOp};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTableRequest {
    pub table_name: String,
    pub engine: TableEngine,
    pub columns: Vec<ColumnDef>,
}

impl CreateTableRequest {
    pub fn olap(table_name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            table_name: table_name.into(),
            engine: TableEngine::Olap,
            columns,
        }
    }
}

#[derive(Debug, Default)]
struct DatabaseMap {
    name_to_id: BTreeMap<String, DbId>,
    by_id: BTreeMap<DbId, Arc<Database>>,
}

/// Serialized form of the whole catalog, written by checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CatalogImage {
    pub next_id: u64,
    pub databases: Vec<DatabaseImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseImage {
    pub id: DbId,
    pub name: String,
    pub tables: Vec<Table>,
}

/// Held for the duration of one journaled mutation. Checkpoints take the
/// gate exclusively, so an image never splits a journal write from its
/// in-memory effect.
pub struct MutationGuard<'a> {
    journal: &'a dyn Journal,
    _gate: RwLockReadGuard<'a, ()>,
}

impl MutationGuard<'_> {
    pub fn log(&self, op: &JournalOp) -> Result<u64, FeError> {
        self.journal.append(op)
    }
}

/// Registry of every database of one frontend.
///
/// Lock order is mutation gate, then the database map, then a database's
/// own lock. The map lock is never held while waiting on a database lock
/// that a job step may own.
pub struct Catalog {
    journal: Arc<dyn Journal>,
    mutation_gate: RwLock<()>,
    databases: RwLock<DatabaseMap>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("databases", &self.database_names())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl Catalog {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            journal,
            mutation_gate: RwLock::new(()),
            databases: RwLock::new(DatabaseMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Allocates an id for a database, table, index or job.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn observe_id(&self, id: u64) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    pub(crate) fn begin_mutation(&self) -> MutationGuard<'_> {
        MutationGuard {
            journal: self.journal.as_ref(),
            _gate: self.mutation_gate.read(),
        }
    }

    pub(crate) fn begin_checkpoint(&self) -> RwLockWriteGuard<'_, ()> {
        self.mutation_gate.write()
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        let map = self.databases.read();
        map.name_to_id
            .get(name)
            .and_then(|id| map.by_id.get(id))
            .cloned()
    }

    pub fn get_database_by_id(&self, db_id: DbId) -> Option<Arc<Database>> {
        self.databases.read().by_id.get(&db_id).cloned()
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>, FeError> {
        self.get_database(name)
            .ok_or_else(|| FeError::not_found(ResourceType::Database, name))
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().name_to_id.keys().cloned().collect()
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.read().by_id.values().cloned().collect()
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<Database>, FeError> {
        validate_identifier(name, "database name")?;
        let mutation = self.begin_mutation();
        let mut map = self.databases.write();
        if map.name_to_id.contains_key(name) {
            return Err(FeError::already_exists(ResourceType::Database, name));
        }
        let db_id = self.next_id();
        mutation.log(&JournalOp::CreateDatabase {
            db_id,
            name: name.to_string(),
        })?;
        let db = Arc::new(Database::new(db_id, name));
        map.name_to_id.insert(name.to_string(), db_id);
        map.by_id.insert(db_id, Arc::clone(&db));
        info!(db_id, database = name, "database created");
        Ok(db)
    }

    /// Fails with `HasActiveJobs` while any table of the database is owned by
    /// a schema change or rollup job.
    pub fn drop_database(&self, name: &str) -> Result<(), FeError> {
        let mutation = self.begin_mutation();
        let mut map = self.databases.write();
        let db = map
            .name_to_id
            .get(name)
            .and_then(|id| map.by_id.get(id))
            .cloned()
            .ok_or_else(|| FeError::not_found(ResourceType::Database, name))?;
        let state = db.write_lock();
        let active = state.active_job_count();
        if active > 0 {
            return Err(FeError::HasActiveJobs {
                database: name.to_string(),
                active,
            });
        }
        mutation.log(&JournalOp::DropDatabase {
            db_id: db.id(),
            name: name.to_string(),
        })?;
        db.mark_dropped();
        drop(state);
        map.name_to_id.remove(name);
        map.by_id.remove(&db.id());
        info!(db_id = db.id(), database = name, "database dropped");
        Ok(())
    }

    pub fn create_table(&self, db_name: &str, request: CreateTableRequest) -> Result<TableId, FeError> {
        validate_identifier(&request.table_name, "table name")?;
        validate_columns(&request.table_name, request.engine, &request.columns)?;
        let db = self.database(db_name)?;
        let mutation = self.begin_mutation();
        let mut state = db.write_live()?;
        if state.table(&request.table_name).is_some() {
            return Err(FeError::already_exists(
                ResourceType::Table,
                format!("{db_name}.{}", request.table_name),
            ));
        }
        let table_id = self.next_id();
        let base = SchemaVersion::new(self.next_id(), 0, request.columns);
        let table = Table::new(table_id, &request.table_name, request.engine, base);
        mutation.log(&JournalOp::CreateTable {
            db_id: db.id(),
            table: table.clone(),
        })?;
        state.insert_table(table)?;
        info!(
            db_id = db.id(),
            table_id,
            table = %request.table_name,
            "table created"
        );
        Ok(table_id)
    }

    pub fn drop_table(&self, db_name: &str, table_name: &str) -> Result<(), FeError> {
        let db = self.database(db_name)?;
        let mutation = self.begin_mutation();
        let mut state = db.write_live()?;
        let table = state.table(table_name).ok_or_else(|| {
            FeError::not_found(ResourceType::Table, format!("{db_name}.{table_name}"))
        })?;
        table.ensure_normal()?;
        let table_id = table.id();
        mutation.log(&JournalOp::DropTable {
            db_id: db.id(),
            table_id,
            name: table_name.to_string(),
        })?;
        state.remove_table(table_name);
        info!(db_id = db.id(), table_id, table = table_name, "table dropped");
        Ok(())
    }

    /// Removes an auxiliary index. Only metadata changes; no job is created.
    pub fn drop_rollup(&self, db_name: &str, table_name: &str, rollup_name: &str) -> Result<(), FeError> {
        let db = self.database(db_name)?;
        let mutation = self.begin_mutation();
        let mut state = db.write_live()?;
        let table = state.table(table_name).ok_or_else(|| {
            FeError::not_found(ResourceType::Table, format!("{db_name}.{table_name}"))
        })?;
        table.ensure_normal()?;
        let mut updated = table.clone();
        updated.remove_index(rollup_name)?;
        let table_id = updated.id();
        mutation.log(&JournalOp::DropRollup {
            db_id: db.id(),
            table_id,
            rollup_name: rollup_name.to_string(),
        })?;
        if let Some(slot) = state.table_mut(table_id) {
            *slot = updated;
        }
        info!(table = table_name, rollup = rollup_name, "rollup dropped");
        Ok(())
    }

    /// Copy of a table's current metadata. Index metas are shared `Arc`s, so
    /// the copy is cheap and never observes a later schema swap.
    pub fn table_snapshot(&self, db_name: &str, table_name: &str) -> Result<Table, FeError> {
        self.database(db_name)?.table_snapshot(table_name)
    }

    pub fn schema_version(
        &self,
        db_id: DbId,
        table_id: TableId,
        index_id: IndexId,
    ) -> Option<Arc<SchemaVersion>> {
        let db = self.get_database_by_id(db_id)?;
        let state = db.read_lock();
        state
            .table_by_id(table_id)
            .and_then(|t| t.index_meta(index_id))
            .cloned()
    }

    /// Applies a journaled catalog record without journaling it again. Alter
    /// job records are handled by recovery.
    pub(crate) fn replay_op(&self, op: &JournalOp) -> Result<(), FeError> {
        match op {
            JournalOp::CreateDatabase { db_id, name } => {
                self.observe_id(*db_id);
                let mut map = self.databases.write();
                if map.name_to_id.contains_key(name) {
                    return Err(FeError::Corruption {
                        message: format!("journal recreates existing database '{name}'"),
                    });
                }
                map.name_to_id.insert(name.clone(), *db_id);
                map.by_id.insert(*db_id, Arc::new(Database::new(*db_id, name)));
            }
            JournalOp::DropDatabase { db_id, name } => {
                let mut map = self.databases.write();
                map.name_to_id.remove(name);
                if let Some(db) = map.by_id.remove(db_id) {
                    db.mark_dropped();
                }
            }
            JournalOp::CreateTable { db_id, table } => {
                self.observe_table_ids(table);
                let db = self.replay_database(*db_id)?;
                db.write_lock().insert_table(table.clone())?;
            }
            JournalOp::DropTable { db_id, name, .. } => {
                let db = self.replay_database(*db_id)?;
                db.write_lock().remove_table(name);
            }
            JournalOp::DropRollup {
                db_id,
                table_id,
                rollup_name,
            } => {
                let db = self.replay_database(*db_id)?;
                let mut state = db.write_lock();
                let table = state.table_mut(*table_id).ok_or_else(|| {
                    FeError::not_found(ResourceType::Table, table_id.to_string())
                })?;
                table.remove_index(rollup_name)?;
            }
            JournalOp::UpsertAlterJob(_)
            | JournalOp::RemoveAlterJob { .. }
            | JournalOp::CancelAlterJob { .. } => {}
        }
        Ok(())
    }

    fn replay_database(&self, db_id: DbId) -> Result<Arc<Database>, FeError> {
        self.get_database_by_id(db_id)
            .ok_or_else(|| FeError::not_found(ResourceType::Database, db_id.to_string()))
    }

    fn observe_table_ids(&self, table: &Table) {
        self.observe_id(table.id());
        for (_, meta) in table.indexes() {
            self.observe_id(meta.index_id);
        }
    }

    pub(crate) fn image(&self) -> CatalogImage {
        let databases = self
            .databases()
            .iter()
            .map(|db| DatabaseImage {
                id: db.id(),
                name: db.name().to_string(),
                tables: db.read_lock().tables().cloned().collect(),
            })
            .collect();
        CatalogImage {
            next_id: self.next_id.load(Ordering::SeqCst),
            databases,
        }
    }

    /// Replaces the whole catalog with `image`. Only used before the
    /// frontend starts serving.
    pub(crate) fn load_image(&self, image: CatalogImage) -> Result<(), FeError> {
        let mut map = DatabaseMap::default();
        for db_image in image.databases {
            let mut state = DatabaseState::default();
            for table in db_image.tables {
                self.observe_table_ids(&table);
                state.insert_table(table)?;
            }
            self.observe_id(db_image.id);
            map.name_to_id.insert(db_image.name.clone(), db_image.id);
            map.by_id.insert(
                db_image.id,
                Arc::new(Database::with_state(db_image.id, db_image.name, state)),
            );
        }
        *self.databases.write() = map;
        self.next_id.fetch_max(image.next_id, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn validate_identifier(value: &str, name: &str) -> Result<(), FeError> {
    if value.is_empty() {
        return Err(FeError::Validation(format!("{name} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(FeError::Validation(format!(
            "{name} must be <= {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(FeError::Validation(format!(
            "{name} must contain only [A-Za-z0-9_]"
        )));
    }
    Ok(())
}

/// Column rules shared by table creation and schema change: unique names,
/// key columns first, and at least one key column for OLAP tables.
pub(crate) fn validate_columns(
    table_name: &str,
    engine: TableEngine,
    columns: &[ColumnDef],
) -> Result<(), FeError> {
    if columns.is_empty() {
        return Err(FeError::Validation(format!(
            "table '{table_name}' needs at least one column"
        )));
    }
    let mut seen = HashSet::new();
    let mut keys_done = false;
    for column in columns {
        validate_identifier(&column.name, "column name")?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(FeError::DuplicateColumn {
                table: table_name.to_string(),
                column: column.name.clone(),
            });
        }
        if column.is_key {
            if keys_done {
                return Err(FeError::Validation(format!(
                    "key column '{}' must precede value columns",
                    column.name
                )));
            }
            if !column.col_type.can_be_key() {
                return Err(FeError::Validation(format!(
                    "{} column '{}' cannot be a key column",
                    column.col_type, column.name
                )));
            }
        } else {
            keys_done = true;
        }
    }
    if engine == TableEngine::Olap && !columns[0].is_key {
        return Err(FeError::Validation(format!(
            "OLAP table '{table_name}' needs at least one key column"
        )));
    }
    Ok(())
}

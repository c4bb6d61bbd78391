use crate::catalog::table::{Table, TableState};
use crate::catalog::types::{DbId, TableId};
use crate::error::{FeError, ResourceType};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Table map of one database. Only reachable through [`Database`]'s lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseState {
    name_to_id: BTreeMap<String, TableId>,
    tables: BTreeMap<TableId, Table>,
}

impl DatabaseState {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.name_to_id.get(name).and_then(|id| self.tables.get(id))
    }

    pub fn table_by_id(&self, table_id: TableId) -> Option<&Table> {
        self.tables.get(&table_id)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.name_to_id.keys().map(String::as_str).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Tables currently owned by a schema change or rollup job.
    pub fn active_job_count(&self) -> usize {
        self.tables
            .values()
            .filter(|t| t.state() != TableState::Normal)
            .count()
    }

    pub(crate) fn table_mut(&mut self, table_id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(&table_id)
    }

    pub(crate) fn insert_table(&mut self, table: Table) -> Result<(), FeError> {
        table.check_consistency()?;
        if self.name_to_id.contains_key(table.name()) || self.tables.contains_key(&table.id()) {
            return Err(FeError::already_exists(ResourceType::Table, table.name()));
        }
        self.name_to_id.insert(table.name().to_string(), table.id());
        self.tables.insert(table.id(), table);
        Ok(())
    }

    pub(crate) fn remove_table(&mut self, name: &str) -> Option<Table> {
        let id = self.name_to_id.remove(name)?;
        self.tables.remove(&id)
    }
}

/// A named collection of tables guarded by a single readers-writer lock.
///
/// Readers take [`Database::read_lock`] for lookups; table structure is only
/// changed under the write lock, which is held for in-memory swaps and never
/// across worker round trips.
#[derive(Debug)]
pub struct Database {
    id: DbId,
    name: String,
    dropped: AtomicBool,
    state: RwLock<DatabaseState>,
}

impl Database {
    pub(crate) fn new(id: DbId, name: impl Into<String>) -> Self {
        Self::with_state(id, name, DatabaseState::default())
    }

    pub(crate) fn with_state(id: DbId, name: impl Into<String>, state: DatabaseState) -> Self {
        Self {
            id,
            name: name.into(),
            dropped: AtomicBool::new(false),
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set once the database has been removed from the catalog. Holders of
    /// an old `Arc<Database>` must not create anything in it afterwards.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, DatabaseState> {
        self.state.read()
    }

    pub fn try_read_lock_for(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, DatabaseState>> {
        self.state.try_read_for(timeout)
    }

    pub(crate) fn write_lock(&self) -> RwLockWriteGuard<'_, DatabaseState> {
        self.state.write()
    }

    /// Write lock on a database that is still registered in the catalog.
    pub(crate) fn write_live(&self) -> Result<RwLockWriteGuard<'_, DatabaseState>, FeError> {
        let guard = self.state.write();
        if self.is_dropped() {
            return Err(FeError::not_found(ResourceType::Database, &self.name));
        }
        Ok(guard)
    }

    pub(crate) fn try_write_lock_for(
        &self,
        timeout: Duration,
    ) -> Option<RwLockWriteGuard<'_, DatabaseState>> {
        self.state.try_write_for(timeout)
    }

    pub(crate) fn table_snapshot(&self, name: &str) -> Result<Table, FeError> {
        self.read_lock()
            .table(name)
            .cloned()
            .ok_or_else(|| FeError::not_found(ResourceType::Table, format!("{}.{name}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::catalog::schema::{ColumnDef, SchemaVersion};
    use crate::catalog::table::{Table, TableState};
    use crate::catalog::types::{ColumnType, TableEngine};
    use crate::error::FeError;
    use std::time::Duration;

    fn tbl(id: u64, name: &str) -> Table {
        Table::new(
            id,
            name,
            TableEngine::Olap,
            SchemaVersion::new(id + 100, 0, vec![ColumnDef::key("k1", ColumnType::Int)]),
        )
    }

    #[test]
    fn duplicate_table_name_is_rejected() {
        let db = Database::new(1, "db1");
        let mut state = db.write_lock();
        state.insert_table(tbl(2, "t")).expect("insert");
        assert!(state.insert_table(tbl(3, "t")).is_err());
        assert_eq!(state.table_names(), vec!["t"]);
    }

    #[test]
    fn readers_share_and_writer_excludes() {
        let db = Database::new(1, "db1");
        let r1 = db.read_lock();
        let r2 = db.read_lock();
        assert!(db.try_write_lock_for(Duration::from_millis(5)).is_none());
        drop(r1);
        drop(r2);
        let w = db.try_write_lock_for(Duration::from_millis(5));
        assert!(w.is_some());
        assert!(db.try_read_lock_for(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn active_job_count_tracks_table_state() {
        let db = Database::new(1, "db1");
        {
            let mut state = db.write_lock();
            state.insert_table(tbl(2, "a")).expect("a");
            state.insert_table(tbl(3, "b")).expect("b");
            state
                .table_mut(3)
                .expect("b")
                .begin_job(9, TableState::Rollup)
                .expect("begin");
        }
        assert_eq!(db.read_lock().active_job_count(), 1);
    }

    #[test]
    fn decoded_table_without_base_index_is_corruption() {
        let mut value = serde_json::to_value(tbl(2, "t")).expect("encode");
        value["base_index_id"] = serde_json::json!(999);
        let broken: Table = serde_json::from_value(value).expect("decode");

        let db = Database::new(1, "db1");
        let mut state = db.write_lock();
        assert!(matches!(
            state.insert_table(broken),
            Err(FeError::Corruption { .. })
        ));
        assert!(state.table_names().is_empty());
    }
}

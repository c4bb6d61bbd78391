use crate::catalog::types::{ColumnType, IndexId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub is_key: bool,
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ColumnDef {
    pub fn key(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            is_key: true,
            nullable: false,
            default_value: None,
        }
    }

    pub fn value(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            is_key: false,
            nullable: true,
            default_value: None,
        }
    }

    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// One published physical layout of an index. Never modified once shared;
/// schema evolution builds a new value and swaps the table's pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaVersion {
    pub index_id: IndexId,
    pub schema_version: u32,
    pub schema_hash: u32,
    pub columns: Vec<ColumnDef>,
}

impl SchemaVersion {
    pub fn new(index_id: IndexId, schema_version: u32, columns: Vec<ColumnDef>) -> Self {
        let schema_hash = compute_schema_hash(index_id, schema_version, &columns);
        Self {
            index_id,
            schema_version,
            schema_hash,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name_matches(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn key_column_count(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    /// Derives the next version of this index under a freshly allocated id.
    pub fn evolve(&self, new_index_id: IndexId, columns: Vec<ColumnDef>) -> Self {
        Self::new(new_index_id, self.schema_version + 1, columns)
    }
}

fn compute_schema_hash(index_id: IndexId, schema_version: u32, columns: &[ColumnDef]) -> u32 {
    let mut buf = Vec::with_capacity(16 + columns.len() * 16);
    buf.extend_from_slice(&index_id.to_be_bytes());
    buf.extend_from_slice(&schema_version.to_be_bytes());
    for column in columns {
        buf.extend_from_slice(column.name.to_ascii_lowercase().as_bytes());
        buf.push(0);
        buf.extend_from_slice(column.col_type.to_string().as_bytes());
        buf.push(u8::from(column.is_key));
        buf.push(u8::from(column.nullable));
    }
    crc32c::crc32c(&buf)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnPosition {
    First,
    After(String),
}

#[cfg(test)]
mod tests {
    use super::{ColumnDef, SchemaVersion};
    use crate::catalog::types::ColumnType;

    #[test]
    fn evolve_bumps_version_and_changes_hash() {
        let v0 = SchemaVersion::new(10, 0, vec![ColumnDef::key("k1", ColumnType::Int)]);
        let v1 = v0.evolve(
            11,
            vec![
                ColumnDef::key("k1", ColumnType::Int),
                ColumnDef::value("k2", ColumnType::Int).with_default("1"),
            ],
        );
        assert_eq!(v1.schema_version, 1);
        assert_eq!(v1.index_id, 11);
        assert_ne!(v0.schema_hash, v1.schema_hash);
        assert_eq!(v0.columns.len(), 1, "origin must stay untouched");
    }

    #[test]
    fn column_lookup_is_case_insensitive() {
        let v = SchemaVersion::new(1, 0, vec![ColumnDef::key("K1", ColumnType::BigInt)]);
        assert!(v.has_column("k1"));
        assert_eq!(v.key_column_count(), 1);
        assert!(v.column("k2").is_none());
    }
}

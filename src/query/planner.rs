use crate::catalog::Catalog;
use crate::catalog::schema::SchemaVersion;
use crate::catalog::types::{IndexId, TableId};
use crate::error::FeError;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub db_name: String,
    pub table_name: String,
    /// Columns the query reads. Empty means every base column.
    pub columns: Vec<String>,
}

impl ScanRequest {
    pub fn table(db_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            table_name: table_name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNode {
    OlapScan {
        table_id: TableId,
        table_name: String,
        index_id: IndexId,
        index_name: String,
        schema: Arc<SchemaVersion>,
        output_columns: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFragment {
    pub root: PlanNode,
    pub children: Vec<PlanFragment>,
}

impl PlanFragment {
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match &self.root {
            PlanNode::OlapScan {
                table_name,
                index_name,
                schema,
                output_columns,
                ..
            } => {
                let _ = writeln!(
                    out,
                    "{pad}OlapScan table={table_name} index={index_name} schema_version={} columns=[{}]",
                    schema.schema_version,
                    output_columns.join(", ")
                );
            }
        }
        for child in &self.children {
            child.explain_into(out, depth + 1);
        }
    }

    pub fn index_name(&self) -> &str {
        match &self.root {
            PlanNode::OlapScan { index_name, .. } => index_name,
        }
    }
}

/// Plans a single-fragment scan. Picks the narrowest index that covers every
/// requested column, preferring the base index on ties. The chosen schema
/// version is pinned by `Arc`, so a concurrent schema swap never changes
/// what an already planned scan reads.
pub fn plan_scan(catalog: &Catalog, request: &ScanRequest) -> Result<PlanFragment, FeError> {
    let table = catalog.table_snapshot(&request.db_name, &request.table_name)?;
    let base = table.base_index_meta();
    let base_name = table.name().to_string();

    let (index_name, schema) = if request.columns.is_empty() {
        (base_name, base)
    } else {
        for column in &request.columns {
            if !base.has_column(column) {
                return Err(FeError::UnknownColumn {
                    table: table.name().to_string(),
                    column: column.clone(),
                });
            }
        }
        let mut best = (base_name, base);
        for (name, meta) in table.indexes() {
            if meta.index_id == best.1.index_id {
                continue;
            }
            let covers = request.columns.iter().all(|c| meta.has_column(c));
            if covers && meta.columns.len() < best.1.columns.len() {
                best = (name.to_string(), Arc::clone(meta));
            }
        }
        best
    };

    let output_columns = if request.columns.is_empty() {
        schema.column_names().iter().map(|c| c.to_string()).collect()
    } else {
        request.columns.clone()
    };
    Ok(PlanFragment {
        root: PlanNode::OlapScan {
            table_id: table.id(),
            table_name: table.name().to_string(),
            index_id: schema.index_id,
            index_name,
            schema,
            output_columns,
        },
        children: Vec::new(),
    })
}

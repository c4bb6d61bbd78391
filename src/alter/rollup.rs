use crate::alter::job::{AlterJobPayload, JobType, ShadowIndex};
use crate::alter::registry::JobRegistry;
use crate::alter::{AlterClause, AlterHandler};
use crate::catalog::schema::SchemaVersion;
use crate::catalog::table::Table;
use crate::catalog::types::IndexId;
use crate::catalog::{validate_columns, validate_identifier};
use crate::error::{FeError, ResourceType};
use std::collections::HashSet;

/// Plans a new auxiliary index built from a subset of the base columns.
#[derive(Debug)]
pub struct RollupHandler {
    registry: JobRegistry,
}

impl Default for RollupHandler {
    fn default() -> Self {
        Self {
            registry: JobRegistry::new(JobType::Rollup),
        }
    }
}

impl AlterHandler for RollupHandler {
    fn job_type(&self) -> JobType {
        JobType::Rollup
    }

    fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    fn plan(
        &self,
        table: &Table,
        clauses: &[AlterClause],
        next_index_id: &dyn Fn() -> IndexId,
    ) -> Result<AlterJobPayload, FeError> {
        let [AlterClause::AddRollup { name, columns }] = clauses else {
            return Err(FeError::Validation(
                "a rollup request must contain exactly one ADD ROLLUP clause".into(),
            ));
        };
        validate_identifier(name, "rollup name")?;
        if table.index_id_by_name(name).is_some() {
            return Err(FeError::already_exists(
                ResourceType::Index,
                format!("{}.{name}", table.name()),
            ));
        }
        if columns.is_empty() {
            return Err(FeError::Validation(format!(
                "rollup '{name}' needs at least one column"
            )));
        }
        let base = table.base_index_meta();
        let mut seen = HashSet::new();
        let mut defs = Vec::with_capacity(columns.len());
        for column in columns {
            if !seen.insert(column.to_ascii_lowercase()) {
                return Err(FeError::DuplicateColumn {
                    table: name.clone(),
                    column: column.clone(),
                });
            }
            let def = base.column(column).ok_or_else(|| FeError::UnknownColumn {
                table: table.name().to_string(),
                column: column.clone(),
            })?;
            defs.push(def.clone());
        }
        validate_columns(name, table.engine(), &defs)?;
        Ok(AlterJobPayload::Rollup {
            base_index_id: base.index_id,
            rollup: ShadowIndex {
                origin_index_id: None,
                index_name: name.clone(),
                schema: SchemaVersion::new(next_index_id(), 0, defs),
            },
        })
    }
}

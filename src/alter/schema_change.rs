use crate::alter::job::{AlterJobPayload, JobType, ShadowIndex};
use crate::alter::registry::JobRegistry;
use crate::alter::{AlterClause, AlterHandler};
use crate::catalog::schema::{ColumnDef, ColumnPosition};
use crate::catalog::table::Table;
use crate::catalog::types::IndexId;
use crate::catalog::validate_columns;
use crate::error::{FeError, ResourceType};
use std::collections::BTreeMap;

/// Plans add/drop column requests: one shadow index per affected index,
/// each a copy of the current columns plus the requested delta.
#[derive(Debug)]
pub struct SchemaChangeHandler {
    registry: JobRegistry,
}

impl Default for SchemaChangeHandler {
    fn default() -> Self {
        Self {
            registry: JobRegistry::new(JobType::SchemaChange),
        }
    }
}

struct WorkingIndex {
    name: String,
    columns: Vec<ColumnDef>,
    changed: bool,
}

impl AlterHandler for SchemaChangeHandler {
    fn job_type(&self) -> JobType {
        JobType::SchemaChange
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
        let mut working: BTreeMap<IndexId, WorkingIndex> = table
            .indexes()
            .into_iter()
            .map(|(name, meta)| {
                (
                    meta.index_id,
                    WorkingIndex {
                        name: name.to_string(),
                        columns: meta.columns.clone(),
                        changed: false,
                    },
                )
            })
            .collect();
        let base_id = table.base_index_id();

        for clause in clauses {
            match clause {
                AlterClause::AddColumn {
                    column,
                    position,
                    rollup,
                } => {
                    let target = resolve_index(table, rollup.as_deref())?;
                    if target != base_id {
                        // Rollup columns are always backed by a base column.
                        let base = working_index(&mut working, base_id)?;
                        if base.columns.iter().all(|c| !c.name_matches(&column.name)) {
                            insert_column(table.name(), &mut base.columns, column.clone(), None)?;
                            base.changed = true;
                        }
                    }
                    let index = working_index(&mut working, target)?;
                    insert_column(table.name(), &mut index.columns, column.clone(), position.as_ref())?;
                    index.changed = true;
                }
                AlterClause::DropColumn { name, rollup } => match rollup {
                    Some(rollup) => {
                        let target = resolve_index(table, Some(rollup))?;
                        let index = working_index(&mut working, target)?;
                        remove_column(table.name(), &mut index.columns, name)?;
                        index.changed = true;
                    }
                    None => {
                        let base = working_index(&mut working, base_id)?;
                        remove_column(table.name(), &mut base.columns, name)?;
                        base.changed = true;
                        for (index_id, index) in working.iter_mut() {
                            if *index_id != base_id
                                && index.columns.iter().any(|c| c.name_matches(name))
                            {
                                index.columns.retain(|c| !c.name_matches(name));
                                index.changed = true;
                            }
                        }
                    }
                },
                AlterClause::AddRollup { .. } => {
                    return Err(FeError::Validation(
                        "rollup clauses are not schema changes".into(),
                    ));
                }
            }
        }

        let mut shadows = Vec::new();
        for (index_id, index) in working.into_iter().filter(|(_, w)| w.changed) {
            validate_columns(table.name(), table.engine(), &index.columns).map_err(|e| match e {
                FeError::Validation(msg) => {
                    FeError::Validation(format!("index '{}': {msg}", index.name))
                }
                other => other,
            })?;
            let origin = table.index_meta(index_id).ok_or_else(|| {
                FeError::not_found(ResourceType::Index, format!("{}.{}", table.name(), index.name))
            })?;
            shadows.push(ShadowIndex {
                origin_index_id: Some(index_id),
                index_name: index.name,
                schema: origin.evolve(next_index_id(), index.columns),
            });
        }
        if shadows.is_empty() {
            return Err(FeError::Validation(format!(
                "alter on table '{}' changes nothing",
                table.name()
            )));
        }
        Ok(AlterJobPayload::SchemaChange { shadows })
    }
}

fn resolve_index(table: &Table, rollup: Option<&str>) -> Result<IndexId, FeError> {
    match rollup {
        None => Ok(table.base_index_id()),
        Some(name) => table.index_id_by_name(name).ok_or_else(|| {
            FeError::not_found(ResourceType::Index, format!("{}.{name}", table.name()))
        }),
    }
}

fn working_index(
    working: &mut BTreeMap<IndexId, WorkingIndex>,
    index_id: IndexId,
) -> Result<&mut WorkingIndex, FeError> {
    working.get_mut(&index_id).ok_or_else(|| {
        FeError::not_found(ResourceType::Index, index_id.to_string())
    })
}

/// Without an explicit position, key columns go after the last key column
/// and value columns at the end.
fn insert_column(
    table: &str,
    columns: &mut Vec<ColumnDef>,
    column: ColumnDef,
    position: Option<&ColumnPosition>,
) -> Result<(), FeError> {
    if columns.iter().any(|c| c.name_matches(&column.name)) {
        return Err(FeError::DuplicateColumn {
            table: table.to_string(),
            column: column.name,
        });
    }
    if !column.nullable && column.default_value.is_none() && !column.is_key {
        return Err(FeError::Validation(format!(
            "new NOT NULL column '{}' needs a default value",
            column.name
        )));
    }
    let at = match position {
        Some(ColumnPosition::First) => 0,
        Some(ColumnPosition::After(after)) => {
            columns
                .iter()
                .position(|c| c.name_matches(after))
                .ok_or_else(|| FeError::UnknownColumn {
                    table: table.to_string(),
                    column: after.clone(),
                })?
                + 1
        }
        None if column.is_key => columns.iter().take_while(|c| c.is_key).count(),
        None => columns.len(),
    };
    columns.insert(at, column);
    Ok(())
}

fn remove_column(table: &str, columns: &mut Vec<ColumnDef>, name: &str) -> Result<(), FeError> {
    let at = columns
        .iter()
        .position(|c| c.name_matches(name))
        .ok_or_else(|| FeError::UnknownColumn {
            table: table.to_string(),
            column: name.to_string(),
        })?;
    if columns[at].is_key {
        return Err(FeError::Validation(format!(
            "cannot drop key column '{name}' of table '{table}'"
        )));
    }
    columns.remove(at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::SchemaChangeHandler;
    use crate::alter::job::AlterJobPayload;
    use crate::alter::{AlterClause, AlterHandler};
    use crate::catalog::schema::{ColumnDef, ColumnPosition, SchemaVersion};
    use crate::catalog::table::Table;
    use crate::catalog::types::{ColumnType, TableEngine};
    use crate::error::FeError;
    use std::cell::Cell;

    fn table() -> Table {
        let mut t = Table::new(
            2,
            "tbl1",
            TableEngine::Olap,
            SchemaVersion::new(
                3,
                0,
                vec![
                    ColumnDef::key("k1", ColumnType::Int),
                    ColumnDef::value("v1", ColumnType::BigInt),
                ],
            ),
        );
        t.add_index(
            "r1",
            SchemaVersion::new(
                4,
                0,
                vec![
                    ColumnDef::key("k1", ColumnType::Int),
                    ColumnDef::value("v1", ColumnType::BigInt),
                ],
            ),
        )
        .expect("rollup");
        t
    }

    fn plan(t: &Table, clauses: &[AlterClause]) -> Result<AlterJobPayload, FeError> {
        let next = Cell::new(100u64);
        SchemaChangeHandler::default().plan(t, clauses, &|| {
            let id = next.get();
            next.set(id + 1);
            id
        })
    }

    fn shadows(payload: &AlterJobPayload) -> Vec<(String, Vec<String>, u32)> {
        payload
            .shadow_indexes()
            .iter()
            .map(|s| {
                (
                    s.index_name.clone(),
                    s.schema.column_names().iter().map(|c| c.to_string()).collect(),
                    s.schema.schema_version,
                )
            })
            .collect()
    }

    #[test]
    fn add_value_column_touches_only_base() {
        let t = table();
        let payload = plan(
            &t,
            &[AlterClause::AddColumn {
                column: ColumnDef::value("k2", ColumnType::Int).with_default("1"),
                position: None,
                rollup: None,
            }],
        )
        .expect("plan");
        assert_eq!(
            shadows(&payload),
            vec![("tbl1".to_string(), vec!["k1".into(), "v1".into(), "k2".into()], 1)]
        );
    }

    #[test]
    fn add_key_column_lands_after_existing_keys() {
        let t = table();
        let payload = plan(
            &t,
            &[AlterClause::AddColumn {
                column: ColumnDef::key("k0", ColumnType::Int),
                position: Some(ColumnPosition::After("k1".into())),
                rollup: None,
            }],
        )
        .expect("plan");
        assert_eq!(shadows(&payload)[0].1, vec!["k1", "k0", "v1"]);
    }

    #[test]
    fn add_column_to_rollup_also_adds_it_to_base() {
        let t = table();
        let payload = plan(
            &t,
            &[AlterClause::AddColumn {
                column: ColumnDef::value("v2", ColumnType::Int),
                position: None,
                rollup: Some("r1".into()),
            }],
        )
        .expect("plan");
        let names: Vec<String> = shadows(&payload).into_iter().map(|s| s.0).collect();
        assert_eq!(names, vec!["tbl1".to_string(), "r1".to_string()]);
    }

    #[test]
    fn drop_column_cascades_to_rollups() {
        let t = table();
        let payload = plan(
            &t,
            &[AlterClause::DropColumn {
                name: "V1".into(),
                rollup: None,
            }],
        )
        .expect("plan");
        let s = shadows(&payload);
        assert_eq!(s.len(), 2);
        assert!(s.iter().all(|(_, cols, _)| cols == &vec!["k1".to_string()]));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let t = table();
        assert!(matches!(
            plan(
                &t,
                &[AlterClause::AddColumn {
                    column: ColumnDef::value("K1", ColumnType::Int),
                    position: None,
                    rollup: None,
                }]
            ),
            Err(FeError::DuplicateColumn { .. })
        ));
        assert!(matches!(
            plan(
                &t,
                &[AlterClause::DropColumn {
                    name: "nope".into(),
                    rollup: None,
                }]
            ),
            Err(FeError::UnknownColumn { .. })
        ));
        assert!(matches!(
            plan(
                &t,
                &[AlterClause::DropColumn {
                    name: "k1".into(),
                    rollup: None,
                }]
            ),
            Err(FeError::Validation(_))
        ));
        assert!(matches!(
            plan(
                &t,
                &[AlterClause::AddColumn {
                    column: ColumnDef::value("v9", ColumnType::Int).not_null(),
                    position: None,
                    rollup: None,
                }]
            ),
            Err(FeError::Validation(_))
        ));
    }
}

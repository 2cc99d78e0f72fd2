//! Schema diff — the migration plan between two versions.

use crate::schema::{DatabaseSchema, IndexSpec};

/// One migration step. `ChangePrimaryKey` is a planning error: the
/// migrator refuses it and the table must be deleted and recreated.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    AddTable(String),
    DeleteTable(String),
    AddIndex { table: String, spec: IndexSpec },
    DeleteIndex { table: String, name: String },
    ChangePrimaryKey { table: String },
}

/// Compute the ordered change list turning `old` into `new`.
///
/// Deleted tables come first; then, per table in `new`: add-table when
/// absent, otherwise primary-key comparison, deleted indexes, added
/// indexes. Iteration order of the schema maps makes the output stable.
pub fn diff(old: &DatabaseSchema, new: &DatabaseSchema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    for name in old.keys() {
        if !new.contains_key(name) {
            changes.push(SchemaChange::DeleteTable(name.clone()));
        }
    }

    for (name, new_table) in new {
        let Some(old_table) = old.get(name) else {
            changes.push(SchemaChange::AddTable(name.clone()));
            continue;
        };

        if !old_table.primary_key.same_primary_key(&new_table.primary_key) {
            changes.push(SchemaChange::ChangePrimaryKey {
                table: name.clone(),
            });
            continue;
        }

        for old_index in &old_table.indexes {
            if new_table.index(&old_index.name).is_none() {
                changes.push(SchemaChange::DeleteIndex {
                    table: name.clone(),
                    name: old_index.name.clone(),
                });
            }
        }
        for new_index in &new_table.indexes {
            if old_table.index(&new_index.name).is_none() {
                changes.push(SchemaChange::AddIndex {
                    table: name.clone(),
                    spec: new_index.clone(),
                });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_stores;

    #[test]
    fn diff_empty_to_schema_adds_tables() {
        let old = DatabaseSchema::new();
        let new = parse_stores(&[("users", "++id, name")]).unwrap();
        assert_eq!(diff(&old, &new), vec![SchemaChange::AddTable("users".into())]);
    }

    #[test]
    fn diff_detects_index_changes() {
        let old = parse_stores(&[("users", "++id, name, age")]).unwrap();
        let new = parse_stores(&[("users", "++id, name, &email")]).unwrap();
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                SchemaChange::DeleteIndex {
                    table: "users".into(),
                    name: "age".into(),
                },
                SchemaChange::AddIndex {
                    table: "users".into(),
                    spec: new["users"].index("email").unwrap().clone(),
                },
            ]
        );
    }

    #[test]
    fn diff_orders_deletes_before_adds() {
        let old = parse_stores(&[("legacy", "++id"), ("users", "++id")]).unwrap();
        let new = parse_stores(&[("users", "++id"), ("posts", "++id")]).unwrap();
        assert_eq!(
            diff(&old, &new),
            vec![
                SchemaChange::DeleteTable("legacy".into()),
                SchemaChange::AddTable("posts".into()),
            ]
        );
    }

    #[test]
    fn diff_flags_primary_key_change() {
        let old = parse_stores(&[("users", "++id, name")]).unwrap();
        let new = parse_stores(&[("users", "email, name")]).unwrap();
        assert_eq!(
            diff(&old, &new),
            vec![SchemaChange::ChangePrimaryKey {
                table: "users".into()
            }]
        );
    }

    #[test]
    fn diff_identical_schemas_is_empty() {
        let schema = parse_stores(&[("users", "++id, name, [a+b]")]).unwrap();
        assert!(diff(&schema, &schema).is_empty());
    }
}

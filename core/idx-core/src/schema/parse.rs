//! Schema definition-string parser.
//!
//! Grammar per table: `PK , IDX , IDX …` where each token matches
//! `('++')? ('&')? ( NAME | '[' NAME ('+' NAME)+ ']' )?` and NAME matches
//! `[A-Za-z_][A-Za-z0-9_]*`. An empty body after prefixes is allowed only
//! for the primary key and marks it outbound.

use smallvec::SmallVec;

use crate::error::{IdxError, IdxResult};
use crate::schema::{DatabaseSchema, IndexSpec, KeyPath, TableSchema};

/// Parse a full stores map. An empty map is a schema error.
pub fn parse_stores(defs: &[(&str, &str)]) -> IdxResult<DatabaseSchema> {
    if defs.is_empty() {
        return Err(IdxError::Schema("empty schema definition".to_string()));
    }
    let mut schema = DatabaseSchema::new();
    for (name, def) in defs {
        schema.insert(name.to_string(), parse_table(name, def)?);
    }
    Ok(schema)
}

/// Parse one table definition string.
pub fn parse_table(table: &str, def: &str) -> IdxResult<TableSchema> {
    let mut primary_key = None;
    let mut indexes: Vec<IndexSpec> = Vec::new();

    for (position, token) in def.split(',').enumerate() {
        let spec = parse_token(table, token.trim(), position == 0)?;
        if position == 0 {
            primary_key = Some(spec);
        } else {
            if indexes.iter().any(|idx| idx.name == spec.name) {
                return Err(IdxError::Schema(format!(
                    "table '{table}': duplicate index '{}'",
                    spec.name
                )));
            }
            indexes.push(spec);
        }
    }

    Ok(TableSchema {
        name: table.to_string(),
        // split(',') always yields at least one token
        primary_key: primary_key.expect("definition has a primary-key token"),
        indexes,
    })
}

fn parse_token(table: &str, token: &str, is_primary: bool) -> IdxResult<IndexSpec> {
    let mut rest = token;
    let mut auto_increment = false;
    let mut unique = false;

    loop {
        if let Some(stripped) = rest.strip_prefix("++") {
            auto_increment = true;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('&') {
            unique = true;
            rest = stripped;
        } else {
            break;
        }
    }

    if auto_increment && !is_primary {
        return Err(IdxError::Schema(format!(
            "table '{table}': auto-increment is only valid on the primary key"
        )));
    }

    let (name, key_path, compound) = if rest.is_empty() {
        if !is_primary {
            return Err(IdxError::Schema(format!(
                "table '{table}': secondary index with empty name"
            )));
        }
        (String::new(), None, false)
    } else if let Some(body) = rest.strip_prefix('[') {
        let body = body.strip_suffix(']').ok_or_else(|| {
            IdxError::Schema(format!("table '{table}': unterminated compound index '{rest}'"))
        })?;
        if body.is_empty() {
            return Err(IdxError::Schema(format!(
                "table '{table}': empty compound index body"
            )));
        }
        let fields: SmallVec<[String; 4]> = body.split('+').map(String::from).collect();
        if fields.len() < 2 {
            return Err(IdxError::Schema(format!(
                "table '{table}': compound index needs at least 2 fields, got {}",
                fields.len()
            )));
        }
        for field in &fields {
            validate_name(table, field)?;
        }
        if auto_increment {
            return Err(IdxError::Schema(format!(
                "table '{table}': auto-increment primary key cannot be compound"
            )));
        }
        (rest.to_string(), Some(KeyPath::Compound(fields)), true)
    } else {
        validate_name(table, rest)?;
        (
            rest.to_string(),
            Some(KeyPath::Single(rest.to_string())),
            false,
        )
    };

    let outbound = is_primary && key_path.is_none();

    Ok(IndexSpec {
        name,
        key_path,
        is_primary_key: is_primary,
        auto_increment,
        // primary keys are implicitly unique
        unique: unique || is_primary,
        outbound,
        compound,
    })
}

fn validate_name(table: &str, name: &str) -> IdxResult<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(IdxError::Schema(format!(
            "table '{table}': invalid identifier '{name}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_table() {
        let schema = parse_table("users", "++id, name, &email, age").unwrap();
        assert_eq!(schema.primary_key.name, "id");
        assert!(schema.primary_key.auto_increment);
        assert!(schema.primary_key.unique);
        assert!(!schema.primary_key.outbound);
        assert_eq!(schema.indexes.len(), 3);
        assert!(!schema.indexes[0].unique);
        assert!(schema.indexes[1].unique);
        assert_eq!(schema.indexes[1].name, "email");
    }

    #[test]
    fn parse_outbound_auto_primary() {
        let schema = parse_table("blobs", "++").unwrap();
        assert!(schema.primary_key.outbound);
        assert!(schema.primary_key.auto_increment);
        assert!(schema.primary_key.key_path.is_none());
        assert!(schema.indexes.is_empty());
    }

    #[test]
    fn parse_outbound_plain_primary() {
        let schema = parse_table("blobs", "").unwrap();
        assert!(schema.primary_key.outbound);
        assert!(!schema.primary_key.auto_increment);
    }

    #[test]
    fn parse_compound_index() {
        let schema = parse_table("people", "++id, [firstName+lastName]").unwrap();
        let idx = &schema.indexes[0];
        assert_eq!(idx.name, "[firstName+lastName]");
        assert!(idx.compound);
        assert_eq!(
            idx.key_path,
            Some(KeyPath::Compound(
                ["firstName", "lastName"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            ))
        );
    }

    #[test]
    fn parse_compound_primary_key() {
        let schema = parse_table("events", "[day+seq], kind").unwrap();
        assert!(schema.primary_key.compound);
        assert!(schema.primary_key.unique);
    }

    #[test]
    fn reject_empty_compound_body() {
        assert!(parse_table("t", "++id, []").is_err());
    }

    #[test]
    fn reject_single_field_compound() {
        assert!(parse_table("t", "++id, [only]").is_err());
    }

    #[test]
    fn reject_invalid_identifier_in_compound() {
        assert!(parse_table("t", "++id, [a+b c]").is_err());
        assert!(parse_table("t", "++id, [a+]").is_err());
    }

    #[test]
    fn reject_empty_secondary_name() {
        assert!(parse_table("t", "++id, , name").is_err());
        assert!(parse_table("t", "++id, &").is_err());
    }

    #[test]
    fn reject_invalid_identifier() {
        assert!(parse_table("t", "++id, 9lives").is_err());
        assert!(parse_table("t", "++id, na me").is_err());
        assert!(parse_table("t", "++id, *tags").is_err());
    }

    #[test]
    fn reject_secondary_auto_increment() {
        assert!(parse_table("t", "++id, ++seq").is_err());
    }

    #[test]
    fn reject_duplicate_index() {
        assert!(parse_table("t", "++id, name, &name").is_err());
    }

    #[test]
    fn reject_empty_stores() {
        assert!(parse_stores(&[]).is_err());
    }

    #[test]
    fn parse_stores_builds_schema() {
        let schema =
            parse_stores(&[("users", "++id, name"), ("logs", "++, at")]).unwrap();
        assert_eq!(schema.len(), 2);
        assert!(schema["logs"].primary_key.outbound);
    }
}

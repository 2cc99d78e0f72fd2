//! Engine-backed core implementation.
//!
//! This is where range plans become engine calls: the bulk get-all fast
//! path, `AnyOf` expansion into point queries, `NotEqual` expansion into a
//! filtered full scan, the cursor loop (unique-filter → user filter →
//! offset → collect → limit), and the cursor-algorithm hook with
//! continue-to-key jumps.

use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::Record;
use crate::core::{
    ChangeEntry, ChangeType, Core, CoreCursor, CoreTable, MutateRequest, MutateResponse,
    QueryItem, QueryRequest, QueryResponse,
};
use crate::engine::{Engine, EngineCapabilities, EngineTransaction, ScanEntry};
use crate::error::{IdxError, IdxResult};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::schema::{DatabaseSchema, KeyPath, TableSchema};

/// [`Core`] implementation executing against a host engine.
pub struct EngineCore {
    capabilities: EngineCapabilities,
    schema: DatabaseSchema,
    tables: DashMap<String, Arc<dyn CoreTable>>,
}

impl EngineCore {
    pub fn new(engine: &dyn Engine, schema: DatabaseSchema) -> Self {
        Self {
            capabilities: engine.capabilities(),
            schema,
            tables: DashMap::new(),
        }
    }
}

impl Core for EngineCore {
    fn table(&self, name: &str) -> IdxResult<Arc<dyn CoreTable>> {
        if let Some(table) = self.tables.get(name) {
            return Ok(table.clone());
        }
        let schema = self
            .schema
            .get(name)
            .ok_or_else(|| IdxError::InvalidTable(name.to_string()))?;
        let table: Arc<dyn CoreTable> = Arc::new(EngineCoreTable {
            capabilities: self.capabilities,
            schema: schema.clone(),
        });
        self.tables.insert(name.to_string(), table.clone());
        Ok(table)
    }
}

struct EngineCoreTable {
    capabilities: EngineCapabilities,
    schema: TableSchema,
}

impl EngineCoreTable {
    /// Normalize an index designator: empty or `":id"` addresses the
    /// primary key; anything else must be a declared index.
    fn resolve_index<'a>(&self, index: &'a str) -> IdxResult<&'a str> {
        if index.is_empty() || index == ":id" {
            return Ok("");
        }
        if self.schema.index(index).is_some() {
            Ok(index)
        } else {
            Err(IdxError::NotFound(format!(
                "index '{index}' on table '{}'",
                self.schema.name
            )))
        }
    }

    /// Materialize the scan entries a request touches, in iteration order.
    /// Returns the entries plus the key excluded by a `NotEqual` range.
    fn gather(
        &self,
        tx: &dyn EngineTransaction,
        index: &str,
        request: &QueryRequest,
        with_values: bool,
    ) -> IdxResult<(Vec<ScanEntry>, Option<Key>)> {
        let store = &self.schema.name;
        match &request.range {
            KeyRange::AnyOf { values } => {
                // Point queries in canonical order; early-exit on limit
                // when nothing downstream can reject entries.
                let cap = if request.filter.is_none() && request.algorithm.is_none() {
                    request.limit.map(|l| l + request.offset)
                } else {
                    None
                };
                let mut all = Vec::new();
                let points: Box<dyn Iterator<Item = &Key>> = if request.reverse {
                    Box::new(values.iter().rev())
                } else {
                    Box::new(values.iter())
                };
                for value in points {
                    if let Some(cap) = cap
                        && all.len() >= cap
                    {
                        break;
                    }
                    let sub = tx.scan(
                        store,
                        index,
                        Bound::Included(value.clone()),
                        Bound::Included(value.clone()),
                        request.reverse,
                        with_values,
                    )?;
                    all.extend(sub);
                }
                Ok((all, None))
            }
            KeyRange::NotEqual { value } => {
                let all = tx.scan(
                    store,
                    index,
                    Bound::Unbounded,
                    Bound::Unbounded,
                    request.reverse,
                    with_values,
                )?;
                Ok((all, Some(value.clone())))
            }
            contiguous => {
                let (lower, upper) = contiguous
                    .to_bounds()
                    .expect("AnyOf and NotEqual handled above");
                let all = tx.scan(store, index, lower, upper, request.reverse, with_values)?;
                Ok((all, None))
            }
        }
    }
}

impl CoreTable for EngineCoreTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn get(&self, tx: &dyn EngineTransaction, key: &Key) -> IdxResult<Option<Record>> {
        Ok(tx.get(&self.schema.name, key)?)
    }

    fn get_many(
        &self,
        tx: &dyn EngineTransaction,
        keys: &[Key],
    ) -> IdxResult<Vec<Option<Record>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(tx.get(&self.schema.name, key)?);
        }
        Ok(out)
    }

    fn count(
        &self,
        tx: &dyn EngineTransaction,
        index: &str,
        range: &KeyRange,
    ) -> IdxResult<u64> {
        let index = self.resolve_index(index)?;
        let store = &self.schema.name;
        match range {
            KeyRange::AnyOf { values } => {
                let mut total = 0;
                for value in values {
                    total += tx.count(
                        store,
                        index,
                        Bound::Included(value.clone()),
                        Bound::Included(value.clone()),
                    )?;
                }
                Ok(total)
            }
            KeyRange::NotEqual { value } => {
                let all = tx.count(store, index, Bound::Unbounded, Bound::Unbounded)?;
                let excluded = tx.count(
                    store,
                    index,
                    Bound::Included(value.clone()),
                    Bound::Included(value.clone()),
                )?;
                Ok(all - excluded)
            }
            contiguous => {
                let (lower, upper) = contiguous
                    .to_bounds()
                    .expect("AnyOf and NotEqual handled above");
                Ok(tx.count(store, index, lower, upper)?)
            }
        }
    }

    fn query(
        &self,
        tx: &dyn EngineTransaction,
        request: &QueryRequest,
    ) -> IdxResult<QueryResponse> {
        let index = self.resolve_index(&request.index)?;
        let store = &self.schema.name;
        trace!(table = %store, index, "core query");

        // Plain values-query fast path: bulk get-all straight from the
        // engine. Never with reverse, unique, a non-zero offset, or when
        // the engine's bulk read cannot serve the targeted index.
        let bulk_capable = if index.is_empty() {
            self.capabilities.get_all
        } else {
            self.capabilities.get_all_index
        };
        if request.algorithm.is_none()
            && request.filter.is_none()
            && request.values
            && !request.reverse
            && !request.unique
            && request.offset == 0
            && bulk_capable
            && let Some((lower, upper)) = request.range.to_bounds()
        {
            let rows = tx.get_all(store, index, lower, upper, request.limit)?;
            return Ok(QueryResponse {
                result: rows
                    .into_iter()
                    .map(|(pk, value)| QueryItem {
                        key: pk.clone(),
                        primary_key: pk,
                        value: Some(value),
                    })
                    .collect(),
            });
        }

        let with_values = request.values || request.filter.is_some();
        let (entries, exclude) = self.gather(tx, index, request, with_values)?;

        // Cursor loop: unique-filter, user filter (or algorithm), offset,
        // collect, limit.
        let mut algorithm = request.algorithm.as_ref().map(|factory| factory());
        let mut out = Vec::new();
        let mut skipped = 0usize;
        let mut last_key: Option<Key> = None;
        let mut i = 0usize;
        while i < entries.len() {
            let entry = &entries[i];

            if request.unique {
                if last_key.as_ref() == Some(&entry.key) {
                    i += 1;
                    continue;
                }
                last_key = Some(entry.key.clone());
            }

            if let Some(excluded) = &exclude
                && entry.key == *excluded
            {
                i += 1;
                continue;
            }

            if let Some(algorithm) = algorithm.as_mut() {
                match algorithm.next(&entry.key) {
                    crate::core::CursorStep::Collect => {}
                    crate::core::CursorStep::Skip => {
                        i += 1;
                        continue;
                    }
                    crate::core::CursorStep::Stop => break,
                    crate::core::CursorStep::JumpTo(target) => {
                        let jumped = entries[i..].partition_point(|e| e.key < target);
                        i += jumped.max(1);
                        continue;
                    }
                }
            } else if let Some(filter) = &request.filter {
                let keep = entry.value.as_ref().is_some_and(|v| filter(v));
                if !keep {
                    i += 1;
                    continue;
                }
            }

            if skipped < request.offset {
                skipped += 1;
                i += 1;
                continue;
            }

            out.push(QueryItem {
                key: entry.key.clone(),
                primary_key: entry.primary_key.clone(),
                value: if request.values {
                    entry.value.clone()
                } else {
                    None
                },
            });
            if let Some(limit) = request.limit
                && out.len() >= limit
            {
                break;
            }
            i += 1;
        }

        Ok(QueryResponse { result: out })
    }

    fn open_cursor(
        &self,
        tx: &dyn EngineTransaction,
        request: &QueryRequest,
    ) -> IdxResult<Option<CoreCursor>> {
        let index = self.resolve_index(&request.index)?;
        let (entries, exclude) = self.gather(tx, index, request, request.values)?;
        let mut items = Vec::with_capacity(entries.len());
        let mut last_key: Option<Key> = None;
        for entry in entries {
            if request.unique {
                if last_key.as_ref() == Some(&entry.key) {
                    continue;
                }
                last_key = Some(entry.key.clone());
            }
            if let Some(excluded) = &exclude
                && entry.key == *excluded
            {
                continue;
            }
            items.push(QueryItem {
                key: entry.key,
                primary_key: entry.primary_key,
                value: entry.value,
            });
        }
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CoreCursor::new(items, request.reverse)))
        }
    }

    fn mutate(
        &self,
        tx: &dyn EngineTransaction,
        request: MutateRequest,
    ) -> IdxResult<MutateResponse> {
        let store = &self.schema.name;
        let mut response = MutateResponse::default();
        match request {
            MutateRequest::Add { records, keys } => {
                self.write_records(tx, records, keys, false, &mut response)?;
            }
            MutateRequest::Put { records, keys } => {
                self.write_records(tx, records, keys, true, &mut response)?;
            }
            MutateRequest::Delete { keys } => {
                for key in keys {
                    if let Some(old) = tx.delete(store, &key)? {
                        response.changes.push(ChangeEntry {
                            table: store.clone(),
                            kind: ChangeType::Delete,
                            key,
                            record: None,
                            old_record: Some(old),
                        });
                    }
                }
            }
            MutateRequest::DeleteRange { range } => {
                let (lower, upper) = range.to_bounds().ok_or_else(|| {
                    IdxError::Data("delete-range requires a contiguous range".to_string())
                })?;
                let doomed =
                    tx.scan(store, "", lower.clone(), upper.clone(), false, true)?;
                for entry in doomed {
                    response.changes.push(ChangeEntry {
                        table: store.clone(),
                        kind: ChangeType::Delete,
                        key: entry.primary_key,
                        record: None,
                        old_record: entry.value,
                    });
                }
                tx.delete_range(store, lower, upper)?;
            }
        }
        response.num_failures = response.failures.len();
        Ok(response)
    }
}

impl EngineCoreTable {
    fn write_records(
        &self,
        tx: &dyn EngineTransaction,
        records: Vec<Record>,
        keys: Option<Vec<Key>>,
        overwrite: bool,
        response: &mut MutateResponse,
    ) -> IdxResult<()> {
        let store = &self.schema.name;
        let single = records.len() == 1;
        let auto_path = match (&self.schema.primary_key.key_path, self.schema.primary_key.auto_increment) {
            (Some(KeyPath::Single(prop)), true) => Some(prop.clone()),
            _ => None,
        };
        for (i, record) in records.into_iter().enumerate() {
            let key = keys.as_ref().and_then(|ks| ks.get(i).cloned());
            let mut stored = record.clone();
            match tx.insert(store, record, key, overwrite) {
                Ok(result) => {
                    // Mirror the engine's auto-key patch so change entries
                    // match what was actually stored.
                    if let Some(prop) = &auto_path
                        && stored.get(prop).is_none()
                        && let Some(object) = stored.as_object_mut()
                    {
                        object.insert(prop.clone(), result.key.to_value());
                    }
                    response.changes.push(ChangeEntry {
                        table: store.clone(),
                        kind: if overwrite {
                            ChangeType::Put
                        } else {
                            ChangeType::Add
                        },
                        key: result.key.clone(),
                        record: Some(stored),
                        old_record: result.old,
                    });
                    response.last_result = Some(result.key.clone());
                    response.results.push(Some(result.key));
                }
                Err(err) => {
                    let err = IdxError::from_engine(err);
                    // A lone failed mutation surfaces directly; bulk
                    // failures go into the per-index map.
                    if single {
                        return Err(err);
                    }
                    response.results.push(None);
                    response.failures.insert(i, err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CursorStep;
    use crate::engine::{Durability, MemoryEngine, TransactionMode};
    use crate::schema::parse_stores;
    use serde_json::json;

    fn setup(defs: &[(&str, &str)]) -> (MemoryEngine, EngineCore) {
        let engine = MemoryEngine::new("test");
        engine.open(1).unwrap();
        let schema = parse_stores(defs).unwrap();
        let changes: Vec<_> = schema
            .keys()
            .map(|name| crate::schema::SchemaChange::AddTable(name.clone()))
            .collect();
        engine.apply(&schema, &changes).unwrap();
        let core = EngineCore::new(&engine, schema);
        (engine, core)
    }

    fn tx(engine: &MemoryEngine, stores: &[&str]) -> Arc<dyn EngineTransaction> {
        let stores: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        engine
            .begin(TransactionMode::ReadWrite, &stores, Durability::Default)
            .unwrap()
    }

    fn seed_ages(engine: &MemoryEngine, core: &EngineCore, ages: &[i64]) {
        let t = tx(engine, &["users"]);
        let table = core.table("users").unwrap();
        let records = ages.iter().map(|age| json!({"age": age})).collect();
        table
            .mutate(&*t, MutateRequest::Add {
                records,
                keys: None,
            })
            .unwrap();
        t.commit().unwrap();
    }

    #[test]
    fn between_query_uses_index_order() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[30, 20, 25, 40, 22]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let request = QueryRequest::new(
            "age",
            KeyRange::between(21, 30, true, false).unwrap(),
        );
        let response = table.query(&*t, &request).unwrap();
        let ages: Vec<i64> = response
            .result
            .iter()
            .map(|item| item.value.as_ref().unwrap()["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![22, 25]);
    }

    #[test]
    fn any_of_concatenates_in_canonical_order() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[30, 20, 25]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let request = QueryRequest::new("age", KeyRange::any_of([30, 20]).unwrap());
        let response = table.query(&*t, &request).unwrap();
        let ages: Vec<i64> = response
            .result
            .iter()
            .map(|item| item.value.as_ref().unwrap()["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![20, 30]);

        let mut limited = request.clone();
        limited.limit = Some(1);
        let response = table.query(&*t, &limited).unwrap();
        assert_eq!(response.result.len(), 1);
    }

    #[test]
    fn not_equal_scans_and_filters() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[20, 25, 30]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let request = QueryRequest::new("age", KeyRange::not_equal(25).unwrap());
        let response = table.query(&*t, &request).unwrap();
        assert_eq!(response.result.len(), 2);
    }

    #[test]
    fn filter_applies_before_offset_and_limit() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[20, 21, 22, 23, 24, 25]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let mut request = QueryRequest::new("age", KeyRange::All);
        request.filter = Some(Arc::new(|record: &Record| {
            record["age"].as_i64().unwrap() % 2 == 0
        }));
        request.offset = 1;
        request.limit = Some(2);
        let response = table.query(&*t, &request).unwrap();
        let ages: Vec<i64> = response
            .result
            .iter()
            .map(|item| item.value.as_ref().unwrap()["age"].as_i64().unwrap())
            .collect();
        // Even ages are 20, 22, 24; offset 1 drops 20, limit 2 keeps 22, 24.
        assert_eq!(ages, vec![22, 24]);
    }

    #[test]
    fn unique_drops_consecutive_duplicate_keys() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[20, 20, 20, 30]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let mut request = QueryRequest::new("age", KeyRange::All);
        request.unique = true;
        request.values = false;
        let response = table.query(&*t, &request).unwrap();
        let keys: Vec<&Key> = response.result.iter().map(|item| &item.key).collect();
        assert_eq!(keys, vec![&Key::from(20), &Key::from(30)]);
    }

    #[test]
    fn algorithm_owns_filtering_and_jumps() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[20, 21, 22, 23, 24, 25, 26]);

        struct JumpOver {
            stop_at: Key,
        }
        impl crate::core::CursorAlgorithm for JumpOver {
            fn next(&mut self, key: &Key) -> CursorStep {
                if *key >= self.stop_at {
                    return CursorStep::Stop;
                }
                if *key == Key::from(21) {
                    // Skip the 22..24 region entirely.
                    return CursorStep::JumpTo(Key::from(25));
                }
                CursorStep::Collect
            }
        }

        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let mut request = QueryRequest::new("age", KeyRange::All);
        request.algorithm = Some(Arc::new(|| {
            Box::new(JumpOver {
                stop_at: Key::from(26),
            })
        }));
        let response = table.query(&*t, &request).unwrap();
        let ages: Vec<i64> = response
            .result
            .iter()
            .map(|item| item.value.as_ref().unwrap()["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![20, 25]);
    }

    #[test]
    fn bulk_add_reports_failure_map_and_keeps_successes() {
        let (engine, core) = setup(&[("users", "++id, &email")]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let response = table
            .mutate(&*t, MutateRequest::Add {
                records: vec![
                    json!({"email": "a@x"}),
                    json!({"email": "a@x"}),
                    json!({"email": "b@x"}),
                ],
                keys: None,
            })
            .unwrap();
        assert_eq!(response.num_failures, 1);
        assert!(response.failures.contains_key(&1));
        assert_eq!(response.results, vec![
            Some(Key::from(1)),
            None,
            Some(Key::from(3)),
        ]);
        assert_eq!(response.last_result, Some(Key::from(3)));
        t.commit().unwrap();
    }

    #[test]
    fn single_add_failure_propagates() {
        let (engine, core) = setup(&[("users", "++id, &email")]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        table
            .mutate(&*t, MutateRequest::Add {
                records: vec![json!({"email": "a@x"})],
                keys: None,
            })
            .unwrap();
        let err = table
            .mutate(&*t, MutateRequest::Add {
                records: vec![json!({"email": "a@x"})],
                keys: None,
            })
            .unwrap_err();
        assert!(matches!(err, IdxError::Constraint(_)));
    }

    #[test]
    fn delete_range_emits_change_entries() {
        let (engine, core) = setup(&[("users", "++id, age")]);
        seed_ages(&engine, &core, &[20, 21, 22]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let response = table
            .mutate(&*t, MutateRequest::DeleteRange {
                range: KeyRange::All,
            })
            .unwrap();
        assert_eq!(response.changes.len(), 3);
        assert!(response
            .changes
            .iter()
            .all(|c| c.kind == ChangeType::Delete && c.old_record.is_some()));
        assert_eq!(table.count(&*t, "", &KeyRange::All).unwrap(), 0);
        t.commit().unwrap();
    }

    #[test]
    fn unknown_index_is_not_found() {
        let (engine, core) = setup(&[("users", "++id")]);
        let t = tx(&engine, &["users"]);
        let table = core.table("users").unwrap();
        let err = table
            .query(&*t, &QueryRequest::new("nope", KeyRange::All))
            .unwrap_err();
        assert!(matches!(err, IdxError::NotFound(_)));
    }
}

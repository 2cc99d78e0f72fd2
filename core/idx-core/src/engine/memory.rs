//! In-memory reference engine.
//!
//! Ordered keyed storage on `BTreeMap`, one map per table for rows plus one
//! per secondary index. Transactions take a snapshot at begin: read-only
//! transactions share the committed table maps, read-write transactions
//! work on a private copy that is swapped in atomically at commit. Writers
//! are serialized by a single write token, so a committed transaction is
//! fully visible to every transaction that begins after it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use tracing::debug;

use crate::Record;
use crate::engine::{
    Durability, Engine, EngineCapabilities, EngineError, EngineResult, EngineTransaction,
    PutResult, ScanEntry, TransactionMode,
};
use crate::key::Key;
use crate::schema::{DatabaseSchema, IndexSpec, SchemaChange, TableSchema};

/// How long a writer waits for the write token before giving up.
const WRITE_TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Reference [`Engine`] backed by ordered in-memory maps.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    name: String,
    state: RwLock<EngineState>,
    write_token: Arc<Mutex<()>>,
}

#[derive(Default)]
struct EngineState {
    version: u64,
    open: bool,
    tables: BTreeMap<String, Arc<TableData>>,
}

#[derive(Clone)]
struct TableData {
    primary: IndexSpec,
    rows: BTreeMap<Key, Record>,
    indexes: BTreeMap<String, IndexData>,
    next_auto: i64,
}

#[derive(Clone)]
struct IndexData {
    spec: IndexSpec,
    entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl TableData {
    fn new(schema: &TableSchema) -> Self {
        Self {
            primary: schema.primary_key.clone(),
            rows: BTreeMap::new(),
            indexes: schema
                .indexes
                .iter()
                .map(|spec| {
                    (
                        spec.name.clone(),
                        IndexData {
                            spec: spec.clone(),
                            entries: BTreeMap::new(),
                        },
                    )
                })
                .collect(),
            next_auto: 1,
        }
    }

    fn add_index_entries(&mut self, pk: &Key, record: &Record) {
        for index in self.indexes.values_mut() {
            let Some(path) = &index.spec.key_path else {
                continue;
            };
            if let Some(ikey) = path.project(record) {
                index.entries.entry(ikey).or_default().insert(pk.clone());
            }
        }
    }

    fn remove_index_entries(&mut self, pk: &Key, record: &Record) {
        for index in self.indexes.values_mut() {
            let Some(path) = &index.spec.key_path else {
                continue;
            };
            if let Some(ikey) = path.project(record)
                && let Some(set) = index.entries.get_mut(&ikey)
            {
                set.remove(pk);
                if set.is_empty() {
                    index.entries.remove(&ikey);
                }
            }
        }
    }

    /// Per-record unique validation, done before any mutation so a failed
    /// record leaves the table untouched.
    fn check_unique(&self, pk: &Key, record: &Record) -> EngineResult<()> {
        for index in self.indexes.values() {
            if !index.spec.unique {
                continue;
            }
            let Some(path) = &index.spec.key_path else {
                continue;
            };
            let Some(ikey) = path.project(record) else {
                continue;
            };
            if let Some(set) = index.entries.get(&ikey)
                && set.iter().any(|existing| existing != pk)
            {
                return Err(EngineError::new(
                    "ConstraintError",
                    format!("unique index '{}' already has an entry for this key", index.spec.name),
                ));
            }
        }
        Ok(())
    }

    fn bump_generator(&mut self, pk: &Key) {
        if !self.primary.auto_increment {
            return;
        }
        if let Key::Number(n) = pk
            && n.is_finite()
            && *n >= self.next_auto as f64
        {
            self.next_auto = n.floor() as i64 + 1;
        }
    }
}

impl MemoryEngine {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name: name.to_string(),
                state: RwLock::new(EngineState::default()),
                write_token: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Engine for MemoryEngine {
    fn open(&self, version: u64) -> EngineResult<u64> {
        let mut state = self.inner.state.write();
        let old = state.version;
        if old > version {
            return Err(EngineError::new(
                "VersionError",
                format!("stored version {old} is above requested version {version}"),
            ));
        }
        state.version = version;
        state.open = true;
        debug!(db = %self.inner.name, old, new = version, "engine open");
        Ok(old)
    }

    fn apply(&self, schema: &DatabaseSchema, changes: &[SchemaChange]) -> EngineResult<()> {
        let mut state = self.inner.state.write();
        if !state.open {
            return Err(EngineError::new("DatabaseClosedError", "engine is closed"));
        }
        for change in changes {
            match change {
                SchemaChange::AddTable(name) => {
                    let table = schema.get(name).ok_or_else(|| {
                        EngineError::new("DataError", format!("no schema for table '{name}'"))
                    })?;
                    state
                        .tables
                        .insert(name.clone(), Arc::new(TableData::new(table)));
                }
                SchemaChange::DeleteTable(name) => {
                    state.tables.remove(name);
                }
                SchemaChange::AddIndex { table, spec } => {
                    let data = state.tables.get_mut(table).ok_or_else(|| {
                        EngineError::new("NotFoundError", format!("no table '{table}'"))
                    })?;
                    let data = Arc::make_mut(data);
                    let mut index = IndexData {
                        spec: spec.clone(),
                        entries: BTreeMap::new(),
                    };
                    // Backfill from existing rows.
                    if let Some(path) = &spec.key_path {
                        for (pk, record) in &data.rows {
                            if let Some(ikey) = path.project(record) {
                                let set = index.entries.entry(ikey).or_default();
                                if spec.unique && !set.is_empty() {
                                    return Err(EngineError::new(
                                        "ConstraintError",
                                        format!(
                                            "existing rows violate unique index '{}'",
                                            spec.name
                                        ),
                                    ));
                                }
                                set.insert(pk.clone());
                            }
                        }
                    }
                    data.indexes.insert(spec.name.clone(), index);
                }
                SchemaChange::DeleteIndex { table, name } => {
                    let data = state.tables.get_mut(table).ok_or_else(|| {
                        EngineError::new("NotFoundError", format!("no table '{table}'"))
                    })?;
                    Arc::make_mut(data).indexes.remove(name);
                }
                SchemaChange::ChangePrimaryKey { table } => {
                    return Err(EngineError::new(
                        "InvalidStateError",
                        format!("table '{table}': primary key changes require a recreate"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn begin(
        &self,
        mode: TransactionMode,
        stores: &[String],
        _durability: Durability,
    ) -> EngineResult<Arc<dyn EngineTransaction>> {
        let write_guard = match mode {
            TransactionMode::ReadWrite => Some(
                self.inner
                    .write_token
                    .try_lock_arc_for(WRITE_TOKEN_TIMEOUT)
                    .ok_or_else(|| {
                        EngineError::new("TimeoutError", "timed out waiting for the write token")
                    })?,
            ),
            TransactionMode::ReadOnly => None,
        };

        let state = self.inner.state.read();
        if !state.open {
            return Err(EngineError::new("DatabaseClosedError", "engine is closed"));
        }
        let mut shared = BTreeMap::new();
        for store in stores {
            let data = state.tables.get(store).ok_or_else(|| {
                EngineError::new("NotFoundError", format!("no table '{store}'"))
            })?;
            shared.insert(store.clone(), data.clone());
        }
        drop(state);

        let working = match mode {
            TransactionMode::ReadOnly => Working::Shared(shared),
            TransactionMode::ReadWrite => Working::Owned(
                shared
                    .into_iter()
                    .map(|(name, data)| (name, (*data).clone()))
                    .collect(),
            ),
        };

        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
        debug!(db = %self.inner.name, tx = id, ?mode, ?stores, "begin transaction");

        Ok(Arc::new(MemoryTransaction {
            engine: self.inner.clone(),
            id,
            mode,
            status: Mutex::new(TxStatus::Active),
            working: Mutex::new(working),
            write_guard: Mutex::new(write_guard),
        }))
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            get_all: true,
            get_all_index: true,
            durability_hint: false,
            early_commit: false,
        }
    }

    fn close(&self) {
        self.inner.state.write().open = false;
    }

    fn wipe(&self) -> EngineResult<()> {
        let mut state = self.inner.state.write();
        state.tables.clear();
        state.version = 0;
        state.open = false;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    Aborted,
}

enum Working {
    Shared(BTreeMap<String, Arc<TableData>>),
    Owned(BTreeMap<String, TableData>),
}

struct MemoryTransaction {
    engine: Arc<EngineInner>,
    id: u64,
    mode: TransactionMode,
    status: Mutex<TxStatus>,
    working: Mutex<Working>,
    write_guard: Mutex<Option<ArcMutexGuard<RawMutex, ()>>>,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> EngineResult<()> {
        if *self.status.lock() == TxStatus::Active {
            Ok(())
        } else {
            Err(EngineError::new(
                "TransactionInactiveError",
                "transaction has already finished",
            ))
        }
    }

    fn with_table<T>(
        &self,
        store: &str,
        f: impl FnOnce(&TableData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.ensure_active()?;
        let working = self.working.lock();
        match &*working {
            Working::Shared(tables) => match tables.get(store) {
                Some(data) => f(data),
                None => Err(scope_error(store)),
            },
            Working::Owned(tables) => match tables.get(store) {
                Some(data) => f(data),
                None => Err(scope_error(store)),
            },
        }
    }

    fn with_table_mut<T>(
        &self,
        store: &str,
        f: impl FnOnce(&mut TableData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.ensure_active()?;
        if self.mode != TransactionMode::ReadWrite {
            return Err(EngineError::new(
                "ReadOnlyError",
                "write in a read-only transaction",
            ));
        }
        let mut working = self.working.lock();
        match &mut *working {
            Working::Owned(tables) => match tables.get_mut(store) {
                Some(data) => f(data),
                None => Err(scope_error(store)),
            },
            Working::Shared(_) => unreachable!("read-write transactions own their tables"),
        }
    }

    fn finish(&self, next: TxStatus) {
        *self.status.lock() = next;
        // Releasing the token lets the next writer begin.
        self.write_guard.lock().take();
    }
}

fn scope_error(store: &str) -> EngineError {
    EngineError::new(
        "NotFoundError",
        format!("table '{store}' is not in this transaction's scope"),
    )
}

/// `BTreeMap::range` panics on inverted bounds; such ranges simply match
/// nothing.
fn empty_bounds(lower: &Bound<Key>, upper: &Bound<Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

fn scan_table(
    data: &TableData,
    index: &str,
    lower: Bound<Key>,
    upper: Bound<Key>,
    reverse: bool,
    with_values: bool,
) -> EngineResult<Vec<ScanEntry>> {
    let mut out = Vec::new();
    if empty_bounds(&lower, &upper) {
        return Ok(out);
    }
    if index.is_empty() {
        let iter = data.rows.range((lower, upper));
        let push = |out: &mut Vec<ScanEntry>, (k, v): (&Key, &Record)| {
            out.push(ScanEntry {
                key: k.clone(),
                primary_key: k.clone(),
                value: with_values.then(|| v.clone()),
            });
        };
        if reverse {
            for pair in iter.rev() {
                push(&mut out, pair);
            }
        } else {
            for pair in iter {
                push(&mut out, pair);
            }
        }
    } else {
        let idx = data
            .indexes
            .get(index)
            .ok_or_else(|| EngineError::new("NotFoundError", format!("no index '{index}'")))?;
        let mut push_entry = |ikey: &Key, pk: &Key| {
            out.push(ScanEntry {
                key: ikey.clone(),
                primary_key: pk.clone(),
                value: if with_values {
                    data.rows.get(pk).cloned()
                } else {
                    None
                },
            });
        };
        let iter = idx.entries.range((lower, upper));
        if reverse {
            for (ikey, pks) in iter.rev() {
                for pk in pks.iter().rev() {
                    push_entry(ikey, pk);
                }
            }
        } else {
            for (ikey, pks) in iter {
                for pk in pks {
                    push_entry(ikey, pk);
                }
            }
        }
    }
    Ok(out)
}

impl EngineTransaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn get(&self, store: &str, key: &Key) -> EngineResult<Option<Record>> {
        self.with_table(store, |data| Ok(data.rows.get(key).cloned()))
    }

    fn scan(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
        reverse: bool,
        with_values: bool,
    ) -> EngineResult<Vec<ScanEntry>> {
        self.with_table(store, |data| {
            scan_table(data, index, lower, upper, reverse, with_values)
        })
    }

    fn get_all(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Record)>> {
        self.with_table(store, |data| {
            let entries = scan_table(data, index, lower, upper, false, true)?;
            let take = limit.unwrap_or(usize::MAX);
            Ok(entries
                .into_iter()
                .take(take)
                .filter_map(|e| e.value.map(|v| (e.primary_key, v)))
                .collect())
        })
    }

    fn count(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
    ) -> EngineResult<u64> {
        self.with_table(store, |data| {
            if empty_bounds(&lower, &upper) {
                Ok(0)
            } else if index.is_empty() {
                Ok(data.rows.range((lower, upper)).count() as u64)
            } else {
                let idx = data.indexes.get(index).ok_or_else(|| {
                    EngineError::new("NotFoundError", format!("no index '{index}'"))
                })?;
                Ok(idx
                    .entries
                    .range((lower, upper))
                    .map(|(_, pks)| pks.len() as u64)
                    .sum())
            }
        })
    }

    fn insert(
        &self,
        store: &str,
        mut record: Record,
        key: Option<Key>,
        overwrite: bool,
    ) -> EngineResult<PutResult> {
        self.with_table_mut(store, |data| {
            let pk = match &data.primary.key_path {
                Some(path) => {
                    if key.is_some() {
                        return Err(EngineError::new(
                            "DataError",
                            "explicit key not allowed with an inbound key path",
                        ));
                    }
                    match path.project(&record) {
                        Some(pk) => pk,
                        None if data.primary.auto_increment => {
                            // The generator is consumed even if this add
                            // later fails its constraint checks.
                            let pk = Key::Number(data.next_auto as f64);
                            data.next_auto += 1;
                            patch_auto_key(&mut record, path, &pk)?;
                            pk
                        }
                        None => {
                            return Err(EngineError::new(
                                "DataError",
                                "record has no valid primary key",
                            ));
                        }
                    }
                }
                None => match key {
                    Some(pk) => pk,
                    None if data.primary.auto_increment => {
                        let pk = Key::Number(data.next_auto as f64);
                        data.next_auto += 1;
                        pk
                    }
                    None => {
                        return Err(EngineError::new(
                            "DataError",
                            "outbound table requires an explicit key",
                        ));
                    }
                },
            };

            if !overwrite && data.rows.contains_key(&pk) {
                return Err(EngineError::new(
                    "ConstraintError",
                    "a record with this primary key already exists",
                ));
            }
            data.check_unique(&pk, &record)?;
            data.bump_generator(&pk);

            let old = data.rows.get(&pk).cloned();
            if let Some(old_record) = &old {
                data.remove_index_entries(&pk, old_record);
            }
            data.add_index_entries(&pk, &record);
            data.rows.insert(pk.clone(), record);
            Ok(PutResult { key: pk, old })
        })
    }

    fn delete(&self, store: &str, key: &Key) -> EngineResult<Option<Record>> {
        self.with_table_mut(store, |data| {
            let old = data.rows.remove(key);
            if let Some(record) = &old {
                data.remove_index_entries(key, record);
            }
            Ok(old)
        })
    }

    fn delete_range(
        &self,
        store: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
    ) -> EngineResult<u64> {
        self.with_table_mut(store, |data| {
            if empty_bounds(&lower, &upper) {
                return Ok(0);
            }
            let keys: Vec<Key> = data.rows.range((lower, upper)).map(|(k, _)| k.clone()).collect();
            for key in &keys {
                if let Some(record) = data.rows.remove(key) {
                    data.remove_index_entries(key, &record);
                }
            }
            Ok(keys.len() as u64)
        })
    }

    fn commit(&self) -> EngineResult<()> {
        self.ensure_active()?;
        if self.mode == TransactionMode::ReadWrite {
            let mut working = self.working.lock();
            let tables = match &mut *working {
                Working::Owned(tables) => std::mem::take(tables),
                Working::Shared(_) => unreachable!("read-write transactions own their tables"),
            };
            let mut state = self.engine.state.write();
            for (name, data) in tables {
                state.tables.insert(name, Arc::new(data));
            }
        }
        debug!(db = %self.engine.name, tx = self.id, "commit");
        self.finish(TxStatus::Committed);
        Ok(())
    }

    fn abort(&self) -> EngineResult<()> {
        self.ensure_active()?;
        debug!(db = %self.engine.name, tx = self.id, "abort");
        self.finish(TxStatus::Aborted);
        Ok(())
    }

    fn is_active(&self) -> bool {
        *self.status.lock() == TxStatus::Active
    }
}

fn patch_auto_key(record: &mut Record, path: &crate::schema::KeyPath, pk: &Key) -> EngineResult<()> {
    let crate::schema::KeyPath::Single(prop) = path else {
        return Err(EngineError::new(
            "DataError",
            "auto-increment key path must be a single property",
        ));
    };
    let Some(object) = record.as_object_mut() else {
        return Err(EngineError::new(
            "DataError",
            "cannot assign an auto-increment key to a non-object record",
        ));
    };
    object.insert(prop.clone(), pk.to_value());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_stores;
    use serde_json::json;

    fn engine_with(defs: &[(&str, &str)]) -> MemoryEngine {
        let engine = MemoryEngine::new("test");
        engine.open(1).unwrap();
        let schema = parse_stores(defs).unwrap();
        let changes: Vec<SchemaChange> = schema
            .keys()
            .map(|name| SchemaChange::AddTable(name.clone()))
            .collect();
        engine.apply(&schema, &changes).unwrap();
        engine
    }

    fn rw(engine: &MemoryEngine, stores: &[&str]) -> Arc<dyn EngineTransaction> {
        let stores: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        engine
            .begin(TransactionMode::ReadWrite, &stores, Durability::Default)
            .unwrap()
    }

    #[test]
    fn insert_assigns_and_patches_auto_key() {
        let engine = engine_with(&[("users", "++id, name")]);
        let tx = rw(&engine, &["users"]);
        let result = tx
            .insert("users", json!({"name": "Alice"}), None, false)
            .unwrap();
        assert_eq!(result.key, Key::from(1));
        let stored = tx.get("users", &Key::from(1)).unwrap().unwrap();
        assert_eq!(stored, json!({"name": "Alice", "id": 1}));
        tx.commit().unwrap();
    }

    #[test]
    fn generator_follows_explicit_keys() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({"id": 40}), None, false).unwrap();
        let result = tx.insert("users", json!({}), None, false).unwrap();
        assert_eq!(result.key, Key::from(41));
        tx.commit().unwrap();
    }

    #[test]
    fn add_duplicate_primary_key_fails() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({"id": 1}), None, false).unwrap();
        let err = tx.insert("users", json!({"id": 1}), None, false).unwrap_err();
        assert_eq!(err.name, "ConstraintError");
        tx.commit().unwrap();
    }

    #[test]
    fn unique_index_enforced_per_record() {
        let engine = engine_with(&[("users", "++id, &email")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({"email": "a@x"}), None, false)
            .unwrap();
        let err = tx
            .insert("users", json!({"email": "a@x"}), None, false)
            .unwrap_err();
        assert_eq!(err.name, "ConstraintError");
        // The failed record left nothing behind.
        assert_eq!(tx.count("users", "", Bound::Unbounded, Bound::Unbounded).unwrap(), 1);
        tx.commit().unwrap();
    }

    #[test]
    fn put_same_record_keeps_unique_entry() {
        let engine = engine_with(&[("users", "++id, &email")]);
        let tx = rw(&engine, &["users"]);
        let key = tx
            .insert("users", json!({"email": "a@x"}), None, false)
            .unwrap()
            .key;
        let result = tx
            .insert("users", json!({"id": 1, "email": "a@x", "v": 2}), None, true)
            .unwrap();
        assert_eq!(result.key, key);
        assert!(result.old.is_some());
        tx.commit().unwrap();
    }

    #[test]
    fn explicit_key_with_inbound_path_rejected() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        let err = tx
            .insert("users", json!({"id": 1}), Some(Key::from(1)), false)
            .unwrap_err();
        assert_eq!(err.name, "DataError");
    }

    #[test]
    fn outbound_table_requires_key() {
        let engine = engine_with(&[("blobs", "")]);
        let tx = rw(&engine, &["blobs"]);
        assert_eq!(
            tx.insert("blobs", json!({"x": 1}), None, false).unwrap_err().name,
            "DataError"
        );
        let result = tx
            .insert("blobs", json!({"x": 1}), Some(Key::from("k")), false)
            .unwrap();
        assert_eq!(result.key, Key::from("k"));
        // The key is never embedded into the record.
        assert_eq!(tx.get("blobs", &Key::from("k")).unwrap().unwrap(), json!({"x": 1}));
    }

    #[test]
    fn secondary_scan_orders_by_index_then_primary() {
        let engine = engine_with(&[("users", "++id, age")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({"age": 30}), None, false).unwrap();
        tx.insert("users", json!({"age": 20}), None, false).unwrap();
        tx.insert("users", json!({"age": 30}), None, false).unwrap();
        let entries = tx
            .scan("users", "age", Bound::Unbounded, Bound::Unbounded, false, false)
            .unwrap();
        let keys: Vec<(Key, Key)> = entries
            .into_iter()
            .map(|e| (e.key, e.primary_key))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Key::from(20), Key::from(2)),
                (Key::from(30), Key::from(1)),
                (Key::from(30), Key::from(3)),
            ]
        );
        let reversed = tx
            .scan("users", "age", Bound::Unbounded, Bound::Unbounded, true, false)
            .unwrap();
        assert_eq!(reversed[0].primary_key, Key::from(3));
        tx.commit().unwrap();
    }

    #[test]
    fn snapshot_isolation() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({}), None, false).unwrap();
        tx.commit().unwrap();

        let reader = engine
            .begin(TransactionMode::ReadOnly, &["users".to_string()], Durability::Default)
            .unwrap();
        let writer = rw(&engine, &["users"]);
        writer.insert("users", json!({}), None, false).unwrap();
        writer.commit().unwrap();

        // The reader still sees its snapshot.
        assert_eq!(
            reader.count("users", "", Bound::Unbounded, Bound::Unbounded).unwrap(),
            1
        );
        let late = engine
            .begin(TransactionMode::ReadOnly, &["users".to_string()], Durability::Default)
            .unwrap();
        assert_eq!(
            late.count("users", "", Bound::Unbounded, Bound::Unbounded).unwrap(),
            2
        );
    }

    #[test]
    fn abort_discards_writes() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({}), None, false).unwrap();
        tx.abort().unwrap();

        let reader = engine
            .begin(TransactionMode::ReadOnly, &["users".to_string()], Durability::Default)
            .unwrap();
        assert_eq!(
            reader.count("users", "", Bound::Unbounded, Bound::Unbounded).unwrap(),
            0
        );
    }

    #[test]
    fn operations_after_finish_are_inactive() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = rw(&engine, &["users"]);
        tx.commit().unwrap();
        assert_eq!(
            tx.get("users", &Key::from(1)).unwrap_err().name,
            "TransactionInactiveError"
        );
        assert!(!tx.is_active());
    }

    #[test]
    fn write_in_read_only_rejected() {
        let engine = engine_with(&[("users", "++id")]);
        let tx = engine
            .begin(TransactionMode::ReadOnly, &["users".to_string()], Durability::Default)
            .unwrap();
        assert_eq!(
            tx.insert("users", json!({}), None, false).unwrap_err().name,
            "ReadOnlyError"
        );
    }

    #[test]
    fn out_of_scope_store_rejected() {
        let engine = engine_with(&[("users", "++id"), ("logs", "++id")]);
        let tx = rw(&engine, &["users"]);
        assert_eq!(
            tx.get("logs", &Key::from(1)).unwrap_err().name,
            "NotFoundError"
        );
    }

    #[test]
    fn delete_range_unbounded_clears_store() {
        let engine = engine_with(&[("users", "++id, age")]);
        let tx = rw(&engine, &["users"]);
        for age in [20, 21, 22] {
            tx.insert("users", json!({"age": age}), None, false).unwrap();
        }
        let removed = tx
            .delete_range("users", Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            tx.count("users", "age", Bound::Unbounded, Bound::Unbounded).unwrap(),
            0
        );
        tx.commit().unwrap();
    }

    #[test]
    fn add_index_backfills_existing_rows() {
        let engine = engine_with(&[("users", "++id, name")]);
        let tx = rw(&engine, &["users"]);
        tx.insert("users", json!({"name": "a", "age": 30}), None, false)
            .unwrap();
        tx.commit().unwrap();

        let schema = parse_stores(&[("users", "++id, name, age")]).unwrap();
        let spec = schema["users"].index("age").unwrap().clone();
        engine
            .apply(
                &schema,
                &[SchemaChange::AddIndex {
                    table: "users".into(),
                    spec,
                }],
            )
            .unwrap();

        let tx = rw(&engine, &["users"]);
        assert_eq!(
            tx.count("users", "age", Bound::Unbounded, Bound::Unbounded).unwrap(),
            1
        );
        tx.commit().unwrap();
    }

    #[test]
    fn reopen_above_stored_version_errors() {
        let engine = MemoryEngine::new("test");
        engine.open(3).unwrap();
        engine.close();
        assert_eq!(engine.open(2).unwrap_err().name, "VersionError");
        assert_eq!(engine.open(3).unwrap(), 3);
    }
}

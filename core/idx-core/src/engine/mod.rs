//! Engine interface — the host-supplied ordered keyed store.
//!
//! The query layer never touches storage directly; it speaks to an
//! [`Engine`] through this narrow contract. The engine must provide
//! ordered keyed stores with unique-constraint enforcement, snapshot
//! transactions in read-only and read-write modes over a declared store
//! set, ranged scans in both directions, counts, and (optionally) a bulk
//! get-all fast path, durability hints, and early commit. Optional
//! capabilities are feature-detected via [`Engine::capabilities`].
//!
//! Engine failures carry the engine's own error *name*; the upper layers
//! fold names into error kinds through a fixed mapping table
//! (`IdxError::from_engine`).

pub mod memory;

use std::ops::Bound;
use std::sync::Arc;

use crate::Record;
use crate::key::Key;
use crate::schema::{DatabaseSchema, SchemaChange};

pub use memory::MemoryEngine;

/// Error reported by an engine: a conventional error name plus a message.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub name: String,
    pub message: String,
}

impl EngineError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Transaction mode over a declared store set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Durability hint forwarded to the engine on transaction begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    Default,
    Relaxed,
    Strict,
}

/// Optional-capability report.
#[derive(Debug, Clone, Copy)]
pub struct EngineCapabilities {
    /// Bulk "get all records in range" on the primary store
    pub get_all: bool,
    /// Bulk get-all also serves secondary indexes
    pub get_all_index: bool,
    /// Durability hints are honored
    pub durability_hint: bool,
    /// Early commit hints are honored
    pub early_commit: bool,
}

/// One step of an index scan: index key, primary key, and the record when
/// the scan was asked for values.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<Record>,
}

/// Result of a single add/put.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Effective primary key (assigned by the generator when absent)
    pub key: Key,
    /// Previous record under that key, when overwritten
    pub old: Option<Record>,
}

/// Host storage engine.
pub trait Engine: Send + Sync {
    /// Open at `version`, returning the previously stored version
    /// (0 for a fresh database). A stored version above the requested one
    /// is a `VersionError`.
    fn open(&self, version: u64) -> EngineResult<u64>;

    /// Apply one migration step's schema changes. `schema` is the full
    /// target schema at this step; added indexes are backfilled from
    /// existing rows.
    fn apply(&self, schema: &DatabaseSchema, changes: &[SchemaChange]) -> EngineResult<()>;

    /// Begin a transaction over the declared stores.
    fn begin(
        &self,
        mode: TransactionMode,
        stores: &[String],
        durability: Durability,
    ) -> EngineResult<Arc<dyn EngineTransaction>>;

    fn capabilities(&self) -> EngineCapabilities;

    /// Mark the engine closed; in-flight handles become invalid.
    fn close(&self);

    /// Drop the whole database.
    fn wipe(&self) -> EngineResult<()>;
}

/// One engine transaction. All reads observe the snapshot taken at begin
/// plus this transaction's own writes.
pub trait EngineTransaction: Send + Sync {
    fn mode(&self) -> TransactionMode;

    fn get(&self, store: &str, key: &Key) -> EngineResult<Option<Record>>;

    /// Ordered scan over an index range. `index` is empty for the primary
    /// store. The returned entries are a stable snapshot cursor: callers
    /// iterate, jump by key, or re-enter it freely without further engine
    /// calls.
    fn scan(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
        reverse: bool,
        with_values: bool,
    ) -> EngineResult<Vec<ScanEntry>>;

    /// Bulk fast path: all (primary key, record) pairs in range, ascending.
    fn get_all(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<(Key, Record)>>;

    fn count(
        &self,
        store: &str,
        index: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
    ) -> EngineResult<u64>;

    /// Add (`overwrite` false) or put (`overwrite` true) one record.
    ///
    /// Key resolution: outbound primary keys are taken from `key`
    /// (required unless auto-increment); inbound keys are projected from
    /// the record, so passing `key` is a `DataError`; a missing
    /// auto-increment property is assigned from the generator and patched
    /// into the stored record. Uniqueness of the primary key (add only)
    /// and of every unique index is enforced per record.
    fn insert(
        &self,
        store: &str,
        record: Record,
        key: Option<Key>,
        overwrite: bool,
    ) -> EngineResult<PutResult>;

    /// Delete one key, returning the previous record. Missing keys are
    /// not an error.
    fn delete(&self, store: &str, key: &Key) -> EngineResult<Option<Record>>;

    /// Delete every record whose primary key falls in range; returns the
    /// number deleted. An unbounded range clears the store.
    fn delete_range(
        &self,
        store: &str,
        lower: Bound<Key>,
        upper: Bound<Key>,
    ) -> EngineResult<u64>;

    /// Commit. Idempotence is not required; callers commit exactly once.
    fn commit(&self) -> EngineResult<()>;

    /// Roll back all writes.
    fn abort(&self) -> EngineResult<()>;

    fn is_active(&self) -> bool;
}

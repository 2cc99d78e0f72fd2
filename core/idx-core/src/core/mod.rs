//! Core table abstraction — the narrow capability surface the query layer
//! executes against.
//!
//! A [`Core`] vends per-table handles whose operations (`get`, `get_many`,
//! `count`, `query`, `open_cursor`, `mutate`) all take the engine
//! transaction they run under. Middleware wraps this surface
//! ([`crate::middleware`]); the engine-backed implementation lives in
//! [`adapter`].

pub mod adapter;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Record;
use crate::engine::EngineTransaction;
use crate::error::IdxResult;
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::schema::TableSchema;

pub use adapter::EngineCore;

/// Post-cursor record predicate.
pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Outcome of one cursor-algorithm step.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorStep {
    /// Collect the current record and advance
    Collect,
    /// Skip the current record and advance
    Skip,
    /// Terminate iteration
    Stop,
    /// Continue from the first key at or above the given one
    JumpTo(Key),
}

/// A stateful step predicate driving a cursor. The algorithm owns all
/// filtering for its query; the cursor loop applies no user filter when an
/// algorithm is attached.
pub trait CursorAlgorithm: Send {
    fn next(&mut self, key: &Key) -> CursorStep;
}

/// Builds a fresh algorithm instance per execution, so query contexts stay
/// cloneable and re-runnable.
pub type AlgorithmFactory = Arc<dyn Fn() -> Box<dyn CursorAlgorithm> + Send + Sync>;

/// One range/cursor request against a table.
#[derive(Clone)]
pub struct QueryRequest {
    /// Index name; empty targets the primary key
    pub index: String,
    pub range: KeyRange,
    /// Collect record values (true) or only keys (false)
    pub values: bool,
    pub reverse: bool,
    /// Drop consecutive duplicate index keys
    pub unique: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Post-cursor user filter
    pub filter: Option<RecordPredicate>,
    pub algorithm: Option<AlgorithmFactory>,
    /// Bypass reading hooks (observed by middleware, not by the adapter)
    pub raw: bool,
}

impl QueryRequest {
    pub fn new(index: impl Into<String>, range: KeyRange) -> Self {
        Self {
            index: index.into(),
            range,
            values: true,
            reverse: false,
            unique: false,
            limit: None,
            offset: 0,
            filter: None,
            algorithm: None,
            raw: false,
        }
    }
}

/// One collected cursor position: index key, primary key, and the record
/// when the request asked for values.
#[derive(Debug, Clone)]
pub struct QueryItem {
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<Record>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub result: Vec<QueryItem>,
}

/// Mutation request variants.
#[derive(Clone)]
pub enum MutateRequest {
    Add {
        records: Vec<Record>,
        keys: Option<Vec<Key>>,
    },
    Put {
        records: Vec<Record>,
        keys: Option<Vec<Key>>,
    },
    Delete {
        keys: Vec<Key>,
    },
    DeleteRange {
        range: KeyRange,
    },
}

/// Mutation kind recorded for change subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Put,
    Delete,
}

/// One committed (or pending) record change.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub table: String,
    pub kind: ChangeType,
    pub key: Key,
    pub record: Option<Record>,
    pub old_record: Option<Record>,
}

/// Result of a mutation. Bulk failures are keyed by input index; single
/// failures are propagated as errors before a response is built.
#[derive(Debug, Default)]
pub struct MutateResponse {
    pub num_failures: usize,
    pub failures: BTreeMap<usize, crate::error::IdxError>,
    pub results: Vec<Option<Key>>,
    pub last_result: Option<Key>,
    pub changes: Vec<ChangeEntry>,
}

/// Snapshot cursor over collected scan positions. Supports forward
/// iteration, bulk advance, and continue-to-key jumps.
pub struct CoreCursor {
    entries: Vec<QueryItem>,
    pos: usize,
    reverse: bool,
}

impl CoreCursor {
    pub fn new(entries: Vec<QueryItem>, reverse: bool) -> Self {
        Self {
            entries,
            pos: 0,
            reverse,
        }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.entries.len()
    }

    pub fn key(&self) -> Option<&Key> {
        self.entries.get(self.pos).map(|e| &e.key)
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.entries.get(self.pos).map(|e| &e.primary_key)
    }

    pub fn value(&self) -> Option<&Record> {
        self.entries.get(self.pos).and_then(|e| e.value.as_ref())
    }

    pub fn advance(&mut self) {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
    }

    pub fn advance_by(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.entries.len());
    }

    /// Move to the first position whose key is at or past `target` in the
    /// cursor's direction.
    pub fn continue_to(&mut self, target: &Key) {
        while let Some(entry) = self.entries.get(self.pos) {
            let passed = if self.reverse {
                entry.key <= *target
            } else {
                entry.key >= *target
            };
            if passed {
                break;
            }
            self.pos += 1;
        }
    }
}

/// The composed core surface handed to tables and middleware.
pub trait Core: Send + Sync {
    fn table(&self, name: &str) -> IdxResult<Arc<dyn CoreTable>>;
}

/// Per-table core operations. Every call runs under the supplied engine
/// transaction.
pub trait CoreTable: Send + Sync {
    fn schema(&self) -> &TableSchema;

    fn get(&self, tx: &dyn EngineTransaction, key: &Key) -> IdxResult<Option<Record>>;

    /// Records for `keys` in input order; misses are `None`.
    fn get_many(
        &self,
        tx: &dyn EngineTransaction,
        keys: &[Key],
    ) -> IdxResult<Vec<Option<Record>>>;

    fn count(&self, tx: &dyn EngineTransaction, index: &str, range: &KeyRange)
    -> IdxResult<u64>;

    fn query(&self, tx: &dyn EngineTransaction, request: &QueryRequest)
    -> IdxResult<QueryResponse>;

    /// Cursor over the request's range; `None` when it matches nothing.
    fn open_cursor(
        &self,
        tx: &dyn EngineTransaction,
        request: &QueryRequest,
    ) -> IdxResult<Option<CoreCursor>>;

    fn mutate(
        &self,
        tx: &dyn EngineTransaction,
        request: MutateRequest,
    ) -> IdxResult<MutateResponse>;
}

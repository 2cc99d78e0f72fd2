//! # IDX — Embedded Indexed Record Store
//!
//! IDX is an embedded, schema-driven record store with a fluent query
//! builder. Written in pure Rust, it keeps named tables of JSON records,
//! each with a primary key and any number of secondary indexes (compound
//! and unique indexes included), and executes transactional range and
//! predicate queries that compose lazily.
//!
//! ## Key Features
//!
//! - **Schema strings**: `"++id, name, &email, [first+last]"` declares the
//!   primary key and secondary indexes per table
//! - **Fluent queries**: where-clause → collection → terminal op, with
//!   OR-composition and case-insensitive cursor jumping
//! - **ACID transactions**: explicit scoped transactions plus one-shot
//!   implicit transactions per table call
//! - **Versioned migrations**: schema diffs between versions run inside
//!   upgrade transactions
//! - **Middleware**: level-ordered interceptors around the core table
//!   surface
//!
//! ## Quick Start
//!
//! ```rust
//! use idx_core::Database;
//! use serde_json::json;
//!
//! # fn main() -> idx_core::IdxResult<()> {
//! let db = Database::new("app");
//! db.version(1).stores(&[("users", "++id, name, &email, age")])?;
//! db.open()?;
//!
//! let users = db.table("users")?;
//! users.add(json!({"name": "Alice", "email": "a@x", "age": 30}))?;
//! users.add(json!({"name": "Bob", "email": "b@x", "age": 25}))?;
//!
//! let adults = users.where_("age")?.above_or_equal(28)?.to_array()?;
//! assert_eq!(adults.len(), 1);
//! assert_eq!(adults[0]["name"], json!("Alice"));
//! # Ok(())
//! # }
//! ```
//!
//! ### Transactions
//!
//! ```rust
//! use idx_core::{Database, TransactionMode};
//! use serde_json::json;
//!
//! # fn main() -> idx_core::IdxResult<()> {
//! let db = Database::new("app");
//! db.version(1).stores(&[("users", "++id, name")])?;
//! db.open()?;
//!
//! db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
//!     let users = tx.table("users")?;
//!     users.add(json!({"name": "Alice"}))?;
//!     users.add(json!({"name": "Bob"}))?;
//!     Ok(())
//! })?;
//!
//! assert_eq!(db.table("users")?.count()?, 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! WhereClause → Collection (lazy context) → terminal op
//!            → Core (middleware-wrapped) → Engine (ordered keyed store)
//! ```
//!
//! ## Module Structure
//! - [`database`] — orchestrator ([`Database`]): versions, open, events
//! - [`table`] — CRUD facade and query entry points
//! - [`query`] — where-clause, collection pipeline, cursor-jump planner
//! - [`transaction`] — scoped and implicit transactions
//! - [`crate::core`] — core table abstraction and the engine-backed adapter
//! - [`engine`] — host engine contract and the in-memory reference engine
//! - [`schema`] — schema parsing, diffing, key-path projection
//! - [`middleware`] — level-ordered core interceptors

pub mod core;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod key;
pub mod key_range;
pub mod middleware;
pub mod query;
pub mod schema;
pub mod table;
pub mod transaction;

// Logging utilities
pub mod logging;


/// A stored record. Records are JSON values; indexed tables project index
/// keys out of record properties.
pub type Record = serde_json::Value;

// Re-export commonly used types
pub use self::core::{ChangeEntry, ChangeType, CursorStep};
pub use database::{Database, VersionBuilder};
pub use engine::{Durability, Engine, MemoryEngine, TransactionMode};
pub use error::{IdxError, IdxResult};
pub use events::{ListenerId, VersionChangeEvent};
pub use hooks::{HookId, TableHooks};
pub use key::{IntoKey, Key};
pub use key_range::KeyRange;
pub use middleware::{Middleware, tracing_middleware};
pub use query::{Collection, OrClause, WhereClause};
pub use table::Table;
pub use transaction::Transaction;

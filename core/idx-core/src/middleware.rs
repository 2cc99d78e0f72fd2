//! Middleware stack — ordered interceptors around the core surface.
//!
//! A middleware wraps the [`Core`] below it and may override any subset of
//! table operations by delegation. Levels order the stack: lower level =
//! closer to storage (inner), higher level = closer to the user (outer),
//! so higher-level middleware intercepts first at call time. The composed
//! core is rebuilt on every open and on every register/unregister.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::core::{Core, CoreTable};
use crate::error::IdxResult;

/// Default middleware level.
pub const DEFAULT_LEVEL: i32 = 10;

/// Factory wrapping the next-inner core.
pub type CreateMiddleware = Arc<dyn Fn(Arc<dyn Core>) -> Arc<dyn Core> + Send + Sync>;

/// One registered middleware.
#[derive(Clone)]
pub struct Middleware {
    pub name: String,
    pub level: i32,
    pub create: CreateMiddleware,
}

impl Middleware {
    pub fn new(name: &str, create: CreateMiddleware) -> Self {
        Self::with_level(name, DEFAULT_LEVEL, create)
    }

    pub fn with_level(name: &str, level: i32, create: CreateMiddleware) -> Self {
        Self {
            name: name.to_string(),
            level,
            create,
        }
    }
}

/// Name-keyed middleware registry. Registering an existing name replaces
/// the previous entry.
#[derive(Default)]
pub struct MiddlewareStack {
    entries: RwLock<Vec<Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, middleware: Middleware) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|m| m.name == middleware.name) {
            *existing = middleware;
        } else {
            entries.push(middleware);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|m| m.name != name);
        entries.len() != before
    }

    /// Fold the stack around `base`, innermost (lowest level) first.
    pub fn compose(&self, base: Arc<dyn Core>) -> Arc<dyn Core> {
        let mut entries = self.entries.read().clone();
        entries.sort_by_key(|m| m.level);
        entries
            .into_iter()
            .fold(base, |core, middleware| (middleware.create)(core))
    }
}

/// Built-in middleware logging every core call through `tracing`.
pub fn tracing_middleware() -> Middleware {
    Middleware::with_level(
        "tracing",
        100,
        Arc::new(|down| Arc::new(TracingCore { down }) as Arc<dyn Core>),
    )
}

struct TracingCore {
    down: Arc<dyn Core>,
}

impl Core for TracingCore {
    fn table(&self, name: &str) -> IdxResult<Arc<dyn CoreTable>> {
        let inner = self.down.table(name)?;
        Ok(Arc::new(TracingTable {
            name: name.to_string(),
            inner,
        }))
    }
}

struct TracingTable {
    name: String,
    inner: Arc<dyn CoreTable>,
}

impl CoreTable for TracingTable {
    fn schema(&self) -> &crate::schema::TableSchema {
        self.inner.schema()
    }

    fn get(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        key: &crate::key::Key,
    ) -> IdxResult<Option<crate::Record>> {
        debug!(table = %self.name, ?key, "get");
        self.inner.get(tx, key)
    }

    fn get_many(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        keys: &[crate::key::Key],
    ) -> IdxResult<Vec<Option<crate::Record>>> {
        debug!(table = %self.name, n = keys.len(), "get_many");
        self.inner.get_many(tx, keys)
    }

    fn count(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        index: &str,
        range: &crate::key_range::KeyRange,
    ) -> IdxResult<u64> {
        debug!(table = %self.name, index, "count");
        self.inner.count(tx, index, range)
    }

    fn query(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        request: &crate::core::QueryRequest,
    ) -> IdxResult<crate::core::QueryResponse> {
        debug!(table = %self.name, index = %request.index, "query");
        self.inner.query(tx, request)
    }

    fn open_cursor(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        request: &crate::core::QueryRequest,
    ) -> IdxResult<Option<crate::core::CoreCursor>> {
        debug!(table = %self.name, index = %request.index, "open_cursor");
        self.inner.open_cursor(tx, request)
    }

    fn mutate(
        &self,
        tx: &dyn crate::engine::EngineTransaction,
        request: crate::core::MutateRequest,
    ) -> IdxResult<crate::core::MutateResponse> {
        debug!(table = %self.name, "mutate");
        self.inner.mutate(tx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdxError;
    use parking_lot::Mutex;

    struct MarkerCore {
        label: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
        down: Option<Arc<dyn Core>>,
    }

    impl Core for MarkerCore {
        fn table(&self, name: &str) -> IdxResult<Arc<dyn CoreTable>> {
            self.calls.lock().push(self.label);
            match &self.down {
                Some(down) => down.table(name),
                None => Err(IdxError::InvalidTable(name.to_string())),
            }
        }
    }

    fn marker(
        label: &'static str,
        level: i32,
        calls: Arc<Mutex<Vec<&'static str>>>,
    ) -> Middleware {
        Middleware::with_level(
            label,
            level,
            Arc::new(move |down| {
                Arc::new(MarkerCore {
                    label,
                    calls: calls.clone(),
                    down: Some(down),
                }) as Arc<dyn Core>
            }),
        )
    }

    #[test]
    fn higher_level_intercepts_first() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stack = MiddlewareStack::new();
        stack.register(marker("low", 1, calls.clone()));
        stack.register(marker("high", 20, calls.clone()));

        let base = Arc::new(MarkerCore {
            label: "base",
            calls: calls.clone(),
            down: None,
        }) as Arc<dyn Core>;
        let composed = stack.compose(base);
        let _ = composed.table("t");
        assert_eq!(*calls.lock(), vec!["high", "low", "base"]);
    }

    #[test]
    fn register_replaces_by_name() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stack = MiddlewareStack::new();
        stack.register(marker("mw", 1, calls.clone()));
        stack.register(marker("mw", 2, calls.clone()));

        let base = Arc::new(MarkerCore {
            label: "base",
            calls: calls.clone(),
            down: None,
        }) as Arc<dyn Core>;
        let _ = stack.compose(base).table("t");
        // One wrapper only: the second registration replaced the first.
        assert_eq!(*calls.lock(), vec!["mw", "base"]);
    }

    #[test]
    fn unregister_removes_entry() {
        let stack = MiddlewareStack::new();
        stack.register(tracing_middleware());
        assert!(stack.unregister("tracing"));
        assert!(!stack.unregister("tracing"));
    }
}

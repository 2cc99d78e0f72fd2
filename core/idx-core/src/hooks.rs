//! Per-table mutation hooks.
//!
//! Four registries per table: `creating`, `reading`, `updating`,
//! `deleting`. Handlers run in registration order; a failing handler
//! aborts the operation and skips the remaining handlers. `reading` folds
//! over returned transforms — every handler receives the original record
//! and the last non-absent transform wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::Record;
use crate::error::IdxResult;
use crate::key::Key;

pub type CreatingHook = Arc<dyn Fn(Option<&Key>, &Record) -> IdxResult<()> + Send + Sync>;
pub type ReadingHook = Arc<dyn Fn(&Record) -> IdxResult<Option<Record>> + Send + Sync>;
/// `(changes, key, old record)` → optional additional changes
pub type UpdatingHook = Arc<dyn Fn(&Record, &Key, &Record) -> IdxResult<Option<Record>> + Send + Sync>;
pub type DeletingHook = Arc<dyn Fn(&Key, &Record) -> IdxResult<()> + Send + Sync>;

/// Handle for unsubscribing a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Hook registries for one table.
#[derive(Default)]
pub struct TableHooks {
    creating: RwLock<Vec<(HookId, CreatingHook)>>,
    reading: RwLock<Vec<(HookId, ReadingHook)>>,
    updating: RwLock<Vec<(HookId, UpdatingHook)>>,
    deleting: RwLock<Vec<(HookId, DeletingHook)>>,
    next_id: AtomicU64,
}

impl TableHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HookId {
        HookId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_creating(&self, hook: CreatingHook) -> HookId {
        let id = self.next_id();
        self.creating.write().push((id, hook));
        id
    }

    pub fn on_reading(&self, hook: ReadingHook) -> HookId {
        let id = self.next_id();
        self.reading.write().push((id, hook));
        id
    }

    pub fn on_updating(&self, hook: UpdatingHook) -> HookId {
        let id = self.next_id();
        self.updating.write().push((id, hook));
        id
    }

    pub fn on_deleting(&self, hook: DeletingHook) -> HookId {
        let id = self.next_id();
        self.deleting.write().push((id, hook));
        id
    }

    /// Remove one hook by id, whichever registry it lives in.
    pub fn unsubscribe(&self, id: HookId) -> bool {
        let mut removed = false;
        self.creating.write().retain(|(h, _)| {
            let keep = *h != id;
            removed |= !keep;
            keep
        });
        self.reading.write().retain(|(h, _)| {
            let keep = *h != id;
            removed |= !keep;
            keep
        });
        self.updating.write().retain(|(h, _)| {
            let keep = *h != id;
            removed |= !keep;
            keep
        });
        self.deleting.write().retain(|(h, _)| {
            let keep = *h != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub(crate) fn has_deleting(&self) -> bool {
        !self.deleting.read().is_empty()
    }

    pub(crate) fn has_reading(&self) -> bool {
        !self.reading.read().is_empty()
    }

    pub(crate) fn fire_creating(&self, key: Option<&Key>, record: &Record) -> IdxResult<()> {
        let hooks = self.creating.read().clone();
        for (_, hook) in hooks {
            hook(key, record)?;
        }
        Ok(())
    }

    /// Fold the reading transforms. Each handler sees the original record;
    /// the last handler returning a replacement wins.
    pub(crate) fn fire_reading(&self, record: Record) -> IdxResult<Record> {
        let hooks = self.reading.read().clone();
        let mut result = record.clone();
        for (_, hook) in hooks {
            if let Some(transformed) = hook(&record)? {
                result = transformed;
            }
        }
        Ok(result)
    }

    /// Collect additional changes from the updating handlers. Handlers see
    /// the original change set; their extra changes are merged shallowly.
    pub(crate) fn fire_updating(
        &self,
        changes: &Record,
        key: &Key,
        old: &Record,
    ) -> IdxResult<Option<Record>> {
        let hooks = self.updating.read().clone();
        let mut extra: Option<Record> = None;
        for (_, hook) in hooks {
            if let Some(additional) = hook(changes, key, old)? {
                match &mut extra {
                    None => extra = Some(additional),
                    Some(acc) => merge_into(acc, &additional),
                }
            }
        }
        Ok(extra)
    }

    pub(crate) fn fire_deleting(&self, key: &Key, record: &Record) -> IdxResult<()> {
        let hooks = self.deleting.read().clone();
        for (_, hook) in hooks {
            hook(key, record)?;
        }
        Ok(())
    }
}

/// Shallow object merge: top-level properties of `from` overwrite `into`.
pub(crate) fn merge_into(into: &mut Record, from: &Record) {
    let Some(from_map) = from.as_object() else {
        return;
    };
    if let Some(into_map) = into.as_object_mut() {
        for (prop, value) in from_map {
            into_map.insert(prop.clone(), value.clone());
        }
    }
}

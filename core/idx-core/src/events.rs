//! Database event registries.
//!
//! Events: `ready`, `blocked`, `versionchange`, `close`, and `changes`
//! (the committed mutation batch). Listener errors never stop dispatch:
//! they are collected and re-raised as one aggregate error after every
//! listener has observed the event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::core::ChangeEntry;
use crate::error::{IdxError, IdxResult};

/// Version transition payload for `blocked` / `versionchange`.
#[derive(Debug, Clone, Copy)]
pub struct VersionChangeEvent {
    pub old_version: u64,
    pub new_version: u64,
}

pub type ReadyListener = Arc<dyn Fn() -> IdxResult<()> + Send + Sync>;
pub type VersionListener = Arc<dyn Fn(&VersionChangeEvent) -> IdxResult<()> + Send + Sync>;
pub type CloseListener = Arc<dyn Fn() -> IdxResult<()> + Send + Sync>;
pub type ChangesListener = Arc<dyn Fn(&[ChangeEntry]) -> IdxResult<()> + Send + Sync>;

/// Handle for unsubscribing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct DatabaseEvents {
    ready: RwLock<Vec<(ListenerId, ReadyListener)>>,
    blocked: RwLock<Vec<(ListenerId, VersionListener)>>,
    versionchange: RwLock<Vec<(ListenerId, VersionListener)>>,
    close: RwLock<Vec<(ListenerId, CloseListener)>>,
    changes: RwLock<Vec<(ListenerId, ChangesListener)>>,
    next_id: AtomicU64,
}

impl DatabaseEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_ready(&self, listener: ReadyListener) -> ListenerId {
        let id = self.next_id();
        self.ready.write().push((id, listener));
        id
    }

    pub fn on_blocked(&self, listener: VersionListener) -> ListenerId {
        let id = self.next_id();
        self.blocked.write().push((id, listener));
        id
    }

    pub fn on_versionchange(&self, listener: VersionListener) -> ListenerId {
        let id = self.next_id();
        self.versionchange.write().push((id, listener));
        id
    }

    pub fn on_close(&self, listener: CloseListener) -> ListenerId {
        let id = self.next_id();
        self.close.write().push((id, listener));
        id
    }

    pub fn on_changes(&self, listener: ChangesListener) -> ListenerId {
        let id = self.next_id();
        self.changes.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.ready.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        self.blocked.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        self.versionchange.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        self.close.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        self.changes.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub(crate) fn emit_ready(&self) -> IdxResult<()> {
        let listeners = self.ready.read().clone();
        aggregate(listeners.into_iter().map(|(_, l)| l()))
    }

    pub(crate) fn emit_blocked(&self, event: &VersionChangeEvent) -> IdxResult<()> {
        let listeners = self.blocked.read().clone();
        aggregate(listeners.into_iter().map(|(_, l)| l(event)))
    }

    pub(crate) fn emit_versionchange(&self, event: &VersionChangeEvent) -> IdxResult<()> {
        let listeners = self.versionchange.read().clone();
        aggregate(listeners.into_iter().map(|(_, l)| l(event)))
    }

    pub(crate) fn emit_close(&self) -> IdxResult<()> {
        let listeners = self.close.read().clone();
        aggregate(listeners.into_iter().map(|(_, l)| l()))
    }

    pub(crate) fn emit_changes(&self, changes: &[ChangeEntry]) -> IdxResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let listeners = self.changes.read().clone();
        aggregate(listeners.into_iter().map(|(_, l)| l(changes)))
    }
}

/// Run every listener, then raise collected failures as one error.
fn aggregate(results: impl Iterator<Item = IdxResult<()>>) -> IdxResult<()> {
    let errors: Vec<String> = results
        .filter_map(|result| result.err().map(|e| e.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(IdxError::Listener(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeEntry, ChangeType};
    use crate::key::Key;

    #[test]
    fn all_listeners_observe_despite_failures() {
        let events = DatabaseEvents::new();
        let seen = Arc::new(parking_lot::Mutex::new(0u32));

        let s = seen.clone();
        events.on_ready(Arc::new(move || {
            *s.lock() += 1;
            Err(IdxError::InvalidState("first".into()))
        }));
        let s = seen.clone();
        events.on_ready(Arc::new(move || {
            *s.lock() += 1;
            Ok(())
        }));

        let err = events.emit_ready().unwrap_err();
        assert!(matches!(err, IdxError::Listener(_)));
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn changes_not_emitted_for_empty_batch() {
        let events = DatabaseEvents::new();
        events.on_changes(Arc::new(|_| {
            Err(IdxError::InvalidState("should not fire".into()))
        }));
        assert!(events.emit_changes(&[]).is_ok());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let events = DatabaseEvents::new();
        let count = Arc::new(parking_lot::Mutex::new(0u32));
        let c = count.clone();
        let id = events.on_changes(Arc::new(move |_| {
            *c.lock() += 1;
            Ok(())
        }));

        let batch = vec![ChangeEntry {
            table: "users".into(),
            kind: ChangeType::Add,
            key: Key::from(1),
            record: None,
            old_record: None,
        }];
        events.emit_changes(&batch).unwrap();
        assert!(events.unsubscribe(id));
        events.emit_changes(&batch).unwrap();
        assert_eq!(*count.lock(), 1);
    }
}

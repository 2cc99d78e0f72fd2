//! 트랜잭션 컨텍스트 — 하나의 엔진 트랜잭션에 바인딩된 스코프 핸들
//!
//! 선언된 테이블 집합과 모드(읽기 전용/읽기-쓰기)로 생성되며,
//! `table()`로 이 트랜잭션에 고정된 테이블 핸들을 제공합니다.
//! 트랜잭션 밖에서의 테이블 호출은 해당 테이블만 포함하는 일회성
//! 암묵적 트랜잭션을 만들며, 마이크로태스크를 넘어 재사용되지 않습니다.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::ChangeEntry;
use crate::database::DatabaseShared;
use crate::engine::{Durability, EngineTransaction, TransactionMode};
use crate::error::{IdxError, IdxResult};
use crate::table::Table;

/// 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

/// 스코프 트랜잭션 핸들 (복제 가능 — 내부 상태 공유)
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    id: u64,
    mode: TransactionMode,
    stores: Vec<String>,
    durability: Durability,
    engine_tx: Arc<dyn EngineTransaction>,
    db: Arc<DatabaseShared>,
    state: Mutex<TxState>,
    /// 커밋 시 changes 이벤트로 발행될 변경 로그
    changes: Mutex<Vec<ChangeEntry>>,
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<DatabaseShared>,
        id: u64,
        mode: TransactionMode,
        stores: Vec<String>,
        durability: Durability,
        engine_tx: Arc<dyn EngineTransaction>,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                mode,
                stores,
                durability,
                engine_tx,
                db,
                state: Mutex::new(TxState::Active),
                changes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 이 트랜잭션에 바인딩된 테이블 핸들 반환
    ///
    /// 선언되지 않은 테이블은 조회할 수 없습니다.
    pub fn table(&self, name: &str) -> IdxResult<Table> {
        if !self.inner.stores.iter().any(|s| s == name) {
            return Err(IdxError::NotFound(format!(
                "table '{name}' is not part of this transaction"
            )));
        }
        self.inner.db.table_bound(name, Some(self.clone()))
    }

    /// 로그 상관관계용 트랜잭션 ID
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    pub fn durability(&self) -> Durability {
        self.inner.durability
    }

    pub fn stores(&self) -> &[String] {
        &self.inner.stores
    }

    /// 트랜잭션 롤백 요청 — 이후 연산은 transaction-inactive 에러
    ///
    /// 이미 종료된 트랜잭션에 대해서는 no-op.
    pub fn abort(&self) -> IdxResult<()> {
        let mut state = self.inner.state.lock();
        if *state != TxState::Active {
            return Ok(());
        }
        *state = TxState::Aborted;
        drop(state);
        debug!(tx = self.inner.id, "abort requested");
        self.inner.engine_tx.abort()?;
        Ok(())
    }

    /// 조기 커밋 힌트 — 여러 번 호출해도, 종료 후 호출해도 안전 (no-op)
    ///
    /// 엔진이 early-commit을 지원하지 않으면 힌트는 무시됩니다.
    pub fn commit(&self) -> IdxResult<()> {
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> IdxResult<()> {
        match *self.inner.state.lock() {
            TxState::Active => Ok(()),
            TxState::Aborted => Err(IdxError::TransactionInactive(
                "transaction was aborted".to_string(),
            )),
            TxState::Committed => Err(IdxError::TransactionInactive(
                "transaction has already committed".to_string(),
            )),
        }
    }

    pub(crate) fn engine(&self) -> &dyn EngineTransaction {
        &*self.inner.engine_tx
    }

    pub(crate) fn record_changes(&self, changes: Vec<ChangeEntry>) {
        if !changes.is_empty() {
            self.inner.changes.lock().extend(changes);
        }
    }

    /// 실제 커밋 + changes 이벤트 발행 (내부용)
    pub(crate) fn commit_and_publish(&self) -> IdxResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                TxState::Active => *state = TxState::Committed,
                TxState::Aborted => {
                    return Err(IdxError::Abort("transaction was aborted".to_string()));
                }
                TxState::Committed => return Ok(()),
            }
        }
        self.inner.engine_tx.commit()?;
        debug!(tx = self.inner.id, "committed");
        let changes = std::mem::take(&mut *self.inner.changes.lock());
        self.inner.db.events().emit_changes(&changes)
    }

    pub(crate) fn abort_quiet(&self) {
        let _ = self.abort();
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use crate::engine::TransactionMode;
    use crate::error::IdxError;
    use serde_json::json;

    fn open_users_db() -> Database {
        let db = Database::new("tx-tests");
        db.version(1)
            .stores(&[("users", "++id, name, &email")])
            .unwrap();
        db.open().unwrap();
        db
    }

    #[test]
    fn commit_makes_writes_visible() {
        let db = open_users_db();
        db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
            let users = tx.table("users")?;
            users.add(json!({"name": "Alice", "email": "a@x"}))?;
            users.add(json!({"name": "Bob", "email": "b@x"}))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.table("users").unwrap().count().unwrap(), 2);
    }

    #[test]
    fn abort_rolls_back_and_surfaces() {
        let db = open_users_db();
        let users = db.table("users").unwrap();
        users.add(json!({"name": "Seed", "email": "s@x"})).unwrap();

        let result = db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
            let users = tx.table("users")?;
            users.add(json!({"name": "X", "email": "x@x"}))?;
            tx.abort()?;
            Ok(())
        });
        assert!(matches!(result, Err(IdxError::Abort(_))));
        // 트랜잭션 이전 상태 그대로
        assert_eq!(db.table("users").unwrap().count().unwrap(), 1);
    }

    #[test]
    fn error_in_scope_aborts() {
        let db = open_users_db();
        let result: Result<(), _> =
            db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
                let users = tx.table("users")?;
                users.add(json!({"name": "X", "email": "x@x"}))?;
                Err(IdxError::InvalidState("user logic failed".into()))
            });
        assert!(result.is_err());
        assert_eq!(db.table("users").unwrap().count().unwrap(), 0);
    }

    #[test]
    fn operations_after_abort_are_inactive() {
        let db = open_users_db();
        let result = db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
            let users = tx.table("users")?;
            tx.abort()?;
            users.add(json!({"name": "X", "email": "x@x"}))
        });
        assert!(matches!(result, Err(IdxError::TransactionInactive(_))));
    }

    #[test]
    fn undeclared_table_is_rejected() {
        let db = open_users_db();
        let result = db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
            tx.table("missing").map(|_| ())
        });
        assert!(matches!(result, Err(IdxError::NotFound(_))));
    }

    #[test]
    fn early_commit_hint_is_idempotent() {
        let db = open_users_db();
        db.transaction(TransactionMode::ReadWrite, &["users"], |tx| {
            let users = tx.table("users")?;
            users.add(json!({"name": "A", "email": "a@x"}))?;
            tx.commit()?;
            tx.commit()?;
            users.add(json!({"name": "B", "email": "b@x"}))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.table("users").unwrap().count().unwrap(), 2);
    }

    #[test]
    fn implicit_transactions_are_one_shot() {
        let db = open_users_db();
        let users = db.table("users").unwrap();
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        users.add(json!({"name": "B", "email": "b@x"})).unwrap();
        // 각 호출이 자체 트랜잭션에서 커밋되었으므로 둘 다 보인다
        assert_eq!(users.count().unwrap(), 2);
    }
}

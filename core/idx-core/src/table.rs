//! Table Facade — CRUD 표면과 쿼리 진입점
//!
//! 모든 연산은 바인딩된 트랜잭션(명시적) 또는 해당 테이블만 포함하는
//! 일회성 암묵적 트랜잭션 안에서 실행됩니다.

use std::sync::Arc;

use crate::Record;
use crate::core::{CoreTable, MutateRequest, MutateResponse, QueryRequest, QueryResponse};
use crate::database::DatabaseShared;
use crate::engine::TransactionMode;
use crate::error::{IdxError, IdxResult};
use crate::hooks::{TableHooks, merge_into};
use crate::key::{IntoKey, Key};
use crate::key_range::KeyRange;
use crate::query::{Collection, Context, WhereClause};
use crate::schema::{KeyPath, TableSchema};
use crate::transaction::Transaction;

/// 하나의 테이블 핸들
///
/// `tx`가 있으면 그 트랜잭션에 고정되며, 없으면 호출마다 새 암묵적
/// 트랜잭션을 만듭니다.
#[derive(Clone)]
pub struct Table {
    pub(crate) shared: Arc<DatabaseShared>,
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) hooks: Arc<TableHooks>,
    pub(crate) tx: Option<Transaction>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// 이 테이블의 훅 레지스트리
    pub fn hooks(&self) -> Arc<TableHooks> {
        self.hooks.clone()
    }

    pub(crate) fn is_outbound(&self) -> bool {
        self.schema.primary_key.outbound
    }

    // ════════════════════════════════════════════
    // Transaction plumbing
    // ════════════════════════════════════════════

    /// 바인딩된 트랜잭션에서 실행하거나, 일회성 암묵적 트랜잭션을
    /// 생성-커밋합니다. 에러 시 암묵적 트랜잭션은 롤백됩니다.
    pub(crate) fn with_tx<R>(
        &self,
        mode: TransactionMode,
        f: impl FnOnce(&Transaction) -> IdxResult<R>,
    ) -> IdxResult<R> {
        match &self.tx {
            Some(tx) => {
                tx.ensure_active()?;
                f(tx)
            }
            None => {
                let tx = self
                    .shared
                    .begin_transaction(mode, &[self.schema.name.as_str()], Default::default())?;
                match f(&tx) {
                    Ok(value) => {
                        tx.commit_and_publish()?;
                        Ok(value)
                    }
                    Err(err) => {
                        tx.abort_quiet();
                        Err(err)
                    }
                }
            }
        }
    }

    pub(crate) fn core_table(&self) -> IdxResult<Arc<dyn CoreTable>> {
        self.shared.core()?.table(&self.schema.name)
    }

    pub(crate) fn mutate_in(
        &self,
        tx: &Transaction,
        request: MutateRequest,
    ) -> IdxResult<MutateResponse> {
        let core = self.core_table()?;
        let mut response = core.mutate(tx.engine(), request)?;
        tx.record_changes(std::mem::take(&mut response.changes));
        Ok(response)
    }

    pub(crate) fn query_in(
        &self,
        tx: &Transaction,
        request: &QueryRequest,
    ) -> IdxResult<QueryResponse> {
        self.core_table()?.query(tx.engine(), request)
    }

    pub(crate) fn count_in(
        &self,
        tx: &Transaction,
        index: &str,
        range: &KeyRange,
    ) -> IdxResult<u64> {
        self.core_table()?.count(tx.engine(), index, range)
    }

    /// reading 훅 적용 (raw 컬렉션은 호출하지 않음)
    pub(crate) fn apply_reading(&self, record: Record) -> IdxResult<Record> {
        if self.hooks.has_reading() {
            self.hooks.fire_reading(record)
        } else {
            Ok(record)
        }
    }

    fn project_primary(&self, record: &Record) -> Option<Key> {
        self.schema
            .primary_key
            .key_path
            .as_ref()
            .and_then(|path| path.project(record))
    }

    // ════════════════════════════════════════════
    // CREATE / UPDATE Operations
    // ════════════════════════════════════════════

    /// 레코드 삽입 — 기존 키와 충돌하면 Constraint 에러
    ///
    /// 자동 증가 키는 엔진이 할당하여 레코드에 반영하고 반환합니다.
    pub fn add(&self, record: Record) -> IdxResult<Key> {
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            let key = self.project_primary(&record);
            self.hooks.fire_creating(key.as_ref(), &record)?;
            let response = self.mutate_in(tx, MutateRequest::Add {
                records: vec![record],
                keys: None,
            })?;
            response
                .last_result
                .ok_or_else(|| IdxError::Data("add produced no key".to_string()))
        })
    }

    /// 외부 키(outbound) 테이블에 명시적 키로 삽입
    pub fn add_with_key(&self, record: Record, key: impl IntoKey) -> IdxResult<Key> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            self.hooks.fire_creating(Some(&key), &record)?;
            let response = self.mutate_in(tx, MutateRequest::Add {
                records: vec![record],
                keys: Some(vec![key]),
            })?;
            response
                .last_result
                .ok_or_else(|| IdxError::Data("add produced no key".to_string()))
        })
    }

    /// upsert 의미의 저장 — 같은 키가 있으면 통째로 교체
    pub fn put(&self, record: Record) -> IdxResult<Key> {
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            let response = self.mutate_in(tx, MutateRequest::Put {
                records: vec![record],
                keys: None,
            })?;
            response
                .last_result
                .ok_or_else(|| IdxError::Data("put produced no key".to_string()))
        })
    }

    pub fn put_with_key(&self, record: Record, key: impl IntoKey) -> IdxResult<Key> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            let response = self.mutate_in(tx, MutateRequest::Put {
                records: vec![record],
                keys: Some(vec![key]),
            })?;
            response
                .last_result
                .ok_or_else(|| IdxError::Data("put produced no key".to_string()))
        })
    }

    /// 여러 레코드 일괄 삽입
    ///
    /// 레코드 단위 원자성: 실패한 레코드만 건너뛰고 나머지는 저장됩니다.
    /// 실패가 하나라도 있으면 실패 인덱스를 열거하는 Constraint 에러를
    /// 커밋 후에 반환합니다.
    pub fn bulk_add(&self, records: Vec<Record>) -> IdxResult<Vec<Key>> {
        let response = self.with_tx(TransactionMode::ReadWrite, |tx| {
            for record in &records {
                let key = self.project_primary(record);
                self.hooks.fire_creating(key.as_ref(), record)?;
            }
            self.mutate_in(tx, MutateRequest::Add {
                records,
                keys: None,
            })
        })?;
        bulk_result("add", response)
    }

    /// 여러 레코드 일괄 저장 (upsert)
    pub fn bulk_put(&self, records: Vec<Record>) -> IdxResult<Vec<Key>> {
        let response = self.with_tx(TransactionMode::ReadWrite, |tx| {
            self.mutate_in(tx, MutateRequest::Put {
                records,
                keys: None,
            })
        })?;
        bulk_result("put", response)
    }

    /// 기존 레코드에 부분 변경 적용 — 키가 없으면 0, 있으면 1 반환
    pub fn update(&self, key: impl IntoKey, changes: Record) -> IdxResult<usize> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            let core = self.core_table()?;
            let Some(old) = core.get(tx.engine(), &key)? else {
                return Ok(0);
            };
            let mut merged = old.clone();
            merge_into(&mut merged, &changes);
            if let Some(extra) = self.hooks.fire_updating(&changes, &key, &old)? {
                merge_into(&mut merged, &extra);
            }
            let keys = self.is_outbound().then(|| vec![key.clone()]);
            self.mutate_in(tx, MutateRequest::Put {
                records: vec![merged],
                keys,
            })?;
            Ok(1)
        })
    }

    /// put-merge — 키가 있으면 변경을 병합하고, 없으면 새로 저장
    pub fn upsert(&self, key: impl IntoKey, changes: Record) -> IdxResult<Key> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            let core = self.core_table()?;
            let mut merged = match core.get(tx.engine(), &key)? {
                Some(old) => {
                    let mut merged = old;
                    merge_into(&mut merged, &changes);
                    merged
                }
                None => changes,
            };
            let keys = if self.is_outbound() {
                Some(vec![key.clone()])
            } else {
                self.embed_primary(&mut merged, &key)?;
                None
            };
            let response = self.mutate_in(tx, MutateRequest::Put {
                records: vec![merged],
                keys,
            })?;
            response
                .last_result
                .ok_or_else(|| IdxError::Data("put produced no key".to_string()))
        })
    }

    /// 키 경로에 기본 키를 기록 (inbound 테이블용)
    fn embed_primary(&self, record: &mut Record, key: &Key) -> IdxResult<()> {
        match &self.schema.primary_key.key_path {
            Some(KeyPath::Single(prop)) => {
                if let Some(object) = record.as_object_mut() {
                    object.insert(prop.clone(), key.to_value());
                    Ok(())
                } else {
                    Err(IdxError::Data(
                        "cannot write a primary key into a non-object record".to_string(),
                    ))
                }
            }
            Some(KeyPath::Compound(_)) => match self.project_primary(record) {
                Some(projected) if projected == *key => Ok(()),
                _ => Err(IdxError::Data(
                    "record does not carry the addressed compound primary key".to_string(),
                )),
            },
            None => Ok(()),
        }
    }

    // ════════════════════════════════════════════
    // READ Operations
    // ════════════════════════════════════════════

    /// 기본 키로 조회
    pub fn get(&self, key: impl IntoKey) -> IdxResult<Option<Record>> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadOnly, |tx| {
            let core = self.core_table()?;
            match core.get(tx.engine(), &key)? {
                Some(record) => Ok(Some(self.apply_reading(record)?)),
                None => Ok(None),
            }
        })
    }

    /// 여러 키 일괄 조회 — 입력 순서 유지, 없는 키는 None
    pub fn get_many<I, K>(&self, keys: I) -> IdxResult<Vec<Option<Record>>>
    where
        I: IntoIterator<Item = K>,
        K: IntoKey,
    {
        let keys: Vec<Key> = keys
            .into_iter()
            .map(IntoKey::into_key)
            .collect::<IdxResult<_>>()?;
        self.with_tx(TransactionMode::ReadOnly, |tx| {
            let core = self.core_table()?;
            let records = core.get_many(tx.engine(), &keys)?;
            records
                .into_iter()
                .map(|record| match record {
                    Some(record) => Ok(Some(self.apply_reading(record)?)),
                    None => Ok(None),
                })
                .collect()
        })
    }

    /// 전체 레코드 수
    pub fn count(&self) -> IdxResult<usize> {
        self.with_tx(TransactionMode::ReadOnly, |tx| {
            Ok(self.count_in(tx, "", &KeyRange::All)? as usize)
        })
    }

    // ════════════════════════════════════════════
    // DELETE Operations
    // ════════════════════════════════════════════

    /// 기본 키로 삭제 — 없는 키는 에러가 아님
    pub fn delete(&self, key: impl IntoKey) -> IdxResult<()> {
        let key = key.into_key()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            if self.hooks.has_deleting() {
                let core = self.core_table()?;
                if let Some(old) = core.get(tx.engine(), &key)? {
                    self.hooks.fire_deleting(&key, &old)?;
                }
            }
            self.mutate_in(tx, MutateRequest::Delete { keys: vec![key] })?;
            Ok(())
        })
    }

    /// 여러 키 일괄 삭제
    pub fn bulk_delete<I, K>(&self, keys: I) -> IdxResult<()>
    where
        I: IntoIterator<Item = K>,
        K: IntoKey,
    {
        let keys: Vec<Key> = keys
            .into_iter()
            .map(IntoKey::into_key)
            .collect::<IdxResult<_>>()?;
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            if self.hooks.has_deleting() {
                let core = self.core_table()?;
                for key in &keys {
                    if let Some(old) = core.get(tx.engine(), key)? {
                        self.hooks.fire_deleting(key, &old)?;
                    }
                }
            }
            self.mutate_in(tx, MutateRequest::Delete { keys })?;
            Ok(())
        })
    }

    /// 테이블 비우기
    pub fn clear(&self) -> IdxResult<()> {
        self.with_tx(TransactionMode::ReadWrite, |tx| {
            self.mutate_in(tx, MutateRequest::DeleteRange {
                range: KeyRange::All,
            })?;
            Ok(())
        })
    }

    // ════════════════════════════════════════════
    // Query Entry Points
    // ════════════════════════════════════════════

    /// 인덱스에 대한 where 절 빌더
    ///
    /// 기본 키는 `":id"`로 지정합니다.
    pub fn where_(&self, index: &str) -> IdxResult<WhereClause> {
        let resolved = self.resolve_index(index)?;
        Ok(WhereClause::new(self.clone(), resolved))
    }

    /// 인덱스 순서의 전체 컬렉션
    pub fn order_by(&self, index: &str) -> IdxResult<Collection> {
        let resolved = self.resolve_index(index)?;
        Ok(Collection::new(Context::new(self.clone(), resolved)))
    }

    /// 기본 키 순서 + 필터 컬렉션
    pub fn filter(
        &self,
        predicate: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Collection {
        self.to_collection().and(predicate)
    }

    /// 기본 키 순서의 전체 컬렉션
    pub fn to_collection(&self) -> Collection {
        Collection::new(Context::new(self.clone(), String::new()))
    }

    fn resolve_index(&self, index: &str) -> IdxResult<String> {
        if index.is_empty() || index == ":id" {
            return Ok(String::new());
        }
        if self.schema.index(index).is_some() {
            Ok(index.to_string())
        } else {
            Err(IdxError::NotFound(format!(
                "index '{index}' on table '{}'",
                self.schema.name
            )))
        }
    }
}

fn bulk_result(op: &str, response: MutateResponse) -> IdxResult<Vec<Key>> {
    if response.num_failures > 0 {
        let indices: Vec<usize> = response.failures.keys().copied().collect();
        return Err(IdxError::Constraint(format!(
            "bulk {op} failed for {} of {} records at indices {indices:?}",
            response.num_failures,
            response.results.len(),
        )));
    }
    Ok(response.results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    fn users_db() -> Database {
        let db = Database::new("table-tests");
        db.version(1)
            .stores(&[("users", "++id, name, &email, age"), ("blobs", "")])
            .unwrap();
        db.open().unwrap();
        db
    }

    #[test]
    fn add_and_get_roundtrip() {
        let db = users_db();
        let users = db.table("users").unwrap();
        let key = users
            .add(json!({"name": "Alice", "email": "a@x", "age": 30}))
            .unwrap();
        assert_eq!(key, Key::from(1));
        assert_eq!(
            users.get(1).unwrap(),
            Some(json!({"id": 1, "name": "Alice", "email": "a@x", "age": 30}))
        );
    }

    #[test]
    fn unique_violation_leaves_count_unchanged() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users
            .add(json!({"name": "Alice", "email": "a@x", "age": 30}))
            .unwrap();
        let err = users
            .add(json!({"name": "A2", "email": "a@x", "age": 31}))
            .unwrap_err();
        assert!(matches!(err, IdxError::Constraint(_)));
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn bulk_add_keeps_successes_and_enumerates_failures() {
        let db = users_db();
        let users = db.table("users").unwrap();
        let err = users
            .bulk_add(vec![
                json!({"email": "a@x"}),
                json!({"email": "a@x"}),
                json!({"email": "b@x"}),
            ])
            .unwrap_err();
        match err {
            IdxError::Constraint(message) => assert!(message.contains("[1]")),
            other => panic!("expected Constraint, got {other:?}"),
        }
        // 성공한 레코드는 남는다 (레코드 단위 원자성)
        assert_eq!(users.count().unwrap(), 2);
    }

    #[test]
    fn update_missing_key_returns_zero() {
        let db = users_db();
        let users = db.table("users").unwrap();
        assert_eq!(users.update(99, json!({"age": 1})).unwrap(), 0);
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        assert_eq!(users.update(1, json!({"age": 31})).unwrap(), 1);
        assert_eq!(users.get(1).unwrap().unwrap()["age"], json!(31));
    }

    #[test]
    fn upsert_merges_or_creates() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users
            .add(json!({"name": "A", "email": "a@x", "age": 1}))
            .unwrap();
        users.upsert(1, json!({"age": 2})).unwrap();
        assert_eq!(
            users.get(1).unwrap().unwrap(),
            json!({"id": 1, "name": "A", "email": "a@x", "age": 2})
        );
        users.upsert(7, json!({"name": "New", "email": "n@x"})).unwrap();
        assert_eq!(users.get(7).unwrap().unwrap()["name"], json!("New"));
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users.delete(42).unwrap();
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        users.delete(1).unwrap();
        assert_eq!(users.count().unwrap(), 0);
    }

    #[test]
    fn outbound_add_and_get() {
        let db = users_db();
        let blobs = db.table("blobs").unwrap();
        blobs.add_with_key(json!({"bytes": 3}), "k1").unwrap();
        // 외부 키는 레코드에 포함되지 않는다
        assert_eq!(blobs.get("k1").unwrap(), Some(json!({"bytes": 3})));
        assert!(blobs.add(json!({"x": 1})).is_err());
    }

    #[test]
    fn reading_hook_transforms_get() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        users.hooks().on_reading(Arc::new(|record| {
            let mut out = record.clone();
            merge_into(&mut out, &json!({"decorated": true}));
            Ok(Some(out))
        }));
        assert_eq!(users.get(1).unwrap().unwrap()["decorated"], json!(true));
    }

    #[test]
    fn creating_hook_failure_aborts_add() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users.hooks().on_creating(Arc::new(|_, record| {
            if record.get("name").is_none() {
                Err(IdxError::Data("name is required".into()))
            } else {
                Ok(())
            }
        }));
        assert!(users.add(json!({"email": "a@x"})).is_err());
        assert_eq!(users.count().unwrap(), 0);
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn deleting_hook_sees_old_record() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        users.hooks().on_deleting(Arc::new(move |_, old| {
            *s.lock() = Some(old.clone());
            Ok(())
        }));
        users.delete(1).unwrap();
        assert_eq!(seen.lock().as_ref().unwrap()["name"], json!("A"));
    }

    #[test]
    fn get_many_preserves_input_order() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users.add(json!({"name": "A", "email": "a@x"})).unwrap();
        users.add(json!({"name": "B", "email": "b@x"})).unwrap();
        let records = users.get_many([2, 9, 1]).unwrap();
        assert_eq!(records[0].as_ref().unwrap()["name"], json!("B"));
        assert!(records[1].is_none());
        assert_eq!(records[2].as_ref().unwrap()["name"], json!("A"));
    }

    #[test]
    fn unknown_index_rejected_at_where() {
        let db = users_db();
        let users = db.table("users").unwrap();
        assert!(users.where_("nope").is_err());
        assert!(users.where_(":id").is_ok());
    }

    #[test]
    fn clear_empties_table() {
        let db = users_db();
        let users = db.table("users").unwrap();
        users
            .bulk_add(vec![
                json!({"email": "a@x"}),
                json!({"email": "b@x"}),
            ])
            .unwrap();
        users.clear().unwrap();
        assert_eq!(users.count().unwrap(), 0);
    }
}

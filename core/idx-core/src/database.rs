//! Database Orchestrator — 버전 정의, 오픈/업그레이드, 핸들 제공
//!
//! `version(n).stores(...)`로 스키마를 선언하고 `open()`이 엔진을 최신
//! 버전으로 열어 `(old, new]` 구간의 버전을 순서대로 적용합니다. 각
//! 단계는 스키마 diff를 엔진에 반영한 뒤 업그레이드 콜백을 업그레이드
//! 트랜잭션 안에서 실행합니다. 기본 키 변경은 치명적 오류입니다.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::{ChangeEntry, Core, EngineCore};
use crate::engine::{Durability, Engine, MemoryEngine, TransactionMode};
use crate::error::{IdxError, IdxResult};
use crate::events::{
    CloseListener, DatabaseEvents, ListenerId, ReadyListener, VersionChangeEvent, VersionListener,
};
use crate::hooks::TableHooks;
use crate::middleware::{Middleware, MiddlewareStack};
use crate::schema::{DatabaseSchema, SchemaChange, TableSchema, diff, parse_table};
use crate::table::Table;
use crate::transaction::Transaction;

/// 업그레이드 콜백 — 업그레이드 트랜잭션 안에서 실행
pub type UpgradeFn = Arc<dyn Fn(&Transaction) -> IdxResult<()> + Send + Sync>;

/// 엔진 오픈이 비결정적 UnknownError를 낼 때 재시도 횟수
const OPEN_RETRIES: u32 = 2;

#[derive(Clone, Default)]
struct VersionDef {
    /// (테이블, 정의) — None은 테이블 삭제
    tables: Vec<(String, Option<TableSchema>)>,
    upgrade: Option<UpgradeFn>,
}

#[derive(Default)]
struct OpenState {
    open: bool,
    schema: DatabaseSchema,
    tables: BTreeMap<String, Arc<TableSchema>>,
    core: Option<Arc<dyn Core>>,
}

pub(crate) struct DatabaseShared {
    name: String,
    engine: Arc<dyn Engine>,
    versions: Mutex<BTreeMap<u64, VersionDef>>,
    state: RwLock<OpenState>,
    middleware: MiddlewareStack,
    hooks: DashMap<String, Arc<TableHooks>>,
    events: DatabaseEvents,
    tx_counter: AtomicU64,
}

impl DatabaseShared {
    pub(crate) fn events(&self) -> &DatabaseEvents {
        &self.events
    }

    pub(crate) fn core(&self) -> IdxResult<Arc<dyn Core>> {
        self.state
            .read()
            .core
            .clone()
            .ok_or(IdxError::DatabaseClosed)
    }

    fn hooks_for(&self, table: &str) -> Arc<TableHooks> {
        self.hooks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(TableHooks::new()))
            .clone()
    }

    pub(crate) fn table_bound(
        self: &Arc<Self>,
        name: &str,
        tx: Option<Transaction>,
    ) -> IdxResult<Table> {
        let state = self.state.read();
        if !state.open {
            return Err(IdxError::DatabaseClosed);
        }
        let schema = state
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| IdxError::InvalidTable(name.to_string()))?;
        drop(state);
        Ok(Table {
            shared: self.clone(),
            schema,
            hooks: self.hooks_for(name),
            tx,
        })
    }

    pub(crate) fn begin_transaction(
        self: &Arc<Self>,
        mode: TransactionMode,
        tables: &[&str],
        durability: Durability,
    ) -> IdxResult<Transaction> {
        let state = self.state.read();
        if !state.open {
            return Err(IdxError::DatabaseClosed);
        }
        let mut stores = Vec::with_capacity(tables.len());
        for table in tables {
            if !state.tables.contains_key(*table) {
                return Err(IdxError::InvalidTable(table.to_string()));
            }
            stores.push(table.to_string());
        }
        drop(state);

        let engine_tx = self.engine.begin(mode, &stores, durability)?;
        let id = self.tx_counter.fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(
            self.clone(),
            id,
            mode,
            stores,
            durability,
            engine_tx,
        ))
    }
}

/// 데이터베이스 핸들
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// 참조 인메모리 엔진으로 새 데이터베이스 생성
    pub fn new(name: &str) -> Self {
        Self::with_engine(name, Arc::new(MemoryEngine::new(name)))
    }

    /// 호스트 제공 엔진으로 새 데이터베이스 생성
    pub fn with_engine(name: &str, engine: Arc<dyn Engine>) -> Self {
        Self {
            shared: Arc::new(DatabaseShared {
                name: name.to_string(),
                engine,
                versions: Mutex::new(BTreeMap::new()),
                state: RwLock::new(OpenState::default()),
                middleware: MiddlewareStack::new(),
                hooks: DashMap::new(),
                events: DatabaseEvents::new(),
                tx_counter: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.read().open
    }

    /// 버전 정의 빌더
    pub fn version(&self, number: u64) -> VersionBuilder<'_> {
        VersionBuilder {
            shared: &self.shared,
            number,
        }
    }

    /// 스키마를 최신 버전으로 열고 필요한 업그레이드를 수행
    pub fn open(&self) -> IdxResult<()> {
        if self.is_open() {
            return Err(IdxError::InvalidState(
                "database is already open".to_string(),
            ));
        }
        let versions = self.shared.versions.lock().clone();
        if versions.is_empty() {
            return Err(IdxError::OpenFailed("no versions defined".to_string()));
        }
        if versions.contains_key(&0) {
            return Err(IdxError::Schema("version numbers start at 1".to_string()));
        }
        let latest = *versions.keys().next_back().expect("versions is non-empty");

        let old_version = self.open_engine(latest)?;
        debug!(db = %self.shared.name, old_version, latest, "opening");

        let mut current = schema_at(&versions, old_version);
        for (&number, def) in versions.range((Bound::Excluded(old_version), Bound::Included(latest)))
        {
            let target = schema_at(&versions, number);
            let changes = diff(&current, &target);
            if let Some(SchemaChange::ChangePrimaryKey { table }) = changes
                .iter()
                .find(|c| matches!(c, SchemaChange::ChangePrimaryKey { .. }))
            {
                self.reset_state();
                return Err(IdxError::Schema(format!(
                    "table '{table}': the primary key changed between versions; \
                     delete and recreate the table instead"
                )));
            }
            if let Err(err) = self.shared.engine.apply(&target, &changes) {
                self.reset_state();
                return Err(err.into());
            }
            if let Some(upgrade) = &def.upgrade {
                self.install_state(&target);
                let tables: Vec<&str> = target.keys().map(String::as_str).collect();
                let tx = self.shared.begin_transaction(
                    TransactionMode::ReadWrite,
                    &tables,
                    Durability::Default,
                )?;
                match upgrade(&tx) {
                    Ok(()) => tx.commit_and_publish()?,
                    Err(err) => {
                        tx.abort_quiet();
                        self.reset_state();
                        return Err(err);
                    }
                }
            }
            current = target;
        }

        self.install_state(&schema_at(&versions, latest));
        info!(db = %self.shared.name, version = latest, "database opened");
        if old_version != 0 && old_version != latest {
            let event = VersionChangeEvent {
                old_version,
                new_version: latest,
            };
            self.shared.events.emit_versionchange(&event)?;
        }
        self.shared.events.emit_ready()
    }

    /// 비결정적 UnknownError에 한해 제한 횟수 재시도
    fn open_engine(&self, version: u64) -> IdxResult<u64> {
        let mut attempt = 0;
        loop {
            match self.shared.engine.open(version) {
                Ok(old) => return Ok(old),
                Err(err) if err.name == "UnknownError" && attempt < OPEN_RETRIES => {
                    attempt += 1;
                    warn!(db = %self.shared.name, attempt, "retrying open after unknown error");
                }
                Err(err) if err.name == "BlockedError" => {
                    let event = VersionChangeEvent {
                        old_version: 0,
                        new_version: version,
                    };
                    self.shared.events.emit_blocked(&event)?;
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn install_state(&self, schema: &DatabaseSchema) {
        let mut state = self.shared.state.write();
        state.open = true;
        state.schema = schema.clone();
        state.tables = schema
            .iter()
            .map(|(name, table)| (name.clone(), Arc::new(table.clone())))
            .collect();
        let base: Arc<dyn Core> =
            Arc::new(EngineCore::new(&*self.shared.engine, schema.clone()));
        state.core = Some(self.shared.middleware.compose(base));
    }

    fn reset_state(&self) {
        let mut state = self.shared.state.write();
        *state = OpenState::default();
        drop(state);
        self.shared.engine.close();
    }

    /// 핸들 닫기 — 이후 연산은 DatabaseClosed
    pub fn close(&self) -> IdxResult<()> {
        {
            let mut state = self.shared.state.write();
            if !state.open {
                return Ok(());
            }
            *state = OpenState::default();
        }
        self.shared.engine.close();
        self.shared.events.emit_close()
    }

    /// 백엔드 데이터베이스 삭제
    pub fn delete_database(&self) -> IdxResult<()> {
        self.close()?;
        self.shared.engine.wipe()?;
        Ok(())
    }

    /// 테이블 핸들 (암묵적 트랜잭션 모드)
    pub fn table(&self, name: &str) -> IdxResult<Table> {
        self.shared.table_bound(name, None)
    }

    /// 명시적 트랜잭션 실행 — 정상 종료 시 커밋, 에러 시 롤백
    pub fn transaction<R>(
        &self,
        mode: TransactionMode,
        tables: &[&str],
        f: impl FnOnce(&Transaction) -> IdxResult<R>,
    ) -> IdxResult<R> {
        self.transaction_with_durability(mode, tables, Durability::Default, f)
    }

    pub fn transaction_with_durability<R>(
        &self,
        mode: TransactionMode,
        tables: &[&str],
        durability: Durability,
        f: impl FnOnce(&Transaction) -> IdxResult<R>,
    ) -> IdxResult<R> {
        let tx = self.shared.begin_transaction(mode, tables, durability)?;
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

    // ════════════════════════════════════════════
    // Middleware
    // ════════════════════════════════════════════

    /// 미들웨어 등록 — 같은 이름은 교체되며, 열려 있으면 코어를 재구성
    pub fn use_middleware(&self, middleware: Middleware) {
        self.shared.middleware.register(middleware);
        self.rebuild_core();
    }

    pub fn unuse_middleware(&self, name: &str) -> bool {
        let removed = self.shared.middleware.unregister(name);
        if removed {
            self.rebuild_core();
        }
        removed
    }

    fn rebuild_core(&self) {
        let mut state = self.shared.state.write();
        if state.open {
            let base: Arc<dyn Core> = Arc::new(EngineCore::new(
                &*self.shared.engine,
                state.schema.clone(),
            ));
            state.core = Some(self.shared.middleware.compose(base));
        }
    }

    // ════════════════════════════════════════════
    // Events
    // ════════════════════════════════════════════

    pub fn on_ready(&self, listener: ReadyListener) -> ListenerId {
        self.shared.events.on_ready(listener)
    }

    pub fn on_blocked(&self, listener: VersionListener) -> ListenerId {
        self.shared.events.on_blocked(listener)
    }

    pub fn on_versionchange(&self, listener: VersionListener) -> ListenerId {
        self.shared.events.on_versionchange(listener)
    }

    pub fn on_close(&self, listener: CloseListener) -> ListenerId {
        self.shared.events.on_close(listener)
    }

    pub fn on_changes(
        &self,
        listener: Arc<dyn Fn(&[ChangeEntry]) -> IdxResult<()> + Send + Sync>,
    ) -> ListenerId {
        self.shared.events.on_changes(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.unsubscribe(id)
    }
}

/// 버전 `number`까지의 정의를 누적 적용한 스키마
fn schema_at(versions: &BTreeMap<u64, VersionDef>, number: u64) -> DatabaseSchema {
    let mut schema = DatabaseSchema::new();
    for def in versions.range(..=number).map(|(_, def)| def) {
        for (name, table) in &def.tables {
            match table {
                Some(table) => {
                    schema.insert(name.clone(), table.clone());
                }
                None => {
                    schema.remove(name);
                }
            }
        }
    }
    schema
}

/// `db.version(n)`이 반환하는 버전 정의 빌더
pub struct VersionBuilder<'a> {
    shared: &'a Arc<DatabaseShared>,
    number: u64,
}

impl VersionBuilder<'_> {
    /// 이 버전의 테이블 정의 추가/갱신
    pub fn stores(self, defs: &[(&str, &str)]) -> IdxResult<Self> {
        self.ensure_closed()?;
        let mut parsed = Vec::with_capacity(defs.len());
        for (name, def) in defs {
            parsed.push((name.to_string(), Some(parse_table(name, def)?)));
        }
        let mut versions = self.shared.versions.lock();
        versions
            .entry(self.number)
            .or_default()
            .tables
            .extend(parsed);
        drop(versions);
        Ok(self)
    }

    /// 이 버전에서 테이블 삭제
    pub fn delete_table(self, name: &str) -> IdxResult<Self> {
        self.ensure_closed()?;
        self.shared
            .versions
            .lock()
            .entry(self.number)
            .or_default()
            .tables
            .push((name.to_string(), None));
        Ok(self)
    }

    /// 업그레이드 콜백 등록
    pub fn upgrade(
        self,
        f: impl Fn(&Transaction) -> IdxResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.shared
            .versions
            .lock()
            .entry(self.number)
            .or_default()
            .upgrade = Some(Arc::new(f));
        self
    }

    fn ensure_closed(&self) -> IdxResult<()> {
        if self.shared.state.read().open {
            Err(IdxError::InvalidState(
                "schema versions are immutable while the database is open".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

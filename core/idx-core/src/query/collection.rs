//! Collection — 지연 실행 쿼리 파이프라인
//!
//! 변형 연산은 컨텍스트를 복제-수정한 새 Collection을 돌려주고,
//! 종결 연산이 트랜잭션을 얻어 단일 범위 요청(+OR 컨텍스트)을 실행한 뒤
//! until/필터/offset/limit/합집합 중복 제거를 적용합니다.
//!
//! 사후 처리 규칙: 필터나 until이 있으면 offset/limit을 백엔드로
//! 내리지 않고 필터링 후에 적용합니다. 커서 알고리즘이 있으면 필터링은
//! 알고리즘 몫이므로 offset/limit을 그대로 내립니다.

use std::collections::HashSet;
use std::sync::Arc;

use crate::Record;
use crate::core::{MutateRequest, QueryItem, QueryRequest};
use crate::engine::TransactionMode;
use crate::error::{IdxError, IdxResult};
use crate::hooks::merge_into;
use crate::key::Key;
use crate::query::where_clause::OrClause;
use crate::query::{Context, UntilSpec};
use crate::schema::project_path;
use crate::transaction::Transaction;

/// 지연 쿼리 컬렉션 (복제 = 컨텍스트 복제)
#[derive(Clone)]
pub struct Collection {
    ctx: Context,
}

impl Collection {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub(crate) fn push_or_context(&mut self, ctx: Context) {
        self.ctx.or_contexts.push(ctx);
    }

    // ════════════════════════════════════════════
    // Transformations
    // ════════════════════════════════════════════

    /// 사후 필터 추가 (기존 필터와 AND 결합)
    pub fn and(mut self, predicate: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        let next: Arc<dyn Fn(&Record) -> bool + Send + Sync> = match self.ctx.filter.take() {
            Some(existing) => Arc::new(move |record| existing(record) && predicate(record)),
            None => Arc::new(predicate),
        };
        self.ctx.filter = Some(next);
        self
    }

    /// `and`의 별칭
    pub fn filter(self, predicate: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.and(predicate)
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.ctx.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.ctx.offset = n;
        self
    }

    /// 순회 방향 반전 — 두 번 적용하면 원래 방향
    pub fn reverse(mut self) -> Self {
        self.ctx.reverse = !self.ctx.reverse;
        self
    }

    /// `reverse`의 별칭
    pub fn desc(self) -> Self {
        self.reverse()
    }

    /// 연속된 중복 인덱스 키 제거
    pub fn unique(mut self) -> Self {
        self.ctx.unique = true;
        self
    }

    /// 술어가 참이 되는 레코드에서 순회를 중단
    pub fn until(
        mut self,
        predicate: impl Fn(&Record) -> bool + Send + Sync + 'static,
        include_stop_item: bool,
    ) -> Self {
        self.ctx.until = Some(UntilSpec {
            predicate: Arc::new(predicate),
            include_stop: include_stop_item,
        });
        self
    }

    /// reading 훅 우회
    pub fn raw(mut self) -> Self {
        self.ctx.raw = true;
        self
    }

    /// 대안 인덱스 술어 빌더 — 결과는 기본 키로 중복 제거되어 합쳐진다
    pub fn or(self, index: &str) -> IdxResult<OrClause> {
        let table = self.ctx.table.clone();
        let resolved = if index.is_empty() || index == ":id" {
            String::new()
        } else if table.schema().index(index).is_some() {
            index.to_string()
        } else {
            return Err(IdxError::NotFound(format!(
                "index '{index}' on table '{}'",
                table.name()
            )));
        };
        Ok(OrClause::new(self, table, resolved))
    }

    // ════════════════════════════════════════════
    // Execution
    // ════════════════════════════════════════════

    fn execute(&self, tx: &Transaction, need_values: bool) -> IdxResult<Vec<QueryItem>> {
        let main = execute_context(tx, &self.ctx, need_values)?;
        if self.ctx.or_contexts.is_empty() {
            return Ok(main);
        }
        // OR 합집합: 직렬화된 기본 키로 중복 제거, 바깥 limit은 합집합에 적용
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut out = Vec::new();
        for item in main {
            if seen.insert(item.primary_key.encode()) {
                out.push(item);
            }
        }
        for or_ctx in &self.ctx.or_contexts {
            for item in execute_context(tx, or_ctx, need_values)? {
                if seen.insert(item.primary_key.encode()) {
                    out.push(item);
                }
            }
        }
        if let Some(limit) = self.ctx.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn read_records(&self, items: Vec<QueryItem>) -> IdxResult<Vec<Record>> {
        items
            .into_iter()
            .map(|item| {
                let record = item
                    .value
                    .ok_or_else(|| IdxError::Data("query returned no record value".to_string()))?;
                if self.ctx.raw {
                    Ok(record)
                } else {
                    self.ctx.table.apply_reading(record)
                }
            })
            .collect()
    }

    // ════════════════════════════════════════════
    // Terminal Operations
    // ════════════════════════════════════════════

    /// 모든 레코드 반환
    pub fn to_array(&self) -> IdxResult<Vec<Record>> {
        self.ctx.table.with_tx(TransactionMode::ReadOnly, |tx| {
            let items = self.execute(tx, true)?;
            self.read_records(items)
        })
    }

    /// 기본 키 시퀀스 반환
    ///
    /// 필터/until/OR가 없으면 값을 읽지 않는 빠른 경로를 탄다.
    pub fn primary_keys(&self) -> IdxResult<Vec<Key>> {
        self.ctx.table.with_tx(TransactionMode::ReadOnly, |tx| {
            Ok(self
                .execute(tx, false)?
                .into_iter()
                .map(|item| item.primary_key)
                .collect())
        })
    }

    /// 인덱스 키 시퀀스 반환
    pub fn keys(&self) -> IdxResult<Vec<Key>> {
        self.ctx.table.with_tx(TransactionMode::ReadOnly, |tx| {
            Ok(self
                .execute(tx, false)?
                .into_iter()
                .map(|item| item.key)
                .collect())
        })
    }

    /// 중복 없는 인덱스 키 시퀀스
    pub fn unique_keys(&self) -> IdxResult<Vec<Key>> {
        self.clone().unique().keys()
    }

    /// 레코드 순회
    pub fn each(&self, mut f: impl FnMut(&Record) -> IdxResult<()>) -> IdxResult<()> {
        for record in self.to_array()? {
            f(&record)?;
        }
        Ok(())
    }

    /// 인덱스 키 순회
    pub fn each_key(&self, mut f: impl FnMut(&Key) -> IdxResult<()>) -> IdxResult<()> {
        for key in self.keys()? {
            f(&key)?;
        }
        Ok(())
    }

    /// 기본 키 순회
    pub fn each_primary_key(&self, mut f: impl FnMut(&Key) -> IdxResult<()>) -> IdxResult<()> {
        for key in self.primary_keys()? {
            f(&key)?;
        }
        Ok(())
    }

    /// 첫 레코드
    pub fn first(&self) -> IdxResult<Option<Record>> {
        let mut limited = self.clone();
        limited.ctx.limit = Some(1);
        Ok(limited.to_array()?.into_iter().next())
    }

    /// 마지막 레코드 (역방향 첫 레코드)
    pub fn last(&self) -> IdxResult<Option<Record>> {
        let mut reversed = self.clone();
        reversed.ctx.reverse = !reversed.ctx.reverse;
        reversed.ctx.limit = Some(1);
        Ok(reversed.to_array()?.into_iter().next())
    }

    /// 매칭 레코드 수
    ///
    /// 필터/until/OR/알고리즘이 있으면 실체화해서 세고, 아니면 백엔드
    /// count를 그대로 사용합니다.
    pub fn count(&self) -> IdxResult<usize> {
        let ctx = &self.ctx;
        let simple = ctx.filter.is_none()
            && ctx.until.is_none()
            && ctx.or_contexts.is_empty()
            && ctx.algorithm.is_none()
            && !ctx.unique;
        self.ctx.table.with_tx(TransactionMode::ReadOnly, |tx| {
            if simple {
                let total = ctx.table.count_in(tx, &ctx.index, &ctx.range)? as usize;
                let mut n = total.saturating_sub(ctx.offset);
                if let Some(limit) = ctx.limit {
                    n = n.min(limit);
                }
                Ok(n)
            } else {
                Ok(self.execute(tx, false)?.len())
            }
        })
    }

    /// 키 경로 투영값으로 안정 정렬한 레코드 배열
    pub fn sort_by(&self, key_path: &str) -> IdxResult<Vec<Record>> {
        let mut records = self.to_array()?;
        records.sort_by(|a, b| project_path(a, key_path).cmp(&project_path(b, key_path)));
        Ok(records)
    }

    /// 매칭 레코드에 변경 객체를 병합 적용, 변경된 레코드 수 반환
    pub fn modify(&self, changes: &Record) -> IdxResult<usize> {
        let changes_clone = changes.clone();
        self.modify_inner(
            &mut move |record| merge_into(record, &changes_clone),
            changes,
        )
    }

    /// 매칭 레코드를 함수로 제자리 수정
    pub fn modify_with(&self, mut f: impl FnMut(&mut Record)) -> IdxResult<usize> {
        self.modify_inner(&mut f, &Record::Null)
    }

    fn modify_inner(
        &self,
        apply: &mut dyn FnMut(&mut Record),
        changes_repr: &Record,
    ) -> IdxResult<usize> {
        if !self.ctx.or_contexts.is_empty() {
            return Err(IdxError::InvalidState(
                "modify is not supported on OR-composed collections".to_string(),
            ));
        }
        if self.ctx.table.is_outbound() {
            return Err(IdxError::InvalidState(
                "modify is not supported on tables with outbound primary keys".to_string(),
            ));
        }
        self.ctx.table.with_tx(TransactionMode::ReadWrite, |tx| {
            let items = self.execute(tx, true)?;
            let count = items.len();
            let hooks = self.ctx.table.hooks();
            let mut records = Vec::with_capacity(count);
            for item in items {
                let old = item
                    .value
                    .ok_or_else(|| IdxError::Data("modify requires record values".to_string()))?;
                let mut merged = old.clone();
                apply(&mut merged);
                if let Some(extra) = hooks.fire_updating(changes_repr, &item.primary_key, &old)? {
                    merge_into(&mut merged, &extra);
                }
                records.push(merged);
            }
            if !records.is_empty() {
                let response = self
                    .ctx
                    .table
                    .mutate_in(tx, MutateRequest::Put {
                        records,
                        keys: None,
                    })?;
                if response.num_failures > 0 {
                    let indices: Vec<usize> = response.failures.keys().copied().collect();
                    return Err(IdxError::Constraint(format!(
                        "modify failed for {} of {count} records at indices {indices:?}",
                        response.num_failures
                    )));
                }
            }
            Ok(count)
        })
    }

    /// 매칭 레코드 삭제, 삭제 수 반환
    ///
    /// 필터/인덱스 없는 기본 키 플랜은 사전 count 후 범위 삭제로
    /// 내려가고, 그 외에는 키를 추출해 일괄 삭제합니다.
    pub fn delete(&self) -> IdxResult<usize> {
        let ctx = &self.ctx;
        if !ctx.or_contexts.is_empty() {
            return Err(IdxError::InvalidState(
                "delete is not supported on OR-composed collections".to_string(),
            ));
        }
        let filtered = ctx.filter.is_some() || ctx.until.is_some() || ctx.algorithm.is_some();
        if ctx.table.is_outbound() && (filtered || !ctx.index.is_empty()) {
            return Err(IdxError::InvalidState(
                "filtered or indexed delete is not supported on outbound-key tables".to_string(),
            ));
        }
        let plain_range = !filtered
            && ctx.index.is_empty()
            && ctx.limit.is_none()
            && ctx.offset == 0
            && !ctx.unique;
        self.ctx.table.with_tx(TransactionMode::ReadWrite, |tx| {
            let hooks = self.ctx.table.hooks();
            if plain_range && !hooks.has_deleting() {
                let count = ctx.table.count_in(tx, "", &ctx.range)? as usize;
                ctx.table.mutate_in(tx, MutateRequest::DeleteRange {
                    range: ctx.range.clone(),
                })?;
                return Ok(count);
            }
            let need_values = hooks.has_deleting();
            let items = self.execute(tx, need_values)?;
            let count = items.len();
            if need_values {
                for item in &items {
                    let old = item.value.as_ref().ok_or_else(|| {
                        IdxError::Data("delete hooks require record values".to_string())
                    })?;
                    hooks.fire_deleting(&item.primary_key, old)?;
                }
            }
            let keys: Vec<Key> = items.into_iter().map(|item| item.primary_key).collect();
            if !keys.is_empty() {
                ctx.table.mutate_in(tx, MutateRequest::Delete { keys })?;
            }
            Ok(count)
        })
    }
}

/// 하나의 컨텍스트 실행: 요청 구성 → 코어 질의 → until/필터/offset/limit
fn execute_context(
    tx: &Transaction,
    ctx: &Context,
    need_values: bool,
) -> IdxResult<Vec<QueryItem>> {
    if ctx.algorithm.is_some() && ctx.reverse {
        return Err(IdxError::InvalidState(
            "reverse is not supported together with a cursor algorithm".to_string(),
        ));
    }

    let mut request = QueryRequest::new(ctx.index.clone(), ctx.range.clone());
    request.reverse = ctx.reverse;
    request.unique = ctx.unique;
    request.raw = ctx.raw;
    request.algorithm = ctx.algorithm.clone();

    let post_process = ctx.until.is_some() || ctx.filter.is_some();
    if ctx.until.is_some() {
        // until은 커서 원본 스트림을 봐야 하므로 아무것도 내리지 않는다
        request.values = true;
    } else {
        request.values = need_values;
        if ctx.filter.is_some() {
            request.filter = ctx.filter.clone();
        } else {
            request.limit = ctx.limit;
            request.offset = ctx.offset;
        }
    }

    let response = ctx.table.query_in(tx, &request)?;
    let mut items = response.result;

    if let Some(until) = &ctx.until {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let stop = item
                .value
                .as_ref()
                .map(|record| (until.predicate)(record))
                .unwrap_or(false);
            if stop {
                if until.include_stop {
                    kept.push(item);
                }
                break;
            }
            kept.push(item);
        }
        items = kept;
        if let Some(filter) = &ctx.filter {
            items.retain(|item| {
                item.value
                    .as_ref()
                    .map(|record| filter(record))
                    .unwrap_or(false)
            });
        }
    }

    if post_process {
        if ctx.offset > 0 {
            let drop = ctx.offset.min(items.len());
            items.drain(..drop);
        }
        if let Some(limit) = ctx.limit {
            items.truncate(limit);
        }
    }

    Ok(items)
}

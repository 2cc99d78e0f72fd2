//! Fluent query pipeline — where-clause → collection → terminal op.
//!
//! Every transformation clones the full query context, so collections are
//! cheap immutable values that can be forked and re-run freely.

pub mod collection;
pub mod ignore_case;
pub mod where_clause;

use crate::core::{AlgorithmFactory, RecordPredicate};
use crate::key_range::KeyRange;
use crate::table::Table;

pub use collection::Collection;
pub use where_clause::{OrClause, WhereClause};

/// `until` 중단 조건
#[derive(Clone)]
pub(crate) struct UntilSpec {
    pub predicate: RecordPredicate,
    pub include_stop: bool,
}

/// 컬렉션이 들고 다니는 전체 지연 쿼리 상태
///
/// 변형 연산은 항상 복제-후-수정으로 새 컨텍스트를 만듭니다.
#[derive(Clone)]
pub(crate) struct Context {
    pub table: Table,
    /// 빈 문자열이면 기본 키 스캔
    pub index: String,
    pub range: KeyRange,
    pub filter: Option<RecordPredicate>,
    pub reverse: bool,
    pub unique: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    pub until: Option<UntilSpec>,
    /// reading 훅 우회
    pub raw: bool,
    /// OR 합집합으로 실행될 대안 컨텍스트들
    pub or_contexts: Vec<Context>,
    pub algorithm: Option<AlgorithmFactory>,
}

impl Context {
    pub(crate) fn new(table: Table, index: String) -> Self {
        Self {
            table,
            index,
            range: KeyRange::All,
            filter: None,
            reverse: false,
            unique: false,
            limit: None,
            offset: 0,
            until: None,
            raw: false,
            or_contexts: Vec::new(),
            algorithm: None,
        }
    }
}

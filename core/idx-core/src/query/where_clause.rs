//! Where Clause — 인덱스에 대한 관계 술어를 범위 플랜으로 변환
//!
//! 각 빌더는 적절한 KeyRange, 사후 필터, (대소문자 무시 계열의 경우)
//! 커서 알고리즘을 담은 Collection을 반환합니다. `or()` 빌더는 같은
//! 플래너를 써서 대안 컨텍스트를 기존 컬렉션에 덧붙입니다.

use std::collections::HashSet;
use std::sync::Arc;

use crate::Record;
use crate::core::RecordPredicate;
use crate::error::{IdxError, IdxResult};
use crate::key::{IntoKey, Key};
use crate::key_range::{KeyRange, next_string_after};
use crate::query::ignore_case::{self, MatchKind};
use crate::query::{Collection, Context};
use crate::schema::KeyPath;
use crate::table::Table;

/// 하나의 술어가 만들어내는 실행 계획 조각
struct PredicatePlan {
    range: KeyRange,
    filter: Option<RecordPredicate>,
    algorithm: Option<crate::core::AlgorithmFactory>,
}

impl PredicatePlan {
    fn range(range: KeyRange) -> Self {
        Self {
            range,
            filter: None,
            algorithm: None,
        }
    }

    fn never() -> Self {
        Self {
            range: KeyRange::AnyOf { values: Vec::new() },
            filter: Some(Arc::new(|_| false)),
            algorithm: None,
        }
    }
}

/// WhereClause와 OrClause가 공유하는 술어 플래너
struct Planner {
    table: Table,
    index: String,
}

impl Planner {
    /// 필터 기반 플랜이 쓸 인덱스 키 경로
    fn key_path(&self) -> IdxResult<KeyPath> {
        let path = if self.index.is_empty() {
            self.table.schema().primary_key.key_path.clone()
        } else {
            self.table
                .schema()
                .index(&self.index)
                .and_then(|spec| spec.key_path.clone())
        };
        path.ok_or_else(|| {
            IdxError::Data(format!(
                "index '{}' on table '{}' has no key path for predicate filtering",
                self.index,
                self.table.name()
            ))
        })
    }

    fn equals(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::equal(value)?))
    }

    fn not_equal(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::not_equal(value)?))
    }

    fn any_of<I, K>(&self, values: I) -> IdxResult<PredicatePlan>
    where
        I: IntoIterator<Item = K>,
        K: IntoKey,
    {
        let range = KeyRange::any_of(values)?;
        match &range {
            KeyRange::AnyOf { values } if values.is_empty() => Ok(PredicatePlan::never()),
            KeyRange::AnyOf { values } if values.len() == 1 => {
                Ok(PredicatePlan::range(KeyRange::Equal {
                    value: values[0].clone(),
                }))
            }
            _ => Ok(PredicatePlan::range(range)),
        }
    }

    fn none_of<I, K>(&self, values: I) -> IdxResult<PredicatePlan>
    where
        I: IntoIterator<Item = K>,
        K: IntoKey,
    {
        let path = self.key_path()?;
        let excluded: HashSet<Vec<u8>> = values
            .into_iter()
            .map(|v| v.into_key().map(|k| k.encode()))
            .collect::<IdxResult<_>>()?;
        let filter: RecordPredicate = Arc::new(move |record: &Record| {
            path.project(record)
                .map(|key| !excluded.contains(&key.encode()))
                .unwrap_or(false)
        });
        Ok(PredicatePlan {
            range: KeyRange::All,
            filter: Some(filter),
            algorithm: None,
        })
    }

    fn above(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::above(value, true)?))
    }

    fn above_or_equal(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::above(value, false)?))
    }

    fn below(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::below(value, true)?))
    }

    fn below_or_equal(&self, value: impl IntoKey) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::below(value, false)?))
    }

    fn between(
        &self,
        lower: impl IntoKey,
        upper: impl IntoKey,
        include_lower: bool,
        include_upper: bool,
    ) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::between(
            lower,
            upper,
            include_lower,
            include_upper,
        )?))
    }

    fn starts_with(&self, prefix: &str) -> IdxResult<PredicatePlan> {
        Ok(PredicatePlan::range(KeyRange::starts_with(prefix)))
    }

    fn starts_with_any_of(&self, prefixes: &[&str]) -> IdxResult<PredicatePlan> {
        match prefixes {
            [] => Ok(PredicatePlan::never()),
            // 단일 접두사는 startsWith로 위임
            [prefix] => self.starts_with(prefix),
            _ => {
                let mut sorted: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
                sorted.sort();
                if sorted.iter().any(|p| p.is_empty()) {
                    return Ok(PredicatePlan::range(KeyRange::All));
                }
                let lowest = sorted.first().cloned().unwrap_or_default();
                let highest = sorted.last().cloned().unwrap_or_default();
                // 모든 접두사를 덮는 단일 범위 + 정밀 필터
                let range = match next_string_after(&highest) {
                    Some(end) => KeyRange::Range {
                        lower: Some(Key::String(lowest)),
                        upper: Some(Key::String(end)),
                        lower_open: false,
                        upper_open: true,
                    },
                    None => KeyRange::Range {
                        lower: Some(Key::String(lowest)),
                        upper: None,
                        lower_open: false,
                        upper_open: false,
                    },
                };
                let path = self.key_path()?;
                let filter: RecordPredicate = Arc::new(move |record: &Record| {
                    path.project(record)
                        .and_then(|key| key.as_str().map(String::from))
                        .map(|s| sorted.iter().any(|p| s.starts_with(p.as_str())))
                        .unwrap_or(false)
                });
                Ok(PredicatePlan {
                    range,
                    filter: Some(filter),
                    algorithm: None,
                })
            }
        }
    }

    fn equals_ignore_case(&self, needle: &str) -> IdxResult<PredicatePlan> {
        let (range, algorithm) = ignore_case::plan(&[needle], MatchKind::Equals);
        Ok(PredicatePlan {
            range,
            filter: None,
            algorithm: Some(algorithm),
        })
    }

    fn starts_with_ignore_case(&self, prefix: &str) -> IdxResult<PredicatePlan> {
        let (range, algorithm) = ignore_case::plan(&[prefix], MatchKind::StartsWith);
        Ok(PredicatePlan {
            range,
            filter: None,
            algorithm: Some(algorithm),
        })
    }

    fn any_of_ignore_case(&self, needles: &[&str]) -> IdxResult<PredicatePlan> {
        if needles.is_empty() {
            return Ok(PredicatePlan::never());
        }
        if needles.iter().any(|n| n.is_empty()) {
            // 빈 니들이 섞이면 전 범위 + 필터로 후퇴
            let path = self.key_path()?;
            let lowered: Vec<String> =
                needles.iter().map(|n| ignore_case::lower_str(n)).collect();
            let filter: RecordPredicate = Arc::new(move |record: &Record| {
                path.project(record)
                    .and_then(|key| key.as_str().map(ignore_case::lower_str))
                    .map(|s| lowered.iter().any(|n| *n == s))
                    .unwrap_or(false)
            });
            return Ok(PredicatePlan {
                range: KeyRange::All,
                filter: Some(filter),
                algorithm: None,
            });
        }
        let (range, algorithm) = ignore_case::plan(needles, MatchKind::Equals);
        Ok(PredicatePlan {
            range,
            filter: None,
            algorithm: Some(algorithm),
        })
    }

    fn starts_with_any_of_ignore_case(&self, prefixes: &[&str]) -> IdxResult<PredicatePlan> {
        if prefixes.is_empty() {
            return Ok(PredicatePlan::never());
        }
        let path = self.key_path()?;
        let lowered: Vec<String> = prefixes.iter().map(|p| ignore_case::lower_str(p)).collect();
        let filter: RecordPredicate = Arc::new(move |record: &Record| {
            path.project(record)
                .and_then(|key| key.as_str().map(ignore_case::lower_str))
                .map(|s| lowered.iter().any(|p| s.starts_with(p.as_str())))
                .unwrap_or(false)
        });
        Ok(PredicatePlan {
            range: KeyRange::All,
            filter: Some(filter),
            algorithm: None,
        })
    }

    fn in_any_range<L, U>(
        &self,
        ranges: Vec<(L, U)>,
        include_lower: bool,
        include_upper: bool,
    ) -> IdxResult<PredicatePlan>
    where
        L: IntoKey,
        U: IntoKey,
    {
        let mut key_ranges = Vec::with_capacity(ranges.len());
        for (lower, upper) in ranges {
            key_ranges.push(KeyRange::between(
                lower,
                upper,
                include_lower,
                include_upper,
            )?);
        }
        match key_ranges.len() {
            0 => Ok(PredicatePlan::never()),
            1 => Ok(PredicatePlan::range(key_ranges.pop().expect("length 1"))),
            _ => {
                let path = self.key_path()?;
                let filter: RecordPredicate = Arc::new(move |record: &Record| {
                    path.project(record)
                        .map(|key| key_ranges.iter().any(|r| r.contains(&key)))
                        .unwrap_or(false)
                });
                Ok(PredicatePlan {
                    range: KeyRange::All,
                    filter: Some(filter),
                    algorithm: None,
                })
            }
        }
    }
}

/// `table.where_(index)`가 반환하는 술어 빌더
pub struct WhereClause {
    planner: Planner,
}

macro_rules! where_builders {
    ($build:ident) => {
        pub fn equals(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.equals(value)?;
            Ok(self.$build(plan))
        }

        pub fn not_equal(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.not_equal(value)?;
            Ok(self.$build(plan))
        }

        pub fn any_of<I, K>(&self, values: I) -> IdxResult<Collection>
        where
            I: IntoIterator<Item = K>,
            K: IntoKey,
        {
            let plan = self.planner.any_of(values)?;
            Ok(self.$build(plan))
        }

        pub fn none_of<I, K>(&self, values: I) -> IdxResult<Collection>
        where
            I: IntoIterator<Item = K>,
            K: IntoKey,
        {
            let plan = self.planner.none_of(values)?;
            Ok(self.$build(plan))
        }

        pub fn above(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.above(value)?;
            Ok(self.$build(plan))
        }

        pub fn above_or_equal(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.above_or_equal(value)?;
            Ok(self.$build(plan))
        }

        pub fn below(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.below(value)?;
            Ok(self.$build(plan))
        }

        pub fn below_or_equal(&self, value: impl IntoKey) -> IdxResult<Collection> {
            let plan = self.planner.below_or_equal(value)?;
            Ok(self.$build(plan))
        }

        /// 하한 포함, 상한 제외가 기본
        pub fn between(
            &self,
            lower: impl IntoKey,
            upper: impl IntoKey,
        ) -> IdxResult<Collection> {
            let plan = self.planner.between(lower, upper, true, false)?;
            Ok(self.$build(plan))
        }

        pub fn between_with_bounds(
            &self,
            lower: impl IntoKey,
            upper: impl IntoKey,
            include_lower: bool,
            include_upper: bool,
        ) -> IdxResult<Collection> {
            let plan = self
                .planner
                .between(lower, upper, include_lower, include_upper)?;
            Ok(self.$build(plan))
        }

        pub fn starts_with(&self, prefix: &str) -> IdxResult<Collection> {
            let plan = self.planner.starts_with(prefix)?;
            Ok(self.$build(plan))
        }

        pub fn starts_with_any_of(&self, prefixes: &[&str]) -> IdxResult<Collection> {
            let plan = self.planner.starts_with_any_of(prefixes)?;
            Ok(self.$build(plan))
        }

        pub fn equals_ignore_case(&self, needle: &str) -> IdxResult<Collection> {
            let plan = self.planner.equals_ignore_case(needle)?;
            Ok(self.$build(plan))
        }

        pub fn starts_with_ignore_case(&self, prefix: &str) -> IdxResult<Collection> {
            let plan = self.planner.starts_with_ignore_case(prefix)?;
            Ok(self.$build(plan))
        }

        pub fn any_of_ignore_case(&self, needles: &[&str]) -> IdxResult<Collection> {
            let plan = self.planner.any_of_ignore_case(needles)?;
            Ok(self.$build(plan))
        }

        pub fn starts_with_any_of_ignore_case(
            &self,
            prefixes: &[&str],
        ) -> IdxResult<Collection> {
            let plan = self.planner.starts_with_any_of_ignore_case(prefixes)?;
            Ok(self.$build(plan))
        }

        pub fn in_any_range<L, U>(
            &self,
            ranges: Vec<(L, U)>,
            include_lower: bool,
            include_upper: bool,
        ) -> IdxResult<Collection>
        where
            L: IntoKey,
            U: IntoKey,
        {
            let plan = self
                .planner
                .in_any_range(ranges, include_lower, include_upper)?;
            Ok(self.$build(plan))
        }
    };
}

impl WhereClause {
    pub(crate) fn new(table: Table, index: String) -> Self {
        Self {
            planner: Planner { table, index },
        }
    }

    fn build(&self, plan: PredicatePlan) -> Collection {
        let mut ctx = Context::new(self.planner.table.clone(), self.planner.index.clone());
        ctx.range = plan.range;
        ctx.filter = plan.filter;
        ctx.algorithm = plan.algorithm;
        Collection::new(ctx)
    }

    where_builders!(build);
}

/// `collection.or(index)`가 반환하는 대안 술어 빌더
///
/// 술어가 확정되면 대안 컨텍스트가 기존 컬렉션에 덧붙습니다.
pub struct OrClause {
    collection: Collection,
    planner: Planner,
}

impl OrClause {
    pub(crate) fn new(collection: Collection, table: Table, index: String) -> Self {
        Self {
            collection,
            planner: Planner { table, index },
        }
    }

    fn build(&self, plan: PredicatePlan) -> Collection {
        let mut ctx = Context::new(self.planner.table.clone(), self.planner.index.clone());
        ctx.range = plan.range;
        ctx.filter = plan.filter;
        ctx.algorithm = plan.algorithm;
        let mut collection = self.collection.clone();
        collection.push_or_context(ctx);
        collection
    }

    where_builders!(build);
}

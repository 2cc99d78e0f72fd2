//! Case-insensitive cursor-jump planner.
//!
//! Given string needles, produces the narrowest index range that can hold
//! any casing of any needle plus a cursor algorithm that collects matches
//! and otherwise jumps the cursor to the smallest key that could still
//! match. The jump candidate is built by walking the shared prefix with
//! the needle, bumping the first mismatching position to whichever casing
//! of the needle's character is just above the key's character, and
//! restoring the remainder from the upper-cased needle. Needles that can
//! no longer match advance a watermark so later steps skip them.
//!
//! Casing is applied per character (first mapping only), which keeps key
//! and needle positions aligned; the planner is forward-only.

use std::sync::Arc;

use crate::core::{AlgorithmFactory, CursorAlgorithm, CursorStep};
use crate::key::Key;
use crate::key_range::KeyRange;

/// Which match the algorithm checks at each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchKind {
    Equals,
    StartsWith,
}

/// Range + algorithm for a set of needles.
pub(crate) fn plan(needles: &[&str], kind: MatchKind) -> (KeyRange, AlgorithmFactory) {
    let mut pairs: Vec<(String, String)> = needles
        .iter()
        .map(|needle| (lower_str(needle), upper_str(needle)))
        .collect();
    pairs.sort();

    let lower_bound = pairs.first().map(|(_, upper)| upper.clone()).unwrap_or_default();
    let mut upper_bound = pairs.last().map(|(lower, _)| lower.clone()).unwrap_or_default();
    if kind == MatchKind::StartsWith {
        upper_bound.push(char::MAX);
    }
    let range = KeyRange::Range {
        lower: Some(Key::String(lower_bound)),
        upper: Some(Key::String(upper_bound)),
        lower_open: false,
        upper_open: false,
    };

    let lower_needles: Vec<String> = pairs.iter().map(|(lower, _)| lower.clone()).collect();
    let upper_needles: Vec<String> = pairs.iter().map(|(_, upper)| upper.clone()).collect();
    let factory: AlgorithmFactory = Arc::new(move || {
        Box::new(IgnoreCaseAlgorithm {
            lower_needles: lower_needles.clone(),
            upper_needles: upper_needles.clone(),
            kind,
            first_possible: 0,
        })
    });
    (range, factory)
}

struct IgnoreCaseAlgorithm {
    lower_needles: Vec<String>,
    upper_needles: Vec<String>,
    kind: MatchKind,
    /// Needles below this position can no longer match any later key.
    first_possible: usize,
}

impl IgnoreCaseAlgorithm {
    fn matches(&self, lower_key: &str) -> bool {
        match self.kind {
            MatchKind::Equals => self.lower_needles.iter().any(|needle| needle == lower_key),
            MatchKind::StartsWith => self
                .lower_needles
                .iter()
                .any(|needle| lower_key.starts_with(needle)),
        }
    }
}

impl CursorAlgorithm for IgnoreCaseAlgorithm {
    fn next(&mut self, key: &Key) -> CursorStep {
        let Some(key_str) = key.as_str() else {
            return CursorStep::Skip;
        };
        let lower_key = lower_str(key_str);
        if self.matches(&lower_key) {
            return CursorStep::Collect;
        }

        let mut lowest: Option<String> = None;
        for i in self.first_possible..self.lower_needles.len() {
            match next_casing(key_str, &lower_key, &self.upper_needles[i], &self.lower_needles[i]) {
                None => {
                    if lowest.is_none() {
                        self.first_possible = i + 1;
                    }
                }
                Some(candidate) => {
                    if lowest.as_ref().is_none_or(|best| *best > candidate) {
                        lowest = Some(candidate);
                    }
                }
            }
        }
        match lowest {
            Some(candidate) => CursorStep::JumpTo(Key::String(candidate)),
            None => CursorStep::Stop,
        }
    }
}

/// Smallest casing variant of the needle that is still above `key`, or
/// `None` when no variant can follow this key.
fn next_casing(key: &str, lower_key: &str, upper_needle: &str, lower_needle: &str) -> Option<String> {
    let key_chars: Vec<char> = key.chars().collect();
    let lower_key_chars: Vec<char> = lower_key.chars().collect();
    let upper_chars: Vec<char> = upper_needle.chars().collect();
    let lower_chars: Vec<char> = lower_needle.chars().collect();

    let length = key_chars.len().min(lower_chars.len());
    // Rightmost position where the key held the upper-case variant.
    let mut lower_last: Option<usize> = None;

    for i in 0..length {
        if lower_key_chars[i] != lower_chars[i] {
            // First real mismatch: bump this position to whichever needle
            // casing sits just above the key's character.
            if key_chars[i] < upper_chars[i] {
                return Some(splice(&key_chars[..i], upper_chars[i], &upper_chars[i + 1..]));
            }
            if key_chars[i] < lower_chars[i] {
                return Some(splice(&key_chars[..i], lower_chars[i], &upper_chars[i + 1..]));
            }
            return lower_last.map(|p| {
                splice(&key_chars[..p], lower_key_chars[p], &upper_chars[p + 1..])
            });
        }
        if key_chars[i] < lower_key_chars[i] {
            lower_last = Some(i);
        }
    }

    if length < lower_chars.len() {
        // Key is a strict prefix of the needle: extend with the remainder.
        return Some(splice(&key_chars, upper_chars[key_chars.len()], &upper_chars[key_chars.len() + 1..]));
    }

    lower_last.map(|p| splice(&key_chars[..p], lower_chars[p], &upper_chars[p + 1..]))
}

fn splice(prefix: &[char], ch: char, rest: &[char]) -> String {
    let mut out = String::with_capacity(prefix.len() + 1 + rest.len());
    out.extend(prefix.iter());
    out.push(ch);
    out.extend(rest.iter());
    out
}

/// Per-character casing keeps positions aligned between key and needle.
fn lower_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn upper_char(c: char) -> char {
    c.to_uppercase().next().unwrap_or(c)
}

pub(crate) fn lower_str(s: &str) -> String {
    s.chars().map(lower_char).collect()
}

fn upper_str(s: &str) -> String {
    s.chars().map(upper_char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_bounds_for_equals() {
        let (range, _) = plan(&["alice"], MatchKind::Equals);
        match range {
            KeyRange::Range { lower, upper, lower_open, upper_open } => {
                assert_eq!(lower, Some(Key::from("ALICE")));
                assert_eq!(upper, Some(Key::from("alice")));
                assert!(!lower_open && !upper_open);
            }
            other => panic!("expected Range, got {other:?}"),
        }
    }

    #[test]
    fn plan_bounds_for_starts_with_have_sentinel() {
        let (range, _) = plan(&["al"], MatchKind::StartsWith);
        match range {
            KeyRange::Range { upper: Some(Key::String(upper)), .. } => {
                assert!(upper.starts_with("al"));
                assert!(upper.ends_with(char::MAX));
            }
            other => panic!("expected Range, got {other:?}"),
        }
    }

    #[test]
    fn next_casing_bumps_first_mismatch() {
        // After "aaa", the smallest casing of "abc" is "abC".
        assert_eq!(next_casing("aaa", "aaa", "ABC", "abc"), Some("abC".into()));
        // After "Abd" nothing can match "abc" while position 0 stays "A"
        // as upper-case, so flip it to lower-case and restart the rest.
        assert_eq!(next_casing("Abd", "abd", "ABC", "abc"), Some("aBC".into()));
    }

    #[test]
    fn next_casing_extends_prefix_keys() {
        assert_eq!(next_casing("a", "a", "ABC", "abc"), Some("aBC".into()));
    }

    #[test]
    fn next_casing_exhausted_needle() {
        // Key is already above every casing of the needle.
        assert_eq!(next_casing("abd", "abd", "ABC", "abc"), None);
    }

    #[test]
    fn algorithm_collects_all_casings() {
        let (_, factory) = plan(&["ant"], MatchKind::Equals);
        let mut algorithm = factory();
        assert_eq!(algorithm.next(&Key::from("ANT")), CursorStep::Collect);
        assert_eq!(algorithm.next(&Key::from("AnT")), CursorStep::Collect);
        assert_eq!(algorithm.next(&Key::from("ant")), CursorStep::Collect);
    }

    #[test]
    fn algorithm_jumps_over_non_matching_regions() {
        let (_, factory) = plan(&["abc"], MatchKind::Equals);
        let mut algorithm = factory();
        match algorithm.next(&Key::from("aaa")) {
            CursorStep::JumpTo(Key::String(target)) => assert_eq!(target, "abC"),
            other => panic!("expected jump, got {other:?}"),
        }
    }

    #[test]
    fn algorithm_stops_when_no_needle_remains() {
        let (_, factory) = plan(&["abc"], MatchKind::Equals);
        let mut algorithm = factory();
        assert_eq!(algorithm.next(&Key::from("abd")), CursorStep::Stop);
    }

    #[test]
    fn algorithm_skips_non_string_keys() {
        let (_, factory) = plan(&["abc"], MatchKind::Equals);
        let mut algorithm = factory();
        assert_eq!(algorithm.next(&Key::from(42)), CursorStep::Skip);
    }

    #[test]
    fn watermark_drops_exhausted_needles() {
        let (_, factory) = plan(&["ab", "zz"], MatchKind::Equals);
        let mut algorithm = factory();
        // "ac" is above every casing of "ab"; only "zz" can still match.
        match algorithm.next(&Key::from("ac")) {
            CursorStep::JumpTo(Key::String(target)) => assert_eq!(target, "zZ"),
            other => panic!("expected jump, got {other:?}"),
        }
        assert_eq!(algorithm.next(&Key::from("zz")), CursorStep::Collect);
    }
}

//! Key range model — backend-independent key constraints.
//!
//! A [`KeyRange`] describes which index keys a query touches. `AnyOf` and
//! `NotEqual` are planner-level variants: the executor expands `AnyOf`
//! into point queries and `NotEqual` into a full scan plus filter.
//! Full-range is always the explicit [`KeyRange::All`] variant; there is
//! no "undefined bound" sentinel anywhere.

use std::ops::Bound;

use crate::error::{IdxError, IdxResult};
use crate::key::{IntoKey, Key};

/// Tagged key constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRange {
    /// Unbounded — every key matches
    All,
    /// Single point
    Equal { value: Key },
    /// Bounded range with open/closed flags
    Range {
        lower: Option<Key>,
        upper: Option<Key>,
        lower_open: bool,
        upper_open: bool,
    },
    /// Explicit point set — expanded by the executor into point queries
    AnyOf { values: Vec<Key> },
    /// Everything except one point — expanded into full scan + filter
    NotEqual { value: Key },
}

impl KeyRange {
    /// Point range.
    pub fn equal(value: impl IntoKey) -> IdxResult<KeyRange> {
        Ok(KeyRange::Equal {
            value: value.into_key()?,
        })
    }

    /// Keys strictly above (or from, when `open` is false) `value`.
    pub fn above(value: impl IntoKey, open: bool) -> IdxResult<KeyRange> {
        Ok(KeyRange::Range {
            lower: Some(value.into_key()?),
            upper: None,
            lower_open: open,
            upper_open: false,
        })
    }

    /// Keys strictly below (or up to, when `open` is false) `value`.
    pub fn below(value: impl IntoKey, open: bool) -> IdxResult<KeyRange> {
        Ok(KeyRange::Range {
            lower: None,
            upper: Some(value.into_key()?),
            lower_open: false,
            upper_open: open,
        })
    }

    /// Bounded range. Defaults elsewhere are closed-low / open-high; here
    /// both flags are explicit. Errors when `lower > upper`.
    pub fn between(
        lower: impl IntoKey,
        upper: impl IntoKey,
        include_lower: bool,
        include_upper: bool,
    ) -> IdxResult<KeyRange> {
        let lower = lower.into_key()?;
        let upper = upper.into_key()?;
        if lower > upper {
            return Err(IdxError::Data(format!(
                "invalid range: lower bound {lower:?} above upper bound {upper:?}"
            )));
        }
        Ok(KeyRange::Range {
            lower: Some(lower),
            upper: Some(upper),
            lower_open: !include_lower,
            upper_open: !include_upper,
        })
    }

    /// Point set. Values are deduplicated and put into canonical (sorted)
    /// order; the executor runs them as consecutive point queries.
    pub fn any_of<I, T>(values: I) -> IdxResult<KeyRange>
    where
        I: IntoIterator<Item = T>,
        T: IntoKey,
    {
        let mut keys = Vec::new();
        for value in values {
            keys.push(value.into_key()?);
        }
        keys.sort();
        keys.dedup();
        Ok(KeyRange::AnyOf { values: keys })
    }

    /// Everything except `value`.
    pub fn not_equal(value: impl IntoKey) -> IdxResult<KeyRange> {
        Ok(KeyRange::NotEqual {
            value: value.into_key()?,
        })
    }

    /// Range of all strings beginning with `prefix`:
    /// `[prefix, next_string_after(prefix))`. An empty prefix matches every
    /// key; a prefix ending in the maximum code point degenerates to
    /// `aboveOrEqual(prefix)`.
    pub fn starts_with(prefix: &str) -> KeyRange {
        if prefix.is_empty() {
            return KeyRange::All;
        }
        match next_string_after(prefix) {
            Some(end) => KeyRange::Range {
                lower: Some(Key::String(prefix.to_string())),
                upper: Some(Key::String(end)),
                lower_open: false,
                upper_open: true,
            },
            None => KeyRange::Range {
                lower: Some(Key::String(prefix.to_string())),
                upper: None,
                lower_open: false,
                upper_open: false,
            },
        }
    }

    /// Whether `key` satisfies this constraint.
    pub fn contains(&self, key: &Key) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Equal { value } => key == value,
            KeyRange::Range {
                lower,
                upper,
                lower_open,
                upper_open,
            } => {
                if let Some(lo) = lower {
                    if key < lo || (*lower_open && key == lo) {
                        return false;
                    }
                }
                if let Some(hi) = upper {
                    if key > hi || (*upper_open && key == hi) {
                        return false;
                    }
                }
                true
            }
            KeyRange::AnyOf { values } => values.binary_search(key).is_ok(),
            KeyRange::NotEqual { value } => key != value,
        }
    }

    /// Ordered bounds for the backend scan. `AnyOf` and `NotEqual` have no
    /// single bound pair; the executor expands them before reaching here.
    pub fn to_bounds(&self) -> Option<(Bound<Key>, Bound<Key>)> {
        match self {
            KeyRange::All => Some((Bound::Unbounded, Bound::Unbounded)),
            KeyRange::Equal { value } => Some((
                Bound::Included(value.clone()),
                Bound::Included(value.clone()),
            )),
            KeyRange::Range {
                lower,
                upper,
                lower_open,
                upper_open,
            } => {
                let lo = match lower {
                    None => Bound::Unbounded,
                    Some(k) if *lower_open => Bound::Excluded(k.clone()),
                    Some(k) => Bound::Included(k.clone()),
                };
                let hi = match upper {
                    None => Bound::Unbounded,
                    Some(k) if *upper_open => Bound::Excluded(k.clone()),
                    Some(k) => Bound::Included(k.clone()),
                };
                Some((lo, hi))
            }
            KeyRange::AnyOf { .. } | KeyRange::NotEqual { .. } => None,
        }
    }
}

/// Smallest string ordering after every string with the given prefix.
///
/// Bumps the last code point by one. Returns `None` when the last code
/// point is already the maximum, in which case the range has no finite
/// upper bound.
pub fn next_string_after(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    let last = *chars.last()?;
    let next = next_char(last)?;
    let idx = chars.len() - 1;
    chars[idx] = next;
    Some(chars.into_iter().collect())
}

fn next_char(c: char) -> Option<char> {
    let mut code = c as u32 + 1;
    // Skip the surrogate gap; it is not encodable as a char.
    if (0xD800..=0xDFFF).contains(&code) {
        code = 0xE000;
    }
    char::from_u32(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_validates_bounds() {
        assert!(KeyRange::between(30, 25, true, false).is_err());
        assert!(KeyRange::between(25, 30, true, false).is_ok());
        assert!(KeyRange::between(25, 25, true, true).is_ok());
    }

    #[test]
    fn between_default_half_open() {
        let range = KeyRange::between(25, 30, true, false).unwrap();
        assert!(range.contains(&Key::from(25)));
        assert!(range.contains(&Key::from(29)));
        assert!(!range.contains(&Key::from(30)));
    }

    #[test]
    fn above_below() {
        let above = KeyRange::above(10, true).unwrap();
        assert!(!above.contains(&Key::from(10)));
        assert!(above.contains(&Key::from(11)));

        let below = KeyRange::below(10, false).unwrap();
        assert!(below.contains(&Key::from(10)));
        assert!(!below.contains(&Key::from(11)));
    }

    #[test]
    fn any_of_dedups_and_sorts() {
        let range = KeyRange::any_of([3, 1, 2, 1]).unwrap();
        match &range {
            KeyRange::AnyOf { values } => {
                assert_eq!(
                    values,
                    &vec![Key::from(1), Key::from(2), Key::from(3)]
                );
            }
            other => panic!("expected AnyOf, got {other:?}"),
        }
        assert!(range.contains(&Key::from(2)));
        assert!(!range.contains(&Key::from(4)));
    }

    #[test]
    fn not_equal_contains() {
        let range = KeyRange::not_equal("x").unwrap();
        assert!(range.contains(&Key::from("y")));
        assert!(!range.contains(&Key::from("x")));
    }

    #[test]
    fn starts_with_bumps_last_code_point() {
        let range = KeyRange::starts_with("ab");
        match range {
            KeyRange::Range { lower, upper, .. } => {
                assert_eq!(lower, Some(Key::from("ab")));
                assert_eq!(upper, Some(Key::from("ac")));
            }
            other => panic!("expected Range, got {other:?}"),
        }
    }

    #[test]
    fn starts_with_empty_prefix_is_all() {
        assert_eq!(KeyRange::starts_with(""), KeyRange::All);
    }

    #[test]
    fn starts_with_max_code_point_degenerates() {
        let prefix = format!("a{}", char::MAX);
        match KeyRange::starts_with(&prefix) {
            KeyRange::Range { lower, upper, .. } => {
                assert_eq!(lower, Some(Key::String(prefix)));
                assert_eq!(upper, None);
            }
            other => panic!("expected Range, got {other:?}"),
        }
    }

    #[test]
    fn starts_with_matches_between_equivalent() {
        let sw = KeyRange::starts_with("user5");
        let eq = KeyRange::between("user5", "user6", true, false).unwrap();
        for candidate in ["user5", "user50", "user59z", "user6", "user4", "x"] {
            assert_eq!(
                sw.contains(&Key::from(candidate)),
                eq.contains(&Key::from(candidate)),
                "mismatch for {candidate}"
            );
        }
    }
}

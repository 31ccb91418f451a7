//! NIP-01 filters and the matching rules shared by queries and live
//! subscriptions.
//!
//! Within a filter every present field must hold (AND); a subscription with
//! several filters matches when any one of them does (OR). Both `since` and
//! `until` are inclusive.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::Event;

/// Maximum number of distinct `#x` keys in a single filter.
const MAX_TAG_KEYS: usize = 4;

/// Query and subscription filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u32>>,
    /// Tag constraints keyed by tag name without the `#`.
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = non_empty(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = non_empty(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds = non_empty(kinds.into_iter().collect());
        self
    }

    pub fn tag<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        key: impl Into<String>,
        values: I,
    ) -> Self {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.tags.insert(key.into(), values);
        }
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if an event satisfies every constraint of this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|s| ev.created_at < s) {
            return false;
        }
        if self.until.is_some_and(|u| ev.created_at > u) {
            return false;
        }
        self.tags
            .iter()
            .all(|(key, wanted)| ev.tag_values(key).any(|v| wanted.contains(v)))
    }

    /// Whether `created_at` alone already rules the event out.
    pub fn time_excludes(&self, created_at: u64) -> bool {
        self.since.is_some_and(|s| created_at < s) || self.until.is_some_and(|u| created_at > u)
    }

    /// Reject filters that would be too expensive to serve.
    pub fn validate(&self, max_values: usize) -> Result<()> {
        if self.tags.len() > MAX_TAG_KEYS {
            return Err(Error::validation(format!(
                "filter has more than {MAX_TAG_KEYS} tag constraints"
            )));
        }
        let values = self.ids.as_ref().map_or(0, BTreeSet::len)
            + self.authors.as_ref().map_or(0, BTreeSet::len)
            + self.kinds.as_ref().map_or(0, BTreeSet::len)
            + self.tags.values().map(BTreeSet::len).sum::<usize>();
        if values > max_values {
            return Err(Error::validation(format!(
                "filter lists {values} values (max {max_values})"
            )));
        }
        if let (Some(s), Some(u)) = (self.since, self.until) {
            if s > u {
                return Err(Error::validation("since is after until"));
            }
        }
        Ok(())
    }

    /// Build a `Filter` from a Nostr filter JSON object used by HTTP and WS APIs.
    pub fn from_value(val: &Value) -> Result<Self> {
        let obj = val
            .as_object()
            .ok_or_else(|| Error::validation("filter must be a JSON object"))?;
        let mut f = Filter::new();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => f.ids = non_empty(string_set(key, v)?),
                "authors" => f.authors = non_empty(string_set(key, v)?),
                "kinds" => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| Error::validation("kinds must be an array"))?;
                    let kinds = arr
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| Error::validation("kinds must be integers"))
                        })
                        .collect::<Result<BTreeSet<u32>>>()?;
                    f.kinds = non_empty(kinds);
                }
                "since" => f.since = Some(timestamp(key, v)?),
                "until" => f.until = Some(timestamp(key, v)?),
                "limit" => f.limit = Some(timestamp(key, v)? as usize),
                k if k.starts_with('#') && k.len() > 1 => {
                    let values = string_set(key, v)?;
                    if !values.is_empty() {
                        f.tags.insert(k[1..].to_string(), values);
                    }
                }
                // Unknown fields (e.g. NIP-50 "search") impose no constraint here.
                _ => {}
            }
        }
        Ok(f)
    }
}

/// A subscription matches when any of its filters does.
pub fn matches_any(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

fn non_empty<T: Ord>(set: BTreeSet<T>) -> Option<BTreeSet<T>> {
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn string_set(key: &str, v: &Value) -> Result<BTreeSet<String>> {
    let arr = v
        .as_array()
        .ok_or_else(|| Error::validation(format!("{key} must be an array")))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::validation(format!("{key} must contain strings")))
        })
        .collect()
}

fn timestamp(key: &str, v: &Value) -> Result<u64> {
    v.as_u64()
        .ok_or_else(|| Error::validation(format!("{key} must be a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{testing::keys, Tag};
    use proptest::prelude::*;

    fn event(kind: u32, created_at: u64, tags: Vec<Tag>) -> Event {
        keys(7).sign(kind, created_at, tags, "hi").unwrap()
    }

    #[test]
    fn parse_filter_fields() {
        let val = serde_json::json!({
            "ids": ["a1"],
            "authors": ["p1", "p2"],
            "kinds": [9, 11],
            "#h": ["lounge"],
            "#p": ["x", "y"],
            "since": 1,
            "until": 2,
            "limit": 3,
            "search": "ignored"
        });
        let f = Filter::from_value(&val).unwrap();
        assert_eq!(f.ids.unwrap().len(), 1);
        assert_eq!(f.authors.unwrap().len(), 2);
        assert_eq!(f.kinds.unwrap(), BTreeSet::from([9, 11]));
        assert_eq!(f.tags["h"], BTreeSet::from(["lounge".to_string()]));
        assert_eq!(f.tags["p"].len(), 2);
        assert_eq!(f.since, Some(1));
        assert_eq!(f.until, Some(2));
        assert_eq!(f.limit, Some(3));
    }

    #[test]
    fn parse_filter_defaults_and_errors() {
        let f = Filter::from_value(&serde_json::json!({})).unwrap();
        assert_eq!(f, Filter::new());
        let f = Filter::from_value(&serde_json::json!({"kinds": [], "#h": []})).unwrap();
        assert_eq!(f, Filter::new());
        assert!(Filter::from_value(&serde_json::json!([])).is_err());
        assert!(Filter::from_value(&serde_json::json!({"kinds": ["1"]})).is_err());
        assert!(Filter::from_value(&serde_json::json!({"authors": [1]})).is_err());
        assert!(Filter::from_value(&serde_json::json!({"since": -1})).is_err());
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::new().matches(&event(9, 1, vec![])));
    }

    #[test]
    fn since_and_until_are_inclusive() {
        let ev = event(9, 100, vec![]);
        assert!(Filter::new().since(100).matches(&ev));
        assert!(Filter::new().until(100).matches(&ev));
        assert!(Filter::new().since(100).until(100).matches(&ev));
        assert!(!Filter::new().since(101).matches(&ev));
        assert!(!Filter::new().until(99).matches(&ev));
    }

    #[test]
    fn tag_constraints_or_values_and_keys() {
        let ev = event(
            9,
            1,
            vec![Tag::new(["h", "lounge"]), Tag::new(["p", "bob"])],
        );
        assert!(Filter::new().tag("h", ["lounge", "other"]).matches(&ev));
        assert!(Filter::new()
            .tag("h", ["lounge"])
            .tag("p", ["bob"])
            .matches(&ev));
        assert!(!Filter::new()
            .tag("h", ["lounge"])
            .tag("p", ["carol"])
            .matches(&ev));
        assert!(!Filter::new().tag("e", ["x"]).matches(&ev));
    }

    #[test]
    fn tag_matching_uses_first_value_only() {
        let ev = event(9000, 1, vec![Tag::new(["p", "bob", "admin"])]);
        assert!(!Filter::new().tag("p", ["admin"]).matches(&ev));
    }

    #[test]
    fn validate_limits_complexity() {
        let f = Filter::new().authors((0..10).map(|i| i.to_string()));
        assert!(f.validate(10).is_ok());
        assert!(f.validate(9).is_err());
        let wide = ["a", "b", "c", "d", "e"]
            .into_iter()
            .fold(Filter::new(), |f, k| f.tag(k, ["v"]));
        assert!(wide.validate(100).is_err());
        assert!(Filter::new().since(5).until(4).validate(10).is_err());
    }

    #[test]
    fn subscription_matches_if_any_filter_matches() {
        let ev = event(9, 1, vec![]);
        let hit = Filter::new().kinds([9]);
        let miss = Filter::new().kinds([11]);
        assert!(matches_any(&[miss.clone(), hit.clone()], &ev));
        assert!(!matches_any(&[miss.clone(), miss], &ev));
        assert!(!matches_any(&[], &ev));
    }

    fn arb_filter() -> impl Strategy<Value = Filter> {
        (
            proptest::option::of(proptest::collection::btree_set(0u32..4, 1..3)),
            proptest::option::of(0u64..20),
            proptest::option::of(0u64..20),
            proptest::option::of(proptest::collection::btree_set("[ab]", 1..2)),
        )
            .prop_map(|(kinds, since, until, h)| {
                let mut f = Filter::new();
                f.kinds = kinds;
                f.since = since;
                f.until = until;
                if let Some(h) = h {
                    f.tags.insert("h".into(), h);
                }
                f
            })
    }

    proptest! {
        #[test]
        fn or_across_filters(
            filters in proptest::collection::vec(arb_filter(), 0..4),
            kind in 0u32..4,
            created_at in 0u64..20,
            group in "[ab]",
        ) {
            let ev = event(kind, created_at, vec![Tag::new(["h", group.as_str()])]);
            let expected = filters.iter().any(|f| f.matches(&ev));
            prop_assert_eq!(matches_any(&filters, &ev), expected);
        }

        #[test]
        fn adding_an_unsatisfied_constraint_flips_a_match(
            kind in 0u32..4,
            created_at in 1u64..20,
        ) {
            let ev = event(kind, created_at, vec![Tag::new(["h", "a"])]);
            let base = Filter::new().kinds([kind]);
            prop_assert!(base.matches(&ev));
            prop_assert!(!base.clone().kinds([kind + 1]).matches(&ev));
            prop_assert!(!base.clone().since(created_at + 1).matches(&ev));
            prop_assert!(!base.clone().until(created_at - 1).matches(&ev));
            prop_assert!(!base.clone().tag("h", ["zzz"]).matches(&ev));
            prop_assert!(!base.authors(["nobody"]).matches(&ev));
        }
    }
}

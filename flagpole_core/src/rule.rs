use chrono::{self, Utc};
use log::warn;
use regex::Regex;
use serde::Deserialize;

use crate::store::Store;
use crate::user::{AttributeValue, User};
use crate::variation::VariationOrRollout;

/// A single test against one user attribute. All clauses of a rule must hold for the rule to
/// match.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Clause {
    pub attribute: String,
    #[serde(default)]
    pub negate: bool,
    pub op: Op,
    pub values: Vec<AttributeValue>,
}

/// A rule inside a flag: clauses plus the variation (or rollout) served on match.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    /// When set, full-fidelity feature events (with the evaluation reason) are emitted whenever
    /// this rule decides the outcome.
    #[serde(default)]
    pub track_events: bool,
}

/// Clause operators as they appear on the wire.
///
/// An operator this version doesn't know decodes as [`Op::Unknown`], which never matches; newer
/// service rules degrade to "clause is false" rather than failing the whole flag.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    #[serde(other)]
    Unknown,
}

impl Clause {
    pub(crate) fn matches(&self, user: &User, store: &dyn Store) -> bool {
        if let Op::SegmentMatch = self.op {
            self.matches_segment(user, store)
        } else {
            self.matches_non_segment(user)
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    pub(crate) fn matches_segment(&self, user: &User, store: &dyn Store) -> bool {
        let any_match = self.values.iter().find(|value| {
            value
                .as_str()
                .and_then(|segment_key| store.segment(segment_key))
                .map(|segment| segment.contains(user))
                .unwrap_or(false)
        });
        self.maybe_negate(any_match.is_some())
    }

    pub(crate) fn matches_non_segment(&self, user: &User) -> bool {
        let user_val = match user.value_of(&self.attribute) {
            Some(v) => v,
            None => return false,
        };

        let any_match = user_val.find(|user_val_v| {
            let any_match_for_v = self
                .values
                .iter()
                .find(|clause_val| self.op.matches(user_val_v, clause_val));
            any_match_for_v.is_some()
        });

        self.maybe_negate(any_match.is_some())
    }
}

impl FlagRule {
    /// Rules match if _all_ of their clauses do.
    pub(crate) fn matches(&self, user: &User, store: &dyn Store) -> bool {
        for clause in &self.clauses {
            if !clause.matches(user, store) {
                return false;
            }
        }
        true
    }
}

impl Op {
    fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        match self {
            Op::In => lhs == rhs,

            // string ops
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => string_op(lhs, rhs, |l, r| match Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(e) => {
                    warn!(target: "flagpole", "invalid regex for 'matches' operator ({}): {}", e, r);
                    false
                }
            }),

            // numeric ops
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, |l, r| l < r),
            Op::After => time_op(lhs, rhs, |l, r| l > r),

            Op::SegmentMatch => {
                // special-cased in Clause::matches; a segmentMatch nested inside a segment rule
                // lands here and is simply false
                false
            }

            Op::SemVerEqual => semver_op(lhs, rhs, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, |l, r| l > r),

            Op::Unknown => false,
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.to_datetime(), rhs.to_datetime()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(semver::Version, semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_semver(), rhs.as_semver()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

#[cfg(test)]
impl Clause {
    /// Test helper: a clause whose regex must match `attribute`.
    pub(crate) fn new_match(attribute: &str, value: AttributeValue) -> Self {
        Self {
            attribute: attribute.to_owned(),
            negate: false,
            op: Op::Matches,
            values: vec![value],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    fn user_with(attr: &str, value: AttributeValue) -> User {
        User::with_key("k")
            .custom(hashmap! {attr.to_owned() => value})
            .build()
    }

    fn clause(attr: &str, op: Op, values: Vec<AttributeValue>) -> Clause {
        Clause {
            attribute: attr.to_owned(),
            negate: false,
            op,
            values,
        }
    }

    #[test]
    fn unknown_operator_parses_and_never_matches() {
        let c: Clause = serde_json::from_str(
            r#"{"attribute": "name", "op": "bananas", "values": ["x"], "negate": false}"#,
        )
        .unwrap();
        assert_that!(c.op).is_equal_to(Op::Unknown);
        let user = User::with_key("k").name("x").build();
        assert!(!c.matches_non_segment(&user));
    }

    #[test]
    fn in_op_matches_any_listed_literal() {
        let c = clause("group", Op::In, vec!["beta".into(), "qa".into()]);
        assert!(c.matches_non_segment(&user_with("group", "qa".into())));
        assert!(!c.matches_non_segment(&user_with("group", "ga".into())));
    }

    #[test]
    fn array_attribute_matches_on_any_element() {
        let c = clause("groups", Op::In, vec!["beta".into()]);
        let user = user_with("groups", vec!["alpha", "beta"].into());
        assert!(c.matches_non_segment(&user));
        let user = user_with("groups", vec!["alpha", "gamma"].into());
        assert!(!c.matches_non_segment(&user));
    }

    #[test]
    fn negate_inverts_the_result() {
        let mut c = clause("group", Op::In, vec!["beta".into()]);
        c.negate = true;
        assert!(!c.matches_non_segment(&user_with("group", "beta".into())));
        assert!(c.matches_non_segment(&user_with("group", "other".into())));
    }

    #[test]
    fn missing_attribute_is_false_even_negated() {
        let mut c = clause("group", Op::In, vec!["beta".into()]);
        c.negate = true;
        let user = User::with_key("k").build();
        assert!(!c.matches_non_segment(&user));
    }

    #[test_case(Op::StartsWith, "some-prefix", "some", true)]
    #[test_case(Op::StartsWith, "some-prefix", "prefix", false)]
    #[test_case(Op::EndsWith, "some-suffix", "suffix", true)]
    #[test_case(Op::EndsWith, "some-suffix", "some", false)]
    #[test_case(Op::Contains, "<needle>", "needle", true)]
    #[test_case(Op::Contains, "haystack", "needle", false)]
    #[test_case(Op::Matches, "anchored", "^anchor", true)]
    #[test_case(Op::Matches, "anchored", "^chored", false)]
    #[test_case(Op::Matches, "anything", "(unclosed", false; "invalid regex is false")]
    fn string_operators(op: Op, attr: &str, literal: &str, expected: bool) {
        let c = clause("s", op, vec![literal.into()]);
        assert_eq!(c.matches_non_segment(&user_with("s", attr.into())), expected);
    }

    #[test_case(Op::StartsWith)]
    #[test_case(Op::EndsWith)]
    #[test_case(Op::Contains)]
    #[test_case(Op::Matches)]
    fn string_operators_are_false_for_non_strings(op: Op) {
        let c = clause("s", op, vec!["1".into()]);
        assert!(!c.matches_non_segment(&user_with("s", 1.into())));
    }

    #[test_case(Op::LessThan, 1.0, 2.0, true)]
    #[test_case(Op::LessThan, 2.0, 2.0, false)]
    #[test_case(Op::LessThanOrEqual, 2.0, 2.0, true)]
    #[test_case(Op::GreaterThan, 3.0, 2.0, true)]
    #[test_case(Op::GreaterThan, 2.0, 2.0, false)]
    #[test_case(Op::GreaterThanOrEqual, 2.0, 2.0, true)]
    fn numeric_operators(op: Op, attr: f64, literal: f64, expected: bool) {
        let c = clause("n", op, vec![literal.into()]);
        assert_eq!(c.matches_non_segment(&user_with("n", attr.into())), expected);
    }

    #[test]
    fn numeric_operators_mix_int_and_float() {
        let c = clause("n", Op::LessThan, vec![2.5.into()]);
        assert!(c.matches_non_segment(&user_with("n", 2.into())));
    }

    #[test]
    fn numeric_operators_are_false_for_non_numbers() {
        let c = clause("n", Op::LessThan, vec![2.0.into()]);
        assert!(!c.matches_non_segment(&user_with("n", "1".into())));
    }

    #[test_case("2017-12-06T00:00:00Z", "2017-12-06T00:00:01Z", true)]
    #[test_case("2017-12-06T00:00:01Z", "2017-12-06T00:00:00Z", false)]
    fn before_parses_rfc3339(attr: &str, literal: &str, expected: bool) {
        let c = clause("t", Op::Before, vec![literal.into()]);
        assert_eq!(c.matches_non_segment(&user_with("t", attr.into())), expected);
    }

    #[test]
    fn after_compares_epoch_millis() {
        let c = clause("t", Op::After, vec![1_000_000.into()]);
        assert!(c.matches_non_segment(&user_with("t", 2_000_000.into())));
        assert!(!c.matches_non_segment(&user_with("t", 500_000.into())));
    }

    #[test]
    fn time_operators_mix_timestamp_and_millis() {
        // 1970-01-01T00:16:40Z is 1_000_000 ms after the epoch
        let c = clause("t", Op::After, vec!["1970-01-01T00:16:40Z".into()]);
        assert!(c.matches_non_segment(&user_with("t", 2_000_000.into())));
    }

    #[test_case(Op::SemVerEqual, "2.0.0", "2.0.0", true)]
    #[test_case(Op::SemVerEqual, "2.0", "2.0.0", true; "loose parse fills patch")]
    #[test_case(Op::SemVerEqual, "2.0.1", "2.0.0", false)]
    #[test_case(Op::SemVerLessThan, "1.9.9", "2.0.0", true)]
    #[test_case(Op::SemVerGreaterThan, "2.0.1", "2.0.0", true)]
    #[test_case(Op::SemVerGreaterThan, "not-a-version", "2.0.0", false)]
    fn semver_operators(op: Op, attr: &str, literal: &str, expected: bool) {
        let c = clause("v", op, vec![literal.into()]);
        assert_eq!(c.matches_non_segment(&user_with("v", attr.into())), expected);
    }
}

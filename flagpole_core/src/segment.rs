use serde::Deserialize;

use crate::rule::Clause;
use crate::user::User;
use crate::variation::VariationWeight;

/// A named user cohort that flags reference through the `segmentMatch` operator.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub(crate) included: Vec<String>,
    #[serde(default)]
    pub(crate) excluded: Vec<String>,
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,
}

/// A rule inside a segment: clauses plus an optional percentage gate.
///
/// Segment rules never contain `segmentMatch` clauses; their clauses are matched attribute-only.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SegmentRule {
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<VariationWeight>,
    #[serde(default)]
    bucket_by: Option<String>,
}

impl Segment {
    /// Membership test: explicit inclusion wins, then explicit exclusion, then rules in order.
    pub(crate) fn contains(&self, user: &User) -> bool {
        let user_key = user.key().to_string();

        if self.included.contains(&user_key) {
            return true;
        }
        if self.excluded.contains(&user_key) {
            return false;
        }

        for rule in &self.rules {
            if rule.matches(user, &self.key, &self.salt) {
                return true;
            }
        }

        false
    }
}

impl SegmentRule {
    pub fn matches(&self, user: &User, key: &str, salt: &str) -> bool {
        // rules match if _all_ of their clauses do
        for clause in &self.clauses {
            if !clause.matches_non_segment(user) {
                return false;
            }
        }

        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let bucket = user.bucket(key, self.bucket_by.as_deref(), salt);
                bucket < weight / 100_000.0
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::AttributeValue;

    fn new_segment() -> Segment {
        Segment {
            key: "segkey".to_string(),
            version: 1,
            included: vec![],
            excluded: vec![],
            rules: vec![],
            salt: "salty".to_string(),
        }
    }

    fn jane_rule(weight: Option<f32>, bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "name",
                AttributeValue::String("Jane".to_string()),
            )],
            weight,
            bucket_by,
        }
    }

    fn thirty_percent_rule(bucket_by: Option<String>) -> SegmentRule {
        SegmentRule {
            clauses: vec![Clause::new_match(
                "key",
                AttributeValue::String(".".to_string()),
            )],
            weight: Some(30_000.0),
            bucket_by,
        }
    }

    #[test]
    fn segment_rule_parse() {
        let rule: SegmentRule =
            serde_json::from_str(r#"{"clauses": [], "weight": null, "bucketBy": null}"#)
                .expect("should parse");
        assert_eq!(
            rule,
            SegmentRule {
                clauses: vec![],
                weight: None,
                bucket_by: None,
            }
        );

        let rule: SegmentRule = serde_json::from_str(
            r#"{
                "clauses":[{
                    "attribute": "name",
                    "negate": false,
                    "op": "matches",
                    "values": ["xyz"]
                }],
                "weight": 10000,
                "bucketBy": "country"
            }"#,
        )
        .expect("should parse");
        assert_eq!(rule.weight, Some(10_000.0));
        assert_eq!(rule.bucket_by, Some("country".to_string()));
    }

    #[test]
    fn explicit_inclusion_matches() {
        let mut segment = new_segment();
        segment.included.push("foo".to_string());
        segment.included.push("bar".to_string());
        assert!(segment.contains(&User::with_key("bar").build()));
        assert!(!segment.contains(&User::with_key("baz").build()));
    }

    #[test]
    fn user_is_matched_by_segment_rule() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        let jane = User::with_key("foo").name("Jane").build();
        let joan = User::with_key("foo").name("Joan").build();
        assert!(segment.contains(&jane));
        assert!(!segment.contains(&joan));
    }

    #[test]
    fn exclusion_beats_rules() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.excluded.push("foo".to_string());
        let jane = User::with_key("foo").name("Jane").build();
        assert!(!segment.contains(&jane));
    }

    #[test]
    fn inclusion_beats_exclusion() {
        let mut segment = new_segment();
        segment.included.push("bar".to_string());
        segment.excluded.push("foo".to_string());
        segment.excluded.push("bar".to_string());
        assert!(segment.contains(&User::with_key("bar").build()));
    }

    #[test]
    fn weighted_rule_gates_on_bucket() {
        let mut always = new_segment();
        always.rules.push(jane_rule(Some(99_999.0), None));
        let jane = User::with_key("key").name("Jane").build();
        assert!(always.contains(&jane));

        let mut never = new_segment();
        never.rules.push(jane_rule(Some(1.0), None));
        assert!(!never.contains(&jane));
    }

    #[test]
    fn weighted_rule_can_bucket_by_any_attribute() {
        let mut segment = new_segment();
        segment
            .rules
            .push(thirty_percent_rule(Some("name".to_string())));
        // buckets for segkey.salty: userKeyA = 0.14574753, userKeyZ = 0.45679215
        let user_a = User::with_key("x").name("userKeyA").build();
        let user_z = User::with_key("x").name("userKeyZ").build();
        assert!(segment.contains(&user_a));
        assert!(!segment.contains(&user_z));
    }
}

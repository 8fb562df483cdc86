use serde::Deserialize;

use crate::user::User;

/// Index into a flag's `variations` list.
pub type VariationIndex = usize;

pub type VariationWeight = f32;

/// How a flag (or one of its rules) picks the served variation: either a fixed index or a
/// weighted rollout bucketed per user.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VariationOrRollout {
    Variation(VariationIndex),
    Rollout(Rollout),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub bucket_by: Option<String>,
    pub variations: Vec<WeightedVariation>,
}

/// One slice of a rollout. Weights are expressed out of 100000 and are expected to sum to it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
}

impl VariationOrRollout {
    /// Resolve to a concrete variation index for this user.
    ///
    /// Returns None only when a rollout has no variations at all (malformed data). A rollout
    /// whose weights do not cover the user's bucket serves the last listed variation.
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        user: &User,
        salt: &str,
    ) -> Option<VariationIndex> {
        match self {
            VariationOrRollout::Variation(index) => Some(*index),
            VariationOrRollout::Rollout(Rollout {
                bucket_by,
                variations,
            }) => {
                let bucket = user.bucket(flag_key, bucket_by.as_deref(), salt);
                let mut sum = 0.0;
                for variation in variations {
                    sum += variation.weight / 100_000.0;
                    if bucket < sum {
                        return Some(variation.variation);
                    }
                }
                variations.last().map(|wv| wv.variation)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    fn fifty_fifty() -> VariationOrRollout {
        serde_json::from_str(
            r#"{"rollout": {"variations": [
                {"variation": 0, "weight": 50000},
                {"variation": 1, "weight": 50000}
            ]}}"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_fixed_variation() {
        let vr: VariationOrRollout = serde_json::from_str(r#"{"variation": 2}"#).unwrap();
        assert_that!(vr).is_equal_to(VariationOrRollout::Variation(2));
    }

    #[test]
    fn parses_rollout_with_bucket_by() {
        let vr: VariationOrRollout = serde_json::from_str(
            r#"{"rollout": {"bucketBy": "country", "variations": [{"variation": 0, "weight": 100000}]}}"#,
        )
        .unwrap();
        match vr {
            VariationOrRollout::Rollout(rollout) => {
                assert_that!(rollout.bucket_by).contains_value("country".to_string());
            }
            other => panic!("expected rollout, got {:?}", other),
        }
    }

    #[test]
    fn full_weights_route_every_user() {
        let vr = fifty_fifty();
        for i in 0..100 {
            let user = User::with_key(format!("userkey-{}", i)).build();
            let index = vr.variation("f", &user, "abc").unwrap();
            assert!(index == 0 || index == 1);
        }
    }

    #[test]
    fn rollout_is_deterministic_per_user() {
        let vr = fifty_fifty();
        let user = User::with_key("userkey-1").build();
        let first = vr.variation("f", &user, "abc");
        for _ in 0..10 {
            assert_that!(vr.variation("f", &user, "abc")).is_equal_to(first);
        }
    }

    #[test]
    fn rollout_splits_users_across_variations() {
        let vr = fifty_fifty();
        let mut seen = [0usize; 2];
        for i in 0..100 {
            let user = User::with_key(format!("userkey-{}", i)).build();
            seen[vr.variation("f", &user, "abc").unwrap()] += 1;
        }
        assert_that!(seen[0]).is_greater_than(0);
        assert_that!(seen[1]).is_greater_than(0);
    }

    #[test]
    fn short_weights_fall_back_to_last_variation() {
        let vr: VariationOrRollout = serde_json::from_str(
            r#"{"rollout": {"variations": [{"variation": 1, "weight": 1}]}}"#,
        )
        .unwrap();
        // almost every user's bucket exceeds 0.00001; all of them must land somewhere
        for i in 0..20 {
            let user = User::with_key(format!("userkey-{}", i)).build();
            assert_that!(vr.variation("f", &user, "abc")).contains_value(1);
        }
    }

    #[test]
    fn empty_rollout_is_malformed() {
        let vr: VariationOrRollout =
            serde_json::from_str(r#"{"rollout": {"variations": []}}"#).unwrap();
        let user = User::with_key("userkey-1").build();
        assert_that!(vr.variation("f", &user, "abc")).is_none();
    }
}

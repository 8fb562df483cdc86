#![cfg(test)]

use std::collections::HashMap;

use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;

/// A read-only store of canned flags and segments for evaluator tests.
pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

impl TestStore {
    pub fn new() -> Self {
        let mut flags: HashMap<String, Flag> = HashMap::new();
        for (key, json) in [
            (
                "flagWithTarget",
                r#"{
                    "key": "flagWithTarget",
                    "version": 42,
                    "on": false,
                    "targets": [{"values": ["bob"], "variation": 1}],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithRules",
                r#"{
                    "key": "flagWithRules",
                    "version": 1,
                    "on": true,
                    "rules": [
                        {
                            "id": "rule-0",
                            "variation": 0,
                            "clauses": [{"attribute": "email", "op": "in", "values": ["one@example.com"]}]
                        },
                        {
                            "id": "rule-1",
                            "variation": 1,
                            "clauses": [{"attribute": "email", "op": "in", "values": ["two@example.com"]}]
                        }
                    ],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithUnknownOpRule",
                r#"{
                    "key": "flagWithUnknownOpRule",
                    "version": 1,
                    "on": true,
                    "rules": [
                        {
                            "id": "rule-0",
                            "variation": 0,
                            "clauses": [{"attribute": "name", "op": "bananas", "values": ["match-me"]}]
                        },
                        {
                            "id": "rule-1",
                            "variation": 1,
                            "clauses": [{"attribute": "name", "op": "in", "values": ["match-me"]}]
                        }
                    ],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "offPrereq",
                r#"{
                    "key": "offPrereq",
                    "version": 1,
                    "on": false,
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "truePrereq",
                r#"{
                    "key": "truePrereq",
                    "version": 1,
                    "on": true,
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithOffPrereq",
                r#"{
                    "key": "flagWithOffPrereq",
                    "version": 1,
                    "on": true,
                    "prerequisites": [{"key": "offPrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithSatisfiedPrereq",
                r#"{
                    "key": "flagWithSatisfiedPrereq",
                    "version": 1,
                    "on": true,
                    "prerequisites": [{"key": "truePrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithMissingPrereq",
                r#"{
                    "key": "flagWithMissingPrereq",
                    "version": 1,
                    "on": true,
                    "prerequisites": [{"key": "badPrereq", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "cycleFlagA",
                r#"{
                    "key": "cycleFlagA",
                    "version": 1,
                    "on": true,
                    "prerequisites": [{"key": "cycleFlagB", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "cycleFlagB",
                r#"{
                    "key": "cycleFlagB",
                    "version": 1,
                    "on": true,
                    "prerequisites": [{"key": "cycleFlagA", "variation": 1}],
                    "fallthrough": {"variation": 1},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithSegmentMatch",
                r#"{
                    "key": "flagWithSegmentMatch",
                    "version": 1,
                    "on": true,
                    "rules": [
                        {
                            "id": "rule-0",
                            "variation": 1,
                            "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["testSegment"]}]
                        }
                    ],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithMissingSegment",
                r#"{
                    "key": "flagWithMissingSegment",
                    "version": 1,
                    "on": true,
                    "rules": [
                        {
                            "id": "rule-0",
                            "variation": 1,
                            "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["noSuchSegment"]}]
                        }
                    ],
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [false, true],
                    "salt": "salty"
                }"#,
            ),
            (
                "flagWithRolloutFallthrough",
                r#"{
                    "key": "f",
                    "version": 1,
                    "on": true,
                    "fallthrough": {
                        "rollout": {
                            "variations": [
                                {"variation": 0, "weight": 50000},
                                {"variation": 1, "weight": 50000}
                            ]
                        }
                    },
                    "offVariation": 0,
                    "variations": ["a", "b"],
                    "salt": "abc"
                }"#,
            ),
            (
                "flagWithNoVariations",
                r#"{
                    "key": "flagWithNoVariations",
                    "version": 1,
                    "on": true,
                    "fallthrough": {"variation": 0},
                    "offVariation": 0,
                    "variations": [],
                    "salt": "salty"
                }"#,
            ),
        ] {
            flags.insert(key.to_owned(), serde_json::from_str(json).unwrap());
        }

        let mut segments: HashMap<String, Segment> = HashMap::new();
        segments.insert(
            "testSegment".to_owned(),
            serde_json::from_str(
                r#"{
                    "key": "testSegment",
                    "version": 1,
                    "included": ["segment-member"],
                    "excluded": [],
                    "rules": [],
                    "salt": "salty"
                }"#,
            )
            .unwrap(),
        );

        Self { flags, segments }
    }

    /// Fetch a canned flag by fixture name (usually, but not always, its key).
    pub fn get(&self, name: &str) -> Option<Flag> {
        self.flags.get(name).cloned()
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments.get(segment_key).cloned()
    }
}

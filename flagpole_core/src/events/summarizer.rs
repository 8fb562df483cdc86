use std::collections::HashMap;

use crate::flag_value::FlagValue;
use crate::variation::VariationIndex;

use super::FeatureEvent;

/// Identifies one counter: evaluations of the same flag that produced the same variation from
/// the same flag version fold together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CounterKey {
    pub key: String,
    pub variation: Option<VariationIndex>,
    pub version: Option<u64>,
}

#[derive(Clone, Debug)]
pub(crate) struct CounterValue {
    pub count: u64,
    pub value: FlagValue,
    pub default: FlagValue,
}

/// The aggregated outcome of all feature evaluations since the last flush.
#[derive(Clone, Debug, Default)]
pub struct EventSummary {
    pub(crate) counters: HashMap<CounterKey, CounterValue>,
    pub(crate) start_date: i64,
    pub(crate) end_date: i64,
}

impl EventSummary {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Folds feature events into [`EventSummary`] counters. Owned exclusively by the event-pipeline
/// consumer thread; no locking.
#[derive(Default)]
pub struct EventSummarizer {
    summary: EventSummary,
}

impl EventSummarizer {
    pub fn new() -> EventSummarizer {
        EventSummarizer::default()
    }

    pub fn summarize(&mut self, event: &FeatureEvent) {
        let key = CounterKey {
            key: event.key.clone(),
            variation: event.variation,
            version: event.version,
        };
        self.summary
            .counters
            .entry(key)
            .and_modify(|counter| counter.count += 1)
            .or_insert_with(|| CounterValue {
                count: 1,
                value: event.value.clone(),
                default: event.default.clone(),
            });

        if self.summary.start_date == 0 || event.creation_date < self.summary.start_date {
            self.summary.start_date = event.creation_date;
        }
        if event.creation_date > self.summary.end_date {
            self.summary.end_date = event.creation_date;
        }
    }

    /// Hand out the accumulated summary and start a fresh one.
    pub fn snapshot(&mut self) -> EventSummary {
        std::mem::take(&mut self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::User;

    fn feature_event(key: &str, variation: Option<usize>, version: Option<u64>, when: i64) -> FeatureEvent {
        FeatureEvent {
            creation_date: when,
            key: key.to_owned(),
            user: User::with_key("u").build(),
            value: FlagValue::Bool(true),
            default: FlagValue::Bool(false),
            variation,
            version,
            prereq_of: None,
            reason: None,
            track_events: false,
            debug_events_until_date: None,
        }
    }

    #[test]
    fn identical_evaluations_fold_into_one_counter() {
        let mut summarizer = EventSummarizer::new();
        for _ in 0..5 {
            summarizer.summarize(&feature_event("f", Some(1), Some(3), 1000));
        }
        let summary = summarizer.snapshot();
        assert_eq!(summary.counters.len(), 1);
        let counter = summary
            .counters
            .get(&CounterKey {
                key: "f".into(),
                variation: Some(1),
                version: Some(3),
            })
            .unwrap();
        assert_eq!(counter.count, 5);
    }

    #[test]
    fn distinct_variations_and_versions_get_their_own_counters() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&feature_event("f", Some(0), Some(3), 1000));
        summarizer.summarize(&feature_event("f", Some(1), Some(3), 1000));
        summarizer.summarize(&feature_event("f", Some(1), Some(4), 1000));
        summarizer.summarize(&feature_event("g", Some(1), Some(4), 1000));
        let summary = summarizer.snapshot();
        assert_eq!(summary.counters.len(), 4);
    }

    #[test]
    fn dates_track_min_and_max_creation() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&feature_event("f", Some(0), Some(1), 2000));
        summarizer.summarize(&feature_event("f", Some(0), Some(1), 1000));
        summarizer.summarize(&feature_event("f", Some(0), Some(1), 3000));
        let summary = summarizer.snapshot();
        assert_eq!(summary.start_date, 1000);
        assert_eq!(summary.end_date, 3000);
    }

    #[test]
    fn snapshot_resets_the_summary() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&feature_event("f", Some(0), Some(1), 1000));
        assert!(!summarizer.snapshot().is_empty());
        assert!(summarizer.snapshot().is_empty());
    }

    #[test]
    fn unknown_flags_fold_under_a_versionless_counter() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&feature_event("missing", None, None, 1000));
        summarizer.summarize(&feature_event("missing", None, None, 1001));
        let summary = summarizer.snapshot();
        assert_eq!(summary.counters.len(), 1);
    }
}

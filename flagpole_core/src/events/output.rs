use std::collections::HashMap;

use serde::Serialize;

use crate::eval::Reason;
use crate::flag_value::FlagValue;
use crate::variation::VariationIndex;

use super::summarizer::EventSummary;
use super::user_filter::UserFilter;
use super::{EventsConfig, InputEvent};

/// An event in the wire form POSTed to the events endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputEvent {
    #[serde(rename_all = "camelCase")]
    Feature {
        creation_date: i64,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_key: Option<String>,
        value: FlagValue,
        default: FlagValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        variation: Option<VariationIndex>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prereq_of: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    /// The debug twin of a feature event; always carries full user detail so the dashboard can
    /// show exactly who evaluated what while the flag's debug window is open.
    #[serde(rename_all = "camelCase")]
    Debug {
        creation_date: i64,
        key: String,
        user: serde_json::Value,
        value: FlagValue,
        default: FlagValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        variation: Option<VariationIndex>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prereq_of: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },
    #[serde(rename_all = "camelCase")]
    Identify {
        creation_date: i64,
        key: String,
        user: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Index {
        creation_date: i64,
        user: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Custom {
        creation_date: i64,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metric_value: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Summary {
        start_date: i64,
        end_date: i64,
        features: HashMap<String, SummaryFlag>,
    },
}

#[derive(Debug, Serialize)]
pub struct SummaryFlag {
    pub default: FlagValue,
    pub counters: Vec<SummaryCounter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounter {
    pub value: FlagValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Set (true) instead of a version when the flag was unknown at evaluation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown: Option<bool>,
    pub count: u64,
}

/// Transforms buffered input events and a summary snapshot into the wire form, applying the
/// user privacy rules along the way.
pub struct EventOutputFormatter {
    filter: UserFilter,
    inline_users: bool,
}

impl EventOutputFormatter {
    pub fn new(config: &EventsConfig) -> EventOutputFormatter {
        EventOutputFormatter {
            filter: UserFilter::new(
                config.all_attributes_private,
                &config.private_attribute_names,
            ),
            inline_users: config.inline_users_in_events,
        }
    }

    pub fn make_output_events(
        &self,
        events: &[InputEvent],
        summary: EventSummary,
    ) -> Vec<OutputEvent> {
        let mut output: Vec<OutputEvent> = events.iter().map(|e| self.transform(e)).collect();
        if !summary.is_empty() {
            output.push(self.make_summary_event(summary));
        }
        output
    }

    fn transform(&self, event: &InputEvent) -> OutputEvent {
        match event {
            InputEvent::Feature(e) => {
                let is_debug = !e.track_events && e.debug_events_until_date.is_some();
                if is_debug {
                    OutputEvent::Debug {
                        creation_date: e.creation_date,
                        key: e.key.clone(),
                        user: self.filter.filter_user(&e.user),
                        value: e.value.clone(),
                        default: e.default.clone(),
                        variation: e.variation,
                        version: e.version,
                        prereq_of: e.prereq_of.clone(),
                        reason: e.reason.clone(),
                    }
                } else {
                    let (user, user_key) = self.user_or_key(&e.user);
                    OutputEvent::Feature {
                        creation_date: e.creation_date,
                        key: e.key.clone(),
                        user,
                        user_key,
                        value: e.value.clone(),
                        default: e.default.clone(),
                        variation: e.variation,
                        version: e.version,
                        prereq_of: e.prereq_of.clone(),
                        reason: e.reason.clone(),
                    }
                }
            }
            InputEvent::Identify(e) => OutputEvent::Identify {
                creation_date: e.creation_date,
                key: e.user.key().to_owned(),
                user: self.filter.filter_user(&e.user),
            },
            InputEvent::Index(e) => OutputEvent::Index {
                creation_date: e.creation_date,
                user: self.filter.filter_user(&e.user),
            },
            InputEvent::Custom(e) => {
                let (user, user_key) = self.user_or_key(&e.user);
                OutputEvent::Custom {
                    creation_date: e.creation_date,
                    key: e.key.clone(),
                    user,
                    user_key,
                    data: e.data.clone(),
                    metric_value: e.metric_value,
                }
            }
        }
    }

    fn user_or_key(&self, user: &crate::User) -> (Option<serde_json::Value>, Option<String>) {
        if self.inline_users {
            (Some(self.filter.filter_user(user)), None)
        } else {
            (None, Some(user.key().to_owned()))
        }
    }

    fn make_summary_event(&self, summary: EventSummary) -> OutputEvent {
        let mut features: HashMap<String, SummaryFlag> = HashMap::new();
        for (key, counter) in summary.counters {
            let flag = features.entry(key.key).or_insert_with(|| SummaryFlag {
                default: counter.default.clone(),
                counters: Vec::new(),
            });
            flag.counters.push(SummaryCounter {
                value: counter.value,
                version: key.version,
                unknown: if key.version.is_none() {
                    Some(true)
                } else {
                    None
                },
                count: counter.count,
            });
        }
        OutputEvent::Summary {
            start_date: summary.start_date,
            end_date: summary.end_date,
            features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CustomEvent, EventSummarizer, FeatureEvent, IdentifyEvent};
    use crate::user::User;
    use serde_json::json;

    fn formatter(inline: bool) -> EventOutputFormatter {
        EventOutputFormatter::new(&EventsConfig {
            inline_users_in_events: inline,
            ..EventsConfig::default()
        })
    }

    fn feature_event(track_events: bool, debug_until: Option<u64>) -> InputEvent {
        InputEvent::Feature(FeatureEvent {
            creation_date: 1000,
            key: "f".to_owned(),
            user: User::with_key("u").build(),
            value: FlagValue::Bool(true),
            default: FlagValue::Bool(false),
            variation: Some(1),
            version: Some(11),
            prereq_of: None,
            reason: None,
            track_events,
            debug_events_until_date: debug_until,
        })
    }

    #[test]
    fn tracked_feature_event_serializes_with_user_key() {
        let output = formatter(false).make_output_events(
            &[feature_event(true, None)],
            EventSummary::default(),
        );
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(
            json,
            json!([{
                "kind": "feature",
                "creationDate": 1000,
                "key": "f",
                "userKey": "u",
                "value": true,
                "default": false,
                "variation": 1,
                "version": 11
            }])
        );
    }

    #[test]
    fn inline_users_replace_the_user_key() {
        let output = formatter(true).make_output_events(
            &[feature_event(true, None)],
            EventSummary::default(),
        );
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json[0]["user"], json!({"key": "u"}));
        assert!(json[0].get("userKey").is_none());
    }

    #[test]
    fn untracked_event_in_a_debug_window_becomes_a_debug_event_with_full_user() {
        let output = formatter(false).make_output_events(
            &[feature_event(false, Some(2_000_000_000_000))],
            EventSummary::default(),
        );
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json[0]["kind"], "debug");
        assert_eq!(json[0]["user"], json!({"key": "u"}));
    }

    #[test]
    fn identify_and_custom_events_serialize() {
        let events = vec![
            InputEvent::Identify(IdentifyEvent {
                creation_date: 1,
                user: User::with_key("u").build(),
            }),
            InputEvent::Custom(CustomEvent {
                creation_date: 2,
                key: "click".to_owned(),
                user: User::with_key("u").build(),
                data: Some(json!({"page": "home"})),
                metric_value: Some(9.5),
            }),
        ];
        let json = serde_json::to_value(
            formatter(false).make_output_events(&events, EventSummary::default()),
        )
        .unwrap();
        assert_eq!(json[0]["kind"], "identify");
        assert_eq!(json[0]["key"], "u");
        assert_eq!(json[1]["kind"], "custom");
        assert_eq!(json[1]["userKey"], "u");
        assert_eq!(json[1]["data"]["page"], "home");
        assert_eq!(json[1]["metricValue"], 9.5);
    }

    #[test]
    fn summary_event_groups_counters_by_flag() {
        let mut summarizer = EventSummarizer::new();
        for _ in 0..3 {
            if let InputEvent::Feature(fe) = feature_event(false, None) {
                summarizer.summarize(&fe);
            }
        }
        let json = serde_json::to_value(
            formatter(false).make_output_events(&[], summarizer.snapshot()),
        )
        .unwrap();
        assert_eq!(
            json,
            json!([{
                "kind": "summary",
                "startDate": 1000,
                "endDate": 1000,
                "features": {
                    "f": {
                        "default": false,
                        "counters": [{"value": true, "version": 11, "count": 3}]
                    }
                }
            }])
        );
    }

    #[test]
    fn unknown_flag_counters_say_so_instead_of_a_version() {
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&FeatureEvent {
            creation_date: 7,
            key: "missing".to_owned(),
            user: User::with_key("u").build(),
            value: FlagValue::Str("fallback".into()),
            default: FlagValue::Str("fallback".into()),
            variation: None,
            version: None,
            prereq_of: None,
            reason: None,
            track_events: false,
            debug_events_until_date: None,
        });
        let json = serde_json::to_value(
            formatter(false).make_output_events(&[], summarizer.snapshot()),
        )
        .unwrap();
        assert_eq!(
            json[0]["features"]["missing"]["counters"],
            json!([{"value": "fallback", "unknown": true, "count": 1}])
        );
    }

    #[test]
    fn empty_summary_produces_no_summary_event() {
        let output = formatter(false).make_output_events(&[], EventSummary::default());
        assert!(output.is_empty());
    }
}

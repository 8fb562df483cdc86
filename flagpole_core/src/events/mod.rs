//! The analytics event pipeline: input events produced on the evaluation path, a summarizer that
//! folds them into counters, and a processor that batches and delivers them.

mod output;
mod processor;
mod summarizer;
mod user_filter;

pub use output::{EventOutputFormatter, OutputEvent, SummaryCounter, SummaryFlag};
pub use processor::{
    DefaultEventProcessor, EventProcessor, NullEventProcessor, MAX_FLUSH_WORKERS,
};
pub use summarizer::{EventSummarizer, EventSummary};
pub use user_filter::UserFilter;

use std::time::Duration;

use crate::eval::Reason;
use crate::flag_value::FlagValue;
use crate::user::User;
use crate::variation::VariationIndex;

/// Current time as epoch milliseconds, the unit all event timestamps use.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tuning knobs for the event pipeline.
#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub events_uri: String,
    pub capacity: usize,
    pub flush_interval: Duration,
    pub user_keys_capacity: usize,
    pub user_keys_flush_interval: Duration,
    pub inline_users_in_events: bool,
    pub all_attributes_private: bool,
    pub private_attribute_names: Vec<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            events_uri: "https://events.flagpole.dev".to_owned(),
            capacity: 10_000,
            flush_interval: Duration::from_secs(10),
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(300),
            inline_users_in_events: false,
            all_attributes_private: false,
            private_attribute_names: Vec::new(),
        }
    }
}

/// A flag evaluation, as recorded on the hot path.
///
/// Exactly one of these is produced per client evaluation call (plus one per prerequisite
/// evaluated along the way, with `prereq_of` set). When the flag was missing or the user was
/// invalid, `version` and `variation` are unset and `value` equals `default`.
#[derive(Clone, Debug)]
pub struct FeatureEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    pub value: FlagValue,
    pub default: FlagValue,
    pub variation: Option<VariationIndex>,
    pub version: Option<u64>,
    pub prereq_of: Option<String>,
    pub reason: Option<Reason>,
    /// Full-fidelity delivery requested by the flag (or the matched rule / fallthrough).
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

/// Records that a user was seen, carrying full user details.
#[derive(Clone, Debug)]
pub struct IdentifyEvent {
    pub creation_date: i64,
    pub user: User,
}

/// An application-defined event from `track`.
#[derive(Clone, Debug)]
pub struct CustomEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    pub data: Option<serde_json::Value>,
    pub metric_value: Option<f64>,
}

/// Synthesized once per not-recently-seen user per flush cycle, so full user details reach the
/// service without being repeated on every feature event.
#[derive(Clone, Debug)]
pub struct IndexEvent {
    pub creation_date: i64,
    pub user: User,
}

/// Everything a producer can put on the event queue.
#[derive(Clone, Debug)]
pub enum InputEvent {
    Feature(FeatureEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Index(IndexEvent),
}

impl InputEvent {
    pub fn user(&self) -> &User {
        match self {
            InputEvent::Feature(e) => &e.user,
            InputEvent::Identify(e) => &e.user,
            InputEvent::Custom(e) => &e.user,
            InputEvent::Index(e) => &e.user,
        }
    }

    pub fn creation_date(&self) -> i64 {
        match self {
            InputEvent::Feature(e) => e.creation_date,
            InputEvent::Identify(e) => e.creation_date,
            InputEvent::Custom(e) => e.creation_date,
            InputEvent::Index(e) => e.creation_date,
        }
    }
}

use serde::Deserialize;

use crate::eval::{self, Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::user::User;
use crate::variation::{VariationIndex, VariationOrRollout};

/// A feature flag as delivered by the service.
///
/// Flags are immutable once placed in the feature store; updates replace the whole value.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    pub(crate) on: bool,

    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    pub(crate) fallthrough: VariationOrRollout,
    pub(crate) off_variation: Option<VariationIndex>,
    pub(crate) variations: Vec<FlagValue>,

    #[serde(default)]
    pub(crate) salt: String,

    /// Whether this flag is exposed to client-side SDKs; used to filter `all_flags_state`.
    #[serde(default)]
    pub client_side: bool,

    /// Whether every evaluation of this flag produces a full-fidelity feature event.
    #[serde(default)]
    pub track_events: bool,
    /// Like rule-level `track_events`, but for evaluations that reach the fallthrough.
    #[serde(default)]
    pub track_events_fallthrough: bool,
    /// While this epoch-ms timestamp is in the future, evaluations additionally produce debug
    /// events with full user detail.
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
}

/// A prerequisite: the named flag must evaluate to exactly this variation.
#[derive(Clone, Debug, Deserialize)]
pub struct Prereq {
    pub(crate) key: String,
    pub(crate) variation: VariationIndex,
}

/// A direct assignment of individual user keys to one variation.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Target {
    pub(crate) values: Vec<String>,
    pub(crate) variation: VariationIndex,
}

impl Flag {
    pub(crate) fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<FlagValue> {
        Detail {
            value: self.variations.get(index).cloned(),
            variation_index: Some(index),
            reason,
        }
        .should_have_value(eval::Error::MalformedFlag)
    }

    pub(crate) fn off_value(&self, reason: Reason) -> Detail<FlagValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        user: &User,
    ) -> Result<VariationIndex, eval::Error> {
        vr.variation(&self.key, user, &self.salt)
            .ok_or(eval::Error::MalformedFlag)
    }

    /// True when the outcome described by `reason` is one the service wants full-fidelity events
    /// for: a rule with `track_events` set, or the fallthrough while `track_events_fallthrough`.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            Reason::Fallthrough => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }
}

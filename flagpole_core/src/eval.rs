use std::collections::HashSet;

use log::warn;
use serde::Serialize;

use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::store::Store;
use crate::user::User;
use crate::variation::VariationIndex;

/// The result of evaluating a prerequisite while evaluating its dependent flag.
///
/// The evaluator knows nothing about analytics; the caller turns these into feature events
/// (with `prereqOf` set to [`PrereqEvent::prereq_of`]).
#[derive(Clone, Debug)]
pub struct PrereqEvent {
    /// Key of the flag whose prerequisite list triggered this evaluation.
    pub prereq_of: String,
    /// The prerequisite flag that was evaluated.
    pub flag: Flag,
    /// The outcome of evaluating the prerequisite.
    pub detail: Detail<FlagValue>,
}

/// Evaluate a feature flag for the given user.
///
/// This is a pure rule interpretation: no I/O happens beyond reads from `store` (needed for
/// prerequisite flags and segments), and nothing is mutated. Prerequisite evaluations performed
/// along the way are reported in the returned vector, in evaluation order.
pub fn evaluate(
    store: &dyn Store,
    flag: &Flag,
    user: &User,
) -> (Detail<FlagValue>, Vec<PrereqEvent>) {
    let mut prereq_events = Vec::new();

    if user.key().is_empty() {
        warn!(target: "flagpole", "user has no key; cannot evaluate flag {}", flag.key);
        return (Detail::err(Error::UserNotSpecified), prereq_events);
    }

    let mut prereq_chain = HashSet::new();
    let detail = evaluate_internal(store, flag, user, &mut prereq_chain, &mut prereq_events);
    (detail, prereq_events)
}

fn evaluate_internal(
    store: &dyn Store,
    flag: &Flag,
    user: &User,
    prereq_chain: &mut HashSet<String>,
    prereq_events: &mut Vec<PrereqEvent>,
) -> Detail<FlagValue> {
    if !flag.on {
        return flag.off_value(Reason::Off);
    }

    prereq_chain.insert(flag.key.clone());

    for prereq in &flag.prerequisites {
        if prereq_chain.contains(&prereq.key) {
            warn!(
                target: "flagpole",
                "prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update",
                prereq.key
            );
            return Detail::err(Error::MalformedFlag);
        }

        let prereq_ok = match store.flag(&prereq.key) {
            Some(prereq_flag) => {
                let prereq_detail =
                    evaluate_internal(store, &prereq_flag, user, prereq_chain, prereq_events);

                // a prerequisite that itself failed to evaluate counts as a failed prerequisite
                let satisfied = prereq_flag.on
                    && !matches!(prereq_detail.reason, Reason::Error { .. })
                    && prereq_detail.variation_index == Some(prereq.variation);

                prereq_events.push(PrereqEvent {
                    prereq_of: flag.key.clone(),
                    flag: prereq_flag,
                    detail: prereq_detail,
                });

                satisfied
            }
            None => false,
        };

        if !prereq_ok {
            prereq_chain.remove(&flag.key);
            return flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.clone(),
            });
        }
    }

    prereq_chain.remove(&flag.key);

    for target in &flag.targets {
        if target.values.iter().any(|v| v == user.key()) {
            return flag.variation(target.variation, Reason::TargetMatch);
        }
    }

    for (rule_index, rule) in flag.rules.iter().enumerate() {
        if rule.matches(user, store) {
            return match flag.resolve_variation_or_rollout(&rule.variation_or_rollout, user) {
                Ok(index) => flag.variation(
                    index,
                    Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                    },
                ),
                Err(e) => Detail::err(e),
            };
        }
    }

    match flag.resolve_variation_or_rollout(&flag.fallthrough, user) {
        Ok(index) => flag.variation(index, Reason::Fallthrough),
        Err(e) => Detail::err(e),
    }
}

/// Combines the result of a flag evaluation with an explanation of how it was calculated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The result of the flag evaluation. None if no appropriate fallback value was configured
    /// (the client facade substitutes the application default in that case).
    pub value: Option<T>,

    /// The index of the returned value within the flag's list of variations. None when the
    /// application default was returned, which is different from an index of 0.
    pub variation_index: Option<VariationIndex>,

    /// The main factor that influenced the returned value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// A detail with no value and no variation index, only a reason.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// An error detail with no value. The client facade fills in the application default.
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// An error detail that carries the application default as its value.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    /// Apply `f` to the value, keeping index and reason.
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Overwrite the reason with the given error if this detail has no value.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Substitute `default` if this detail has no value, clearing the variation index.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }
}

/// Why an evaluation produced the value it did.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag was off, so its configured off variation was returned.
    Off,
    /// The user's key was specifically targeted.
    TargetMatch,
    /// The user matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the matched rule.
        rule_index: usize,
        /// The matched rule's id, when it has one.
        #[serde(skip_serializing_if = "String::is_empty")]
        rule_id: String,
    },
    /// A prerequisite flag was off or did not return the required variation, so this flag
    /// behaved as if it were off.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// The key of the prerequisite that failed.
        prerequisite_key: String,
    },
    /// The flag was on but the user matched no targets and no rules.
    Fallthrough,
    /// The flag could not be evaluated; the returned value is the application default.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

/// What prevented a flag from being evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// The client was not yet initialized and the feature store held no data.
    ClientNotReady,
    /// No flag with the requested key exists.
    FlagNotFound,
    /// The user had no key.
    UserNotSpecified,
    /// The flag data was internally inconsistent, e.g. a selector referenced a nonexistent
    /// variation.
    MalformedFlag,
    /// The value did not have the requested type, e.g. `bool_variation` on a string flag.
    WrongType,
    /// An unexpected error stopped evaluation; check the log for details.
    Exception,
}

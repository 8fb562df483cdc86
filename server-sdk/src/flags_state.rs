use std::collections::HashMap;

use serde::Serialize;

use flagpole_core::eval::Reason;
use flagpole_core::{FlagValue, VariationIndex};

/// Options for [`crate::Client::all_flags_state`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagsStateOptions {
    /// Only include flags marked for client-side use.
    pub client_side_only: bool,
    /// Include evaluation reasons in the metadata.
    pub with_reasons: bool,
    /// Omit versions and reasons for flags that do not require full event fidelity; reduces the
    /// payload when the state is bootstrapped to a front end.
    pub details_only_for_tracked_flags: bool,
}

/// A snapshot of every flag's value for one user, in the JSON shape client-side SDKs bootstrap
/// from: the values keyed by flag key, plus a `$flagsState` metadata map and a `$valid` marker.
#[derive(Clone, Debug, Serialize)]
pub struct AllFlagsState {
    #[serde(flatten)]
    values: HashMap<String, FlagValue>,
    #[serde(rename = "$flagsState")]
    metadata: HashMap<String, FlagState>,
    #[serde(rename = "$valid")]
    valid: bool,
}

/// Per-flag metadata carried alongside the evaluated values.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    /// Index of the variation served to this user, when one was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    /// The flag's version; omitted when details were filtered out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Why this value was served; included on request or for experiment flags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// Whether evaluations of this flag should be reported in full.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    /// End of the flag's debug window, when one is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

impl AllFlagsState {
    pub(crate) fn new(valid: bool) -> AllFlagsState {
        AllFlagsState {
            values: HashMap::new(),
            metadata: HashMap::new(),
            valid,
        }
    }

    pub(crate) fn add(&mut self, key: &str, value: Option<FlagValue>, state: FlagState) {
        if let Some(value) = value {
            self.values.insert(key.to_owned(), value);
        }
        self.metadata.insert(key.to_owned(), state);
    }

    /// False when the snapshot was taken before the client had any flag data; the contents are
    /// not meaningful in that case.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag, if it produced one.
    pub fn value(&self, key: &str) -> Option<&FlagValue> {
        self.values.get(key)
    }

    /// The metadata recorded for one flag.
    pub fn state(&self, key: &str) -> Option<&FlagState> {
        self.metadata.get(key)
    }

    /// Number of flags captured in the snapshot.
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// True when no flags were captured.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }
}

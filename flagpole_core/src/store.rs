//! The feature store: a concurrent repository of flags and segments kept fresh by a data source
//! and read by evaluations. [`InMemoryFeatureStore`] is the default backend; external backends
//! (Redis and friends) implement the same contract against their remote store.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::flag::Flag;
use crate::segment::Segment;

/// Read access to flag data, which is all the evaluator needs.
pub trait Store: Send + Sync {
    fn flag(&self, key: &str) -> Option<Flag>;

    fn segment(&self, key: &str) -> Option<Segment>;
}

/// The full feature-store contract used by data sources and the client facade.
///
/// Versioning rules: an upsert only succeeds if the store has no item for that key or the stored
/// version is lower; deletes are versioned tombstones so a late-arriving older update cannot
/// resurrect a deleted item. `init` atomically replaces the entire dataset.
pub trait FeatureStore: Store {
    /// Atomically replace the whole dataset. Readers see either the old or the new snapshot,
    /// never a mix. Marks the store initialized.
    fn init(&self, data: AllData);

    /// All non-deleted flags, for `all_flags_state`.
    fn all_flags(&self) -> HashMap<String, Flag>;

    /// Versioned insert/update. Returns false if the stored version won.
    fn upsert_flag(&self, flag: Flag) -> bool;

    fn upsert_segment(&self, segment: Segment) -> bool;

    /// Versioned delete (a tombstone upsert). Returns false if the stored version won.
    fn delete_flag(&self, key: &str, version: u64) -> bool;

    fn delete_segment(&self, key: &str, version: u64) -> bool;

    /// True once `init` has completed at least once.
    fn initialized(&self) -> bool;
}

/// A full dataset as delivered by `/sdk/latest-all` or a stream `put` event.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

// Lets callers that hold the full store contract hand the evaluator its read-only view.
impl Store for std::sync::Arc<dyn FeatureStore> {
    fn flag(&self, key: &str) -> Option<Flag> {
        (**self).flag(key)
    }

    fn segment(&self, key: &str) -> Option<Segment> {
        (**self).segment(key)
    }
}

trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for Flag {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Segment {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Either a live item or the versioned tombstone left behind by a delete.
#[derive(Clone, Debug)]
enum Slot<T> {
    Present(T),
    Tombstone(u64),
}

impl<T: Versioned> Slot<T> {
    fn version(&self) -> u64 {
        match self {
            Slot::Present(item) => item.version(),
            Slot::Tombstone(version) => *version,
        }
    }

    fn item(&self) -> Option<&T> {
        match self {
            Slot::Present(item) => Some(item),
            Slot::Tombstone(_) => None,
        }
    }
}

fn upsert<T: Versioned>(map: &mut HashMap<String, Slot<T>>, key: &str, candidate: Slot<T>) -> bool {
    match map.get(key) {
        Some(existing) if existing.version() >= candidate.version() => false,
        _ => {
            map.insert(key.to_owned(), candidate);
            true
        }
    }
}

#[derive(Default)]
struct StoreData {
    flags: HashMap<String, Slot<Flag>>,
    segments: HashMap<String, Slot<Segment>>,
    initialized: bool,
}

/// The default in-memory feature store: one snapshot behind a reader-writer lock.
///
/// Items are immutable once stored; every update replaces the slot. Readers get owned clones, so
/// no reference ever outlives the lock.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    data: RwLock<StoreData>,
}

impl InMemoryFeatureStore {
    pub fn new() -> InMemoryFeatureStore {
        InMemoryFeatureStore::default()
    }
}

impl Store for InMemoryFeatureStore {
    fn flag(&self, key: &str) -> Option<Flag> {
        let data = self
            .data
            .read()
            .expect("thread holding feature store lock should not panic");
        data.flags.get(key).and_then(Slot::item).cloned()
    }

    fn segment(&self, key: &str) -> Option<Segment> {
        let data = self
            .data
            .read()
            .expect("thread holding feature store lock should not panic");
        data.segments.get(key).and_then(Slot::item).cloned()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn init(&self, new_data: AllData) {
        let mut data = self
            .data
            .write()
            .expect("thread holding feature store lock should not panic");
        data.flags = new_data
            .flags
            .into_iter()
            .map(|(k, f)| (k, Slot::Present(f)))
            .collect();
        data.segments = new_data
            .segments
            .into_iter()
            .map(|(k, s)| (k, Slot::Present(s)))
            .collect();
        data.initialized = true;
    }

    fn all_flags(&self) -> HashMap<String, Flag> {
        let data = self
            .data
            .read()
            .expect("thread holding feature store lock should not panic");
        data.flags
            .iter()
            .filter_map(|(k, slot)| slot.item().map(|f| (k.clone(), f.clone())))
            .collect()
    }

    fn upsert_flag(&self, flag: Flag) -> bool {
        let mut data = self
            .data
            .write()
            .expect("thread holding feature store lock should not panic");
        let key = flag.key.clone();
        upsert(&mut data.flags, &key, Slot::Present(flag))
    }

    fn upsert_segment(&self, segment: Segment) -> bool {
        let mut data = self
            .data
            .write()
            .expect("thread holding feature store lock should not panic");
        let key = segment.key.clone();
        upsert(&mut data.segments, &key, Slot::Present(segment))
    }

    fn delete_flag(&self, key: &str, version: u64) -> bool {
        let mut data = self
            .data
            .write()
            .expect("thread holding feature store lock should not panic");
        upsert(&mut data.flags, key, Slot::Tombstone(version))
    }

    fn delete_segment(&self, key: &str, version: u64) -> bool {
        let mut data = self
            .data
            .write()
            .expect("thread holding feature store lock should not panic");
        upsert(&mut data.segments, key, Slot::Tombstone(version))
    }

    fn initialized(&self) -> bool {
        self.data
            .read()
            .expect("thread holding feature store lock should not panic")
            .initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn flag(key: &str, version: u64) -> Flag {
        serde_json::from_str(&format!(
            r#"{{
                "key": "{}",
                "version": {},
                "on": true,
                "fallthrough": {{"variation": 0}},
                "offVariation": 0,
                "variations": [true],
                "salt": "salty"
            }}"#,
            key, version
        ))
        .unwrap()
    }

    fn init_with(store: &InMemoryFeatureStore, flags: Vec<Flag>) {
        let flags = flags.into_iter().map(|f| (f.key.clone(), f)).collect();
        store.init(AllData {
            flags,
            segments: HashMap::new(),
        });
    }

    #[test]
    fn not_initialized_until_first_init() {
        let store = InMemoryFeatureStore::new();
        assert!(!store.initialized());
        init_with(&store, vec![]);
        assert!(store.initialized());
    }

    #[test]
    fn upsert_respects_versions() {
        let store = InMemoryFeatureStore::new();
        init_with(&store, vec![flag("f", 5)]);

        assert!(!store.upsert_flag(flag("f", 4)));
        assert_eq!(store.flag("f").unwrap().version, 5);

        assert!(!store.upsert_flag(flag("f", 5)));
        assert_eq!(store.flag("f").unwrap().version, 5);

        assert!(store.upsert_flag(flag("f", 6)));
        assert_eq!(store.flag("f").unwrap().version, 6);
    }

    #[test]
    fn final_state_depends_only_on_highest_version() {
        let store = InMemoryFeatureStore::new();
        init_with(&store, vec![]);
        for version in [3, 1, 7, 5, 2] {
            store.upsert_flag(flag("f", version));
        }
        assert_eq!(store.flag("f").unwrap().version, 7);
    }

    #[test]
    fn delete_is_a_versioned_tombstone() {
        let store = InMemoryFeatureStore::new();
        init_with(&store, vec![flag("f", 5)]);

        assert!(!store.delete_flag("f", 4));
        assert!(store.flag("f").is_some());

        assert!(store.delete_flag("f", 6));
        assert!(store.flag("f").is_none());
        assert!(store.all_flags().is_empty());

        // a stale update cannot resurrect the deleted flag
        assert!(!store.upsert_flag(flag("f", 6)));
        assert!(store.flag("f").is_none());

        assert!(store.upsert_flag(flag("f", 7)));
        assert_eq!(store.flag("f").unwrap().version, 7);
    }

    #[test]
    fn init_replaces_the_whole_dataset() {
        let store = InMemoryFeatureStore::new();
        init_with(&store, vec![flag("old", 1)]);
        init_with(&store, vec![flag("new", 1)]);
        assert!(store.flag("old").is_none());
        assert!(store.flag("new").is_some());
    }

    #[test]
    fn deleting_an_unknown_key_leaves_a_tombstone() {
        let store = InMemoryFeatureStore::new();
        init_with(&store, vec![]);
        assert!(store.delete_flag("f", 10));
        assert!(!store.upsert_flag(flag("f", 9)));
        assert!(store.flag("f").is_none());
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let store = Arc::new(InMemoryFeatureStore::new());
        init_with(&store, vec![flag("f", 1)]);

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for version in 2..100u64 {
                    store.upsert_flag(flag("f", version));
                }
            })
        };

        for _ in 0..100 {
            if let Some(f) = store.flag("f") {
                assert!(f.version >= 1);
            }
        }

        writer.join().unwrap();
        assert_eq!(store.flag("f").unwrap().version, 99);
    }
}

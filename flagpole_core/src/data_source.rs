//! Data sources keep the feature store synchronized with the service: a streaming variant (the
//! default), a polling fallback, and a null variant for offline and daemon modes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::{thread_rng, Rng};
use reqwest::header;
use serde::Deserialize;

use crate::latch::Latch;
use crate::requestor::Requestor;
use crate::store::{AllData, FeatureStore};
use crate::{Error, Flag, Result, Segment};

/// One-shot readiness signal returned by [`DataSource::start`]. It fires when the store first
/// becomes initialized, or when the data source gives up permanently.
pub type ReadySignal = Latch;

/// The polling interval floor; configured values below this are clamped up.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

const STREAM_PATH: &str = "/all";
const STREAM_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const STREAM_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A background process that keeps the feature store fresh.
///
/// `start` is idempotent and hands back the same readiness signal each time. `stop` interrupts
/// any sleep or open connection and joins the background thread.
pub trait DataSource: Send {
    fn start(&mut self) -> ReadySignal;

    fn stop(&mut self);

    /// True once the store has received a complete dataset from this source.
    fn initialized(&self) -> bool;
}

/// Fetches the full dataset on a fixed interval and atomically replaces the store contents.
pub struct PollingDataSource {
    http: reqwest::Client,
    base_uri: String,
    poll_interval: Duration,
    store: Arc<dyn FeatureStore>,
    inited: Arc<AtomicBool>,
    ready: ReadySignal,
    worker: Option<(std::sync::mpsc::SyncSender<()>, std::thread::JoinHandle<()>)>,
}

impl PollingDataSource {
    pub fn new(
        http: reqwest::Client,
        base_uri: impl Into<String>,
        poll_interval: Duration,
        store: Arc<dyn FeatureStore>,
    ) -> Self {
        Self {
            http,
            base_uri: base_uri.into(),
            poll_interval,
            store,
            inited: Arc::new(AtomicBool::new(false)),
            ready: ReadySignal::new(),
            worker: None,
        }
    }
}

impl DataSource for PollingDataSource {
    fn start(&mut self) -> ReadySignal {
        if self.worker.is_some() {
            return self.ready.clone();
        }

        let interval = if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                target: "flagpole",
                "poll interval of {:?} is below the minimum; clamping to {:?}",
                self.poll_interval, MIN_POLL_INTERVAL
            );
            MIN_POLL_INTERVAL
        } else {
            self.poll_interval
        };

        // Buffer size of 1 is enough: we only ever send one stop command, and a full buffer
        // means another thread already sent it.
        let (stop_tx, stop_rx) = std::sync::mpsc::sync_channel::<()>(1);

        let http = self.http.clone();
        let base_uri = self.base_uri.clone();
        let store = Arc::clone(&self.store);
        let inited = Arc::clone(&self.inited);
        let ready = self.ready.clone();

        let handle = std::thread::Builder::new()
            .name("flagpole-poller".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(target: "flagpole", "failed to start polling runtime: {}", err);
                        ready.set();
                        return;
                    }
                };

                let mut requestor = Requestor::new(http, base_uri);

                loop {
                    debug!(target: "flagpole", "polling for flag data");
                    match runtime.block_on(requestor.get_all()) {
                        Ok(all_data) => {
                            store.init(all_data);
                            inited.store(true, Ordering::SeqCst);
                            ready.set();
                        }
                        Err(err) if err.is_unrecoverable() => {
                            error!(target: "flagpole", "polling stopped permanently: {}", err);
                            ready.set();
                            return;
                        }
                        Err(err) => {
                            warn!(target: "flagpole", "polling for flag data failed: {}", err);
                        }
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Loop back to fetch fresh data.
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            debug!(target: "flagpole", "polling thread received stop command");
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn polling thread");

        self.worker = Some((stop_tx, handle));
        self.ready.clone()
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.worker.take() {
            let _ = stop_tx.try_send(());
            let _ = handle.join();
        }
    }

    fn initialized(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }
}

/// Holds an SSE connection to the service and applies `put`/`patch`/`delete` events to the
/// store, reconnecting with exponential backoff.
pub struct StreamingDataSource {
    http: reqwest::Client,
    stream_uri: String,
    store: Arc<dyn FeatureStore>,
    inited: Arc<AtomicBool>,
    ready: ReadySignal,
    worker: Option<(tokio::sync::mpsc::Sender<()>, std::thread::JoinHandle<()>)>,
}

impl StreamingDataSource {
    pub fn new(
        http: reqwest::Client,
        stream_uri: impl AsRef<str>,
        store: Arc<dyn FeatureStore>,
    ) -> Self {
        Self {
            http,
            stream_uri: crate::util::strip_trailing_slash(stream_uri.as_ref()),
            store,
            inited: Arc::new(AtomicBool::new(false)),
            ready: ReadySignal::new(),
            worker: None,
        }
    }
}

impl DataSource for StreamingDataSource {
    fn start(&mut self) -> ReadySignal {
        if self.worker.is_some() {
            return self.ready.clone();
        }

        let (stop_tx, stop_rx) = tokio::sync::mpsc::channel::<()>(1);

        let http = self.http.clone();
        let uri = self.stream_uri.clone();
        let store = Arc::clone(&self.store);
        let inited = Arc::clone(&self.inited);
        let ready = self.ready.clone();

        let handle = std::thread::Builder::new()
            .name("flagpole-stream".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(target: "flagpole", "failed to start streaming runtime: {}", err);
                        ready.set();
                        return;
                    }
                };

                runtime.block_on(run_stream(http, uri, store, inited, ready, stop_rx));
            })
            .expect("failed to spawn streaming thread");

        self.worker = Some((stop_tx, handle));
        self.ready.clone()
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.worker.take() {
            let _ = stop_tx.try_send(());
            let _ = handle.join();
        }
    }

    fn initialized(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }
}

async fn run_stream(
    http: reqwest::Client,
    uri: String,
    store: Arc<dyn FeatureStore>,
    inited: Arc<AtomicBool>,
    ready: ReadySignal,
    mut stop_rx: tokio::sync::mpsc::Receiver<()>,
) {
    let mut consecutive_failures: u32 = 0;
    let mut last_event_id: Option<String> = None;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!(target: "flagpole", "streaming thread received stop command");
                return;
            }
            result = connect_and_process(&http, &uri, &store, &inited, &ready, &mut last_event_id) => {
                match result {
                    Ok(()) => {
                        // server closed a healthy connection; reconnect promptly
                        debug!(target: "flagpole", "stream ended normally");
                        consecutive_failures = 0;
                    }
                    Err(err) if err.is_unrecoverable() => {
                        error!(target: "flagpole", "streaming stopped permanently: {}", err);
                        ready.set();
                        return;
                    }
                    Err(err) => {
                        warn!(target: "flagpole", "stream connection error: {}", err);
                        consecutive_failures = consecutive_failures.saturating_add(1);
                    }
                }
            }
        }

        let delay = backoff_with_jitter(consecutive_failures);
        debug!(target: "flagpole", "reconnecting stream in {:?}", delay);
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!(target: "flagpole", "streaming thread received stop command during backoff");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_and_process(
    http: &reqwest::Client,
    uri: &str,
    store: &Arc<dyn FeatureStore>,
    inited: &AtomicBool,
    ready: &ReadySignal,
    last_event_id: &mut Option<String>,
) -> Result<()> {
    let url = format!("{}{}", uri, STREAM_PATH);

    let mut request = http
        .get(&url)
        .header(header::ACCEPT, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(id) = last_event_id.as_deref() {
        request = request.header("Last-Event-ID", id);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::for_status(status.as_u16()));
    }

    info!(target: "flagpole", "connected to event stream");

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if !event.id.is_empty() {
                    *last_event_id = Some(event.id.clone());
                }
                if let Err(err) = apply_event(store.as_ref(), inited, ready, &event.event, &event.data)
                {
                    warn!(target: "flagpole", "ignoring malformed stream event: {}", err);
                }
            }
            Err(err) => return Err(Error::MalformedResponse(err.to_string())),
        }
    }

    Ok(())
}

#[derive(Deserialize)]
struct PutData {
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

enum ItemPath<'a> {
    Flag(&'a str),
    Segment(&'a str),
}

fn parse_item_path(path: &str) -> Option<ItemPath<'_>> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some(ItemPath::Flag(key))
    } else {
        path.strip_prefix("/segments/").map(ItemPath::Segment)
    }
}

fn apply_event(
    store: &dyn FeatureStore,
    inited: &AtomicBool,
    ready: &ReadySignal,
    kind: &str,
    data: &str,
) -> Result<()> {
    let malformed = |e: serde_json::Error| Error::MalformedResponse(e.to_string());

    match kind {
        "put" => {
            let put: PutData = serde_json::from_str(data).map_err(malformed)?;
            let count = put.data.flags.len();
            store.init(put.data);
            inited.store(true, Ordering::SeqCst);
            ready.set();
            debug!(target: "flagpole", "stream put replaced dataset ({} flags)", count);
        }
        "patch" => {
            let patch: PatchData = serde_json::from_str(data).map_err(malformed)?;
            match parse_item_path(&patch.path) {
                Some(ItemPath::Flag(key)) => {
                    let flag: Flag = serde_json::from_value(patch.data).map_err(malformed)?;
                    if !store.upsert_flag(flag) {
                        debug!(target: "flagpole", "discarded stale patch for flag {}", key);
                    }
                }
                Some(ItemPath::Segment(key)) => {
                    let segment: Segment = serde_json::from_value(patch.data).map_err(malformed)?;
                    if !store.upsert_segment(segment) {
                        debug!(target: "flagpole", "discarded stale patch for segment {}", key);
                    }
                }
                None => {
                    warn!(target: "flagpole", "patch event for unrecognized path {}", patch.path);
                }
            }
        }
        "delete" => {
            let delete: DeleteData = serde_json::from_str(data).map_err(malformed)?;
            match parse_item_path(&delete.path) {
                Some(ItemPath::Flag(key)) => {
                    store.delete_flag(key, delete.version);
                }
                Some(ItemPath::Segment(key)) => {
                    store.delete_segment(key, delete.version);
                }
                None => {
                    warn!(target: "flagpole", "delete event for unrecognized path {}", delete.path);
                }
            }
        }
        other => {
            debug!(target: "flagpole", "ignoring stream event of kind {:?}", other);
        }
    }

    Ok(())
}

fn backoff_with_jitter(consecutive_failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_failures.min(10));
    let delay = STREAM_INITIAL_RECONNECT_DELAY
        .saturating_mul(factor)
        .min(STREAM_MAX_RECONNECT_DELAY);
    let jitter = delay / 2;
    Duration::saturating_sub(delay, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// The data source used in offline and daemon modes: performs no network activity and reports
/// ready immediately, leaving the store to be populated externally (or not at all).
pub struct NullDataSource {
    ready: ReadySignal,
}

impl NullDataSource {
    pub fn new() -> Self {
        Self {
            ready: ReadySignal::new(),
        }
    }
}

impl Default for NullDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for NullDataSource {
    fn start(&mut self) -> ReadySignal {
        info!(target: "flagpole", "data source is disabled; flags will be served from the feature store as-is");
        self.ready.set();
        self.ready.clone()
    }

    fn stop(&mut self) {}

    fn initialized(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryFeatureStore, Store};

    fn flag_json(key: &str, version: u64, on: bool) -> String {
        format!(
            r#"{{
                "key": "{}", "version": {}, "on": {},
                "fallthrough": {{"variation": 0}}, "offVariation": 0,
                "variations": [true, false], "salt": "s"
            }}"#,
            key, version, on
        )
    }

    fn ready_parts() -> (AtomicBool, ReadySignal) {
        (AtomicBool::new(false), ReadySignal::new())
    }

    #[test]
    fn null_data_source_is_ready_immediately() {
        let mut source = NullDataSource::new();
        let ready = source.start();
        assert!(ready.wait_timeout(Duration::from_millis(0)));
        assert!(source.initialized());
        source.stop();
    }

    #[test]
    fn put_event_initializes_the_store() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();

        let data = format!(
            r#"{{"path": "/", "data": {{"flags": {{"f": {}}}, "segments": {{}}}}}}"#,
            flag_json("f", 1, true)
        );
        apply_event(&store, &inited, &ready, "put", &data).unwrap();

        assert!(store.initialized());
        assert!(inited.load(Ordering::SeqCst));
        assert!(ready.is_set());
        assert_eq!(store.flag("f").unwrap().version, 1);
    }

    #[test]
    fn patch_event_upserts_with_version_check() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();
        store.init(AllData::default());

        let patch = format!(
            r#"{{"path": "/flags/f", "data": {}}}"#,
            flag_json("f", 5, true)
        );
        apply_event(&store, &inited, &ready, "patch", &patch).unwrap();
        assert_eq!(store.flag("f").unwrap().version, 5);

        // a stale patch loses against the stored version
        let stale = format!(
            r#"{{"path": "/flags/f", "data": {}}}"#,
            flag_json("f", 4, false)
        );
        apply_event(&store, &inited, &ready, "patch", &stale).unwrap();
        assert_eq!(store.flag("f").unwrap().version, 5);

        // patches alone never mark the source initialized
        assert!(!inited.load(Ordering::SeqCst));
    }

    #[test]
    fn patch_event_handles_segments() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();

        let patch = r#"{"path": "/segments/s", "data": {"key": "s", "version": 2, "included": ["u"], "excluded": [], "rules": [], "salt": "x"}}"#;
        apply_event(&store, &inited, &ready, "patch", patch).unwrap();
        assert_eq!(store.segment("s").unwrap().version, 2);
    }

    #[test]
    fn delete_event_writes_a_tombstone() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();

        let patch = format!(
            r#"{{"path": "/flags/f", "data": {}}}"#,
            flag_json("f", 5, true)
        );
        apply_event(&store, &inited, &ready, "patch", &patch).unwrap();

        let delete = r#"{"path": "/flags/f", "version": 6}"#;
        apply_event(&store, &inited, &ready, "delete", delete).unwrap();
        assert!(store.flag("f").is_none());

        // the tombstone's version keeps beating stale updates
        let stale = format!(
            r#"{{"path": "/flags/f", "data": {}}}"#,
            flag_json("f", 6, true)
        );
        apply_event(&store, &inited, &ready, "patch", &stale).unwrap();
        assert!(store.flag("f").is_none());
    }

    #[test]
    fn malformed_event_data_is_an_error_not_a_panic() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();
        let result = apply_event(&store, &inited, &ready, "put", "not json");
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
        assert!(!store.initialized());
    }

    #[test]
    fn unknown_event_kinds_are_ignored() {
        let store = InMemoryFeatureStore::new();
        let (inited, ready) = ready_parts();
        apply_event(&store, &inited, &ready, "heartbeat", "{}").unwrap();
        assert!(!ready.is_set());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        assert!(backoff_with_jitter(0) <= STREAM_INITIAL_RECONNECT_DELAY);
        for failures in 0..20 {
            let delay = backoff_with_jitter(failures);
            assert!(delay <= STREAM_MAX_RECONNECT_DELAY);
        }
        // at high failure counts the jittered delay still lands in the upper half of the cap
        assert!(backoff_with_jitter(10) >= STREAM_MAX_RECONNECT_DELAY / 2);
    }

    #[test]
    fn item_paths_parse() {
        assert!(matches!(
            parse_item_path("/flags/my-flag"),
            Some(ItemPath::Flag("my-flag"))
        ));
        assert!(matches!(
            parse_item_path("/segments/my-segment"),
            Some(ItemPath::Segment("my-segment"))
        ));
        assert!(parse_item_path("/other/x").is_none());
    }
}

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use lru::LruCache;
use reqwest::header;

use crate::error::http_status_is_unrecoverable;
use crate::latch::Latch;

use super::output::EventOutputFormatter;
use super::summarizer::{EventSummarizer, EventSummary};
use super::{now_millis, EventsConfig, IndexEvent, InputEvent};

/// Size of the pool of threads that POST flush payloads.
pub const MAX_FLUSH_WORKERS: usize = 5;

const BULK_PATH: &str = "/bulk";
const POST_RETRY_DELAY: Duration = Duration::from_secs(1);
const WORKER_QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What producers put on the pipeline's queue. Everything the pipeline does happens on its
/// single consumer thread, driven by these messages.
enum EventMessage {
    Event(InputEvent),
    Flush,
    FlushUsers,
    #[allow(dead_code)] // used by tests to wait for the consumer to catch up
    Sync(Latch),
    Stop(Latch),
}

/// The event pipeline as the client facade sees it. All methods are non-blocking except
/// `close`, and none of them ever surfaces an error to the application.
pub trait EventProcessor: Send + Sync {
    fn send(&self, event: InputEvent);

    /// Ask for a flush soon; does not wait for delivery.
    fn flush(&self);

    /// Final flush, then orderly shutdown. Idempotent.
    fn close(&self);
}

/// Stands in for the pipeline when events are disabled (offline mode or `send_events` off).
pub struct NullEventProcessor;

impl EventProcessor for NullEventProcessor {
    fn send(&self, _event: InputEvent) {}
    fn flush(&self) {}
    fn close(&self) {}
}

/// The real pipeline: a bounded queue drained by one consumer thread, which summarizes and
/// buffers events and hands flush payloads to a bounded pool of delivery workers.
pub struct DefaultEventProcessor {
    sender: SyncSender<EventMessage>,
    capacity_warned: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    tickers: Mutex<Vec<Ticker>>,
    closed: AtomicBool,
}

impl DefaultEventProcessor {
    pub fn new(config: EventsConfig, http: reqwest::Client) -> DefaultEventProcessor {
        let (sender, receiver) = mpsc::sync_channel::<EventMessage>(config.capacity);
        let capacity_warned = Arc::new(AtomicBool::new(false));
        let disabled = Arc::new(AtomicBool::new(false));
        let last_known_server_time = Arc::new(AtomicI64::new(0));

        let consumer = {
            let config = config.clone();
            let disabled = Arc::clone(&disabled);
            std::thread::Builder::new()
                .name("flagpole-events".to_owned())
                .spawn(move || {
                    let pool =
                        FlushWorkerPool::new(&config, http, disabled.clone(), last_known_server_time.clone());
                    let mut consumer = Consumer::new(config, pool, disabled, last_known_server_time);
                    consumer.run(receiver);
                })
                .expect("failed to spawn event consumer thread")
        };

        let tickers = vec![
            Ticker::start(config.flush_interval, {
                let sender = sender.clone();
                let warned = Arc::clone(&capacity_warned);
                move || send_message(&sender, &warned, EventMessage::Flush)
            }),
            Ticker::start(config.user_keys_flush_interval, {
                let sender = sender.clone();
                let warned = Arc::clone(&capacity_warned);
                move || send_message(&sender, &warned, EventMessage::FlushUsers)
            }),
        ];

        DefaultEventProcessor {
            sender,
            capacity_warned,
            consumer: Mutex::new(Some(consumer)),
            tickers: Mutex::new(tickers),
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    fn sync(&self) {
        let latch = Latch::new();
        let _ = self.sender.send(EventMessage::Sync(latch.clone()));
        latch.wait_timeout(Duration::from_secs(5));
    }
}

impl EventProcessor for DefaultEventProcessor {
    fn send(&self, event: InputEvent) {
        send_message(&self.sender, &self.capacity_warned, EventMessage::Event(event));
    }

    fn flush(&self) {
        send_message(&self.sender, &self.capacity_warned, EventMessage::Flush);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for ticker in self
            .tickers
            .lock()
            .expect("thread holding ticker lock should not panic")
            .drain(..)
        {
            ticker.stop();
        }

        // shutdown messages use a blocking send: the consumer is draining the queue, so this is
        // bounded, and the final flush must not be dropped under load
        let stopped = Latch::new();
        let _ = self.sender.send(EventMessage::Flush);
        let _ = self.sender.send(EventMessage::Stop(stopped.clone()));
        if !stopped.wait_timeout(CLOSE_TIMEOUT) {
            warn!(target: "flagpole", "event pipeline did not stop within {:?}", CLOSE_TIMEOUT);
        }

        if let Some(handle) = self
            .consumer
            .lock()
            .expect("thread holding consumer lock should not panic")
            .take()
        {
            let _ = handle.join();
        }
    }
}

/// Producers never block: a full queue drops the message, logging a single warning until an
/// enqueue succeeds again.
fn send_message(sender: &SyncSender<EventMessage>, warned: &AtomicBool, message: EventMessage) {
    match sender.try_send(message) {
        Ok(()) => {
            warned.store(false, Ordering::SeqCst);
        }
        Err(TrySendError::Full(_)) => {
            if !warned.swap(true, Ordering::SeqCst) {
                warn!(
                    target: "flagpole",
                    "event queue is full; dropping events until the pipeline catches up"
                );
            }
        }
        Err(TrySendError::Disconnected(_)) => {
            // pipeline already shut down
        }
    }
}

/// A thread that emits a message on a fixed interval until stopped.
struct Ticker {
    stop_tx: SyncSender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn start(interval: Duration, tick: impl Fn() + Send + 'static) -> Ticker {
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let handle = std::thread::Builder::new()
            .name("flagpole-ticker".to_owned())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn ticker thread");
        Ticker { stop_tx, handle }
    }

    fn stop(self) {
        let _ = self.stop_tx.try_send(());
        let _ = self.handle.join();
    }
}

/// State owned by the single consumer thread. The LRU user-key set in particular relies on that
/// single-consumer rule; it is not a concurrent structure.
struct Consumer {
    config: EventsConfig,
    outbox: Vec<InputEvent>,
    outbox_full_warned: bool,
    summarizer: EventSummarizer,
    user_keys: LruCache<String, ()>,
    pool: FlushWorkerPool,
    disabled: Arc<AtomicBool>,
    last_known_server_time: Arc<AtomicI64>,
}

impl Consumer {
    fn new(
        config: EventsConfig,
        pool: FlushWorkerPool,
        disabled: Arc<AtomicBool>,
        last_known_server_time: Arc<AtomicI64>,
    ) -> Consumer {
        let user_keys_capacity = NonZeroUsize::new(config.user_keys_capacity.max(1))
            .expect("capacity is at least one");
        Consumer {
            config,
            outbox: Vec::new(),
            outbox_full_warned: false,
            summarizer: EventSummarizer::new(),
            user_keys: LruCache::new(user_keys_capacity),
            pool,
            disabled,
            last_known_server_time,
        }
    }

    fn run(&mut self, receiver: mpsc::Receiver<EventMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                EventMessage::Event(event) => self.dispatch(event),
                EventMessage::Flush => self.trigger_flush(),
                EventMessage::FlushUsers => self.user_keys.clear(),
                EventMessage::Sync(latch) => latch.set(),
                EventMessage::Stop(latch) => {
                    self.pool.shutdown();
                    latch.set();
                    debug!(target: "flagpole", "event consumer stopped");
                    return;
                }
            }
        }
        // all senders dropped without an explicit stop
        self.pool.shutdown();
    }

    fn dispatch(&mut self, event: InputEvent) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }

        if !self.config.inline_users_in_events {
            let already_seen = self.notice_user(event.user().key());
            if !already_seen && !matches!(event, InputEvent::Identify(_)) {
                self.push_outbox(InputEvent::Index(IndexEvent {
                    creation_date: event.creation_date(),
                    user: event.user().clone(),
                }));
            }
        }

        if let InputEvent::Feature(feature) = &event {
            self.summarizer.summarize(feature);
        }

        let keep_full = match &event {
            InputEvent::Feature(feature) => {
                feature.track_events || self.debug_window_open(feature.debug_events_until_date)
            }
            InputEvent::Identify(_) | InputEvent::Custom(_) | InputEvent::Index(_) => true,
        };
        if keep_full {
            self.push_outbox(event);
        }
    }

    /// Adds the key to the recently-seen set; true if it was already there. Idempotent.
    fn notice_user(&mut self, key: &str) -> bool {
        self.user_keys.put(key.to_owned(), ()).is_some()
    }

    /// A debug window is open only while its deadline is ahead of both our clock and the
    /// service's clock (as last reported in a response `Date` header), so a wrong local clock
    /// cannot keep debug events flowing forever.
    fn debug_window_open(&self, debug_events_until_date: Option<u64>) -> bool {
        match debug_events_until_date {
            Some(until) => {
                let until = until as i64;
                until > now_millis() && until > self.last_known_server_time.load(Ordering::SeqCst)
            }
            None => false,
        }
    }

    fn push_outbox(&mut self, event: InputEvent) {
        if self.outbox.len() >= self.config.capacity {
            if !self.outbox_full_warned {
                warn!(
                    target: "flagpole",
                    "event buffer is full; dropping events until the next flush"
                );
                self.outbox_full_warned = true;
            }
            return;
        }
        self.outbox.push(event);
        self.outbox_full_warned = false;
    }

    fn trigger_flush(&mut self) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        let summary = self.summarizer.snapshot();
        if events.is_empty() && summary.is_empty() {
            return;
        }
        debug!(target: "flagpole", "flushing {} events", events.len());
        self.pool.submit(FlushPayload { events, summary });
    }
}

struct FlushPayload {
    events: Vec<InputEvent>,
    summary: EventSummary,
}

/// A fixed pool of worker threads that transform payloads to the wire form and POST them.
struct FlushWorkerPool {
    task_tx: Option<mpsc::Sender<FlushPayload>>,
    busy: Arc<(Mutex<usize>, Condvar)>,
    handles: Vec<JoinHandle<()>>,
}

impl FlushWorkerPool {
    fn new(
        config: &EventsConfig,
        http: reqwest::Client,
        disabled: Arc<AtomicBool>,
        last_known_server_time: Arc<AtomicI64>,
    ) -> FlushWorkerPool {
        let (task_tx, task_rx) = mpsc::channel::<FlushPayload>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let formatter = Arc::new(EventOutputFormatter::new(config));
        let url = format!("{}{}", config.events_uri, BULK_PATH);
        let busy = Arc::new((Mutex::new(0usize), Condvar::new()));

        let handles = (0..MAX_FLUSH_WORKERS)
            .map(|i| {
                let task_rx = Arc::clone(&task_rx);
                let formatter = Arc::clone(&formatter);
                let http = http.clone();
                let url = url.clone();
                let disabled = Arc::clone(&disabled);
                let last_known_server_time = Arc::clone(&last_known_server_time);
                let busy = Arc::clone(&busy);
                std::thread::Builder::new()
                    .name(format!("flagpole-flush-{}", i))
                    .spawn(move || {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                error!(target: "flagpole", "failed to start flush runtime: {}", err);
                                return;
                            }
                        };

                        loop {
                            let payload = {
                                let receiver = task_rx
                                    .lock()
                                    .expect("thread holding flush task lock should not panic");
                                receiver.recv()
                            };
                            let payload = match payload {
                                Ok(payload) => payload,
                                Err(_) => return, // channel closed: pool is shutting down
                            };

                            {
                                let (count, _) = &*busy;
                                *count.lock().expect("busy count lock poisoned") += 1;
                            }

                            post_payload(
                                &runtime,
                                &http,
                                &url,
                                &formatter,
                                payload,
                                &disabled,
                                &last_known_server_time,
                            );

                            let (count, signal) = &*busy;
                            *count.lock().expect("busy count lock poisoned") -= 1;
                            signal.notify_all();
                        }
                    })
                    .expect("failed to spawn flush worker thread")
            })
            .collect();

        FlushWorkerPool {
            task_tx: Some(task_tx),
            busy,
            handles,
        }
    }

    fn submit(&self, payload: FlushPayload) {
        if let Some(task_tx) = &self.task_tx {
            let _ = task_tx.send(payload);
        }
    }

    /// Wait (bounded) for in-flight posts, then close the task channel and join the workers.
    fn shutdown(&mut self) {
        let deadline = std::time::Instant::now() + WORKER_QUIESCENCE_TIMEOUT;
        let (count, signal) = &*self.busy;
        let mut in_flight = count.lock().expect("busy count lock poisoned");
        while *in_flight > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                warn!(target: "flagpole", "flush workers still busy after {:?}", WORKER_QUIESCENCE_TIMEOUT);
                break;
            }
            let (guard, _) = signal
                .wait_timeout(in_flight, deadline - now)
                .expect("busy count lock poisoned");
            in_flight = guard;
        }
        drop(in_flight);

        self.task_tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn post_payload(
    runtime: &tokio::runtime::Runtime,
    http: &reqwest::Client,
    url: &str,
    formatter: &EventOutputFormatter,
    payload: FlushPayload,
    disabled: &AtomicBool,
    last_known_server_time: &AtomicI64,
) {
    if disabled.load(Ordering::SeqCst) {
        return;
    }

    let output = formatter.make_output_events(&payload.events, payload.summary);
    if output.is_empty() {
        return;
    }
    debug!(target: "flagpole", "posting {} events to {}", output.len(), url);

    for attempt in 0..2 {
        if attempt > 0 {
            std::thread::sleep(POST_RETRY_DELAY);
            debug!(target: "flagpole", "retrying event post");
        }

        let result = runtime.block_on(async {
            http.post(url)
                .header(header::CONTENT_TYPE, "application/json")
                .json(&output)
                .send()
                .await
        });

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    if let Some(server_time) = response
                        .headers()
                        .get(header::DATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
                    {
                        last_known_server_time
                            .store(server_time.timestamp_millis(), Ordering::SeqCst);
                    }
                    return;
                }
                if http_status_is_unrecoverable(status.as_u16()) {
                    error!(
                        target: "flagpole",
                        "event delivery failed with HTTP {}; no further events will be posted",
                        status
                    );
                    disabled.store(true, Ordering::SeqCst);
                    return;
                }
                warn!(target: "flagpole", "unexpected HTTP {} posting events", status);
            }
            Err(err) => {
                warn!(target: "flagpole", "network error posting events: {}", err);
            }
        }
    }
    debug!(target: "flagpole", "giving up on this event batch");
}

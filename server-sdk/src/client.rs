use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use log::{debug, error, warn};
use sha2::Sha256;

use flagpole_core::data_source::{
    DataSource, NullDataSource, PollingDataSource, StreamingDataSource,
};
use flagpole_core::eval::{self, evaluate, Detail, PrereqEvent};
use flagpole_core::events::{
    now_millis, CustomEvent, DefaultEventProcessor, EventProcessor, EventsConfig, FeatureEvent,
    IdentifyEvent, InputEvent, NullEventProcessor,
};
use flagpole_core::store::{FeatureStore, InMemoryFeatureStore};
use flagpole_core::{Error, Flag, FlagValue, Result, User};

use crate::config::Config;
use crate::flags_state::{AllFlagsState, FlagState, FlagsStateOptions};

type HmacSha256 = Hmac<Sha256>;

/// The Flagpole client: create one per process and share it across request handlers.
///
/// Construction wires a feature store, a data source that keeps it synchronized, and the
/// analytics event pipeline, then blocks up to [`Config::start_wait`] for the first complete
/// dataset. Evaluation methods never fail: any problem surfaces as the application-provided
/// default plus an explanatory reason.
///
/// # Examples
/// ```no_run
/// # use flagpole::{Client, Config, User};
/// let client = Client::new("sdk-key", Config::default()).unwrap();
/// let user = User::with_key("alice").build();
/// if client.bool_variation("new-checkout", &user, false) {
///     // serve the new flow
/// }
/// ```
pub struct Client {
    sdk_key: String,
    offline: bool,
    store: Arc<dyn FeatureStore>,
    events: Arc<dyn EventProcessor>,
    data_source: Mutex<Box<dyn DataSource>>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client and start its background tasks.
    ///
    /// Blocks up to [`Config::start_wait`] for the data source to deliver a first dataset;
    /// a timeout is logged and the client is returned anyway (it will finish initializing in
    /// the background, serving defaults meanwhile).
    ///
    /// # Errors
    ///
    /// Only configuration problems are errors here: an SDK key that cannot be sent as an HTTP
    /// header, or an unparseable proxy URL. Network problems never fail construction.
    pub fn new(sdk_key: impl Into<String>, config: Config) -> Result<Client> {
        let sdk_key = sdk_key.into();

        for uri in [&config.base_uri, &config.stream_uri, &config.events_uri] {
            url::Url::parse(uri).map_err(Error::InvalidUri)?;
        }

        let store: Arc<dyn FeatureStore> = config
            .feature_store
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryFeatureStore::new()));

        let events: Arc<dyn EventProcessor> = if config.offline || !config.send_events {
            Arc::new(NullEventProcessor)
        } else {
            let http = http_client(&sdk_key, &config, true)?;
            Arc::new(DefaultEventProcessor::new(
                EventsConfig {
                    events_uri: config.events_uri.clone(),
                    capacity: config.capacity,
                    flush_interval: config.flush_interval,
                    user_keys_capacity: config.user_keys_capacity,
                    user_keys_flush_interval: config.user_keys_flush_interval,
                    inline_users_in_events: config.inline_users_in_events,
                    all_attributes_private: config.all_attributes_private,
                    private_attribute_names: config.private_attribute_names.clone(),
                },
                http,
            ))
        };

        let mut data_source: Box<dyn DataSource> = match config.data_source {
            Some(source) => source,
            None if config.offline || config.use_ldd => Box::new(NullDataSource::new()),
            None if config.stream => Box::new(StreamingDataSource::new(
                http_client(&sdk_key, &config, false)?,
                config.stream_uri.clone(),
                Arc::clone(&store),
            )),
            None => Box::new(PollingDataSource::new(
                http_client(&sdk_key, &config, true)?,
                config.base_uri.clone(),
                config.poll_interval,
                Arc::clone(&store),
            )),
        };

        let ready = data_source.start();
        if !config.start_wait.is_zero() && !ready.wait_timeout(config.start_wait) {
            warn!(
                target: "flagpole",
                "client did not initialize within {:?}; continuing in the background",
                config.start_wait
            );
        }

        Ok(Client {
            sdk_key,
            offline: config.offline,
            store,
            events,
            data_source: Mutex::new(data_source),
            closed: AtomicBool::new(false),
        })
    }

    /// True once the client has received a complete dataset (always true in offline mode).
    pub fn initialized(&self) -> bool {
        self.offline
            || self
                .data_source
                .lock()
                .expect("thread holding data source lock should not panic")
                .initialized()
    }

    /// Evaluate a flag for a user, returning one of the flag's variations or `default` if the
    /// flag cannot be evaluated for any reason.
    pub fn variation(&self, key: &str, user: &User, default: impl Into<FlagValue>) -> FlagValue {
        let detail = self.evaluate_internal(key, user, default.into(), false);
        detail
            .value
            .expect("evaluation details always carry a value")
    }

    /// Like [`Client::variation`], but also explains how the value was chosen.
    pub fn variation_detail(
        &self,
        key: &str,
        user: &User,
        default: impl Into<FlagValue>,
    ) -> Detail<FlagValue> {
        self.evaluate_internal(key, user, default.into(), true)
    }

    /// Evaluate a boolean flag. A non-boolean result counts as a wrong type and yields `default`.
    pub fn bool_variation(&self, key: &str, user: &User, default: bool) -> bool {
        self.variation(key, user, default)
            .as_bool()
            .unwrap_or(default)
    }

    /// Like [`Client::bool_variation`], but with the evaluation explanation; a non-boolean
    /// result yields `default` with a wrong-type error reason.
    pub fn bool_variation_detail(&self, key: &str, user: &User, default: bool) -> Detail<bool> {
        convert_detail(
            self.evaluate_internal(key, user, default.into(), true),
            default,
            FlagValue::as_bool,
        )
    }

    /// Like [`Client::str_variation`], but with the evaluation explanation.
    pub fn str_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: impl Into<String>,
    ) -> Detail<String> {
        let default = default.into();
        convert_detail(
            self.evaluate_internal(key, user, default.clone().into(), true),
            default,
            FlagValue::as_string,
        )
    }

    /// Like [`Client::float_variation`], but with the evaluation explanation.
    pub fn float_variation_detail(&self, key: &str, user: &User, default: f64) -> Detail<f64> {
        convert_detail(
            self.evaluate_internal(key, user, default.into(), true),
            default,
            FlagValue::as_float,
        )
    }

    /// Like [`Client::int_variation`], but with the evaluation explanation.
    pub fn int_variation_detail(&self, key: &str, user: &User, default: i64) -> Detail<i64> {
        convert_detail(
            self.evaluate_internal(key, user, default.into(), true),
            default,
            FlagValue::as_int,
        )
    }

    /// Evaluate a string flag.
    pub fn str_variation(&self, key: &str, user: &User, default: impl Into<String>) -> String {
        let default = default.into();
        self.variation(key, user, default.clone())
            .as_string()
            .unwrap_or(default)
    }

    /// Evaluate a numeric flag.
    pub fn float_variation(&self, key: &str, user: &User, default: f64) -> f64 {
        self.variation(key, user, default)
            .as_float()
            .unwrap_or(default)
    }

    /// Evaluate an integer flag.
    pub fn int_variation(&self, key: &str, user: &User, default: i64) -> i64 {
        self.variation(key, user, default)
            .as_int()
            .unwrap_or(default)
    }

    /// Evaluate a flag whose variations are arbitrary JSON.
    pub fn json_variation(
        &self,
        key: &str,
        user: &User,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.variation(key, user, FlagValue::Json(default)).as_json()
    }

    /// Evaluate every flag for the user at once, without generating analytics events. The
    /// result serializes in the shape client-side SDKs bootstrap from.
    pub fn all_flags_state(&self, user: &User, options: FlagsStateOptions) -> AllFlagsState {
        if !self.initialized() && !self.store.initialized() {
            warn!(target: "flagpole", "all_flags_state called before client has initialized");
            return AllFlagsState::new(false);
        }
        if user.key().is_empty() {
            warn!(target: "flagpole", "all_flags_state called with a keyless user");
            return AllFlagsState::new(false);
        }

        let mut state = AllFlagsState::new(true);
        for (key, flag) in self.store.all_flags() {
            if options.client_side_only && !flag.client_side {
                continue;
            }

            let (detail, _) = evaluate(&self.store, &flag, user);

            let requires_experiment_data = flag.is_experimentation_enabled(&detail.reason);
            let wants_details = !options.details_only_for_tracked_flags
                || flag.track_events
                || flag.debug_events_until_date.is_some()
                || requires_experiment_data;

            state.add(
                &key,
                detail.value,
                FlagState {
                    variation: detail.variation_index,
                    version: wants_details.then_some(flag.version),
                    reason: (wants_details && (options.with_reasons || requires_experiment_data))
                        .then_some(detail.reason),
                    track_events: flag.track_events || requires_experiment_data,
                    debug_events_until_date: flag.debug_events_until_date,
                },
            );
        }
        state
    }

    /// Report full details about a user without evaluating anything.
    pub fn identify(&self, user: &User) {
        if user.key().is_empty() {
            warn!(target: "flagpole", "identify called with a keyless user; ignoring");
            return;
        }
        self.events.send(InputEvent::Identify(IdentifyEvent {
            creation_date: now_millis(),
            user: user.clone(),
        }));
    }

    /// Record an application-defined event, with optional structured data attached.
    pub fn track(&self, key: impl Into<String>, user: &User, data: Option<serde_json::Value>) {
        self.track_internal(key.into(), user, data, None);
    }

    /// Like [`Client::track`], but with a numeric value the service can aggregate (e.g. a
    /// latency or a purchase amount).
    pub fn track_metric(
        &self,
        key: impl Into<String>,
        user: &User,
        metric_value: f64,
        data: Option<serde_json::Value>,
    ) {
        self.track_internal(key.into(), user, data, Some(metric_value));
    }

    fn track_internal(
        &self,
        key: String,
        user: &User,
        data: Option<serde_json::Value>,
        metric_value: Option<f64>,
    ) {
        if user.key().is_empty() {
            warn!(target: "flagpole", "track called with a keyless user; ignoring");
            return;
        }
        self.events.send(InputEvent::Custom(CustomEvent {
            creation_date: now_millis(),
            key,
            user: user.clone(),
            data,
            metric_value,
        }));
    }

    /// Ask the event pipeline to deliver buffered analytics soon. Does not wait.
    pub fn flush(&self) {
        self.events.flush();
    }

    /// An HMAC-SHA256 of the user key under the SDK key, for the secure mode handshake with
    /// client-side SDKs.
    pub fn secure_mode_hash(&self, user: &User) -> String {
        let mut mac = HmacSha256::new_from_slice(self.sdk_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(user.key().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Shut down: stop synchronization, deliver a final event batch, and join all background
    /// threads. Idempotent; called automatically on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "flagpole", "shutting down client");
        self.data_source
            .lock()
            .expect("thread holding data source lock should not panic")
            .stop();
        self.events.close();
    }

    fn evaluate_internal(
        &self,
        key: &str,
        user: &User,
        default: FlagValue,
        with_reasons: bool,
    ) -> Detail<FlagValue> {
        if user.key().is_empty() {
            warn!(target: "flagpole", "cannot evaluate flag {} for a keyless user", key);
            let detail = Detail::err_default(eval::Error::UserNotSpecified, default);
            self.send_unknown_flag_event(key, user, &detail, with_reasons);
            return detail;
        }

        let store_has_data = self.store.initialized();
        if !self.initialized() && !store_has_data {
            warn!(
                target: "flagpole",
                "evaluation of {} called before client has initialized; returning default value",
                key
            );
            let detail = Detail::err_default(eval::Error::ClientNotReady, default);
            self.send_unknown_flag_event(key, user, &detail, with_reasons);
            return detail;
        }
        if !self.initialized() && store_has_data {
            warn!(
                target: "flagpole",
                "client is not fully initialized; evaluating {} from the last known flag data",
                key
            );
        }

        let flag = match self.store.flag(key) {
            Some(flag) => flag,
            None => {
                warn!(target: "flagpole", "unknown feature flag {}; returning default value", key);
                let detail = Detail::err_default(eval::Error::FlagNotFound, default);
                self.send_unknown_flag_event(key, user, &detail, with_reasons);
                return detail;
            }
        };

        // nothing application-visible may escape evaluation, not even a bug of ours
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            evaluate(&self.store, &flag, user)
        }));
        let (detail, prereq_events) = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(target: "flagpole", "unexpected panic while evaluating flag {}", key);
                let detail = Detail::err_default(eval::Error::Exception, default);
                self.send_unknown_flag_event(key, user, &detail, with_reasons);
                return detail;
            }
        };
        let detail = detail.or(default.clone());

        for prereq in prereq_events {
            self.send_prereq_event(user, prereq, with_reasons);
        }
        self.send_flag_event(user, &flag, &detail, default, with_reasons, None);

        detail
    }

    /// Every evaluation emits exactly one feature event, including the failure paths where no
    /// flag was available; those events carry no version or variation.
    fn send_unknown_flag_event(
        &self,
        key: &str,
        user: &User,
        detail: &Detail<FlagValue>,
        with_reasons: bool,
    ) {
        let value = detail
            .value
            .clone()
            .unwrap_or(FlagValue::Json(serde_json::Value::Null));
        self.events.send(InputEvent::Feature(FeatureEvent {
            creation_date: now_millis(),
            key: key.to_owned(),
            user: user.clone(),
            value: value.clone(),
            default: value,
            variation: None,
            version: None,
            prereq_of: None,
            reason: with_reasons.then(|| detail.reason.clone()),
            track_events: false,
            debug_events_until_date: None,
        }));
    }

    fn send_flag_event(
        &self,
        user: &User,
        flag: &Flag,
        detail: &Detail<FlagValue>,
        default: FlagValue,
        with_reasons: bool,
        prereq_of: Option<String>,
    ) {
        let experiment = flag.is_experimentation_enabled(&detail.reason);
        self.events.send(InputEvent::Feature(FeatureEvent {
            creation_date: now_millis(),
            key: flag.key.clone(),
            user: user.clone(),
            value: detail
                .value
                .clone()
                .unwrap_or(FlagValue::Json(serde_json::Value::Null)),
            default,
            variation: detail.variation_index,
            version: Some(flag.version),
            prereq_of,
            reason: (with_reasons || experiment).then(|| detail.reason.clone()),
            track_events: flag.track_events || experiment,
            debug_events_until_date: flag.debug_events_until_date,
        }));
    }

    fn send_prereq_event(&self, user: &User, prereq: PrereqEvent, with_reasons: bool) {
        let PrereqEvent {
            prereq_of,
            flag,
            detail,
        } = prereq;
        self.send_flag_event(
            user,
            &flag,
            &detail,
            FlagValue::Json(serde_json::Value::Null),
            with_reasons,
            Some(prereq_of),
        );
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Narrow an evaluation detail to the requested type; a value of any other type becomes the
/// application default with a wrong-type error reason.
fn convert_detail<T>(
    detail: Detail<FlagValue>,
    default: T,
    convert: impl Fn(&FlagValue) -> Option<T>,
) -> Detail<T> {
    match detail.value.as_ref().and_then(&convert) {
        Some(value) => Detail {
            value: Some(value),
            variation_index: detail.variation_index,
            reason: detail.reason,
        },
        None => Detail::err_default(eval::Error::WrongType, default),
    }
}

fn http_client(sdk_key: &str, config: &Config, with_read_timeout: bool) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(sdk_key).map_err(|_| Error::InvalidSdkKey)?,
    );
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(concat!(
            "RustClient/",
            env!("CARGO_PKG_VERSION")
        )),
    );

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout);

    // streaming connections stay open indefinitely, so only plain requests get a read timeout
    if with_read_timeout {
        builder = builder.timeout(config.read_timeout);
    }

    if let Some(proxy) = &config.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    Ok(builder.build()?)
}

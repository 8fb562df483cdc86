use std::sync::Arc;
use std::time::Duration;

use flagpole_core::data_source::DataSource;
use flagpole_core::store::FeatureStore;

/// Configuration for [`crate::Client`].
///
/// Start from [`Config::default`] and override what you need:
///
/// ```
/// # use flagpole::Config;
/// # use std::time::Duration;
/// let config = Config::default()
///     .flush_interval(Duration::from_secs(5))
///     .private_attribute_names(vec!["email".to_owned()]);
/// ```
pub struct Config {
    pub(crate) base_uri: String,
    pub(crate) stream_uri: String,
    pub(crate) events_uri: String,

    pub(crate) capacity: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) user_keys_capacity: usize,
    pub(crate) user_keys_flush_interval: Duration,

    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,

    pub(crate) stream: bool,
    pub(crate) poll_interval: Duration,

    pub(crate) use_ldd: bool,
    pub(crate) offline: bool,
    pub(crate) send_events: bool,
    pub(crate) inline_users_in_events: bool,

    pub(crate) all_attributes_private: bool,
    pub(crate) private_attribute_names: Vec<String>,

    pub(crate) start_wait: Duration,
    pub(crate) proxy: Option<String>,

    pub(crate) feature_store: Option<Arc<dyn FeatureStore>>,
    pub(crate) data_source: Option<Box<dyn DataSource>>,
}

impl Config {
    /// Default base URI for flag data requests.
    pub const DEFAULT_BASE_URI: &'static str = "https://app.flagpole.dev";
    /// Default URI for the streaming connection.
    pub const DEFAULT_STREAM_URI: &'static str = "https://stream.flagpole.dev";
    /// Default URI for analytics event delivery.
    pub const DEFAULT_EVENTS_URI: &'static str = "https://events.flagpole.dev";

    /// Override the base URI for flag data requests. A trailing slash is stripped.
    pub fn base_uri(mut self, uri: impl AsRef<str>) -> Self {
        self.base_uri = strip_trailing_slash(uri.as_ref());
        self
    }

    /// Override the streaming URI. A trailing slash is stripped.
    pub fn stream_uri(mut self, uri: impl AsRef<str>) -> Self {
        self.stream_uri = strip_trailing_slash(uri.as_ref());
        self
    }

    /// Override the events URI. A trailing slash is stripped.
    pub fn events_uri(mut self, uri: impl AsRef<str>) -> Self {
        self.events_uri = strip_trailing_slash(uri.as_ref());
        self
    }

    /// Maximum number of analytics events held between flushes; further events are dropped with
    /// a warning. Defaults to 10000.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// How often buffered analytics events are delivered. Defaults to 10 seconds.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Size of the recently-seen-user set used to decide when to send full user details.
    /// Defaults to 1000.
    pub fn user_keys_capacity(mut self, capacity: usize) -> Self {
        self.user_keys_capacity = capacity.max(1);
        self
    }

    /// How often the recently-seen-user set is reset. Defaults to 5 minutes.
    pub fn user_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.user_keys_flush_interval = interval;
        self
    }

    /// TCP connect timeout for all service connections. Defaults to 2 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read timeout for non-streaming requests. Defaults to 10 seconds.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Whether to use the streaming connection for updates (the default). When false, the SDK
    /// polls on `poll_interval` instead.
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Interval between polling requests when streaming is disabled. Defaults to 30 seconds,
    /// which is also the enforced minimum.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Daemon mode: perform no network updates and serve whatever an externally-synchronized
    /// feature store contains. Analytics events are still delivered.
    pub fn use_ldd(mut self, use_ldd: bool) -> Self {
        self.use_ldd = use_ldd;
        self
    }

    /// Offline mode: no network activity at all. Evaluations return application defaults unless
    /// a populated feature store is supplied.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Whether to deliver analytics events. Defaults to true.
    pub fn send_events(mut self, send_events: bool) -> Self {
        self.send_events = send_events;
        self
    }

    /// Carry full user details on every analytics event instead of deduplicated index events.
    pub fn inline_users_in_events(mut self, inline: bool) -> Self {
        self.inline_users_in_events = inline;
        self
    }

    /// Scrub every user attribute except the key from analytics events.
    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.all_attributes_private = private;
        self
    }

    /// Scrub these attribute names from analytics events.
    pub fn private_attribute_names(mut self, names: Vec<String>) -> Self {
        self.private_attribute_names = names;
        self
    }

    /// How long [`crate::Client::new`] blocks waiting for the first complete dataset. Zero means
    /// don't wait. A timeout is logged, not an error. Defaults to 5 seconds.
    pub fn start_wait(mut self, wait: Duration) -> Self {
        self.start_wait = wait;
        self
    }

    /// Route all service connections through this proxy URL.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Use a custom feature-store backend instead of the in-memory default.
    pub fn feature_store(mut self, store: Arc<dyn FeatureStore>) -> Self {
        self.feature_store = Some(store);
        self
    }

    /// Replace the data source entirely; mainly useful in tests.
    pub fn data_source(mut self, source: Box<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    /// Former name of [`Config::data_source`].
    #[deprecated(note = "renamed to data_source")]
    pub fn update_processor(self, source: Box<dyn DataSource>) -> Self {
        self.data_source(source)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            base_uri: Config::DEFAULT_BASE_URI.to_owned(),
            stream_uri: Config::DEFAULT_STREAM_URI.to_owned(),
            events_uri: Config::DEFAULT_EVENTS_URI.to_owned(),
            capacity: 10_000,
            flush_interval: Duration::from_secs(10),
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(10),
            stream: true,
            poll_interval: Duration::from_secs(30),
            use_ldd: false,
            offline: false,
            send_events: true,
            inline_users_in_events: false,
            all_attributes_private: false,
            private_attribute_names: Vec::new(),
            start_wait: Duration::from_secs(5),
            proxy: None,
            feature_store: None,
            data_source: None,
        }
    }
}

fn strip_trailing_slash(uri: &str) -> String {
    uri.trim_end_matches('/').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uris_lose_their_trailing_slashes() {
        let config = Config::default()
            .base_uri("https://example.com/")
            .stream_uri("https://stream.example.com//")
            .events_uri("https://events.example.com");
        assert_eq!(config.base_uri, "https://example.com");
        assert_eq!(config.stream_uri, "https://stream.example.com");
        assert_eq!(config.events_uri, "https://events.example.com");
    }

    #[test]
    fn capacities_cannot_be_zero() {
        let config = Config::default().capacity(0).user_keys_capacity(0);
        assert_eq!(config.capacity, 1);
        assert_eq!(config.user_keys_capacity, 1);
    }
}

//! Client runtime configuration.

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use relay_core::{SessionId, UserId};
use relay_settings::ClientSettings;

/// Runtime configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint without query parameters.
    pub url: String,
    /// Session to bind to; the server generates one when absent.
    pub session_id: Option<SessionId>,
    /// User identity passed through at registration.
    pub user_id: Option<UserId>,
    /// Time allowed for the transport to open.
    pub connect_timeout: Duration,
    /// Interval between `ping` messages while connected.
    pub keepalive_interval: Duration,
    /// Delay before the first reconnect attempt.
    pub initial_reconnect_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Reconnect attempts before the manager gives up.
    pub max_reconnect_attempts: u32,
    /// Outbound queue bound; `None` is unbounded.
    pub max_queue_size: Option<usize>,
    /// Drop the connection when a `ping` goes unanswered this long.
    pub pong_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            url: settings.url.clone(),
            session_id: None,
            user_id: None,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            keepalive_interval: Duration::from_millis(settings.keepalive_interval_ms),
            initial_reconnect_delay: Duration::from_millis(settings.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(settings.max_reconnect_delay_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            max_queue_size: settings.max_queue_size,
            pong_timeout: settings.pong_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl ClientConfig {
    /// Config for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Bind to `session_id`.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Attach a user identity.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// URL to open, with `session_id` and `user_id` query parameters.
    pub fn endpoint_url(&self) -> String {
        let mut url = self.url.clone();
        let params = [
            ("session_id", self.session_id.as_ref().map(SessionId::as_str)),
            ("user_id", self.user_id.as_ref().map(UserId::as_str)),
        ];
        for (key, value) in params {
            let Some(value) = value else { continue };
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(key);
            url.push('=');
            url.extend(utf8_percent_encode(value, QUERY_VALUE));
        }
        url
    }
}

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

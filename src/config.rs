//! Client Configuration
//!
//! Endpoints, credentials and protocol timings. `Default` carries the
//! protocol constants; `from_env` overrides them from `SYNC_*` variables.

use std::time::Duration;

use thiserror::Error;

use crate::core::backoff::ReconnectPolicy;
use crate::network::auth;

/// Interval between liveness pings while the connection is open.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often `join_session` re-checks the connection while waiting for it.
pub const DEFAULT_CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `join_session` waits for the connection to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after AUTHENTICATE before sending JOIN_SESSION.
pub const DEFAULT_AUTH_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for SESSION_JOINED or ERROR.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric variable did not parse.
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Reconnect delays and attempt bound.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Join handshake timings.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Poll interval while waiting for the connection to open.
    pub connect_poll_interval: Duration,
    /// Give up waiting for the connection after this long.
    pub connect_timeout: Duration,
    /// Pause after AUTHENTICATE.
    pub auth_grace: Duration,
    /// Give up waiting for SESSION_JOINED after this long.
    pub join_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            connect_poll_interval: DEFAULT_CONNECT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_grace: DEFAULT_AUTH_GRACE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the HTTP session API.
    pub api_url: String,
    /// Bearer token for the HTTP API and the AUTHENTICATE message.
    pub access_token: Option<String>,
    /// Local user id. Derived from the token's `sub` claim when unset.
    pub user_id: Option<String>,
    /// Transport settings.
    pub connection: ConnectionConfig,
    /// Join handshake timings.
    pub join: JoinConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/api".to_string(),
            access_token: None,
            user_id: None,
            connection: ConnectionConfig::default(),
            join: JoinConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SYNC_WS_URL") {
            config.connection.url = url;
        }
        if let Some(url) = lookup("SYNC_API_URL") {
            config.api_url = url;
        }
        config.access_token = lookup("SYNC_ACCESS_TOKEN").filter(|t| !t.is_empty());
        config.user_id = lookup("SYNC_USER_ID").filter(|u| !u.is_empty());

        if let Some(ms) = parse_u64(&lookup, "SYNC_PING_INTERVAL_MS")? {
            config.connection.ping_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parse_u64(&lookup, "SYNC_MAX_RECONNECT_ATTEMPTS")? {
            config.connection.reconnect.max_attempts = n.min(u32::MAX as u64) as u32;
        }

        Ok(config)
    }

    /// Local user id, falling back to the access token's subject.
    pub fn resolved_user_id(&self) -> Option<String> {
        if let Some(ref id) = self.user_id {
            return Some(id.clone());
        }
        let token = self.access_token.as_deref()?;
        auth::inspect_token(token).ok().map(|claims| claims.sub)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_carry_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.ping_interval, Duration::from_secs(30));
        assert_eq!(config.connection.reconnect.max_attempts, 10);
        assert_eq!(config.join.connect_poll_interval, Duration::from_millis(100));
        assert_eq!(config.join.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.join.auth_grace, Duration::from_millis(500));
        assert_eq!(config.join.join_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("SYNC_WS_URL", "wss://table.example/ws"),
            ("SYNC_API_URL", "https://table.example/api"),
            ("SYNC_USER_ID", "u-42"),
            ("SYNC_PING_INTERVAL_MS", "15000"),
            ("SYNC_MAX_RECONNECT_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.connection.url, "wss://table.example/ws");
        assert_eq!(config.api_url, "https://table.example/api");
        assert_eq!(config.resolved_user_id().as_deref(), Some("u-42"));
        assert_eq!(config.connection.ping_interval, Duration::from_secs(15));
        assert_eq!(config.connection.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_empty_token_treated_as_absent() {
        let config = ClientConfig::from_lookup(lookup_from(&[("SYNC_ACCESS_TOKEN", "")])).unwrap();
        assert!(config.access_token.is_none());
        assert!(config.resolved_user_id().is_none());
    }

    #[test]
    fn test_invalid_number_rejected() {
        let result = ClientConfig::from_lookup(lookup_from(&[("SYNC_PING_INTERVAL_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidNumber { var: "SYNC_PING_INTERVAL_MS", .. })
        ));
    }
}

use std::time::Duration;

use url::Url;

use crate::relay_rpc::RELAYER_DEFAULT_PROTOCOL;
use crate::TransportError;

/// Primary relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.walletconnect.com";

/// Relay endpoint tried when the primary one refuses the connection.
pub const FAILOVER_RELAY_URL: &str = "wss://relay.walletconnect.org";

/// Configuration for the relay connection.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use tether_transport::RelayConfig;
///
/// let config = RelayConfig::new()
///     .project_id("my-project")
///     .connect_timeout(std::time::Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub(crate) relay_url: String,
    pub(crate) failover_url: Option<String>,
    pub(crate) project_id: Option<String>,
    pub(crate) protocol: String,
    pub(crate) user_agent: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) recv_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayConfig {
    /// Create a new config with defaults.
    ///
    /// `TETHER_RELAY_URL` and `TETHER_PROJECT_ID`, when set, override the
    /// relay endpoint and project id. Both can be overridden again with the
    /// builder methods.
    pub fn new() -> Self {
        let relay_url =
            std::env::var("TETHER_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        let project_id = std::env::var("TETHER_PROJECT_ID").ok();

        Self {
            relay_url,
            failover_url: Some(FAILOVER_RELAY_URL.to_string()),
            project_id,
            protocol: RELAYER_DEFAULT_PROTOCOL.to_string(),
            user_agent: format!("tether-rs/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            recv_buffer: 256,
        }
    }

    /// Use a custom relay endpoint. Disables the failover endpoint.
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self.failover_url = None;
        self
    }

    /// Set (or clear) the endpoint tried after the primary one fails.
    pub fn failover_url(mut self, url: Option<String>) -> Self {
        self.failover_url = url;
        self
    }

    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    /// Relay protocol name used to build method names (default: `irn`).
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Maximum time a connection attempt may take (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Channel buffer size for incoming frames (default: 256).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    pub fn relay_url_str(&self) -> &str {
        &self.relay_url
    }

    pub fn failover_url_str(&self) -> Option<&str> {
        self.failover_url.as_deref()
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        self.connect_timeout
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer
    }

    /// Build the full websocket URL for `base`, carrying the signed identity
    /// token, project id and user agent as query parameters.
    pub fn endpoint_url(&self, base: &str, auth: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(base)?;
        match url.scheme() {
            "ws" | "wss" | "memory" => {}
            other => {
                return Err(TransportError::Config(format!(
                    "unsupported relay scheme: {other}"
                )))
            }
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("auth", auth);
            if let Some(project_id) = &self.project_id {
                query.append_pair("projectId", project_id);
            }
            query.append_pair("ua", &self.user_agent);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_auth_and_project() {
        let config = RelayConfig::new()
            .relay_url("wss://relay.example.com")
            .project_id("p1")
            .user_agent("test-ua");
        let url = config
            .endpoint_url(config.relay_url_str(), "token")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example.com/?auth=token&projectId=p1&ua=test-ua"
        );
    }

    #[test]
    fn custom_relay_disables_failover() {
        let config = RelayConfig::new().relay_url("wss://relay.example.com");
        assert!(config.failover_url_str().is_none());
    }

    #[test]
    fn rejects_http_scheme() {
        let config = RelayConfig::new();
        let err = config.endpoint_url("http://relay.example.com", "t").unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn defaults() {
        let config = RelayConfig::new().relay_url("wss://x.example");
        assert_eq!(config.protocol_name(), "irn");
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(10));
        assert_eq!(config.recv_buffer_size(), 256);
    }
}

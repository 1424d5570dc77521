//! Feed configuration.
//!
//! Provides configuration options for the synchronization core and the
//! exchanges it connects to.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use marketfeed_sdk::{ExchangeId, Market};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Default acknowledgment timeout in milliseconds.
pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;

/// Default transport connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default handshake timeout in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default side-channel buffer size.
pub const DEFAULT_NOTICE_CAPACITY: usize = 256;

/// Default cex endpoint.
pub const CEX_WS_URL: &str = "wss://ws.cex.io/ws";

/// Default hollaex endpoint.
pub const HOLLAEX_WS_URL: &str = "wss://api.hollaex.com/socket.io/?EIO=4&transport=websocket";

/// Default bitstamp endpoint.
pub const BITSTAMP_WS_URL: &str = "wss://ws.bitstamp.net";

/// Wire protocol spoken by an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Nonce-acknowledged JSON protocol with sequenced book updates.
    Cex,
    /// Socket.io broadcast protocol, filtered client-side.
    Hollaex,
    /// Channel-acknowledged JSON protocol with full book snapshots.
    Bitstamp,
}

impl ProtocolKind {
    /// Returns the default endpoint for this protocol.
    #[must_use]
    pub const fn default_url(&self) -> &'static str {
        match self {
            Self::Cex => CEX_WS_URL,
            Self::Hollaex => HOLLAEX_WS_URL,
            Self::Bitstamp => BITSTAMP_WS_URL,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cex => write!(f, "cex"),
            Self::Hollaex => write!(f, "hollaex"),
            Self::Bitstamp => write!(f, "bitstamp"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cex" => Ok(Self::Cex),
            "hollaex" => Ok(Self::Hollaex),
            "bitstamp" => Ok(Self::Bitstamp),
            other => Err(FeedError::InvalidConfig(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// API credentials used by protocols with an authentication step.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// API key.
    pub api_key: String,
    /// API secret.
    pub secret: String,
}

impl Credentials {
    /// Creates new credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .finish()
    }
}

/// Configuration of one exchange connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange identifier used by callers.
    pub id: ExchangeId,

    /// Wire protocol.
    pub protocol: ProtocolKind,

    /// Endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Market directory entries.
    #[serde(default)]
    pub markets: Vec<Market>,

    /// API credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl ExchangeConfig {
    /// Creates a configuration using the protocol's default endpoint.
    #[must_use]
    pub fn new(id: impl Into<ExchangeId>, protocol: ProtocolKind) -> Self {
        Self {
            id: id.into(),
            protocol,
            url: None,
            markets: Vec::new(),
            credentials: None,
        }
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Adds a market directory entry.
    #[must_use]
    pub fn with_market(mut self, market: Market) -> Self {
        self.markets.push(market);
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Returns the endpoint to connect to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.url
            .as_deref()
            .unwrap_or_else(|| self.protocol.default_url())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.id.as_str().is_empty() {
            return Err(FeedError::InvalidConfig(
                "exchange id cannot be empty".to_string(),
            ));
        }

        let url = self.endpoint();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(FeedError::InvalidConfig(format!(
                "{}: url must start with ws:// or wss://",
                self.id
            )));
        }

        if let Some(credentials) = &self.credentials {
            if credentials.api_key.is_empty() || credentials.secret.is_empty() {
                return Err(FeedError::InvalidConfig(format!(
                    "{}: credentials cannot be empty",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

fn default_subscribe_timeout_ms() -> u64 {
    DEFAULT_SUBSCRIBE_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_notice_capacity() -> usize {
    DEFAULT_NOTICE_CAPACITY
}

/// Configuration of the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Acknowledgment timeout applied when a caller gives none.
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Transport connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Protocol handshake timeout.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Depth limit applied when a caller gives none. `None` = full depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_depth: Option<usize>,

    /// Side-channel buffer size.
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,

    /// Configured exchanges.
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout_ms: DEFAULT_SUBSCRIBE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            default_depth: None,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
            exchanges: Vec::new(),
        }
    }
}

impl FeedConfig {
    /// Creates a configuration with default settings and no exchanges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or invalid.
    pub fn from_json(json: &str) -> Result<Self, FeedError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| FeedError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the acknowledgment timeout.
    #[must_use]
    pub fn with_subscribe_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.subscribe_timeout_ms = timeout_ms;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Sets the default depth limit.
    #[must_use]
    pub fn with_default_depth(mut self, depth: usize) -> Self {
        self.default_depth = Some(depth);
        self
    }

    /// Sets the side-channel buffer size.
    #[must_use]
    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }

    /// Adds an exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: ExchangeConfig) -> Self {
        self.exchanges.push(exchange);
        self
    }

    /// Returns the acknowledgment timeout.
    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Returns the configuration of one exchange.
    #[must_use]
    pub fn exchange(&self, id: &ExchangeId) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| &e.id == id)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.subscribe_timeout_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "subscribe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.handshake_timeout_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.notice_capacity == 0 {
            return Err(FeedError::InvalidConfig(
                "notice_capacity must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for exchange in &self.exchanges {
            exchange.validate()?;
            if !seen.insert(exchange.id.clone()) {
                return Err(FeedError::InvalidConfig(format!(
                    "duplicate exchange id: {}",
                    exchange.id
                )));
            }
        }

        Ok(())
    }
}

//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Configuration of a [`crate::Node`].
///
/// Durations are written in milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long to wait for the peer's side of the handshake.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// How long a correlated request may stay unanswered. Zero disables.
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    /// Keepalive interval; two silent intervals close the connection.
    /// Zero disables.
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// Object requests in flight per fill.
    pub max_parallel_requests: usize,
    /// Outgoing messages queued per connection before it is closed.
    pub send_queue_size: usize,
    /// Capacity of actor mailboxes.
    pub mailbox_size: usize,
    /// Answer `RequestListOfFeeds`.
    pub public: bool,
    /// Address to listen on at startup.
    pub listen: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_parallel_requests: 16,
            send_queue_size: 256,
            mailbox_size: 128,
            public: false,
            listen: None,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_requests == 0 {
            return Err(NodeError::Config("max_parallel_requests must be positive".into()));
        }
        if self.send_queue_size == 0 {
            return Err(NodeError::Config("send_queue_size must be positive".into()));
        }
        if self.mailbox_size == 0 {
            return Err(NodeError::Config("mailbox_size must be positive".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(NodeError::Config("handshake_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Response timeout, if enabled.
    pub fn response_deadline(&self) -> Option<Duration> {
        (!self.response_timeout.is_zero()).then_some(self.response_timeout)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

//! Call subsystem configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An ICE server entry passed to the peer connection factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for the call manager and its sessions.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Maximum concurrent non-ended calls allowed.
    pub max_concurrent_calls: usize,
    /// Validity window stamped on outgoing invites; also the ring window for
    /// incoming calls (the TTL timer equals the invite validity window).
    pub invite_ttl_secs: u64,
    /// How long an outgoing call waits in Inviting before giving up.
    pub ring_timeout_secs: u64,
    /// Attempts for negotiation-path signaling writes before the session fails.
    pub publish_attempts: u32,
    /// Base delay between publish attempts; doubles per attempt.
    pub publish_backoff: Duration,
    /// ICE servers handed to the peer connection factory.
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            invite_ttl_secs: 30,
            ring_timeout_secs: 45,
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(200),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
        }
    }
}

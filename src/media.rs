//! Peer connection adapter boundary.
//!
//! Thin capability facade over the media engine's connection object. SDP and
//! ICE payloads are opaque strings passed through unmodified; media internals
//! stay behind the trait. The state machine treats any [`MediaError`] as fatal
//! to the session — media negotiation is never retried from here.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::IceServerConfig;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid peer connection state: {0}")]
    InvalidState(String),

    #[error("media engine failure: {0}")]
    EngineFailure(String),
}

/// Observable connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One media-engine connection, exclusively owned by a single session and
/// closed exactly once.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the local offer SDP (caller side).
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Apply the remote offer and create the local answer SDP (callee side).
    async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError>;

    /// Apply the remote description (the caller applies the answer here).
    async fn set_remote_description(&self, desc: &str) -> Result<(), MediaError>;

    /// Add a remote ICE candidate. Only valid once a remote description is
    /// applied; the session buffers earlier candidates.
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    /// Tear the connection down.
    async fn close(&self) -> Result<(), MediaError>;

    /// Connection-state signal.
    fn connection_state(&self) -> watch::Receiver<PeerConnectionState>;

    /// Stream of locally gathered ICE candidates to be published on the
    /// signaling channel. May be taken at most once.
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<String>>;
}

/// Creates one fresh peer connection per session.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Box<dyn PeerConnection>, MediaError>;
}

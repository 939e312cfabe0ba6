//! Core identifier and classification types shared across the call subsystem.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for one call attempt.
///
/// Generated by the caller; 32 uppercase hex characters. The identifier is
/// also the glare tie-breaker: when two sessions cross between the same
/// identities, the lexicographically smaller one proceeds as caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether we originated the call or received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a session ended in `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The invite (or the ring window) expired before anyone answered.
    InviteExpired,
    /// The remote device already had an active call.
    RemoteBusy,
    /// The remote user declined.
    RemoteRejected,
    /// We declined locally.
    LocalDeclined,
    /// Lost the glare tie-break against a crossing session.
    Glare,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    /// The media engine reported an unrecoverable error.
    Media,
    /// The signaling write path was exhausted.
    Network,
    /// The local identity was no longer valid.
    Auth,
}

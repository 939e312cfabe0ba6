//! Out-of-band call invitations.
//!
//! Invites travel over a push transport that is independent of the signaling
//! channel and unreliable: a notification may arrive duplicated, late, or not
//! at all. The dispatcher is intentionally dumb — deduplication by session id
//! is the call manager's job, and an invite past its validity window must be
//! rejected, never silently accepted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::SessionId;

/// Push-delivered call invitation.
///
/// Wire shape: `{callerId, calleeId, sessionId, issuedAt, ttlSeconds}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteNotification {
    pub caller_id: String,
    pub callee_id: String,
    pub session_id: SessionId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl InviteNotification {
    pub fn new(
        caller_id: impl Into<String>,
        callee_id: impl Into<String>,
        session_id: SessionId,
        issued_at: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            callee_id: callee_id.into(),
            session_id,
            issued_at,
            ttl_seconds,
        }
    }

    /// A TTL too large to represent comes off the wire; it is treated as
    /// malformed, so the invite reads as already expired.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(self.issued_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// Errors on the invite send path. Best-effort only: the caller must not
/// assume delivery either way.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("callee unreachable: {0}")]
    Unreachable(String),

    #[error("invite delivery throttled")]
    Throttled,
}

/// Push transport boundary for call invitations.
#[async_trait]
pub trait InviteTransport: Send + Sync {
    /// Send an invite to the callee's device. Best-effort.
    async fn send_invite(&self, invite: &InviteNotification) -> Result<(), DeliveryError>;

    /// Subscribe to invites addressed to this device.
    ///
    /// One subscription per transport lifetime; the stream is infinite and
    /// not restartable.
    async fn incoming(&self) -> mpsc::Receiver<InviteNotification>;
}

//! Signaling channel adapter.
//!
//! The realtime-database transport is modelled as one append-only log per
//! session: `append` assigns the next sequence number, subscribers receive
//! every entry already in the log followed by new ones as they land. Delivery
//! may duplicate or reorder entries; [`SequenceBuffer`] restores non-decreasing
//! sequence order and drops duplicates before the state machine sees anything.
//!
//! A subscriber also sees its own appends echoed back (it is a shared log);
//! [`SignalingChannel`] filters those out by the sequence numbers its own
//! `append` calls returned.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::SessionId;

/// Cause carried by a `Busy` message, so the caller can tell a busy device
/// from a decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusyCause {
    #[serde(rename = "busy")]
    InCall,
    #[serde(rename = "declined")]
    Declined,
}

/// Typed signaling payload.
///
/// Wire shape per log entry: `{seq, type, payload}` with lowercase type tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer(String),
    Answer(String),
    #[serde(rename = "ice")]
    IceCandidate(String),
    Hangup,
    Busy(BusyCause),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice",
            Self::Hangup => "hangup",
            Self::Busy(_) => "busy",
        }
    }
}

/// One entry of a session's signaling log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling transport unavailable: {0}")]
    Unavailable(String),

    #[error("signaling write conflict: {0}")]
    Conflict(String),
}

/// Realtime-database boundary: a per-session ordered log.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Append a payload to the session's log. The transport assigns the
    /// sequence number (starting at 1) and is the single ordering authority.
    async fn append(
        &self,
        session_id: &SessionId,
        payload: SignalPayload,
    ) -> Result<u64, TransportError>;

    /// Subscribe to a session's log: entries already present are delivered
    /// first, then new ones as they are appended. Delivery to any single
    /// subscriber may be reordered or duplicated; eventual delivery only.
    async fn subscribe(&self, session_id: &SessionId) -> mpsc::Receiver<SignalingMessage>;
}

/// Restores per-session sequence order and drops duplicates.
#[derive(Debug, Default)]
pub struct SequenceBuffer {
    next_seq: u64,
    pending: BTreeMap<u64, SignalingMessage>,
}

impl SequenceBuffer {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Accept a raw message and return every message that is now deliverable
    /// in order. Duplicates and already-delivered sequence numbers yield
    /// nothing.
    pub fn accept(&mut self, msg: SignalingMessage) -> Vec<SignalingMessage> {
        if msg.seq < self.next_seq {
            log::debug!(target: "Call/Signaling", "dropping stale/duplicate seq {}", msg.seq);
            return Vec::new();
        }
        if self.pending.contains_key(&msg.seq) {
            log::debug!(target: "Call/Signaling", "dropping duplicate seq {}", msg.seq);
            return Vec::new();
        }
        self.pending.insert(msg.seq, msg);

        let mut ready = Vec::new();
        while let Some(next) = self.pending.remove(&self.next_seq) {
            ready.push(next);
            self.next_seq += 1;
        }
        ready
    }
}

/// A session's live view of its signaling log: ordered, deduplicated, and
/// with the session's own writes filtered out.
pub struct SignalingChannel {
    session_id: SessionId,
    transport: std::sync::Arc<dyn SignalingTransport>,
    rx: mpsc::Receiver<SignalingMessage>,
    buffer: SequenceBuffer,
    ready: VecDeque<SignalingMessage>,
    own_seqs: HashSet<u64>,
}

impl SignalingChannel {
    pub async fn open(
        transport: std::sync::Arc<dyn SignalingTransport>,
        session_id: SessionId,
    ) -> Self {
        let rx = transport.subscribe(&session_id).await;
        Self {
            session_id,
            transport,
            rx,
            buffer: SequenceBuffer::new(),
            ready: VecDeque::new(),
            own_seqs: HashSet::new(),
        }
    }

    /// Single append attempt; retry policy lives with the session so it can
    /// be preempted by local intents.
    pub async fn append(&mut self, payload: SignalPayload) -> Result<u64, TransportError> {
        let seq = self.transport.append(&self.session_id, payload).await?;
        self.own_seqs.insert(seq);
        Ok(seq)
    }

    /// Next peer message in sequence order. Returns `None` when the
    /// subscription is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            if let Some(msg) = self.ready.pop_front() {
                if self.own_seqs.contains(&msg.seq) {
                    continue;
                }
                return Some(msg);
            }
            let raw = self.rx.recv().await?;
            self.ready.extend(self.buffer.accept(raw));
        }
    }
}

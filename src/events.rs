//! Observable call events.
//!
//! The orchestrator is decoupled from any rendering layer: UI code subscribes
//! to these broadcast channels instead of being called back directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::state::CallState;
use crate::types::{CallDirection, SessionId};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A call is ringing on this device.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub caller_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A session changed state.
#[derive(Debug, Clone, Serialize)]
pub struct CallStateUpdate {
    pub session_id: SessionId,
    pub peer_id: String,
    pub direction: CallDirection,
    pub state: CallState,
}

/// Why an invite never produced a ringing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissedReason {
    Expired,
    Busy,
}

/// An invite was turned away before any session existed.
#[derive(Debug, Clone, Serialize)]
pub struct MissedCall {
    pub session_id: SessionId,
    pub caller_id: String,
    pub reason: MissedReason,
}

/// Typed event bus with a broadcast channel per event type.
#[derive(Debug)]
pub struct EventBus {
    pub incoming_call: broadcast::Sender<Arc<IncomingCall>>,
    pub call_state: broadcast::Sender<Arc<CallStateUpdate>>,
    pub missed_call: broadcast::Sender<Arc<MissedCall>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            incoming_call: broadcast::channel(CHANNEL_CAPACITY).0,
            call_state: broadcast::channel(CHANNEL_CAPACITY).0,
            missed_call: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

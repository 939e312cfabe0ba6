//! Call session state machine.
//!
//! Transitions are applied by the session task only, so a given session's
//! state never changes concurrently. Invalid pairs are rejected with
//! [`InvalidTransition`] instead of being silently absorbed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::invite::InviteNotification;
use crate::types::{CallDirection, FailReason, RejectReason, SessionId};

/// Current state of a call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Outgoing call: created, offer not yet on the wire.
    #[default]
    Idle,
    /// Outgoing call: invite and offer sent, waiting for the callee.
    Inviting { invited_at: DateTime<Utc> },
    /// Incoming call: ringing locally until accepted, rejected, or expired.
    Ringing {
        received_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Offer/answer applied, ICE exchange in progress.
    Negotiating { started_at: DateTime<Utc> },
    /// Media flowing.
    Connected { connected_at: DateTime<Utc> },
    /// Hangup in progress: peer connection being torn down.
    Ending {
        since: DateTime<Utc>,
        connected_at: Option<DateTime<Utc>>,
    },
    /// Session fully released.
    Closed {
        closed_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    /// Terminal: the call never proceeded.
    Rejected {
        reason: RejectReason,
        at: DateTime<Utc>,
    },
    /// Terminal failure; cleanup confirms into `Closed`.
    Failed {
        reason: FailReason,
        at: DateTime<Utc>,
    },
}

impl CallState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// No further signaling or intents are meaningful.
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::Rejected { .. } | Self::Failed { .. }
        )
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing { .. } | Self::Inviting { .. })
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Invite dispatched and offer written (caller).
    InviteSent,
    /// Local user accepted the incoming call (callee).
    LocalAccepted,
    /// Remote answer applied (caller).
    AnswerReceived,
    /// Media engine reports the connection is up.
    MediaConnected,
    /// Rejected on this device: decline, TTL expiry, or glare self-cancel.
    LocalRejected { reason: RejectReason },
    /// The remote side declined or was busy.
    RemoteDeclined { reason: RejectReason },
    /// Hangup after media was set up; teardown still pending.
    HangupInitiated,
    /// Hangup before media was established: straight to `Closed`.
    EarlyHangup,
    /// Peer connection handle closed; session resources released.
    CloseConfirmed,
    /// Unrecoverable component error.
    Failed { reason: FailReason },
}

/// Full session information, owned by the session task.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub session_id: SessionId,
    pub caller_id: String,
    pub callee_id: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallInfo {
    pub fn new_outgoing(
        session_id: SessionId,
        caller_id: impl Into<String>,
        callee_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            caller_id: caller_id.into(),
            callee_id: callee_id.into(),
            direction: CallDirection::Outgoing,
            state: CallState::Idle,
            created_at: Utc::now(),
        }
    }

    /// An incoming call starts out ringing; the TTL timer equals the invite
    /// validity window.
    pub fn new_incoming(invite: &InviteNotification) -> Self {
        Self {
            session_id: invite.session_id.clone(),
            caller_id: invite.caller_id.clone(),
            callee_id: invite.callee_id.clone(),
            direction: CallDirection::Incoming,
            state: CallState::Ringing {
                received_at: Utc::now(),
                expires_at: invite.expires_at(),
            },
            created_at: Utc::now(),
        }
    }

    /// The other party's identity.
    pub fn peer_id(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.callee_id,
            CallDirection::Incoming => &self.caller_id,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::InviteSent) => CallState::Inviting {
                invited_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => CallState::Negotiating {
                started_at: Utc::now(),
            },
            (CallState::Inviting { .. }, CallTransition::AnswerReceived) => CallState::Negotiating {
                started_at: Utc::now(),
            },
            (CallState::Negotiating { .. }, CallTransition::MediaConnected) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                }
            }
            // Idle is included so a glare self-cancel can land before the
            // offer publish finished.
            (
                CallState::Idle | CallState::Inviting { .. } | CallState::Ringing { .. },
                CallTransition::LocalRejected { reason },
            ) => CallState::Rejected {
                reason,
                at: Utc::now(),
            },
            (CallState::Inviting { .. }, CallTransition::RemoteDeclined { reason }) => {
                CallState::Rejected {
                    reason,
                    at: Utc::now(),
                }
            }
            (CallState::Negotiating { .. }, CallTransition::HangupInitiated) => CallState::Ending {
                since: Utc::now(),
                connected_at: None,
            },
            (CallState::Connected { connected_at }, CallTransition::HangupInitiated) => {
                CallState::Ending {
                    since: Utc::now(),
                    connected_at: Some(*connected_at),
                }
            }
            // Hangup before media was established skips the teardown step.
            (
                CallState::Idle | CallState::Inviting { .. } | CallState::Ringing { .. },
                CallTransition::EarlyHangup,
            ) => CallState::Closed {
                closed_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Ending { connected_at, .. }, CallTransition::CloseConfirmed) => {
                let duration = connected_at
                    .map(|t| Utc::now().signed_duration_since(t).num_seconds());
                CallState::Closed {
                    closed_at: Utc::now(),
                    duration_secs: duration,
                }
            }
            (CallState::Failed { .. }, CallTransition::CloseConfirmed) => CallState::Closed {
                closed_at: Utc::now(),
                duration_secs: None,
            },
            (state, CallTransition::Failed { reason }) if !state.is_ended() => CallState::Failed {
                reason,
                at: Utc::now(),
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

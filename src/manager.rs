//! Call manager: registry of live sessions and the invite intake loop.
//!
//! The manager owns no session state. It validates invites, enforces the
//! concurrency limit, resolves glare, and spawns one task per session; from
//! then on everything for that session happens on its task.

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::{AuthError, Identity};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{EventBus, IncomingCall, MissedCall, MissedReason};
use crate::invite::{InviteNotification, InviteTransport};
use crate::media::PeerConnectionFactory;
use crate::session::{self, SessionDeps, SessionHandle, SessionIntent};
use crate::signaling::{BusyCause, SignalPayload, SignalingTransport};
use crate::state::{CallInfo, CallState};
use crate::types::{CallDirection, RejectReason, SessionId};

/// Which side of a glare pair yields.
enum GlareOutcome {
    /// The crossing invite loses the tie-break; ignore it.
    RemoteYields,
    /// Our own outgoing session loses; cancel it and ring the invite.
    LocalYields(SessionId),
}

pub struct CallManager {
    identity: Identity,
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport>,
    invites: Arc<dyn InviteTransport>,
    media: Arc<dyn PeerConnectionFactory>,
    event_bus: Arc<EventBus>,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl CallManager {
    pub fn new(
        identity: Identity,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
        invites: Arc<dyn InviteTransport>,
        media: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            config,
            signaling,
            invites,
            media,
            event_bus: Arc::new(EventBus::new()),
            sessions: DashMap::new(),
        })
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Invite intake loop; run this on its own task for the lifetime of the
    /// manager.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.invites.incoming().await;
        info!(
            target: "Call/Manager",
            "listening for call invites as {}", self.identity.subject
        );
        while let Some(invite) = rx.recv().await {
            self.handle_invite(invite).await;
        }
        info!(target: "Call/Manager", "invite stream closed");
    }

    /// Place an outgoing call. The returned session id identifies the call in
    /// subsequent intents and events.
    pub fn start_call(&self, callee_id: &str) -> Result<SessionId, CallError> {
        self.prune_ended();

        if self.identity.is_expired(Utc::now()) {
            return Err(CallError::Auth(AuthError::Expired));
        }
        if self.active_count() >= self.config.max_concurrent_calls {
            return Err(CallError::TooManyCalls);
        }

        let session_id = SessionId::generate();
        info!(
            target: "Call/Manager",
            "starting call {} to {}", session_id, callee_id
        );
        let info = CallInfo::new_outgoing(
            session_id.clone(),
            self.identity.subject.clone(),
            callee_id,
        );
        let handle = session::spawn(info, self.session_deps());
        self.sessions.insert(session_id.clone(), handle);
        Ok(session_id)
    }

    pub fn accept(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.send_intent(session_id, SessionIntent::Accept)
    }

    pub fn reject(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.send_intent(session_id, SessionIntent::Reject)
    }

    pub fn hangup(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.send_intent(session_id, SessionIntent::Hangup)
    }

    /// Watch a session's state. `None` for unknown ids.
    pub fn watch_state(&self, session_id: &SessionId) -> Option<watch::Receiver<CallState>> {
        self.sessions.get(session_id).map(|h| h.state.clone())
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            identity: self.identity.clone(),
            config: self.config.clone(),
            signaling: self.signaling.clone(),
            invites: self.invites.clone(),
            media: self.media.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    fn send_intent(&self, session_id: &SessionId, intent: SessionIntent) -> Result<(), CallError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
        handle
            .intents
            .send(intent)
            .map_err(|_| CallError::SessionGone(session_id.to_string()))
    }

    async fn handle_invite(&self, invite: InviteNotification) {
        debug!(
            target: "Call/Manager",
            "invite {} from {} for {}",
            invite.session_id, invite.caller_id, invite.callee_id
        );
        if invite.callee_id != self.identity.subject {
            debug!(target: "Call/Manager", "invite addressed to someone else, ignoring");
            return;
        }
        self.prune_ended();

        // Push delivery may duplicate; session id is the dedup key.
        if self.sessions.contains_key(&invite.session_id) {
            debug!(
                target: "Call/Manager",
                "duplicate invite {} ignored", invite.session_id
            );
            return;
        }
        if invite.is_expired(Utc::now()) {
            info!(
                target: "Call/Manager",
                "invite {} from {} expired before it was handled",
                invite.session_id, invite.caller_id
            );
            let _ = self.event_bus.missed_call.send(Arc::new(MissedCall {
                session_id: invite.session_id,
                caller_id: invite.caller_id,
                reason: MissedReason::Expired,
            }));
            return;
        }
        if self.identity.is_expired(Utc::now()) {
            warn!(
                target: "Call/Manager",
                "local identity expired, ignoring invite {}", invite.session_id
            );
            return;
        }

        match self.resolve_glare(&invite) {
            Some(GlareOutcome::RemoteYields) => {
                info!(
                    target: "Call/Manager",
                    "crossing invite {} from {} loses the tie-break, ignoring",
                    invite.session_id, invite.caller_id
                );
                return;
            }
            Some(GlareOutcome::LocalYields(local_id)) => {
                info!(
                    target: "Call/Manager",
                    "glare with {}: local session {} yields to {}",
                    invite.caller_id, local_id, invite.session_id
                );
                if let Some(handle) = self.sessions.get(&local_id) {
                    let _ = handle
                        .intents
                        .send(SessionIntent::Cancel(RejectReason::Glare));
                }
                // The surviving invite rings below.
            }
            None => {
                if self.active_count() >= self.config.max_concurrent_calls {
                    info!(
                        target: "Call/Manager",
                        "busy, turning away invite {} from {}",
                        invite.session_id, invite.caller_id
                    );
                    if let Err(e) = self
                        .signaling
                        .append(&invite.session_id, SignalPayload::Busy(BusyCause::InCall))
                        .await
                    {
                        warn!(
                            target: "Call/Manager",
                            "busy write for {} failed: {e}", invite.session_id
                        );
                    }
                    let _ = self.event_bus.missed_call.send(Arc::new(MissedCall {
                        session_id: invite.session_id,
                        caller_id: invite.caller_id,
                        reason: MissedReason::Busy,
                    }));
                    return;
                }
            }
        }

        let incoming = Arc::new(IncomingCall {
            session_id: invite.session_id.clone(),
            caller_id: invite.caller_id.clone(),
            expires_at: invite.expires_at(),
        });
        let info = CallInfo::new_incoming(&invite);
        let handle = session::spawn(info, self.session_deps());
        self.sessions.insert(invite.session_id, handle);
        let _ = self.event_bus.incoming_call.send(incoming);
    }

    /// A crossing invite from a peer we are currently inviting ourselves.
    /// The lexicographically smaller session id proceeds as the call; both
    /// devices resolve this independently from the same two ids.
    fn resolve_glare(&self, invite: &InviteNotification) -> Option<GlareOutcome> {
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if handle.direction == CallDirection::Outgoing
                && handle.peer_id == invite.caller_id
                && !handle.state.borrow().is_ended()
            {
                return Some(if invite.session_id < handle.session_id {
                    GlareOutcome::LocalYields(handle.session_id.clone())
                } else {
                    GlareOutcome::RemoteYields
                });
            }
        }
        None
    }

    fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().state.borrow().is_ended())
            .count()
    }

    fn prune_ended(&self) {
        self.sessions
            .retain(|_, handle| !handle.state.borrow().is_ended());
    }
}

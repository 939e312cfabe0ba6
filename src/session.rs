//! Per-session driver task.
//!
//! One task owns one session: every state transition for a session id runs on
//! this task, so transitions are serialized without locking. The task selects
//! over local intents, ordered signaling messages, media connection-state
//! changes, locally gathered ICE candidates, and the ring deadline. A local
//! hangup or TTL expiry preempts any in-progress wait, including the backoff
//! sleeps of a retried signaling write.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::auth::Identity;
use crate::config::CallConfig;
use crate::events::{CallStateUpdate, EventBus};
use crate::invite::{InviteNotification, InviteTransport};
use crate::media::{MediaError, PeerConnection, PeerConnectionFactory, PeerConnectionState};
use crate::signaling::{
    BusyCause, SignalPayload, SignalingChannel, SignalingMessage, SignalingTransport,
    TransportError,
};
use crate::state::{CallInfo, CallState, CallTransition};
use crate::types::{CallDirection, FailReason, RejectReason, SessionId};

/// Local intents routed to a session task.
#[derive(Debug, Clone)]
pub(crate) enum SessionIntent {
    Accept,
    Reject,
    Hangup,
    /// Self-cancel after losing the glare tie-break.
    Cancel(RejectReason),
}

impl SessionIntent {
    /// Whether this intent terminates the call attempt and may abandon an
    /// in-progress signaling write.
    fn interrupts_publish(&self) -> bool {
        matches!(self, Self::Hangup | Self::Reject | Self::Cancel(_))
    }
}

/// Registry entry for a running session.
pub(crate) struct SessionHandle {
    pub session_id: SessionId,
    pub peer_id: String,
    pub direction: CallDirection,
    pub intents: mpsc::UnboundedSender<SessionIntent>,
    pub state: watch::Receiver<CallState>,
}

/// Capabilities a session task needs, injected at spawn time.
pub(crate) struct SessionDeps {
    pub identity: Identity,
    pub config: CallConfig,
    pub signaling: Arc<dyn SignalingTransport>,
    pub invites: Arc<dyn InviteTransport>,
    pub media: Arc<dyn PeerConnectionFactory>,
    pub event_bus: Arc<EventBus>,
}

pub(crate) fn spawn(info: CallInfo, deps: SessionDeps) -> SessionHandle {
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(info.state.clone());
    let handle = SessionHandle {
        session_id: info.session_id.clone(),
        peer_id: info.peer_id().to_string(),
        direction: info.direction,
        intents: intent_tx,
        state: state_rx,
    };

    tokio::spawn(async move {
        let channel =
            SignalingChannel::open(deps.signaling.clone(), info.session_id.clone()).await;
        let runtime = SessionRuntime {
            info,
            identity: deps.identity,
            config: deps.config,
            invites: deps.invites,
            media: deps.media,
            event_bus: deps.event_bus,
            channel,
            intents: intent_rx,
            intents_closed: false,
            state_tx,
            pc: None,
            pc_state: None,
            local_candidates: None,
            remote_offer: None,
            accepted: false,
            remote_desc_applied: false,
            pending_candidates: Vec::new(),
            deferred_intent: None,
        };
        runtime.run().await;
    });

    handle
}

enum PublishOutcome {
    Published(u64),
    Preempted(SessionIntent),
    Exhausted(TransportError),
}

enum Wake {
    Intent(Option<SessionIntent>),
    Signal(Option<SignalingMessage>),
    Media(Option<PeerConnectionState>),
    LocalCandidate(Option<String>),
    Deadline,
}

struct SessionRuntime {
    info: CallInfo,
    identity: Identity,
    config: CallConfig,
    invites: Arc<dyn InviteTransport>,
    media: Arc<dyn PeerConnectionFactory>,
    event_bus: Arc<EventBus>,
    channel: SignalingChannel,
    intents: mpsc::UnboundedReceiver<SessionIntent>,
    intents_closed: bool,
    state_tx: watch::Sender<CallState>,
    pc: Option<Box<dyn PeerConnection>>,
    pc_state: Option<watch::Receiver<PeerConnectionState>>,
    local_candidates: Option<mpsc::Receiver<String>>,
    /// Offer held while Ringing; the invite and signaling channels race.
    remote_offer: Option<String>,
    accepted: bool,
    remote_desc_applied: bool,
    /// Remote candidates received before the remote description was applied.
    pending_candidates: Vec<String>,
    /// Intent that preempted a publish retry; handled on the next loop turn.
    deferred_intent: Option<SessionIntent>,
}

impl SessionRuntime {
    async fn run(mut self) {
        info!(
            target: "Call/Session",
            "session {} starting ({:?} call with {})",
            self.info.session_id,
            self.info.direction,
            self.info.peer_id()
        );

        if self.info.direction == CallDirection::Outgoing {
            self.setup_outgoing().await;
        }

        while !self.info.state.is_ended() {
            if let Some(intent) = self.deferred_intent.take() {
                self.handle_intent(intent).await;
                continue;
            }

            let deadline = self.current_deadline();
            let intents_open = !self.intents_closed;
            let wake = {
                let intents = &mut self.intents;
                let channel = &mut self.channel;
                let pc_state = &mut self.pc_state;
                let candidates = &mut self.local_candidates;
                tokio::select! {
                    intent = intents.recv(), if intents_open => Wake::Intent(intent),
                    msg = channel.recv() => Wake::Signal(msg),
                    state = next_media_state(pc_state) => Wake::Media(state),
                    cand = next_local_candidate(candidates) => Wake::LocalCandidate(cand),
                    _ = wait_deadline(deadline) => Wake::Deadline,
                }
            };

            match wake {
                Wake::Intent(Some(intent)) => self.handle_intent(intent).await,
                Wake::Intent(None) => {
                    debug!(
                        target: "Call/Session",
                        "session {}: manager gone, hanging up", self.info.session_id
                    );
                    self.intents_closed = true;
                    self.handle_intent(SessionIntent::Hangup).await;
                }
                Wake::Signal(Some(msg)) => self.handle_signal(msg).await,
                Wake::Signal(None) => {
                    warn!(
                        target: "Call/Session",
                        "session {}: signaling subscription lost", self.info.session_id
                    );
                    self.fail(FailReason::Network).await;
                }
                Wake::Media(Some(state)) => self.handle_media_state(state).await,
                Wake::Media(None) => self.pc_state = None,
                Wake::LocalCandidate(Some(candidate)) => self.publish_candidate(candidate).await,
                Wake::LocalCandidate(None) => self.local_candidates = None,
                Wake::Deadline => self.handle_deadline().await,
            }
        }

        self.teardown().await;
    }

    /// Caller setup: invite out first so the callee can start ringing while
    /// the offer is being written, then offer creation and publish.
    async fn setup_outgoing(&mut self) {
        let invite = InviteNotification::new(
            self.info.caller_id.clone(),
            self.info.callee_id.clone(),
            self.info.session_id.clone(),
            Utc::now(),
            self.config.invite_ttl_secs,
        );
        if let Err(e) = self.invites.send_invite(&invite).await {
            warn!(
                target: "Call/Session",
                "session {}: invite delivery failed ({e}); relying on the signaling channel",
                self.info.session_id
            );
        }

        let pc = match self.media.create(&self.config.ice_servers).await {
            Ok(pc) => pc,
            Err(e) => {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                self.fail(FailReason::Media).await;
                return;
            }
        };
        self.pc_state = Some(pc.connection_state());
        self.local_candidates = pc.take_local_candidates();

        match pc.create_offer().await {
            Ok(offer) => {
                self.pc = Some(pc);
                match self.publish_or_preempt(SignalPayload::Offer(offer)).await {
                    PublishOutcome::Published(_) => {
                        self.transition(CallTransition::InviteSent);
                    }
                    PublishOutcome::Preempted(intent) => {
                        self.deferred_intent = Some(intent);
                    }
                    PublishOutcome::Exhausted(_) => self.fail(FailReason::Network).await,
                }
            }
            Err(e) => {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                self.pc = Some(pc);
                self.fail(FailReason::Media).await;
            }
        }
    }

    async fn handle_intent(&mut self, intent: SessionIntent) {
        debug!(
            target: "Call/Session",
            "session {}: intent {:?} in state {:?}",
            self.info.session_id, intent, self.info.state
        );
        match intent {
            SessionIntent::Accept => self.handle_accept().await,
            SessionIntent::Reject => self.handle_reject().await,
            SessionIntent::Hangup => self.handle_hangup().await,
            SessionIntent::Cancel(reason) => self.handle_cancel(reason).await,
        }
    }

    async fn handle_accept(&mut self) {
        if !self.info.state.can_accept() {
            warn!(
                target: "Call/Session",
                "session {}: accept ignored in state {:?}",
                self.info.session_id, self.info.state
            );
            return;
        }
        if self.identity.is_expired(Utc::now()) {
            warn!(
                target: "Call/Session",
                "session {}: local identity expired", self.info.session_id
            );
            self.fail(FailReason::Auth).await;
            return;
        }
        self.accepted = true;
        if self.remote_offer.is_some() {
            self.begin_answer().await;
        } else {
            debug!(
                target: "Call/Session",
                "session {}: accepted before the offer arrived, waiting for it",
                self.info.session_id
            );
        }
    }

    async fn handle_reject(&mut self) {
        if self.info.state.is_ringing() {
            self.decline_ringing().await;
        } else {
            // Rejecting an outgoing attempt is just a hangup.
            self.handle_hangup().await;
        }
    }

    async fn decline_ringing(&mut self) {
        self.write_best_effort(SignalPayload::Busy(BusyCause::Declined))
            .await;
        self.transition(CallTransition::LocalRejected {
            reason: RejectReason::LocalDeclined,
        });
    }

    async fn handle_hangup(&mut self) {
        match self.info.state {
            CallState::Ringing { .. } => {
                // Hanging up a ringing call declines it.
                self.decline_ringing().await;
            }
            CallState::Idle | CallState::Inviting { .. } => {
                self.write_best_effort(SignalPayload::Hangup).await;
                self.transition(CallTransition::EarlyHangup);
            }
            CallState::Negotiating { .. } | CallState::Connected { .. } => {
                if self.transition(CallTransition::HangupInitiated) {
                    self.write_best_effort(SignalPayload::Hangup).await;
                    self.finish_ending().await;
                }
            }
            _ => debug!(
                target: "Call/Session",
                "session {}: hangup ignored in state {:?}",
                self.info.session_id, self.info.state
            ),
        }
    }

    async fn handle_cancel(&mut self, reason: RejectReason) {
        match self.info.state {
            CallState::Idle | CallState::Inviting { .. } => {
                self.write_best_effort(SignalPayload::Hangup).await;
                self.transition(CallTransition::LocalRejected { reason });
            }
            _ => debug!(
                target: "Call/Session",
                "session {}: cancel ignored in state {:?}",
                self.info.session_id, self.info.state
            ),
        }
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        debug!(
            target: "Call/Session",
            "session {}: received {} (seq {})",
            self.info.session_id,
            msg.payload.kind(),
            msg.seq
        );
        match msg.payload {
            SignalPayload::Offer(sdp) => {
                if self.info.state.is_ringing() && self.remote_offer.is_none() {
                    self.remote_offer = Some(sdp);
                    if self.accepted {
                        self.begin_answer().await;
                    }
                } else {
                    debug!(
                        target: "Call/Session",
                        "session {}: redundant offer ignored", self.info.session_id
                    );
                }
            }
            SignalPayload::Answer(sdp) => {
                if matches!(self.info.state, CallState::Inviting { .. }) {
                    let applied = match self.pc.as_ref() {
                        Some(pc) => pc.set_remote_description(&sdp).await,
                        None => Err(MediaError::InvalidState("no peer connection".into())),
                    };
                    match applied {
                        Ok(()) => {
                            self.remote_desc_applied = true;
                            self.transition(CallTransition::AnswerReceived);
                            self.replay_candidates().await;
                        }
                        Err(e) => {
                            warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                            self.fail(FailReason::Media).await;
                        }
                    }
                } else {
                    debug!(
                        target: "Call/Session",
                        "session {}: redundant answer ignored", self.info.session_id
                    );
                }
            }
            SignalPayload::IceCandidate(candidate) => {
                if self.remote_desc_applied && self.pc.is_some() {
                    let added = match self.pc.as_ref() {
                        Some(pc) => pc.add_ice_candidate(&candidate).await,
                        None => Ok(()),
                    };
                    if let Err(e) = added {
                        warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                        self.fail(FailReason::Media).await;
                    }
                } else {
                    debug!(
                        target: "Call/Session",
                        "session {}: buffering candidate until the remote description is applied",
                        self.info.session_id
                    );
                    self.pending_candidates.push(candidate);
                }
            }
            SignalPayload::Hangup => self.handle_remote_hangup().await,
            SignalPayload::Busy(cause) => {
                if matches!(self.info.state, CallState::Inviting { .. }) {
                    let reason = match cause {
                        BusyCause::InCall => RejectReason::RemoteBusy,
                        BusyCause::Declined => RejectReason::RemoteRejected,
                    };
                    self.transition(CallTransition::RemoteDeclined { reason });
                } else {
                    debug!(
                        target: "Call/Session",
                        "session {}: busy ignored in state {:?}",
                        self.info.session_id, self.info.state
                    );
                }
            }
        }
    }

    async fn handle_remote_hangup(&mut self) {
        match self.info.state {
            CallState::Idle | CallState::Inviting { .. } | CallState::Ringing { .. } => {
                self.transition(CallTransition::EarlyHangup);
            }
            CallState::Negotiating { .. } | CallState::Connected { .. } => {
                if self.transition(CallTransition::HangupInitiated) {
                    // The peer wrote the hangup; no echo back.
                    self.finish_ending().await;
                }
            }
            _ => debug!(
                target: "Call/Session",
                "session {}: remote hangup ignored in state {:?}",
                self.info.session_id, self.info.state
            ),
        }
    }

    async fn handle_media_state(&mut self, state: PeerConnectionState) {
        debug!(
            target: "Call/Session",
            "session {}: peer connection {:?}", self.info.session_id, state
        );
        match state {
            PeerConnectionState::Connected => {
                if matches!(self.info.state, CallState::Negotiating { .. }) {
                    self.transition(CallTransition::MediaConnected);
                    info!(
                        target: "Call/Session",
                        "session {} connected", self.info.session_id
                    );
                }
            }
            PeerConnectionState::Disconnected => {
                if self.info.state.is_connected() {
                    info!(
                        target: "Call/Session",
                        "session {}: peer connection lost", self.info.session_id
                    );
                    if self.transition(CallTransition::HangupInitiated) {
                        self.write_best_effort(SignalPayload::Hangup).await;
                        self.finish_ending().await;
                    }
                }
            }
            PeerConnectionState::Failed => {
                warn!(
                    target: "Call/Session",
                    "session {}: media engine reported failure", self.info.session_id
                );
                self.fail(FailReason::Media).await;
            }
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Closed => {}
        }
    }

    async fn handle_deadline(&mut self) {
        match self.info.state {
            CallState::Ringing { .. } => {
                info!(
                    target: "Call/Session",
                    "session {}: ring window expired", self.info.session_id
                );
                self.write_best_effort(SignalPayload::Hangup).await;
                self.transition(CallTransition::LocalRejected {
                    reason: RejectReason::InviteExpired,
                });
            }
            CallState::Inviting { .. } => {
                info!(
                    target: "Call/Session",
                    "session {}: no answer before ring timeout", self.info.session_id
                );
                self.write_best_effort(SignalPayload::Hangup).await;
                self.transition(CallTransition::LocalRejected {
                    reason: RejectReason::InviteExpired,
                });
            }
            _ => {}
        }
    }

    /// Callee answer path: requires a stored offer and the user's accept.
    async fn begin_answer(&mut self) {
        let Some(offer) = self.remote_offer.clone() else {
            return;
        };
        if !self.transition(CallTransition::LocalAccepted) {
            return;
        }

        let pc = match self.media.create(&self.config.ice_servers).await {
            Ok(pc) => pc,
            Err(e) => {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                self.fail(FailReason::Media).await;
                return;
            }
        };
        self.pc_state = Some(pc.connection_state());
        self.local_candidates = pc.take_local_candidates();

        match pc.create_answer(&offer).await {
            Ok(answer) => {
                self.pc = Some(pc);
                self.remote_desc_applied = true;
                self.replay_candidates().await;
                if self.info.state.is_ended() {
                    return;
                }
                match self.publish_or_preempt(SignalPayload::Answer(answer)).await {
                    PublishOutcome::Published(_) => {}
                    PublishOutcome::Preempted(intent) => {
                        self.deferred_intent = Some(intent);
                    }
                    PublishOutcome::Exhausted(_) => self.fail(FailReason::Network).await,
                }
            }
            Err(e) => {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                self.pc = Some(pc);
                self.fail(FailReason::Media).await;
            }
        }
    }

    /// Flush remote candidates buffered before the remote description existed.
    async fn replay_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            target: "Call/Session",
            "session {}: replaying {} buffered candidates",
            self.info.session_id,
            self.pending_candidates.len()
        );
        for candidate in std::mem::take(&mut self.pending_candidates) {
            let added = match self.pc.as_ref() {
                Some(pc) => pc.add_ice_candidate(&candidate).await,
                None => return,
            };
            if let Err(e) = added {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                self.fail(FailReason::Media).await;
                return;
            }
        }
    }

    async fn publish_candidate(&mut self, candidate: String) {
        if self.info.state.is_ended() {
            return;
        }
        match self
            .publish_or_preempt(SignalPayload::IceCandidate(candidate))
            .await
        {
            PublishOutcome::Published(_) => {}
            PublishOutcome::Preempted(intent) => self.deferred_intent = Some(intent),
            PublishOutcome::Exhausted(_) => self.fail(FailReason::Network).await,
        }
    }

    /// Negotiation-path write with bounded exponential backoff. A local
    /// intent arriving during a backoff sleep abandons the write.
    async fn publish_or_preempt(&mut self, payload: SignalPayload) -> PublishOutcome {
        let attempts = self.config.publish_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.channel.append(payload.clone()).await {
                Ok(seq) => return PublishOutcome::Published(seq),
                Err(e) => {
                    if attempt >= attempts {
                        warn!(
                            target: "Call/Session",
                            "session {}: {} write failed after {attempt} attempts: {e}",
                            self.info.session_id,
                            payload.kind()
                        );
                        return PublishOutcome::Exhausted(e);
                    }
                    let backoff = self.config.publish_backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        target: "Call/Session",
                        "session {}: {} write attempt {attempt} failed ({e}), retrying in {:?}",
                        self.info.session_id,
                        payload.kind(),
                        backoff
                    );
                    if self.intents_closed {
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        intent = self.intents.recv() => match intent {
                            Some(intent) if intent.interrupts_publish() => {
                                return PublishOutcome::Preempted(intent);
                            }
                            Some(intent) => {
                                // A non-terminal intent must not abandon the
                                // write; park it until the retry settles.
                                debug!(
                                    target: "Call/Session",
                                    "session {}: deferring {:?} until the {} write settles",
                                    self.info.session_id,
                                    intent,
                                    payload.kind()
                                );
                                self.deferred_intent = Some(intent);
                                tokio::time::sleep(backoff).await;
                            }
                            None => {
                                self.intents_closed = true;
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Terminal-path write: single attempt, failure only logged. The bounded
    /// retry policy covers the negotiation path; a session that is already
    /// terminating does not fail over an unsent courtesy message.
    async fn write_best_effort(&mut self, payload: SignalPayload) {
        let kind = payload.kind();
        if let Err(e) = self.channel.append(payload).await {
            warn!(
                target: "Call/Session",
                "session {}: best-effort {kind} write failed: {e}", self.info.session_id
            );
        }
    }

    async fn finish_ending(&mut self) {
        self.close_peer_connection().await;
        self.transition(CallTransition::CloseConfirmed);
    }

    async fn close_peer_connection(&mut self) {
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                warn!(
                    target: "Call/Session",
                    "session {}: peer connection close failed: {e}", self.info.session_id
                );
            }
            self.pc_state = None;
            self.local_candidates = None;
        }
    }

    /// Terminal failure. The peer learns of it through a best-effort hangup
    /// so it is not left waiting out its own timers.
    async fn fail(&mut self, reason: FailReason) {
        if !self.info.state.is_ended() {
            self.write_best_effort(SignalPayload::Hangup).await;
        }
        self.transition(CallTransition::Failed { reason });
    }

    /// Single exit point: the handle is closed at most once, and a `Failed`
    /// session confirms into `Closed` after cleanup.
    async fn teardown(&mut self) {
        self.close_peer_connection().await;
        if matches!(self.info.state, CallState::Failed { .. }) {
            self.transition(CallTransition::CloseConfirmed);
        }
        info!(
            target: "Call/Session",
            "session {} finished in state {:?}", self.info.session_id, self.info.state
        );
    }

    fn transition(&mut self, transition: CallTransition) -> bool {
        match self.info.apply_transition(transition) {
            Ok(()) => {
                let _ = self.state_tx.send(self.info.state.clone());
                let _ = self.event_bus.call_state.send(Arc::new(CallStateUpdate {
                    session_id: self.info.session_id.clone(),
                    peer_id: self.info.peer_id().to_string(),
                    direction: self.info.direction,
                    state: self.info.state.clone(),
                }));
                true
            }
            Err(e) => {
                warn!(target: "Call/Session", "session {}: {e}", self.info.session_id);
                false
            }
        }
    }

    fn current_deadline(&self) -> Option<Instant> {
        let until = match &self.info.state {
            CallState::Ringing { expires_at, .. } => *expires_at,
            CallState::Inviting { invited_at } => {
                *invited_at + chrono::Duration::seconds(self.config.ring_timeout_secs as i64)
            }
            _ => return None,
        };
        let remaining = (until - Utc::now()).num_milliseconds().max(0) as u64;
        Some(Instant::now() + std::time::Duration::from_millis(remaining))
    }
}

async fn next_media_state(
    rx: &mut Option<watch::Receiver<PeerConnectionState>>,
) -> Option<PeerConnectionState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn next_local_candidate(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

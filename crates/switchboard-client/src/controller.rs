//! Client half of the offer/answer/candidate exchange.
//!
//! The controller owns one transport engine and at most one active call. It
//! never talks to the relay directly: outbound frames go into a channel that
//! a [`crate::SignalingConnection`] (or a test) drains.

use std::collections::HashMap;

use switchboard_core::{
    CallEndReason, ClientMessage, EndpointId, NetworkCandidate, SdpKind, ServerMessage,
    SignalDescription, SignalingError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::candidate_queue::{CandidateQueue, Enqueued};
use crate::engine::{EngineError, EngineEvent, TrackInfo, TransportEngine};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("already in a call with {0}")]
    Busy(EndpointId),
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("no active call")]
    NoActiveCall,
    #[error("relay channel closed")]
    RelayClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Offer sent, waiting for the answer.
    Offering,
    Established,
}

/// What the controller reports to the user-facing layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Registered(EndpointId),
    PeersChanged(Vec<EndpointId>),
    IncomingCall { from: EndpointId },
    CallConnected { peer: EndpointId },
    CallEnded {
        peer: EndpointId,
        reason: CallEndReason,
    },
    CallFailed {
        peer: EndpointId,
        error: ControllerError,
    },
    RemoteTrack(TrackInfo),
    /// The relay refused a frame, e.g. a registration under a taken identity.
    RelayError(String),
}

/// User intents fed into [`NegotiationController::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Call(EndpointId),
    Answer,
    Decline,
    HangUp,
}

struct ActiveCall {
    peer: EndpointId,
    role: CallRole,
    phase: CallPhase,
    queue: CandidateQueue,
}

struct IncomingOffer {
    from: EndpointId,
    signal: SignalDescription,
}

pub struct NegotiationController<E> {
    engine: E,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    local_id: Option<EndpointId>,
    peers: Vec<EndpointId>,
    call: Option<ActiveCall>,
    incoming: Option<IncomingOffer>,
    // Candidates from peers we have no call with yet, e.g. a caller whose
    // offer is still waiting for the user to answer.
    early: HashMap<EndpointId, CandidateQueue>,
}

impl<E: TransportEngine> NegotiationController<E> {
    pub fn new(
        engine: E,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                engine,
                outbound,
                events,
                local_id: None,
                peers: Vec::new(),
                call: None,
                incoming: None,
                early: HashMap::new(),
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> Option<&EndpointId> {
        self.local_id.as_ref()
    }

    /// Other endpoints from the latest `userList`.
    pub fn peers(&self) -> &[EndpointId] {
        &self.peers
    }

    pub fn active_peer(&self) -> Option<&EndpointId> {
        self.call.as_ref().map(|call| &call.peer)
    }

    pub fn call_phase(&self) -> Option<CallPhase> {
        self.call.as_ref().map(|call| call.phase)
    }

    pub fn call_role(&self) -> Option<CallRole> {
        self.call.as_ref().map(|call| call.role)
    }

    pub fn pending_caller(&self) -> Option<&EndpointId> {
        self.incoming.as_ref().map(|offer| &offer.from)
    }

    /// Candidates held for `peer` that have not reached the engine yet.
    pub fn buffered_candidates(&self, peer: &EndpointId) -> usize {
        match &self.call {
            Some(call) if &call.peer == peer => call.queue.len(),
            _ => self.early.get(peer).map(CandidateQueue::len).unwrap_or(0),
        }
    }

    pub fn register(&self, requested: Option<EndpointId>) -> Result<(), ControllerError> {
        self.send(ClientMessage::Register { id: requested })
    }

    /// Places a call. Any failure before the offer leaves the controller
    /// idle and sends nothing to the relay.
    pub async fn start_call(&mut self, target: EndpointId) -> Result<(), ControllerError> {
        if let Some(call) = &self.call {
            return Err(ControllerError::Busy(call.peer.clone()));
        }

        self.engine.acquire_local_media().await?;
        let offer = self
            .engine
            .create_local_description(SdpKind::Offer)
            .await?;
        self.engine.set_local_description(offer.clone()).await?;

        let queue = self.early.remove(&target).unwrap_or_default();
        self.call = Some(ActiveCall {
            peer: target.clone(),
            role: CallRole::Caller,
            phase: CallPhase::Offering,
            queue,
        });
        info!(target = %target, "sending offer");
        if let Err(err) = self.send(ClientMessage::CallUser {
            target,
            signal: offer,
        }) {
            self.call = None;
            self.engine.close().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn answer_call(&mut self) -> Result<(), ControllerError> {
        if let Some(call) = &self.call {
            return Err(ControllerError::Busy(call.peer.clone()));
        }
        let IncomingOffer { from, signal } =
            self.incoming.take().ok_or(ControllerError::NoIncomingCall)?;

        if let Err(err) = self.engine.acquire_local_media().await {
            self.early.remove(&from);
            return Err(err.into());
        }
        if let Err(err) = self.engine.set_remote_description(signal).await {
            self.early.remove(&from);
            self.engine.close().await;
            let error = ControllerError::from(err);
            self.emit(ControllerEvent::CallFailed {
                peer: from,
                error: error.clone(),
            });
            return Err(error);
        }

        self.call = Some(ActiveCall {
            peer: from.clone(),
            role: CallRole::Callee,
            phase: CallPhase::Offering,
            queue: self.early.remove(&from).unwrap_or_default(),
        });
        self.drain_queue().await?;

        let answer = match self.engine.create_local_description(SdpKind::Answer).await {
            Ok(answer) => answer,
            Err(err) => return Err(self.abort_call(err.into()).await),
        };
        if let Err(err) = self.engine.set_local_description(answer.clone()).await {
            return Err(self.abort_call(err.into()).await);
        }

        self.send(ClientMessage::AnswerCall {
            target: from.clone(),
            signal: answer,
        })?;
        if let Some(call) = self.call.as_mut() {
            call.phase = CallPhase::Established;
        }
        info!(peer = %from, "answer sent");
        self.emit(ControllerEvent::CallConnected { peer: from });
        Ok(())
    }

    pub fn decline_call(&mut self) -> Result<(), ControllerError> {
        let offer = self.incoming.take().ok_or(ControllerError::NoIncomingCall)?;
        self.early.remove(&offer.from);
        self.send(ClientMessage::EndCall { target: offer.from })
    }

    pub async fn hang_up(&mut self) -> Result<(), ControllerError> {
        let call = self.call.take().ok_or(ControllerError::NoActiveCall)?;
        self.engine.close().await;
        self.emit(ControllerEvent::CallEnded {
            peer: call.peer.clone(),
            reason: CallEndReason::HungUp,
        });
        self.send(ClientMessage::EndCall { target: call.peer })
    }

    pub async fn handle_server_message(
        &mut self,
        message: ServerMessage,
    ) -> Result<(), ControllerError> {
        match message {
            ServerMessage::Registered { id } => {
                info!(id = %id, "registered with relay");
                self.local_id = Some(id.clone());
                self.emit(ControllerEvent::Registered(id));
            }
            ServerMessage::UserList { users } => {
                self.early.retain(|peer, _| users.contains(peer));
                self.peers = users
                    .into_iter()
                    .filter(|id| Some(id) != self.local_id.as_ref())
                    .collect();
                self.emit(ControllerEvent::PeersChanged(self.peers.clone()));
            }
            ServerMessage::CallIncoming { from, signal } => {
                if !signal.is_offer() {
                    warn!(
                        from = %from,
                        kind = %signal.kind,
                        "ignoring incoming call without an offer"
                    );
                    return Ok(());
                }
                debug!(from = %from, "incoming call");
                self.incoming = Some(IncomingOffer {
                    from: from.clone(),
                    signal,
                });
                self.emit(ControllerEvent::IncomingCall { from });
            }
            ServerMessage::CallAccepted { from, signal } => {
                self.on_call_accepted(from, signal).await?;
            }
            ServerMessage::NewIceCandidate { from, candidate } => {
                self.on_remote_candidate(from, candidate).await?;
            }
            ServerMessage::CallFailed { target, reason } => {
                debug!(target = %target, ?reason, "relay refused call");
                if self.take_call_with(&target).await {
                    self.emit(ControllerEvent::CallFailed {
                        peer: target.clone(),
                        error: SignalingError::PeerUnreachable(target).into(),
                    });
                }
            }
            ServerMessage::CallTimeout { target } => {
                if self.take_call_with(&target).await {
                    self.emit(ControllerEvent::CallEnded {
                        peer: target,
                        reason: CallEndReason::TimedOut,
                    });
                }
            }
            ServerMessage::CallEnded { peer, reason } => {
                self.early.remove(&peer);
                let was_pending = self
                    .incoming
                    .as_ref()
                    .is_some_and(|offer| offer.from == peer);
                if was_pending {
                    self.incoming = None;
                }
                if self.take_call_with(&peer).await || was_pending {
                    self.emit(ControllerEvent::CallEnded { peer, reason });
                }
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => {
                warn!(%message, "relay reported an error");
                self.emit(ControllerEvent::RelayError(message));
            }
        }
        Ok(())
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), ControllerError> {
        match event {
            EngineEvent::LocalCandidate(candidate) => match &self.call {
                Some(call) => self.send(ClientMessage::SendCandidate {
                    target: call.peer.clone(),
                    candidate,
                })?,
                None => debug!("dropping local candidate with no call in progress"),
            },
            EngineEvent::RemoteTrack(track) => self.emit(ControllerEvent::RemoteTrack(track)),
        }
        Ok(())
    }

    pub async fn handle_command(&mut self, command: CallCommand) -> Result<(), ControllerError> {
        match command {
            CallCommand::Call(target) => self.start_call(target).await,
            CallCommand::Answer => self.answer_call().await,
            CallCommand::Decline => self.decline_call(),
            CallCommand::HangUp => self.hang_up().await,
        }
    }

    /// Drives the controller until `shutdown` fires or the relay channel
    /// closes. Either way an active call is torn down locally.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    if self.call.is_some() {
                        let _ = self.hang_up().await;
                    }
                    break;
                }
                message = inbound.recv() => match message {
                    Some(message) => self.handle_server_message(message).await,
                    None => {
                        self.relay_lost().await;
                        break;
                    }
                },
                Some(event) = engine_events.recv() => self.handle_engine_event(event).await,
                Some(command) = commands.recv() => self.handle_command(command).await,
            };
            if let Err(err) = outcome {
                warn!(error = %err, "negotiation step failed");
            }
        }
        debug!("negotiation controller stopped");
    }

    async fn on_call_accepted(
        &mut self,
        from: EndpointId,
        signal: SignalDescription,
    ) -> Result<(), ControllerError> {
        let awaiting = matches!(
            &self.call,
            Some(call)
                if call.peer == from
                    && call.phase == CallPhase::Offering
                    && call.role == CallRole::Caller
        );
        if !awaiting || !signal.is_answer() {
            warn!(from = %from, "ignoring answer that matches no outstanding offer");
            return Ok(());
        }

        if let Err(err) = self.engine.set_remote_description(signal).await {
            return Err(self.abort_call(err.into()).await);
        }
        self.drain_queue().await?;
        if let Some(call) = self.call.as_mut() {
            call.phase = CallPhase::Established;
        }
        info!(peer = %from, "call established");
        self.emit(ControllerEvent::CallConnected { peer: from });
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        from: EndpointId,
        candidate: NetworkCandidate,
    ) -> Result<(), ControllerError> {
        let outcome = match self.call.as_mut() {
            Some(call) if call.peer == from => call.queue.enqueue(candidate),
            _ => self.early.entry(from.clone()).or_default().enqueue(candidate),
        };
        match outcome {
            Enqueued::Deliver(candidate) => {
                if let Err(err) = self.engine.add_remote_candidate(candidate).await {
                    return Err(self.abort_call(err.into()).await);
                }
            }
            Enqueued::Buffered => debug!(from = %from, "buffered remote candidate"),
        }
        Ok(())
    }

    /// Remote description is now set: hand every buffered candidate to the
    /// engine in arrival order.
    async fn drain_queue(&mut self) -> Result<(), ControllerError> {
        let flushed = match self.call.as_mut() {
            Some(call) => call.queue.set_remote_description_ready(),
            None => return Ok(()),
        };
        if !flushed.is_empty() {
            debug!(count = flushed.len(), "flushing buffered candidates");
        }
        for candidate in flushed {
            if let Err(err) = self.engine.add_remote_candidate(candidate).await {
                return Err(self.abort_call(err.into()).await);
            }
        }
        Ok(())
    }

    /// Drops the local call after an engine failure. The peer is not told.
    async fn abort_call(&mut self, error: ControllerError) -> ControllerError {
        if let Some(call) = self.call.take() {
            warn!(peer = %call.peer, error = %error, "aborting call");
            self.engine.close().await;
            self.emit(ControllerEvent::CallFailed {
                peer: call.peer,
                error: error.clone(),
            });
        }
        error
    }

    async fn take_call_with(&mut self, peer: &EndpointId) -> bool {
        match &self.call {
            Some(call) if &call.peer == peer => {
                self.call = None;
                self.engine.close().await;
                true
            }
            _ => false,
        }
    }

    async fn relay_lost(&mut self) {
        warn!("relay channel closed");
        if let Some(call) = self.call.take() {
            self.engine.close().await;
            self.emit(ControllerEvent::CallEnded {
                peer: call.peer,
                reason: CallEndReason::PeerDisconnected,
            });
        }
        self.incoming = None;
        self.early.clear();
    }

    fn send(&self, message: ClientMessage) -> Result<(), ControllerError> {
        self.outbound
            .send(message)
            .map_err(|_| ControllerError::RelayClosed)
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;

    struct Harness {
        controller: NegotiationController<RecordingEngine>,
        engine: RecordingEngine,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<ControllerEvent>,
    }

    fn harness(label: &str) -> Harness {
        let (engine, engine_events) = RecordingEngine::new(label);
        let (tx, outbound) = mpsc::unbounded_channel();
        let (controller, events) = NegotiationController::new(engine.clone(), tx);
        Harness {
            controller,
            engine,
            engine_events,
            outbound,
            events,
        }
    }

    fn candidate(n: usize) -> NetworkCandidate {
        NetworkCandidate::new(format!("candidate:{n} 1 udp 1 192.0.2.{n} 9 typ host"))
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn caller_buffers_candidates_until_answer() {
        let mut h = harness("alice");
        let bob = EndpointId::from("bob");

        h.controller.start_call(bob.clone()).await.unwrap();
        let sent = drain(&mut h.outbound);
        assert!(matches!(
            &sent[..],
            [ClientMessage::CallUser { target, signal }] if target == &bob && signal.is_offer()
        ));
        assert_eq!(h.controller.call_phase(), Some(CallPhase::Offering));

        h.controller
            .handle_server_message(ServerMessage::NewIceCandidate {
                from: bob.clone(),
                candidate: candidate(1),
            })
            .await
            .unwrap();
        assert!(h.engine.applied_candidates().is_empty());
        assert_eq!(h.controller.buffered_candidates(&bob), 1);

        h.controller
            .handle_server_message(ServerMessage::CallAccepted {
                from: bob.clone(),
                signal: SignalDescription::answer("v=0\r\no=bob 1 1 IN IP4 127.0.0.1\r\n"),
            })
            .await
            .unwrap();
        h.controller
            .handle_server_message(ServerMessage::NewIceCandidate {
                from: bob.clone(),
                candidate: candidate(2),
            })
            .await
            .unwrap();

        assert_eq!(h.engine.applied_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(h.controller.call_phase(), Some(CallPhase::Established));
        assert!(drain(&mut h.events)
            .contains(&ControllerEvent::CallConnected { peer: bob.clone() }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn callee_adopts_candidates_received_before_answering() {
        let mut h = harness("bob");
        let alice = EndpointId::from("alice");

        h.controller
            .handle_server_message(ServerMessage::CallIncoming {
                from: alice.clone(),
                signal: SignalDescription::offer("v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\n"),
            })
            .await
            .unwrap();
        for n in 0..3 {
            h.controller
                .handle_server_message(ServerMessage::NewIceCandidate {
                    from: alice.clone(),
                    candidate: candidate(n),
                })
                .await
                .unwrap();
        }
        assert_eq!(h.controller.buffered_candidates(&alice), 3);
        assert!(h.engine.applied_candidates().is_empty());

        h.controller.answer_call().await.unwrap();

        assert_eq!(
            h.engine.applied_candidates(),
            vec![candidate(0), candidate(1), candidate(2)]
        );
        let sent = drain(&mut h.outbound);
        assert!(matches!(
            &sent[..],
            [ClientMessage::AnswerCall { target, signal }] if target == &alice && signal.is_answer()
        ));
        assert_eq!(h.controller.call_role(), Some(CallRole::Callee));
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_errors_reach_the_event_stream() {
        let mut h = harness("alice");
        h.controller
            .handle_server_message(ServerMessage::Error {
                message: "alice is already registered".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            drain(&mut h.events),
            vec![ControllerEvent::RelayError(
                "alice is already registered".into()
            )]
        );
        assert!(h.controller.local_id().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_offer_creation_sends_nothing() {
        let mut h = harness("alice");
        h.engine.fail_descriptions();

        let err = h
            .controller
            .start_call(EndpointId::from("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Engine(EngineError::CapabilityDenied(_))));
        assert!(drain(&mut h.outbound).is_empty());
        assert!(h.controller.active_peer().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_media_keeps_incoming_call_unanswered() {
        let mut h = harness("bob");
        h.engine.deny_media();
        h.controller
            .handle_server_message(ServerMessage::CallIncoming {
                from: EndpointId::from("alice"),
                signal: SignalDescription::offer("v=0\r\n"),
            })
            .await
            .unwrap();

        assert!(h.controller.answer_call().await.is_err());
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_answer_aborts_locally() {
        let mut h = harness("alice");
        let bob = EndpointId::from("bob");
        h.controller.start_call(bob.clone()).await.unwrap();
        drain(&mut h.outbound);

        let err = h
            .controller
            .handle_server_message(ServerMessage::CallAccepted {
                from: bob.clone(),
                signal: SignalDescription::answer("garbage"),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Engine(EngineError::InvalidDescription(_))
        ));
        assert!(h.controller.active_peer().is_none());
        // the peer is never told about a local failure
        assert!(drain(&mut h.outbound).is_empty());
        assert!(drain(&mut h.events)
            .iter()
            .any(|event| {
                matches!(event, ControllerEvent::CallFailed { peer, .. } if peer == &bob)
            }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_candidates_follow_the_active_peer() {
        let mut h = harness("alice");
        h.engine.discover_candidate(candidate(7));
        let early = h.engine_events.recv().await.unwrap();
        h.controller.handle_engine_event(early).await.unwrap();
        assert!(drain(&mut h.outbound).is_empty());

        let bob = EndpointId::from("bob");
        h.controller.start_call(bob.clone()).await.unwrap();
        drain(&mut h.outbound);
        h.engine.discover_candidate(candidate(8));
        let event = h.engine_events.recv().await.unwrap();
        h.controller.handle_engine_event(event).await.unwrap();

        assert_eq!(
            drain(&mut h.outbound),
            vec![ClientMessage::SendCandidate {
                target: bob,
                candidate: candidate(8),
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_notices_end_the_call() {
        let mut h = harness("alice");
        let bob = EndpointId::from("bob");
        h.controller.start_call(bob.clone()).await.unwrap();

        h.controller
            .handle_server_message(ServerMessage::CallTimeout {
                target: bob.clone(),
            })
            .await
            .unwrap();
        assert!(h.controller.active_peer().is_none());
        assert_eq!(h.engine.sessions_closed(), 1);
        assert!(drain(&mut h.events).contains(&ControllerEvent::CallEnded {
            peer: bob,
            reason: CallEndReason::TimedOut,
        }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn user_list_excludes_self() {
        let mut h = harness("alice");
        let me = EndpointId::from("alice");
        h.controller
            .handle_server_message(ServerMessage::Registered { id: me.clone() })
            .await
            .unwrap();
        h.controller
            .handle_server_message(ServerMessage::UserList {
                users: vec![me, EndpointId::from("bob"), EndpointId::from("carol")],
            })
            .await
            .unwrap();
        assert_eq!(
            h.controller.peers(),
            &[EndpointId::from("bob"), EndpointId::from("carol")]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_hangs_up_active_call() {
        let h = harness("alice");
        let Harness {
            controller,
            engine,
            engine_events,
            mut outbound,
            ..
        } = h;
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(controller.run(inbound_rx, engine_events, command_rx, shutdown_rx));

        command_tx
            .send(CallCommand::Call(EndpointId::from("bob")))
            .unwrap();
        let first = outbound.recv().await.unwrap();
        assert!(matches!(first, ClientMessage::CallUser { .. }));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(
            outbound.recv().await,
            Some(ClientMessage::EndCall {
                target: EndpointId::from("bob")
            })
        );
        assert_eq!(engine.sessions_closed(), 1);
    }
}

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use switchboard_core::{
    CallEndReason, CallFailure, ClientMessage, EndpointId, NetworkCandidate, ServerMessage,
    SignalDescription, SignalingError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::negotiation::{Negotiation, NegotiationState, NegotiationTable};
use crate::registry::{EndpointSender, Registration, SessionRegistry};

/// The relay. Validates each signaling event against the negotiation state
/// and forwards it to exactly one endpoint. Nothing here waits on another
/// endpoint: forwards are queued onto per-endpoint channels.
#[derive(Clone)]
pub struct SignalingRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: SessionRegistry,
    negotiations: NegotiationTable,
    offer_timeout: Option<Duration>,
}

impl SignalingRouter {
    pub fn new(registry: SessionRegistry, offer_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                negotiations: NegotiationTable::new(),
                offer_timeout,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn negotiations(&self) -> &NegotiationTable {
        &self.inner.negotiations
    }

    /// Registers an endpoint under the requested identity, or a fresh one.
    pub fn connect(
        &self,
        requested: Option<EndpointId>,
        sender: EndpointSender,
    ) -> Result<Registration, SignalingError> {
        let id = requested.unwrap_or_else(EndpointId::generate);
        let registration = self.inner.registry.register(id, sender)?;
        counter!("switchboard_registrations_total").increment(1);
        Ok(registration)
    }

    /// Removes an endpoint and aborts every negotiation that references it.
    /// Counterparts that are still connected hear `callEnded` once each, even
    /// when both sides had offers outstanding to one another.
    pub fn disconnect(&self, id: &EndpointId) -> Vec<Negotiation> {
        let Some(departure) = self.inner.registry.unregister(id) else {
            return Vec::new();
        };

        let aborted = self.inner.negotiations.abort_involving(id);
        let counterparts: BTreeSet<&EndpointId> = aborted
            .iter()
            .filter_map(|negotiation| negotiation.counterpart(id))
            .collect();
        for counterpart in counterparts {
            let _ = self.inner.registry.send_to(
                counterpart,
                ServerMessage::CallEnded {
                    peer: id.clone(),
                    reason: CallEndReason::PeerDisconnected,
                },
            );
        }
        counter!("switchboard_negotiations_aborted_total", "reason" => "peer_disconnected")
            .increment(aborted.len() as u64);
        info!(
            endpoint = %id,
            active = departure.active,
            connected_secs = (Utc::now() - departure.registered_at).num_seconds(),
            aborted = aborted.len(),
            "endpoint disconnected"
        );
        aborted
    }

    /// Routes an offer to `callee`. A newer offer replaces an offer still
    /// pending for the callee; the superseded caller is not told. Established
    /// calls are tracked apart and stay untouched.
    pub fn send_offer(
        &self,
        caller: &EndpointId,
        callee: &EndpointId,
        description: SignalDescription,
    ) -> Result<Uuid, SignalingError> {
        if !description.is_offer() {
            return Err(SignalingError::violation(format!(
                "callUser from {caller} carried an {}",
                description.kind
            )));
        }
        if caller == callee {
            return Err(SignalingError::violation(format!(
                "{caller} attempted to call itself"
            )));
        }

        let negotiation = Negotiation::offering(caller.clone(), callee.clone());
        let negotiation_id = negotiation.id;
        // The caller is checked under the callee's guard: a disconnect that
        // lands after this check still finds the offer and aborts it.
        match self.inner.negotiations.offer_slot(callee.clone()) {
            Entry::Occupied(mut slot) => {
                self.ensure_registered(caller)?;
                self.forward_offer(caller, callee, description)?;
                let previous = slot.insert(negotiation);
                if &previous.caller != caller {
                    debug!(
                        callee = %callee,
                        superseded = %previous.caller,
                        caller = %caller,
                        "pending offer superseded"
                    );
                    counter!("switchboard_offers_superseded_total").increment(1);
                }
            }
            Entry::Vacant(slot) => {
                self.ensure_registered(caller)?;
                self.forward_offer(caller, callee, description)?;
                slot.insert(negotiation);
            }
        }

        counter!("switchboard_offers_routed_total").increment(1);
        debug!(caller = %caller, callee = %callee, negotiation = %negotiation_id, "offer routed");
        Ok(negotiation_id)
    }

    /// Routes an answer back to the caller whose offer is outstanding for
    /// `callee` and moves the pair to the established calls. Anything else is
    /// a stale or duplicate answer.
    pub fn send_answer(
        &self,
        callee: &EndpointId,
        caller: &EndpointId,
        description: SignalDescription,
    ) -> Result<(), SignalingError> {
        if !description.is_answer() {
            return Err(SignalingError::violation(format!(
                "answerCall from {callee} carried an {}",
                description.kind
            )));
        }

        match self.inner.negotiations.offer_slot(callee.clone()) {
            Entry::Occupied(slot)
                if slot.get().state == NegotiationState::Offering
                    && &slot.get().caller == caller =>
            {
                let mut negotiation = slot.get().clone();
                negotiation.state = NegotiationState::Answered;
                let forwarded = self.inner.registry.send_to(
                    caller,
                    ServerMessage::CallAccepted {
                        from: callee.clone(),
                        signal: description,
                    },
                );
                // single round trip: nothing further to wait for
                self.inner.negotiations.establish(negotiation);
                slot.remove();
                counter!("switchboard_answers_routed_total").increment(1);
                debug!(caller = %caller, callee = %callee, "answer routed");
                forwarded
            }
            _ => Err(SignalingError::violation(format!(
                "answer from {callee} matches no outstanding offer from {caller}"
            ))),
        }
    }

    /// Forwards a candidate whenever the target is connected, whatever the
    /// negotiation state. Receivers reconcile ordering themselves.
    pub fn relay_candidate(
        &self,
        from: &EndpointId,
        to: &EndpointId,
        candidate: NetworkCandidate,
    ) -> Result<(), SignalingError> {
        self.inner.registry.send_to(
            to,
            ServerMessage::NewIceCandidate {
                from: from.clone(),
                candidate,
            },
        )?;
        counter!("switchboard_candidates_relayed_total").increment(1);
        Ok(())
    }

    /// Ends (or declines) the call between `from` and `peer`.
    pub fn end_call(&self, from: &EndpointId, peer: &EndpointId) -> Result<(), SignalingError> {
        let aborted = self.inner.negotiations.abort_between(from, peer);
        if aborted.is_empty() {
            return Err(SignalingError::violation(format!(
                "{from} ended a call with {peer} that does not exist"
            )));
        }
        let _ = self.inner.registry.send_to(
            peer,
            ServerMessage::CallEnded {
                peer: from.clone(),
                reason: CallEndReason::HungUp,
            },
        );
        counter!("switchboard_negotiations_aborted_total", "reason" => "hung_up")
            .increment(aborted.len() as u64);
        Ok(())
    }

    /// Aborts offers left unanswered past the configured timeout.
    pub fn expire_stale_offers(&self, now: Instant) -> Vec<Negotiation> {
        let Some(timeout) = self.inner.offer_timeout else {
            return Vec::new();
        };
        let expired = self.inner.negotiations.abort_expired_offers(now, timeout);
        for negotiation in &expired {
            info!(
                caller = %negotiation.caller,
                callee = %negotiation.callee,
                "offer timed out"
            );
            let _ = self.inner.registry.send_to(
                &negotiation.caller,
                ServerMessage::CallTimeout {
                    target: negotiation.callee.clone(),
                },
            );
            let _ = self.inner.registry.send_to(
                &negotiation.callee,
                ServerMessage::CallEnded {
                    peer: negotiation.caller.clone(),
                    reason: CallEndReason::TimedOut,
                },
            );
            counter!("switchboard_negotiations_aborted_total", "reason" => "timed_out")
                .increment(1);
        }
        expired
    }

    /// Disconnects endpoints that have been silent longer than `idle_timeout`.
    pub fn prune_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<EndpointId> {
        let idle = self.inner.registry.idle_endpoints(now, idle_timeout);
        for id in &idle {
            warn!(endpoint = %id, "removing idle endpoint (heartbeat timeout)");
            let _ = self.inner.registry.send_to(
                id,
                ServerMessage::Error {
                    message: "idle timeout; register again to continue".into(),
                },
            );
            self.disconnect(id);
            counter!("switchboard_idle_pruned_total").increment(1);
        }
        idle
    }

    /// Handles one frame from a registered endpoint and applies the error
    /// policy. Only errors the sender must hear about are returned.
    pub fn dispatch(
        &self,
        from: &EndpointId,
        message: ClientMessage,
    ) -> Result<(), SignalingError> {
        if !self.inner.registry.touch(from) {
            return Err(SignalingError::NotRegistered);
        }

        let outcome = match message {
            ClientMessage::Register { .. } => Err(SignalingError::violation(format!(
                "{from} sent register twice"
            ))),
            ClientMessage::CallUser { target, signal } => {
                match self.send_offer(from, &target, signal) {
                    Err(SignalingError::PeerUnreachable(target)) => {
                        counter!("switchboard_offers_unreachable_total").increment(1);
                        info!(caller = %from, target = %target, "call target unreachable");
                        let _ = self.inner.registry.send_to(
                            from,
                            ServerMessage::CallFailed {
                                target,
                                reason: CallFailure::PeerUnreachable,
                            },
                        );
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            ClientMessage::AnswerCall { target, signal } => {
                self.send_answer(from, &target, signal)
            }
            ClientMessage::SendCandidate { target, candidate } => {
                self.relay_candidate(from, &target, candidate)
            }
            ClientMessage::EndCall { target } => self.end_call(from, &target),
            ClientMessage::Ping => self.inner.registry.send_to(from, ServerMessage::Pong),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(SignalingError::ProtocolViolation(reason)) => {
                counter!("switchboard_protocol_violations_total").increment(1);
                warn!(endpoint = %from, %reason, "dropping out-of-state message");
                Ok(())
            }
            Err(SignalingError::PeerUnreachable(peer)) => {
                counter!("switchboard_messages_dropped_total").increment(1);
                debug!(endpoint = %from, peer = %peer, "dropping message for departed peer");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Periodically expires stale offers and prunes idle endpoints.
    pub fn spawn_reaper(&self, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                router.expire_stale_offers(now);
                router.prune_idle(now, idle_timeout);
            }
        })
    }

    fn ensure_registered(&self, id: &EndpointId) -> Result<(), SignalingError> {
        if self.inner.registry.contains(id) {
            Ok(())
        } else {
            Err(SignalingError::NotRegistered)
        }
    }

    fn forward_offer(
        &self,
        caller: &EndpointId,
        callee: &EndpointId,
        description: SignalDescription,
    ) -> Result<(), SignalingError> {
        self.inner.registry.send_to(
            callee,
            ServerMessage::CallIncoming {
                from: caller.clone(),
                signal: description,
            },
        )
    }
}

use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use switchboard_core::EndpointId;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    Offering,
    Answered,
    Established,
    Aborted,
}

/// One call between a caller and a callee, tracked by the relay.
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub id: Uuid,
    pub caller: EndpointId,
    pub callee: EndpointId,
    pub state: NegotiationState,
    pub offered_at: Instant,
}

impl Negotiation {
    pub fn offering(caller: EndpointId, callee: EndpointId) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            callee,
            state: NegotiationState::Offering,
            offered_at: Instant::now(),
        }
    }

    pub fn involves(&self, endpoint: &EndpointId) -> bool {
        &self.caller == endpoint || &self.callee == endpoint
    }

    /// The other party, if `endpoint` takes part in this negotiation.
    pub fn counterpart(&self, endpoint: &EndpointId) -> Option<&EndpointId> {
        if &self.caller == endpoint {
            Some(&self.callee)
        } else if &self.callee == endpoint {
            Some(&self.caller)
        } else {
            None
        }
    }

    fn aborted(mut self) -> Self {
        self.state = NegotiationState::Aborted;
        self
    }
}

/// Unordered endpoint pair naming an established call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey(EndpointId, EndpointId);

impl CallKey {
    pub fn new(a: &EndpointId, b: &EndpointId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }
}

/// Pending offers keyed by callee, and established calls keyed by pair.
///
/// An offer transition runs under the callee's offer guard, so two offers
/// racing for the same callee are serialized. A newer offer replaces only a
/// pending one; calls already established are never overwritten. When both
/// maps are locked, the offer shard is taken first.
#[derive(Default)]
pub struct NegotiationTable {
    offers: DashMap<EndpointId, Negotiation>,
    calls: DashMap<CallKey, Negotiation>,
}

impl NegotiationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the exchange from `caller` to `callee` stands.
    pub fn state_between(&self, caller: &EndpointId, callee: &EndpointId) -> NegotiationState {
        if let Some(offer) = self.offers.get(callee) {
            if &offer.caller == caller {
                return offer.state;
            }
        }
        self.calls
            .get(&CallKey::new(caller, callee))
            .map(|call| call.state)
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn pending_offer(&self, callee: &EndpointId) -> Option<Negotiation> {
        self.offers.get(callee).map(|entry| entry.clone())
    }

    pub fn call_between(&self, a: &EndpointId, b: &EndpointId) -> Option<Negotiation> {
        self.calls.get(&CallKey::new(a, b)).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.offers.len() + self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty() && self.calls.is_empty()
    }

    /// Locks the callee's pending-offer slot for a transition.
    pub(crate) fn offer_slot(&self, callee: EndpointId) -> Entry<'_, EndpointId, Negotiation> {
        self.offers.entry(callee)
    }

    /// Records an answered offer as an established call. Called while the
    /// offer slot is still held, so a concurrent abort sees one or the other.
    pub(crate) fn establish(&self, mut negotiation: Negotiation) {
        negotiation.state = NegotiationState::Established;
        let key = CallKey::new(&negotiation.caller, &negotiation.callee);
        self.calls.insert(key, negotiation);
    }

    /// Removes and aborts everything between `a` and `b`, in either direction.
    pub fn abort_between(&self, a: &EndpointId, b: &EndpointId) -> Vec<Negotiation> {
        let mut aborted = Vec::new();
        for (callee, caller) in [(a, b), (b, a)] {
            if let Some((_, negotiation)) = self
                .offers
                .remove_if(callee, |_, negotiation| &negotiation.caller == caller)
            {
                aborted.push(negotiation.aborted());
            }
        }
        if let Some((_, call)) = self.calls.remove(&CallKey::new(a, b)) {
            aborted.push(call.aborted());
        }
        aborted
    }

    /// Removes and aborts every offer and call that references `endpoint`.
    pub fn abort_involving(&self, endpoint: &EndpointId) -> Vec<Negotiation> {
        let mut aborted = Vec::new();
        if let Some((_, negotiation)) = self.offers.remove(endpoint) {
            aborted.push(negotiation.aborted());
        }
        self.offers.retain(|_, negotiation| {
            if negotiation.involves(endpoint) {
                aborted.push(negotiation.clone().aborted());
                false
            } else {
                true
            }
        });
        self.calls.retain(|_, call| {
            if call.involves(endpoint) {
                aborted.push(call.clone().aborted());
                false
            } else {
                true
            }
        });
        aborted
    }

    /// Removes and aborts offers that have waited longer than `timeout`.
    pub fn abort_expired_offers(&self, now: Instant, timeout: Duration) -> Vec<Negotiation> {
        let mut expired = Vec::new();
        self.offers.retain(|_, negotiation| {
            let stale = now.saturating_duration_since(negotiation.offered_at) >= timeout;
            if stale {
                expired.push(negotiation.clone().aborted());
            }
            !stale
        });
        expired
    }

    pub fn snapshot(&self) -> Vec<Negotiation> {
        self.offers
            .iter()
            .map(|entry| entry.value().clone())
            .chain(self.calls.iter().map(|entry| entry.value().clone()))
            .collect()
    }
}

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use switchboard_core::{EndpointId, ServerMessage, SignalingError};
use tokio::sync::mpsc;
use tracing::debug;

pub type EndpointSender = mpsc::UnboundedSender<ServerMessage>;

/// Connected endpoints in registration order.
///
/// Membership changes and the `userList` broadcast that follows them happen
/// under one lock, so every endpoint sees lists in the order membership
/// actually changed.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    slab: Slab<EndpointEntry>,
    index: HashMap<EndpointId, usize>,
    next_seq: u64,
}

struct EndpointEntry {
    id: EndpointId,
    seq: u64,
    sender: EndpointSender,
    registered_at: DateTime<Utc>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct Registration {
    pub id: EndpointId,
    pub active: usize,
}

#[derive(Debug)]
pub struct Departure {
    pub id: EndpointId,
    pub active: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: EndpointId,
    pub registered_at: DateTime<Utc>,
    pub idle_ms: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an endpoint, acknowledges it with `registered` and broadcasts
    /// the new membership to everyone.
    pub fn register(
        &self,
        id: EndpointId,
        sender: EndpointSender,
    ) -> Result<Registration, SignalingError> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&id) {
            return Err(SignalingError::DuplicateIdentity(id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let _ = sender.send(ServerMessage::Registered { id: id.clone() });
        let key = inner.slab.insert(EndpointEntry {
            id: id.clone(),
            seq,
            sender,
            registered_at: Utc::now(),
            last_seen: Instant::now(),
        });
        inner.index.insert(id.clone(), key);

        inner.broadcast_user_list();
        let active = inner.slab.len();
        gauge!("switchboard_endpoints_active").set(active as f64);
        debug!(endpoint = %id, active, "endpoint registered");

        Ok(Registration { id, active })
    }

    /// Removes an endpoint. Returns `None` when it was already gone.
    pub fn unregister(&self, id: &EndpointId) -> Option<Departure> {
        let mut inner = self.inner.lock();
        let key = inner.index.remove(id)?;
        let entry = inner.slab.remove(key);

        inner.broadcast_user_list();
        let active = inner.slab.len();
        gauge!("switchboard_endpoints_active").set(active as f64);
        debug!(endpoint = %id, active, "endpoint unregistered");

        Some(Departure {
            id: entry.id,
            active,
            registered_at: entry.registered_at,
        })
    }

    pub fn list_active(&self) -> Vec<EndpointId> {
        self.inner.lock().ordered_ids()
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// True when `id` is registered through this particular channel. A pruned
    /// identity may since have been claimed by another connection.
    pub fn is_held_by(&self, id: &EndpointId, sender: &EndpointSender) -> bool {
        let inner = self.inner.lock();
        inner
            .index
            .get(id)
            .and_then(|key| inner.slab.get(*key))
            .map(|entry| entry.sender.same_channel(sender))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a frame for one endpoint without waiting on it.
    pub fn send_to(&self, id: &EndpointId, message: ServerMessage) -> Result<(), SignalingError> {
        let inner = self.inner.lock();
        let entry = inner
            .index
            .get(id)
            .and_then(|key| inner.slab.get(*key))
            .ok_or_else(|| SignalingError::PeerUnreachable(id.clone()))?;
        entry
            .sender
            .send(message)
            .map_err(|_| SignalingError::PeerUnreachable(id.clone()))
    }

    /// Records liveness for an endpoint. Returns false if it is not registered.
    pub fn touch(&self, id: &EndpointId) -> bool {
        let mut inner = self.inner.lock();
        let Some(key) = inner.index.get(id).copied() else {
            return false;
        };
        match inner.slab.get_mut(key) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn idle_endpoints(&self, now: Instant, idle_timeout: Duration) -> Vec<EndpointId> {
        let inner = self.inner.lock();
        inner
            .slab
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > idle_timeout)
            .map(|(_, entry)| entry.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let mut entries: Vec<&EndpointEntry> = inner.slab.iter().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| EndpointSnapshot {
                id: entry.id.clone(),
                registered_at: entry.registered_at,
                idle_ms: now.saturating_duration_since(entry.last_seen).as_millis() as u64,
            })
            .collect()
    }
}

impl RegistryInner {
    fn ordered_ids(&self) -> Vec<EndpointId> {
        let mut entries: Vec<(u64, &EndpointId)> = self
            .slab
            .iter()
            .map(|(_, entry)| (entry.seq, &entry.id))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, id)| id.clone()).collect()
    }

    fn broadcast_user_list(&self) {
        let users = self.ordered_ids();
        for (_, entry) in self.slab.iter() {
            // a closed channel means the endpoint is mid-disconnect
            let _ = entry.sender.send(ServerMessage::UserList {
                users: users.clone(),
            });
        }
    }
}

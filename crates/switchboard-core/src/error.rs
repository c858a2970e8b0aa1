use thiserror::Error;

use crate::protocol::EndpointId;

/// Failures the signaling core distinguishes. Each variant carries its own
/// handling policy: some are surfaced to a user, some are absorbed as races.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// Target is not registered with the relay.
    #[error("peer {0} is not reachable")]
    PeerUnreachable(EndpointId),
    /// Message arrived in a state that does not accept it (stale or duplicate).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid network candidate: {0}")]
    InvalidCandidate(String),
    /// Counterpart vanished mid-negotiation.
    #[error("peer {0} disconnected")]
    PeerDisconnected(EndpointId),
    #[error("identity {0} is already registered")]
    DuplicateIdentity(EndpointId),
    #[error("endpoint must register before signaling")]
    NotRegistered,
}

impl SignalingError {
    pub fn violation(reason: impl Into<String>) -> Self {
        SignalingError::ProtocolViolation(reason.into())
    }

    /// Label used for metrics and structured logs.
    pub fn metric_label(&self) -> &'static str {
        match self {
            SignalingError::PeerUnreachable(_) => "peer_unreachable",
            SignalingError::ProtocolViolation(_) => "protocol_violation",
            SignalingError::InvalidDescription(_) => "invalid_description",
            SignalingError::InvalidCandidate(_) => "invalid_candidate",
            SignalingError::PeerDisconnected(_) => "peer_disconnected",
            SignalingError::DuplicateIdentity(_) => "duplicate_identity",
            SignalingError::NotRegistered => "not_registered",
        }
    }
}

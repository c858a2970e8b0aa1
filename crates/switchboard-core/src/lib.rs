//! Shared primitives for the Beach call switchboard.
//!
//! The relay (`beach-switchboard`) and the client-side negotiation driver
//! (`switchboard-client`) both speak the message shapes defined here, so the
//! two halves never drift apart.

pub mod error;
pub mod protocol;

pub use error::SignalingError;
pub use protocol::{
    CallEndReason, CallFailure, ClientMessage, EndpointId, NetworkCandidate, SdpKind,
    ServerMessage, SignalDescription,
};

//! Client side of the Beach call switchboard: buffers remote candidates until
//! they can be applied and drives the offer/answer exchange against a
//! platform transport engine.

pub mod candidate_queue;
pub mod connection;
pub mod controller;
pub mod engine;

pub use candidate_queue::{CandidateQueue, Enqueued};
pub use connection::{ConnectionError, SignalingConnection};
pub use controller::{
    CallCommand, CallPhase, CallRole, ControllerError, ControllerEvent, NegotiationController,
};
pub use engine::{EngineError, EngineEvent, RecordingEngine, TrackInfo, TransportEngine};

//! A2DP Media Core - SBC codec, frame pacing and the media streaming engine
//!
//! This library moves audio between a local PCM path and a Bluetooth A2DP
//! peer. On the source side it paces PCM reads against a wall clock,
//! encodes SBC frames and packetizes them for the transport. On the sink
//! side it decodes queued packets back to PCM. A byte-oriented control
//! channel lets the audio HAL start, stop and suspend the stream.

pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod stats;

pub use codec::info::SbcCodecInfo;
pub use codec::negotiator::{BitpoolDecision, NegotiationError, Negotiator};
pub use config::{
    EncoderConfig, EngineConfig, FeedingConfig, FeedingMode, LinkCapabilities, PeerRole,
};
pub use control::{AckStatus, ControlCommand};
pub use engine::io::{
    AudioSink, FeedingSource, OffloadStatus, PcmRingFeed, PcmWriter, SessionTransitions,
    StreamState, TransportSender,
};
pub use engine::packet::TransportPacket;
pub use engine::{Collaborators, EngineError, EngineHandle, MediaEngine, MediaTaskState};
pub use stats::{MediaStats, StatsSnapshot};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

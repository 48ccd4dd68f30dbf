//! A2DP Media - Bluetooth A2DP media streaming engine
//!
//! This library re-exports the codec, engine, control path and statistics
//! from `a2dp-media-core`, plus simulated collaborators for driving the
//! engine without a Bluetooth stack.

pub mod sim;

pub use a2dp_media_core::codec;
pub use a2dp_media_core::config;
pub use a2dp_media_core::control;
pub use a2dp_media_core::engine;
pub use a2dp_media_core::stats;

pub use a2dp_media_core::{
    AckStatus, Collaborators, ControlCommand, EncoderConfig, EngineConfig, EngineError,
    EngineHandle, FeedingConfig, FeedingMode, LinkCapabilities, MediaEngine, MediaTaskState,
    PeerRole, SbcCodecInfo, StatsSnapshot, TransportPacket,
};
pub use a2dp_media_core::{BUILD_DATE, VERSION};

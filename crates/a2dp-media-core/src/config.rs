//! Engine and stream configuration
//!
//! [`EngineConfig`] holds the tunables of the media task (tick periods,
//! queue depths, congestion guards, bitrate policy) and persists as JSON.
//! [`EncoderConfig`] and [`FeedingConfig`] describe one streaming session.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::sbc::{
    AllocationMethod, ChannelMode, SamplingFrequency, SbcParams, MAX_BLOCKS, MAX_SUBBANDS,
};

/// Configuration values the engine cannot run with
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Unsupported feeding format: {rate} Hz, {channels} channels, {bits} bits")]
    UnsupportedFeeding { rate: u32, channels: u8, bits: u8 },
}

fn default_tick_ms() -> u64 {
    20
}

fn default_queue_capacity() -> usize {
    28
}

fn default_max_frames_per_tick() -> usize {
    14
}

fn default_max_iterations_per_tick() -> usize {
    3
}

fn default_bitrate_kbps() -> u16 {
    328
}

fn default_non_edr_max_bitrate_kbps() -> u16 {
    229
}

fn default_bitrate_step_kbps() -> u16 {
    5
}

fn default_max_bitpool_iterations() -> usize {
    64
}

fn default_delayed_start_packets() -> usize {
    5
}

fn default_max_2mbps_mtu() -> u16 {
    663
}

fn default_max_tx_payload() -> u16 {
    4000
}

/// Tunables of the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TX pacing tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tx_tick_ms: u64,
    /// RX decode tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub rx_tick_ms: u64,
    /// Maximum packets held in the transmit queue
    #[serde(default = "default_queue_capacity")]
    pub tx_queue_capacity: usize,
    /// Maximum packets held in the receive queue
    #[serde(default = "default_queue_capacity")]
    pub rx_queue_capacity: usize,
    /// Congestion guard: frames produced in a single tick
    #[serde(default = "default_max_frames_per_tick")]
    pub max_frames_per_tick: usize,
    /// Congestion guard: packetization iterations in a single tick
    #[serde(default = "default_max_iterations_per_tick")]
    pub max_iterations_per_tick: usize,
    /// Initial bitrate target for EDR peers
    #[serde(default = "default_bitrate_kbps")]
    pub default_bitrate_kbps: u16,
    /// Bitrate ceiling for basic-rate peers
    #[serde(default = "default_non_edr_max_bitrate_kbps")]
    pub non_edr_max_bitrate_kbps: u16,
    /// Bitrate adjustment applied per bitpool search step
    #[serde(default = "default_bitrate_step_kbps")]
    pub bitrate_step_kbps: u16,
    /// Upper bound on bitpool search steps
    #[serde(default = "default_max_bitpool_iterations")]
    pub max_bitpool_iterations: usize,
    /// Queued packets required before sink decoding starts
    #[serde(default = "default_delayed_start_packets")]
    pub delayed_start_packets: usize,
    /// MTU ceiling for EDR peers limited to 2 Mbps
    #[serde(default = "default_max_2mbps_mtu")]
    pub max_2mbps_mtu: u16,
    /// Largest packet the transmit buffers can hold
    #[serde(default = "default_max_tx_payload")]
    pub max_tx_payload: u16,
    /// Session used when no explicit configuration is supplied
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub feeding: FeedingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_tick_ms: default_tick_ms(),
            rx_tick_ms: default_tick_ms(),
            tx_queue_capacity: default_queue_capacity(),
            rx_queue_capacity: default_queue_capacity(),
            max_frames_per_tick: default_max_frames_per_tick(),
            max_iterations_per_tick: default_max_iterations_per_tick(),
            default_bitrate_kbps: default_bitrate_kbps(),
            non_edr_max_bitrate_kbps: default_non_edr_max_bitrate_kbps(),
            bitrate_step_kbps: default_bitrate_step_kbps(),
            max_bitpool_iterations: default_max_bitpool_iterations(),
            delayed_start_packets: default_delayed_start_packets(),
            max_2mbps_mtu: default_max_2mbps_mtu(),
            max_tx_payload: default_max_tx_payload(),
            encoder: EncoderConfig::default(),
            feeding: FeedingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded engine config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse engine config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No engine config found, using defaults");
                Self::default()
            }
        }
    }

    /// Rejects values that would stall the worker or divide by zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.tx_tick_ms == 0, "tx_tick_ms"),
            (self.rx_tick_ms == 0, "rx_tick_ms"),
            (self.tx_queue_capacity == 0, "tx_queue_capacity"),
            (self.rx_queue_capacity == 0, "rx_queue_capacity"),
            (self.max_frames_per_tick == 0, "max_frames_per_tick"),
            (self.max_iterations_per_tick == 0, "max_iterations_per_tick"),
            (self.max_bitpool_iterations == 0, "max_bitpool_iterations"),
        ];
        match checks.into_iter().find(|(bad, _)| *bad) {
            Some((_, field)) => Err(ConfigError::Zero(field)),
            None => self.feeding.validate(),
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Engine config saved");
        Ok(())
    }
}

/// SBC encoder settings for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub channel_mode: ChannelMode,
    /// 4 or 8
    pub subbands: u8,
    /// 4, 8, 12 or 16
    pub blocks: u8,
    pub sampling_frequency: SamplingFrequency,
    pub allocation: AllocationMethod,
    /// Negotiated bitpool; kept within `min_bitpool..=max_bitpool`
    pub bitpool: u8,
    /// Lowest bitpool the peer accepts
    pub min_bitpool: u8,
    /// Highest bitpool the peer accepts
    pub max_bitpool: u8,
    /// Target bitrate in kbps
    pub bitrate_kbps: u16,
    /// Transport MTU in bytes
    pub mtu: u16,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            channel_mode: ChannelMode::JointStereo,
            subbands: 8,
            blocks: 16,
            sampling_frequency: SamplingFrequency::Hz44100,
            allocation: AllocationMethod::Loudness,
            bitpool: 53,
            min_bitpool: 2,
            max_bitpool: 53,
            bitrate_kbps: default_bitrate_kbps(),
            mtu: 895,
        }
    }
}

impl EncoderConfig {
    /// Replaces unusable subband and block counts with the maximum
    ///
    /// Returns true when something was corrected.
    pub fn sanitize(&mut self) -> bool {
        let mut changed = false;
        if !matches!(self.subbands, 4 | 8) {
            tracing::warn!(
                subbands = self.subbands,
                "Invalid subband count, resetting to max ({})",
                MAX_SUBBANDS
            );
            self.subbands = MAX_SUBBANDS;
            changed = true;
        }
        if !matches!(self.blocks, 4 | 8 | 12 | 16) {
            tracing::warn!(
                blocks = self.blocks,
                "Invalid block count, resetting to max ({})",
                MAX_BLOCKS
            );
            self.blocks = MAX_BLOCKS;
            changed = true;
        }
        changed
    }

    /// Number of audio channels implied by the channel mode
    pub fn channels(&self) -> u8 {
        self.channel_mode.channels()
    }

    /// Frame parameters for the codec
    pub fn sbc_params(&self) -> SbcParams {
        SbcParams {
            frequency: self.sampling_frequency,
            channel_mode: self.channel_mode,
            blocks: self.blocks,
            subbands: self.subbands,
            allocation: self.allocation,
            bitpool: self.bitpool,
        }
    }

    /// Encoded frame length at the current bitpool
    pub fn frame_length(&self) -> usize {
        self.sbc_params().frame_length()
    }
}

/// Underrun policy of the PCM feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedingMode {
    /// A short read skips the frame
    Synchronous,
    /// A short read is padded with silence
    Asynchronous,
}

/// Format of the PCM handed to the TX pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedingConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// 8 or 16
    pub bits_per_sample: u8,
    pub mode: FeedingMode,
}

impl Default for FeedingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            mode: FeedingMode::Synchronous,
        }
    }
}

impl FeedingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0
            || !matches!(self.channels, 1 | 2)
            || !matches!(self.bits_per_sample, 8 | 16)
        {
            return Err(ConfigError::UnsupportedFeeding {
                rate: self.sample_rate,
                channels: self.channels,
                bits: self.bits_per_sample,
            });
        }
        Ok(())
    }

    /// Bytes of one PCM sample across all channels
    pub fn bytes_per_sample_frame(&self) -> usize {
        self.channels.max(1) as usize * (self.bits_per_sample as usize / 8).max(1)
    }

    /// Feeding bytes that accumulate over one tick
    pub fn bytes_per_tick(&self, tick_ms: u64) -> u64 {
        self.sample_rate as u64 * self.bytes_per_sample_frame() as u64 * tick_ms / 1000
    }
}

/// Role of the remote device in the A2DP stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Remote renders audio; this side encodes and transmits
    Sink,
    /// Remote produces audio; this side decodes and plays
    Source,
}

/// Baseband capabilities of the link to the peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCapabilities {
    /// Peer supports enhanced data rate
    pub edr: bool,
    /// Peer supports the 3 Mbps EDR packet types
    pub edr_3mbps: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.tx_tick_ms, 20);
        assert_eq!(config.tx_queue_capacity, 28);
        assert_eq!(config.max_frames_per_tick, 14);
        assert_eq!(config.max_iterations_per_tick, 3);
        assert_eq!(config.default_bitrate_kbps, 328);
        assert_eq!(config.non_edr_max_bitrate_kbps, 229);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"tx_tick_ms": 10, "encoder": {"bitpool": 40}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tx_tick_ms, 10);
        assert_eq!(config.rx_tick_ms, 20);
        assert_eq!(config.encoder.bitpool, 40);
        assert_eq!(config.encoder.subbands, 8);
        assert_eq!(config.feeding, FeedingConfig::default());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let mut config = EngineConfig::default();
        config.rx_queue_capacity = 40;
        config.feeding.mode = FeedingMode::Asynchronous;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_garbage_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(EngineConfig::load(&path), EngineConfig::default());
    }

    #[test]
    fn test_sanitize_restores_maximums() {
        let mut encoder = EncoderConfig {
            subbands: 0,
            blocks: 7,
            ..EncoderConfig::default()
        };
        assert!(encoder.sanitize());
        assert_eq!(encoder.subbands, 8);
        assert_eq!(encoder.blocks, 16);
        assert!(!encoder.sanitize());
    }

    #[test]
    fn test_validate() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));

        let mut config = EngineConfig::default();
        config.tx_queue_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("tx_queue_capacity")));

        let mut config = EngineConfig::default();
        config.feeding.bits_per_sample = 24;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedFeeding { bits: 24, .. })
        ));
    }

    #[test]
    fn test_bytes_per_tick() {
        let feeding = FeedingConfig::default();
        // 44100 * 2ch * 2 bytes * 20ms
        assert_eq!(feeding.bytes_per_tick(20), 3528);
    }
}

//! Codec parameter negotiation
//!
//! Derives the SBC bitpool for a target bitrate within the range the peer
//! advertises, and the number of frames that fit one transport packet.

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::codec::sbc::{frame_length, max_bitpool, ChannelMode, MIN_BITPOOL};
use crate::config::{EncoderConfig, EngineConfig, LinkCapabilities};
use crate::engine::packet::{TransportPacket, MAX_FRAMES_PER_PACKET};

/// Errors reported by the negotiator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Invalid peer bitpool range [{min}, {max}]")]
    InvalidRange { min: u8, max: u8 },

    #[error("Bitpool search oscillated between raising and lowering the bitrate (last bitpool {bitpool} at {bitrate_kbps} kbps)")]
    Oscillation { bitpool: i64, bitrate_kbps: i64 },

    #[error("Bitrate left the representable range at {bitrate_kbps} kbps")]
    BitrateExhausted { bitrate_kbps: i64 },

    #[error("Bitpool search gave up after {0} iterations")]
    IterationLimit(usize),

    #[error("Malformed codec information element ({0} bytes)")]
    MalformedCodecInfo(usize),

    #[error("No common {0} with peer")]
    NoCommonConfiguration(&'static str),
}

/// Outcome of a successful bitpool search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitpoolDecision {
    pub bitpool: u8,
    /// Target bitrate after any step adjustments
    pub bitrate_kbps: u16,
    /// Candidates evaluated
    pub iterations: usize,
}

/// Bitpool and packet sizing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiator {
    pub default_bitrate_kbps: u16,
    pub non_edr_max_bitrate_kbps: u16,
    pub bitrate_step_kbps: u16,
    pub max_iterations: usize,
    pub max_2mbps_mtu: u16,
    pub max_tx_payload: u16,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl Negotiator {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_bitrate_kbps: config.default_bitrate_kbps,
            non_edr_max_bitrate_kbps: config.non_edr_max_bitrate_kbps,
            bitrate_step_kbps: config.bitrate_step_kbps.max(1),
            max_iterations: config.max_bitpool_iterations.max(1),
            max_2mbps_mtu: config.max_2mbps_mtu,
            max_tx_payload: config.max_tx_payload,
        }
    }

    /// Initial bitrate target for a peer
    pub fn initial_bitrate(&self, link: LinkCapabilities) -> u16 {
        if link.edr {
            self.default_bitrate_kbps
        } else {
            self.default_bitrate_kbps.min(self.non_edr_max_bitrate_kbps)
        }
    }

    /// Searches for a bitpool within `[peer_min, peer_max]` close to `target_kbps`
    ///
    /// The candidate is derived from the SBC frame size formula; the target
    /// bitrate is stepped down while the candidate is above the peer maximum
    /// and up while it is below the minimum.
    pub fn compute_bitpool(
        &self,
        config: &EncoderConfig,
        peer_min: u8,
        peer_max: u8,
        target_kbps: u16,
    ) -> Result<BitpoolDecision, NegotiationError> {
        if peer_min < MIN_BITPOOL || peer_min > peer_max {
            return Err(NegotiationError::InvalidRange {
                min: peer_min,
                max: peer_max,
            });
        }

        let mut config = *config;
        config.sanitize();
        let sb = config.subbands as i64;
        let blocks = config.blocks as i64;
        let ch = config.channels() as i64;
        let fs = config.sampling_frequency.hz() as i64;
        let mode = config.channel_mode;
        let ceiling = max_bitpool(mode, config.subbands) as i64;
        let step = self.bitrate_step_kbps as i64;

        let mut rate = target_kbps as i64;
        let mut lowered = false;
        let mut raised = false;

        for iteration in 1..=self.max_iterations {
            let mut bitpool = if mode.is_stereo() {
                let join = i64::from(mode == ChannelMode::JointStereo);
                rate * sb * 1000 / fs - (32 + 4 * sb * ch + join * sb) / blocks
            } else {
                sb * rate * 1000 / (fs * ch) - (32 / ch + 4 * sb) / blocks
            };

            let clamped = bitpool.clamp(0, ceiling) as u8;
            let len = frame_length(mode, config.subbands, config.blocks, clamped) as i64;
            let frame_rate = 8 * len * fs / (sb * blocks * 1000);
            if frame_rate > rate {
                bitpool -= 1;
            }
            bitpool = bitpool.clamp(0, ceiling);

            trace!(iteration, bitpool, bitrate_kbps = rate, "Bitpool candidate");

            if bitpool > peer_max as i64 {
                debug!(bitpool, peer_max, "Computed bitpool too large, lowering bitrate");
                rate -= step;
                lowered = true;
            } else if bitpool < peer_min as i64 {
                warn!(bitpool, peer_min, "Computed bitpool too small, raising bitrate");
                rate += step;
                raised = true;
            } else {
                return Ok(BitpoolDecision {
                    bitpool: bitpool as u8,
                    bitrate_kbps: rate as u16,
                    iterations: iteration,
                });
            }

            if lowered && raised {
                return Err(NegotiationError::Oscillation {
                    bitpool,
                    bitrate_kbps: rate,
                });
            }
            if rate <= 0 || rate > u16::MAX as i64 {
                return Err(NegotiationError::BitrateExhausted { bitrate_kbps: rate });
            }
        }
        Err(NegotiationError::IterationLimit(self.max_iterations))
    }

    /// MTU usable for media after buffer and baseband limits
    pub fn effective_mtu(&self, mtu: u16, link: LinkCapabilities) -> u16 {
        let mut effective = mtu.min(self.max_tx_payload);
        if link.edr && !link.edr_3mbps && effective > self.max_2mbps_mtu {
            warn!(
                mtu = effective,
                limit = self.max_2mbps_mtu,
                "Peer is EDR without 3 Mbps support, restricting MTU"
            );
            effective = self.max_2mbps_mtu;
        }
        effective
    }

    /// Frames of the configured size that fit one transport packet
    pub fn max_frames_per_packet(&self, config: &EncoderConfig, link: LinkCapabilities) -> u8 {
        let mtu = self.effective_mtu(config.mtu, link) as usize;
        let frame_len = config.frame_length();
        let frames = mtu.saturating_sub(TransportPacket::HEADER_SIZE) / frame_len;
        let frames = frames.min(MAX_FRAMES_PER_PACKET as usize) as u8;
        debug!(mtu, frame_len, frames, "Max SBC frames per packet");
        frames
    }
}

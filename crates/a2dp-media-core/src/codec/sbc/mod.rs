//! SBC (low-complexity sub-band codec) frame codec
//!
//! Provides:
//! - Frame parameters and header layout ([`SbcParams`], [`FrameHeader`])
//! - Frame length arithmetic shared with the bitpool negotiator
//! - Bit allocation for loudness and SNR methods ([`allocation`])
//! - Encoder with joint-stereo decisions ([`encoder`])
//! - Decoder with CRC verification ([`decoder`])
//!
//! Frames use the sync word `0x9C` followed by one parameter byte, the
//! bitpool, a CRC-8 byte, optional joint flags, scale factors and samples.

pub mod allocation;
pub mod bits;
pub mod decoder;
pub mod encoder;
pub(crate) mod tables;

pub use decoder::SbcDecoder;
pub use encoder::SbcEncoder;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SBC frame sync word
pub const SYNC_WORD: u8 = 0x9C;

/// Size of the fixed frame header (sync, parameters, bitpool, CRC)
pub const HEADER_SIZE: usize = 4;

/// Largest subband count SBC supports
pub const MAX_SUBBANDS: u8 = 8;

/// Largest block count SBC supports
pub const MAX_BLOCKS: u8 = 16;

/// Largest channel count SBC supports
pub const MAX_CHANNELS: u8 = 2;

/// Hard upper limit on the bitpool field
pub const MAX_BITPOOL: u8 = 250;

/// Smallest legal bitpool
pub const MIN_BITPOOL: u8 = 2;

/// Errors raised while encoding or decoding SBC frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SbcError {
    #[error("Invalid subband count: {0}")]
    InvalidSubbands(u8),

    #[error("Invalid block count: {0}")]
    InvalidBlocks(u8),

    #[error("Bitpool {bitpool} out of range (max {max})")]
    InvalidBitpool { bitpool: u8, max: u8 },

    #[error("Bad sync word: 0x{0:02x}")]
    BadSyncWord(u8),

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("CRC mismatch: frame carries 0x{expected:02x}, computed 0x{actual:02x}")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("PCM block has {actual} samples, expected {expected}")]
    PcmLength { expected: usize, actual: usize },
}

/// Sampling frequency of an SBC stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingFrequency {
    Hz16000,
    Hz32000,
    Hz44100,
    Hz48000,
}

impl SamplingFrequency {
    /// Rate in Hz
    pub fn hz(self) -> u32 {
        match self {
            Self::Hz16000 => 16_000,
            Self::Hz32000 => 32_000,
            Self::Hz44100 => 44_100,
            Self::Hz48000 => 48_000,
        }
    }

    /// Looks up the SBC frequency matching an exact rate
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            16_000 => Some(Self::Hz16000),
            32_000 => Some(Self::Hz32000),
            44_100 => Some(Self::Hz44100),
            48_000 => Some(Self::Hz48000),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Hz16000 => 0,
            Self::Hz32000 => 1,
            Self::Hz44100 => 2,
            Self::Hz48000 => 3,
        }
    }

    fn from_index(index: u8) -> Self {
        match index & 0x03 {
            0 => Self::Hz16000,
            1 => Self::Hz32000,
            2 => Self::Hz44100,
            _ => Self::Hz48000,
        }
    }
}

/// Channel mode of an SBC stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Mono,
    DualChannel,
    Stereo,
    JointStereo,
}

impl ChannelMode {
    /// Number of audio channels carried by this mode
    pub fn channels(self) -> u8 {
        match self {
            Self::Mono => 1,
            _ => 2,
        }
    }

    /// True for the modes whose bitpool is shared by both channels
    pub fn is_stereo(self) -> bool {
        matches!(self, Self::Stereo | Self::JointStereo)
    }

    fn index(self) -> u8 {
        match self {
            Self::Mono => 0,
            Self::DualChannel => 1,
            Self::Stereo => 2,
            Self::JointStereo => 3,
        }
    }

    fn from_index(index: u8) -> Self {
        match index & 0x03 {
            0 => Self::Mono,
            1 => Self::DualChannel,
            2 => Self::Stereo,
            _ => Self::JointStereo,
        }
    }
}

/// Bit allocation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    Loudness,
    Snr,
}

/// Validated parameters of one SBC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcParams {
    pub frequency: SamplingFrequency,
    pub channel_mode: ChannelMode,
    /// Block count: 4, 8, 12 or 16
    pub blocks: u8,
    /// Subband count: 4 or 8
    pub subbands: u8,
    pub allocation: AllocationMethod,
    pub bitpool: u8,
}

impl SbcParams {
    /// Checks block, subband and bitpool values against what the frame
    /// format can carry
    pub fn validate(&self) -> Result<(), SbcError> {
        if !matches!(self.subbands, 4 | 8) {
            return Err(SbcError::InvalidSubbands(self.subbands));
        }
        if !matches!(self.blocks, 4 | 8 | 12 | 16) {
            return Err(SbcError::InvalidBlocks(self.blocks));
        }
        let max = max_bitpool(self.channel_mode, self.subbands);
        if self.bitpool < MIN_BITPOOL || self.bitpool > max {
            return Err(SbcError::InvalidBitpool {
                bitpool: self.bitpool,
                max,
            });
        }
        Ok(())
    }

    /// Number of audio channels
    pub fn channels(&self) -> usize {
        self.channel_mode.channels() as usize
    }

    /// PCM samples per channel consumed by one frame
    pub fn samples_per_frame(&self) -> usize {
        self.blocks as usize * self.subbands as usize
    }

    /// Interleaved 16-bit PCM bytes consumed by one frame
    pub fn pcm_bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * self.channels() * 2
    }

    /// Encoded length of one frame in bytes
    pub fn frame_length(&self) -> usize {
        frame_length(
            self.channel_mode,
            self.subbands,
            self.blocks,
            self.bitpool,
        )
    }

    /// Bitrate produced by these parameters, in kbps
    pub fn bitrate_kbps(&self) -> u32 {
        let frame_bits = 8 * self.frame_length() as u64;
        let rate = frame_bits * self.frequency.hz() as u64
            / (self.samples_per_frame() as u64 * 1000);
        rate as u32
    }
}

/// Largest bitpool the frame format allows for a channel mode and subband count
pub fn max_bitpool(mode: ChannelMode, subbands: u8) -> u8 {
    let limit = if mode.is_stereo() {
        32 * subbands as u32
    } else {
        16 * subbands as u32
    };
    limit.min(MAX_BITPOOL as u32) as u8
}

/// Encoded frame length in bytes
///
/// ```text
/// mono/dual:    4 + (4*sb*ch)/8 + ceil(blocks*ch*bitpool / 8)
/// stereo:       4 + (4*sb*ch)/8 + ceil(blocks*bitpool / 8)
/// joint stereo: 4 + (4*sb*ch)/8 + ceil((sb + blocks*bitpool) / 8)
/// ```
pub fn frame_length(mode: ChannelMode, subbands: u8, blocks: u8, bitpool: u8) -> usize {
    let sb = subbands as usize;
    let blk = blocks as usize;
    let ch = mode.channels() as usize;
    let bp = bitpool as usize;
    let audio_bits = match mode {
        ChannelMode::Mono | ChannelMode::DualChannel => blk * ch * bp,
        ChannelMode::Stereo => blk * bp,
        ChannelMode::JointStereo => sb + blk * bp,
    };
    HEADER_SIZE + (4 * sb * ch) / 8 + audio_bits.div_ceil(8)
}

/// Parsed fixed header of an SBC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub params: SbcParams,
    pub crc: u8,
}

impl FrameHeader {
    /// Parses the 4 header bytes
    pub fn parse(data: &[u8]) -> Result<Self, SbcError> {
        if data.len() < HEADER_SIZE {
            return Err(SbcError::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }
        if data[0] != SYNC_WORD {
            return Err(SbcError::BadSyncWord(data[0]));
        }
        let b = data[1];
        let params = SbcParams {
            frequency: SamplingFrequency::from_index(b >> 6),
            blocks: 4 * (((b >> 4) & 0x03) + 1),
            channel_mode: ChannelMode::from_index(b >> 2),
            allocation: if b & 0x02 != 0 {
                AllocationMethod::Snr
            } else {
                AllocationMethod::Loudness
            },
            subbands: if b & 0x01 != 0 { 8 } else { 4 },
            bitpool: data[2],
        };
        params.validate()?;
        Ok(Self {
            params,
            crc: data[3],
        })
    }

    /// Packs the parameter byte (byte 1 of the frame)
    pub fn parameter_byte(params: &SbcParams) -> u8 {
        let mut b = (params.frequency.index() as u8) << 6;
        b |= ((params.blocks / 4).saturating_sub(1) & 0x03) << 4;
        b |= params.channel_mode.index() << 2;
        if params.allocation == AllocationMethod::Snr {
            b |= 0x02;
        }
        if params.subbands == 8 {
            b |= 0x01;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hq_params(mode: ChannelMode, bitpool: u8) -> SbcParams {
        SbcParams {
            frequency: SamplingFrequency::Hz44100,
            channel_mode: mode,
            blocks: 16,
            subbands: 8,
            allocation: AllocationMethod::Loudness,
            bitpool,
        }
    }

    #[test]
    fn test_frame_length_joint_stereo_hq() {
        // Standard high-quality setting: 44.1kHz joint stereo bitpool 53
        assert_eq!(hq_params(ChannelMode::JointStereo, 53).frame_length(), 119);
    }

    #[test]
    fn test_frame_length_stereo() {
        assert_eq!(hq_params(ChannelMode::Stereo, 53).frame_length(), 118);
    }

    #[test]
    fn test_frame_length_mono() {
        // 4 + 32/8 + ceil(16*31/8) = 4 + 4 + 62
        assert_eq!(hq_params(ChannelMode::Mono, 31).frame_length(), 70);
    }

    #[test]
    fn test_bitrate_hq() {
        let rate = hq_params(ChannelMode::JointStereo, 53).bitrate_kbps();
        assert!((320..=330).contains(&rate), "bitrate {} out of range", rate);
    }

    #[test]
    fn test_header_round_trip() {
        let params = SbcParams {
            frequency: SamplingFrequency::Hz48000,
            channel_mode: ChannelMode::DualChannel,
            blocks: 12,
            subbands: 4,
            allocation: AllocationMethod::Snr,
            bitpool: 20,
        };
        let bytes = [SYNC_WORD, FrameHeader::parameter_byte(&params), 20, 0xAB];
        let header = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(header.params, params);
        assert_eq!(header.crc, 0xAB);
    }

    #[test]
    fn test_header_rejects_bad_sync() {
        let result = FrameHeader::parse(&[0x9D, 0x00, 0x20, 0x00]);
        assert_eq!(result, Err(SbcError::BadSyncWord(0x9D)));
    }

    #[test]
    fn test_validate_rejects_zero_bitpool() {
        let params = hq_params(ChannelMode::Stereo, 0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_max_bitpool_per_mode() {
        assert_eq!(max_bitpool(ChannelMode::Mono, 8), 128);
        assert_eq!(max_bitpool(ChannelMode::Mono, 4), 64);
        assert_eq!(max_bitpool(ChannelMode::JointStereo, 8), 250);
        assert_eq!(max_bitpool(ChannelMode::Stereo, 4), 128);
    }
}

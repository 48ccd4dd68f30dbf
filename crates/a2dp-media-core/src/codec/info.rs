//! SBC codec information element
//!
//! The 4-byte codec-specific block exchanged during stream configuration.
//! As a capability each field is a bitfield of supported options; as a
//! configuration exactly one bit per field is set.
//!
//! ```text
//! byte 0: sampling frequency (b7..b4) | channel mode (b3..b0)
//! byte 1: block length (b7..b4) | subbands (b3..b2) | allocation (b1..b0)
//! byte 2: minimum bitpool
//! byte 3: maximum bitpool
//! ```

use crate::codec::negotiator::NegotiationError;
use crate::codec::sbc::{
    max_bitpool, AllocationMethod, ChannelMode, SamplingFrequency, MAX_BITPOOL, MIN_BITPOOL,
};
use crate::config::EncoderConfig;

/// Length of the codec-specific information
pub const SBC_INFO_LEN: usize = 4;

/// Length-prefixed element: LOSC, media type, codec type, then the SBC block
pub const SBC_ELEMENT_LEN: usize = 7;

/// Media type nibble for audio
const MEDIA_TYPE_AUDIO: u8 = 0x00;

/// Codec type for SBC
const CODEC_TYPE_SBC: u8 = 0x00;

/// Sampling frequency support (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcSamplingFrequency(pub u8);

impl SbcSamplingFrequency {
    pub const HZ_16000: u8 = 0x80;
    pub const HZ_32000: u8 = 0x40;
    pub const HZ_44100: u8 = 0x20;
    pub const HZ_48000: u8 = 0x10;

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::HZ_16000 | Self::HZ_32000 | Self::HZ_44100 | Self::HZ_48000)
    }

    #[must_use]
    pub const fn supports(&self, freq: u8) -> bool {
        (self.0 & freq) != 0
    }

    fn bit(freq: SamplingFrequency) -> u8 {
        match freq {
            SamplingFrequency::Hz16000 => Self::HZ_16000,
            SamplingFrequency::Hz32000 => Self::HZ_32000,
            SamplingFrequency::Hz44100 => Self::HZ_44100,
            SamplingFrequency::Hz48000 => Self::HZ_48000,
        }
    }
}

/// Channel mode support (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcChannelMode(pub u8);

impl SbcChannelMode {
    pub const MONO: u8 = 0x08;
    pub const DUAL_CHANNEL: u8 = 0x04;
    pub const STEREO: u8 = 0x02;
    pub const JOINT_STEREO: u8 = 0x01;

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::MONO | Self::DUAL_CHANNEL | Self::STEREO | Self::JOINT_STEREO)
    }

    #[must_use]
    pub const fn supports(&self, mode: u8) -> bool {
        (self.0 & mode) != 0
    }

    fn bit(mode: ChannelMode) -> u8 {
        match mode {
            ChannelMode::Mono => Self::MONO,
            ChannelMode::DualChannel => Self::DUAL_CHANNEL,
            ChannelMode::Stereo => Self::STEREO,
            ChannelMode::JointStereo => Self::JOINT_STEREO,
        }
    }
}

/// Block length support (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcBlockLength(pub u8);

impl SbcBlockLength {
    pub const BLOCKS_4: u8 = 0x80;
    pub const BLOCKS_8: u8 = 0x40;
    pub const BLOCKS_12: u8 = 0x20;
    pub const BLOCKS_16: u8 = 0x10;

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::BLOCKS_4 | Self::BLOCKS_8 | Self::BLOCKS_12 | Self::BLOCKS_16)
    }

    #[must_use]
    pub const fn supports(&self, blocks: u8) -> bool {
        (self.0 & blocks) != 0
    }

    fn bit(blocks: u8) -> u8 {
        match blocks {
            4 => Self::BLOCKS_4,
            8 => Self::BLOCKS_8,
            12 => Self::BLOCKS_12,
            _ => Self::BLOCKS_16,
        }
    }
}

/// Subband support (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcSubbands(pub u8);

impl SbcSubbands {
    pub const SUBBANDS_4: u8 = 0x08;
    pub const SUBBANDS_8: u8 = 0x04;

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::SUBBANDS_4 | Self::SUBBANDS_8)
    }

    #[must_use]
    pub const fn supports(&self, subbands: u8) -> bool {
        (self.0 & subbands) != 0
    }
}

/// Allocation method support (bitfield)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcAllocationMethod(pub u8);

impl SbcAllocationMethod {
    pub const SNR: u8 = 0x02;
    pub const LOUDNESS: u8 = 0x01;

    #[must_use]
    pub const fn all() -> Self {
        Self(Self::SNR | Self::LOUDNESS)
    }

    #[must_use]
    pub const fn supports(&self, method: u8) -> bool {
        (self.0 & method) != 0
    }
}

/// SBC capability or configuration block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcCodecInfo {
    pub sampling_frequencies: SbcSamplingFrequency,
    pub channel_modes: SbcChannelMode,
    pub block_lengths: SbcBlockLength,
    pub subbands: SbcSubbands,
    pub allocation_methods: SbcAllocationMethod,
    pub min_bitpool: u8,
    pub max_bitpool: u8,
}

impl Default for SbcCodecInfo {
    /// Everything a conforming SBC implementation supports
    fn default() -> Self {
        Self {
            sampling_frequencies: SbcSamplingFrequency::all(),
            channel_modes: SbcChannelMode::all(),
            block_lengths: SbcBlockLength::all(),
            subbands: SbcSubbands::all(),
            allocation_methods: SbcAllocationMethod::all(),
            min_bitpool: MIN_BITPOOL,
            max_bitpool: MAX_BITPOOL,
        }
    }
}

impl SbcCodecInfo {
    /// Parses the 4-byte codec-specific block
    pub fn parse(data: &[u8]) -> Result<Self, NegotiationError> {
        if data.len() < SBC_INFO_LEN {
            return Err(NegotiationError::MalformedCodecInfo(data.len()));
        }
        let info = Self {
            sampling_frequencies: SbcSamplingFrequency(data[0] & 0xF0),
            channel_modes: SbcChannelMode(data[0] & 0x0F),
            block_lengths: SbcBlockLength(data[1] & 0xF0),
            subbands: SbcSubbands(data[1] & 0x0C),
            allocation_methods: SbcAllocationMethod(data[1] & 0x03),
            min_bitpool: data[2],
            max_bitpool: data[3],
        };
        info.validate()?;
        Ok(info)
    }

    /// Parses a length-prefixed element (LOSC, media type, codec type, block)
    pub fn parse_element(data: &[u8]) -> Result<Self, NegotiationError> {
        if data.len() < SBC_ELEMENT_LEN
            || (data[0] as usize) < SBC_ELEMENT_LEN - 1
            || data[1] >> 4 != MEDIA_TYPE_AUDIO
            || data[2] != CODEC_TYPE_SBC
        {
            return Err(NegotiationError::MalformedCodecInfo(data.len()));
        }
        Self::parse(&data[3..])
    }

    /// Serializes the 4-byte codec-specific block
    pub fn to_bytes(&self) -> [u8; SBC_INFO_LEN] {
        [
            self.sampling_frequencies.0 | self.channel_modes.0,
            self.block_lengths.0 | self.subbands.0 | self.allocation_methods.0,
            self.min_bitpool,
            self.max_bitpool,
        ]
    }

    /// Serializes the length-prefixed element
    pub fn to_element(&self) -> [u8; SBC_ELEMENT_LEN] {
        let b = self.to_bytes();
        [
            (SBC_ELEMENT_LEN - 1) as u8,
            MEDIA_TYPE_AUDIO << 4,
            CODEC_TYPE_SBC,
            b[0],
            b[1],
            b[2],
            b[3],
        ]
    }

    /// Every field must offer at least one option and the bitpool range must be sane
    pub fn validate(&self) -> Result<(), NegotiationError> {
        if self.sampling_frequencies.0 == 0 {
            return Err(NegotiationError::NoCommonConfiguration("sampling frequency"));
        }
        if self.channel_modes.0 == 0 {
            return Err(NegotiationError::NoCommonConfiguration("channel mode"));
        }
        if self.block_lengths.0 == 0 {
            return Err(NegotiationError::NoCommonConfiguration("block length"));
        }
        if self.subbands.0 == 0 {
            return Err(NegotiationError::NoCommonConfiguration("subband count"));
        }
        if self.allocation_methods.0 == 0 {
            return Err(NegotiationError::NoCommonConfiguration("allocation method"));
        }
        if self.min_bitpool < MIN_BITPOOL
            || self.max_bitpool > MAX_BITPOOL
            || self.min_bitpool > self.max_bitpool
        {
            return Err(NegotiationError::InvalidRange {
                min: self.min_bitpool,
                max: self.max_bitpool,
            });
        }
        Ok(())
    }

    /// Options both sides support; bitpool ranges are intersected
    pub fn intersect(&self, other: &Self) -> Result<Self, NegotiationError> {
        let common = Self {
            sampling_frequencies: SbcSamplingFrequency(
                self.sampling_frequencies.0 & other.sampling_frequencies.0,
            ),
            channel_modes: SbcChannelMode(self.channel_modes.0 & other.channel_modes.0),
            block_lengths: SbcBlockLength(self.block_lengths.0 & other.block_lengths.0),
            subbands: SbcSubbands(self.subbands.0 & other.subbands.0),
            allocation_methods: SbcAllocationMethod(
                self.allocation_methods.0 & other.allocation_methods.0,
            ),
            min_bitpool: self.min_bitpool.max(other.min_bitpool),
            max_bitpool: self.max_bitpool.min(other.max_bitpool),
        };
        common.validate()?;
        Ok(common)
    }

    /// Picks the preferred configuration out of a (common) capability
    ///
    /// Preference: 44.1 kHz then 48 kHz, joint stereo, 16 blocks,
    /// 8 subbands, loudness allocation.
    pub fn select_configuration(&self) -> Result<EncoderConfig, NegotiationError> {
        let freq = [
            (SbcSamplingFrequency::HZ_44100, SamplingFrequency::Hz44100),
            (SbcSamplingFrequency::HZ_48000, SamplingFrequency::Hz48000),
            (SbcSamplingFrequency::HZ_32000, SamplingFrequency::Hz32000),
            (SbcSamplingFrequency::HZ_16000, SamplingFrequency::Hz16000),
        ]
        .into_iter()
        .find(|(bit, _)| self.sampling_frequencies.supports(*bit))
        .map(|(_, f)| f)
        .ok_or(NegotiationError::NoCommonConfiguration("sampling frequency"))?;

        let mode = [
            (SbcChannelMode::JOINT_STEREO, ChannelMode::JointStereo),
            (SbcChannelMode::STEREO, ChannelMode::Stereo),
            (SbcChannelMode::DUAL_CHANNEL, ChannelMode::DualChannel),
            (SbcChannelMode::MONO, ChannelMode::Mono),
        ]
        .into_iter()
        .find(|(bit, _)| self.channel_modes.supports(*bit))
        .map(|(_, m)| m)
        .ok_or(NegotiationError::NoCommonConfiguration("channel mode"))?;

        let blocks = [16u8, 12, 8, 4]
            .into_iter()
            .find(|b| self.block_lengths.supports(SbcBlockLength::bit(*b)))
            .ok_or(NegotiationError::NoCommonConfiguration("block length"))?;

        let subbands = if self.subbands.supports(SbcSubbands::SUBBANDS_8) {
            8
        } else if self.subbands.supports(SbcSubbands::SUBBANDS_4) {
            4
        } else {
            return Err(NegotiationError::NoCommonConfiguration("subband count"));
        };

        let allocation = if self.allocation_methods.supports(SbcAllocationMethod::LOUDNESS) {
            AllocationMethod::Loudness
        } else if self.allocation_methods.supports(SbcAllocationMethod::SNR) {
            AllocationMethod::Snr
        } else {
            return Err(NegotiationError::NoCommonConfiguration("allocation method"));
        };

        let ceiling = max_bitpool(mode, subbands);
        let max = self.max_bitpool.min(ceiling);
        if self.min_bitpool > max {
            return Err(NegotiationError::InvalidRange {
                min: self.min_bitpool,
                max,
            });
        }

        Ok(EncoderConfig {
            channel_mode: mode,
            subbands,
            blocks,
            sampling_frequency: freq,
            allocation,
            bitpool: max,
            min_bitpool: self.min_bitpool,
            max_bitpool: max,
            ..EncoderConfig::default()
        })
    }

    /// Single-option block describing an encoder configuration
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            sampling_frequencies: SbcSamplingFrequency(SbcSamplingFrequency::bit(
                config.sampling_frequency,
            )),
            channel_modes: SbcChannelMode(SbcChannelMode::bit(config.channel_mode)),
            block_lengths: SbcBlockLength(SbcBlockLength::bit(config.blocks)),
            subbands: SbcSubbands(if config.subbands == 4 {
                SbcSubbands::SUBBANDS_4
            } else {
                SbcSubbands::SUBBANDS_8
            }),
            allocation_methods: SbcAllocationMethod(match config.allocation {
                AllocationMethod::Snr => SbcAllocationMethod::SNR,
                AllocationMethod::Loudness => SbcAllocationMethod::LOUDNESS,
            }),
            min_bitpool: config.min_bitpool,
            max_bitpool: config.max_bitpool,
        }
    }
}

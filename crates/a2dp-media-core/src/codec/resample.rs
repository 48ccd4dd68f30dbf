//! PCM format conversion and up-sampling for the encoder input
//!
//! Feeding PCM may arrive at a lower rate, 8-bit, or mono. The
//! [`Upsampler`] turns it into interleaved 16-bit samples at the encoder
//! rate and channel count using sample-and-hold, keeping its phase across
//! calls so consecutive reads splice without gaps.

use crate::codec::sbc::{ChannelMode, SamplingFrequency};
use crate::config::EncoderConfig;

/// Whether feeding PCM can go straight to the encoder
pub fn is_passthrough(src_rate: u32, src_channels: u8, bits: u8, dst_rate: u32, dst_channels: u8) -> bool {
    src_rate == dst_rate && src_channels == dst_channels && bits == 16
}

/// Encoder rate a feeding rate is up-sampled to
///
/// Rates in the 44.1 kHz family map to 44.1 kHz, the 8 kHz family to
/// 48 kHz. Other rates are not supported as feeding input.
pub fn encoder_rate_for(feeding_rate: u32) -> Option<SamplingFrequency> {
    match feeding_rate {
        11_025 | 22_050 | 44_100 => Some(SamplingFrequency::Hz44100),
        8_000 | 12_000 | 16_000 | 24_000 | 32_000 | 48_000 => Some(SamplingFrequency::Hz48000),
        _ => None,
    }
}

/// Adapts the encoder to a feeding format
///
/// Moves the encoder to the rate family of the feed and promotes mono to
/// joint stereo. Returns `None` when nothing changed.
pub fn reconfigure_for_feeding(encoder: &EncoderConfig, feeding_rate: u32) -> Option<EncoderConfig> {
    let mut updated = *encoder;
    match encoder_rate_for(feeding_rate) {
        Some(rate) => updated.sampling_frequency = rate,
        None => tracing::debug!(feeding_rate, "Unsupported feeding rate, keeping encoder rate"),
    }
    if updated.channel_mode == ChannelMode::Mono {
        updated.channel_mode = ChannelMode::JointStereo;
    }
    (updated != *encoder).then_some(updated)
}

/// Source samples to read per encoder frame, spread over a short cycle
///
/// `frame_samples * src / dst` is fractional for some rate pairs
/// (e.g. 128 * 32000 / 48000 = 85.33). Those pairs read one extra sample
/// on the first reads of each cycle so the long-run average is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCadence {
    /// Cycle length minus one
    max: u32,
    /// Reads with index up to and including this get an extra sample
    threshold: u32,
    counter: u32,
    enabled: bool,
}

impl ReadCadence {
    pub fn for_rate(src_rate: u32) -> Self {
        let (enabled, max, threshold) = match src_rate {
            32_000 | 8_000 => (true, 2, 0),
            16_000 => (true, 2, 1),
            _ => (false, 0, 0),
        };
        Self {
            max,
            threshold,
            counter: 0,
            enabled,
        }
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Source sample frames to read for the next encoder frame
    pub fn next_read(&mut self, frame_samples: usize, src_rate: u32, dst_rate: u32) -> usize {
        let mut samples = frame_samples * src_rate as usize / dst_rate.max(1) as usize;
        if self.enabled {
            if self.counter <= self.threshold {
                samples += 1;
            }
            self.counter += 1;
            if self.counter > self.max {
                self.counter = 0;
            }
        }
        samples
    }
}

/// Sample-and-hold up-sampler with channel and width conversion
#[derive(Debug, Clone)]
pub struct Upsampler {
    src_rate: u32,
    dst_rate: u32,
    src_channels: u8,
    dst_channels: u8,
    bits_per_sample: u8,
    /// Output owed per input sample, in units of `src_rate`
    phase: u32,
}

impl Upsampler {
    pub fn new(src_rate: u32, dst_rate: u32, src_channels: u8, dst_channels: u8, bits_per_sample: u8) -> Self {
        Self {
            src_rate: src_rate.max(1),
            dst_rate: dst_rate.max(1),
            src_channels: src_channels.clamp(1, 2),
            dst_channels: dst_channels.clamp(1, 2),
            bits_per_sample: if bits_per_sample == 8 { 8 } else { 16 },
            phase: 0,
        }
    }

    /// Key identifying the conversion
    pub fn rates(&self) -> (u32, u32) {
        (self.src_rate, self.dst_rate)
    }

    pub fn reset(&mut self) {
        self.phase = 0;
    }

    /// Bytes of one input sample frame
    pub fn input_frame_bytes(&self) -> usize {
        self.src_channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Converts `input` and appends interleaved output samples to `out`
    ///
    /// A trailing partial input frame is ignored. Returns the number of
    /// output sample frames produced.
    pub fn process(&mut self, input: &[u8], out: &mut Vec<i16>) -> usize {
        let mut produced = 0;
        for frame in input.chunks_exact(self.input_frame_bytes()) {
            let (left, right) = self.decode_frame(frame);
            self.phase += self.dst_rate;
            while self.phase >= self.src_rate {
                self.phase -= self.src_rate;
                if self.dst_channels == 2 {
                    out.push(left);
                    out.push(right);
                } else {
                    out.push(((left as i32 + right as i32) / 2) as i16);
                }
                produced += 1;
            }
        }
        produced
    }

    fn decode_frame(&self, frame: &[u8]) -> (i16, i16) {
        let sample = |i: usize| -> i16 {
            if self.bits_per_sample == 8 {
                // Unsigned 8-bit PCM
                ((frame[i] as i16) - 128) << 8
            } else {
                i16::from_le_bytes([frame[2 * i], frame[2 * i + 1]])
            }
        };
        let left = sample(0);
        let right = if self.src_channels == 2 { sample(1) } else { left };
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_32k_to_48k() {
        let mut cadence = ReadCadence::for_rate(32_000);
        let reads: Vec<usize> = (0..6).map(|_| cadence.next_read(128, 32_000, 48_000)).collect();
        assert_eq!(reads, vec![86, 85, 85, 86, 85, 85]);
        assert_eq!(reads[..3].iter().sum::<usize>(), 256);
    }

    #[test]
    fn test_cadence_16k_to_48k() {
        let mut cadence = ReadCadence::for_rate(16_000);
        let reads: Vec<usize> = (0..3).map(|_| cadence.next_read(128, 16_000, 48_000)).collect();
        assert_eq!(reads, vec![43, 43, 42]);
    }

    #[test]
    fn test_cadence_exact_ratio_has_no_fraction() {
        let mut cadence = ReadCadence::for_rate(22_050);
        assert_eq!(cadence.next_read(128, 22_050, 44_100), 64);
        assert_eq!(cadence.next_read(128, 22_050, 44_100), 64);
    }

    #[test]
    fn test_upsample_doubles_mono_to_stereo() {
        let mut up = Upsampler::new(22_050, 44_100, 1, 2, 16);
        let input: Vec<u8> = [100i16, -200].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        assert_eq!(up.process(&input, &mut out), 4);
        assert_eq!(out, vec![100, 100, 100, 100, -200, -200, -200, -200]);
    }

    #[test]
    fn test_upsample_keeps_phase_across_calls() {
        let mut up = Upsampler::new(32_000, 48_000, 2, 2, 16);
        let input = vec![0u8; 4 * 85];
        let mut out = Vec::new();
        let mut total = 0;
        total += up.process(&vec![0u8; 4 * 86], &mut out);
        total += up.process(&input, &mut out);
        total += up.process(&input, &mut out);
        assert_eq!(total, 384);
        assert_eq!(out.len(), 768);
    }

    #[test]
    fn test_eight_bit_conversion() {
        let mut up = Upsampler::new(48_000, 48_000, 1, 1, 8);
        let mut out = Vec::new();
        up.process(&[128, 255, 0], &mut out);
        assert_eq!(out, vec![0, 127 << 8, -128 << 8]);
    }

    #[test]
    fn test_encoder_rate_family() {
        assert_eq!(encoder_rate_for(8_000), Some(SamplingFrequency::Hz48000));
        assert_eq!(encoder_rate_for(24_000), Some(SamplingFrequency::Hz48000));
        assert_eq!(encoder_rate_for(11_025), Some(SamplingFrequency::Hz44100));
        assert_eq!(encoder_rate_for(96_000), None);
        assert!(is_passthrough(44_100, 2, 16, 44_100, 2));
        assert!(!is_passthrough(44_100, 1, 16, 44_100, 2));
    }

    #[test]
    fn test_reconfigure_for_feeding() {
        let encoder = EncoderConfig::default();
        assert_eq!(reconfigure_for_feeding(&encoder, 44_100), None);

        let updated = reconfigure_for_feeding(&encoder, 16_000).unwrap();
        assert_eq!(updated.sampling_frequency, SamplingFrequency::Hz48000);

        let mono = EncoderConfig {
            channel_mode: ChannelMode::Mono,
            ..encoder
        };
        let updated = reconfigure_for_feeding(&mono, 22_050).unwrap();
        assert_eq!(updated.channel_mode, ChannelMode::JointStereo);
        assert_eq!(updated.sampling_frequency, SamplingFrequency::Hz44100);
    }
}

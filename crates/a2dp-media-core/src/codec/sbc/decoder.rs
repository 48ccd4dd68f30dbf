//! SBC decoder
//!
//! Parses and CRC-checks one frame at a time, dequantizes the subband
//! samples and runs the synthesis filterbank to 16-bit interleaved PCM.

use std::f32::consts::PI;

use super::allocation::{allocate, ChannelTable};
use super::bits::{frame_crc, BitReader};
use super::tables::proto;
use super::{ChannelMode, FrameHeader, SbcError, SbcParams, HEADER_SIZE};

#[derive(Debug, Clone)]
struct SynthesisState {
    v: Vec<f32>,
}

/// SBC frame decoder
///
/// Filter history is kept across frames; it is rebuilt whenever the
/// incoming frame parameters change shape (subbands or channel mode).
#[derive(Debug, Default)]
pub struct SbcDecoder {
    current: Option<SbcParams>,
    state: Vec<SynthesisState>,
    /// Synthesis matrix `cos((i + 0.5) * (k + M/2) * pi / M)` laid out `[k][i]`
    matrix: Vec<f32>,
    frames_decoded: u64,
}

/// Result of decoding one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub params: SbcParams,
    /// Bytes of input consumed
    pub consumed: usize,
    /// Interleaved samples appended to the output
    pub samples: usize,
}

impl SbcDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops filter history so the next frame starts from silence
    pub fn reset(&mut self) {
        self.current = None;
        self.state.clear();
        self.matrix.clear();
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Decodes the frame at the start of `data`, appending PCM to `pcm`
    pub fn decode(&mut self, data: &[u8], pcm: &mut Vec<i16>) -> Result<DecodedFrame, SbcError> {
        let header = FrameHeader::parse(data)?;
        let p = header.params;
        let frame_len = p.frame_length();
        if data.len() < frame_len {
            return Err(SbcError::Truncated {
                needed: frame_len,
                available: data.len(),
            });
        }

        let channels = p.channels();
        let m = p.subbands as usize;
        let blocks = p.blocks as usize;
        let joint = p.channel_mode == ChannelMode::JointStereo;

        let mut protected_bits = 4 * m * channels;
        if joint {
            protected_bits += m;
        }
        let actual = frame_crc(&data[..frame_len], protected_bits);
        if actual != header.crc {
            return Err(SbcError::CrcMismatch {
                expected: header.crc,
                actual,
            });
        }

        let mut reader = BitReader::new(&data[HEADER_SIZE..frame_len]);
        let mut join = [false; 8];
        if joint {
            for flag in join.iter_mut().take(m) {
                *flag = reader.read(1)? == 1;
            }
        }
        let mut scale_factors: ChannelTable = [[0; 8]; 2];
        for ch_sf in scale_factors.iter_mut().take(channels) {
            for sf in ch_sf.iter_mut().take(m) {
                *sf = reader.read(4)? as i32;
            }
        }

        let bits = allocate(&p, &scale_factors);
        self.prepare(&p);

        let start = pcm.len();
        for _ in 0..blocks {
            let mut block = [[0.0f32; 8]; 2];
            for ch in 0..channels {
                for sb in 0..m {
                    let nbits = bits[ch][sb];
                    if nbits > 0 {
                        let q = reader.read(nbits as u8)?;
                        block[ch][sb] = dequantize(q, scale_factors[ch][sb], nbits);
                    }
                }
            }
            if joint {
                for sb in 0..m {
                    if join[sb] {
                        let (mid, side) = (block[0][sb], block[1][sb]);
                        block[0][sb] = mid + side;
                        block[1][sb] = mid - side;
                    }
                }
            }

            let mut out = [[0.0f32; 8]; 2];
            for ch in 0..channels {
                self.synthesize(ch, &block[ch], &mut out[ch]);
            }
            for j in 0..m {
                for ch_out in out.iter().take(channels) {
                    pcm.push(ch_out[j].round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
                }
            }
        }

        self.frames_decoded += 1;
        Ok(DecodedFrame {
            params: p,
            consumed: frame_len,
            samples: pcm.len() - start,
        })
    }

    fn prepare(&mut self, params: &SbcParams) {
        let reshaped = match self.current {
            Some(cur) => cur.subbands != params.subbands || cur.channels() != params.channels(),
            None => true,
        };
        if reshaped {
            let m = params.subbands as usize;
            self.state = vec![SynthesisState { v: vec![0.0; 20 * m] }; params.channels()];
            self.matrix = synthesis_matrix(m);
        }
        self.current = Some(*params);
    }

    fn synthesize(&mut self, ch: usize, samples: &[f32; 8], out: &mut [f32; 8]) {
        let m = match self.current {
            Some(p) => p.subbands as usize,
            None => return,
        };
        let window = proto(m);
        let v = &mut self.state[ch].v;
        v.copy_within(0..18 * m, 2 * m);
        for k in 0..2 * m {
            let row = &self.matrix[k * m..(k + 1) * m];
            v[k] = row.iter().zip(samples.iter()).map(|(n, s)| n * s).sum();
        }

        let mut u = [0.0f32; 80];
        for i in 0..5 {
            for j in 0..m {
                u[i * 2 * m + j] = v[i * 4 * m + j];
                u[i * 2 * m + m + j] = v[i * 4 * m + 3 * m + j];
            }
        }
        let gain = m as f32;
        for (j, o) in out.iter_mut().enumerate().take(m) {
            *o = (0..10)
                .map(|i| u[j + m * i] * window[j + m * i] * gain)
                .sum();
        }
    }
}

fn synthesis_matrix(m: usize) -> Vec<f32> {
    let mut matrix = Vec::with_capacity(2 * m * m);
    for k in 0..2 * m {
        for i in 0..m {
            let arg = (i as f32 + 0.5) * (k as f32 + m as f32 / 2.0) * PI / m as f32;
            matrix.push(arg.cos());
        }
    }
    matrix
}

fn dequantize(q: u32, sf: i32, bits: i32) -> f32 {
    let levels = ((1u32 << bits) - 1) as f32;
    let scale = (2u32 << sf) as f32;
    scale * ((2.0 * q as f32 + 1.0) / levels - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sbc::{AllocationMethod, SamplingFrequency, SbcEncoder};

    fn params(mode: ChannelMode, subbands: u8) -> SbcParams {
        SbcParams {
            frequency: SamplingFrequency::Hz48000,
            channel_mode: mode,
            blocks: 16,
            subbands,
            allocation: AllocationMethod::Loudness,
            bitpool: 32,
        }
    }

    fn encode_frames(p: SbcParams, pcm: &[i16]) -> Vec<u8> {
        let mut encoder = SbcEncoder::new(p).unwrap();
        let per_frame = p.samples_per_frame() * p.channels();
        let mut out = Vec::new();
        for chunk in pcm.chunks_exact(per_frame) {
            encoder.encode(chunk, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_decode_silence_is_silent() {
        let p = params(ChannelMode::JointStereo, 8);
        let encoded = encode_frames(p, &vec![0i16; 256 * 3]);
        let mut decoder = SbcDecoder::new();
        let mut pcm = Vec::new();
        let mut offset = 0;
        while offset < encoded.len() {
            let frame = decoder.decode(&encoded[offset..], &mut pcm).unwrap();
            offset += frame.consumed;
        }
        assert_eq!(pcm.len(), 256 * 3);
        assert!(pcm.iter().all(|s| s.abs() <= 4), "silence decoded to noise");
        assert_eq!(decoder.frames_decoded(), 3);
    }

    #[test]
    fn test_decode_tone_has_energy() {
        let p = params(ChannelMode::Mono, 4);
        let pcm: Vec<i16> = (0..64 * 8)
            .map(|i| ((i as f32 * 2.0 * PI * 1000.0 / 48000.0).sin() * 8000.0) as i16)
            .collect();
        let encoded = encode_frames(p, &pcm);
        let mut decoder = SbcDecoder::new();
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < encoded.len() {
            offset += decoder.decode(&encoded[offset..], &mut out).unwrap().consumed;
        }
        assert_eq!(out.len(), pcm.len());
        let energy: f64 = out[out.len() / 2..].iter().map(|&s| (s as f64).powi(2)).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn test_decode_detects_corruption() {
        let p = params(ChannelMode::Stereo, 8);
        let pcm: Vec<i16> = (0..256).map(|i| (i * 50) as i16).collect();
        let mut encoded = encode_frames(p, &pcm);
        encoded[5] ^= 0x10;
        let result = SbcDecoder::new().decode(&encoded, &mut Vec::new());
        assert!(matches!(result, Err(SbcError::CrcMismatch { .. })));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let p = params(ChannelMode::DualChannel, 8);
        let encoded = encode_frames(p, &vec![100i16; 256]);
        let result = SbcDecoder::new().decode(&encoded[..encoded.len() - 3], &mut Vec::new());
        assert!(matches!(result, Err(SbcError::Truncated { .. })));
    }
}

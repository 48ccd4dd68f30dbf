//! SBC encoder
//!
//! Runs the polyphase analysis filterbank on interleaved 16-bit PCM,
//! picks scale factors (and joint-stereo flags), allocates bits and packs
//! one frame per call.

use std::f32::consts::PI;

use super::allocation::{allocate, ChannelTable};
use super::bits::{frame_crc, BitWriter};
use super::tables::proto;
use super::{ChannelMode, FrameHeader, SbcError, SbcParams, SYNC_WORD};

/// Subband samples for one frame: `[block][channel][subband]`
type SubbandFrame = [[[f32; 8]; 2]; 16];

/// Per-channel analysis history
#[derive(Debug, Clone)]
struct AnalysisState {
    /// Last 10*M input samples, newest first
    x: Vec<f32>,
}

/// SBC frame encoder
#[derive(Debug)]
pub struct SbcEncoder {
    params: SbcParams,
    state: [AnalysisState; 2],
    /// Analysis matrix, `cos((k + 0.5) * (i - M/2) * pi / M)` laid out `[k][i]`
    matrix: Vec<f32>,
    frames_encoded: u64,
}

impl SbcEncoder {
    /// Creates an encoder for validated parameters
    pub fn new(params: SbcParams) -> Result<Self, SbcError> {
        params.validate()?;
        let m = params.subbands as usize;
        let history = AnalysisState {
            x: vec![0.0; 10 * m],
        };
        Ok(Self {
            params,
            state: [history.clone(), history],
            matrix: analysis_matrix(m),
            frames_encoded: 0,
        })
    }

    /// Reinitialises the encoder with new parameters, clearing filter history
    pub fn reset(&mut self, params: SbcParams) -> Result<(), SbcError> {
        *self = Self::new(params)?;
        Ok(())
    }

    pub fn params(&self) -> &SbcParams {
        &self.params
    }

    /// Length of each frame this encoder produces
    pub fn frame_length(&self) -> usize {
        self.params.frame_length()
    }

    /// Frames produced since the last reset
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Encodes one frame of interleaved PCM and appends it to `out`
    ///
    /// `pcm` must hold exactly `blocks * subbands * channels` samples.
    /// Returns the number of bytes appended.
    pub fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<usize, SbcError> {
        let p = self.params;
        let channels = p.channels();
        let m = p.subbands as usize;
        let blocks = p.blocks as usize;
        let expected = blocks * m * channels;
        if pcm.len() != expected {
            return Err(SbcError::PcmLength {
                expected,
                actual: pcm.len(),
            });
        }

        let mut sb_samples: SubbandFrame = [[[0.0; 8]; 2]; 16];
        for (blk, block_pcm) in pcm.chunks_exact(m * channels).enumerate() {
            for ch in 0..channels {
                let input = block_pcm.iter().skip(ch).step_by(channels).copied();
                self.analyze(ch, input, &mut sb_samples[blk][ch]);
            }
        }

        let mut scale_factors: ChannelTable = [[0; 8]; 2];
        for ch in 0..channels {
            for sb in 0..m {
                scale_factors[ch][sb] = scale_factor(sb_samples[..blocks].iter().map(|b| b[ch][sb]));
            }
        }

        let mut join = [false; 8];
        if p.channel_mode == ChannelMode::JointStereo {
            apply_joint_stereo(&mut sb_samples[..blocks], &mut scale_factors, &mut join, m);
        }

        let bits = allocate(&p, &scale_factors);

        let start = out.len();
        out.extend_from_slice(&[SYNC_WORD, FrameHeader::parameter_byte(&p), p.bitpool, 0]);
        let mut protected_bits = 0;
        {
            let mut writer = BitWriter::new(out);
            if p.channel_mode == ChannelMode::JointStereo {
                for flag in join.iter().take(m) {
                    writer.write(*flag as u32, 1);
                }
                protected_bits += m;
            }
            for ch_sf in scale_factors.iter().take(channels) {
                for &sf in ch_sf.iter().take(m) {
                    writer.write(sf as u32, 4);
                }
            }
            protected_bits += 4 * m * channels;

            for block in sb_samples.iter().take(blocks) {
                for ch in 0..channels {
                    for sb in 0..m {
                        let nbits = bits[ch][sb];
                        if nbits > 0 {
                            let q = quantize(block[ch][sb], scale_factors[ch][sb], nbits);
                            writer.write(q, nbits as u8);
                        }
                    }
                }
            }
        }

        let frame_len = p.frame_length();
        out.resize(start + frame_len, 0);
        out[start + 3] = frame_crc(&out[start..], protected_bits);
        self.frames_encoded += 1;
        Ok(frame_len)
    }

    fn analyze(&mut self, ch: usize, input: impl Iterator<Item = i16>, out: &mut [f32; 8]) {
        let m = self.params.subbands as usize;
        let window = proto(m);
        let x = &mut self.state[ch].x;
        x.copy_within(0..9 * m, m);
        for (i, sample) in input.take(m).enumerate() {
            x[m - 1 - i] = sample as f32;
        }

        let mut y = [0.0f32; 16];
        for (i, yi) in y.iter_mut().enumerate().take(2 * m) {
            *yi = (0..5).map(|j| x[i + j * 2 * m] * window[i + j * 2 * m]).sum();
        }
        for (k, s) in out.iter_mut().enumerate().take(m) {
            let row = &self.matrix[k * 2 * m..(k + 1) * 2 * m];
            *s = row.iter().zip(y.iter()).map(|(c, v)| c * v).sum();
        }
    }
}

fn analysis_matrix(m: usize) -> Vec<f32> {
    let mut matrix = Vec::with_capacity(m * 2 * m);
    for k in 0..m {
        for i in 0..2 * m {
            let arg = (k as f32 + 0.5) * (i as f32 - m as f32 / 2.0) * PI / m as f32;
            matrix.push(arg.cos());
        }
    }
    matrix
}

/// Smallest scale factor whose range `2^(sf+1)` covers every sample
fn scale_factor(samples: impl Iterator<Item = f32>) -> i32 {
    let peak = samples.fold(0.0f32, |acc, s| acc.max(s.abs()));
    let mut sf = 0;
    while sf < 15 && peak >= (2u32 << sf) as f32 {
        sf += 1;
    }
    sf
}

fn apply_joint_stereo(
    blocks: &mut [[[f32; 8]; 2]],
    scale_factors: &mut ChannelTable,
    join: &mut [bool; 8],
    m: usize,
) {
    // The last subband never uses mid/side coding
    for sb in 0..m - 1 {
        let mid_sf = scale_factor(blocks.iter().map(|b| (b[0][sb] + b[1][sb]) / 2.0));
        let side_sf = scale_factor(blocks.iter().map(|b| (b[0][sb] - b[1][sb]) / 2.0));
        if mid_sf + side_sf < scale_factors[0][sb] + scale_factors[1][sb] {
            join[sb] = true;
            scale_factors[0][sb] = mid_sf;
            scale_factors[1][sb] = side_sf;
            for block in blocks.iter_mut() {
                let (l, r) = (block[0][sb], block[1][sb]);
                block[0][sb] = (l + r) / 2.0;
                block[1][sb] = (l - r) / 2.0;
            }
        }
    }
}

fn quantize(sample: f32, sf: i32, bits: i32) -> u32 {
    let levels = ((1u32 << bits) - 1) as f32;
    let scale = (2u32 << sf) as f32;
    let q = ((sample / scale + 1.0) * levels / 2.0).floor();
    q.clamp(0.0, (levels - 1.0).max(0.0)) as u32
}

//! Bit allocation shared by the encoder and decoder
//!
//! Both sides derive the per-subband bit counts from the scale factors and
//! the bitpool, so the allocation must be bit-exact and deterministic.

use super::tables::{LOUDNESS_OFFSET_4, LOUDNESS_OFFSET_8};
use super::{AllocationMethod, ChannelMode, SbcParams};

/// Per-channel, per-subband scale factors or bit counts
pub type ChannelTable = [[i32; 8]; 2];

fn bitneed(params: &SbcParams, scale_factors: &[i32; 8]) -> [i32; 8] {
    let sb_count = params.subbands as usize;
    let mut need = [0i32; 8];
    match params.allocation {
        AllocationMethod::Snr => {
            need[..sb_count].copy_from_slice(&scale_factors[..sb_count]);
        }
        AllocationMethod::Loudness => {
            let freq = params.frequency.index();
            for sb in 0..sb_count {
                let offset = if sb_count == 4 {
                    LOUDNESS_OFFSET_4[freq][sb]
                } else {
                    LOUDNESS_OFFSET_8[freq][sb]
                };
                need[sb] = if scale_factors[sb] == 0 {
                    -5
                } else {
                    let loudness = scale_factors[sb] - offset;
                    if loudness > 0 {
                        loudness / 2
                    } else {
                        loudness
                    }
                };
            }
        }
    }
    need
}

/// Finds the bitslice and the bit count it consumes for the given needs
fn find_bitslice(needs: &[&[i32; 8]], sb_count: usize, bitpool: i32) -> (i32, i32) {
    let mut max_bitneed = i32::MIN;
    let mut min_bitneed = i32::MAX;
    for need in needs {
        for &n in &need[..sb_count] {
            max_bitneed = max_bitneed.max(n);
            min_bitneed = min_bitneed.min(n);
        }
    }

    let mut bitcount = 0;
    let mut slicecount = 0;
    let mut bitslice = max_bitneed + 1;
    loop {
        bitslice -= 1;
        bitcount += slicecount;
        slicecount = 0;
        for need in needs {
            for &n in &need[..sb_count] {
                if n > bitslice + 1 && n < bitslice + 16 {
                    slicecount += 1;
                } else if n == bitslice + 1 {
                    slicecount += 2;
                }
            }
        }
        if bitcount + slicecount >= bitpool {
            break;
        }
        // Every subband is saturated; nothing below this slice can add bits
        if slicecount == 0 && bitslice < min_bitneed - 16 {
            break;
        }
    }
    if bitcount + slicecount == bitpool {
        bitcount += slicecount;
        bitslice -= 1;
    }
    (bitslice, bitcount)
}

fn initial_bits(need: &[i32; 8], sb_count: usize, bitslice: i32) -> [i32; 8] {
    let mut bits = [0i32; 8];
    for sb in 0..sb_count {
        bits[sb] = if need[sb] < bitslice + 2 {
            0
        } else {
            (need[sb] - bitslice).min(16)
        };
    }
    bits
}

/// Computes bits per subband for every channel of a frame
pub fn allocate(params: &SbcParams, scale_factors: &ChannelTable) -> ChannelTable {
    let sb_count = params.subbands as usize;
    let bitpool = params.bitpool as i32;
    let mut bits: ChannelTable = [[0; 8]; 2];

    match params.channel_mode {
        ChannelMode::Mono | ChannelMode::DualChannel => {
            for ch in 0..params.channels() {
                let need = bitneed(params, &scale_factors[ch]);
                let (bitslice, mut bitcount) = find_bitslice(&[&need], sb_count, bitpool);
                bits[ch] = initial_bits(&need, sb_count, bitslice);

                let mut sb = 0;
                while bitcount < bitpool && sb < sb_count {
                    if bits[ch][sb] >= 2 && bits[ch][sb] < 16 {
                        bits[ch][sb] += 1;
                        bitcount += 1;
                    } else if need[sb] == bitslice + 1 && bitpool > bitcount + 1 {
                        bits[ch][sb] = 2;
                        bitcount += 2;
                    }
                    sb += 1;
                }
                sb = 0;
                while bitcount < bitpool && sb < sb_count {
                    if bits[ch][sb] < 16 {
                        bits[ch][sb] += 1;
                        bitcount += 1;
                    }
                    sb += 1;
                }
            }
        }
        ChannelMode::Stereo | ChannelMode::JointStereo => {
            let needs = [
                bitneed(params, &scale_factors[0]),
                bitneed(params, &scale_factors[1]),
            ];
            let (bitslice, mut bitcount) =
                find_bitslice(&[&needs[0], &needs[1]], sb_count, bitpool);
            bits[0] = initial_bits(&needs[0], sb_count, bitslice);
            bits[1] = initial_bits(&needs[1], sb_count, bitslice);

            let (mut ch, mut sb) = (0usize, 0usize);
            while bitcount < bitpool && sb < sb_count {
                if bits[ch][sb] >= 2 && bits[ch][sb] < 16 {
                    bits[ch][sb] += 1;
                    bitcount += 1;
                } else if needs[ch][sb] == bitslice + 1 && bitpool > bitcount + 1 {
                    bits[ch][sb] = 2;
                    bitcount += 2;
                }
                if ch == 1 {
                    ch = 0;
                    sb += 1;
                } else {
                    ch = 1;
                }
            }
            ch = 0;
            sb = 0;
            while bitcount < bitpool && sb < sb_count {
                if bits[ch][sb] < 16 {
                    bits[ch][sb] += 1;
                    bitcount += 1;
                }
                if ch == 1 {
                    ch = 0;
                    sb += 1;
                } else {
                    ch = 1;
                }
            }
        }
    }
    bits
}

//! TX pipeline: feeding PCM to paced SBC packets
//!
//! Each tick asks the [`FramePacer`] how many frames are owed, reads one
//! frame of PCM at a time from the [`FeedingSource`], encodes it and packs
//! frames into [`TransportPacket`]s bounded by the MTU.

use tracing::{debug, error, warn};

use crate::codec::resample::{is_passthrough, ReadCadence, Upsampler};
use crate::codec::sbc::{SbcEncoder, SbcError};
use crate::config::{EncoderConfig, EngineConfig, FeedingConfig, FeedingMode, LinkCapabilities};
use crate::engine::io::FeedingSource;
use crate::engine::pacer::{FramePacer, TickBudget};
use crate::engine::packet::{PacketBuilder, TransportPacket, MAX_FRAMES_PER_PACKET};
use crate::engine::queue::PacketQueue;
use crate::stats::MediaStats;

/// Result of reading one frame of PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRead {
    Full,
    /// Short read, but carried-over samples completed the frame
    Covered { missing: usize },
    /// Short read padded with silence
    Padded { missing: usize },
    /// Short read; no frame produced
    Short { missing: usize },
}

/// Pulls PCM from the feeding source in encoder-frame units
///
/// Keeps whatever a short read returned so no audio is lost when the
/// source catches up.
#[derive(Debug)]
pub struct FeedingReader {
    feeding: FeedingConfig,
    dst_rate: u32,
    dst_channels: u8,
    passthrough: bool,
    cadence: ReadCadence,
    upsampler: Upsampler,
    /// Raw bytes of a partially read frame (passthrough)
    pending: Vec<u8>,
    /// Converted samples not yet handed to the encoder
    converted: Vec<i16>,
    scratch: Vec<u8>,
}

impl FeedingReader {
    pub fn new(feeding: FeedingConfig, encoder: &EncoderConfig) -> Self {
        let dst_rate = encoder.sampling_frequency.hz();
        let dst_channels = encoder.channels();
        Self {
            feeding,
            dst_rate,
            dst_channels,
            passthrough: is_passthrough(
                feeding.sample_rate,
                feeding.channels,
                feeding.bits_per_sample,
                dst_rate,
                dst_channels,
            ),
            cadence: ReadCadence::for_rate(feeding.sample_rate),
            upsampler: Upsampler::new(
                feeding.sample_rate,
                dst_rate,
                feeding.channels,
                dst_channels,
                feeding.bits_per_sample,
            ),
            pending: Vec::new(),
            converted: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Drops buffered PCM and restarts the read cadence
    pub fn reset(&mut self) {
        self.pending.clear();
        self.converted.clear();
        self.cadence.reset();
        self.upsampler.reset();
    }

    /// Buffered bytes or samples carried between reads
    pub fn residue(&self) -> usize {
        self.pending.len() + self.converted.len()
    }

    /// Reads one frame of `frame_samples` sample frames into `out`
    pub fn read_frame(
        &mut self,
        source: &mut dyn FeedingSource,
        frame_samples: usize,
        out: &mut Vec<i16>,
    ) -> FeedRead {
        out.clear();
        if self.passthrough {
            self.read_passthrough(source, frame_samples, out)
        } else {
            self.read_converted(source, frame_samples, out)
        }
    }

    fn read_passthrough(
        &mut self,
        source: &mut dyn FeedingSource,
        frame_samples: usize,
        out: &mut Vec<i16>,
    ) -> FeedRead {
        let frame_bytes = frame_samples * self.dst_channels as usize * 2;
        let start = self.pending.len().min(frame_bytes);
        let needed = frame_bytes - start;
        self.pending.resize(frame_bytes, 0);
        let read = source.read_pcm(&mut self.pending[start..]);

        let outcome = if read >= needed {
            FeedRead::Full
        } else if self.feeding.mode == FeedingMode::Asynchronous {
            // Tail is already zeroed by the resize
            FeedRead::Padded {
                missing: needed - read,
            }
        } else {
            self.pending.truncate(start + read);
            return FeedRead::Short {
                missing: needed - read,
            };
        };

        out.extend(
            self.pending
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
        self.pending.clear();
        outcome
    }

    fn read_converted(
        &mut self,
        source: &mut dyn FeedingSource,
        frame_samples: usize,
        out: &mut Vec<i16>,
    ) -> FeedRead {
        let frame_len = frame_samples * self.dst_channels as usize;
        let mut outcome = FeedRead::Full;

        if self.converted.len() < frame_len {
            let src_samples =
                self.cadence
                    .next_read(frame_samples, self.feeding.sample_rate, self.dst_rate);
            let read_size = src_samples * self.upsampler.input_frame_bytes();
            self.scratch.clear();
            self.scratch.resize(read_size, 0);
            let mut read = source.read_pcm(&mut self.scratch);

            if read < read_size {
                let missing = read_size - read;
                if self.feeding.mode == FeedingMode::Asynchronous {
                    read = read_size;
                    outcome = FeedRead::Padded { missing };
                } else {
                    outcome = FeedRead::Short { missing };
                }
            }
            self.upsampler
                .process(&self.scratch[..read], &mut self.converted);
        }

        if self.converted.len() < frame_len {
            return match outcome {
                FeedRead::Short { missing } | FeedRead::Padded { missing } => {
                    FeedRead::Short { missing }
                }
                FeedRead::Full | FeedRead::Covered { .. } => FeedRead::Short { missing: 0 },
            };
        }
        out.extend(self.converted.drain(..frame_len));
        match outcome {
            FeedRead::Short { missing } => FeedRead::Covered { missing },
            other => other,
        }
    }
}

/// What one TX tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub budget: TickBudget,
    pub frames: usize,
    pub packets: usize,
    pub dropped: usize,
    pub flushed: usize,
    pub underrun: bool,
}

/// Encoder side of the media path
#[derive(Debug)]
pub struct TxPipeline {
    encoder_config: EncoderConfig,
    feeding: FeedingConfig,
    link: LinkCapabilities,
    mtu: usize,
    max_frames_per_packet: u8,
    tick_ms: u64,
    encoder: SbcEncoder,
    pacer: FramePacer,
    reader: FeedingReader,
    pcm: Vec<i16>,
    timestamp: u32,
    last_tick_us: Option<u64>,
    flush: bool,
}

impl TxPipeline {
    pub fn new(
        config: &EngineConfig,
        encoder_config: EncoderConfig,
        feeding: FeedingConfig,
        link: LinkCapabilities,
    ) -> Result<Self, SbcError> {
        let encoder = SbcEncoder::new(encoder_config.sbc_params())?;
        Ok(Self {
            encoder_config,
            feeding,
            link,
            mtu: encoder_config.mtu as usize,
            max_frames_per_packet: MAX_FRAMES_PER_PACKET,
            tick_ms: config.tx_tick_ms.max(1),
            encoder,
            pacer: FramePacer::new(
                config.tx_tick_ms,
                config.max_frames_per_tick,
                config.max_iterations_per_tick,
            ),
            reader: FeedingReader::new(feeding, &encoder_config),
            pcm: Vec::new(),
            timestamp: 0,
            last_tick_us: None,
            flush: false,
        })
    }

    pub fn encoder_config(&self) -> &EncoderConfig {
        &self.encoder_config
    }

    pub fn feeding(&self) -> &FeedingConfig {
        &self.feeding
    }

    pub fn link(&self) -> LinkCapabilities {
        self.link
    }

    pub fn max_frames_per_packet(&self) -> u8 {
        self.max_frames_per_packet
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    /// Applies new encoder parameters
    ///
    /// The encoder is rebuilt only when the frame parameters change.
    pub fn reconfigure(
        &mut self,
        encoder_config: EncoderConfig,
        mtu: u16,
        max_frames_per_packet: u8,
    ) -> Result<(), SbcError> {
        let params = encoder_config.sbc_params();
        if params != *self.encoder.params() {
            self.encoder.reset(params)?;
            debug!(
                bitpool = params.bitpool,
                subbands = params.subbands,
                blocks = params.blocks,
                "SBC encoder reset"
            );
        }
        let resampling_changed = encoder_config.sampling_frequency
            != self.encoder_config.sampling_frequency
            || encoder_config.channels() != self.encoder_config.channels();
        self.encoder_config = encoder_config;
        self.mtu = mtu as usize;
        self.max_frames_per_packet = max_frames_per_packet;
        if resampling_changed {
            self.reader = FeedingReader::new(self.feeding, &self.encoder_config);
        }
        Ok(())
    }

    pub fn set_feeding(&mut self, feeding: FeedingConfig) {
        self.feeding = feeding;
        self.reader = FeedingReader::new(feeding, &self.encoder_config);
    }

    pub fn set_link(&mut self, link: LinkCapabilities) {
        self.link = link;
    }

    /// Restarts pacing, buffered PCM and the sample clock
    pub fn reset_feeding(&mut self) {
        let bytes_per_tick = self.encoder_config.sampling_frequency.hz() as u64
            * self.feeding.bytes_per_sample_frame() as u64
            * self.tick_ms
            / 1000;
        self.pacer.reset(bytes_per_tick);
        self.reader.reset();
        self.timestamp = 0;
        self.last_tick_us = None;
        debug!(bytes_per_tick, "Feeding state reset");
    }

    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }

    pub fn is_flushing(&self) -> bool {
        self.flush
    }

    fn frame_samples(&self) -> usize {
        self.encoder_config.blocks as usize * self.encoder_config.subbands as usize
    }

    /// Feeding bytes one encoded frame represents
    pub fn bytes_per_frame(&self) -> usize {
        self.frame_samples() * self.feeding.bytes_per_sample_frame()
    }

    /// Produces the frames owed at `now_us` into `queue`
    pub fn on_tick(
        &mut self,
        now_us: u64,
        source: &mut dyn FeedingSource,
        queue: &PacketQueue<TransportPacket>,
        stats: &mut MediaStats,
    ) -> TickReport {
        if let Some(last) = self.last_tick_us {
            stats
                .metrics
                .record_tick_interval(now_us.saturating_sub(last));
        }
        self.last_tick_us = Some(now_us);

        let bpf = self.bytes_per_frame();
        let budget = self
            .pacer
            .on_tick(now_us, bpf, self.max_frames_per_packet, self.link.edr);
        stats.expected_frames += budget.projected as u64;
        if budget.limited {
            stats.limited_count += 1;
            stats.limited_frames += (budget.projected - budget.total_frames()) as u64;
        }

        let mut report = TickReport {
            budget,
            ..TickReport::default()
        };
        let frame_samples = self.frame_samples();
        let packet_cap = if self.max_frames_per_packet == 0 {
            MAX_FRAMES_PER_PACKET
        } else {
            self.max_frames_per_packet
        };
        let mut padded_bytes = 0u64;

        'iterations: for iteration in 0..budget.iterations {
            let mut remaining = budget.frames_per_iteration;
            while remaining > 0 {
                let frame_len = self.encoder.frame_length();
                let mut builder = PacketBuilder::new(self.timestamp, self.mtu, packet_cap);
                let mut starved = false;

                while remaining > 0 && builder.has_room(frame_len) {
                    match self.reader.read_frame(source, frame_samples, &mut self.pcm) {
                        FeedRead::Full => {}
                        FeedRead::Covered { missing } => {
                            stats.record_underflow(missing as u64, now_us);
                        }
                        FeedRead::Padded { missing } => {
                            stats.record_underflow(missing as u64, now_us);
                            padded_bytes += missing as u64;
                        }
                        FeedRead::Short { missing } => {
                            stats.record_underflow(missing as u64, now_us);
                            let owed = remaining
                                + (budget.iterations - iteration - 1) * budget.frames_per_iteration;
                            let owed_bytes = (owed * bpf) as u64;
                            self.pacer.recredit(owed_bytes);
                            stats.record_underrun(owed_bytes, now_us);
                            report.underrun = true;
                            debug!(owed, residue = self.reader.residue(), "Feeding underrun");
                            starved = true;
                            break;
                        }
                    }

                    if let Err(e) = self.encoder.encode(&self.pcm, builder.payload_mut()) {
                        error!(error = %e, "SBC encode failed, dropping frame");
                        starved = true;
                        break;
                    }
                    builder.commit_frame();
                    remaining -= 1;
                    report.frames += 1;
                }

                if builder.frames() == 0 && !starved {
                    error!(frame_len, mtu = self.mtu, "SBC frame does not fit the MTU");
                    break 'iterations;
                }
                if builder.frames() > 0 && !self.enqueue(builder.finish(), now_us, queue, stats, &mut report) {
                    break 'iterations;
                }
                if starved {
                    break 'iterations;
                }
            }
        }

        if padded_bytes > 0 && !report.underrun {
            stats.record_underrun(padded_bytes, now_us);
            report.underrun = true;
        }
        stats.metrics.record_overrun(report.dropped as u64);
        report
    }

    /// Queues a finished packet; returns false if the tick should stop
    fn enqueue(
        &mut self,
        packet: TransportPacket,
        now_us: u64,
        queue: &PacketQueue<TransportPacket>,
        stats: &mut MediaStats,
        report: &mut TickReport,
    ) -> bool {
        let frames = packet.frame_count;
        self.timestamp = self
            .timestamp
            .wrapping_add(frames as u32 * self.frame_samples() as u32);

        if self.flush {
            let flushed = queue.flush();
            stats.record_flush(flushed as u64, now_us);
            report.flushed += flushed;
            debug!(flushed, "TX flushing, packet discarded");
            return false;
        }

        stats.tx_enqueue.update(now_us, self.tick_ms * 1000);
        stats.record_packet(frames);
        let dropped = queue.push(packet);
        if dropped > 0 {
            warn!(
                dropped,
                capacity = queue.capacity(),
                "TX queue full, dropped oldest packets"
            );
            stats.record_drops(dropped as u64, now_us);
            report.dropped += dropped;
        }
        report.packets += 1;
        true
    }
}

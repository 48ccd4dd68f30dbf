//! RX pipeline: received packets to PCM at a paced frame budget

use tracing::{debug, info, warn};

use crate::codec::info::SbcCodecInfo;
use crate::codec::negotiator::NegotiationError;
use crate::codec::sbc::SbcDecoder;
use crate::config::EncoderConfig;
use crate::engine::io::AudioSink;
use crate::engine::packet::TransportPacket;
use crate::engine::queue::PacketQueue;
use crate::stats::MediaStats;

/// A received packet with its decode progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub packet: TransportPacket,
    pub frames_left: u8,
    /// Payload bytes already decoded
    pub offset: usize,
}

impl InboundPacket {
    pub fn new(packet: TransportPacket) -> Self {
        Self {
            frames_left: packet.frame_count,
            offset: 0,
            packet,
        }
    }
}

/// What one RX tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxReport {
    pub frames: usize,
    /// Packets fully consumed
    pub packets: usize,
    pub errors: usize,
}

/// Decoder side of the media path
#[derive(Debug)]
pub struct RxPipeline {
    decoder: SbcDecoder,
    config: EncoderConfig,
    tick_ms: u64,
    frames_per_tick: usize,
    pcm: Vec<i16>,
    bytes: Vec<u8>,
    flush: bool,
}

impl RxPipeline {
    pub fn new(tick_ms: u64) -> Self {
        let mut rx = Self {
            decoder: SbcDecoder::new(),
            config: EncoderConfig::default(),
            tick_ms: tick_ms.max(1),
            frames_per_tick: 0,
            pcm: Vec::new(),
            bytes: Vec::new(),
            flush: false,
        };
        rx.frames_per_tick = rx.compute_frames_per_tick();
        rx
    }

    fn compute_frames_per_tick(&self) -> usize {
        let samples = self.config.sampling_frequency.hz() as usize * self.tick_ms as usize / 1000;
        let per_frame = self.config.blocks as usize * self.config.subbands as usize;
        samples / per_frame.max(1) + 1
    }

    /// Reconfigures from the codec information element the source selected
    pub fn reset_decoder(&mut self, codec_info: &[u8]) -> Result<(), NegotiationError> {
        let info = SbcCodecInfo::parse(codec_info)?;
        let mut config = info.select_configuration()?;
        config.sanitize();
        self.config = config;
        self.decoder.reset();
        self.frames_per_tick = self.compute_frames_per_tick();
        self.flush = false;
        info!(
            sample_rate = self.sample_rate(),
            channels = self.channel_count(),
            frames_per_tick = self.frames_per_tick,
            "Sink decoder reset"
        );
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sampling_frequency.hz()
    }

    pub fn channel_count(&self) -> u8 {
        self.config.channels()
    }

    pub fn frames_per_tick(&self) -> usize {
        self.frames_per_tick
    }

    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }

    pub fn is_flushing(&self) -> bool {
        self.flush
    }

    /// Drops everything queued
    pub fn flush(&mut self, queue: &PacketQueue<InboundPacket>, stats: &mut MediaStats) -> usize {
        let flushed = queue.flush();
        stats.rx_flushed_packets += flushed as u64;
        if flushed > 0 {
            debug!(flushed, "RX queue flushed");
        }
        flushed
    }

    /// Decodes up to the per-tick frame budget
    pub fn on_tick(
        &mut self,
        queue: &PacketQueue<InboundPacket>,
        sink: &mut dyn AudioSink,
        stats: &mut MediaStats,
    ) -> RxReport {
        let mut report = RxReport::default();
        if self.flush {
            self.flush(queue, stats);
            return report;
        }

        let mut budget = self.frames_per_tick;
        while budget > 0 {
            let decoder = &mut self.decoder;
            let pcm = &mut self.pcm;
            pcm.clear();
            let step = queue.with_front(|inbound| {
                let take = (inbound.frames_left as usize).min(budget);
                let mut decoded = 0;
                let mut failed = false;
                for _ in 0..take {
                    let payload = &inbound.packet.payload[inbound.offset.min(inbound.packet.payload.len())..];
                    match decoder.decode(payload, pcm) {
                        Ok(frame) => {
                            inbound.offset += frame.consumed;
                            inbound.frames_left -= 1;
                            decoded += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, timestamp = inbound.packet.timestamp, "SBC decode failed, skipping rest of packet");
                            failed = true;
                            break;
                        }
                    }
                }
                (decoded, failed, failed || inbound.frames_left == 0)
            });

            let Some((decoded, failed, finished)) = step else {
                break;
            };
            if !self.pcm.is_empty() {
                self.bytes.clear();
                self.bytes
                    .extend(self.pcm.iter().flat_map(|s| s.to_le_bytes()));
                sink.write_pcm(&self.bytes);
                stats.rx_pcm_bytes += self.bytes.len() as u64;
            }
            stats.rx_frames_decoded += decoded as u64;
            report.frames += decoded;
            budget = budget.saturating_sub(decoded);
            if failed {
                stats.rx_decode_errors += 1;
                report.errors += 1;
            }
            if finished {
                queue.pop();
                report.packets += 1;
            } else if decoded == 0 {
                break;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sbc::SbcEncoder;

    #[derive(Default)]
    struct CollectSink {
        bytes: Vec<u8>,
    }

    impl AudioSink for CollectSink {
        fn write_pcm(&mut self, pcm: &[u8]) {
            self.bytes.extend_from_slice(pcm);
        }
    }

    fn encoded_packet(frames: u8) -> TransportPacket {
        let config = EncoderConfig::default();
        let mut encoder = SbcEncoder::new(config.sbc_params()).unwrap();
        let mut payload = Vec::new();
        for _ in 0..frames {
            encoder.encode(&[0i16; 256], &mut payload).unwrap();
        }
        TransportPacket::new(0, frames, payload)
    }

    #[test]
    fn test_frames_per_tick_by_rate() {
        let mut rx = RxPipeline::new(20);
        // 882 / 128 + 1
        assert_eq!(rx.frames_per_tick(), 7);
        // 48 kHz, joint stereo, 16 blocks, 8 subbands
        rx.reset_decoder(&[0x11, 0x15, 2, 53]).unwrap();
        assert_eq!(rx.sample_rate(), 48_000);
        assert_eq!(rx.channel_count(), 2);
        assert_eq!(rx.frames_per_tick(), 8);
        // 16 kHz mono, 4 blocks, 4 subbands
        rx.reset_decoder(&[0x88, 0x89, 2, 32]).unwrap();
        assert_eq!(rx.frames_per_tick(), 21);
    }

    #[test]
    fn test_reset_decoder_clears_flush() {
        let mut rx = RxPipeline::new(20);
        rx.set_flush(true);
        rx.reset_decoder(&[0x21, 0x15, 2, 53]).unwrap();
        assert!(!rx.is_flushing());
        assert!(rx.reset_decoder(&[0x21]).is_err());
    }

    #[test]
    fn test_partial_packet_stays_queued() {
        let mut rx = RxPipeline::new(20);
        let queue = PacketQueue::new(28);
        queue.push(InboundPacket::new(encoded_packet(10)));
        let mut sink = CollectSink::default();
        let mut stats = MediaStats::default();

        let report = rx.on_tick(&queue, &mut sink, &mut stats);
        assert_eq!(report.frames, 7);
        assert_eq!(report.packets, 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.with_front(|p| p.frames_left), Some(3));
        assert_eq!(sink.bytes.len(), 7 * 512);

        let report = rx.on_tick(&queue, &mut sink, &mut stats);
        assert_eq!(report.frames, 3);
        assert_eq!(report.packets, 1);
        assert!(queue.is_empty());
        assert_eq!(stats.rx_frames_decoded, 10);
    }

    #[test]
    fn test_budget_spans_packets() {
        let mut rx = RxPipeline::new(20);
        let queue = PacketQueue::new(28);
        for _ in 0..3 {
            queue.push(InboundPacket::new(encoded_packet(3)));
        }
        let mut sink = CollectSink::default();
        let mut stats = MediaStats::default();
        let report = rx.on_tick(&queue, &mut sink, &mut stats);
        assert_eq!(report.frames, 7);
        assert_eq!(report.packets, 2);
        assert_eq!(queue.with_front(|p| p.frames_left), Some(2));
    }

    #[test]
    fn test_corrupt_packet_is_skipped() {
        let mut rx = RxPipeline::new(20);
        let queue = PacketQueue::new(28);
        let mut bad = encoded_packet(3);
        bad.payload[0] = 0x00;
        queue.push(InboundPacket::new(bad));
        queue.push(InboundPacket::new(encoded_packet(2)));
        let mut sink = CollectSink::default();
        let mut stats = MediaStats::default();

        let report = rx.on_tick(&queue, &mut sink, &mut stats);
        assert_eq!(report.errors, 1);
        assert_eq!(report.frames, 2);
        assert_eq!(report.packets, 2);
        assert_eq!(stats.rx_decode_errors, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_drains_queue() {
        let mut rx = RxPipeline::new(20);
        let queue = PacketQueue::new(28);
        queue.push(InboundPacket::new(encoded_packet(1)));
        let mut sink = CollectSink::default();
        let mut stats = MediaStats::default();
        rx.set_flush(true);
        let report = rx.on_tick(&queue, &mut sink, &mut stats);
        assert_eq!(report.frames, 0);
        assert!(queue.is_empty());
        assert_eq!(stats.rx_flushed_packets, 1);
        assert!(sink.bytes.is_empty());
    }
}

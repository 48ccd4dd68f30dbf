//! Media session counters, snapshots and the diagnostic dump

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{EncoderConfig, FeedingConfig};
use crate::engine::MediaTaskState;
use crate::stats::scheduling::SchedulingStats;

/// Per-session summary metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionMetrics {
    /// Shortest TX tick interval (ms)
    pub timer_min_ms: f64,
    /// Longest TX tick interval (ms)
    pub timer_max_ms: f64,
    /// Mean TX tick interval (ms)
    pub timer_avg_ms: f64,
    timer_ticks: u64,
    /// Most packets dropped in a single tick
    pub buffer_overruns_max: u64,
    pub buffer_overruns_total: u64,
    /// Mean bytes owed per underrun
    pub buffer_underruns_avg: f64,
    pub buffer_underruns_count: u64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            timer_min_ms: f64::MAX,
            timer_max_ms: 0.0,
            timer_avg_ms: 0.0,
            timer_ticks: 0,
            buffer_overruns_max: 0,
            buffer_overruns_total: 0,
            buffer_underruns_avg: 0.0,
            buffer_underruns_count: 0,
        }
    }
}

impl SessionMetrics {
    pub fn record_tick_interval(&mut self, interval_us: u64) {
        let ms = interval_us as f64 / 1000.0;
        self.timer_min_ms = self.timer_min_ms.min(ms);
        self.timer_max_ms = self.timer_max_ms.max(ms);
        self.timer_ticks += 1;
        self.timer_avg_ms += (ms - self.timer_avg_ms) / self.timer_ticks as f64;
    }

    pub fn record_overrun(&mut self, dropped: u64) {
        self.buffer_overruns_max = self.buffer_overruns_max.max(dropped);
        self.buffer_overruns_total += dropped;
    }

    pub fn record_underrun(&mut self, bytes: u64) {
        self.buffer_underruns_count += 1;
        let n = self.buffer_underruns_count as f64;
        self.buffer_underruns_avg += (bytes as f64 - self.buffer_underruns_avg) / n;
    }

    /// Minimum interval, or zero before the first tick
    pub fn timer_min(&self) -> f64 {
        if self.timer_ticks == 0 {
            0.0
        } else {
            self.timer_min_ms
        }
    }
}

/// Counters for one streaming session
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaStats {
    pub session_start_us: u64,
    pub session_start: Option<DateTime<Utc>>,

    /// Transport drain attempts
    pub tx_readbuf_calls: u64,
    pub tx_enqueue: SchedulingStats,
    pub tx_dequeue: SchedulingStats,
    pub tx_packets: u64,
    pub tx_frames: u64,
    pub tx_max_frames_per_packet: u8,

    pub tx_flushed_packets: u64,
    pub tx_last_flushed_us: u64,
    pub tx_dropped_packets: u64,
    pub tx_dropouts: u64,
    pub tx_last_dropout_us: u64,

    /// Short reads from the feeding source
    pub underflow_count: u64,
    pub underflow_bytes: u64,
    pub last_underflow_us: u64,
    /// Ticks that ran out of PCM
    pub underrun_count: u64,
    pub underrun_bytes: u64,
    pub last_underrun_us: u64,

    pub expected_frames: u64,
    pub limited_frames: u64,
    pub limited_count: u64,

    pub rx_packets: u64,
    pub rx_frames_decoded: u64,
    pub rx_decode_errors: u64,
    pub rx_pcm_bytes: u64,
    pub rx_flushed_packets: u64,
    pub rx_dropped_packets: u64,

    pub metrics: SessionMetrics,
}

impl MediaStats {
    /// Clears all counters and stamps the session start
    pub fn start_session(&mut self, now_us: u64) {
        *self = Self {
            session_start_us: now_us,
            session_start: Some(Utc::now()),
            ..Self::default()
        };
    }

    pub fn record_underflow(&mut self, missing: u64, now_us: u64) {
        self.underflow_count += 1;
        self.underflow_bytes += missing;
        self.last_underflow_us = now_us;
    }

    pub fn record_underrun(&mut self, owed: u64, now_us: u64) {
        self.underrun_count += 1;
        self.underrun_bytes += owed;
        self.last_underrun_us = now_us;
        self.metrics.record_underrun(owed);
    }

    pub fn record_packet(&mut self, frames: u8) {
        self.tx_packets += 1;
        self.tx_frames += frames as u64;
        self.tx_max_frames_per_packet = self.tx_max_frames_per_packet.max(frames);
    }

    pub fn record_drops(&mut self, dropped: u64, now_us: u64) {
        if dropped == 0 {
            return;
        }
        self.tx_dropped_packets += dropped;
        self.tx_dropouts += 1;
        self.tx_last_dropout_us = now_us;
    }

    pub fn record_flush(&mut self, flushed: u64, now_us: u64) {
        self.tx_flushed_packets += flushed;
        self.tx_last_flushed_us = now_us;
    }

    pub fn average_frames_per_packet(&self) -> f64 {
        if self.tx_packets == 0 {
            0.0
        } else {
            self.tx_frames as f64 / self.tx_packets as f64
        }
    }
}

/// Read-only view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub now_us: u64,
    pub task_state: MediaTaskState,
    pub streaming: bool,
    pub tx_queue_len: usize,
    pub rx_queue_len: usize,
    pub encoder: EncoderConfig,
    pub feeding: FeedingConfig,
    pub stats: MediaStats,
}

impl StatsSnapshot {
    pub fn session_duration_ms(&self) -> u64 {
        if self.stats.session_start_us == 0 {
            return 0;
        }
        self.now_us.saturating_sub(self.stats.session_start_us) / 1000
    }
}

fn ago_ms(now_us: u64, then_us: u64) -> String {
    if then_us == 0 {
        "never".to_string()
    } else {
        format!("{} ms ago", now_us.saturating_sub(then_us) / 1000)
    }
}

fn write_scheduling(f: &mut fmt::Formatter<'_>, name: &str, s: &SchedulingStats) -> fmt::Result {
    writeln!(f, "  {name}:")?;
    writeln!(
        f,
        "    updates: {}  exact: {}  avg interval: {:.2} ms",
        s.total_updates,
        s.exact_count,
        s.average_interval_ms()
    )?;
    writeln!(
        f,
        "    overdue: {} (max {:.2} ms, avg {:.2} ms)",
        s.overdue_count,
        s.max_overdue_us as f64 / 1000.0,
        s.average_overdue_ms()
    )?;
    writeln!(
        f,
        "    premature: {} (max {:.2} ms, avg {:.2} ms)",
        s.premature_count,
        s.max_premature_us as f64 / 1000.0,
        s.average_premature_ms()
    )
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        let now = self.now_us;
        writeln!(f, "A2DP media state: {:?} (streaming: {})", self.task_state, self.streaming)?;
        if let Some(start) = s.session_start {
            writeln!(
                f,
                "  session start: {} ({} ms)",
                start.format("%Y-%m-%d %H:%M:%S"),
                self.session_duration_ms()
            )?;
        }
        writeln!(
            f,
            "  encoder: {:?} {} Hz, {} subbands, {} blocks, bitpool {} [{}-{}], {} kbps, mtu {}",
            self.encoder.channel_mode,
            self.encoder.sampling_frequency.hz(),
            self.encoder.subbands,
            self.encoder.blocks,
            self.encoder.bitpool,
            self.encoder.min_bitpool,
            self.encoder.max_bitpool,
            self.encoder.bitrate_kbps,
            self.encoder.mtu
        )?;
        writeln!(
            f,
            "  feeding: {} Hz, {} ch, {} bit, {:?}",
            self.feeding.sample_rate, self.feeding.channels, self.feeding.bits_per_sample, self.feeding.mode
        )?;
        writeln!(f, "  tx queue: {} packets, rx queue: {} packets", self.tx_queue_len, self.rx_queue_len)?;
        writeln!(
            f,
            "  packets: {}  frames: {} (max {}/packet, avg {:.2})  readbuf calls: {}",
            s.tx_packets,
            s.tx_frames,
            s.tx_max_frames_per_packet,
            s.average_frames_per_packet(),
            s.tx_readbuf_calls
        )?;
        write_scheduling(f, "enqueue", &s.tx_enqueue)?;
        write_scheduling(f, "dequeue", &s.tx_dequeue)?;
        writeln!(
            f,
            "  flushed: {} (last {})",
            s.tx_flushed_packets,
            ago_ms(now, s.tx_last_flushed_us)
        )?;
        writeln!(
            f,
            "  dropped: {} in {} dropouts (last {})",
            s.tx_dropped_packets,
            s.tx_dropouts,
            ago_ms(now, s.tx_last_dropout_us)
        )?;
        writeln!(
            f,
            "  underflow: {} reads, {} bytes (last {})",
            s.underflow_count,
            s.underflow_bytes,
            ago_ms(now, s.last_underflow_us)
        )?;
        writeln!(
            f,
            "  underrun: {} ticks, {} bytes (last {})",
            s.underrun_count,
            s.underrun_bytes,
            ago_ms(now, s.last_underrun_us)
        )?;
        writeln!(
            f,
            "  frames expected: {}  limited: {} in {} ticks",
            s.expected_frames, s.limited_frames, s.limited_count
        )?;
        writeln!(
            f,
            "  rx: {} packets, {} frames decoded, {} errors, {} pcm bytes, {} flushed, {} dropped",
            s.rx_packets,
            s.rx_frames_decoded,
            s.rx_decode_errors,
            s.rx_pcm_bytes,
            s.rx_flushed_packets,
            s.rx_dropped_packets
        )?;
        let m = &s.metrics;
        writeln!(
            f,
            "  timer: min {:.2} ms, max {:.2} ms, avg {:.2} ms",
            m.timer_min(),
            m.timer_max_ms,
            m.timer_avg_ms
        )?;
        write!(
            f,
            "  overruns: max {}, total {}  underruns: {} (avg {:.1} bytes)",
            m.buffer_overruns_max, m.buffer_overruns_total, m.buffer_underruns_count, m.buffer_underruns_avg
        )
    }
}

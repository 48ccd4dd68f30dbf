//! Simulated collaborators for running the engine without a Bluetooth stack
//!
//! The runner binary and the integration tests use these to drive a
//! [`MediaEngine`](crate::MediaEngine) end to end: a tone or file feeder
//! writing PCM into the feeding ring, a transport that counts (and
//! optionally records) packets, and a session layer that completes every
//! transition immediately.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use a2dp_media_core::engine::io::{
    AudioSink, OffloadStatus, PcmWriter, SessionTransitions, StreamState, TransportSender,
};
use a2dp_media_core::{EngineHandle, FeedingConfig, TransportPacket};
use crossbeam_channel::{select, Receiver};
use tracing::{debug, info, warn};

/// Sine generator producing interleaved PCM in the feeding format
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
    phase: f64,
    feeding: FeedingConfig,
}

impl ToneGenerator {
    pub fn new(frequency: f64, feeding: FeedingConfig) -> Self {
        Self {
            frequency,
            amplitude: 0.5,
            phase: 0.0,
            feeding,
        }
    }

    /// Fills `buf` with whole sample frames, returning the bytes written
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let frame_bytes = self.feeding.bytes_per_sample_frame();
        let step = std::f64::consts::TAU * self.frequency / self.feeding.sample_rate.max(1) as f64;
        let mut written = 0;
        for frame in buf.chunks_exact_mut(frame_bytes) {
            let value = self.amplitude * self.phase.sin();
            self.phase = (self.phase + step) % std::f64::consts::TAU;
            if self.feeding.bits_per_sample == 8 {
                frame.fill((value * 127.0 + 128.0) as u8);
            } else {
                let sample = ((value * i16::MAX as f64) as i16).to_le_bytes();
                for channel in frame.chunks_exact_mut(2) {
                    channel.copy_from_slice(&sample);
                }
            }
            written += frame_bytes;
        }
        written
    }
}

/// Where the feeder thread gets its PCM
pub enum FeedInput {
    Tone(ToneGenerator),
    /// Raw PCM in the feeding format; the feeder goes quiet at EOF
    File(Box<dyn Read + Send>),
}

impl FeedInput {
    pub fn file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::File(Box::new(std::io::BufReader::new(File::open(path)?))))
    }

    fn produce(&mut self, buf: &mut [u8]) -> usize {
        match self {
            Self::Tone(tone) => tone.fill(buf),
            Self::File(reader) => {
                let mut filled = 0;
                while filled < buf.len() {
                    match reader.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "PCM input read failed");
                            break;
                        }
                    }
                }
                filled
            }
        }
    }
}

/// Spawns a thread writing one tick of PCM into `writer` per `period`
///
/// The thread exits when `stop` is signalled or disconnected.
pub fn spawn_feeder(
    mut input: FeedInput,
    mut writer: PcmWriter,
    feeding: FeedingConfig,
    period: Duration,
    stop: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    let chunk = feeding.bytes_per_tick(period.as_millis() as u64) as usize;
    std::thread::Builder::new()
        .name("pcm_feeder".into())
        .spawn(move || {
            let ticks = crossbeam_channel::tick(period);
            let mut buf = vec![0u8; chunk];
            let mut eof_logged = false;
            loop {
                select! {
                    recv(ticks) -> _ => {
                        let n = input.produce(&mut buf);
                        if n == 0 && !eof_logged {
                            info!("PCM input exhausted");
                            eof_logged = true;
                        }
                        let accepted = writer.write(&buf[..n]);
                        if accepted < n {
                            debug!(dropped = n - accepted, "Feeding ring full");
                        }
                    }
                    recv(stop) -> _ => break,
                }
            }
        })
}

/// Totals kept by [`CountingTransport`]
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub packets: AtomicU64,
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub refused: AtomicU64,
}

impl TransportCounters {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Transport that accepts every packet unless told to refuse
///
/// With an output file, each packet is recorded as a big-endian `u16`
/// length followed by its wire bytes.
pub struct CountingTransport {
    counters: Arc<TransportCounters>,
    refuse: Arc<AtomicBool>,
    output: Option<BufWriter<File>>,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self {
            counters: Arc::default(),
            refuse: Arc::default(),
            output: None,
        }
    }

    pub fn with_output(path: &Path) -> std::io::Result<Self> {
        let mut transport = Self::new();
        transport.output = Some(BufWriter::new(File::create(path)?));
        Ok(transport)
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        Arc::clone(&self.counters)
    }

    /// Flag that makes the transport refuse packets while set
    pub fn refuse_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.refuse)
    }
}

impl Default for CountingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSender for CountingTransport {
    fn send(&mut self, packet: &TransportPacket) -> bool {
        if self.refuse.load(Ordering::Relaxed) {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let bytes = packet.to_bytes();
        if let Some(out) = self.output.as_mut() {
            let written = out
                .write_all(&(bytes.len() as u16).to_be_bytes())
                .and_then(|_| out.write_all(&bytes));
            if let Err(e) = written {
                warn!(error = %e, "Packet capture failed, disabling capture");
                self.output = None;
            }
        }
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .frames
            .fetch_add(packet.frame_count as u64, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        true
    }
}

impl Drop for CountingTransport {
    fn drop(&mut self) {
        if let Some(mut out) = self.output.take() {
            if let Err(e) = out.flush() {
                warn!(error = %e, "Failed to flush packet capture");
            }
        }
    }
}

/// Sink that counts decoded PCM bytes
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    bytes: Arc<AtomicU64>,
}

impl CountingSink {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl AudioSink for CountingSink {
    fn write_pcm(&mut self, pcm: &[u8]) {
        self.bytes.fetch_add(pcm.len() as u64, Ordering::Relaxed);
    }
}

/// Session layer that completes every transition immediately
///
/// Clones share state, so a test can keep one to inspect the stream state
/// or raise the call-active flag after handing another to the engine.
#[derive(Clone)]
pub struct SimulatedSession {
    state: Arc<Mutex<StreamState>>,
    call_active: Arc<AtomicBool>,
    /// Completions are dropped while set
    stalled: Arc<AtomicBool>,
    handle: Arc<OnceLock<EngineHandle>>,
}

impl SimulatedSession {
    pub fn new(state: StreamState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            call_active: Arc::default(),
            stalled: Arc::default(),
            handle: Arc::default(),
        }
    }

    /// Connects the session to the engine it reports completions to
    pub fn bind(&self, handle: EngineHandle) {
        if self.handle.set(handle).is_err() {
            warn!("Session already bound to an engine");
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn set_call_active(&self, active: bool) {
        self.call_active.store(active, Ordering::Relaxed);
    }

    /// Holds back completions so a request stays pending
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }

    fn complete(&self, next: StreamState, report: impl FnOnce(&EngineHandle)) {
        if self.stalled.load(Ordering::Relaxed) {
            debug!(?next, "Session stalled, completion held back");
            return;
        }
        self.set_state(next);
        match self.handle.get() {
            Some(handle) => report(handle),
            None => warn!("Session not bound, completion dropped"),
        }
    }
}

impl SessionTransitions for SimulatedSession {
    fn stream_state(&self) -> StreamState {
        self.state()
    }

    fn is_call_active(&self) -> bool {
        self.call_active.load(Ordering::Relaxed)
    }

    fn request_start(&mut self) {
        debug!("Session start requested");
        self.complete(StreamState::Started, |h| h.on_started(true));
    }

    fn request_stop(&mut self) {
        debug!("Session stop requested");
        self.complete(StreamState::Ready, |h| h.on_stopped(true));
    }

    fn request_suspend(&mut self) {
        debug!("Session suspend requested");
        self.complete(StreamState::Ready, |h| h.on_suspended(true));
    }

    fn request_offload_start(&mut self) {
        debug!("Offload requested, not available in simulation");
        if let Some(handle) = self.handle.get() {
            handle.on_offload_started(OffloadStatus::NoResources);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a2dp_media_core::FeedingMode;

    #[test]
    fn test_tone_fills_whole_frames() {
        let feeding = FeedingConfig::default();
        let mut tone = ToneGenerator::new(440.0, feeding);
        let mut buf = [0u8; 10];
        assert_eq!(tone.fill(&mut buf), 8);

        let mut buf = vec![0u8; 400];
        tone.fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_tone_eight_bit_is_unsigned() {
        let feeding = FeedingConfig {
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 8,
            mode: FeedingMode::Asynchronous,
        };
        let mut tone = ToneGenerator::new(440.0, feeding);
        let mut buf = [0u8; 1];
        tone.fill(&mut buf);
        assert_eq!(buf[0], 128);
    }

    #[test]
    fn test_counting_transport_refuses_on_flag() {
        let mut transport = CountingTransport::new();
        let counters = transport.counters();
        let packet = TransportPacket::new(0, 1, vec![0u8; 10]);
        assert!(transport.send(&packet));
        transport.refuse_flag().store(true, Ordering::Relaxed);
        assert!(!transport.send(&packet));
        assert_eq!(counters.packets(), 1);
        assert_eq!(counters.frames(), 1);
        assert_eq!(counters.bytes(), 15);
    }

    #[test]
    fn test_capture_records_length_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        {
            let mut transport = CountingTransport::with_output(&path).unwrap();
            transport.send(&TransportPacket::new(7, 2, vec![0xAA; 3]));
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0, 8]);
        assert_eq!(bytes.len(), 10);
    }
}

//! Shared harness for engine-level tests
//!
//! Builds a running engine wired to simulated collaborators, with the
//! control channel backed by in-memory channels.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use a2dp_media::engine::io::{PcmRingFeed, PcmWriter, StreamState};
use a2dp_media::sim::{CountingSink, CountingTransport, SimulatedSession, TransportCounters};
use a2dp_media::{Collaborators, EngineConfig, EngineHandle, MediaEngine, StatsSnapshot};
use crossbeam_channel::{Receiver, Sender};

pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Acks written by the engine, one channel message per byte
pub struct AckWriter(Sender<u8>);

impl Write for AckWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &byte in buf {
            let _ = self.0.send(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Command bytes for the engine; EOF once the sender is dropped
pub struct CommandReader(Receiver<u8>);

impl Read for CommandReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.0.recv() {
            Ok(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            Err(_) => Ok(0),
        }
    }
}

pub struct Harness {
    pub engine: MediaEngine,
    pub handle: EngineHandle,
    pub session: SimulatedSession,
    pub writer: PcmWriter,
    pub counters: Arc<TransportCounters>,
    pub refuse: Arc<std::sync::atomic::AtomicBool>,
    pub sink: CountingSink,
    pub commands: Sender<u8>,
    pub acks: Receiver<u8>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        // One second of 44.1 kHz stereo 16-bit PCM
        let (writer, feed) = PcmRingFeed::new(44_100 * 4);
        let transport = CountingTransport::new();
        let counters = transport.counters();
        let refuse = transport.refuse_flag();
        let session = SimulatedSession::new(StreamState::Ready);
        let sink = CountingSink::default();

        let mut engine = MediaEngine::new(
            config,
            Collaborators {
                feeding: Box::new(feed),
                sink: Box::new(sink.clone()),
                transport: Box::new(transport),
                session: Box::new(session.clone()),
            },
        )
        .unwrap();
        let handle = engine.handle();
        session.bind(handle.clone());
        engine.start().unwrap();

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (ack_tx, acks) = crossbeam_channel::unbounded();
        handle
            .attach_control(CommandReader(command_rx), AckWriter(ack_tx))
            .unwrap();

        Self {
            engine,
            handle,
            session,
            writer,
            counters,
            refuse,
            sink,
            commands,
            acks,
        }
    }

    pub fn send(&self, command: u8) {
        self.commands.send(command).unwrap();
    }

    /// Next ack byte, failing the test if none arrives
    pub fn ack(&self) -> u8 {
        self.acks
            .recv_timeout(ACK_TIMEOUT)
            .expect("Timed out waiting for ack")
    }

    pub fn acks(&self, count: usize) -> Vec<u8> {
        (0..count).map(|_| self.ack()).collect()
    }

    pub fn assert_no_ack(&self) {
        let extra = self.acks.recv_timeout(Duration::from_millis(200));
        assert!(extra.is_err(), "Unexpected ack {:?}", extra);
    }

    /// Snapshot round trip; also waits for every earlier task to run
    pub fn snapshot(&self) -> StatsSnapshot {
        self.handle.stats_snapshot().unwrap()
    }
}

/// Polls `condition` until it holds or the ack timeout passes
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < ACK_TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

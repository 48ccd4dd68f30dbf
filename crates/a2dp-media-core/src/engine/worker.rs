//! The media worker: task dispatch, control state machine and timers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::codec::negotiator::Negotiator;
use crate::codec::resample::reconfigure_for_feeding;
use crate::config::{EncoderConfig, EngineConfig, FeedingConfig, LinkCapabilities, PeerRole};
use crate::control::{AckStatus, ControlCommand, ControlSession};
use crate::stats::{MediaStats, StatsSnapshot};

use super::io::{OffloadStatus, StreamState};
use super::rx::RxPipeline;
use super::timer::Ticker;
use super::tx::TxPipeline;
use super::{Collaborators, EngineError, MediaTaskState, Shared, Task};

pub(crate) struct Worker {
    config: EngineConfig,
    negotiator: Negotiator,
    shared: Arc<Shared>,
    tasks: Sender<Task>,
    collab: Collaborators,
    tx: TxPipeline,
    rx: RxPipeline,
    stats: MediaStats,
    control: ControlSession,
    /// Id of the attached control connection
    control_id: Option<u64>,
    peer: PeerRole,
    link: LinkCapabilities,
    /// Bitrate asked for by the last configuration, before negotiation
    requested_bitrate_kbps: u16,
    data_channel_open: bool,
    tx_timer: Option<Ticker>,
    rx_timer: Option<Ticker>,
    generation: u64,
}

impl Worker {
    pub(crate) fn new(
        config: EngineConfig,
        collab: Collaborators,
        shared: Arc<Shared>,
        tasks: Sender<Task>,
    ) -> Result<Self, EngineError> {
        let mut encoder = config.encoder;
        encoder.sanitize();
        let link = LinkCapabilities::default();
        let tx = TxPipeline::new(&config, encoder, config.feeding, link)?;
        let mut worker = Self {
            negotiator: Negotiator::from_config(&config),
            rx: RxPipeline::new(config.rx_tick_ms),
            requested_bitrate_kbps: encoder.bitrate_kbps,
            config,
            shared,
            tasks,
            collab,
            tx,
            stats: MediaStats::default(),
            control: ControlSession::new(),
            control_id: None,
            peer: PeerRole::Sink,
            link,
            data_channel_open: false,
            tx_timer: None,
            rx_timer: None,
            generation: 0,
        };
        let feeding = worker.config.feeding;
        if let Err(e) = worker.apply_configuration(encoder, feeding, encoder.bitrate_kbps) {
            warn!(error = %e, "Default encoder configuration rejected");
        }
        Ok(worker)
    }

    /// Resets per-task state before the worker thread starts
    pub(crate) fn on_task_start(&mut self) {
        self.stats = MediaStats::default();
        self.data_channel_open = false;
        self.tx.set_flush(false);
        self.rx.set_flush(false);
        self.shared.set_rx_flush(false);
    }

    pub(crate) fn run(&mut self, tasks: &Receiver<Task>) {
        info!("Media worker running");
        for task in tasks.iter() {
            trace!(?task, "Media task");
            if matches!(task, Task::Shutdown) {
                break;
            }
            self.handle(task);
        }
        self.shutdown();
        info!("Media worker exited");
    }

    fn shutdown(&mut self) {
        self.stop_tx();
        self.stop_rx();
        let now = self.shared.now_us();
        let flushed = self.shared.tx_queue.flush();
        self.stats.record_flush(flushed as u64, now);
        self.rx.flush(&self.shared.rx_queue, &mut self.stats);
        self.control = ControlSession::new();
        self.control_id = None;
        self.data_channel_open = false;
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Shutdown => {}
            Task::Configure {
                encoder,
                feeding,
                reply,
            } => {
                let result = self.apply_configuration(encoder, feeding, encoder.bitrate_kbps);
                let _ = reply.send(result);
            }
            Task::SetPeer { role, link } => {
                info!(?role, edr = link.edr, edr_3mbps = link.edr_3mbps, "Peer updated");
                self.peer = role;
                self.link = link;
                self.tx.set_link(link);
                let encoder = *self.tx.encoder_config();
                let feeding = *self.tx.feeding();
                if let Err(e) =
                    self.apply_configuration(encoder, feeding, self.requested_bitrate_kbps)
                {
                    warn!(error = %e, "Renegotiation for new peer failed, keeping configuration");
                }
            }
            Task::ConfigureSink(info) => match self.rx.reset_decoder(&info) {
                Ok(()) => self.shared.set_rx_flush(false),
                Err(e) => warn!(error = %e, "Rejected sink codec configuration"),
            },
            Task::TxTick { generation } => {
                if self.tx_timer.as_ref().map(Ticker::generation) == Some(generation) {
                    self.tx_tick();
                }
            }
            Task::RxTick { generation } => {
                if self.rx_timer.as_ref().map(Ticker::generation) == Some(generation) {
                    self.rx_tick();
                }
            }
            Task::RxQueued { dropped } => self.on_rx_queued(dropped),
            Task::SetFlush { tx, rx } => self.set_flush(tx, rx),
            Task::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Task::ControlAttach(id, writer) => {
                self.control.attach(writer);
                self.control_id = Some(id);
            }
            Task::Control(byte) => self.handle_command(byte),
            Task::ControlDetached(id) => {
                if self.control_id != Some(id) {
                    debug!(id, "Stale control connection closed");
                    return;
                }
                self.control.detach();
                self.control_id = None;
                if self.is_streaming() {
                    info!("Audio path detached while streaming, requesting stop");
                    self.collab.session.request_stop();
                }
            }
            Task::Started(ok) => self.on_started(ok),
            Task::Stopped(ok) => self.on_stopped(ok, ControlCommand::Stop),
            Task::Suspended(ok) => self.on_stopped(ok, ControlCommand::Suspend),
            Task::OffloadStarted(status) => {
                let ack = match status {
                    OffloadStatus::Success => AckStatus::Success,
                    OffloadStatus::NoResources => AckStatus::Unsupported,
                    OffloadStatus::Failed => AckStatus::Failure,
                };
                self.control.ack_if(&[ControlCommand::OffloadStart], ack);
            }
        }
    }

    /// Adapts the encoder to the feed, negotiates the bitpool and applies it
    ///
    /// Nothing changes unless every step succeeds, including the bitrate
    /// later renegotiations start from.
    fn apply_configuration(
        &mut self,
        encoder: EncoderConfig,
        feeding: FeedingConfig,
        requested_bitrate_kbps: u16,
    ) -> Result<EncoderConfig, EngineError> {
        feeding.validate()?;
        let mut enc = encoder;
        enc.sanitize();
        if let Some(updated) = reconfigure_for_feeding(&enc, feeding.sample_rate) {
            info!(
                feeding_rate = feeding.sample_rate,
                encoder_rate = updated.sampling_frequency.hz(),
                channel_mode = ?updated.channel_mode,
                "Encoder reconfigured for feeding format"
            );
            enc = updated;
        }

        let target = self
            .negotiator
            .initial_bitrate(self.link)
            .min(requested_bitrate_kbps.max(1));
        let decision = self
            .negotiator
            .compute_bitpool(&enc, enc.min_bitpool, enc.max_bitpool, target)
            .inspect_err(|e| warn!(error = %e, "Bitpool negotiation failed"))?;
        enc.bitpool = decision.bitpool;
        enc.bitrate_kbps = decision.bitrate_kbps;

        let mtu = self.negotiator.effective_mtu(enc.mtu, self.link);
        let max_frames = self.negotiator.max_frames_per_packet(&enc, self.link);
        if max_frames == 0 {
            let frame_length = enc.frame_length();
            warn!(mtu, frame_length, "SBC frame does not fit the MTU");
            return Err(EngineError::MtuTooSmall { mtu, frame_length });
        }
        self.tx.reconfigure(enc, mtu, max_frames)?;
        self.requested_bitrate_kbps = requested_bitrate_kbps;
        if feeding != *self.tx.feeding() {
            self.tx.set_feeding(feeding);
            if self.tx_timer.is_some() {
                self.tx.reset_feeding();
            }
        }
        info!(
            bitpool = enc.bitpool,
            bitrate_kbps = enc.bitrate_kbps,
            mtu,
            max_frames,
            frame_length = enc.frame_length(),
            "Encoder configured"
        );
        Ok(enc)
    }

    fn tx_tick(&mut self) {
        let now = self.shared.now_us();
        let report = self.tx.on_tick(
            now,
            self.collab.feeding.as_mut(),
            &self.shared.tx_queue,
            &mut self.stats,
        );
        trace!(
            frames = report.frames,
            packets = report.packets,
            underrun = report.underrun,
            "TX tick"
        );
        self.drain_transport(now);
    }

    /// Hands queued packets to the transport until it refuses or the queue empties
    fn drain_transport(&mut self, now: u64) {
        let period_us = self.config.tx_tick_ms * 1000;
        loop {
            self.stats.tx_readbuf_calls += 1;
            let transport = &mut self.collab.transport;
            match self.shared.tx_queue.with_front(|packet| transport.send(packet)) {
                None => break,
                Some(true) => {
                    self.shared.tx_queue.pop();
                    self.stats.tx_dequeue.update(now, period_us);
                }
                Some(false) => {
                    debug!(queued = self.shared.tx_queue.len(), "Transport refused packet");
                    if self.control.fail_pending() {
                        warn!("Transport send failed, pending command failed");
                    }
                    break;
                }
            }
        }
    }

    fn rx_tick(&mut self) {
        if !self.data_channel_open || self.peer == PeerRole::Sink {
            trace!("Data channel closed or peer is a sink, not decoding");
            return;
        }
        let report = self
            .rx
            .on_tick(&self.shared.rx_queue, self.collab.sink.as_mut(), &mut self.stats);
        trace!(frames = report.frames, packets = report.packets, "RX tick");
    }

    fn on_rx_queued(&mut self, dropped: usize) {
        self.stats.rx_packets += 1;
        if dropped > 0 {
            warn!(dropped, "RX queue full, dropped oldest packets");
            self.stats.rx_dropped_packets += dropped as u64;
        }
        if self.rx_timer.is_none()
            && self.peer == PeerRole::Source
            && self.shared.rx_queue.len() >= self.config.delayed_start_packets
        {
            if let Err(e) = self.start_rx() {
                error!(error = %e, "Failed to start decoding");
            }
        }
    }

    fn set_flush(&mut self, tx: bool, rx: bool) {
        let now = self.shared.now_us();
        self.tx.set_flush(tx);
        if tx {
            let flushed = self.shared.tx_queue.flush();
            self.stats.record_flush(flushed as u64, now);
        }
        self.rx.set_flush(rx);
        self.shared.set_rx_flush(rx);
        if rx {
            self.stop_rx();
        }
    }

    fn is_streaming(&self) -> bool {
        self.tx_timer.is_some()
            || self.rx_timer.is_some()
            || self.collab.session.stream_state() == StreamState::Started
    }

    /// Sample rate and channel count of the audio path
    fn audio_config(&self) -> (u32, u8) {
        match self.peer {
            PeerRole::Source => (self.rx.sample_rate(), self.rx.channel_count()),
            PeerRole::Sink => {
                let enc = self.tx.encoder_config();
                (enc.sampling_frequency.hz(), enc.channels())
            }
        }
    }

    fn handle_command(&mut self, byte: u8) {
        let cmd = match ControlCommand::try_from(byte) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "Rejecting control command");
                self.control.reject(AckStatus::Failure);
                return;
            }
        };
        debug!(?cmd, "Control command");
        self.control.begin(cmd);

        match cmd {
            ControlCommand::CheckReady => {
                let ready = self.shared.state() == MediaTaskState::On
                    && matches!(
                        self.collab.session.stream_state(),
                        StreamState::Ready | StreamState::Started
                    );
                self.control
                    .ack(if ready { AckStatus::Success } else { AckStatus::Failure });
            }
            ControlCommand::Start => self.handle_start(),
            ControlCommand::Stop | ControlCommand::Suspend => self.handle_stop(cmd),
            ControlCommand::GetAudioConfig => {
                let (rate, channels) = self.audio_config();
                let mut payload = rate.to_le_bytes().to_vec();
                payload.push(channels);
                self.control.ack_with(AckStatus::Success, &payload);
            }
            ControlCommand::OffloadStart => self.collab.session.request_offload_start(),
        }
    }

    fn handle_start(&mut self) {
        if self.collab.session.is_call_active() {
            warn!("Start refused, call in progress");
            self.control.ack(AckStatus::IncallFailure);
            return;
        }
        let state = self.collab.session.stream_state();
        if self.tx_timer.is_some() || !matches!(state, StreamState::Ready | StreamState::Started) {
            warn!(?state, tx_running = self.tx_timer.is_some(), "Start refused");
            self.control.ack(AckStatus::Failure);
            return;
        }

        self.data_channel_open = true;
        if state == StreamState::Ready {
            self.collab.session.request_start();
        }
        if self.peer == PeerRole::Source || state == StreamState::Started {
            if state == StreamState::Started && self.peer == PeerRole::Sink {
                if let Err(e) = self.start_tx() {
                    error!(error = %e, "Failed to start TX");
                    self.control.ack(AckStatus::Failure);
                    return;
                }
            }
            self.control.ack(AckStatus::Success);
        }
    }

    fn handle_stop(&mut self, cmd: ControlCommand) {
        if !self.is_streaming() {
            self.control.ack(AckStatus::Success);
            return;
        }
        if cmd == ControlCommand::Suspend {
            self.collab.session.request_suspend();
        } else {
            self.collab.session.request_stop();
        }
        let now = self.shared.now_us();
        self.tx.set_flush(true);
        let flushed = self.shared.tx_queue.flush();
        self.stats.record_flush(flushed as u64, now);
        self.rx.flush(&self.shared.rx_queue, &mut self.stats);
    }

    fn on_started(&mut self, ok: bool) {
        if !ok {
            warn!("Stream start failed");
            self.data_channel_open = false;
            self.control.ack_if(&[ControlCommand::Start], AckStatus::Failure);
            return;
        }
        if self.peer == PeerRole::Sink {
            if let Err(e) = self.start_tx() {
                error!(error = %e, "Failed to start TX");
                self.control.ack_if(&[ControlCommand::Start], AckStatus::Failure);
                return;
            }
        }
        self.control.ack_if(&[ControlCommand::Start], AckStatus::Success);
    }

    fn on_stopped(&mut self, ok: bool, kind: ControlCommand) {
        let expected = [ControlCommand::Stop, ControlCommand::Suspend];
        if !ok {
            warn!(?kind, "Stream transition failed");
            self.tx.set_flush(false);
            self.control.ack_if(&expected, AckStatus::Failure);
            return;
        }
        self.stop_tx();
        self.stop_rx();
        if kind == ControlCommand::Stop {
            self.data_channel_open = false;
        }
        self.control.ack_if(&expected, AckStatus::Success);
    }

    fn start_tx(&mut self) -> Result<(), EngineError> {
        if self.tx_timer.is_some() {
            return Ok(());
        }
        self.stats.start_session(self.shared.now_us());
        self.tx.set_flush(false);
        let encoder = *self.tx.encoder_config();
        let feeding = *self.tx.feeding();
        if let Err(e) = self.apply_configuration(encoder, feeding, self.requested_bitrate_kbps) {
            warn!(error = %e, "Encoder update at start failed, keeping configuration");
        }
        self.tx.reset_feeding();

        self.generation += 1;
        self.tx_timer = Some(Ticker::spawn(
            "media_tx_tick",
            Duration::from_millis(self.config.tx_tick_ms),
            self.generation,
            self.tasks.clone(),
            |generation| Task::TxTick { generation },
        )?);
        info!(
            tick_ms = self.config.tx_tick_ms,
            bytes_per_tick = self.tx.pacer().bytes_per_tick(),
            "TX started"
        );
        Ok(())
    }

    fn stop_tx(&mut self) {
        if self.tx_timer.take().is_some() {
            info!("TX stopped");
        }
        self.tx.set_flush(false);
        self.tx.reset_feeding();
    }

    fn start_rx(&mut self) -> Result<(), EngineError> {
        self.generation += 1;
        self.rx_timer = Some(Ticker::spawn(
            "media_rx_tick",
            Duration::from_millis(self.config.rx_tick_ms),
            self.generation,
            self.tasks.clone(),
            |generation| Task::RxTick { generation },
        )?);
        info!(
            queued = self.shared.rx_queue.len(),
            frames_per_tick = self.rx.frames_per_tick(),
            "Decoding started"
        );
        Ok(())
    }

    fn stop_rx(&mut self) {
        if self.rx_timer.take().is_some() {
            info!("Decoding stopped");
        }
        self.rx.flush(&self.shared.rx_queue, &mut self.stats);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured_at: Utc::now(),
            now_us: self.shared.now_us(),
            task_state: self.shared.state(),
            streaming: self.is_streaming(),
            tx_queue_len: self.shared.tx_queue.len(),
            rx_queue_len: self.shared.rx_queue.len(),
            encoder: *self.tx.encoder_config(),
            feeding: *self.tx.feeding(),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::engine::io::{AudioSink, FeedingSource, SessionTransitions, TransportSender};
    use crate::engine::packet::TransportPacket;
    use crate::engine::queue::PacketQueue;

    struct Silent;

    impl FeedingSource for Silent {
        fn read_pcm(&mut self, _buf: &mut [u8]) -> usize {
            0
        }
    }

    impl AudioSink for Silent {
        fn write_pcm(&mut self, _pcm: &[u8]) {}
    }

    struct Refusing;

    impl TransportSender for Refusing {
        fn send(&mut self, _packet: &TransportPacket) -> bool {
            false
        }
    }

    /// Session fixed in one state, counting start requests
    #[derive(Clone)]
    struct FixedSession {
        state: StreamState,
        starts: Arc<AtomicUsize>,
    }

    impl FixedSession {
        fn new(state: StreamState) -> Self {
            Self {
                state,
                starts: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl SessionTransitions for FixedSession {
        fn stream_state(&self) -> StreamState {
            self.state
        }
        fn is_call_active(&self) -> bool {
            false
        }
        fn request_start(&mut self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn request_stop(&mut self) {}
        fn request_suspend(&mut self) {}
        fn request_offload_start(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn worker() -> (Worker, SharedBuf) {
        worker_with(FixedSession::new(StreamState::Ready))
    }

    fn worker_with(session: FixedSession) -> (Worker, SharedBuf) {
        let config = EngineConfig::default();
        let shared = Arc::new(Shared {
            origin: Instant::now(),
            state: AtomicU8::new(MediaTaskState::On as u8),
            rx_flush: AtomicBool::new(false),
            next_control_id: AtomicU64::new(0),
            tx_queue: PacketQueue::new(config.tx_queue_capacity),
            rx_queue: PacketQueue::new(config.rx_queue_capacity),
        });
        let (tasks, _rx) = crossbeam_channel::unbounded();
        let collab = Collaborators {
            feeding: Box::new(Silent),
            sink: Box::new(Silent),
            transport: Box::new(Refusing),
            session: Box::new(session),
        };
        let mut worker = Worker::new(config, collab, shared, tasks).unwrap();
        let buf = SharedBuf::default();
        worker.handle(Task::ControlAttach(0, Box::new(buf.clone())));
        (worker, buf)
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (mut worker, buf) = worker();
        worker.handle(Task::Control(0x42));
        assert_eq!(*buf.0.lock().unwrap(), vec![AckStatus::Failure as u8]);
        assert_eq!(worker.control.pending(), None);
    }

    #[test]
    fn test_transport_refusal_fails_pending() {
        let (mut worker, buf) = worker();
        worker.control.begin(ControlCommand::Start);
        worker
            .shared
            .tx_queue
            .push(TransportPacket::new(0, 1, vec![0; 8]));

        worker.drain_transport(1_000);
        assert_eq!(*buf.0.lock().unwrap(), vec![AckStatus::Failure as u8]);
        assert_eq!(worker.shared.tx_queue.len(), 1);
        assert_eq!(worker.stats.tx_readbuf_calls, 1);
        assert_eq!(worker.stats.tx_dequeue.total_updates, 0);
    }

    #[test]
    fn test_stale_tick_ignored() {
        let (mut worker, _buf) = worker();
        worker.handle(Task::TxTick { generation: 99 });
        assert_eq!(worker.stats.tx_readbuf_calls, 0);
        assert_eq!(worker.stats.expected_frames, 0);
    }

    #[test]
    fn test_rejected_configuration_keeps_last_good() {
        let (mut worker, _buf) = worker();
        let before = *worker.tx.encoder_config();
        let bad = EncoderConfig {
            min_bitpool: 60,
            max_bitpool: 10,
            ..EncoderConfig::default()
        };
        assert!(worker
            .apply_configuration(bad, FeedingConfig::default(), 200)
            .is_err());
        assert_eq!(*worker.tx.encoder_config(), before);
        assert_eq!(worker.requested_bitrate_kbps, 328);
    }

    #[test]
    fn test_rejected_configure_keeps_requested_bitrate() {
        let (mut worker, _buf) = worker();
        let negotiated = worker.tx.encoder_config().bitrate_kbps;
        let (reply, result) = crossbeam_channel::bounded(1);
        worker.handle(Task::Configure {
            encoder: EncoderConfig {
                bitrate_kbps: 120,
                min_bitpool: 60,
                max_bitpool: 10,
                ..EncoderConfig::default()
            },
            feeding: FeedingConfig::default(),
            reply,
        });
        assert!(result.recv().unwrap().is_err());
        assert_eq!(worker.requested_bitrate_kbps, 328);

        // Renegotiation for the same link lands on the same bitrate
        worker.handle(Task::SetPeer {
            role: PeerRole::Sink,
            link: LinkCapabilities::default(),
        });
        assert_eq!(worker.tx.encoder_config().bitrate_kbps, negotiated);
    }

    #[test]
    fn test_mtu_too_small_rejected() {
        let (mut worker, _buf) = worker();
        let before = *worker.tx.encoder_config();
        let small = EncoderConfig {
            mtu: 100,
            ..EncoderConfig::default()
        };
        let result = worker.apply_configuration(small, FeedingConfig::default(), 328);
        assert!(matches!(result, Err(EngineError::MtuTooSmall { mtu: 100, .. })));
        assert_eq!(*worker.tx.encoder_config(), before);
        assert!(worker.tx.max_frames_per_packet() > 0);
    }

    #[test]
    fn test_start_while_started_does_not_request_again() {
        let session = FixedSession::new(StreamState::Started);
        let starts = session.starts.clone();
        let (mut worker, buf) = worker_with(session);
        worker.peer = PeerRole::Source;
        worker.handle(Task::Control(ControlCommand::Start as u8));
        assert_eq!(*buf.0.lock().unwrap(), vec![AckStatus::Success as u8]);
        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_from_ready_requests_once() {
        let session = FixedSession::new(StreamState::Ready);
        let starts = session.starts.clone();
        let (mut worker, _buf) = worker_with(session);
        worker.handle(Task::Control(ControlCommand::Start as u8));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_detach_keeps_connection() {
        let (mut worker, buf) = worker();
        worker.handle(Task::ControlDetached(7));
        assert!(worker.control.is_attached());
        worker.handle(Task::Control(ControlCommand::Stop as u8));
        assert_eq!(*buf.0.lock().unwrap(), vec![AckStatus::Success as u8]);
    }
}

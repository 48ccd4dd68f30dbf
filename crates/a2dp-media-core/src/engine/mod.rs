//! A2DP media engine
//!
//! One worker thread owns all streaming state and executes [`Task`]s from a
//! FIFO in order. Everything else (control reader, tick timers, the
//! session layer, the transport's receive path) talks to it by posting
//! tasks through an [`EngineHandle`].
//!
//! The packet queues are the only state shared across threads; they lock
//! internally.

pub mod io;
pub mod pacer;
pub mod packet;
pub mod queue;
pub mod rx;
pub mod timer;
pub mod tx;
mod worker;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::codec::negotiator::NegotiationError;
use crate::codec::sbc::SbcError;
use crate::config::{ConfigError, EncoderConfig, EngineConfig, FeedingConfig, LinkCapabilities, PeerRole};
use crate::stats::StatsSnapshot;

use self::io::{AudioSink, FeedingSource, OffloadStatus, SessionTransitions, TransportSender};
use self::packet::TransportPacket;
use self::queue::PacketQueue;
use self::rx::InboundPacket;
use self::worker::Worker;

/// How long callers wait for the worker to answer a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors reported by the media engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Media task is not running")]
    NotRunning,

    #[error("Media task is already running")]
    AlreadyRunning,

    #[error("Media worker exited abnormally; collaborators were lost")]
    WorkerLost,

    #[error("Timed out waiting for the media worker")]
    Timeout,

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("MTU {mtu} cannot carry one {frame_length}-byte SBC frame")]
    MtuTooSmall { mtu: u16, frame_length: usize },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Codec(#[from] SbcError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle of the media task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTaskState {
    Off = 0,
    On = 1,
    ShuttingDown = 2,
}

impl MediaTaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::On,
            2 => Self::ShuttingDown,
            _ => Self::Off,
        }
    }
}

/// Work items executed by the media worker
pub(crate) enum Task {
    Shutdown,
    Configure {
        encoder: EncoderConfig,
        feeding: FeedingConfig,
        reply: Sender<Result<EncoderConfig, EngineError>>,
    },
    SetPeer {
        role: PeerRole,
        link: LinkCapabilities,
    },
    ConfigureSink(Vec<u8>),
    TxTick {
        generation: u64,
    },
    RxTick {
        generation: u64,
    },
    /// A packet landed in the RX queue
    RxQueued {
        dropped: usize,
    },
    SetFlush {
        tx: bool,
        rx: bool,
    },
    Snapshot(Sender<StatsSnapshot>),
    /// A control channel connected; ids tell connections apart
    ControlAttach(u64, Box<dyn Write + Send>),
    Control(u8),
    ControlDetached(u64),
    Started(bool),
    Stopped(bool),
    Suspended(bool),
    OffloadStarted(OffloadStatus),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Shutdown => write!(f, "Shutdown"),
            Task::Configure { encoder, feeding, .. } => f
                .debug_struct("Configure")
                .field("encoder", encoder)
                .field("feeding", feeding)
                .finish(),
            Task::SetPeer { role, link } => write!(f, "SetPeer({role:?}, {link:?})"),
            Task::ConfigureSink(info) => write!(f, "ConfigureSink({info:02x?})"),
            Task::TxTick { generation } => write!(f, "TxTick({generation})"),
            Task::RxTick { generation } => write!(f, "RxTick({generation})"),
            Task::RxQueued { dropped } => write!(f, "RxQueued(dropped={dropped})"),
            Task::SetFlush { tx, rx } => write!(f, "SetFlush(tx={tx}, rx={rx})"),
            Task::Snapshot(_) => write!(f, "Snapshot"),
            Task::ControlAttach(id, _) => write!(f, "ControlAttach({id})"),
            Task::Control(byte) => write!(f, "Control({byte})"),
            Task::ControlDetached(id) => write!(f, "ControlDetached({id})"),
            Task::Started(ok) => write!(f, "Started({ok})"),
            Task::Stopped(ok) => write!(f, "Stopped({ok})"),
            Task::Suspended(ok) => write!(f, "Suspended({ok})"),
            Task::OffloadStarted(status) => write!(f, "OffloadStarted({status:?})"),
        }
    }
}

/// State reachable from any thread
pub(crate) struct Shared {
    origin: Instant,
    state: AtomicU8,
    rx_flush: AtomicBool,
    next_control_id: AtomicU64,
    pub(crate) tx_queue: PacketQueue<TransportPacket>,
    pub(crate) rx_queue: PacketQueue<InboundPacket>,
}

impl Shared {
    /// Monotonic microseconds since the engine was created
    pub(crate) fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    pub(crate) fn state(&self) -> MediaTaskState {
        MediaTaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MediaTaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_rx_flush(&self, flush: bool) {
        self.rx_flush.store(flush, Ordering::Release);
    }
}

/// The engine's external collaborators
pub struct Collaborators {
    pub feeding: Box<dyn FeedingSource>,
    pub sink: Box<dyn AudioSink>,
    pub transport: Box<dyn TransportSender>,
    pub session: Box<dyn SessionTransitions>,
}

/// Cloneable handle for posting work to the engine
#[derive(Clone)]
pub struct EngineHandle {
    tasks: Sender<Task>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    fn post(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            warn!("Media task queue closed, task dropped");
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match self.shared.state() {
            MediaTaskState::On => Ok(()),
            _ => Err(EngineError::NotRunning),
        }
    }

    pub fn task_state(&self) -> MediaTaskState {
        self.shared.state()
    }

    /// Applies a source-side stream configuration
    ///
    /// Returns the encoder settings actually in use. On negotiation
    /// failure the previous configuration stays active.
    pub fn configure(
        &self,
        encoder: EncoderConfig,
        feeding: FeedingConfig,
    ) -> Result<EncoderConfig, EngineError> {
        feeding.validate()?;
        self.ensure_running()?;
        let (reply, result) = crossbeam_channel::bounded(1);
        self.post(Task::Configure {
            encoder,
            feeding,
            reply,
        });
        result
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| EngineError::Timeout)?
    }

    /// Sets the peer's role and link capabilities
    pub fn set_peer(&self, role: PeerRole, link: LinkCapabilities) {
        self.post(Task::SetPeer { role, link });
    }

    /// Resets the sink decoder from the codec information the source chose
    pub fn configure_sink(&self, codec_info: &[u8]) {
        self.post(Task::ConfigureSink(codec_info.to_vec()));
    }

    /// Queues a packet received from the peer for decoding
    ///
    /// Returns false if the packet was discarded because RX is flushing.
    pub fn enqueue_received_packet(&self, packet: TransportPacket) -> bool {
        if self.shared.rx_flush.load(Ordering::Acquire) {
            return false;
        }
        let dropped = self.shared.rx_queue.push(InboundPacket::new(packet));
        self.post(Task::RxQueued { dropped });
        true
    }

    pub fn set_flush(&self, tx: bool, rx: bool) {
        if rx {
            self.shared.set_rx_flush(true);
        }
        self.post(Task::SetFlush { tx, rx });
    }

    pub fn stats_snapshot(&self) -> Result<StatsSnapshot, EngineError> {
        self.ensure_running()?;
        let (reply, result) = crossbeam_channel::bounded(1);
        self.post(Task::Snapshot(reply));
        result
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| EngineError::Timeout)
    }

    /// Connects a control channel
    ///
    /// Commands are read on a dedicated thread; acks go to `writer`.
    pub fn attach_control<R, W>(&self, reader: R, writer: W) -> Result<(), EngineError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let id = self.shared.next_control_id.fetch_add(1, Ordering::Relaxed);
        self.post(Task::ControlAttach(id, Box::new(writer)));
        let tasks = self.tasks.clone();
        std::thread::Builder::new()
            .name("media_ctrl".into())
            .spawn(move || {
                crate::control::read_commands(reader, |byte| tasks.send(Task::Control(byte)).is_ok());
                let _ = tasks.send(Task::ControlDetached(id));
            })
            .map_err(|source| EngineError::Spawn {
                name: "media_ctrl",
                source,
            })?;
        Ok(())
    }

    /// Injects a control command byte as if read from the control channel
    pub fn send_command(&self, byte: u8) {
        self.post(Task::Control(byte));
    }

    pub fn on_started(&self, success: bool) {
        self.post(Task::Started(success));
    }

    pub fn on_stopped(&self, success: bool) {
        self.post(Task::Stopped(success));
    }

    pub fn on_suspended(&self, success: bool) {
        self.post(Task::Suspended(success));
    }

    pub fn on_offload_started(&self, status: OffloadStatus) {
        self.post(Task::OffloadStarted(status));
    }

    /// Packets waiting for the transport
    pub fn tx_queue_len(&self) -> usize {
        self.shared.tx_queue.len()
    }

    /// Packets waiting for the decoder
    pub fn rx_queue_len(&self) -> usize {
        self.shared.rx_queue.len()
    }
}

/// Owner of the media worker
pub struct MediaEngine {
    handle: EngineHandle,
    tasks_rx: Receiver<Task>,
    parked: Option<Worker>,
    thread: Option<JoinHandle<Worker>>,
}

impl MediaEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let (tasks, tasks_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            origin: Instant::now(),
            state: AtomicU8::new(MediaTaskState::Off as u8),
            rx_flush: AtomicBool::new(false),
            next_control_id: AtomicU64::new(0),
            tx_queue: PacketQueue::new(config.tx_queue_capacity),
            rx_queue: PacketQueue::new(config.rx_queue_capacity),
        });
        let worker = Worker::new(config, collaborators, Arc::clone(&shared), tasks.clone())?;
        Ok(Self {
            handle: EngineHandle { tasks, shared },
            tasks_rx,
            parked: Some(worker),
            thread: None,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn task_state(&self) -> MediaTaskState {
        self.handle.task_state()
    }

    /// Starts the media worker thread
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let mut worker = self.parked.take().ok_or(EngineError::WorkerLost)?;
        worker.on_task_start();

        let tasks_rx = self.tasks_rx.clone();
        self.handle.shared.set_state(MediaTaskState::On);
        let thread = std::thread::Builder::new()
            .name("media_worker".into())
            .spawn(move || {
                worker.run(&tasks_rx);
                worker
            })
            .map_err(|source| {
                self.handle.shared.set_state(MediaTaskState::Off);
                EngineError::Spawn {
                    name: "media_worker",
                    source,
                }
            })?;
        self.thread = Some(thread);
        info!("Media task started");
        Ok(())
    }

    /// Stops the worker, cancelling timers and flushing both queues
    ///
    /// Stopping an engine that is not running is a no-op.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.handle.shared.set_state(MediaTaskState::ShuttingDown);
        self.handle.post(Task::Shutdown);
        let result = thread.join();
        self.handle.shared.set_state(MediaTaskState::Off);
        match result {
            Ok(worker) => {
                self.parked = Some(worker);
                info!("Media task stopped");
                Ok(())
            }
            Err(_) => {
                error!("Media worker panicked");
                Err(EngineError::WorkerLost)
            }
        }
    }

    pub fn configure(
        &self,
        encoder: EncoderConfig,
        feeding: FeedingConfig,
    ) -> Result<EncoderConfig, EngineError> {
        self.handle.configure(encoder, feeding)
    }

    pub fn enqueue_received_packet(&self, packet: TransportPacket) -> bool {
        self.handle.enqueue_received_packet(packet)
    }

    pub fn set_flush(&self, tx: bool, rx: bool) {
        self.handle.set_flush(tx, rx);
    }

    pub fn stats_snapshot(&self) -> Result<StatsSnapshot, EngineError> {
        self.handle.stats_snapshot()
    }
}

impl Drop for MediaEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Media task did not stop cleanly");
        }
    }
}

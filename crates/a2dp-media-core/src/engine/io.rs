//! Collaborators the engine talks to
//!
//! The engine owns one of each for the lifetime of the worker. They are
//! only ever called from the worker thread.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;

use crate::engine::packet::TransportPacket;

/// Supplies PCM for encoding
pub trait FeedingSource: Send {
    /// Fills as much of `buf` as is available, returning the byte count
    fn read_pcm(&mut self, buf: &mut [u8]) -> usize;
}

/// Receives decoded PCM
pub trait AudioSink: Send {
    fn write_pcm(&mut self, pcm: &[u8]);
}

/// Hands encoded packets to the link
pub trait TransportSender: Send {
    /// Returns false if the link cannot take the packet right now
    fn send(&mut self, packet: &TransportPacket) -> bool;
}

/// State of the media stream as seen by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    /// Configured and openable
    Ready,
    Started,
}

/// Offload completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadStatus {
    Success,
    /// Controller lacks resources for offload
    NoResources,
    Failed,
}

/// Session-level stream transitions
///
/// Requests complete asynchronously; the session reports back through the
/// engine handle (`on_started`, `on_stopped`, `on_suspended`,
/// `on_offload_started`).
pub trait SessionTransitions: Send {
    fn stream_state(&self) -> StreamState;
    fn is_call_active(&self) -> bool;
    fn request_start(&mut self);
    fn request_stop(&mut self);
    fn request_suspend(&mut self);
    fn request_offload_start(&mut self);
}

/// Writer half of a PCM ring, used by the audio producer thread
pub struct PcmWriter {
    producer: ringbuf::HeapProd<u8>,
}

impl PcmWriter {
    /// Queues as many bytes as fit, returning the count accepted
    pub fn write(&mut self, pcm: &[u8]) -> usize {
        self.producer.push_slice(pcm)
    }

    pub fn vacant(&self) -> usize {
        self.producer.vacant_len()
    }
}

/// Reader half of a PCM ring
pub struct PcmRingFeed {
    consumer: ringbuf::HeapCons<u8>,
}

impl PcmRingFeed {
    /// Creates a ring of `capacity` bytes
    pub fn new(capacity: usize) -> (PcmWriter, PcmRingFeed) {
        let ring = HeapRb::<u8>::new(capacity.max(1));
        let (producer, consumer) = ring.split();
        (PcmWriter { producer }, PcmRingFeed { consumer })
    }

    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }
}

impl FeedingSource for PcmRingFeed {
    fn read_pcm(&mut self, buf: &mut [u8]) -> usize {
        self.consumer.pop_slice(buf)
    }
}

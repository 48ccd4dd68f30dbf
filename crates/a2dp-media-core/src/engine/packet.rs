//! Transport packet framing
//!
//! ```text
//! +----------------+--------+----------------------------+
//! | timestamp (LE) | header | SBC frame 0 | SBC frame 1 ..|
//! |    4 bytes     | 1 byte |                            |
//! +----------------+--------+----------------------------+
//! ```
//!
//! The media payload header carries the frame count in its low nibble and
//! fragmentation flags (fragmented, start, last) in bits 7..5.

use thiserror::Error;

/// Frame count field width limits a packet to 15 frames
pub const MAX_FRAMES_PER_PACKET: u8 = 0x0F;

const FLAG_FRAGMENTED: u8 = 0x80;
const FLAG_START: u8 = 0x40;
const FLAG_LAST: u8 = 0x20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Frame count {0} exceeds the header limit")]
    TooManyFrames(u8),
}

/// One media packet as queued between the pipelines and the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPacket {
    /// Sample clock of the first frame
    pub timestamp: u32,
    pub frame_count: u8,
    /// Fragmentation flags from the media payload header
    pub flags: u8,
    /// Concatenated SBC frames
    pub payload: Vec<u8>,
}

impl TransportPacket {
    /// Bytes preceding the payload on the wire
    pub const HEADER_SIZE: usize = 5;

    pub fn new(timestamp: u32, frame_count: u8, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            frame_count,
            flags: 0,
            payload,
        }
    }

    /// Size on the wire
    pub fn len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags & FLAG_FRAGMENTED != 0
    }

    pub fn is_start(&self) -> bool {
        self.flags & FLAG_START != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push((self.flags & 0xE0) | (self.frame_count & MAX_FRAMES_PER_PACKET));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(PacketError::TooShort(data.len()));
        }
        let timestamp = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self {
            timestamp,
            frame_count: data[4] & MAX_FRAMES_PER_PACKET,
            flags: data[4] & 0xE0,
            payload: data[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

/// Packet under construction, bounded by the MTU and the frame limit
#[derive(Debug)]
pub struct PacketBuilder {
    timestamp: u32,
    mtu: usize,
    max_frames: u8,
    frames: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(timestamp: u32, mtu: usize, max_frames: u8) -> Self {
        Self {
            timestamp,
            mtu,
            max_frames: max_frames.clamp(1, MAX_FRAMES_PER_PACKET),
            frames: 0,
            payload: Vec::with_capacity(mtu.saturating_sub(TransportPacket::HEADER_SIZE)),
        }
    }

    /// Whether another frame of `frame_len` bytes may be appended
    pub fn has_room(&self, frame_len: usize) -> bool {
        self.frames < self.max_frames
            && TransportPacket::HEADER_SIZE + self.payload.len() + frame_len <= self.mtu
    }

    /// Buffer the encoder appends the next frame to
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Records that a frame was appended to the payload
    pub fn commit_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u8 {
        self.frames
    }

    pub fn finish(self) -> TransportPacket {
        TransportPacket::new(self.timestamp, self.frames, self.payload)
    }
}

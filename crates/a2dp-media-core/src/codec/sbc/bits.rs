//! MSB-first bit packing and the SBC CRC-8

use super::SbcError;

/// CRC-8 generator polynomial x^8 + x^4 + x^3 + x^2 + 1
const CRC_POLY: u8 = 0x1D;

/// CRC register seed
pub const CRC_INIT: u8 = 0x0F;

/// Appends values MSB-first to a byte vector
#[derive(Debug)]
pub struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    /// Bits already used in the last byte (0 means a new byte is needed)
    used: u8,
}

impl<'a> BitWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out, used: 0 }
    }

    /// Writes the low `bits` bits of `value`
    pub fn write(&mut self, value: u32, bits: u8) {
        for shift in (0..bits).rev() {
            let bit = ((value >> shift) & 1) as u8;
            if self.used == 0 {
                self.out.push(0);
            }
            if let Some(last) = self.out.last_mut() {
                *last |= bit << (7 - self.used);
            }
            self.used = (self.used + 1) % 8;
        }
    }
}

/// Reads values MSB-first from a byte slice
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads `bits` bits (at most 32)
    pub fn read(&mut self, bits: u8) -> Result<u32, SbcError> {
        let end = self.pos + bits as usize;
        if end > self.data.len() * 8 {
            return Err(SbcError::Truncated {
                needed: end.div_ceil(8),
                available: self.data.len(),
            });
        }
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }

    /// Bits consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Feeds `bit_len` bits of `data` (MSB-first) through the CRC register
pub fn crc8(mut crc: u8, data: &[u8], bit_len: usize) -> u8 {
    for i in 0..bit_len {
        let Some(byte) = data.get(i / 8) else {
            break;
        };
        let bit = (byte >> (7 - (i % 8))) & 1;
        let top = crc >> 7;
        crc <<= 1;
        if top ^ bit != 0 {
            crc ^= CRC_POLY;
        }
    }
    crc
}

/// CRC over a frame: parameter byte, bitpool, then the joint flags and
/// scale factors that start at byte 4
pub fn frame_crc(frame: &[u8], protected_bits: usize) -> u8 {
    let head = [
        frame.get(1).copied().unwrap_or(0),
        frame.get(2).copied().unwrap_or(0),
    ];
    let crc = crc8(CRC_INIT, &head, 16);
    crc8(crc, frame.get(4..).unwrap_or(&[]), protected_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_mixed_widths() {
        let mut buf = Vec::new();
        let mut writer = BitWriter::new(&mut buf);
        writer.write(0b101, 3);
        writer.write(0xF, 4);
        writer.write(0x1234, 16);
        assert_eq!(buf.len(), 3);

        let mut reader = BitReader::new(&buf);
        assert_eq!(reader.read(3).unwrap(), 0b101);
        assert_eq!(reader.read(4).unwrap(), 0xF);
        assert_eq!(reader.read(16).unwrap(), 0x1234);
        assert_eq!(reader.position(), 23);
    }

    #[test]
    fn test_read_past_end_is_truncated() {
        let mut reader = BitReader::new(&[0xFF]);
        assert!(reader.read(9).is_err());
    }

    #[test]
    fn test_crc_detects_single_bit_flip() {
        let data = [0x31, 0x35, 0xA5, 0x5A];
        let clean = crc8(CRC_INIT, &data, 32);
        let mut flipped = data;
        flipped[2] ^= 0x04;
        assert_ne!(clean, crc8(CRC_INIT, &flipped, 32));
    }

    #[test]
    fn test_crc_partial_byte_ignores_trailing_bits() {
        let a = crc8(CRC_INIT, &[0b1010_0000], 3);
        let b = crc8(CRC_INIT, &[0b1011_1111], 3);
        assert_eq!(a, b);
    }
}

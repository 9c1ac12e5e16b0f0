//! HFP H2 synchronization framing for mSBC
//!
//! Each 60-byte packet carries a 2-byte H2 header, one 57-byte mSBC frame
//! and one padding byte:
//!
//! ```text
//! 0x01 | SN | 0xAD ...57 bytes... | pad
//! ```
//!
//! `SN` is one of four values encoding a 2-bit sequence number. The reader
//! accepts an arbitrary byte stream (SCO sockets do not preserve packet
//! boundaries) and re-synchronizes on the header.

use bytes::{BufMut, BytesMut};
use tracing::trace;

pub const H2_HEADER_SIZE: usize = 2;
pub const MSBC_FRAME_SIZE: usize = 57;
pub const H2_PACKET_SIZE: usize = 60;
pub const MSBC_SYNC: u8 = 0xad;

const H2_SYNC: u8 = 0x01;
const SEQ_BYTES: [u8; 4] = [0x08, 0x38, 0xc8, 0xf8];

/// H2 header for sequence number `seq` (mod 4)
pub fn h2_header(seq: u8) -> [u8; H2_HEADER_SIZE] {
    [H2_SYNC, SEQ_BYTES[usize::from(seq & 0x03)]]
}

fn seq_of(byte: u8) -> Option<u8> {
    SEQ_BYTES.iter().position(|b| *b == byte).map(|i| i as u8)
}

/// One re-assembled mSBC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Frame {
    pub data: [u8; MSBC_FRAME_SIZE],
    pub seq: u8,
    /// Frames missing between the previous frame and this one
    pub lost: u8,
}

/// Streaming H2 parser
#[derive(Debug, Clone)]
pub struct H2Reader {
    frame: [u8; MSBC_FRAME_SIZE],
    /// Header bytes matched so far (0..=2), then frame bytes
    header: usize,
    len: usize,
    seq: u8,
    prev_seq: Option<u8>,
    skipped: u64,
}

impl Default for H2Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Reader {
    pub fn new() -> Self {
        Self {
            frame: [0; MSBC_FRAME_SIZE],
            header: 0,
            len: 0,
            seq: 0,
            prev_seq: None,
            skipped: 0,
        }
    }

    /// Forget sync state, e.g. after the socket was reopened
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Bytes discarded while searching for sync
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Consume bytes from `data` until a frame completes or input runs out.
    /// Returns the number of bytes consumed.
    pub fn consume(&mut self, data: &[u8]) -> (usize, Option<H2Frame>) {
        for (i, &byte) in data.iter().enumerate() {
            if let Some(frame) = self.push(byte) {
                return (i + 1, Some(frame));
            }
        }
        (data.len(), None)
    }

    fn push(&mut self, byte: u8) -> Option<H2Frame> {
        match self.header {
            0 => {
                if byte == H2_SYNC {
                    self.header = 1;
                } else {
                    self.skipped += 1;
                }
                None
            }
            1 => {
                if let Some(seq) = seq_of(byte) {
                    self.seq = seq;
                    self.header = 2;
                    self.len = 0;
                } else if byte != H2_SYNC {
                    self.skipped += 2;
                    self.header = 0;
                }
                None
            }
            _ => {
                if self.len == 0 && byte != MSBC_SYNC {
                    trace!("h2: lost sync, byte:{byte:#04x}");
                    self.skipped += 3;
                    self.header = usize::from(byte == H2_SYNC);
                    return None;
                }
                self.frame[self.len] = byte;
                self.len += 1;
                if self.len < MSBC_FRAME_SIZE {
                    return None;
                }

                self.header = 0;
                self.len = 0;
                let lost = match self.prev_seq {
                    Some(prev) => self.seq.wrapping_sub(prev.wrapping_add(1)) & 0x03,
                    None => 0,
                };
                self.prev_seq = Some(self.seq);
                Some(H2Frame {
                    data: self.frame,
                    seq: self.seq,
                    lost,
                })
            }
        }
    }
}

/// Packetizes mSBC frames with rotating sequence numbers
#[derive(Debug, Clone, Default)]
pub struct H2Writer {
    seq: u8,
}

impl H2Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one full H2 packet for `frame` to `out`
    pub fn write(&mut self, frame: &[u8], out: &mut BytesMut) {
        out.reserve(H2_PACKET_SIZE);
        out.put_slice(&h2_header(self.seq));
        let n = frame.len().min(MSBC_FRAME_SIZE);
        out.put_slice(&frame[..n]);
        out.put_bytes(0, H2_PACKET_SIZE - H2_HEADER_SIZE - n);
        self.seq = (self.seq + 1) & 0x03;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: u8) -> [u8; MSBC_FRAME_SIZE] {
        let mut f = [fill; MSBC_FRAME_SIZE];
        f[0] = MSBC_SYNC;
        f
    }

    fn read_all(reader: &mut H2Reader, mut data: &[u8]) -> Vec<H2Frame> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let (n, f) = reader.consume(data);
            data = &data[n..];
            out.extend(f);
        }
        out
    }

    #[test]
    fn test_header_values() {
        assert_eq!(h2_header(0), [0x01, 0x08]);
        assert_eq!(h2_header(3), [0x01, 0xf8]);
        assert_eq!(h2_header(5), [0x01, 0x38]);
    }

    #[test]
    fn test_writer_reader_stream() {
        let mut writer = H2Writer::new();
        let mut buf = BytesMut::new();
        for i in 0..6 {
            writer.write(&frame(i), &mut buf);
        }
        assert_eq!(buf.len(), 6 * H2_PACKET_SIZE);

        let frames = read_all(&mut H2Reader::new(), &buf);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[5].data[1], 5);
        assert_eq!(frames[4].seq, 0);
        assert!(frames.iter().all(|f| f.lost == 0));
    }

    #[test]
    fn test_resync_after_garbage_and_split_input() {
        let mut writer = H2Writer::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x00, 0x01, 0x42, 0x01, 0x08, 0x13]);
        writer.write(&frame(7), &mut buf);
        writer.write(&frame(8), &mut buf);

        let mut reader = H2Reader::new();
        let mut frames = Vec::new();
        for chunk in buf.chunks(7) {
            frames.extend(read_all(&mut reader, chunk));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data[1], 7);
        assert!(reader.skipped() > 0);
    }

    #[test]
    fn test_sequence_gap_reports_lost_frames() {
        let mut buf = BytesMut::new();
        let mut writer = H2Writer::new();
        let mut dropped = BytesMut::new();
        writer.write(&frame(0), &mut buf);
        writer.write(&frame(1), &mut dropped);
        writer.write(&frame(2), &mut dropped);
        writer.write(&frame(3), &mut buf);

        let frames = read_all(&mut H2Reader::new(), &buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].lost, 2);
    }
}

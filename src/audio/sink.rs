//! Socket-facing encode path
//!
//! Packs encoded codec frames into packets of at most the transport's
//! write MTU and sends them without blocking.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use socket2::Socket;
use tracing::{debug, trace};

use crate::codec::CodecSession;
use crate::error::CodecError;

/// Send statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Packets dropped because the socket was full
    pub packets_dropped: u64,
}

/// Encoder side of a media stream
pub struct MediaSink {
    session: Box<dyn CodecSession>,
    frame_size: usize,
    mtu: usize,
    packet: BytesMut,
    used: usize,
    frames: u32,
    samples: u32,
    seq: u16,
    timestamp: u32,
    stats: SinkStats,
}

impl MediaSink {
    pub fn new(session: Box<dyn CodecSession>, frame_size: usize, write_mtu: u16) -> Self {
        let mtu = usize::from(write_mtu);
        Self {
            session,
            frame_size: frame_size.max(1),
            mtu,
            packet: BytesMut::with_capacity(mtu),
            used: 0,
            frames: 0,
            samples: 0,
            seq: 0,
            timestamp: 0,
            stats: SinkStats::default(),
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub fn block_size(&self) -> usize {
        self.session.block_size()
    }

    /// Encode as much of `pcm` as forms whole codec blocks. Returns the PCM
    /// bytes consumed and a packet once no further frame fits the MTU.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<(usize, Option<Bytes>), CodecError> {
        let block = self.session.block_size().max(1);
        let mut consumed = 0;

        loop {
            if self.used == 0 {
                self.packet.clear();
                self.packet.resize(self.mtu, 0);
                self.used = self.session.start_encode(&mut self.packet[..], self.seq, self.timestamp)?;
            }
            if pcm.len() - consumed < block {
                return Ok((consumed, None));
            }

            let res = self
                .session
                .encode(&pcm[consumed..consumed + block], &mut self.packet[self.used..])?;
            if res.consumed == 0 && self.frames == 0 {
                return Err(CodecError::EncodingFailed(format!(
                    "frame does not fit write mtu {}",
                    self.mtu
                )));
            }

            consumed += res.consumed;
            self.used += res.written;
            if res.consumed > 0 {
                self.frames += 1;
                self.samples += (res.consumed / self.frame_size) as u32;
            }

            if res.need_flush || res.consumed == 0 {
                return Ok((consumed, self.take_packet()));
            }
        }
    }

    /// Packet with whatever frames are pending
    pub fn flush(&mut self) -> Option<Bytes> {
        self.take_packet()
    }

    fn take_packet(&mut self) -> Option<Bytes> {
        if self.frames == 0 {
            return None;
        }
        self.packet.truncate(self.used);
        let packet = self.packet.split().freeze();
        trace!(
            "media sink: packet seq:{} frames:{} size:{}",
            self.seq,
            self.frames,
            packet.len()
        );
        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples);
        self.used = 0;
        self.frames = 0;
        self.samples = 0;
        Some(packet)
    }

    /// Send one packet on a non-blocking socket; `false` when it was dropped
    pub fn send(&mut self, socket: &Socket, packet: &[u8]) -> io::Result<bool> {
        match (&*socket).write(packet) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.packets_dropped += 1;
                debug!("media sink: socket full, dropping {} bytes", packet.len());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

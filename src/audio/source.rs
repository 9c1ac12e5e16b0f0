//! Socket-facing decode path
//!
//! Reads packets off a transport socket, decodes them into a
//! [`DecodeBuffer`] and conceals sequence gaps with codec PLC.

use std::io::{self, Read};

use socket2::Socket;
use tracing::{debug, trace};

use super::buffer::{DecodeBuffer, DecodeBufferParams};
use super::h2::H2Reader;
use crate::codec::{CodecSession, CodecStats};
use crate::config::BackendConfig;
use crate::error::CodecError;

/// Largest packet read from a socket
const MAX_PACKET: usize = 4096;

/// Decoder side of a media or SCO stream
pub struct MediaSource {
    session: Box<dyn CodecSession>,
    buffer: DecodeBuffer,
    h2: Option<H2Reader>,
    expected_seq: Option<u16>,
    frames_per_packet: u16,
    max_plc_packets: u16,
    stats: CodecStats,
    scratch: Vec<u8>,
}

impl MediaSource {
    /// `h2` selects HFP H2 framing instead of codec packet headers
    pub fn new(session: Box<dyn CodecSession>, params: DecodeBufferParams, h2: bool, max_plc_packets: u16) -> Self {
        Self {
            session,
            buffer: DecodeBuffer::new(params),
            h2: h2.then(H2Reader::new),
            expected_seq: None,
            frames_per_packet: 1,
            max_plc_packets,
            stats: CodecStats::default(),
            scratch: vec![0; MAX_PACKET],
        }
    }

    /// Source with decode buffer and concealment limits from `config`
    pub fn from_config(
        session: Box<dyn CodecSession>,
        frame_size: usize,
        rate: u32,
        quantum_limit: u32,
        h2: bool,
        config: &BackendConfig,
    ) -> Self {
        let params = DecodeBufferParams::from_config(frame_size, rate, quantum_limit, &config.decode_buffer);
        let max_plc = u16::try_from(config.timing.max_plc_packets).unwrap_or(u16::MAX);
        Self::new(session, params, h2, max_plc)
    }

    pub fn buffer(&self) -> &DecodeBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Rate correction the consumer should resample with
    pub fn corr(&self) -> f64 {
        self.buffer.corr()
    }

    /// Node latency in samples: buffer target plus codec delay
    pub fn latency(&self) -> u32 {
        self.buffer.target() + self.session.delay()
    }

    /// Drain every packet currently queued on a non-blocking socket
    pub fn read_socket(&mut self, socket: &Socket) -> io::Result<usize> {
        let mut packets = 0;
        loop {
            let mut scratch = std::mem::take(&mut self.scratch);
            let res = (&*socket).read(&mut scratch);
            let outcome = match res {
                Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "transport socket closed")),
                Ok(n) => {
                    if let Err(e) = self.on_packet(&scratch[..n]) {
                        debug!("media source: dropping packet: {e}");
                    }
                    packets += 1;
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
                Err(e) => Err(e),
            };
            self.scratch = scratch;
            if !outcome? {
                return Ok(packets);
            }
        }
    }

    /// Decode one received packet
    pub fn on_packet(&mut self, packet: &[u8]) -> Result<(), CodecError> {
        if self.h2.is_some() {
            return self.on_h2_data(packet);
        }

        let header = self.session.start_decode(packet)?;
        if let Some(seq) = header.seq {
            if let Some(expected) = self.expected_seq {
                let gap = seq.wrapping_sub(expected);
                if gap >= 0x8000 {
                    trace!("media source: late packet seq:{seq} expected:{expected}");
                    return Ok(());
                }
                if gap > 0 {
                    self.conceal(gap);
                }
            }
            self.expected_seq = Some(seq.wrapping_add(1));
        }

        let data = packet.get(header.header_len..).unwrap_or_default();
        let frames = self.decode_into_buffer(data)?;
        if frames > 0 {
            self.frames_per_packet = frames;
        }
        Ok(())
    }

    fn on_h2_data(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        while !data.is_empty() {
            let Some(reader) = self.h2.as_mut() else {
                break;
            };
            let (n, frame) = reader.consume(data);
            data = &data[n..];
            if let Some(frame) = frame {
                if frame.lost > 0 {
                    self.conceal(u16::from(frame.lost));
                }
                self.decode_into_buffer(&frame.data)?;
            }
        }
        Ok(())
    }

    fn decode_into_buffer(&mut self, mut data: &[u8]) -> Result<u16, CodecError> {
        let block = self.session.block_size();
        let region = self.buffer.get_write();
        let mut written = 0;
        let mut frames = 0u16;

        while !data.is_empty() {
            if region.len() - written < block {
                debug!("media source: decode buffer full, dropping {} bytes", data.len());
                break;
            }
            let (consumed, n) = self.session.decode(data, &mut region[written..])?;
            if consumed == 0 {
                break;
            }
            data = &data[consumed..];
            written += n;
            frames = frames.saturating_add(1);
        }

        self.stats.frames_decoded += u64::from(frames);
        self.stats.bytes_produced += written as u64;
        self.buffer.write_packet(written);
        Ok(frames)
    }

    /// Fill in for `packets` missing packets
    fn conceal(&mut self, packets: u16) {
        let frames = u64::from(packets) * u64::from(self.frames_per_packet);
        self.stats.frames_lost += frames;

        if packets > self.max_plc_packets {
            debug!("media source: {packets} packets lost, too many to conceal");
            return;
        }
        trace!("media source: concealing {packets} packets");

        for _ in 0..packets {
            let region = self.buffer.get_write();
            let mut written = 0;
            for _ in 0..self.frames_per_packet {
                match self.session.decode_plc(&mut region[written..]) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        written += n;
                        self.stats.frames_concealed += 1;
                    }
                }
            }
            if written == 0 {
                return;
            }
            self.buffer.write_packet(written);
        }
    }

    /// Produce one period into `out`, padding with silence; returns the
    /// number of real audio bytes
    pub fn process(&mut self, out: &mut [u8], duration: u32) -> usize {
        let frame_size = self.buffer.frame_size();
        let samples = (out.len() / frame_size) as u32;
        self.buffer.process(samples, duration);

        if self.buffer.is_buffering() {
            out.fill(0);
            return 0;
        }

        let avail = self.buffer.avail().min(out.len()) / frame_size * frame_size;
        out[..avail].copy_from_slice(&self.buffer.get_read()[..avail]);
        out[avail..].fill(0);
        self.buffer.read(avail);
        avail
    }
}

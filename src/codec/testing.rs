//! Codec doubles for tests
//!
//! `TestCodec` accepts any capability blob whose first byte equals its codec
//! id. Its sessions treat the payload as raw PCM: a packet is a 1-byte
//! sequence number followed by PCM bytes.

use std::cmp::Ordering;
use std::time::Duration;

use serde_json::json;

use super::{AudioInfo, CodecKind, CodecSession, EncodeOutput, MediaCodec, PacketHeader};
use crate::bus::PropertyMap;
use crate::error::CodecError;

#[derive(Debug, Clone)]
pub struct TestCodec {
    name: &'static str,
    id: u8,
    kind: CodecKind,
    block: usize,
    preference: bool,
}

impl TestCodec {
    pub fn new(name: &'static str, id: u8) -> Self {
        Self {
            name,
            id,
            kind: CodecKind::A2dp,
            block: 64,
            preference: false,
        }
    }

    pub fn bap(mut self) -> Self {
        self.kind = CodecKind::Bap;
        self
    }

    /// Prefer capability blobs with a larger second byte
    pub fn with_preference(mut self) -> Self {
        self.preference = true;
        self
    }
}

impl MediaCodec for TestCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CodecKind {
        self.kind
    }

    fn codec_id(&self) -> u8 {
        self.id
    }

    fn fill_caps(&self, _sink: bool) -> Vec<u8> {
        vec![self.id, 0xff]
    }

    fn select_config(&self, _sink: bool, caps: &[u8], _info: &AudioInfo) -> Result<Vec<u8>, CodecError> {
        match caps.first() {
            Some(id) if *id == self.id => Ok(caps.to_vec()),
            _ => Err(CodecError::IncompatibleCaps(self.name.to_string())),
        }
    }

    fn has_caps_preference(&self) -> bool {
        self.preference
    }

    fn caps_preference_cmp(&self, _sink: bool, caps1: &[u8], caps2: &[u8], _info: &AudioInfo) -> Ordering {
        caps2.get(1).cmp(&caps1.get(1))
    }

    fn select_properties(
        &self,
        caps: &[u8],
        _properties: &PropertyMap,
        info: &AudioInfo,
    ) -> Result<(Vec<u8>, PropertyMap), CodecError> {
        if self.kind != CodecKind::Bap {
            return Err(CodecError::Unsupported(self.name.to_string()));
        }
        let config = self.select_config(false, caps, info)?;
        let mut qos = PropertyMap::new();
        qos.insert("Interval".into(), json!(10_000));
        qos.insert("Framing".into(), json!(false));
        Ok((config, qos))
    }

    fn init(&self, _sink: bool, _config: &[u8], _mtu: usize) -> Result<Box<dyn CodecSession>, CodecError> {
        let interval = (self.kind == CodecKind::Bap).then(|| Duration::from_millis(10));
        Ok(Box::new(RawSession {
            block: self.block,
            seq: 0,
            interval,
        }))
    }
}

pub struct RawSession {
    block: usize,
    seq: u8,
    interval: Option<Duration>,
}

impl CodecSession for RawSession {
    fn block_size(&self) -> usize {
        self.block
    }

    fn delay(&self) -> u32 {
        16
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn start_decode(&mut self, packet: &[u8]) -> Result<PacketHeader, CodecError> {
        match packet.first() {
            Some(seq) => Ok(PacketHeader {
                header_len: 1,
                seq: Some(u16::from(*seq)),
            }),
            None => Err(CodecError::DecodingFailed("empty packet".into())),
        }
    }

    fn decode(&mut self, data: &[u8], out: &mut [u8]) -> Result<(usize, usize), CodecError> {
        let n = data.len().min(out.len()).min(self.block);
        out[..n].copy_from_slice(&data[..n]);
        Ok((n, n))
    }

    fn decode_plc(&mut self, out: &mut [u8]) -> Result<usize, CodecError> {
        let n = out.len().min(self.block);
        out[..n].fill(0x7f);
        Ok(n)
    }

    fn start_encode(&mut self, out: &mut [u8], _seq: u16, _timestamp: u32) -> Result<usize, CodecError> {
        let Some(first) = out.first_mut() else {
            return Err(CodecError::EncodingFailed("no room for header".into()));
        };
        *first = self.seq;
        self.seq = self.seq.wrapping_add(1);
        Ok(1)
    }

    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<EncodeOutput, CodecError> {
        let n = pcm.len().min(self.block);
        if out.len() < n {
            return Ok(EncodeOutput {
                need_flush: true,
                ..Default::default()
            });
        }
        out[..n].copy_from_slice(&pcm[..n]);
        Ok(EncodeOutput {
            consumed: n,
            written: n,
            need_flush: out.len() - n < self.block,
        })
    }
}

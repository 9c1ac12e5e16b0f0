//! Media codec interface
//!
//! The back-end negotiates and drives codecs only through [`MediaCodec`]
//! (capability negotiation) and [`CodecSession`] (per-stream encode and
//! decode). Sample-level codec math lives behind these traits.

pub mod sbc;

#[cfg(test)]
pub mod testing;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{LocalEndpoint, ObjectPath, PropertyMap};
use crate::config::BackendConfig;
use crate::error::CodecError;
use crate::profile::{Profiles, UUID_A2DP_SINK, UUID_A2DP_SOURCE, UUID_BAP_SINK, UUID_BAP_SOURCE};

pub use sbc::Sbc;

/// Object-manager root for A2DP endpoints
pub const A2DP_ENDPOINT_ROOT: &str = "/MediaEndpoint";
/// Object-manager root for LE Audio endpoints
pub const BAP_ENDPOINT_ROOT: &str = "/MediaEndpointLE";

/// Which family of profiles a codec serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    A2dp,
    Bap,
    Hfp,
}

impl CodecKind {
    /// Remote profiles a codec of this kind can be configured on
    pub fn target_profiles(self) -> Profiles {
        match self {
            CodecKind::A2dp => Profiles::A2DP_DUPLEX,
            CodecKind::Bap => Profiles::BAP_DUPLEX,
            CodecKind::Hfp => Profiles::HEADSET_AUDIO,
        }
    }

    pub fn endpoint_root(self) -> ObjectPath {
        match self {
            CodecKind::Bap => ObjectPath::from(BAP_ENDPOINT_ROOT),
            CodecKind::A2dp | CodecKind::Hfp => ObjectPath::from(A2DP_ENDPOINT_ROOT),
        }
    }
}

/// Preferred stream format handed to negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub rate: u32,
    pub channels: u16,
}

impl AudioInfo {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            rate: config.default_rate,
            channels: config.default_channels,
        }
    }
}

/// Result of parsing a received packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Bytes before the first codec frame
    pub header_len: usize,
    /// Sequence number, when the framing carries one
    pub seq: Option<u16>,
}

/// Result of one encode call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOutput {
    /// PCM bytes consumed
    pub consumed: usize,
    /// Encoded bytes written
    pub written: usize,
    /// Packet must be sent now, no further frames fit
    pub need_flush: bool,
}

/// Capability negotiation for one codec
///
/// Implementations are stateless descriptors shared by every device.
pub trait MediaCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> CodecKind;

    /// Assigned codec number (0 = SBC, 2 = AAC, 0x06 = LC3, 0xff = vendor)
    fn codec_id(&self) -> u8;

    /// Vendor and vendor-codec id for vendor codecs
    fn vendor(&self) -> Option<(u16, u16)> {
        None
    }

    /// Name used in the local endpoint path
    fn endpoint_name(&self) -> &'static str {
        self.name()
    }

    /// Capabilities advertised on our endpoint
    fn fill_caps(&self, sink: bool) -> Vec<u8>;

    /// Pick a configuration out of the peer's capabilities
    fn select_config(&self, sink: bool, caps: &[u8], info: &AudioInfo) -> Result<Vec<u8>, CodecError>;

    /// Whether `caps` can be configured at all
    fn check_caps(&self, caps: &[u8], info: &AudioInfo) -> bool {
        self.select_config(false, caps, info).is_ok()
    }

    /// True when [`MediaCodec::caps_preference_cmp`] is meaningful
    fn has_caps_preference(&self) -> bool {
        false
    }

    /// Order two capability blobs, `Less` meaning `caps1` is preferred
    fn caps_preference_cmp(&self, _sink: bool, _caps1: &[u8], _caps2: &[u8], _info: &AudioInfo) -> Ordering {
        Ordering::Equal
    }

    /// LE Audio `SelectProperties`: configuration plus QoS properties
    fn select_properties(
        &self,
        _caps: &[u8],
        _properties: &PropertyMap,
        _info: &AudioInfo,
    ) -> Result<(Vec<u8>, PropertyMap), CodecError> {
        Err(CodecError::Unsupported(self.name().to_string()))
    }

    /// Start a stream with a negotiated configuration
    fn init(&self, _sink: bool, _config: &[u8], _mtu: usize) -> Result<Box<dyn CodecSession>, CodecError> {
        Err(CodecError::NoSession(self.name().to_string()))
    }
}

/// One running encoder or decoder
pub trait CodecSession: Send {
    /// PCM bytes per codec frame
    fn block_size(&self) -> usize;

    /// Algorithmic delay in samples
    fn delay(&self) -> u32 {
        0
    }

    /// SDU interval of isochronous streams
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Parse the packet header of a received packet
    fn start_decode(&mut self, packet: &[u8]) -> Result<PacketHeader, CodecError>;

    /// Decode frames from `data` into `out`; returns (consumed, written)
    fn decode(&mut self, data: &[u8], out: &mut [u8]) -> Result<(usize, usize), CodecError>;

    /// Synthesize one frame of concealment audio
    fn decode_plc(&mut self, _out: &mut [u8]) -> Result<usize, CodecError> {
        Err(CodecError::Unsupported("plc".into()))
    }

    /// Write a packet header; returns its length
    fn start_encode(&mut self, _out: &mut [u8], _seq: u16, _timestamp: u32) -> Result<usize, CodecError> {
        Ok(0)
    }

    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<EncodeOutput, CodecError>;
}

/// Per-stream codec counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub frames_concealed: u64,
    pub bytes_produced: u64,
}

impl CodecStats {
    pub fn loss_rate(&self) -> f32 {
        let total = self.frames_decoded + self.frames_lost;
        if total == 0 {
            0.0
        } else {
            self.frames_lost as f32 / total as f32
        }
    }
}

/// Codecs available to the back-end, in priority order
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn MediaCodec>>,
    info: AudioInfo,
}

impl CodecRegistry {
    /// Keep the codecs admitted by the configuration's allow-list
    pub fn new(codecs: Vec<Arc<dyn MediaCodec>>, config: &BackendConfig) -> Self {
        let codecs = codecs.into_iter().filter(|c| config.codec_enabled(c.name())).collect();
        Self {
            codecs,
            info: AudioInfo::from_config(config),
        }
    }

    /// Built-in codecs
    pub fn with_defaults(config: &BackendConfig) -> Self {
        Self::new(vec![Arc::new(Sbc)], config)
    }

    pub fn audio_info(&self) -> &AudioInfo {
        &self.info
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MediaCodec>> {
        self.codecs.iter()
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn MediaCodec>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    /// Codec matching an endpoint's advertised id, e.g. on `SetConfiguration`
    pub fn find_by_id(&self, kind: CodecKind, codec_id: u8) -> Option<Arc<dyn MediaCodec>> {
        self.codecs
            .iter()
            .find(|c| c.kind() == kind && c.codec_id() == codec_id)
            .cloned()
    }

    /// Keep enabled codecs of `names`, preserving the caller's order
    pub fn resolve(&self, names: &[&str]) -> Vec<Arc<dyn MediaCodec>> {
        names.iter().filter_map(|n| self.find(n)).collect()
    }

    /// Local endpoint path, `sink` when we receive audio through it
    pub fn endpoint_path(codec: &dyn MediaCodec, sink: bool) -> ObjectPath {
        let dir = match (codec.kind(), sink) {
            (CodecKind::Bap, true) => "BAPSink",
            (CodecKind::Bap, false) => "BAPSource",
            (_, true) => "A2DPSink",
            (_, false) => "A2DPSource",
        };
        codec.kind().endpoint_root().child(dir).child(codec.endpoint_name())
    }

    /// Endpoints to export for the enabled local roles
    pub fn local_endpoints(&self, local_roles: Profiles) -> Vec<LocalEndpoint> {
        let mut out = Vec::new();
        for codec in &self.codecs {
            let (sink_role, sink_uuid, source_role, source_uuid) = match codec.kind() {
                CodecKind::A2dp => (Profiles::A2DP_SINK, UUID_A2DP_SINK, Profiles::A2DP_SOURCE, UUID_A2DP_SOURCE),
                CodecKind::Bap => (Profiles::BAP_SINK, UUID_BAP_SINK, Profiles::BAP_SOURCE, UUID_BAP_SOURCE),
                CodecKind::Hfp => continue,
            };
            for (sink, role, uuid) in [(false, source_role, source_uuid), (true, sink_role, sink_uuid)] {
                if !local_roles.contains(role) {
                    continue;
                }
                out.push(LocalEndpoint {
                    path: Self::endpoint_path(codec.as_ref(), sink),
                    uuid,
                    codec_name: codec.name(),
                    codec_id: codec.codec_id(),
                    vendor: codec.vendor(),
                    capabilities: codec.fill_caps(sink),
                });
            }
        }
        out
    }

    /// Codec and direction owning a local endpoint path
    pub fn codec_for_endpoint(&self, path: &ObjectPath) -> Option<(Arc<dyn MediaCodec>, bool)> {
        self.codecs.iter().find_map(|c| {
            [false, true]
                .into_iter()
                .find(|sink| Self::endpoint_path(c.as_ref(), *sink) == *path)
                .map(|sink| (c.clone(), sink))
        })
    }
}

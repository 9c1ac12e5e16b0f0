//! Remote endpoints and the server role of our local endpoints
//!
//! Remote endpoints are the codec capabilities a peer advertises; the codec
//! switch configures them. The service calls back into our own endpoints
//! (`SetConfiguration`, `SelectConfiguration`, ...) and those calls land
//! here.

use tracing::{debug, info, warn};

use super::registry::{DeviceId, Keyed};
use super::transport::Transport;
use super::Monitor;
use crate::bus::props::{get_bytes, get_path, get_str, get_u32, get_u8};
use crate::bus::{ObjectPath, PropertyMap};
use crate::codec::CodecKind;
use crate::error::{CodecError, DeviceError, Result};
use crate::profile::Profiles;

pub(crate) struct RemoteEndpoint {
    pub path: ObjectPath,
    pub device_path: Option<ObjectPath>,
    pub device: Option<DeviceId>,
    pub uuid: String,
    /// Role of the remote side
    pub profile: Profiles,
    pub codec_id: u8,
    pub vendor: Option<(u16, u16)>,
    pub capabilities: Vec<u8>,
    /// LE Audio unicast server; we initiate the CIG towards it
    pub acceptor: bool,
    pub locations: u32,
}

impl Keyed for RemoteEndpoint {
    fn path(&self) -> &ObjectPath {
        &self.path
    }
}

impl RemoteEndpoint {
    fn new(path: ObjectPath) -> Self {
        Self {
            path,
            device_path: None,
            device: None,
            uuid: String::new(),
            profile: Profiles::NONE,
            codec_id: 0,
            vendor: None,
            capabilities: Vec::new(),
            acceptor: false,
            locations: 0,
        }
    }

    fn update_props(&mut self, props: &PropertyMap) {
        if let Some(device) = get_path(props, "Device") {
            self.device_path = Some(device);
        }
        if let Some(uuid) = get_str(props, "UUID") {
            self.uuid = uuid.to_lowercase();
            self.profile = Profiles::from_uuid_strs([uuid]);
            self.acceptor = self.profile.intersects(Profiles::BAP_DUPLEX);
        }
        if let Some(codec) = get_u8(props, "Codec") {
            self.codec_id = codec;
        }
        if let Some(vendor) = get_u32(props, "Vendor") {
            self.vendor = Some(((vendor >> 16) as u16, (vendor & 0xffff) as u16));
        }
        if let Some(caps) = get_bytes(props, "Capabilities") {
            self.capabilities = caps;
        }
        if let Some(locations) = get_u32(props, "Locations") {
            self.locations = locations;
        }
    }
}

/// Local role served by one of our endpoints
pub(crate) fn local_role(kind: CodecKind, sink: bool) -> Profiles {
    match (kind, sink) {
        (CodecKind::A2dp, true) => Profiles::A2DP_SINK,
        (CodecKind::A2dp, false) => Profiles::A2DP_SOURCE,
        (CodecKind::Bap, true) => Profiles::BAP_SINK,
        (CodecKind::Bap, false) => Profiles::BAP_SOURCE,
        (CodecKind::Hfp, true) => Profiles::HFP_HF,
        (CodecKind::Hfp, false) => Profiles::HFP_AG,
    }
}

impl Monitor {
    pub(super) fn remote_endpoint_added(&mut self, path: &ObjectPath, props: &PropertyMap) {
        if self.reg.endpoints.id(path).is_some() {
            self.remote_endpoint_update(path, props);
            return;
        }
        let mut endpoint = RemoteEndpoint::new(path.clone());
        endpoint.update_props(props);
        endpoint.device = self.endpoint_device(&endpoint);
        if endpoint.device.is_none() {
            debug!("remote endpoint {path}: device not known yet");
        }
        info!(
            "remote endpoint {path} added, profile:{} codec:{:#04x} caps:{} bytes",
            endpoint.profile,
            endpoint.codec_id,
            endpoint.capabilities.len()
        );
        self.reg.endpoints.insert(endpoint);
    }

    fn endpoint_device(&self, endpoint: &RemoteEndpoint) -> Option<DeviceId> {
        match &endpoint.device_path {
            Some(device) => self.reg.devices.id(device),
            None => self
                .reg
                .devices
                .iter()
                .find(|(_, d)| endpoint.path.is_descendant_of(&d.path))
                .map(|(id, _)| id),
        }
    }

    pub(super) fn remote_endpoint_update(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let Some(id) = self.reg.endpoints.id(path) else {
            return;
        };
        let Some(endpoint) = self.reg.endpoints.get_mut(id) else {
            return;
        };
        endpoint.update_props(props);
        if endpoint.device.is_none() {
            let device = self.reg.endpoints.get(id).and_then(|e| self.endpoint_device(e));
            if let Some(endpoint) = self.reg.endpoints.get_mut(id) {
                endpoint.device = device;
            }
        }
    }

    pub(super) fn remote_endpoint_removed(&mut self, path: &ObjectPath) {
        if let Some(id) = self.reg.endpoints.id(path) {
            self.reg.endpoints.remove(id);
            info!("remote endpoint {path} removed");
        }
    }

    /// `MediaEndpoint.SetConfiguration` on one of our endpoints
    pub(super) fn endpoint_set_configuration(
        &mut self,
        endpoint: &ObjectPath,
        transport: &ObjectPath,
        props: &PropertyMap,
    ) -> Result<()> {
        let (codec, sink) = self
            .codecs
            .codec_for_endpoint(endpoint)
            .ok_or_else(|| CodecError::UnknownCodec(endpoint.to_string()))?;
        let role = local_role(codec.kind(), sink);
        if !self.enabled.contains(role) {
            warn!("endpoint {endpoint}: role {role} disabled, refusing configuration");
            return Err(CodecError::Unsupported(codec.name().to_string()).into());
        }
        let device_path =
            get_path(props, "Device").ok_or_else(|| DeviceError::NotFound(format!("{transport}: no device")))?;
        let device = self
            .reg
            .devices
            .id(&device_path)
            .ok_or_else(|| DeviceError::NotFound(device_path.to_string()))?;
        let configuration = get_bytes(props, "Configuration").unwrap_or_default();
        debug!(
            "endpoint {endpoint}: SetConfiguration {transport} codec:{} config:{configuration:02x?}",
            codec.name()
        );

        let t = Transport::new(
            transport.clone(),
            device,
            device_path,
            endpoint.clone(),
            role.swapped(),
            codec,
            configuration,
        );
        self.create_transport(t, props);
        Ok(())
    }

    /// `MediaEndpoint.SelectConfiguration`: pick a configuration from `caps`
    pub(super) fn endpoint_select_configuration(&self, endpoint: &ObjectPath, caps: &[u8]) -> Result<Vec<u8>> {
        let (codec, sink) = self
            .codecs
            .codec_for_endpoint(endpoint)
            .ok_or_else(|| CodecError::UnknownCodec(endpoint.to_string()))?;
        let config = codec.select_config(sink, caps, self.codecs.audio_info())?;
        debug!("endpoint {endpoint}: selected configuration {config:02x?}");
        Ok(config)
    }

    /// `MediaEndpoint.SelectProperties` for LE Audio endpoints
    pub(super) fn endpoint_select_properties(
        &self,
        endpoint: &ObjectPath,
        props: &PropertyMap,
    ) -> Result<(Vec<u8>, PropertyMap)> {
        let (codec, _) = self
            .codecs
            .codec_for_endpoint(endpoint)
            .ok_or_else(|| CodecError::UnknownCodec(endpoint.to_string()))?;
        if codec.kind() != CodecKind::Bap {
            return Err(CodecError::Unsupported(codec.name().to_string()).into());
        }
        let caps = get_bytes(props, "Capabilities")
            .ok_or_else(|| CodecError::InvalidConfig(format!("{endpoint}: no capabilities")))?;
        Ok(codec.select_properties(&caps, props, self.codecs.audio_info())?)
    }

    pub(super) fn endpoint_clear_configuration(&mut self, endpoint: &ObjectPath, transport: &ObjectPath) -> Result<()> {
        match self.reg.transports.id(transport) {
            Some(id) => {
                debug!("endpoint {endpoint}: ClearConfiguration {transport}");
                self.transport_free(id);
            }
            None => debug!("endpoint {endpoint}: ClearConfiguration of unknown {transport}"),
        }
        Ok(())
    }
}

//! Shared test scaffolding for the control context

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use super::device::Device;
use super::registry::{DeviceId, TransportId};
use super::transport::Transport;
use super::{Command, Event, Monitor, MonitorHandle, Notification};
use crate::bus::mock::MockBus;
use crate::bus::{
    BusSignal, InterfaceMap, ObjectPath, PropertyMap, ADAPTER_INTERFACE, DEVICE_INTERFACE,
    MEDIA_ENDPOINT_INTERFACE,
};
use crate::codec::testing::TestCodec;
use crate::codec::{CodecRegistry, MediaCodec};
use crate::config::BackendConfig;
use crate::error::DeviceError;

pub const DEV: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";
pub const DEV2: &str = "/org/bluez/hci0/dev_66_77_88_99_AA_BB";

pub const A2DP_SINK_UUID: &str = "0000110b-0000-1000-8000-00805f9b34fb";
pub const A2DP_SOURCE_UUID: &str = "0000110a-0000-1000-8000-00805f9b34fb";
pub const HFP_HF_UUID: &str = "0000111e-0000-1000-8000-00805f9b34fb";
pub const HFP_AG_UUID: &str = "0000111f-0000-1000-8000-00805f9b34fb";
pub const HSP_HS_UUID: &str = "00001108-0000-1000-8000-00805f9b34fb";
pub const HSP_AG_UUID: &str = "00001112-0000-1000-8000-00805f9b34fb";
pub const BAP_SINK_UUID: &str = "00002bc9-0000-1000-8000-00805f9b34fb";
pub const BAP_SOURCE_UUID: &str = "00002bcb-0000-1000-8000-00805f9b34fb";

pub fn props(value: Value) -> PropertyMap {
    match value {
        Value::Object(map) => map,
        _ => PropertyMap::new(),
    }
}

fn object(path: &str, interface: &str, value: Value) -> (ObjectPath, InterfaceMap) {
    let mut interfaces = InterfaceMap::new();
    interfaces.insert(interface.to_string(), props(value));
    (ObjectPath::from(path), interfaces)
}

pub fn adapter_object(path: &str) -> (ObjectPath, InterfaceMap) {
    object(
        path,
        ADAPTER_INTERFACE,
        json!({
            "Address": "AA:AA:AA:AA:AA:AA",
            "Powered": true,
            "UUIDs": [
                A2DP_SINK_UUID, A2DP_SOURCE_UUID, HFP_HF_UUID, HFP_AG_UUID,
                HSP_HS_UUID, HSP_AG_UUID, BAP_SINK_UUID, BAP_SOURCE_UUID
            ],
        }),
    )
}

pub fn device_object(path: &str, adapter: &str, uuids: &[&str]) -> (ObjectPath, InterfaceMap) {
    let address = path
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_start_matches("dev_")
        .replace('_', ":");
    object(
        path,
        DEVICE_INTERFACE,
        json!({
            "Adapter": adapter,
            "Address": address,
            "UUIDs": uuids,
            "Paired": false,
            "Trusted": false,
            "Connected": false,
        }),
    )
}

pub fn set_device_props(object: &mut (ObjectPath, InterfaceMap), value: Value) {
    if let Some(map) = object.1.get_mut(DEVICE_INTERFACE) {
        map.extend(props(value));
    }
}

/// Remote endpoint below `device`
pub fn endpoint_object(path: &str, device: &str, uuid: &str, codec: u8, caps: &[u8]) -> (ObjectPath, InterfaceMap) {
    object(
        path,
        MEDIA_ENDPOINT_INTERFACE,
        json!({
            "Device": device,
            "UUID": uuid,
            "Codec": codec,
            "Capabilities": caps,
        }),
    )
}

pub fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

pub struct Fixture {
    pub bus: Arc<MockBus>,
    pub monitor: Monitor,
    pub handle: MonitorHandle,
}

impl Fixture {
    /// Monitor with test codecs `aac` (2), `sbc` (0) and LE `lc3` (6)
    pub fn new() -> Self {
        Self::with_config(BackendConfig::default())
    }

    pub fn with_config(config: BackendConfig) -> Self {
        crate::logging::init_for_tests();
        let codecs: Vec<Arc<dyn MediaCodec>> = vec![
            Arc::new(TestCodec::new("aac", 2)),
            Arc::new(TestCodec::new("sbc", 0)),
            Arc::new(TestCodec::new("lc3", 6).bap()),
        ];
        Self::with_codecs(config, codecs)
    }

    pub fn with_codecs(config: BackendConfig, codecs: Vec<Arc<dyn MediaCodec>>) -> Self {
        let bus = Arc::new(MockBus::new());
        let registry = CodecRegistry::new(codecs, &config);
        let (monitor, handle) = Monitor::new(bus.clone(), config, registry, None).unwrap();
        Self { bus, monitor, handle }
    }

    /// Run queued events until nothing is left to do
    pub async fn settle(&mut self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
            while let Ok(event) = self.monitor.events.try_recv() {
                self.monitor.dispatch(event);
            }
        }
    }

    pub async fn start_with(&mut self, objects: Vec<(ObjectPath, InterfaceMap)>) {
        self.bus.set_objects(objects);
        self.monitor.start();
        self.settle().await;
    }

    pub async fn signal(&mut self, signal: BusSignal) {
        self.monitor.dispatch(Event::Signal(signal));
        self.settle().await;
    }

    pub async fn add(&mut self, object: (ObjectPath, InterfaceMap)) {
        let (path, interfaces) = object;
        self.signal(BusSignal::InterfacesAdded { path, interfaces }).await;
    }

    pub async fn remove(&mut self, path: &str, interfaces: &[&str]) {
        self.signal(BusSignal::InterfacesRemoved {
            path: path.into(),
            interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
        })
        .await;
    }

    pub async fn props_changed(&mut self, path: &str, interface: &str, changed: Value) {
        self.signal(BusSignal::PropertiesChanged {
            path: path.into(),
            interface: interface.to_string(),
            changed: props(changed),
            invalidated: Vec::new(),
        })
        .await;
    }

    /// Issue a codec switch without letting any RPC complete
    pub fn ensure_nowait(
        &mut self,
        device: &str,
        codecs: &[&str],
    ) -> oneshot::Receiver<Result<(), DeviceError>> {
        let (reply, rx) = oneshot::channel();
        self.monitor.dispatch(Event::Command(Command::EnsureCodec {
            device: device.into(),
            codecs: codecs.iter().map(|c| c.to_string()).collect(),
            reply,
        }));
        rx
    }

    /// Codec switch result, `None` while still running
    pub async fn ensure(&mut self, device: &str, codecs: &[&str]) -> Option<Result<(), DeviceError>> {
        let mut rx = self.ensure_nowait(device, codecs);
        self.settle().await;
        rx.try_recv().ok()
    }

    /// Create a transport through our endpoint's `SetConfiguration`
    pub async fn configure(&mut self, endpoint: &str, transport: &str, properties: Value) -> TransportId {
        self.monitor
            .endpoint_set_configuration(&endpoint.into(), &transport.into(), &props(properties))
            .unwrap();
        self.settle().await;
        self.monitor.reg.transports.id(&transport.into()).unwrap()
    }

    pub fn device_id(&self, path: &str) -> DeviceId {
        self.monitor.reg.devices.id(&path.into()).unwrap()
    }

    pub fn device(&self, path: &str) -> &Device {
        self.monitor.reg.devices.by_path(&path.into()).unwrap()
    }

    pub fn transport(&self, path: &str) -> &Transport {
        self.monitor.reg.transports.by_path(&path.into()).unwrap()
    }
}

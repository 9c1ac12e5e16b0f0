//! Scripted in-memory bus for tests

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use uuid::Uuid;

use super::{AcquiredSocket, BluezBus, BusError, BusErrorKind, InterfaceMap, LocalEndpoint, ObjectPath, PropertyMap};

/// One recorded RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusCall {
    pub method: &'static str,
    pub path: ObjectPath,
    pub arg: String,
}

#[derive(Default)]
pub struct MockBus {
    calls: Mutex<Vec<BusCall>>,
    script: Mutex<HashMap<&'static str, VecDeque<Result<(), BusError>>>>,
    objects: Mutex<Vec<(ObjectPath, InterfaceMap)>>,
    peers: Mutex<Vec<Socket>>,
    mtu: Mutex<(u16, u16)>,
}

impl MockBus {
    pub fn new() -> Self {
        let bus = Self::default();
        *bus.mtu.lock() = (672, 672);
        bus
    }

    /// Make the next call of `method` fail with `kind`
    pub fn fail_next(&self, method: &'static str, kind: BusErrorKind) {
        self.script
            .lock()
            .entry(method)
            .or_default()
            .push_back(Err(BusError::new(kind, format!("scripted {method} failure"))));
    }

    pub fn set_objects(&self, objects: Vec<(ObjectPath, InterfaceMap)>) {
        *self.objects.lock() = objects;
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<BusCall> {
        self.calls.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, method: &'static str, path: &ObjectPath, arg: impl Into<String>) -> Result<(), BusError> {
        self.calls.lock().push(BusCall {
            method,
            path: path.clone(),
            arg: arg.into(),
        });
        self.script
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl BluezBus for MockBus {
    async fn get_managed_objects(&self) -> Result<Vec<(ObjectPath, InterfaceMap)>, BusError> {
        self.record("GetManagedObjects", &ObjectPath::from("/"), "")?;
        Ok(self.objects.lock().clone())
    }

    async fn register_application(&self, adapter: &ObjectPath, root: &ObjectPath) -> Result<(), BusError> {
        self.record("RegisterApplication", adapter, root.as_str())
    }

    async fn register_endpoint(&self, adapter: &ObjectPath, endpoint: &LocalEndpoint) -> Result<(), BusError> {
        self.record("RegisterEndpoint", adapter, endpoint.path.as_str())
    }

    async fn connect_profile(&self, device: &ObjectPath, uuid: Uuid) -> Result<(), BusError> {
        self.record("ConnectProfile", device, uuid.to_string())
    }

    async fn set_configuration(
        &self,
        remote_endpoint: &ObjectPath,
        local_endpoint: &ObjectPath,
        _properties: PropertyMap,
    ) -> Result<(), BusError> {
        self.record("SetConfiguration", remote_endpoint, local_endpoint.as_str())
    }

    async fn acquire(&self, transport: &ObjectPath, optional: bool) -> Result<AcquiredSocket, BusError> {
        let method = if optional { "TryAcquire" } else { "Acquire" };
        self.record(method, transport, "")?;
        let (ours, theirs) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None)
            .map_err(|e| BusError::failed(e.to_string()))?;
        self.peers.lock().push(theirs);
        let (read_mtu, write_mtu) = *self.mtu.lock();
        Ok(AcquiredSocket {
            socket: ours,
            read_mtu,
            write_mtu,
        })
    }

    async fn release(&self, transport: &ObjectPath) -> Result<(), BusError> {
        self.record("Release", transport, "")
    }

    async fn register_battery_provider(&self, adapter: &ObjectPath, root: &ObjectPath) -> Result<(), BusError> {
        self.record("RegisterBatteryProvider", adapter, root.as_str())
    }

    async fn publish_battery(&self, object: &ObjectPath, _device: &ObjectPath, percentage: u8) -> Result<(), BusError> {
        self.record("PublishBattery", object, percentage.to_string())
    }

    async fn remove_battery(&self, object: &ObjectPath) -> Result<(), BusError> {
        self.record("RemoveBattery", object, "")
    }
}

//! Bluetooth service bus seam
//!
//! The back-end talks to the system Bluetooth service through [`BluezBus`].
//! Any RPC transport can implement it as long as the method semantics are
//! preserved. Incoming traffic (object-manager signals, and endpoint calls
//! made by the service on our registered endpoints) is fed into the monitor
//! through [`crate::monitor::MonitorHandle`].

pub mod props;

#[cfg(test)]
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::Socket;
use thiserror::Error;
use uuid::Uuid;

pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const MEDIA_ENDPOINT_INTERFACE: &str = "org.bluez.MediaEndpoint1";
pub const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
pub const DEVICE_SET_INTERFACE: &str = "org.bluez.DeviceSet1";
pub const MEDIA_INTERFACE: &str = "org.bluez.Media1";
pub const BATTERY_PROVIDER_MANAGER_INTERFACE: &str = "org.bluez.BatteryProviderManager1";

/// Object path on the bus
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        ObjectPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of a child object, `/a` + `b` -> `/a/b`
    pub fn child(&self, name: &str) -> ObjectPath {
        if self.0.ends_with('/') {
            ObjectPath(format!("{}{}", self.0, name))
        } else {
            ObjectPath(format!("{}/{}", self.0, name))
        }
    }

    /// True for strict descendants, e.g. a device below its adapter
    pub fn is_descendant_of(&self, parent: &ObjectPath) -> bool {
        self.0.len() > parent.0.len()
            && self.0.starts_with(&parent.0)
            && self.0.as_bytes()[parent.0.len()] == b'/'
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(value: &str) -> Self {
        ObjectPath(value.to_string())
    }
}

/// Property name -> value
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Interface name -> properties, as reported by the object manager
pub type InterfaceMap = BTreeMap<String, PropertyMap>;

/// Classified bus error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// The service did not answer in time
    NoReply,
    UnknownMethod,
    UnknownObject,
    InvalidArguments,
    NotAvailable,
    /// Service-side failure, e.g. `org.bluez.Error.Failed`
    Failed,
    /// Connection to the bus lost
    Disconnected,
}

/// Error returned by a bus RPC
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct BusError {
    pub kind: BusErrorKind,
    pub message: String,
}

impl BusError {
    pub fn new(kind: BusErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(BusErrorKind::Failed, message)
    }

    /// Method or object is gone, the call can never succeed
    pub fn is_gone(&self) -> bool {
        matches!(self.kind, BusErrorKind::UnknownMethod | BusErrorKind::UnknownObject)
    }
}

/// Signals delivered by the service's object manager
#[derive(Debug, Clone)]
pub enum BusSignal {
    InterfacesAdded {
        path: ObjectPath,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        path: ObjectPath,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        path: ObjectPath,
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
    /// The service (re)appeared on the bus
    ServiceAppeared,
    /// The service left the bus; every object is gone
    ServiceVanished,
}

/// A media endpoint exported by the back-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub path: ObjectPath,
    pub uuid: Uuid,
    pub codec_name: &'static str,
    pub codec_id: u8,
    pub vendor: Option<(u16, u16)>,
    pub capabilities: Vec<u8>,
}

/// Socket handed out by a successful `Acquire`
#[derive(Debug)]
pub struct AcquiredSocket {
    pub socket: Socket,
    pub read_mtu: u16,
    pub write_mtu: u16,
}

/// RPC surface of the Bluetooth service consumed by the back-end
#[async_trait]
pub trait BluezBus: Send + Sync + 'static {
    /// `ObjectManager.GetManagedObjects`
    async fn get_managed_objects(&self) -> Result<Vec<(ObjectPath, InterfaceMap)>, BusError>;

    /// `Media.RegisterApplication` with our object-manager root
    async fn register_application(&self, adapter: &ObjectPath, root: &ObjectPath) -> Result<(), BusError>;

    /// Legacy `Media.RegisterEndpoint`
    async fn register_endpoint(&self, adapter: &ObjectPath, endpoint: &LocalEndpoint) -> Result<(), BusError>;

    /// `Device.ConnectProfile`
    async fn connect_profile(&self, device: &ObjectPath, uuid: Uuid) -> Result<(), BusError>;

    /// `MediaEndpoint.SetConfiguration` on a remote endpoint
    async fn set_configuration(
        &self,
        remote_endpoint: &ObjectPath,
        local_endpoint: &ObjectPath,
        properties: PropertyMap,
    ) -> Result<(), BusError>;

    /// `MediaTransport.Acquire`, or `TryAcquire` when `optional`
    async fn acquire(&self, transport: &ObjectPath, optional: bool) -> Result<AcquiredSocket, BusError>;

    /// `MediaTransport.Release`
    async fn release(&self, transport: &ObjectPath) -> Result<(), BusError>;

    /// `BatteryProviderManager.RegisterBatteryProvider`
    async fn register_battery_provider(&self, adapter: &ObjectPath, root: &ObjectPath) -> Result<(), BusError>;

    /// Export or update a battery object for `device`
    async fn publish_battery(&self, object: &ObjectPath, device: &ObjectPath, percentage: u8) -> Result<(), BusError>;

    /// Withdraw a battery object
    async fn remove_battery(&self, object: &ObjectPath) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descendant() {
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let device = adapter.child("dev_00_11_22_33_44_55");
        assert_eq!(device.as_str(), "/org/bluez/hci0/dev_00_11_22_33_44_55");
        assert!(device.is_descendant_of(&adapter));
        assert!(!adapter.is_descendant_of(&adapter));
        assert!(!ObjectPath::from("/org/bluez/hci01/x").is_descendant_of(&adapter));
    }

    #[test]
    fn test_bus_error_classification() {
        assert!(BusError::new(BusErrorKind::UnknownObject, "gone").is_gone());
        assert!(!BusError::failed("busy").is_gone());
    }
}

//! Object registry
//!
//! The registry owns every adapter, device, remote endpoint and transport
//! by value. Cross references between them are generational ids, so
//! removing an object invalidates every id pointing at it.

use std::collections::HashMap;

use super::adapter::Adapter;
use super::arena::{Arena, Id};
use super::device::Device;
use super::endpoint::RemoteEndpoint;
use super::transport::Transport;
use crate::bus::ObjectPath;

pub(crate) type AdapterId = Id<Adapter>;
pub(crate) type DeviceId = Id<Device>;
pub(crate) type EndpointId = Id<RemoteEndpoint>;
pub(crate) type TransportId = Id<Transport>;

/// Objects addressed by their bus path
pub(crate) trait Keyed {
    fn path(&self) -> &ObjectPath;
}

/// Arena plus path index
pub(crate) struct Table<T> {
    arena: Arena<T>,
    by_path: HashMap<ObjectPath, Id<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            arena: Arena::new(),
            by_path: HashMap::new(),
        }
    }
}

impl<T: Keyed> Table<T> {
    pub fn insert(&mut self, value: T) -> Id<T> {
        let path = value.path().clone();
        let id = self.arena.insert(value);
        self.by_path.insert(path, id);
        id
    }

    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let value = self.arena.remove(id)?;
        self.by_path.remove(value.path());
        Some(value)
    }

    pub fn id(&self, path: &ObjectPath) -> Option<Id<T>> {
        self.by_path.get(path).copied()
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.arena.get_mut(id)
    }

    pub fn by_path(&self, path: &ObjectPath) -> Option<&T> {
        self.id(path).and_then(|id| self.arena.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id<T>, &mut T)> {
        self.arena.iter_mut()
    }

    pub fn ids(&self) -> Vec<Id<T>> {
        self.arena.ids()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }
}

/// Coordinated set of devices, e.g. a pair of LE Audio earbuds
#[derive(Debug, Clone)]
pub(crate) struct DeviceSet {
    pub path: ObjectPath,
    pub adapter: Option<ObjectPath>,
    pub members: Vec<ObjectPath>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub adapters: Table<Adapter>,
    pub devices: Table<Device>,
    pub endpoints: Table<RemoteEndpoint>,
    pub transports: Table<Transport>,
    pub sets: HashMap<ObjectPath, DeviceSet>,
}

impl Registry {
    pub fn device_transports(&self, device: DeviceId) -> Vec<TransportId> {
        self.transports
            .iter()
            .filter(|(_, t)| t.device == device)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn device_endpoints(&self, device: DeviceId) -> Vec<EndpointId> {
        self.endpoints
            .iter()
            .filter(|(_, e)| e.device == Some(device))
            .map(|(id, _)| id)
            .collect()
    }

    /// Devices below `adapter`
    pub fn adapter_devices(&self, adapter: AdapterId) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.adapter == Some(adapter))
            .map(|(id, _)| id)
            .collect()
    }

    /// Members of a set that are known devices
    pub fn set_members(&self, set: &ObjectPath) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.sets.iter().any(|m| m.set == *set))
            .map(|(id, _)| id)
            .collect()
    }
}

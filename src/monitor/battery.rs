//! Battery levels published through the adapter's battery provider

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::pending::{take_matching, PendingCall};
use super::registry::{AdapterId, DeviceId};
use super::{Completion, Monitor};
use crate::bus::{BusError, ObjectPath};
use crate::error::{DeviceError, Result};

/// Root below which battery objects are exported
pub const BATTERY_PROVIDER_ROOT: &str = "/BatteryProvider";

/// Per-adapter provider registration
#[derive(Default)]
pub(crate) struct BatteryProvider {
    pub registered: bool,
    pub register_call: Option<PendingCall>,
    /// Levels reported before registration finished, by device
    pub queued: HashMap<ObjectPath, u8>,
}

impl BatteryProvider {
    pub fn root(adapter_name: &str) -> ObjectPath {
        ObjectPath::from(BATTERY_PROVIDER_ROOT).child(adapter_name)
    }
}

fn battery_object(root: &ObjectPath, device: &ObjectPath) -> ObjectPath {
    root.child(device.as_str().rsplit('/').next().unwrap_or_default())
}

impl Monitor {
    pub(super) fn report_battery(&mut self, device: &ObjectPath, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        if !self.config.battery_provider {
            return Ok(());
        }
        let Some(id) = self.reg.devices.id(device) else {
            return Err(DeviceError::NotFound(device.to_string()).into());
        };
        let Some(adapter_id) = self.reg.devices.get(id).and_then(|d| d.adapter) else {
            debug!("{device}: battery level {percent}% without adapter");
            return Ok(());
        };
        if let Some(d) = self.reg.devices.get_mut(id) {
            d.battery = Some(percent);
        }

        let Some(adapter) = self.reg.adapters.get_mut(adapter_id) else {
            return Ok(());
        };
        if adapter.battery.registered {
            let root = BatteryProvider::root(adapter.name());
            self.publish_battery(&root, device, percent);
            return Ok(());
        }

        adapter.battery.queued.insert(device.clone(), percent);
        if adapter.battery.register_call.is_none() {
            let bus = self.bus.clone();
            let path = adapter.path.clone();
            let root = BatteryProvider::root(adapter.name());
            info!("registering battery provider {root} on {path}");
            let call = self.tasks.call(
                async move { bus.register_battery_provider(&path, &root).await },
                move |token, result| Completion::BatteryRegistered {
                    adapter: adapter_id,
                    token,
                    result,
                },
            );
            if let Some(adapter) = self.reg.adapters.get_mut(adapter_id) {
                adapter.battery.register_call = Some(call);
            }
        }
        Ok(())
    }

    fn publish_battery(&self, root: &ObjectPath, device: &ObjectPath, percent: u8) {
        let bus = self.bus.clone();
        let object = battery_object(root, device);
        let device = device.clone();
        debug!("battery {object}: {percent}%");
        self.tasks.detach("PublishBattery", object.clone(), async move {
            bus.publish_battery(&object, &device, percent).await
        });
    }

    pub(super) fn on_battery_registered(&mut self, id: AdapterId, token: u64, result: std::result::Result<(), BusError>) {
        let Some(adapter) = self.reg.adapters.get_mut(id) else {
            return;
        };
        if !take_matching(&mut adapter.battery.register_call, token) {
            return;
        }
        let queued = std::mem::take(&mut adapter.battery.queued);
        if let Err(e) = result {
            warn!("RegisterBatteryProvider on {} failed: {e}", adapter.path);
            return;
        }
        adapter.battery.registered = true;
        let root = BatteryProvider::root(adapter.name());
        for (device, percent) in queued {
            self.publish_battery(&root, &device, percent);
        }
    }

    /// Withdraw the battery object of a device going away
    pub(super) fn remove_device_battery(&mut self, id: DeviceId) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        if device.battery.take().is_none() {
            return;
        }
        let path = device.path.clone();
        let Some(adapter) = device.adapter.and_then(|a| self.reg.adapters.get_mut(a)) else {
            return;
        };
        adapter.battery.queued.remove(&path);
        if !adapter.battery.registered {
            return;
        }
        let object = battery_object(&BatteryProvider::root(adapter.name()), &path);
        let bus = self.bus.clone();
        self.tasks.detach("RemoveBattery", object.clone(), async move {
            bus.remove_battery(&object).await
        });
    }
}

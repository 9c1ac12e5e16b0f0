//! Adapters and media application registration

use tracing::{debug, info, warn};

use super::battery::BatteryProvider;
use super::pending::{take_matching, PendingCall};
use super::registry::{AdapterId, Keyed};
use super::{Completion, Monitor, APPLICATION_ROOT};
use crate::bus::props::{get_bool, get_str, get_str_list};
use crate::bus::{BusError, BusErrorKind, LocalEndpoint, ObjectPath, PropertyMap};
use crate::profile::Profiles;

pub(crate) struct Adapter {
    pub path: ObjectPath,
    pub address: String,
    pub alias: String,
    pub powered: bool,
    /// Local roles advertised by the controller
    pub profiles: Profiles,
    pub le_audio: bool,
    pub broadcast: bool,
    pub application_registered: bool,
    pub legacy_endpoints: bool,
    pub register_call: Option<PendingCall>,
    pub battery: BatteryProvider,
}

impl Keyed for Adapter {
    fn path(&self) -> &ObjectPath {
        &self.path
    }
}

impl Adapter {
    fn new(path: ObjectPath) -> Self {
        Self {
            path,
            address: String::new(),
            alias: String::new(),
            powered: false,
            profiles: Profiles::NONE,
            le_audio: false,
            broadcast: false,
            application_registered: false,
            legacy_endpoints: false,
            register_call: None,
            battery: BatteryProvider::default(),
        }
    }

    fn update_props(&mut self, props: &PropertyMap) {
        if let Some(address) = get_str(props, "Address") {
            self.address = address.to_string();
        }
        if let Some(alias) = get_str(props, "Alias") {
            self.alias = alias.to_string();
        }
        if let Some(powered) = get_bool(props, "Powered") {
            self.powered = powered;
        }
        if let Some(uuids) = get_str_list(props, "UUIDs") {
            self.profiles = Profiles::from_uuid_strs(uuids);
            self.le_audio = self.profiles.intersects(Profiles::BAP_DUPLEX);
            self.broadcast = self.profiles.intersects(Profiles::BAP_BROADCAST);
        }
    }

    /// Last path component, e.g. `hci0`
    pub fn name(&self) -> &str {
        self.path.as_str().rsplit('/').next().unwrap_or_default()
    }
}

impl Monitor {
    pub(super) fn adapter_added(&mut self, path: &ObjectPath, props: &PropertyMap) {
        if self.reg.adapters.id(path).is_some() {
            self.adapter_update(path, props);
            return;
        }
        let mut adapter = Adapter::new(path.clone());
        adapter.update_props(props);
        info!(
            "adapter {path} added, address:{} profiles:{}",
            adapter.address, adapter.profiles
        );
        let id = self.reg.adapters.insert(adapter);

        // Devices may have been reported before their adapter
        for (_, device) in self.reg.devices.iter_mut() {
            if device.adapter.is_none() && device.adapter_path == *path {
                device.adapter = Some(id);
            }
        }
        self.register_application(id);
    }

    pub(super) fn adapter_update(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let Some(adapter) = self.reg.adapters.id(path).and_then(|id| self.reg.adapters.get_mut(id)) else {
            return;
        };
        adapter.update_props(props);
        debug!("adapter {path} updated, profiles:{}", adapter.profiles);
    }

    pub(super) fn adapter_removed(&mut self, path: &ObjectPath) {
        let Some(id) = self.reg.adapters.id(path) else {
            return;
        };
        for device in self.reg.adapter_devices(id) {
            self.device_free(device);
        }
        self.reg.adapters.remove(id);
        info!("adapter {path} removed");
    }

    fn register_application(&mut self, id: AdapterId) {
        let Some(adapter) = self.reg.adapters.get(id) else {
            return;
        };
        let bus = self.bus.clone();
        let path = adapter.path.clone();
        info!("registering media application on {path}");
        let call = self.tasks.call(
            async move {
                bus.register_application(&path, &ObjectPath::from(APPLICATION_ROOT))
                    .await
            },
            move |token, result| Completion::RegisterApplication {
                adapter: id,
                token,
                result,
            },
        );
        if let Some(adapter) = self.reg.adapters.get_mut(id) {
            adapter.register_call = Some(call);
        }
    }

    pub(super) fn on_register_application(
        &mut self,
        id: AdapterId,
        token: u64,
        result: Result<(), BusError>,
    ) {
        let Some(adapter) = self.reg.adapters.get_mut(id) else {
            return;
        };
        if !take_matching(&mut adapter.register_call, token) {
            return;
        }
        match result {
            Ok(()) => {
                adapter.application_registered = true;
                info!("media application registered on {}", adapter.path);
            }
            Err(e) if e.kind == BusErrorKind::UnknownMethod => {
                info!("{}: no RegisterApplication, using legacy endpoints", adapter.path);
                self.register_legacy_endpoints(id);
            }
            Err(e) => warn!("RegisterApplication on {} failed: {e}", adapter.path),
        }
    }

    /// Old services only know `RegisterEndpoint`, and only SBC can be used
    /// without codec switching
    fn register_legacy_endpoints(&mut self, id: AdapterId) {
        let Some(adapter) = self.reg.adapters.get_mut(id) else {
            return;
        };
        adapter.legacy_endpoints = true;
        let adapter_path = adapter.path.clone();

        for endpoint in self.application_objects() {
            if endpoint.codec_name != "sbc" {
                continue;
            }
            let bus = self.bus.clone();
            let path = adapter_path.clone();
            debug!("registering legacy endpoint {} on {path}", endpoint.path);
            self.tasks.detach("RegisterEndpoint", endpoint.path.clone(), async move {
                bus.register_endpoint(&path, &endpoint).await
            });
        }
    }

    /// Local endpoints exported below the application root
    pub(super) fn application_objects(&self) -> Vec<LocalEndpoint> {
        self.codecs.local_endpoints(self.enabled)
    }

    /// Local roles usable on `adapter`
    pub(super) fn adapter_local_roles(&self, adapter: &Adapter) -> Profiles {
        let mut roles = adapter.profiles & self.enabled;
        if !adapter.le_audio {
            roles.remove(Profiles::BAP_DUPLEX);
        }
        if !adapter.broadcast {
            roles.remove(Profiles::BAP_BROADCAST);
        }
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::bus::BusErrorKind;
    use crate::error::DeviceError;

    #[tokio::test(start_paused = true)]
    async fn test_adapter_registers_application() {
        let mut fx = Fixture::new();
        fx.start_with(vec![adapter_object("/org/bluez/hci0")]).await;

        assert_eq!(fx.bus.count("RegisterApplication"), 1);
        let id = fx.monitor.reg.adapters.id(&"/org/bluez/hci0".into()).unwrap();
        let adapter = fx.monitor.reg.adapters.get(id).unwrap();
        assert!(adapter.application_registered);
        assert!(adapter.le_audio);
        assert_eq!(adapter.name(), "hci0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_registration_fallback() {
        let mut fx = Fixture::new();
        fx.bus.fail_next("RegisterApplication", BusErrorKind::UnknownMethod);
        fx.start_with(vec![
            adapter_object("/org/bluez/hci0"),
            device_object(DEV, "/org/bluez/hci0", &[A2DP_SINK_UUID]),
        ])
        .await;

        let registered = fx.bus.calls_to("RegisterEndpoint");
        assert_eq!(registered.len(), 2);
        assert!(registered.iter().all(|c| c.arg.ends_with("/sbc")));

        let res = fx.ensure(DEV, &["sbc"]).await;
        assert_eq!(res, Some(Err(DeviceError::SwitchNotSupported)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_removal_drops_devices() {
        let mut fx = Fixture::new();
        fx.start_with(vec![
            adapter_object("/org/bluez/hci0"),
            device_object(DEV, "/org/bluez/hci0", &[A2DP_SINK_UUID]),
        ])
        .await;
        assert_eq!(fx.monitor.reg.devices.len(), 1);

        fx.remove("/org/bluez/hci0", &[crate::bus::ADAPTER_INTERFACE]).await;
        assert_eq!(fx.monitor.reg.devices.len(), 0);
        assert_eq!(fx.monitor.reg.adapters.len(), 0);
    }
}

//! Control context
//!
//! [`Monitor`] owns the object registry and reacts to three kinds of
//! events, all delivered through one channel and handled one at a time:
//!
//! ```text
//!   bus signals ──────┐
//!   handle commands ──┼──> mpsc ──> Monitor::dispatch ──> registry
//!   RPC / timer done ─┘                    │
//!                                          ├──> BluezBus RPC tasks
//!                                          ├──> broadcast<Notification>
//!                                          └──> DashMap<TransportSummary>
//! ```
//!
//! Nothing in the registry is shared: other tasks talk to the monitor
//! through a cloneable [`MonitorHandle`] and read published transport
//! summaries.

pub(crate) mod adapter;
pub(crate) mod arena;
pub(crate) mod battery;
pub(crate) mod codec_switch;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod pending;
pub(crate) mod registry;
pub(crate) mod transport;

#[cfg(test)]
mod fixtures;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{
    AcquiredSocket, BluezBus, BusError, BusSignal, InterfaceMap, LocalEndpoint, ObjectPath, PropertyMap,
    ADAPTER_INTERFACE, DEVICE_INTERFACE, DEVICE_SET_INTERFACE, MEDIA_ENDPOINT_INTERFACE,
    MEDIA_TRANSPORT_INTERFACE,
};
use crate::codec::CodecRegistry;
use crate::config::BackendConfig;
use crate::data_loop::DataLoop;
use crate::error::{DeviceError, Error, Result};
use crate::iso::{IsoScheduler, PullFn, StreamId};
use crate::profile::Profiles;
use pending::{take_matching, PendingCall, Tasks};
use registry::{AdapterId, DeviceId, Registry, TransportId};

pub use transport::{TransportIo, TransportState, TransportSummary};

/// Object-manager root of our media application
pub const APPLICATION_ROOT: &str = "/";

/// State changes published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DeviceAdded(ObjectPath),
    DeviceRemoved(ObjectPath),
    /// The device settled with usable profiles
    DeviceConnected(ObjectPath),
    DeviceDisconnected(ObjectPath),
    ProfilesChanged { device: ObjectPath, connected: Profiles },
    /// A codec switch ran to completion; 0 or a negative errno
    CodecSwitched { device: ObjectPath, status: i32 },
    TransportState {
        transport: ObjectPath,
        old: TransportState,
        new: TransportState,
    },
    SetLeader {
        set: ObjectPath,
        device: ObjectPath,
        leader: bool,
    },
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    EnsureCodec {
        device: ObjectPath,
        codecs: Vec<String>,
        reply: oneshot::Sender<std::result::Result<(), DeviceError>>,
    },
    Acquire {
        transport: ObjectPath,
        optional: bool,
        reply: Reply<()>,
    },
    Release {
        transport: ObjectPath,
        reply: Reply<()>,
    },
    Keepalive {
        transport: ObjectPath,
        keepalive: bool,
        reply: Reply<()>,
    },
    TransportSocket {
        transport: ObjectPath,
        reply: oneshot::Sender<Option<TransportIo>>,
    },
    SetConfiguration {
        endpoint: ObjectPath,
        transport: ObjectPath,
        properties: PropertyMap,
        reply: Reply<()>,
    },
    SelectConfiguration {
        endpoint: ObjectPath,
        capabilities: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    SelectProperties {
        endpoint: ObjectPath,
        properties: PropertyMap,
        reply: Reply<(Vec<u8>, PropertyMap)>,
    },
    ClearConfiguration {
        endpoint: ObjectPath,
        transport: ObjectPath,
        reply: Reply<()>,
    },
    AddProfile {
        device: ObjectPath,
        profile: Profiles,
        reply: Reply<()>,
    },
    ReportBattery {
        device: ObjectPath,
        percent: u8,
        reply: Reply<()>,
    },
    ApplicationObjects {
        reply: oneshot::Sender<Vec<LocalEndpoint>>,
    },
    EnsureIsoIo {
        transport: ObjectPath,
        pull: Option<PullFn>,
        reply: Reply<StreamId>,
    },
    Shutdown,
}

/// Result of a task started by the monitor
pub(crate) enum Completion {
    ManagedObjects {
        token: u64,
        result: std::result::Result<Vec<(ObjectPath, InterfaceMap)>, BusError>,
    },
    RegisterApplication {
        adapter: AdapterId,
        token: u64,
        result: std::result::Result<(), BusError>,
    },
    BatteryRegistered {
        adapter: AdapterId,
        token: u64,
        result: std::result::Result<(), BusError>,
    },
    ReconnectTimer {
        device: DeviceId,
        token: u64,
    },
    SwitchTimer {
        device: DeviceId,
        job: u64,
        token: u64,
    },
    SwitchReply {
        device: DeviceId,
        job: u64,
        token: u64,
        result: std::result::Result<(), BusError>,
    },
    Acquire {
        transport: TransportId,
        token: u64,
        result: std::result::Result<AcquiredSocket, BusError>,
    },
    ReleaseTimer {
        transport: TransportId,
        token: u64,
    },
    #[cfg(test)]
    Test { token: u64 },
}

pub(crate) enum Event {
    Command(Command),
    Signal(BusSignal),
    Completion(Completion),
}

/// The Bluetooth control context
pub struct Monitor {
    bus: Arc<dyn BluezBus>,
    config: BackendConfig,
    codecs: CodecRegistry,
    iso: Option<Arc<DataLoop<IsoScheduler>>>,
    /// Local roles we register endpoints for
    enabled: Profiles,
    reconnect_mask: Profiles,
    reg: Registry,
    tasks: Tasks,
    events: mpsc::UnboundedReceiver<Event>,
    notify: broadcast::Sender<Notification>,
    summaries: Arc<DashMap<ObjectPath, TransportSummary>>,
    objects_call: Option<PendingCall>,
    next_switch_id: u64,
}

impl Monitor {
    pub fn new(
        bus: Arc<dyn BluezBus>,
        config: BackendConfig,
        codecs: CodecRegistry,
        iso: Option<Arc<DataLoop<IsoScheduler>>>,
    ) -> Result<(Self, MonitorHandle)> {
        let enabled = config.enabled_profiles()?;
        let reconnect_mask = config.reconnect_profile_mask()?;
        let (tx, events) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(256);
        let summaries = Arc::new(DashMap::new());

        let handle = MonitorHandle {
            tx: tx.clone(),
            notify: notify.clone(),
            summaries: summaries.clone(),
        };
        let monitor = Self {
            bus,
            config,
            codecs,
            iso,
            enabled,
            reconnect_mask,
            reg: Registry::default(),
            tasks: Tasks::new(tx),
            events,
            notify,
            summaries,
            objects_call: None,
            next_switch_id: 1,
        };
        Ok((monitor, handle))
    }

    /// Serve events until shut down
    pub async fn run(mut self) -> Result<()> {
        info!("Bluetooth monitor starting, local roles: {}", self.enabled);
        self.start();
        while let Some(event) = self.events.recv().await {
            if !self.dispatch(event) {
                break;
            }
        }
        self.clear_all();
        info!("Bluetooth monitor stopped");
        Ok(())
    }

    /// Ask the service for its current objects
    fn start(&mut self) {
        let bus = self.bus.clone();
        self.objects_call = Some(self.tasks.call(
            async move { bus.get_managed_objects().await },
            |token, result| Completion::ManagedObjects { token, result },
        ));
    }

    /// Handle one event; false once the monitor should stop
    pub(crate) fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::Command(Command::Shutdown) => return false,
            Event::Command(cmd) => self.handle_command(cmd),
            Event::Signal(signal) => self.handle_signal(signal),
            Event::Completion(done) => self.handle_completion(done),
        }
        true
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureCodec { device, codecs, reply } => {
                let names: Vec<&str> = codecs.iter().map(String::as_str).collect();
                self.ensure_media_codec(&device, &names, reply);
            }
            Command::Acquire {
                transport,
                optional,
                reply,
            } => {
                let _ = reply.send(self.acquire_path(&transport, optional));
            }
            Command::Release { transport, reply } => {
                let _ = reply.send(self.release_path(&transport));
            }
            Command::Keepalive {
                transport,
                keepalive,
                reply,
            } => {
                let _ = reply.send(self.keepalive_path(&transport, keepalive));
            }
            Command::TransportSocket { transport, reply } => {
                let _ = reply.send(self.transport_io(&transport));
            }
            Command::SetConfiguration {
                endpoint,
                transport,
                properties,
                reply,
            } => {
                let _ = reply.send(self.endpoint_set_configuration(&endpoint, &transport, &properties));
            }
            Command::SelectConfiguration {
                endpoint,
                capabilities,
                reply,
            } => {
                let _ = reply.send(self.endpoint_select_configuration(&endpoint, &capabilities));
            }
            Command::SelectProperties {
                endpoint,
                properties,
                reply,
            } => {
                let _ = reply.send(self.endpoint_select_properties(&endpoint, &properties));
            }
            Command::ClearConfiguration {
                endpoint,
                transport,
                reply,
            } => {
                let _ = reply.send(self.endpoint_clear_configuration(&endpoint, &transport));
            }
            Command::AddProfile {
                device,
                profile,
                reply,
            } => {
                let res = match self.reg.devices.id(&device) {
                    Some(id) => {
                        self.add_profile(id, profile);
                        Ok(())
                    }
                    None => Err(DeviceError::NotFound(device.to_string()).into()),
                };
                let _ = reply.send(res);
            }
            Command::ReportBattery {
                device,
                percent,
                reply,
            } => {
                let _ = reply.send(self.report_battery(&device, percent));
            }
            Command::ApplicationObjects { reply } => {
                let _ = reply.send(self.application_objects());
            }
            Command::EnsureIsoIo {
                transport,
                pull,
                reply,
            } => {
                let _ = reply.send(self.ensure_iso_io(&transport, pull));
            }
            Command::Shutdown => {}
        }
    }

    fn handle_signal(&mut self, signal: BusSignal) {
        match signal {
            BusSignal::InterfacesAdded { path, interfaces } => self.interfaces_added(&path, &interfaces),
            BusSignal::InterfacesRemoved { path, interfaces } => {
                let names: Vec<&str> = interfaces.iter().map(String::as_str).collect();
                self.interfaces_removed(&path, &names);
            }
            BusSignal::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated: _,
            } => self.properties_changed(&path, &interface, &changed),
            BusSignal::ServiceAppeared => {
                info!("Bluetooth service appeared");
                self.clear_all();
                self.start();
            }
            BusSignal::ServiceVanished => {
                warn!("Bluetooth service vanished");
                self.clear_all();
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::ManagedObjects { token, result } => {
                if take_matching(&mut self.objects_call, token) {
                    self.on_managed_objects(result);
                }
            }
            Completion::RegisterApplication { adapter, token, result } => {
                self.on_register_application(adapter, token, result)
            }
            Completion::BatteryRegistered { adapter, token, result } => {
                self.on_battery_registered(adapter, token, result)
            }
            Completion::ReconnectTimer { device, token } => self.on_reconnect_timer(device, token),
            Completion::SwitchTimer { device, job, token } => self.on_switch_timer(device, job, token),
            Completion::SwitchReply {
                device,
                job,
                token,
                result,
            } => self.on_switch_reply(device, job, token, result),
            Completion::Acquire {
                transport,
                token,
                result,
            } => self.on_acquire_reply(transport, token, result),
            Completion::ReleaseTimer { transport, token } => self.on_release_timer(transport, token),
            #[cfg(test)]
            Completion::Test { .. } => {}
        }
    }

    fn on_managed_objects(&mut self, result: std::result::Result<Vec<(ObjectPath, InterfaceMap)>, BusError>) {
        let objects = match result {
            Ok(objects) => objects,
            Err(e) => {
                warn!("GetManagedObjects failed: {e}");
                return;
            }
        };
        debug!("GetManagedObjects returned {} objects", objects.len());

        // Parents before children, whatever order the service reports
        for interface in [
            ADAPTER_INTERFACE,
            DEVICE_INTERFACE,
            DEVICE_SET_INTERFACE,
            MEDIA_ENDPOINT_INTERFACE,
            MEDIA_TRANSPORT_INTERFACE,
        ] {
            for (path, interfaces) in &objects {
                if let Some(props) = interfaces.get(interface) {
                    self.interface_added(path, interface, props);
                }
            }
        }
    }

    fn interfaces_added(&mut self, path: &ObjectPath, interfaces: &InterfaceMap) {
        for interface in [
            ADAPTER_INTERFACE,
            DEVICE_INTERFACE,
            DEVICE_SET_INTERFACE,
            MEDIA_ENDPOINT_INTERFACE,
            MEDIA_TRANSPORT_INTERFACE,
        ] {
            if let Some(props) = interfaces.get(interface) {
                self.interface_added(path, interface, props);
            }
        }
    }

    fn interface_added(&mut self, path: &ObjectPath, interface: &str, props: &PropertyMap) {
        match interface {
            ADAPTER_INTERFACE => self.adapter_added(path, props),
            DEVICE_INTERFACE => self.device_added(path, props),
            DEVICE_SET_INTERFACE => self.set_added(path, props),
            MEDIA_ENDPOINT_INTERFACE => self.remote_endpoint_added(path, props),
            MEDIA_TRANSPORT_INTERFACE => self.transport_object_added(path, props),
            _ => {}
        }
    }

    fn interfaces_removed(&mut self, path: &ObjectPath, interfaces: &[&str]) {
        // Children before parents
        for interface in [
            MEDIA_TRANSPORT_INTERFACE,
            MEDIA_ENDPOINT_INTERFACE,
            DEVICE_SET_INTERFACE,
            DEVICE_INTERFACE,
            ADAPTER_INTERFACE,
        ] {
            if !interfaces.contains(&interface) {
                continue;
            }
            match interface {
                MEDIA_TRANSPORT_INTERFACE => {
                    if let Some(id) = self.reg.transports.id(path) {
                        self.transport_free(id);
                    }
                }
                MEDIA_ENDPOINT_INTERFACE => self.remote_endpoint_removed(path),
                DEVICE_SET_INTERFACE => self.set_removed(path),
                DEVICE_INTERFACE => {
                    if let Some(id) = self.reg.devices.id(path) {
                        self.device_free(id);
                    }
                }
                ADAPTER_INTERFACE => self.adapter_removed(path),
                _ => {}
            }
        }
    }

    fn properties_changed(&mut self, path: &ObjectPath, interface: &str, changed: &PropertyMap) {
        match interface {
            ADAPTER_INTERFACE => self.adapter_update(path, changed),
            DEVICE_INTERFACE => self.device_update(path, changed),
            DEVICE_SET_INTERFACE => self.set_update(path, changed),
            MEDIA_ENDPOINT_INTERFACE => self.remote_endpoint_update(path, changed),
            MEDIA_TRANSPORT_INTERFACE => self.transport_update(path, changed),
            _ => {}
        }
    }

    /// Drop every object; pending calls die with their owners
    fn clear_all(&mut self) {
        self.objects_call = None;
        for id in self.reg.devices.ids() {
            self.device_free(id);
        }
        for id in self.reg.transports.ids() {
            self.transport_free(id);
        }
        for id in self.reg.endpoints.ids() {
            self.reg.endpoints.remove(id);
        }
        self.reg.sets.clear();
        for id in self.reg.adapters.ids() {
            self.reg.adapters.remove(id);
        }
        self.summaries.clear();
    }

    fn emit(&self, notification: Notification) {
        debug!("notify {notification:?}");
        let _ = self.notify.send(notification);
    }
}

/// Cloneable client of a running [`Monitor`]
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Event>,
    notify: broadcast::Sender<Notification>,
    summaries: Arc<DashMap<ObjectPath, TransportSummary>>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    /// Feed a signal received from the service
    pub fn deliver(&self, signal: BusSignal) -> Result<()> {
        self.tx.send(Event::Signal(signal)).map_err(|_| Error::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply)))
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Switch `device` to the first codec of `codecs` it can use
    pub async fn ensure_media_codec(&self, device: &ObjectPath, codecs: &[&str]) -> Result<()> {
        let device = device.clone();
        let codecs = codecs.iter().map(|c| c.to_string()).collect();
        self.request(|reply| Command::EnsureCodec { device, codecs, reply })
            .await?
            .map_err(Error::from)
    }

    /// Take a reference on a transport, acquiring it when unused
    pub async fn acquire(&self, transport: &ObjectPath, optional: bool) -> Result<()> {
        let transport = transport.clone();
        self.request(|reply| Command::Acquire {
            transport,
            optional,
            reply,
        })
        .await?
    }

    pub async fn release(&self, transport: &ObjectPath) -> Result<()> {
        let transport = transport.clone();
        self.request(|reply| Command::Release { transport, reply }).await?
    }

    pub async fn set_keepalive(&self, transport: &ObjectPath, keepalive: bool) -> Result<()> {
        let transport = transport.clone();
        self.request(|reply| Command::Keepalive {
            transport,
            keepalive,
            reply,
        })
        .await?
    }

    /// Socket and MTUs of an acquired transport
    pub async fn transport_socket(&self, transport: &ObjectPath) -> Result<Option<TransportIo>> {
        let transport = transport.clone();
        self.request(|reply| Command::TransportSocket { transport, reply }).await
    }

    /// `MediaEndpoint.SetConfiguration` called on one of our endpoints
    pub async fn set_configuration(
        &self,
        endpoint: &ObjectPath,
        transport: &ObjectPath,
        properties: PropertyMap,
    ) -> Result<()> {
        let (endpoint, transport) = (endpoint.clone(), transport.clone());
        self.request(|reply| Command::SetConfiguration {
            endpoint,
            transport,
            properties,
            reply,
        })
        .await?
    }

    /// `MediaEndpoint.SelectConfiguration`
    pub async fn select_configuration(&self, endpoint: &ObjectPath, capabilities: Vec<u8>) -> Result<Vec<u8>> {
        let endpoint = endpoint.clone();
        self.request(|reply| Command::SelectConfiguration {
            endpoint,
            capabilities,
            reply,
        })
        .await?
    }

    /// `MediaEndpoint.SelectProperties`
    pub async fn select_properties(
        &self,
        endpoint: &ObjectPath,
        properties: PropertyMap,
    ) -> Result<(Vec<u8>, PropertyMap)> {
        let endpoint = endpoint.clone();
        self.request(|reply| Command::SelectProperties {
            endpoint,
            properties,
            reply,
        })
        .await?
    }

    /// `MediaEndpoint.ClearConfiguration`
    pub async fn clear_configuration(&self, endpoint: &ObjectPath, transport: &ObjectPath) -> Result<()> {
        let (endpoint, transport) = (endpoint.clone(), transport.clone());
        self.request(|reply| Command::ClearConfiguration {
            endpoint,
            transport,
            reply,
        })
        .await?
    }

    /// A profile connected outside of media endpoints, e.g. HFP
    pub async fn add_profile(&self, device: &ObjectPath, profile: Profiles) -> Result<()> {
        let device = device.clone();
        self.request(|reply| Command::AddProfile { device, profile, reply }).await?
    }

    pub async fn report_battery(&self, device: &ObjectPath, percent: u8) -> Result<()> {
        let device = device.clone();
        self.request(|reply| Command::ReportBattery { device, percent, reply }).await?
    }

    /// Endpoints to expose below [`APPLICATION_ROOT`]
    pub async fn application_objects(&self) -> Result<Vec<LocalEndpoint>> {
        self.request(|reply| Command::ApplicationObjects { reply }).await
    }

    /// Link an acquired LE Audio transport into its ISO group
    pub async fn ensure_iso_io(&self, transport: &ObjectPath, pull: Option<PullFn>) -> Result<StreamId> {
        let transport = transport.clone();
        self.request(|reply| Command::EnsureIsoIo { transport, pull, reply }).await?
    }

    /// Last published state of a transport
    pub fn transport_summary(&self, transport: &ObjectPath) -> Option<TransportSummary> {
        self.summaries.get(transport).map(|s| s.value().clone())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Command(Command::Shutdown));
    }
}

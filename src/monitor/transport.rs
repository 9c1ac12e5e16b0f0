//! Transport lifecycle
//!
//! A transport is one negotiated audio path. Users take references with
//! [`Monitor::acquire`] and drop them with [`Monitor::release`]; only the
//! first acquire and the last release reach the service.
//!
//! ```text
//!            acquire ok                 release (LE, active)
//!   IDLE ──────────────> ACTIVE ──────────────────────> 1 s timer ──> IDLE
//!    ^   acquire failed                                     │
//!    └── ERROR <────────── (error count, circuit breaker)   └─ acquire again cancels
//! ```

use std::net::Shutdown;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use socket2::Socket;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::pending::{take_matching, PendingCall};
use super::registry::{DeviceId, Keyed, TransportId};
use super::{Completion, Monitor, Notification};
use crate::bus::props::{get_path, get_str, get_str_list, get_u16, get_u8};
use crate::bus::{AcquiredSocket, BusError, BusErrorKind, ObjectPath, PropertyMap};
use crate::codec::MediaCodec;
use crate::error::{Error, Result, TransportError};
use crate::iso::{GroupKey, IsoSocket, IsoStreamConfig, PullFn, StreamId};
use crate::profile::Profiles;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TransportState {
    Error,
    Idle,
    Pending,
    Active,
}

impl TransportState {
    /// State named by the service's `State` property
    fn from_bus(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "pending" | "broadcasting" => Some(Self::Pending),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

/// Socket of an acquired transport
#[derive(Debug, Clone)]
pub struct TransportIo {
    pub socket: Arc<Socket>,
    pub read_mtu: u16,
    pub write_mtu: u16,
}

/// Published view of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportSummary {
    pub device: ObjectPath,
    pub profile: Profiles,
    pub codec: &'static str,
    pub state: TransportState,
    pub acquired: bool,
    pub refcount: u32,
    pub error_count: u32,
    pub read_mtu: u16,
    pub write_mtu: u16,
    pub delay_ns: u64,
    pub volume: Option<u16>,
}

pub(crate) struct Transport {
    pub path: ObjectPath,
    pub device: DeviceId,
    pub device_path: ObjectPath,
    /// Our endpoint the transport was configured on
    pub endpoint_path: ObjectPath,
    pub remote_endpoint: Option<ObjectPath>,
    /// Remote role
    pub profile: Profiles,
    pub codec: Arc<dyn MediaCodec>,
    pub configuration: Vec<u8>,
    pub state: TransportState,
    pub io: Option<TransportIo>,
    pub refcount: u32,
    pub acquired: bool,
    pub keepalive: bool,
    acquire_call: Option<PendingCall>,
    release_timer: Option<PendingCall>,
    pub error_count: u32,
    last_error: Option<Instant>,
    pub cig: Option<u8>,
    pub cis: Option<u8>,
    pub big: Option<u8>,
    pub bis: Option<u8>,
    /// Transports sharing our socket
    pub links: Vec<ObjectPath>,
    pub bap_initiator: bool,
    /// `Delay` property, 1/10 ms
    pub delay: u16,
    pub codec_delay_ns: u64,
    pub volume: Option<u16>,
    pub iso_stream: Option<StreamId>,
}

impl Keyed for Transport {
    fn path(&self) -> &ObjectPath {
        &self.path
    }
}

/// QoS values live in a `QoS` dictionary on LE Audio transports
fn qos_u8(props: &PropertyMap, key: &str) -> Option<u8> {
    props
        .get("QoS")
        .and_then(Value::as_object)
        .and_then(|qos| get_u8(qos, key))
        .or_else(|| get_u8(props, key))
}

impl Transport {
    pub fn new(
        path: ObjectPath,
        device: DeviceId,
        device_path: ObjectPath,
        endpoint_path: ObjectPath,
        profile: Profiles,
        codec: Arc<dyn MediaCodec>,
        configuration: Vec<u8>,
    ) -> Self {
        Self {
            path,
            device,
            device_path,
            endpoint_path,
            remote_endpoint: None,
            profile,
            codec,
            configuration,
            state: TransportState::Idle,
            io: None,
            refcount: 0,
            acquired: false,
            keepalive: false,
            acquire_call: None,
            release_timer: None,
            error_count: 0,
            last_error: None,
            cig: None,
            cis: None,
            big: None,
            bis: None,
            links: Vec::new(),
            bap_initiator: false,
            delay: 0,
            codec_delay_ns: 0,
            volume: None,
            iso_stream: None,
        }
    }

    /// Apply properties; returns the state the service reported, if any
    pub fn update_props(&mut self, props: &PropertyMap) -> Option<TransportState> {
        if let Some(endpoint) = get_path(props, "Endpoint") {
            self.remote_endpoint = Some(endpoint);
        }
        if let Some(delay) = get_u16(props, "Delay") {
            self.delay = delay;
        }
        if let Some(volume) = get_u16(props, "Volume") {
            self.volume = Some(volume);
        }
        if let Some(links) = get_str_list(props, "Links") {
            self.links = links.into_iter().map(ObjectPath::from).collect();
        }
        self.cig = qos_u8(props, "CIG").or(self.cig);
        self.cis = qos_u8(props, "CIS").or(self.cis);
        self.big = qos_u8(props, "BIG").or(self.big);
        self.bis = qos_u8(props, "BIS").or(self.bis);
        get_str(props, "State").and_then(TransportState::from_bus)
    }

    pub fn is_broadcast(&self) -> bool {
        self.profile.intersects(Profiles::BAP_BROADCAST)
    }

    pub fn is_unicast_le(&self) -> bool {
        self.profile.intersects(Profiles::BAP_DUPLEX)
    }

    pub fn delay_ns(&self) -> u64 {
        u64::from(self.delay) * 100_000 + self.codec_delay_ns
    }

    fn summary(&self) -> TransportSummary {
        TransportSummary {
            device: self.device_path.clone(),
            profile: self.profile,
            codec: self.codec.name(),
            state: self.state,
            acquired: self.acquired,
            refcount: self.refcount,
            error_count: self.error_count,
            read_mtu: self.io.as_ref().map_or(0, |io| io.read_mtu),
            write_mtu: self.io.as_ref().map_or(0, |io| io.write_mtu),
            delay_ns: self.delay_ns(),
            volume: self.volume,
        }
    }
}

impl Monitor {
    pub(super) fn publish_transport(&self, id: TransportId) {
        if let Some(t) = self.reg.transports.get(id) {
            self.summaries.insert(t.path.clone(), t.summary());
        }
    }

    /// Register a transport the service configured on our endpoint
    pub(super) fn create_transport(&mut self, mut transport: Transport, props: &PropertyMap) -> TransportId {
        if let Some(existing) = self.reg.transports.id(&transport.path) {
            debug!("transport {} reconfigured", transport.path);
            self.transport_free(existing);
        }
        transport.update_props(props);
        transport.bap_initiator = transport.is_unicast_le()
            && transport
                .remote_endpoint
                .as_ref()
                .and_then(|e| self.reg.endpoints.by_path(e))
                .is_some_and(|e| e.acceptor);
        info!(
            "transport {} created, profile:{} codec:{}",
            transport.path,
            transport.profile,
            transport.codec.name()
        );
        let device = transport.device;
        let profile = transport.profile;
        let id = self.reg.transports.insert(transport);
        self.publish_transport(id);
        self.add_profile(device, profile);
        id
    }

    pub(super) fn transport_object_added(&mut self, path: &ObjectPath, props: &PropertyMap) {
        if self.reg.transports.id(path).is_some() {
            self.transport_update(path, props);
        } else {
            debug!("transport {path} not configured through our endpoints, ignoring");
        }
    }

    pub(super) fn transport_update(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let Some(id) = self.reg.transports.id(path) else {
            return;
        };
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        let reported = t.update_props(props);
        // LE Audio state follows our own acquires
        let follow = !t.is_unicast_le() && !t.is_broadcast() && t.state != TransportState::Error;
        if let Some(state) = reported.filter(|_| follow) {
            self.set_state(id, state);
        }
        self.publish_transport(id);
    }

    /// Tear a transport down, adjusting its device's profiles
    pub(super) fn transport_free(&mut self, id: TransportId) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        t.release_timer = None;
        t.acquire_call = None;
        self.set_state(id, TransportState::Idle);
        self.destroy_iso(id);

        let Some(t) = self.reg.transports.remove(id) else {
            return;
        };
        if let Some(io) = t.io.as_ref().filter(|_| t.acquired) {
            // A link still acquired keeps the shared socket open
            let linked = self.reg.transports.iter().any(|(_, other)| {
                other.acquired
                    && other
                        .io
                        .as_ref()
                        .is_some_and(|o| Arc::ptr_eq(&o.socket, &io.socket))
            });
            if !linked {
                let _ = io.socket.shutdown(Shutdown::Both);
            }
        }
        self.summaries.remove(&t.path);
        info!("transport {} freed", t.path);

        let remaining = self
            .reg
            .device_transports(t.device)
            .into_iter()
            .filter_map(|other| self.reg.transports.get(other))
            .fold(Profiles::NONE, |acc, other| acc | other.profile);
        let Some(device) = self.reg.devices.get_mut(t.device) else {
            return;
        };
        device.connected_profiles.remove(t.profile & !remaining);
        let connected = device.connected_profiles;
        let device_path = device.path.clone();

        if t.profile.intersects(Profiles::BAP_DUPLEX) {
            self.update_set_status(t.device, true);
        }
        self.emit(Notification::ProfilesChanged {
            device: device_path,
            connected,
        });
        self.check_profiles(t.device, false);
    }

    pub(super) fn set_state(&mut self, id: TransportId, state: TransportState) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        let old = t.state;
        if old == state {
            return;
        }
        t.state = state;
        debug!("transport {} state {old:?} -> {state:?}", t.path);
        let path = t.path.clone();
        let links = t.links.clone();
        let commit_release = state < TransportState::Active && t.release_timer.take().is_some();

        self.emit(Notification::TransportState {
            transport: path,
            old,
            new: state,
        });
        self.publish_transport(id);

        for link in links {
            let Some(link_id) = self.reg.transports.id(&link) else {
                continue;
            };
            let Some(lt) = self.reg.transports.get_mut(link_id) else {
                continue;
            };
            if lt.state == state || lt.state == TransportState::Error {
                continue;
            }
            let link_old = lt.state;
            lt.state = state;
            self.emit(Notification::TransportState {
                transport: link,
                old: link_old,
                new: state,
            });
            self.publish_transport(link_id);
        }

        if commit_release {
            debug!("transport {id:?}: committing pending release");
            self.do_release(id);
        }
    }

    pub(super) fn acquire_path(&mut self, path: &ObjectPath, optional: bool) -> Result<()> {
        let id = self
            .reg
            .transports
            .id(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        self.acquire(id, optional)
    }

    /// Take a reference, starting an `Acquire` when the transport is unused
    pub(crate) fn acquire(&mut self, id: TransportId, optional: bool) -> Result<()> {
        let window = self.config.timing.transport_error_window();
        let max_errors = self.config.timing.transport_error_max_retry;
        let Some(t) = self.reg.transports.get_mut(id) else {
            return Err(TransportError::NotFound(format!("{id:?}")).into());
        };

        if t.refcount > 0 {
            if t.release_timer.take().is_some() {
                debug!("transport {}: pending release cancelled", t.path);
            } else {
                t.refcount += 1;
                debug!("transport {}: incref {}", t.path, t.refcount);
            }
            self.publish_transport(id);
            return Ok(());
        }

        if t.acquired || t.acquire_call.is_some() {
            // Held for a link or a CIG peer, or kept alive
            t.refcount = 1;
            self.publish_transport(id);
            return Ok(());
        }

        let now = Instant::now();
        if t.last_error.is_some_and(|last| now > last + window) {
            t.error_count = 0;
        }
        if t.error_count >= max_errors {
            warn!("transport {}: {} recent errors, not acquiring", t.path, t.error_count);
            return Err(TransportError::TooManyErrors(t.path.to_string()).into());
        }

        let links = t.links.clone();
        for link in &links {
            let Some(lt) = self.reg.transports.by_path(link) else {
                continue;
            };
            if !(lt.acquired || lt.acquire_call.is_some()) {
                continue;
            }
            let io = lt.io.clone();
            let state = lt.state;
            if let Some(t) = self.reg.transports.get_mut(id) {
                debug!("transport {}: reusing socket of {link}", t.path);
                t.refcount = 1;
                if let Some(io) = io {
                    t.io = Some(io);
                    t.acquired = true;
                    t.state = state;
                }
            }
            self.publish_transport(id);
            return Ok(());
        }

        let cig_peers = self.cig_peers(id);
        let initiator = self.reg.transports.get(id).is_some_and(|t| t.bap_initiator);
        if initiator && !cig_peers.is_empty() {
            let cig_active = cig_peers
                .iter()
                .filter_map(|p| self.reg.transports.get(*p))
                .any(|p| p.acquired || p.acquire_call.is_some());
            if !cig_active {
                for peer in cig_peers {
                    self.issue_acquire(peer, optional);
                }
            }
        }

        self.issue_acquire(id, optional);
        if let Some(t) = self.reg.transports.get_mut(id) {
            t.refcount = 1;
        }
        self.publish_transport(id);
        Ok(())
    }

    /// Other LE Audio transports of the same CIG and adapter
    fn cig_peers(&self, id: TransportId) -> Vec<TransportId> {
        let Some(t) = self.reg.transports.get(id) else {
            return Vec::new();
        };
        let (Some(cig), true) = (t.cig, t.bap_initiator) else {
            return Vec::new();
        };
        let adapter = self.reg.devices.get(t.device).and_then(|d| d.adapter);
        self.reg
            .transports
            .iter()
            .filter(|(other_id, other)| {
                *other_id != id
                    && other.bap_initiator
                    && other.cig == Some(cig)
                    && self.reg.devices.get(other.device).and_then(|d| d.adapter) == adapter
            })
            .map(|(other_id, _)| other_id)
            .collect()
    }

    fn issue_acquire(&mut self, id: TransportId, optional: bool) {
        let Some(t) = self.reg.transports.get(id) else {
            return;
        };
        if t.acquire_call.is_some() || t.acquired {
            return;
        }
        let bus = self.bus.clone();
        let path = t.path.clone();
        info!("transport {path}: {}", if optional { "TryAcquire" } else { "Acquire" });
        let call = self.tasks.call(
            async move { bus.acquire(&path, optional).await },
            move |token, result| Completion::Acquire {
                transport: id,
                token,
                result,
            },
        );
        if let Some(t) = self.reg.transports.get_mut(id) {
            t.acquire_call = Some(call);
        }
    }

    pub(super) fn on_acquire_reply(
        &mut self,
        id: TransportId,
        token: u64,
        result: std::result::Result<AcquiredSocket, BusError>,
    ) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        if !take_matching(&mut t.acquire_call, token) {
            return;
        }

        let acquired = match result {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("transport {}: Acquire failed: {e}", t.path);
                t.error_count += 1;
                t.last_error = Some(Instant::now());
                t.refcount = 0;
                t.acquired = false;
                if e.kind == BusErrorKind::NoReply {
                    let bus = self.bus.clone();
                    let path = t.path.clone();
                    self.tasks.detach("Release", path.clone(), async move { bus.release(&path).await });
                }
                self.set_state(id, TransportState::Error);
                self.publish_transport(id);
                return;
            }
        };

        if let Err(e) = acquired.socket.set_nonblocking(true) {
            warn!("transport {}: cannot make socket non-blocking: {e}", t.path);
        }
        let io = TransportIo {
            socket: Arc::new(acquired.socket),
            read_mtu: acquired.read_mtu,
            write_mtu: acquired.write_mtu,
        };
        info!(
            "transport {} acquired, mtu read:{} write:{}",
            t.path, io.read_mtu, io.write_mtu
        );
        t.io = Some(io.clone());
        t.acquired = true;
        let recovered = t.state == TransportState::Error;
        let links = t.links.clone();
        let broadcast = t.is_broadcast();
        let le = t.is_unicast_le();
        let initiator = t.bap_initiator;

        for link in links {
            let Some(lt) = self.reg.transports.id(&link).and_then(|l| self.reg.transports.get_mut(l)) else {
                continue;
            };
            if lt.io.is_none() && lt.acquire_call.is_none() {
                lt.io = Some(io.clone());
                lt.acquired = true;
            }
        }

        if recovered {
            self.set_state(id, TransportState::Idle);
        }
        if broadcast || (le && !initiator) {
            self.set_state(id, TransportState::Active);
        } else if le {
            let mut group = self.cig_peers(id);
            group.push(id);
            let pending = group
                .iter()
                .filter_map(|g| self.reg.transports.get(*g))
                .any(|g| g.acquire_call.is_some());
            if !pending {
                for member in group {
                    if self.reg.transports.get(member).is_some_and(|m| m.io.is_some()) {
                        self.set_state(member, TransportState::Active);
                    }
                }
            }
        }
        self.publish_transport(id);
    }

    pub(super) fn release_path(&mut self, path: &ObjectPath) -> Result<()> {
        let id = self
            .reg
            .transports
            .id(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        self.release(id)
    }

    /// Drop a reference; the last one releases, possibly after a delay
    pub(crate) fn release(&mut self, id: TransportId) -> Result<()> {
        let delay = self.config.timing.transport_release();
        let Some(t) = self.reg.transports.get_mut(id) else {
            return Err(TransportError::NotFound(format!("{id:?}")).into());
        };

        if t.refcount > 1 {
            t.refcount -= 1;
            debug!("transport {}: decref {}", t.path, t.refcount);
            self.publish_transport(id);
            return Ok(());
        }
        if t.refcount == 0 || t.release_timer.is_some() {
            info!("transport {} already released", t.path);
            return Ok(());
        }

        // Avoid socket churn on quick stop/start of LE Audio streams
        if t.state >= TransportState::Active && !t.profile.intersects(Profiles::A2DP_DUPLEX) {
            debug!("transport {}: release in {delay:?}", t.path);
            t.release_timer = Some(self.tasks.timer(delay, move |token| Completion::ReleaseTimer {
                transport: id,
                token,
            }));
            return Ok(());
        }
        self.do_release(id);
        Ok(())
    }

    pub(super) fn on_release_timer(&mut self, id: TransportId, token: u64) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        if take_matching(&mut t.release_timer, token) {
            self.do_release(id);
        }
    }

    fn do_release(&mut self, id: TransportId) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        if t.refcount == 1 && !t.keepalive {
            self.release_impl(id);
        } else if t.keepalive {
            debug!("transport {}: keepalive, not releasing", t.path);
        }
        if let Some(t) = self.reg.transports.get_mut(id) {
            t.refcount = t.refcount.saturating_sub(1);
        }
        self.publish_transport(id);
    }

    fn release_impl(&mut self, id: TransportId) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        t.acquire_call = None;
        t.release_timer = None;
        let links = t.links.clone();
        self.destroy_iso(id);

        let link_held = links
            .iter()
            .filter_map(|l| self.reg.transports.by_path(l))
            .any(|l| l.acquired && l.refcount > 0);
        if link_held {
            if let Some(t) = self.reg.transports.get_mut(id) {
                debug!("transport {}: socket still used by a link", t.path);
                t.io = None;
                t.acquired = false;
            }
            return;
        }
        for link in &links {
            if let Some(lt) = self.reg.transports.id(link).and_then(|l| self.reg.transports.get_mut(l)) {
                lt.io = None;
                lt.acquired = false;
            }
        }

        let peers = self.cig_peers(id);
        if !peers.is_empty() {
            let busy = peers
                .iter()
                .filter_map(|p| self.reg.transports.get(*p))
                .any(|p| p.refcount > 0);
            if busy {
                debug!("transport {id:?}: CIG still in use, deferring release");
                return;
            }
            for peer in peers {
                if self.reg.transports.get(peer).is_some_and(|p| p.acquired) {
                    self.release_socket(peer);
                }
            }
        }
        self.release_socket(id);
    }

    /// Close our side and tell the service
    fn release_socket(&mut self, id: TransportId) {
        let Some(t) = self.reg.transports.get_mut(id) else {
            return;
        };
        if let Some(io) = t.io.take() {
            let _ = io.socket.shutdown(Shutdown::Both);
        }
        t.acquired = false;
        t.acquire_call = None;
        let path = t.path.clone();
        let bus = self.bus.clone();
        info!("transport {path}: Release");
        self.tasks.detach("Release", path.clone(), async move { bus.release(&path).await });
        self.set_state(id, TransportState::Idle);
    }

    pub(super) fn keepalive_path(&mut self, path: &ObjectPath, keepalive: bool) -> Result<()> {
        let id = self
            .reg
            .transports
            .id(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        let Some(t) = self.reg.transports.get_mut(id) else {
            return Ok(());
        };
        t.keepalive = keepalive;
        debug!("transport {path}: keepalive {keepalive}");
        if !keepalive && t.refcount == 0 && t.acquired {
            t.refcount = 1;
            return self.release(id);
        }
        Ok(())
    }

    pub(super) fn transport_io(&self, path: &ObjectPath) -> Option<TransportIo> {
        self.reg.transports.by_path(path).and_then(|t| t.io.clone())
    }

    /// Link an acquired LE Audio transport into its ISO group
    pub(super) fn ensure_iso_io(&mut self, path: &ObjectPath, pull: Option<PullFn>) -> Result<StreamId> {
        let iso = self
            .iso
            .clone()
            .ok_or_else(|| Error::Iso("no ISO data loop".into()))?;
        let rate = u64::from(self.config.default_rate.max(1));
        let id = self
            .reg
            .transports
            .id(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        let Some(t) = self.reg.transports.get_mut(id) else {
            return Err(TransportError::NotFound(path.to_string()).into());
        };

        if let Some(stream) = t.iso_stream {
            if pull.is_some() {
                iso.invoke(move |s| s.set_pull(stream, pull, std::time::Instant::now()))?;
            }
            return Ok(stream);
        }

        let io = t.io.clone().ok_or_else(|| TransportError::NotAcquired(path.to_string()))?;
        let group = match (t.cig, t.big) {
            (Some(cig), _) => GroupKey::Cig(cig),
            (None, Some(big)) => GroupKey::Big(big),
            (None, None) => return Err(Error::Iso(format!("{path} is not an ISO transport"))),
        };
        let sending = t.profile.is_sink_role();
        let session = t
            .codec
            .init(!sending, &t.configuration, usize::from(io.write_mtu))?;
        let interval = session
            .interval()
            .ok_or_else(|| Error::Iso(format!("{path}: codec has no SDU interval")))?;
        t.codec_delay_ns = u64::from(session.delay()) * 1_000_000_000 / rate;

        let socket: Arc<dyn IsoSocket> = io.socket.clone();
        let config = IsoStreamConfig {
            group,
            sink: sending,
            interval,
            socket,
            session: sending.then_some(session),
        };
        let stream = iso.invoke(move |s| s.add_stream(config, std::time::Instant::now()))??;
        if pull.is_some() {
            iso.invoke(move |s| s.set_pull(stream, pull, std::time::Instant::now()))?;
        }
        t.iso_stream = Some(stream);
        self.publish_transport(id);
        Ok(stream)
    }

    fn destroy_iso(&mut self, id: TransportId) {
        let Some(stream) = self.reg.transports.get_mut(id).and_then(|t| t.iso_stream.take()) else {
            return;
        };
        if let Some(iso) = &self.iso {
            if let Err(e) = iso.invoke(move |s| s.remove_stream(stream)) {
                warn!("removing ISO stream {stream:?} failed: {e}");
            }
        }
    }
}

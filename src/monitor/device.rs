//! Devices, profile tracking and reconnection
//!
//! ```text
//!   INIT ──profile added, incomplete──> PROFILE ──all wanted profiles──> STOP
//!    │                                    │  retry timer: ConnectProfile   ^
//!    └──retry timer / ceiling─────────────┴────────────────────────────────┘
//! ```
//!
//! Reaching STOP announces the device once; device sets then re-elect
//! their leader.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::codec_switch::CodecSwitch;
use super::pending::{take_matching, PendingCall};
use super::registry::{AdapterId, DeviceId, DeviceSet, Keyed};
use super::{Completion, Monitor, Notification};
use crate::bus::props::{get_bool, get_path, get_str, get_str_list, get_u8};
use crate::bus::{ObjectPath, PropertyMap};
use crate::error::DeviceError;
use crate::profile::{Profiles, DIRECTION_MASKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Init,
    Profile,
    Stop,
}

/// Membership of a device in a coordinated set
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SetMember {
    pub set: ObjectPath,
    pub rank: u8,
    pub leader: bool,
}

pub(crate) struct Device {
    pub path: ObjectPath,
    pub adapter_path: ObjectPath,
    pub adapter: Option<AdapterId>,
    pub address: String,
    pub name: String,
    /// Advertised profiles, in the remote role
    pub profiles: Profiles,
    pub connected_profiles: Profiles,
    pub reconnect_profiles: Profiles,
    pub paired: bool,
    pub trusted: bool,
    pub blocked: bool,
    pub connected: bool,
    pub reconnect_state: ReconnectState,
    reconnect_started: Option<Instant>,
    reconnect_timer: Option<PendingCall>,
    /// Last RPC that makes the service talk to the peer
    pub last_bluez_action: Option<Instant>,
    /// Whether a connected notification is outstanding
    pub announced: bool,
    pub sets: Vec<SetMember>,
    /// Codec switch jobs, newest last
    pub switches: Vec<CodecSwitch>,
    pub battery: Option<u8>,
}

impl Keyed for Device {
    fn path(&self) -> &ObjectPath {
        &self.path
    }
}

/// Connecting either HFP or HSP satisfies both
fn expand_headset(mut profiles: Profiles) -> Profiles {
    if profiles.intersects(Profiles::HEADSET_HEAD_UNIT) {
        profiles.insert(Profiles::HEADSET_HEAD_UNIT);
    }
    if profiles.intersects(Profiles::HEADSET_AUDIO_GATEWAY) {
        profiles.insert(Profiles::HEADSET_AUDIO_GATEWAY);
    }
    profiles
}

/// Parse the `Sets` property: `{set path: {"Rank": n}}`
fn parse_sets(value: &Value) -> Vec<SetMember> {
    let Some(map) = value.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(path, props)| SetMember {
            set: ObjectPath::from(path.as_str()),
            rank: props
                .as_object()
                .and_then(|p| get_u8(p, "Rank"))
                .unwrap_or(0),
            leader: false,
        })
        .collect()
}

impl Device {
    fn new(path: ObjectPath, adapter_path: ObjectPath, reconnect_profiles: Profiles) -> Self {
        Self {
            path,
            adapter_path,
            adapter: None,
            address: String::new(),
            name: String::new(),
            profiles: Profiles::NONE,
            connected_profiles: Profiles::NONE,
            reconnect_profiles,
            paired: false,
            trusted: false,
            blocked: false,
            connected: false,
            reconnect_state: ReconnectState::Init,
            reconnect_started: None,
            reconnect_timer: None,
            last_bluez_action: None,
            announced: false,
            sets: Vec::new(),
            switches: Vec::new(),
            battery: None,
        }
    }

    /// Apply properties; returns true when the set membership changed
    fn update_props(&mut self, props: &PropertyMap) -> bool {
        if let Some(address) = get_str(props, "Address") {
            self.address = address.to_string();
        }
        if let Some(name) = get_str(props, "Alias").or_else(|| get_str(props, "Name")) {
            self.name = name.to_string();
        }
        if let Some(uuids) = get_str_list(props, "UUIDs") {
            self.profiles = Profiles::from_uuid_strs(uuids);
        }
        if let Some(paired) = get_bool(props, "Paired") {
            self.paired = paired;
        }
        if let Some(trusted) = get_bool(props, "Trusted") {
            self.trusted = trusted;
        }
        if let Some(blocked) = get_bool(props, "Blocked") {
            self.blocked = blocked;
        }
        let Some(sets) = props.get("Sets") else {
            return false;
        };
        let mut sets = parse_sets(sets);
        for member in &mut sets {
            member.leader = self.sets.iter().any(|m| m.set == member.set && m.leader);
        }
        let changed = sets != self.sets;
        self.sets = sets;
        changed
    }

    pub fn has_switch(&self) -> bool {
        !self.switches.is_empty()
    }
}

impl Monitor {
    pub(super) fn device_added(&mut self, path: &ObjectPath, props: &PropertyMap) {
        if self.reg.devices.id(path).is_some() {
            self.device_update(path, props);
            return;
        }
        let Some(adapter_path) = get_path(props, "Adapter") else {
            warn!("device {path} has no adapter, ignoring");
            return;
        };
        let mut device = Device::new(path.clone(), adapter_path.clone(), self.reconnect_mask);
        device.adapter = self.reg.adapters.id(&adapter_path);
        device.update_props(props);
        let connected = get_bool(props, "Connected").unwrap_or(false);
        info!(
            "device {path} added, address:{} profiles:{}",
            device.address, device.profiles
        );
        let id = self.reg.devices.insert(device);

        for (_, endpoint) in self.reg.endpoints.iter_mut() {
            if endpoint.device.is_none() && endpoint.device_path.as_ref() == Some(path) {
                endpoint.device = Some(id);
            }
        }

        // Sets reported before this device
        let sets: Vec<ObjectPath> = self
            .reg
            .sets
            .values()
            .filter(|s| s.members.contains(path))
            .map(|s| s.path.clone())
            .collect();
        for set in sets {
            self.add_set_membership(id, &set);
        }

        self.emit(Notification::DeviceAdded(path.clone()));
        if connected {
            self.on_connected_changed(id, true);
        }
    }

    pub(super) fn device_update(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let Some(id) = self.reg.devices.id(path) else {
            return;
        };
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        let old_profiles = device.profiles;
        let sets_changed = device.update_props(props);
        let profiles_changed = device.profiles != old_profiles;
        let has_connected = !device.connected_profiles.is_empty();
        let connected = get_bool(props, "Connected").filter(|c| *c != device.connected);

        if sets_changed {
            self.update_set_status(id, false);
        }
        if let Some(connected) = connected {
            self.on_connected_changed(id, connected);
        } else if profiles_changed && has_connected {
            self.check_profiles(id, false);
        }
    }

    /// Tear a device down together with everything hanging off it
    pub(super) fn device_free(&mut self, id: DeviceId) {
        self.fail_switches(id, DeviceError::Removed);
        for transport in self.reg.device_transports(id) {
            self.transport_free(transport);
        }
        for endpoint in self.reg.device_endpoints(id) {
            self.reg.endpoints.remove(endpoint);
        }
        self.remove_device_battery(id);

        let Some(device) = self.reg.devices.remove(id) else {
            return;
        };
        info!("device {} removed", device.path);
        for member in &device.sets {
            self.update_set_leader(&member.set, false);
        }
        self.emit(Notification::DeviceRemoved(device.path));
    }

    /// The ACL link came up or went down
    pub(crate) fn on_connected_changed(&mut self, id: DeviceId, connected: bool) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        device.connected = connected;
        device.reconnect_state = ReconnectState::Init;
        debug!("device {} connected:{connected}", device.path);

        if connected {
            device.reconnect_started = None;
            self.start_reconnect_timer(id);
            return;
        }

        device.connected_profiles = Profiles::NONE;
        device.reconnect_timer = None;
        device.reconnect_started = None;
        let path = device.path.clone();
        self.fail_switches(id, DeviceError::Removed);
        self.device_connected(id, false);
        self.update_set_status(id, false);
        self.emit(Notification::ProfilesChanged {
            device: path,
            connected: Profiles::NONE,
        });
    }

    /// A profile of `id` connected
    pub(crate) fn add_profile(&mut self, id: DeviceId, profile: Profiles) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        device.connected_profiles |= profile;
        let connected = device.connected_profiles;
        let path = device.path.clone();
        debug!("device {path} profile {profile} connected, now {connected}");

        if profile.intersects(Profiles::BAP_AUDIO) {
            self.update_set_status(id, true);
        }
        self.check_profiles(id, false);
        self.emit(Notification::ProfilesChanged {
            device: path,
            connected,
        });
    }

    /// Profiles of `device` the local side can serve
    pub(super) fn connectable_profiles(&self, device: &Device) -> Profiles {
        let Some(adapter) = device.adapter.and_then(|a| self.reg.adapters.get(a)) else {
            return Profiles::NONE;
        };
        device.profiles & self.adapter_local_roles(adapter).swapped()
    }

    /// Decide whether the device is settled
    pub(crate) fn check_profiles(&mut self, id: DeviceId, force: bool) {
        let Some(device) = self.reg.devices.get(id) else {
            return;
        };
        if device.has_switch() {
            debug!("device {}: codec switch in progress, not checking", device.path);
            return;
        }

        let connectable = self.connectable_profiles(device);
        let connected = expand_headset(device.connected_profiles);
        let direction_connected = DIRECTION_MASKS.iter().any(|mask| {
            let wanted = connectable & *mask;
            !wanted.is_empty() && connected.contains(wanted)
        });
        let all_connected = connected.contains(connectable);
        let set_connected = device.sets.iter().all(|m| {
            self.reg.set_members(&m.set).into_iter().all(|member| {
                self.reg
                    .devices
                    .get(member)
                    .is_some_and(|d| d.connected_profiles.intersects(Profiles::BAP_DUPLEX))
            })
        });
        debug!(
            "device {}: connectable:{connectable} connected:{connected} direction:{direction_connected} all:{all_connected} set:{set_connected}",
            device.path
        );

        if device.connected_profiles.is_empty() {
            if let Some(device) = self.reg.devices.get_mut(id) {
                device.reconnect_timer = None;
                device.reconnect_started = None;
            }
            self.device_connected(id, false);
        } else if force || ((direction_connected || all_connected) && set_connected) {
            self.stop_reconnect(id);
        } else {
            if let Some(device) = self.reg.devices.get_mut(id) {
                if device.reconnect_state == ReconnectState::Init {
                    device.reconnect_state = ReconnectState::Profile;
                }
                debug!("device {} waiting for profiles", device.path);
            }
            self.start_reconnect_timer(id);
        }
    }

    /// Settle the device, announcing it when anything is connected
    fn stop_reconnect(&mut self, id: DeviceId) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        device.reconnect_timer = None;
        device.reconnect_started = None;
        if device.reconnect_state != ReconnectState::Stop {
            debug!("device {} reconnect stopped", device.path);
            device.reconnect_state = ReconnectState::Stop;
        }
        let connected = !device.connected_profiles.is_empty();
        self.device_connected(id, connected);
    }

    fn start_reconnect_timer(&mut self, id: DeviceId) {
        let timing = &self.config.timing;
        let (retry, ceiling) = (timing.reconnect_retry(), timing.profile_timeout());
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        let now = Instant::now();
        let started = *device.reconnect_started.get_or_insert(now);
        let left = (started + ceiling).saturating_duration_since(now);
        // A settled device only waits out the profile timeout
        let delay = if device.reconnect_state == ReconnectState::Stop {
            ceiling
        } else {
            retry.min(left).max(Duration::from_millis(1))
        };
        device.reconnect_timer = Some(self.tasks.timer(delay, move |token| Completion::ReconnectTimer {
            device: id,
            token,
        }));
    }

    pub(super) fn on_reconnect_timer(&mut self, id: DeviceId, token: u64) {
        let ceiling = self.config.timing.profile_timeout();
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        if !take_matching(&mut device.reconnect_timer, token) {
            return;
        }
        if device.reconnect_state == ReconnectState::Stop {
            self.stop_reconnect(id);
            return;
        }
        let expired = device
            .reconnect_started
            .is_some_and(|started| Instant::now() >= started + ceiling);
        if expired {
            warn!(
                "device {}: profiles {} did not all connect in time",
                device.path, device.connected_profiles
            );
            self.stop_reconnect(id);
            return;
        }

        let wants_reconnect =
            device.paired && device.trusted && !device.blocked && !device.reconnect_profiles.is_empty();
        if wants_reconnect && self.reconnect_device_profiles(id) > 0 {
            self.start_reconnect_timer(id);
        } else {
            self.stop_reconnect(id);
        }
    }

    /// Issue `ConnectProfile` for missing profiles; returns how many
    fn reconnect_device_profiles(&mut self, id: DeviceId) -> usize {
        let Some(device) = self.reg.devices.get(id) else {
            return 0;
        };
        let connected = expand_headset(device.connected_profiles);
        let mut mask = device.profiles & device.reconnect_profiles & !connected;
        if mask.is_empty() {
            return 0;
        }

        // Same peer through another adapter
        for (_, other) in self.reg.devices.iter().filter(|(other_id, other)| {
            *other_id != id && other.address == device.address
        }) {
            if other.paired && other.trusted && !other.blocked && other.reconnect_state == ReconnectState::Stop {
                mask.remove(other.reconnect_profiles);
            }
            if !other.connected_profiles.is_empty() {
                debug!("device {}: connected through {}", device.path, other.path);
                mask = Profiles::NONE;
            }
        }

        mask &= self.connectable_profiles(device);
        if mask.contains(Profiles::HFP_HF) {
            mask.remove(Profiles::HSP_HS);
        }
        if mask.contains(Profiles::HFP_AG) {
            mask.remove(Profiles::HSP_AG);
        }

        let path = device.path.clone();
        let mut issued = 0;
        for profile in mask.iter() {
            let Some(uuid) = profile.uuid() else {
                continue;
            };
            info!("device {path}: connecting {profile}");
            let bus = self.bus.clone();
            let device_path = path.clone();
            self.tasks.detach("ConnectProfile", path.clone(), async move {
                bus.connect_profile(&device_path, uuid).await
            });
            issued += 1;
        }
        if issued > 0 {
            if let Some(device) = self.reg.devices.get_mut(id) {
                device.last_bluez_action = Some(Instant::now());
            }
        }
        issued
    }

    fn device_connected(&mut self, id: DeviceId, connected: bool) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        if device.announced == connected {
            return;
        }
        device.announced = connected;
        let path = device.path.clone();
        info!("device {path} {}", if connected { "connected" } else { "disconnected" });
        if connected {
            self.emit(Notification::DeviceConnected(path));
            self.update_set_status(id, false);
        } else {
            self.emit(Notification::DeviceDisconnected(path));
        }
    }

    pub(super) fn set_added(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let set = DeviceSet {
            path: path.clone(),
            adapter: get_path(props, "Adapter"),
            members: Vec::new(),
        };
        self.reg.sets.entry(path.clone()).or_insert(set);
        self.set_update(path, props);
    }

    pub(super) fn set_update(&mut self, path: &ObjectPath, props: &PropertyMap) {
        let Some(members) = get_str_list(props, "Devices") else {
            return;
        };
        let members: Vec<ObjectPath> = members.into_iter().map(ObjectPath::from).collect();
        let Some(set) = self.reg.sets.get_mut(path) else {
            return;
        };
        set.members = members.clone();
        debug!("device set {path}: {} members", members.len());
        for member in &members {
            if let Some(id) = self.reg.devices.id(member) {
                self.add_set_membership(id, path);
            }
        }
        self.update_set_leader(path, false);
    }

    pub(super) fn set_removed(&mut self, path: &ObjectPath) {
        if self.reg.sets.remove(path).is_none() {
            return;
        }
        for (_, device) in self.reg.devices.iter_mut() {
            device.sets.retain(|m| m.set != *path);
        }
        debug!("device set {path} removed");
    }

    fn add_set_membership(&mut self, id: DeviceId, set: &ObjectPath) {
        if let Some(device) = self.reg.devices.get_mut(id) {
            if !device.sets.iter().any(|m| m.set == *set) {
                device.sets.push(SetMember {
                    set: set.clone(),
                    rank: 0,
                    leader: false,
                });
            }
        }
    }

    /// Re-elect the leader of every set `id` belongs to
    pub(super) fn update_set_status(&mut self, id: DeviceId, force: bool) {
        let Some(device) = self.reg.devices.get(id) else {
            return;
        };
        let sets: Vec<ObjectPath> = device.sets.iter().map(|m| m.set.clone()).collect();
        for set in sets {
            self.update_set_leader(&set, force);
        }
    }

    /// Lowest-rank member with LE Audio connected leads; ties keep the
    /// current leader
    fn update_set_leader(&mut self, set: &ObjectPath, force: bool) {
        let members = self.reg.set_members(set);
        let leader = members
            .iter()
            .filter_map(|id| {
                let device = self.reg.devices.get(*id)?;
                if !device.connected_profiles.intersects(Profiles::BAP_DUPLEX) {
                    return None;
                }
                let member = device.sets.iter().find(|m| m.set == *set)?;
                Some((*id, member.rank, !member.leader))
            })
            .min_by_key(|(_, rank, not_leader)| (*rank, *not_leader))
            .map(|(id, _, _)| id);

        let mut changed = false;
        for id in &members {
            let Some(member) = self
                .reg
                .devices
                .get_mut(*id)
                .and_then(|d| d.sets.iter_mut().find(|m| m.set == *set))
            else {
                continue;
            };
            let is_leader = Some(*id) == leader;
            if member.leader != is_leader {
                member.leader = is_leader;
                changed = true;
            }
        }
        if !changed && !force {
            return;
        }

        let mut ordered: Vec<DeviceId> = members.iter().copied().filter(|id| Some(*id) != leader).collect();
        ordered.extend(leader);
        for id in ordered {
            if let Some(device) = self.reg.devices.get(id) {
                self.emit(Notification::SetLeader {
                    set: set.clone(),
                    device: device.path.clone(),
                    leader: Some(id) == leader,
                });
            }
        }
    }
}

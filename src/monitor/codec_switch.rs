//! Codec switching
//!
//! A switch job walks (codec, remote endpoint) candidates in order and asks
//! the service to configure the first one that fits:
//!
//! ```text
//!   for codec in codecs:                  (preference order of the caller)
//!     for endpoint in endpoints:          (sorted by caps quality, if any)
//!       check ids / role / exclusivity / caps -> select_config
//!       wait for the per-device rate limit
//!       SetConfiguration -> ok: done (0), error: retry once, then next
//!   exhausted: -ENODEV
//! ```
//!
//! Only the newest job of a device runs. An in-flight `SetConfiguration`
//! cannot be cancelled, so a newer job waits for it; the stale reply is then
//! discarded and the newest job resumes.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::endpoint::{local_role, RemoteEndpoint};
use super::pending::{take_matching, PendingCall};
use super::registry::DeviceId;
use super::{Completion, Monitor, Notification};
use crate::bus::props::bytes_value;
use crate::bus::{BusError, ObjectPath, PropertyMap};
use crate::codec::{AudioInfo, CodecKind, CodecRegistry, MediaCodec};
use crate::error::DeviceError;
use crate::profile::Profiles;

type SwitchReply = oneshot::Sender<Result<(), DeviceError>>;

const MEDIA_PROFILES: Profiles = Profiles::from_bits_truncate(Profiles::MEDIA_SINK.bits() | Profiles::MEDIA_SOURCE.bits());

pub(crate) struct CodecSwitch {
    pub id: u64,
    codecs: Vec<Arc<dyn MediaCodec>>,
    paths: Vec<ObjectPath>,
    codec_idx: usize,
    path_idx: usize,
    /// Codec index the paths were last sorted for
    sorted_for: Option<usize>,
    retries: u32,
    /// Remote roles the job may configure
    profiles: Profiles,
    call: Option<PendingCall>,
    timer: Option<PendingCall>,
    reply: Option<SwitchReply>,
}

impl CodecSwitch {
    fn is_busy(&self) -> bool {
        self.call.is_some() || self.timer.is_some()
    }

    fn advance(&mut self) {
        self.retries = 0;
        self.path_idx += 1;
        if self.path_idx >= self.paths.len() {
            self.path_idx = 0;
            self.codec_idx += 1;
        }
    }

    fn finish(&mut self, result: Result<(), DeviceError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Whether `endpoint` advertises `codec` for one of `profiles`
fn endpoint_supports(codec: &dyn MediaCodec, endpoint: &RemoteEndpoint, profiles: Profiles, info: &AudioInfo) -> bool {
    if endpoint.codec_id != codec.codec_id() {
        return false;
    }
    if codec.codec_id() == 0xff && endpoint.vendor != codec.vendor() {
        return false;
    }
    if !endpoint.profile.intersects(codec.kind().target_profiles() & profiles) {
        return false;
    }
    codec.check_caps(&endpoint.capabilities, info)
}

impl Monitor {
    /// Make sure the device ends up with a transport for one of `names`
    pub(super) fn ensure_media_codec(&mut self, path: &ObjectPath, names: &[&str], reply: SwitchReply) {
        let Some(id) = self.reg.devices.id(path) else {
            let _ = reply.send(Err(DeviceError::NotFound(path.to_string())));
            return;
        };
        let Some(device) = self.reg.devices.get(id) else {
            return;
        };
        let registered = device
            .adapter
            .and_then(|a| self.reg.adapters.get(a))
            .is_some_and(|a| a.application_registered);
        if !registered {
            debug!("device {path}: no media application registered, cannot switch codecs");
            let _ = reply.send(Err(DeviceError::SwitchNotSupported));
            return;
        }

        let codecs: Vec<Arc<dyn MediaCodec>> = self
            .codecs
            .resolve(names)
            .into_iter()
            .filter(|c| matches!(c.kind(), CodecKind::A2dp | CodecKind::Bap))
            .collect();
        let mut profiles = device.connected_profiles & MEDIA_PROFILES;
        if profiles.is_empty() {
            profiles = self.connectable_profiles(device) & MEDIA_PROFILES;
        }
        let endpoints = self.reg.device_endpoints(id);
        let info = self.codecs.audio_info();
        let preferred = codecs.iter().find(|&codec| {
            endpoints
                .iter()
                .filter_map(|e| self.reg.endpoints.get(*e))
                .any(|e| endpoint_supports(codec.as_ref(), e, profiles, info))
        });
        let Some(preferred) = preferred else {
            info!("device {path}: none of {names:?} supported");
            let _ = reply.send(Err(DeviceError::NoCodec));
            return;
        };

        if !device.has_switch() {
            let kind_profiles = preferred.kind().target_profiles();
            let transports: Vec<_> = self
                .reg
                .device_transports(id)
                .into_iter()
                .filter_map(|t| self.reg.transports.get(t))
                .filter(|t| t.profile.intersects(kind_profiles))
                .collect();
            if !transports.is_empty() && transports.iter().all(|t| t.codec.name() == preferred.name()) {
                debug!("device {path}: already using {}", preferred.name());
                let _ = reply.send(Ok(()));
                self.emit(Notification::CodecSwitched {
                    device: path.clone(),
                    status: 0,
                });
                return;
            }
        }

        let paths: Vec<ObjectPath> = endpoints
            .iter()
            .filter_map(|e| self.reg.endpoints.get(*e))
            .map(|e| e.path.clone())
            .collect();
        let job_id = self.next_switch_id;
        self.next_switch_id += 1;
        info!(
            "device {path}: codec switch {job_id} to {:?} over {} endpoints",
            codecs.iter().map(|c| c.name()).collect::<Vec<_>>(),
            paths.len()
        );
        let job = CodecSwitch {
            id: job_id,
            codecs,
            paths,
            codec_idx: 0,
            path_idx: 0,
            sorted_for: None,
            retries: 0,
            profiles,
            call: None,
            timer: None,
            reply: Some(reply),
        };
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        device.switches.push(job);
        if device.switches.iter().any(|j| j.call.is_some()) {
            debug!("device {path}: waiting for the running switch to reply");
            return;
        }
        self.supersede_switches(id);
        self.process_switch(id);
    }

    /// Free every job but the newest
    fn supersede_switches(&mut self, id: DeviceId) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        let stale = device.switches.len().saturating_sub(1);
        for mut job in device.switches.drain(..stale) {
            debug!("device {}: codec switch {} superseded", device.path, job.id);
            job.finish(Err(DeviceError::Superseded));
        }
    }

    /// Reply to and drop every job of the device, without notifying
    pub(super) fn fail_switches(&mut self, id: DeviceId, error: DeviceError) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        for mut job in device.switches.drain(..) {
            job.finish(Err(error.clone()));
        }
    }

    fn newest_switch(&mut self, id: DeviceId) -> Option<&mut CodecSwitch> {
        self.reg.devices.get_mut(id).and_then(|d| d.switches.last_mut())
    }

    fn process_switch(&mut self, id: DeviceId) {
        while self.switch_step(id) {}
    }

    /// One candidate of the newest job; false once the job waits or ended
    fn switch_step(&mut self, id: DeviceId) -> bool {
        let Some(device) = self.reg.devices.get(id) else {
            return false;
        };
        let Some(job) = device.switches.last() else {
            return false;
        };
        if job.is_busy() {
            return false;
        }
        let Some(codec) = job.codecs.get(job.codec_idx).cloned() else {
            warn!("device {}: codec switch {} found no usable endpoint", device.path, job.id);
            self.finish_switch(id, Err(DeviceError::NoEndpoint));
            return false;
        };

        if codec.has_caps_preference() && job.sorted_for != Some(job.codec_idx) {
            let mut paths = job.paths.clone();
            let info = *self.codecs.audio_info();
            paths.sort_by(|a, b| self.compare_endpoints(codec.as_ref(), a, b, &info));
            if let Some(job) = self.newest_switch(id) {
                job.paths = paths;
                job.sorted_for = Some(job.codec_idx);
            }
            return true;
        }

        let Some(path) = job.paths.get(job.path_idx).cloned() else {
            if let Some(job) = self.newest_switch(id) {
                job.advance();
            }
            return true;
        };
        let (job_id, profiles) = (job.id, job.profiles);
        let last_action = device.last_bluez_action;

        let Some((local, config)) = self.switch_candidate(id, codec.as_ref(), &path, profiles) else {
            if let Some(job) = self.newest_switch(id) {
                job.advance();
            }
            return true;
        };

        let now = Instant::now();
        let ready = last_action.map_or(now, |last| last + self.config.timing.bluez_action_rate());
        if now < ready {
            let delay = ready - now;
            debug!("codec switch {job_id}: rate limited, retrying in {delay:?}");
            let timer = self.tasks.timer(delay, move |token| Completion::SwitchTimer {
                device: id,
                job: job_id,
                token,
            });
            if let Some(job) = self.newest_switch(id) {
                job.timer = Some(timer);
            }
            return false;
        }

        info!(
            "codec switch {job_id}: set codec {} on {path}, local endpoint {local}",
            codec.name()
        );
        let bus = self.bus.clone();
        let mut props = PropertyMap::new();
        props.insert("Capabilities".into(), bytes_value(&config));
        let call = self.tasks.call(
            async move { bus.set_configuration(&path, &local, props).await },
            move |token, result| Completion::SwitchReply {
                device: id,
                job: job_id,
                token,
                result,
            },
        );
        if let Some(device) = self.reg.devices.get_mut(id) {
            device.last_bluez_action = Some(now);
            if let Some(job) = device.switches.last_mut() {
                job.call = Some(call);
            }
        }
        false
    }

    /// Local endpoint and configuration for one candidate, if it is usable
    fn switch_candidate(
        &self,
        id: DeviceId,
        codec: &dyn MediaCodec,
        path: &ObjectPath,
        profiles: Profiles,
    ) -> Option<(ObjectPath, Vec<u8>)> {
        let endpoint = self.reg.endpoints.by_path(path)?;
        let info = self.codecs.audio_info();
        if endpoint.device != Some(id) || !endpoint_supports(codec, endpoint, profiles, info) {
            return None;
        }
        let sink = endpoint.profile.intersects(Profiles::MEDIA_SOURCE);
        if !self.enabled.contains(local_role(codec.kind(), sink)) {
            return None;
        }
        let local = CodecRegistry::endpoint_path(codec, sink);

        // One device per local endpoint and adapter
        let adapter = self.reg.devices.get(id)?.adapter;
        let in_use = self.reg.transports.iter().any(|(_, t)| {
            t.device != id
                && t.endpoint_path == local
                && self.reg.devices.get(t.device).and_then(|d| d.adapter) == adapter
        });
        if in_use {
            warn!("endpoint {local} in use by another device");
            return None;
        }

        match codec.select_config(sink, &endpoint.capabilities, info) {
            Ok(config) => Some((local, config)),
            Err(e) => {
                debug!("endpoint {path}: {e}");
                None
            }
        }
    }

    fn compare_endpoints(&self, codec: &dyn MediaCodec, a: &ObjectPath, b: &ObjectPath, info: &AudioInfo) -> Ordering {
        let usable = |path: &ObjectPath| {
            self.reg
                .endpoints
                .by_path(path)
                .filter(|e| e.codec_id == codec.codec_id() && !e.uuid.is_empty())
        };
        match (usable(a), usable(b)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(ea), Some(eb)) => ea.uuid.cmp(&eb.uuid).then_with(|| {
                let sink = ea.profile.intersects(Profiles::MEDIA_SOURCE);
                codec.caps_preference_cmp(sink, &ea.capabilities, &eb.capabilities, info)
            }),
        }
    }

    /// End the newest job, reporting `result`
    fn finish_switch(&mut self, id: DeviceId, result: Result<(), DeviceError>) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        let Some(mut job) = device.switches.pop() else {
            return;
        };
        let status = match &result {
            Ok(()) => 0,
            Err(e) => e.status(),
        };
        info!("device {}: codec switch {} finished, status {status}", device.path, job.id);
        let path = device.path.clone();
        job.finish(result);
        self.emit(Notification::CodecSwitched { device: path, status });
        self.check_profiles(id, false);
    }

    pub(super) fn on_switch_timer(&mut self, id: DeviceId, job_id: u64, token: u64) {
        let Some(job) = self.newest_switch(id).filter(|j| j.id == job_id) else {
            return;
        };
        if take_matching(&mut job.timer, token) {
            self.process_switch(id);
        }
    }

    pub(super) fn on_switch_reply(
        &mut self,
        id: DeviceId,
        job_id: u64,
        token: u64,
        result: std::result::Result<(), BusError>,
    ) {
        let Some(device) = self.reg.devices.get_mut(id) else {
            return;
        };
        let Some(pos) = device.switches.iter().position(|j| j.id == job_id) else {
            return;
        };
        if !take_matching(&mut device.switches[pos].call, token) {
            return;
        }
        device.last_bluez_action = Some(Instant::now());

        if pos + 1 != device.switches.len() {
            debug!("device {}: reply for superseded codec switch {job_id} discarded", device.path);
            self.supersede_switches(id);
            self.process_switch(id);
            return;
        }

        match result {
            Ok(()) => self.finish_switch(id, Ok(())),
            Err(e) => {
                warn!("codec switch {job_id}: SetConfiguration failed: {e}");
                if let Some(job) = self.newest_switch(id) {
                    job.retries += 1;
                    if job.retries > 1 {
                        job.advance();
                    }
                }
                self.process_switch(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::super::fixtures::*;
    use super::*;
    use crate::bus::BusErrorKind;
    use crate::codec::testing::TestCodec;
    use crate::config::BackendConfig;

    const SEP_SBC: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55/sep1";
    const SEP_AAC: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55/sep2";

    async fn sink_device(fx: &mut Fixture, endpoints: Vec<(ObjectPath, crate::bus::InterfaceMap)>) {
        let mut objects = vec![
            adapter_object("/org/bluez/hci0"),
            device_object(DEV, "/org/bluez/hci0", &[A2DP_SINK_UUID]),
        ];
        objects.extend(endpoints);
        fx.start_with(objects).await;
    }

    fn switched(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Vec<i32> {
        drain(rx)
            .into_iter()
            .filter_map(|n| match n {
                Notification::CodecSwitched { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_supported_codec() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        let mut rx = fx.handle.subscribe();

        let result = fx.ensure(DEV, &["aac", "sbc"]).await;
        assert_eq!(result, Some(Ok(())));
        let calls = fx.bus.calls_to("SetConfiguration");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path.as_str(), SEP_SBC);
        assert_eq!(calls[0].arg, "/MediaEndpoint/A2DPSource/sbc");
        assert_eq!(switched(&mut rx), vec![0]);
        assert!(!fx.device(DEV).has_switch());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_unsupported() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        assert_eq!(
            fx.ensure(DEV2, &["sbc"]).await,
            Some(Err(DeviceError::NotFound(DEV2.to_string())))
        );
        assert_eq!(fx.ensure(DEV, &["aac"]).await, Some(Err(DeviceError::NoCodec)));
        assert_eq!(fx.bus.count("SetConfiguration"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_enodev() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        let mut rx = fx.handle.subscribe();
        fx.bus.fail_next("SetConfiguration", BusErrorKind::Failed);
        fx.bus.fail_next("SetConfiguration", BusErrorKind::Failed);

        let mut reply = fx.ensure_nowait(DEV, &["sbc"]);
        fx.settle().await;
        assert_eq!(fx.bus.count("SetConfiguration"), 1);
        assert!(reply.try_recv().is_err());

        // The retry honours the rate limit
        tokio::time::advance(Duration::from_secs(3)).await;
        fx.settle().await;
        assert_eq!(fx.bus.count("SetConfiguration"), 2);
        assert_eq!(reply.try_recv().ok(), Some(Err(DeviceError::NoEndpoint)));
        assert_eq!(switched(&mut rx), vec![-19]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_supersedes() {
        let mut fx = Fixture::new();
        sink_device(
            &mut fx,
            vec![
                endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1]),
                endpoint_object(SEP_AAC, DEV, A2DP_SINK_UUID, 2, &[2, 1]),
            ],
        )
        .await;
        let mut rx = fx.handle.subscribe();

        let mut first = fx.ensure_nowait(DEV, &["sbc"]);
        let mut second = fx.ensure_nowait(DEV, &["aac"]);
        fx.settle().await;
        assert_eq!(first.try_recv().ok(), Some(Err(DeviceError::Superseded)));
        assert!(second.try_recv().is_err());
        assert_eq!(fx.bus.count("SetConfiguration"), 1);
        assert_eq!(fx.device(DEV).switches.len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        fx.settle().await;
        let calls = fx.bus.calls_to("SetConfiguration");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].path.as_str(), SEP_AAC);
        assert_eq!(second.try_recv().ok(), Some(Ok(())));
        assert_eq!(switched(&mut rx), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_transport_short_circuits() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        fx.configure(
            "/MediaEndpoint/A2DPSource/sbc",
            "/org/bluez/hci0/dev_00_11_22_33_44_55/fd0",
            json!({"Device": DEV, "Configuration": [0, 1]}),
        )
        .await;

        assert_eq!(fx.ensure(DEV, &["sbc"]).await, Some(Ok(())));
        assert_eq!(fx.ensure(DEV, &["aac", "sbc"]).await, Some(Ok(())));
        assert_eq!(fx.bus.count("SetConfiguration"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_endpoint_is_exclusive_per_adapter() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        fx.add(device_object(DEV2, "/org/bluez/hci0", &[A2DP_SINK_UUID])).await;
        fx.configure(
            "/MediaEndpoint/A2DPSource/sbc",
            "/org/bluez/hci0/dev_66_77_88_99_AA_BB/fd0",
            json!({"Device": DEV2}),
        )
        .await;

        assert_eq!(fx.ensure(DEV, &["sbc"]).await, Some(Err(DeviceError::NoEndpoint)));
        assert_eq!(fx.bus.count("SetConfiguration"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoints_sorted_by_caps_preference() {
        let codecs: Vec<Arc<dyn MediaCodec>> = vec![Arc::new(TestCodec::new("aac", 2).with_preference())];
        let mut fx = Fixture::with_codecs(BackendConfig::default(), codecs);
        sink_device(
            &mut fx,
            vec![
                endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 2, &[2, 1]),
                endpoint_object(SEP_AAC, DEV, A2DP_SINK_UUID, 2, &[2, 9]),
            ],
        )
        .await;

        assert_eq!(fx.ensure(DEV, &["aac"]).await, Some(Ok(())));
        let calls = fx.bus.calls_to("SetConfiguration");
        assert_eq!(calls[0].path.as_str(), SEP_AAC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_order_groups_by_uuid() {
        let codecs: Vec<Arc<dyn MediaCodec>> = vec![Arc::new(TestCodec::new("aac", 2).with_preference())];
        let mut fx = Fixture::with_codecs(BackendConfig::default(), codecs);
        sink_device(
            &mut fx,
            vec![
                endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 2, &[2, 9]),
                endpoint_object(SEP_AAC, DEV, A2DP_SOURCE_UUID, 2, &[2, 1]),
            ],
        )
        .await;

        let aac = fx.monitor.codecs.find("aac").unwrap();
        let info = *fx.monitor.codecs.audio_info();
        let (a, b) = (ObjectPath::from(SEP_SBC), ObjectPath::from(SEP_AAC));
        let ab = fx.monitor.compare_endpoints(aac.as_ref(), &a, &b, &info);
        let ba = fx.monitor.compare_endpoints(aac.as_ref(), &b, &a, &info);
        assert_ne!(ab, Ordering::Equal);
        assert_eq!(ab, ba.reverse());
        // a2dp source uuid (110a) sorts before sink (110b)
        assert_eq!(ab, Ordering::Greater);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_removal_fails_switch() {
        let mut fx = Fixture::new();
        sink_device(&mut fx, vec![endpoint_object(SEP_SBC, DEV, A2DP_SINK_UUID, 0, &[0, 1])]).await;
        let mut reply = fx.ensure_nowait(DEV, &["sbc"]);
        fx.remove(DEV, &[crate::bus::DEVICE_INTERFACE]).await;
        assert_eq!(reply.try_recv().ok(), Some(Err(DeviceError::Removed)));
    }
}

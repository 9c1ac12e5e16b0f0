//! ISO group scheduler
//!
//! LE Audio streams of one CIG (unicast) or BIG (broadcast) must emit
//! packets at the same instant. Each group owns one absolute periodic
//! timer; on every tick the staged packet of every sink stream is sent and
//! then each stream's pull callback stages the next one, all stamped with
//! the same group time.
//!
//! ```text
//!            tick(T)                      tick(T + interval)
//!   sink A:  send(staged@T) -> pull(now = T + interval) -> send ...
//!   sink B:  send(staged@T) -> pull(now = T + interval) -> send ...
//!   source:                    pull(now = T + interval)
//! ```
//!
//! The scheduler is [`LoopState`] for a [`crate::data_loop::DataLoop`];
//! the control context only reaches it through `invoke`.

mod group;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use socket2::Socket;
use tracing::{debug, info};

use crate::codec::CodecSession;
use crate::config::TimingConfig;
use crate::data_loop::LoopState;
use crate::error::{Error, Result};
use group::{Group, Stream};

/// Group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Cig(u8),
    Big(u8),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Cig(id) => write!(f, "CIG {id}"),
            GroupKey::Big(id) => write!(f, "BIG {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

/// Per-stream state shared with the pull callback
#[derive(Debug)]
pub struct IsoIo {
    /// Group time at which the packet staged now will be sent
    pub now: Instant,
    pub interval: Duration,
    /// Staged packet for sink streams
    pub buf: BytesMut,
    /// Set by the scheduler: output was dropped or paused, realign
    pub resync: bool,
    /// Set by the stream: ask the group to resync every sink
    pub need_resync: bool,
}

pub type PullFn = Box<dyn FnMut(&mut IsoIo) + Send>;

/// Packet I/O of one ISO socket
pub trait IsoSocket: Send + Sync {
    fn send_packet(&self, packet: &[u8]) -> io::Result<usize>;

    /// Discard queued input of a stream nobody reads
    fn drop_rx(&self) {}
}

impl IsoSocket for Socket {
    fn send_packet(&self, packet: &[u8]) -> io::Result<usize> {
        (&*self).write(packet)
    }

    fn drop_rx(&self) {
        let mut scratch = [0u8; 512];
        while let Ok(n) = (&*self).read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}

/// A stream to add to a group
pub struct IsoStreamConfig {
    pub group: GroupKey,
    /// We send on this stream
    pub sink: bool,
    pub interval: Duration,
    pub socket: Arc<dyn IsoSocket>,
    /// Encoder used for silence packets of sink streams
    pub session: Option<Box<dyn CodecSession>>,
}

/// All ISO groups of the data context
pub struct IsoScheduler {
    groups: HashMap<GroupKey, Group>,
    next_id: u64,
    resync_pause: Duration,
}

impl IsoScheduler {
    pub fn new(resync_pause: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            next_id: 1,
            resync_pause,
        }
    }

    pub fn from_config(timing: &TimingConfig) -> Self {
        Self::new(timing.iso_resync_pause())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn find(&self, id: StreamId) -> Option<(GroupKey, usize)> {
        self.groups.iter().find_map(|(key, g)| {
            g.streams.iter().position(|s| s.id == id).map(|i| (*key, i))
        })
    }

    fn stream_mut(&mut self, id: StreamId) -> Option<(&mut Group, usize)> {
        let (key, index) = self.find(id)?;
        self.groups.get_mut(&key).map(|g| (g, index))
    }

    /// Link a stream into its group, creating the group on first join
    pub fn add_stream(&mut self, config: IsoStreamConfig, now: Instant) -> Result<StreamId> {
        if config.interval.is_zero() {
            return Err(Error::Iso(format!("{}: zero SDU interval", config.group)));
        }
        let group = self
            .groups
            .entry(config.group)
            .or_insert_with(|| Group::new(config.group));

        let slot = if config.sink {
            &mut group.interval_tx
        } else {
            &mut group.interval_rx
        };
        match *slot {
            Some(existing) if existing != config.interval => {
                let msg = format!(
                    "{}: SDU interval {:?} differs from group's {:?}",
                    config.group, config.interval, existing
                );
                if group.streams.is_empty() {
                    self.groups.remove(&config.group);
                }
                return Err(Error::Iso(msg));
            }
            Some(_) => {}
            None => *slot = Some(config.interval),
        }

        let id = StreamId(self.next_id);
        self.next_id += 1;

        let mut stream = Stream {
            id,
            sink: config.sink,
            idle: true,
            socket: config.socket,
            session: config.session,
            io: group.new_io(config.sink, now),
            pull: None,
        };
        if stream.sink {
            if let Err(e) = stream.stage_silence() {
                debug!("{}: no silence packet: {e}", config.group);
            }
        }
        group.streams.push(stream);
        info!("{}: stream {:?} joined, sink:{}", config.group, id, config.sink);
        Ok(id)
    }

    /// Unlink a stream; the group goes away with its last stream
    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        let Some((key, index)) = self.find(id) else {
            return false;
        };
        let Some(group) = self.groups.get_mut(&key) else {
            return false;
        };
        let was_enabled = group.is_enabled();
        group.streams.remove(index);
        if was_enabled && !group.is_enabled() {
            group.started = false;
            group.next = None;
        }
        if group.streams.is_empty() {
            self.groups.remove(&key);
            debug!("{key}: group destroyed");
        }
        true
    }

    /// Install or clear a stream's pull callback. Enabling the first sink
    /// arms the group timer, disabling the last one disarms it.
    pub fn set_pull(&mut self, id: StreamId, pull: Option<PullFn>, now: Instant) -> bool {
        let Some((group, index)) = self.stream_mut(id) else {
            return false;
        };

        let was_enabled = group.is_enabled();
        group.streams[index].pull = pull;
        let enabled = group.is_enabled();

        if was_enabled && !enabled {
            group.started = false;
            group.next = None;
        } else if enabled && !was_enabled {
            group.next = group.interval_tx.map(|interval| now + interval);
        }

        let next = group.next.unwrap_or(now);
        let stream = &mut group.streams[index];
        stream.idle = true;
        stream.io.resync = true;
        stream.io.buf.clear();
        stream.io.now = next;
        true
    }

    pub fn io(&self, id: StreamId) -> Option<&IsoIo> {
        let (key, index) = self.find(id)?;
        self.groups.get(&key).map(|g| &g.streams[index].io)
    }

    pub fn io_mut(&mut self, id: StreamId) -> Option<&mut IsoIo> {
        self.stream_mut(id).map(|(g, index)| &mut g.streams[index].io)
    }

    /// Next tick of a group, `None` while it is disarmed
    pub fn group_deadline(&self, key: GroupKey) -> Option<Instant> {
        self.groups.get(&key).and_then(|g| g.next)
    }
}

impl LoopState for IsoScheduler {
    fn next_deadline(&self) -> Option<Instant> {
        self.groups.values().filter_map(|g| g.next).min()
    }

    fn on_deadline(&mut self, now: Instant) {
        let pause = self.resync_pause;
        for group in self.groups.values_mut() {
            if group.next.is_some_and(|next| next <= now) {
                group.on_timeout(now, pause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::TestCodec;
    use crate::codec::MediaCodec;
    use parking_lot::Mutex;

    const INTERVAL: Duration = Duration::from_millis(10);

    #[derive(Default)]
    struct RecordingSocket {
        sent: Mutex<Vec<Vec<u8>>>,
        drops: Mutex<u32>,
    }

    impl IsoSocket for RecordingSocket {
        fn send_packet(&self, packet: &[u8]) -> io::Result<usize> {
            self.sent.lock().push(packet.to_vec());
            Ok(packet.len())
        }

        fn drop_rx(&self) {
            *self.drops.lock() += 1;
        }
    }

    fn config(sink: bool, socket: Arc<RecordingSocket>) -> IsoStreamConfig {
        IsoStreamConfig {
            group: GroupKey::Cig(1),
            sink,
            interval: INTERVAL,
            socket,
            session: TestCodec::new("lc3", 6).bap().init(sink, &[6], 100).ok(),
        }
    }

    fn tick(sched: &mut IsoScheduler) -> Instant {
        let deadline = sched.next_deadline().unwrap();
        sched.on_deadline(deadline);
        deadline
    }

    /// Pull callback that stages `base`-relative time as the packet
    fn stamping_pull(base: Instant, seen: Arc<Mutex<Vec<Instant>>>) -> PullFn {
        Box::new(move |io: &mut IsoIo| {
            seen.lock().push(io.now);
            let ms = (io.now - base).as_millis() as u8;
            io.buf.clear();
            io.buf.extend_from_slice(&[ms, 0xaa]);
        })
    }

    #[test]
    fn test_group_lifecycle() {
        let mut sched = IsoScheduler::new(Duration::from_millis(100));
        let now = Instant::now();
        let socket = Arc::new(RecordingSocket::default());
        let a = sched.add_stream(config(true, socket.clone()), now).unwrap();
        let b = sched.add_stream(config(false, socket.clone()), now).unwrap();
        assert_eq!(sched.group_count(), 1);
        assert!(sched.next_deadline().is_none());

        let mut bad = config(true, socket);
        bad.interval = Duration::from_millis(7);
        assert!(sched.add_stream(bad, now).is_err());

        assert!(sched.remove_stream(a));
        assert!(sched.remove_stream(b));
        assert!(!sched.remove_stream(b));
        assert_eq!(sched.group_count(), 0);
    }

    #[test]
    fn test_set_pull_arms_and_disarms_timer() {
        let mut sched = IsoScheduler::new(Duration::from_millis(100));
        let now = Instant::now();
        let socket = Arc::new(RecordingSocket::default());
        let sink = sched.add_stream(config(true, socket.clone()), now).unwrap();
        let source = sched.add_stream(config(false, socket), now).unwrap();

        sched.set_pull(source, Some(Box::new(|_: &mut IsoIo| {})), now);
        assert!(sched.next_deadline().is_none(), "source streams do not drive the timer");

        sched.set_pull(sink, Some(Box::new(|_: &mut IsoIo| {})), now);
        assert_eq!(sched.next_deadline(), Some(now + INTERVAL));

        sched.set_pull(sink, None, now);
        assert!(sched.next_deadline().is_none());
    }

    #[test]
    fn test_linked_streams_share_group_time() {
        let mut sched = IsoScheduler::new(Duration::from_millis(100));
        let base = Instant::now();
        let sink_socket = Arc::new(RecordingSocket::default());
        let source_socket = Arc::new(RecordingSocket::default());

        // CIS1 receives, CIS2 sends
        let cis1 = sched.add_stream(config(false, source_socket), base).unwrap();
        let cis2 = sched.add_stream(config(true, sink_socket.clone()), base).unwrap();

        let seen1 = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::new(Mutex::new(Vec::new()));
        sched.set_pull(cis1, Some(stamping_pull(base, seen1.clone())), base);
        sched.set_pull(cis2, Some(stamping_pull(base, seen2.clone())), base);

        let mut ticks = Vec::new();
        for _ in 0..6 {
            ticks.push(tick(&mut sched));
        }

        let seen1 = seen1.lock().clone();
        let seen2 = seen2.lock().clone();
        assert_eq!(seen1.len(), 6);
        assert_eq!(seen1, seen2);
        for (tick, now) in ticks.iter().zip(&seen2) {
            assert_eq!(*now, *tick + INTERVAL);
        }

        // Packets go out from the second tick on, each stamped with the
        // tick it was sent at
        let sent = sink_socket.sent.lock().clone();
        assert_eq!(sent.len(), 5);
        for (packet, tick) in sent.iter().zip(&ticks[1..]) {
            assert_eq!(u128::from(packet[0]), (*tick - base).as_millis());
        }
    }

    #[test]
    fn test_joining_stream_pauses_live_group() {
        let mut sched = IsoScheduler::new(Duration::from_millis(30));
        let base = Instant::now();
        let socket_a = Arc::new(RecordingSocket::default());
        let socket_b = Arc::new(RecordingSocket::default());
        let a = sched.add_stream(config(true, socket_a.clone()), base).unwrap();
        let b = sched.add_stream(config(true, socket_b.clone()), base).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        sched.set_pull(a, Some(stamping_pull(base, seen.clone())), base);
        for _ in 0..3 {
            tick(&mut sched);
        }
        let sent_a = socket_a.sent.lock().len();
        let sent_b = socket_b.sent.lock().len();
        assert_eq!(sent_a, 2);
        assert_eq!(sent_b, 2, "idle sink sends silence once the group runs");

        let now = sched.next_deadline().unwrap() - Duration::from_millis(1);
        sched.set_pull(b, Some(stamping_pull(base, seen)), now);

        // 1 + 30 ms / 10 ms ticks without output
        for _ in 0..4 {
            tick(&mut sched);
        }
        assert_eq!(socket_a.sent.lock().len(), sent_a);
        assert_eq!(socket_b.sent.lock().len(), sent_b);
        assert!(sched.io(a).unwrap().resync);

        tick(&mut sched);
        assert_eq!(socket_a.sent.lock().len(), sent_a + 1);
        assert_eq!(socket_b.sent.lock().len(), sent_b + 1);
    }

    #[test]
    fn test_need_resync_propagates_to_all_sinks() {
        let mut sched = IsoScheduler::new(Duration::ZERO);
        let base = Instant::now();
        let socket = Arc::new(RecordingSocket::default());
        let a = sched.add_stream(config(true, socket.clone()), base).unwrap();
        let b = sched.add_stream(config(true, socket), base).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        sched.set_pull(a, Some(stamping_pull(base, seen.clone())), base);
        sched.set_pull(b, Some(stamping_pull(base, seen)), base);
        tick(&mut sched);
        tick(&mut sched);
        sched.io_mut(a).unwrap().resync = false;
        sched.io_mut(b).unwrap().resync = false;

        sched.io_mut(a).unwrap().need_resync = true;
        tick(&mut sched);
        assert!(sched.io(b).unwrap().resync);
        assert!(!sched.io(a).unwrap().need_resync);
    }

    #[test]
    fn test_unread_source_is_drained() {
        let mut sched = IsoScheduler::new(Duration::ZERO);
        let base = Instant::now();
        let sink_socket = Arc::new(RecordingSocket::default());
        let source_socket = Arc::new(RecordingSocket::default());
        let sink = sched.add_stream(config(true, sink_socket), base).unwrap();
        sched.add_stream(config(false, source_socket.clone()), base).unwrap();
        sched.set_pull(sink, Some(Box::new(|_: &mut IsoIo| {})), base);
        tick(&mut sched);
        tick(&mut sched);
        assert_eq!(*source_socket.drops.lock(), 2);
    }
}

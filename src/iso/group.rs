//! One CIG or BIG and its member streams

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, trace};

use super::{GroupKey, IsoIo, IsoSocket, PullFn, StreamId};
use crate::codec::CodecSession;
use crate::error::CodecError;

/// Staging buffer size for one ISO packet
const MAX_PACKET: usize = 1024;

pub(super) struct Stream {
    pub id: StreamId,
    pub sink: bool,
    /// No packet pulled since the callback was (re)set
    pub idle: bool,
    pub socket: Arc<dyn IsoSocket>,
    pub session: Option<Box<dyn CodecSession>>,
    pub io: IsoIo,
    pub pull: Option<PullFn>,
}

impl Stream {
    /// Stage one block of encoded silence
    pub fn stage_silence(&mut self) -> Result<(), CodecError> {
        self.idle = true;
        self.io.buf.clear();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let block = session.block_size();
        self.io.buf.resize(MAX_PACKET, 0);
        let used = session.start_encode(&mut self.io.buf[..], 0, 0)?;
        let silence = vec![0u8; block];
        let res = session.encode(&silence, &mut self.io.buf[used..])?;
        self.io.buf.truncate(used + res.written);
        Ok(())
    }
}

pub(super) struct Group {
    pub key: GroupKey,
    pub streams: Vec<Stream>,
    pub interval_tx: Option<Duration>,
    pub interval_rx: Option<Duration>,
    /// Absolute time of the next tick; `None` while disarmed
    pub next: Option<Instant>,
    pub started: bool,
    /// Ticks left in the post-join grace period
    pub paused: u32,
}

impl Group {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            streams: Vec::new(),
            interval_tx: None,
            interval_rx: None,
            next: None,
            started: false,
            paused: 0,
        }
    }

    /// At least one sink stream has a pull callback
    pub fn is_enabled(&self) -> bool {
        self.streams.iter().any(|s| s.sink && s.pull.is_some())
    }

    pub fn new_io(&self, sink: bool, now: Instant) -> IsoIo {
        let interval = if sink { self.interval_tx } else { self.interval_rx };
        IsoIo {
            now: self.next.unwrap_or(now),
            interval: interval.unwrap_or_default(),
            buf: BytesMut::with_capacity(MAX_PACKET),
            resync: true,
            need_resync: false,
        }
    }

    /// One timer expiration at `now`
    pub fn on_timeout(&mut self, now: Instant, resync_pause: Duration) {
        let (Some(next), Some(interval)) = (self.next, self.interval_tx) else {
            return;
        };
        if now < next || interval.is_zero() {
            return;
        }
        let expirations = 1 + ((now - next).as_nanos() / interval.as_nanos()) as u32;
        if expirations > 1 {
            debug!("ISO group:{:?} missed {} ticks", self.key, expirations - 1);
        }

        let mut resync = false;
        let mut joined = false;
        let mut live = false;
        for stream in &mut self.streams {
            if !stream.sink {
                if stream.pull.is_none() {
                    stream.socket.drop_rx();
                }
                continue;
            }
            if stream.io.need_resync {
                resync = true;
                stream.io.need_resync = false;
            }
            if stream.idle && stream.pull.is_some() {
                joined = true;
            } else if !stream.idle {
                live = true;
            }
            if !self.started && !stream.idle && !stream.io.buf.is_empty() {
                self.started = true;
            }
        }

        if joined && live {
            self.paused = 1 + (resync_pause.as_nanos() / interval.as_nanos()) as u32;
            debug!("ISO group:{:?} stream joined, pausing {} ticks", self.key, self.paused);
        }

        let hold = !self.started || self.paused > 0;
        for stream in self.streams.iter_mut().filter(|s| s.sink) {
            if hold {
                stream.io.resync = true;
                stream.io.buf.clear();
                continue;
            }
            if stream.io.buf.is_empty() {
                trace!("ISO group:{:?} miss stream:{:?}", self.key, stream.id);
                if let Err(e) = stream.stage_silence() {
                    debug!("ISO group:{:?} silence failed: {e}", self.key);
                    continue;
                }
                if stream.io.buf.is_empty() {
                    continue;
                }
            }
            match stream.socket.send_packet(&stream.io.buf) {
                Ok(n) => trace!("ISO group:{:?} sent stream:{:?} size:{n}", self.key, stream.id),
                Err(e) => debug!("ISO group:{:?} send failure: {e}", self.key),
            }
            stream.io.buf.clear();
        }
        self.paused = self.paused.saturating_sub(1);

        let next = next + interval * expirations;
        self.next = Some(next);

        for stream in &mut self.streams {
            if stream.sink && resync {
                stream.io.resync = true;
            }
            match stream.pull.as_mut() {
                Some(pull) => {
                    stream.idle = false;
                    stream.io.now = next;
                    pull(&mut stream.io);
                }
                None if stream.sink => {
                    if let Err(e) = stream.stage_silence() {
                        debug!("ISO group:{:?} silence failed: {e}", self.key);
                    }
                }
                None => {}
            }
        }
    }
}

//! Decoded-audio buffer with latency control
//!
//! Single-owner linear buffer sitting between the socket reader (which
//! decodes packets straight into it) and the period-driven consumer. Data
//! lives in `[read_index, write_index)`. The tail `reserve` bytes are never
//! written; when free space would eat into them the live data is moved back
//! to offset 0.
//!
//! Once per period the consumer calls [`DecodeBuffer::process`], which
//! handles underrun buffering, overrun dropping, automatic target latency
//! and updates the rate correction the consumer should resample with.

use tracing::{debug, trace};

use super::rate_control::{PeakTracker, RateController};
use crate::config::DecodeBufferConfig;
use crate::constants::{BUFFERING_LONG_MSEC, BUFFERING_SHORT_MSEC, RATE_DIFF_MAX};

/// Construction parameters
#[derive(Debug, Clone)]
pub struct DecodeBufferParams {
    /// Bytes per sample frame (all channels)
    pub frame_size: usize,
    pub rate: u32,
    /// Largest period the consumer will ask for, in samples
    pub quantum_limit: u32,
    /// Tail reserve, in samples
    pub reserve: u32,
    /// Fixed target latency in samples; automatic when `None`
    pub target: Option<u32>,
    /// Maximum automatic latency above one period, in samples
    pub max_extra: Option<u32>,
    /// Rate controller averaging window, in milliseconds
    pub averaging_window_ms: u32,
    pub max_rate_diff: f64,
}

impl DecodeBufferParams {
    pub fn new(frame_size: usize, rate: u32, quantum_limit: u32) -> Self {
        Self {
            frame_size,
            rate,
            quantum_limit,
            reserve: quantum_limit,
            target: None,
            max_extra: None,
            averaging_window_ms: BUFFERING_SHORT_MSEC,
            max_rate_diff: RATE_DIFF_MAX,
        }
    }

    /// Parameters with the configured latency tuning applied
    pub fn from_config(frame_size: usize, rate: u32, quantum_limit: u32, config: &DecodeBufferConfig) -> Self {
        let ms_to_samples = |ms: u32| (u64::from(ms) * u64::from(rate) / 1000) as u32;
        Self {
            target: config.target_latency_ms.map(ms_to_samples),
            max_extra: config.max_extra_latency_ms.map(ms_to_samples),
            averaging_window_ms: config.averaging_window_ms,
            max_rate_diff: config.max_rate_diff,
            ..Self::new(frame_size, rate, quantum_limit)
        }
    }
}

/// Decode buffer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeBufferStats {
    pub packets: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub dropped_bytes: u64,
    pub level: f64,
    pub target: u32,
    pub corr: f64,
    pub buffering: bool,
}

pub struct DecodeBuffer {
    data: Vec<u8>,
    frame_size: usize,
    rate: u32,
    reserve: usize,
    write_index: usize,
    read_index: usize,

    /// Short-window tracker of packet sizes (samples)
    packet_size: PeakTracker,
    /// Long-window tracker of buffer level (samples)
    spike: PeakTracker,
    ctl: RateController,

    fixed_target: Option<u32>,
    max_extra: Option<u32>,
    window: f64,
    max_rate_diff: f64,

    target: u32,
    level: f64,
    corr: f64,
    buffering: bool,
    prev_duration: u32,
    stats: DecodeBufferStats,
}

impl DecodeBuffer {
    pub fn new(params: DecodeBufferParams) -> Self {
        let frame_size = params.frame_size.max(1);
        let rate = params.rate.max(1);
        let samples = 2 * params.quantum_limit as usize + params.reserve as usize;
        let window = f64::from(params.averaging_window_ms) * f64::from(rate) / 1000.0;
        let long_window = u64::from(BUFFERING_LONG_MSEC) * u64::from(rate) / 1000;
        let short_window = u64::from(BUFFERING_SHORT_MSEC) * u64::from(rate) / 1000;

        Self {
            data: vec![0; samples * frame_size],
            frame_size,
            rate,
            reserve: params.reserve as usize * frame_size,
            write_index: 0,
            read_index: 0,
            packet_size: PeakTracker::new(short_window),
            spike: PeakTracker::new(long_window),
            ctl: RateController::default(),
            fixed_target: params.target,
            max_extra: params.max_extra,
            window,
            max_rate_diff: params.max_rate_diff,
            target: params.target.unwrap_or(0),
            level: 0.0,
            corr: 1.0,
            buffering: true,
            prev_duration: 0,
            stats: DecodeBufferStats::default(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn buffer_size(&self) -> usize {
        self.data.len()
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Bytes available for reading
    pub fn avail(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Current resampling factor; above 1 means consume faster
    pub fn corr(&self) -> f64 {
        self.corr
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Target latency in samples
    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn stats(&self) -> DecodeBufferStats {
        DecodeBufferStats {
            level: self.level,
            target: self.target,
            corr: self.corr,
            buffering: self.buffering,
            ..self.stats.clone()
        }
    }

    fn compact(&mut self) {
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
            return;
        }
        if self.data.len() - self.reserve - self.write_index < self.reserve {
            let avail = self.avail();
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = avail;
        }
    }

    /// Writable region; never extends into the reserve
    pub fn get_write(&mut self) -> &mut [u8] {
        self.compact();
        let end = self.data.len() - self.reserve;
        let start = self.write_index.min(end);
        &mut self.data[start..end]
    }

    /// Commit `size` bytes written into [`DecodeBuffer::get_write`]'s region
    /// as one received packet
    pub fn write_packet(&mut self, size: usize) {
        let limit = self.data.len() - self.reserve;
        let size = size.min(limit.saturating_sub(self.write_index));
        self.write_index += size;
        self.stats.packets += 1;

        let samples = (size / self.frame_size) as i64;
        self.packet_size.update(samples, samples.max(1) as u64);
    }

    /// Readable data
    pub fn get_read(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Consume `size` bytes
    pub fn read(&mut self, size: usize) {
        let size = size.min(self.avail());
        self.read_index += size;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    /// Restart buffering, e.g. after a discontinuity
    pub fn recover(&mut self) {
        debug!("decode buffer: recover, level:{:.1}", self.level);
        self.buffering = true;
        self.corr = 1.0;
        self.spike.reset();
        self.ctl.reset(f64::from(self.target));
    }

    fn max_packet(&self) -> u32 {
        self.packet_size.max().clamp(0, i64::from(u32::MAX / 2)) as u32
    }

    /// Automatic target latency for a period of `duration` samples
    fn auto_target(&self, duration: u32) -> u32 {
        let spike = self.spike.spread().max(0) as f64;
        let grid = (self.rate / 100).max(1);
        let wanted = (1.5 * spike).max(f64::from(duration)).ceil() as u32;
        let rounded = wanted.div_ceil(grid) * grid;

        let capacity = ((self.data.len() - self.reserve) / self.frame_size) as u32;
        let upper = capacity.saturating_sub(2 * self.max_packet());
        let mut target = rounded.min(upper);
        if let Some(extra) = self.max_extra {
            target = target.min(duration + extra);
        }
        target.max(duration)
    }

    /// Per-period bookkeeping, before reading `samples` frames
    pub fn process(&mut self, samples: u32, duration: u32) {
        let data_size = samples as usize * self.frame_size;

        if duration != self.prev_duration {
            self.prev_duration = duration;
            if !self.buffering {
                self.recover();
            }
        }

        self.target = match self.fixed_target {
            Some(t) => t.max(duration),
            None => self.auto_target(duration),
        };

        if self.buffering {
            let size = (self.avail() / self.frame_size) as u32;
            self.corr = 1.0;
            trace!("decode buffer: buffering size:{size}");
            if size < duration.max(self.target) {
                return;
            }
            self.buffering = false;
            self.ctl.reset(f64::from(self.target));
            debug!("decode buffer: buffering done, level:{size} target:{}", self.target);
        } else if self.avail() < data_size {
            self.stats.underruns += 1;
            debug!(
                "decode buffer: underrun, avail:{} need:{data_size}",
                self.avail()
            );
            self.buffering = true;
            self.corr = 1.0;
            return;
        }

        let avail = self.avail();
        let mut level = (avail / self.frame_size) as f64;
        self.spike.update(level as i64, u64::from(duration));

        let target = f64::from(self.target);
        let packet = f64::from(self.max_packet());
        if level > (4.0 * target).max(3.0 * packet) && avail > data_size {
            let excess = ((level - target) as usize) * self.frame_size;
            let drop = excess.min(avail - data_size) / self.frame_size * self.frame_size;
            self.read(drop);
            self.stats.overruns += 1;
            self.stats.dropped_bytes += drop as u64;
            level -= (drop / self.frame_size) as f64;
            self.ctl.reset(target);
            debug!("decode buffer: overrun, dropped:{drop} level:{level:.1} target:{target}");
        }

        self.level = level;
        self.corr = self.ctl.update(level, target, f64::from(duration), self.window, self.max_rate_diff);
    }
}

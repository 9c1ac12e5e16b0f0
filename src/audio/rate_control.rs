//! Closed-loop rate correction and windowed peak tracking
//!
//! [`RateController`] turns the buffer fill level into a resampling factor.
//! It is a low-pass iteration with no high-frequency gain:
//!
//! ```text
//! beta = clamp(duration / window, 0, 0.5)
//! avg' = beta * level + (1 - beta) * avg
//! corr' = corr + beta/3 * (avg' - avg) / window + beta^2/27 * (avg' - target) / window
//! corr' = clamp(corr', 1 - max_diff, 1 + max_diff)
//! ```
//!
//! Levels, targets, durations and windows are all in samples.

/// Two-state rate filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateController {
    avg: f64,
    corr: f64,
}

impl RateController {
    /// Start at `level` with no correction
    pub fn new(level: f64) -> Self {
        Self { avg: level, corr: 1.0 }
    }

    pub fn reset(&mut self, level: f64) {
        *self = Self::new(level);
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn corr(&self) -> f64 {
        self.corr
    }

    /// Feed one cycle's level; returns the new correction factor
    pub fn update(&mut self, level: f64, target: f64, duration: f64, window: f64, max_diff: f64) -> f64 {
        if !level.is_finite() || window <= 0.0 {
            return self.corr;
        }
        let beta = (duration / window).clamp(0.0, 0.5);
        let avg = beta * level + (1.0 - beta) * self.avg;

        self.corr += beta / 3.0 * (avg - self.avg) / window + beta * beta / 27.0 * (avg - target) / window;
        self.avg = avg;
        self.corr = self.corr.clamp(1.0 - max_diff, 1.0 + max_diff);
        self.corr
    }
}

impl Default for RateController {
    fn default() -> Self {
        Self::new(0.0)
    }
}

const SLOTS: usize = 4;

/// Windowed min/max of a sampled signal
///
/// The window is split into overlapping slots; each value updates every
/// slot and the oldest slot is retired once its share of the window has
/// elapsed, so `min()`/`max()` cover roughly the last `window` samples.
#[derive(Debug, Clone)]
pub struct PeakTracker {
    mins: [i64; SLOTS],
    maxs: [i64; SLOTS],
    left: u64,
    window: u64,
    valid: bool,
}

impl PeakTracker {
    pub fn new(window: u64) -> Self {
        Self {
            mins: [0; SLOTS],
            maxs: [0; SLOTS],
            left: 0,
            window,
            valid: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }

    pub fn set_window(&mut self, window: u64) {
        self.window = window;
    }

    /// Record `value` observed over `duration` samples
    pub fn update(&mut self, value: i64, duration: u64) {
        if !self.valid {
            self.mins = [value; SLOTS];
            self.maxs = [value; SLOTS];
            self.left = self.window / (SLOTS as u64 - 1);
            self.valid = true;
            return;
        }

        if self.left < duration {
            self.mins.rotate_left(1);
            self.maxs.rotate_left(1);
            self.mins[SLOTS - 1] = value;
            self.maxs[SLOTS - 1] = value;
            self.left = self.window / (SLOTS as u64 - 1);
        } else {
            self.left -= duration;
        }

        for v in &mut self.mins {
            *v = (*v).min(value);
        }
        for v in &mut self.maxs {
            *v = (*v).max(value);
        }
    }

    pub fn min(&self) -> i64 {
        self.mins[0]
    }

    pub fn max(&self) -> i64 {
        self.maxs[0]
    }

    /// Peak-to-peak amplitude over the window
    pub fn spread(&self) -> i64 {
        self.max() - self.min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: f64 = 48000.0;
    const MAX_DIFF: f64 = 0.005;

    #[test]
    fn test_no_correction_at_target() {
        let mut ctl = RateController::new(480.0);
        for _ in 0..1000 {
            ctl.update(480.0, 480.0, 256.0, WINDOW, MAX_DIFF);
        }
        assert!((ctl.corr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_corr_sign_follows_error() {
        let mut fast = RateController::new(480.0);
        let mut slow = RateController::new(480.0);
        for _ in 0..200 {
            fast.update(2000.0, 480.0, 256.0, WINDOW, MAX_DIFF);
            slow.update(0.0, 480.0, 256.0, WINDOW, MAX_DIFF);
        }
        assert!(fast.corr() > 1.0);
        assert!(slow.corr() < 1.0);
    }

    #[test]
    fn test_avg_converges_monotonically_after_step() {
        let mut ctl = RateController::new(0.0);
        let mut prev = ctl.avg();
        for _ in 0..2000 {
            ctl.update(1000.0, 500.0, 256.0, WINDOW, MAX_DIFF);
            let avg = ctl.avg();
            assert!(avg >= prev, "avg went backwards: {prev} -> {avg}");
            assert!(avg <= 1000.0);
            prev = avg;
        }
        assert!((1000.0 - prev) < 1.0);
    }

    #[test]
    fn test_peak_tracker_window_expires() {
        let mut ptp = PeakTracker::new(3000);
        ptp.update(10, 100);
        ptp.update(500, 100);
        assert_eq!(ptp.max(), 500);
        assert_eq!(ptp.spread(), 490);

        // Four slot lengths of small values push the spike out
        for _ in 0..50 {
            ptp.update(20, 100);
        }
        assert_eq!(ptp.max(), 20);
        assert_eq!(ptp.min(), 20);
    }

    proptest! {
        #[test]
        fn prop_corr_stays_bounded(
            levels in proptest::collection::vec(-1.0e7f64..1.0e7, 1..400),
            target in 0.0f64..10_000.0,
            duration in 1.0f64..100_000.0,
            max_diff in 0.0f64..0.4,
        ) {
            let mut ctl = RateController::new(target);
            for level in levels {
                let corr = ctl.update(level, target, duration, WINDOW, max_diff);
                prop_assert!(corr >= 1.0 - max_diff - 1e-12);
                prop_assert!(corr <= 1.0 + max_diff + 1e-12);
            }
        }

        #[test]
        fn prop_avg_step_response_has_no_sign_oscillation(
            start in -5000.0f64..5000.0,
            level in -5000.0f64..5000.0,
            duration in 1.0f64..48_000.0,
        ) {
            let mut ctl = RateController::new(start);
            let sign = (level - start).signum();
            for _ in 0..200 {
                ctl.update(level, 0.0, duration, WINDOW, MAX_DIFF);
                let err = level - ctl.avg();
                prop_assert!(err == 0.0 || err.signum() == sign || err.abs() < 1e-9);
            }
        }
    }
}

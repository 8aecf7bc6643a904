// crates/rivulet-core/src/clock.rs
//
// Monotonic virtual clock. The hot-path fields are independent atomic
// doubles so decoders can update and readers can sample without
// locking; the mutex only serializes the rare compound transitions
// (pause flips, calibration rebuilds).
//
// Time model: `set(pts, serial)` anchors `pts_drift = pts - now`.
// While running, `get() = drift + now - (now - last_updated) * speed`,
// which advances at `speed` seconds of media time per wall second and
// is continuous across `set_speed` because the speed change re-anchors
// to the current computed value.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// f64 stored in an AtomicU64 through its bit pattern.
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// CAS-loop add; returns the previous value.
    pub fn fetch_add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return f64::from_bits(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// CAS-loop max; keeps the larger of the stored and given value.
    pub fn fetch_max(&self, value: f64) {
        let mut current = self.0.load(Ordering::Acquire);
        while value > f64::from_bits(current) {
            match self.0.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Seconds since an arbitrary process-wide epoch; strictly monotonic.
pub(crate) fn now_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Clock lifecycle classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// No pts has been set (pts is NaN).
    Invalid,
    Valid,
    /// No update for more than `STALE_AFTER_SECS`.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockStats {
    pub value: f64,
    pub pts_drift: f64,
    pub speed: f64,
    pub serial: i32,
    pub paused: bool,
    pub state: ClockState,
}

/// Recalibrate when the anchor drifts further than this from wall time.
const MAX_DRIFT_SECS: f64 = 10.0;
/// A clock not updated for this long reads as stale.
const STALE_AFTER_SECS: f64 = 5.0;
/// Drift check runs once per this many `calibrate` calls.
const CALIBRATION_INTERVAL: u32 = 100;

pub struct Clock {
    pts: AtomicF64,
    pts_drift: AtomicF64,
    last_updated: AtomicF64,
    speed: AtomicF64,
    serial: AtomicI32,
    paused: AtomicBool,
    calibration_counter: AtomicU32,
    mutex: Mutex<()>,
}

impl Clock {
    pub fn new() -> Self {
        let clock = Self {
            pts: AtomicF64::new(f64::NAN),
            pts_drift: AtomicF64::new(0.0),
            last_updated: AtomicF64::new(now_seconds()),
            speed: AtomicF64::new(1.0),
            serial: AtomicI32::new(0),
            paused: AtomicBool::new(false),
            calibration_counter: AtomicU32::new(0),
            mutex: Mutex::new(()),
        };
        clock.init(0);
        clock
    }

    /// Reset to pts 0 at `queue_serial`, speed 1.0, running.
    pub fn init(&self, queue_serial: i32) {
        self.speed.store(1.0);
        self.paused.store(false, Ordering::Release);
        self.serial.store(queue_serial, Ordering::Release);
        self.calibration_counter.store(0, Ordering::Release);
        self.set(0.0, queue_serial);
    }

    pub fn reset(&self) {
        self.init(0);
    }

    /// Current logical time; frozen at `pts` while paused.
    pub fn get(&self) -> f64 {
        if self.paused.load(Ordering::Acquire) {
            return self.pts.load();
        }
        let now = now_seconds();
        let last = self.last_updated.load();
        let drift = self.pts_drift.load();
        let speed = self.speed.load();
        drift + now - (now - last) * speed
    }

    pub fn set(&self, pts: f64, serial: i32) {
        let now = now_seconds();
        self.pts.store(pts);
        self.pts_drift.store(pts - now);
        self.last_updated.store(now);
        self.serial.store(serial, Ordering::Release);
    }

    /// Change playback speed, re-anchoring so `get()` is continuous at
    /// the change instant.
    pub fn set_speed(&self, speed: f64) {
        if !(speed > 0.0) || (self.speed.load() - speed).abs() < f64::EPSILON {
            return;
        }
        let current = self.get();
        let serial = self.serial.load(Ordering::Acquire);
        self.speed.store(speed);
        self.set(current, serial);
    }

    /// Pausing freezes the clock at its current value; resuming
    /// re-anchors from the frozen pts.
    pub fn set_paused(&self, paused: bool) {
        let _guard = self.mutex.lock().unwrap();
        if self.paused.load(Ordering::Acquire) == paused {
            return;
        }
        if paused {
            let current = self.get();
            self.pts.store(current);
        } else {
            let pts = self.pts.load();
            self.set(pts, self.serial.load(Ordering::Acquire));
        }
        self.paused.store(paused, Ordering::Release);
    }

    /// Call once per update; every `CALIBRATION_INTERVAL` calls the
    /// anchor is rebuilt if it drifted past `MAX_DRIFT_SECS`.
    pub fn calibrate(&self) {
        let counter = self.calibration_counter.fetch_add(1, Ordering::AcqRel);
        if counter % CALIBRATION_INTERVAL != 0 {
            return;
        }
        if self.pts_drift.load().abs() > MAX_DRIFT_SECS {
            let _guard = self.mutex.lock().unwrap();
            let current = self.get();
            self.set(current, self.serial.load(Ordering::Acquire));
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.pts.load().is_nan()
    }

    pub fn state(&self) -> ClockState {
        if !self.is_valid() {
            return ClockState::Invalid;
        }
        if now_seconds() - self.last_updated.load() > STALE_AFTER_SECS {
            return ClockState::Stale;
        }
        ClockState::Valid
    }

    pub fn pts(&self) -> f64 {
        self.pts.load()
    }

    pub fn pts_drift(&self) -> f64 {
        self.pts_drift.load()
    }

    pub fn speed(&self) -> f64 {
        self.speed.load()
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClockStats {
        ClockStats {
            value: self.get(),
            pts_drift: self.pts_drift.load(),
            speed: self.speed.load(),
            serial: self.serial.load(Ordering::Acquire),
            paused: self.paused.load(Ordering::Acquire),
            state: self.state(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_then_get_tracks_wall_time() {
        let clock = Clock::new();
        clock.set(10.0, 1);
        thread::sleep(Duration::from_millis(50));
        let value = clock.get();
        assert!(value >= 10.0, "clock went backwards: {value}");
        assert!(value < 10.5, "clock ran away: {value}");
        assert_eq!(clock.serial(), 1);
    }

    #[test]
    fn speed_change_is_continuous() {
        let clock = Clock::new();
        clock.set(5.0, 0);
        thread::sleep(Duration::from_millis(20));
        let before = clock.get();
        clock.set_speed(2.0);
        let after = clock.get();
        assert!((after - before).abs() < 0.001, "step at speed change: {before} -> {after}");
        assert_eq!(clock.speed(), 2.0);
    }

    #[test]
    fn pause_freezes_and_resume_continues() {
        let clock = Clock::new();
        clock.set(3.0, 0);
        clock.set_paused(true);
        let frozen = clock.get();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(clock.get(), frozen);

        clock.set_paused(false);
        thread::sleep(Duration::from_millis(20));
        assert!(clock.get() >= frozen);
    }

    #[test]
    fn invalid_until_first_set() {
        let clock = Clock::new();
        // init() sets pts 0, so a fresh clock is valid; poison it the
        // way a reset-to-unknown would.
        assert!(clock.is_valid());
        clock.set(f64::NAN, 0);
        assert_eq!(clock.state(), ClockState::Invalid);
        clock.set(1.0, 0);
        assert_eq!(clock.state(), ClockState::Valid);
    }

    #[test]
    fn init_applies_queue_serial() {
        let clock = Clock::new();
        clock.init(7);
        assert_eq!(clock.serial(), 7);
        assert_eq!(clock.speed(), 1.0);
        assert!(!clock.is_paused());
    }

    #[test]
    fn stats_snapshot_is_coherent() {
        let clock = Clock::new();
        clock.set(2.5, 3);
        let stats = clock.stats();
        assert_eq!(stats.serial, 3);
        assert!(!stats.paused);
        assert_eq!(stats.state, ClockState::Valid);
        assert!(stats.value >= 2.5);
    }
}

// crates/rivulet-core/src/sync.rs
//
// StreamSyncManager: three virtual clocks (audio, video, external),
// master selection, and the per-frame display-delay computation with
// drop/duplicate decisions. Drift is smoothed with a clamped EMA whose
// responsiveness scales with playback speed and doubles on direction
// changes so oscillation around zero converges instead of ringing.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::clock::{AtomicF64, Clock};
use crate::config::MasterClock;

/// Allowed band for the sync threshold, in seconds.
const MIN_SYNC_THRESHOLD: f64 = 0.005;
const MAX_SYNC_THRESHOLD: f64 = 0.050;
/// Quality report cadence, in drift samples.
const QUALITY_REPORT_INTERVAL: u64 = 500;

/// Overall sync classification at 1x / 3x threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    InSync,
    SlightDrift,
    OutOfSync,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncStats {
    pub state: SyncState,
    pub video_drift: f64,
    pub audio_drift: f64,
    pub master_clock: f64,
    pub dropped_frames: u64,
    pub duplicated_frames: u64,
    pub avg_delay_ms: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncQualityStats {
    pub total_sync_count: u64,
    pub good_sync_count: u64,
    pub poor_sync_count: u64,
    pub good_sync_rate: f64,
    pub avg_drift: f64,
    pub max_drift: f64,
}

pub struct StreamSyncManager {
    master: AtomicU8,

    audio_clock: Clock,
    video_clock: Clock,
    external_clock: Clock,

    sync_threshold: AtomicF64,
    adaptive_threshold: AtomicF64,
    adaptive_sync: AtomicBool,
    alpha: AtomicF64,
    #[allow(dead_code)]
    max_drift: AtomicF64,

    smoothed_video_drift: AtomicF64,
    smoothed_audio_drift: AtomicF64,
    avg_video_delay: AtomicF64,
    avg_audio_delay: AtomicF64,

    dropped_frames: AtomicU64,
    duplicated_frames: AtomicU64,

    // Drift quality accounting
    quality_counter: AtomicU64,
    good_sync_count: AtomicU64,
    poor_sync_count: AtomicU64,
    total_drift: AtomicF64,
    avg_drift: AtomicF64,
    peak_drift: AtomicF64,
    #[allow(dead_code)]
    calibration_counter: AtomicU32,
}

fn master_to_u8(m: MasterClock) -> u8 {
    match m {
        MasterClock::Audio => 0,
        MasterClock::Video => 1,
        MasterClock::External => 2,
    }
}

fn master_from_u8(v: u8) -> MasterClock {
    match v {
        1 => MasterClock::Video,
        2 => MasterClock::External,
        _ => MasterClock::Audio,
    }
}

/// Clamped EMA step. `max_change` bounds the per-step movement; both
/// the bound and the effective alpha scale with speed (capped at 4x)
/// and double when the drift changes sign. The result is clamped to
/// +-0.2 * min(speed, 4) so the accumulator cannot wind up.
fn smooth_ema(alpha: f64, prev: f64, current: f64, speed: f64, max_change: f64) -> f64 {
    let speed_factor = speed.min(4.0);
    let adjusted_max_change = max_change * speed_factor;
    let adjusted_alpha = (alpha * speed_factor).min(0.9);

    let direction_change = (prev > 0.0 && current < 0.0) || (prev < 0.0 && current > 0.0);

    let effective_max_change = if direction_change {
        adjusted_max_change * 2.0
    } else {
        adjusted_max_change
    };
    let effective_alpha = if direction_change {
        (adjusted_alpha * 2.0).min(1.0)
    } else {
        adjusted_alpha
    };

    let change = (current - prev).clamp(-effective_max_change, effective_max_change);
    let new_value = prev + effective_alpha * change;
    new_value.clamp(-0.2 * speed_factor, 0.2 * speed_factor)
}

impl StreamSyncManager {
    pub fn new() -> Self {
        Self::with_params(MasterClock::Audio, 0.010, 0.1, 0.1)
    }

    pub fn with_params(master: MasterClock, sync_threshold: f64, max_drift: f64, alpha: f64) -> Self {
        let threshold = sync_threshold.clamp(MIN_SYNC_THRESHOLD, MAX_SYNC_THRESHOLD);
        let manager = Self {
            master: AtomicU8::new(master_to_u8(master)),
            audio_clock: Clock::new(),
            video_clock: Clock::new(),
            external_clock: Clock::new(),
            sync_threshold: AtomicF64::new(threshold),
            adaptive_threshold: AtomicF64::new(threshold),
            adaptive_sync: AtomicBool::new(false),
            alpha: AtomicF64::new(alpha),
            max_drift: AtomicF64::new(max_drift),
            smoothed_video_drift: AtomicF64::new(0.0),
            smoothed_audio_drift: AtomicF64::new(0.0),
            avg_video_delay: AtomicF64::new(0.0),
            avg_audio_delay: AtomicF64::new(0.0),
            dropped_frames: AtomicU64::new(0),
            duplicated_frames: AtomicU64::new(0),
            quality_counter: AtomicU64::new(0),
            good_sync_count: AtomicU64::new(0),
            poor_sync_count: AtomicU64::new(0),
            total_drift: AtomicF64::new(0.0),
            avg_drift: AtomicF64::new(0.0),
            peak_drift: AtomicF64::new(0.0),
            calibration_counter: AtomicU32::new(0),
        };
        manager.audio_clock.init(0);
        manager.video_clock.init(0);
        manager.external_clock.init(0);
        manager
    }

    pub fn set_master(&self, master: MasterClock) {
        self.master.store(master_to_u8(master), Ordering::Release);
    }

    pub fn master(&self) -> MasterClock {
        master_from_u8(self.master.load(Ordering::Acquire))
    }

    pub fn set_sync_threshold(&self, threshold: f64) {
        self.sync_threshold
            .store(threshold.clamp(MIN_SYNC_THRESHOLD, MAX_SYNC_THRESHOLD));
    }

    pub fn set_adaptive_sync(&self, enable: bool) {
        self.adaptive_sync.store(enable, Ordering::Release);
    }

    pub fn set_speed(&self, speed: f64) {
        self.audio_clock.set_speed(speed);
        self.video_clock.set_speed(speed);
        self.external_clock.set_speed(speed);
    }

    pub fn update_audio_clock(&self, pts: f64, serial: i32) {
        self.audio_clock.set(pts, serial);
        self.audio_clock.calibrate();
    }

    pub fn update_video_clock(&self, pts: f64, serial: i32) {
        self.video_clock.set(pts, serial);
        self.video_clock.calibrate();
    }

    pub fn update_external_clock(&self, pts: f64, serial: i32) {
        self.external_clock.set(pts, serial);
        self.external_clock.calibrate();
    }

    /// Reset all clocks and drift statistics. Run on seek, reopen, and
    /// realtime resume.
    pub fn reset_clocks(&self) {
        self.audio_clock.reset();
        self.video_clock.reset();
        self.external_clock.reset();

        self.smoothed_video_drift.store(0.0);
        self.smoothed_audio_drift.store(0.0);
        self.dropped_frames.store(0, Ordering::Release);
        self.duplicated_frames.store(0, Ordering::Release);
        self.quality_counter.store(0, Ordering::Release);
        self.good_sync_count.store(0, Ordering::Release);
        self.poor_sync_count.store(0, Ordering::Release);
        self.total_drift.store(0.0);
        self.avg_drift.store(0.0);
        self.peak_drift.store(0.0);
    }

    pub fn master_clock(&self) -> f64 {
        match self.master() {
            MasterClock::Audio => self.audio_clock.get(),
            MasterClock::Video => self.video_clock.get(),
            MasterClock::External => self.external_clock.get(),
        }
    }

    pub fn audio_clock(&self) -> &Clock {
        &self.audio_clock
    }

    pub fn video_clock(&self) -> &Clock {
        &self.video_clock
    }

    pub fn external_clock(&self) -> &Clock {
        &self.external_clock
    }

    /// Per-frame display delay in milliseconds, or -1.0 when the caller
    /// must drop the frame. `base_delay` is the pacing delay in ms the
    /// decoder computed from the frame interval.
    pub fn compute_video_delay(
        &self,
        frame_pts: f64,
        frame_duration: f64,
        base_delay: f64,
        speed: f64,
    ) -> f64 {
        let master = self.master_clock();
        let diff = frame_pts - master;

        let prev = self.smoothed_video_drift.load();
        let drift = smooth_ema(self.alpha.load(), prev, diff, speed, 0.1);
        self.smoothed_video_drift.store(drift);

        let threshold = if self.adaptive_sync.load(Ordering::Acquire) {
            self.compute_adaptive_threshold()
        } else {
            self.sync_threshold.load()
        } / speed;

        self.update_sync_quality(drift.abs());

        if drift < -threshold && self.should_drop_frame(frame_duration, threshold) {
            self.dropped_frames.fetch_add(1, Ordering::AcqRel);
            log::debug!(
                "dropping frame, drift {:.3}ms, threshold {:.3}ms",
                drift * 1000.0,
                threshold * 1000.0
            );
            return -1.0;
        }

        let mut delay = base_delay;
        if drift.abs() > threshold {
            if drift > 0.0 {
                // Frame is ahead of the master; hold it longer.
                delay += drift * 1000.0 / speed;
            } else {
                // Behind; shave the delay, more aggressively at speed.
                let factor = (0.5 * speed).min(1.0);
                delay = (delay + drift * 1000.0 * factor).max(0.0);
            }

            if drift > threshold && self.should_duplicate_frame(frame_duration, threshold) {
                self.duplicated_frames.fetch_add(1, Ordering::AcqRel);
            }
        }

        let prev_avg = self.avg_video_delay.load();
        self.avg_video_delay.store(prev_avg * 0.95 + delay * 0.05);

        delay.max(0.0)
    }

    /// Audio pacing keeps the base delay; the drift EMA is maintained
    /// for statistics only.
    pub fn compute_audio_delay(&self, frame_pts: f64, base_delay: f64, speed: f64) -> f64 {
        let master = self.master_clock();
        let diff = frame_pts - master;

        let prev = self.smoothed_audio_drift.load();
        let drift = smooth_ema(self.alpha.load(), prev, diff, speed, 0.1);
        self.smoothed_audio_drift.store(drift);

        let prev_avg = self.avg_audio_delay.load();
        self.avg_audio_delay.store(prev_avg * 0.95 + base_delay * 0.05);

        base_delay.max(0.0)
    }

    fn should_drop_frame(&self, frame_duration: f64, threshold: f64) -> bool {
        let drift = self.smoothed_video_drift.load();
        let speed = self.video_clock.speed();
        drift < -threshold * 3.0 && frame_duration < 0.033 / speed
    }

    fn should_duplicate_frame(&self, frame_duration: f64, threshold: f64) -> bool {
        let drift = self.smoothed_video_drift.load();
        let speed = self.video_clock.speed();
        drift > threshold * 3.0 && frame_duration > 0.020 / speed
    }

    fn compute_adaptive_threshold(&self) -> f64 {
        let video = self.smoothed_video_drift.load().abs();
        let audio = self.smoothed_audio_drift.load().abs();
        let avg = (video + audio) / 2.0;
        let base = self.sync_threshold.load();
        (base + avg * 0.5).clamp(MIN_SYNC_THRESHOLD, MAX_SYNC_THRESHOLD)
    }

    fn update_sync_quality(&self, drift: f64) {
        let count = self.quality_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.sync_threshold.load();

        self.total_drift.fetch_add(drift);
        self.peak_drift.fetch_max(drift);
        self.avg_drift.store(self.total_drift.load() / count as f64);

        if drift <= threshold {
            self.good_sync_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.poor_sync_count.fetch_add(1, Ordering::AcqRel);
            if drift > threshold * 3.0 {
                log::warn!(
                    "severe sync drift: {:.3}ms (threshold {:.3}ms)",
                    drift * 1000.0,
                    threshold * 1000.0
                );
            }
        }

        if count % QUALITY_REPORT_INTERVAL == 0 {
            let good_rate =
                self.good_sync_count.load(Ordering::Acquire) as f64 / count as f64 * 100.0;
            log::info!(
                "sync quality: total {}, good {:.1}%, avg drift {:.3}ms, max drift {:.3}ms",
                count,
                good_rate,
                self.avg_drift.load() * 1000.0,
                self.peak_drift.load() * 1000.0
            );
        }
    }

    pub fn sync_state(&self) -> SyncState {
        let video = self.smoothed_video_drift.load().abs();
        let audio = self.smoothed_audio_drift.load().abs();
        self.evaluate_sync_state(video.max(audio))
    }

    fn evaluate_sync_state(&self, drift: f64) -> SyncState {
        let threshold = self.sync_threshold.load();
        if drift < threshold {
            SyncState::InSync
        } else if drift < threshold * 3.0 {
            SyncState::SlightDrift
        } else {
            SyncState::OutOfSync
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            state: self.sync_state(),
            video_drift: self.smoothed_video_drift.load(),
            audio_drift: self.smoothed_audio_drift.load(),
            master_clock: self.master_clock(),
            dropped_frames: self.dropped_frames.load(Ordering::Acquire),
            duplicated_frames: self.duplicated_frames.load(Ordering::Acquire),
            avg_delay_ms: (self.avg_video_delay.load() + self.avg_audio_delay.load()) / 2.0,
        }
    }

    pub fn quality_stats(&self) -> SyncQualityStats {
        let total = self.quality_counter.load(Ordering::Acquire);
        let good = self.good_sync_count.load(Ordering::Acquire);
        let poor = self.poor_sync_count.load(Ordering::Acquire);
        SyncQualityStats {
            total_sync_count: total,
            good_sync_count: good,
            poor_sync_count: poor,
            good_sync_rate: if total > 0 {
                good as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_drift: self.avg_drift.load(),
            max_drift: self.peak_drift.load(),
        }
    }
}

impl Default for StreamSyncManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_selection_routes_get() {
        let sync = StreamSyncManager::new();
        sync.update_audio_clock(1.0, 0);
        sync.update_video_clock(2.0, 0);
        sync.update_external_clock(3.0, 0);

        sync.set_master(MasterClock::Audio);
        assert!((sync.master_clock() - 1.0).abs() < 0.1);
        sync.set_master(MasterClock::Video);
        assert!((sync.master_clock() - 2.0).abs() < 0.1);
        sync.set_master(MasterClock::External);
        assert!((sync.master_clock() - 3.0).abs() < 0.1);
    }

    #[test]
    fn ema_is_clamped_and_direction_aware() {
        // Huge jump is limited to max_change * speed_factor.
        let stepped = smooth_ema(0.5, 0.0, 10.0, 1.0, 0.1);
        assert!(stepped <= 0.1 * 0.5 + 1e-9, "step too large: {stepped}");

        // Direction change doubles both alpha and the change bound.
        let flipped = smooth_ema(0.5, 0.05, -10.0, 1.0, 0.1);
        assert!(flipped < stepped);

        // Accumulator is bounded regardless of input.
        let mut v = 0.0;
        for _ in 0..1000 {
            v = smooth_ema(0.9, v, 100.0, 8.0, 0.1);
        }
        assert!(v <= 0.2 * 4.0 + 1e-9);
    }

    #[test]
    fn in_sync_frame_keeps_base_delay() {
        let sync = StreamSyncManager::new();
        sync.set_master(MasterClock::External);
        sync.update_external_clock(10.0, 0);

        // Frame pts equal to master: no adjustment beyond base delay.
        let delay = sync.compute_video_delay(10.0, 0.040, 40.0, 1.0);
        assert!((delay - 40.0).abs() < 5.0, "unexpected delay {delay}");
    }

    #[test]
    fn far_behind_short_frame_is_dropped() {
        let sync = StreamSyncManager::new();
        sync.set_master(MasterClock::External);
        sync.update_external_clock(20.0, 0);

        // Repeated frames a second behind the master build negative
        // drift until the drop rule fires (duration < 33ms).
        let mut dropped = false;
        for _ in 0..200 {
            if sync.compute_video_delay(19.0, 0.010, 10.0, 1.0) < 0.0 {
                dropped = true;
                break;
            }
        }
        assert!(dropped, "drop never triggered");
        assert!(sync.stats().dropped_frames >= 1);
    }

    #[test]
    fn far_ahead_long_frame_marks_duplicate() {
        let sync = StreamSyncManager::new();
        sync.set_master(MasterClock::External);
        sync.update_external_clock(0.0, 0);

        for _ in 0..200 {
            sync.compute_video_delay(1.0, 0.040, 40.0, 1.0);
        }
        assert!(sync.stats().duplicated_frames >= 1);
    }

    #[test]
    fn audio_delay_keeps_base_and_tracks_drift() {
        let sync = StreamSyncManager::new();
        sync.set_master(MasterClock::External);
        sync.update_external_clock(5.0, 0);

        let delay = sync.compute_audio_delay(5.2, 23.0, 1.0);
        assert_eq!(delay, 23.0);
        assert!(sync.stats().audio_drift > 0.0);
    }

    #[test]
    fn reset_clears_statistics() {
        let sync = StreamSyncManager::new();
        sync.set_master(MasterClock::External);
        sync.update_external_clock(20.0, 0);
        for _ in 0..50 {
            sync.compute_video_delay(19.0, 0.010, 10.0, 1.0);
        }
        sync.reset_clocks();
        let stats = sync.stats();
        assert_eq!(stats.dropped_frames, 0);
        assert_eq!(stats.video_drift, 0.0);
        let quality = sync.quality_stats();
        assert_eq!(quality.total_sync_count, 0);
    }

    #[test]
    fn threshold_is_clamped_to_band() {
        let sync = StreamSyncManager::new();
        sync.set_sync_threshold(1.0);
        // Way-out-of-band request lands on the max; a 40ms-late frame
        // with a 50ms threshold stays within it and keeps base delay.
        sync.update_external_clock(0.0, 0);
        sync.set_master(MasterClock::External);
        let delay = sync.compute_video_delay(0.040, 0.040, 40.0, 1.0);
        assert!(delay > 0.0);
    }
}

// ptpsyncd — Clock Servo
// Distributed under the MIT software license.

//! Converts timestamp quadruples into clock adjustments.
//!
//! Per sample: smallest-delay selection, Peirce outlier rejection, FIR
//! smoothing, then either a step (policy permitting) or a PID-driven slew
//! clamped to the clock's slew range.

pub mod filter;
pub mod pid;

pub use filter::{FilterSample, FirFilter, PeirceFilter, SmallestDelayFilter};
pub use pid::PidController;

use crate::clock::Clock;
use crate::config::{ClockCtrlPolicy, Config};
use crate::error::ClockError;
use crate::types::{log_interval_to_secs, TimeInterval, Timestamp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The four-timestamp exchange. Slots are nullable and the correction
/// arithmetic is applied as each slot is filled:
/// t1 and t3 carry corrections added on the origin side, t2 and t4 have the
/// received header corrections subtracted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampSet {
    t1: Option<Timestamp>,
    t2: Option<Timestamp>,
    t3: Option<Timestamp>,
    t4: Option<Timestamp>,
}

impl TimestampSet {
    /// Master origin (Sync originTimestamp or Follow_Up precise origin),
    /// plus the accumulated correction field.
    pub fn set_t1(&mut self, origin: Timestamp, correction: TimeInterval) {
        self.t1 = Some(origin.apply(correction));
    }

    /// Slave ingress of Sync; the Sync header correction is subtracted.
    pub fn set_t2(&mut self, rx: Timestamp, sync_correction: TimeInterval) {
        self.t2 = Some(rx.apply(-sync_correction));
    }

    /// Slave egress of Delay_Req.
    pub fn set_t3(&mut self, tx: Timestamp) {
        self.t3 = Some(tx);
    }

    /// Master receipt from Delay_Resp; its header correction is subtracted.
    pub fn set_t4(&mut self, receive: Timestamp, resp_correction: TimeInterval) {
        self.t4 = Some(receive.apply(-resp_correction));
    }

    pub fn has_m2s(&self) -> bool {
        self.t1.is_some() && self.t2.is_some()
    }

    pub fn has_s2m(&self) -> bool {
        self.t3.is_some() && self.t4.is_some()
    }

    pub fn complete(&self) -> bool {
        self.has_m2s() && self.has_s2m()
    }

    /// Drop the slave-to-master half (after a Delay_Req is reissued).
    pub fn clear_s2m(&mut self) {
        self.t3 = None;
        self.t4 = None;
    }

    /// Invalidate everything: on clock step, master change or missing
    /// timestamps.
    pub fn clear(&mut self) {
        *self = TimestampSet::default();
    }

    /// `(offset_from_master, mean_path_delay)` in nanoseconds, only for
    /// complete sets.
    pub fn offset_and_delay(&self) -> Option<(f64, f64)> {
        let (t1, t2, t3, t4) = (self.t1?, self.t2?, self.t3?, self.t4?);
        let m2s = t2.delta_nanos_f64(t1);
        let s2m = t4.delta_nanos_f64(t3);
        Some(((m2s - s2m) / 2.0, (m2s + s2m) / 2.0))
    }

    /// Raw master-to-slave delta `t2 - t1`, used with an externally measured
    /// peer delay.
    pub fn m2s_delta_nanos(&self) -> Option<f64> {
        Some(self.t2?.delta_nanos_f64(self.t1?))
    }
}

/// Decides whether an offset is consistent with sibling slaves. Owned by
/// the orchestration layer; the default accepts everything.
pub type ClusteringEvaluator = Box<dyn Fn(f64, &dyn Clock) -> bool + Send>;

/// What one servo update did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoOutcome {
    /// Clock stepped by this many nanoseconds.
    Stepped(f64),
    /// Frequency adjustment applied, in ppb.
    Slewed(f64),
    /// Offset at or past the step threshold but policy forbade stepping;
    /// adjustment saturated at the slew limit.
    SaturatedSlew(f64),
    RejectedOutlier,
    RejectedClustering,
    /// Policy is observe-only.
    Observed,
}

pub struct Servo {
    clock: Arc<dyn Clock>,
    delay_filter: SmallestDelayFilter,
    outlier_filter: PeirceFilter,
    fir: FirFilter,
    pid: PidController,
    policy: ClockCtrlPolicy,
    step_threshold_ns: f64,
    max_freq_adj_ppb: f64,
    clock_first_updated: bool,
    first_lock_seen: bool,
    clustering: Option<ClusteringEvaluator>,
    pub last_offset_ns: Option<f64>,
    pub last_mean_path_delay_ns: Option<f64>,
    pub steps_taken: u64,
    pub samples: u64,
}

impl Servo {
    pub fn new(clock: Arc<dyn Clock>, config: &Config, saved_correction_ppb: f64) -> Self {
        let max_freq_adj_ppb = clock.max_frequency_adjustment();
        let mut pid = PidController::new(
            config.servo_kp,
            config.servo_ki,
            config.servo_kd,
            log_interval_to_secs(config.sync_interval_log2),
            max_freq_adj_ppb,
        );
        pid.reset(saved_correction_ppb);
        Servo {
            clock,
            delay_filter: SmallestDelayFilter::new(
                config.path_delay_filter_size,
                config.path_delay_filter_ageing,
                Duration::from_secs_f64(config.path_delay_filter_timeout_secs),
            ),
            outlier_filter: PeirceFilter::new(config.outlier_filter_size),
            fir: FirFilter::new(config.fir_filter_size),
            pid,
            policy: config.clock_ctrl_policy,
            step_threshold_ns: config.step_threshold_ns,
            max_freq_adj_ppb,
            clock_first_updated: false,
            first_lock_seen: false,
            clustering: None,
            last_offset_ns: None,
            last_mean_path_delay_ns: None,
            steps_taken: 0,
            samples: 0,
        }
    }

    pub fn set_clustering_evaluator(&mut self, evaluator: ClusteringEvaluator) {
        self.clustering = Some(evaluator);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Correction to persist across restarts.
    pub fn correction_ppb(&self) -> f64 {
        self.pid.correction_ppb()
    }

    pub fn outliers_rejected(&self) -> u64 {
        self.outlier_filter.rejected
    }

    /// The servo sample period follows the master's sync interval.
    pub fn set_sync_interval(&mut self, log2: i8) {
        self.pid.set_period(log_interval_to_secs(log2));
    }

    /// Clear filter and controller state, keeping the accumulated frequency
    /// correction. Called on master change and after a step.
    pub fn reset(&mut self) {
        let correction = self.pid.correction_ppb();
        self.delay_filter.reset();
        self.outlier_filter.reset();
        self.fir.reset();
        self.pid.reset(correction);
        self.last_offset_ns = None;
        self.last_mean_path_delay_ns = None;
    }

    /// Feed one completed timestamp set. The caller invalidates the set
    /// afterwards if the outcome is `Stepped`.
    pub fn update(&mut self, set: &TimestampSet, now: Instant) -> Result<ServoOutcome, ClockError> {
        let Some((offset_ns, path_delay_ns)) = set.offset_and_delay() else {
            debug!("servo fed incomplete timestamp set");
            return Ok(ServoOutcome::Observed);
        };
        self.update_sample(offset_ns, path_delay_ns, now)
    }

    /// Feed one `(offset, path delay)` measurement. The peer-delay path
    /// computes the pair itself; the E2E path goes through `update`.
    pub fn update_sample(
        &mut self,
        offset_ns: f64,
        path_delay_ns: f64,
        now: Instant,
    ) -> Result<ServoOutcome, ClockError> {
        self.samples += 1;

        let filtered = self.delay_filter.update(offset_ns, path_delay_ns, now);

        if self.outlier_filter.update(filtered.offset_ns) {
            debug!(
                "offset {:.1} ns rejected as outlier (rejected so far: {})",
                filtered.offset_ns, self.outlier_filter.rejected
            );
            return Ok(ServoOutcome::RejectedOutlier);
        }

        let smoothed = self.fir.update(filtered.offset_ns);

        if let Some(evaluator) = &self.clustering
            && !evaluator(smoothed, self.clock.as_ref())
        {
            return Ok(ServoOutcome::RejectedClustering);
        }

        self.last_offset_ns = Some(smoothed);
        self.last_mean_path_delay_ns = Some(filtered.path_delay_ns);

        if smoothed.abs() < self.step_threshold_ns {
            self.first_lock_seen = true;
        }

        if self.policy == ClockCtrlPolicy::NoAdjust {
            return Ok(ServoOutcome::Observed);
        }

        if smoothed.abs() >= self.step_threshold_ns && self.may_step(smoothed) {
            let delta = -smoothed;
            self.clock.adjust_time(delta)?;
            info!("stepped {} by {:.0} ns", self.clock.name(), delta);
            self.steps_taken += 1;
            self.clock_first_updated = true;
            self.reset();
            return Ok(ServoOutcome::Stepped(delta));
        }

        let adjustment = self.pid.update(smoothed);
        if adjustment == 0.0 {
            // Nothing to correct: leave the clock untouched.
            return Ok(ServoOutcome::Slewed(0.0));
        }
        self.clock.adjust_frequency(adjustment)?;
        self.clock_first_updated = true;

        if adjustment.abs() >= self.max_freq_adj_ppb {
            warn!(
                "offset {:.0} ns beyond slew authority, frequency saturated at {:.0} ppb",
                smoothed, adjustment
            );
            Ok(ServoOutcome::SaturatedSlew(adjustment))
        } else {
            Ok(ServoOutcome::Slewed(adjustment))
        }
    }

    fn may_step(&self, offset_ns: f64) -> bool {
        match self.policy {
            ClockCtrlPolicy::SlewOnly | ClockCtrlPolicy::NoAdjust => false,
            ClockCtrlPolicy::SlewAndStep => true,
            ClockCtrlPolicy::StepAtStartup => !self.clock_first_updated,
            ClockCtrlPolicy::StepOnFirstLock => !self.first_lock_seen,
            // The clock may only move forward: correcting a negative offset
            // steps forward by -offset.
            ClockCtrlPolicy::StepForward => offset_ns < 0.0,
        }
    }
}

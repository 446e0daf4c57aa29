//! Discrete PID controller over offset-from-master.
//!
//! Output is a frequency adjustment in parts-per-billion; the integral term
//! doubles as the remembered frequency correction and is bounded by the
//! clock's maximum adjustment so it can never wind up past what the clock
//! can express.

#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    /// Sample period in seconds, `2^logSyncInterval`.
    period: f64,
    /// Bound on both the integral term and the final output, in ppb.
    max_output: f64,
    integral: f64,
    last_error: Option<f64>,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, period_secs: f64, max_output: f64) -> Self {
        PidController {
            kp,
            ki,
            kd,
            period: period_secs.max(f64::MIN_POSITIVE),
            max_output,
            integral: 0.0,
            last_error: None,
        }
    }

    /// Reset to a known frequency correction (saved across restarts, or the
    /// value in force when the clock was stepped).
    pub fn reset(&mut self, correction_ppb: f64) {
        self.integral = correction_ppb.clamp(-self.max_output, self.max_output);
        self.last_error = None;
    }

    /// The accumulated correction, persisted across restarts.
    pub fn correction_ppb(&self) -> f64 {
        self.integral
    }

    pub fn set_period(&mut self, period_secs: f64) {
        self.period = period_secs.max(f64::MIN_POSITIVE);
    }

    /// One control step. `error_ns` is the smoothed offset from master.
    pub fn update(&mut self, error_ns: f64) -> f64 {
        self.integral = (self.integral + self.ki * error_ns * self.period)
            .clamp(-self.max_output, self.max_output);

        let derivative = match self.last_error {
            Some(last) => (error_ns - last) / self.period,
            None => 0.0,
        };
        self.last_error = Some(error_ns);

        (self.kp * error_ns + self.integral + self.kd * derivative)
            .clamp(-self.max_output, self.max_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_clamped_for_unbounded_offsets() {
        let mut pid = PidController::new(0.4, 0.03, 0.0, 1.0, 100_000.0);
        let out = pid.update(1e15);
        assert_eq!(out, 100_000.0);
        let out = pid.update(-1e15);
        assert_eq!(out, -100_000.0);
    }

    #[test]
    fn integral_bounded() {
        let mut pid = PidController::new(0.0, 1.0, 0.0, 1.0, 1000.0);
        for _ in 0..100 {
            pid.update(1e9);
        }
        assert_eq!(pid.correction_ppb(), 1000.0);
    }

    #[test]
    fn zero_error_holds_saved_correction() {
        let mut pid = PidController::new(0.4, 0.03, 0.1, 1.0, 100_000.0);
        pid.reset(500.0);
        let out = pid.update(0.0);
        assert_eq!(out, 500.0);
        assert_eq!(pid.correction_ppb(), 500.0);
    }

    #[test]
    fn proportional_term_scales_error() {
        let mut pid = PidController::new(0.5, 0.0, 0.0, 1.0, 100_000.0);
        assert_eq!(pid.update(100.0), 50.0);
    }

    #[test]
    fn derivative_uses_previous_error() {
        let mut pid = PidController::new(0.0, 0.0, 1.0, 0.5, 100_000.0);
        assert_eq!(pid.update(10.0), 0.0); // no history yet
        assert_eq!(pid.update(20.0), 20.0); // (20-10)/0.5
    }

    #[test]
    fn reset_clears_derivative_history() {
        let mut pid = PidController::new(0.0, 0.0, 1.0, 1.0, 100_000.0);
        pid.update(10.0);
        pid.reset(0.0);
        assert_eq!(pid.update(50.0), 0.0);
    }
}

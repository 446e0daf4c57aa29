//! Servo policy scenarios.

use ptpsyncd::clock::{Clock, FakeClock};
use ptpsyncd::config::{ClockCtrlPolicy, Config};
use ptpsyncd::servo::{Servo, ServoOutcome, TimestampSet};
use ptpsyncd::types::{TimeInterval, Timestamp};
use std::sync::Arc;
use std::time::Instant;

fn config(policy: ClockCtrlPolicy) -> Config {
    Config {
        interface: "eth0".into(),
        clock_ctrl_policy: policy,
        fir_filter_size: 1,
        path_delay_filter_size: 4,
        outlier_filter_size: 16,
        ..Config::default()
    }
}

/// Build a complete set with the slave ahead of the master by `offset_ns`
/// over a symmetric `delay_ns` path.
fn quadruple_scaled(offset_ns: i64, delay_ns: i64) -> TimestampSet {
    let mut set = TimestampSet::default();
    let t1 = Timestamp::from_secs_nanos(500, 0);
    set.set_t1(t1, TimeInterval::ZERO);
    set.set_t2(
        Timestamp::from_scaled_ns(t1.scaled_ns() + ((delay_ns + offset_ns) as i128) * 65536),
        TimeInterval::ZERO,
    );
    let t3 = Timestamp::from_secs_nanos(500, 800_000);
    set.set_t3(t3);
    set.set_t4(
        Timestamp::from_scaled_ns(t3.scaled_ns() + ((delay_ns - offset_ns) as i128) * 65536),
        TimeInterval::ZERO,
    );
    set
}

#[test]
fn test_250ms_offset_slews_saturated_without_step() {
    // Scenario: +250 ms offset, SLEW_AND_STEP, 1 s threshold. No step; the
    // frequency pins at the slew limit.
    let clock = Arc::new(FakeClock::new());
    let mut servo = Servo::new(clock.clone(), &config(ClockCtrlPolicy::SlewAndStep), 0.0);

    let out = servo.update(&quadruple_scaled(250_000_000, 1000), Instant::now()).unwrap();
    match out {
        ServoOutcome::SaturatedSlew(adj) => {
            assert_eq!(adj, clock.max_frequency_adjustment());
        }
        other => panic!("expected saturation, got {:?}", other),
    }
    assert!(clock.steps().is_empty());

    // Still saturated while the offset decays toward the slew authority.
    let out = servo.update(&quadruple_scaled(100_000_000, 1000), Instant::now()).unwrap();
    assert!(matches!(out, ServoOutcome::SaturatedSlew(_)));
}

#[test]
fn test_step_at_startup_steps_exactly_once() {
    // Scenario: +2 s offset under STEP_AT_STARTUP. First update steps and
    // resets the controller; the same offset later only slews.
    let clock = Arc::new(FakeClock::new());
    let mut servo = Servo::new(clock.clone(), &config(ClockCtrlPolicy::StepAtStartup), 0.0);

    let out = servo.update(&quadruple_scaled(2_000_000_000, 1000), Instant::now()).unwrap();
    match out {
        ServoOutcome::Stepped(delta) => assert!((delta + 2e9).abs() < 1.0),
        other => panic!("expected step, got {:?}", other),
    }
    assert_eq!(servo.steps_taken, 1);
    assert_eq!(clock.steps().len(), 1);

    let out = servo.update(&quadruple_scaled(2_000_000_000, 1000), Instant::now()).unwrap();
    assert!(matches!(out, ServoOutcome::SaturatedSlew(_)));
    assert_eq!(clock.steps().len(), 1);
    assert_eq!(servo.steps_taken, 1);
}

#[test]
fn test_zero_offset_is_a_no_op_beyond_counters() {
    let clock = Arc::new(FakeClock::new());
    let mut servo = Servo::new(clock.clone(), &config(ClockCtrlPolicy::SlewAndStep), 0.0);

    let before = servo.steps_taken;
    servo.update(&quadruple_scaled(0, 1000), Instant::now()).unwrap();
    assert_eq!(servo.samples, 1);
    assert_eq!(servo.steps_taken, before);
    assert!(clock.steps().is_empty());
    assert_eq!(clock.last_freq_ppb(), 0.0);
}

#[test]
fn test_pid_output_clamped_for_any_offset() {
    let clock = Arc::new(FakeClock::new());
    let mut servo = Servo::new(clock.clone(), &config(ClockCtrlPolicy::SlewOnly), 0.0);
    let limit = clock.max_frequency_adjustment();

    for magnitude in [1_000i64, 1_000_000, 1_000_000_000, 1_000_000_000_000] {
        for sign in [1i64, -1] {
            servo
                .update_sample((sign * magnitude) as f64, 1000.0, Instant::now())
                .unwrap();
            assert!(
                clock.last_freq_ppb().abs() <= limit,
                "offset {} produced {}",
                sign * magnitude,
                clock.last_freq_ppb()
            );
        }
    }
}

#[test]
fn test_persisted_correction_seeds_the_integrator() {
    let clock = Arc::new(FakeClock::new());
    let servo = Servo::new(clock, &config(ClockCtrlPolicy::SlewAndStep), -420.0);
    assert_eq!(servo.correction_ppb(), -420.0);
}

#[test]
fn test_incomplete_set_is_observed_only() {
    let clock = Arc::new(FakeClock::new());
    let mut servo = Servo::new(clock.clone(), &config(ClockCtrlPolicy::SlewAndStep), 0.0);
    let mut set = TimestampSet::default();
    set.set_t1(Timestamp::from_secs_nanos(1, 0), TimeInterval::ZERO);
    let out = servo.update(&set, Instant::now()).unwrap();
    assert_eq!(out, ServoOutcome::Observed);
    assert_eq!(servo.samples, 0);
    assert!(clock.freq_writes().is_empty());
}

#[test]
fn test_set_invalidation_clears_all_slots() {
    let mut set = quadruple_scaled(100, 1000);
    assert!(set.complete());
    set.clear();
    assert!(!set.complete());
    assert!(set.offset_and_delay().is_none());
}

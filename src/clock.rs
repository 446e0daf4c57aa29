// ptpsyncd — Clock Abstraction
// Distributed under the MIT software license.

//! Disciplined clocks and the shared clock registry.
//!
//! The servo treats every clock polymorphically through `Clock`. Two real
//! implementations exist: the system realtime clock and PTP hardware clocks
//! exposed as `/dev/ptp*`. `FakeClock` backs tests and observe-only runs.
//!
//! Sign convention: `adjust_frequency(ppb)` receives the measured frequency
//! error of the local clock; implementations slew in the opposite direction
//! (the negation happens at the `clock_adjtime` boundary).

use crate::error::ClockError;
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Slew range of the system clock, in ppb (kernel limit is 500 ppm).
const SYSTEM_MAX_FREQ_ADJ_PPB: f64 = 500_000.0;

/// Conservative default slew range for PHCs that do not report capabilities.
const PHC_DEFAULT_MAX_FREQ_ADJ_PPB: f64 = 100_000.0;

/// Consecutive good compares required before a compare failure is worth a
/// warning again (suppresses noise from sporadic EAGAIN-class failures).
pub const CLOCK_BAD_COMPARE_WARN_THRESHOLD: u32 = 10;

pub trait Clock: Send + Sync {
    fn name(&self) -> &str;

    fn get_time(&self) -> Result<Timestamp, ClockError>;

    /// Step by `delta_ns` (positive moves the clock forward).
    fn adjust_time(&self, delta_ns: f64) -> Result<(), ClockError>;

    /// Discipline the frequency; `ppb` is the error being corrected.
    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError>;

    /// Advertise lock state to hardware that consumes it. Clocks without
    /// the capability accept and ignore the call.
    fn set_sync_status(&self, in_sync: bool, timeout: Duration) -> Result<(), ClockError>;

    fn has_sync_status(&self) -> bool {
        false
    }

    fn max_frequency_adjustment(&self) -> f64;

    /// Difference `self - other` in nanoseconds, from back-to-back reads.
    fn compare_to(&self, other: &dyn Clock) -> Result<f64, ClockError> {
        let a = self.get_time()?;
        let b = other.get_time()?;
        Ok(a.delta_nanos_f64(b))
    }
}

fn errno_io() -> std::io::Error {
    std::io::Error::last_os_error()
}

fn clock_gettime(clockid: libc::clockid_t) -> Result<Timestamp, ClockError> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(clockid, &mut ts) };
    if rc != 0 {
        return Err(ClockError::GetTime(errno_io()));
    }
    Ok(Timestamp::from_secs_nanos(ts.tv_sec as u64, ts.tv_nsec as u32))
}

fn adjtime_step(clockid: libc::clockid_t, delta_ns: f64) -> Result<(), ClockError> {
    let total = delta_ns as i64;
    let mut sec = total / 1_000_000_000;
    let mut nsec = total % 1_000_000_000;
    // ADJ_SETOFFSET requires the nanosecond part in [0, 1e9).
    if nsec < 0 {
        sec -= 1;
        nsec += 1_000_000_000;
    }
    let mut tx: libc::timex = unsafe { std::mem::zeroed() };
    tx.modes = libc::ADJ_SETOFFSET | libc::ADJ_NANO;
    tx.time.tv_sec = sec;
    tx.time.tv_usec = nsec;
    let rc = unsafe { libc::clock_adjtime(clockid, &mut tx) };
    if rc < 0 {
        return Err(ClockError::Adjust(errno_io()));
    }
    Ok(())
}

fn adjtime_freq(clockid: libc::clockid_t, ppb: f64) -> Result<(), ClockError> {
    let mut tx: libc::timex = unsafe { std::mem::zeroed() };
    tx.modes = libc::ADJ_FREQUENCY;
    // timex.freq is scaled ppm (2^-16); slew against the measured error.
    tx.freq = (-ppb * 65.536) as libc::c_long;
    let rc = unsafe { libc::clock_adjtime(clockid, &mut tx) };
    if rc < 0 {
        return Err(ClockError::Adjust(errno_io()));
    }
    Ok(())
}

/// CLOCK_REALTIME behind the `Clock` trait.
#[derive(Debug)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn name(&self) -> &str {
        "system"
    }

    fn get_time(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(libc::CLOCK_REALTIME)
    }

    fn adjust_time(&self, delta_ns: f64) -> Result<(), ClockError> {
        adjtime_step(libc::CLOCK_REALTIME, delta_ns)
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError> {
        adjtime_freq(libc::CLOCK_REALTIME, ppb)
    }

    fn set_sync_status(&self, _in_sync: bool, _timeout: Duration) -> Result<(), ClockError> {
        Ok(())
    }

    fn max_frequency_adjustment(&self) -> f64 {
        SYSTEM_MAX_FREQ_ADJ_PPB
    }
}

/// A PTP hardware clock opened from `/dev/ptp*`. The fd-derived dynamic
/// clockid follows the kernel's FD_TO_CLOCKID mapping.
pub struct PhcClock {
    device: String,
    file: fs::File,
    max_freq_adj_ppb: f64,
}

impl PhcClock {
    pub fn open(device: &str) -> Result<Self, ClockError> {
        let file = fs::OpenOptions::new().read(true).write(true).open(device).map_err(
            |source| ClockError::Open { device: device.to_string(), source },
        )?;
        Ok(PhcClock {
            device: device.to_string(),
            file,
            max_freq_adj_ppb: PHC_DEFAULT_MAX_FREQ_ADJ_PPB,
        })
    }

    fn clockid(&self) -> libc::clockid_t {
        // FD_TO_CLOCKID: ((~fd) << 3) | 3
        ((!(self.file.as_raw_fd() as libc::clockid_t)) << 3) | 3
    }
}

impl Clock for PhcClock {
    fn name(&self) -> &str {
        &self.device
    }

    fn get_time(&self) -> Result<Timestamp, ClockError> {
        clock_gettime(self.clockid())
    }

    fn adjust_time(&self, delta_ns: f64) -> Result<(), ClockError> {
        adjtime_step(self.clockid(), delta_ns)
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError> {
        adjtime_freq(self.clockid(), ppb)
    }

    fn set_sync_status(&self, _in_sync: bool, _timeout: Duration) -> Result<(), ClockError> {
        // Pushing lock state down to the NIC needs a vendor ioctl; without
        // one this is accepted and ignored (capability stays false).
        Ok(())
    }

    fn max_frequency_adjustment(&self) -> f64 {
        self.max_freq_adj_ppb
    }
}

/// In-memory clock for tests and `NoAdjust` dry runs. Records every step
/// and frequency write.
#[derive(Debug, Default)]
pub struct FakeClock {
    state: Mutex<FakeClockState>,
}

#[derive(Debug, Default)]
struct FakeClockState {
    time_ns: i128,
    freq_ppb: f64,
    steps: Vec<f64>,
    freq_writes: Vec<f64>,
    in_sync: Option<bool>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock::default()
    }

    pub fn set_time_ns(&self, ns: i128) {
        self.state.lock().time_ns = ns;
    }

    pub fn steps(&self) -> Vec<f64> {
        self.state.lock().steps.clone()
    }

    pub fn freq_writes(&self) -> Vec<f64> {
        self.state.lock().freq_writes.clone()
    }

    pub fn last_freq_ppb(&self) -> f64 {
        self.state.lock().freq_ppb
    }

    pub fn in_sync(&self) -> Option<bool> {
        self.state.lock().in_sync
    }
}

impl Clock for FakeClock {
    fn name(&self) -> &str {
        "fake"
    }

    fn get_time(&self) -> Result<Timestamp, ClockError> {
        let ns = self.state.lock().time_ns;
        Ok(Timestamp::from_scaled_ns(ns * crate::types::SCALED_NS_PER_NS as i128))
    }

    fn adjust_time(&self, delta_ns: f64) -> Result<(), ClockError> {
        let mut st = self.state.lock();
        st.time_ns += delta_ns as i128;
        st.steps.push(delta_ns);
        Ok(())
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError> {
        let mut st = self.state.lock();
        st.freq_ppb = ppb;
        st.freq_writes.push(ppb);
        Ok(())
    }

    fn set_sync_status(&self, in_sync: bool, _timeout: Duration) -> Result<(), ClockError> {
        self.state.lock().in_sync = Some(in_sync);
        Ok(())
    }

    fn has_sync_status(&self) -> bool {
        true
    }

    fn max_frequency_adjustment(&self) -> f64 {
        100_000.0
    }
}

/// Shared registry of disciplined clocks, keyed by a stable integer id.
/// The single mutex here is the hardware-state lock: held only around map
/// mutation and lookup, never across clock syscalls.
#[derive(Default)]
pub struct ClockRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    clocks: HashMap<u32, Arc<dyn Clock>>,
    next_id: u32,
}

impl ClockRegistry {
    pub fn new() -> Self {
        ClockRegistry::default()
    }

    pub fn register(&self, clock: Arc<dyn Clock>) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.clocks.insert(id, clock);
        id
    }

    pub fn get(&self, id: u32) -> Result<Arc<dyn Clock>, ClockError> {
        self.inner.lock().clocks.get(&id).cloned().ok_or(ClockError::UnknownClock(id))
    }

    /// Snapshot for off-lock iteration.
    pub fn snapshot(&self) -> Vec<(u32, Arc<dyn Clock>)> {
        self.inner.lock().clocks.iter().map(|(id, c)| (*id, c.clone())).collect()
    }
}

/// Persisted frequency correction, one file per clock under the state dir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedCorrection {
    pub ppb: f64,
    pub updated_unix: u64,
}

const MAX_CORRECTION_FILE_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct FrequencyStore {
    dir: PathBuf,
}

impl FrequencyStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FrequencyStore { dir: dir.as_ref().to_path_buf() }
    }

    fn path_for(&self, clock_name: &str) -> PathBuf {
        let safe: String = clock_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("freq-correction-{}.bin", safe))
    }

    pub fn load(&self, clock_name: &str) -> Option<SavedCorrection> {
        let path = self.path_for(clock_name);
        let meta = fs::metadata(&path).ok()?;
        if meta.len() > MAX_CORRECTION_FILE_SIZE {
            tracing::warn!("correction file {} oversized, ignoring", path.display());
            return None;
        }
        let data = fs::read(&path).ok()?;
        bincode::deserialize(&data).ok()
    }

    pub fn save(&self, clock_name: &str, correction: &SavedCorrection) -> Result<(), ClockError> {
        fs::create_dir_all(&self.dir).map_err(ClockError::Persistence)?;
        let data = bincode::serialize(correction)
            .map_err(|e| ClockError::Persistence(std::io::Error::other(e)))?;
        fs::write(self.path_for(clock_name), data).map_err(ClockError::Persistence)
    }
}

/// Tracks compare health to rate-limit warnings: after a failure, another
/// warning fires only once `CLOCK_BAD_COMPARE_WARN_THRESHOLD` consecutive
/// successes have been seen.
#[derive(Debug, Default)]
pub struct CompareMonitor {
    good_streak: u32,
    ever_failed: bool,
}

impl CompareMonitor {
    pub fn new() -> Self {
        CompareMonitor::default()
    }

    pub fn record_success(&mut self) {
        self.good_streak = self.good_streak.saturating_add(1);
    }

    /// Returns true when this failure deserves a warning.
    pub fn record_failure(&mut self) -> bool {
        let warn = !self.ever_failed || self.good_streak >= CLOCK_BAD_COMPARE_WARN_THRESHOLD;
        self.ever_failed = true;
        self.good_streak = 0;
        warn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_records_adjustments() {
        let clock = FakeClock::new();
        clock.adjust_time(1500.0).unwrap();
        clock.adjust_frequency(-250.0).unwrap();
        assert_eq!(clock.steps(), vec![1500.0]);
        assert_eq!(clock.last_freq_ppb(), -250.0);
        let t = clock.get_time().unwrap();
        assert!((t.as_nanos_f64() - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn registry_hands_out_stable_ids() {
        let registry = ClockRegistry::new();
        let a = registry.register(Arc::new(FakeClock::new()));
        let b = registry.register(Arc::new(FakeClock::new()));
        assert_ne!(a, b);
        assert!(registry.get(a).is_ok());
        assert!(matches!(registry.get(999), Err(ClockError::UnknownClock(999))));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn frequency_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ptpsyncd-test-{}", std::process::id()));
        let store = FrequencyStore::new(&dir);
        let saved = SavedCorrection { ppb: -123.5, updated_unix: 1_700_000_000 };
        store.save("eth0/phc0", &saved).unwrap();
        assert_eq!(store.load("eth0/phc0"), Some(saved));
        assert_eq!(store.load("missing"), None);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn compare_monitor_suppresses_noise() {
        let mut m = CompareMonitor::new();
        assert!(m.record_failure()); // first failure always warns
        assert!(!m.record_failure()); // repeated failure is quiet
        for _ in 0..CLOCK_BAD_COMPARE_WARN_THRESHOLD {
            m.record_success();
        }
        assert!(m.record_failure()); // healthy streak re-arms the warning
        m.record_success();
        assert!(!m.record_failure());
    }

    #[test]
    fn compare_uses_back_to_back_reads() {
        let a = FakeClock::new();
        let b = FakeClock::new();
        a.set_time_ns(2000);
        b.set_time_ns(500);
        assert_eq!(a.compare_to(&b).unwrap(), 1500.0);
    }
}

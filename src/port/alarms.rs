//! Latching per-port alarm bits.

use std::fmt;

pub const ALARM_NO_MASTER: u32 = 1 << 0;
pub const ALARM_NO_TX_TIMESTAMPS: u32 = 1 << 1;
pub const ALARM_NO_RX_TIMESTAMPS: u32 = 1 << 2;
pub const ALARM_NO_FOLLOWUPS: u32 = 1 << 3;
pub const ALARM_NO_DELAY_RESPS: u32 = 1 << 4;
pub const ALARM_CAPS_MISMATCH: u32 = 1 << 5;
pub const ALARM_CLOCK_CTRL_FAILURE: u32 = 1 << 6;
pub const ALARM_CLUSTERING_THRESHOLD_EXCEEDED: u32 = 1 << 7;

/// Alarm bits latch when raised and clear when the predicate recovers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmSet(u32);

impl AlarmSet {
    pub fn new() -> Self {
        AlarmSet(0)
    }

    /// Returns true if the alarm was newly raised.
    pub fn raise(&mut self, alarm: u32) -> bool {
        let newly = self.0 & alarm == 0;
        self.0 |= alarm;
        newly
    }

    /// Returns true if the alarm was set.
    pub fn clear(&mut self, alarm: u32) -> bool {
        let was = self.0 & alarm != 0;
        self.0 &= !alarm;
        was
    }

    pub fn test(&self, alarm: u32) -> bool {
        self.0 & alarm != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AlarmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "none");
        }
        let names = [
            (ALARM_NO_MASTER, "no-master"),
            (ALARM_NO_TX_TIMESTAMPS, "no-tx-timestamps"),
            (ALARM_NO_RX_TIMESTAMPS, "no-rx-timestamps"),
            (ALARM_NO_FOLLOWUPS, "no-followups"),
            (ALARM_NO_DELAY_RESPS, "no-delay-resps"),
            (ALARM_CAPS_MISMATCH, "caps-mismatch"),
            (ALARM_CLOCK_CTRL_FAILURE, "clock-ctrl-failure"),
            (ALARM_CLUSTERING_THRESHOLD_EXCEEDED, "clustering-threshold-exceeded"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_latching() {
        let mut alarms = AlarmSet::new();
        assert!(alarms.raise(ALARM_NO_MASTER));
        assert!(!alarms.raise(ALARM_NO_MASTER));
        assert!(alarms.test(ALARM_NO_MASTER));
    }

    #[test]
    fn clear_reports_prior_state() {
        let mut alarms = AlarmSet::new();
        alarms.raise(ALARM_NO_FOLLOWUPS);
        assert!(alarms.clear(ALARM_NO_FOLLOWUPS));
        assert!(!alarms.clear(ALARM_NO_FOLLOWUPS));
        assert!(!alarms.any());
    }

    #[test]
    fn display_names_set_bits() {
        let mut alarms = AlarmSet::new();
        alarms.raise(ALARM_NO_MASTER);
        alarms.raise(ALARM_CAPS_MISMATCH);
        assert_eq!(alarms.to_string(), "no-master,caps-mismatch");
        assert_eq!(AlarmSet::new().to_string(), "none");
    }
}

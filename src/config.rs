//! Port configuration.
//!
//! Loaded from a flat TOML file with CLI overrides on top. Every option has
//! an IEEE 1588 default so an empty file yields a working multicast slave.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Network transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Ipv4,
    Ipv6,
}

/// IPv6 primary-group scope (Annex E). Peer delay is always link-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ipv6Scope {
    #[default]
    LinkLocal,
    Global,
}

/// Path delay measurement mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayMechanism {
    #[default]
    E2e,
    P2p,
    Disabled,
}

/// What the servo is allowed to do to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockCtrlPolicy {
    SlewOnly,
    #[default]
    SlewAndStep,
    StepAtStartup,
    StepOnFirstLock,
    StepForward,
    NoAdjust,
}

/// ACL evaluation order, named after Apache httpd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AclOrder {
    /// Default deny; pass only if in allow and not in deny.
    #[default]
    AllowDeny,
    /// Default allow; drop only if in deny and not in allow.
    DenyAllow,
}

/// One ACL specification: ordering plus the two CIDR lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    #[serde(default)]
    pub order: AclOrder,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl AclConfig {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn default_announce_interval() -> i8 {
    1
}
fn default_sync_interval() -> i8 {
    0
}
fn default_min_delay_req_interval() -> i8 {
    0
}
fn default_announce_receipt_timeout() -> u8 {
    6
}
fn default_foreign_record_capacity() -> usize {
    16
}
fn default_step_threshold_ns() -> f64 {
    1_000_000_000.0
}
fn default_kp() -> f64 {
    0.4
}
fn default_ki() -> f64 {
    0.03
}
fn default_kd() -> f64 {
    0.0
}
fn default_fir_size() -> usize {
    4
}
fn default_outlier_size() -> usize {
    30
}
fn default_path_delay_size() -> usize {
    8
}
fn default_path_delay_ageing() -> f64 {
    1.0005
}
fn default_path_delay_timeout_secs() -> f64 {
    60.0
}
fn default_ttl() -> u32 {
    64
}
fn default_tx_ts_timeout_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface the port binds to (e.g. "eth0").
    pub interface: String,

    #[serde(default)]
    pub transport: TransportMode,

    #[serde(default)]
    pub ipv6_scope: Ipv6Scope,

    #[serde(default)]
    pub delay_mechanism: DelayMechanism,

    /// PTP domain. Messages from other domains are dropped.
    #[serde(default)]
    pub domain_number: u8,

    #[serde(default = "default_priority")]
    pub priority1: u8,

    #[serde(default = "default_priority")]
    pub priority2: u8,

    /// log2 seconds between Announce transmissions.
    #[serde(default = "default_announce_interval")]
    pub announce_interval_log2: i8,

    /// log2 seconds between Sync transmissions (and the servo sample period).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_log2: i8,

    /// log2 seconds lower bound on Delay_Req spacing.
    #[serde(default = "default_min_delay_req_interval")]
    pub min_delay_req_interval_log2: i8,

    /// Announce intervals without a fresh Announce before the master is
    /// considered lost.
    #[serde(default = "default_announce_receipt_timeout")]
    pub announce_receipt_timeout: u8,

    /// Foreign-master table size N.
    #[serde(default = "default_foreign_record_capacity")]
    pub foreign_record_capacity: usize,

    /// Never take the MASTER or PASSIVE states.
    #[serde(default)]
    pub slave_only: bool,

    #[serde(default)]
    pub clock_ctrl_policy: ClockCtrlPolicy,

    /// Offsets at or above this magnitude are candidates for stepping.
    #[serde(default = "default_step_threshold_ns")]
    pub step_threshold_ns: f64,

    #[serde(default = "default_kp")]
    pub servo_kp: f64,

    #[serde(default = "default_ki")]
    pub servo_ki: f64,

    #[serde(default = "default_kd")]
    pub servo_kd: f64,

    #[serde(default = "default_fir_size")]
    pub fir_filter_size: usize,

    #[serde(default = "default_outlier_size")]
    pub outlier_filter_size: usize,

    #[serde(default = "default_path_delay_size")]
    pub path_delay_filter_size: usize,

    #[serde(default = "default_path_delay_ageing")]
    pub path_delay_filter_ageing: f64,

    #[serde(default = "default_path_delay_timeout_secs")]
    pub path_delay_filter_timeout_secs: f64,

    #[serde(default)]
    pub acl_timing: AclConfig,

    #[serde(default)]
    pub acl_management: AclConfig,

    #[serde(default)]
    pub acl_monitoring: AclConfig,

    /// Multicast TTL / hop limit for the primary group. The peer-delay group
    /// is always sent with TTL 1.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// DSCP value for both sockets, 0 disables marking.
    #[serde(default)]
    pub dscp: u8,

    /// EUI-64 fill bytes between the MAC halves. None selects the legacy
    /// ff:fe fill; 1588-2019 deployments may configure their own.
    #[serde(default)]
    pub unique_clockid_bits: Option<[u8; 2]>,

    /// Persist the servo's frequency correction across restarts.
    #[serde(default)]
    pub persistent_correction: bool,

    /// Directory for persisted state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How long a pending TX timestamp may be outstanding before the
    /// NO_TX_TIMESTAMPS alarm is raised.
    #[serde(default = "default_tx_ts_timeout_ms")]
    pub tx_timestamp_timeout_ms: u64,
}

fn default_priority() -> u8 {
    128
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/ptpsyncd")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: String::new(),
            transport: TransportMode::default(),
            ipv6_scope: Ipv6Scope::default(),
            delay_mechanism: DelayMechanism::default(),
            domain_number: 0,
            priority1: default_priority(),
            priority2: default_priority(),
            announce_interval_log2: default_announce_interval(),
            sync_interval_log2: default_sync_interval(),
            min_delay_req_interval_log2: default_min_delay_req_interval(),
            announce_receipt_timeout: default_announce_receipt_timeout(),
            foreign_record_capacity: default_foreign_record_capacity(),
            slave_only: false,
            clock_ctrl_policy: ClockCtrlPolicy::default(),
            step_threshold_ns: default_step_threshold_ns(),
            servo_kp: default_kp(),
            servo_ki: default_ki(),
            servo_kd: default_kd(),
            fir_filter_size: default_fir_size(),
            outlier_filter_size: default_outlier_size(),
            path_delay_filter_size: default_path_delay_size(),
            path_delay_filter_ageing: default_path_delay_ageing(),
            path_delay_filter_timeout_secs: default_path_delay_timeout_secs(),
            acl_timing: AclConfig::default(),
            acl_management: AclConfig::default(),
            acl_monitoring: AclConfig::default(),
            ttl: default_ttl(),
            dscp: 0,
            unique_clockid_bits: None,
            persistent_correction: false,
            state_dir: default_state_dir(),
            tx_timestamp_timeout_ms: default_tx_ts_timeout_ms(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would only fail later, as fatal setup errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must be set".into()));
        }
        if self.foreign_record_capacity == 0 {
            return Err(ConfigError::Invalid("foreign_record_capacity must be > 0".into()));
        }
        if self.fir_filter_size == 0 || self.path_delay_filter_size == 0 {
            return Err(ConfigError::Invalid("filter sizes must be > 0".into()));
        }
        if self.announce_receipt_timeout < 2 {
            return Err(ConfigError::Invalid(
                "announce_receipt_timeout must be at least 2 intervals".into(),
            ));
        }
        if self.dscp > 63 {
            return Err(ConfigError::Invalid("dscp must be in 0..=63".into()));
        }
        if self.step_threshold_ns < 0.0 {
            return Err(ConfigError::Invalid("step_threshold_ns must be non-negative".into()));
        }
        Ok(())
    }

    /// EUI-64 fill actually in force.
    pub fn clockid_fill(&self) -> [u8; 2] {
        self.unique_clockid_bits.unwrap_or(crate::types::LEGACY_CLOCKID_FILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config { interface: "eth0".into(), ..Config::default() }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let cfg = Config { foreign_record_capacity: 0, ..base() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_interface() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: Config = toml::from_str("interface = \"eth1\"\ntransport = \"ipv6\"").unwrap();
        assert_eq!(cfg.interface, "eth1");
        assert_eq!(cfg.transport, TransportMode::Ipv6);
        assert_eq!(cfg.announce_interval_log2, 1);
        assert_eq!(cfg.clockid_fill(), [0xff, 0xfe]);
    }

    #[test]
    fn parses_acl_section() {
        let cfg: Config = toml::from_str(
            "interface = \"eth0\"\n[acl_timing]\norder = \"deny-allow\"\ndeny = [\"10.0.0.0/8\"]\n",
        )
        .unwrap();
        assert_eq!(cfg.acl_timing.order, AclOrder::DenyAllow);
        assert_eq!(cfg.acl_timing.deny, vec!["10.0.0.0/8".to_string()]);
    }
}

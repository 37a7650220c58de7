//! Configuration loading and parsing.
//!
//! Parses `millwright.toml` (or an override path provided by the binary) into
//! the per-subsystem option tree. Every option is optional with a documented
//! default, and unknown fields are ignored (TOML deserialization tolerance)
//! so older configs keep loading as the engine grows. Subsystems receive
//! their section by value at construction; nothing reads configuration
//! globally after startup.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

/// Serial link parameters. Framing is fixed 8-N-1; only the line terminator
/// the host appends to outbound commands is configurable.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LinkConfig {
    #[serde(default)]
    pub port_path: Option<String>,
    #[serde(default = "LinkConfig::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "LinkConfig::default_line_ending")]
    pub line_ending: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_path: None,
            baud_rate: Self::default_baud_rate(),
            line_ending: Self::default_line_ending(),
        }
    }
}

impl LinkConfig {
    const fn default_baud_rate() -> u32 {
        115_200
    }
    fn default_line_ending() -> String {
        "\r\n".to_string()
    }
}

/// Command executor limits.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    #[serde(default = "ExecutorConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "ExecutorConfig::default_max_pending")]
    pub max_pending: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: Self::default_command_timeout_ms(),
            max_pending: Self::default_max_pending(),
        }
    }
}

impl ExecutorConfig {
    const fn default_command_timeout_ms() -> u64 {
        5000
    }
    const fn default_max_pending() -> usize {
        50
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Status poller cadence tiers and failure limits.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PollerConfig {
    #[serde(default = "PollerConfig::default_fast_ms")]
    pub fast_ms: u64,
    #[serde(default = "PollerConfig::default_normal_ms")]
    pub normal_ms: u64,
    #[serde(default = "PollerConfig::default_slow_ms")]
    pub slow_ms: u64,
    #[serde(default = "PollerConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "PollerConfig::default_max_missed")]
    pub max_missed: u32,
    /// rx free-space watermark below which `buffer_low` fires.
    #[serde(default = "PollerConfig::default_rx_low_watermark")]
    pub rx_low_watermark: u32,
    /// rx free-space watermark above which `buffer_high` fires.
    #[serde(default = "PollerConfig::default_rx_high_watermark")]
    pub rx_high_watermark: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fast_ms: Self::default_fast_ms(),
            normal_ms: Self::default_normal_ms(),
            slow_ms: Self::default_slow_ms(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            max_missed: Self::default_max_missed(),
            rx_low_watermark: Self::default_rx_low_watermark(),
            rx_high_watermark: Self::default_rx_high_watermark(),
        }
    }
}

impl PollerConfig {
    const fn default_fast_ms() -> u64 {
        100
    }
    const fn default_normal_ms() -> u64 {
        250
    }
    const fn default_slow_ms() -> u64 {
        1000
    }
    const fn default_poll_timeout_ms() -> u64 {
        2000
    }
    const fn default_max_missed() -> u32 {
        5
    }
    const fn default_rx_low_watermark() -> u32 {
        16
    }
    const fn default_rx_high_watermark() -> u32 {
        64
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Streaming engine batching, checkpointing, and memory limits.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StreamingConfig {
    #[serde(default = "StreamingConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "StreamingConfig::default_look_ahead_lines")]
    pub look_ahead_lines: usize,
    /// Bytes held back from the controller's reported rx free space.
    #[serde(default = "StreamingConfig::default_rx_safety_margin")]
    pub rx_safety_margin: u32,
    #[serde(default = "StreamingConfig::default_pause_on_error")]
    pub pause_on_error: bool,
    /// Completed lines between durable checkpoints. Zero disables them.
    #[serde(default = "StreamingConfig::default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "StreamingConfig::default_max_checkpoints")]
    pub max_checkpoints: usize,
    #[serde(default = "StreamingConfig::default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "StreamingConfig::default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Programs larger than this many lines stream through disk-backed chunks.
    #[serde(default = "StreamingConfig::default_max_resident_lines")]
    pub max_resident_lines: usize,
    #[serde(default = "StreamingConfig::default_chunk_lines")]
    pub chunk_lines: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            look_ahead_lines: Self::default_look_ahead_lines(),
            rx_safety_margin: Self::default_rx_safety_margin(),
            pause_on_error: Self::default_pause_on_error(),
            checkpoint_interval: Self::default_checkpoint_interval(),
            max_checkpoints: Self::default_max_checkpoints(),
            checkpoint_dir: Self::default_checkpoint_dir(),
            progress_interval_ms: Self::default_progress_interval_ms(),
            max_resident_lines: Self::default_max_resident_lines(),
            chunk_lines: Self::default_chunk_lines(),
        }
    }
}

impl StreamingConfig {
    const fn default_batch_size() -> usize {
        5
    }
    const fn default_look_ahead_lines() -> usize {
        15
    }
    const fn default_rx_safety_margin() -> u32 {
        8
    }
    const fn default_pause_on_error() -> bool {
        true
    }
    const fn default_checkpoint_interval() -> usize {
        1000
    }
    const fn default_max_checkpoints() -> usize {
        5
    }
    fn default_checkpoint_dir() -> PathBuf {
        PathBuf::from(".millwright/checkpoints")
    }
    const fn default_progress_interval_ms() -> u64 {
        500
    }
    const fn default_max_resident_lines() -> usize {
        50_000
    }
    const fn default_chunk_lines() -> usize {
        10_000
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Alarm recovery guards and restoration toggles.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "RecoveryConfig::default_enable_auto_recovery")]
    pub enable_auto_recovery: bool,
    #[serde(default = "RecoveryConfig::default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "RecoveryConfig::default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "RecoveryConfig::default_safe_height_mm")]
    pub safe_height_mm: f64,
    #[serde(default = "RecoveryConfig::default_homing_timeout_ms")]
    pub homing_timeout_ms: u64,
    #[serde(default = "RecoveryConfig::default_position_tolerance_mm")]
    pub position_tolerance_mm: f64,
    #[serde(default = "RecoveryConfig::default_restore_position")]
    pub restore_position: bool,
    /// Spindle restart after recovery stays off unless explicitly enabled.
    #[serde(default = "RecoveryConfig::default_restore_spindle")]
    pub restore_spindle: bool,
    #[serde(default = "RecoveryConfig::default_restore_coolant")]
    pub restore_coolant: bool,
    #[serde(default = "RecoveryConfig::default_restore_modal")]
    pub restore_modal: bool,
    #[serde(default = "RecoveryConfig::default_restore_work_offset")]
    pub restore_work_offset: bool,
    /// Queue alarms arriving during an active episode instead of dropping.
    #[serde(default = "RecoveryConfig::default_queue_overlapping_alarms")]
    pub queue_overlapping_alarms: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enable_auto_recovery: Self::default_enable_auto_recovery(),
            max_recovery_attempts: Self::default_max_recovery_attempts(),
            recovery_timeout_ms: Self::default_recovery_timeout_ms(),
            safe_height_mm: Self::default_safe_height_mm(),
            homing_timeout_ms: Self::default_homing_timeout_ms(),
            position_tolerance_mm: Self::default_position_tolerance_mm(),
            restore_position: Self::default_restore_position(),
            restore_spindle: Self::default_restore_spindle(),
            restore_coolant: Self::default_restore_coolant(),
            restore_modal: Self::default_restore_modal(),
            restore_work_offset: Self::default_restore_work_offset(),
            queue_overlapping_alarms: Self::default_queue_overlapping_alarms(),
        }
    }
}

impl RecoveryConfig {
    const fn default_enable_auto_recovery() -> bool {
        true
    }
    const fn default_max_recovery_attempts() -> u32 {
        3
    }
    const fn default_recovery_timeout_ms() -> u64 {
        30_000
    }
    const fn default_safe_height_mm() -> f64 {
        5.0
    }
    const fn default_homing_timeout_ms() -> u64 {
        60_000
    }
    const fn default_position_tolerance_mm() -> f64 {
        0.1
    }
    const fn default_restore_position() -> bool {
        true
    }
    const fn default_restore_spindle() -> bool {
        false
    }
    const fn default_restore_coolant() -> bool {
        true
    }
    const fn default_restore_modal() -> bool {
        true
    }
    const fn default_restore_work_offset() -> bool {
        true
    }
    const fn default_queue_overlapping_alarms() -> bool {
        true
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }
}

/// Retry policies and the shared circuit breaker.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "RetryConfig::default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryConfig::default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "RetryConfig::default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "RetryConfig::default_breaker_reset_ms")]
    pub breaker_reset_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            jitter_ms: Self::default_jitter_ms(),
            breaker_threshold: Self::default_breaker_threshold(),
            breaker_reset_ms: Self::default_breaker_reset_ms(),
        }
    }
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        3
    }
    const fn default_initial_delay_ms() -> u64 {
        500
    }
    const fn default_max_delay_ms() -> u64 {
        10_000
    }
    const fn default_backoff_multiplier() -> f64 {
        2.0
    }
    const fn default_jitter_ms() -> u64 {
        100
    }
    const fn default_breaker_threshold() -> u32 {
        5
    }
    const fn default_breaker_reset_ms() -> u64 {
        30_000
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_millis(self.breaker_reset_ms)
    }
}

/// State synchronizer policy selection.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Controller truth overwrites the mirror.
    #[default]
    HardwarePriority,
    /// Corrective commands push the mirror's view back to the controller.
    SoftwarePriority,
    /// Surface a conflict event and change nothing.
    Manual,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub policy: SyncPolicy,
    #[serde(default = "SyncConfig::default_position_tolerance_mm")]
    pub position_tolerance_mm: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::default(),
            position_tolerance_mm: Self::default_position_tolerance_mm(),
        }
    }
}

impl SyncConfig {
    const fn default_position_tolerance_mm() -> f64 {
        0.01
    }
}

/// Whole parsed (or defaulted) configuration tree.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Best-effort config path following platform conventions: working-directory
/// `millwright.toml` first, then the platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("millwright.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("millwright").join("millwright.toml");
    }
    PathBuf::from("millwright.toml")
}

/// Load from `path`, or from [`discover`] when absent. A missing file yields
/// defaults; a malformed file also falls back to defaults with a warning so a
/// bad edit never blocks connecting to the machine.
pub fn load_from(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = path.unwrap_or_else(discover);
    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<EngineConfig>(&content) {
            Ok(config) => {
                info!(target: "config", path = %path.display(), "config_loaded");
                Ok(config)
            }
            Err(e) => {
                warn!(target: "config", path = %path.display(), %e, "config_parse_failed_using_defaults");
                Ok(EngineConfig::default())
            }
        },
        Err(_) => Ok(EngineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.link.line_ending, "\r\n");
        assert_eq!(config.executor.command_timeout_ms, 5000);
        assert_eq!(config.executor.max_pending, 50);
        assert_eq!(config.poller.fast_ms, 100);
        assert_eq!(config.poller.normal_ms, 250);
        assert_eq!(config.poller.slow_ms, 1000);
        assert_eq!(config.poller.max_missed, 5);
        assert_eq!(config.streaming.batch_size, 5);
        assert_eq!(config.streaming.look_ahead_lines, 15);
        assert_eq!(config.streaming.rx_safety_margin, 8);
        assert!(config.streaming.pause_on_error);
        assert!(config.recovery.enable_auto_recovery);
        assert_eq!(config.recovery.max_recovery_attempts, 3);
        assert!((config.recovery.safe_height_mm - 5.0).abs() < f64::EPSILON);
        assert!(!config.recovery.restore_spindle);
        assert!(config.recovery.restore_coolant);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.breaker_threshold, 5);
        assert_eq!(config.sync.policy, SyncPolicy::HardwarePriority);
        assert!((config.sync.position_tolerance_mm - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let toml_text = r#"
            [link]
            port_path = "/dev/ttyUSB0"
            baud_rate = 250000

            [streaming]
            batch_size = 10
        "#;
        let config: EngineConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.link.port_path.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.link.baud_rate, 250_000);
        assert_eq!(config.streaming.batch_size, 10);
        assert_eq!(config.streaming.look_ahead_lines, 15);
        assert_eq!(config.executor.max_pending, 50);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let toml_text = r#"
            [link]
            baud_rate = 9600
            flux_capacitor = true

            [future_section]
            key = "value"
        "#;
        let config: EngineConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.link.baud_rate, 9600);
    }

    #[test]
    fn sync_policy_parses_snake_case() {
        let config: EngineConfig =
            toml::from_str("[sync]\npolicy = \"software_priority\"\n").unwrap();
        assert_eq!(config.sync.policy, SyncPolicy::SoftwarePriority);
    }

    #[test]
    fn load_from_missing_path_yields_defaults() {
        let config = load_from(Some(PathBuf::from("/nonexistent/millwright.toml"))).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn load_from_malformed_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not [valid toml").unwrap();
        let config = load_from(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn load_from_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[poller]\nfast_ms = 50\n").unwrap();
        let config = load_from(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.poller.fast_ms, 50);
        assert_eq!(config.poller.normal_ms, 250);
    }

    #[test]
    fn duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.recovery.homing_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry.breaker_reset(), Duration::from_secs(30));
    }
}

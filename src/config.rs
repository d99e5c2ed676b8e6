//! Configuration management with validation and defaults
//!
//! Values come from `CrashConfig::default()`, then an optional TOML file,
//! then `CRASHLINE_*` environment variables, and are validated last.

use crate::errors::ConfigError;
use crate::types::{Amount, Multiplier};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub game: GameConfig,
    pub fairness: FairnessConfig,
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

/// Round timing, multiplier growth and bet limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Betting window length
    pub waiting_secs: u64,
    /// Pause between crash and the next round
    pub settlement_pause_secs: u64,
    /// Multiplier tick interval
    pub tick_interval_ms: u64,
    /// Growth per second at t=0
    pub base_speed: f64,
    /// Growth acceleration per second squared
    pub acceleration: f64,
    /// Minimum stake in minor units
    pub min_bet: Amount,
    /// Maximum stake in minor units
    pub max_bet: Amount,
    /// Cooldown after a failed round before the next one starts
    pub error_cooldown_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            waiting_secs: 7,
            settlement_pause_secs: 3,
            tick_interval_ms: 80,
            base_speed: 0.06,
            acceleration: 0.03,
            min_bet: 1,         // 0.01
            max_bet: 100_000,   // 1000.00
            error_cooldown_secs: 5,
        }
    }
}

/// Crash point derivation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    /// Skew applied to the raw draw, within [-0.5, 0.5]
    pub bias: f64,
    /// Hard ceiling for crash points, e.g. 100.0
    pub max_crash_point: f64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            bias: 0.0,
            max_crash_point: 100.0,
        }
    }
}

/// Ledger retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_ms: 50,
            retry_max_ms: 2_000,
        }
    }
}

/// Storage configuration with optimization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: usize,
    pub target_file_size_mb: usize,
    pub compression_type: CompressionType,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/crash_data".to_string(),
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            compression_type: CompressionType::Lz4,
            clear_on_start: false, // Production default: preserve data
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit a debug line every N multiplier ticks (0 disables)
    pub tick_log_every: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "crashline=info".to_string(),
            tick_log_every: 25,
        }
    }
}

impl CrashConfig {
    /// Production deployment with persistence
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                write_buffer_size_mb: 128,
                clear_on_start: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Short timings for tests and local runs
    pub fn testing() -> Self {
        Self {
            game: GameConfig {
                waiting_secs: 1,
                settlement_pause_secs: 0,
                tick_interval_ms: 20,
                error_cooldown_secs: 1,
                ..Default::default()
            },
            settlement: SettlementConfig {
                max_retries: 2,
                retry_base_ms: 1,
                retry_max_ms: 5,
            },
            storage: StorageConfig {
                clear_on_start: true,
                write_buffer_size_mb: 8,
                target_file_size_mb: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let game = &self.game;
        if game.tick_interval_ms == 0 {
            return Err(invalid("game.tick_interval_ms", "0", "tick interval must be > 0"));
        }
        if game.base_speed <= 0.0 || !game.base_speed.is_finite() {
            return Err(invalid(
                "game.base_speed",
                &game.base_speed.to_string(),
                "multiplier must grow",
            ));
        }
        if game.acceleration < 0.0 || !game.acceleration.is_finite() {
            return Err(invalid(
                "game.acceleration",
                &game.acceleration.to_string(),
                "acceleration cannot be negative",
            ));
        }
        if game.min_bet == 0 {
            return Err(invalid("game.min_bet", "0", "stakes must be positive"));
        }
        if game.max_bet < game.min_bet {
            return Err(invalid(
                "game.max_bet",
                &game.max_bet.to_string(),
                "max_bet is below min_bet",
            ));
        }

        let fairness = &self.fairness;
        if !fairness.bias.is_finite() || fairness.bias.abs() > crate::fairness::MAX_BIAS {
            return Err(invalid(
                "fairness.bias",
                &fairness.bias.to_string(),
                "bias must be within [-0.5, 0.5]",
            ));
        }
        if !fairness.max_crash_point.is_finite() || fairness.max_crash_point < 1.01 {
            return Err(invalid(
                "fairness.max_crash_point",
                &fairness.max_crash_point.to_string(),
                "ceiling must be at least 1.01",
            ));
        }

        if self.settlement.retry_base_ms > self.settlement.retry_max_ms {
            return Err(invalid(
                "settlement.retry_base_ms",
                &self.settlement.retry_base_ms.to_string(),
                "base delay exceeds max delay",
            ));
        }

        if self.storage.data_directory.is_empty() {
            return Err(invalid("storage.data_directory", "", "data directory is required"));
        }

        Ok(())
    }

    pub fn settlement_pause(&self) -> Duration {
        Duration::from_secs(self.game.settlement_pause_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.game.error_cooldown_secs)
    }

    pub fn crash_ceiling(&self) -> Multiplier {
        Multiplier::from_f64_floor(self.fairness.max_crash_point)
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> Result<CrashConfig, ConfigError> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => CrashConfig::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    fn load_from_file(path: &str) -> Result<CrashConfig, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<CrashConfig, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::LoadFailed(format!("Failed to parse TOML: {}", e)))
    }
}

/// Apply `CRASHLINE_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut CrashConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("CRASHLINE_DATA_DIR") {
        config.storage.data_directory = dir;
    }
    if let Some(v) = lookup("CRASHLINE_WAITING_SECS") {
        config.game.waiting_secs = parse_var("CRASHLINE_WAITING_SECS", v)?;
    }
    if let Some(v) = lookup("CRASHLINE_TICK_MS") {
        config.game.tick_interval_ms = parse_var("CRASHLINE_TICK_MS", v)?;
    }
    if let Some(v) = lookup("CRASHLINE_MIN_BET") {
        config.game.min_bet = parse_var("CRASHLINE_MIN_BET", v)?;
    }
    if let Some(v) = lookup("CRASHLINE_MAX_BET") {
        config.game.max_bet = parse_var("CRASHLINE_MAX_BET", v)?;
    }
    if let Some(v) = lookup("CRASHLINE_CRASH_BIAS") {
        config.fairness.bias = parse_var("CRASHLINE_CRASH_BIAS", v)?;
    }
    if let Some(filter) = lookup("CRASHLINE_LOG") {
        config.monitoring.log_filter = filter;
    }
    Ok(())
}

fn parse_var<T: std::str::FromStr>(field: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: "cannot parse value".to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrashConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.game.waiting_secs, 7);
        assert_eq!(config.settlement_pause(), Duration::from_secs(3));
        assert_eq!(config.game.tick_interval_ms, 80);
        assert_eq!(config.crash_ceiling(), Multiplier::from_hundredths(10_000));
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(CrashConfig::production().validate().is_ok());
        assert!(CrashConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CrashConfig::default();
        config.game.max_bet = 0;
        assert!(config.validate().is_err());

        let mut config = CrashConfig::default();
        config.fairness.bias = 0.9;
        assert!(config.validate().is_err());

        let mut config = CrashConfig::default();
        config.game.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [game]
            waiting_secs = 10
            max_bet = 5000

            [fairness]
            bias = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.game.waiting_secs, 10);
        assert_eq!(config.game.max_bet, 5_000);
        assert_eq!(config.game.tick_interval_ms, 80);
        assert_eq!(config.fairness.bias, 0.1);
        assert_eq!(config.settlement.max_retries, 5);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CRASHLINE_DATA_DIR", "/tmp/crash"),
            ("CRASHLINE_TICK_MS", "50"),
            ("CRASHLINE_CRASH_BIAS", "-0.2"),
        ]
        .into_iter()
        .collect();

        let mut config = CrashConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.storage.data_directory, "/tmp/crash");
        assert_eq!(config.game.tick_interval_ms, 50);
        assert_eq!(config.fairness.bias, -0.2);
    }

    #[test]
    fn test_bad_env_value_reports_field() {
        let mut config = CrashConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "CRASHLINE_WAITING_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("CRASHLINE_WAITING_SECS"));
    }
}

//! Configuration for the fall detector.

use crate::alert::{AlertSettings, NotifierBackend, StoreBackend};
use crate::core::decoder::DecoderConfig;
use crate::core::fuser::{FusionConfig, DUAL_WIDTH, SINGLE_WIDTH};
use crate::core::inference::Thresholds;
use crate::core::model::FallModel;
use crate::core::pipeline::{PipelineSettings, TickMode};
use crate::core::types::Channel;
use crate::link::LinkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Slowest supported tick rate.
pub const MIN_SAMPLE_RATE_HZ: f64 = 0.1;

/// Fastest supported tick rate; the tick period must stay at or above 1 ms.
pub const MAX_SAMPLE_RATE_HZ: f64 = 1000.0;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Samples per model window
    pub window_size: usize,

    /// Tick rate of the fixed-rate tick task
    pub sample_rate_hz: f64,

    /// Gyroscope multiplier; must equal the one used in training
    pub gyro_scale: f32,

    /// Target time between model calls
    #[serde(with = "duration_ms")]
    pub prediction_interval: Duration,

    /// Probability above which an alert is raised
    pub alert_threshold: f32,

    /// Probability above which status output flags a possible fall
    pub display_threshold: f32,

    /// Minimum time between two alert dispatches
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,

    /// Channel used when only one channel feeds the model
    pub fallback_channel: Channel,

    /// Model feature width (12 = hip + leg, 6 = one sensor)
    pub feature_width: usize,

    /// Push samples built from channels that never reported
    pub push_zero_samples: bool,

    pub tick_mode: TickMode,

    pub decoder: DecoderConfig,

    pub link: LinkConfig,

    pub alerts: AlertConfig,

    /// Weights file for the logistic model
    pub model_path: Option<PathBuf>,

    /// Path for exported alert histories
    pub export_path: PathBuf,

    /// Path for persisted statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fallwatch");

        Self {
            window_size: 40,
            sample_rate_hz: 20.0,
            gyro_scale: 4.0,
            prediction_interval: Duration::from_millis(250),
            alert_threshold: 0.95,
            display_threshold: 0.5,
            cooldown: Duration::from_secs(10),
            fallback_channel: Channel::Hip,
            feature_width: DUAL_WIDTH,
            push_zero_samples: false,
            tick_mode: TickMode::Fixed,
            decoder: DecoderConfig::default(),
            link: LinkConfig::default(),
            alerts: AlertConfig::default(),
            model_path: None,
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fallwatch")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.window_size == 0 {
            return invalid("window_size must be at least 1".to_string());
        }
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&self.sample_rate_hz) {
            return invalid(format!(
                "sample_rate_hz must be within [{MIN_SAMPLE_RATE_HZ}, {MAX_SAMPLE_RATE_HZ}], got {}",
                self.sample_rate_hz
            ));
        }
        if !self.gyro_scale.is_finite() || self.gyro_scale <= 0.0 {
            return invalid(format!("gyro_scale must be positive, got {}", self.gyro_scale));
        }
        for (name, value) in [
            ("alert_threshold", self.alert_threshold),
            ("display_threshold", self.display_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.feature_width != DUAL_WIDTH && self.feature_width != SINGLE_WIDTH {
            return invalid(format!(
                "feature_width must be {SINGLE_WIDTH} or {DUAL_WIDTH}, got {}",
                self.feature_width
            ));
        }
        Ok(())
    }

    /// The model must expect exactly the windows this config produces.
    pub fn check_model(&self, model: &dyn FallModel) -> Result<(), ConfigError> {
        let expected = (self.window_size, self.feature_width);
        let actual = model.input_shape();
        if actual != expected {
            return Err(ConfigError::ModelShape { expected, actual });
        }
        Ok(())
    }

    /// Ticks between model calls: `max(1, round(interval × rate))`.
    pub fn predict_every_n_ticks(&self) -> u64 {
        let ticks = (self.prediction_interval.as_secs_f64() * self.sample_rate_hz).round();
        (ticks as u64).max(1)
    }

    /// Period of the fixed-rate tick.
    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&self.sample_rate_hz) {
            return Err(ConfigError::Invalid(format!(
                "no tick interval for sample_rate_hz {}",
                self.sample_rate_hz
            )));
        }
        Duration::try_from_secs_f64(1.0 / self.sample_rate_hz)
            .map_err(|e| ConfigError::Invalid(format!("tick interval: {e}")))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            alert: self.alert_threshold,
            display: self.display_threshold,
        }
    }

    pub fn fusion(&self) -> FusionConfig {
        FusionConfig {
            feature_width: self.feature_width,
            gyro_scale: self.gyro_scale,
            fallback_channel: self.fallback_channel,
            push_zero_samples: self.push_zero_samples,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            window_size: self.window_size,
            predict_every_n_ticks: self.predict_every_n_ticks(),
            thresholds: self.thresholds(),
            fusion: self.fusion(),
            decoder: self.decoder.clone(),
            tick_mode: self.tick_mode,
        }
    }

    pub fn alert_settings(&self) -> AlertSettings {
        AlertSettings {
            cooldown: chrono::Duration::from_std(self.cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX))),
            recipient: self.alerts.recipient.clone(),
            person: self.alerts.person_name.clone(),
            timezone: crate::alert::parse_timezone(&self.alerts.timezone),
            label: self.alerts.label.clone(),
            history_limit: self.alerts.history_limit,
            device: crate::alert::device_id(),
        }
    }
}

/// Alert recipients and backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Name of the monitored person, used in messages
    pub person_name: String,
    /// Messaging recipient (phone number for WhatsApp)
    pub recipient: String,
    /// IANA timezone for message timestamps
    pub timezone: String,
    /// Classification label stored with each record
    pub label: String,
    /// Alerts kept in memory for export on shutdown
    pub history_limit: usize,
    pub store: StoreBackend,
    pub notifier: NotifierBackend,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            person_name: "monitored person".to_string(),
            recipient: String::new(),
            timezone: "UTC".to_string(),
            label: "fall detected".to_string(),
            history_limit: 100,
            store: StoreBackend::Log,
            notifier: NotifierBackend::Log,
        }
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(
        "model expects windows of {actual:?} (window, features) but the pipeline produces {expected:?}"
    )]
    ModelShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Serde support for Duration as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for Duration as milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ConstantModel;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.window_size, 40);
        assert_eq!(config.cooldown, Duration::from_secs(10));
        assert_eq!(config.fallback_channel, Channel::Hip);
        assert!(!config.push_zero_samples);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_predict_every_n_ticks() {
        let mut config = Config::default();
        assert_eq!(config.predict_every_n_ticks(), 5);

        config.prediction_interval = Duration::from_millis(100);
        config.sample_rate_hz = 200.0;
        assert_eq!(config.predict_every_n_ticks(), 20);

        config.prediction_interval = Duration::from_millis(1);
        config.sample_rate_hz = 20.0;
        assert_eq!(config.predict_every_n_ticks(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<(&str, Config)> = vec![
            ("zero window", Config { window_size: 0, ..Config::default() }),
            ("zero rate", Config { sample_rate_hz: 0.0, ..Config::default() }),
            ("negative rate", Config { sample_rate_hz: -20.0, ..Config::default() }),
            ("tiny rate", Config { sample_rate_hz: 1e-300, ..Config::default() }),
            ("huge rate", Config { sample_rate_hz: 2e9, ..Config::default() }),
            ("nan rate", Config { sample_rate_hz: f64::NAN, ..Config::default() }),
            ("infinite rate", Config { sample_rate_hz: f64::INFINITY, ..Config::default() }),
            ("nan gyro scale", Config { gyro_scale: f32::NAN, ..Config::default() }),
            ("zero gyro scale", Config { gyro_scale: 0.0, ..Config::default() }),
            ("negative gyro scale", Config { gyro_scale: -4.0, ..Config::default() }),
            ("infinite gyro scale", Config { gyro_scale: f32::INFINITY, ..Config::default() }),
            ("alert threshold above 1", Config { alert_threshold: 1.5, ..Config::default() }),
            ("alert threshold below 0", Config { alert_threshold: -0.1, ..Config::default() }),
            ("nan alert threshold", Config { alert_threshold: f32::NAN, ..Config::default() }),
            ("display threshold above 1", Config { display_threshold: 1.01, ..Config::default() }),
            ("feature width 9", Config { feature_width: 9, ..Config::default() }),
        ];
        for (name, config) in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{name} should be rejected"
            );
        }

        let zero_cooldown = Config {
            cooldown: Duration::ZERO,
            ..Config::default()
        };
        assert!(zero_cooldown.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_rate_bounds() {
        for rate in [MIN_SAMPLE_RATE_HZ, 20.0, 200.0, MAX_SAMPLE_RATE_HZ] {
            let config = Config {
                sample_rate_hz: rate,
                ..Config::default()
            };
            assert!(config.validate().is_ok(), "{rate} Hz should be accepted");
            assert!(config.tick_interval().unwrap() >= Duration::from_millis(1));
        }
    }

    #[test]
    fn test_tick_interval_out_of_range_is_an_error() {
        let period = Config::default().tick_interval().unwrap();
        assert!((period.as_secs_f64() - 0.05).abs() < 1e-9);
        for rate in [1e-300, 2e9, 0.0, f64::NAN] {
            let config = Config {
                sample_rate_hz: rate,
                ..Config::default()
            };
            assert!(matches!(
                config.tick_interval(),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_model_shape_check() {
        let config = Config::default();
        assert!(config.check_model(&ConstantModel::new(0.1, 40, 12)).is_ok());
        assert!(matches!(
            config.check_model(&ConstantModel::new(0.1, 40, 6)),
            Err(ConfigError::ModelShape { .. })
        ));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.alerts.person_name = "Vicente".to_string();
        config.tick_mode = TickMode::OnPacket;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.alerts.person_name, "Vicente");
        assert_eq!(loaded.tick_mode, TickMode::OnPacket);
        assert_eq!(loaded.prediction_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"window_size": 20, "cooldown": 5}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.window_size, 20);
        assert_eq!(config.cooldown, Duration::from_secs(5));
        assert_eq!(config.sample_rate_hz, 20.0);
    }
}

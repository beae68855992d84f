use crate::error::{LivewireError, Result};
use crate::event::EventType;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a numeric payload field of an event type lands in the window set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricMapping {
    pub event_type: EventType,
    pub window: String,
    pub key: String,
    pub field: String,
    #[serde(default)]
    pub absolute: bool,
}

impl MetricMapping {
    pub fn new(event_type: EventType, window: &str, key: &str, field: &str) -> Self {
        Self {
            event_type,
            window: window.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            absolute: false,
        }
    }

    pub fn absolute(mut self) -> Self {
        self.absolute = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub window_span_secs: u64,
    pub window_max_points: usize,
    pub windows: Vec<String>,
    pub connection_buffer: usize,
    pub write_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub evaluation_interval_secs: u64,
    pub metrics_flush_interval_secs: u64,
    pub cooldown_cleanup_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub notification_workers: usize,
    pub notification_queue_capacity: usize,
    pub anomaly_sensitivity: f64,
    pub anomaly_history: usize,
    pub alert_history_limit: usize,
    pub dead_letter_capacity: usize,
    pub dead_letter_path: Option<PathBuf>,
    /// Channels the built-in rules notify. Empty means every registered channel.
    pub default_channels: Vec<String>,
    pub metric_mappings: Vec<MetricMapping>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 10_000,
            window_span_secs: 300,
            window_max_points: 1_000,
            windows: vec![
                "odds_changes".to_string(),
                "prediction_accuracy".to_string(),
                "system_performance".to_string(),
                "user_activity".to_string(),
            ],
            connection_buffer: 256,
            write_timeout_ms: 1_000,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            evaluation_interval_secs: 30,
            metrics_flush_interval_secs: 30,
            cooldown_cleanup_interval_secs: 60,
            shutdown_grace_secs: 10,
            notification_workers: 2,
            notification_queue_capacity: 1_000,
            anomaly_sensitivity: 2.0,
            anomaly_history: 100,
            alert_history_limit: 1_000,
            dead_letter_capacity: 500,
            dead_letter_path: None,
            default_channels: Vec::new(),
            metric_mappings: vec![
                MetricMapping::new(EventType::OddsUpdate, "odds_changes", "magnitude", "odds_change")
                    .absolute(),
                MetricMapping::new(
                    EventType::PredictionRequest,
                    "prediction_accuracy",
                    "accuracy",
                    "accuracy",
                ),
                MetricMapping::new(
                    EventType::PlayerStatUpdate,
                    "user_activity",
                    "performance_change",
                    "performance_change",
                ),
            ],
        }
    }
}

impl EngineConfig {
    /// Defaults, then `LIVEWIRE_CONFIG` (TOML) if set, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("LIVEWIRE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| LivewireError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| LivewireError::Config {
            message: e.to_string(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(workers) = env::var("LIVEWIRE_WORKERS") {
            self.worker_count = parse_env("LIVEWIRE_WORKERS", &workers)?;
        }
        if let Ok(capacity) = env::var("LIVEWIRE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("LIVEWIRE_QUEUE_CAPACITY", &capacity)?;
        }
        if let Ok(span) = env::var("LIVEWIRE_WINDOW_SECS") {
            self.window_span_secs = parse_env("LIVEWIRE_WINDOW_SECS", &span)?;
        }
        if let Ok(interval) = env::var("LIVEWIRE_EVAL_INTERVAL_SECS") {
            self.evaluation_interval_secs = parse_env("LIVEWIRE_EVAL_INTERVAL_SECS", &interval)?;
        }
        if let Ok(path) = env::var("LIVEWIRE_DEAD_LETTER_PATH") {
            self.dead_letter_path = Some(PathBuf::from(path));
        }
        if let Ok(channels) = env::var("LIVEWIRE_DEFAULT_CHANNELS") {
            self.default_channels = channels
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.worker_count == 0, "worker_count must be at least 1"),
            (self.queue_capacity == 0, "queue_capacity must be at least 1"),
            (self.window_span_secs == 0, "window_span_secs must be positive"),
            (self.window_max_points == 0, "window_max_points must be at least 1"),
            (self.notification_workers == 0, "notification_workers must be at least 1"),
            (self.anomaly_sensitivity <= 0.0, "anomaly_sensitivity must be positive"),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(LivewireError::Config {
                    message: message.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn window_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_span_secs as i64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn pong_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pong_timeout_secs as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| LivewireError::Config {
        message: format!("{} has invalid value '{}'", name, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml("worker_count = 8\nwindow_span_secs = 60").unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.window_span_secs, 60);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.metric_mappings.len(), 3);
        assert!(config.default_channels.is_empty());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = EngineConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LivewireError::Config { .. })));
    }

    #[test]
    fn mappings_parse_from_toml() {
        let raw = r#"
            [[metric_mappings]]
            event_type = "weather_update"
            window = "conditions"
            key = "wind"
            field = "wind_speed"
        "#;
        let config = EngineConfig::from_toml(raw).unwrap();
        assert_eq!(config.metric_mappings.len(), 1);
        assert_eq!(config.metric_mappings[0].event_type, EventType::WeatherUpdate);
        assert!(!config.metric_mappings[0].absolute);
    }
}

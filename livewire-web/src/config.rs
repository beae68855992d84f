use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Where alert rules, metric summaries and window snapshots are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    Memory,
    None,
}

impl FromStr for PersistenceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "none" | "off" => Ok(Self::None),
            other => bail!("unknown persistence mode '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub from: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebConfig {
    pub port: u16,
    pub predictor_url: Option<String>,
    pub predictor_timeout_ms: u64,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
    pub persistence: PersistenceMode,
    pub store_max_entries: usize,
    pub smtp: Option<SmtpSettings>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            predictor_url: None,
            predictor_timeout_ms: 5_000,
            webhook_url: None,
            webhook_timeout_ms: 10_000,
            persistence: PersistenceMode::Memory,
            store_max_entries: 10_000,
            smtp: None,
        }
    }
}

impl WebConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("LIVEWIRE_PORT").or_else(|| lookup("PORT")) {
            config.port = port.parse().context("invalid port")?;
        }

        config.predictor_url = lookup("LIVEWIRE_PREDICTOR_URL").filter(|u| !u.is_empty());
        if let Some(timeout) = lookup("LIVEWIRE_PREDICTOR_TIMEOUT_MS") {
            config.predictor_timeout_ms = timeout.parse().context("invalid predictor timeout")?;
        }

        config.webhook_url = lookup("LIVEWIRE_WEBHOOK_URL").filter(|u| !u.is_empty());
        if let Some(timeout) = lookup("LIVEWIRE_WEBHOOK_TIMEOUT_MS") {
            config.webhook_timeout_ms = timeout.parse().context("invalid webhook timeout")?;
        }

        if let Some(mode) = lookup("LIVEWIRE_PERSISTENCE") {
            config.persistence = mode.parse()?;
        }
        if let Some(max) = lookup("LIVEWIRE_STORE_MAX_ENTRIES") {
            config.store_max_entries = max.parse().context("invalid store size")?;
        }

        if let Some(host) = lookup("LIVEWIRE_SMTP_HOST").filter(|h| !h.is_empty()) {
            let port = match lookup("LIVEWIRE_SMTP_PORT") {
                Some(port) => port.parse().context("invalid SMTP port")?,
                None => 587,
            };
            config.smtp = Some(SmtpSettings {
                host,
                port,
                username: lookup("LIVEWIRE_SMTP_USERNAME").unwrap_or_default(),
                password: lookup("LIVEWIRE_SMTP_PASSWORD").unwrap_or_default(),
                from: lookup("LIVEWIRE_ALERT_EMAIL_FROM")
                    .unwrap_or_else(|| "alerts@localhost".to_string()),
                recipients: lookup("LIVEWIRE_ALERT_EMAIL_TO")
                    .map(|list| {
                        list.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = WebConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WebConfig::default());
    }

    #[test]
    fn port_falls_back_to_plain_port() {
        let config = WebConfig::from_lookup(lookup(&[("PORT", "9000")])).unwrap();
        assert_eq!(config.port, 9000);
        let config =
            WebConfig::from_lookup(lookup(&[("PORT", "9000"), ("LIVEWIRE_PORT", "9100")])).unwrap();
        assert_eq!(config.port, 9100);
    }

    #[test]
    fn smtp_settings_need_a_host() {
        let config = WebConfig::from_lookup(lookup(&[("LIVEWIRE_ALERT_EMAIL_TO", "a@x.io")])).unwrap();
        assert!(config.smtp.is_none());

        let config = WebConfig::from_lookup(lookup(&[
            ("LIVEWIRE_SMTP_HOST", "smtp.example.com"),
            ("LIVEWIRE_ALERT_EMAIL_TO", "ops@example.com, ,oncall@example.com"),
        ]))
        .unwrap();
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.recipients, vec!["ops@example.com", "oncall@example.com"]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(WebConfig::from_lookup(lookup(&[("LIVEWIRE_PORT", "http")])).is_err());
        assert!(WebConfig::from_lookup(lookup(&[("LIVEWIRE_PERSISTENCE", "redis")])).is_err());
        let config = WebConfig::from_lookup(lookup(&[("LIVEWIRE_PERSISTENCE", "OFF")])).unwrap();
        assert_eq!(config.persistence, PersistenceMode::None);
    }
}

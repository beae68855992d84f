use crate::error::{LivewireError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub recorded_at: DateTime<Utc>,
    pub source: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub payload: serde_json::Value,
}

impl DeadLetter {
    pub fn new(source: &str, reason: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            recorded_at: Utc::now(),
            source: source.to_string(),
            reason: reason.into(),
            channel: None,
            payload,
        }
    }

    pub fn on_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }
}

/// Keeps unrecoverable deliveries for inspection: the most recent entries in
/// memory, and every entry appended to a JSON-lines file when one is set.
#[derive(Debug)]
pub struct DeadLetterLog {
    capacity: usize,
    recent: Mutex<VecDeque<DeadLetter>>,
    file: Option<(PathBuf, Mutex<File>)>,
    total: AtomicU64,
}

impl DeadLetterLog {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::new()),
            file: None,
            total: AtomicU64::new(0),
        }
    }

    pub fn with_file(capacity: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LivewireError::persistence(format!("dead letter dir: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LivewireError::persistence(format!("dead letter file: {}", e)))?;
        let mut log = Self::in_memory(capacity);
        log.file = Some((path, Mutex::new(file)));
        Ok(log)
    }

    pub fn record(&self, entry: DeadLetter) {
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            source = %entry.source,
            channel = entry.channel.as_deref().unwrap_or("-"),
            reason = %entry.reason,
            "Dead-lettered"
        );

        if let Some((path, file)) = &self.file {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = writeln!(file, "{}", line) {
                        tracing::error!(path = %path.display(), error = %e, "Dead letter write failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Dead letter serialization failed"),
            }
        }

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(entry);
        while recent.len() > self.capacity {
            recent.pop_front();
        }
    }

    pub fn recent(&self) -> Vec<DeadLetter> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(p, _)| p.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_ring_is_bounded() {
        let log = DeadLetterLog::in_memory(2);
        for i in 0..5 {
            log.record(DeadLetter::new("notification", format!("fail {}", i), json!({})));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].reason, "fail 4");
        assert_eq!(log.total(), 5);
    }

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq/notifications.jsonl");
        let log = DeadLetterLog::with_file(10, &path).unwrap();
        log.record(DeadLetter::new("notification", "webhook 500", json!({"alert_id": "a1"})).on_channel("webhook"));
        log.record(DeadLetter::new("notification", "smtp refused", json!({"alert_id": "a2"})));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<DeadLetter> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].channel.as_deref(), Some("webhook"));
        assert_eq!(lines[1].payload["alert_id"], "a2");
    }
}

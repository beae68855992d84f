use crate::alerts::notifications::DeliveryStats;
use crate::alerts::AlertStatusSummary;
use crate::bus::BusStats;
use crate::registry::ConnectionStats;
use crate::window::WindowSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Weight of the newest sample in the processing-time moving average.
const EWMA_ALPHA: f64 = 0.1;

#[derive(Debug)]
pub struct EngineMetrics {
    predictions_generated: AtomicU64,
    prediction_failures: AtomicU64,
    alerts_triggered: AtomicU64,
    alerts_resolved: AtomicU64,
    alerts_escalated: AtomicU64,
    malformed_messages: AtomicU64,
    avg_processing_ms: Mutex<Option<f64>>,
    started: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            predictions_generated: AtomicU64::new(0),
            prediction_failures: AtomicU64::new(0),
            alerts_triggered: AtomicU64::new(0),
            alerts_resolved: AtomicU64::new(0),
            alerts_escalated: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            avg_processing_ms: Mutex::new(None),
            started: Instant::now(),
        }
    }
}

impl EngineMetrics {
    pub fn record_prediction(&self, ok: bool) {
        let counter = if ok {
            &self.predictions_generated
        } else {
            &self.prediction_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alerts(&self, triggered: u64, resolved: u64, escalated: u64) {
        self.alerts_triggered.fetch_add(triggered, Ordering::Relaxed);
        self.alerts_resolved.fetch_add(resolved, Ordering::Relaxed);
        self.alerts_escalated.fetch_add(escalated, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, millis: f64) {
        let mut avg = self.avg_processing_ms.lock().unwrap_or_else(|e| e.into_inner());
        *avg = Some(match *avg {
            Some(current) => current + EWMA_ALPHA * (millis - current),
            None => millis,
        });
    }

    pub fn average_processing_ms(&self) -> f64 {
        self.avg_processing_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(0.0)
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            predictions_generated: self.predictions_generated.load(Ordering::Relaxed),
            prediction_failures: self.prediction_failures.load(Ordering::Relaxed),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
            alerts_resolved: self.alerts_resolved.load(Ordering::Relaxed),
            alerts_escalated: self.alerts_escalated.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            average_processing_time_ms: self.average_processing_ms(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct EngineCounters {
    pub predictions_generated: u64,
    pub prediction_failures: u64,
    pub alerts_triggered: u64,
    pub alerts_resolved: u64,
    pub alerts_escalated: u64,
    pub malformed_messages: u64,
    pub average_processing_time_ms: f64,
    pub uptime_secs: u64,
}

/// Point-in-time view returned by the query interface and flushed to the
/// store on every metrics tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub timestamp: DateTime<Utc>,
    pub engine: EngineCounters,
    pub events: BusStats,
    pub alerts: AlertStatusSummary,
    pub connections: ConnectionStats,
    pub notifications: DeliveryStats,
    pub dead_letters: u64,
    pub windows: Vec<WindowSummary>,
}

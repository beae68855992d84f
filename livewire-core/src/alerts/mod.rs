//! Rule evaluation, alert lifecycle, and notification delivery.
//!
//! Rules read window statistics through [`rules::MetricView`]; the engine
//! owns per-rule state and hands notifications to a bounded delivery pool.

pub mod anomaly;
pub mod channels;
pub mod engine;
pub mod notifications;
pub mod rules;

pub use anomaly::{AnomalyAssessment, AnomalyDetector};
pub use channels::{EmailChannel, LogChannel, MailTransport, NotificationChannel};
#[cfg(feature = "smtp")]
pub use channels::SmtpMailer;
#[cfg(feature = "webhook")]
pub use channels::WebhookChannel;
pub use engine::{AlertEngine, AlertStatusSummary, AlertTransition};
pub use notifications::{Notification, NotificationDispatcher, NotificationKind};
pub use rules::{
    default_rules, Aggregation, AlertCondition, AlertRule, AlertSeverity, Evaluation, MetricRef,
    MetricView,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub metric: String,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub current_value: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notified: bool,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn open(rule: &AlertRule, observed: f64, now: DateTime<Utc>) -> Self {
        let threshold = rule.condition.threshold();
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            metric: rule.metric.qualified(),
            severity: rule.severity,
            threshold,
            current_value: observed,
            message: format!(
                "Alert '{}' triggered for metric '{}'. Current value: {:.2}, Threshold: {:.2}. Condition: {}",
                rule.name,
                rule.metric,
                observed,
                threshold,
                rule.condition.describe()
            ),
            created_at: now,
            resolved_at: None,
            notified: false,
            escalated: false,
            escalated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

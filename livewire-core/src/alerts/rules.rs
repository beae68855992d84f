use super::anomaly::AnomalyAssessment;
use crate::window::KeyStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// One level up; critical stays critical.
    pub fn escalated(self) -> Self {
        match self {
            AlertSeverity::Low => AlertSeverity::Medium,
            AlertSeverity::Medium => AlertSeverity::High,
            AlertSeverity::High | AlertSeverity::Critical => AlertSeverity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which window statistic a threshold compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Latest,
    Average,
    Sum,
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricRef {
    pub window: String,
    pub key: String,
}

impl MetricRef {
    pub fn new(window: &str, key: &str) -> Self {
        Self {
            window: window.to_string(),
            key: key.to_string(),
        }
    }

    /// Name used for anomaly history and alert payloads.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.window, self.key)
    }
}

impl std::fmt::Display for MetricRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.window, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertCondition {
    ThresholdAbove {
        threshold: f64,
        #[serde(default)]
        aggregation: Aggregation,
        #[serde(default)]
        min_count: usize,
    },
    ThresholdBelow {
        threshold: f64,
        #[serde(default)]
        aggregation: Aggregation,
        #[serde(default)]
        min_count: usize,
    },
    AnomalyScore {
        threshold: f64,
    },
    RateOfChange {
        percent: f64,
    },
}

impl AlertCondition {
    pub fn above(threshold: f64) -> Self {
        AlertCondition::ThresholdAbove {
            threshold,
            aggregation: Aggregation::Latest,
            min_count: 0,
        }
    }

    pub fn below(threshold: f64) -> Self {
        AlertCondition::ThresholdBelow {
            threshold,
            aggregation: Aggregation::Latest,
            min_count: 0,
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            AlertCondition::ThresholdAbove { threshold, .. }
            | AlertCondition::ThresholdBelow { threshold, .. }
            | AlertCondition::AnomalyScore { threshold } => *threshold,
            AlertCondition::RateOfChange { percent } => *percent,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AlertCondition::ThresholdAbove { threshold, aggregation, .. } => {
                format!("{:?} > {}", aggregation, threshold).to_lowercase()
            }
            AlertCondition::ThresholdBelow { threshold, aggregation, .. } => {
                format!("{:?} < {}", aggregation, threshold).to_lowercase()
            }
            AlertCondition::AnomalyScore { threshold } => format!("anomaly score > {}", threshold),
            AlertCondition::RateOfChange { percent } => format!("change > {}%", percent),
        }
    }
}

/// Everything a condition may read about one metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricView {
    pub stats: KeyStats,
    pub anomaly: Option<AnomalyAssessment>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub triggered: bool,
    pub observed: Option<f64>,
}

impl Evaluation {
    fn quiet(observed: Option<f64>) -> Self {
        Self {
            triggered: false,
            observed,
        }
    }
}

pub fn evaluate(condition: &AlertCondition, view: &MetricView) -> Evaluation {
    match condition {
        AlertCondition::ThresholdAbove {
            threshold,
            aggregation,
            min_count,
        } => evaluate_threshold(view, *aggregation, *min_count, |v| v > *threshold),
        AlertCondition::ThresholdBelow {
            threshold,
            aggregation,
            min_count,
        } => evaluate_threshold(view, *aggregation, *min_count, |v| v < *threshold),
        AlertCondition::AnomalyScore { threshold } => evaluate_anomaly(view, *threshold),
        AlertCondition::RateOfChange { percent } => evaluate_rate_of_change(view, *percent),
    }
}

fn aggregate(stats: &KeyStats, aggregation: Aggregation) -> Option<f64> {
    match aggregation {
        Aggregation::Latest => stats.latest,
        Aggregation::Average if stats.count > 0 => Some(stats.average),
        Aggregation::Sum if stats.count > 0 => Some(stats.sum),
        Aggregation::Count => Some(stats.count as f64),
        _ => None,
    }
}

fn evaluate_threshold(
    view: &MetricView,
    aggregation: Aggregation,
    min_count: usize,
    crosses: impl Fn(f64) -> bool,
) -> Evaluation {
    let observed = aggregate(&view.stats, aggregation);
    match observed {
        Some(value) if view.stats.count >= min_count => Evaluation {
            triggered: crosses(value),
            observed,
        },
        _ => Evaluation::quiet(observed),
    }
}

fn evaluate_anomaly(view: &MetricView, threshold: f64) -> Evaluation {
    match view.anomaly {
        Some(a) => Evaluation {
            triggered: a.is_anomaly && a.score > threshold,
            observed: Some(a.score),
        },
        None => Evaluation::quiet(None),
    }
}

fn evaluate_rate_of_change(view: &MetricView, percent: f64) -> Evaluation {
    let (Some(latest), true) = (view.stats.latest, view.stats.count > 0) else {
        return Evaluation::quiet(None);
    };
    let average = view.stats.average;
    if average == 0.0 {
        return Evaluation::quiet(None);
    }
    let change = (latest - average).abs() / average.abs() * 100.0;
    Evaluation {
        triggered: change > percent,
        observed: Some(change),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub metric: MetricRef,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub cooldown_secs: u64,
    #[serde(default)]
    pub escalation_after_secs: Option<u64>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub escalation_channels: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    #[serde(default)]
    pub notify_on_resolve: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(id: &str, name: &str, metric: MetricRef, condition: AlertCondition) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            metric,
            condition,
            severity: AlertSeverity::Medium,
            cooldown_secs: 300,
            escalation_after_secs: None,
            channels: Vec::new(),
            escalation_channels: Vec::new(),
            auto_resolve: true,
            notify_on_resolve: false,
            enabled: true,
        }
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn escalate_after(mut self, secs: u64) -> Self {
        self.escalation_after_secs = Some(secs);
        self
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn escalation_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.escalation_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn evaluate(&self, view: &MetricView) -> Evaluation {
        if !self.enabled {
            return Evaluation::quiet(None);
        }
        evaluate(&self.condition, view)
    }
}

/// Rules installed when nothing has been persisted yet, notifying `channels`.
pub fn default_rules(channels: &[String]) -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high_odds_change",
            "High Odds Change",
            MetricRef::new("odds_changes", "magnitude"),
            AlertCondition::above(0.2),
        )
        .describe("Single odds movement larger than 0.2")
        .severity(AlertSeverity::Medium)
        .cooldown(300)
        .channels(channels.iter().cloned()),
        AlertRule::new(
            "low_prediction_accuracy",
            "Low Prediction Accuracy",
            MetricRef::new("prediction_accuracy", "accuracy"),
            AlertCondition::ThresholdBelow {
                threshold: 0.6,
                aggregation: Aggregation::Average,
                min_count: 10,
            },
        )
        .describe("Rolling prediction accuracy below 60%")
        .severity(AlertSeverity::Critical)
        .cooldown(600)
        .channels(channels.iter().cloned()),
        AlertRule::new(
            "high_prediction_latency",
            "High Prediction Latency",
            MetricRef::new("system_performance", "prediction_latency"),
            AlertCondition::ThresholdAbove {
                threshold: 1_000.0,
                aggregation: Aggregation::Average,
                min_count: 0,
            },
        )
        .describe("Average prediction latency above one second")
        .severity(AlertSeverity::Medium)
        .cooldown(180)
        .channels(channels.iter().cloned()),
        AlertRule::new(
            "odds_change_anomaly",
            "Odds Change Anomaly",
            MetricRef::new("odds_changes", "magnitude"),
            AlertCondition::AnomalyScore { threshold: 2.0 },
        )
        .describe("Odds movement far outside recent history")
        .severity(AlertSeverity::Medium)
        .cooldown(300)
        .escalate_after(900)
        .channels(channels.iter().cloned()),
    ]
}

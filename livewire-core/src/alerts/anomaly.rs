use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Observations needed before anything can be called anomalous.
pub const MIN_HISTORY: usize = 10;
/// Reported scores never exceed this multiple of the sensitivity.
pub const MAX_SCORE: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct AnomalyAssessment {
    pub value: f64,
    pub is_anomaly: bool,
    pub score: f64,
    pub z_score: f64,
    pub mean: f64,
    pub stddev: f64,
}

#[derive(Debug, Default)]
struct MetricHistory {
    values: VecDeque<f64>,
    last: Option<AnomalyAssessment>,
}

/// Z-score detector over the last N raw observations of each metric.
#[derive(Debug)]
pub struct AnomalyDetector {
    sensitivity: f64,
    history_size: usize,
    metrics: Mutex<HashMap<String, MetricHistory>>,
}

impl AnomalyDetector {
    pub fn new(sensitivity: f64, history_size: usize) -> Self {
        Self {
            sensitivity,
            history_size: history_size.max(MIN_HISTORY),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Scores `value` against the prior history, then appends it.
    pub fn observe(&self, metric: &str, value: f64) -> AnomalyAssessment {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let history = metrics.entry(metric.to_string()).or_default();

        let assessment = assess(&history.values, value, self.sensitivity);
        history.values.push_back(value);
        while history.values.len() > self.history_size {
            history.values.pop_front();
        }
        history.last = Some(assessment);
        assessment
    }

    /// Appends prior observations without assessing them, so the last
    /// assessment is left untouched.
    pub fn seed(&self, metric: &str, values: impl IntoIterator<Item = f64>) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let history = metrics.entry(metric.to_string()).or_default();
        history.values.extend(values);
        while history.values.len() > self.history_size {
            history.values.pop_front();
        }
    }

    /// Scores `value` without recording it.
    pub fn score(&self, metric: &str, value: f64) -> AnomalyAssessment {
        let metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        match metrics.get(metric) {
            Some(history) => assess(&history.values, value, self.sensitivity),
            None => AnomalyAssessment {
                value,
                ..Default::default()
            },
        }
    }

    pub fn last_assessment(&self, metric: &str) -> Option<AnomalyAssessment> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(metric)
            .and_then(|h| h.last)
    }

    pub fn history_len(&self, metric: &str) -> usize {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(metric)
            .map_or(0, |h| h.values.len())
    }
}

fn assess(history: &VecDeque<f64>, value: f64, sensitivity: f64) -> AnomalyAssessment {
    let mut assessment = AnomalyAssessment {
        value,
        ..Default::default()
    };
    if history.len() < MIN_HISTORY {
        return assessment;
    }

    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    // sample standard deviation
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stddev = variance.sqrt();
    assessment.mean = mean;
    assessment.stddev = stddev;

    if stddev == 0.0 || !stddev.is_finite() {
        return assessment;
    }

    let z = (value - mean).abs() / stddev;
    assessment.z_score = z;
    assessment.is_anomaly = z > sensitivity;
    assessment.score = if sensitivity > 0.0 {
        (z / sensitivity).min(MAX_SCORE)
    } else {
        0.0
    };
    assessment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_minimum_history() {
        let detector = AnomalyDetector::new(2.0, 100);
        for v in 0..9 {
            assert!(!detector.observe("m", v as f64).is_anomaly);
        }
        assert!(!detector.observe("m", 1_000.0).is_anomaly);
    }

    #[test]
    fn seeded_history_counts_without_an_assessment() {
        let detector = AnomalyDetector::new(2.0, 100);
        detector.seed("odds", (0..12).map(|i| 1.0 + (i % 3) as f64 * 0.1));
        assert_eq!(detector.history_len("odds"), 12);
        assert!(detector.last_assessment("odds").is_none());
        assert!(detector.observe("odds", 9.0).is_anomaly);
    }

    #[test]
    fn flat_history_is_never_anomalous() {
        let detector = AnomalyDetector::new(2.0, 100);
        for _ in 0..20 {
            detector.observe("flat", 5.0);
        }
        let assessment = detector.score("flat", 500.0);
        assert!(!assessment.is_anomaly);
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.stddev, 0.0);
    }

    #[test]
    fn outlier_flagged_and_score_capped() {
        let detector = AnomalyDetector::new(2.0, 100);
        for i in 0..20 {
            detector.observe("odds", if i % 2 == 0 { 1.0 } else { 2.0 });
        }
        let assessment = detector.observe("odds", 100.0);
        assert!(assessment.is_anomaly);
        assert_eq!(assessment.score, MAX_SCORE);
        assert_eq!(detector.last_assessment("odds"), Some(assessment));

        let normal = detector.score("odds", 1.5);
        assert!(!normal.is_anomaly);
    }

    #[test]
    fn history_is_bounded() {
        let detector = AnomalyDetector::new(2.0, 12);
        for i in 0..50 {
            detector.observe("m", i as f64);
        }
        assert_eq!(detector.history_len("m"), 12);
    }
}

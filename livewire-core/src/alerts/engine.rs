use super::anomaly::AnomalyDetector;
use super::notifications::{Notification, NotificationDispatcher, NotificationKind};
use super::rules::{AlertRule, MetricRef, MetricView};
use super::Alert;
use crate::clock::SharedClock;
use crate::error::{LivewireError, Result};
use crate::window::WindowSet;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// What an evaluation changed. Evaluations that leave a rule where it was
/// (including a still-true condition on an active alert) yield nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Triggered(Alert),
    Escalated(Alert),
    Resolved(Alert),
}

impl AlertTransition {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertTransition::Triggered(a)
            | AlertTransition::Escalated(a)
            | AlertTransition::Resolved(a) => a,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AlertStatusSummary {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub active_alerts: usize,
    pub rules_in_cooldown: usize,
    pub resolved_in_history: usize,
}

#[derive(Debug, Default)]
struct RuleState {
    active: Option<Alert>,
    last_resolved_at: Option<DateTime<Utc>>,
    // cooldown in force at the last resolution, outlives a removed rule
    cooldown_secs: u64,
}

impl RuleState {
    fn resolve(&mut self, now: DateTime<Utc>, cooldown_secs: u64) -> Option<Alert> {
        let mut alert = self.active.take()?;
        alert.resolved_at = Some(now);
        self.last_resolved_at = Some(now);
        self.cooldown_secs = cooldown_secs;
        Some(alert)
    }
}

type RuleStates = Arc<Mutex<HashMap<String, RuleState>>>;
type History = Arc<Mutex<VecDeque<Alert>>>;

/// Per-rule state machine: inactive, active, resolved back to inactive.
///
/// A rule holds at most one active alert. It re-triggers only after its
/// cooldown has elapsed since the previous resolution.
pub struct AlertEngine {
    rules: RwLock<HashMap<String, AlertRule>>,
    states: RuleStates,
    history: History,
    history_limit: usize,
    windows: Arc<WindowSet>,
    detector: AnomalyDetector,
    notifier: Arc<NotificationDispatcher>,
    clock: SharedClock,
}

impl AlertEngine {
    pub fn new(
        windows: Arc<WindowSet>,
        detector: AnomalyDetector,
        notifier: Arc<NotificationDispatcher>,
        clock: SharedClock,
        history_limit: usize,
    ) -> Self {
        let states: RuleStates = Arc::new(Mutex::new(HashMap::new()));
        let history: History = Arc::new(Mutex::new(VecDeque::new()));

        let delivered_states = Arc::clone(&states);
        let delivered_history = Arc::clone(&history);
        notifier.on_delivered(Arc::new(move |notification: &Notification| {
            mark_notified(&delivered_states, &delivered_history, notification);
        }));

        Self {
            rules: RwLock::new(HashMap::new()),
            states,
            history,
            history_limit: history_limit.max(1),
            windows,
            detector,
            notifier,
            clock,
        }
    }

    pub fn set_rules(&self, rules: Vec<AlertRule>) {
        let mut map = self.rules.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for rule in rules {
            map.insert(rule.id.clone(), rule);
        }
        tracing::info!(rules = map.len(), "Alert rules loaded");
    }

    pub fn upsert_rule(&self, rule: AlertRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(LivewireError::malformed("rule id must not be empty"));
        }
        tracing::info!(rule_id = %rule.id, "Alert rule saved");
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Removes a rule, resolving its active alert if it had one. The
    /// resolution still starts a cooldown, so re-adding the rule does not
    /// fire again before it expires.
    pub fn remove_rule(&self, rule_id: &str) -> Option<AlertTransition> {
        let removed = self
            .rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rule_id)?;

        let now = self.clock.now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let alert = states.get_mut(rule_id)?.resolve(now, removed.cooldown_secs)?;
        self.push_history(alert.clone());
        drop(states);
        Some(AlertTransition::Resolved(alert))
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(rule_id)
            .cloned()
    }

    /// Feeds a raw observation to the anomaly detector.
    pub fn observe(&self, metric: &MetricRef, value: f64) {
        self.detector.observe(&metric.qualified(), value);
    }

    /// Rebuilds anomaly history from restored window points.
    pub fn seed_history(&self, metric: &MetricRef, values: Vec<f64>) {
        self.detector.seed(&metric.qualified(), values);
    }

    pub fn view(&self, metric: &MetricRef) -> MetricView {
        MetricView {
            stats: self
                .windows
                .stats(&metric.window, &metric.key, self.clock.now()),
            anomaly: self.detector.last_assessment(&metric.qualified()),
        }
    }

    /// Evaluates the rules watching one window key.
    pub fn evaluate_metric(&self, window: &str, key: &str) -> Vec<AlertTransition> {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.metric.window == window && r.metric.key == key)
            .cloned()
            .collect();
        self.evaluate_rules(rules)
    }

    /// Evaluates every rule, used by the periodic timer.
    pub fn evaluate_all(&self) -> Vec<AlertTransition> {
        self.evaluate_rules(self.rules())
    }

    fn evaluate_rules(&self, rules: Vec<AlertRule>) -> Vec<AlertTransition> {
        let mut views: HashMap<MetricRef, MetricView> = HashMap::new();
        let mut transitions = Vec::new();
        for rule in rules {
            let view = *views
                .entry(rule.metric.clone())
                .or_insert_with(|| self.view(&rule.metric));
            if let Some(transition) = self.evaluate_rule(&rule, &view) {
                transitions.push(transition);
            }
        }
        transitions
    }

    /// Applies one evaluation to a rule's state and dispatches notifications
    /// for whatever changed.
    pub fn evaluate_rule(&self, rule: &AlertRule, view: &MetricView) -> Option<AlertTransition> {
        let evaluation = rule.evaluate(view);
        let now = self.clock.now();

        let transition = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let state = states.entry(rule.id.clone()).or_default();

            if state.active.is_some() && !evaluation.triggered && rule.auto_resolve {
                let resolved = state.resolve(now, rule.cooldown_secs)?;
                // history is written under the state lock, see mark_notified
                self.push_history(resolved.clone());
                Some(AlertTransition::Resolved(resolved))
            } else if let Some(alert) = state.active.as_mut() {
                if let Some(observed) = evaluation.observed.filter(|_| evaluation.triggered) {
                    alert.current_value = observed;
                }
                if should_escalate(rule, alert, now) {
                    alert.escalated = true;
                    alert.escalated_at = Some(now);
                    Some(AlertTransition::Escalated(alert.clone()))
                } else {
                    None
                }
            } else if !evaluation.triggered {
                None
            } else if in_cooldown(rule.cooldown_secs, state.last_resolved_at, now) {
                tracing::debug!(rule_id = %rule.id, "Condition true but rule is cooling down");
                None
            } else {
                let alert = Alert::open(rule, evaluation.observed.unwrap_or_default(), now);
                state.active = Some(alert.clone());
                Some(AlertTransition::Triggered(alert))
            }
        }?;

        match &transition {
            AlertTransition::Triggered(alert) => {
                tracing::warn!(rule_id = %rule.id, alert_id = %alert.id, severity = %alert.severity, value = alert.current_value, "Alert triggered");
                self.notify(rule, alert, NotificationKind::Triggered);
            }
            AlertTransition::Escalated(alert) => {
                tracing::warn!(rule_id = %rule.id, alert_id = %alert.id, "Alert escalated");
                self.notify(rule, alert, NotificationKind::Escalated);
            }
            AlertTransition::Resolved(alert) => {
                tracing::info!(rule_id = %rule.id, alert_id = %alert.id, "Alert resolved");
                if rule.notify_on_resolve {
                    self.notify(rule, alert, NotificationKind::Resolved);
                }
            }
        }
        Some(transition)
    }

    fn notify(&self, rule: &AlertRule, alert: &Alert, kind: NotificationKind) {
        let (severity, channels) = match kind {
            NotificationKind::Escalated => {
                let mut channels = rule.channels.clone();
                for extra in &rule.escalation_channels {
                    if !channels.contains(extra) {
                        channels.push(extra.clone());
                    }
                }
                (rule.severity.escalated(), channels)
            }
            _ => (rule.severity, rule.channels.clone()),
        };
        if channels.is_empty() {
            return;
        }
        let notification = Notification {
            alert: alert.clone(),
            kind,
            severity,
            channels,
        };
        if let Err(e) = self.notifier.enqueue(notification) {
            tracing::error!(alert_id = %alert.id, error = %e, "Could not queue notification");
        }
    }

    fn push_history(&self, alert: Alert) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(alert);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|s| s.active.clone())
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        alerts
    }

    pub fn active_alert(&self, rule_id: &str) -> Option<Alert> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(rule_id)
            .and_then(|s| s.active.clone())
    }

    /// Most recent resolved alerts, newest last.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .skip(history.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Forgets resolution times whose cooldown has fully elapsed, including
    /// those of removed rules. Returns the number of entries dropped.
    pub fn cleanup_cooldowns(&self) -> usize {
        let now = self.clock.now();
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let before = states.len();
        states.retain(|rule_id, state| {
            if state.active.is_some() {
                return true;
            }
            let cooldown_secs = rules.get(rule_id).map_or(state.cooldown_secs, |r| r.cooldown_secs);
            in_cooldown(cooldown_secs, state.last_resolved_at, now)
        });
        before - states.len()
    }

    pub fn status(&self) -> AlertStatusSummary {
        let now = self.clock.now();
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        AlertStatusSummary {
            total_rules: rules.len(),
            enabled_rules: rules.values().filter(|r| r.enabled).count(),
            active_alerts: states.values().filter(|s| s.active.is_some()).count(),
            rules_in_cooldown: states
                .iter()
                .filter(|(id, s)| {
                    s.active.is_none()
                        && rules
                            .get(*id)
                            .is_some_and(|r| in_cooldown(r.cooldown_secs, s.last_resolved_at, now))
                })
                .count(),
            resolved_in_history: self.history.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}

fn in_cooldown(cooldown_secs: u64, last_resolved_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_resolved_at.is_some_and(|resolved| now - resolved < Duration::seconds(cooldown_secs as i64))
}

fn should_escalate(rule: &AlertRule, alert: &Alert, now: DateTime<Utc>) -> bool {
    match rule.escalation_after_secs {
        Some(after) if !alert.escalated => now - alert.created_at >= Duration::seconds(after as i64),
        _ => false,
    }
}

fn mark_notified(states: &RuleStates, history: &History, notification: &Notification) {
    let alert_id = &notification.alert.id;
    let mut states = states.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(alert) = states
        .get_mut(&notification.alert.rule_id)
        .and_then(|s| s.active.as_mut())
        .filter(|a| &a.id == alert_id)
    {
        alert.notified = true;
        return;
    }
    drop(states);
    let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(alert) = history.iter_mut().rev().find(|a| &a.id == alert_id) {
        alert.notified = true;
    }
}

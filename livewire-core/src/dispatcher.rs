//! Wires the bus, windows, registry and alert engine into one engine
//! instance with an explicit start/stop lifecycle.

use crate::alerts::{
    default_rules, Alert, AlertEngine, AlertRule, AlertTransition, AnomalyDetector, LogChannel,
    MetricRef, NotificationChannel, NotificationDispatcher,
};
use crate::bus::{EventBus, EventHandler};
use crate::circuit_breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitBreakerRegistry};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::dead_letter::DeadLetterLog;
use crate::error::{LivewireError, Result};
use crate::event::{Event, EventType, AVAILABLE_TOPICS, TOPIC_ALERTS, TOPIC_SYSTEM_METRICS};
use crate::message::{
    parse_client_message, AlertStatus, ClientMessage, Outbound, QueryType, RuleOperation,
    ServerMessage, SubscriptionAction,
};
use crate::metrics::{EngineMetrics, MetricsSummary};
use crate::persistence::{KeyValueStore, Persistence};
use crate::predictor::{Prediction, Predictor};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::window::{KeyStats, WindowSet};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const SYSTEM_WINDOW: &str = "system_performance";
pub const PROCESSING_TIME_KEY: &str = "event_processing_time";
pub const PREDICTION_LATENCY_KEY: &str = "prediction_latency";

/// External collaborators injected into an engine instance.
pub struct Collaborators {
    pub predictor: Option<Arc<dyn Predictor>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub channels: Vec<Arc<dyn NotificationChannel>>,
    pub clock: SharedClock,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            predictor: None,
            store: None,
            channels: vec![Arc::new(LogChannel)],
            clock: Arc::new(SystemClock),
        }
    }
}

/// State shared by the workers, the periodic tasks and the connection API.
struct Core {
    config: EngineConfig,
    bus: EventBus,
    windows: Arc<WindowSet>,
    registry: ConnectionRegistry,
    engine: AlertEngine,
    notifier: Arc<NotificationDispatcher>,
    predictor: Option<Arc<dyn Predictor>>,
    predictor_breaker: CircuitBreaker,
    persistence: Persistence,
    metrics: EngineMetrics,
    default_channels: Vec<String>,
    clock: SharedClock,
}

pub struct Dispatcher {
    core: Arc<Core>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let clock = collaborators.clock;

        let windows = Arc::new(WindowSet::with_windows(
            config.window_span(),
            config.window_max_points,
            config.windows.iter().map(String::as_str),
        ));

        let dead_letters = Arc::new(match &config.dead_letter_path {
            Some(path) => DeadLetterLog::with_file(config.dead_letter_capacity, path)?,
            None => DeadLetterLog::in_memory(config.dead_letter_capacity),
        });
        let notifier = Arc::new(NotificationDispatcher::new(
            config.notification_workers,
            config.notification_queue_capacity,
            CircuitBreakerRegistry::new(BreakerConfig::default()),
            dead_letters,
        ));
        let mut default_channels = config.default_channels.clone();
        if default_channels.is_empty() {
            default_channels = collaborators
                .channels
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }
        for channel in collaborators.channels {
            notifier.register_channel(channel);
        }

        let engine = AlertEngine::new(
            Arc::clone(&windows),
            AnomalyDetector::new(config.anomaly_sensitivity, config.anomaly_history),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.alert_history_limit,
        );

        let registry = ConnectionRegistry::new(
            Arc::clone(&clock),
            config.connection_buffer,
            config.write_timeout(),
            config.pong_timeout(),
        );

        let core = Core {
            bus: EventBus::new(config.queue_capacity),
            windows,
            registry,
            engine,
            notifier,
            predictor: collaborators.predictor,
            predictor_breaker: CircuitBreaker::new("predictor", BreakerConfig::default()),
            persistence: Persistence::new(collaborators.store),
            metrics: EngineMetrics::default(),
            default_channels,
            clock,
            config,
        };

        Ok(Self {
            core: Arc::new(core),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Loads rules and snapshots, then starts workers and periodic tasks.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let core = &self.core;
        core.load_rules().await;
        core.restore_snapshots().await;

        core.notifier.start();
        core.bus.start(
            Arc::clone(&self.core) as Arc<dyn EventHandler>,
            core.config.worker_count,
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(spawn_periodic(
            Arc::clone(core),
            core.config.evaluation_interval_secs,
            |core| async move { core.scheduled_evaluation().await },
        ));
        tasks.push(spawn_periodic(
            Arc::clone(core),
            core.config.ping_interval_secs,
            |core| async move { core.liveness_check().await },
        ));
        tasks.push(spawn_periodic(
            Arc::clone(core),
            core.config.metrics_flush_interval_secs,
            |core| async move { core.flush_metrics().await },
        ));
        tasks.push(spawn_periodic(
            Arc::clone(core),
            core.config.cooldown_cleanup_interval_secs,
            |core| async move {
                let dropped = core.engine.cleanup_cooldowns();
                if dropped > 0 {
                    tracing::debug!(dropped, "Expired cooldowns cleaned up");
                }
            },
        ));

        tracing::info!(
            workers = core.config.worker_count,
            queue_capacity = core.config.queue_capacity,
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stops intake, drains the queue within the grace period, closes every
    /// connection and cancels the periodic tasks.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let core = &self.core;
        let grace = core.config.shutdown_grace();
        let report = core.bus.shutdown(grace).await;

        core.registry.close_all().await;
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }

        core.flush_metrics().await;
        core.notifier.shutdown(grace).await;
        tracing::info!(drained = report.drained, aborted = report.aborted_workers, "Dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn publish(&self, event: Event) -> Result<()> {
        self.core.bus.publish(event)
    }

    pub async fn publish_blocking(&self, event: Event) -> Result<()> {
        self.core.bus.publish_blocking(event).await
    }

    /// Processes one event inline, bypassing the queue.
    pub async fn process(&self, event: Event) -> Result<()> {
        self.core.handle_event(event).await
    }

    /// Registers a client connection and queues its welcome message.
    pub async fn connect(&self) -> Result<(ConnectionId, mpsc::Receiver<Outbound>)> {
        let core = &self.core;
        let (id, receiver) = core.registry.register().await;
        let welcome = ServerMessage::ConnectionEstablished {
            connection_id: id.to_string(),
            server_time: core.clock.now(),
            available_topics: AVAILABLE_TOPICS.iter().map(|t| t.to_string()).collect(),
        };
        core.registry.send_to(&id, welcome.to_frame()?).await?;
        Ok((id, receiver))
    }

    pub async fn disconnect(&self, id: &ConnectionId) {
        self.core.registry.unregister(id).await;
    }

    /// Handles one inbound text frame. Errors are reported to that
    /// connection as an error frame; the connection stays open.
    pub async fn handle_client_message(&self, id: &ConnectionId, text: &str) {
        let core = &self.core;
        core.registry.touch(id).await;

        let reply = match parse_client_message(text) {
            Ok(message) => core.client_message(id, message).await,
            Err(err) => {
                core.metrics.record_malformed();
                tracing::debug!(connection_id = %id, error = %err, "Rejected client message");
                Some(ServerMessage::error(&err))
            }
        };

        if let Some(reply) = reply {
            match reply.to_frame() {
                Ok(frame) => {
                    if let Err(e) = core.registry.send_to(id, frame).await {
                        tracing::debug!(connection_id = %id, error = %e, "Reply not delivered");
                    }
                }
                Err(e) => tracing::error!(connection_id = %id, error = %e, "Reply serialization failed"),
            }
        }
    }

    /// Records a pong or any other sign of life from a connection.
    pub async fn client_alive(&self, id: &ConnectionId) {
        self.core.registry.touch(id).await;
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    pub async fn metrics_summary(&self) -> MetricsSummary {
        self.core.metrics_summary().await
    }

    pub fn window_stats(&self, window: &str, key: &str) -> KeyStats {
        self.core.windows.stats(window, key, self.core.clock.now())
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.core.engine.active_alerts()
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.core.engine.history(limit)
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.core.engine.rules()
    }

    pub async fn upsert_rule(&self, rule: AlertRule) -> Result<()> {
        self.core.upsert_rule(rule).await
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        self.core.remove_rule(rule_id).await
    }

    /// Runs one full rule evaluation now, as the periodic timer does.
    pub async fn evaluate_now(&self) -> Vec<AlertTransition> {
        self.core.scheduled_evaluation().await
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterLog> {
        Arc::clone(self.core.notifier.dead_letters())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.core.bus.close();
        for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

fn spawn_periodic<F, Fut>(core: Arc<Core>, every_secs: u64, task: F) -> JoinHandle<()>
where
    F: Fn(Arc<Core>) -> Fut + Send + 'static,
    Fut: std::future::Future + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            task(Arc::clone(&core)).await;
        }
    })
}

#[async_trait]
impl EventHandler for Core {
    async fn handle(&self, event: Event) -> Result<()> {
        self.handle_event(event).await
    }
}

impl Core {
    async fn handle_event(&self, event: Event) -> Result<()> {
        let started = Instant::now();
        let mut touched = self.update_windows(&event);

        let mut data = event.payload.clone();
        if event.event_type == EventType::PredictionRequest {
            if let Some(features) = event.payload.get("features").and_then(Value::as_object) {
                let model_id = event.payload.get("model_id").and_then(Value::as_str);
                let (prediction, _) = self.predict(model_id, features).await?;
                data.insert("prediction".into(), Value::from(prediction.value));
                data.insert("confidence_score".into(), Value::from(prediction.confidence));
                data.insert("model_version".into(), Value::from(prediction.model_version));
                touched.push(MetricRef::new(SYSTEM_WINDOW, PREDICTION_LATENCY_KEY));
            }
        }

        if let Some(topic) = event.event_type.topic() {
            let message = ServerMessage::EventBroadcast {
                topic: topic.to_string(),
                event_type: event.event_type,
                timestamp: event.timestamp,
                source: event.source.clone(),
                data,
            };
            let report = self.registry.broadcast(topic, message.to_frame()?).await;
            tracing::debug!(event_id = %event.id, topic, delivered = report.delivered, dropped = report.dropped, "Event broadcast");
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.metrics.record_processing_time(elapsed_ms);
        self.record_metric(SYSTEM_WINDOW, PROCESSING_TIME_KEY, elapsed_ms);
        touched.push(MetricRef::new(SYSTEM_WINDOW, PROCESSING_TIME_KEY));

        touched.sort_by(|a, b| (&a.window, &a.key).cmp(&(&b.window, &b.key)));
        touched.dedup();
        let mut transitions = Vec::new();
        for metric in &touched {
            transitions.extend(self.engine.evaluate_metric(&metric.window, &metric.key));
        }
        self.publish_transitions(transitions).await;
        Ok(())
    }

    /// Applies the configured metric mappings for this event type.
    fn update_windows(&self, event: &Event) -> Vec<MetricRef> {
        let mut per_window: HashMap<&str, HashMap<String, f64>> = HashMap::new();
        for mapping in self
            .config
            .metric_mappings
            .iter()
            .filter(|m| m.event_type == event.event_type)
        {
            let Some(mut value) = event.number(&mapping.field) else {
                continue;
            };
            if mapping.absolute {
                value = value.abs();
            }
            per_window
                .entry(mapping.window.as_str())
                .or_default()
                .insert(mapping.key.clone(), value);
        }

        let mut touched = Vec::new();
        for (window, values) in per_window {
            let observed: Vec<(String, f64)> = values.iter().map(|(k, v)| (k.clone(), *v)).collect();
            if !self.windows.add_point(window, event.timestamp, values) {
                tracing::debug!(event_id = %event.id, window, "Point outside window span dropped");
                continue;
            }
            for (key, value) in observed {
                let metric = MetricRef::new(window, &key);
                self.engine.observe(&metric, value);
                touched.push(metric);
            }
        }
        touched
    }

    fn record_metric(&self, window: &str, key: &str, value: f64) {
        let values = HashMap::from([(key.to_string(), value)]);
        if self.windows.add_point(window, self.clock.now(), values) {
            self.engine.observe(&MetricRef::new(window, key), value);
        }
    }

    async fn predict(&self, model_id: Option<&str>, features: &Map<String, Value>) -> Result<(Prediction, f64)> {
        let predictor = self
            .predictor
            .as_ref()
            .ok_or_else(|| LivewireError::dependency("predictor", "no predictor configured"))?;

        let started = Instant::now();
        let result = self
            .predictor_breaker
            .call(|| predictor.predict(model_id, features))
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.record_metric(SYSTEM_WINDOW, PREDICTION_LATENCY_KEY, elapsed_ms);

        match result {
            Ok(prediction) => {
                self.metrics.record_prediction(true);
                Ok((prediction, elapsed_ms))
            }
            Err(err) => {
                self.metrics.record_prediction(false);
                Err(match err {
                    BreakerError::Inner(e @ LivewireError::DependencyFailure { .. }) => e,
                    BreakerError::Inner(e) => LivewireError::dependency("predictor", e.to_string()),
                    other => LivewireError::dependency("predictor", other.to_string()),
                })
            }
        }
    }

    async fn client_message(&self, id: &ConnectionId, message: ClientMessage) -> Option<ServerMessage> {
        match message {
            ClientMessage::Subscribe { topics } => {
                let outcome = self.registry.subscribe(id, &topics).await.ok()?;
                Some(ServerMessage::SubscriptionAck {
                    action: SubscriptionAction::Subscribe,
                    topics: outcome.accepted,
                    rejected: outcome.rejected,
                })
            }
            ClientMessage::Unsubscribe { topics } => {
                let outcome = self.registry.unsubscribe(id, &topics).await.ok()?;
                Some(ServerMessage::SubscriptionAck {
                    action: SubscriptionAction::Unsubscribe,
                    topics: outcome.accepted,
                    rejected: outcome.rejected,
                })
            }
            ClientMessage::Ping => Some(ServerMessage::Pong {
                timestamp: self.clock.now(),
            }),
            ClientMessage::AnalyticsQuery {
                query_id,
                query_type,
                window_name,
                metric_name,
            } => {
                let answer = match query_type {
                    QueryType::MetricsSummary => {
                        serde_json::to_value(self.metrics_summary().await).map_err(LivewireError::from)
                    }
                    QueryType::SlidingWindowData => {
                        self.window_data(window_name.as_deref(), metric_name.as_deref())
                    }
                };
                Some(match answer {
                    Ok(data) => ServerMessage::AnalyticsResponse {
                        query_id,
                        query_type,
                        data,
                        timestamp: self.clock.now(),
                    },
                    Err(err) => ServerMessage::AnalyticsError {
                        query_id,
                        error: err.to_string(),
                        timestamp: self.clock.now(),
                    },
                })
            }
            ClientMessage::AlertRule {
                operation,
                rule_id,
                rule,
            } => {
                let applied = match (operation, rule) {
                    (RuleOperation::Delete, _) => self.remove_rule(&rule_id).await,
                    (RuleOperation::Create | RuleOperation::Update, Some(mut rule)) => {
                        rule.id = rule_id.clone();
                        if let Err(err) = self.upsert_rule(rule).await {
                            return Some(ServerMessage::error(&err));
                        }
                        true
                    }
                    (_, None) => false,
                };
                tracing::info!(connection_id = %id, rule_id = %rule_id, ?operation, applied, "Alert rule edited by client");
                Some(ServerMessage::AlertRuleAck {
                    operation,
                    rule_id,
                    applied,
                    timestamp: self.clock.now(),
                })
            }
            ClientMessage::PredictionRequest {
                request_id,
                model_id,
                features,
            } => {
                let reply = match self.predict(model_id.as_deref(), &features).await {
                    Ok((prediction, elapsed_ms)) => ServerMessage::PredictionResponse {
                        request_id,
                        prediction: prediction.value,
                        confidence_score: prediction.confidence,
                        model_version: prediction.model_version,
                        processing_time_ms: elapsed_ms,
                        timestamp: self.clock.now(),
                    },
                    Err(err) => {
                        tracing::warn!(connection_id = %id, request_id = %request_id, error = %err, "Prediction failed");
                        ServerMessage::PredictionError {
                            request_id,
                            error: err.to_string(),
                            timestamp: self.clock.now(),
                        }
                    }
                };
                let transitions = self
                    .engine
                    .evaluate_metric(SYSTEM_WINDOW, PREDICTION_LATENCY_KEY);
                self.publish_transitions(transitions).await;
                Some(reply)
            }
        }
    }

    async fn upsert_rule(&self, rule: AlertRule) -> Result<()> {
        self.engine.upsert_rule(rule)?;
        self.persist_rules().await;
        Ok(())
    }

    async fn remove_rule(&self, rule_id: &str) -> bool {
        let existed = self.engine.rule(rule_id).is_some();
        if let Some(transition) = self.engine.remove_rule(rule_id) {
            self.publish_transitions(vec![transition]).await;
        }
        if existed {
            self.persist_rules().await;
        }
        existed
    }

    fn window_data(&self, window: Option<&str>, key: Option<&str>) -> Result<Value> {
        let (Some(window), Some(key)) = (window, key) else {
            return Err(LivewireError::malformed("window_name and metric_name are required"));
        };
        if !self.windows.names().iter().any(|name| name == window) {
            return Err(LivewireError::malformed(format!("unknown window '{}'", window)));
        }
        let stats = self.windows.stats(window, key, self.clock.now());
        Ok(serde_json::json!({
            "window_name": window,
            "metric_name": key,
            "average": stats.average,
            "sum": stats.sum,
            "count": stats.count,
            "latest": stats.latest,
        }))
    }

    async fn publish_transitions(&self, transitions: Vec<AlertTransition>) {
        if transitions.is_empty() {
            return;
        }
        let (mut triggered, mut resolved, mut escalated) = (0, 0, 0);
        for transition in transitions {
            let status = match &transition {
                AlertTransition::Triggered(_) => {
                    triggered += 1;
                    AlertStatus::Triggered
                }
                AlertTransition::Escalated(_) => {
                    escalated += 1;
                    AlertStatus::Escalated
                }
                AlertTransition::Resolved(_) => {
                    resolved += 1;
                    AlertStatus::Resolved
                }
            };
            let message = ServerMessage::Alert {
                topic: TOPIC_ALERTS.to_string(),
                status,
                timestamp: self.clock.now(),
                data: serde_json::to_value(transition.alert()).unwrap_or_default(),
            };
            match message.to_frame() {
                Ok(frame) => {
                    self.registry.broadcast(TOPIC_ALERTS, frame).await;
                }
                Err(e) => tracing::error!(error = %e, "Alert serialization failed"),
            }
        }
        self.metrics.record_alerts(triggered, resolved, escalated);
    }

    async fn scheduled_evaluation(&self) -> Vec<AlertTransition> {
        let transitions = self.engine.evaluate_all();
        self.publish_transitions(transitions.clone()).await;
        transitions
    }

    async fn liveness_check(&self) {
        let pinged = self.registry.ping_all().await;
        if pinged == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_secs(self.config.pong_timeout_secs)).await;
        let reaped = self.registry.reap_stale().await;
        if !reaped.is_empty() {
            tracing::info!(reaped = reaped.len(), "Unresponsive connections removed");
        }
    }

    async fn metrics_summary(&self) -> MetricsSummary {
        MetricsSummary {
            timestamp: self.clock.now(),
            engine: self.metrics.counters(),
            events: self.bus.stats(),
            alerts: self.engine.status(),
            connections: self.registry.stats().await,
            notifications: self.notifier.stats(),
            dead_letters: self.notifier.dead_letters().total(),
            windows: self.windows.summaries(self.clock.now()),
        }
    }

    async fn flush_metrics(&self) {
        let summary = self.metrics_summary().await;
        if let Err(e) = self.persistence.save_metrics(&summary).await {
            tracing::warn!(error = %e, "Metrics flush failed");
        }
        for snapshot in self.windows.snapshots() {
            if let Err(e) = self.persistence.save_snapshot(&snapshot).await {
                tracing::warn!(window = %snapshot.name, error = %e, "Window snapshot failed");
            }
        }

        let message = ServerMessage::MetricsUpdate {
            topic: TOPIC_SYSTEM_METRICS.to_string(),
            timestamp: summary.timestamp,
            data: serde_json::to_value(&summary).unwrap_or_default(),
        };
        if let Ok(frame) = message.to_frame() {
            self.registry.broadcast(TOPIC_SYSTEM_METRICS, frame).await;
        }
    }

    async fn load_rules(&self) {
        match self.persistence.load_rules().await {
            Ok(Some(rules)) => self.engine.set_rules(rules),
            Ok(None) => {
                self.engine.set_rules(default_rules(&self.default_channels));
                self.persist_rules().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not load alert rules, using defaults");
                self.engine.set_rules(default_rules(&self.default_channels));
            }
        }
    }

    async fn persist_rules(&self) {
        if let Err(e) = self.persistence.save_rules(&self.engine.rules()).await {
            tracing::warn!(error = %e, "Could not persist alert rules");
        }
    }

    async fn restore_snapshots(&self) {
        for name in self.windows.names() {
            match self.persistence.load_snapshot(&name).await {
                Ok(Some(snapshot)) => {
                    let points = snapshot.points.len();
                    let mut history: HashMap<String, Vec<f64>> = HashMap::new();
                    for point in &snapshot.points {
                        for (key, value) in &point.values {
                            history.entry(key.clone()).or_default().push(*value);
                        }
                    }
                    self.windows.restore(snapshot);
                    for (key, values) in history {
                        self.engine.seed_history(&MetricRef::new(&name, &key), values);
                    }
                    tracing::info!(window = %name, points, "Window restored from snapshot");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(window = %name, error = %e, "Window snapshot unreadable"),
            }
        }
    }
}

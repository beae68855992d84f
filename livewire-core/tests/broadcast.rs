//! Client-facing behavior of the dispatcher: topic fan-out, slow or dead
//! subscribers, malformed frames and prediction requests.

use async_trait::async_trait;
use livewire_core::{
    Collaborators, Dispatcher, EngineConfig, Event, EventType, LivewireError, Outbound, Prediction,
    Predictor, QueryType, Result, RuleOperation, ServerMessage,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

struct FixedPredictor;

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, model_id: Option<&str>, features: &Map<String, Value>) -> Result<Prediction> {
        let home = features.get("home_rating").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(Prediction {
            value: home / 100.0,
            confidence: 0.8,
            model_version: model_id.unwrap_or("baseline").to_string(),
        })
    }
}

struct DownPredictor;

#[async_trait]
impl Predictor for DownPredictor {
    async fn predict(&self, _model_id: Option<&str>, _features: &Map<String, Value>) -> Result<Prediction> {
        Err(LivewireError::dependency("model-server", "connection refused"))
    }
}

async fn started(predictor: Option<Arc<dyn Predictor>>) -> Dispatcher {
    let config = EngineConfig {
        write_timeout_ms: 100,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(
        config,
        Collaborators {
            predictor,
            ..Default::default()
        },
    )
    .unwrap();
    dispatcher.start().await.unwrap();
    dispatcher
}

fn parse(frame: Outbound) -> ServerMessage {
    serde_json::from_str(frame.text().expect("text frame")).unwrap()
}

async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
    parse(rx.recv().await.expect("frame"))
}

/// Connects and consumes the welcome frame.
async fn connect(dispatcher: &Dispatcher) -> (uuid::Uuid, mpsc::Receiver<Outbound>) {
    let (id, mut rx) = dispatcher.connect().await.unwrap();
    match next_message(&mut rx).await {
        ServerMessage::ConnectionEstablished {
            connection_id,
            available_topics,
            ..
        } => {
            assert_eq!(connection_id, id.to_string());
            assert_eq!(available_topics.len(), 8);
        }
        other => panic!("expected welcome, got {:?}", other),
    }
    (id, rx)
}

async fn subscribe(dispatcher: &Dispatcher, id: &uuid::Uuid, rx: &mut mpsc::Receiver<Outbound>, topics: &[&str]) {
    let frame = json!({ "type": "subscribe", "topics": topics }).to_string();
    dispatcher.handle_client_message(id, &frame).await;
    assert!(matches!(next_message(rx).await, ServerMessage::SubscriptionAck { .. }));
}

#[tokio::test]
async fn odds_event_reaches_every_live_subscriber() {
    let dispatcher = started(None).await;
    let mut clients = Vec::new();
    for _ in 0..10 {
        let (id, mut rx) = connect(&dispatcher).await;
        subscribe(&dispatcher, &id, &mut rx, &["odds_updates"]).await;
        clients.push((id, rx));
    }

    let (poisoned, poisoned_rx) = clients.remove(3);
    drop(poisoned_rx);

    dispatcher
        .process(Event::odds_update("game_42", "acme", 1.90, 2.05, "moneyline"))
        .await
        .unwrap();

    for (_, rx) in clients.iter_mut() {
        match next_message(rx).await {
            ServerMessage::EventBroadcast { topic, source, data, .. } => {
                assert_eq!(topic, "odds_updates");
                assert_eq!(source, "bookmaker_acme");
                assert_eq!(data["game_id"], "game_42");
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }
    assert!(!dispatcher.registry().contains(&poisoned).await);
    assert_eq!(dispatcher.registry().len().await, 9);
    dispatcher.stop().await;
}

#[tokio::test]
async fn unsubscribed_topics_are_not_delivered() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;
    subscribe(&dispatcher, &id, &mut rx, &["player_stats"]).await;

    dispatcher
        .process(Event::odds_update("game_1", "acme", 2.0, 2.1, "spread"))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());

    dispatcher
        .process(Event::player_stat_update("p9", "game_1", "points", 10.0, 14.0))
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::EventBroadcast { ref topic, .. } if topic == "player_stats"
    ));
    dispatcher.stop().await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_survives() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;

    dispatcher.handle_client_message(&id, "{not json").await;
    match next_message(&mut rx).await {
        ServerMessage::Error { code, .. } => {
            assert_eq!(serde_json::to_value(code).unwrap(), "MALFORMED_INPUT")
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    dispatcher
        .handle_client_message(&id, r#"{"type":"subscribe","topics":[]}"#)
        .await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Error { .. }));

    dispatcher.handle_client_message(&id, r#"{"type":"ping"}"#).await;
    assert!(matches!(next_message(&mut rx).await, ServerMessage::Pong { .. }));
    assert!(dispatcher.registry().contains(&id).await);
    assert_eq!(dispatcher.metrics_summary().await.engine.malformed_messages, 2);
    dispatcher.stop().await;
}

#[tokio::test]
async fn unknown_topics_are_reported_as_rejected() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;
    dispatcher
        .handle_client_message(&id, r#"{"type":"subscribe","topics":["alerts","lottery"]}"#)
        .await;
    match next_message(&mut rx).await {
        ServerMessage::SubscriptionAck { topics, rejected, .. } => {
            assert_eq!(topics, vec!["alerts"]);
            assert_eq!(rejected, vec!["lottery"]);
        }
        other => panic!("expected ack, got {:?}", other),
    }
    dispatcher.stop().await;
}

#[tokio::test]
async fn prediction_request_is_answered() {
    let dispatcher = started(Some(Arc::new(FixedPredictor))).await;
    let (id, mut rx) = connect(&dispatcher).await;
    let request = json!({
        "type": "prediction_request",
        "request_id": "req-1",
        "model_id": "gbm-v3",
        "features": { "home_rating": 64.0 }
    });
    dispatcher
        .handle_client_message(&id, &request.to_string())
        .await;

    match next_message(&mut rx).await {
        ServerMessage::PredictionResponse {
            request_id,
            prediction,
            model_version,
            ..
        } => {
            assert_eq!(request_id, "req-1");
            assert!((prediction - 0.64).abs() < 1e-9);
            assert_eq!(model_version, "gbm-v3");
        }
        other => panic!("expected prediction, got {:?}", other),
    }
    assert_eq!(dispatcher.window_stats("system_performance", "prediction_latency").count, 1);
    dispatcher.stop().await;
}

#[tokio::test]
async fn predictor_failure_becomes_prediction_error() {
    let dispatcher = started(Some(Arc::new(DownPredictor))).await;
    let (id, mut rx) = connect(&dispatcher).await;
    dispatcher
        .handle_client_message(&id, r#"{"type":"prediction_request","request_id":"req-2","features":{}}"#)
        .await;

    match next_message(&mut rx).await {
        ServerMessage::PredictionError { request_id, error, .. } => {
            assert_eq!(request_id, "req-2");
            assert!(error.contains("model-server"));
        }
        other => panic!("expected prediction error, got {:?}", other),
    }
    assert!(dispatcher.registry().contains(&id).await);
    dispatcher.stop().await;
}

#[tokio::test]
async fn full_queue_rejects_publish() {
    let config = EngineConfig {
        queue_capacity: 2,
        ..Default::default()
    };
    // not started, so nothing drains the queue
    let dispatcher = Dispatcher::new(config, Collaborators::default()).unwrap();
    let event = || Event::odds_update("g", "b", 1.5, 1.6, "spread");
    dispatcher.publish(event()).unwrap();
    dispatcher.publish(event()).unwrap();
    let err = dispatcher.publish(event()).unwrap_err();
    assert!(matches!(err, LivewireError::Backpressure { capacity: 2 }));
    assert_eq!(dispatcher.metrics_summary().await.events.rejected, 1);
}

#[tokio::test]
async fn stop_closes_connections_and_refuses_events() {
    let dispatcher = started(None).await;
    let (_id, mut rx) = connect(&dispatcher).await;
    dispatcher.stop().await;

    assert!(!dispatcher.is_running());
    assert!(dispatcher.registry().is_empty().await);
    assert!(matches!(
        dispatcher.publish(Event::odds_update("g", "b", 1.0, 1.1, "spread")),
        Err(LivewireError::ShuttingDown)
    ));
    // close frame, then the channel ends
    let mut saw_close = false;
    while let Some(frame) = rx.recv().await {
        saw_close |= frame == Outbound::Close;
    }
    assert!(saw_close);
}

#[tokio::test]
async fn queued_events_are_broadcast_by_workers() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;
    subscribe(&dispatcher, &id, &mut rx, &["game_status"]).await;

    let mut payload = Map::new();
    payload.insert("game_id".into(), Value::from("game_7"));
    payload.insert("status".into(), Value::from("halftime"));
    dispatcher
        .publish_blocking(Event::new(EventType::GameStatusChange, "league_feed", payload))
        .await
        .unwrap();

    let message = tokio::time::timeout(std::time::Duration::from_secs(5), next_message(&mut rx))
        .await
        .unwrap();
    assert!(matches!(message, ServerMessage::EventBroadcast { ref topic, .. } if topic == "game_status"));
    dispatcher.stop().await;
    assert_eq!(dispatcher.metrics_summary().await.events.processed, 1);
}

#[tokio::test]
async fn analytics_queries_read_windows_and_summary() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;
    dispatcher
        .process(Event::odds_update("game_5", "acme", 2.0, 2.5, "spread"))
        .await
        .unwrap();

    let query = json!({
        "type": "analytics_query",
        "query_id": "q-1",
        "query_type": "sliding_window_data",
        "window_name": "odds_changes",
        "metric_name": "magnitude"
    });
    dispatcher.handle_client_message(&id, &query.to_string()).await;
    match next_message(&mut rx).await {
        ServerMessage::AnalyticsResponse { query_id, query_type, data, .. } => {
            assert_eq!(query_id.as_deref(), Some("q-1"));
            assert_eq!(query_type, QueryType::SlidingWindowData);
            assert_eq!(data["count"], 1);
            assert!((data["latest"].as_f64().unwrap() - 0.5).abs() < 1e-9);
        }
        other => panic!("expected analytics response, got {:?}", other),
    }

    dispatcher
        .handle_client_message(&id, r#"{"type":"analytics_query","query_type":"metrics_summary"}"#)
        .await;
    match next_message(&mut rx).await {
        ServerMessage::AnalyticsResponse { data, .. } => {
            assert_eq!(data["alerts"]["total_rules"], 4);
        }
        other => panic!("expected analytics response, got {:?}", other),
    }

    let unknown = json!({
        "type": "analytics_query",
        "query_id": "q-3",
        "query_type": "sliding_window_data",
        "window_name": "weather",
        "metric_name": "wind"
    });
    dispatcher.handle_client_message(&id, &unknown.to_string()).await;
    match next_message(&mut rx).await {
        ServerMessage::AnalyticsError { query_id, error, .. } => {
            assert_eq!(query_id.as_deref(), Some("q-3"));
            assert!(error.contains("weather"));
        }
        other => panic!("expected analytics error, got {:?}", other),
    }
    dispatcher.stop().await;
}

#[tokio::test]
async fn clients_can_create_and_delete_rules() {
    let dispatcher = started(None).await;
    let (id, mut rx) = connect(&dispatcher).await;

    let create = json!({
        "type": "alert_rule",
        "operation": "create",
        "rule_id": "steam_move",
        "rule": {
            "name": "Steam Move",
            "metric": { "window": "odds_changes", "key": "magnitude" },
            "condition": { "kind": "threshold_above", "threshold": 0.4 },
            "severity": "high",
            "cooldown_secs": 120,
            "channels": ["log"]
        }
    });
    dispatcher.handle_client_message(&id, &create.to_string()).await;
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::AlertRuleAck { operation: RuleOperation::Create, applied: true, .. }
    ));
    let rule = dispatcher
        .rules()
        .into_iter()
        .find(|r| r.id == "steam_move")
        .expect("rule created");
    assert_eq!(rule.cooldown_secs, 120);
    assert!(rule.enabled);

    let delete = r#"{"type":"alert_rule","operation":"delete","rule_id":"steam_move"}"#;
    dispatcher.handle_client_message(&id, delete).await;
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::AlertRuleAck { applied: true, .. }
    ));
    dispatcher.handle_client_message(&id, delete).await;
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::AlertRuleAck { applied: false, .. }
    ));
    assert_eq!(dispatcher.rules().len(), 4);
    dispatcher.stop().await;
}

use crate::alerts::AlertRule;
use crate::error::{ErrorCode, LivewireError, Result};
use crate::event::{Event, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Frames written to a client connection. Text is shared so a broadcast
/// serializes once regardless of subscriber count.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close,
}

impl Outbound {
    pub fn text(&self) -> Option<&str> {
        match self {
            Outbound::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    PredictionRequest {
        request_id: String,
        #[serde(default)]
        model_id: Option<String>,
        #[serde(default)]
        features: Map<String, Value>,
    },
    AnalyticsQuery {
        #[serde(default)]
        query_id: Option<String>,
        query_type: QueryType,
        #[serde(default)]
        window_name: Option<String>,
        #[serde(default)]
        metric_name: Option<String>,
    },
    AlertRule {
        operation: RuleOperation,
        rule_id: String,
        #[serde(default)]
        rule: Option<AlertRule>,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    MetricsSummary,
    SlidingWindowData,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperation {
    Create,
    Update,
    Delete,
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| LivewireError::malformed(format!("invalid message: {}", e)))?;

    match &message {
        ClientMessage::Subscribe { topics } | ClientMessage::Unsubscribe { topics }
            if topics.is_empty() =>
        {
            Err(LivewireError::malformed("topics must not be empty"))
        }
        ClientMessage::PredictionRequest { request_id, .. } if request_id.trim().is_empty() => {
            Err(LivewireError::malformed("request_id must not be empty"))
        }
        ClientMessage::AlertRule { rule_id, .. } if rule_id.trim().is_empty() => {
            Err(LivewireError::malformed("rule_id must not be empty"))
        }
        ClientMessage::AlertRule {
            operation: RuleOperation::Create | RuleOperation::Update,
            rule: None,
            ..
        } => Err(LivewireError::malformed("create and update need a rule")),
        _ => Ok(message),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Triggered,
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: String,
        server_time: DateTime<Utc>,
        available_topics: Vec<String>,
    },
    SubscriptionAck {
        action: SubscriptionAction,
        topics: Vec<String>,
        rejected: Vec<String>,
    },
    EventBroadcast {
        topic: String,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        source: String,
        data: Map<String, Value>,
    },
    Alert {
        topic: String,
        status: AlertStatus,
        timestamp: DateTime<Utc>,
        data: Value,
    },
    MetricsUpdate {
        topic: String,
        timestamp: DateTime<Utc>,
        data: Value,
    },
    PredictionResponse {
        request_id: String,
        prediction: f64,
        confidence_score: f64,
        model_version: String,
        processing_time_ms: f64,
        timestamp: DateTime<Utc>,
    },
    PredictionError {
        request_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    AnalyticsResponse {
        query_id: Option<String>,
        query_type: QueryType,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    AnalyticsError {
        query_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    AlertRuleAck {
        operation: RuleOperation,
        rule_id: String,
        applied: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: ErrorCode,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn event_broadcast(topic: &str, event: &Event) -> Self {
        ServerMessage::EventBroadcast {
            topic: topic.to_string(),
            event_type: event.event_type,
            timestamp: event.timestamp,
            source: event.source.clone(),
            data: event.payload.clone(),
        }
    }

    pub fn error(err: &LivewireError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_frame(&self) -> Result<Outbound> {
        Ok(Outbound::Text(Arc::from(serde_json::to_string(self)?)))
    }
}

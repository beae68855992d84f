use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const TOPIC_ODDS_UPDATES: &str = "odds_updates";
pub const TOPIC_PLAYER_STATS: &str = "player_stats";
pub const TOPIC_GAME_STATUS: &str = "game_status";
pub const TOPIC_PREDICTIONS: &str = "predictions";
pub const TOPIC_ALERTS: &str = "alerts";
pub const TOPIC_ANALYTICS: &str = "analytics";
pub const TOPIC_MODEL_UPDATES: &str = "model_updates";
pub const TOPIC_SYSTEM_METRICS: &str = "system_metrics";

pub const AVAILABLE_TOPICS: &[&str] = &[
    TOPIC_ODDS_UPDATES,
    TOPIC_PLAYER_STATS,
    TOPIC_GAME_STATUS,
    TOPIC_PREDICTIONS,
    TOPIC_ALERTS,
    TOPIC_ANALYTICS,
    TOPIC_MODEL_UPDATES,
    TOPIC_SYSTEM_METRICS,
];

pub fn is_available_topic(topic: &str) -> bool {
    AVAILABLE_TOPICS.contains(&topic)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OddsUpdate,
    PlayerStatUpdate,
    GameStatusChange,
    InjuryReport,
    WeatherUpdate,
    PredictionRequest,
    ModelUpdate,
    AlertTrigger,
}

impl EventType {
    /// Broadcast topic for this event type. Injury and weather reports only
    /// feed windows and are not pushed to clients.
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            EventType::OddsUpdate => Some(TOPIC_ODDS_UPDATES),
            EventType::PlayerStatUpdate => Some(TOPIC_PLAYER_STATS),
            EventType::GameStatusChange => Some(TOPIC_GAME_STATUS),
            EventType::PredictionRequest => Some(TOPIC_PREDICTIONS),
            EventType::AlertTrigger => Some(TOPIC_ALERTS),
            EventType::ModelUpdate => Some(TOPIC_MODEL_UPDATES),
            EventType::InjuryReport | EventType::WeatherUpdate => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OddsUpdate => "odds_update",
            EventType::PlayerStatUpdate => "player_stat_update",
            EventType::GameStatusChange => "game_status_change",
            EventType::InjuryReport => "injury_report",
            EventType::WeatherUpdate => "weather_update",
            EventType::PredictionRequest => "prediction_request",
            EventType::ModelUpdate => "model_update",
            EventType::AlertTrigger => "alert_trigger",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            source: source.into(),
            payload,
            metadata: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn odds_update(
        game_id: &str,
        bookmaker: &str,
        old_odds: f64,
        new_odds: f64,
        market: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("game_id".into(), Value::from(game_id));
        payload.insert("bookmaker".into(), Value::from(bookmaker));
        payload.insert("old_odds".into(), Value::from(old_odds));
        payload.insert("new_odds".into(), Value::from(new_odds));
        payload.insert("odds_change".into(), Value::from(new_odds - old_odds));
        payload.insert("market_type".into(), Value::from(market));
        Self::new(EventType::OddsUpdate, format!("bookmaker_{}", bookmaker), payload)
    }

    pub fn player_stat_update(
        player_id: &str,
        game_id: &str,
        stat_type: &str,
        old_value: f64,
        new_value: f64,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("player_id".into(), Value::from(player_id));
        payload.insert("game_id".into(), Value::from(game_id));
        payload.insert("stat_type".into(), Value::from(stat_type));
        payload.insert("old_value".into(), Value::from(old_value));
        payload.insert("new_value".into(), Value::from(new_value));
        payload.insert("performance_change".into(), Value::from(new_value - old_value));
        Self::new(EventType::PlayerStatUpdate, "live_stats", payload)
    }

    /// Numeric payload field, if present and numeric.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injury_and_weather_have_no_topic() {
        assert_eq!(EventType::InjuryReport.topic(), None);
        assert_eq!(EventType::WeatherUpdate.topic(), None);
        assert_eq!(EventType::OddsUpdate.topic(), Some("odds_updates"));
        assert_eq!(EventType::AlertTrigger.topic(), Some("alerts"));
    }

    #[test]
    fn odds_update_records_signed_change() {
        let event = Event::odds_update("g1", "pinnacle", 2.1, 1.8, "moneyline");
        let change = event.number("odds_change").unwrap();
        assert!((change + 0.3).abs() < 1e-9);
        assert_eq!(event.source, "bookmaker_pinnacle");
    }

    #[test]
    fn event_type_wire_names() {
        let json = serde_json::to_string(&EventType::PlayerStatUpdate).unwrap();
        assert_eq!(json, "\"player_stat_update\"");
        assert!(is_available_topic("system_metrics"));
        assert!(!is_available_topic("odds"));
    }
}

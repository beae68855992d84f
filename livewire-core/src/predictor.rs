use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: f64,
    pub confidence: f64,
    pub model_version: String,
}

/// The model behind `prediction_request` messages. Failures must surface as
/// `DependencyFailure`; the engine never retries them.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, model_id: Option<&str>, features: &Map<String, Value>) -> Result<Prediction>;
}

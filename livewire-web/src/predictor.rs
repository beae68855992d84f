use async_trait::async_trait;
use livewire_core::{LivewireError, Prediction, Predictor, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
    features: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    prediction: f64,
    #[serde(alias = "confidence_score")]
    confidence: f64,
    #[serde(default)]
    model_version: Option<String>,
}

/// Model server reached over HTTP. POSTs `{model_id, features}` to
/// `{base_url}/predict`.
pub struct HttpPredictor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPredictor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LivewireError::dependency("predictor", e.to_string()))?;
        Ok(Self {
            endpoint: format!("{}/predict", base_url.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, model_id: Option<&str>, features: &Map<String, Value>) -> Result<Prediction> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&PredictRequest { model_id, features })
            .send()
            .await
            .map_err(|e| LivewireError::dependency("predictor", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LivewireError::dependency(
                "predictor",
                format!("model server returned {}", status),
            ));
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| LivewireError::dependency("predictor", format!("unreadable response: {}", e)))?;

        Ok(Prediction {
            value: body.prediction,
            confidence: body.confidence,
            model_version: body
                .model_version
                .or_else(|| model_id.map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

//! WebSocket front end for the livewire engine.

pub mod config;
pub mod predictor;
pub mod websocket;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use config::{PersistenceMode, WebConfig};
use livewire_core::alerts::{LogChannel, NotificationChannel, WebhookChannel};
use livewire_core::{Collaborators, Dispatcher, EngineConfig, KeyValueStore, MemoryStore, Predictor};
use predictor::HttpPredictor;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    started_at: Instant,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connections: usize,
    pub uptime_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let running = state.dispatcher.is_running();
    let report = HealthReport {
        status: if running { "ok" } else { "stopped" },
        connections: state.dispatcher.registry().len().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    };
    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Assembles the engine and its collaborators from configuration.
pub fn build_dispatcher(engine: EngineConfig, web: &WebConfig) -> anyhow::Result<Dispatcher> {
    let predictor: Option<Arc<dyn Predictor>> = match &web.predictor_url {
        Some(url) => {
            tracing::info!(url = %url, "Using HTTP predictor");
            Some(Arc::new(HttpPredictor::new(
                url,
                Duration::from_millis(web.predictor_timeout_ms),
            )?))
        }
        None => {
            tracing::warn!("No predictor configured, prediction requests will fail");
            None
        }
    };

    let store: Option<Arc<dyn KeyValueStore>> = match web.persistence {
        PersistenceMode::Memory => Some(Arc::new(MemoryStore::new(web.store_max_entries))),
        PersistenceMode::None => None,
    };

    Ok(Dispatcher::new(
        engine,
        Collaborators {
            predictor,
            store,
            channels: notification_channels(web)?,
            ..Default::default()
        },
    )?)
}

fn notification_channels(web: &WebConfig) -> anyhow::Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];

    if let Some(url) = &web.webhook_url {
        channels.push(Arc::new(WebhookChannel::new(
            "webhook",
            url,
            Duration::from_millis(web.webhook_timeout_ms),
        )?));
    }

    if let Some(smtp) = &web.smtp {
        #[cfg(feature = "smtp")]
        {
            use livewire_core::alerts::{EmailChannel, SmtpMailer};
            let mailer = SmtpMailer::new(&smtp.host, smtp.port, &smtp.username, &smtp.password)?;
            channels.push(Arc::new(EmailChannel::new(
                "email",
                &smtp.from,
                smtp.recipients.clone(),
                Arc::new(mailer),
            )));
        }
        #[cfg(not(feature = "smtp"))]
        tracing::warn!(host = %smtp.host, "SMTP configured but built without the smtp feature");
    }

    Ok(channels)
}

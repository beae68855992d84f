use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    routing::post,
    Json, Router,
};
use livewire_core::{Collaborators, Dispatcher, EngineConfig, Event, LivewireError, Predictor};
use livewire_web::config::WebConfig;
use livewire_web::predictor::HttpPredictor;
use livewire_web::{build_dispatcher, router, AppState};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

async fn get_health(state: AppState) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_follows_dispatcher_lifecycle() {
    let dispatcher = Arc::new(Dispatcher::new(EngineConfig::default(), Collaborators::default()).unwrap());
    let state = AppState::new(Arc::clone(&dispatcher));

    let (status, body) = get_health(state.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "stopped");

    dispatcher.start().await.unwrap();
    let (_id, _rx) = dispatcher.connect().await.unwrap();
    let (status, body) = get_health(state.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connections"], 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn dispatcher_builds_from_web_config() {
    let web = WebConfig::from_lookup(|key| match key {
        "LIVEWIRE_WEBHOOK_URL" => Some("http://127.0.0.1:9/hook".to_string()),
        "LIVEWIRE_PERSISTENCE" => Some("none".to_string()),
        _ => None,
    })
    .unwrap();
    let dispatcher = build_dispatcher(EngineConfig::default(), &web).unwrap();
    dispatcher.start().await.unwrap();
    assert!(dispatcher.is_running());
    assert_eq!(dispatcher.rules().len(), 4);
    dispatcher.stop().await;
}

async fn model_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn http_predictor_posts_features() {
    let app = Router::new().route(
        "/predict",
        post(|Json(body): Json<Value>| async move {
            let rating = body["features"]["rating"].as_f64().unwrap_or(0.0);
            Json(json!({
                "prediction": rating * 2.0,
                "confidence_score": 0.7,
                "model_version": body["model_id"].as_str().unwrap_or("none"),
            }))
        }),
    );
    let url = model_server(app).await;
    let predictor = HttpPredictor::new(&format!("{}/", url), Duration::from_secs(5)).unwrap();

    let mut features = Map::new();
    features.insert("rating".into(), Value::from(21.0));
    let prediction = predictor.predict(Some("elo-2"), &features).await.unwrap();

    assert_eq!(prediction.value, 42.0);
    assert_eq!(prediction.confidence, 0.7);
    assert_eq!(prediction.model_version, "elo-2");
}

#[tokio::test]
async fn http_predictor_maps_server_errors() {
    let app = Router::new().route(
        "/predict",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let url = model_server(app).await;
    let predictor = HttpPredictor::new(&url, Duration::from_secs(5)).unwrap();

    let err = predictor.predict(None, &Map::new()).await.unwrap_err();
    assert!(matches!(err, LivewireError::DependencyFailure { ref dependency, .. } if dependency == "predictor"));
}

#[tokio::test]
async fn default_rules_notify_configured_webhook() {
    let (tx, mut rx) = mpsc::channel::<Value>(8);
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body).await;
                StatusCode::OK
            }
        }),
    );
    let url = model_server(app).await;
    let web = WebConfig::from_lookup(|key| match key {
        "LIVEWIRE_WEBHOOK_URL" => Some(format!("{}/hook", url)),
        "LIVEWIRE_PERSISTENCE" => Some("none".to_string()),
        _ => None,
    })
    .unwrap();
    let dispatcher = build_dispatcher(EngineConfig::default(), &web).unwrap();
    dispatcher.start().await.unwrap();
    assert!(dispatcher
        .rules()
        .iter()
        .all(|rule| rule.channels.iter().any(|c| c == "webhook")));

    dispatcher
        .process(Event::odds_update("game_3", "acme", 1.50, 2.00, "moneyline"))
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["rule_name"], "High Odds Change");
    assert_eq!(body["severity"], "medium");
    dispatcher.stop().await;
}

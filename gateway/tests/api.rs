use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::time::Duration;
use telemetry_gateway::db::Store;
use telemetry_gateway::model::{NewReading, PeripheralType};
use telemetry_gateway::rest::middleware::{ApiKey, LogConfig, API_KEY_HEADER};
use telemetry_gateway::rest::ratelimit::RateLimiter;
use telemetry_gateway::rest::{create_router_with, AppState, GatewayConfig};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const KEY: &str = "test-api-key";

async fn explode() -> &'static str {
    panic!("handler exploded")
}

async fn app_with_limit(store: &Store, max_requests_per_second: u32) -> Router {
    app_with_routes(store, max_requests_per_second, Router::new()).await
}

async fn app_with_routes(
    store: &Store,
    max_requests_per_second: u32,
    extra: Router<AppState>,
) -> Router {
    let gateway = GatewayConfig {
        api_key: ApiKey::new(KEY).unwrap(),
        limiter: RateLimiter::new(max_requests_per_second, CancellationToken::new()).unwrap(),
        log: LogConfig {
            capture_bodies: true,
        },
    };
    create_router_with(
        AppState {
            store: store.clone(),
        },
        gateway,
        extra,
    )
}

async fn app(store: &Store) -> Router {
    app_with_limit(store, 1000).await
}

fn request(method: Method, path: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn seed_readings(store: &Store, serial_number: &str, count: i64) {
    store
        .create_peripheral(serial_number, PeripheralType::Sensor)
        .await
        .unwrap();

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    for i in 0..count {
        let mut data = Map::new();
        data.insert("seq".to_string(), json!(i));
        let reading = NewReading {
            serial_number: serial_number.to_string(),
            timestamp: Some(start + ChronoDuration::seconds(i)),
            data,
        };
        store.insert_reading(&reading, Utc::now()).await.unwrap();
    }
}

#[tokio::test]
async fn test_missing_or_wrong_key_is_forbidden() {
    let store = Store::connect(":memory:").await.unwrap();
    seed_readings(&store, "TEMP001", 1).await;
    let app = app(&store).await;

    for key in [None, Some("wrong"), Some("")] {
        let (status, body) = send(&app, request(Method::GET, "/api/v1/peripherals", key, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({"error": "Invalid API key"}));
    }

    // Unknown paths are guarded too, so they reveal nothing without a key.
    let (status, _) = send(&app, request(Method::GET, "/api/v2/nothing", None, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_version() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let (status, body) = send(&app, request(Method::GET, "/api/v1/version", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"version": "1.0.0"}));
}

#[tokio::test]
async fn test_list_peripherals() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let (status, body) = send(&app, request(Method::GET, "/api/v1/peripherals", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"peripherals": []}));

    seed_readings(&store, "TEMP001", 1).await;
    let (_, body) = send(&app, request(Method::GET, "/api/v1/peripherals", Some(KEY), None)).await;
    let peripherals = body["peripherals"].as_array().unwrap();
    assert_eq!(peripherals.len(), 1);
    assert_eq!(peripherals[0]["serial_number"], json!("TEMP001"));
    assert_eq!(peripherals[0]["type"], json!(1));
    assert_eq!(peripherals[0]["name"], Value::Null);
}

#[tokio::test]
async fn test_readings_are_newest_first_and_limited() {
    let store = Store::connect(":memory:").await.unwrap();
    seed_readings(&store, "TEMP001", 5).await;
    let app = app(&store).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/readings",
            Some(KEY),
            Some(json!({"serial_number": "TEMP001", "num_readings": 3})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let sequence: Vec<i64> = body["readings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|reading| reading["data"]["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(sequence, vec![4, 3, 2]);
}

#[tokio::test]
async fn test_readings_for_unknown_serial_is_empty() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/readings",
            Some(KEY),
            Some(json!({"serial_number": "NOPE", "num_readings": 3})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"readings": []}));
}

#[tokio::test]
async fn test_invalid_bodies_are_bad_requests() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let cases = [
        ("/api/v1/readings", json!({"serial_number": "TEMP001", "num_readings": 0})),
        ("/api/v1/readings", json!({"num_readings": 3})),
        ("/api/v1/peripherals", json!({"serial_number": "TEMP001", "name": "  "})),
        ("/api/v1/peripherals", json!({"serial_number": "TEMP001", "name": "x", "type": 42})),
    ];
    for (path, body) in cases {
        let (status, response) = send(&app, request(Method::POST, path, Some(KEY), Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", path);
        assert!(response["error"].is_string());
    }
}

#[tokio::test]
async fn test_configure_unknown_peripheral_is_not_found() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/peripherals",
            Some(KEY),
            Some(json!({"serial_number": "NOPE", "name": "Greenhouse"})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Peripheral not found"}));
    assert!(store.get_all_peripherals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_configure_sets_name_and_keeps_type() {
    let store = Store::connect(":memory:").await.unwrap();
    seed_readings(&store, "TEMP001", 1).await;
    let app = app(&store).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/peripherals",
            Some(KEY),
            Some(json!({"serial_number": "TEMP001", "name": "Greenhouse"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"message": "Peripheral name set successfully"}));

    let peripheral = store.get_peripheral_by_name("Greenhouse").await.unwrap().unwrap();
    assert_eq!(peripheral.serial_number, "TEMP001");
    assert_eq!(peripheral.peripheral_type, PeripheralType::Sensor);

    send(
        &app,
        request(
            Method::POST,
            "/api/v1/peripherals",
            Some(KEY),
            Some(json!({"serial_number": "TEMP001", "name": "Greenhouse", "type": 2})),
        ),
    )
    .await;
    let peripheral = store.get_peripheral_by_serial("TEMP001").await.unwrap().unwrap();
    assert_eq!(peripheral.peripheral_type, PeripheralType::Actuator);
}

#[tokio::test]
async fn test_rate_limit_rejects_then_replenishes() {
    let store = Store::connect(":memory:").await.unwrap();
    let app = app_with_limit(&store, 2).await;
    let version = || request(Method::GET, "/api/v1/version", Some(KEY), None);

    // Forbidden requests never reach the limiter.
    for _ in 0..5 {
        let (status, _) = send(&app, request(Method::GET, "/api/v1/version", None, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    assert_eq!(send(&app, version()).await.0, StatusCode::OK);
    assert_eq!(send(&app, version()).await.0, StatusCode::OK);

    let (status, body) = send(&app, version()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, json!({"error": "Rate limit exceeded"}));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(send(&app, version()).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    telemetry_gateway::metrics::init_metrics().unwrap();
    let store = Store::connect(":memory:").await.unwrap();
    let app = app(&store).await;

    let response = app
        .oneshot(request(Method::GET, "/api/v1/metrics", Some(KEY), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateway_http_requests_total"));
}

#[tokio::test]
async fn test_handler_panic_becomes_500_behind_gateway() {
    let store = Store::connect(":memory:").await.unwrap();
    let extra = Router::new().route("/boom", get(explode));
    let app = app_with_routes(&store, 1000, extra).await;

    let (status, body) = send(&app, request(Method::GET, "/api/v1/boom", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Internal server error"}));

    // Without a key the handler never runs.
    let (status, _) = send(&app, request(Method::GET, "/api/v1/boom", None, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, request(Method::GET, "/api/v1/version", Some(KEY), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"version": "1.0.0"}));
}

#[tokio::test]
async fn test_large_body_is_not_answered_by_body_logging() {
    let store = Store::connect(":memory:").await.unwrap();
    seed_readings(&store, "TEMP001", 2).await;
    let app = app(&store).await;
    let body = json!({
        "serial_number": "TEMP001",
        "num_readings": 1,
        "padding": "x".repeat(70 * 1024),
    });

    let (status, response) = send(
        &app,
        request(Method::POST, "/api/v1/readings", None, Some(body.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response, json!({"error": "Invalid API key"}));

    let (status, response) = send(
        &app,
        request(Method::POST, "/api/v1/readings", Some(KEY), Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["readings"].as_array().unwrap().len(), 1);
}

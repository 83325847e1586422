use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

use smart_water_engine::{ControllerError, Engine, Schedule};

use crate::state::{EngineStatus, SharedState};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub hub: SharedState,
    pub config_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        let status = match &err {
            ControllerError::Config(_) | ControllerError::WeatherDisabled => StatusCode::BAD_REQUEST,
            ControllerError::StationBusy(_) => StatusCode::CONFLICT,
            ControllerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            e if e.is_connectivity() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices", get(api_devices))
        .route("/api/weather", get(api_weather))
        .route("/api/schedule", put(put_schedule))
        .route("/api/stations/{n}/start", post(start_station))
        .route("/api/stations/{n}/flow-rate", put(put_flow_rate))
        .route("/api/stop", post(stop))
        .route("/api/controller/on", post(controller_on))
        .route("/api/controller/off", post(controller_off))
        .route("/api/settings/manual-duration", put(put_manual_duration))
        .route("/api/config/reload", post(reload_config))
        .with_state(state)
}

async fn record(state: &AppState, result: &ApiResult<()>, action: String) {
    let mut hub = state.hub.write().await;
    match result {
        Ok(()) => hub.record_api(action),
        Err(e) => hub.record_error(format!("{action}: {}", e.message)),
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = EngineStatus::new(
        &state.engine.state().await,
        &state.engine.snapshot(),
        state.engine.armed_cycles(),
        state.engine.weather_enabled(),
    );
    let hub = state.hub.read().await;
    Json(hub.to_status(engine))
}

async fn api_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.snapshot())
}

async fn api_weather(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.rain_outlook().await?))
}

async fn put_schedule(State(state): State<AppState>, Json(schedule): Json<Schedule>) -> ApiResult<StatusCode> {
    let result = state.engine.set_schedule(schedule).await.map_err(ApiError::from);
    record(&state, &result, "schedule updated".into()).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct StartBody {
    minutes: Option<u32>,
}

/// Body is optional; without `minutes` the manual duration applies.
async fn start_station(
    State(state): State<AppState>,
    Path(station): Path<usize>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let body: StartBody = if body.iter().all(u8::is_ascii_whitespace) {
        StartBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))?
    };

    let result = state
        .engine
        .start_irrigation(station, body.minutes)
        .await
        .map(drop)
        .map_err(ApiError::from);
    record(&state, &result, format!("start station {station}")).await;
    result?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "station": station, "minutes": body.minutes }))))
}

async fn stop(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let result = state.engine.stop_irrigation().await.map_err(ApiError::from);
    record(&state, &result, "stop".into()).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

async fn controller_on(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let result = state.engine.turn_controller_on().await.map_err(ApiError::from);
    record(&state, &result, "controller on".into()).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

async fn controller_off(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let result = state.engine.turn_controller_off().await.map_err(ApiError::from);
    record(&state, &result, "controller off".into()).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ManualDurationBody {
    minutes: u32,
}

async fn put_manual_duration(
    State(state): State<AppState>,
    Json(body): Json<ManualDurationBody>,
) -> ApiResult<StatusCode> {
    let result = state.engine.set_manual_duration(body.minutes).await.map_err(ApiError::from);
    record(&state, &result, format!("manual duration {} min", body.minutes)).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FlowRateBody {
    flow_rate_lpm: f64,
}

async fn put_flow_rate(
    State(state): State<AppState>,
    Path(station): Path<usize>,
    Json(body): Json<FlowRateBody>,
) -> ApiResult<StatusCode> {
    let result = state
        .engine
        .set_water_flow_rate(station, body.flow_rate_lpm)
        .await
        .map_err(ApiError::from);
    record(&state, &result, format!("flow rate station {station} {} L/min", body.flow_rate_lpm)).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

/// Re-read the config file and apply it without restarting.
async fn reload_config(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let result = match crate::config::load(&state.config_path) {
        Ok(cfg) => state.engine.reconfigure(cfg).await.map_err(ApiError::from),
        Err(e) => {
            warn!("config reload rejected: {e:#}");
            Err(ApiError::bad_request(format!("{e:#}")))
        }
    };
    record(&state, &result, "config reload".into()).await;
    result.map(|()| StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    use anyhow::Context;

    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state)).await.context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HubState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use smart_water_engine::clock::ManualClock;
    use smart_water_engine::host::memory::{MemoryStore, RecordingDispatcher, StaticEntities};
    use smart_water_engine::Host;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    const SWITCH_CONFIG: &str = r#"
control_method = "switch"

[[stations]]
name = "Lawn"
area_m2 = 10.0
switch_entity = "switch.lawn"
"#;

    const SERVICE_CONFIG: &str = r#"
controller_mac = "AA:BB:CC:DD:EE:FF"

[[stations]]
area_m2 = 10.0

[actions]
preset = "solem_toolkit"
"#;

    struct TestApp {
        state: AppState,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn app_with(config_text: &str, config_path: PathBuf) -> TestApp {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = Engine::new(
            crate::config::parse(config_text).unwrap(),
            Host {
                clock: Arc::new(ManualClock::at("2025-06-10 06:00:00")),
                entities: Arc::new(StaticEntities::default()),
                dispatcher: dispatcher.clone(),
                store: Arc::new(MemoryStore::default()),
            },
        )
        .unwrap();
        TestApp {
            state: AppState {
                engine,
                hub: Arc::new(RwLock::new(HubState::new())),
                config_path,
            },
            dispatcher,
        }
    }

    fn app(config_text: &str) -> TestApp {
        app_with(config_text, PathBuf::from("/nonexistent/config.toml"))
    }

    async fn send(state: &AppState, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = router(state.clone()).oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn devices_lists_station_buttons() {
        let t = app(SWITCH_CONFIG);
        t.state.engine.set_manual_duration(12).await.unwrap();

        let (status, json) = send(&t.state, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = json["devices"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|d| d["device_name"].as_str())
            .collect();
        assert!(names.contains(&"Sprinkle Lawn"));
    }

    #[tokio::test]
    async fn start_then_busy_then_stop() {
        let t = app(SWITCH_CONFIG);

        let (status, json) = send(&t.state, "POST", "/api/stations/1/start", Some(json!({"minutes": 2}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["minutes"], 2);
        assert_eq!(t.dispatcher.names(), vec!["switch.turn_on"]);

        let (status, json) = send(&t.state, "POST", "/api/stations/1/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("already sprinkling"));

        let (status, _) = send(&t.state, "POST", "/api/stop", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, status_json) = send(&t.state, "GET", "/api/status", None).await;
        assert_eq!(status_json["engine"]["stations"][0], "Stopped");
        assert_eq!(status_json["events"][0]["detail"], "stop");
        assert_eq!(status_json["events"][1]["kind"], "error");
    }

    #[tokio::test]
    async fn unknown_station_is_bad_request() {
        let t = app(SWITCH_CONFIG);
        let (status, _) = send(&t.state, "POST", "/api/stations/7/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&t.state, "POST", "/api/stations/1/start", Some(json!("ten"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(t.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_controller_is_bad_gateway() {
        let t = app(SERVICE_CONFIG);
        t.dispatcher.fail_on("solem_toolkit.turn_off_permanent");

        let (status, _) = send(&t.state, "POST", "/api/controller/off", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (status, _) = send(&t.state, "POST", "/api/controller/on", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn weather_without_provider_is_bad_request() {
        let t = app(SWITCH_CONFIG);
        let (status, json) = send(&t.state, "GET", "/api/weather", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "weather provider is disabled");
    }

    #[tokio::test]
    async fn number_settings() {
        let t = app(SWITCH_CONFIG);

        let (status, _) = send(&t.state, "PUT", "/api/settings/manual-duration", Some(json!({"minutes": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&t.state, "PUT", "/api/settings/manual-duration", Some(json!({"minutes": 25}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&t.state, "PUT", "/api/stations/1/flow-rate", Some(json!({"flow_rate_lpm": 8.5}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let state = t.state.engine.state().await;
        assert_eq!(state.manual_duration_min, 25);
        assert_eq!(state.flow_rates_lpm, vec![8.5]);
    }

    #[tokio::test]
    async fn schedule_round_trips_through_the_api() {
        let t = app(SWITCH_CONFIG);
        let month = json!({"interval_days": 1, "hours": ["07:00"], "stations": {"station_1_minutes": 10}});
        let schedule = serde_json::Value::Array(vec![month; 12]);

        let (status, _) = send(&t.state, "PUT", "/api/schedule", Some(schedule)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, json) = send(&t.state, "GET", "/api/status", None).await;
        assert_eq!(json["engine"]["next_schedule"], "2025-06-10 07:00:00");

        let (status, _) = send(&t.state, "PUT", "/api/schedule", Some(json!([]))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn reload_applies_the_file() {
        let path = env::temp_dir().join(format!("smart-water-reload-{}.toml", std::process::id()));
        std::fs::write(&path, format!("{SWITCH_CONFIG}\n[[stations]]\narea_m2 = 4.0\nswitch_entity = \"switch.beds\"\n")).unwrap();
        let t = app_with(SWITCH_CONFIG, path.clone());

        let (status, _) = send(&t.state, "POST", "/api/config/reload", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(t.state.engine.state().await.num_stations(), 2);

        std::fs::write(&path, "control_method = \"switch\"\n").unwrap();
        let (status, json) = send(&t.state, "POST", "/api/config/reload", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("at least one station"));
        assert_eq!(t.state.engine.state().await.num_stations(), 2);

        let _ = std::fs::remove_file(&path);
    }
}

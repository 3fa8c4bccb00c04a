use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::error::IrrigationError;
use crate::model::IrrigationKind;
use crate::service::IrrigationService;
use crate::settings::SettingsUpdate;
use crate::state::SharedState;
use crate::watering::CancelOutcome;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;
const DEFAULT_WINDOW_HOURS: u64 = 24;
const MAX_WINDOW_HOURS: u64 = 24 * 366;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IrrigationService>,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub sensor_id: String,
    pub duration_sec: Option<u64>,
    pub kind: IrrigationKind,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub hours: Option<u64>,
}

impl WindowParams {
    fn window(&self) -> Duration {
        let hours = self
            .hours
            .unwrap_or(DEFAULT_WINDOW_HOURS)
            .clamp(1, MAX_WINDOW_HOURS);
        Duration::from_secs(hours * 3600)
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub reason: Option<&'static str>,
    pub message: Option<String>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
            message: None,
        }
    }

    fn refused(reason: &'static str, message: String) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            message: Some(message),
        }
    }
}

fn status_for(err: &IrrigationError) -> StatusCode {
    match err {
        IrrigationError::UnknownSensor(_) => StatusCode::NOT_FOUND,
        IrrigationError::AlreadyWatering
        | IrrigationError::PowerUnsafe
        | IrrigationError::NoReading(_)
        | IrrigationError::MoistureHigh { .. } => StatusCode::CONFLICT,
        IrrigationError::InvalidDuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: IrrigationError) -> Response {
    (
        status_for(&err),
        Json(CommandResponse::refused(err.reason_code(), err.to_string())),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/irrigation/start", post(start_irrigation))
        .route("/api/irrigation/stop", post(stop_irrigation))
        .route("/api/irrigation/history/{sensor_id}", get(irrigation_history))
        .route("/api/sensors/{sensor_id}/stats", get(sensor_stats))
        .route("/api/sensors/{sensor_id}/readings", get(sensor_readings))
        .route("/api/config", get(get_config).post(update_config))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let watering = app.service.get_status().await;
    let st = app.shared.read().await;
    Json(st.to_status(watering))
}

async fn start_irrigation(State(app): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    let duration = req.duration_sec.map(Duration::from_secs);
    let result = match req.kind {
        IrrigationKind::Automatic => app.service.start_automatic(&req.sensor_id, duration).await,
        IrrigationKind::Manual => app.service.start_manual(&req.sensor_id, duration).await,
        IrrigationKind::Scheduled => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(CommandResponse::refused(
                    "unsupported_kind",
                    "scheduled sessions cannot be started over the API".to_string(),
                )),
            )
                .into_response();
        }
    };
    match result {
        Ok(()) => {
            app.shared
                .write()
                .await
                .record_system(format!("{} start requested for {} via api", req.kind, req.sensor_id));
            Json(CommandResponse::ok()).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stop_irrigation(State(app): State<AppState>) -> Json<CommandResponse> {
    match app.service.stop().await {
        CancelOutcome::Cancelled => Json(CommandResponse::ok()),
        CancelOutcome::AlreadyStopping => Json(CommandResponse::refused(
            "already_stopping",
            "session is already stopping".to_string(),
        )),
        CancelOutcome::NothingToCancel => Json(CommandResponse::refused(
            "nothing_to_cancel",
            "no watering session is active".to_string(),
        )),
    }
}

async fn irrigation_history(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match app.service.get_history(&sensor_id, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(e),
    }
}

async fn sensor_stats(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Response {
    match app.service.get_statistics(&sensor_id, params.window()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn sensor_readings(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Response {
    match app.service.get_readings(&sensor_id, params.window()).await {
        Ok(readings) => Json(readings).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_config(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.service.get_settings())
}

async fn update_config(State(app): State<AppState>, Json(update): Json<SettingsUpdate>) -> Response {
    match app.service.update_settings(&update) {
        Ok(view) => {
            app.shared.write().await.record_system(format!(
                "settings changed via api: auto_mode={} duration={}s",
                view.auto_mode, view.duration_sec
            ));
            Json(view).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

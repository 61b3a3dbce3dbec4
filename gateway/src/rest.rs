use crate::broker::Broker;
use crate::correlator::CommandCorrelator;
use crate::errors::Error;
use crate::model::{CommandAck, CommandRecord, CommandRequest, TelemetryPage, TelemetryRecord};
use crate::query::{QueryEngine, TelemetryQuery};
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    queries: QueryEngine,
    correlator: Arc<CommandCorrelator>,
    broker: Arc<dyn Broker>,
    store_backend: &'static str,
}

impl AppState {
    pub fn new(
        queries: QueryEngine,
        correlator: Arc<CommandCorrelator>,
        broker: Arc<dyn Broker>,
        store_backend: &'static str,
    ) -> Self {
        Self {
            queries,
            correlator,
            broker,
            store_backend,
        }
    }
}

/// Raw query string; kept as strings so bad values produce our own 400s.
#[derive(Debug, Default, Deserialize)]
pub struct SensorListParams {
    device_id: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
    skip_pagination: Option<String>,
}

impl SensorListParams {
    pub fn into_query(self, now: DateTime<Utc>) -> Result<TelemetryQuery, Error> {
        let mut query = TelemetryQuery::recent(now);
        query.device_id = self.device_id.filter(|id| !id.is_empty());

        if let Some(start) = non_empty(self.start_time) {
            query.start = Some(parse_time("start_time", &start)?);
        }
        if let Some(end) = non_empty(self.end_time) {
            query.end = Some(parse_time("end_time", &end)?);
        }
        if let Some(page) = non_empty(self.page) {
            query.page = parse_positive("page", &page)?;
        }
        if let Some(page_size) = non_empty(self.page_size) {
            query.page_size = parse_positive("page_size", &page_size)?;
        }
        query.skip_pagination = self.skip_pagination.as_deref() == Some("true");

        Ok(query)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| Error::Validation(format!("invalid {}, expected RFC 3339", name)))
}

fn parse_positive(name: &str, value: &str) -> Result<u32, Error> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| *v >= 1)
        .ok_or_else(|| Error::Validation(format!("invalid {}", name)))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sensor", get(list_sensor_data))
        .route("/api/v1/sensor/:id", get(get_sensor_data))
        .route("/api/v1/device/:device_id/command", post(send_command))
        .route("/api/v1/command/:request_id", get(get_command_status))
        .route("/health", get(health))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn list_sensor_data(
    State(state): State<AppState>,
    Query(params): Query<SensorListParams>,
) -> Result<Json<TelemetryPage>, AppError> {
    let query = params.into_query(Utc::now())?;
    let page = state.queries.list(&query).await?;
    Ok(Json(page))
}

async fn get_sensor_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TelemetryRecord>, AppError> {
    let id = id
        .parse::<i64>()
        .map_err(|_| Error::Validation("invalid id".to_string()))?;
    let record = state.queries.get(id).await?;
    Ok(Json(record))
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandAck>), AppError> {
    let ack = state.correlator.send_command(&device_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn get_command_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<CommandRecord>, AppError> {
    let record = state.correlator.get_status(&request_id).await?;
    Ok(Json(record))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mqtt_connected = state.broker.is_connected();
    Json(json!({
        "status": if mqtt_connected { "ok" } else { "degraded" },
        "store": state.store_backend,
        "mqtt_connected": mqtt_connected,
    }))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        status = response.status().as_u16(),
        latency = ?start.elapsed(),
        %method,
        %uri,
        "[HTTP]"
    );
    response
}

pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::UnknownCommand(_) | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotConnected | Error::PublishTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

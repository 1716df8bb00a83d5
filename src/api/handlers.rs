use crate::analytics::region_levels;
use crate::api::responses::{
    ErrorCode, ErrorResponse, ForecastSuccessResponse, HealthStatus, HealthSuccessResponse,
    RegionLevelsResponse, RouteErrorResponse, RouteRequest, RouteStatus, RouteSuccessResponse,
    SensorLevelResponse,
};
use crate::error::SchedulerError;
use crate::forecast::forecast_sensor;
use crate::planner::plan_collection;
use crate::routing::Coordinate;
use crate::series::{RegionId, SensorId};
use crate::state::AppState;
use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, warn};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
const FALLBACK_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

#[derive(Debug)]
enum TimestampError {
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

pub enum RouteResponse {
    Success(RouteSuccessResponse),
    Error {
        status: StatusCode,
        body: RouteErrorResponse,
    },
}

impl IntoResponse for RouteResponse {
    fn into_response(self) -> Response {
        match self {
            RouteResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            RouteResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn post_route(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> impl IntoResponse {
    match payload {
        Ok(Json(request)) => build_route_response(&state, request, OffsetDateTime::now_utc()).await,
        Err(rejection) => route_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            rejection.body_text(),
            OffsetDateTime::now_utc(),
        ),
    }
}

/// Generic success/error pair for the read-only endpoints.
pub enum ApiResponse<T> {
    Success(T),
    Error {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T: serde::Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_forecast(
    State(state): State<Arc<AppState>>,
    sensor_id: Result<Path<SensorId>, PathRejection>,
) -> impl IntoResponse {
    match sensor_id {
        Ok(Path(sensor_id)) => {
            build_forecast_response(&state, sensor_id, OffsetDateTime::now_utc()).await
        }
        Err(rejection) => api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            rejection.body_text(),
            OffsetDateTime::now_utc(),
        ),
    }
}

pub async fn get_region_levels(
    State(state): State<Arc<AppState>>,
    region_id: Result<Path<RegionId>, PathRejection>,
) -> impl IntoResponse {
    match region_id {
        Ok(Path(region_id)) => {
            build_region_levels_response(&state, region_id, OffsetDateTime::now_utc()).await
        }
        Err(rejection) => api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            rejection.body_text(),
            OffsetDateTime::now_utc(),
        ),
    }
}

pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    build_health_response(&state, OffsetDateTime::now_utc())
}

async fn build_route_response(
    state: &AppState,
    request: RouteRequest,
    now: OffsetDateTime,
) -> RouteResponse {
    let origin = match parse_origin(&request) {
        Ok(origin) => origin,
        Err(err) => {
            return route_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidCoordinate,
                err.to_string(),
                now,
            );
        }
    };

    let plan = plan_collection(
        origin,
        request.region_id,
        state.store.as_ref(),
        &state.registry,
        state.oracle.as_ref(),
        &state.settings,
        now,
    )
    .await;

    let plan = match plan {
        Ok(plan) => plan,
        Err(err) => {
            let (status, code) = classify(&err);
            if status.is_server_error() {
                warn!(region_id = request.region_id, error = %err, "Collection plan failed");
            }
            return route_error(status, code, err.to_string(), now);
        }
    };

    let (timestamp, next_collection) = match (format_timestamp(now), format_timestamp(plan.next_collection)) {
        (Ok(timestamp), Ok(next)) => (timestamp, next),
        _ => return route_internal_error("timestamp formatting failure"),
    };

    match plan.route {
        Some(route) => {
            let Some(link) = route.link else {
                return route_internal_error("route without stops was returned");
            };
            RouteResponse::Success(RouteSuccessResponse {
                status: RouteStatus::Routed,
                message: link,
                stops: Some(route.stops),
                unreachable: route.unreachable,
                next_collection,
                timestamp,
            })
        }
        None => RouteResponse::Success(RouteSuccessResponse {
            status: RouteStatus::NothingUrgent,
            message: format!(
                "No receptacle in region {} needs collection before {next_collection}",
                plan.region_id
            ),
            stops: None,
            unreachable: Vec::new(),
            next_collection,
            timestamp,
        }),
    }
}

fn parse_origin(request: &RouteRequest) -> Result<Coordinate, SchedulerError> {
    let latitude = request.latitude.as_f64().ok_or_else(|| {
        SchedulerError::InvalidCoordinate(format!("latitude {:?} is not a number", request.latitude))
    })?;
    let longitude = request.longitude.as_f64().ok_or_else(|| {
        SchedulerError::InvalidCoordinate(format!(
            "longitude {:?} is not a number",
            request.longitude
        ))
    })?;
    Coordinate::new(latitude, longitude)
}

fn classify(err: &SchedulerError) -> (StatusCode, ErrorCode) {
    match err {
        SchedulerError::InvalidCoordinate(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidCoordinate),
        SchedulerError::RouteCostUnavailable(_) => {
            (StatusCode::BAD_GATEWAY, ErrorCode::RouteCostUnavailable)
        }
        SchedulerError::UntrainedModel { .. } => (StatusCode::NOT_FOUND, ErrorCode::UntrainedModel),
        SchedulerError::InsufficientHistory { .. } => {
            (StatusCode::NOT_FOUND, ErrorCode::InsufficientHistory)
        }
        SchedulerError::EmptyDataset { .. } => (StatusCode::NOT_FOUND, ErrorCode::EmptyDataset),
        SchedulerError::HorizonExhausted { .. } => {
            (StatusCode::NOT_FOUND, ErrorCode::NoCrossingWithinHorizon)
        }
        SchedulerError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::StoreUnavailable),
    }
}

fn route_error(
    status: StatusCode,
    error_code: ErrorCode,
    message: String,
    now: OffsetDateTime,
) -> RouteResponse {
    match format_timestamp(now) {
        Ok(timestamp) => RouteResponse::Error {
            status,
            body: RouteErrorResponse {
                status: RouteStatus::Error,
                message,
                error_code,
                timestamp,
            },
        },
        Err(_err) => route_internal_error("timestamp formatting failure"),
    }
}

fn route_internal_error(message: &str) -> RouteResponse {
    error!(
        message = message,
        "Internal error while handling /api/collection/route"
    );
    RouteResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: RouteErrorResponse {
            status: RouteStatus::Error,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
            error_code: ErrorCode::InternalError,
            timestamp: now_timestamp(),
        },
    }
}

async fn build_forecast_response(
    state: &AppState,
    sensor_id: SensorId,
    now: OffsetDateTime,
) -> ApiResponse<ForecastSuccessResponse> {
    let forecast = forecast_sensor(
        sensor_id,
        state.store.as_ref(),
        &state.registry,
        &state.settings.forecast,
    )
    .await;

    match forecast {
        Ok(forecast) => match format_timestamp(forecast.predicted_timestamp) {
            Ok(predicted_timestamp) => ApiResponse::Success(ForecastSuccessResponse {
                sensor_id,
                predicted_timestamp,
                hours_until_full: forecast.hours_until_full,
                predicted_level: forecast.predicted_level,
            }),
            Err(_err) => api_internal_error("/api/forecast", "timestamp formatting failure"),
        },
        Err(err) => {
            let (status, code) = classify(&err);
            api_error(status, code, err.to_string(), now)
        }
    }
}

async fn build_region_levels_response(
    state: &AppState,
    region_id: RegionId,
    now: OffsetDateTime,
) -> ApiResponse<RegionLevelsResponse> {
    let levels = match region_levels(region_id, state.store.as_ref()).await {
        Ok(levels) => levels,
        Err(err) => {
            let (status, code) = classify(&err);
            return api_error(status, code, err.to_string(), now);
        }
    };

    let mut sensors = Vec::with_capacity(levels.sensors.len());
    for level in levels.sensors {
        let Ok(timestamp) = format_timestamp(level.timestamp) else {
            return api_internal_error("/api/regions", "timestamp formatting failure");
        };
        sensors.push(SensorLevelResponse {
            sensor_id: level.sensor_id,
            name: level.name,
            fill_level: level.fill_level,
            timestamp,
        });
    }
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(RegionLevelsResponse {
            region_id,
            sensors,
            average_fill_level: levels.average_fill_level,
            timestamp,
        }),
        Err(_err) => api_internal_error("/api/regions", "timestamp formatting failure"),
    }
}

fn build_health_response(state: &AppState, now: OffsetDateTime) -> ApiResponse<HealthSuccessResponse> {
    let models_loaded = state.models_loaded();
    let status = if models_loaded == 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Success(HealthSuccessResponse {
            status,
            models_loaded,
            timestamp,
        }),
        Err(_err) => api_internal_error("/api/health", "timestamp formatting failure"),
    }
}

fn api_error<T>(
    status: StatusCode,
    error_code: ErrorCode,
    error_message: String,
    now: OffsetDateTime,
) -> ApiResponse<T> {
    ApiResponse::Error {
        status,
        body: ErrorResponse {
            error_code,
            error_message,
            timestamp: format_timestamp(now).unwrap_or_else(|_| now_timestamp()),
        },
    }
}

fn api_internal_error<T>(endpoint: &str, message: &str) -> ApiResponse<T> {
    error!(
        endpoint = endpoint,
        message = message,
        "Internal error while handling request"
    );
    ApiResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            error_code: ErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: now_timestamp(),
        },
    }
}

fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc()).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format error timestamp");
        FALLBACK_TIMESTAMP.to_string()
    })
}

fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, TimestampError> {
    timestamp.format(&Rfc3339).map_err(TimestampError::Format)
}

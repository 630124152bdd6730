//! HTTP health-check endpoint.

use crate::config::HealthCheckSettings;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use spanroute_core::TracerouteError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters published by the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthDetails {
    #[serde(rename = "successful-traces")]
    pub successful_traces: u64,
    #[serde(rename = "unsuccessful-traces")]
    pub unsuccessful_traces: u64,
    #[serde(rename = "total-traces")]
    pub total_traces: u64,
    #[serde(rename = "dns-latency-ms")]
    pub dns_latency_ms: Vec<f64>,
}

/// Shared run statistics, updated by the service loop.
#[derive(Debug, Default)]
pub struct HealthState {
    details: Mutex<HealthDetails>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_trace(&self, success: bool) {
        let mut details = self.details.lock().expect("health details poisoned");
        if success {
            details.successful_traces += 1;
        } else {
            details.unsuccessful_traces += 1;
        }
        details.total_traces += 1;
    }

    pub fn record_dns_latency(&self, latency: Duration) {
        let mut details = self.details.lock().expect("health details poisoned");
        details.dns_latency_ms.push(latency.as_secs_f64() * 1000.0);
    }

    pub fn details(&self) -> HealthDetails {
        self.details
            .lock()
            .expect("health details poisoned")
            .clone()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "current-time")]
    current_time: String,
    details: HealthDetails,
}

/// Builds the router: the configured path answers with the counters, every
/// other path is rejected.
pub fn router(state: Arc<HealthState>, path: &str) -> Router {
    Router::new()
        .route(path, get(get_health))
        .fallback(invalid)
        .with_state(state)
}

async fn get_health(State(state): State<Arc<HealthState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        current_time: chrono::Utc::now().to_rfc3339(),
        details: state.details(),
    })
}

async fn invalid() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "invalid request")
}

/// Serves the health endpoint until the token fires.
pub async fn serve(
    state: Arc<HealthState>,
    settings: HealthCheckSettings,
    cancel: CancellationToken,
) -> Result<(), TracerouteError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .map_err(|err| TracerouteError::Internal(format!("health listener: {}", err)))?;
    info!(port = settings.port, path = %settings.path, "health check listening");

    axum::serve(listener, router(state, &settings.path))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| TracerouteError::Internal(format!("health server: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let state = HealthState::new();
        state.record_trace(true);
        state.record_trace(true);
        state.record_trace(false);
        state.record_dns_latency(Duration::from_millis(12));

        let details = state.details();
        assert_eq!(details.successful_traces, 2);
        assert_eq!(details.unsuccessful_traces, 1);
        assert_eq!(details.total_traces, 3);
        assert_eq!(details.dns_latency_ms.len(), 1);
    }

    #[test]
    fn test_response_shape() {
        let details = HealthDetails {
            successful_traces: 1,
            unsuccessful_traces: 0,
            total_traces: 1,
            dns_latency_ms: vec![1.5],
        };
        let response = HealthResponse {
            status: "ok",
            current_time: "2024-01-01T00:00:00Z".to_string(),
            details,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"successful-traces\":1"));
        assert!(json.contains("\"current-time\""));
        assert!(json.contains("\"dns-latency-ms\":[1.5]"));
    }
}

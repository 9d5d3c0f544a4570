//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::audio::device::{list_output_devices, AudioDeviceInfo};
use crate::peers::{ConnectionStatus, RegistryStats};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// System status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub discovery_addr: String,
    pub required_sample_rate: u32,
    pub connection_count: usize,
    pub ready_count: usize,
    pub uptime_seconds: u64,
    pub registry: RegistryStats,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let connections = state.registry.connections();
    let status = SystemStatus {
        discovery_addr: state.registry.local_addr().to_string(),
        required_sample_rate: state.required_sample_rate,
        connection_count: connections.len(),
        ready_count: connections.values().filter(|c| c.is_ready()).count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        registry: state.registry.stats(),
    };
    Json(ApiResponse::ok(status))
}

pub async fn get_connections(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ConnectionStatus>>> {
    Json(ApiResponse::ok(state.registry.statuses()))
}

pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ApiResponse<ConnectionStatus>>) {
    match state.registry.connection(&name) {
        Some(conn) => (StatusCode::OK, Json(ApiResponse::ok(conn.status()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Connection not found: {}", name))),
        ),
    }
}

/// Get available output devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = tokio::task::spawn_blocking(list_output_devices)
        .await
        .unwrap_or_default();
    Json(ApiResponse::ok(devices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_value(ApiResponse::ok(vec![1, 2])).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true, "data": [1, 2] }));

        let err = serde_json::to_value(ApiResponse::<()>::error("Connection not found: x")).unwrap();
        assert_eq!(
            err,
            serde_json::json!({ "success": false, "error": "Connection not found: x" })
        );
    }

    #[test]
    fn test_registry_stats_serialize() {
        let stats = RegistryStats {
            datagrams: 3,
            malformed: 1,
            ..RegistryStats::default()
        };
        let value = serde_json::to_value(stats).unwrap();
        assert_eq!(value["datagrams"], 3);
        assert_eq!(value["malformed"], 1);
        assert_eq!(value["evictions"], 0);
    }
}

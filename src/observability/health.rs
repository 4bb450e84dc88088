//! Health check HTTP server for container orchestration
//!
//! Exposes the manager's connection status, the watchdog alert state, and
//! per-queue consume channel status for monitoring.

use crate::manager::Manager;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    manager: Arc<Manager>,
}

impl HealthServer {
    pub fn new(port: u16, manager: Arc<Manager>) -> Self {
        Self { port, manager }
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - connection and channel status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let status_code = if status.status == "healthy" { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&status),
                    warp::http::StatusCode::from_u16(status_code)
                        .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
                ))
            }
        });

        // GET /ready - Kubernetes readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.manager.is_open();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    warp::http::StatusCode::from_u16(status_code)
                        .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
                ))
            }
        });

        // GET /live - Kubernetes liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(move || async move {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        let routes = health_route
            .or(ready_route)
            .or(live_route)
            .with(warp::cors().allow_any_origin());

        tracing::info!("Starting health server on port {}", self.port);

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;

        Ok(())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let connection_open = self.manager.is_open();
        let watchdog_alert = self.manager.monitor().is_alerted();
        let queues = self.manager.channel_status().await;

        let all_queues_started = queues.values().all(|started| *started);
        let status = if connection_open && !watchdog_alert && all_queues_started {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        };

        HealthStatus {
            status,
            timestamp: current_timestamp(),
            connection_open,
            watchdog_alert,
            last_healthy: self
                .manager
                .monitor()
                .last_healthy()
                .map(|ts| ts.to_rfc3339()),
            queues,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    connection_open: bool,
    watchdog_alert: bool,
    last_healthy: Option<String>,
    queues: HashMap<String, bool>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once connection shutdown has started.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current `WebSocket` connection count.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, shutting_down: bool) -> HealthResponse {
    let status = if shutting_down { "shutting_down" } else { "ok" };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, false);
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn status_reports_shutdown() {
        let resp = health_check(Instant::now(), 3, true);
        assert_eq!(resp.status, "shutting_down");
        assert_eq!(resp.connections, 3);
    }

    #[test]
    fn uptime_starts_at_zero() {
        let resp = health_check(Instant::now(), 0, false);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn serializes_snake_case_fields() {
        let resp = health_check(Instant::now(), 7, false);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 7);
        assert!(json.get("uptime_secs").is_some());
    }
}

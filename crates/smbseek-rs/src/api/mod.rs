use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::{db::Ledger, error::LedgerError, report};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/servers/authenticated", get(authenticated_servers))
        .route("/api/servers/recent", get(recent_servers))
        .route("/api/servers/accessible-shares", get(accessible_share_servers))
        .route("/api/failures", get(failures))
        .route("/api/failures/analysis", get(failure_analysis))
        .route("/api/sessions/:id", get(session))
        .route("/api/summary", get(summary))
        .route("/api/activity", get(activity))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn respond<T: Serialize>(result: Result<T, LedgerError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e @ LedgerError::InvalidWindow(_)) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e) => {
            error!(error = %e, "ledger query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    match state.ledger.server_count().await {
        Ok(servers) => Json(serde_json::json!({"status": "ok", "service": "smbseek", "servers": servers})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded", "error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn authenticated_servers(State(state): State<AppState>) -> Response {
    respond(state.ledger.get_authenticated_hosts().await)
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

pub async fn recent_servers(State(state): State<AppState>, Query(q): Query<HoursQuery>) -> Response {
    respond(state.ledger.get_recently_discovered_hosts(q.hours).await)
}

pub async fn accessible_share_servers(State(state): State<AppState>) -> Response {
    respond(state.ledger.get_hosts_with_accessible_shares().await)
}

pub async fn failures(State(state): State<AppState>) -> Response {
    respond(state.ledger.get_failed_connections().await)
}

pub async fn failure_analysis(State(state): State<AppState>) -> Response {
    respond(report::analyze_failures(&state.ledger).await)
}

pub async fn session(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.ledger.get_session(id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("session {id} not found")).into_response(),
        Err(e) => respond::<()>(Err(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    session: Option<i64>,
}

pub async fn summary(State(state): State<AppState>, Query(q): Query<SummaryQuery>) -> Response {
    respond(report::generate_summary(&state.ledger, q.session).await)
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    7
}

pub async fn activity(State(state): State<AppState>, Query(q): Query<DaysQuery>) -> Response {
    respond(state.ledger.recent_activity(q.days).await)
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::{json, Value};

    use super::*;

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn state() -> AppState {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .get_or_create_server("192.0.2.1", Some("US"), Some("Anonymous"))
            .await
            .unwrap();
        AppState { ledger }
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let resp = session(State(state().await), Path(999)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_session_is_returned() {
        let st = state().await;
        let id = st.ledger.create_scan_session("smbseek-discover", &json!({})).await.unwrap();
        let resp = session(State(st), Path(id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "running");
    }

    #[tokio::test]
    async fn out_of_range_windows_are_bad_requests() {
        let st = state().await;
        for hours in [0, -1, i64::MAX] {
            let resp = recent_servers(State(st.clone()), Query(HoursQuery { hours })).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "hours={hours}");
        }
        for days in [0, -30, i64::MAX] {
            let resp = activity(State(st.clone()), Query(DaysQuery { days })).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "days={days}");
        }

        let resp = recent_servers(State(st.clone()), Query(HoursQuery { hours: 24 })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await[0]["ip_address"], "192.0.2.1");
        let resp = activity(State(st), Query(DaysQuery { days: 7 })).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failure_analysis_groups_logged_failures() {
        let st = state().await;
        st.ledger
            .add_failure_log(&crate::models::NewFailureLog {
                ip_address: "192.0.2.9".into(),
                failure_type: "timeout".into(),
                failure_reason: Some("command timed out after 30s".into()),
                session_id: None,
            })
            .await
            .unwrap();

        let resp = failure_analysis(State(st)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total_failures"], 1);
        assert_eq!(body["by_type"][0]["failure_type"], "timeout");
    }

    #[tokio::test]
    async fn listings_and_summary_serialize() {
        let st = state().await;

        let resp = authenticated_servers(State(st.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let hosts = body_json(resp).await;
        assert_eq!(hosts[0]["ip_address"], "192.0.2.1");

        let resp = summary(State(st.clone()), Query(SummaryQuery { session: None })).await;
        let body = body_json(resp).await;
        assert_eq!(body["summary"]["accessible_servers"], 1);
        assert_eq!(body["risk_assessment"]["overall_risk_level"], "HIGH");

        let resp = health(State(st)).await;
        assert_eq!(body_json(resp).await["servers"], 1);
    }
}

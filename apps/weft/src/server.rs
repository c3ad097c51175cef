use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use weft_analyze::Analyzer;
use weft_store::{PageRequest, StoreError};

#[derive(Clone)]
struct AppState {
    analyzer: Arc<Analyzer>,
}

#[derive(Deserialize)]
struct SessionsQuery {
    limit: Option<u16>,
    cursor: Option<String>,
}

pub async fn run_server(analyzer: Arc<Analyzer>, host: String, port: u16) -> Result<()> {
    let app = router(AppState { analyzer });

    let bind = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .map_err(|err| anyhow!("invalid bind address: {err}"))?;

    let listener = tokio::net::TcpListener::bind(bind).await.map_err(|error| {
        if error.kind() == ErrorKind::AddrInUse {
            anyhow!("failed to bind {bind}: address already in use; set [server].port to a free port")
        } else {
            anyhow!("failed to bind {bind}: {error}")
        }
    })?;
    info!("query api listening at http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/status", get(api_status))
        .route("/api/watermark", get(api_watermark))
        .route("/api/traces/:id", get(api_trace))
        .route("/api/blocks/:id", get(api_block))
        .route("/api/sessions", get(api_sessions))
        .route("/api/sessions/:context_id", get(api_session))
        .with_state(state)
}

fn json_response<T: Serialize>(payload: T, status: StatusCode) -> Response {
    let mut response = Json(payload).into_response();
    *response.status_mut() = status;
    response
}

fn error_response(error: &anyhow::Error) -> Response {
    let status = match error.downcast_ref::<StoreError>() {
        Some(StoreError::InvalidCursor(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(json!({"error": format!("{error:#}")}), status)
}

fn record_response<T: Serialize>(kind: &str, id: &str, result: Result<Option<T>>) -> Response {
    match result {
        Ok(Some(record)) => json_response(record, StatusCode::OK),
        Ok(None) => json_response(
            json!({"error": format!("{kind} {id} not found")}),
            StatusCode::NOT_FOUND,
        ),
        Err(error) => error_response(&error),
    }
}

async fn api_health() -> Response {
    json_response(json!({"ok": true}), StatusCode::OK)
}

async fn api_status(State(state): State<AppState>) -> Response {
    json_response(state.analyzer.status(), StatusCode::OK)
}

async fn api_watermark(State(state): State<AppState>) -> Response {
    json_response(state.analyzer.watermark(), StatusCode::OK)
}

async fn api_trace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    record_response("trace", &id, state.analyzer.get_trace(&id))
}

async fn api_block(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    record_response("block", &id, state.analyzer.get_block_log(&id))
}

async fn api_session(State(state): State<AppState>, Path(context_id): Path<String>) -> Response {
    record_response("session", &context_id, state.analyzer.get_session(&context_id))
}

async fn api_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let mut page = PageRequest::default();
    if let Some(limit) = query.limit {
        page.limit = limit;
    }
    page.cursor = query.cursor;

    match state.analyzer.list_sessions(&page) {
        Ok(sessions) => json_response(sessions, StatusCode::OK),
        Err(error) => error_response(&error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn missing_records_map_to_not_found() {
        let response = record_response::<serde_json::Value>("block", "b1", Ok(None));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = record_response("block", "b1", Ok(Some(json!({"id": "b1"}))));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn invalid_cursor_is_a_bad_request() {
        let error = Err::<(), _>(StoreError::invalid_cursor("bad"))
            .context("failed to list sessions")
            .expect_err("error");
        assert_eq!(error_response(&error).status(), StatusCode::BAD_REQUEST);

        let error = anyhow!("disk on fire");
        assert_eq!(
            error_response(&error).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

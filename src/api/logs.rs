//! Deployment log reads and live tails.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::store;
use crate::logs::{ReadOptions, SinceFilter};
use crate::AppState;

use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Log path as stored on the deployment record
    pub path: String,
    #[serde(default)]
    pub since: SinceFilter,
    #[serde(default)]
    pub timestamps: bool,
    pub search: Option<String>,
}

impl LogQuery {
    fn read_options(&self) -> ReadOptions {
        ReadOptions {
            since: self.since,
            with_timestamps: self.timestamps,
            search: self.search.clone().filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub path: String,
    pub lines: Vec<String>,
}

/// GET /api/logs?path=&since=&timestamps=&search=
pub async fn read_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogResponse>, ApiError> {
    let lines = state.logs.read_to_vec(&query.path, query.read_options()).await?;
    Ok(Json(LogResponse {
        path: query.path,
        lines,
    }))
}

/// GET /api/logs/stream, Server-Sent Events until the deployment finishes
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let db = state.db.clone();
    // Records hold the root-prefixed form; a relative path must find them too
    let log_path = state.logs.canonical_path(&query.path)?;
    let is_active = move || {
        let db = db.clone();
        let log_path = log_path.clone();
        async move {
            match store::find_deployment_by_log_path(&db, &log_path).await {
                Ok(Some(deployment)) => !deployment.status_enum().is_terminal(),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to check deployment state for log tail");
                    false
                }
            }
        }
    };

    let lines = state.logs.follow(
        &query.path,
        query.read_options(),
        state.config.engine.log_poll_interval(),
        is_active,
    )?;

    let events = lines
        .map(|line| Ok(Event::default().data(line)))
        .chain(futures::stream::once(async {
            Ok(Event::default().event("end").data("Log stream ended"))
        }));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

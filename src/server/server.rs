use anyhow::Result;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::state::*;
use super::websocket::ws_handler;
use crate::error::RegistryError;
use crate::skill_store::{CommitRequest, VersionRecord};

#[derive(Serialize)]
struct ServerStats {
    pub status: &'static str,
    pub uptime: String,
    pub started_at: String,
    pub hash: String,
    pub skills: usize,
    pub connected_agents: usize,
    pub changelog_tail: u64,
    pub degraded_entries: usize,
    pub log_halted: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug)]
struct PublishBody {
    pub name: String,
    /// Base64-encoded skill content.
    pub content: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub author_id: String,
    pub expected_parent_version: Option<u64>,
}

#[derive(Serialize)]
struct PublishResponse {
    name: String,
    version: u64,
    sequence: u64,
    degraded: bool,
}

#[derive(Serialize)]
struct SkillResponse {
    name: String,
    version: u64,
    parent_version: Option<u64>,
    content: String,
    content_hash: String,
    description: String,
    tags: Vec<String>,
    author_id: String,
    created_at: i64,
}

impl From<VersionRecord> for SkillResponse {
    fn from(record: VersionRecord) -> Self {
        SkillResponse {
            content: BASE64.encode(&record.content),
            name: record.name,
            version: record.version,
            parent_version: record.parent_version,
            content_hash: record.content_hash,
            description: record.description,
            tags: record.tags,
            author_id: record.author_id,
            created_at: record.created_at,
        }
    }
}

/// History entries carry metadata only; content stays behind a pinned get.
#[derive(Serialize)]
struct HistoryEntry {
    version: u64,
    parent_version: Option<u64>,
    content_hash: String,
    description: String,
    tags: Vec<String>,
    author_id: String,
    tombstone: bool,
    created_at: i64,
}

/// Listing entries carry metadata only, like history.
#[derive(Serialize)]
struct SkillSummary {
    name: String,
    version: u64,
    content_hash: String,
    description: String,
    tags: Vec<String>,
    author_id: String,
    created_at: i64,
}

#[derive(Deserialize, Debug)]
struct ListSkillsParams {
    tag: Option<String>,
    author_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GetSkillParams {
    version: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct DeleteSkillParams {
    author_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SearchBody {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Deserialize, Debug)]
struct ChangesParams {
    #[serde(default)]
    after: u64,
    #[serde(default = "default_changes_limit")]
    limit: usize,
}

fn default_changes_limit() -> usize {
    100
}

fn error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::Conflict { .. } => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::DeliveryGap(_) => StatusCode::CONFLICT,
        RegistryError::LogHalted => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let RegistryError::Conflict { latest, .. } = &err {
        body["latest_version"] = json!(latest);
    }
    (status, Json(body)).into_response()
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        started_at: chrono::Utc::now().to_rfc3339(),
        hash: state.hash.clone(),
        skills: state.coordinator.store().skill_count(),
        connected_agents: state.hub.connected_count(),
        changelog_tail: state.changelog.tail(),
        degraded_entries: state.coordinator.degraded_count(),
        log_halted: state.changelog.is_halted(),
    };
    Json(stats)
}

async fn publish_skill(
    State(coordinator): State<GuardedCoordinator>,
    Json(body): Json<PublishBody>,
) -> Response {
    debug!("Publish request for {}", body.name);
    let content = match BASE64.decode(&body.content) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": "invalid_content",
                    "message": format!("content is not valid base64: {}", e),
                })),
            )
                .into_response();
        }
    };

    let req = CommitRequest {
        name: body.name,
        content,
        description: body.description,
        tags: body.tags,
        author_id: body.author_id,
        expected_parent: body.expected_parent_version,
    };
    match coordinator.publish(req).await {
        Ok(outcome) => Json(PublishResponse {
            name: outcome.record.name,
            version: outcome.record.version,
            sequence: outcome.change.sequence,
            degraded: outcome.change.degraded,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_skills(
    State(coordinator): State<GuardedCoordinator>,
    Query(params): Query<ListSkillsParams>,
) -> Response {
    match coordinator.store().latest_records() {
        Ok(records) => {
            let skills: Vec<SkillSummary> = records
                .into_iter()
                .filter(|r| params.tag.as_ref().map_or(true, |t| r.tags.contains(t)))
                .filter(|r| params.author_id.as_ref().map_or(true, |a| *a == r.author_id))
                .map(|r| SkillSummary {
                    name: r.name,
                    version: r.version,
                    content_hash: r.content_hash,
                    description: r.description,
                    tags: r.tags,
                    author_id: r.author_id,
                    created_at: r.created_at,
                })
                .collect();
            Json(skills).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_skill(
    State(coordinator): State<GuardedCoordinator>,
    Path(name): Path<String>,
    Query(params): Query<GetSkillParams>,
) -> Response {
    match coordinator.store().get(&name, params.version) {
        Ok(record) => Json(SkillResponse::from(record)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_skill_history(
    State(coordinator): State<GuardedCoordinator>,
    Path(name): Path<String>,
) -> Response {
    match coordinator.store().history(&name) {
        Ok(records) => {
            let entries: Vec<HistoryEntry> = records
                .into_iter()
                .map(|r| HistoryEntry {
                    version: r.version,
                    parent_version: r.parent_version,
                    content_hash: r.content_hash,
                    description: r.description,
                    tags: r.tags,
                    author_id: r.author_id,
                    tombstone: r.tombstone,
                    created_at: r.created_at,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn delete_skill(
    State(coordinator): State<GuardedCoordinator>,
    Path(name): Path<String>,
    Query(params): Query<DeleteSkillParams>,
) -> Response {
    let author_id = params.author_id.unwrap_or_else(|| "unknown".to_string());
    match coordinator.delete(&name, &author_id).await {
        Ok(outcome) => Json(PublishResponse {
            name: outcome.record.name,
            version: outcome.record.version,
            sequence: outcome.change.sequence,
            degraded: outcome.change.degraded,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn search_skills(
    State(coordinator): State<GuardedCoordinator>,
    Json(body): Json<SearchBody>,
) -> Response {
    match coordinator.search(&body.query, body.top_k, &body.tags).await {
        Ok(hits) => Json(hits).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_changes(
    State(changelog): State<GuardedChangeLog>,
    Query(params): Query<ChangesParams>,
) -> Response {
    Json(changelog.read_from(params.after, params.limit)).into_response()
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(home))
        .route("/v1/skills", get(list_skills).post(publish_skill))
        .route("/v1/skills/{name}", get(get_skill))
        .route("/v1/skills/{name}", delete(delete_skill))
        .route("/v1/skills/{name}/history", get(get_skill_history))
        .route("/v1/search", post(search_skills))
        .route("/v1/changes", get(get_changes))
        .route("/v1/ws", get(ws_handler))
        .with_state(state)
}

pub async fn run_server(state: ServerState, port: u16) -> Result<()> {
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;

    Ok(axum::serve(listener, app).await?)
}

//! Axum REST API for CAST: document and match submission, listings, and
//! synchroniser status/actions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cast_core::{AdvisoryDocument, AdvisoryMatch, MatchStatus};
use cast_storage::{DocumentStore, MatchFilter, MatchStore, StoreError};
use cast_sync::{
    spawn_delayed_refresh, DocumentHints, DocumentRegistry, MatchSubmission, PollerError,
    Refresher, RegistryError, SubmissionService, SubmitError, SyncAction, SyncStatusPoller,
    TriggerRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "cast-web";

pub struct AppState {
    pub documents: Arc<dyn DocumentStore>,
    pub matches: Arc<dyn MatchStore>,
    pub registry: DocumentRegistry,
    pub submissions: SubmissionService,
    pub poller: SyncStatusPoller,
    /// Absent in tests; then creations simply skip the delayed refresh.
    pub refresher: Option<Arc<Refresher>>,
    pub refresh_delay: Duration,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/documents",
            post(create_document_handler).get(list_documents_handler),
        )
        .route("/api/documents/{id}", get(document_detail_handler))
        .route(
            "/api/matches",
            post(create_matches_handler).get(list_matches_handler),
        )
        .route("/api/matches/{id}", get(match_detail_handler))
        .route("/api/matches/{id}/status", post(match_status_handler))
        .route("/api/synchronisers", get(synchronisers_handler))
        .route(
            "/api/synchronisers/{index}/{action}",
            post(synchroniser_action_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire representations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct ApiDocument {
    id: i64,
    docurl: String,
    title: String,
    version: Option<String>,
    lang: Option<String>,
    publisher: Option<String>,
    status: cast_core::DocumentStatus,
    created: chrono::DateTime<chrono::Utc>,
    last_updated: chrono::DateTime<chrono::Utc>,
}

impl From<&AdvisoryDocument> for ApiDocument {
    fn from(doc: &AdvisoryDocument) -> Self {
        Self {
            id: doc.id,
            docurl: doc.docurl.clone(),
            title: doc.title.clone(),
            version: doc.version.clone(),
            lang: doc.lang.clone(),
            publisher: doc.publisher.clone(),
            status: doc.status,
            created: doc.created,
            last_updated: doc.last_updated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiMatch {
    id: i64,
    csaf_document: i64,
    device: Option<i64>,
    software: Option<i64>,
    product_name_id: Option<String>,
    score: f64,
    time: chrono::DateTime<chrono::Utc>,
    status: MatchStatus,
    description: String,
}

impl From<&AdvisoryMatch> for ApiMatch {
    fn from(m: &AdvisoryMatch) -> Self {
        Self {
            id: m.id,
            csaf_document: m.document_id,
            device: m.device_id,
            software: m.software_id,
            product_name_id: m.product_name_id.clone(),
            score: m.score,
            time: m.time,
            status: m.status,
            description: m.description.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DocumentSubmission {
    #[serde(default)]
    docurl: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatchStatusUpdate {
    status: MatchStatus,
}

#[derive(Debug, Deserialize, Default)]
struct MatchListQuery {
    status: Option<MatchStatus>,
    device: Option<i64>,
    software: Option<i64>,
    document: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_document_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DocumentSubmission>,
) -> Response {
    let Some(docurl) = payload.docurl.as_deref().filter(|u| !u.trim().is_empty()) else {
        return bad_request("Missing docurl");
    };

    let hints = DocumentHints {
        title: payload.title,
        version: payload.version,
        lang: payload.lang,
        publisher: payload.publisher,
    };
    match state.registry.create_or_get(docurl, hints).await {
        Ok((doc, created)) => {
            if created {
                schedule_refresh(&state);
            }
            Json(json!({ "id": doc.id })).into_response()
        }
        Err(err @ (RegistryError::MissingUrl | RegistryError::UrlTooLong)) => {
            bad_request(&err.to_string())
        }
        Err(RegistryError::Store(err)) => server_error(err.into()),
    }
}

async fn list_documents_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.documents.list_documents().await {
        Ok(docs) => Json(docs.iter().map(ApiDocument::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn document_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.documents.get_document(id).await {
        Ok(Some(doc)) => Json(ApiDocument::from(&doc)).into_response(),
        Ok(None) => not_found(&format!("no document {id}")),
        Err(err) => server_error(err.into()),
    }
}

/// Accepts one match payload or an array of them. Each element is processed
/// independently; a failing element is reported in place.
async fn create_matches_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Response {
    let (items, single) = match payload {
        Value::Array(items) => (items, false),
        other => (vec![other], true),
    };

    let mut results = Vec::with_capacity(items.len());
    let mut any_created = false;
    for item in items {
        match serde_json::from_value::<MatchSubmission>(item) {
            Err(err) => results.push(json!({ "error": format!("invalid match payload: {err}") })),
            Ok(submission) => match state.submissions.submit_one(submission).await {
                Ok(outcome) => {
                    any_created |= outcome.document_created;
                    results.push(json!(ApiMatch::from(&outcome.record)));
                }
                Err(err @ (SubmitError::UnknownDocument(_) | SubmitError::Registry(_))) => {
                    results.push(json!({ "error": err.to_string() }))
                }
                Err(SubmitError::Store(err)) => return server_error(err.into()),
            },
        }
    }
    if any_created {
        schedule_refresh(&state);
    }

    if single {
        let result = results.remove(0);
        let status = if result.get("error").is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::CREATED
        };
        (status, Json(result)).into_response()
    } else {
        (StatusCode::CREATED, Json(Value::Array(results))).into_response()
    }
}

async fn list_matches_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MatchListQuery>,
) -> Response {
    let filter = MatchFilter {
        document_id: query.document,
        device_id: query.device,
        software_id: query.software,
        status: query.status,
    };
    match state.matches.list_matches(&filter).await {
        Ok(rows) => Json(rows.iter().map(ApiMatch::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn match_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.matches.get_match(id).await {
        Ok(Some(m)) => Json(ApiMatch::from(&m)).into_response(),
        Ok(None) => not_found(&format!("no match {id}")),
        Err(err) => server_error(err.into()),
    }
}

async fn match_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(update): Json<MatchStatusUpdate>,
) -> Response {
    match state.matches.set_match_status(id, update.status).await {
        Ok(m) => Json(ApiMatch::from(&m)).into_response(),
        Err(StoreError::NotFound(msg)) => not_found(&msg),
        Err(err) => server_error(err.into()),
    }
}

async fn synchronisers_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.poller.status_rows().await).into_response()
}

async fn synchroniser_action_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((index, action)): AxumPath<(usize, String)>,
    trigger: Option<Json<TriggerRequest>>,
) -> Response {
    let Some(action) = SyncAction::parse(&action) else {
        return not_found(&format!("unknown action {action}"));
    };
    let trigger = trigger.map(|Json(t)| t);
    match state.poller.run_action(index, action, trigger).await {
        Ok(message) => Json(json!({ "message": message })).into_response(),
        Err(PollerError::UnknownSynchroniser(index)) => {
            not_found(&format!("no synchroniser {index}"))
        }
        Err(err @ (PollerError::MissingBaseUrl(_) | PollerError::UnknownDocument(_))) => {
            bad_request(&err.to_string())
        }
        Err(err @ (PollerError::Token(_) | PollerError::Client(_) | PollerError::Action(_))) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn schedule_refresh(state: &AppState) {
    if let Some(refresher) = &state.refresher {
        spawn_delayed_refresh(refresher.clone(), state.refresh_delay);
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

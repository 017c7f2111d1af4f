use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::models::{
    CancelResponse, DuplicateSummary, FileState, HealthResponse, SessionResponse, UploadAccepted,
    UrlUploadRequest,
};
use super::state::AppState;
use super::validation;
use crate::convert::{ConversionOptions, MediaFormat};
use crate::dedup::{DuplicatePolicy, FileIdentity, RecommendedAction, Resolution};
use crate::queue::JobSpec;
use crate::storage::StorageClient;
use crate::store::StoredFile;

const SESSION_HEADER: &str = "X-Soundbox-Session";
const FILENAME_HEADER: &str = "X-Soundbox-Filename";
const OUTPUT_FORMAT_HEADER: &str = "X-Soundbox-Output-Format";
const PRIORITY_HEADER: &str = "X-Soundbox-Priority";

const DEFAULT_PRIORITY: u8 = 5;

/// Everything an ingest needs besides the bytes themselves.
struct IngestRequest {
    session_id: Option<String>,
    filename: String,
    output_format: MediaFormat,
    priority: u8,
    options: ConversionOptions,
    content_type: Option<String>,
}

/// Direct upload endpoint (POST /uploads)
///
/// Raw media bytes in the body, described by `X-Soundbox-*` headers.
/// The flow is checksum, duplicate check, session registration, then
/// enqueue; an exact duplicate short-circuits before any storage work
/// and returns `skipped: true` with no job.
pub async fn ingest_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let filename = required_header(&headers, FILENAME_HEADER)?;
    let output_format: MediaFormat = required_header(&headers, OUTPUT_FORMAT_HEADER)?
        .parse()
        .map_err(|e: crate::convert::ConversionError| {
            ApiError::UnsupportedFormat(e.to_string())
        })?;

    let priority = match optional_header(&headers, PRIORITY_HEADER) {
        Some(raw) => raw
            .parse::<u8>()
            .map_err(|_| ApiError::InvalidRequest(format!("invalid priority: {raw}")))?,
        None => DEFAULT_PRIORITY,
    };

    let request = IngestRequest {
        session_id: optional_header(&headers, SESSION_HEADER),
        filename,
        output_format,
        priority,
        options: ConversionOptions::default(),
        content_type: optional_header(&headers, "content-type"),
    };

    let bytes = read_body(body, state.config.server.max_upload_bytes.as_u64()).await?;
    let response = ingest_bytes(&state, request, bytes).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(response)))
}

/// Remote upload endpoint (POST /uploads/url)
///
/// The server fetches the URL and then follows the exact same flow as
/// a direct upload.
pub async fn ingest_url(
    State(state): State<AppState>,
    Json(request): Json<UrlUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let output_format: MediaFormat = request
        .output_format
        .parse()
        .map_err(|e: crate::convert::ConversionError| {
            ApiError::UnsupportedFormat(e.to_string())
        })?;

    let filename = match request.filename {
        Some(name) => name,
        None => filename_from_url(&request.url).ok_or_else(|| {
            ApiError::InvalidRequest("cannot derive a filename from the url".to_string())
        })?,
    };

    debug!(url = %request.url, filename, "Fetching remote upload");
    let response = state
        .http
        .get(&request.url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| ApiError::UpstreamFetch(e.to_string()))?;

    let max = state.config.server.max_upload_bytes.as_u64();
    if response.content_length().is_some_and(|len| len > max) {
        return Err(ApiError::PayloadTooLarge(
            response.content_length().unwrap_or_default() as usize,
        ));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::UpstreamFetch(e.to_string()))?;
    validation::validate_body_size(bytes.len(), max)?;

    let ingest = IngestRequest {
        session_id: request.session_id,
        filename,
        output_format,
        priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
        options: request.options,
        content_type: None,
    };
    let response = ingest_bytes(&state, ingest, bytes).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(response)))
}

/// The shared ingest flow behind both upload endpoints.
async fn ingest_bytes(
    state: &AppState,
    request: IngestRequest,
    bytes: Bytes,
) -> Result<UploadAccepted, ApiError> {
    validation::validate_filename(&request.filename)?;
    validation::validate_content_size(bytes.len())?;
    let input_format = validation::resolve_formats(&request.filename, request.output_format)?;

    let checksum = format!("{:x}", Sha256::digest(&bytes));
    let candidate = FileIdentity {
        filename: request.filename.clone(),
        size: bytes.len() as u64,
        checksum: checksum.clone(),
    };

    let check = state.detector.check_for_duplicates(&candidate);

    if check.recommended == RecommendedAction::Skip
        && let Some(existing) = check.exact_matches.first()
    {
        info!(
            filename = %request.filename,
            existing_file = %existing.file_id,
            "Upload skipped, identical content exists"
        );
        state.metrics.duplicate_skipped();
        let session = state
            .sessions
            .create_or_get(request.session_id.as_deref())
            .await?;
        return Ok(UploadAccepted {
            session_id: session.session_id,
            file_id: existing.file_id.clone(),
            job_id: None,
            stored_filename: existing.filename.clone(),
            skipped: true,
            duplicate: Some(DuplicateSummary::from_check(&check)),
        });
    }

    // A similar (but not identical) file exists: store under a fresh
    // name so neither copy is clobbered.
    let stored_filename = match check.similar.first() {
        Some(best) => {
            match state
                .detector
                .resolve_policy(&candidate, &best.file, DuplicatePolicy::KeepBoth)
            {
                Resolution::StoreAs { filename, .. } => filename,
                _ => request.filename.clone(),
            }
        }
        None => request.filename.clone(),
    };

    let session = state
        .sessions
        .create_or_get(request.session_id.as_deref())
        .await?;
    state
        .sessions
        .register_files(&session.session_id, &[bytes.len() as u64])
        .await?;

    let file_id = Uuid::new_v4().to_string();
    let storage_key = StorageClient::upload_key_for(&session.session_id, &file_id, &stored_filename);
    let size = bytes.len() as u64;
    state.storage.upload(&storage_key, bytes).await?;

    let record = StoredFile {
        file_id: file_id.clone(),
        session_id: session.session_id.clone(),
        filename: stored_filename.clone(),
        size,
        checksum,
        content_type: request.content_type,
        storage_key: storage_key.clone(),
        created_at: chrono::Utc::now(),
    };
    state.store.create_file_record(&record)?;

    let job = state
        .queue
        .add_job(JobSpec {
            session_id: session.session_id.clone(),
            file_id: file_id.clone(),
            filename: stored_filename.clone(),
            input_key: storage_key,
            input_size: size,
            input_format,
            output_format: request.output_format,
            options: request.options,
            priority: request.priority,
        })
        .await?;

    state.metrics.upload_accepted();
    info!(
        session_id = %session.session_id,
        file_id = %file_id,
        job_id = %job.job_id,
        size,
        "Upload accepted"
    );

    Ok(UploadAccepted {
        session_id: session.session_id,
        file_id,
        job_id: Some(job.job_id),
        stored_filename,
        skipped: false,
        duplicate: check
            .has_duplicates
            .then(|| DuplicateSummary::from_check(&check)),
    })
}

/// Session status endpoint (GET /sessions/{id})
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get(&session_id).await?;
    let jobs = state.store.list_jobs_for_session(&session_id)?;

    let files = jobs
        .into_iter()
        .map(|job| FileState {
            job_id: job.job_id,
            file_id: job.file_id,
            filename: job.filename,
            status: job.status,
            attempts: job.attempts,
            result_key: job.result_key,
            error: job.error,
        })
        .collect();

    let progress = state.broadcaster.session_progress(&session_id).await;
    let estimated = state.queue.estimated_processing_time().await;

    Ok((
        axum::http::StatusCode::OK,
        Json(SessionResponse {
            session,
            files,
            progress,
            estimated_seconds_remaining: estimated.as_secs(),
            estimated_remaining_text: crate::humanize::format_eta(estimated),
        }),
    ))
}

/// Cancel a session (POST /sessions/{id}/cancel)
///
/// Pending jobs are swept; running jobs finish on their own.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.cancel(&session_id).await?;
    let pending_jobs_removed = state.queue.remove_session_jobs(&session_id).await?;

    Ok((
        axum::http::StatusCode::OK,
        Json(CancelResponse {
            session_id,
            pending_jobs_removed,
        }),
    ))
}

/// SSE fallback stream of session progress events
/// (GET /sessions/{id}/events)
pub async fn sse_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 before holding a stream open for a session nobody created.
    state.sessions.get(&session_id).await?;

    let (_, rx) = state.broadcaster.subscribe_session(&session_id).await;
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default().event("progress").json_data(&event).ok()?;
        Some((Ok::<_, Infallible>(sse), rx))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// WebSocket push channel for session progress events
/// (GET /sessions/{id}/ws)
pub async fn ws_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.get(&session_id).await?;
    Ok(ws.on_upgrade(move |socket| push_progress(socket, state, session_id)))
}

async fn push_progress(mut socket: WebSocket, state: AppState, session_id: String) {
    let (listener_id, mut rx) = state.broadcaster.subscribe_session(&session_id).await;
    debug!(session_id, listener_id, "WebSocket progress channel open");

    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Progress event serialization failed");
                continue;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }

    state.broadcaster.unsubscribe(listener_id).await;
    debug!(session_id, listener_id, "WebSocket progress channel closed");
}

/// Health check endpoint (GET /health)
///
/// Returns health status of each component. 503 if any component is
/// unhealthy, 200 otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    use std::collections::HashMap;

    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());
    components.insert(
        "store".to_string(),
        match state.store.stats() {
            Ok(_) => "healthy".to_string(),
            Err(_) => "unhealthy".to_string(),
        },
    );
    components.insert("storage".to_string(), "healthy".to_string());
    let queue_stats = state.queue.stats().await;
    components.insert(
        "queue".to_string(),
        format!(
            "healthy ({} active, {} pending)",
            queue_stats.active, queue_stats.pending
        ),
    );

    let all_healthy = components.values().all(|s| s.starts_with("healthy"));
    let status_code = if all_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    optional_header(headers, name)
        .ok_or_else(|| ApiError::InvalidRequest(format!("{name} header is required")))
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .filter(|value| !value.is_empty())
}

/// Last path segment of a URL, query string stripped. A URL without a
/// path (bare authority) yields nothing; the hostname is not a
/// filename.
fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let (_, path) = after_scheme.split_once('/')?;
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(segment.to_string())
}

/// Reads request body and validates size
///
/// Note: decompression is handled by RequestDecompressionLayer, so this
/// receives already-decompressed data.
async fn read_body(body: axum::body::Body, max: u64) -> Result<Bytes, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes();

    validation::validate_body_size(data.len(), max)?;
    Ok(data)
}

//! JSON API over the dispatcher, the blog and the scraper.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use autodialer_blog::{BlogError, BlogStore};
use autodialer_core::{BatchOutcome, DispatchError, Dispatcher};
use autodialer_scrape::{ScrapeError, ScrapeRunner, PROFILES_FILE};
use autodialer_types::RecordId;

#[derive(Clone)]
pub struct AppState {
    pub dialer: Arc<Dispatcher>,
    pub blog: Arc<BlogStore>,
    pub scraper: Arc<ScrapeRunner>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/phone_numbers", get(list_numbers))
        .route("/phone_numbers/bulk_upload", post(bulk_upload))
        .route("/phone_numbers/call_all", post(call_all))
        .route("/phone_numbers/call_all/cancel", post(cancel_batch))
        .route("/phone_numbers/ai_prompt", post(ai_prompt))
        .route("/phone_numbers/:id/call_now", post(call_now))
        .route("/phone_numbers/:id/reset", post(reset))
        .route("/phone_numbers/:id/attempts", get(attempts))
        .route("/blog", get(blog_index))
        .route("/blog/generate", post(blog_generate))
        .route("/blog/:slug", get(blog_show).delete(blog_destroy))
        .route("/scrape", post(scrape))
        .route("/scrape/download", get(scrape_download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Failure rendered as `{"alert": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    alert: String,
}

impl ApiError {
    fn new(status: StatusCode, alert: impl Into<String>) -> Self {
        Self {
            status,
            alert: alert.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "alert": self.alert }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Busy(_) | DispatchError::BatchRunning => StatusCode::CONFLICT,
            DispatchError::NoDestination | DispatchError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            DispatchError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "request failed");
        }
        Self::new(status, e.to_string())
    }
}

impl From<BlogError> for ApiError {
    fn from(e: BlogError) -> Self {
        match e {
            BlogError::NoTopics => Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            BlogError::Llm(_) => Self::new(StatusCode::BAD_GATEWAY, format!("Error: {e}")),
            BlogError::Io(_) => {
                tracing::error!(error = %e, "blog storage failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"))
            }
        }
    }
}

impl From<ScrapeError> for ApiError {
    fn from(e: ScrapeError) -> Self {
        tracing::error!(error = %e, "scrape failed to run");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    numbers_text: String,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    titles: String,
}

fn message_of(body: Option<Json<MessageBody>>) -> Option<String> {
    body.and_then(|Json(b)| b.message)
        .filter(|m| !m.trim().is_empty())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_numbers(State(state): State<AppState>) -> ApiResult {
    let records = state.dialer.list().await?;
    let statistics = state.dialer.statistics().await?;
    Ok(Json(json!({ "phone_numbers": records, "statistics": statistics })))
}

async fn bulk_upload(State(state): State<AppState>, Json(body): Json<UploadBody>) -> ApiResult {
    let report = state.dialer.bulk_upload(&body.numbers_text).await?;
    let mut out = json!({
        "notice": format!("Added {} phone numbers", report.created.len()),
        "report": report,
    });
    if !report.rejected.is_empty() {
        let alert: Vec<String> = report
            .rejected
            .iter()
            .map(|r| format!("{}: Number {}", r.input, r.reason))
            .collect();
        out["alert"] = Value::String(alert.join("\n"));
    }
    Ok(Json(out))
}

async fn call_now(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
    body: Option<Json<MessageBody>>,
) -> ApiResult {
    let message = message_of(body);
    let done = state.dialer.call_now(id, message.as_deref()).await?;
    Ok(Json(json!({ "notice": "Call initiated", "call": done })))
}

async fn call_all(State(state): State<AppState>, body: Option<Json<MessageBody>>) -> ApiResult {
    let message = message_of(body);
    match state.dialer.call_all(message.as_deref()).await? {
        BatchOutcome::NoPending => Ok(Json(json!({ "alert": "No pending numbers" }))),
        BatchOutcome::Ran(report) => {
            let mut notice = format!("Called {}. Failed: {}", report.succeeded, report.failed);
            if report.skipped > 0 {
                notice.push_str(&format!(". Skipped: {}", report.skipped));
            }
            if report.cancelled {
                notice.push_str(". Cancelled");
            }
            Ok(Json(json!({ "notice": notice, "report": report })))
        }
    }
}

async fn cancel_batch(State(state): State<AppState>) -> Json<Value> {
    state.dialer.cancel_batch();
    Json(json!({ "notice": "Cancellation requested" }))
}

async fn ai_prompt(State(state): State<AppState>, Json(body): Json<PromptBody>) -> ApiResult {
    let out = state.dialer.call_from_text(body.prompt.trim()).await?;
    let notice = format!(
        "Calling {} with: \"{}\".",
        out.dispatched.record.number, out.intent.message
    );
    Ok(Json(json!({ "notice": notice, "dispatch": out })))
}

async fn reset(State(state): State<AppState>, Path(id): Path<RecordId>) -> ApiResult {
    let record = state.dialer.reset(id).await?;
    Ok(Json(json!({
        "notice": format!("{} reset to pending", record.number),
        "phone_number": record,
    })))
}

async fn attempts(State(state): State<AppState>, Path(id): Path<RecordId>) -> ApiResult {
    let attempts = state.dialer.attempts(id).await?;
    Ok(Json(json!({ "attempts": attempts })))
}

async fn blog_index(State(state): State<AppState>) -> ApiResult {
    let posts = state.blog.list().await?;
    Ok(Json(json!({ "posts": posts })))
}

async fn blog_generate(State(state): State<AppState>, Json(body): Json<GenerateBody>) -> ApiResult {
    let count = state.blog.generate(&body.titles).await?;
    if count == 0 {
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            "No posts generated. Please try again.",
        ));
    }
    Ok(Json(json!({ "notice": format!("Generated {count} micro post(s).") })))
}

async fn blog_show(State(state): State<AppState>, Path(slug): Path<String>) -> ApiResult {
    match state.blog.read(&slug).await? {
        Some(post) => Ok(Json(json!({ "post": post }))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "Post not found")),
    }
}

async fn blog_destroy(State(state): State<AppState>, Path(slug): Path<String>) -> ApiResult {
    if state.blog.delete(&slug).await? {
        Ok(Json(json!({ "notice": format!("Deleted \"{slug}\".") })))
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "Post not found."))
    }
}

async fn scrape(State(state): State<AppState>) -> ApiResult {
    let report = state.scraper.run().await?;
    let notice = if report.success {
        "Scrape finished. See logs below."
    } else {
        "Scrape failed. See logs below."
    };
    Ok(Json(json!({ "notice": notice, "report": report })))
}

async fn scrape_download(State(state): State<AppState>) -> Result<Response, ApiError> {
    let Some(bytes) = state.scraper.download().await? else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "No file to download."));
    };
    let disposition = format!("attachment; filename=\"{PROFILES_FILE}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

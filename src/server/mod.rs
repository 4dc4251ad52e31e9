mod chat;
mod collections;
mod conversations;
mod documents;
mod migration;
mod tags;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use askama::Template;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::{AppConfig, API_PREFIX, PROJECT_NAME};
use crate::db::Database;
use crate::ingest::{IngestError, Ingestor};
use crate::rag::RagService;
use crate::store::VectorStore;

pub use chat::{handle_client_message, ServerMessage};

// Multipart framing and form fields on top of the file itself.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn VectorStore>,
    pub db: Database,
    pub ingestor: Ingestor,
    pub rag: RagService,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(collections::routes())
        .merge(documents::routes())
        .merge(tags::routes())
        .merge(chat::routes())
        .merge(conversations::routes())
        .merge(migration::routes());

    let body_limit = state.config.max_upload_bytes().saturating_add(BODY_LIMIT_SLACK);
    let cors = cors_layer(&state.config.cors_origins);
    let static_files = ServeDir::new(&state.config.static_dir);

    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health))
        .nest(API_PREFIX, api)
        .nest_service("/static", static_files)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.bind_addr.parse()?;
    let app = build_router(state);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    project_name: &'static str,
    api_prefix: &'static str,
    default_provider: String,
    providers: Vec<ProviderOption>,
}

struct ProviderOption {
    name: String,
    selected: bool,
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let llm = state.rag.llm();
    let default_provider = llm.default_provider();
    let template = IndexTemplate {
        project_name: PROJECT_NAME,
        api_prefix: API_PREFIX,
        default_provider: default_provider.to_string(),
        providers: llm
            .available()
            .into_iter()
            .map(|kind| ProviderOption {
                name: kind.to_string(),
                selected: kind == default_provider,
            })
            .collect(),
    };
    Ok(Html(template.render()?))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": format!("{PROJECT_NAME} is running"),
    }))
}

/// Looks up a collection and turns absence into a 404.
pub(crate) async fn require_collection(state: &AppState, name: &str) -> Result<(), ApiError> {
    let exists = state
        .store
        .collection_exists(name)
        .await
        .map_err(ApiError::failed("look up collection"))?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("Collection {name} not found")))
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn payload_too_large(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    /// Error mapper for `map_err` that prefixes unexpected failures with the action.
    /// Upload guard errors keep their own status codes.
    pub fn failed(action: &'static str) -> impl FnOnce(anyhow::Error) -> ApiError {
        move |err| {
            if let Some(ingest) = err.downcast_ref::<IngestError>() {
                let detail = ingest.to_string();
                return match ingest {
                    IngestError::TooLarge { .. } => ApiError::payload_too_large(detail),
                    IngestError::Timeout { .. } => ApiError::timeout(detail),
                    IngestError::NoText { .. } => ApiError::bad_request(detail),
                };
            }

            tracing::error!("failed to {}: {:#}", action, err);
            ApiError::internal(format!("Failed to {action}: {err:#}"))
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(format!("{value:#}"))
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self::internal(value.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::new(value.status(), value.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        Self::bad_request(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// `Json` whose rejections render as `{"detail": ..}`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        Json(self.0).into_response()
    }
}

/// `Query` whose rejections render as `{"detail": ..}`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

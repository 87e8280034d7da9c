use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parcel_core::auth::{AuthSessionManager, AuthState};
use parcel_core::backend::{
    is_backend_handle, BotApiClient, BotApiConfig, HttpBackend, RelayBridgeClient,
    RelayBridgeConfig, RemoteBackendClient,
};
use parcel_core::catalog::{FileCatalog, FileRecord};
use parcel_core::download::{DownloadGateway, DownloadOutcome, InlineDownload, RequestContext};
use parcel_core::events::UpdateSource;
use parcel_core::signing::{Clock, SignedToken, SignedUrlCodec, SystemClock};
use parcel_core::upload::{UploadDispatcher, UploadPath};
use parcel_core::{AuthorizedIdentity, Destination, FileMetadata};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, operator_token_matches};
use crate::catalog::InMemoryCatalog;
use crate::client_ip::ClientIp;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

const MIN_LINK_TTL_SECS: u64 = 60;
const MAX_LINK_TTL_SECS: u64 = 86_400;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    auth: Arc<AuthSessionManager>,
    uploads: Arc<UploadDispatcher>,
    gateway: Arc<DownloadGateway>,
    catalog: Arc<dyn FileCatalog>,
    destination: Destination,
    update_source: Option<Arc<dyn UpdateSource>>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> parcel_core::Result<Self> {
        let bot = BotApiClient::new(BotApiConfig {
            api_url: config.backend_api_url.clone(),
            bot_token: config.backend_bot_token.clone(),
            timeout: config.backend_timeout,
        })?;
        let relay = config
            .relay
            .as_ref()
            .map(|relay| {
                RelayBridgeClient::new(RelayBridgeConfig {
                    base_url: relay.url.clone(),
                    access_token: relay.access_token.clone(),
                    timeout: config.backend_timeout,
                })
            })
            .transpose()?;

        let update_source = relay
            .clone()
            .map(|relay| Arc::new(relay) as Arc<dyn UpdateSource>);
        let backend = Arc::new(HttpBackend::new(bot, relay));
        let mut state = Self::with_backend(config, backend, Arc::new(SystemClock))?;
        state.update_source = update_source;
        Ok(state)
    }

    pub fn with_backend(
        config: Arc<AppConfig>,
        backend: Arc<dyn RemoteBackendClient>,
        clock: Arc<dyn Clock>,
    ) -> parcel_core::Result<Self> {
        let codec = SignedUrlCodec::with_clock(config.signing_secret.as_bytes(), clock)?;
        let auth = Arc::new(AuthSessionManager::new(backend.clone()));
        let uploads = UploadDispatcher::new(
            backend.clone(),
            auth.clone(),
            config.small_file_threshold_bytes,
            config.upload_part_size_bytes,
        )?;
        let gateway = DownloadGateway::new(
            backend,
            Arc::new(codec),
            config.small_file_threshold_bytes,
            config.bind_client_ip,
        )
        .with_session(auth.clone());
        Ok(Self {
            auth,
            uploads: Arc::new(uploads),
            gateway: Arc::new(gateway),
            catalog: Arc::new(InMemoryCatalog::new()),
            destination: Destination::new(config.storage_channel.clone()),
            update_source: None,
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        })
    }

    #[cfg(test)]
    pub fn with_catalog(mut self, catalog: Arc<dyn FileCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn auth(&self) -> Arc<AuthSessionManager> {
        self.auth.clone()
    }

    pub fn update_source(&self) -> Option<Arc<dyn UpdateSource>> {
        self.update_source.clone()
    }

    fn request_context(&self, client_ip: ClientIp) -> RequestContext {
        RequestContext {
            client_ip: client_ip.0,
            relay_available: self.config.relay.is_some() && self.auth.is_authorized(),
        }
    }

    pub(crate) fn sign(&self, file_id: &str, ttl: Duration, client_ip: Option<IpAddr>) -> SignedToken {
        self.gateway.codec().issue(file_id, ttl, client_ip)
    }

    fn download_url(&self, file_id: &str) -> String {
        format!("{}/download/{file_id}", self.config.public_base_url)
    }
}

pub fn app_router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/auth/send-code", post(send_code))
        .route("/auth/verify-code", post(verify_code))
        .route("/auth/status", get(auth_status))
        .route("/upload", post(upload))
        .route("/files/{file_id}/link", post(issue_link))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/download/redirect/{subject_id}", get(signed_redirect))
        .route("/download/{file_id}", get(download))
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    auth_state: AuthState,
    relay_configured: bool,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        auth_state: state.auth.snapshot().state,
        relay_configured: state.config.relay.is_some(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    if !operator_token_matches(token, &state.config.admin_api_token) {
        return Err(AppError::unauthorized("Operator token is not valid"));
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct RedirectQuery {
    expires: Option<String>,
    signature: Option<String>,
}

/// Signed redirect. Backend-native handles skip the signature check.
async fn signed_redirect(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Path(subject_id): Path<String>,
    Query(query): Query<RedirectQuery>,
) -> Result<Response, AppError> {
    if is_backend_handle(&subject_id) {
        let url = state
            .gateway
            .redirect_handle(&subject_id)
            .await?
            .ok_or_else(|| AppError::not_found("Unknown file handle"))?;
        tracing::info!(endpoint = "download_redirect", direct_handle = true, "Redirecting to backend");
        return found(&url);
    }

    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return Err(AppError::Forbidden("Download link is not signed".to_string()));
    };
    let expires_at_epoch_ms = expires
        .trim()
        .parse::<i64>()
        .map_err(|_| AppError::from(parcel_core::Error::SignatureInvalid))?;

    let context = state.request_context(client_ip);
    state
        .gateway
        .verify_request(&subject_id, expires_at_epoch_ms, &signature, context)?;

    let record = find_record(&state, &subject_id).await?;
    let outcome = state.gateway.redirect(&record.stored).await;
    respond(&state, &record, outcome).await
}

async fn download(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let record = find_record(&state, &file_id).await?;
    let context = state.request_context(client_ip);
    let outcome = state.gateway.serve(&record.stored, context).await;
    respond(&state, &record, outcome).await
}

async fn find_record(state: &AppState, file_id: &str) -> Result<FileRecord, AppError> {
    state
        .catalog
        .find_file(file_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("File {file_id} does not exist")))
}

async fn respond(
    state: &AppState,
    record: &FileRecord,
    outcome: DownloadOutcome,
) -> Result<Response, AppError> {
    tracing::info!(
        file_id = %record.id,
        size_bytes = record.stored.size_bytes,
        outcome = outcome.label(),
        "Download served"
    );
    match outcome {
        DownloadOutcome::Inline(inline) => {
            state.catalog.record_download(&record.id).await?;
            inline_response(inline)
        }
        DownloadOutcome::Redirect(url) => {
            state.catalog.record_download(&record.id).await?;
            found(&url)
        }
        DownloadOutcome::Manual(manual) => Ok(Json(manual).into_response()),
    }
}

fn found(url: &str) -> Result<Response, AppError> {
    let location = HeaderValue::from_str(url)
        .map_err(|_| AppError::internal("Backend returned an unusable retrieval URL"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

fn inline_response(inline: InlineDownload) -> Result<Response, AppError> {
    let content_type = HeaderValue::from_str(&inline.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&inline.content_disposition)
        .map_err(|_| AppError::internal("File name cannot be encoded as a header"))?;

    let mut response = Response::new(Body::from_stream(inline.body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(inline.content_length));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendCodeResponse {
    phone_code_hash: String,
}

async fn send_code(
    State(state): State<AppState>,
    client_ip: ClientIp,
) -> Result<Json<SendCodeResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::AuthHandshake, client_ip)
        .await?;

    let relay = state
        .config
        .relay
        .as_ref()
        .ok_or_else(|| AppError::bad_request("Large-file relay is not configured"))?;
    let phone_code_hash = state
        .auth
        .request_code(&relay.phone_number)
        .await
        .map_err(AppError::handshake)?;
    Ok(Json(SendCodeResponse { phone_code_hash }))
}

#[derive(Debug, Deserialize)]
struct VerifyCodeRequest {
    code: String,
}

#[derive(Debug, Serialize)]
struct VerifyCodeResponse {
    authorized: bool,
    identity: AuthorizedIdentity,
}

async fn verify_code(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Json(request): Json<VerifyCodeRequest>,
) -> Result<Json<VerifyCodeResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::AuthHandshake, client_ip)
        .await?;

    let identity = state
        .auth
        .verify_code(&request.code)
        .await
        .map_err(AppError::handshake)?;
    Ok(Json(VerifyCodeResponse {
        authorized: true,
        identity,
    }))
}

#[derive(Debug, Deserialize)]
struct AuthStatusQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct AuthStatusResponse {
    authorized: bool,
    state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<AuthorizedIdentity>,
}

async fn auth_status(
    State(state): State<AppState>,
    Query(query): Query<AuthStatusQuery>,
) -> Result<Json<AuthStatusResponse>, AppError> {
    let session = if query.refresh {
        state.auth.check_existing().await?
    } else {
        state.auth.snapshot()
    };
    Ok(Json(AuthStatusResponse {
        authorized: session.state == AuthState::Authorized,
        state: session.state,
        identity: session.authorized_identity,
    }))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file: FileRecord,
    path: UploadPath,
    download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_epoch_ms: Option<i64>,
}

async fn upload(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Upload, client_ip)
        .await?;

    let size_bytes = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request("Content-Length header is required"))?;
    let file_name = upload_file_name(&headers, query.filename)
        .ok_or_else(|| AppError::bad_request("Provide a file name via X-File-Name or ?filename="))?;
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let metadata = FileMetadata::new(file_name, mime_type);

    let path = state.uploads.path_for(size_bytes);
    let stored = state
        .uploads
        .upload_stream(&state.destination, &metadata, size_bytes, body.into_data_stream())
        .await?;
    let record = state.catalog.create_file_record(stored).await?;

    // links bound to the uploader's address would be useless to anyone else
    let (signed_url, expires_at_epoch_ms) = if state.gateway.binds_client_ip() {
        (None, None)
    } else {
        let token = state.sign(&record.id, state.config.signature_ttl, None);
        (
            Some(token.redirect_url(&state.config.public_base_url)?),
            Some(token.expires_at_epoch_ms),
        )
    };

    tracing::info!(
        endpoint = "upload",
        file_id = %record.id,
        size_bytes,
        path = path.label(),
        "Stored upload"
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            download_url: state.download_url(&record.id),
            file: record,
            path,
            signed_url,
            expires_at_epoch_ms,
        }),
    ))
}

fn upload_file_name(headers: &HeaderMap, query_name: Option<String>) -> Option<String> {
    let header_name = headers
        .get("x-file-name")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    header_name
        .or(query_name)
        .and_then(|name| {
            // keep only the final path component
            name.rsplit(|c: char| c == '/' || c == '\\').next().map(str::to_string)
        })
        .and_then(|name| parcel_core::util::normalize_text_option(Some(name)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequest {
    ttl_secs: Option<u64>,
    client_ip: Option<IpAddr>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkResponse {
    url: String,
    expires_at_epoch_ms: i64,
    signature: String,
}

async fn issue_link(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, AppError> {
    let record = find_record(&state, &file_id).await?;

    let ttl = match request.ttl_secs {
        Some(secs) if (MIN_LINK_TTL_SECS..=MAX_LINK_TTL_SECS).contains(&secs) => {
            Duration::from_secs(secs)
        }
        Some(_) => {
            return Err(AppError::bad_request(format!(
                "ttlSecs must be in [{MIN_LINK_TTL_SECS}, {MAX_LINK_TTL_SECS}]"
            )))
        }
        None => state.config.signature_ttl,
    };
    let client_ip = if state.gateway.binds_client_ip() {
        Some(request.client_ip.ok_or_else(|| {
            AppError::bad_request("clientIp is required while download links are IP-bound")
        })?)
    } else {
        None
    };

    let token = state.sign(&record.id, ttl, client_ip);
    tracing::info!(
        endpoint = "issue_link",
        file_id = %record.id,
        ip_bound = client_ip.is_some(),
        expires_at = token.expires_at_epoch_ms,
        "Issued signed download link"
    );
    Ok(Json(LinkResponse {
        url: token.redirect_url(&state.config.public_base_url)?,
        expires_at_epoch_ms: token.expires_at_epoch_ms,
        signature: token.signature_hex,
    }))
}

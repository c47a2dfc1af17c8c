//! REST API layer (Axum).
//!
//! Public routes: `/api/health`, `/api/auth/register`, `/api/auth/login`.
//! Everything else sits behind the bearer-token middleware and only ever sees
//! the caller's own deployments; foreign records answer 404.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::{hash_password, verify_password, TokenKeys};
use crate::config::Config;
use crate::error::{ApiError, ErrorBody};
use crate::models::{
    normalize_email, AuthPayload, Deployment, DeploymentStatus, NewDeployment, Plan, UsageMetrics,
    User, UserProfile,
};
use crate::monitor::{DeploymentMonitor, Notifier};
use crate::packaging::{self, ArchiveSummary, PackagingError};
use crate::provider::HostingProvider;
use crate::storage::Storage;

const MIN_PASSWORD_LEN: usize = 8;

/// Shared app state for REST handlers, built once at startup.
pub struct AppState {
    pub storage: Storage,
    pub keys: TokenKeys,
    pub monitor: DeploymentMonitor,
    pub config: Config,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        storage: Storage,
        provider: Arc<dyn HostingProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let monitor = DeploymentMonitor::new(
            storage.clone(),
            provider,
            notifier,
            config.poll,
            config.upload_dir.clone(),
        );
        Self {
            keys: TokenKeys::new(config.jwt_secret.as_bytes(), config.token_ttl_secs),
            storage,
            monitor,
            config,
            started_at: Instant::now(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub deployment_id: Uuid,
    pub domain: String,
    pub status: DeploymentStatus,
    pub estimated_seconds: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub deployment_id: Uuid,
    pub domain: String,
    pub status: DeploymentStatus,
    #[serde(flatten)]
    pub metrics: UsageMetrics,
    pub live_since: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Generic REST response (JSON)
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .get_or_insert_with(utoipa::openapi::Components::default);

        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        register_handler,
        login_handler,
        me_handler,
        deploy_handler,
        list_deployments_handler,
        get_deployment_handler,
        delete_deployment_handler,
        analytics_handler,
    ),
    components(schemas(
        RegisterRequest,
        LoginRequest,
        AuthResponse,
        UserProfile,
        Plan,
        DeployResponse,
        Deployment,
        DeploymentStatus,
        UsageMetrics,
        AnalyticsResponse,
        HealthResponse,
        MessageResponse,
        ErrorBody,
    )),
    modifiers(&SecurityAddon),
    info(
        title = "ntl_cloud API",
        description = "Accounts, deployments and their lifecycle status."
    ),
    tags((name = "ntl_cloud", description = "Deployment dashboard API"))
)]
pub struct ApiDoc;

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized("missing bearer token"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized("authorization scheme must be Bearer"))?;

    let claims = state
        .keys
        .validate(token.trim())
        .map_err(|_| ApiError::Forbidden("invalid or expired token"))?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;
    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "request"
    );
    response
}

/// Build the router: `/api/*` endpoints plus Swagger UI at `/api/docs`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_bytes;

    let auth_routes = Router::new()
        .route("/api/auth/me", get(me_handler))
        .route(
            "/api/deploy",
            post(deploy_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/deployments", get(list_deployments_handler))
        .route(
            "/api/deployments/:id",
            get(get_deployment_handler).delete(delete_deployment_handler),
        )
        .route("/api/analytics/:id", get(analytics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/register", post(register_handler))
        .route("/api/auth/login", post(login_handler))
        .merge(auth_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_requests))
}

fn validate_email(email: &str) -> Result<String, ApiError> {
    let email = normalize_email(email);
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ApiError::validation("a valid email is required"))
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AuthResponse),
        (status = 400, description = "Invalid input or email taken", body = ErrorBody)
    )
)]
async fn register_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let Json(payload) = payload?;
    let email = validate_email(&payload.email)?;
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let name = payload.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

    let hash = hash_password(&payload.password)?;
    let user = User::new(&email, name, hash);
    state.storage.create_user(&user)?;
    info!(user_id = %user.id, "user registered");

    let token = state.keys.issue(&user)?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            user: user.profile(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed token", body = AuthResponse),
        (status = 401, description = "Bad credentials", body = ErrorBody)
    )
)]
async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Json(payload) = payload?;
    const BAD_CREDENTIALS: ApiError = ApiError::Unauthorized("invalid email or password");

    let user = state
        .storage
        .get_user_by_email(&normalize_email(&payload.email))?
        .ok_or(BAD_CREDENTIALS)?;

    if !verify_password(&payload.password, &user.password_hash).unwrap_or(false) {
        return Err(BAD_CREDENTIALS);
    }

    let token = state.keys.issue(&user)?;
    Ok(Json(AuthResponse {
        token,
        user: user.profile(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses((status = 200, description = "Current user", body = UserProfile)),
    security(("bearer" = []))
)]
async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
) -> Result<Json<UserProfile>, ApiError> {
    let user = state
        .storage
        .get_user_by_email(&claims.email)?
        .filter(|u| u.id == claims.sub)
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(user.profile()))
}

/// Parsed `POST /api/deploy` form.
#[derive(Default)]
struct DeployForm {
    domain: Option<String>,
    project_name: Option<String>,
    repo_url: Option<String>,
    branch: Option<String>,
    build_command: Option<String>,
    output_dir: Option<String>,
    files: Vec<(String, Bytes)>,
    archives: Vec<Bytes>,
}

impl DeployForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "files" | "files[]" => {
                    let file_name = field
                        .file_name()
                        .map(str::to_string)
                        .ok_or_else(|| ApiError::validation("file parts need a file name"))?;
                    packaging::sanitize_relative(&file_name)
                        .map_err(|e| ApiError::validation(e.to_string()))?;
                    form.files.push((file_name, field.bytes().await?));
                }
                "archive" => form.archives.push(field.bytes().await?),
                "domain" => form.domain = text(field).await?,
                "projectName" => form.project_name = text(field).await?,
                "repoUrl" => form.repo_url = text(field).await?,
                "branch" => form.branch = text(field).await?,
                "buildCommand" => form.build_command = text(field).await?,
                "outputDir" => form.output_dir = text(field).await?,
                other => tracing::debug!(field = other, "ignoring unknown form field"),
            }
        }
        Ok(form)
    }

    fn has_artifact(&self) -> bool {
        !self.files.is_empty() || !self.archives.is_empty()
    }

    fn into_new_deployment(self, owner_id: Uuid, base_domain: &str) -> Result<NewDeployment, ApiError> {
        let raw_domain = self
            .domain
            .ok_or_else(|| ApiError::validation("domain is required"))?;
        let domain = normalize_domain(&raw_domain, base_domain)?;

        if let Some(repo) = &self.repo_url {
            if !(repo.starts_with("https://") || repo.starts_with("http://") || repo.starts_with("git@")) {
                return Err(ApiError::validation("repoUrl must be an http(s) or git@ URL"));
            }
        }

        let output_dir = match self.output_dir {
            Some(dir) if dir != "." => packaging::sanitize_relative(&dir)
                .map_err(|e| ApiError::validation(e.to_string()))?
                .to_string_lossy()
                .into_owned(),
            _ => ".".to_string(),
        };

        let project_name = self
            .project_name
            .unwrap_or_else(|| domain.split('.').next().unwrap_or_default().to_string());

        Ok(NewDeployment {
            owner_id,
            domain,
            project_name,
            repo_url: self.repo_url,
            branch: self.branch,
            build_command: self.build_command,
            output_dir,
        })
    }
}

async fn text(field: Field<'_>) -> Result<Option<String>, ApiError> {
    let value = field.text().await?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

/// Lower-case a requested domain; bare names get the platform base domain.
pub fn normalize_domain(raw: &str, base_domain: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim().to_lowercase();
    let stripped = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed)
        .trim_end_matches('/');

    let domain = if stripped.contains('.') {
        stripped.to_string()
    } else {
        format!("{stripped}.{base_domain}")
    };

    let label_ok = |label: &str| {
        (1..=63).contains(&label.len())
            && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if domain.len() > 253 || !domain.split('.').all(label_ok) {
        return Err(ApiError::validation(format!("invalid domain: {raw}")));
    }
    Ok(domain)
}

/// Check every uploaded part against the expansion budget without writing.
fn inspect_upload(
    files: &[(String, Bytes)],
    archives: &[Bytes],
    max_bytes: u64,
) -> Result<ArchiveSummary, PackagingError> {
    let mut total = ArchiveSummary::default();
    for archive in archives {
        let summary = packaging::inspect_archive(archive, max_bytes)?;
        total.files += summary.files;
        total.bytes = total.bytes.saturating_add(summary.bytes);
    }
    for (_, bytes) in files {
        total.add_file(u64::try_from(bytes.len()).unwrap_or(u64::MAX), max_bytes)?;
    }
    if total.bytes > max_bytes || total.files > packaging::MAX_ARCHIVE_FILES {
        return Err(PackagingError::TooLarge { limit: max_bytes });
    }
    Ok(total)
}

fn stage_upload(
    root: &std::path::Path,
    files: Vec<(String, Bytes)>,
    archives: Vec<Bytes>,
    max_bytes: u64,
) -> Result<usize, PackagingError> {
    std::fs::create_dir_all(root)?;
    let mut count = 0;
    for archive in archives {
        count += packaging::unpack_into(root, &archive, max_bytes)?;
    }
    for (name, bytes) in files {
        packaging::save_file(root, &name, &bytes)?;
        count += 1;
    }
    Ok(count)
}

#[utoipa::path(
    post,
    path = "/api/deploy",
    responses(
        (status = 201, description = "Deployment accepted", body = DeployResponse),
        (status = 400, description = "Invalid form or domain taken", body = ErrorBody)
    ),
    security(("bearer" = []))
)]
/// Create a deployment.
///
/// Multipart form: `domain`, optional `projectName`, `repoUrl`, `branch`,
/// `buildCommand`, `outputDir`, plus `files` parts and/or an `archive`
/// (.tar.gz). At least one file or a `repoUrl` is required.
async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<DeployResponse>), ApiError> {
    let mut form = DeployForm::read(multipart).await?;
    if !form.has_artifact() && form.repo_url.is_none() {
        return Err(ApiError::validation("upload files or provide a repoUrl"));
    }
    let files = std::mem::take(&mut form.files);
    let archives = std::mem::take(&mut form.archives);
    let new = form.into_new_deployment(claims.sub, &state.config.base_domain)?;

    // Nothing is persisted until the upload is known to be acceptable.
    let max_bytes = state.config.max_unpacked_bytes;
    let (files, archives) = tokio::task::spawn_blocking(move || {
        inspect_upload(&files, &archives, max_bytes).map(|_| (files, archives))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    let deployment = Deployment::create(new);
    state.storage.create_deployment(&deployment)?;
    info!(deployment_id = %deployment.id, domain = %deployment.domain, "deployment created");

    if !files.is_empty() || !archives.is_empty() {
        let root = state.monitor.staging_dir(deployment.id);
        let staged =
            tokio::task::spawn_blocking(move || stage_upload(&root, files, archives, max_bytes))
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
        match staged {
            Ok(count) => info!(deployment_id = %deployment.id, files = count, "upload staged"),
            Err(err) => {
                let message = format!("upload staging failed: {err}");
                state.monitor.mark_failed(deployment.id, message.clone())?;
                return Err(ApiError::internal(message));
            }
        }
    }

    state.monitor.spawn(deployment.id);

    Ok((
        StatusCode::CREATED,
        Json(DeployResponse {
            deployment_id: deployment.id,
            domain: deployment.domain,
            status: deployment.status,
            estimated_seconds: state.monitor.policy().budget().as_secs(),
        }),
    ))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("deployment"))
}

#[utoipa::path(
    get,
    path = "/api/deployments",
    responses((status = 200, description = "Caller's deployments, newest first", body = [Deployment])),
    security(("bearer" = []))
)]
async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.storage.list_deployments_for(claims.sub)?))
}

#[utoipa::path(
    get,
    path = "/api/deployments/{id}",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "Deployment", body = Deployment),
        (status = 404, description = "Absent or not owned by caller", body = ErrorBody)
    ),
    security(("bearer" = []))
)]
async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.storage.get_deployment_for(claims.sub, id)?))
}

#[utoipa::path(
    delete,
    path = "/api/deployments/{id}",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "Deleted", body = MessageResponse),
        (status = 404, description = "Absent or not owned by caller", body = ErrorBody)
    ),
    security(("bearer" = []))
)]
async fn delete_deployment_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let removed = state.storage.delete_deployment_for(claims.sub, id)?;

    match tokio::fs::remove_dir_all(state.monitor.staging_dir(id)).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(deployment_id = %id, error = %err, "failed to remove staged files"),
    }
    info!(deployment_id = %id, domain = %removed.domain, "deployment deleted");

    Ok(Json(MessageResponse {
        success: true,
        message: format!("Deployment {} deleted", removed.domain),
    }))
}

#[utoipa::path(
    get,
    path = "/api/analytics/{id}",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "Illustrative usage counters", body = AnalyticsResponse),
        (status = 404, description = "Absent or not owned by caller", body = ErrorBody)
    ),
    security(("bearer" = []))
)]
async fn analytics_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<AuthPayload>,
    Path(id): Path<String>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let id = parse_id(&id)?;
    let deployment = state.storage.get_deployment_for(claims.sub, id)?;
    let live_since = (deployment.status == DeploymentStatus::Live).then_some(deployment.updated_at);

    Ok(Json(AnalyticsResponse {
        deployment_id: deployment.id,
        domain: deployment.domain,
        status: deployment.status,
        metrics: deployment.metrics,
        live_since,
    }))
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Liveness check", body = HealthResponse))
)]
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

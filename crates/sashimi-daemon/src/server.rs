use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use std::env;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::auth::{self, AuthError};
use sashimi_engine::{Config, EngineError, SearchQuery};
use sashimi_registry::{Registry, RegistryError};

const BUILD_TIME_PATH: &str = "/app/docker-build-time.txt";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let master = Config::master_from_env().context("failed to load master config")?;
    let registry = Registry::open(master)
        .await
        .context("failed to build registry")?;

    let state = Arc::new(AppState {
        registry: Arc::new(registry),
        started: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        build_time: std::fs::read_to_string(BUILD_TIME_PATH)
            .ok()
            .map(|s| s.trim().to_string()),
    });

    let mut app = build_router(state.clone());
    if let Some(cors) = cors_layer(&state.registry.master_origins()) {
        app = app.layer(cors);
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "sashimi-daemon listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/ds", axum::routing::post(create_project))
        .route(
            "/ds/:project",
            get(project_info)
                .post(project_op)
                .put(put_dataset)
                .delete(rm_dataset),
        )
        .route(
            "/ds/:project/_config",
            get(get_project_config).post(set_project_config),
        )
        .route(
            "/ds/:project/:ds",
            get(ds_status).post(ds_search).put(ds_insert).patch(ds_patch),
        )
        .route(
            "/ds/:project/:ds/_config",
            get(get_ds_config).post(set_ds_config),
        )
        .route("/ds/:project/:ds/:name", get(named_search))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    )
}

pub struct AppState {
    registry: Arc<Registry>,
    started: String,
    build_time: Option<String>,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("SASHIMI_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
            .parse()
            .context("invalid SASHIMI_API_ADDR")?;
        Ok(Self { listen_addr })
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service banner", body = BannerResponse))
)]
async fn banner(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Json<BannerResponse> {
    Json(BannerResponse {
        description: "Sashimi :: fast and secure search inside structured data".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started: state.started.clone(),
        build_time: state.build_time.clone(),
        client_host: peer.ip().to_string(),
        projects: state.registry.project_names(),
    })
}

#[utoipa::path(
    post,
    path = "/ds",
    request_body = NewProjectBody,
    responses(
        (status = 200, description = "Project created", body = ApiKeyResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 409, description = "Project already exists", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_project(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<NewProjectBody>,
) -> Result<Json<ApiKeyResponse>, ApiError> {
    let effective = state.registry.effective_master();
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let apikey = state.registry.create_project(&body.name)?;
    Ok(Json(ApiKeyResponse { apikey }))
}

#[utoipa::path(
    post,
    path = "/ds/{project}",
    params(("project" = String, Path, description = "Project name")),
    request_body = ProjectOpBody,
    responses(
        (status = 200, description = "Operation result", body = ApiKeyResponse),
        (status = 400, description = "Unknown operation", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn project_op(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ProjectOpBody>,
) -> Result<Json<ApiKeyResponse>, ApiError> {
    let effective = state.registry.effective_master();
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let project = state.registry.project(&project_name)?;
    match body.op.as_str() {
        "new-key" => {
            let apikey = project.new_key()?;
            Ok(Json(ApiKeyResponse { apikey }))
        }
        other => Err(ApiError::bad_request(format!(
            "unknown project operation {other:?}"
        ))),
    }
}

#[utoipa::path(
    get,
    path = "/ds/{project}",
    params(("project" = String, Path, description = "Project name")),
    responses(
        (status = 200, description = "Project info", body = ProjectInfoResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn project_info(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ProjectInfoResponse>, ApiError> {
    let project = state.registry.project(&project_name)?;
    let effective = state.registry.effective(&project, None);
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let mut datasets = BTreeMap::new();
    for (name, dataset) in project.datasets_snapshot() {
        let guard = dataset.read();
        datasets.insert(
            name,
            DatasetInfo {
                items: guard.len(),
                size: guard.size(),
                status: guard.status().to_string(),
                local: guard.is_local(),
                update_ip: guard.update_ip().map(str::to_owned),
                loaded: guard.loaded().format("%Y-%m-%d %H:%M:%S").to_string(),
                secret: effective.sandbox.then(|| guard.secret().is_some()),
            },
        );
    }

    Ok(Json(ProjectInfoResponse {
        project: project_name,
        sandbox: effective.sandbox.then_some(true),
        datasets,
    }))
}

#[utoipa::path(
    get,
    path = "/ds/{project}/_config",
    params(("project" = String, Path, description = "Project name")),
    responses(
        (status = 200, description = "Project config YAML", content_type = "text/plain"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "No config set", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_project_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let project = state.registry.project(&project_name)?;
    let effective = state.registry.effective(&project, None);
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let path = project
        .config_path()
        .filter(|p| p.exists())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No config set for {project_name}"),
            )
        })?;
    tokio::fs::read_to_string(path).await.map_err(ApiError::internal)
}

#[utoipa::path(
    post,
    path = "/ds/{project}/_config",
    params(("project" = String, Path, description = "Project name")),
    request_body(content = String, content_type = "text/plain"),
    responses(
        (status = 200, description = "Config saved", content_type = "text/plain"),
        (status = 400, description = "Invalid YAML", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn set_project_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<String, ApiError> {
    let project = state.registry.project(&project_name)?;
    let effective = state.registry.effective(&project, None);
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    project.write_config(&body)?;
    Ok(format!("Saved config for {project_name}"))
}

#[utoipa::path(
    get,
    path = "/ds/{project}/{ds}/_config",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    responses(
        (status = 200, description = "Dataset config YAML", content_type = "text/plain"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "No config set", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_ds_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((project_name, ds_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let effective = {
        let guard = dataset.read();
        state.registry.effective(&project, Some(guard.config()))
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let path = project
        .dataset_config_path(&ds_name)
        .filter(|p| p.exists())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No config set for {project_name} / {ds_name}"),
            )
        })?;
    tokio::fs::read_to_string(path).await.map_err(ApiError::internal)
}

#[utoipa::path(
    post,
    path = "/ds/{project}/{ds}/_config",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    request_body(content = String, content_type = "text/plain"),
    responses(
        (status = 200, description = "Config saved", content_type = "text/plain"),
        (status = 400, description = "Invalid YAML", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Dataset not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn set_ds_config(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((project_name, ds_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<String, ApiError> {
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let effective = {
        let guard = dataset.read();
        state.registry.effective(&project, Some(guard.config()))
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let config = project.write_dataset_config(&ds_name, &body)?;
    dataset.write().apply_config(config);
    Ok(format!("Saved config for {project_name} / {ds_name}"))
}

#[utoipa::path(
    get,
    path = "/ds/{project}/{ds}",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    responses(
        (status = 200, description = "Dataset status string", content_type = "text/plain"),
        (status = 404, description = "Dataset not found", body = ErrorBody)
    )
)]
async fn ds_status(
    State(state): State<Arc<AppState>>,
    Path((project_name, ds_name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let (_, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let status = dataset.read().status().to_string();
    Ok(status)
}

#[utoipa::path(
    post,
    path = "/ds/{project}/{ds}",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    request_body = SearchQueryBody,
    responses(
        (status = 200, description = "Search response envelope"),
        (status = 400, description = "Rejected expression or aggregate", body = ErrorBody),
        (status = 404, description = "Dataset not found", body = ErrorBody)
    )
)]
async fn ds_search(
    State(state): State<Arc<AppState>>,
    Path((project_name, ds_name)): Path<(String, String)>,
    Json(body): Json<SearchQueryBody>,
) -> Result<Json<sashimi_engine::SearchOutcome>, ApiError> {
    state.registry.cron();
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let query: SearchQuery = body.into();

    let start = Instant::now();
    let guard = dataset.read();
    let effective = state.registry.effective(&project, Some(guard.config()));
    let mut outcome = guard.search(&query, state.registry.model(), effective.limit)?;
    drop(guard);

    outcome.time = Some(round3(start.elapsed().as_secs_f64()));
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/ds/{project}/{ds}/{name}",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name"),
        ("name" = String, Path, description = "Named search")
    ),
    responses(
        (status = 200, description = "Cached search response envelope"),
        (status = 404, description = "Unknown project, dataset or named search", body = ErrorBody)
    )
)]
async fn named_search(
    State(state): State<Arc<AppState>>,
    Path((project_name, ds_name, search_name)): Path<(String, String, String)>,
) -> Result<Json<sashimi_engine::SearchOutcome>, ApiError> {
    state.registry.cron();
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;

    let start = Instant::now();
    let mut guard = dataset.write();
    let effective = state.registry.effective(&project, Some(guard.config()));
    let mut outcome = guard
        .run_named_search(&search_name, state.registry.model(), effective.limit)?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No such named search {search_name:?} in ds {ds_name:?}"),
            )
        })?;
    drop(guard);

    outcome.time = Some(round3(start.elapsed().as_secs_f64()));
    Ok(Json(outcome))
}

#[utoipa::path(
    put,
    path = "/ds/{project}/{ds}",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    request_body = SearchQueryBody,
    responses(
        (status = 200, description = "Record inserted", content_type = "text/plain"),
        (status = 400, description = "Missing or invalid data", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Dataset not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn ds_insert(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((project_name, ds_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<SearchQueryBody>,
) -> Result<String, ApiError> {
    state.registry.cron();
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let effective = {
        let guard = dataset.read();
        state.registry.effective(&project, Some(guard.config()))
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let data = body
        .data
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("need data"))?;
    let record: Value = serde_json::from_str(data)
        .map_err(|err| ApiError::bad_request(format!("JSON error: {err}")))?;

    let mut guard = dataset.write();
    guard.insert(record);
    let new_size = guard.len();
    drop(guard);

    Ok(format!(
        "Inserted record to {ds_name:?} in project {project_name:?} new size: {new_size}."
    ))
}

#[utoipa::path(
    patch,
    path = "/ds/{project}/{ds}",
    params(
        ("project" = String, Path, description = "Project name"),
        ("ds" = String, Path, description = "Dataset name")
    ),
    request_body = SearchQueryBody,
    responses(
        (status = 200, description = "Mutation response envelope"),
        (status = 400, description = "Unknown operation or rejected expression", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Dataset not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn ds_patch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((project_name, ds_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<SearchQueryBody>,
) -> Result<Json<Value>, ApiError> {
    state.registry.cron();
    let (project, dataset) = state.registry.dataset(&project_name, &ds_name)?;
    let effective = {
        let guard = dataset.read();
        state.registry.effective(&project, Some(guard.config()))
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    let query: SearchQuery = body.into();
    let op = query.op.clone().unwrap_or_default();
    let start = Instant::now();

    let mut envelope = match op.as_str() {
        "delete" => {
            let outcome = dataset
                .write()
                .delete(&query, state.registry.model())?;
            serde_json::to_value(outcome).map_err(ApiError::internal)?
        }
        "update" => {
            let ip = auth::client_ip(&headers, peer.ip(), effective.ip_header.as_deref())?;
            let outcome =
                dataset
                    .write()
                    .update(&query, state.registry.model(), Some(ip.to_string()))?;
            serde_json::to_value(outcome).map_err(ApiError::internal)?
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "Unknown PATCH operation {other:?}"
            )))
        }
    };

    if let Some(object) = envelope.as_object_mut() {
        object.insert(
            "time".to_string(),
            Value::from(round3(start.elapsed().as_secs_f64())),
        );
    }
    Ok(Json(envelope))
}

#[utoipa::path(
    put,
    path = "/ds/{project}",
    params(("project" = String, Path, description = "Project name")),
    request_body = DatasetPutBody,
    responses(
        (status = 200, description = "Dataset replaced", content_type = "text/plain"),
        (status = 401, description = "Missing or invalid credentials, or secret mismatch", body = ErrorBody),
        (status = 404, description = "Project not found", body = ErrorBody),
        (status = 422, description = "Invalid dataset name", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn put_dataset(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DatasetPutBody>,
) -> Result<String, ApiError> {
    state.registry.cron();
    let project = state.registry.project(&project_name)?;

    let existing = project.get_dataset(&body.name);
    let effective = match &existing {
        Some(dataset) => {
            let guard = dataset.read();
            state.registry.effective(&project, Some(guard.config()))
        }
        None => state.registry.effective(&project, None),
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    if effective.sandbox {
        if let Some(dataset) = &existing {
            let guard = dataset.read();
            if let Some(stored) = guard.secret() {
                if body.secret.as_deref() != Some(stored) {
                    return Err(ApiError::unauthorized("secret mismatch"));
                }
            }
        }
    }
    let secret = if effective.sandbox { body.secret } else { None };

    let ip = auth::client_ip(&headers, peer.ip(), effective.ip_header.as_deref())?;
    let persist = !effective.sandbox && project.path().is_some();
    let new_size = state
        .registry
        .upsert_dataset(
            &project,
            &body.name,
            body.ds,
            Some(ip.to_string()),
            secret,
            persist,
        )
        .await?;

    Ok(format!(
        "Replaced dataset {:?} in project {project_name:?} new size: {new_size}.",
        body.name
    ))
}

#[utoipa::path(
    delete,
    path = "/ds/{project}",
    params(("project" = String, Path, description = "Project name")),
    request_body = DatasetDeleteBody,
    responses(
        (status = 200, description = "Dataset removed", content_type = "text/plain"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project or dataset not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn rm_dataset(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DatasetDeleteBody>,
) -> Result<String, ApiError> {
    state.registry.cron();
    let (project, dataset) = state.registry.dataset(&project_name, &body.name)?;
    let effective = {
        let guard = dataset.read();
        state.registry.effective(&project, Some(guard.config()))
    };
    auth::authorize(&headers, peer.ip(), require_bearer(&headers)?, &effective)?;

    state.registry.remove_dataset(&project, &body.name)?;
    Ok(format!(
        "Removed dataset {:?} from project {project_name:?}.",
        body.name
    ))
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct SearchQueryBody {
    expr: Option<String>,
    #[schema(value_type = Option<Object>)]
    filter: Option<Map<String, Value>>,
    op: Option<String>,
    sort: Option<String>,
    reverse: bool,
    token: Option<String>,
    limit: Option<usize>,
    offset: usize,
    fields: Option<Vec<String>>,
    aggregate: Option<Vec<String>>,
    discard: bool,
    data: Option<String>,
    #[schema(value_type = Option<Object>)]
    update: Option<Map<String, Value>>,
    update_field: Option<String>,
    update_data: Option<String>,
}

impl From<SearchQueryBody> for SearchQuery {
    fn from(body: SearchQueryBody) -> Self {
        SearchQuery {
            expr: body.expr,
            filter: body.filter,
            op: body.op,
            sort: body.sort,
            reverse: body.reverse,
            token: body.token,
            limit: body.limit,
            offset: body.offset,
            fields: body.fields,
            aggregate: body.aggregate,
            discard: body.discard,
            data: body.data,
            update: body.update,
            update_field: body.update_field,
            update_data: body.update_data,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
struct NewProjectBody {
    name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ProjectOpBody {
    op: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct DatasetPutBody {
    name: String,
    #[schema(value_type = Vec<Object>)]
    ds: Vec<Value>,
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct DatasetDeleteBody {
    name: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct ApiKeyResponse {
    apikey: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct BannerResponse {
    description: String,
    version: String,
    started: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_time: Option<String>,
    client_host: String,
    projects: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ProjectInfoResponse {
    project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox: Option<bool>,
    datasets: BTreeMap<String, DatasetInfo>,
}

#[derive(Debug, Serialize, ToSchema)]
struct DatasetInfo {
    items: usize,
    size: usize,
    status: String,
    local: bool,
    update_ip: Option<String>,
    loaded: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<bool>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::Compile(_) | EngineError::BadInput(_) | EngineError::Yaml(_) => {
                ApiError::bad_request(err.to_string())
            }
            EngineError::OperationNotAllowed { .. } => ApiError::unauthorized(err.to_string()),
            EngineError::InvalidName(_) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            EngineError::Io(_) => ApiError::internal(err),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ProjectNotFound(_) | RegistryError::DatasetNotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, err.to_string())
            }
            RegistryError::ProjectExists(_) => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            RegistryError::Engine(inner) => ApiError::from(inner),
            RegistryError::NoProjectsRoot
            | RegistryError::Load { .. }
            | RegistryError::Json(_)
            | RegistryError::Io(_) => ApiError::internal(err),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::unauthorized(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))?;
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}

/// Seconds with millisecond precision, the envelope's `time` field.
fn round3(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Sashimi API", version = "0.1.0"),
        paths(
            banner,
            create_project,
            project_op,
            project_info,
            get_project_config,
            set_project_config,
            get_ds_config,
            set_ds_config,
            ds_status,
            ds_search,
            named_search,
            ds_insert,
            ds_patch,
            put_dataset,
            rm_dataset
        ),
        components(
            schemas(
                SearchQueryBody,
                NewProjectBody,
                ProjectOpBody,
                DatasetPutBody,
                DatasetDeleteBody,
                ApiKeyResponse,
                BannerResponse,
                ProjectInfoResponse,
                DatasetInfo,
                ErrorBody
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            if let Some(components) = openapi.components.as_mut() {
                components.add_security_scheme(
                    "bearerAuth",
                    SecurityScheme::Http(
                        HttpBuilder::new()
                            .scheme(HttpAuthScheme::Bearer)
                            .bearer_format("API Token")
                            .description(Some("Project or master bearer token"))
                            .build(),
                    ),
                );
            }
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use sashimi_engine::ConfigRole;
    use serde_json::json;
    use tempfile::TempDir;
    use tower::Service;

    fn fixture() -> Value {
        json!([
            {"id": 1, "title": "iPhone 9", "price": 549, "brand": "Apple", "category": "smartphones"},
            {"id": 2, "title": "iPhone X", "price": 899, "brand": "Apple", "category": "smartphones"},
            {"id": 3, "title": "Samsung Universe 9", "price": 1249, "brand": "Samsung", "category": "smartphones"},
            {"id": 4, "title": "OPPOF19", "price": 280, "brand": "OPPO", "category": "smartphones"},
            {"id": 5, "title": "MacBook Pro", "price": 1749, "brand": "Apple", "category": "laptops"},
            {"id": 6, "title": "Perfume Oil", "price": 13, "brand": "Impression", "category": "fragrances"},
        ])
    }

    async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let mut master = Config::new(ConfigRole::Master);
        master.set("tokens", json!(["master-token"]));
        master.set("projects", json!(temp.path().to_string_lossy()));

        let registry = Registry::open(master).await.expect("registry");
        let state = Arc::new(AppState {
            registry: Arc::new(registry),
            started: "2026-08-01 00:00:00".to_string(),
            build_time: None,
        });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&value).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        request
    }

    fn text_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        request
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn create_project_with_data(router: &mut Router) -> String {
        let response = router
            .call(request(
                "POST",
                "/ds",
                Some("master-token"),
                Some(json!({"name": "test"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let apikey = body_json(response).await["apikey"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some(&apikey),
                Some(json!({"name": "products", "ds": fixture()})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        apikey
    }

    #[tokio::test]
    async fn banner_lists_projects() {
        let (_state, mut router, _temp) = setup_test_app().await;
        create_project_with_data(&mut router).await;

        let response = router.call(request("GET", "/", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["client_host"], "127.0.0.1");
        assert_eq!(body["projects"], json!(["test"]));
    }

    #[tokio::test]
    async fn create_project_requires_master_token_and_conflicts() {
        let (_state, mut router, _temp) = setup_test_app().await;

        let response = router
            .call(request("POST", "/ds", None, Some(json!({"name": "p1"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(request(
                "POST",
                "/ds",
                Some("wrong"),
                Some(json!({"name": "p1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(request(
                "POST",
                "/ds",
                Some("master-token"),
                Some(json!({"name": "p1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let apikey = body_json(response).await["apikey"].as_str().unwrap().to_string();
        assert_eq!(apikey.len(), 50);

        let response = router
            .call(request(
                "POST",
                "/ds",
                Some("master-token"),
                Some(json!({"name": "p1"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn search_pipeline_over_http() {
        let (_state, mut router, _temp) = setup_test_app().await;
        create_project_with_data(&mut router).await;

        // Search needs no auth.
        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "True"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["matches"], 6);
        assert_eq!(body["limit"], 20);
        assert!(body["time"].is_number());

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "price > 20", "discard": true})),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["matches"], 5);
        assert!(body.get("result").is_none());

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "True", "sort": "price", "limit": 1})),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"][0]["title"], "Perfume Oil");
        assert_eq!(body["truncated"], true);

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({
                    "filter": {"category": "smartphones"},
                    "aggregate": ["min:price", "max:price"],
                    "discard": true
                })),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["aggregation"]["min:price"], 280);
        assert_eq!(body["aggregation"]["max:price"], 1249);

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({
                    "filter": {"brand": "Apple", "price__lt": 1000},
                    "sort": "price",
                    "reverse": true
                })),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["matches"], 2);
        assert_eq!(body["result"][0]["price"], 899);
    }

    #[tokio::test]
    async fn broken_expression_is_counted_not_fatal() {
        let (_state, mut router, _temp) = setup_test_app().await;
        create_project_with_data(&mut router).await;

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "SomethingWrong"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 0);
        assert_eq!(body["exceptions"], 6);
        assert!(body["last_exception"].as_str().unwrap().contains("SomethingWrong"));
    }

    #[tokio::test]
    async fn unparseable_expression_is_a_400() {
        let (_state, mut router, _temp) = setup_test_app().await;
        create_project_with_data(&mut router).await;

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "price >"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "True", "aggregate": ["median:price"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_update_and_delete() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        // Master token works on dataset mutations through inheritance.
        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some("master-token"),
                Some(json!({"op": "update", "expr": "id==2", "update": {"x": "xxx", "price": 123}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["matches"], 1);

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "id==2"})),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"][0]["x"], "xxx");
        assert_eq!(body["result"][0]["price"], 123);

        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"op": "delete", "expr": "id==2"})),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["old_size"], 6);
        assert_eq!(body["new_size"], 5);

        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"op": "reload"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some("wrong"),
                Some(json!({"op": "delete", "expr": "True"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn insert_roundtrip() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let response = router
            .call(request(
                "PUT",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"data": "{\"id\": 666, \"title\": \"xxx\", \"price\": 1234}"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("new size: 7"));

        let response = router
            .call(request(
                "POST",
                "/ds/test/products",
                None,
                Some(json!({"expr": "id == 666"})),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["matches"], 1);

        let response = router
            .call(request(
                "PUT",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"expr": "True"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn named_search_config_roundtrip_and_cache() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let yaml = "search:\n  cheap:\n    expr: price < 600\n    limit: 10\n";
        let response = router
            .call(text_request(
                "POST",
                "/ds/test/products/_config",
                Some(&apikey),
                yaml,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(request("GET", "/ds/test/products/_config", Some(&apikey), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, yaml);

        let response = router
            .call(request("GET", "/ds/test/products/cheap", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = body_json(response).await;
        assert_eq!(first["matches"], 3);
        assert_eq!(first["limit"], 10);

        let response = router
            .call(request("GET", "/ds/test/products/cheap", None, None))
            .await
            .unwrap();
        let second = body_json(response).await;
        assert_eq!(first["result"], second["result"]);

        // A mutation invalidates the cache.
        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"op": "update", "expr": "id==6", "update": {"price": 9999}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(request("GET", "/ds/test/products/cheap", None, None))
            .await
            .unwrap();
        let third = body_json(response).await;
        assert_eq!(third["matches"], 2);

        let response = router
            .call(request("GET", "/ds/test/products/nope", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn allowed_operations_gate_mutations() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let yaml = "allowed_operations:\n  - update\n";
        let response = router
            .call(text_request(
                "POST",
                "/ds/test/products/_config",
                Some(&apikey),
                yaml,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"op": "delete", "expr": "True"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(request(
                "PATCH",
                "/ds/test/products",
                Some(&apikey),
                Some(json!({"op": "update", "expr": "id==1", "update": {"seen": true}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn project_info_and_status() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let response = router
            .call(request("GET", "/ds/test", Some(&apikey), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["project"], "test");
        assert_eq!(body["datasets"]["products"]["items"], 6);
        assert_eq!(body["datasets"]["products"]["status"], "OK");
        assert_eq!(body["datasets"]["products"]["local"], true);

        let response = router
            .call(request("GET", "/ds/test", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(request("GET", "/ds/test/products", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");

        let response = router
            .call(request("GET", "/ds/test/nope", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .call(request("GET", "/ds/ghost", Some(&apikey), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn new_key_rotation() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let response = router
            .call(request(
                "POST",
                "/ds/test",
                Some("master-token"),
                Some(json!({"op": "new-key"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fresh = body_json(response).await["apikey"].as_str().unwrap().to_string();
        assert_ne!(fresh, apikey);

        // Both keys admit uploads: new_key appends, it does not revoke.
        for key in [&apikey, &fresh] {
            let response = router
                .call(request(
                    "PUT",
                    "/ds/test",
                    Some(key),
                    Some(json!({"name": "products", "ds": fixture()})),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .call(request(
                "POST",
                "/ds/test",
                Some("master-token"),
                Some(json!({"op": "frobnicate"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dataset_removal_deletes_files() {
        let (_state, mut router, temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let data_path = temp.path().join("test").join("products.json");
        assert!(data_path.exists());

        let response = router
            .call(request(
                "DELETE",
                "/ds/test",
                Some(&apikey),
                Some(json!({"name": "products"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!data_path.exists());

        let response = router
            .call(request("GET", "/ds/test/products", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_dataset_names_are_rejected() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some(&apikey),
                Some(json!({"name": "_hidden", "ds": []})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn sandbox_secret_and_eviction() {
        let (state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let yaml = "sandbox: true\nsandbox_expire: 0\n";
        let response = router
            .call(text_request("POST", "/ds/test/_config", Some(&apikey), yaml))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some("master-token"),
                Some(json!({"name": "eph", "ds": [{"x": 1}], "secret": "s3cret"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(request("GET", "/ds/test", Some("master-token"), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["sandbox"], true);
        assert_eq!(body["datasets"]["eph"]["secret"], true);
        assert_eq!(body["datasets"]["eph"]["local"], false);

        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some("master-token"),
                Some(json!({"name": "eph", "ds": [{"x": 2}], "secret": "wrong"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some("master-token"),
                Some(json!({"name": "eph", "ds": [{"x": 2}], "secret": "s3cret"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.registry.sweep_sandboxes();

        let response = router
            .call(request("GET", "/ds/test/eph", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // The file-backed dataset survives the sweep.
        let response = router
            .call(request("GET", "/ds/test/products", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trusted_ips_gate_mutations() {
        let (_state, mut router, _temp) = setup_test_app().await;
        let apikey = create_project_with_data(&mut router).await;

        let yaml = "trusted_ips:\n  - 10.0.0.0/8\n";
        let response = router
            .call(text_request("POST", "/ds/test/_config", Some(&apikey), yaml))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The master token stays valid but the peer is 127.0.0.1, outside
        // the trusted block.
        let response = router
            .call(request(
                "PUT",
                "/ds/test",
                Some("master-token"),
                Some(json!({"name": "products", "ds": []})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn round3_truncates_to_milliseconds() {
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(1.9996), 2.0);
    }
}

//! Storefront Sync Server
//!
//! Hosts one application-wide sync client over the persistent collection
//! store and exposes it to the storefront UI:
//! - JSON endpoints for reads, derived views, status and mutations
//! - WebSocket push of change notifications
//! - Session-token gating of admin mutations

use axum::{
    async_trait,
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{header::AUTHORIZATION, request::Parts, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use storefront_sync::{
    auth::{require_admin, AuthError, Principal, SessionVerifier},
    collections::{
        self,
        blog::{self, AdminFilter, BlogPost, BlogSort, NewComment, NewVideo, PostStatus},
        catalog::{self, Product},
        fields_from_body,
    },
    config::AppConfig,
    remote::{Direction, Patch, RemoteCollection, RemoteError},
    storage::{CollectionMetadata, SledCollections},
    sync::{LoadStatus, MutationError, SyncClient, SyncError},
    upload::{MediaKind, UploadError, UploadService},
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Sync client over the persistent store
    sync: Arc<SyncClient>,
    /// Persistent backend, kept for metadata and flushing
    storage: SledCollections,
    /// Session token verification
    verifier: SessionVerifier,
    /// Media uploads, if configured
    uploads: Option<UploadService>,
    /// Server start time
    started_at: Instant,
}

impl AppState {
    pub fn new(config: &AppConfig, storage: SledCollections) -> anyhow::Result<Self> {
        let remote: Arc<dyn RemoteCollection> = Arc::new(storage.clone());
        let sync = Arc::new(SyncClient::with_config(remote, config.sync.clone()));
        collections::register_all(&sync);

        let verifier = SessionVerifier::new(&config.session)?;

        let uploads = match &config.upload {
            Some(upload) => {
                info!("Upload service configured");
                Some(UploadService::new(upload.clone())?)
            }
            None => {
                warn!("Upload service not configured - media uploads will be disabled");
                None
            }
        };

        Ok(Self {
            sync,
            storage,
            verifier,
            uploads,
            started_at: Instant::now(),
        })
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Error reply of every endpoint
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

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn remote_status(err: &RemoteError) -> StatusCode {
    match err {
        RemoteError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        RemoteError::NotFound { .. } => StatusCode::NOT_FOUND,
        RemoteError::InvalidQuery(_) | RemoteError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        RemoteError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RemoteError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<MutationError> for ApiError {
    fn from(err: MutationError) -> Self {
        let status = match &err {
            MutationError::Rejected(remote) => remote_status(remote),
            MutationError::Invalid(_) => StatusCode::BAD_REQUEST,
            MutationError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::UnknownCollection(_) | SyncError::NothingToRetry(_) => StatusCode::NOT_FOUND,
            SyncError::Subscription(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Query(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match &err {
            AuthError::MissingToken | AuthError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Empty | UploadError::UnknownKind(_) => StatusCode::BAD_REQUEST,
            UploadError::MissingConfig(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Http(_) | UploadError::Rejected { .. } | UploadError::MissingUrl => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// SESSION EXTRACTORS
// ============================================================================

/// Any signed-in caller
struct Session(Principal);

/// A signed-in caller with the admin role
struct AdminSession(#[allow(dead_code)] Principal);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;
        Ok(Session(state.verifier.verify(token.trim())?))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Session(principal) = Session::from_request_parts(parts, state).await?;
        require_admin(&principal)?;
        Ok(AdminSession(principal))
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    subscriptions: Vec<String>,
    collections: Vec<CollectionStatusResponse>,
}

#[derive(Debug, Serialize)]
struct CollectionStatusResponse {
    key: String,
    status: LoadStatus,
    last_error: Option<String>,
    version: u64,
    count: usize,
    subscribed: bool,
    stored: Option<CollectionMetadata>,
}

/// Store contents plus read state, so the UI can show spinners and retry
#[derive(Debug, Serialize)]
struct ListResponse<T> {
    items: Vec<T>,
    total: usize,
    status: LoadStatus,
    last_error: Option<String>,
    version: u64,
}

#[derive(Debug, Serialize)]
struct MutationResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

impl MutationResponse {
    fn ok() -> Json<Self> {
        Json(Self { ok: true, id: None })
    }

    fn created(id: String) -> Json<Self> {
        Json(Self {
            ok: true,
            id: Some(id),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProductParams {
    promo: Option<bool>,
    category: Option<String>,
    sort: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlogParams {
    status: Option<PostStatus>,
    q: Option<String>,
    sort: Option<BlogSort>,
}

#[derive(Debug, Deserialize)]
struct VideoParams {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    file_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadReply {
    url: String,
    folder: &'static str,
}

fn listing<T>(state: &AppState, key: &str, items: Vec<T>) -> ListResponse<T> {
    let status = state.sync.collection_status(key);
    ListResponse {
        total: items.len(),
        items,
        status: status.status,
        last_error: status.last_error,
        version: state.sync.version(key),
    }
}

fn collection_status(state: &AppState, key: &str) -> CollectionStatusResponse {
    let status = state.sync.collection_status(key);
    let stored = match state.storage.get_metadata(key) {
        Ok(meta) => meta,
        Err(e) => {
            error!("Failed to read metadata of {}: {}", key, e);
            None
        }
    };

    CollectionStatusResponse {
        key: key.to_string(),
        status: status.status,
        last_error: status.last_error,
        version: state.sync.version(key),
        count: state.sync.get_all(key).len(),
        subscribed: state.sync.is_subscribed(key),
        stored,
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let collections = state
        .sync
        .collections()
        .iter()
        .map(|key| collection_status(&state, key))
        .collect();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        subscriptions: state.sync.registry().active_keys(),
        collections,
    })
}

// ---- Catalog ----

async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProductParams>,
) -> ApiResult<ListResponse<Product>> {
    let mut products = catalog::all(&state.sync);

    if params.promo.unwrap_or(false) {
        products = catalog::in_promotion(&products);
    }
    if let Some(category) = params.category.as_deref().filter(|c| !c.is_empty()) {
        products = catalog::by_category(&products, category);
    }
    match params.sort.as_deref() {
        None | Some("") => {}
        Some("price_asc") => products = catalog::sorted_by_price(&products, Direction::Ascending),
        Some("price_desc") => products = catalog::sorted_by_price(&products, Direction::Descending),
        Some(other) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("unknown sort: {}", other),
            ))
        }
    }

    Ok(Json(listing(&state, catalog::PRODUCTS, products)))
}

async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Product> {
    state
        .sync
        .get_by_id(catalog::PRODUCTS, &id)
        .and_then(|entity| entity.decode().ok())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("product"))
}

async fn list_categories(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(catalog::categories(&catalog::all(&state.sync)))
}

/// Promotions are read once from the backend, not from the live store
async fn list_promotions(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Product>> {
    Ok(Json(catalog::fetch_promotions(&state.sync).await?))
}

async fn create_product(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<MutationResponse> {
    let fields = fields_from_body(body)?;
    let id = state.sync.create(catalog::PRODUCTS, fields).await?;
    Ok(MutationResponse::created(id))
}

async fn update_product(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<MutationResponse> {
    let patch = Patch::from_fields(fields_from_body(body)?);
    state.sync.update(catalog::PRODUCTS, &id, patch).await?;
    Ok(MutationResponse::ok())
}

async fn delete_product(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
) -> ApiResult<MutationResponse> {
    state.sync.remove(catalog::PRODUCTS, &id).await?;
    Ok(MutationResponse::ok())
}

// ---- Blog ----

async fn list_blogs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BlogParams>,
) -> ApiResult<ListResponse<BlogPost>> {
    let filter = AdminFilter {
        search: params.q.unwrap_or_default(),
        status: params.status,
        sort: params.sort.unwrap_or_default(),
    };
    let posts = blog::filter(&blog::all(&state.sync), &filter);
    Ok(Json(listing(&state, blog::BLOGS, posts)))
}

async fn blog_counts(State(state): State<Arc<AppState>>) -> Json<blog::StatusCounts> {
    Json(blog::status_counts(&blog::all(&state.sync)))
}

async fn get_blog(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<BlogPost> {
    state
        .sync
        .get_by_id(blog::BLOGS, &id)
        .and_then(|entity| entity.decode().ok())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("blog"))
}

async fn create_blog(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<MutationResponse> {
    let fields = fields_from_body(body)?;
    let id = state.sync.create(blog::BLOGS, fields).await?;
    Ok(MutationResponse::created(id))
}

async fn update_blog(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<MutationResponse> {
    let mut patch = Patch::from_fields(fields_from_body(body)?);
    // Sub-records have their own endpoints
    patch.remove("comments");
    patch.remove("videos");
    state.sync.update(blog::BLOGS, &id, patch).await?;
    Ok(MutationResponse::ok())
}

async fn delete_blog(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
) -> ApiResult<MutationResponse> {
    state.sync.remove(blog::BLOGS, &id).await?;
    Ok(MutationResponse::ok())
}

async fn add_comment(
    State(state): State<Arc<AppState>>,
    Session(principal): Session,
    Path(id): Path<String>,
    Json(mut comment): Json<NewComment>,
) -> ApiResult<MutationResponse> {
    if comment.author.trim().is_empty() {
        comment.author = principal.name.clone().unwrap_or_else(|| principal.id.clone());
    }
    blog::add_comment(&state.sync, &id, comment).await?;
    Ok(MutationResponse::ok())
}

async fn list_videos(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Vec<blog::Video>> {
    Json(blog::videos_of(&state.sync, &id))
}

async fn add_video(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
    Json(video): Json<NewVideo>,
) -> ApiResult<MutationResponse> {
    blog::add_video(&state.sync, &id, video).await?;
    Ok(MutationResponse::ok())
}

async fn remove_video(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(id): Path<String>,
    Query(params): Query<VideoParams>,
) -> ApiResult<MutationResponse> {
    blog::remove_video(&state.sync, &id, &params.url).await?;
    Ok(MutationResponse::ok())
}

// ---- Collection status ----

async fn get_collection_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<CollectionStatusResponse> {
    state.sync.spec(&key)?;
    Ok(Json(collection_status(&state, &key)))
}

/// Re-subscribe after a failure
async fn retry_collection(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<CollectionStatusResponse> {
    info!("Retrying subscription to {}", key);
    state.sync.retry(&key)?;
    Ok(Json(collection_status(&state, &key)))
}

async fn clear_collection_error(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<CollectionStatusResponse> {
    state.sync.spec(&key)?;
    state.sync.clear_error(&key);
    Ok(Json(collection_status(&state, &key)))
}

// ---- Uploads ----

async fn upload_media(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(kind): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<UploadReply> {
    let kind: MediaKind = kind.parse()?;
    let uploads = state
        .uploads
        .as_ref()
        .ok_or_else(|| UploadError::MissingConfig("UPLOAD_URL".to_string()))?;
    let file_name = params
        .file_name
        .unwrap_or_else(|| format!("upload-{}", uuid::Uuid::new_v4().simple()));

    let url = uploads.upload(body.to_vec(), &file_name, kind).await?;
    Ok(Json(UploadReply {
        url,
        folder: kind.folder(),
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Forward every sync event to the socket as JSON text
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events = BroadcastStream::new(state.sync.events());
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode sync event: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!("WebSocket client lagged, {} events skipped", skipped);
                }
                None => break,
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Ping(payload))) => {
                    if ws_sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!("Ignoring client message"),
            },
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_sync=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Initialize storage
    info!("Initializing storage at: {}", config.storage.path);
    let storage = SledCollections::open(config.storage.clone())?;
    info!("Storage initialized successfully");

    // Create application state and start the live subscriptions
    let state = Arc::new(AppState::new(&config, storage)?);
    for (key, err) in collections::subscribe_all(&state.sync) {
        warn!("Subscription to {} failed at startup: {}", key, err);
    }

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Catalog
        .route("/api/products", get(list_products).post(create_product))
        .route("/api/products/categories", get(list_categories))
        .route(
            "/api/products/:id",
            get(get_product).patch(update_product).delete(delete_product),
        )
        .route("/api/promotions", get(list_promotions))
        // Blog
        .route("/api/blogs", get(list_blogs).post(create_blog))
        .route("/api/blogs/counts", get(blog_counts))
        .route(
            "/api/blogs/:id",
            get(get_blog).patch(update_blog).delete(delete_blog),
        )
        .route("/api/blogs/:id/comments", post(add_comment))
        .route(
            "/api/blogs/:id/videos",
            get(list_videos).post(add_video).delete(remove_video),
        )
        // Collection status
        .route("/api/collections/:key/status", get(get_collection_status))
        .route("/api/collections/:key/retry", post(retry_collection))
        .route("/api/collections/:key/clear-error", post(clear_collection_error))
        // Uploads
        .route("/api/uploads/:kind", post(upload_media))
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        // Add state and middleware
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Storefront sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.sync.shutdown();
    state.storage.flush()?;
    info!("Server stopped");
    Ok(())
}

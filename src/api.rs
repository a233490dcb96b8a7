//! REST API server for PinWallet
//!
//! Thin HTTP plumbing over the [`TransferEngine`]: request shape checks,
//! caller identification for the rate guard, and mapping of core errors to
//! status codes. Engine calls are CPU heavy (PIN hashing) and synchronous,
//! so every one of them runs on the blocking pool.

use axum::{
    async_trait,
    extract::{
        connect_info::MockConnectInfo, rejection::JsonRejection, ConnectInfo, FromRequest,
        FromRequestParts, Path, Query, Request, State,
    },
    http::{self, header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::ServerConfig;
use crate::engine::{BatchOutcome, TransferEngine, TransferOutcome, TransferTarget};
use crate::error::WalletError;
use crate::ledger::{TransferRecord, Wallet, WalletId, WalletStatus};
use crate::money::{format_minor, Amount};
use crate::rate_guard::Bucket;

const MAX_PAGE_SIZE: u64 = 100;
const MAX_HISTORY: u64 = 500;

/// Shared state behind every route.
#[derive(Clone)]
pub struct WalletService {
    pub engine: Arc<TransferEngine>,
    trusted_proxies: Arc<[IpAddr]>,
    api_stats: Arc<RwLock<ApiStats>>,
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rate_limited_requests: u64,
    deposits: u64,
    transfers: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, status: StatusCode) {
        self.total_requests += 1;
        if status.is_success() {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.rate_limited_requests += 1;
        }
    }
}

impl WalletService {
    pub fn new(engine: Arc<TransferEngine>) -> Self {
        Self {
            engine,
            trusted_proxies: Arc::from(Vec::new()),
            api_stats: Arc::new(RwLock::new(ApiStats::new())),
        }
    }

    /// Believe `X-Forwarded-For` only on connections from these peers.
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = Arc::from(proxies);
        self
    }

    fn caller_key(&self, headers: &HeaderMap, extensions: &http::Extensions) -> String {
        caller_key(headers, extensions, &self.trusted_proxies)
    }

    pub async fn get_stats(&self) -> ApiStatsResponse {
        let stats = self.api_stats.read().await;
        let uptime = stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0);

        ApiStatsResponse {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            rate_limited_requests: stats.rate_limited_requests,
            deposits: stats.deposits,
            transfers: stats.transfers,
            uptime_seconds: uptime,
            tracked_rate_windows: self.engine.guard().tracked_windows(),
        }
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Wallet(WalletError),
    InvalidInput(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, message) = match self {
            ApiError::Wallet(err) => {
                let status = match &err {
                    WalletError::InvalidPinFormat
                    | WalletError::InvalidAmount(_)
                    | WalletError::SelfTransferNotAllowed => StatusCode::BAD_REQUEST,
                    WalletError::IncorrectPin => StatusCode::UNAUTHORIZED,
                    WalletError::WalletNotFound(_) => StatusCode::NOT_FOUND,
                    WalletError::InsufficientFunds { .. }
                    | WalletError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
                    WalletError::WalletInactive { .. } => StatusCode::FORBIDDEN,
                    WalletError::RateLimitExceeded { retry_after: wait, .. } => {
                        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                        retry_after = Some(secs.max(1));
                        StatusCode::TOO_MANY_REQUESTS
                    }
                    WalletError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let mut response = (status, Json(ErrorResponse { error: message })).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        ApiError::Wallet(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// `Json` whose rejections come back as `400 {"error": ...}`.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::InvalidInput(rejection.body_text())),
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletView {
    pub id: WalletId,
    pub owner_id: i64,
    pub balance: String,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Wallet> for WalletView {
    fn from(wallet: &Wallet) -> Self {
        WalletView {
            id: wallet.id,
            owner_id: wallet.owner_id,
            balance: format_minor(wallet.balance),
            status: wallet.status,
            created_at: wallet.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferView {
    pub id: i64,
    pub from_wallet_id: Option<WalletId>,
    pub to_wallet_id: WalletId,
    pub amount: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&TransferRecord> for TransferView {
    fn from(record: &TransferRecord) -> Self {
        TransferView {
            id: record.id,
            from_wallet_id: record.from_wallet,
            to_wallet_id: record.to_wallet,
            amount: format_minor(record.amount),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Serialize)]
pub struct TransferResponse {
    pub from: WalletView,
    pub to: WalletView,
    pub transfer: TransferView,
}

impl From<TransferOutcome> for TransferResponse {
    fn from(outcome: TransferOutcome) -> Self {
        TransferResponse {
            from: WalletView::from(&outcome.from),
            to: WalletView::from(&outcome.to),
            transfer: TransferView::from(&outcome.record),
        }
    }
}

#[derive(Serialize)]
pub struct BatchTransferResponse {
    pub from: WalletView,
    pub total: Amount,
    pub credited: Vec<TransferView>,
}

impl From<BatchOutcome> for BatchTransferResponse {
    fn from(outcome: BatchOutcome) -> Self {
        BatchTransferResponse {
            from: WalletView::from(&outcome.from),
            total: outcome.total,
            credited: outcome
                .credited
                .iter()
                .map(|c| TransferView::from(&c.record))
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct ApiStatsResponse {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub deposits: u64,
    pub transfers: u64,
    pub uptime_seconds: u64,
    pub tracked_rate_windows: usize,
}

#[derive(Deserialize)]
pub struct CreateWalletRequest {
    pub owner_id: i64,
    pub pin: String,
}

#[derive(Deserialize)]
pub struct DepositRequest {
    pub amount: Amount,
    pub pin: String,
}

#[derive(Deserialize)]
pub struct VerifyPinRequest {
    pub pin: String,
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub from_wallet_id: WalletId,
    pub to_wallet_id: WalletId,
    pub amount: Amount,
    pub pin: String,
}

#[derive(Deserialize)]
pub struct BatchTransferRequest {
    pub from_wallet_id: WalletId,
    pub transfers: Vec<TransferTarget>,
    pub pin: String,
}

#[derive(Deserialize)]
struct PaginationQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    MAX_PAGE_SIZE
}

fn default_history_limit() -> u64 {
    50
}

// ============================================================================
// Utility Functions
// ============================================================================

fn peer_ip(extensions: &http::Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| {
            extensions
                .get::<MockConnectInfo<SocketAddr>>()
                .map(|MockConnectInfo(addr)| addr.ip())
        })
}

/// Identify the caller for rate limiting.
///
/// The peer address is the caller unless the peer is a trusted proxy. Then
/// `X-Forwarded-For` is read right to left and the first hop that is not
/// itself a trusted proxy wins. Without a peer address every request shares
/// one key.
fn caller_key(headers: &HeaderMap, extensions: &http::Extensions, trusted: &[IpAddr]) -> String {
    let Some(peer) = peer_ip(extensions) else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse().ok())
        .collect();
    hops.into_iter()
        .rev()
        .find(|hop| !trusted.contains(hop))
        .unwrap_or(peer)
        .to_string()
}

/// Rate-limit identity of the current request.
pub struct CallerKey(pub String);

#[async_trait]
impl FromRequestParts<WalletService> for CallerKey {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &WalletService,
    ) -> Result<Self, Self::Rejection> {
        Ok(CallerKey(service.caller_key(&parts.headers, &parts.extensions)))
    }
}

/// Run a synchronous engine call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalError(format!("worker task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ============================================================================
// Middleware
// ============================================================================

/// Request statistics middleware
async fn stats_middleware(
    State(service): State<WalletService>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;

    let mut stats = service.api_stats.write().await;
    stats.record_request(response.status());

    response
}

/// Detailed request logging middleware. Logs method, path, status and
/// duration.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

/// General per-caller throttle applied to every route.
async fn rate_limit_middleware(
    State(service): State<WalletService>,
    req: Request,
    next: Next,
) -> Response {
    let caller = service.caller_key(req.headers(), req.extensions());
    match service.engine.guard().check(&caller, Bucket::General) {
        Ok(()) => next.run(req).await,
        Err(err) => ApiError::from(err).into_response(),
    }
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(service: WalletService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE]);

    let api_routes = Router::new()
        // Wallet endpoints
        .route("/wallets", post(create_wallet).get(list_wallets))
        .route("/wallets/:id", get(get_wallet).delete(delete_wallet))
        .route("/wallets/:id/deposit", post(deposit))
        .route("/wallets/:id/verify-pin", post(verify_pin))
        .route("/wallets/:id/transfers", get(get_wallet_transfers))
        // Transfer endpoints
        .route("/transfer", post(transfer))
        .route("/transfer/batch", post(batch_transfer))
        // System endpoints
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        .layer(middleware::from_fn_with_state(
            service.clone(),
            rate_limit_middleware,
        ))
        // throttled requests still pass through logging and stats
        .layer(middleware::from_fn(logging_middleware))
        .layer(middleware::from_fn_with_state(
            service.clone(),
            stats_middleware,
        ))
        .with_state(service);

    Router::new().nest("/api/v1", api_routes).layer(cors)
}

/// Serve the API until Ctrl-C.
pub async fn run_api_server(
    service: WalletService,
    config: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_api_router(service);

    // Get port from environment or use the configured one
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.port);

    let addr: SocketAddr = format!("{}:{}", config.bind, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "API server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    })
    .await?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn get_api_stats(State(service): State<WalletService>) -> impl IntoResponse {
    Json(service.get_stats().await)
}

async fn create_wallet(
    State(service): State<WalletService>,
    ApiJson(req): ApiJson<CreateWalletRequest>,
) -> Result<(StatusCode, Json<WalletView>), ApiError> {
    let engine = service.engine.clone();
    let wallet = blocking(move || engine.ledger().create(req.owner_id, &req.pin)).await?;
    Ok((StatusCode::CREATED, Json(WalletView::from(&wallet))))
}

async fn list_wallets(
    State(service): State<WalletService>,
    Query(params): Query<PaginationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.min(MAX_PAGE_SIZE);
    let offset = params.offset;
    let engine = service.engine.clone();
    let wallets = blocking(move || engine.ledger().list(offset, limit)).await?;

    let views: Vec<WalletView> = wallets.iter().map(WalletView::from).collect();
    Ok(Json(serde_json::json!({
        "wallets": views,
        "count": views.len(),
        "offset": offset,
        "limit": limit
    })))
}

async fn get_wallet(
    State(service): State<WalletService>,
    Path(id): Path<i64>,
) -> Result<Json<WalletView>, ApiError> {
    let engine = service.engine.clone();
    let wallet = blocking(move || engine.ledger().get(WalletId(id))).await?;
    Ok(Json(WalletView::from(&wallet)))
}

async fn delete_wallet(
    State(service): State<WalletService>,
    Path(id): Path<i64>,
) -> Result<Json<WalletView>, ApiError> {
    let engine = service.engine.clone();
    let wallet = blocking(move || engine.ledger().delete(WalletId(id))).await?;
    Ok(Json(WalletView::from(&wallet)))
}

async fn get_wallet_transfers(
    State(service): State<WalletService>,
    Path(id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.min(MAX_HISTORY);
    let engine = service.engine.clone();
    let records = blocking(move || engine.ledger().transfers_for(WalletId(id), limit)).await?;

    let views: Vec<TransferView> = records.iter().map(TransferView::from).collect();
    Ok(Json(serde_json::json!({
        "wallet_id": id,
        "count": views.len(),
        "transfers": views
    })))
}

async fn deposit(
    State(service): State<WalletService>,
    Path(id): Path<i64>,
    CallerKey(caller): CallerKey,
    ApiJson(req): ApiJson<DepositRequest>,
) -> Result<Json<WalletView>, ApiError> {
    let engine = service.engine.clone();
    let wallet =
        blocking(move || engine.deposit(&caller, WalletId(id), req.amount, &req.pin)).await?;

    service.api_stats.write().await.deposits += 1;
    Ok(Json(WalletView::from(&wallet)))
}

async fn verify_pin(
    State(service): State<WalletService>,
    Path(id): Path<i64>,
    CallerKey(caller): CallerKey,
    ApiJson(req): ApiJson<VerifyPinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = service.engine.clone();
    blocking(move || engine.verify_pin(&caller, WalletId(id), &req.pin)).await?;
    Ok(Json(serde_json::json!({ "valid": true })))
}

async fn transfer(
    State(service): State<WalletService>,
    CallerKey(caller): CallerKey,
    ApiJson(req): ApiJson<TransferRequest>,
) -> Result<Json<TransferResponse>, ApiError> {
    let engine = service.engine.clone();
    let outcome = blocking(move || {
        engine.transfer(
            &caller,
            req.from_wallet_id,
            req.to_wallet_id,
            req.amount,
            &req.pin,
        )
    })
    .await?;

    service.api_stats.write().await.transfers += 1;
    Ok(Json(TransferResponse::from(outcome)))
}

async fn batch_transfer(
    State(service): State<WalletService>,
    CallerKey(caller): CallerKey,
    ApiJson(req): ApiJson<BatchTransferRequest>,
) -> Result<Json<BatchTransferResponse>, ApiError> {
    let engine = service.engine.clone();
    let outcome = blocking(move || {
        engine.batch_transfer(&caller, req.from_wallet_id, &req.transfers, &req.pin)
    })
    .await?;

    service.api_stats.write().await.transfers += 1;
    Ok(Json(BatchTransferResponse::from(outcome)))
}

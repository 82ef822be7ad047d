//! REST API for a fibercoin node
//!
//! A thin JSON adapter over [`Visor`]. Transactions travel as hex of their
//! binary encoding in a `rawtx` field; everything else is plain JSON.

use axum::{
    extract::{Query, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hex::decode_to_slice;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::blockchain::{Block, Sha256Hash, UxOut};
use crate::coin::droplets_to_string;
use crate::crypto::Address;
use crate::error::{ChainError, ErrorClass};
use crate::mempool::UnconfirmedTxn;
use crate::node::NodeState;
use crate::transaction::{Transaction, VerifiedTx};
use crate::visor::Visor;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiContext {
    pub visor: Arc<Visor>,
    /// Lifecycle of the hosting node, when there is one.
    pub state: Option<Arc<RwLock<NodeState>>>,
    started: Instant,
}

impl ApiContext {
    pub fn new(visor: Arc<Visor>) -> Self {
        ApiContext {
            visor,
            state: None,
            started: Instant::now(),
        }
    }

    pub fn with_state(mut self, state: Arc<RwLock<NodeState>>) -> Self {
        self.state = Some(state);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, class) = match self {
            ApiError::Chain(e) => {
                let class = e.class();
                let status = match (&e, class) {
                    (ChainError::NotFound(_), _) => StatusCode::NOT_FOUND,
                    (ChainError::PoolFull, _) => StatusCode::SERVICE_UNAVAILABLE,
                    (_, ErrorClass::Structural) | (_, ErrorClass::Policy) => {
                        StatusCode::BAD_REQUEST
                    }
                    (_, ErrorClass::Consistency) => StatusCode::CONFLICT,
                    (_, ErrorClass::Integrity) => StatusCode::UNPROCESSABLE_ENTITY,
                    (_, ErrorClass::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string(), Some(class))
            }
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                class,
            }),
        )
            .into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize, Deserialize, Debug)]
pub struct HeadResponse {
    pub seq: u64,
    pub block_hash: String,
    pub time: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MetadataResponse {
    pub head: Option<HeadResponse>,
    pub unspents: usize,
    pub unconfirmed: usize,
    pub snapshot_root: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UxOutResponse {
    pub uxid: String,
    pub src_tx: String,
    pub output_index: u16,
    pub address: String,
    pub coins: String,
    pub droplets: u64,
    pub hours: u64,
    /// Hours including accrual up to the head block time.
    pub calculated_hours: u64,
    pub block_seq: u64,
    pub head_time: u64,
}

impl UxOutResponse {
    fn new(ux: &UxOut, head_time: u64) -> Self {
        UxOutResponse {
            uxid: hex::encode(ux.id()),
            src_tx: hex::encode(ux.src_transaction),
            output_index: ux.output_index,
            address: ux.address.to_string(),
            coins: droplets_to_string(ux.coins),
            droplets: ux.coins,
            hours: ux.hours,
            calculated_hours: ux.coin_hours(head_time).unwrap_or(ux.hours),
            block_seq: ux.block_seq,
            head_time: ux.head_time,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct OutputResponse {
    pub address: String,
    pub coins: String,
    pub hours: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransactionResponse {
    pub txid: String,
    pub inner_hash: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputResponse>,
    pub signatures: Vec<String>,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        TransactionResponse {
            txid: tx.hash_str(),
            inner_hash: hex::encode(tx.inner_hash()),
            inputs: tx.inputs.iter().map(hex::encode).collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| OutputResponse {
                    address: o.address.to_string(),
                    coins: droplets_to_string(o.coins),
                    hours: o.hours,
                })
                .collect(),
            signatures: tx.signatures.iter().map(|s| s.to_hex()).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BlockResponse {
    pub seq: u64,
    pub hash: String,
    pub prev_hash: String,
    pub body_hash: String,
    pub time: u64,
    pub fee: u64,
    pub signature: String,
    pub transactions: Vec<TransactionResponse>,
}

impl From<&Block> for BlockResponse {
    fn from(block: &Block) -> Self {
        BlockResponse {
            seq: block.header.seq,
            hash: hex::encode(block.hash()),
            prev_hash: hex::encode(block.header.prev_hash),
            body_hash: hex::encode(block.header.body_hash),
            time: block.header.time,
            fee: block.header.fee,
            signature: block.signature.to_hex(),
            transactions: block.transactions.iter().map(TransactionResponse::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PendingTxResponse {
    pub transaction: TransactionResponse,
    pub received: u64,
    pub announced: bool,
    pub fee: u64,
}

impl From<&UnconfirmedTxn> for PendingTxResponse {
    fn from(entry: &UnconfirmedTxn) -> Self {
        PendingTxResponse {
            transaction: TransactionResponse::from(&entry.transaction),
            received: entry.received_at,
            announced: entry.announced,
            fee: entry.fee,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RawTxRequest {
    pub rawtx: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct InjectResponse {
    pub txid: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct VerifyResponse {
    pub txid: String,
    pub fee: u64,
    pub inputs: Vec<UxOutResponse>,
    pub transaction: TransactionResponse,
}

impl VerifyResponse {
    fn new(verified: &VerifiedTx, head_time: u64) -> Self {
        VerifyResponse {
            txid: hex::encode(verified.txid),
            fee: verified.fee,
            inputs: verified
                .inputs
                .iter()
                .map(|ux| UxOutResponse::new(ux, head_time))
                .collect(),
            transaction: TransactionResponse::from(&verified.tx),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct BlockQuery {
    pub seq: u64,
}

#[derive(Deserialize, Debug)]
pub struct UxOutQuery {
    pub uxid: String,
}

#[derive(Deserialize, Debug)]
pub struct OutputsQuery {
    /// Comma-separated addresses.
    pub addrs: String,
}

fn parse_hash(hash_str: &str) -> Result<Sha256Hash, ApiError> {
    if hash_str.len() != 64 {
        return Err(ApiError::InvalidInput(
            "Hash must be a 64-character hex string".to_string(),
        ));
    }
    let mut hash_bytes = [0u8; 32];
    decode_to_slice(hash_str, &mut hash_bytes)
        .map_err(|e| ApiError::InvalidInput(format!("Invalid hex hash: {}", e)))?;
    Ok(hash_bytes)
}

fn parse_rawtx(raw: &str) -> Result<Transaction, ApiError> {
    Transaction::from_hex(raw).map_err(|e| ApiError::InvalidInput(e.to_string()))
}

fn head_time(visor: &Visor) -> u64 {
    visor
        .head()
        .map(|h| h.time)
        .unwrap_or(visor.ledger().genesis().timestamp)
}

// ============================================================================
// Middleware
// ============================================================================

/// Logs method, path, status and duration of every request.
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

// ============================================================================
// API Server
// ============================================================================

pub fn build_api_router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/blockchain/metadata", get(get_metadata))
        .route("/block", get(get_block))
        .route("/uxout", get(get_uxout))
        .route("/outputs", get(get_outputs))
        .route("/pendingTxs", get(get_pending_txs))
        .route("/injectTransaction", post(inject_transaction))
        .route("/transaction/verify", post(verify_transaction))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(ctx);

    Router::new().nest("/api/v1", api_routes).layer(cors)
}

pub async fn run_api_server(ctx: ApiContext, addr: &str) -> Result<(), ChainError> {
    let app = build_api_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let node_state = match &ctx.state {
        Some(s) => s.read().await.clone(),
        None => NodeState::Ready,
    };
    let status = if node_state == NodeState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "node_state": format!("{:?}", node_state),
            "head_seq": ctx.visor.head().map(|h| h.seq),
            "uptime_secs": ctx.started.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn get_metadata(State(ctx): State<ApiContext>) -> Json<MetadataResponse> {
    let visor = &ctx.visor;
    Json(MetadataResponse {
        head: visor.head().map(|h| HeadResponse {
            seq: h.seq,
            block_hash: hex::encode(h.hash),
            time: h.time,
        }),
        unspents: visor.ledger().unspent().len(),
        unconfirmed: visor.pool().len(),
        snapshot_root: hex::encode(visor.snapshot_root()),
    })
}

async fn get_block(
    State(ctx): State<ApiContext>,
    Query(q): Query<BlockQuery>,
) -> Result<Json<BlockResponse>, ApiError> {
    let block = ctx
        .visor
        .get_block(q.seq)?
        .ok_or_else(|| ApiError::NotFound(format!("block {} not found", q.seq)))?;
    Ok(Json(BlockResponse::from(&block)))
}

async fn get_uxout(
    State(ctx): State<ApiContext>,
    Query(q): Query<UxOutQuery>,
) -> Result<Json<UxOutResponse>, ApiError> {
    let id = parse_hash(&q.uxid)?;
    let ux = ctx
        .visor
        .get_output(&id)
        .ok_or_else(|| ApiError::NotFound(format!("uxout {} not found", q.uxid)))?;
    Ok(Json(UxOutResponse::new(&ux, head_time(&ctx.visor))))
}

async fn get_outputs(
    State(ctx): State<ApiContext>,
    Query(q): Query<OutputsQuery>,
) -> Result<Json<Vec<UxOutResponse>>, ApiError> {
    let time = head_time(&ctx.visor);
    let mut out = Vec::new();
    for raw in q.addrs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let address: Address = raw
            .parse()
            .map_err(|e: ChainError| ApiError::InvalidInput(e.to_string()))?;
        out.extend(
            ctx.visor
                .ledger()
                .unspent()
                .outputs_for_address(&address)
                .iter()
                .map(|ux| UxOutResponse::new(ux, time)),
        );
    }
    Ok(Json(out))
}

async fn get_pending_txs(State(ctx): State<ApiContext>) -> Json<Vec<PendingTxResponse>> {
    Json(
        ctx.visor
            .pool()
            .transactions()
            .iter()
            .map(PendingTxResponse::from)
            .collect(),
    )
}

async fn inject_transaction(
    State(ctx): State<ApiContext>,
    Json(req): Json<RawTxRequest>,
) -> Result<Json<InjectResponse>, ApiError> {
    let tx = parse_rawtx(&req.rawtx)?;
    let verified = ctx.visor.submit_to_pool(tx)?;
    tracing::info!(txid = %hex::encode(verified.txid), "transaction injected");
    Ok(Json(InjectResponse {
        txid: hex::encode(verified.txid),
    }))
}

async fn verify_transaction(
    State(ctx): State<ApiContext>,
    Json(req): Json<RawTxRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let tx = parse_rawtx(&req.rawtx)?;
    let verified = ctx.visor.verify(&tx)?;
    Ok(Json(VerifyResponse::new(&verified, head_time(&ctx.visor))))
}

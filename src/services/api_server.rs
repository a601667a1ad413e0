// src/services/api_server.rs
//! API Server for document anchoring
//!
//! REST interface over the [`IdentityChainManager`]. Writes are signed with
//! the server's owner key; reads accept any owner address.
//!
//! The API is built using Axum and includes endpoints for:
//! - Publishing a document version (first or update)
//! - Appending a chained version on top of the verified head
//! - Verifying the current version of `(owner, name)`
//! - Fetching raw content by CID

use crate::blockchain::LedgerRecordStore;
use crate::error::ChainError;
use crate::models::did::IdentityDocument;
use crate::models::records::VerificationReport;
use crate::services::identity_chain::IdentityChainManager;
use crate::storage::{Cid, ContentStore};
use crate::utils::retry::within;
use crate::wallet::key_management::{format_address, Keypair};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ethers::types::Address;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// API request and response structures

/// Request payload for publishing a document version
#[derive(Serialize, Deserialize)]
struct PublishRequest {
    name: String,
    document: IdentityDocument,
    #[serde(default)]
    first_version: bool,
}

/// Request payload for appending a chained version
#[derive(Serialize, Deserialize)]
struct AppendRequest {
    document: IdentityDocument,
}

/// Response for publish and append operations
#[derive(Serialize, Deserialize)]
struct PublishResponse {
    cid: Cid,
}

/// Error body with a status derived from the [`ChainError`] kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        let status = match &err {
            ChainError::RecordConflict { .. } | ChainError::HeadUnverified { .. } => StatusCode::CONFLICT,
            ChainError::NotFound { .. } => StatusCode::NOT_FOUND,
            ChainError::InvalidDocument(_)
            | ChainError::ControllerMismatch { .. }
            | ChainError::ImmutableFieldChanged { .. }
            | ChainError::RecordTooLarge { .. }
            | ChainError::Serialization(_) => StatusCode::BAD_REQUEST,
            ChainError::ContentUnavailable { transient: false, .. } => StatusCode::NOT_FOUND,
            ChainError::ContentUnavailable { .. }
            | ChainError::Timeout { .. }
            | ChainError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn parse_owner(owner: &str) -> Result<Address, ApiError> {
    owner
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid owner address {}", owner)))
}

/// API server state containing all service dependencies
pub struct ApiServer<C, L> {
    /// Orchestrator over the content store and the ledger
    manager: IdentityChainManager<C, L>,

    /// Key that signs every write made through this server
    owner: Keypair,

    /// Bound for the raw content fetch endpoint
    step_timeout: Duration,
}

impl<C, L> ApiServer<C, L>
where
    C: ContentStore + 'static,
    L: LedgerRecordStore + 'static,
{
    /// Creates a new instance of the API server
    ///
    /// # Arguments
    /// * `manager` - Chain manager shared with other services
    /// * `owner` - Signing key for publish requests
    /// * `step_timeout` - Bound for direct content store reads
    pub fn new(manager: IdentityChainManager<C, L>, owner: Keypair, step_timeout: Duration) -> Self {
        ApiServer {
            manager,
            owner,
            step_timeout,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/documents", post(Self::publish_handler))
            .route("/documents/:owner/:name/versions", post(Self::append_handler))
            .route("/documents/:owner/:name", get(Self::verify_handler))
            .route("/content/:cid", get(Self::content_handler))
            .with_state(Arc::new(self))
    }

    /// Starts the API server and serves until the listener fails
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g., "127.0.0.1:3000")
    pub async fn run(self, addr: SocketAddr) -> std::io::Result<()> {
        let owner = format_address(self.owner.address());
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server for {} listening on http://{}", owner, addr);
        axum::serve(listener, app).await
    }

    /// Publishes a document version
    ///
    /// # Endpoint
    /// POST /documents
    ///
    /// # Responses
    /// - 200 OK: Returns the CID
    /// - 400 Bad Request: Invalid document or controller mismatch
    /// - 409 Conflict: Wrong first/update semantics for the name
    /// - 503 Service Unavailable: Store or ledger unreachable
    async fn publish_handler(
        State(state): State<Arc<Self>>,
        Json(payload): Json<PublishRequest>,
    ) -> Result<Json<PublishResponse>, ApiError> {
        let cid = state
            .manager
            .publish_document(&state.owner, &payload.name, &payload.document, payload.first_version)
            .await?;
        Ok(Json(PublishResponse { cid }))
    }

    /// Appends a version linked to the verified head
    ///
    /// # Endpoint
    /// POST /documents/:owner/:name/versions
    ///
    /// # Responses
    /// - 200 OK: Returns the new CID
    /// - 400 Bad Request: `id` or `controller` changed, or `owner` is not
    ///   this server's key
    /// - 404 Not Found: Nothing published under the name yet
    /// - 409 Conflict: Current head does not verify
    async fn append_handler(
        Path((owner, name)): Path<(String, String)>,
        State(state): State<Arc<Self>>,
        Json(payload): Json<AppendRequest>,
    ) -> Result<Json<PublishResponse>, ApiError> {
        if parse_owner(&owner)? != state.owner.address() {
            return Err(ApiError::bad_request(format!(
                "this server signs for {}, not {}",
                format_address(state.owner.address()),
                owner
            )));
        }
        let cid = state
            .manager
            .publish_next_version(&state.owner, &name, payload.document)
            .await?;
        Ok(Json(PublishResponse { cid }))
    }

    /// Verifies the current version of `(owner, name)`
    ///
    /// # Endpoint
    /// GET /documents/:owner/:name
    ///
    /// # Responses
    /// - 200 OK: Verification report, `valid` may be false
    /// - 400 Bad Request: Malformed owner address
    /// - 404 Not Found: No document under `(owner, name)`
    async fn verify_handler(
        Path((owner, name)): Path<(String, String)>,
        State(state): State<Arc<Self>>,
    ) -> Result<Json<VerificationReport>, ApiError> {
        let owner = parse_owner(&owner)?;
        let report = state.manager.verify_document(owner, &name, &state.owner).await?;
        Ok(Json(report))
    }

    /// Returns the raw bytes stored under a CID
    ///
    /// # Endpoint
    /// GET /content/:cid
    async fn content_handler(
        Path(cid): Path<String>,
        State(state): State<Arc<Self>>,
    ) -> Result<Response, ApiError> {
        let cid = Cid::new(cid);
        let bytes = within(
            state.step_timeout,
            "content.get",
            state.manager.content_store().get(&cid),
        )
        .await?;
        Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use loom_api::{
    AccessGuard, AuthContext, CreateNodeRequest, DeleteNodeRequest, ExistsManyRequest, LoomApi,
    NodeBody, NodeView, UpdateNodeBody, UpdateNodeRequest,
};
use loom_core::{HistoryEntry, LoomError};
use loom_store_sqlite::load_tree_document;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct ServiceState {
    api: LoomApi,
}

#[derive(Debug, Parser)]
#[command(name = "loom-service")]
#[command(about = "Shared authoritative store for a collaboratively edited loom tree")]
struct Args {
    #[arg(long, env = "LOOM_DB", default_value = "./loom_tree.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LOOM_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    /// Tree identifier this instance serves; one tree per process.
    #[arg(long, env = "LOOM_TREE_ID")]
    tree_id: String,
    /// Shared secret clients present in the Authorization header.
    #[arg(long, env = "LOOM_SECRET")]
    secret: String,
    /// Optional tree JSON document to seed an empty database from. When
    /// set, any existing database file is removed first.
    #[arg(long, env = "LOOM_SEED")]
    seed: Option<PathBuf>,
    #[arg(long, env = "LOOM_SEED_AUTHOR", default_value = "importer")]
    seed_author: String,
}

struct ApiError(LoomError);

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Credential failures keep the historical wire contract: HTTP 200
        // with a success:false body. Everything else is classified.
        let status = match &self.0 {
            LoomError::Unauthorized | LoomError::InvalidTree => {
                warn!(error = %self.0, "rejected request credentials");
                StatusCode::OK
            }
            LoomError::NotFound(_) | LoomError::RootMissing => StatusCode::NOT_FOUND,
            LoomError::Conflict(_) => StatusCode::CONFLICT,
            LoomError::Validation(_) => StatusCode::BAD_REQUEST,
            LoomError::MultipleRoots(_) | LoomError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody { success: false, error: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

fn malformed(err: impl std::fmt::Display) -> ApiError {
    ApiError(LoomError::Validation(err.to_string()))
}

#[derive(Debug, Clone, Serialize)]
struct Ack {
    success: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ExistsResponse {
    success: bool,
    exists: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ExistsManyResponse {
    success: bool,
    exists: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize)]
struct NodeListResponse {
    success: bool,
    nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, Serialize)]
struct NodeIdsResponse {
    success: bool,
    nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct NodeMapResponse {
    success: bool,
    nodes: BTreeMap<String, NodeBody>,
}

#[derive(Debug, Clone, Serialize)]
struct CountResponse {
    success: bool,
    count: u64,
}

#[derive(Debug, Clone, Serialize)]
struct NodeResponse {
    success: bool,
    node: NodeView,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryResponse {
    success: bool,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct DeleteParams {
    author: String,
}

fn auth_from(headers: &HeaderMap) -> AuthContext {
    AuthContext {
        credential: header_string(headers, "authorization"),
        tree_id: header_string(headers, "tree-id"),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
}

/// Some historical clients double-encode the space in the cursor, which
/// arrives here as a literal `%`. Timestamps never contain one.
fn normalize_cursor(raw: &str) -> String {
    raw.replace('%', " ")
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/nodes", post(create_nodes).get(get_all_nodes))
        .route(
            "/nodes/batch",
            post(create_nodes).put(update_nodes_batch).delete(delete_nodes_batch),
        )
        .route("/nodes/exists/:id", get(node_exists))
        .route("/nodes/exists", post(nodes_exist))
        .route("/nodes/get/:timestamp", get(nodes_since))
        .route("/nodes/ids", get(all_node_ids))
        .route("/nodes/count", get(node_count))
        .route("/nodes/root", get(get_root))
        .route("/nodes/:id", get(get_node).put(update_node).delete(delete_node))
        .route("/nodes/:id/children", get(get_children))
        .route("/nodes/:id/parents", get(get_parents))
        .route("/history", get(get_history))
        .route("/history/:timestamp", get(get_history_since))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    let guard = AccessGuard::new(&args.secret, args.tree_id.clone());
    let api = LoomApi::new(args.db.clone(), guard);

    if let Some(seed) = &args.seed {
        let loaded = seed_database(&api, &args.db, seed, &args.seed_author)?;
        info!(nodes = loaded, seed = %seed.display(), "seeded tree from document");
    }

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, tree_id = %args.tree_id, "loom service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Replace the database with the contents of a seed document. The
/// document is loaded and parsed before the existing database file is
/// touched, so a bad seed path cannot destroy live data.
fn seed_database(
    api: &LoomApi,
    db: &std::path::Path,
    seed: &std::path::Path,
    author: &str,
) -> Result<usize> {
    let document = load_tree_document(seed)?;
    if db.exists() {
        fs::remove_file(db)
            .with_context(|| format!("failed to remove existing database {}", db.display()))?;
    }
    Ok(api.seed_from_document(&document, author)?)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn create_nodes(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<Vec<CreateNodeRequest>>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(requests) = payload.map_err(malformed)?;
    state.api.create_nodes(&auth_from(&headers), requests)?;
    Ok(Json(Ack { success: true }))
}

async fn update_node(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UpdateNodeBody>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(body) = payload.map_err(malformed)?;
    state.api.update_node(&auth_from(&headers), &id, body)?;
    Ok(Json(Ack { success: true }))
}

async fn update_nodes_batch(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<Vec<UpdateNodeRequest>>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(requests) = payload.map_err(malformed)?;
    state.api.update_nodes(&auth_from(&headers), requests)?;
    Ok(Json(Ack { success: true }))
}

async fn delete_node(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    params: Result<Query<DeleteParams>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Json<Ack>, ApiError> {
    let Query(params) = params.map_err(malformed)?;
    state.api.delete_node(&auth_from(&headers), &id, &params.author)?;
    Ok(Json(Ack { success: true }))
}

async fn delete_nodes_batch(
    State(state): State<ServiceState>,
    params: Result<Query<DeleteParams>, QueryRejection>,
    headers: HeaderMap,
    payload: Result<Json<Vec<DeleteNodeRequest>>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Query(params) = params.map_err(malformed)?;
    let Json(requests) = payload.map_err(malformed)?;
    state.api.delete_nodes(&auth_from(&headers), requests, &params.author)?;
    Ok(Json(Ack { success: true }))
}

async fn node_exists(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ExistsResponse>, ApiError> {
    let exists = state.api.node_exists(&auth_from(&headers), &id)?;
    Ok(Json(ExistsResponse { success: true, exists }))
}

async fn nodes_exist(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ExistsManyRequest>, JsonRejection>,
) -> Result<Json<ExistsManyResponse>, ApiError> {
    let Json(request) = payload.map_err(malformed)?;
    let exists = state.api.nodes_exist(&auth_from(&headers), request)?;
    Ok(Json(ExistsManyResponse { success: true, exists }))
}

async fn nodes_since(
    State(state): State<ServiceState>,
    Path(timestamp): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NodeListResponse>, ApiError> {
    let nodes =
        state.api.nodes_since(&auth_from(&headers), &normalize_cursor(&timestamp))?;
    Ok(Json(NodeListResponse { success: true, nodes }))
}

async fn all_node_ids(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<NodeIdsResponse>, ApiError> {
    let nodes = state.api.all_node_ids(&auth_from(&headers))?;
    Ok(Json(NodeIdsResponse { success: true, nodes }))
}

async fn get_all_nodes(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<NodeMapResponse>, ApiError> {
    let nodes = state.api.all_nodes(&auth_from(&headers))?;
    Ok(Json(NodeMapResponse { success: true, nodes }))
}

async fn node_count(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<CountResponse>, ApiError> {
    let count = state.api.node_count(&auth_from(&headers))?;
    Ok(Json(CountResponse { success: true, count }))
}

async fn get_node(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NodeResponse>, ApiError> {
    let node = state.api.node(&auth_from(&headers), &id)?;
    Ok(Json(NodeResponse { success: true, node }))
}

async fn get_root(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<NodeResponse>, ApiError> {
    let node = state.api.root(&auth_from(&headers))?;
    Ok(Json(NodeResponse { success: true, node }))
}

async fn get_children(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NodeListResponse>, ApiError> {
    let nodes = state.api.children(&auth_from(&headers), &id)?;
    Ok(Json(NodeListResponse { success: true, nodes }))
}

async fn get_parents(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NodeListResponse>, ApiError> {
    let nodes = state.api.parents(&auth_from(&headers), &id)?;
    Ok(Json(NodeListResponse { success: true, nodes }))
}

async fn get_history(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history = state.api.history(&auth_from(&headers))?;
    Ok(Json(HistoryResponse { success: true, history }))
}

async fn get_history_since(
    State(state): State<ServiceState>,
    Path(timestamp): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history =
        state.api.history_since(&auth_from(&headers), &normalize_cursor(&timestamp))?;
    Ok(Json(HistoryResponse { success: true, history }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "hunter2";
    const TREE_ID: &str = "tree-1";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("loom-service-{}.sqlite3", loom_core::NodeId::mint()))
    }

    fn test_router() -> (Router, PathBuf) {
        let db_path = unique_temp_db_path();
        let api = LoomApi::new(db_path.clone(), AccessGuard::new(SECRET, TREE_ID));
        (app(ServiceState { api }), db_path)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        authorized_request(method, uri, body, SECRET, TREE_ID)
    }

    fn authorized_request(
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        secret: &str,
        tree_id: &str,
    ) -> Request<Body> {
        let builder = Request::builder()
            .uri(uri)
            .method(method)
            .header("authorization", secret)
            .header("tree-id", tree_id);
        let result = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        };
        result.unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn create_body(id: &str, parent: &str, text: &str, timestamp: &str) -> serde_json::Value {
        serde_json::json!([{
            "id": id,
            "parentId": parent,
            "text": text,
            "author": "a",
            "timestamp": timestamp,
        }])
    }

    #[tokio::test]
    async fn wrong_credentials_return_success_false_and_leave_store_unchanged() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            authorized_request(
                "POST",
                "/nodes",
                Some(create_body("root", "", "root", "2024-01-01 00:00:00")),
                "wrong-secret",
                TREE_ID,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Unauthorized");

        let response = send(
            &router,
            authorized_request(
                "POST",
                "/nodes",
                Some(create_body("root", "", "root", "2024-01-01 00:00:00")),
                SECRET,
                "other-tree",
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Invalid Tree-Id");

        let response = send(&router, request("GET", "/nodes/count", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["count"], 0);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn create_update_sync_delete_flow_round_trip() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            request("POST", "/nodes", Some(create_body("root", "", "root", "2024-01-01 00:00:00"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["success"], true);

        let response = send(
            &router,
            request(
                "POST",
                "/nodes/batch",
                Some(create_body("c1", "root", "c1", "2024-01-01 00:00:01")),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("GET", "/nodes/root", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["node"]["id"], "root");
        assert_eq!(value["node"]["children_ids"], serde_json::json!(["c1"]));

        let response = send(&router, request("GET", "/nodes/root/children", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["nodes"][0]["id"], "c1");

        let response = send(&router, request("GET", "/nodes/c1/parents", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["nodes"][0]["id"], "root");

        // Update advances c1 past the cursor; root stays behind it.
        let response = send(
            &router,
            request(
                "PUT",
                "/nodes/c1",
                Some(serde_json::json!({
                    "text": "c1v2",
                    "author": "b",
                    "timestamp": "2024-01-01 00:00:02",
                })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            send(&router, request("GET", "/nodes/get/2024-01-01%2000:00:01", None)).await;
        let value = response_json(response).await;
        let synced = value["nodes"]
            .as_array()
            .unwrap_or_else(|| panic!("nodes is not an array: {value}"));
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0]["id"], "c1");
        assert_eq!(synced[0]["text"], "c1v2");

        let response = send(&router, request("DELETE", "/nodes/c1?author=b", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("GET", "/nodes/exists/c1", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["exists"], false);

        let response = send(&router, request("GET", "/history", None)).await;
        let value = response_json(response).await;
        let history = value["history"]
            .as_array()
            .unwrap_or_else(|| panic!("history is not an array: {value}"));
        let c1_ops: Vec<&str> = history
            .iter()
            .filter(|entry| entry["node_id"] == "c1")
            .filter_map(|entry| entry["operation"].as_str())
            .collect();
        assert_eq!(c1_ops, vec!["create", "update", "delete"]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn missing_node_is_a_structured_404() {
        let (router, db_path) = test_router();

        let response = send(&router, request("GET", "/nodes/ghost", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(value["success"], false);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let (router, db_path) = test_router();

        let body = create_body("root", "", "root", "2024-01-01 00:00:00");
        let response = send(&router, request("POST", "/nodes", Some(body.clone()))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("POST", "/nodes", Some(body))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let value = response_json(response).await;
        assert_eq!(value["success"], false);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn exists_batch_reports_per_id_status() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            request("POST", "/nodes", Some(create_body("root", "", "root", "2024-01-01 00:00:00"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &router,
            request(
                "POST",
                "/nodes/exists",
                Some(serde_json::json!({"nodeIds": ["root", "ghost"]})),
            ),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["exists"]["root"], true);
        assert_eq!(value["exists"]["ghost"], false);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn malformed_body_is_a_structured_400() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            request("POST", "/nodes", Some(serde_json::json!([{"text": "no author"}]))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["success"], false);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn bad_seed_path_leaves_existing_database_intact() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            request("POST", "/nodes", Some(create_body("root", "", "root", "2024-01-01 00:00:00"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let api = LoomApi::new(db_path.clone(), AccessGuard::new(SECRET, TREE_ID));
        let missing_seed = std::env::temp_dir().join("loom-seed-that-does-not-exist.json");
        let result = seed_database(&api, &db_path, &missing_seed, "importer");
        assert!(result.is_err());

        assert!(db_path.exists());
        let response = send(&router, request("GET", "/nodes/count", None)).await;
        let value = response_json(response).await;
        assert_eq!(value["count"], 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn history_since_carries_delete_visibility() {
        let (router, db_path) = test_router();

        let response = send(
            &router,
            request("POST", "/nodes", Some(create_body("root", "", "root", "2024-01-01 00:00:00"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&router, request("DELETE", "/nodes/root?author=a", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        // The node feed no longer mentions the node; the log feed does.
        let response =
            send(&router, request("GET", "/history/2000-01-01%2000:00:00", None)).await;
        let value = response_json(response).await;
        let history = value["history"]
            .as_array()
            .unwrap_or_else(|| panic!("history is not an array: {value}"));
        assert!(history
            .iter()
            .any(|entry| entry["node_id"] == "root" && entry["operation"] == "delete"));

        let _ = std::fs::remove_file(&db_path);
    }
}

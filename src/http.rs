use crate::metrics::Metrics;
use crate::poller::{PollerClosed, PollerHandle};
use crate::profile::{self, ConnectionProfile, ImportError};
use crate::ssh_config::ResolveContext;
use crate::state::{HistoryPoint, NodeEntry, NodeSnapshot, NodeStatus, SharedFleet};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, routing::put, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: SharedFleet,
    pub poller: PollerHandle,
    pub ctx: Arc<ResolveContext>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiNode {
    pub profile: ConnectionProfile,
    pub status: NodeStatus,
    pub updated_at: Option<String>,
    pub last_poll_ms: Option<u64>,
    pub history_len: usize,
    pub snapshot: Option<NodeSnapshot>,
}

impl From<&NodeEntry> for ApiNode {
    fn from(value: &NodeEntry) -> Self {
        Self {
            profile: value.profile.clone(),
            status: value.status,
            updated_at: value
                .snapshot
                .as_ref()
                .map(|s| rfc3339(s.timestamp_unix)),
            last_poll_ms: value.last_poll_ms,
            history_len: value.history.len(),
            snapshot: value.snapshot.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiNodeDetail {
    #[serde(flatten)]
    pub node: ApiNode,
    pub history_capacity: usize,
    pub history: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiFleet {
    pub started_at: String,
    pub last_cycle_at: Option<String>,
    pub interval_secs: u64,
    pub history_capacity: usize,
    pub nodes: Vec<ApiNode>,
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("node {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("interval_secs must be >= 1")]
    InvalidInterval,
    #[error(transparent)]
    Unavailable(#[from] PollerClosed),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Import(_) | ApiError::InvalidInterval => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: SharedFleet,
    poller: PollerHandle,
    ctx: Arc<ResolveContext>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/nodes", get(nodes_handler))
        .route("/api/nodes/:id", get(node_handler).delete(remove_handler))
        .route("/api/import", post(import_handler))
        .route("/api/interval", put(interval_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            poller,
            ctx,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    {
        let guard = state.state.read().await;
        state.metrics.update_from_fleet(&guard);
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn nodes_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiFleet {
        started_at: rfc3339(guard.started_at_unix),
        last_cycle_at: (guard.last_cycle_unix > 0).then(|| rfc3339(guard.last_cycle_unix)),
        interval_secs: guard.interval_secs,
        history_capacity: guard.history_capacity,
        nodes: guard.nodes().into_iter().map(ApiNode::from).collect(),
    })
}

async fn node_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiNodeDetail>, ApiError> {
    let guard = state.state.read().await;
    let entry = guard.get(id).ok_or(ApiError::NotFound(id))?;
    Ok(Json(ApiNodeDetail {
        node: ApiNode::from(entry),
        history_capacity: entry.history.capacity(),
        history: entry.history.iter().cloned().collect(),
    }))
}

async fn remove_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.state.read().await.get(id).is_none() {
        return Err(ApiError::NotFound(id));
    }
    state.poller.remove(id)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "removed": id }))))
}

async fn import_handler(
    State(state): State<HttpAppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let imported = profile::import_profiles(&body, &state.ctx)?;
    for diagnostic in &imported.diagnostics {
        warn!(%diagnostic, "import skipped a config line");
    }
    let diagnostics: Vec<String> = imported.diagnostics.iter().map(ToString::to_string).collect();

    let mut accepted = Vec::with_capacity(imported.profiles.len());
    let mut rejected = Vec::new();
    for profile in imported.profiles {
        match profile.validate() {
            Ok(()) => accepted.push(profile),
            Err(err) => {
                warn!(error = %err, "imported profile rejected");
                rejected.push(err.to_string());
            }
        }
    }

    let count = accepted.len();
    if !accepted.is_empty() {
        state.poller.upsert(accepted)?;
    }
    info!(count, rejected = rejected.len(), "profiles imported");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "imported": count,
            "rejected": rejected,
            "diagnostics": diagnostics,
        })),
    ))
}

async fn interval_handler(
    State(state): State<HttpAppState>,
    Json(request): Json<IntervalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.interval_secs < 1 {
        return Err(ApiError::InvalidInterval);
    }
    state
        .poller
        .set_interval(Duration::from_secs(request.interval_secs))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "interval_secs": request.interval_secs })),
    ))
}

fn rfc3339(unix: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerCommand;
    use crate::state::{FleetState, NodeOutcome};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::path::PathBuf;
    use tokio::sync::{mpsc, RwLock};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: SharedFleet,
        commands: mpsc::UnboundedReceiver<PollerCommand>,
    }

    fn test_app() -> TestApp {
        let metrics = Metrics::new().expect("metrics init");
        let state = Arc::new(RwLock::new(FleetState::new(1_700_000_000, 3, 60)));
        let (tx, commands) = mpsc::unbounded_channel();
        let ctx = Arc::new(ResolveContext {
            local_user: "operator".to_string(),
            home_dir: Some(PathBuf::from("/home/operator")),
        });
        TestApp {
            router: build_router(metrics, state.clone(), PollerHandle::new(tx), ctx),
            state,
            commands,
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn register_node(state: &SharedFleet) -> Uuid {
        let mut profile = ConnectionProfile::new("gpu-01", "10.0.0.1", "ml");
        profile.password = Some("hunter2".to_string());
        let mut guard = state.write().await;
        let registration = guard.upsert_profile(profile);
        let snapshot = NodeSnapshot::empty(registration.id, 0);
        guard.apply_outcome(
            registration.id,
            registration.generation,
            1_700_000_003,
            120,
            NodeOutcome::Decoded(snapshot),
        );
        registration.id
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = test_app();
        let (status, body) = send(app.router, get_request("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_fleet_series() {
        let app = test_app();
        let id = register_node(&app.state).await;

        let (status, body) = send(app.router, get_request("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("fleet_uptime_seconds"));
        assert!(body.contains("fleet_scrape_count_total 1"));
        assert!(body.contains(&format!("fleet_node_up{{id=\"{id}\",node=\"gpu-01\"}} 1")));
    }

    #[tokio::test]
    async fn nodes_listing_hides_password() {
        let app = test_app();
        let id = register_node(&app.state).await;

        let (status, body) = send(app.router, get_request("/api/nodes")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&id.to_string()));
        assert!(body.contains("\"status\":\"connected\""));
        assert!(body.contains("\"history_len\":1"));
        assert!(body.contains("\"updated_at\":\"2023-11-14T22:13:23Z\""));
        assert!(!body.contains("hunter2"));
        assert!(!body.contains("password"));
    }

    #[tokio::test]
    async fn node_detail_and_not_found() {
        let app = test_app();
        let id = register_node(&app.state).await;

        let (status, body) = send(app.router.clone(), get_request(&format!("/api/nodes/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["history"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["profile"]["name"], "gpu-01");

        let (status, _) = send(
            app.router,
            get_request(&format!("/api/nodes/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_queues_removal() {
        let mut app = test_app();
        let id = register_node(&app.state).await;

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/nodes/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.router.clone(), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(matches!(
            app.commands.try_recv(),
            Ok(PollerCommand::Remove(removed)) if removed == id
        ));

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/nodes/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(app.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn import_accepts_ssh_config_text() {
        let mut app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/import")
            .body(Body::from("Host gpu-a gpu-b\n  User ml\nHost *\n  Port 22\n"))
            .unwrap();

        let (status, body) = send(app.router.clone(), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.contains("\"imported\":2"));
        match app.commands.try_recv() {
            Ok(PollerCommand::Upsert(profiles)) => {
                let hosts: Vec<&str> = profiles.iter().map(|p| p.host.as_str()).collect();
                assert_eq!(hosts, ["gpu-a", "gpu-b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let request = Request::builder()
            .method("POST")
            .uri("/api/import")
            .body(Body::from("# nothing here\n"))
            .unwrap();
        let (status, body) = send(app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("no profiles"));
    }

    #[tokio::test]
    async fn import_reports_invalid_profiles_separately() {
        let mut app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/import")
            .body(Body::from(
                r#"[{"name":"ok","host":"10.0.0.5","username":"ml"},
                    {"name":"nouser","host":"10.0.0.6","username":""}]"#,
            ))
            .unwrap();

        let (status, body) = send(app.router, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let json: serde_json::Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(json["imported"], 1);
        assert_eq!(
            json["rejected"],
            serde_json::json!(["profile 'nouser' has an empty username"])
        );
        match app.commands.try_recv() {
            Ok(PollerCommand::Upsert(profiles)) => {
                let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
                assert_eq!(names, ["ok"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interval_update_is_validated() {
        let mut app = test_app();
        let put = |body: &'static str| {
            Request::builder()
                .method("PUT")
                .uri("/api/interval")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let (status, _) = send(app.router.clone(), put(r#"{"interval_secs": 0}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.commands.try_recv().is_err());

        let (status, _) = send(app.router, put(r#"{"interval_secs": 10}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(matches!(
            app.commands.try_recv(),
            Ok(PollerCommand::SetInterval(d)) if d == Duration::from_secs(10)
        ));
    }
}

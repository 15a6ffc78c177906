//! API handlers.
//!
//! Each handler resolves the team from the request, calls the lifecycle
//! manager and returns a JSON response. Rejections caused by the
//! instance's state map to 403, every other failure to 500.

use axum::Json;
use axum::extract::{FromRequestParts, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use chaldeploy_lifecycle::{InstancePhase, InstanceSnapshot, LifecycleError};

use crate::{ApiState, TEAM_HEADER};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn lifecycle_error(team: &str, err: &LifecycleError) -> Response {
    if err.is_invalid_state() {
        error_response(&err.to_string(), StatusCode::FORBIDDEN)
    } else {
        warn!(%team, error = %err, "request failed");
        error_response(&err.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Authenticated team id from the [`TEAM_HEADER`] header.
pub struct Team(pub String);

impl<S> FromRequestParts<S> for Team
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TEAM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Team(v.to_string()))
            .ok_or_else(|| error_response("team session is missing or invalid", StatusCode::FORBIDDEN))
    }
}

/// Instance status as shown to a team.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl StatusView {
    fn from_snapshot(snapshot: Option<InstanceSnapshot>) -> Self {
        match snapshot {
            Some(s) if s.phase != InstancePhase::Destroyed => Self {
                state: s.phase.as_str(),
                host: s.connection_string(),
                expires_at: Some(s.expiration_display()),
            },
            _ => Self {
                state: "inactive",
                host: None,
                expires_at: None,
            },
        }
    }
}

#[derive(Serialize)]
struct CreatedView {
    host: String,
}

#[derive(Serialize)]
struct ExtendedView {
    expires_at: String,
}

/// GET /healthcheck
pub async fn healthcheck() -> &'static str {
    "app good to go"
}

/// GET /api/status
pub async fn status(State(state): State<ApiState>, Team(team): Team) -> Response {
    let snapshot = state.manager.get_instance(&team).await;
    ApiResponse::ok(StatusView::from_snapshot(snapshot)).into_response()
}

/// POST /api/create
pub async fn create(State(state): State<ApiState>, Team(team): Team) -> Response {
    match state.manager.create_instance(&team).await {
        Ok(host) => ApiResponse::ok(CreatedView { host }).into_response(),
        Err(e) => lifecycle_error(&team, &e),
    }
}

/// POST /api/extend
pub async fn extend(State(state): State<ApiState>, Team(team): Team) -> Response {
    match state.manager.extend_instance(&team).await {
        Ok(expires_at) => ApiResponse::ok(ExtendedView { expires_at }).into_response(),
        Err(e) => lifecycle_error(&team, &e),
    }
}

/// POST /api/destroy
pub async fn destroy(State(state): State<ApiState>, Team(team): Team) -> Response {
    match state.manager.destroy_instance(&team).await {
        Ok(()) => ApiResponse::ok("destroyed").into_response(),
        Err(e) => lifecycle_error(&team, &e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::TimeDelta;
    use serde_json::Value;
    use tower::ServiceExt;

    use chaldeploy_core::ChallengeIdentity;
    use chaldeploy_lifecycle::InstanceManager;
    use chaldeploy_orchestrator::memory::Operation;
    use chaldeploy_orchestrator::{
        Endpoint, InstanceTemplate, MemoryBackend, OrchestrationDriver, Poller,
    };

    use super::*;
    use crate::build_router;

    fn router(backend: Arc<MemoryBackend>) -> Router {
        let template =
            InstanceTemplate::new(ChallengeIdentity::new("test chal"), "ctf/test-nc:latest", 31337);
        let driver = OrchestrationDriver::new(backend, template, Poller::new(Duration::from_secs(1), 3));
        build_router(Arc::new(InstanceManager::new(driver, TimeDelta::minutes(5))))
    }

    fn request(method: &str, uri: &str, team: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(team) = team {
            builder = builder.header(TEAM_HEADER, team);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthcheck_needs_no_team() {
        let resp = router(Arc::new(MemoryBackend::new()))
            .oneshot(request("GET", "/healthcheck", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"app good to go");
    }

    #[tokio::test]
    async fn missing_team_is_forbidden() {
        let app = router(Arc::new(MemoryBackend::new()));
        for (method, uri) in [("GET", "/api/status"), ("POST", "/api/create")] {
            let resp = app.clone().oneshot(request(method, uri, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        }
        let resp = app.oneshot(request("GET", "/api/status", Some("  "))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn status_of_new_team_is_inactive() {
        let resp = router(Arc::new(MemoryBackend::new()))
            .oneshot(request("GET", "/api/status", Some("team-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["data"]["state"], "inactive");
        assert!(body["data"].get("host").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn create_status_destroy_flow() {
        let backend = Arc::new(MemoryBackend::new());
        let app = router(backend.clone());

        let resp = app.clone().oneshot(request("POST", "/api/create", Some("team-1"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let host = json(resp).await["data"]["host"].as_str().unwrap().to_string();
        assert!(host.ends_with(":31337"));

        let resp = app.clone().oneshot(request("GET", "/api/status", Some("team-1"))).await.unwrap();
        let body = json(resp).await;
        assert_eq!(body["data"]["state"], "running");
        assert_eq!(body["data"]["host"], host.as_str());
        assert!(body["data"]["expires_at"].as_str().unwrap().ends_with(" UTC"));

        let resp = app.clone().oneshot(request("POST", "/api/extend", Some("team-1"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(json(resp).await["data"]["expires_at"].is_string());

        let resp = app.clone().oneshot(request("POST", "/api/destroy", Some("team-1"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(request("GET", "/api/status", Some("team-1"))).await.unwrap();
        assert_eq!(json(resp).await["data"]["state"], "inactive");
    }

    #[tokio::test]
    async fn invalid_state_is_forbidden() {
        let app = router(Arc::new(MemoryBackend::new()));
        for uri in ["/api/extend", "/api/destroy"] {
            let resp = app.clone().oneshot(request("POST", uri, Some("nobody"))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            let body = json(resp).await;
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_is_server_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail(Operation::CreateResourceGroup);
        let resp = router(backend)
            .oneshot(request("POST", "/api/create", Some("team-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json(resp).await["error"].as_str().unwrap().contains("resource group"));
    }

    #[test]
    fn destroying_status_hides_host() {
        let view = StatusView::from_snapshot(Some(InstanceSnapshot {
            tenant_key: "t".into(),
            group_name: "g".into(),
            phase: InstancePhase::Destroying,
            expires_at: None,
            endpoint: Some(Endpoint::new("203.0.113.7", 31337)),
        }));
        assert_eq!(view.state, "destroying");
        assert_eq!(view.host, None);
        assert_eq!(view.expires_at.as_deref(), Some("<unknown>"));
    }

    #[tokio::test]
    async fn malformed_team_is_forbidden() {
        let backend = Arc::new(MemoryBackend::new());
        let resp = router(backend.clone())
            .oneshot(request("POST", "/api/create", Some("---")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(json(resp).await["error"].as_str().unwrap().contains("alphanumeric"));
        assert_eq!(backend.calls(Operation::CreateResourceGroup), 0);
    }
}

//! chaldeploy-api — HTTP API for team instances.
//!
//! A thin axum layer over [`InstanceManager`]. The team id is taken from
//! the [`TEAM_HEADER`] request header, which the fronting authentication
//! layer sets; requests without it are rejected with 403.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthcheck` | Liveness probe |
//! | GET | `/api/status` | State, address and expiration of the team's instance |
//! | POST | `/api/create` | Deploy the team's instance |
//! | POST | `/api/extend` | Push the expiration back by one runtime |
//! | POST | `/api/destroy` | Tear the team's instance down |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tracing::info;

use chaldeploy_lifecycle::InstanceManager;

/// Header carrying the authenticated team id.
pub const TEAM_HEADER: &str = "x-chaldeploy-team";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<InstanceManager>,
}

/// Build the complete API router.
pub fn build_router(manager: Arc<InstanceManager>) -> Router {
    let api_state = ApiState { manager };

    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/create", post(handlers::create))
        .route("/extend", post(handlers::extend))
        .route("/destroy", post(handlers::destroy))
        .with_state(api_state);

    // Health probes are routed after the layer so they are not logged.
    Router::new()
        .nest("/api", api_routes)
        .layer(middleware::from_fn(log_request))
        .route("/healthcheck", get(handlers::healthcheck))
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = next.run(req).await;
    info!(%method, %path, status = resp.status().as_u16(), "request");
    resp
}

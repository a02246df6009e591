mod routes;

use axum::{
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use http::StatusCode;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    compute::{ComputeApi, InstanceController},
    config::{AuthConfig, Config},
    sources::ShutdownHandler,
    Error, Result,
};

pub use routes::START_MESSAGE;

pub struct AppState {
    pub auth: AuthConfig,
    pub identifier: String,
    pub controller: InstanceController,
    pub shutdown: ShutdownHandler,
}

pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: &Config, compute: Arc<dyn ComputeApi>) -> Self {
        let controller = InstanceController::new(compute, config.instance.match_policy);
        let identifier = config.instance.identifier.clone();

        let state = AppState {
            auth: config.auth.clone(),
            shutdown: ShutdownHandler::new(controller.clone(), identifier.clone()),
            identifier,
            controller,
        };

        Self {
            state: Arc::new(state),
        }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/start", any(routes::start_code_server))
            .route("/pubsub/shutdown", post(routes::pubsub_shutdown))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state)
    }

    pub async fn start(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }
}

// Failures inside a handler surface as a bare 500; details stay in the log.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

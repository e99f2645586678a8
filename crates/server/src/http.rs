// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{
    Router, extract::DefaultBodyLimit, http::StatusCode, response::IntoResponse, routing::get,
};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;
use splice_base::ReadableSize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{BindSnafu, ParseAddressSnafu, Result, ServiceHandler};

/// A type-erased route handler, for mixing handlers of different types in
/// one [`start_rest_server`] call.
pub type RouteHandler = Box<dyn Fn(Router) -> Router + Send + Sync>;

/// Default maximum size of a buffered request body (100 MB)
pub const DEFAULT_MAX_HTTP_BODY_SIZE: ReadableSize = ReadableSize::mb(100);

/// Configuration options for a REST server
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct RestServerConfig {
    /// The address to bind the REST server
    #[default = "127.0.0.1:3000"]
    pub bind_address:  String,
    /// Maximum size of JSON request bodies. Chunk uploads are streamed and
    /// not subject to it.
    #[default(_code = "DEFAULT_MAX_HTTP_BODY_SIZE")]
    pub max_body_size: ReadableSize,
    /// Whether to enable CORS
    #[default = true]
    pub enable_cors:   bool,
}

/// Bind the configured address and serve `route_handlers` in a background
/// task.
///
/// Each handler receives the router built so far and returns it with its
/// routes added.
///
/// # Errors
/// Returns an error if the bind address cannot be parsed or bound.
pub async fn start_rest_server<F>(
    config: RestServerConfig,
    route_handlers: Vec<F>,
) -> Result<ServiceHandler>
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    let bind_addr = config
        .bind_address
        .parse::<std::net::SocketAddr>()
        .context(ParseAddressSnafu {
            addr: config.bind_address.clone(),
        })?;

    let mut router = Router::new().route("/health", get(health_check));
    for handler in &route_handlers {
        router = handler(router);
    }
    info!(handlers = route_handlers.len(), "Registered REST route handlers");

    router = router
        .layer(DefaultBodyLimit::max(config.max_body_size.as_usize()))
        .layer(TraceLayer::new_for_http());
    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context(BindSnafu {
            addr: config.bind_address.clone(),
        })?;
    let local_addr = listener.local_addr().context(BindSnafu {
        addr: config.bind_address.clone(),
    })?;

    let cancellation_token = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let shutdown = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                info!("REST server (on {}) started", local_addr);
                let _ = started_tx.send(());
                shutdown.cancelled().await;
                info!("REST server (on {}) received shutdown signal", local_addr);
            })
            .await;

        info!(
            "REST server (on {}) task completed: {:?}",
            local_addr, result
        );
    });

    Ok(ServiceHandler {
        join_handle,
        cancellation_token,
        started_rx: Some(started_rx),
        local_addr,
    })
}

async fn health_check() -> impl IntoResponse { (StatusCode::OK, "OK") }

async fn api_health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Timestamp::now().to_string(),
        "service": "splice",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Detailed health endpoints for monitoring.
pub fn health_routes(router: Router) -> Router {
    router
        .route("/api/v1/health", get(api_health_handler))
        .route("/api/health", get(api_health_handler))
}

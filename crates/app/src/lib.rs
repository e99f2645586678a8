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

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};
use splice_common_telemetry::{self as telemetry, LoggingOptions};
use splice_server::{
    http::{RestServerConfig, RouteHandler, health_routes, start_rest_server},
    routes::staging_routes,
};
use splice_staging::{Stager, StagingConfig};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Represents the main application with lifecycle management
#[derive(SmartDefault)]
pub struct App {
    /// Application configuration
    pub config:             AppConfig,
    /// Controls if the application should continue running
    #[default(_code = "Arc::new(AtomicBool::new(false))")]
    pub running:            Arc<AtomicBool>,
    /// Cancelled once the application stopped serving
    #[default(_code = "CancellationToken::new()")]
    pub cancellation_token: CancellationToken,
}

/// Configuration for the application
#[derive(Debug, Clone, SmartDefault, Builder)]
pub struct AppConfig {
    /// Staging engine configuration
    pub staging:                  StagingConfig,
    /// REST server configuration
    pub http_config:              RestServerConfig,
    /// Logging configuration
    pub logging:                  LoggingOptions,
    /// Whether Ctrl-C and SIGTERM trigger a graceful shutdown
    #[default = true]
    pub enable_graceful_shutdown: bool,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config: self,
            ..Default::default()
        }
    }
}

/// Handle for controlling a running application
pub struct AppHandle {
    shutdown_tx:        Option<oneshot::Sender<()>>,
    running:            Arc<AtomicBool>,
    cancellation_token: CancellationToken,
    local_addr:         SocketAddr,
    stager:             Arc<Stager>,
}

impl AppHandle {
    /// Gracefully shutdown the application
    pub fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the application is still running
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    /// Wait until the server stopped and in-flight requests drained
    pub async fn wait_for_shutdown(&self) { self.cancellation_token.cancelled().await; }

    /// Address the REST server listens on
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr { self.local_addr }

    #[must_use]
    pub fn stager(&self) -> Arc<Stager> { Arc::clone(&self.stager) }
}

impl App {
    /// Open the staging root and start serving. Returns once the REST server
    /// accepts connections.
    pub async fn start(&self) -> Result<AppHandle, Whatever> {
        info!(root = %self.config.staging.root_dir.display(), "Starting splice");

        let stager = Arc::new(
            Stager::open(self.config.staging.clone())
                .await
                .whatever_context("Failed to open staging root")?,
        );

        let handlers: Vec<RouteHandler> = vec![
            Box::new(health_routes),
            Box::new(staging_routes(Arc::clone(&stager))),
        ];
        let mut http_handle = start_rest_server(self.config.http_config.clone(), handlers)
            .await
            .whatever_context("Failed to start REST server")?;
        http_handle
            .wait_for_start()
            .await
            .whatever_context("REST server failed to start")?;
        let local_addr = http_handle.local_addr();

        self.running.store(true, Ordering::SeqCst);
        info!(%local_addr, "Application started successfully");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::clone(&self.running);
        let cancellation_token = self.cancellation_token.clone();
        let enable_graceful_shutdown = self.config.enable_graceful_shutdown;

        tokio::spawn(async move {
            if enable_graceful_shutdown {
                shutdown_signal(shutdown_rx).await;
            } else {
                let _ = shutdown_rx.await;
            }

            running.store(false, Ordering::SeqCst);
            info!("Shutting down REST server");
            http_handle.shutdown();
            if let Err(e) = http_handle.wait_for_stop().await {
                warn!(error = %e, "REST server did not stop cleanly");
            }
            cancellation_token.cancel();
            info!("Application shutdown complete");
        });

        Ok(AppHandle {
            shutdown_tx: Some(shutdown_tx),
            running: Arc::clone(&self.running),
            cancellation_token: self.cancellation_token.clone(),
            local_addr,
            stager,
        })
    }

    /// Install logging and the panic hook, then run until shut down.
    pub async fn run(self) -> Result<(), Whatever> {
        let _guards = telemetry::init_global_logging("splice", &self.config.logging);
        telemetry::set_panic_hook();

        let handle = self.start().await?;
        handle.wait_for_shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(shutdown_rx: oneshot::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        _ = shutdown_rx => { info!("Received shutdown signal"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        AppConfig {
            staging: StagingConfig {
                root_dir: dir.path().to_path_buf(),
                sync_writes: false,
                ..StagingConfig::default()
            },
            http_config: RestServerConfig {
                bind_address: "127.0.0.1:0".to_string(),
                ..RestServerConfig::default()
            },
            enable_graceful_shutdown: false,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_app_creation() {
        let app = AppConfig::default().open();
        assert!(!app.running.load(Ordering::SeqCst));
        assert!(app.config.enable_graceful_shutdown);
    }

    #[tokio::test]
    async fn test_app_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_config(&dir).open();

        let mut handle = app.start().await.unwrap();
        assert!(handle.is_running());
        assert_ne!(handle.local_addr().port(), 0);
        assert!(dir.path().join("staging").is_dir());

        handle.stager().put("f", 0, b"data").await.unwrap();

        handle.shutdown();
        handle.wait_for_shutdown().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_app_recovers_staged_sessions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut handle = test_config(&dir).open().start().await.unwrap();
            handle.stager().put("f", 0, b"data").await.unwrap();
            handle.shutdown();
            handle.wait_for_shutdown().await;
        }

        let mut handle = test_config(&dir).open().start().await.unwrap();
        let stager = handle.stager();
        stager.complete("f", 1).await.unwrap();
        let artifact = stager.merge("f").await.unwrap();
        assert_eq!(artifact.size, 4);
        handle.shutdown();
        handle.wait_for_shutdown().await;
    }
}

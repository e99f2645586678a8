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

pub mod error;
pub mod http;
pub mod routes;

use snafu::Snafu;
use tokio::{sync::oneshot::Receiver, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(transparent)]
    Network { source: NetworkError },

    #[snafu(display("Server task exited before it started"))]
    StartAborted,
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum NetworkError {
    #[snafu(display("Failed to bind {addr}"))]
    Bind {
        addr:   String,
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse address {addr}"))]
    ParseAddress {
        addr:   String,
        #[snafu(source)]
        source: std::net::AddrParseError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle for a running HTTP server.
///
/// Shutdown is signalled through a cancellation token; the server drains
/// in-flight requests before [`ServiceHandler::wait_for_stop`] returns.
pub struct ServiceHandler {
    join_handle:        JoinHandle<()>,
    cancellation_token: CancellationToken,
    started_rx:         Option<Receiver<()>>,
    local_addr:         std::net::SocketAddr,
}

impl ServiceHandler {
    /// Wait until the server accepts connections.
    ///
    /// Returns immediately when the start signal was already consumed.
    pub async fn wait_for_start(&mut self) -> Result<()> {
        if let Some(started_rx) = self.started_rx.take() {
            started_rx.await.map_err(|_| StartAbortedSnafu.build())?;
        }
        Ok(())
    }

    /// Wait for the server task to finish. Call [`ServiceHandler::shutdown`]
    /// first.
    pub async fn wait_for_stop(self) -> Result<()> {
        if let Err(e) = self.join_handle.await {
            warn!(error = %e, "REST server task failed");
        }
        Ok(())
    }

    /// Signal graceful shutdown without waiting for it.
    pub fn shutdown(&self) { self.cancellation_token.cancel(); }

    pub fn is_finished(&self) -> bool { self.join_handle.is_finished() }

    /// The address the server is bound to.
    pub const fn local_addr(&self) -> std::net::SocketAddr { self.local_addr }
}

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

//! Routes of the staging engine.

use std::{io, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use splice_staging::{Artifact, MergeStrategy, SessionSpec, Stager, UploadSession};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::debug;

use crate::error::ApiResult;

type AppState = Arc<Stager>;

#[derive(Debug, Deserialize)]
pub struct BeginRequest {
    pub name:            String,
    pub expected_chunks: Option<u64>,
    pub total_size:      Option<u64>,
    pub sha256:          Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name:  String,
    pub index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub name:  String,
    pub index: u64,
    pub size:  u64,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub name:        String,
    pub chunk_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeResponse {
    pub name:        String,
    pub size:        u64,
    pub chunk_count: u64,
    pub strategy:    MergeStrategy,
    pub sha256:      Option<String>,
    /// ISO 8601 duration of the merge
    pub duration:    String,
}

impl From<Artifact> for MergeResponse {
    fn from(artifact: Artifact) -> Self {
        Self {
            name:        artifact.name,
            size:        artifact.size,
            chunk_count: artifact.chunk_count,
            strategy:    artifact.strategy,
            sha256:      artifact.sha256,
            duration:    artifact.duration.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSizeResponse {
    pub size:      u64,
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub id:    String,
    pub start: u64,
    pub end:   u64,
}

/// Route handler registering the staging endpoints on `stager`.
pub fn staging_routes(stager: AppState) -> impl Fn(Router) -> Router + Send + Sync + 'static {
    move |router: Router| router.merge(staging_router(stager.clone()))
}

/// The staging endpoints as a standalone router.
pub fn staging_router(stager: AppState) -> Router {
    Router::new()
        .route("/sessions", post(begin))
        .route("/sessions/{name}", get(session).delete(abort))
        .route("/upload", post(upload).put(upload))
        .route("/complete", post(complete))
        .route("/buffer-merge", post(buffer_merge))
        .route("/merge", post(streamed_merge))
        .route("/file-size", get(file_size))
        .route("/file-chunk", get(file_chunk))
        .with_state(stager)
}

async fn begin(
    State(stager): State<AppState>,
    Json(request): Json<BeginRequest>,
) -> ApiResult<(StatusCode, Json<UploadSession>)> {
    let spec = SessionSpec {
        expected_chunks: request.expected_chunks,
        expected_size:   request.total_size,
        sha256:          request.sha256,
    };
    let session = stager.begin(&request.name, spec).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn session(
    State(stager): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<UploadSession>> {
    Ok(Json(stager.session(&name)?))
}

async fn abort(State(stager): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    stager.abort(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload(
    State(stager): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> ApiResult<Json<UploadResponse>> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream);
    let size = stager
        .put_reader(&query.name, query.index, &mut reader)
        .await?;
    debug!(name = %query.name, index = query.index, size, "Chunk uploaded");
    Ok(Json(UploadResponse {
        name: query.name,
        index: query.index,
        size,
    }))
}

async fn complete(
    State(stager): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<UploadSession>> {
    let session = stager.complete(&request.name, request.chunk_count).await?;
    Ok(Json(session))
}

async fn buffer_merge(
    State(stager): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> ApiResult<Json<MergeResponse>> {
    Ok(Json(stager.merge(&request.name).await?.into()))
}

/// Streamed merges run in their own task. A client that goes away cancels
/// the merge, which leaves the staging area intact.
async fn streamed_merge(
    State(stager): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> ApiResult<Json<MergeResponse>> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let artifact = tokio::spawn(async move {
        stager
            .merge_with(&request.name, MergeStrategy::Streamed, &cancel)
            .await
    })
    .await??;
    Ok(Json(artifact.into()))
}

async fn file_size(
    State(stager): State<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<FileSizeResponse>> {
    let stat = stager.stat(&query.id).await?;
    Ok(Json(FileSizeResponse {
        size:      stat.size,
        file_name: stat.display_name,
    }))
}

async fn file_chunk(
    State(stager): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Response> {
    let stream = stager
        .read_range(&query.id, query.start, query.end)
        .await?;
    let length = query.end - query.start + 1;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

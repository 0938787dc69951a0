use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::errors::{AppError, AppResult};
use crate::security::{FileSystemGuard, InputValidator};

use super::assembly::{ChunkAssembler, ChunkOutcome};
use super::external::MapApiClient;

#[derive(Clone)]
pub struct AppState {
    client: Arc<MapApiClient>,
    assembler: Arc<ChunkAssembler>,
}

impl AppState {
    pub fn new(client: MapApiClient, assembler: ChunkAssembler) -> Self {
        Self {
            client: Arc::new(client),
            assembler: Arc::new(assembler),
        }
    }

    pub fn from_config(cfg: &Config) -> AppResult<Self> {
        let upload_dir = config::get_upload_dir(cfg)?;
        Ok(Self::new(
            MapApiClient::from_config(cfg),
            ChunkAssembler::new(upload_dir)?,
        ))
    }
}

#[derive(Debug, Serialize)]
struct UrlResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// Everything one multipart request can carry, collected before dispatch.
#[derive(Default)]
struct UploadForm {
    file: Option<(String, Bytes)>,
    chunk: Option<Bytes>,
    file_name: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
}

enum UploadOutcome {
    Url(String),
    ChunkAck { received: u32, total: u32 },
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/upload", post(handle_upload))
        // Map files can be large; the relay imposes no body cap.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Bind the configured address and serve the relay until the process exits.
pub async fn serve(cfg: &Config) -> AppResult<()> {
    let state = AppState::from_config(cfg)?;
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;

    log::info!("Relay endpoint listening on {}", cfg.listen_addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let form = read_form(multipart).await?;

    let outcome = if let Some((file_name, data)) = form.file {
        relay_whole_file(&state, &file_name, data).await?
    } else if let Some(chunk) = form.chunk {
        let file_name = form
            .file_name
            .ok_or_else(|| AppError::missing_field("fileName"))?;
        let chunk_index = parse_count_field("chunkIndex", form.chunk_index)?;
        let total_chunks = parse_count_field("totalChunks", form.total_chunks)?;
        relay_chunk(&state, &file_name, chunk_index, total_chunks, chunk).await?
    } else {
        return Err(AppError::missing_field("file"));
    };

    let response = match outcome {
        UploadOutcome::Url(url) => Json(UrlResponse { url }).into_response(),
        UploadOutcome::ChunkAck { received, total } => Json(MessageResponse {
            message: format!("Chunk {} of {} uploaded successfully", received, total),
        })
        .into_response(),
    };

    Ok(response)
}

async fn read_form(mut multipart: Multipart) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::MultipartParse(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::MultipartParse(e.to_string()))?;
                form.file = Some((file_name, data));
            }
            "chunk" => {
                form.chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::MultipartParse(e.to_string()))?,
                );
            }
            "fileName" => form.file_name = Some(read_text_field(field).await?),
            "chunkIndex" => form.chunk_index = Some(read_text_field(field).await?),
            "totalChunks" => form.total_chunks = Some(read_text_field(field).await?),
            other => {
                log::debug!("Ignoring unexpected multipart field {:?}", other);
            }
        }
    }

    Ok(form)
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> AppResult<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::MultipartParse(e.to_string()))
}

fn parse_count_field(name: &str, value: Option<String>) -> AppResult<u32> {
    let raw = value.ok_or_else(|| AppError::missing_field(name))?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| AppError::validation(name, "Must be a non-negative integer"))
}

/// Whole-file mode: spool to a temp file, relay, and delete the spool file
/// on every exit path.
async fn relay_whole_file(
    state: &AppState,
    original_name: &str,
    data: Bytes,
) -> AppResult<UploadOutcome> {
    let file_name = InputValidator::sanitize_file_name(original_name);
    InputValidator::validate_file_name(&file_name)?;

    let spool_path = FileSystemGuard::spool_path(state.assembler.dir(), &file_name);
    tokio::fs::write(&spool_path, &data).await?;

    log::info!(
        "Relaying {} ({} bytes) to the external API",
        file_name,
        data.len()
    );

    let result = state.client.upload_map(&spool_path, &file_name).await;
    remove_spool_file(&spool_path).await;

    match result? {
        Some(url) => Ok(UploadOutcome::Url(url)),
        None => Err(AppError::upload_failed(
            "External API did not accept the map",
        )),
    }
}

/// Chunked mode: append to the accumulation file; on the final chunk, relay
/// the assembled file and clean up regardless of the result.
async fn relay_chunk(
    state: &AppState,
    raw_file_name: &str,
    chunk_index: u32,
    total_chunks: u32,
    chunk: Bytes,
) -> AppResult<UploadOutcome> {
    let file_name = InputValidator::sanitize_file_name(raw_file_name);
    InputValidator::validate_file_name(&file_name)?;

    let appended = state
        .assembler
        .append_chunk(&file_name, chunk_index, total_chunks, &chunk)
        .await;

    let outcome = match appended {
        Ok(outcome) => outcome,
        Err(e) => {
            state.assembler.discard(&file_name).await;
            return Err(e);
        }
    };

    match outcome {
        ChunkOutcome::Appended { received, total } => {
            Ok(UploadOutcome::ChunkAck { received, total })
        }
        ChunkOutcome::Completed(assembled) => {
            log::info!(
                "All {} chunks received for {}, relaying to the external API",
                total_chunks,
                file_name
            );

            let result = state.client.upload_map(&assembled, &file_name).await;
            state.assembler.discard(&file_name).await;

            match result? {
                Some(url) => Ok(UploadOutcome::Url(url)),
                None => Err(AppError::upload_failed(
                    "External API did not accept the map",
                )),
            }
        }
    }
}

async fn remove_spool_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log::warn!("Failed to remove spool file {}: {}", path.display(), e);
    }
}

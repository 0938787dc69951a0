use reqwest::{multipart, Client};
use serde::Deserialize;
use std::cmp::min;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::history::{KeyValueStore, UploadHistory};
use crate::security::{FileSystemGuard, InputValidator};

use super::progress::{self, ProgressState};

/// Fixed size of each chunk sent in chunked mode.
pub const CHUNK_SIZE_BYTES: u64 = 512 * 1024;

/// How a file travels to the relay endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One multipart request carrying the entire file.
    Whole,
    /// Sequential fixed-size chunk requests; each awaited before the next.
    Chunked,
}

#[derive(Debug, Deserialize)]
struct UrlBody {
    url: String,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

/// Client for the local relay endpoint.
pub struct RelayClient {
    client: Client,
    relay_url: String,
    chunk_size: u64,
}

impl RelayClient {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self::with_chunk_size(relay_url, CHUNK_SIZE_BYTES)
    }

    pub fn with_chunk_size(relay_url: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap(),
            relay_url: relay_url.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upload a local file through the relay and return its public URL.
    pub async fn upload(
        &self,
        path: &Path,
        strategy: UploadStrategy,
        progress_state: &ProgressState,
    ) -> AppResult<String> {
        InputValidator::validate_upload_source(path)?;

        let result = match strategy {
            UploadStrategy::Whole => self.upload_whole(path, progress_state).await,
            UploadStrategy::Chunked => self.upload_chunked(path, progress_state).await,
        };

        match &result {
            Ok(url) => {
                progress::mark_completed(progress_state);
                log::info!("Upload of {} succeeded: {}", path.display(), url);
            }
            Err(e) => {
                let is_retryable = e.is_retryable();
                progress::mark_failed(progress_state);
                log::error!(
                    "Upload of {} failed (retryable: {}): {}",
                    path.display(),
                    is_retryable,
                    e
                );
            }
        }

        result
    }

    async fn upload_whole(&self, path: &Path, progress_state: &ProgressState) -> AppResult<String> {
        let file_name = file_name_of(path);
        progress::start_upload(progress_state, &file_name, 1);

        let data = tokio::fs::read(path).await?;
        let part = multipart::Part::bytes(data)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new().part("file", part);

        let response = self.client.post(&self.relay_url).multipart(form).send().await?;
        let url = parse_url_response(response).await?;

        progress::mark_chunk_sent(progress_state);
        Ok(url)
    }

    async fn upload_chunked(
        &self,
        path: &Path,
        progress_state: &ProgressState,
    ) -> AppResult<String> {
        let file_name = file_name_of(path);
        let file_size = FileSystemGuard::get_file_size(path)?;

        // An empty file still travels as one (empty) chunk so the relay
        // produces a file and a single PUT.
        let total_chunks = (file_size.div_ceil(self.chunk_size)).max(1) as u32;
        progress::start_upload(progress_state, &file_name, total_chunks);

        log::info!(
            "Uploading {} in {} chunks of up to {} bytes",
            file_name,
            total_chunks,
            self.chunk_size
        );

        let mut file = tokio::fs::File::open(path).await?;
        let mut final_url = None;

        for chunk_index in 0..total_chunks {
            let offset = chunk_index as u64 * self.chunk_size;
            let take = min(self.chunk_size, file_size - offset) as usize;

            let mut buffer = vec![0u8; take];
            file.read_exact(&mut buffer).await?;

            let part = multipart::Part::bytes(buffer)
                .file_name(file_name.clone())
                .mime_str("application/octet-stream")?;
            let form = multipart::Form::new()
                .text("fileName", file_name.clone())
                .text("chunkIndex", chunk_index.to_string())
                .text("totalChunks", total_chunks.to_string())
                .part("chunk", part);

            // Any failure aborts the remaining chunks; there is no resume.
            let response = self.client.post(&self.relay_url).multipart(form).send().await?;

            if chunk_index + 1 == total_chunks {
                final_url = Some(parse_url_response(response).await?);
            } else {
                let ack = parse_ack_response(response).await?;
                log::debug!("Relay ack: {}", ack);
            }

            progress::mark_chunk_sent(progress_state);
        }

        final_url.ok_or_else(|| AppError::Internal("Chunk loop produced no URL".to_string()))
    }
}

/// Upload a file and, on success only, append it to the history list.
pub async fn upload_file<S: KeyValueStore>(
    client: &RelayClient,
    history: &UploadHistory<S>,
    path: &Path,
    strategy: UploadStrategy,
    progress_state: &ProgressState,
) -> AppResult<String> {
    let url = client.upload(path, strategy, progress_state).await?;
    history.record(&file_name_of(path), &url)?;
    Ok(url)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

async fn parse_url_response(response: reqwest::Response) -> AppResult<String> {
    let status = response.status();

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::upload_failed(&format!(
            "Relay returned {}: {}",
            status, body
        )));
    }

    let body: UrlBody = response.json().await?;
    Ok(body.url)
}

async fn parse_ack_response(response: reqwest::Response) -> AppResult<String> {
    let status = response.status();

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::upload_failed(&format!(
            "Relay returned {}: {}",
            status, body
        )));
    }

    let body: MessageBody = response.json().await?;
    Ok(body.message)
}

use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Progress state type
pub type ProgressState = Arc<Mutex<UploadProgress>>;

#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub file_name: Option<String>,
    pub total_chunks: u32,
    pub sent_chunks: u32,
    pub status: UploadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadStatus {
    Idle,
    Uploading,
    Completed,
    Failed,
}

pub fn new_progress() -> ProgressState {
    Arc::new(Mutex::new(UploadProgress {
        file_name: None,
        total_chunks: 0,
        sent_chunks: 0,
        status: UploadStatus::Idle,
    }))
}

/// Safe progress state update
fn safe_progress_update<F>(progress_state: &ProgressState, operation: &str, f: F)
where
    F: FnOnce(&mut UploadProgress),
{
    match progress_state.lock() {
        Ok(mut progress) => f(&mut progress),
        Err(e) => {
            log::warn!(
                "Failed to acquire progress lock for {} (non-critical): {}",
                operation,
                e
            );
        }
    }
}

pub fn start_upload(progress_state: &ProgressState, file_name: &str, total_chunks: u32) {
    safe_progress_update(progress_state, "start", |progress| {
        progress.file_name = Some(file_name.to_string());
        progress.total_chunks = total_chunks;
        progress.sent_chunks = 0;
        progress.status = UploadStatus::Uploading;
    });
}

pub fn mark_chunk_sent(progress_state: &ProgressState) {
    safe_progress_update(progress_state, "chunk sent", |progress| {
        progress.sent_chunks += 1;
        log::debug!(
            "Progress: {}/{} chunks sent",
            progress.sent_chunks,
            progress.total_chunks
        );
    });
}

pub fn mark_completed(progress_state: &ProgressState) {
    safe_progress_update(progress_state, "mark completed", |progress| {
        progress.status = UploadStatus::Completed;
    });
}

pub fn mark_failed(progress_state: &ProgressState) {
    safe_progress_update(progress_state, "mark failed", |progress| {
        progress.status = UploadStatus::Failed;
    });
}

/// Snapshot the current progress, tolerating a poisoned lock.
pub fn snapshot(progress_state: &ProgressState) -> Option<UploadProgress> {
    match progress_state.lock() {
        Ok(progress) => Some(progress.clone()),
        Err(e) => {
            log::warn!("Failed to read progress (non-critical): {}", e);
            None
        }
    }
}

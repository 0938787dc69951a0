// Client uploader - sends local map files to the relay endpoint and keeps
// the local history of completed uploads.

pub mod client;
pub mod progress;

pub use client::{upload_file, RelayClient, UploadStrategy, CHUNK_SIZE_BYTES};
pub use progress::{new_progress, ProgressState, UploadStatus};

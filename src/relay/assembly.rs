use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::errors::{AppError, AppResult};

/// What became of an appended chunk.
pub enum ChunkOutcome {
    /// More chunks expected; nothing to relay yet.
    Appended { received: u32, total: u32 },
    /// Final chunk appended and the accumulation file renamed into place.
    Completed(PathBuf),
}

/// Accumulates chunked uploads into `<dir>/<fileName>.part`, one file per
/// upload name, and renames to the final name on the last chunk.
///
/// Chunks are appended blindly in arrival order. Callers must send them in
/// strictly increasing index order; there is no reordering or gap-filling,
/// and concurrent uploads of the same file name will interleave appends.
pub struct ChunkAssembler {
    dir: PathBuf,
}

impl ChunkAssembler {
    pub fn new(dir: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn part_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{}.part", file_name))
    }

    fn final_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub async fn append_chunk(
        &self,
        file_name: &str,
        chunk_index: u32,
        total_chunks: u32,
        bytes: &[u8],
    ) -> AppResult<ChunkOutcome> {
        if total_chunks == 0 {
            return Err(AppError::validation("totalChunks", "Must be greater than 0"));
        }

        if chunk_index >= total_chunks {
            return Err(AppError::validation(
                "chunkIndex",
                "Must be less than totalChunks",
            ));
        }

        let part_path = self.part_path(file_name);

        // Chunk 0 truncates so a stale accumulation file from an aborted
        // upload cannot leak into this one.
        let mut file = if chunk_index == 0 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&part_path)
                .await?
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&part_path)
                .await?
        };

        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        log::debug!(
            "Appended chunk {} of {} for {} ({} bytes)",
            chunk_index + 1,
            total_chunks,
            file_name,
            bytes.len()
        );

        if chunk_index == total_chunks - 1 {
            let final_path = self.final_path(file_name);
            fs::rename(&part_path, &final_path).await?;
            Ok(ChunkOutcome::Completed(final_path))
        } else {
            Ok(ChunkOutcome::Appended {
                received: chunk_index + 1,
                total: total_chunks,
            })
        }
    }

    /// Best-effort removal of any artifacts for `file_name`, partial or
    /// assembled. Used on every relay exit path.
    pub async fn discard(&self, file_name: &str) {
        for path in [self.part_path(file_name), self.final_path(file_name)] {
            match fs::remove_file(&path).await {
                Ok(()) => log::debug!("Removed upload artifact {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to remove upload artifact {}: {}", path.display(), e)
                }
            }
        }
    }
}

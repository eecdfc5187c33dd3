use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;

use crate::downloads::manager::{file_size_on_disk, ControlFlags, ManagerInner};
use crate::downloads::state::{DownloadStatus, FileProgress};
use crate::error::AppError;

const PAUSE_POLL: Duration = Duration::from_millis(100);
const CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;

enum FileOutcome {
    Done,
    Cancelled,
}

/// Downloads one artifact's files sequentially, observing cancel/pause flags
/// between chunks and checkpointing state every few MiB.
pub(crate) struct Worker {
    inner: Arc<ManagerInner>,
    unique_id: String,
    flags: Arc<ControlFlags>,
}

impl Worker {
    pub fn new(inner: Arc<ManagerInner>, unique_id: String) -> Self {
        let flags = inner.control_flags(&unique_id);
        Self {
            inner,
            unique_id,
            flags,
        }
    }

    pub async fn run(self) {
        if let Err(e) = self.run_inner().await {
            tracing::error!("Download {} failed: {e}", self.unique_id);
            self.inner.update_state(&self.unique_id, |s| {
                s.status = DownloadStatus::Error;
                s.error_message = e.to_string();
            });
        }
    }

    async fn run_inner(&self) -> Result<(), AppError> {
        let Some(mut state) = self.inner.get_state(&self.unique_id) else {
            return Ok(());
        };

        let model_dir = self.inner.model_dir(&self.unique_id);
        tokio::fs::create_dir_all(&model_dir).await?;

        // First run of a multi-file artifact: probe sizes so the aggregate
        // total is known before any byte streams in.
        if state.file_progress.is_empty() {
            for file_name in &state.files {
                let url = self.inner.file_url(&state.model_id, file_name);
                let remote = self.inner.remote_file_size(&url).await;
                state.file_progress.insert(
                    file_name.clone(),
                    FileProgress {
                        url,
                        total_size: remote,
                        downloaded: 0,
                        complete: false,
                    },
                );
            }
            state.recompute_totals();
            let progress = state.file_progress.clone();
            let total = state.total_size;
            self.inner.update_state(&self.unique_id, |s| {
                s.file_progress = progress;
                s.total_size = total;
            });
        }

        for file_name in state.files.clone() {
            if self.flags.cancel.load(Ordering::SeqCst) {
                self.mark_cancelled();
                return Ok(());
            }

            let Some(info) = self
                .inner
                .get_state(&self.unique_id)
                .and_then(|s| s.file_progress.get(&file_name).cloned())
            else {
                continue;
            };
            if info.complete {
                continue;
            }

            let path = model_dir.join(&file_name);
            let on_disk = file_size_on_disk(&path);
            if info.total_size > 0 && on_disk >= info.total_size {
                self.inner.mutate_state(&self.unique_id, |s| {
                    if let Some(f) = s.file_progress.get_mut(&file_name) {
                        f.downloaded = f.total_size;
                        f.complete = true;
                    }
                    s.recompute_totals();
                });
                continue;
            }

            match self.download_file(&file_name, &info.url, &path).await? {
                FileOutcome::Done => {}
                FileOutcome::Cancelled => {
                    self.mark_cancelled();
                    return Ok(());
                }
            }
        }

        let complete = self
            .inner
            .get_state(&self.unique_id)
            .map(|s| s.all_files_complete() && s.total_size > 0)
            .unwrap_or(false);
        if complete {
            self.inner.update_state(&self.unique_id, |s| {
                s.status = DownloadStatus::Ready;
                s.downloaded = s.total_size;
            });
            tracing::info!(target: "aster.downloads", "Download {} ready", self.unique_id);
        }

        Ok(())
    }

    fn mark_cancelled(&self) {
        self.inner.update_state(&self.unique_id, |s| {
            s.status = DownloadStatus::Cancelled;
        });
    }

    /// One file with resume support. Transient network failures retry with a
    /// growing delay before the whole worker is failed.
    async fn download_file(
        &self,
        file_name: &str,
        url: &str,
        path: &Path,
    ) -> Result<FileOutcome, AppError> {
        let mut attempt = 0u32;
        loop {
            match self.download_file_once(file_name, url, path).await {
                Ok(outcome) => return Ok(outcome),
                Err(AppError::Download(message)) | Err(AppError::Timeout(message))
                    if attempt + 1 < MAX_ATTEMPTS =>
                {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    tracing::warn!(
                        "Download of {file_name} failed ({message}), retrying in {delay:?} (attempt {attempt}/{MAX_ATTEMPTS})"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn download_file_once(
        &self,
        file_name: &str,
        url: &str,
        path: &Path,
    ) -> Result<FileOutcome, AppError> {
        let mut existing = file_size_on_disk(path);

        let mut request = self.inner.client.get(url);
        if existing > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={existing}-"));
        }

        let response = request.send().await?;
        let total: u64;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        existing
                            + response
                                .content_length()
                                .unwrap_or(0)
                    });
            }
            StatusCode::OK => {
                total = response.content_length().unwrap_or(0);
                if existing > 0 && total == existing {
                    // The file was already whole; nothing left to fetch.
                    self.finish_file(file_name, total);
                    return Ok(FileOutcome::Done);
                }
                // Server ignored the range: restart from byte zero.
                existing = 0;
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial no longer matches the resource. Wipe and refetch
                // without a range.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                return Err(AppError::Download(format!(
                    "range not satisfiable for {file_name}, partial removed"
                )));
            }
            status => {
                return Err(AppError::Download(format!(
                    "unexpected response code {status} for {file_name}"
                )));
            }
        }

        self.inner.update_state(&self.unique_id, |s| {
            if let Some(f) = s.file_progress.get_mut(file_name) {
                f.total_size = total;
                f.downloaded = existing;
                f.complete = false;
            }
            s.recompute_totals();
        });

        let mut file = open_target(path, existing)?;
        let mut downloaded = existing;
        let mut since_checkpoint = 0u64;
        let mut paused = false;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if self.flags.cancel.load(Ordering::SeqCst) {
                return Ok(FileOutcome::Cancelled);
            }

            // Pause is a spin-wait at the chunk boundary; the worker keeps
            // the connection open and picks the stream back up on resume.
            while self.flags.pause.load(Ordering::SeqCst) {
                if !paused {
                    paused = true;
                    self.inner.update_state(&self.unique_id, |s| {
                        s.status = DownloadStatus::Paused;
                    });
                }
                if self.flags.cancel.load(Ordering::SeqCst) {
                    return Ok(FileOutcome::Cancelled);
                }
                tokio::time::sleep(PAUSE_POLL).await;
            }
            if paused {
                paused = false;
                self.inner.update_state(&self.unique_id, |s| {
                    s.status = DownloadStatus::Downloading;
                });
            }

            let chunk = chunk.map_err(|e| AppError::Download(format!("stream error: {e}")))?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            since_checkpoint += chunk.len() as u64;

            self.inner.mutate_state(&self.unique_id, |s| {
                if let Some(f) = s.file_progress.get_mut(file_name) {
                    f.downloaded = downloaded;
                }
                s.recompute_totals();
            });

            if since_checkpoint >= CHECKPOINT_BYTES {
                since_checkpoint = 0;
                self.inner.persist();
            }
        }

        file.flush()?;
        file.sync_all()?;
        drop(file);

        self.finish_file(file_name, if total > 0 { total } else { downloaded });
        Ok(FileOutcome::Done)
    }

    fn finish_file(&self, file_name: &str, total: u64) {
        self.inner.update_state(&self.unique_id, |s| {
            if let Some(f) = s.file_progress.get_mut(file_name) {
                f.total_size = total;
                f.downloaded = total;
                f.complete = true;
            }
            s.recompute_totals();
        });
    }
}

fn open_target(path: &Path, existing: u64) -> Result<std::fs::File, AppError> {
    let mut options = OpenOptions::new();
    if existing > 0 {
        options.append(true).create(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options.open(path).map_err(AppError::from)
}

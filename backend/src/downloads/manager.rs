use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::downloads::state::{
    unique_download_id, ArtifactKind, DownloadState, DownloadStatus, FileProgress,
};
use crate::downloads::store::StateStore;
use crate::downloads::worker::Worker;
use crate::error::AppError;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_BASE_URL: &str = "https://huggingface.co";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    Resumed,
    AlreadyDownloading,
    AlreadyDownloaded,
}

/// Result of a pause/resume/cancel/delete control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Pausing,
    Resumed,
    Cancelled,
    Deleted,
    NotFound,
    NotAllowed {
        op: &'static str,
        status: DownloadStatus,
    },
}

impl std::fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlOutcome::Pausing => f.write_str("pausing"),
            ControlOutcome::Resumed => f.write_str("resumed"),
            ControlOutcome::Cancelled => f.write_str("cancelled"),
            ControlOutcome::Deleted => f.write_str("deleted"),
            ControlOutcome::NotFound => f.write_str("not_found"),
            ControlOutcome::NotAllowed { op, status } => write!(f, "cannot_{op}_{status}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    pub status: DownloadStatus,
    pub percentage: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDownload {
    pub unique_id: String,
    pub model_id: String,
    pub status: DownloadStatus,
    pub error_message: String,
    pub partial_files: Vec<PartialFile>,
    pub total_partial_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned_files: Vec<String>,
    pub bytes_freed: u64,
}

/// Cooperative control flags observed by a worker between chunks.
#[derive(Default)]
pub(crate) struct ControlFlags {
    pub cancel: AtomicBool,
    pub pause: AtomicBool,
}

pub(crate) struct ManagerInner {
    pub client: reqwest::Client,
    pub base_url: String,
    pub models_dir: Mutex<PathBuf>,
    pub states: Mutex<HashMap<String, DownloadState>>,
    pub store: StateStore,
    pub flags: DashMap<String, Arc<ControlFlags>>,
    pub workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ManagerInner {
    pub fn file_url(&self, model_id: &str, file_name: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, model_id, file_name)
    }

    pub fn model_dir(&self, unique_id: &str) -> PathBuf {
        self.models_dir
            .lock()
            .map(|dir| dir.join(unique_id))
            .unwrap_or_else(|_| PathBuf::from(unique_id))
    }

    pub fn control_flags(&self, unique_id: &str) -> Arc<ControlFlags> {
        self.flags
            .entry(unique_id.to_string())
            .or_insert_with(|| Arc::new(ControlFlags::default()))
            .clone()
    }

    /// Mutate one state in memory without touching the state file. The
    /// worker uses this between checkpoints.
    pub fn mutate_state<F>(&self, unique_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut DownloadState),
    {
        let mut states = match self.states.lock() {
            Ok(states) => states,
            Err(_) => return false,
        };
        let Some(state) = states.get_mut(unique_id) else {
            return false;
        };
        mutate(state);
        state.touch();
        true
    }

    /// Mutate one state under the map lock, then persist the whole map.
    pub fn update_state<F>(&self, unique_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut DownloadState),
    {
        let snapshot = {
            let mut states = match self.states.lock() {
                Ok(states) => states,
                Err(_) => return false,
            };
            let Some(state) = states.get_mut(unique_id) else {
                return false;
            };
            mutate(state);
            state.touch();
            states.clone()
        };
        if let Err(e) = self.store.save(&snapshot) {
            tracing::warn!("Failed to persist download state: {e}");
        }
        true
    }

    pub fn persist(&self) {
        let snapshot = match self.states.lock() {
            Ok(states) => states.clone(),
            Err(_) => return,
        };
        if let Err(e) = self.store.save(&snapshot) {
            tracing::warn!("Failed to persist download state: {e}");
        }
    }

    pub fn get_state(&self, unique_id: &str) -> Option<DownloadState> {
        self.states.lock().ok()?.get(unique_id).cloned()
    }

    /// Remote size via HEAD; 0 when the server will not say.
    pub async fn remote_file_size(&self, url: &str) -> u64 {
        let response = self
            .client
            .head(url)
            .header("Accept", "application/octet-stream")
            .send()
            .await;
        match response {
            Ok(resp) => resp
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

pub(crate) fn file_size_on_disk(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Orchestrates concurrent artifact downloads with crash-safe resumption.
/// One worker task per artifact; a single artifact's files download
/// sequentially.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Load persisted states and reconcile them against the disk and the
    /// remote before accepting any new work.
    pub async fn initialize(config: &AppConfig) -> Result<Self, AppError> {
        Self::initialize_with_base_url(config, DEFAULT_BASE_URL).await
    }

    pub async fn initialize_with_base_url(
        config: &AppConfig,
        base_url: &str,
    ) -> Result<Self, AppError> {
        let models_dir = config.models_dir();
        tokio::fs::create_dir_all(&models_dir).await?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Download(format!("Failed to build HTTP client: {e}")))?;

        let store = StateStore::new(config.download_state_path());
        let states = store.load();

        let manager = Self {
            inner: Arc::new(ManagerInner {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                models_dir: Mutex::new(models_dir),
                states: Mutex::new(states),
                store,
                flags: DashMap::new(),
                workers: Mutex::new(HashMap::new()),
            }),
        };

        manager.reconcile().await?;
        Ok(manager)
    }

    /// Crash recovery: fix every state left in an active status against what
    /// is actually on disk and on the remote, then park it as paused.
    async fn reconcile(&self) -> Result<(), AppError> {
        let active_ids: Vec<String> = {
            let states = self
                .inner
                .states
                .lock()
                .map_err(|_| AppError::Internal("Download state lock poisoned".to_string()))?;
            states
                .iter()
                .filter(|(_, s)| s.status.is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for unique_id in active_ids {
            let Some(mut state) = self.inner.get_state(&unique_id) else {
                continue;
            };

            let model_dir = self.inner.model_dir(&unique_id);
            tokio::fs::create_dir_all(&model_dir).await?;

            // Backfill progress entries for states persisted before any byte
            // arrived.
            for file_name in state.files.clone() {
                state
                    .file_progress
                    .entry(file_name.clone())
                    .or_insert_with(|| FileProgress {
                        url: self.inner.file_url(&state.model_id, &file_name),
                        ..FileProgress::default()
                    });
            }

            for (file_name, info) in state.file_progress.iter_mut() {
                if info.url.is_empty() {
                    info.url = self.inner.file_url(&state.model_id, file_name);
                }
                let path = model_dir.join(file_name);
                let remote = self.inner.remote_file_size(&info.url).await;
                let mut local = file_size_on_disk(&path);

                if remote > 0 && local > remote {
                    // Leftover from a buggy run; cut it back to the resource.
                    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                    file.set_len(remote)?;
                    local = remote;
                }

                if remote > 0 && local == remote {
                    info.downloaded = remote;
                    info.total_size = remote;
                    info.complete = true;
                } else {
                    info.downloaded = local;
                    info.total_size = remote;
                    info.complete = false;
                }
            }

            state.recompute_totals();
            if state.all_files_complete() && state.total_size > 0 {
                state.status = DownloadStatus::Ready;
            } else {
                state.status = DownloadStatus::Paused;
            }
            state.touch();

            let flags = self.inner.control_flags(&unique_id);
            flags.cancel.store(false, Ordering::SeqCst);
            flags.pause.store(false, Ordering::SeqCst);

            if state.downloaded <= state.total_size || state.total_size == 0 {
                let status = state.status;
                self.inner.update_state(&unique_id, |s| *s = state);
                tracing::info!(
                    target: "aster.downloads",
                    "Reconciled download {} -> {}",
                    unique_id,
                    status
                );
            } else {
                tracing::warn!("Skipped saving inconsistent state for {unique_id}");
            }
        }

        Ok(())
    }

    pub async fn start(
        &self,
        model_id: &str,
        kind: ArtifactKind,
        files: Vec<String>,
    ) -> Result<StartOutcome, AppError> {
        if files.is_empty() {
            return Err(AppError::Validation {
                field: "files".to_string(),
                message: "at least one file is required".to_string(),
            });
        }
        if kind == ArtifactKind::SingleFile && files.len() != 1 {
            return Err(AppError::Validation {
                field: "files".to_string(),
                message: "single-file artifacts take exactly one file".to_string(),
            });
        }

        let unique_id = unique_download_id(model_id, kind, &files);

        let outcome = {
            let mut states = self
                .inner
                .states
                .lock()
                .map_err(|_| AppError::Internal("Download state lock poisoned".to_string()))?;

            match states.get_mut(&unique_id) {
                Some(state) => match state.status {
                    DownloadStatus::Ready => return Ok(StartOutcome::AlreadyDownloaded),
                    DownloadStatus::Downloading => return Ok(StartOutcome::AlreadyDownloading),
                    DownloadStatus::Paused | DownloadStatus::Cancelled | DownloadStatus::Error => {
                        state.status = DownloadStatus::Downloading;
                        state.error_message.clear();
                        state.touch();
                        StartOutcome::Resumed
                    }
                },
                None => {
                    let state = DownloadState::new(model_id, kind, files, &unique_id);
                    states.insert(unique_id.clone(), state);
                    StartOutcome::Started
                }
            }
        };

        let flags = self.inner.control_flags(&unique_id);
        flags.cancel.store(false, Ordering::SeqCst);
        flags.pause.store(false, Ordering::SeqCst);

        self.inner.persist();
        self.spawn_worker(&unique_id);
        tracing::info!(target: "aster.downloads", "Download {} {:?}", unique_id, outcome);
        Ok(outcome)
    }

    fn spawn_worker(&self, unique_id: &str) {
        let mut workers = match self.inner.workers.lock() {
            Ok(workers) => workers,
            Err(_) => return,
        };

        if let Some(handle) = workers.get(unique_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let worker = Worker::new(self.inner.clone(), unique_id.to_string());
        let inner = self.inner.clone();
        let id = unique_id.to_string();
        let handle = tokio::spawn(async move {
            // A panicking worker must still leave an error status behind.
            let run = std::panic::AssertUnwindSafe(worker.run());
            if futures::FutureExt::catch_unwind(run).await.is_err() {
                tracing::error!("Download worker for {id} panicked");
                inner.update_state(&id, |s| {
                    s.status = DownloadStatus::Error;
                    s.error_message = "download worker panicked".to_string();
                });
            }
        });
        workers.insert(unique_id.to_string(), handle);
    }

    pub fn pause(&self, unique_id: &str) -> ControlOutcome {
        let Some(state) = self.inner.get_state(unique_id) else {
            return ControlOutcome::NotFound;
        };
        if state.status != DownloadStatus::Downloading {
            return ControlOutcome::NotAllowed {
                op: "pause",
                status: state.status,
            };
        }

        self.inner
            .control_flags(unique_id)
            .pause
            .store(true, Ordering::SeqCst);
        ControlOutcome::Pausing
    }

    pub fn resume(&self, unique_id: &str) -> ControlOutcome {
        let Some(state) = self.inner.get_state(unique_id) else {
            return ControlOutcome::NotFound;
        };

        match state.status {
            DownloadStatus::Paused | DownloadStatus::Downloading => {
                let flags = self.inner.control_flags(unique_id);
                flags.pause.store(false, Ordering::SeqCst);
                flags.cancel.store(false, Ordering::SeqCst);
                self.inner.update_state(unique_id, |s| {
                    s.status = DownloadStatus::Downloading;
                });
                self.spawn_worker(unique_id);
                ControlOutcome::Resumed
            }
            DownloadStatus::Cancelled | DownloadStatus::Error => {
                let flags = self.inner.control_flags(unique_id);
                flags.pause.store(false, Ordering::SeqCst);
                flags.cancel.store(false, Ordering::SeqCst);
                self.inner.update_state(unique_id, |s| {
                    s.status = DownloadStatus::Downloading;
                    s.error_message.clear();
                });
                self.spawn_worker(unique_id);
                ControlOutcome::Resumed
            }
            DownloadStatus::Ready => ControlOutcome::NotAllowed {
                op: "resume",
                status: state.status,
            },
        }
    }

    pub async fn cancel(&self, unique_id: &str, cleanup_files: bool) -> ControlOutcome {
        let Some(state) = self.inner.get_state(unique_id) else {
            return ControlOutcome::NotFound;
        };
        if !state.status.is_active() {
            return ControlOutcome::NotAllowed {
                op: "cancel",
                status: state.status,
            };
        }

        let flags = self.inner.control_flags(unique_id);
        flags.cancel.store(true, Ordering::SeqCst);
        flags.pause.store(false, Ordering::SeqCst);

        self.join_worker(unique_id).await;

        self.inner.update_state(unique_id, |s| {
            s.status = DownloadStatus::Cancelled;
        });

        if cleanup_files {
            let _ = self.cleanup_partial_files(unique_id);
        }

        tracing::info!(target: "aster.downloads", "Download {} cancelled", unique_id);
        ControlOutcome::Cancelled
    }

    /// Bounded wait for the worker task to observe its flag and exit.
    async fn join_worker(&self, unique_id: &str) {
        let handle = match self.inner.workers.lock() {
            Ok(mut workers) => workers.remove(unique_id),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Worker for {unique_id} did not stop within bound, detaching");
            }
        }
    }

    pub async fn delete(&self, unique_id: &str) -> Result<ControlOutcome, AppError> {
        if let Some(state) = self.inner.get_state(unique_id) {
            if state.status.is_active() {
                self.cancel(unique_id, false).await;
            }
        }

        let model_dir = self.inner.model_dir(unique_id);
        if model_dir.exists() {
            tokio::fs::remove_dir_all(&model_dir).await?;
            tracing::info!(target: "aster.downloads", "Removed model directory {:?}", model_dir);
        }

        if let Ok(mut states) = self.inner.states.lock() {
            states.remove(unique_id);
        }
        self.inner.flags.remove(unique_id);
        if let Ok(mut workers) = self.inner.workers.lock() {
            workers.remove(unique_id);
        }
        self.inner.persist();

        Ok(ControlOutcome::Deleted)
    }

    pub fn progress(&self, unique_id: &str) -> Option<DownloadProgress> {
        let state = self.inner.get_state(unique_id)?;
        let downloaded = self.bytes_on_disk(&state);
        let percentage = if state.total_size > 0 {
            ((downloaded as f64 / state.total_size as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Some(DownloadProgress {
            downloaded,
            total: state.total_size,
            status: state.status,
            percentage,
            error: if state.error_message.is_empty() {
                None
            } else {
                Some(state.error_message.clone())
            },
        })
    }

    fn bytes_on_disk(&self, state: &DownloadState) -> u64 {
        let model_dir = self.inner.model_dir(&state.unique_id);
        if state.file_progress.is_empty() {
            state
                .files
                .iter()
                .map(|f| file_size_on_disk(&model_dir.join(f)))
                .sum()
        } else {
            state
                .file_progress
                .keys()
                .map(|f| file_size_on_disk(&model_dir.join(f)))
                .sum()
        }
    }

    pub fn list(&self) -> Vec<DownloadState> {
        self.inner
            .states
            .lock()
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, unique_id: &str) -> Option<DownloadState> {
        self.inner.get_state(unique_id)
    }

    pub fn set_models_directory(&self, new_path: PathBuf) -> Result<(), AppError> {
        if !new_path.is_absolute() {
            return Err(AppError::Validation {
                field: "models_directory".to_string(),
                message: "path must be absolute".to_string(),
            });
        }
        std::fs::create_dir_all(&new_path)?;
        if let Ok(mut dir) = self.inner.models_dir.lock() {
            *dir = new_path;
        }
        Ok(())
    }

    /// Remove partial data for one artifact. Terminal states lose the whole
    /// directory and their state row; active ones only their incomplete files.
    pub fn cleanup_partial_files(&self, unique_id: &str) -> Result<CleanupReport, AppError> {
        let Some(state) = self.inner.get_state(unique_id) else {
            return Err(AppError::NotFound {
                entity: "download".to_string(),
                id: unique_id.to_string(),
            });
        };

        let model_dir = self.inner.model_dir(unique_id);
        let mut report = CleanupReport::default();

        if !model_dir.exists() {
            return Ok(report);
        }

        if state.status.is_failed() {
            for entry in std::fs::read_dir(&model_dir)?.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        report.bytes_freed += meta.len();
                        report
                            .cleaned_files
                            .push(entry.file_name().to_string_lossy().to_string());
                    }
                }
            }
            std::fs::remove_dir_all(&model_dir)?;

            if let Ok(mut states) = self.inner.states.lock() {
                states.remove(unique_id);
            }
            self.inner.flags.remove(unique_id);
            self.inner.persist();
        } else {
            for (file_name, info) in &state.file_progress {
                if info.complete {
                    continue;
                }
                let path = model_dir.join(file_name);
                if path.exists() {
                    report.bytes_freed += file_size_on_disk(&path);
                    std::fs::remove_file(&path)?;
                    report.cleaned_files.push(file_name.clone());
                }
            }
            // Drop the directory once nothing is left in it.
            if std::fs::read_dir(&model_dir)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
            {
                let _ = std::fs::remove_dir(&model_dir);
            }
        }

        Ok(report)
    }

    pub fn failed_downloads(&self) -> Vec<FailedDownload> {
        let states = self.list();
        let mut failed = Vec::new();

        for state in states {
            if !state.status.is_failed() {
                continue;
            }
            let model_dir = self.inner.model_dir(&state.unique_id);
            let mut partial_files = Vec::new();
            let mut total = 0u64;

            if let Ok(entries) = std::fs::read_dir(&model_dir) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        if meta.is_file() {
                            total += meta.len();
                            partial_files.push(PartialFile {
                                name: entry.file_name().to_string_lossy().to_string(),
                                size: meta.len(),
                            });
                        }
                    }
                }
            }

            if !partial_files.is_empty() {
                failed.push(FailedDownload {
                    unique_id: state.unique_id.clone(),
                    model_id: state.model_id.clone(),
                    status: state.status,
                    error_message: state.error_message.clone(),
                    partial_files,
                    total_partial_size: total,
                });
            }
        }

        failed
    }

    pub fn cleanup_all_failed(&self) -> CleanupReport {
        let mut combined = CleanupReport::default();
        for failed in self.failed_downloads() {
            if let Ok(report) = self.cleanup_partial_files(&failed.unique_id) {
                combined.bytes_freed += report.bytes_freed;
                combined.cleaned_files.extend(report.cleaned_files);
            }
        }
        combined
    }

    /// Cancel flags for every live worker, then persist. Shutdown path.
    pub async fn shutdown(&self) {
        for entry in self.inner.flags.iter() {
            entry.value().cancel.store(true, Ordering::SeqCst);
        }
        let ids: Vec<String> = match self.inner.workers.lock() {
            Ok(workers) => workers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for id in ids {
            self.join_worker(&id).await;
        }
        self.inner.persist();
    }
}

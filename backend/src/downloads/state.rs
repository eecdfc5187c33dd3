use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Cancelled,
    Ready,
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Ready => "ready",
            DownloadStatus::Error => "error",
        }
    }

    /// Terminal failure states whose partials are swept wholesale.
    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadStatus::Cancelled | DownloadStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Paused)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an artifact is one file or a directory of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SingleFile,
    MultiFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub url: String,
    pub total_size: u64,
    pub downloaded: u64,
    pub complete: bool,
}

/// Persistent record of one artifact download. Serialized snake_case into
/// the on-disk state file, keyed by `unique_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    pub model_type: ArtifactKind,
    pub files: Vec<String>,
    pub total_size: u64,
    pub downloaded: u64,
    pub status: DownloadStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub file_progress: BTreeMap<String, FileProgress>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub unique_id: String,
}

impl DownloadState {
    pub fn new(model_id: &str, kind: ArtifactKind, files: Vec<String>, unique_id: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            model_id: model_id.to_string(),
            model_type: kind,
            files,
            total_size: 0,
            downloaded: 0,
            status: DownloadStatus::Downloading,
            created_at: now.clone(),
            updated_at: now,
            file_progress: BTreeMap::new(),
            error_message: String::new(),
            unique_id: unique_id.to_string(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Re-derive the aggregate counters from per-file progress.
    pub fn recompute_totals(&mut self) {
        self.total_size = self.file_progress.values().map(|f| f.total_size).sum();
        self.downloaded = self.file_progress.values().map(|f| f.downloaded).sum();
    }

    pub fn all_files_complete(&self) -> bool {
        !self.file_progress.is_empty() && self.file_progress.values().all(|f| f.complete)
    }

    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        ((self.downloaded as f64 / self.total_size as f64) * 10_000.0).round() / 100.0
    }
}

/// Derive the state-map key for an artifact. Single-file artifacts get
/// `{author}/{basename-without-extension}` so two quantizations of the same
/// repo do not collide; everything else keys on the model id itself.
pub fn unique_download_id(model_id: &str, kind: ArtifactKind, files: &[String]) -> String {
    if kind == ArtifactKind::SingleFile && files.len() == 1 {
        let base_name = Path::new(&files[0])
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&files[0]);
        let author = model_id.split('/').next().unwrap_or(model_id);
        format!("{author}/{base_name}")
    } else {
        model_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_for_single_file_uses_author_and_basename() {
        let files = vec!["llama-3.2-1b-q4_k_m.gguf".to_string()];
        let id = unique_download_id("bartowski/Llama-3.2-1B-GGUF", ArtifactKind::SingleFile, &files);
        assert_eq!(id, "bartowski/llama-3.2-1b-q4_k_m");
    }

    #[test]
    fn unique_id_for_multi_file_is_model_id() {
        let files = vec!["config.json".to_string(), "model.safetensors".to_string()];
        let id = unique_download_id(
            "mlx-community/Llama-3.2-3B-Instruct-4bit",
            ArtifactKind::MultiFile,
            &files,
        );
        assert_eq!(id, "mlx-community/Llama-3.2-3B-Instruct-4bit");
    }

    #[test]
    fn totals_recompute_from_file_progress() {
        let mut state = DownloadState::new(
            "a/b",
            ArtifactKind::MultiFile,
            vec!["x".to_string(), "y".to_string()],
            "a/b",
        );
        state.file_progress.insert(
            "x".to_string(),
            FileProgress {
                url: String::new(),
                total_size: 100,
                downloaded: 40,
                complete: false,
            },
        );
        state.file_progress.insert(
            "y".to_string(),
            FileProgress {
                url: String::new(),
                total_size: 50,
                downloaded: 50,
                complete: true,
            },
        );

        state.recompute_totals();
        assert_eq!(state.total_size, 150);
        assert_eq!(state.downloaded, 90);
        assert!(state.downloaded <= state.total_size);
        assert!(!state.all_files_complete());
    }

    #[test]
    fn state_json_matches_wire_format() {
        let mut state = DownloadState::new(
            "mlx-community/Llama-3.2-3B-Instruct-4bit",
            ArtifactKind::MultiFile,
            vec!["config.json".to_string()],
            "mlx-community/Llama-3.2-3B-Instruct-4bit",
        );
        state.status = DownloadStatus::Paused;

        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["model_id"], "mlx-community/Llama-3.2-3B-Instruct-4bit");
        assert_eq!(json["status"], "paused");
        assert_eq!(json["model_type"], "multi_file");
        assert!(json["file_progress"].is_object());
        assert_eq!(json["error_message"], "");
    }
}

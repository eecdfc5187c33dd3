use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::downloads::state::DownloadState;
use crate::error::AppError;

/// On-disk persistence for the download state map: one JSON object keyed by
/// unique id. Writes go to a temp file in the same directory, are fsync'd,
/// then renamed over the live file, so a crash can never leave a torn file.
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> HashMap<String, DownloadState> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(_) => return HashMap::new(),
        };

        match serde_json::from_str::<HashMap<String, DownloadState>>(&data) {
            Ok(mut states) => {
                for (unique_id, state) in states.iter_mut() {
                    if state.unique_id.is_empty() {
                        state.unique_id = unique_id.clone();
                    }
                }
                tracing::info!("Loaded {} download states from {:?}", states.len(), self.path);
                states
            }
            Err(e) => {
                tracing::warn!("Download state file unreadable, starting fresh: {e}");
                HashMap::new()
            }
        }
    }

    pub fn save(&self, states: &HashMap<String, DownloadState>) -> Result<(), AppError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::Internal("State store lock poisoned".to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(states)?;

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&payload)?;
            tmp.flush()?;
            tmp.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloads::state::{ArtifactKind, DownloadState, DownloadStatus};

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("download_state.json"));

        let mut states = HashMap::new();
        let mut state = DownloadState::new(
            "author/model",
            ArtifactKind::SingleFile,
            vec!["model.gguf".to_string()],
            "author/model",
        );
        state.status = DownloadStatus::Paused;
        states.insert("author/model".to_string(), state);

        store.save(&states).expect("save");
        let loaded = store.load();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["author/model"].status, DownloadStatus::Paused);
        assert_eq!(loaded["author/model"].unique_id, "author/model");
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("nope.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_backfills_missing_unique_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("download_state.json");
        std::fs::write(
            &path,
            r#"{"a/b":{"model_id":"a/b","model_type":"single_file","files":["b.gguf"],
                "total_size":10,"downloaded":10,"status":"ready",
                "created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}}"#,
        )
        .expect("write");

        let store = StateStore::new(path);
        let loaded = store.load();
        assert_eq!(loaded["a/b"].unique_id, "a/b");
    }
}

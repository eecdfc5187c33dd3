pub mod manager;
pub mod state;
pub mod store;
pub mod worker;

pub use manager::{ControlOutcome, DownloadManager, DownloadProgress, StartOutcome};
pub use state::{ArtifactKind, DownloadState, DownloadStatus, FileProgress};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use aster_lib::config::AppConfig;
use aster_lib::downloads::state::{unique_download_id, FileProgress};
use aster_lib::downloads::store::StateStore;
use aster_lib::downloads::{
    ArtifactKind, ControlOutcome, DownloadManager, DownloadState, DownloadStatus, StartOutcome,
};

/// Minimal HTTP fixture speaking just enough of the range protocol:
/// HEAD with Content-Length, GET with 200 / 206 / 416 responses.
#[derive(Clone)]
struct Fixture {
    body: Arc<Vec<u8>>,
    ignore_range: bool,
    chunk_delay: Option<Duration>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ignore_range: false,
            chunk_delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn spawn(self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let fixture = self.clone();
                tokio::spawn(async move {
                    let _ = fixture.handle(stream).await;
                });
            }
        });

        format!("http://{addr}")
    }

    async fn handle(&self, mut stream: tokio::net::TcpStream) -> std::io::Result<()> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            raw.extend_from_slice(&buf[..n]);
            if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let request = String::from_utf8_lossy(&raw).to_string();
        self.requests.lock().await.push(request.clone());

        let first_line = request.lines().next().unwrap_or_default().to_string();
        let is_head = first_line.starts_with("HEAD");
        let range_start: Option<u64> = request
            .lines()
            .find(|l| l.to_lowercase().starts_with("range:"))
            .and_then(|l| l.split('=').nth(1))
            .and_then(|spec| spec.trim().trim_end_matches('-').parse().ok());

        let total = self.body.len() as u64;

        if is_head {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(header.as_bytes()).await?;
            return Ok(());
        }

        let (status_line, start) = match range_start {
            Some(start) if !self.ignore_range => {
                if start >= total {
                    let header =
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                    stream.write_all(header.as_bytes()).await?;
                    return Ok(());
                }
                (
                    format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                        total - start,
                        start,
                        total - 1,
                        total
                    ),
                    start,
                )
            }
            _ => (
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
                ),
                0,
            ),
        };

        stream.write_all(status_line.as_bytes()).await?;

        let payload = &self.body[start as usize..];
        match self.chunk_delay {
            Some(delay) => {
                for chunk in payload.chunks(1024) {
                    stream.write_all(chunk).await?;
                    stream.flush().await?;
                    tokio::time::sleep(delay).await;
                }
            }
            None => stream.write_all(payload).await?,
        }
        stream.flush().await?;
        Ok(())
    }
}

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_for_status(
    manager: &DownloadManager,
    unique_id: &str,
    wanted: DownloadStatus,
) -> DownloadState {
    for _ in 0..200 {
        if let Some(state) = manager.get(unique_id) {
            if state.status == wanted {
                return state;
            }
            if state.status == DownloadStatus::Error {
                panic!("download errored: {}", state.error_message);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("download never reached {wanted:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_download_completes_with_exact_size() {
    let body = test_body(64 * 1024);
    let fixture = Fixture::new(body.clone());
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());
    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");

    let outcome = manager
        .start(
            "author/model-repo",
            ArtifactKind::SingleFile,
            vec!["weights.gguf".to_string()],
        )
        .await
        .expect("start");
    assert_eq!(outcome, StartOutcome::Started);

    let unique_id = unique_download_id(
        "author/model-repo",
        ArtifactKind::SingleFile,
        &["weights.gguf".to_string()],
    );
    let state = wait_for_status(&manager, &unique_id, DownloadStatus::Ready).await;

    // Aggregate invariants hold and the file on disk is exactly the total.
    assert_eq!(state.total_size, body.len() as u64);
    assert_eq!(state.downloaded, state.total_size);
    let recomputed: u64 = state.file_progress.values().map(|f| f.downloaded).sum();
    assert_eq!(recomputed, state.downloaded);

    let file_path = config.models_dir().join(&unique_id).join("weights.gguf");
    let on_disk = std::fs::read(&file_path).expect("file");
    assert_eq!(on_disk, body);

    // Starting again is a no-op.
    let again = manager
        .start(
            "author/model-repo",
            ArtifactKind::SingleFile,
            vec!["weights.gguf".to_string()],
        )
        .await
        .expect("restart");
    assert_eq!(again, StartOutcome::AlreadyDownloaded);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_after_kill_issues_range_request() {
    let body = test_body(100_000);
    let fixture = Fixture::new(body.clone());
    let requests = fixture.requests.clone();
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());

    let model_id = "author/resume-model";
    let files = vec!["weights.gguf".to_string()];
    let unique_id = unique_download_id(model_id, ArtifactKind::SingleFile, &files);

    // Simulate a process killed mid-download: 40000 bytes on disk and a
    // state file still claiming "downloading".
    let model_dir = config.models_dir().join(&unique_id);
    std::fs::create_dir_all(&model_dir).expect("mkdir");
    std::fs::write(model_dir.join("weights.gguf"), &body[..40_000]).expect("partial");

    let mut state = DownloadState::new(model_id, ArtifactKind::SingleFile, files.clone(), &unique_id);
    state.file_progress.insert(
        "weights.gguf".to_string(),
        FileProgress {
            url: String::new(),
            total_size: 0,
            downloaded: 40_000,
            complete: false,
        },
    );
    let store = StateStore::new(config.download_state_path());
    let mut states = std::collections::HashMap::new();
    states.insert(unique_id.clone(), state);
    store.save(&states).expect("seed state");

    // Reconciliation parks the download as paused with correct counters.
    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");
    let reconciled = manager.get(&unique_id).expect("state");
    assert_eq!(reconciled.status, DownloadStatus::Paused);
    assert_eq!(reconciled.downloaded, 40_000);
    assert_eq!(reconciled.total_size, body.len() as u64);

    // Resume picks up from byte 40000 with a Range header.
    assert_eq!(manager.resume(&unique_id), ControlOutcome::Resumed);
    wait_for_status(&manager, &unique_id, DownloadStatus::Ready).await;

    let on_disk = std::fs::read(model_dir.join("weights.gguf")).expect("file");
    assert_eq!(on_disk, body);

    let saw_range = requests
        .lock()
        .await
        .iter()
        .any(|r| r.to_lowercase().contains("range: bytes=40000-"));
    assert!(saw_range, "expected a ranged GET from byte 40000");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_ignoring_range_restarts_from_zero() {
    let body = test_body(10_000);
    let mut fixture = Fixture::new(body.clone());
    fixture.ignore_range = true;
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());

    let model_id = "author/stubborn-server";
    let files = vec!["weights.gguf".to_string()];
    let unique_id = unique_download_id(model_id, ArtifactKind::SingleFile, &files);

    let model_dir = config.models_dir().join(&unique_id);
    std::fs::create_dir_all(&model_dir).expect("mkdir");
    // A stale partial that does not match the start of the resource.
    std::fs::write(model_dir.join("weights.gguf"), vec![0xAB; 1_000]).expect("partial");

    let mut state = DownloadState::new(model_id, ArtifactKind::SingleFile, files.clone(), &unique_id);
    state.file_progress.insert(
        "weights.gguf".to_string(),
        FileProgress {
            url: String::new(),
            total_size: 0,
            downloaded: 1_000,
            complete: false,
        },
    );
    let store = StateStore::new(config.download_state_path());
    let mut states = std::collections::HashMap::new();
    states.insert(unique_id.clone(), state);
    store.save(&states).expect("seed state");

    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");
    assert_eq!(manager.resume(&unique_id), ControlOutcome::Resumed);
    let state = wait_for_status(&manager, &unique_id, DownloadStatus::Ready).await;

    assert_eq!(state.total_size, body.len() as u64);
    let on_disk = std::fs::read(model_dir.join("weights.gguf")).expect("file");
    assert_eq!(on_disk, body, "file must be rewritten from byte zero");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_local_file_is_truncated_at_reconcile() {
    let body = test_body(10_000);
    let fixture = Fixture::new(body.clone());
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());

    let model_id = "author/oversize";
    let files = vec!["weights.gguf".to_string()];
    let unique_id = unique_download_id(model_id, ArtifactKind::SingleFile, &files);

    let model_dir = config.models_dir().join(&unique_id);
    std::fs::create_dir_all(&model_dir).expect("mkdir");
    let mut oversize = body.clone();
    oversize.extend_from_slice(&[0u8; 2_000]);
    std::fs::write(model_dir.join("weights.gguf"), &oversize).expect("oversize");

    let mut state = DownloadState::new(model_id, ArtifactKind::SingleFile, files.clone(), &unique_id);
    state.file_progress.insert(
        "weights.gguf".to_string(),
        FileProgress {
            url: String::new(),
            total_size: 0,
            downloaded: oversize.len() as u64,
            complete: false,
        },
    );
    let store = StateStore::new(config.download_state_path());
    let mut states = std::collections::HashMap::new();
    states.insert(unique_id.clone(), state);
    store.save(&states).expect("seed state");

    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");

    let state = manager.get(&unique_id).expect("state");
    assert_eq!(state.status, DownloadStatus::Ready);
    assert_eq!(state.downloaded, body.len() as u64);

    let meta = std::fs::metadata(model_dir.join("weights.gguf")).expect("meta");
    assert_eq!(meta.len(), body.len() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_then_cancel_cleans_up_within_bound() {
    let mut fixture = Fixture::new(test_body(400 * 1024));
    fixture.chunk_delay = Some(Duration::from_millis(10));
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());
    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");

    let files = vec!["weights.gguf".to_string()];
    manager
        .start("author/slow-model", ArtifactKind::SingleFile, files.clone())
        .await
        .expect("start");
    let unique_id = unique_download_id("author/slow-model", ArtifactKind::SingleFile, &files);

    // Let some bytes land, then pause.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.pause(&unique_id), ControlOutcome::Pausing);
    wait_for_status(&manager, &unique_id, DownloadStatus::Paused).await;

    let before_cancel = std::time::Instant::now();
    let outcome = manager.cancel(&unique_id, true).await;
    assert_eq!(outcome, ControlOutcome::Cancelled);
    assert!(
        before_cancel.elapsed() < Duration::from_secs(3),
        "cancel must join the worker within its bound"
    );

    // cleanup=true on a cancelled download removes directory and state row.
    assert!(!config.models_dir().join(&unique_id).exists());
    assert!(manager.get(&unique_id).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_file_artifact_downloads_sequentially() {
    let body = test_body(8_192);
    let fixture = Fixture::new(body.clone());
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());
    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");

    let files = vec!["config.json".to_string(), "model.safetensors".to_string()];
    manager
        .start("mlx-community/tiny", ArtifactKind::MultiFile, files.clone())
        .await
        .expect("start");

    let state = wait_for_status(&manager, "mlx-community/tiny", DownloadStatus::Ready).await;
    assert_eq!(state.file_progress.len(), 2);
    assert!(state.file_progress.values().all(|f| f.complete));
    assert_eq!(state.total_size, (body.len() * 2) as u64);

    let progress = manager.progress("mlx-community/tiny").expect("progress");
    assert_eq!(progress.percentage, 100.0);
    assert!(progress.error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_with_no_files_is_rejected() {
    let fixture = Fixture::new(test_body(10));
    let base_url = fixture.spawn().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::new(dir.path());
    let manager = DownloadManager::initialize_with_base_url(&config, &base_url)
        .await
        .expect("manager");

    let result = manager
        .start("author/empty", ArtifactKind::MultiFile, Vec::new())
        .await;
    assert!(result.is_err());
}

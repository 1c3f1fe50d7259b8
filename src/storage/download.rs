//! Model download
//!
//! Makes sure a model file is present in the [`ModelStore`] before anything
//! tries to load it. Files are streamed to `<filename>.part` and renamed only
//! once complete (and checksummed, when a digest is supplied), so a
//! half-written file is never mistaken for a model.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::storage::models::ModelStore;
use crate::storage::StorageError;

/// Download progress information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub filename: String,
    /// Percentage, 0 to 100 (0 while the total is unknown)
    pub progress: u8,
    pub downloaded: u64,
    /// Total file size, 0 when the server did not say
    pub total: u64,
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Byte-level progress reported by a fetcher: (downloaded, total)
pub type FetchProgress<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

/// Where model bytes come from
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Writes the resource at `url` to `dest` and returns the bytes written.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &FetchProgress<'_>,
    ) -> Result<u64, StorageError>;
}

/// Plain HTTP(S) GET, streamed to disk
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, StorageError> {
        let client = Client::builder()
            .user_agent(concat!("offline-llm/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &FetchProgress<'_>,
    ) -> Result<u64, StorageError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "server returned {}",
                response.status()
            )));
        }

        let total = response.content_length();
        debug!("Content length: {:?}", total);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }

        file.sync_all().await?;
        if let Some(expected) = total {
            if downloaded != expected {
                return Err(StorageError::Download(format!(
                    "connection closed after {downloaded} of {expected} bytes"
                )));
            }
        }
        Ok(downloaded)
    }
}

/// What to download and where to keep it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureModelRequest {
    pub url: String,
    pub filename: String,
    /// Hex SHA-256 of the complete file
    pub sha256: Option<String>,
}

/// Returns the stored path of `request.filename`, downloading it first if
/// it is not there yet.
pub async fn ensure_model(
    store: &ModelStore,
    fetcher: &dyn ModelFetcher,
    request: &EnsureModelRequest,
    on_progress: Option<ProgressCallback>,
) -> Result<PathBuf, StorageError> {
    let path = store.resolve(&request.filename)?;
    if path.is_file() {
        info!("Model already exists: {}", path.display());
        return Ok(path);
    }

    tokio::fs::create_dir_all(store.root()).await?;
    let partial = path.with_file_name(format!("{}.part", request.filename));

    info!("Downloading model from: {}", request.url);
    let filename = request.filename.clone();
    let last_percent = std::sync::atomic::AtomicU8::new(u8::MAX);
    let report = move |downloaded: u64, total: Option<u64>| {
        let Some(callback) = &on_progress else {
            return;
        };
        let total = total.unwrap_or(0);
        let percent = if total > 0 {
            (downloaded.min(total) * 100 / total) as u8
        } else {
            0
        };
        // Once per percent is plenty for a UI.
        let previous = last_percent.swap(percent, std::sync::atomic::Ordering::Relaxed);
        if previous != percent || downloaded == total {
            callback(DownloadProgress {
                filename: filename.clone(),
                progress: percent,
                downloaded,
                total,
            });
        }
    };

    let result = match fetcher.fetch(&request.url, &partial, &report).await {
        Ok(bytes) => match &request.sha256 {
            Some(expected) => verify_checksum(&partial, expected).await.map(|_| bytes),
            None => Ok(bytes),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, &path).await?;
            info!("Model downloaded: {} ({} bytes)", path.display(), bytes);
            Ok(path)
        }
        Err(e) => {
            warn!("Download of {} failed: {}", request.filename, e);
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!("No partial file to remove: {}", cleanup);
            }
            Err(e)
        }
    }
}

/// Verify file integrity using SHA256 checksum
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(StorageError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("Checksum verified for {}", path.display());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::StaticFetcher;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const BODY: &[u8] = b"GGUF-not-really-a-model";

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn request(filename: &str, sha256: Option<String>) -> EnsureModelRequest {
        EnsureModelRequest {
            url: "http://models.invalid/tiny.gguf".to_string(),
            filename: filename.to_string(),
            sha256,
        }
    }

    /// One-shot HTTP server answering a single request with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/tiny.gguf")
    }

    #[tokio::test]
    async fn test_downloads_and_reports_progress() {
        let temp_dir = TempDir::new().unwrap();
        let store = ModelStore::new(temp_dir.path().join("models"));
        let fetcher = StaticFetcher::new(BODY);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));

        let path = ensure_model(
            &store,
            &fetcher,
            &request("tiny.gguf", Some(sha256_hex(BODY))),
            Some(callback),
        )
        .await
        .unwrap();

        assert_eq!(path, temp_dir.path().join("models").join("tiny.gguf"));
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert!(!temp_dir.path().join("models").join("tiny.gguf.part").exists());

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.progress, 100);
        assert_eq!(last.downloaded, BODY.len() as u64);
        assert_eq!(last.filename, "tiny.gguf");
    }

    #[tokio::test]
    async fn test_existing_file_is_not_downloaded_again() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("tiny.gguf"), b"already here").unwrap();
        let store = ModelStore::new(temp_dir.path());
        let fetcher = StaticFetcher::new(BODY);

        let path = ensure_model(&store, &fetcher, &request("tiny.gguf", None), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"already here");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = ModelStore::new(temp_dir.path());
        let fetcher = StaticFetcher::new(BODY);

        let result = ensure_model(
            &store,
            &fetcher,
            &request("tiny.gguf", Some(sha256_hex(b"something else"))),
            None,
        )
        .await;

        assert!(matches!(result, Err(StorageError::ChecksumMismatch { .. })));
        assert!(store.list().unwrap().is_empty());
        assert!(!temp_dir.path().join("tiny.gguf.part").exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ModelStore::new(temp_dir.path());
        let mut fetcher = StaticFetcher::new(BODY);
        fetcher.fail = true;

        let result = ensure_model(&store, &fetcher, &request("tiny.gguf", None), None).await;
        assert!(matches!(result, Err(StorageError::Download(_))));
        assert!(!temp_dir.path().join("tiny.gguf.part").exists());
        assert!(!temp_dir.path().join("tiny.gguf").exists());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_filename() {
        let temp_dir = TempDir::new().unwrap();
        let store = ModelStore::new(temp_dir.path());
        let fetcher = StaticFetcher::new(BODY);

        let result = ensure_model(&store, &fetcher, &request("../escape.gguf", None), None).await;
        assert!(matches!(result, Err(StorageError::InvalidFilename(_))));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_body() {
        let url = serve_once("200 OK", BODY).await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.part");
        let last = Mutex::new((0u64, None));

        let fetcher = HttpFetcher::new().unwrap();
        let written = fetcher
            .fetch(&url, &dest, &|done: u64, total: Option<u64>| {
                *last.lock().unwrap() = (done, total)
            })
            .await
            .unwrap();

        assert_eq!(written, BODY.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert_eq!(
            *last.lock().unwrap(),
            (BODY.len() as u64, Some(BODY.len() as u64))
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_reports_status() {
        let url = serve_once("404 Not Found", b"nope").await;
        let temp_dir = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let result = fetcher
            .fetch(&url, &temp_dir.path().join("x.part"), &|_: u64, _: Option<u64>| {})
            .await;
        assert!(matches!(result, Err(StorageError::Download(msg)) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_verify_checksum_is_case_insensitive() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f");
        std::fs::write(&path, BODY).unwrap();
        verify_checksum(&path, &sha256_hex(BODY).to_uppercase())
            .await
            .unwrap();
    }
}

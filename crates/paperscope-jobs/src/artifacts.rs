//! Artifact store: downloads documents into the storage layout.
//!
//! Layout: `<root>/<source>/<year>/<paper_id>/document.pdf` with a sibling
//! `manifest.json` holding the candidate, the [`ArtifactRef`] and (once
//! enriched) the [`EnrichmentResult`].
//!
//! Downloads stream into a hidden `.part` file in the same directory while
//! hashing with BLAKE3, are synced, and only then renamed over the final
//! path, so a partial document is never visible. The `.part` file is removed
//! when the download fails, times out, or is dropped. A fetch whose manifest
//! records the same URL and whose file still matches the recorded checksum is
//! a cache hit and does no network I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use paperscope_core::normalize::storage_segment;
use paperscope_core::{
    defaults, retry, ArtifactManifest, ArtifactRef, CandidateRecord, EnrichmentResult, Error,
    Result, RetryPolicy, StageOutcome,
};

use crate::locks::KeyedLocks;

/// BLAKE3 content hash with the `blake3:` prefix.
pub fn content_hash(data: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(data).to_hex())
}

/// Hidden temporary file in `dir`, deleted when the returned path is dropped.
fn temp_sibling(dir: &Path, name: &str, suffix: &str) -> Result<(fs::File, TempPath)> {
    let (file, temp_path) = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_parts();
    Ok((fs::File::from_std(file), temp_path))
}

/// Rename a finished temporary file over `path`.
fn persist(temp_path: TempPath, path: &Path) -> Result<()> {
    temp_path.persist(path).map_err(|e| {
        warn!(to = %path.display(), error = %e.error, "artifacts: rename failed");
        Error::from(e.error)
    })
}

/// Write `data` to `path` via a temporary sibling and rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (mut file, temp_path) = temp_sibling(parent, &file_name, ".tmp")?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    persist(temp_path, path)
}

struct Downloaded {
    temp_path: TempPath,
    checksum: String,
    byte_size: u64,
}

pub struct ArtifactStore {
    root: PathBuf,
    client: reqwest::Client,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    locks: KeyedLocks,
    network_fetches: AtomicUsize,
}

impl ArtifactStore {
    pub fn new(
        root: impl Into<PathBuf>,
        client: reqwest::Client,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            client,
            retry,
            attempt_timeout,
            locks: KeyedLocks::new(),
            network_fetches: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of download attempts that reached the network.
    pub fn network_fetches(&self) -> usize {
        self.network_fetches.load(Ordering::SeqCst)
    }

    /// Directory holding a candidate's document and manifest.
    pub fn paper_dir(&self, candidate: &CandidateRecord) -> PathBuf {
        self.root
            .join(storage_segment(&candidate.source_id))
            .join(candidate.storage_year().to_string())
            .join(storage_segment(&candidate.external_id))
    }

    pub fn document_path(&self, candidate: &CandidateRecord) -> PathBuf {
        self.paper_dir(candidate).join(defaults::DOCUMENT_FILE)
    }

    pub fn manifest_path(&self, candidate: &CandidateRecord) -> PathBuf {
        self.paper_dir(candidate).join(defaults::MANIFEST_FILE)
    }

    /// Read the manifest for a candidate, if one was written.
    pub async fn load_manifest(&self, candidate: &CandidateRecord) -> Result<Option<ArtifactManifest>> {
        self.manifest_beside(&self.document_path(candidate)).await
    }

    /// Read the manifest stored next to a document.
    pub async fn manifest_beside(&self, document: &Path) -> Result<Option<ArtifactManifest>> {
        let Some(dir) = document.parent() else {
            return Ok(None);
        };
        match fs::read(dir.join(defaults::MANIFEST_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, candidate: &CandidateRecord, manifest: &ArtifactManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.manifest_path(candidate), &json).await
    }

    /// Persist an enrichment result next to its document.
    pub async fn record_enrichment(
        &self,
        candidate: &CandidateRecord,
        artifact: &ArtifactRef,
        enrichment: &EnrichmentResult,
    ) -> Result<()> {
        let _guard = self.locks.lock(&candidate.paper_key()).await;
        let manifest = ArtifactManifest {
            candidate: candidate.clone(),
            artifact: artifact.clone(),
            enrichment: Some(enrichment.clone()),
        };
        self.write_manifest(candidate, &manifest).await
    }

    /// Whether the stored document still matches its recorded checksum.
    pub async fn verify(&self, artifact: &ArtifactRef) -> bool {
        match fs::read(&artifact.storage_path).await {
            Ok(bytes) => content_hash(&bytes) == artifact.checksum,
            Err(_) => false,
        }
    }

    /// Load a stored artifact for a candidate when it is still valid.
    pub async fn cached(&self, candidate: &CandidateRecord) -> Result<Option<ArtifactManifest>> {
        let Some(manifest) = self.load_manifest(candidate).await? else {
            return Ok(None);
        };
        if manifest.artifact.document_url != candidate.document_url {
            debug!(paper_key = %candidate.paper_key(), "Document URL changed, refetching");
            return Ok(None);
        }
        if !self.verify(&manifest.artifact).await {
            warn!(paper_key = %candidate.paper_key(), "Stored document missing or corrupt, refetching");
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    /// Fetch a candidate's document, reusing the stored copy when valid.
    #[instrument(skip(self, candidate), fields(subsystem = "jobs", component = "artifacts", op = "fetch", paper_key = %candidate.paper_key()))]
    pub async fn fetch(&self, candidate: &CandidateRecord) -> Result<ArtifactRef> {
        let _guard = self.locks.lock(&candidate.paper_key()).await;

        if let Some(manifest) = self.cached(candidate).await? {
            debug!(checksum = %manifest.artifact.checksum, "Artifact cache hit");
            return Ok(manifest.artifact);
        }

        let dir = self.paper_dir(candidate);
        fs::create_dir_all(&dir).await?;
        let url = candidate.document_url.as_str();

        let mut attempts = 0u32;
        let downloaded = retry(&self.retry, "fetch_document", |attempt| {
            attempts = attempt;
            let dir = dir.clone();
            async move {
                let result = match tokio::time::timeout(self.attempt_timeout, self.download(url, &dir)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransientIo(format!(
                        "download of {url} timed out after {}s",
                        self.attempt_timeout.as_secs_f64()
                    ))),
                };
                StageOutcome::from_result(result)
            }
        })
        .await?;

        let storage_path = dir.join(defaults::DOCUMENT_FILE);
        persist(downloaded.temp_path, &storage_path)?;

        let artifact = ArtifactRef {
            paper_key: candidate.paper_key(),
            storage_path,
            checksum: downloaded.checksum,
            byte_size: downloaded.byte_size,
            document_url: candidate.document_url.clone(),
            fetched_at: Utc::now(),
            fetch_attempts: attempts,
        };
        let manifest = ArtifactManifest {
            candidate: candidate.clone(),
            artifact: artifact.clone(),
            enrichment: None,
        };
        self.write_manifest(candidate, &manifest).await?;

        info!(
            byte_size = artifact.byte_size,
            attempt = attempts,
            checksum = %artifact.checksum,
            "Document stored"
        );
        Ok(artifact)
    }

    async fn download(&self, url: &str, dir: &Path) -> Result<Downloaded> {
        self.network_fetches.fetch_add(1, Ordering::SeqCst);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), format!("GET {url}")));
        }
        let expected = response.content_length();

        let (file, temp_path) = temp_sibling(dir, defaults::DOCUMENT_FILE, ".part")?;
        let (checksum, byte_size) = stream_to_file(response, file).await?;
        if let Some(expected) = expected.filter(|e| *e != byte_size) {
            return Err(Error::TransientIo(format!(
                "truncated download of {url}: expected {expected} bytes, got {byte_size}"
            )));
        }
        if byte_size == 0 {
            return Err(Error::PermanentInput(format!("{url} returned an empty document")));
        }
        Ok(Downloaded { temp_path, checksum, byte_size })
    }
}

async fn stream_to_file(response: reqwest::Response, mut file: fs::File) -> Result<(String, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut byte_size = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::TransientIo(format!("download interrupted: {e}")))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        byte_size += chunk.len() as u64;
    }
    file.sync_all().await?;
    Ok((format!("blake3:{}", hasher.finalize().to_hex()), byte_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PDF: &[u8] = b"%PDF-1.7\nfake document body\n%%EOF";

    fn candidate(server: &MockServer, id: &str) -> CandidateRecord {
        candidate_at(&server.uri(), id)
    }

    fn candidate_at(base: &str, id: &str) -> CandidateRecord {
        CandidateRecord {
            source_id: "huggingface".into(),
            external_id: id.into(),
            title: "Test".into(),
            authors: vec![],
            abstract_text: String::new(),
            categories: vec![],
            document_url: format!("{base}/pdf/{id}.pdf"),
            published_at: chrono::DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            discovered_at: Utc::now(),
        }
    }

    fn store(root: &Path, max_attempts: u32) -> ArtifactStore {
        ArtifactStore::new(
            root,
            reqwest::Client::new(),
            RetryPolicy::new(max_attempts, Duration::from_millis(1)).with_jitter_ratio(0.0),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_then_cache_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf/2401.1.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let c = candidate(&server, "2401.1");

        let first = store.fetch(&c).await.unwrap();
        assert_eq!(
            first.storage_path,
            dir.path().join("huggingface/2024/2401.1/document.pdf")
        );
        assert_eq!(first.checksum, content_hash(PDF));
        assert_eq!(first.byte_size, PDF.len() as u64);
        assert_eq!(std::fs::read(&first.storage_path).unwrap(), PDF);

        let second = store.fetch(&c).await.unwrap();
        assert_eq!(second.storage_path, first.storage_path);
        assert_eq!(second.checksum, first.checksum);
        assert_eq!(store.network_fetches(), 1);

        let manifest = store.load_manifest(&c).await.unwrap().unwrap();
        assert_eq!(manifest.artifact, first);
        assert!(manifest.enrichment.is_none());
    }

    #[tokio::test]
    async fn test_no_partial_files_left_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let c = candidate(&server, "2401.2");
        store.fetch(&c).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(store.paper_dir(&c))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["document.pdf", "manifest.json"]);
    }

    #[tokio::test]
    async fn test_stalled_download_timeout_removes_part_file() {
        // Sends headers and a first chunk, then stalls before the declared length.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                    let head = "HTTP/1.1 200 OK\r\ncontent-type: application/pdf\r\ncontent-length: 4096\r\n\r\n";
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(b"%PDF-1.7 partial").await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(
            dir.path(),
            reqwest::Client::new(),
            RetryPolicy::new(2, Duration::from_millis(1)).with_jitter_ratio(0.0),
            Duration::from_millis(300),
        );
        let c = candidate_at(&format!("http://{addr}"), "stall");

        assert!(store.fetch(&c).await.is_err());
        assert_eq!(store.network_fetches(), 2);
        let leftovers: Vec<_> = std::fs::read_dir(store.paper_dir(&c)).unwrap().collect();
        assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    }

    #[test]
    fn test_dropped_temp_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let paper_dir = dir.path().join("x");
        std::fs::create_dir_all(&paper_dir).unwrap();
        let (_, temp_path) = temp_sibling(&paper_dir, defaults::DOCUMENT_FILE, ".part").unwrap();
        assert_eq!(std::fs::read_dir(&paper_dir).unwrap().count(), 1);
        drop(temp_path);
        assert_eq!(std::fs::read_dir(&paper_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_permanent_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let err = store.fetch(&candidate(&server, "missing")).await.unwrap_err();
        assert!(matches!(err, Error::PermanentInput(_)));
        assert_eq!(store.network_fetches(), 1);
    }

    #[tokio::test]
    async fn test_server_error_retried_up_to_max() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let err = store.fetch(&candidate(&server, "flaky")).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(!store.document_path(&candidate(&server, "flaky")).exists());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let c = candidate(&server, "2401.3");
        let artifact = store.fetch(&c).await.unwrap();
        std::fs::write(&artifact.storage_path, b"garbage").unwrap();

        let again = store.fetch(&c).await.unwrap();
        assert_eq!(again.checksum, content_hash(PDF));
        assert_eq!(store.network_fetches(), 2);
    }

    #[tokio::test]
    async fn test_record_enrichment_keeps_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PDF))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let c = candidate(&server, "2401.4");
        let artifact = store.fetch(&c).await.unwrap();
        let enrichment = EnrichmentResult {
            paper_key: c.paper_key(),
            provider: "mock:deterministic".into(),
            summary: "s".into(),
            key_points: vec![],
            key_concepts: vec!["LoRA".into()],
            entities: vec![],
            relation_triples: vec![],
            tags: vec![],
            chapters: vec![],
            generated_at: Utc::now(),
        };
        store.record_enrichment(&c, &artifact, &enrichment).await.unwrap();

        let manifest = store.load_manifest(&c).await.unwrap().unwrap();
        assert_eq!(manifest.artifact, artifact);
        assert_eq!(manifest.enrichment.unwrap().key_concepts, vec!["LoRA"]);
        // Cache still valid after the manifest rewrite.
        store.fetch(&c).await.unwrap();
        assert_eq!(store.network_fetches(), 1);
    }
}

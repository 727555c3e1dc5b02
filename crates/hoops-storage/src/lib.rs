//! Staging snapshot storage, run markers and HTTP fetch utilities.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "hoops-storage";

pub const SNAPSHOT_PREFIX: &str = "extract_";
pub const MANIFEST_FILE: &str = "_MANIFEST.json";
pub const VALIDATION_FILE: &str = "_VALIDATION.json";

/// File-name timestamp shared by snapshots, markers and timestamped outputs.
pub fn file_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub source_url: String,
    pub extracted_at: DateTime<Local>,
    pub file_count: usize,
    pub files: Vec<ManifestFile>,
}

/// Per-file validation result; `valid == false` carries the error instead of counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileValidation {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            rows: None,
            columns: None,
            column_names: Vec::new(),
            error: Some(error.into()),
        }
    }
}

pub type ValidationSummary = BTreeMap<String, FileValidation>;

/// Read column names and the full row count of a CSV file.
pub fn validate_csv(path: &Path) -> FileValidation {
    let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(err) => return FileValidation::failed(err.to_string()),
    };
    let column_names = match reader.headers() {
        Ok(headers) => headers.iter().map(|h| h.trim().to_string()).collect::<Vec<_>>(),
        Err(err) => return FileValidation::failed(err.to_string()),
    };
    let mut rows = 0usize;
    for record in reader.records() {
        if let Err(err) = record {
            return FileValidation::failed(err.to_string());
        }
        rows += 1;
    }
    FileValidation {
        valid: true,
        rows: Some(rows),
        columns: Some(column_names.len()),
        column_names,
        error: None,
    }
}

/// One copied file inside a snapshot.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
    pub byte_size: u64,
    pub sha256: String,
}

/// Root directory holding immutable, timestamp-named extraction snapshots.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_dir_name(at: DateTime<Local>) -> String {
        format!("{SNAPSHOT_PREFIX}{}", file_stamp(at))
    }

    /// Create a fresh snapshot directory. A name collision within the same
    /// second gets a numeric suffix so an existing snapshot is never reused.
    pub async fn create_snapshot(&self, at: DateTime<Local>) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating staging root {}", self.root.display()))?;

        let base = Self::snapshot_dir_name(at);
        let mut candidate = self.root.join(&base);
        let mut suffix = 1u32;
        loop {
            match fs::create_dir(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    candidate = self.root.join(format!("{base}_{suffix}"));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("creating snapshot {}", candidate.display()))
                }
            }
        }
    }

    /// Copy files flat into the snapshot. Same-named sources from different
    /// directories are kept apart as `name_2.csv`, `name_3.csv`.
    pub async fn copy_into_snapshot(
        &self,
        snapshot: &Path,
        sources: &[PathBuf],
    ) -> anyhow::Result<Vec<StagedFile>> {
        let mut staged = Vec::with_capacity(sources.len());
        let mut taken = HashSet::new();
        for source in sources {
            let original = source
                .file_name()
                .with_context(|| format!("source path {} has no file name", source.display()))?
                .to_string_lossy()
                .to_string();
            let name = unique_file_name(&original, |candidate| {
                taken.contains(candidate) || snapshot.join(candidate).exists()
            });
            if name != original {
                tracing::warn!(from = %source.display(), %name, "file name already staged; renamed");
            }
            taken.insert(name.clone());
            let bytes = fs::read(source)
                .await
                .with_context(|| format!("reading {}", source.display()))?;
            let dest = snapshot.join(&name);
            write_atomic(&dest, &bytes).await?;
            tracing::info!(from = %source.display(), to = %dest.display(), "copied into snapshot");
            staged.push(StagedFile {
                name,
                path: dest,
                byte_size: bytes.len() as u64,
                sha256: Self::sha256_hex(&bytes),
            });
        }
        Ok(staged)
    }

    pub async fn write_manifest(
        &self,
        snapshot: &Path,
        source_url: &str,
        extracted_at: DateTime<Local>,
        files: &[StagedFile],
    ) -> anyhow::Result<SnapshotManifest> {
        let manifest = SnapshotManifest {
            source_url: source_url.to_string(),
            extracted_at,
            file_count: files.len(),
            files: files
                .iter()
                .map(|f| ManifestFile {
                    name: f.name.clone(),
                    bytes: f.byte_size,
                    sha256: f.sha256.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        write_atomic(&snapshot.join(MANIFEST_FILE), &bytes).await?;
        Ok(manifest)
    }

    /// Validate every CSV in the snapshot and persist the summary next to it.
    pub async fn validate_snapshot(&self, snapshot: &Path) -> anyhow::Result<ValidationSummary> {
        let mut summary = ValidationSummary::new();
        for path in csv_files_in(snapshot)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let result = validate_csv(&path);
            match (&result.rows, &result.columns, &result.error) {
                (Some(rows), Some(columns), _) => {
                    tracing::info!(file = %name, rows, columns, "validated staged file")
                }
                (_, _, Some(error)) => tracing::error!(file = %name, %error, "staged file failed validation"),
                _ => {}
            }
            summary.insert(name, result);
        }
        let bytes = serde_json::to_vec_pretty(&summary).context("serializing validation summary")?;
        write_atomic(&snapshot.join(VALIDATION_FILE), &bytes).await?;
        Ok(summary)
    }

    /// Snapshot directories ordered oldest to newest.
    pub fn list_snapshots(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(SNAPSHOT_PREFIX))
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        dirs.sort();
        Ok(dirs)
    }

    pub fn latest_snapshot(&self) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.list_snapshots()?.pop())
    }
}

fn unique_file_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (2u32..)
        .map(|n| match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Write bytes through a temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// CSV files directly inside `dir`, sorted by name.
pub fn csv_files_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_csv_extension(path))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn has_csv_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// Recursively find files under `root` whose name matches a glob `pattern`.
pub fn find_data_files(root: &Path, pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
    let pattern =
        glob::Pattern::new(pattern).with_context(|| format!("invalid file pattern {pattern}"))?;
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if pattern.matches(&entry.file_name().to_string_lossy()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

pub fn name_contains_keyword(path: &Path, keyword: &str) -> bool {
    path.file_name()
        .map(|n| {
            n.to_string_lossy()
                .to_ascii_lowercase()
                .contains(&keyword.to_ascii_lowercase())
        })
        .unwrap_or(false)
}

/// First file whose name contains `keyword`, else the first file.
pub fn select_primary<'a>(files: &'a [PathBuf], keyword: &str) -> Option<&'a PathBuf> {
    files
        .iter()
        .find(|f| name_contains_keyword(f, keyword))
        .or_else(|| files.first())
}

/// Write an audit-trail marker file `<prefix>_<stamp>.txt` into `dir`.
pub async fn write_run_marker(
    dir: &Path,
    prefix: &str,
    at: DateTime<Local>,
    lines: &[String],
) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("{prefix}_{}.txt", file_stamp(at)));
    let mut body = lines.join("\n");
    body.push('\n');
    write_atomic(&path, body.as_bytes()).await?;
    Ok(path)
}

/// Statuses worth another download attempt.
pub fn transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body()
}

/// Retry schedule of the dataset download: `attempts` tries in total, with the
/// pause between them doubling from `first_pause` up to `longest_pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRetry {
    pub attempts: u32,
    pub first_pause: Duration,
    pub longest_pause: Duration,
}

impl Default for DownloadRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_pause: Duration::from_millis(500),
            longest_pause: Duration::from_secs(8),
        }
    }
}

impl DownloadRetry {
    /// Pauses taken between consecutive attempts, in order.
    pub fn pauses(&self) -> impl Iterator<Item = Duration> {
        let longest = self.longest_pause;
        std::iter::successors(Some(self.first_pause.min(longest)), move |pause| {
            Some(pause.saturating_mul(2).min(longest))
        })
        .take(self.attempts.saturating_sub(1) as usize)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: DownloadRetry,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("hoops-etl/{}", env!("CARGO_PKG_VERSION"))),
            retry: DownloadRetry::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: DownloadRetry,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

enum Attempt {
    Done(FetchedResponse),
    Transient(FetchError),
    Fatal(FetchError),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retry(url)
            .instrument(info_span!("http_fetch", %run_id, url))
            .await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut pauses = self.retry.pauses();
        let mut attempt = 1u32;
        loop {
            let err = match self.try_once(url).await {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Transient(err) => err,
            };
            let Some(pause) = pauses.next() else {
                return Err(err);
            };
            tracing::warn!(
                attempt,
                error = %err,
                pause_ms = pause.as_millis() as u64,
                "download attempt failed; retrying"
            );
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }

    async fn try_once(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) if transient_error(&err) => return Attempt::Transient(err.into()),
            Err(err) => return Attempt::Fatal(err.into()),
        };
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return if transient_status(status) {
                Attempt::Transient(err)
            } else {
                Attempt::Fatal(err)
            };
        }
        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            }),
            Err(err) => Attempt::Transient(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2025, 3, 13, h, m, s)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn hashing_is_stable() {
        let hash = StagingStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshots_are_never_reused() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path().join("staging"));

        let first = store.create_snapshot(at(2, 0, 0)).await.expect("first");
        let second = store.create_snapshot(at(2, 0, 0)).await.expect("second");
        assert_ne!(first, second);
        assert!(first.ends_with("extract_20250313_020000"));
        assert!(second.ends_with("extract_20250313_020000_2"));
        assert_eq!(store.latest_snapshot().expect("latest"), Some(second));
    }

    #[tokio::test]
    async fn latest_snapshot_orders_by_name() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let newer = store.create_snapshot(at(3, 0, 0)).await.expect("newer");
        let _older = store.create_snapshot(at(1, 0, 0)).await.expect("older");
        std::fs::create_dir(dir.path().join("not_a_snapshot")).expect("mkdir");

        assert_eq!(store.list_snapshots().expect("list").len(), 2);
        assert_eq!(store.latest_snapshot().expect("latest"), Some(newer));
    }

    #[test]
    fn missing_staging_root_has_no_snapshots() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path().join("absent"));
        assert_eq!(store.latest_snapshot().expect("latest"), None);
    }

    #[tokio::test]
    async fn manifest_and_validation_describe_snapshot() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        std::fs::create_dir(&src).expect("mkdir");
        std::fs::write(src.join("play_off_totals.csv"), "A,B\n1,2\n3,4\n").expect("write");
        std::fs::write(src.join("broken.csv"), b"A,B\n\xff\xfe,1\n").expect("write");

        let store = StagingStore::new(dir.path().join("staging"));
        let snapshot = store.create_snapshot(at(2, 0, 0)).await.expect("snapshot");
        let files = store
            .copy_into_snapshot(
                &snapshot,
                &[src.join("broken.csv"), src.join("play_off_totals.csv")],
            )
            .await
            .expect("copy");
        let manifest = store
            .write_manifest(&snapshot, "https://example.test/repo", at(2, 0, 0), &files)
            .await
            .expect("manifest");
        assert_eq!(manifest.file_count, 2);
        assert_eq!(manifest.files[1].name, "play_off_totals.csv");
        assert_eq!(manifest.files[1].bytes, 12);

        let summary = store.validate_snapshot(&snapshot).await.expect("validate");
        let good = &summary["play_off_totals.csv"];
        assert!(good.valid);
        assert_eq!(good.rows, Some(2));
        assert_eq!(good.columns, Some(2));
        assert!(!summary["broken.csv"].valid);
        assert!(summary["broken.csv"].error.is_some());

        let persisted: ValidationSummary = serde_json::from_slice(
            &std::fs::read(snapshot.join(VALIDATION_FILE)).expect("read validation"),
        )
        .expect("parse validation");
        assert_eq!(persisted, summary);
        assert!(snapshot.join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn same_named_sources_are_staged_side_by_side() {
        let dir = tempdir().expect("tempdir");
        let mut sources = Vec::new();
        for (sub, body) in [("2010s", "A\n1\n"), ("2020s", "A\n2\n3\n")] {
            let folder = dir.path().join("clone").join(sub);
            std::fs::create_dir_all(&folder).expect("mkdir");
            std::fs::write(folder.join("totals.csv"), body).expect("write");
            sources.push(folder.join("totals.csv"));
        }

        let store = StagingStore::new(dir.path().join("staging"));
        let snapshot = store.create_snapshot(at(2, 0, 0)).await.expect("snapshot");
        let files = store.copy_into_snapshot(&snapshot, &sources).await.expect("copy");

        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["totals.csv", "totals_2.csv"]);
        assert_eq!(std::fs::read_to_string(snapshot.join("totals.csv")).expect("first"), "A\n1\n");
        assert_eq!(
            std::fs::read_to_string(snapshot.join("totals_2.csv")).expect("second"),
            "A\n2\n3\n"
        );
        assert_ne!(files[0].sha256, files[1].sha256);
    }

    #[test]
    fn file_search_matches_glob_and_prefers_keyword() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("data").join("nested");
        std::fs::create_dir_all(&nested).expect("mkdir");
        for name in ["a_regular_season.csv", "b_totals.csv", "notes.txt"] {
            std::fs::write(dir.path().join("data").join(name), "x\n").expect("write");
        }
        std::fs::write(nested.join("play_off_totals_2010_2024.csv"), "x\n").expect("write");

        let found = find_data_files(dir.path(), "*.csv").expect("search");
        assert_eq!(found.len(), 3);
        let primary = select_primary(&found, "play_off").expect("primary");
        assert!(primary.ends_with("play_off_totals_2010_2024.csv"));

        let without_keyword = select_primary(&found, "finals").expect("fallback");
        assert_eq!(without_keyword, &found[0]);
        assert!(select_primary(&[], "play_off").is_none());
    }

    #[tokio::test]
    async fn run_marker_is_timestamped_text() {
        let dir = tempdir().expect("tempdir");
        let path = write_run_marker(
            dir.path(),
            "etl_success",
            at(2, 5, 9),
            &["input: data.csv".to_string(), "rows: 3".to_string()],
        )
        .await
        .expect("marker");
        assert!(path.ends_with("etl_success_20250313_020509.txt"));
        assert_eq!(
            std::fs::read_to_string(path).expect("read"),
            "input: data.csv\nrows: 3\n"
        );
    }

    #[test]
    fn download_pauses_double_until_the_ceiling() {
        let retry = DownloadRetry {
            attempts: 5,
            first_pause: Duration::from_secs(1),
            longest_pause: Duration::from_secs(3),
        };
        assert_eq!(
            retry.pauses().collect::<Vec<_>>(),
            [1, 2, 3, 3].map(Duration::from_secs)
        );

        let single = DownloadRetry {
            attempts: 1,
            ..retry
        };
        assert_eq!(single.pauses().count(), 0);
        assert_eq!(DownloadRetry { attempts: 0, ..retry }.pauses().count(), 0);
        assert_eq!(DownloadRetry::default().pauses().count(), 3);
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for status in [
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(transient_status(status), "{status}");
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN, StatusCode::MOVED_PERMANENTLY] {
            assert!(!transient_status(status), "{status}");
        }
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_every_attempt() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .expect("free port")
            .port();
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
            retry: DownloadRetry {
                attempts: 2,
                first_pause: Duration::ZERO,
                longest_pause: Duration::ZERO,
            },
        })
        .expect("client");

        let err = fetcher
            .fetch_bytes(Uuid::nil(), &format!("http://127.0.0.1:{port}/playoffs.csv"))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, FetchError::Request(_)));
    }
}

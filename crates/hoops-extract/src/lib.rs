//! Repository-to-staging extraction.
//!
//! A run downloads the known dataset file (falling back to a shallow clone of
//! the source repository), copies the located files into a fresh staging
//! snapshot with a manifest, validates them, and promotes the playoffs file to
//! the canonical path downstream stages read by default.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use hoops_core::Settings;
use hoops_storage::{
    find_data_files, name_contains_keyword, write_atomic, HttpClientConfig, HttpFetcher,
    SnapshotManifest, StagingStore, ValidationSummary,
};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoops-extract";

pub const PROCESSED_COPY_NAME: &str = "playoffs_detailed_processed.csv";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },
    #[error("cloning {repo} failed: {message}")]
    Clone { repo: String, message: String },
    #[error("no files matching {pattern} under {root}")]
    NoDataFiles { pattern: String, root: PathBuf },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Transport used to pull the dataset out of its source repository.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Download a single file to `dest`, returning its size in bytes.
    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, ExtractError>;

    /// Clone `repo_url` into `dest`, which must not exist yet.
    async fn clone_repository(&self, repo_url: &str, dest: &Path) -> Result<(), ExtractError>;
}

/// Rewrite a GitHub web URL (`.../blob/<branch>/<file>`) to its raw-content URL.
pub fn raw_file_url(file_url: &str) -> String {
    file_url
        .replacen("://github.com/", "://raw.githubusercontent.com/", 1)
        .replacen("/blob/", "/", 1)
}

/// HTTP download plus `git clone` against the real source.
#[derive(Debug)]
pub struct RemoteDatasetSource {
    run_id: Uuid,
    http: HttpFetcher,
}

impl RemoteDatasetSource {
    pub fn new(http_config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            run_id: Uuid::new_v4(),
            http: HttpFetcher::new(http_config)?,
        })
    }
}

#[async_trait]
impl DatasetSource for RemoteDatasetSource {
    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, ExtractError> {
        let raw_url = raw_file_url(url);
        info!(url = %raw_url, "downloading dataset file");
        let fetched = self
            .http
            .fetch_bytes(self.run_id, &raw_url)
            .await
            .map_err(|err| ExtractError::Download {
                url: raw_url.clone(),
                message: err.to_string(),
            })?;
        write_atomic(dest, &fetched.body).await?;
        Ok(fetched.body.len() as u64)
    }

    async fn clone_repository(&self, repo_url: &str, dest: &Path) -> Result<(), ExtractError> {
        info!(repo = repo_url, dest = %dest.display(), "cloning source repository");
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg(repo_url)
            .arg(dest)
            .output()
            .await
            .map_err(|err| ExtractError::Clone {
                repo: repo_url.to_string(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExtractError::Clone {
                repo: repo_url.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub repo_url: String,
    pub file_url: String,
    pub file_name: String,
    pub staging_dir: PathBuf,
    pub canonical_file: PathBuf,
    pub processed_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub pattern: String,
    pub keyword: String,
}

impl ExtractorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            repo_url: settings.source.repo_url.clone(),
            file_url: settings.source.file_url(),
            file_name: settings.source.file_name.clone(),
            staging_dir: settings.paths.staging_dir.clone(),
            canonical_file: settings.paths.canonical_file.clone(),
            processed_dir: settings.paths.processed_dir.clone(),
            temp_dir: settings.paths.temp_dir.clone(),
            pattern: settings.source.pattern.clone(),
            keyword: settings.source.keyword.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    DirectDownload,
    RepositoryClone,
}

#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub mode: ExtractionMode,
    pub snapshot_dir: PathBuf,
    pub manifest: SnapshotManifest,
    pub validation: ValidationSummary,
    /// `None` when no staged file carried the domain keyword.
    pub promoted_from: Option<PathBuf>,
    pub processed_copy: Option<PathBuf>,
}

pub struct StagingExtractor {
    config: ExtractorConfig,
    source: Box<dyn DatasetSource>,
    store: StagingStore,
}

impl StagingExtractor {
    pub fn new(config: ExtractorConfig, source: Box<dyn DatasetSource>) -> Self {
        let store = StagingStore::new(config.staging_dir.clone());
        Self {
            config,
            source,
            store,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Run all extraction steps. The temporary directory is removed on every
    /// exit path.
    pub async fn run(&self) -> anyhow::Result<ExtractionReport> {
        let run_id = Uuid::new_v4();
        info!(%run_id, repo = %self.config.repo_url, "starting repository extraction");
        self.cleanup().await;

        let result = self.run_steps(run_id).await;
        self.cleanup().await;

        match &result {
            Ok(report) => info!(
                %run_id,
                snapshot = %report.snapshot_dir.display(),
                files = report.manifest.file_count,
                "extraction completed"
            ),
            Err(err) => error!(%run_id, error = %format!("{err:#}"), "extraction failed"),
        }
        result
    }

    async fn run_steps(&self, run_id: Uuid) -> anyhow::Result<ExtractionReport> {
        let started_at = Local::now();
        let (mode, located) = self.locate_files().await?;

        let snapshot_dir = self.store.create_snapshot(started_at).await?;
        let staged = self.store.copy_into_snapshot(&snapshot_dir, &located).await?;
        let manifest = self
            .store
            .write_manifest(&snapshot_dir, &self.config.repo_url, started_at, &staged)
            .await?;

        let validation = self.store.validate_snapshot(&snapshot_dir).await?;
        let invalid = validation.values().filter(|v| !v.valid).count();
        if invalid > 0 {
            warn!(invalid, "some staged files failed validation");
        }

        let (promoted_from, processed_copy) = self.promote(&snapshot_dir).await?;

        Ok(ExtractionReport {
            run_id,
            started_at,
            finished_at: Local::now(),
            mode,
            snapshot_dir,
            manifest,
            validation,
            promoted_from,
            processed_copy,
        })
    }

    async fn locate_files(&self) -> Result<(ExtractionMode, Vec<PathBuf>), ExtractError> {
        let download_path = self.config.temp_dir.join(&self.config.file_name);
        match self
            .source
            .download_file(&self.config.file_url, &download_path)
            .await
        {
            Ok(bytes) => {
                info!(path = %download_path.display(), bytes, "dataset file downloaded");
                return Ok((ExtractionMode::DirectDownload, vec![download_path]));
            }
            Err(err) => warn!(error = %err, "direct download failed; falling back to repository clone"),
        }

        self.cleanup().await;
        self.source
            .clone_repository(&self.config.repo_url, &self.config.temp_dir)
            .await?;

        let files = find_data_files(&self.config.temp_dir, &self.config.pattern)?;
        if files.is_empty() {
            return Err(ExtractError::NoDataFiles {
                pattern: self.config.pattern.clone(),
                root: self.config.temp_dir.clone(),
            });
        }
        info!(count = files.len(), "data files found in cloned repository");
        Ok((ExtractionMode::RepositoryClone, files))
    }

    /// Copy the keyword file of the snapshot to the canonical path and emit the
    /// processed copy. Among several keyword files the configured dataset file
    /// name wins. A missing keyword file only warns.
    async fn promote(
        &self,
        snapshot_dir: &Path,
    ) -> anyhow::Result<(Option<PathBuf>, Option<PathBuf>)> {
        let keyword_files = hoops_storage::csv_files_in(snapshot_dir)?
            .into_iter()
            .filter(|f| name_contains_keyword(f, &self.config.keyword))
            .collect::<Vec<_>>();
        let Some(primary) = keyword_files
            .iter()
            .find(|f| {
                f.file_name()
                    .is_some_and(|n| n.to_string_lossy() == self.config.file_name)
            })
            .or_else(|| keyword_files.first())
            .cloned()
        else {
            warn!(
                keyword = %self.config.keyword,
                snapshot = %snapshot_dir.display(),
                "no playoffs file found in snapshot; canonical file left unchanged"
            );
            return Ok((None, None));
        };

        let bytes = fs::read(&primary)
            .await
            .with_context(|| format!("reading {}", primary.display()))?;
        write_atomic(&self.config.canonical_file, &bytes).await?;
        info!(
            from = %primary.display(),
            to = %self.config.canonical_file.display(),
            "canonical file promoted"
        );

        let processed = self.config.processed_dir.join(PROCESSED_COPY_NAME);
        let processed_copy = match write_atomic(&processed, &bytes).await {
            Ok(()) => {
                info!(path = %processed.display(), "processed copy written");
                Some(processed)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "writing processed copy failed");
                None
            }
        };
        Ok((Some(primary), processed_copy))
    }

    /// Remove the temporary directory if it exists.
    pub async fn cleanup(&self) {
        let dir = &self.config.temp_dir;
        if !dir.exists() {
            return;
        }
        match fs::remove_dir_all(dir).await {
            Ok(()) => info!(dir = %dir.display(), "temporary directory removed"),
            Err(err) => error!(dir = %dir.display(), error = %err, "cleaning temporary directory failed"),
        }
    }
}

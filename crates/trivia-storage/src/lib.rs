//! Curated YAML store, speaker photo storage and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, Instrument};
use trivia_core::{
    ChangeSet, Company, EntityKind, Event, EventType, Identified, Organizer, Place, SourceData,
    Speaker, Talk,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trivia-storage";

/// Borrowed change-set for one entity kind.
#[derive(Debug, Clone, Copy)]
pub enum EntityChangeSet<'a> {
    EventTypes(&'a ChangeSet<EventType>),
    Events(&'a ChangeSet<Event>),
    Places(&'a ChangeSet<Place>),
    Talks(&'a ChangeSet<Talk>),
    Speakers(&'a ChangeSet<Speaker>),
    Companies(&'a ChangeSet<Company>),
}

impl EntityChangeSet<'_> {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityChangeSet::EventTypes(_) => EntityKind::EventType,
            EntityChangeSet::Events(_) => EntityKind::Event,
            EntityChangeSet::Places(_) => EntityKind::Place,
            EntityChangeSet::Talks(_) => EntityKind::Talk,
            EntityChangeSet::Speakers(_) => EntityKind::Speaker,
            EntityChangeSet::Companies(_) => EntityKind::Company,
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        fn counts<T>(cs: &ChangeSet<T>) -> (usize, usize, usize) {
            (cs.to_create.len(), cs.to_update.len(), cs.to_delete.len())
        }
        match self {
            EntityChangeSet::EventTypes(cs) => counts(cs),
            EntityChangeSet::Events(cs) => counts(cs),
            EntityChangeSet::Places(cs) => counts(cs),
            EntityChangeSet::Talks(cs) => counts(cs),
            EntityChangeSet::Speakers(cs) => counts(cs),
            EntityChangeSet::Companies(cs) => counts(cs),
        }
    }
}

pub trait LoadCurated: Send + Sync {
    fn load_curated(&self) -> anyhow::Result<SourceData>;
}

pub trait SaveChangeSet: Send + Sync {
    fn save_change_set(&self, change_set: EntityChangeSet<'_>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DownloadImage: Send + Sync {
    async fn download_image(&self, url: &str, file_name: &str) -> anyhow::Result<StoredPhoto>;
}

/// Remote-content check used when a fresh photo timestamp is missing.
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn differs(&self, url: &str, file_name: &str) -> anyhow::Result<bool>;
}

/// Curated dataset as one YAML list per entity kind, change-sets written beside it.
#[derive(Debug, Clone)]
pub struct YamlStore {
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl YamlStore {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn read_kind<T: DeserializeOwned>(&self, kind: EntityKind) -> anyhow::Result<Vec<T>> {
        let path = self.data_dir.join(format!("{}.yml", kind.file_stem()));
        if !path.exists() {
            debug!(path = %path.display(), "curated file missing; treating as empty");
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn write_part<T: Serialize>(&self, kind: EntityKind, suffix: &str, items: &[T]) -> anyhow::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let path = self
            .output_dir
            .join(format!("{}-to-{}.yml", kind.file_stem(), suffix));
        let text = serde_yaml::to_string(items)
            .with_context(|| format!("serializing {} {}", kind, suffix))?;
        std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), count = items.len(), "wrote change-set file");
        Ok(())
    }

    fn write_change_set<T: Serialize + Identified>(&self, change_set: &ChangeSet<T>) -> anyhow::Result<()> {
        self.write_part(T::KIND, "append", &change_set.to_create)?;
        self.write_part(T::KIND, "update", &change_set.to_update)?;
        self.write_part(T::KIND, "delete", &change_set.to_delete)?;
        Ok(())
    }
}

impl LoadCurated for YamlStore {
    fn load_curated(&self) -> anyhow::Result<SourceData> {
        let data = SourceData {
            organizers: self.read_kind::<Organizer>(EntityKind::Organizer)?,
            event_types: self.read_kind(EntityKind::EventType)?,
            events: self.read_kind(EntityKind::Event)?,
            places: self.read_kind(EntityKind::Place)?,
            talks: self.read_kind(EntityKind::Talk)?,
            speakers: self.read_kind(EntityKind::Speaker)?,
            companies: self.read_kind(EntityKind::Company)?,
        };
        info!(
            data_dir = %self.data_dir.display(),
            event_types = data.event_types.len(),
            events = data.events.len(),
            talks = data.talks.len(),
            speakers = data.speakers.len(),
            companies = data.companies.len(),
            "loaded curated store"
        );
        Ok(data)
    }
}

impl SaveChangeSet for YamlStore {
    fn save_change_set(&self, change_set: EntityChangeSet<'_>) -> anyhow::Result<()> {
        match change_set {
            EntityChangeSet::EventTypes(cs) => self.write_change_set(cs),
            EntityChangeSet::Events(cs) => self.write_change_set(cs),
            EntityChangeSet::Places(cs) => self.write_change_set(cs),
            EntityChangeSet::Talks(cs) => self.write_change_set(cs),
            EntityChangeSet::Speakers(cs) => self.write_change_set(cs),
            EntityChangeSet::Companies(cs) => self.write_change_set(cs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredPhoto {
    pub file_name: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Speaker photo directory with hash comparison and atomic replacement.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    root: PathBuf,
}

impl PhotoStore {
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

    pub async fn local_hash(&self, file_name: &str) -> anyhow::Result<Option<String>> {
        let path = self.root.join(file_name);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking photo path {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading photo {}", path.display()))?;
        Ok(Some(Self::sha256_hex(&bytes)))
    }

    /// Replace `file_name` with `bytes` through a temp file and rename; identical content is left alone.
    pub async fn store_photo(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredPhoto> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(file_name);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating photo directory {}", self.root.display()))?;

        if self.local_hash(file_name).await?.as_deref() == Some(content_hash.as_str()) {
            return Ok(StoredPhoto {
                file_name: file_name.to_string(),
                content_hash,
                absolute_path,
                byte_size: bytes.len(),
                unchanged: true,
            });
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp photo file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp photo file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp photo file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp photo {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredPhoto {
            file_name: file_name.to_string(),
            content_hash,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher closed")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Downloads speaker photos over HTTP into a [`PhotoStore`].
#[derive(Debug, Clone)]
pub struct PhotoDownloader {
    http: Arc<HttpFetcher>,
    store: PhotoStore,
}

impl PhotoDownloader {
    pub fn new(http: Arc<HttpFetcher>, store: PhotoStore) -> Self {
        Self { http, store }
    }
}

#[async_trait]
impl DownloadImage for PhotoDownloader {
    async fn download_image(&self, url: &str, file_name: &str) -> anyhow::Result<StoredPhoto> {
        let response = self
            .http
            .fetch_bytes(url)
            .await
            .with_context(|| format!("downloading photo {url}"))?;
        let stored = self.store.store_photo(file_name, &response.body).await?;
        info!(url, file_name, unchanged = stored.unchanged, "downloaded speaker photo");
        Ok(stored)
    }
}

#[async_trait]
impl ImageProbe for PhotoDownloader {
    async fn differs(&self, url: &str, file_name: &str) -> anyhow::Result<bool> {
        let Some(local) = self.store.local_hash(file_name).await? else {
            return Ok(true);
        };
        let response = self
            .http
            .fetch_bytes(url)
            .await
            .with_context(|| format!("probing photo {url}"))?;
        Ok(PhotoStore::sha256_hex(&response.body) != local)
    }
}

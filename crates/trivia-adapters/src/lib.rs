//! CMS source adapter contracts + snapshot-bundle adapters.
//!
//! Adapters hand the sync engine entities already mapped into the common shape, linked by
//! temporary (negative) ids. Payload mapping for each CMS lives upstream of these bundles.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use trivia_core::{normalize_locale_items, Conference, EventType, SourceSnapshot};
use trivia_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trivia-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmsKind {
    Contentful,
    JrgCms,
}

impl CmsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CmsKind::Contentful => "contentful",
            CmsKind::JrgCms => "jrgcms",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "contentful" => Some(CmsKind::Contentful),
            "jrgcms" | "jrg-cms" => Some(CmsKind::JrgCms),
            _ => None,
        }
    }
}

impl fmt::Display for CmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// The conference edition to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTarget {
    pub conference: Conference,
    pub start_date: NaiveDate,
}

impl EventTarget {
    fn relative_path(&self, cms: CmsKind) -> PathBuf {
        PathBuf::from(cms.as_str())
            .join(self.conference.as_str())
            .join(format!("{}.json", self.start_date.format("%Y-%m-%d")))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn cms(&self) -> CmsKind;

    async fn fetch_event_types(&self, ctx: &AdapterContext) -> Result<Vec<EventType>, AdapterError>;

    async fn fetch_snapshot(
        &self,
        ctx: &AdapterContext,
        target: &EventTarget,
    ) -> Result<SourceSnapshot, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub cms: CmsKind,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub snapshot: SourceSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypesBundle {
    pub cms: CmsKind,
    pub fetched_at: DateTime<Utc>,
    pub event_types: Vec<EventType>,
}

pub fn load_snapshot_bundle(path: impl AsRef<Path>) -> Result<SnapshotBundle> {
    read_json_file(path)
}

pub fn load_event_types_bundle(path: impl AsRef<Path>) -> Result<EventTypesBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn check_cms(expected: CmsKind, actual: CmsKind) -> Result<(), AdapterError> {
    if expected != actual {
        return Err(AdapterError::Message(format!(
            "bundle cms={actual} does not match adapter cms={expected}"
        )));
    }
    Ok(())
}

/// Check the bundle belongs to `target` and normalize localized text throughout.
pub fn prepare_snapshot(
    cms: CmsKind,
    bundle: SnapshotBundle,
    target: &EventTarget,
) -> Result<SourceSnapshot, AdapterError> {
    check_cms(cms, bundle.cms)?;
    let mut snapshot = bundle.snapshot;
    if snapshot.conference != target.conference || snapshot.start_date != target.start_date {
        return Err(AdapterError::Message(format!(
            "snapshot is for {} {} but {} {} was requested",
            snapshot.conference, snapshot.start_date, target.conference, target.start_date
        )));
    }

    snapshot.event.name = normalize_locale_items(std::mem::take(&mut snapshot.event.name));
    for place in &mut snapshot.places {
        place.city = normalize_locale_items(std::mem::take(&mut place.city));
        place.venue_address = normalize_locale_items(std::mem::take(&mut place.venue_address));
    }
    for talk in &mut snapshot.talks {
        talk.name = normalize_locale_items(std::mem::take(&mut talk.name));
        talk.short_description = normalize_locale_items(std::mem::take(&mut talk.short_description));
        talk.long_description = normalize_locale_items(std::mem::take(&mut talk.long_description));
    }
    for speaker in &mut snapshot.speakers {
        speaker.name = normalize_locale_items(std::mem::take(&mut speaker.name));
        speaker.bio = normalize_locale_items(std::mem::take(&mut speaker.bio));
    }
    for company in &mut snapshot.companies {
        company.name = normalize_locale_items(std::mem::take(&mut company.name));
    }
    Ok(snapshot)
}

/// Reads bundles from `<root>/<cms>/...` on disk.
pub struct SnapshotFileAdapter {
    cms: CmsKind,
    root: PathBuf,
}

impl SnapshotFileAdapter {
    pub fn new(cms: CmsKind, root: impl Into<PathBuf>) -> Self {
        Self {
            cms,
            root: root.into(),
        }
    }

    pub fn snapshot_path(&self, target: &EventTarget) -> PathBuf {
        self.root.join(target.relative_path(self.cms))
    }

    pub fn event_types_path(&self) -> PathBuf {
        self.root.join(self.cms.as_str()).join("event-types.json")
    }
}

#[async_trait]
impl SourceAdapter for SnapshotFileAdapter {
    fn cms(&self) -> CmsKind {
        self.cms
    }

    async fn fetch_event_types(&self, _ctx: &AdapterContext) -> Result<Vec<EventType>, AdapterError> {
        let bundle = load_event_types_bundle(self.event_types_path())?;
        check_cms(self.cms, bundle.cms)?;
        Ok(bundle.event_types)
    }

    async fn fetch_snapshot(
        &self,
        ctx: &AdapterContext,
        target: &EventTarget,
    ) -> Result<SourceSnapshot, AdapterError> {
        let path = self.snapshot_path(target);
        let bundle = load_snapshot_bundle(&path)?;
        info!(run_id = %ctx.run_id, path = %path.display(), "loaded snapshot bundle");
        prepare_snapshot(self.cms, bundle, target)
    }
}

/// Fetches the same bundle shape from `<base_url>/<cms>/...` over HTTP.
pub struct RemoteSnapshotAdapter {
    cms: CmsKind,
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl RemoteSnapshotAdapter {
    pub fn new(cms: CmsKind, base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            cms,
            base_url: base_url.into(),
            http,
        }
    }

    fn url_for(&self, relative: &Path) -> String {
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url.trim_end_matches('/'), relative)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AdapterError> {
        let response = self.http.fetch_bytes(url).await?;
        serde_json::from_slice(&response.body)
            .with_context(|| format!("parsing {url}"))
            .map_err(AdapterError::from)
    }
}

#[async_trait]
impl SourceAdapter for RemoteSnapshotAdapter {
    fn cms(&self) -> CmsKind {
        self.cms
    }

    async fn fetch_event_types(&self, _ctx: &AdapterContext) -> Result<Vec<EventType>, AdapterError> {
        let url = self.url_for(&PathBuf::from(self.cms.as_str()).join("event-types.json"));
        let bundle: EventTypesBundle = self.fetch_json(&url).await?;
        check_cms(self.cms, bundle.cms)?;
        Ok(bundle.event_types)
    }

    async fn fetch_snapshot(
        &self,
        ctx: &AdapterContext,
        target: &EventTarget,
    ) -> Result<SourceSnapshot, AdapterError> {
        let url = self.url_for(&target.relative_path(self.cms));
        let bundle: SnapshotBundle = self.fetch_json(&url).await?;
        info!(run_id = %ctx.run_id, url, "fetched snapshot bundle");
        prepare_snapshot(self.cms, bundle, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trivia_core::{Event, Language, LocaleItem, Speaker};

    fn mk_target() -> EventTarget {
        EventTarget {
            conference: Conference::Joker,
            start_date: NaiveDate::from_ymd_opt(2025, 10, 8).expect("date"),
        }
    }

    fn mk_bundle(cms: CmsKind, target: &EventTarget) -> SnapshotBundle {
        SnapshotBundle {
            cms,
            captured_from_url: None,
            fetched_at: DateTime::parse_from_rfc3339("2025-09-01T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            snapshot: SourceSnapshot {
                conference: target.conference,
                start_date: target.start_date,
                event: Event {
                    id: -1,
                    name: vec![LocaleItem::new(Language::English, "Joker  2025 ")],
                    ..Default::default()
                },
                places: vec![],
                talks: vec![],
                speakers: vec![Speaker {
                    id: -1,
                    name: vec![
                        LocaleItem::new(Language::English, "Jane Doe"),
                        LocaleItem::new(Language::Russian, "Jane Doe"),
                    ],
                    ..Default::default()
                }],
                companies: vec![],
            },
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_adapter_reads_and_normalizes_snapshot() {
        let dir = tempdir().expect("tempdir");
        let target = mk_target();
        let adapter = SnapshotFileAdapter::new(CmsKind::JrgCms, dir.path());
        let path = adapter.snapshot_path(&target);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(
            &path,
            serde_json::to_vec_pretty(&mk_bundle(CmsKind::JrgCms, &target)).expect("json"),
        )
        .expect("write");

        let snapshot = adapter.fetch_snapshot(&ctx(), &target).await.expect("snapshot");
        assert_eq!(
            snapshot.event.name,
            vec![LocaleItem::new(Language::English, "Joker 2025")]
        );
        assert_eq!(
            snapshot.speakers[0].name,
            vec![LocaleItem::new(Language::English, "Jane Doe")]
        );
    }

    #[test]
    fn mismatched_target_is_rejected() {
        let target = mk_target();
        let other = EventTarget {
            conference: Conference::Jpoint,
            ..target
        };
        let err = prepare_snapshot(CmsKind::JrgCms, mk_bundle(CmsKind::JrgCms, &target), &other)
            .expect_err("mismatch");
        assert!(err.to_string().contains("was requested"));
    }

    #[test]
    fn mismatched_cms_is_rejected() {
        let target = mk_target();
        let err = prepare_snapshot(CmsKind::Contentful, mk_bundle(CmsKind::JrgCms, &target), &target)
            .expect_err("mismatch");
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn snapshot_paths_follow_cms_conference_date() {
        let adapter = SnapshotFileAdapter::new(CmsKind::Contentful, "/fixtures");
        assert_eq!(
            adapter.snapshot_path(&mk_target()),
            PathBuf::from("/fixtures/contentful/joker/2025-10-08.json")
        );
        assert_eq!(
            adapter.event_types_path(),
            PathBuf::from("/fixtures/contentful/event-types.json")
        );
    }
}

//! Reconciliation pipeline: fetch a CMS snapshot, fix it up, diff it against the curated
//! store and write change-sets, photos and run reports.

pub mod detect;
pub mod diff;
pub mod error;
pub mod fill;
pub mod fixers;
pub mod index;
pub mod keys;
pub mod matcher;
pub mod rules;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use trivia_adapters::{
    AdapterContext, CmsKind, EventTarget, RemoteSnapshotAdapter, SnapshotFileAdapter, SourceAdapter,
};
use trivia_core::{Conference, SourceData};
use trivia_storage::{
    DownloadImage, HttpClientConfig, HttpFetcher, ImageProbe, LoadCurated, PhotoDownloader,
    PhotoStore, SaveChangeSet, YamlStore,
};
use uuid::Uuid;

pub use diff::{reconcile_snapshot, IdAllocator, RunChanges};
pub use error::ReconcileError;
pub use fixers::{NoopSnapshotFixer, RuleSnapshotFixer, SnapshotFixer};
pub use rules::RuleSet;

pub const CRATE_NAME: &str = "trivia-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Fixture,
    Remote,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub photos_dir: PathBuf,
    pub cms: CmsKind,
    pub source_mode: SourceMode,
    pub source_base_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("TRIVIA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            data_dir: std::env::var("TRIVIA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            output_dir: std::env::var("TRIVIA_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
            photos_dir: std::env::var("TRIVIA_PHOTOS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/images/speakers")),
            cms: std::env::var("TRIVIA_CMS")
                .ok()
                .and_then(|v| CmsKind::parse(&v))
                .unwrap_or(CmsKind::JrgCms),
            source_mode: match std::env::var("TRIVIA_SOURCE_MODE").as_deref() {
                Ok("remote") | Ok("REMOTE") => SourceMode::Remote,
                _ => SourceMode::Fixture,
            },
            source_base_url: std::env::var("TRIVIA_SOURCE_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("TRIVIA_USER_AGENT")
                .unwrap_or_else(|_| "trivia-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("TRIVIA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            dry_run: std::env::var("TRIVIA_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    /// All paths rooted at `root`; used by tests and by `--workspace` style callers.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            output_dir: root.join("output"),
            photos_dir: root.join("data").join("images").join("speakers"),
            workspace_root: root,
            cms: CmsKind::JrgCms,
            source_mode: SourceMode::Fixture,
            source_base_url: None,
            user_agent: "trivia-sync/0.1".to_string(),
            http_timeout_secs: 20,
            dry_run: false,
        }
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    Load,
    EventTypes,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub cms: CmsKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub conference: Option<Conference>,
    pub start_date: Option<NaiveDate>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub photos_scheduled: usize,
    pub photos_downloaded: usize,
    pub photos_failed: usize,
    pub dry_run: bool,
    pub reports_dir: String,
}

/// Entity counts of a curated store that passed validation.
#[derive(Debug, Clone, Serialize)]
pub struct CuratedCounts {
    pub organizers: usize,
    pub event_types: usize,
    pub events: usize,
    pub places: usize,
    pub talks: usize,
    pub speakers: usize,
    pub companies: usize,
}

impl From<&SourceData> for CuratedCounts {
    fn from(data: &SourceData) -> Self {
        Self {
            organizers: data.organizers.len(),
            event_types: data.event_types.len(),
            events: data.events.len(),
            places: data.places.len(),
            talks: data.talks.len(),
            speakers: data.speakers.len(),
            companies: data.companies.len(),
        }
    }
}

/// External collaborators the pipeline talks to.
pub struct Collaborators {
    pub source: Box<dyn SourceAdapter>,
    pub curated: Box<dyn LoadCurated>,
    pub sink: Box<dyn SaveChangeSet>,
    pub images: Box<dyn DownloadImage>,
    pub probe: Box<dyn ImageProbe>,
}

impl Collaborators {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let source: Box<dyn SourceAdapter> = match config.source_mode {
            SourceMode::Fixture => Box::new(SnapshotFileAdapter::new(config.cms, config.fixtures_dir())),
            SourceMode::Remote => {
                let Some(base_url) = config.source_base_url.clone() else {
                    bail!("TRIVIA_SOURCE_BASE_URL is required when TRIVIA_SOURCE_MODE=remote");
                };
                Box::new(RemoteSnapshotAdapter::new(config.cms, base_url, Arc::clone(&http)))
            }
        };
        let store = YamlStore::new(config.data_dir.clone(), config.output_dir.clone());
        let photos = PhotoDownloader::new(http, PhotoStore::new(config.photos_dir.clone()));
        Ok(Self {
            source,
            curated: Box::new(store.clone()),
            sink: Box::new(store),
            images: Box::new(photos.clone()),
            probe: Box::new(photos),
        })
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    rules: RuleSet,
    collaborators: Collaborators,
    fixer: Box<dyn SnapshotFixer>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::with_collaborators(config, collaborators))
    }

    pub fn with_collaborators(config: SyncConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            rules: RuleSet::default(),
            collaborators,
            fixer: Box::<NoopSnapshotFixer>::default(),
        }
    }

    /// Uses `rules` for matching and installs the rule-driven snapshot fixer.
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.fixer = Box::new(RuleSnapshotFixer::new(rules.clone()));
        self.rules = rules;
        self
    }

    pub fn with_fixer(mut self, fixer: Box<dyn SnapshotFixer>) -> Self {
        self.fixer = fixer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn context(&self) -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    /// Reconciles one conference edition and writes its change-sets unless running dry.
    pub async fn run_load(&self, target: EventTarget) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let ctx = self.context();
        info!(run_id = %ctx.run_id, cms = %self.config.cms, conference = %target.conference, start_date = %target.start_date, "starting load");

        let curated = self.collaborators.curated.load_curated()?;
        let snapshot = self
            .collaborators
            .source
            .fetch_snapshot(&ctx, &target)
            .await
            .map_err(ReconcileError::from)?;
        let snapshot = self.fixer.apply(snapshot)?;
        let changes = reconcile_snapshot(
            &snapshot,
            &curated,
            &self.rules,
            self.collaborators.probe.as_ref(),
        )
        .await?;

        let (photos_downloaded, photos_failed) = self.persist(&changes).await?;
        let finished_at = Utc::now();
        let (created, updated, deleted) = changes.totals();
        let mut summary = SyncRunSummary {
            run_id: ctx.run_id,
            kind: RunKind::Load,
            cms: self.config.cms,
            started_at,
            finished_at,
            conference: Some(target.conference),
            start_date: Some(target.start_date),
            created,
            updated,
            deleted,
            photos_scheduled: changes.photos.len(),
            photos_downloaded,
            photos_failed,
            dry_run: self.config.dry_run,
            reports_dir: String::new(),
        };
        let reports_dir = write_reports(&self.config.reports_root(), &summary, &changes).await?;
        summary.reports_dir = reports_dir.display().to_string();
        info!(run_id = %summary.run_id, created, updated, deleted, "load finished");
        Ok(summary)
    }

    /// Reconciles the CMS event-type list on its own.
    pub async fn run_event_types(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let ctx = self.context();
        info!(run_id = %ctx.run_id, cms = %self.config.cms, "starting event type load");

        let curated = self.collaborators.curated.load_curated()?;
        validate::validate_curated(&curated)?;
        let fresh = self
            .collaborators
            .source
            .fetch_event_types(&ctx)
            .await
            .map_err(ReconcileError::from)?;
        let mut ids = IdAllocator::for_data(&curated);
        let event_types =
            diff::reconcile_event_types(&fresh, &curated.event_types, &mut ids.event_types)?;
        let changes = RunChanges {
            event_types: event_types.change_set,
            ..Default::default()
        };
        let mut projected = curated.clone();
        changes.apply_to(&mut projected);
        validate::validate_references(&projected)?;

        let (photos_downloaded, photos_failed) = self.persist(&changes).await?;
        let (created, updated, deleted) = changes.totals();
        let mut summary = SyncRunSummary {
            run_id: ctx.run_id,
            kind: RunKind::EventTypes,
            cms: self.config.cms,
            started_at,
            finished_at: Utc::now(),
            conference: None,
            start_date: None,
            created,
            updated,
            deleted,
            photos_scheduled: 0,
            photos_downloaded,
            photos_failed,
            dry_run: self.config.dry_run,
            reports_dir: String::new(),
        };
        let reports_dir = write_reports(&self.config.reports_root(), &summary, &changes).await?;
        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    /// Identity and reference checks over the curated store alone.
    pub fn validate(&self) -> Result<CuratedCounts> {
        let curated = self.collaborators.curated.load_curated()?;
        validate::validate_curated(&curated)?;
        validate::validate_references(&curated)?;
        Ok(CuratedCounts::from(&curated))
    }

    /// Writes change-sets, then downloads photos. Photo failures are counted, not fatal.
    async fn persist(&self, changes: &RunChanges) -> Result<(usize, usize)> {
        if self.config.dry_run {
            info!("dry run; skipping change-set and photo writes");
            return Ok((0, 0));
        }
        for change_set in changes.entity_change_sets() {
            self.collaborators
                .sink
                .save_change_set(change_set)
                .with_context(|| format!("saving {} change-set", change_set.kind()))?;
        }

        let mut downloaded = 0usize;
        let mut failed = 0usize;
        for photo in &changes.photos {
            match self
                .collaborators
                .images
                .download_image(&photo.url, &photo.file_name)
                .await
            {
                Ok(_) => downloaded += 1,
                Err(err) => {
                    failed += 1;
                    warn!(speaker_id = photo.speaker_id, url = %photo.url, error = %format!("{err:#}"), "photo download failed");
                }
            }
        }
        Ok((downloaded, failed))
    }
}

/// Writes `sync_brief.md` and `changes_delta.json` under `reports/<run_id>`.
pub async fn write_reports(
    reports_root: &Path,
    summary: &SyncRunSummary,
    changes: &RunChanges,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut kind_lines = Vec::new();
    for change_set in changes.entity_change_sets() {
        let (created, updated, deleted) = change_set.counts();
        if created + updated + deleted > 0 {
            kind_lines.push(format!(
                "- {}: +{created} ~{updated} -{deleted}",
                change_set.kind().file_stem()
            ));
        }
    }
    if kind_lines.is_empty() {
        kind_lines.push("- no changes".to_string());
    }

    let target = match (summary.conference, summary.start_date) {
        (Some(conference), Some(start_date)) => format!("{conference} {start_date}"),
        _ => "event types".to_string(),
    };
    let brief = format!(
        "# Trivia Sync Brief\n\n- Run ID: `{}`\n- CMS: {}\n- Target: {}\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Photos: {} scheduled, {} downloaded, {} failed\n\n## Changes\n{}\n",
        summary.run_id,
        summary.cms,
        target,
        summary.started_at,
        summary.finished_at,
        summary.dry_run,
        summary.photos_scheduled,
        summary.photos_downloaded,
        summary.photos_failed,
        kind_lines.join("\n"),
    );
    fs::write(reports_dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "changes": changes,
    }))
    .context("serializing changes delta")?;
    fs::write(reports_dir.join("changes_delta.json"), delta_json)
        .await
        .context("writing changes_delta.json")?;

    Ok(reports_dir)
}

/// Production collaborators plus the rules found under the workspace root.
pub fn pipeline_from_config(config: SyncConfig) -> Result<SyncPipeline> {
    let rules = RuleSet::from_workspace_root(&config.workspace_root)?;
    Ok(SyncPipeline::new(config)?.with_rules(rules))
}

fn pipeline_from_env() -> Result<SyncPipeline> {
    pipeline_from_config(SyncConfig::from_env())
}

pub async fn run_load_from_env(target: EventTarget) -> Result<SyncRunSummary> {
    pipeline_from_env()?.run_load(target).await
}

pub async fn run_event_types_from_env() -> Result<SyncRunSummary> {
    pipeline_from_env()?.run_event_types().await
}

pub fn validate_from_env() -> Result<CuratedCounts> {
    pipeline_from_env()?.validate()
}

/// Markdown digest of the most recent `runs` reports, newest first.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Trivia Sync Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("changes_delta.json");
        let brief_path = dir.path().join("sync_brief.md");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let run = delta.get("run");
        let count = |field: &str| {
            run.and_then(|r| r.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let kind = run
            .and_then(|r| r.get("kind"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}` ({kind})"));
        lines.push(format!(
            "- created: {}, updated: {}, deleted: {}",
            count("created"),
            count("updated"),
            count("deleted")
        ));
        lines.push(format!("- photos downloaded: {}", count("photos_downloaded")));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

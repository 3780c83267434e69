use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use trivia_adapters::{AdapterContext, AdapterError, CmsKind, EventTarget, SourceAdapter};
use trivia_core::{
    Company, Conference, EntityKind, Event, EventDays, EventType, IdSequence, Language, LocaleItem,
    Organizer, Place, SourceData, SourceSnapshot, Speaker, Talk,
};
use trivia_storage::{
    DownloadImage, EntityChangeSet, ImageProbe, LoadCurated, SaveChangeSet, StoredPhoto,
};
use trivia_sync::diff::reconcile_event_types;
use trivia_sync::{
    reconcile_snapshot, Collaborators, ReconcileError, RuleSet, SyncConfig, SyncPipeline,
};

fn en(text: &str) -> Vec<LocaleItem> {
    vec![LocaleItem::new(Language::English, text)]
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

fn photo_time() -> NaiveDateTime {
    date(2023, 9, 1).and_hms_opt(8, 0, 0).expect("timestamp")
}

fn mk_company(id: i64, name: &str) -> Company {
    Company {
        id,
        name: en(name),
        site_link: None,
    }
}

fn mk_speaker(id: i64, name: &str, company_ids: &[i64]) -> Speaker {
    Speaker {
        id,
        name: en(name),
        company_ids: company_ids.to_vec(),
        ..Default::default()
    }
}

fn mk_talk(id: i64, name: &str, speaker_ids: &[i64]) -> Talk {
    Talk {
        id,
        name: en(name),
        speaker_ids: speaker_ids.to_vec(),
        ..Default::default()
    }
}

fn mk_event(id: i64, name: &str, start: NaiveDate, place_id: i64, talk_ids: &[i64]) -> Event {
    Event {
        id,
        event_type_id: 0,
        name: en(name),
        days: vec![EventDays {
            start_date: start,
            end_date: start.succ_opt().expect("next day"),
            place_id,
        }],
        talk_ids: talk_ids.to_vec(),
        ..Default::default()
    }
}

fn mk_place(id: i64) -> Place {
    Place {
        id,
        city: en("Saint Petersburg"),
        venue_address: en("Expoforum"),
        map_coordinates: None,
    }
}

fn base_curated() -> SourceData {
    SourceData {
        organizers: vec![Organizer {
            id: 0,
            name: en("JUG Ru Group"),
        }],
        event_types: vec![EventType {
            id: 0,
            conference: Some(Conference::Joker),
            name: en("Joker"),
            organizer_id: Some(0),
            time_zone: Some("Europe/Moscow".into()),
            ..Default::default()
        }],
        events: vec![mk_event(0, "Joker 2023", date(2023, 10, 9), 0, &[0, 1])],
        places: vec![mk_place(0)],
        talks: vec![
            mk_talk(0, "Records in Java", &[0]),
            mk_talk(1, "Loom in practice", &[1]),
        ],
        speakers: vec![
            Speaker {
                photo_file_name: Some("0000.jpg".into()),
                photo_updated_at: Some(photo_time()),
                twitter: Some("janedoe".into()),
                ..mk_speaker(0, "Jane Doe", &[0])
            },
            mk_speaker(1, "John Roe", &[1]),
        ],
        companies: vec![mk_company(0, "Acme"), mk_company(1, "Globex")],
    }
}

fn new_edition_snapshot() -> SourceSnapshot {
    SourceSnapshot {
        conference: Conference::Joker,
        start_date: date(2024, 10, 9),
        event: mk_event(-1, "Joker 2024", date(2024, 10, 9), -1, &[-1, -2]),
        places: vec![mk_place(-1)],
        talks: vec![
            Talk {
                talk_day: Some(1),
                track: Some(1),
                track_time: NaiveTime::from_hms_opt(10, 0, 0),
                ..mk_talk(-1, "Records in Java", &[-1])
            },
            mk_talk(-2, "Office Space", &[-2]),
        ],
        speakers: vec![
            Speaker {
                photo_url: Some("https://cdn.example/jane.jpg".into()),
                photo_updated_at: Some(photo_time()),
                ..mk_speaker(-1, "Jane Doe", &[-1])
            },
            Speaker {
                photo_url: Some("https://cdn.example/peter.jpg".into()),
                ..mk_speaker(-2, "Peter Gibbons", &[-2])
            },
        ],
        companies: vec![mk_company(-1, "ACME"), mk_company(-2, "Initech")],
    }
}

struct FixedProbe(bool);

#[async_trait]
impl ImageProbe for FixedProbe {
    async fn differs(&self, _url: &str, _file_name: &str) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

struct MemoryCurated(SourceData);

impl LoadCurated for MemoryCurated {
    fn load_curated(&self) -> anyhow::Result<SourceData> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<(EntityKind, (usize, usize, usize))>>>);

impl SaveChangeSet for RecordingSink {
    fn save_change_set(&self, change_set: EntityChangeSet<'_>) -> anyhow::Result<()> {
        self.0
            .lock()
            .expect("sink lock")
            .push((change_set.kind(), change_set.counts()));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingImages {
    fail: bool,
    requested: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DownloadImage for RecordingImages {
    async fn download_image(&self, url: &str, file_name: &str) -> anyhow::Result<StoredPhoto> {
        self.requested
            .lock()
            .expect("images lock")
            .push(file_name.to_string());
        if self.fail {
            anyhow::bail!("connection reset while fetching {url}");
        }
        Ok(StoredPhoto {
            file_name: file_name.to_string(),
            content_hash: "00".into(),
            absolute_path: file_name.into(),
            byte_size: 0,
            unchanged: false,
        })
    }
}

struct StaticSource(Option<SourceSnapshot>);

#[async_trait]
impl SourceAdapter for StaticSource {
    fn cms(&self) -> CmsKind {
        CmsKind::JrgCms
    }

    async fn fetch_event_types(&self, _ctx: &AdapterContext) -> Result<Vec<EventType>, AdapterError> {
        Ok(Vec::new())
    }

    async fn fetch_snapshot(
        &self,
        _ctx: &AdapterContext,
        _target: &EventTarget,
    ) -> Result<SourceSnapshot, AdapterError> {
        self.0
            .clone()
            .ok_or_else(|| AdapterError::Message("CMS returned 503".into()))
    }
}

fn pipeline(
    workspace: &std::path::Path,
    curated: SourceData,
    snapshot: Option<SourceSnapshot>,
    sink: RecordingSink,
    images: RecordingImages,
) -> SyncPipeline {
    SyncPipeline::with_collaborators(
        SyncConfig::for_workspace(workspace),
        Collaborators {
            source: Box::new(StaticSource(snapshot)),
            curated: Box::new(MemoryCurated(curated)),
            sink: Box::new(sink),
            images: Box::new(images),
            probe: Box::new(FixedProbe(false)),
        },
    )
    .with_rules(RuleSet::default())
}

fn joker_2024() -> EventTarget {
    EventTarget {
        conference: Conference::Joker,
        start_date: date(2024, 10, 9),
    }
}

#[tokio::test]
async fn second_pass_over_applied_changes_is_empty() {
    let mut curated = base_curated();
    let snapshot = new_edition_snapshot();
    let rules = RuleSet::default();

    let first = reconcile_snapshot(&snapshot, &curated, &rules, &FixedProbe(false))
        .await
        .expect("first pass");
    assert_eq!(first.companies.to_create.len(), 1);
    assert_eq!(first.companies.to_create[0].id, 2);
    assert_eq!(first.speakers.to_create.len(), 1);
    assert!(first.speakers.to_update.is_empty());
    assert_eq!(first.talks.to_create.len(), 1);
    assert_eq!(first.talks.to_update.len(), 1);
    assert_eq!(first.events.to_create.len(), 1);
    assert_eq!(first.events.to_create[0].talk_ids, vec![0, 2]);
    assert_eq!(first.events.to_create[0].days[0].place_id, 0);
    assert!(first.places.to_create.is_empty());

    first.apply_to(&mut curated);
    let second = reconcile_snapshot(&snapshot, &curated, &rules, &FixedProbe(false))
        .await
        .expect("second pass");
    assert!(second.is_empty(), "second pass produced {second:?}");
}

#[tokio::test]
async fn new_speaker_schedules_numbered_photo() {
    let curated = base_curated();
    let changes = reconcile_snapshot(&new_edition_snapshot(), &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect("reconcile");

    assert_eq!(changes.photos.len(), 1);
    assert_eq!(changes.photos[0].speaker_id, 2);
    assert_eq!(changes.photos[0].file_name, "0002.jpg");
    assert_eq!(changes.speakers.to_create[0].photo_file_name.as_deref(), Some("0002.jpg"));
    assert_eq!(changes.speakers.to_create[0].photo_url, None);
    assert_eq!(changes.speakers.to_create[0].company_ids, vec![2]);
}

#[tokio::test]
async fn newer_remote_photo_reuses_existing_file_name() {
    let curated = base_curated();
    let mut snapshot = new_edition_snapshot();
    snapshot.speakers[0].photo_updated_at = date(2024, 9, 1).and_hms_opt(8, 0, 0);

    let changes = reconcile_snapshot(&snapshot, &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect("reconcile");
    let jane = changes
        .photos
        .iter()
        .find(|p| p.speaker_id == 0)
        .expect("jane photo");
    assert_eq!(jane.file_name, "0000.jpg");
    assert_eq!(changes.speakers.to_update.len(), 1);
    assert_eq!(changes.speakers.to_update[0].twitter.as_deref(), Some("janedoe"));
}

#[tokio::test]
async fn talk_still_listed_by_another_event_is_not_deleted() {
    let mut curated = base_curated();
    curated.events[0].talk_ids = vec![0, 1, 2];
    curated
        .events
        .push(mk_event(1, "Joker 2022", date(2022, 10, 9), 0, &[1]));
    curated.talks.push(mk_talk(2, "Legacy talk", &[2]));
    curated.speakers.push(mk_speaker(2, "Old Speaker", &[2]));
    curated.companies.push(mk_company(2, "Defunct"));

    let snapshot = SourceSnapshot {
        conference: Conference::Joker,
        start_date: date(2023, 10, 9),
        event: mk_event(-1, "Joker 2023", date(2023, 10, 9), -1, &[-1]),
        places: vec![mk_place(-1)],
        talks: vec![mk_talk(-1, "Records in Java", &[-1])],
        speakers: vec![mk_speaker(-1, "Jane Doe", &[-1])],
        companies: vec![mk_company(-1, "Acme")],
    };

    let changes = reconcile_snapshot(&snapshot, &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect("reconcile");
    let talk_ids: Vec<i64> = changes.talks.to_delete.iter().map(|t| t.id).collect();
    let speaker_ids: Vec<i64> = changes.speakers.to_delete.iter().map(|s| s.id).collect();
    let company_ids: Vec<i64> = changes.companies.to_delete.iter().map(|c| c.id).collect();
    assert_eq!(talk_ids, vec![2]);
    assert_eq!(speaker_ids, vec![2]);
    assert_eq!(company_ids, vec![2]);
    assert_eq!(changes.events.to_update.len(), 1);
    assert_eq!(changes.events.to_update[0].talk_ids, vec![0]);
    assert!(changes.places.to_delete.is_empty());
}

fn joker_2023_refresh() -> SourceSnapshot {
    SourceSnapshot {
        conference: Conference::Joker,
        start_date: date(2023, 10, 9),
        event: mk_event(-1, "Joker 2023", date(2023, 10, 9), -1, &[-1, -2]),
        places: vec![mk_place(-1)],
        talks: vec![
            mk_talk(-1, "Records in Java", &[-1]),
            mk_talk(-2, "Loom in practice", &[-2]),
        ],
        speakers: vec![
            mk_speaker(-1, "Jane Doe", &[-1]),
            mk_speaker(-2, "John Roe", &[-2]),
        ],
        companies: vec![mk_company(-1, "Acme"), mk_company(-2, "Globex")],
    }
}

#[tokio::test]
async fn event_inheriting_the_event_type_zone_is_unchanged() {
    let mut curated = base_curated();
    curated.events[0].time_zone = Some("Europe/Moscow".into());

    let changes = reconcile_snapshot(&joker_2023_refresh(), &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect("reconcile");
    assert!(changes.is_empty(), "unexpected changes {changes:?}");
}

#[tokio::test]
async fn explicit_cms_time_zone_replaces_curated_zone() {
    let mut curated = base_curated();
    curated.events[0].time_zone = Some("Europe/Moscow".into());
    let mut snapshot = joker_2023_refresh();
    snapshot.event.time_zone = Some("Asia/Novosibirsk".into());

    let changes = reconcile_snapshot(&snapshot, &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect("reconcile");
    assert_eq!(changes.events.to_update.len(), 1);
    assert_eq!(changes.events.to_update[0].id, 0);
    assert_eq!(
        changes.events.to_update[0].time_zone.as_deref(),
        Some("Asia/Novosibirsk")
    );
}

#[tokio::test]
async fn twin_event_types_for_one_conference_stop_the_run() {
    let mut curated = base_curated();
    curated.event_types.push(EventType {
        id: 1,
        conference: Some(Conference::Joker),
        name: en("Joker Online"),
        ..Default::default()
    });

    let err = reconcile_snapshot(&joker_2023_refresh(), &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect_err("ambiguous event type");
    match err {
        ReconcileError::AmbiguousMatch {
            kind, candidate_ids, ..
        } => {
            assert_eq!(kind, EntityKind::EventType);
            assert_eq!(candidate_ids, vec![0, 1]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn event_type_without_conference_is_appended() {
    let curated = vec![EventType {
        id: 0,
        name: en("Java Meetup"),
        ..Default::default()
    }];
    let fresh = vec![
        EventType {
            id: -1,
            name: en("Java Meetup"),
            ..Default::default()
        },
        EventType {
            id: -2,
            conference: Some(Conference::Joker),
            name: en("Joker"),
            ..Default::default()
        },
    ];

    let reconciled = reconcile_event_types(&fresh, &curated, &mut IdSequence::from_ids([0]))
        .expect("event types");
    let created: Vec<i64> = reconciled.change_set.to_create.iter().map(|et| et.id).collect();
    assert_eq!(created, vec![1, 2]);
    assert!(reconciled.change_set.to_update.is_empty());
}

#[tokio::test]
async fn dangling_speaker_reference_is_unresolved() {
    let mut snapshot = new_edition_snapshot();
    snapshot.talks[1].speaker_ids = vec![-9];

    let err = reconcile_snapshot(&snapshot, &base_curated(), &RuleSet::default(), &FixedProbe(false))
        .await
        .expect_err("dangling reference");
    assert!(matches!(
        err,
        ReconcileError::UnresolvedReference {
            kind: EntityKind::Speaker,
            id: -9,
            ..
        }
    ));
}

#[tokio::test]
async fn twin_curated_companies_stop_the_run() {
    let mut curated = base_curated();
    curated.companies.push(mk_company(5, "acme"));

    let err = reconcile_snapshot(&new_edition_snapshot(), &curated, &RuleSet::default(), &FixedProbe(false))
        .await
        .expect_err("ambiguous company");
    match err {
        ReconcileError::AmbiguousMatch {
            kind, candidate_ids, ..
        } => {
            assert_eq!(kind, EntityKind::Company);
            assert_eq!(candidate_ids, vec![0, 5]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn unknown_conference_has_no_event_type() {
    let mut snapshot = new_edition_snapshot();
    snapshot.conference = Conference::Heisenbug;

    let err = reconcile_snapshot(&snapshot, &base_curated(), &RuleSet::default(), &FixedProbe(false))
        .await
        .expect_err("missing event type");
    assert!(matches!(
        err,
        ReconcileError::UnresolvedReference {
            kind: EntityKind::EventType,
            ..
        }
    ));
}

#[tokio::test]
async fn pipeline_saves_change_sets_downloads_photos_and_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = RecordingSink::default();
    let images = RecordingImages::default();
    let pipeline = pipeline(
        dir.path(),
        base_curated(),
        Some(new_edition_snapshot()),
        sink.clone(),
        images.clone(),
    );

    let summary = pipeline.run_load(joker_2024()).await.expect("run");
    assert_eq!(summary.created, 4);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.photos_downloaded, 1);
    assert_eq!(summary.photos_failed, 0);
    assert_eq!(*images.requested.lock().expect("lock"), vec!["0002.jpg".to_string()]);

    let saved = sink.0.lock().expect("lock").clone();
    assert!(saved.contains(&(EntityKind::Speaker, (1, 0, 0))));
    assert!(saved.contains(&(EntityKind::Event, (1, 0, 0))));

    let reports_dir = std::path::PathBuf::from(&summary.reports_dir);
    assert!(reports_dir.join("sync_brief.md").exists());
    assert!(reports_dir.join("changes_delta.json").exists());
}

#[tokio::test]
async fn failed_photo_download_is_counted_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let images = RecordingImages {
        fail: true,
        ..Default::default()
    };
    let pipeline = pipeline(
        dir.path(),
        base_curated(),
        Some(new_edition_snapshot()),
        RecordingSink::default(),
        images,
    );

    let summary = pipeline.run_load(joker_2024()).await.expect("run");
    assert_eq!(summary.photos_scheduled, 1);
    assert_eq!(summary.photos_failed, 1);
    assert_eq!(summary.photos_downloaded, 0);
}

#[tokio::test]
async fn fetch_failure_surfaces_as_reconcile_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = RecordingSink::default();
    let pipeline = pipeline(
        dir.path(),
        base_curated(),
        None,
        sink.clone(),
        RecordingImages::default(),
    );

    let err = pipeline.run_load(joker_2024()).await.expect_err("fetch failure");
    assert!(matches!(
        err.downcast_ref::<ReconcileError>(),
        Some(ReconcileError::Fetch(_))
    ));
    assert!(sink.0.lock().expect("lock").is_empty());
}

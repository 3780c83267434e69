use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use trivia_adapters::{
    load_snapshot_bundle, AdapterContext, AdapterError, CmsKind, EventTarget, SnapshotFileAdapter,
    SourceAdapter,
};
use trivia_core::{Conference, Language};
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    }
}

fn joker_2024() -> EventTarget {
    EventTarget {
        conference: Conference::Joker,
        start_date: NaiveDate::from_ymd_opt(2024, 10, 9).expect("date"),
    }
}

#[test]
fn joker_bundle_parses_with_temporary_ids() {
    let bundle = load_snapshot_bundle(fixtures_root().join("jrgcms/joker/2024-10-09.json"))
        .expect("bundle");
    assert_eq!(bundle.cms, CmsKind::JrgCms);
    assert!(bundle.snapshot.talks.iter().all(|t| t.id < 0));
    assert!(bundle.snapshot.speakers.iter().any(|s| s.photo_url.is_some()));
}

#[tokio::test]
async fn file_adapter_serves_repo_fixtures() {
    let adapter = SnapshotFileAdapter::new(CmsKind::JrgCms, fixtures_root());
    let snapshot = adapter
        .fetch_snapshot(&ctx(), &joker_2024())
        .await
        .expect("snapshot");
    assert_eq!(
        trivia_core::localized_text(&snapshot.event.name, Language::English),
        Some("Joker 2024")
    );
    assert_eq!(snapshot.event.talk_ids.len(), 5);

    let event_types = adapter.fetch_event_types(&ctx()).await.expect("event types");
    assert_eq!(event_types.len(), 2);
    assert_eq!(event_types[0].conference, Some(Conference::Joker));
}

#[tokio::test]
async fn missing_edition_is_an_adapter_error() {
    let adapter = SnapshotFileAdapter::new(CmsKind::JrgCms, fixtures_root());
    let target = EventTarget {
        conference: Conference::Hydra,
        start_date: NaiveDate::from_ymd_opt(2024, 6, 27).expect("date"),
    };
    let err = adapter
        .fetch_snapshot(&ctx(), &target)
        .await
        .expect_err("no fixture");
    assert!(matches!(err, AdapterError::Anyhow(_)));
}

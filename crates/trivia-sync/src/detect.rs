//! Field-by-field change detection, run on the merged record against its curated original.

use chrono::NaiveDateTime;
use tracing::{debug, warn};
use trivia_core::{Event, EventType, Place, Speaker, Talk};
use trivia_storage::ImageProbe;

/// Compares fields in a fixed order and reports the first one that differs.
pub trait NeedsUpdate {
    fn first_difference(&self, curated: &Self) -> Option<&'static str>;

    fn needs_update(&self, curated: &Self) -> bool {
        self.first_difference(curated).is_some()
    }
}

macro_rules! first_difference {
    ($fresh:expr, $curated:expr; $($field:ident),+ $(,)?) => {{
        let mut found = None;
        $(
            if found.is_none() && $fresh.$field != $curated.$field {
                found = Some(stringify!($field));
            }
        )+
        found
    }};
}

impl NeedsUpdate for EventType {
    fn first_difference(&self, curated: &Self) -> Option<&'static str> {
        first_difference!(self, curated;
            id, conference, logo_file_name, name, short_description, long_description, site_link,
            vk_link, twitter_link, facebook_link, youtube_link, telegram_link, speakerdeck_link,
            habr_link, organizer_id, time_zone, inactive)
    }
}

impl NeedsUpdate for Place {
    fn first_difference(&self, curated: &Self) -> Option<&'static str> {
        first_difference!(self, curated; id, city, venue_address, map_coordinates)
    }
}

impl NeedsUpdate for Speaker {
    fn first_difference(&self, curated: &Self) -> Option<&'static str> {
        first_difference!(self, curated;
            id, photo_file_name, photo_updated_at, name, company_ids, bio, twitter, github, habr,
            java_champion, mvp, mvp_reconnect)
    }
}

impl NeedsUpdate for Talk {
    fn first_difference(&self, curated: &Self) -> Option<&'static str> {
        first_difference!(self, curated;
            id, name, short_description, long_description, talk_day, track_time, track, language,
            presentation_links, material_links, video_links, speaker_ids)
    }
}

/// Events compare effective time zones, so an inherited zone equals the same explicit one.
pub fn event_difference(
    fresh: &Event,
    curated: &Event,
    event_type: Option<&EventType>,
) -> Option<&'static str> {
    first_difference!(fresh, curated; event_type_id, name, days, site_link, youtube_link, talk_ids)
        .or_else(|| {
            (fresh.effective_time_zone(event_type) != curated.effective_time_zone(event_type))
                .then_some("time_zone")
        })
}

pub fn event_needs_update(fresh: &Event, curated: &Event, event_type: Option<&EventType>) -> bool {
    event_difference(fresh, curated, event_type).is_some()
}

/// Timestamp verdict, or `None` when only the remote bytes can tell.
pub fn photo_timestamp_verdict(
    fresh_at: Option<NaiveDateTime>,
    curated_at: Option<NaiveDateTime>,
) -> Option<bool> {
    match (fresh_at, curated_at) {
        (None, _) => None,
        (Some(_), None) => Some(true),
        (Some(fresh), Some(curated)) => Some(fresh > curated),
    }
}

/// A failing probe is logged and treated as "unchanged"; the photo is retried on the next run.
pub async fn photo_needs_update(
    fresh_at: Option<NaiveDateTime>,
    curated_at: Option<NaiveDateTime>,
    probe: &dyn ImageProbe,
    url: &str,
    file_name: &str,
) -> bool {
    if let Some(verdict) = photo_timestamp_verdict(fresh_at, curated_at) {
        return verdict;
    }
    match probe.differs(url, file_name).await {
        Ok(differs) => {
            debug!(url, file_name, differs, "probed speaker photo");
            differs
        }
        Err(err) => {
            warn!(url, file_name, error = %format!("{err:#}"), "photo probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use trivia_core::{EventDays, Language, LocaleItem};

    struct FixedProbe(bool);

    #[async_trait]
    impl ImageProbe for FixedProbe {
        async fn differs(&self, _url: &str, _file_name: &str) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    #[async_trait]
    impl ImageProbe for BrokenProbe {
        async fn differs(&self, url: &str, _file_name: &str) -> anyhow::Result<bool> {
            anyhow::bail!("cannot reach {url}")
        }
    }

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("timestamp")
    }

    fn mk_event(time_zone: Option<&str>) -> Event {
        let day = NaiveDate::from_ymd_opt(2024, 4, 10).expect("date");
        Event {
            id: 3,
            event_type_id: 1,
            name: vec![LocaleItem::new(Language::English, "Joker 2024")],
            days: vec![EventDays {
                start_date: day,
                end_date: day,
                place_id: 0,
            }],
            time_zone: time_zone.map(str::to_string),
            talk_ids: vec![1, 2],
            ..Default::default()
        }
    }

    #[test]
    fn reports_first_differing_speaker_field() {
        let curated = Speaker {
            id: 1,
            name: vec![LocaleItem::new(Language::English, "Jane")],
            twitter: Some("jane".into()),
            ..Default::default()
        };
        let mut fresh = curated.clone();
        assert!(!fresh.needs_update(&curated));

        fresh.github = Some("jane-gh".into());
        fresh.company_ids = vec![4];
        assert_eq!(fresh.first_difference(&curated), Some("company_ids"));
    }

    #[test]
    fn absent_and_empty_are_distinct() {
        let curated = Place {
            id: 0,
            map_coordinates: None,
            ..Default::default()
        };
        let fresh = Place {
            map_coordinates: Some(String::new()),
            ..curated.clone()
        };
        assert!(fresh.needs_update(&curated));
    }

    #[test]
    fn inherited_time_zone_equals_explicit_one() {
        let event_type = EventType {
            id: 1,
            time_zone: Some("Europe/Moscow".into()),
            ..Default::default()
        };
        let fresh = mk_event(None);
        let curated = mk_event(Some("Europe/Moscow"));
        assert!(!event_needs_update(&fresh, &curated, Some(&event_type)));

        let curated = mk_event(Some("Asia/Novosibirsk"));
        assert_eq!(event_difference(&fresh, &curated, Some(&event_type)), Some("time_zone"));
    }

    #[test]
    fn talk_order_of_speakers_matters() {
        let curated = Talk {
            id: 5,
            speaker_ids: vec![1, 2],
            ..Default::default()
        };
        let fresh = Talk {
            speaker_ids: vec![2, 1],
            ..curated.clone()
        };
        assert_eq!(fresh.first_difference(&curated), Some("speaker_ids"));
    }

    #[tokio::test]
    async fn photo_check_uses_timestamps_before_probe() {
        assert!(photo_needs_update(Some(at(2)), None, &FixedProbe(false), "u", "f").await);
        assert!(photo_needs_update(Some(at(3)), Some(at(2)), &FixedProbe(false), "u", "f").await);
        assert!(!photo_needs_update(Some(at(2)), Some(at(3)), &FixedProbe(true), "u", "f").await);
        assert!(photo_needs_update(None, Some(at(3)), &FixedProbe(true), "u", "f").await);
        assert!(!photo_needs_update(None, None, &FixedProbe(false), "u", "f").await);
        assert!(!photo_needs_update(None, None, &BrokenProbe, "u", "f").await);
    }
}

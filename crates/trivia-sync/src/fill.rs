//! Field-level promotion of curated overrides into a freshly fetched record.
//!
//! Helpers keep the curated value when it carries content and only fall back to the fresh one
//! otherwise, so hand edits survive a re-fetch. Time zones are the exception: an explicit CMS
//! zone replaces the curated one.

use chrono::NaiveDateTime;
use trivia_core::{Event, EventType, LocaleItem, Place, Speaker};

pub fn fill_if_absent(fresh: &str, curated: &str) -> String {
    if curated.trim().is_empty() {
        fresh.to_string()
    } else {
        curated.to_string()
    }
}

pub fn fill_string(fresh: Option<String>, curated: Option<&str>) -> Option<String> {
    match curated {
        Some(value) if !value.trim().is_empty() => Some(value.to_string()),
        _ => fresh,
    }
}

/// A non-blank fresh zone wins; the curated zone fills a blank or missing one.
pub fn fill_time_zone(fresh: Option<String>, curated: Option<&str>) -> Option<String> {
    if fresh.as_deref().is_some_and(|zone| !zone.trim().is_empty()) {
        return fresh;
    }
    match curated {
        Some(zone) if !zone.trim().is_empty() => Some(zone.to_string()),
        _ => fresh,
    }
}

pub fn fill_locale_items(fresh: Vec<LocaleItem>, curated: &[LocaleItem]) -> Vec<LocaleItem> {
    if trivia_core::has_text(curated) {
        curated.to_vec()
    } else {
        fresh
    }
}

pub fn fill_boolean(fresh: bool, curated: bool) -> bool {
    fresh || curated
}

/// Resolves `(mvp, mvp_reconnect)` as one pair: reconnect outranks plain MVP, curated flags first.
pub fn fill_speaker_mvp(fresh: (bool, bool), curated: (bool, bool)) -> (bool, bool) {
    let (curated_mvp, curated_reconnect) = curated;
    let (fresh_mvp, fresh_reconnect) = fresh;
    if curated_reconnect {
        (false, true)
    } else if curated_mvp {
        (true, false)
    } else if fresh_reconnect {
        (false, true)
    } else {
        (fresh_mvp, false)
    }
}

pub fn fill_updated_at(
    fresh: Option<NaiveDateTime>,
    curated: Option<NaiveDateTime>,
) -> Option<NaiveDateTime> {
    match (fresh, curated) {
        (Some(fresh), Some(curated)) => Some(fresh.max(curated)),
        (fresh, curated) => fresh.or(curated),
    }
}

/// Fresh speaker, with the curated id, photo name and hand-maintained fields carried over.
pub fn merge_speaker(mut fresh: Speaker, curated: &Speaker) -> Speaker {
    fresh.id = curated.id;
    fresh.photo_file_name = curated.photo_file_name.clone();
    fresh.photo_updated_at = fill_updated_at(fresh.photo_updated_at, curated.photo_updated_at);
    fresh.photo_url = None;
    fresh.twitter = fill_string(fresh.twitter, curated.twitter.as_deref());
    fresh.github = fill_string(fresh.github, curated.github.as_deref());
    fresh.habr = fill_string(fresh.habr, curated.habr.as_deref());
    fresh.bio = fill_locale_items(fresh.bio, &curated.bio);
    fresh.java_champion = fill_boolean(fresh.java_champion, curated.java_champion);
    let (mvp, mvp_reconnect) = fill_speaker_mvp(
        (fresh.mvp, fresh.mvp_reconnect),
        (curated.mvp, curated.mvp_reconnect),
    );
    fresh.mvp = mvp;
    fresh.mvp_reconnect = mvp_reconnect;
    fresh
}

/// Fresh name wins; curated descriptive fields fill in.
pub fn merge_event_type(mut fresh: EventType, curated: &EventType) -> EventType {
    fresh.id = curated.id;
    fresh.conference = fresh.conference.or(curated.conference);
    fresh.short_description = fill_locale_items(fresh.short_description, &curated.short_description);
    fresh.long_description = fill_locale_items(fresh.long_description, &curated.long_description);
    fresh.site_link = fill_locale_items(fresh.site_link, &curated.site_link);
    fresh.logo_file_name = fill_string(fresh.logo_file_name, curated.logo_file_name.as_deref());
    fresh.vk_link = fill_string(fresh.vk_link, curated.vk_link.as_deref());
    fresh.twitter_link = fill_string(fresh.twitter_link, curated.twitter_link.as_deref());
    fresh.facebook_link = fill_string(fresh.facebook_link, curated.facebook_link.as_deref());
    fresh.youtube_link = fill_string(fresh.youtube_link, curated.youtube_link.as_deref());
    fresh.telegram_link = fill_string(fresh.telegram_link, curated.telegram_link.as_deref());
    fresh.speakerdeck_link = fill_string(fresh.speakerdeck_link, curated.speakerdeck_link.as_deref());
    fresh.habr_link = fill_string(fresh.habr_link, curated.habr_link.as_deref());
    fresh.organizer_id = curated.organizer_id.or(fresh.organizer_id);
    fresh.time_zone = fill_time_zone(fresh.time_zone, curated.time_zone.as_deref());
    fresh.inactive = fill_boolean(fresh.inactive, curated.inactive);
    fresh
}

pub fn merge_event(mut fresh: Event, curated: &Event) -> Event {
    fresh.id = curated.id;
    fresh.time_zone = fill_time_zone(fresh.time_zone, curated.time_zone.as_deref());
    fresh.youtube_link = fill_string(fresh.youtube_link, curated.youtube_link.as_deref());
    fresh.site_link = fill_locale_items(fresh.site_link, &curated.site_link);
    fresh
}

pub fn merge_place(mut fresh: Place, curated: &Place) -> Place {
    fresh.id = curated.id;
    fresh.map_coordinates = fill_string(fresh.map_coordinates, curated.map_coordinates.as_deref());
    fresh
}

//! Identity key builders. Every function is total: blank input yields no key.

use std::fmt;

use chrono::NaiveDate;
use trivia_core::{
    localized_text, Company, Conference, Event, EventType, Language, LocaleItem, Place, Speaker,
    Talk,
};

/// Fuzzy keys try Russian text before English; CMS payloads fill Russian more reliably.
pub const KEY_LANGUAGE_ORDER: [Language; 2] = [Language::Russian, Language::English];

/// A derived lookup key, distinct from the primary numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Name(String),
    NameCompany(String, i64),
    CityVenue(String, String),
    Conference(Conference),
    Schedule(i64, NaiveDate),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Name(name) => write!(f, "name={name}"),
            IdentityKey::NameCompany(name, company_id) => {
                write!(f, "name={name} company={company_id}")
            }
            IdentityKey::CityVenue(city, venue) => write!(f, "city={city} venue={venue}"),
            IdentityKey::Conference(conference) => write!(f, "conference={conference}"),
            IdentityKey::Schedule(event_type_id, start) => {
                write!(f, "event_type={event_type_id} start={start}")
            }
        }
    }
}

/// Trim, collapse inner whitespace and lower-case.
pub fn normalize_key(text: &str) -> Option<String> {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

/// Normalized localized names in [`KEY_LANGUAGE_ORDER`], without repeats.
pub fn localized_keys(items: &[LocaleItem]) -> Vec<String> {
    let mut keys = Vec::new();
    for language in KEY_LANGUAGE_ORDER {
        if let Some(key) = localized_text(items, language).and_then(normalize_key) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

pub fn company_keys(company: &Company) -> Vec<IdentityKey> {
    localized_keys(&company.name)
        .into_iter()
        .map(IdentityKey::Name)
        .collect()
}

pub fn speaker_name_keys(speaker: &Speaker) -> Vec<IdentityKey> {
    localized_keys(&speaker.name)
        .into_iter()
        .map(IdentityKey::Name)
        .collect()
}

pub fn speaker_name_company_keys(speaker: &Speaker) -> Vec<IdentityKey> {
    let names = localized_keys(&speaker.name);
    names
        .iter()
        .flat_map(|name| {
            speaker
                .company_ids
                .iter()
                .map(move |company_id| IdentityKey::NameCompany(name.clone(), *company_id))
        })
        .collect()
}

pub fn talk_keys(talk: &Talk) -> Vec<IdentityKey> {
    localized_keys(&talk.name)
        .into_iter()
        .map(IdentityKey::Name)
        .collect()
}

pub fn place_keys(place: &Place) -> Vec<IdentityKey> {
    let mut keys = Vec::new();
    for language in KEY_LANGUAGE_ORDER {
        let city = localized_text(&place.city, language).and_then(normalize_key);
        let venue = localized_text(&place.venue_address, language).and_then(normalize_key);
        if let (Some(city), Some(venue)) = (city, venue) {
            let key = IdentityKey::CityVenue(city, venue);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

pub fn event_type_conference_keys(event_type: &EventType) -> Vec<IdentityKey> {
    event_type
        .conference
        .map(IdentityKey::Conference)
        .into_iter()
        .collect()
}

pub fn event_schedule_keys(event: &Event) -> Vec<IdentityKey> {
    event
        .start_date()
        .map(|start| IdentityKey::Schedule(event.event_type_id, start))
        .into_iter()
        .collect()
}

//! Core domain model for the curated conference dataset and fresh CMS snapshots.

use std::collections::HashSet;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "trivia-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ru")]
    Russian,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::English, Language::Russian];

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Russian => "ru",
        }
    }
}

/// One localized text value. Localized fields are lists of these, at most one per language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocaleItem {
    pub language: String,
    pub text: String,
}

impl LocaleItem {
    pub fn new(language: Language, text: impl Into<String>) -> Self {
        Self {
            language: language.code().to_string(),
            text: text.into(),
        }
    }
}

pub fn localized_text(items: &[LocaleItem], language: Language) -> Option<&str> {
    items
        .iter()
        .find(|item| item.language == language.code())
        .map(|item| item.text.as_str())
}

pub fn has_text(items: &[LocaleItem]) -> bool {
    items.iter().any(|item| !item.text.trim().is_empty())
}

/// Trim and collapse whitespace, drop blank items and drop a Russian item equal to the English one.
pub fn normalize_locale_items(items: Vec<LocaleItem>) -> Vec<LocaleItem> {
    let mut items: Vec<LocaleItem> = items
        .into_iter()
        .map(|item| LocaleItem {
            text: item.text.split_whitespace().collect::<Vec<_>>().join(" "),
            language: item.language,
        })
        .filter(|item| !item.text.is_empty())
        .collect();

    let english = localized_text(&items, Language::English).map(str::to_string);
    if let Some(english) = english {
        items.retain(|item| !(item.language == Language::Russian.code() && item.text == english));
    }
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conference {
    Joker,
    Jpoint,
    Jbreak,
    Heisenbug,
    DotNext,
    HolyJs,
    Mobius,
    CppRussia,
    SmartData,
    DevOops,
    Hydra,
    TechTrain,
    VideoTech,
    SpbPython,
}

impl Conference {
    pub fn as_str(self) -> &'static str {
        match self {
            Conference::Joker => "joker",
            Conference::Jpoint => "jpoint",
            Conference::Jbreak => "jbreak",
            Conference::Heisenbug => "heisenbug",
            Conference::DotNext => "dotnext",
            Conference::HolyJs => "holyjs",
            Conference::Mobius => "mobius",
            Conference::CppRussia => "cpp-russia",
            Conference::SmartData => "smartdata",
            Conference::DevOops => "devoops",
            Conference::Hydra => "hydra",
            Conference::TechTrain => "techtrain",
            Conference::VideoTech => "videotech",
            Conference::SpbPython => "spb-python",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        const ALL: [Conference; 14] = [
            Conference::Joker,
            Conference::Jpoint,
            Conference::Jbreak,
            Conference::Heisenbug,
            Conference::DotNext,
            Conference::HolyJs,
            Conference::Mobius,
            Conference::CppRussia,
            Conference::SmartData,
            Conference::DevOops,
            Conference::Hydra,
            Conference::TechTrain,
            Conference::VideoTech,
            Conference::SpbPython,
        ];
        let wanted = input.trim().to_ascii_lowercase().replace('_', "-");
        ALL.into_iter().find(|c| c.as_str() == wanted)
    }
}

impl fmt::Display for Conference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Organizer,
    EventType,
    Event,
    Place,
    Talk,
    Speaker,
    Company,
}

impl EntityKind {
    /// File stem used by the curated store and change-set output.
    pub fn file_stem(self) -> &'static str {
        match self {
            EntityKind::Organizer => "organizers",
            EntityKind::EventType => "event-types",
            EntityKind::Event => "events",
            EntityKind::Place => "places",
            EntityKind::Talk => "talks",
            EntityKind::Speaker => "speakers",
            EntityKind::Company => "companies",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Organizer => "organizer",
            EntityKind::EventType => "event type",
            EntityKind::Event => "event",
            EntityKind::Place => "place",
            EntityKind::Talk => "talk",
            EntityKind::Speaker => "speaker",
            EntityKind::Company => "company",
        };
        f.write_str(name)
    }
}

/// Entities addressable by a numeric id unique within their kind.
pub trait Identified {
    const KIND: EntityKind;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

macro_rules! identified {
    ($ty:ty, $kind:expr) => {
        impl Identified for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> i64 {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Organizer {
    pub id: i64,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventType {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference: Option<Conference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_file_name: Option<String>,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
    #[serde(default)]
    pub short_description: Vec<LocaleItem>,
    #[serde(default)]
    pub long_description: Vec<LocaleItem>,
    #[serde(default)]
    pub site_link: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vk_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speakerdeck_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub habr_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDays {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub place_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Event {
    pub id: i64,
    pub event_type_id: i64,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
    #[serde(default)]
    pub days: Vec<EventDays>,
    #[serde(default)]
    pub site_link: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub talk_ids: Vec<i64>,
}

impl Event {
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.days.iter().map(|d| d.start_date).min()
    }

    /// Own zone when set, otherwise the event type's.
    pub fn effective_time_zone<'a>(&'a self, event_type: Option<&'a EventType>) -> Option<&'a str> {
        self.time_zone
            .as_deref()
            .filter(|tz| !tz.trim().is_empty())
            .or_else(|| event_type.and_then(|et| et.time_zone.as_deref()))
            .filter(|tz| !tz.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Place {
    pub id: i64,
    #[serde(default)]
    pub city: Vec<LocaleItem>,
    #[serde(default)]
    pub venue_address: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_coordinates: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Talk {
    pub id: i64,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
    #[serde(default)]
    pub short_description: Vec<LocaleItem>,
    #[serde(default)]
    pub long_description: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talk_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub presentation_links: Vec<String>,
    #[serde(default)]
    pub material_links: Vec<String>,
    #[serde(default)]
    pub video_links: Vec<String>,
    #[serde(default)]
    pub speaker_ids: Vec<i64>,
}

impl Talk {
    /// Day, track and start time are all known.
    pub fn is_fully_scheduled(&self) -> bool {
        self.talk_day.is_some() && self.track.is_some() && self.track_time.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Speaker {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_updated_at: Option<NaiveDateTime>,
    /// Remote photo location; only fresh CMS records carry it.
    #[serde(default, skip_serializing)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
    #[serde(default)]
    pub company_ids: Vec<i64>,
    #[serde(default)]
    pub bio: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub habr: Option<String>,
    #[serde(default)]
    pub java_champion: bool,
    #[serde(default)]
    pub mvp: bool,
    #[serde(default)]
    pub mvp_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Company {
    pub id: i64,
    #[serde(default)]
    pub name: Vec<LocaleItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_link: Option<String>,
}

identified!(Organizer, EntityKind::Organizer);
identified!(EventType, EntityKind::EventType);
identified!(Event, EntityKind::Event);
identified!(Place, EntityKind::Place);
identified!(Talk, EntityKind::Talk);
identified!(Speaker, EntityKind::Speaker);
identified!(Company, EntityKind::Company);

/// Monotonic id allocator for one entity kind, seeded from the largest existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSequence {
    last: i64,
}

impl IdSequence {
    pub fn starting_after(last: i64) -> Self {
        Self { last }
    }

    /// Seeds from `max(ids)`, or `-1` for an empty collection.
    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            last: ids.into_iter().max().unwrap_or(-1),
        }
    }

    pub fn next_id(&mut self) -> i64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> i64 {
        self.last
    }
}

/// Descending allocator for temporary (negative) ids inside a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempIdSequence {
    next: i64,
}

impl TempIdSequence {
    /// Continues below the smallest id already present (and never above `-1`).
    pub fn below(ids: impl IntoIterator<Item = i64>) -> Self {
        let min = ids.into_iter().min().unwrap_or(0).min(0);
        Self { next: min - 1 }
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next -= 1;
        id
    }
}

/// Three-way diff produced per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet<T> {
    pub to_create: Vec<T>,
    pub to_update: Vec<T>,
    pub to_delete: Vec<T>,
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

impl<T: Identified + Clone> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Apply to a curated collection: drop deletions, replace updates by id, append creations.
    pub fn apply_to(&self, items: &mut Vec<T>) {
        let deleted: HashSet<i64> = self.to_delete.iter().map(Identified::id).collect();
        items.retain(|item| !deleted.contains(&item.id()));
        for updated in &self.to_update {
            if let Some(slot) = items.iter_mut().find(|item| item.id() == updated.id()) {
                *slot = updated.clone();
            }
        }
        items.extend(self.to_create.iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoDownload {
    pub speaker_id: i64,
    pub url: String,
    pub file_name: String,
}

impl PhotoDownload {
    pub fn file_name_for(speaker_id: i64) -> String {
        format!("{speaker_id:04}.jpg")
    }
}

/// The complete curated store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceData {
    #[serde(default)]
    pub organizers: Vec<Organizer>,
    #[serde(default)]
    pub event_types: Vec<EventType>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub places: Vec<Place>,
    #[serde(default)]
    pub talks: Vec<Talk>,
    #[serde(default)]
    pub speakers: Vec<Speaker>,
    #[serde(default)]
    pub companies: Vec<Company>,
}

/// One event freshly fetched from a CMS, linked internally by temporary ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub conference: Conference,
    pub start_date: NaiveDate,
    pub event: Event,
    #[serde(default)]
    pub places: Vec<Place>,
    #[serde(default)]
    pub talks: Vec<Talk>,
    #[serde(default)]
    pub speakers: Vec<Speaker>,
    #[serde(default)]
    pub companies: Vec<Company>,
}

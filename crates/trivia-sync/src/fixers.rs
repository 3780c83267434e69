//! Snapshot clean-up that runs before matching: talk filters, company and venue corrections,
//! speaker name and handle fixes.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{debug, info, warn};
use trivia_core::{
    localized_text, Company, Language, LocaleItem, Place, SourceSnapshot, Speaker, Talk,
    TempIdSequence,
};

use crate::keys::{localized_keys, normalize_key};
use crate::rules::{CompanyGroup, KnownSpeaker, NameFix, RuleSet, VenueFix};

const OPENING_AND_CLOSING_TALKS: [&str; 8] = [
    "Conference opening",
    "Conference closing",
    "School opening",
    "School closing",
    "Открытие",
    "Закрытие",
    "Открытие конференции",
    "Закрытие конференции",
];

pub trait SnapshotFixer: Send + Sync {
    fn apply(&self, snapshot: SourceSnapshot) -> Result<SourceSnapshot>;
}

#[derive(Default)]
pub struct NoopSnapshotFixer;

impl SnapshotFixer for NoopSnapshotFixer {
    fn apply(&self, snapshot: SourceSnapshot) -> Result<SourceSnapshot> {
        Ok(snapshot)
    }
}

/// Applies every rule-driven fixer in a fixed order and prunes what became unreachable.
pub struct RuleSnapshotFixer {
    rules: RuleSet,
}

impl RuleSnapshotFixer {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }
}

impl SnapshotFixer for RuleSnapshotFixer {
    fn apply(&self, mut snapshot: SourceSnapshot) -> Result<SourceSnapshot> {
        let fetched_talks = snapshot.talks.len();
        let talks = std::mem::take(&mut snapshot.talks);
        let talks = drop_invalid_talks(talks, &self.rules.talks.invalid_talks);
        let talks = drop_opening_and_closing_talks(talks);
        snapshot.talks = collapse_talk_duplicates(talks);

        fix_speaker_names(&mut snapshot.speakers, &self.rules.speakers.name_fixes);
        normalize_social_handles(&mut snapshot.speakers);
        drop_invalid_companies(&mut snapshot, &self.rules.companies.invalid_company_names());
        split_company_groups(&mut snapshot, &self.rules.companies.groups);
        fix_venue_addresses(&mut snapshot.places, &self.rules.places.venue_fixes);
        apply_known_speaker_ids(&mut snapshot, &self.rules.speakers.known_speakers);
        prune_unreferenced(&mut snapshot);

        info!(
            conference = %snapshot.conference,
            fetched_talks,
            talks = snapshot.talks.len(),
            speakers = snapshot.speakers.len(),
            companies = snapshot.companies.len(),
            "applied snapshot fixers"
        );
        Ok(snapshot)
    }
}

fn matches_any_name(items: &[LocaleItem], names: &HashSet<String>) -> bool {
    localized_keys(items).iter().any(|key| names.contains(key))
}

pub fn drop_invalid_talks(talks: Vec<Talk>, invalid_talks: &[String]) -> Vec<Talk> {
    let invalid: HashSet<String> = invalid_talks.iter().filter_map(|n| normalize_key(n)).collect();
    talks
        .into_iter()
        .filter(|talk| {
            let keep = !matches_any_name(&talk.name, &invalid);
            if !keep {
                debug!(talk_id = talk.id, "dropped invalid talk");
            }
            keep
        })
        .collect()
}

pub fn drop_opening_and_closing_talks(talks: Vec<Talk>) -> Vec<Talk> {
    let names: HashSet<String> = OPENING_AND_CLOSING_TALKS
        .iter()
        .filter_map(|n| normalize_key(n))
        .collect();
    talks
        .into_iter()
        .filter(|talk| !matches_any_name(&talk.name, &names))
        .collect()
}

/// Keeps one talk per name: the earliest fully scheduled slot by (day, track, time), else the first.
/// Talks sharing any localized name, in any language, count as one name.
pub fn collapse_talk_duplicates(talks: Vec<Talk>) -> Vec<Talk> {
    let mut groups: Vec<Vec<(usize, Talk)>> = Vec::new();
    let mut group_by_key: HashMap<String, usize> = HashMap::new();

    for (position, talk) in talks.into_iter().enumerate() {
        let keys = localized_keys(&talk.name);
        let mut slots: Vec<usize> = keys.iter().filter_map(|key| group_by_key.get(key).copied()).collect();
        slots.sort_unstable();
        slots.dedup();

        let slot = match slots.first() {
            Some(&slot) => slot,
            None => {
                groups.push(Vec::new());
                groups.len() - 1
            }
        };
        for &other in slots.iter().skip(1) {
            let moved = std::mem::take(&mut groups[other]);
            groups[slot].extend(moved);
            for target in group_by_key.values_mut() {
                if *target == other {
                    *target = slot;
                }
            }
        }
        groups[slot].push((position, talk));
        for key in keys {
            group_by_key.insert(key, slot);
        }
    }

    groups
        .into_iter()
        .filter_map(|mut group| {
            if group.len() > 1 {
                debug!(talk_ids = ?group.iter().map(|(_, t)| t.id).collect::<Vec<_>>(), "collapsing duplicate talks");
            }
            group.sort_by_key(|(position, talk)| {
                if talk.is_fully_scheduled() {
                    (0, talk.talk_day, talk.track, talk.track_time, *position)
                } else {
                    (1, None, None, None, *position)
                }
            });
            group.into_iter().next().map(|(_, talk)| talk)
        })
        .collect()
}

/// Removes blank and block-listed companies and every speaker reference to them.
pub fn drop_invalid_companies(snapshot: &mut SourceSnapshot, invalid_names: &[&str]) {
    let invalid: HashSet<String> = invalid_names.iter().filter_map(|n| normalize_key(n)).collect();
    let dropped: HashSet<i64> = snapshot
        .companies
        .iter()
        .filter(|c| localized_keys(&c.name).is_empty() || matches_any_name(&c.name, &invalid))
        .map(|c| c.id)
        .collect();
    if dropped.is_empty() {
        return;
    }
    debug!(company_ids = ?dropped, "dropped invalid companies");
    snapshot.companies.retain(|c| !dropped.contains(&c.id));
    for speaker in &mut snapshot.speakers {
        speaker.company_ids.retain(|id| !dropped.contains(id));
    }
}

/// Replaces a "CompanyA, CompanyB" company reference with one reference per member.
pub fn split_company_groups(snapshot: &mut SourceSnapshot, groups: &[CompanyGroup]) {
    if groups.is_empty() {
        return;
    }
    let group_items: HashMap<String, &[String]> = groups
        .iter()
        .filter_map(|g| normalize_key(&g.name).map(|key| (key, g.items.as_slice())))
        .collect();

    let mut temp_ids = TempIdSequence::below(snapshot.companies.iter().map(|c| c.id));
    let mut expansions: HashMap<i64, Vec<i64>> = HashMap::new();

    let group_companies: Vec<(i64, &[String])> = snapshot
        .companies
        .iter()
        .filter_map(|c| {
            localized_keys(&c.name)
                .iter()
                .find_map(|key| group_items.get(key).copied())
                .map(|items| (c.id, items))
        })
        .collect();

    for (group_id, items) in group_companies {
        let mut member_ids = Vec::new();
        for item in items {
            let Some(item_key) = normalize_key(item) else {
                continue;
            };
            let existing = snapshot
                .companies
                .iter()
                .find(|c| localized_keys(&c.name).contains(&item_key))
                .map(|c| c.id);
            let member_id = match existing {
                Some(id) => id,
                None => {
                    let id = temp_ids.next_id();
                    snapshot.companies.push(Company {
                        id,
                        name: vec![LocaleItem::new(Language::English, item.trim())],
                        site_link: None,
                    });
                    id
                }
            };
            member_ids.push(member_id);
        }
        debug!(group_id, ?member_ids, "split company group");
        expansions.insert(group_id, member_ids);
    }

    for speaker in &mut snapshot.speakers {
        if !speaker.company_ids.iter().any(|id| expansions.contains_key(id)) {
            continue;
        }
        let mut company_ids = Vec::new();
        for id in &speaker.company_ids {
            let replaced = expansions.get(id).cloned().unwrap_or_else(|| vec![*id]);
            for member in replaced {
                if !company_ids.contains(&member) {
                    company_ids.push(member);
                }
            }
        }
        speaker.company_ids = company_ids;
    }
}

/// First rule whose city and address both match exactly.
pub fn fixed_venue_address<'r>(city: &str, venue_address: &str, fixes: &'r [VenueFix]) -> Option<&'r str> {
    fixes
        .iter()
        .find(|fix| fix.city == city && fix.venue_address == venue_address)
        .map(|fix| fix.new_venue_address.as_str())
}

pub fn fix_venue_addresses(places: &mut [Place], fixes: &[VenueFix]) {
    for place in places {
        for language in Language::ALL {
            let Some(city) = localized_text(&place.city, language).map(str::to_string) else {
                continue;
            };
            for item in place
                .venue_address
                .iter_mut()
                .filter(|item| item.language == language.code())
            {
                if let Some(fixed) = fixed_venue_address(&city, &item.text, fixes) {
                    debug!(place_id = place.id, city = %city, from = %item.text, to = fixed, "fixed venue address");
                    item.text = fixed.to_string();
                }
            }
        }
    }
}

pub fn fix_speaker_names(speakers: &mut [Speaker], fixes: &[NameFix]) {
    for speaker in speakers {
        for item in &mut speaker.name {
            if let Some(fix) = fixes.iter().find(|fix| fix.from == item.text) {
                item.text = fix.to.clone();
            }
        }
    }
}

fn extract_handle(value: &str, hosts: &[&str]) -> Option<String> {
    let mut rest = value.trim();
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
        }
    }
    rest = rest.strip_prefix("www.").unwrap_or(rest);
    for host in hosts {
        if let Some(stripped) = rest.strip_prefix(host) {
            rest = stripped;
            break;
        }
    }
    let handle = rest
        .trim_start_matches('/')
        .trim_start_matches('@')
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    (!handle.is_empty()).then(|| handle.to_string())
}

pub fn extract_twitter(value: &str) -> Option<String> {
    extract_handle(value, &["twitter.com", "mobile.twitter.com", "x.com"])
}

pub fn extract_github(value: &str) -> Option<String> {
    extract_handle(value, &["github.com"])
}

pub fn normalize_social_handles(speakers: &mut [Speaker]) {
    for speaker in speakers {
        speaker.twitter = speaker.twitter.as_deref().and_then(extract_twitter);
        speaker.github = speaker.github.as_deref().and_then(extract_github);
    }
}

/// Pins fresh speakers listed in the known-speaker table to their curated ids and rewires talks.
pub fn apply_known_speaker_ids(snapshot: &mut SourceSnapshot, known: &[KnownSpeaker]) {
    let company_names: HashMap<i64, Vec<String>> = snapshot
        .companies
        .iter()
        .map(|c| (c.id, localized_keys(&c.name)))
        .collect();
    let mut rewired: HashMap<i64, i64> = HashMap::new();

    for entry in known {
        let Some(name_key) = normalize_key(&entry.name) else {
            continue;
        };
        let company_key = entry.company.as_deref().and_then(normalize_key);
        let mut candidates = snapshot.speakers.iter().filter(|speaker| {
            localized_keys(&speaker.name).contains(&name_key)
                && company_key.as_ref().map_or(true, |company| {
                    speaker.company_ids.iter().any(|id| {
                        company_names
                            .get(id)
                            .is_some_and(|names| names.contains(company))
                    })
                })
        });
        let Some(speaker) = candidates.next() else {
            continue;
        };
        if candidates.next().is_some() {
            warn!(name = %entry.name, "known speaker entry matches several fresh speakers; using the first");
        }
        if speaker.id != entry.id {
            debug!(from = speaker.id, to = entry.id, name = %entry.name, "pinned known speaker id");
            rewired.insert(speaker.id, entry.id);
        }
    }

    if rewired.is_empty() {
        return;
    }
    for speaker in &mut snapshot.speakers {
        if let Some(id) = rewired.get(&speaker.id) {
            speaker.id = *id;
        }
    }
    for talk in &mut snapshot.talks {
        for speaker_id in &mut talk.speaker_ids {
            if let Some(id) = rewired.get(speaker_id) {
                *speaker_id = *id;
            }
        }
    }
}

/// Drops event talk references, speakers and companies no surviving record points at.
pub fn prune_unreferenced(snapshot: &mut SourceSnapshot) {
    let talk_ids: HashSet<i64> = snapshot.talks.iter().map(|t| t.id).collect();
    snapshot.event.talk_ids.retain(|id| talk_ids.contains(id));

    let speaker_ids: HashSet<i64> = snapshot
        .talks
        .iter()
        .flat_map(|t| t.speaker_ids.iter().copied())
        .collect();
    snapshot.speakers.retain(|s| speaker_ids.contains(&s.id));

    let company_ids: HashSet<i64> = snapshot
        .speakers
        .iter()
        .flat_map(|s| s.company_ids.iter().copied())
        .collect();
    snapshot.companies.retain(|c| company_ids.contains(&c.id));
}

//! Whole-store checks: identity before diffing, referential integrity after projection.

use std::collections::{HashMap, HashSet};

use trivia_core::{EntityKind, Identified, SourceData, Speaker};

use crate::error::{ReconcileError, Result};
use crate::keys::localized_keys;

fn check_unique_ids<T: Identified>(items: &[T]) -> Result<HashSet<i64>> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.id()) {
            return Err(ReconcileError::DuplicateIdentity {
                kind: T::KIND,
                detail: format!("id {} occurs more than once", item.id()),
            });
        }
    }
    Ok(seen)
}

fn sorted_companies(speaker: &Speaker) -> Vec<i64> {
    let mut ids = speaker.company_ids.clone();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Two speakers sharing a display name must differ by company set, and neither may lack one.
pub fn check_speaker_names(speakers: &[Speaker]) -> Result<()> {
    let mut by_name: HashMap<String, Vec<&Speaker>> = HashMap::new();
    for speaker in speakers {
        for key in localized_keys(&speaker.name) {
            by_name.entry(key).or_default().push(speaker);
        }
    }

    let mut names: Vec<_> = by_name.into_iter().filter(|(_, v)| v.len() > 1).collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, namesakes) in names {
        if let Some(bare) = namesakes.iter().find(|s| s.company_ids.is_empty()) {
            return Err(ReconcileError::DuplicateIdentity {
                kind: EntityKind::Speaker,
                detail: format!(
                    "speaker {} shares the name `{name}` with another speaker and has no company; add a company",
                    bare.id
                ),
            });
        }
        for (i, left) in namesakes.iter().enumerate() {
            for right in &namesakes[i + 1..] {
                if sorted_companies(left) == sorted_companies(right) {
                    return Err(ReconcileError::DuplicateIdentity {
                        kind: EntityKind::Speaker,
                        detail: format!(
                            "speakers {} and {} share the name `{name}` and the same companies; change a company",
                            left.id, right.id
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Fatal identity problems in the curated store, checked before any diffing.
pub fn validate_curated(data: &SourceData) -> Result<()> {
    check_unique_ids(&data.organizers)?;
    check_unique_ids(&data.event_types)?;
    check_unique_ids(&data.events)?;
    check_unique_ids(&data.places)?;
    check_unique_ids(&data.talks)?;
    check_unique_ids(&data.speakers)?;
    check_unique_ids(&data.companies)?;
    check_speaker_names(&data.speakers)
}

fn require(
    ids: &HashSet<i64>,
    kind: EntityKind,
    id: i64,
    referenced_by: impl FnOnce() -> String,
) -> Result<()> {
    if ids.contains(&id) {
        Ok(())
    } else {
        Err(ReconcileError::UnresolvedReference {
            kind,
            id,
            referenced_by: referenced_by(),
        })
    }
}

/// Every cross-kind reference resolves.
pub fn validate_references(data: &SourceData) -> Result<()> {
    let organizer_ids = check_unique_ids(&data.organizers)?;
    let event_type_ids = check_unique_ids(&data.event_types)?;
    let place_ids = check_unique_ids(&data.places)?;
    let talk_ids = check_unique_ids(&data.talks)?;
    let speaker_ids = check_unique_ids(&data.speakers)?;
    let company_ids = check_unique_ids(&data.companies)?;

    for event_type in &data.event_types {
        if let Some(organizer_id) = event_type.organizer_id {
            require(&organizer_ids, EntityKind::Organizer, organizer_id, || {
                format!("event type {}", event_type.id)
            })?;
        }
    }
    for event in &data.events {
        require(&event_type_ids, EntityKind::EventType, event.event_type_id, || {
            format!("event {}", event.id)
        })?;
        for day in &event.days {
            require(&place_ids, EntityKind::Place, day.place_id, || {
                format!("event {} day {}", event.id, day.start_date)
            })?;
        }
        for talk_id in &event.talk_ids {
            require(&talk_ids, EntityKind::Talk, *talk_id, || format!("event {}", event.id))?;
        }
    }
    for talk in &data.talks {
        for speaker_id in &talk.speaker_ids {
            require(&speaker_ids, EntityKind::Speaker, *speaker_id, || {
                format!("talk {}", talk.id)
            })?;
        }
    }
    for speaker in &data.speakers {
        for company_id in &speaker.company_ids {
            require(&company_ids, EntityKind::Company, *company_id, || {
                format!("speaker {}", speaker.id)
            })?;
        }
    }
    Ok(())
}

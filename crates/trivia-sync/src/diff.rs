//! Three-way reconciliation of one fresh snapshot against the curated store.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use trivia_core::{
    ChangeSet, Company, EntityKind, Event, EventType, IdSequence, PhotoDownload, Place,
    SourceData, SourceSnapshot, Speaker, Talk,
};
use trivia_storage::{EntityChangeSet, ImageProbe};

use crate::detect::{event_difference, photo_needs_update, NeedsUpdate};
use crate::error::{ReconcileError, Result};
use crate::fill::{merge_event, merge_event_type, merge_place, merge_speaker};
use crate::index::{Lookup, ResourceIndex};
use crate::keys::{localized_keys, IdentityKey};
use crate::matcher::{warn_near_misses, Keyed, Matcher, TALK_PARENT_PLAN};
use crate::rules::{CompanySynonyms, RuleSet};
use crate::validate::{validate_curated, validate_references};

/// One id sequence per kind, seeded from the curated store for the duration of a run.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    pub event_types: IdSequence,
    pub events: IdSequence,
    pub places: IdSequence,
    pub talks: IdSequence,
    pub speakers: IdSequence,
    pub companies: IdSequence,
}

impl IdAllocator {
    pub fn for_data(data: &SourceData) -> Self {
        Self {
            event_types: IdSequence::from_ids(data.event_types.iter().map(|e| e.id)),
            events: IdSequence::from_ids(data.events.iter().map(|e| e.id)),
            places: IdSequence::from_ids(data.places.iter().map(|p| p.id)),
            talks: IdSequence::from_ids(data.talks.iter().map(|t| t.id)),
            speakers: IdSequence::from_ids(data.speakers.iter().map(|s| s.id)),
            companies: IdSequence::from_ids(data.companies.iter().map(|c| c.id)),
        }
    }
}

/// A kind's change-set plus where every fresh id ended up.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub change_set: ChangeSet<T>,
    pub id_map: HashMap<i64, i64>,
}

impl<T> Default for Reconciled<T> {
    fn default() -> Self {
        Self {
            change_set: ChangeSet::default(),
            id_map: HashMap::new(),
        }
    }
}

/// Maps a fresh id to its final one. Non-negative ids pass through; an unknown temporary id is fatal.
pub fn remap_id(id: i64, id_map: &HashMap<i64, i64>, kind: EntityKind, referenced_by: &str) -> Result<i64> {
    match id_map.get(&id) {
        Some(mapped) => Ok(*mapped),
        None if id >= 0 => Ok(id),
        None => Err(ReconcileError::UnresolvedReference {
            kind,
            id,
            referenced_by: referenced_by.to_string(),
        }),
    }
}

pub fn remap_ids(
    ids: &[i64],
    id_map: &HashMap<i64, i64>,
    kind: EntityKind,
    referenced_by: &str,
) -> Result<Vec<i64>> {
    ids.iter()
        .map(|id| remap_id(*id, id_map, kind, referenced_by))
        .collect()
}

fn build_index<'a, T: Keyed>(items: impl IntoIterator<Item = &'a T>) -> Result<ResourceIndex<'a, T>>
where
    T: 'a,
{
    ResourceIndex::build(items, &T::strategies())
}

/// Companies are append-only: matched ones are reused as-is, unmatched ones are created once per name.
pub fn reconcile_companies(
    fresh: &[Company],
    curated: &[Company],
    synonyms: &[CompanySynonyms],
    ids: &mut IdSequence,
) -> Result<Reconciled<Company>> {
    let index = build_index(curated)?.with_synonyms(synonyms)?;
    let matcher = Matcher::new(&index);
    let mut out = Reconciled::default();
    let mut created_by_name: HashMap<String, i64> = HashMap::new();

    for company in fresh {
        let names = localized_keys(&company.name);
        if names.is_empty() {
            debug!(company_id = company.id, "skipping company without a name");
            continue;
        }
        if let Some(found) = matcher.resolve(company)? {
            out.id_map.insert(company.id, found.id);
            continue;
        }
        if let Some(id) = names.iter().find_map(|name| created_by_name.get(name)) {
            out.id_map.insert(company.id, *id);
            continue;
        }

        warn_near_misses(&index, company);
        let id = ids.next_id();
        for name in names {
            created_by_name.insert(name, id);
        }
        out.id_map.insert(company.id, id);
        out.change_set.to_create.push(Company {
            id,
            ..company.clone()
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct SpeakerOutcome {
    pub reconciled: Reconciled<Speaker>,
    pub photos: Vec<PhotoDownload>,
}

pub async fn reconcile_speakers(
    fresh: &[Speaker],
    curated: &[Speaker],
    company_ids: &HashMap<i64, i64>,
    ids: &mut IdSequence,
    probe: &dyn ImageProbe,
) -> Result<SpeakerOutcome> {
    let index = build_index(curated)?;
    let matcher = Matcher::new(&index);
    let mut out = SpeakerOutcome::default();
    let mut touched: HashSet<i64> = HashSet::new();

    for speaker in fresh {
        let mut candidate = speaker.clone();
        candidate.company_ids = remap_ids(
            &speaker.company_ids,
            company_ids,
            EntityKind::Company,
            &format!("speaker {}", speaker.id),
        )?;

        match matcher.resolve(&candidate)? {
            Some(existing) => {
                out.reconciled.id_map.insert(speaker.id, existing.id);
                if !touched.insert(existing.id) {
                    warn!(speaker_id = existing.id, fresh_id = speaker.id, "speaker matched twice; keeping the first");
                    continue;
                }
                let mut merged = merge_speaker(candidate, existing);
                if let Some(url) = speaker.photo_url.as_deref() {
                    let file_name = existing
                        .photo_file_name
                        .clone()
                        .unwrap_or_else(|| PhotoDownload::file_name_for(existing.id));
                    if photo_needs_update(
                        speaker.photo_updated_at,
                        existing.photo_updated_at,
                        probe,
                        url,
                        &file_name,
                    )
                    .await
                    {
                        out.photos.push(PhotoDownload {
                            speaker_id: existing.id,
                            url: url.to_string(),
                            file_name: file_name.clone(),
                        });
                        merged.photo_file_name = Some(file_name);
                    }
                }
                if let Some(field) = merged.first_difference(existing) {
                    debug!(speaker_id = existing.id, field, "speaker changed");
                    out.reconciled.change_set.to_update.push(merged);
                }
            }
            None => {
                warn_near_misses(&index, &candidate);
                let id = ids.next_id();
                out.reconciled.id_map.insert(speaker.id, id);
                candidate.id = id;
                candidate.photo_url = None;
                if let Some(url) = speaker.photo_url.as_deref() {
                    let file_name = PhotoDownload::file_name_for(id);
                    out.photos.push(PhotoDownload {
                        speaker_id: id,
                        url: url.to_string(),
                        file_name: file_name.clone(),
                    });
                    candidate.photo_file_name = Some(file_name);
                }
                out.reconciled.change_set.to_create.push(candidate);
            }
        }
    }
    Ok(out)
}

/// The curated event a fresh event refreshes, if any.
pub fn find_resource_event<'a>(fresh: &Event, curated_events: &'a [Event]) -> Result<Option<&'a Event>> {
    let index = build_index(curated_events)?;
    Matcher::new(&index).resolve(fresh)
}

/// Matches talks inside the refreshed event first, then globally; deletes a dropped talk only
/// when no other curated event still lists it.
pub fn reconcile_talks(
    fresh: &[Talk],
    curated_talks: &[Talk],
    resource_event: Option<&Event>,
    all_events: &[Event],
    speaker_ids: &HashMap<i64, i64>,
    ids: &mut IdSequence,
) -> Result<Reconciled<Talk>> {
    let parent_talk_ids: HashSet<i64> = resource_event
        .map(|event| event.talk_ids.iter().copied().collect())
        .unwrap_or_default();
    let parent_index = ResourceIndex::build(
        curated_talks.iter().filter(|t| parent_talk_ids.contains(&t.id)),
        &Talk::strategies(),
    )?;
    let global_index = build_index(curated_talks)?;
    let parent_matcher = Matcher::with_plan(&parent_index, TALK_PARENT_PLAN);
    let global_matcher = Matcher::new(&global_index);

    let mut out = Reconciled::default();
    let mut matched: HashSet<i64> = HashSet::new();

    for talk in fresh {
        let mut candidate = talk.clone();
        candidate.speaker_ids = remap_ids(
            &talk.speaker_ids,
            speaker_ids,
            EntityKind::Speaker,
            &format!("talk {}", talk.id),
        )?;

        let found = match parent_matcher.resolve(&candidate)? {
            Some(existing) => Some(existing),
            None => global_matcher.resolve(&candidate)?,
        };
        match found {
            Some(existing) => {
                out.id_map.insert(talk.id, existing.id);
                if !matched.insert(existing.id) {
                    warn!(talk_id = existing.id, fresh_id = talk.id, "talk matched twice; keeping the first");
                    continue;
                }
                candidate.id = existing.id;
                if let Some(field) = candidate.first_difference(existing) {
                    debug!(talk_id = existing.id, field, "talk changed");
                    out.change_set.to_update.push(candidate);
                }
            }
            None => {
                let id = ids.next_id();
                out.id_map.insert(talk.id, id);
                candidate.id = id;
                out.change_set.to_create.push(candidate);
            }
        }
    }

    if let Some(event) = resource_event {
        for talk_id in &event.talk_ids {
            if matched.contains(talk_id) {
                continue;
            }
            let shared = all_events
                .iter()
                .any(|other| other.id != event.id && other.talk_ids.contains(talk_id));
            if shared {
                debug!(talk_id, "dropped talk is still listed by another event");
                continue;
            }
            if let Some(talk) = curated_talks.iter().find(|t| t.id == *talk_id) {
                out.change_set.to_delete.push(talk.clone());
            }
        }
    }
    Ok(out)
}

/// Places are matched and updated, never deleted.
pub fn reconcile_places(fresh: &[Place], curated: &[Place], ids: &mut IdSequence) -> Result<Reconciled<Place>> {
    let index = build_index(curated)?;
    let matcher = Matcher::new(&index);
    let mut out = Reconciled::default();

    for place in fresh {
        match matcher.resolve(place)? {
            Some(existing) => {
                out.id_map.insert(place.id, existing.id);
                let merged = merge_place(place.clone(), existing);
                if merged.needs_update(existing) {
                    out.change_set.to_update.push(merged);
                }
            }
            None => {
                let id = ids.next_id();
                out.id_map.insert(place.id, id);
                out.change_set.to_create.push(Place {
                    id,
                    ..place.clone()
                });
            }
        }
    }
    Ok(out)
}

/// Event types are matched by conference only; never deleted.
pub fn reconcile_event_types(
    fresh: &[EventType],
    curated: &[EventType],
    ids: &mut IdSequence,
) -> Result<Reconciled<EventType>> {
    let index = build_index(curated)?;
    let matcher = Matcher::new(&index);
    let mut out = Reconciled::default();

    for event_type in fresh {
        match matcher.resolve(event_type)? {
            Some(existing) => {
                out.id_map.insert(event_type.id, existing.id);
                let merged = merge_event_type(event_type.clone(), existing);
                if let Some(field) = merged.first_difference(existing) {
                    debug!(event_type_id = existing.id, field, "event type changed");
                    out.change_set.to_update.push(merged);
                }
            }
            None => {
                let id = ids.next_id();
                out.id_map.insert(event_type.id, id);
                out.change_set.to_create.push(EventType {
                    id,
                    ..event_type.clone()
                });
            }
        }
    }
    Ok(out)
}

/// `fresh` must already reference final place and talk ids.
pub fn reconcile_event(
    fresh: Event,
    resource_event: Option<&Event>,
    event_type: &EventType,
    ids: &mut IdSequence,
) -> Reconciled<Event> {
    let mut out = Reconciled::default();
    let fresh_id = fresh.id;
    match resource_event {
        Some(existing) => {
            out.id_map.insert(fresh_id, existing.id);
            let merged = merge_event(fresh, existing);
            if let Some(field) = event_difference(&merged, existing, Some(event_type)) {
                debug!(event_id = existing.id, field, "event changed");
                out.change_set.to_update.push(merged);
            }
        }
        None => {
            let id = ids.next_id();
            out.id_map.insert(fresh_id, id);
            out.change_set.to_create.push(Event { id, ..fresh });
        }
    }
    out
}

/// Speakers referenced by deleted talks and by no surviving talk.
pub fn orphaned_speakers(deleted_talks: &[Talk], surviving_talks: &[Talk], curated: &[Speaker]) -> Vec<Speaker> {
    let candidates: HashSet<i64> = deleted_talks
        .iter()
        .flat_map(|t| t.speaker_ids.iter().copied())
        .collect();
    let still_used: HashSet<i64> = surviving_talks
        .iter()
        .flat_map(|t| t.speaker_ids.iter().copied())
        .collect();
    curated
        .iter()
        .filter(|s| candidates.contains(&s.id) && !still_used.contains(&s.id))
        .cloned()
        .collect()
}

/// Companies referenced by deleted speakers and by no surviving speaker.
pub fn orphaned_companies(
    deleted_speakers: &[Speaker],
    surviving_speakers: &[Speaker],
    curated: &[Company],
) -> Vec<Company> {
    let candidates: HashSet<i64> = deleted_speakers
        .iter()
        .flat_map(|s| s.company_ids.iter().copied())
        .collect();
    let still_used: HashSet<i64> = surviving_speakers
        .iter()
        .flat_map(|s| s.company_ids.iter().copied())
        .collect();
    curated
        .iter()
        .filter(|c| candidates.contains(&c.id) && !still_used.contains(&c.id))
        .cloned()
        .collect()
}

/// Everything one run decided, ready to be written or applied.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunChanges {
    pub event_types: ChangeSet<EventType>,
    pub events: ChangeSet<Event>,
    pub places: ChangeSet<Place>,
    pub talks: ChangeSet<Talk>,
    pub speakers: ChangeSet<Speaker>,
    pub companies: ChangeSet<Company>,
    pub photos: Vec<PhotoDownload>,
}

impl RunChanges {
    pub fn apply_to(&self, data: &mut SourceData) {
        self.event_types.apply_to(&mut data.event_types);
        self.events.apply_to(&mut data.events);
        self.places.apply_to(&mut data.places);
        self.talks.apply_to(&mut data.talks);
        self.speakers.apply_to(&mut data.speakers);
        self.companies.apply_to(&mut data.companies);
    }

    pub fn entity_change_sets(&self) -> Vec<EntityChangeSet<'_>> {
        vec![
            EntityChangeSet::EventTypes(&self.event_types),
            EntityChangeSet::Places(&self.places),
            EntityChangeSet::Companies(&self.companies),
            EntityChangeSet::Speakers(&self.speakers),
            EntityChangeSet::Talks(&self.talks),
            EntityChangeSet::Events(&self.events),
        ]
    }

    /// Creates, updates and deletes summed over every kind.
    pub fn totals(&self) -> (usize, usize, usize) {
        self.entity_change_sets()
            .iter()
            .map(EntityChangeSet::counts)
            .fold((0, 0, 0), |acc, c| (acc.0 + c.0, acc.1 + c.1, acc.2 + c.2))
    }

    pub fn is_empty(&self) -> bool {
        self.totals() == (0, 0, 0) && self.photos.is_empty()
    }
}

/// The single curated event type owning the snapshot's conference.
pub fn event_type_for_snapshot<'a>(
    snapshot: &SourceSnapshot,
    curated: &'a [EventType],
) -> Result<&'a EventType> {
    let index = build_index(curated)?;
    let key = IdentityKey::Conference(snapshot.conference);
    match index.lookup(&key) {
        Lookup::Found(event_type) => Ok(event_type),
        Lookup::Ambiguous(candidate_ids) => Err(ReconcileError::AmbiguousMatch {
            kind: EntityKind::EventType,
            key: key.to_string(),
            candidate_ids,
        }),
        Lookup::Miss => Err(ReconcileError::UnresolvedReference {
            kind: EntityKind::EventType,
            id: snapshot.event.event_type_id,
            referenced_by: format!("{} snapshot of {}", snapshot.conference, snapshot.start_date),
        }),
    }
}

/// Reconciles one already-fixed snapshot. Nothing is written; the result is validated by
/// projecting it onto a copy of the curated store.
pub async fn reconcile_snapshot(
    snapshot: &SourceSnapshot,
    curated: &SourceData,
    rules: &RuleSet,
    probe: &dyn ImageProbe,
) -> Result<RunChanges> {
    let span = info_span!("reconcile", conference = %snapshot.conference, start_date = %snapshot.start_date);
    async move {
        validate_curated(curated)?;

        let event_type = event_type_for_snapshot(snapshot, &curated.event_types)?;

        let mut ids = IdAllocator::for_data(curated);
        let companies = reconcile_companies(
            &snapshot.companies,
            &curated.companies,
            &rules.companies.synonyms,
            &mut ids.companies,
        )?;
        let mut speakers = reconcile_speakers(
            &snapshot.speakers,
            &curated.speakers,
            &companies.id_map,
            &mut ids.speakers,
            probe,
        )
        .await?;
        let places = reconcile_places(&snapshot.places, &curated.places, &mut ids.places)?;

        let mut fresh_event = snapshot.event.clone();
        fresh_event.event_type_id = event_type.id;
        let resource_event = find_resource_event(&fresh_event, &curated.events)?;
        match resource_event {
            Some(event) => debug!(event_id = event.id, "refreshing existing event"),
            None => debug!("no curated event for this snapshot"),
        }

        let mut talks = reconcile_talks(
            &snapshot.talks,
            &curated.talks,
            resource_event,
            &curated.events,
            &speakers.reconciled.id_map,
            &mut ids.talks,
        )?;

        let referenced_by = format!("event {}", fresh_event.id);
        fresh_event.talk_ids = remap_ids(&fresh_event.talk_ids, &talks.id_map, EntityKind::Talk, &referenced_by)?;
        for day in &mut fresh_event.days {
            day.place_id = remap_id(day.place_id, &places.id_map, EntityKind::Place, &referenced_by)?;
        }
        let events = reconcile_event(fresh_event, resource_event, event_type, &mut ids.events);

        let mut projected_talks = curated.talks.clone();
        talks.change_set.apply_to(&mut projected_talks);
        speakers.reconciled.change_set.to_delete =
            orphaned_speakers(&talks.change_set.to_delete, &projected_talks, &curated.speakers);

        let mut projected_speakers = curated.speakers.clone();
        speakers.reconciled.change_set.apply_to(&mut projected_speakers);
        let mut companies = companies;
        companies.change_set.to_delete = orphaned_companies(
            &speakers.reconciled.change_set.to_delete,
            &projected_speakers,
            &curated.companies,
        );

        let changes = RunChanges {
            event_types: ChangeSet::default(),
            events: events.change_set,
            places: places.change_set,
            talks: talks.change_set,
            speakers: speakers.reconciled.change_set,
            companies: companies.change_set,
            photos: speakers.photos,
        };

        let mut projected = curated.clone();
        changes.apply_to(&mut projected);
        validate_references(&projected)?;

        let (created, updated, deleted) = changes.totals();
        info!(created, updated, deleted, photos = changes.photos.len(), "reconciled snapshot");
        Ok::<_, ReconcileError>(changes)
    }
    .instrument(span)
    .await
}

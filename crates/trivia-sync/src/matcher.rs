//! Resolves one fresh entity to at most one curated entity by trying strategies in order.

use strsim::jaro_winkler;
use tracing::warn;
use trivia_core::{Company, Event, EventType, Identified, Place, Speaker, Talk};

use crate::error::{ReconcileError, Result};
use crate::index::{Lookup, ResourceIndex};
use crate::keys::{self, IdentityKey};

/// Similarity above which an unmatched name is reported as a probable typo.
pub const NEAR_MISS_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Fresh record already carries a curated id (`>= 0`).
    Id,
    NameCompany,
    Name,
    CityVenue,
    Conference,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnAmbiguous {
    /// Abort the run; the operator must disambiguate the curated data.
    Fail,
    /// Warn and try the next key or strategy.
    FallThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStep {
    pub strategy: MatchStrategy,
    pub on_ambiguous: OnAmbiguous,
}

const fn step(strategy: MatchStrategy, on_ambiguous: OnAmbiguous) -> MatchStep {
    MatchStep {
        strategy,
        on_ambiguous,
    }
}

const ID: MatchStep = step(MatchStrategy::Id, OnAmbiguous::Fail);

/// Entities with a fixed strategy plan and keys for each strategy.
pub trait Keyed: Identified {
    const PLAN: &'static [MatchStep];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey>;

    fn strategies() -> Vec<MatchStrategy> {
        Self::PLAN
            .iter()
            .map(|s| s.strategy)
            .filter(|s| *s != MatchStrategy::Id)
            .collect()
    }
}

impl Keyed for Company {
    const PLAN: &'static [MatchStep] = &[ID, step(MatchStrategy::Name, OnAmbiguous::Fail)];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::Name => keys::company_keys(self),
            _ => Vec::new(),
        }
    }
}

impl Keyed for Speaker {
    const PLAN: &'static [MatchStep] = &[
        ID,
        step(MatchStrategy::NameCompany, OnAmbiguous::FallThrough),
        step(MatchStrategy::Name, OnAmbiguous::Fail),
    ];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::NameCompany => keys::speaker_name_company_keys(self),
            MatchStrategy::Name => keys::speaker_name_keys(self),
            _ => Vec::new(),
        }
    }
}

/// Talks inside the parent event are matched by name only.
pub const TALK_PARENT_PLAN: &[MatchStep] = &[step(MatchStrategy::Name, OnAmbiguous::FallThrough)];

impl Keyed for Talk {
    const PLAN: &'static [MatchStep] = &[ID, step(MatchStrategy::Name, OnAmbiguous::FallThrough)];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::Name => keys::talk_keys(self),
            _ => Vec::new(),
        }
    }
}

impl Keyed for Place {
    const PLAN: &'static [MatchStep] = &[ID, step(MatchStrategy::CityVenue, OnAmbiguous::FallThrough)];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::CityVenue => keys::place_keys(self),
            _ => Vec::new(),
        }
    }
}

/// Event types without a conference never match and are appended.
impl Keyed for EventType {
    const PLAN: &'static [MatchStep] = &[ID, step(MatchStrategy::Conference, OnAmbiguous::Fail)];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::Conference => keys::event_type_conference_keys(self),
            _ => Vec::new(),
        }
    }
}

impl Keyed for Event {
    const PLAN: &'static [MatchStep] = &[ID, step(MatchStrategy::Schedule, OnAmbiguous::FallThrough)];

    fn identity_keys(&self, strategy: MatchStrategy) -> Vec<IdentityKey> {
        match strategy {
            MatchStrategy::Schedule => keys::event_schedule_keys(self),
            _ => Vec::new(),
        }
    }
}

pub struct Matcher<'i, 'a, T> {
    index: &'i ResourceIndex<'a, T>,
    plan: &'static [MatchStep],
}

impl<'i, 'a, T: Keyed> Matcher<'i, 'a, T> {
    pub fn new(index: &'i ResourceIndex<'a, T>) -> Self {
        Self {
            index,
            plan: T::PLAN,
        }
    }

    pub fn with_plan(index: &'i ResourceIndex<'a, T>, plan: &'static [MatchStep]) -> Self {
        Self { index, plan }
    }

    /// First unambiguous hit wins; an ambiguous hit either aborts or falls through per step.
    pub fn resolve(&self, fresh: &T) -> Result<Option<&'a T>> {
        for step in self.plan {
            if step.strategy == MatchStrategy::Id {
                if fresh.id() < 0 {
                    continue;
                }
                return match self.index.get(fresh.id()) {
                    Some(found) => Ok(Some(found)),
                    None => Err(ReconcileError::UnresolvedReference {
                        kind: T::KIND,
                        id: fresh.id(),
                        referenced_by: format!("fresh {}", T::KIND),
                    }),
                };
            }

            for key in fresh.identity_keys(step.strategy) {
                match self.index.lookup(&key) {
                    Lookup::Found(found) => return Ok(Some(found)),
                    Lookup::Miss => {}
                    Lookup::Ambiguous(candidate_ids) => match step.on_ambiguous {
                        OnAmbiguous::Fail => {
                            return Err(ReconcileError::AmbiguousMatch {
                                kind: T::KIND,
                                key: key.to_string(),
                                candidate_ids,
                            })
                        }
                        OnAmbiguous::FallThrough => {
                            warn!(kind = %T::KIND, %key, ?candidate_ids, "ambiguous key skipped");
                        }
                    },
                }
            }
        }
        Ok(None)
    }
}

/// Curated names close to, but not equal to, an unmatched fresh name.
pub fn near_misses<T: Keyed>(index: &ResourceIndex<'_, T>, fresh: &T) -> Vec<(String, f64)> {
    let fresh_names = fresh.identity_keys(MatchStrategy::Name);
    let mut hits = Vec::new();
    for key in index.keys() {
        let IdentityKey::Name(curated) = key else {
            continue;
        };
        for fresh_key in &fresh_names {
            let IdentityKey::Name(fresh_name) = fresh_key else {
                continue;
            };
            let score = jaro_winkler(fresh_name, curated);
            if score >= NEAR_MISS_THRESHOLD && fresh_name != curated {
                hits.push((curated.clone(), score));
            }
        }
    }
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    hits.dedup_by(|a, b| a.0 == b.0);
    hits
}

pub fn warn_near_misses<T: Keyed>(index: &ResourceIndex<'_, T>, fresh: &T) {
    for (curated, score) in near_misses(index, fresh) {
        warn!(kind = %T::KIND, fresh_id = fresh.id(), curated = %curated, score, "unmatched name is close to a curated one");
    }
}

//! Curated lookup maps, built once per kind per run.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::keys::{normalize_key, IdentityKey};
use crate::matcher::{Keyed, MatchStrategy};
use crate::rules::CompanySynonyms;

/// Outcome of a single key lookup.
#[derive(Debug)]
pub enum Lookup<'a, T> {
    Found(&'a T),
    Ambiguous(Vec<i64>),
    Miss,
}

/// Id map plus one key map covering every fuzzy strategy of the kind.
pub struct ResourceIndex<'a, T> {
    by_id: HashMap<i64, &'a T>,
    keys: HashMap<IdentityKey, Vec<i64>>,
}

impl<'a, T: Keyed> ResourceIndex<'a, T> {
    /// Duplicate ids are fatal; duplicate fuzzy keys are kept as ambiguous slots.
    pub fn build(items: impl IntoIterator<Item = &'a T>, strategies: &[MatchStrategy]) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut keys: HashMap<IdentityKey, Vec<i64>> = HashMap::new();

        for item in items {
            if by_id.insert(item.id(), item).is_some() {
                return Err(ReconcileError::DuplicateIdentity {
                    kind: T::KIND,
                    detail: format!("id {} occurs more than once", item.id()),
                });
            }
            for strategy in strategies {
                for key in item.identity_keys(*strategy) {
                    let ids = keys.entry(key).or_default();
                    if !ids.contains(&item.id()) {
                        ids.push(item.id());
                    }
                }
            }
        }

        let ambiguous = keys.values().filter(|ids| ids.len() > 1).count();
        debug!(kind = %T::KIND, entities = by_id.len(), keys = keys.len(), ambiguous, "built resource index");
        Ok(Self { by_id, keys })
    }

    pub fn get(&self, id: i64) -> Option<&'a T> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn lookup(&self, key: &IdentityKey) -> Lookup<'a, T> {
        match self.keys.get(key).map(Vec::as_slice) {
            None | Some([]) => Lookup::Miss,
            Some([id]) => self.get(*id).map_or(Lookup::Miss, Lookup::Found),
            Some(ids) => {
                let mut ids = ids.to_vec();
                ids.sort_unstable();
                Lookup::Ambiguous(ids)
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.keys.keys()
    }

    /// Point `key` at exactly one entity, replacing whatever the key resolved to before.
    pub fn alias(&mut self, key: IdentityKey, id: i64) {
        self.keys.insert(key, vec![id]);
    }
}

impl<'a> ResourceIndex<'a, trivia_core::Company> {
    /// Fold the synonym table in: each synonym resolves to the company indexed under its canonical name.
    pub fn with_synonyms(mut self, synonyms: &[CompanySynonyms]) -> Result<Self> {
        for entry in synonyms {
            let Some(canonical) = entry.name.as_deref().and_then(normalize_key) else {
                continue;
            };
            let canonical_key = IdentityKey::Name(canonical.clone());
            let company_id = match self.lookup(&canonical_key) {
                Lookup::Found(company) => company.id,
                Lookup::Ambiguous(candidate_ids) => {
                    return Err(ReconcileError::AmbiguousMatch {
                        kind: trivia_core::EntityKind::Company,
                        key: canonical_key.to_string(),
                        candidate_ids,
                    })
                }
                Lookup::Miss => {
                    return Err(ReconcileError::InvalidRules(format!(
                        "synonym target company `{canonical}` is not in the curated store"
                    )))
                }
            };
            for synonym in &entry.synonyms {
                let Some(synonym_key) = normalize_key(synonym) else {
                    continue;
                };
                if synonym_key == canonical {
                    return Err(ReconcileError::InvalidRules(format!(
                        "company `{canonical}` lists itself as a synonym"
                    )));
                }
                self.alias(IdentityKey::Name(synonym_key), company_id);
            }
        }
        Ok(self)
    }
}

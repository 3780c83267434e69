//! Cross-run rule tables loaded from `rules/*.yaml`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize};

/// Alternate spellings of one canonical company. A blank `name` marks the synonyms as invalid companies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompanySynonyms {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

/// A single fetched company value that stands for several companies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompanyGroup {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyRules {
    #[serde(default)]
    pub synonyms: Vec<CompanySynonyms>,
    #[serde(default)]
    pub groups: Vec<CompanyGroup>,
}

impl CompanyRules {
    pub fn invalid_company_names(&self) -> Vec<&str> {
        self.synonyms
            .iter()
            .filter(|entry| entry.name.as_deref().map_or(true, |name| name.trim().is_empty()))
            .flat_map(|entry| entry.synonyms.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TalkRules {
    #[serde(default)]
    pub invalid_talks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VenueFix {
    pub city: String,
    pub venue_address: String,
    pub new_venue_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceRules {
    #[serde(default)]
    pub venue_fixes: Vec<VenueFix>,
}

/// Pins a fresh speaker to a curated id when name matching alone cannot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KnownSpeaker {
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NameFix {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeakerRules {
    #[serde(default)]
    pub known_speakers: Vec<KnownSpeaker>,
    #[serde(default)]
    pub name_fixes: Vec<NameFix>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub companies: CompanyRules,
    pub talks: TalkRules,
    pub places: PlaceRules,
    pub speakers: SpeakerRules,
}

impl RuleSet {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        Ok(Self {
            companies: read_rules(&rules_dir, "companies.yaml")?,
            talks: read_rules(&rules_dir, "talks.yaml")?,
            places: read_rules(&rules_dir, "places.yaml")?,
            speakers: read_rules(&rules_dir, "speakers.yaml")?,
        })
    }
}

fn read_rules<T: DeserializeOwned + Default>(rules_dir: &Path, file: &str) -> Result<T> {
    let path = rules_dir.join(file);
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading rules/{file}"))?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&text).with_context(|| format!("parsing rules/{file}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rule_files_are_empty_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = RuleSet::from_workspace_root(dir.path()).expect("rules");
        assert!(rules.companies.synonyms.is_empty());
        assert!(rules.talks.invalid_talks.is_empty());
        assert!(rules.places.venue_fixes.is_empty());
        assert!(rules.speakers.known_speakers.is_empty());
    }

    #[test]
    fn parses_rule_files_and_invalid_company_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).expect("mkdir");
        std::fs::write(
            rules_dir.join("companies.yaml"),
            "synonyms:\n  - name: EPAM Systems\n    synonyms: [EPAM]\n  - name: ''\n    synonyms: [Freelance, '-']\ngroups:\n  - name: JUG Ru Group, Yandex\n    items: [JUG Ru Group, Yandex]\n",
        )
        .expect("write companies");
        std::fs::write(
            rules_dir.join("places.yaml"),
            "venue_fixes:\n  - city: Moscow\n    venue_address: Old St\n    new_venue_address: New St\n",
        )
        .expect("write places");
        std::fs::write(
            rules_dir.join("speakers.yaml"),
            "known_speakers:\n  - name: Jane Doe\n    company: Acme\n    id: 42\nname_fixes:\n  - from: Алена\n    to: Алёна\n",
        )
        .expect("write speakers");

        let rules = RuleSet::from_workspace_root(dir.path()).expect("rules");
        assert_eq!(rules.companies.invalid_company_names(), vec!["Freelance", "-"]);
        assert_eq!(rules.companies.groups[0].items.len(), 2);
        assert_eq!(rules.places.venue_fixes[0].new_venue_address, "New St");
        assert_eq!(rules.speakers.known_speakers[0].id, 42);
        assert_eq!(rules.speakers.name_fixes[0].to, "Алёна");
    }

    #[test]
    fn malformed_rules_report_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).expect("mkdir");
        std::fs::write(rules_dir.join("talks.yaml"), "invalid_talks: {oops").expect("write");

        let err = RuleSet::from_workspace_root(dir.path()).expect_err("malformed");
        assert!(format!("{err:#}").contains("rules/talks.yaml"));
    }
}

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One character definition as stored in the catalog file.
///
/// Everything except `name` is optional on disk and defaults to empty, so a
/// record written by hand with only a name and a couple of mandatory tags
/// still loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    #[serde(default)]
    pub mandatory_tags: Vec<String>,
    #[serde(default)]
    pub poses: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub optional_categories: IndexMap<String, Vec<String>>,
}

impl CharacterRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory_tags: Vec::new(),
            poses: Vec::new(),
            environments: Vec::new(),
            optional_categories: IndexMap::new(),
        }
    }

    /// Optional categories in expansion order: poses, environments, then the
    /// custom categories in insertion order.
    pub fn categories(&self) -> impl Iterator<Item = (&str, &[String])> {
        [
            ("poses", self.poses.as_slice()),
            ("environments", self.environments.as_slice()),
        ]
        .into_iter()
        .chain(
            self.optional_categories
                .iter()
                .map(|(name, tags)| (name.as_str(), tags.as_slice())),
        )
    }
}

/// Catalog snapshot keyed by character ID, in file order.
pub type CharacterCatalog = IndexMap<String, CharacterRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("No known characters were selected")]
    EmptySelection,
}

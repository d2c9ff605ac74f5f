use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::prompt::{CharacterCatalog, CharacterRecord};
use crate::storage::{read_optional, write_json_pretty, StorageError};

/// Loads and saves whole catalog snapshots; callers never mutate shared state.
pub trait CharacterRepository: Send + Sync {
    fn load(&self) -> Result<CharacterCatalog, StorageError>;
    fn save(&self, catalog: &CharacterCatalog) -> Result<(), StorageError>;
}

/// Catalog stored as one pretty-printed JSON object keyed by character ID.
/// A bundled example file is read until the first save creates the real one.
#[derive(Debug, Clone)]
pub struct JsonCharacterStore {
    path: PathBuf,
    example_path: PathBuf,
}

impl JsonCharacterStore {
    pub fn new(path: impl Into<PathBuf>, example_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            example_path: example_path.into(),
        }
    }

    fn parse(path: &Path, body: &str) -> Result<CharacterCatalog, StorageError> {
        serde_json::from_str(body).map_err(|source| StorageError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl CharacterRepository for JsonCharacterStore {
    fn load(&self) -> Result<CharacterCatalog, StorageError> {
        if let Some(body) = read_optional(&self.path)? {
            return Self::parse(&self.path, &body);
        }
        if let Some(body) = read_optional(&self.example_path)? {
            info!(
                "Character file {} not found; using example catalog {}",
                self.path.display(),
                self.example_path.display()
            );
            return Self::parse(&self.example_path, &body);
        }
        warn!(
            "No character file at {} or {}; starting with an empty catalog",
            self.path.display(),
            self.example_path.display()
        );
        Ok(CharacterCatalog::new())
    }

    fn save(&self, catalog: &CharacterCatalog) -> Result<(), StorageError> {
        write_json_pretty(&self.path, catalog)?;
        info!(
            "Saved {} character(s) to {}",
            catalog.len(),
            self.path.display()
        );
        Ok(())
    }
}

pub fn validate_character_id(id: &str, catalog: &CharacterCatalog) -> Result<(), StorageError> {
    let id = id.trim();
    if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    if catalog.contains_key(id) {
        return Err(StorageError::DuplicateId(id.to_string()));
    }
    Ok(())
}

/// Splits admin input like `1boy, robot , glowing eyes` into trimmed tags.
pub fn parse_tag_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn insert_character(
    repository: &dyn CharacterRepository,
    id: &str,
    record: CharacterRecord,
) -> Result<CharacterCatalog, StorageError> {
    let mut catalog = repository.load()?;
    validate_character_id(id, &catalog)?;
    catalog.insert(id.trim().to_string(), record);
    repository.save(&catalog)?;
    Ok(catalog)
}

/// Returns the removed record, or `None` if the ID was unknown.
pub fn remove_character(
    repository: &dyn CharacterRepository,
    id: &str,
) -> Result<Option<CharacterRecord>, StorageError> {
    let mut catalog = repository.load()?;
    let removed = catalog.shift_remove(id);
    if removed.is_some() {
        repository.save(&catalog)?;
    }
    Ok(removed)
}

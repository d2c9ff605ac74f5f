use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::storage::{read_optional, write_json_pretty, StorageError};

/// Admin-managed settings shared by all users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    /// Checkpoint file name -> friendly name shown on buttons.
    pub model_aliases: IndexMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BotSettingsStore {
    path: PathBuf,
}

impl BotSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<BotSettings, StorageError> {
        match read_optional(&self.path)? {
            Some(body) => serde_json::from_str(&body).map_err(|source| StorageError::Parse {
                path: self.path.clone(),
                source,
            }),
            None => Ok(BotSettings::default()),
        }
    }

    pub fn save(&self, settings: &BotSettings) -> Result<(), StorageError> {
        write_json_pretty(&self.path, settings)
    }

    /// Sets or, for a blank alias, clears the display name of a model.
    pub fn set_alias(&self, model: &str, alias: &str) -> Result<BotSettings, StorageError> {
        let mut settings = self.load()?;
        let alias = alias.trim();
        if alias.is_empty() {
            settings.model_aliases.shift_remove(model);
        } else {
            settings
                .model_aliases
                .insert(model.to_string(), alias.to_string());
        }
        self.save(&settings)?;
        Ok(settings)
    }
}

pub fn display_model_name<'a>(model: &'a str, aliases: &'a IndexMap<String, String>) -> &'a str {
    aliases.get(model).map(String::as_str).unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = BotSettingsStore::new(dir.path().join("settings.json"));
        assert_eq!(store.load().unwrap(), BotSettings::default());
    }

    #[test]
    fn unknown_legacy_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"required_channel_id": null, "whitelist": [], "model_aliases": {"anything-v5.safetensors": "Anything"}}"#,
        )
        .unwrap();
        let settings = BotSettingsStore::new(&path).load().unwrap();
        assert_eq!(
            display_model_name("anything-v5.safetensors", &settings.model_aliases),
            "Anything"
        );
        assert_eq!(
            display_model_name("other.ckpt", &settings.model_aliases),
            "other.ckpt"
        );
    }

    #[test]
    fn blank_alias_clears_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = BotSettingsStore::new(dir.path().join("nested").join("settings.json"));
        store.set_alias("model.safetensors", "Fancy").unwrap();
        assert_eq!(
            store.load().unwrap().model_aliases.get("model.safetensors"),
            Some(&"Fancy".to_string())
        );
        let cleared = store.set_alias("model.safetensors", "  ").unwrap();
        assert!(cleared.model_aliases.is_empty());
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            BotSettingsStore::new(&path).load(),
            Err(StorageError::Parse { .. })
        ));
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const DEFAULT_SAMPLER: &str = "DPM++ 2M Karras";

/// Per-user txt2img parameters.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub steps: i64,
    pub cfg_scale: f64,
    pub width: i64,
    pub height: i64,
    pub sampler_name: String,
    pub model_name: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            steps: 25,
            cfg_scale: 7.0,
            width: 512,
            height: 768,
            sampler_name: DEFAULT_SAMPLER.to_string(),
            model_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    Steps,
    CfgScale,
    Width,
    Height,
}

impl SettingField {
    pub const ALL: [SettingField; 4] = [
        SettingField::Steps,
        SettingField::CfgScale,
        SettingField::Width,
        SettingField::Height,
    ];

    pub fn key(self) -> &'static str {
        match self {
            SettingField::Steps => "steps",
            SettingField::CfgScale => "cfg_scale",
            SettingField::Width => "width",
            SettingField::Height => "height",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    pub fn hint(self) -> &'static str {
        match self {
            SettingField::Steps => "a whole number from 1 to 150",
            SettingField::CfgScale => "a number from 1 to 30, e.g. 7.5",
            SettingField::Width | SettingField::Height => {
                "a multiple of 8 between 64 and 2048"
            }
        }
    }
}

impl fmt::Display for SettingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SettingField::Steps => "Steps",
            SettingField::CfgScale => "CFG Scale",
            SettingField::Width => "Width",
            SettingField::Height => "Height",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettingError {
    #[error("'{value}' is not a number; {field} must be {}", .field.hint())]
    NotANumber { field: SettingField, value: String },
    #[error("{field} must be {}", .field.hint())]
    OutOfRange { field: SettingField },
}

impl GenerationSettings {
    /// Parses user input for `field` and stores it if it is in range.
    pub fn apply(&mut self, field: SettingField, raw: &str) -> Result<(), SettingError> {
        let value = raw.trim().replace(',', ".");
        let not_a_number = || SettingError::NotANumber {
            field,
            value: raw.trim().to_string(),
        };
        match field {
            SettingField::Steps => {
                let steps = value.parse::<i64>().map_err(|_| not_a_number())?;
                if !(1..=150).contains(&steps) {
                    return Err(SettingError::OutOfRange { field });
                }
                self.steps = steps;
            }
            SettingField::CfgScale => {
                let cfg = value.parse::<f64>().map_err(|_| not_a_number())?;
                if !cfg.is_finite() || !(1.0..=30.0).contains(&cfg) {
                    return Err(SettingError::OutOfRange { field });
                }
                self.cfg_scale = cfg;
            }
            SettingField::Width | SettingField::Height => {
                let size = value.parse::<i64>().map_err(|_| not_a_number())?;
                if !(64..=2048).contains(&size) || size % 8 != 0 {
                    return Err(SettingError::OutOfRange { field });
                }
                if field == SettingField::Width {
                    self.width = size;
                } else {
                    self.height = size;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserData {
    pub settings: GenerationSettings,
    pub saved_prompts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationInsert {
    pub user_id: i64,
    pub chat_id: i64,
    pub positive: String,
    pub negative: String,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_values_within_range() {
        let mut settings = GenerationSettings::default();
        settings.apply(SettingField::Steps, " 40 ").unwrap();
        settings.apply(SettingField::CfgScale, "7,5").unwrap();
        settings.apply(SettingField::Width, "768").unwrap();
        settings.apply(SettingField::Height, "1024").unwrap();
        assert_eq!(settings.steps, 40);
        assert_eq!(settings.cfg_scale, 7.5);
        assert_eq!(settings.width, 768);
        assert_eq!(settings.height, 1024);
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        let mut settings = GenerationSettings::default();
        assert_eq!(
            settings.apply(SettingField::Steps, "0"),
            Err(SettingError::OutOfRange {
                field: SettingField::Steps
            })
        );
        assert_eq!(
            settings.apply(SettingField::Width, "500"),
            Err(SettingError::OutOfRange {
                field: SettingField::Width
            })
        );
        assert!(matches!(
            settings.apply(SettingField::CfgScale, "lots"),
            Err(SettingError::NotANumber { .. })
        ));
        assert!(settings.apply(SettingField::CfgScale, "NaN").is_err());
        assert_eq!(settings, GenerationSettings::default());
    }

    #[test]
    fn field_keys_round_trip() {
        for field in SettingField::ALL {
            assert_eq!(SettingField::from_key(field.key()), Some(field));
        }
        assert_eq!(SettingField::from_key("sampler_name"), None);
    }
}

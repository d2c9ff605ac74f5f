pub mod expander;
pub mod types;

pub use expander::{combination_count, expand, expand_selection, resolve_characters};
pub use types::{CharacterCatalog, CharacterRecord, ExpandError, PromptPair};

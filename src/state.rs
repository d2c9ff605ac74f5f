use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::a1111::{A1111Client, SdModel};
use crate::db::database::Database;
use crate::db::models::{GenerationSettings, SettingField};
use crate::prompt::{CharacterRecord, PromptPair};
use crate::storage::bot_settings::BotSettingsStore;
use crate::storage::characters::CharacterRepository;

/// Conversations are tracked per user per chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub chat_id: i64,
    pub user_id: i64,
}

impl SessionKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

/// Expanded prompts for one conversation plus the settings captured when
/// they were expanded. `index` is the combination currently shown (or last
/// rendered); `next` is where "the rest" resumes. `expansion` tells buttons
/// of this set apart from buttons of an earlier one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub prompts: Vec<PromptPair>,
    pub index: usize,
    pub next: usize,
    pub expansion: u32,
    pub settings: GenerationSettings,
}

impl ResultSet {
    pub fn new(prompts: Vec<PromptPair>, settings: GenerationSettings, expansion: u32) -> Self {
        Self {
            prompts,
            index: 0,
            next: 0,
            expansion,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn get(&self, index: usize) -> Option<&PromptPair> {
        self.prompts.get(index)
    }

    pub fn prev_index(&self, index: usize) -> usize {
        if self.prompts.is_empty() {
            return 0;
        }
        if index == 0 || index >= self.len() {
            self.len() - 1
        } else {
            index - 1
        }
    }

    pub fn next_index(&self, index: usize) -> usize {
        if index + 1 >= self.len() {
            0
        } else {
            index + 1
        }
    }

    /// Records a finished attempt at `index`. A combination that could not
    /// reach the backend stays pending so the next batch starts with it.
    pub fn record_attempt(&mut self, index: usize, reached_backend: bool) {
        self.index = index;
        self.next = if reached_backend { index + 1 } else { index };
    }

    /// Combinations from the resume point to the end.
    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.next)
    }

    /// `count` combinations starting at `start`, clipped to the end.
    pub fn batch_range(&self, start: usize, count: usize) -> Range<usize> {
        let start = start.min(self.len());
        let end = start.saturating_add(count).min(self.len());
        start..end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterDraft {
    pub id: String,
    pub record: CharacterRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftStep {
    Id,
    Name,
    MandatoryTags,
    Poses,
    Environments,
    CategoryName,
    CategoryTags { category: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Session {
    #[default]
    Idle,
    ChoosingCharacters {
        available: Vec<String>,
        selected: Vec<String>,
    },
    ChoosingPrompt {
        character_ids: Vec<String>,
    },
    DeletingPrompt {
        character_ids: Vec<String>,
    },
    EditingSettings {
        character_ids: Vec<String>,
    },
    WaitingSettingValue {
        character_ids: Vec<String>,
        field: SettingField,
    },
    ChoosingModel {
        character_ids: Vec<String>,
        models: Vec<SdModel>,
    },
    WaitingBasePrompt {
        character_ids: Vec<String>,
    },
    ViewingResults {
        results: ResultSet,
    },
    WaitingBatchCount {
        results: ResultSet,
        start: usize,
    },
    Generating,
    AdminMenu,
    AdminCharacter {
        draft: CharacterDraft,
        step: DraftStep,
    },
    AdminDeleteCharacter {
        ids: Vec<String>,
    },
    AdminAliasPick {
        models: Vec<SdModel>,
    },
    AdminAliasValue {
        model: String,
    },
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub characters: Arc<dyn CharacterRepository>,
    pub bot_settings: BotSettingsStore,
    pub a1111: A1111Client,
    pub sessions: Arc<Mutex<HashMap<SessionKey, Session>>>,
    expansions: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(
        db: Database,
        characters: Arc<dyn CharacterRepository>,
        bot_settings: BotSettingsStore,
        a1111: A1111Client,
    ) -> Self {
        AppState {
            db,
            characters,
            bot_settings,
            a1111,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            expansions: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn next_expansion_id(&self) -> u32 {
        self.expansions.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn session(&self, key: SessionKey) -> Session {
        self.sessions.lock().get(&key).cloned().unwrap_or_default()
    }

    pub fn set_session(&self, key: SessionKey, session: Session) {
        let mut sessions = self.sessions.lock();
        if session == Session::Idle {
            sessions.remove(&key);
        } else {
            sessions.insert(key, session);
        }
    }

    pub fn clear_session(&self, key: SessionKey) {
        self.sessions.lock().remove(&key);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(count: usize) -> ResultSet {
        let prompts = (0..count)
            .map(|index| PromptPair::new(format!("p{index}"), ""))
            .collect();
        ResultSet::new(prompts, GenerationSettings::default(), 1)
    }

    #[test]
    fn navigation_wraps_around_both_ends() {
        let set = results(3);
        assert_eq!(set.prev_index(0), 2);
        assert_eq!(set.prev_index(2), 1);
        assert_eq!(set.next_index(2), 0);
        assert_eq!(set.next_index(0), 1);
    }

    #[test]
    fn single_result_navigates_to_itself() {
        let set = results(1);
        assert_eq!(set.prev_index(0), 0);
        assert_eq!(set.next_index(0), 0);
    }

    #[test]
    fn resume_point_follows_finished_attempts() {
        let mut set = results(5);
        assert_eq!(set.remaining(), 5);
        set.record_attempt(0, true);
        set.record_attempt(1, true);
        assert_eq!((set.index, set.next), (1, 2));
        assert_eq!(set.remaining(), 3);
        set.record_attempt(4, true);
        assert_eq!(set.remaining(), 0);
    }

    #[test]
    fn unreachable_backend_keeps_the_combination_pending() {
        let mut set = results(5);
        set.record_attempt(0, true);
        set.record_attempt(1, true);
        set.record_attempt(2, false);
        assert_eq!(set.index, 2);
        assert_eq!(set.batch_range(set.next, usize::MAX), 2..5);
        assert_eq!(set.remaining(), 3);
    }

    #[test]
    fn first_combination_failing_keeps_everything_pending() {
        let mut set = results(3);
        set.record_attempt(0, false);
        assert_eq!(set.batch_range(set.next, usize::MAX), 0..3);
    }

    #[test]
    fn batch_range_is_clipped_to_the_sequence() {
        let set = results(5);
        assert_eq!(set.batch_range(1, 3), 1..4);
        assert_eq!(set.batch_range(3, 10), 3..5);
        assert_eq!(set.batch_range(7, 2), 5..5);
        assert_eq!(set.batch_range(0, usize::MAX), 0..5);
    }
}

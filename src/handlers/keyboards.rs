use indexmap::IndexMap;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::a1111::{SdModel, SAMPLERS};
use crate::db::models::{GenerationSettings, SettingField};
use crate::state::ResultSet;
use crate::storage::bot_settings::display_model_name;
use crate::utils::telegram::truncate_chars;

const BUTTON_PROMPT_PREVIEW: usize = 30;
const BUTTON_MODEL_PREVIEW: usize = 25;

/// Every inline button press the bot understands. Items are referenced by
/// position in a list held in the session, which keeps payloads well under
/// Telegram's 64-byte callback limit regardless of names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    ToggleCharacter(usize),
    CharactersDone,
    UsePrompt(usize),
    DeletePromptMode,
    DeletePrompt(usize),
    PromptMenu,
    NewPrompt,
    OpenSettings,
    ChooseModel,
    SetModel(usize),
    ClearModel,
    ChooseSampler,
    SetSampler(usize),
    EditField(SettingField),
    SettingsDone,
    Navigate { expansion: u32, index: usize },
    GenerateOne { expansion: u32, index: usize },
    GenerateBatch(u32),
    GenerateAll(u32),
    GenerateRemaining(u32),
    GenerateMore(u32),
    ShowPrompts,
    MainMenu,
    Ignore,
    AdminAdd,
    AdminList,
    AdminDeleteMenu,
    AdminDelete(usize),
    AdminAliases,
    AdminAlias(usize),
    AdminBack,
    AdminClose,
}

impl CallbackAction {
    pub fn to_data(&self) -> String {
        match self {
            CallbackAction::ToggleCharacter(index) => format!("chr:t:{index}"),
            CallbackAction::CharactersDone => "chr:done".to_string(),
            CallbackAction::UsePrompt(index) => format!("pr:use:{index}"),
            CallbackAction::DeletePromptMode => "pr:delmode".to_string(),
            CallbackAction::DeletePrompt(index) => format!("pr:del:{index}"),
            CallbackAction::PromptMenu => "pr:menu".to_string(),
            CallbackAction::NewPrompt => "pr:new".to_string(),
            CallbackAction::OpenSettings => "set:open".to_string(),
            CallbackAction::ChooseModel => "set:model".to_string(),
            CallbackAction::SetModel(index) => format!("set:model:{index}"),
            CallbackAction::ClearModel => "set:model:none".to_string(),
            CallbackAction::ChooseSampler => "set:sampler".to_string(),
            CallbackAction::SetSampler(index) => format!("set:sampler:{index}"),
            CallbackAction::EditField(field) => format!("set:field:{}", field.key()),
            CallbackAction::SettingsDone => "set:done".to_string(),
            CallbackAction::Navigate { expansion, index } => format!("res:nav:{expansion}:{index}"),
            CallbackAction::GenerateOne { expansion, index } => {
                format!("res:gen:{expansion}:{index}")
            }
            CallbackAction::GenerateBatch(expansion) => format!("res:batch:{expansion}"),
            CallbackAction::GenerateAll(expansion) => format!("res:all:{expansion}"),
            CallbackAction::GenerateRemaining(expansion) => format!("res:rest:{expansion}"),
            CallbackAction::GenerateMore(expansion) => format!("res:more:{expansion}"),
            CallbackAction::ShowPrompts => "res:show".to_string(),
            CallbackAction::MainMenu => "res:menu".to_string(),
            CallbackAction::Ignore => "noop".to_string(),
            CallbackAction::AdminAdd => "adm:add".to_string(),
            CallbackAction::AdminList => "adm:list".to_string(),
            CallbackAction::AdminDeleteMenu => "adm:del".to_string(),
            CallbackAction::AdminDelete(index) => format!("adm:del:{index}"),
            CallbackAction::AdminAliases => "adm:alias".to_string(),
            CallbackAction::AdminAlias(index) => format!("adm:alias:{index}"),
            CallbackAction::AdminBack => "adm:back".to_string(),
            CallbackAction::AdminClose => "adm:close".to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        fn index(value: &str) -> Option<usize> {
            value.parse::<usize>().ok()
        }
        fn expansion(value: &str) -> Option<u32> {
            value.parse::<u32>().ok()
        }

        let parts: Vec<&str> = data.split(':').collect();
        let action = match parts.as_slice() {
            ["chr", "t", value] => CallbackAction::ToggleCharacter(index(value)?),
            ["chr", "done"] => CallbackAction::CharactersDone,
            ["pr", "use", value] => CallbackAction::UsePrompt(index(value)?),
            ["pr", "delmode"] => CallbackAction::DeletePromptMode,
            ["pr", "del", value] => CallbackAction::DeletePrompt(index(value)?),
            ["pr", "menu"] => CallbackAction::PromptMenu,
            ["pr", "new"] => CallbackAction::NewPrompt,
            ["set", "open"] => CallbackAction::OpenSettings,
            ["set", "model"] => CallbackAction::ChooseModel,
            ["set", "model", "none"] => CallbackAction::ClearModel,
            ["set", "model", value] => CallbackAction::SetModel(index(value)?),
            ["set", "sampler"] => CallbackAction::ChooseSampler,
            ["set", "sampler", value] => CallbackAction::SetSampler(index(value)?),
            ["set", "field", key] => CallbackAction::EditField(SettingField::from_key(key)?),
            ["set", "done"] => CallbackAction::SettingsDone,
            ["res", "nav", id, value] => CallbackAction::Navigate {
                expansion: expansion(id)?,
                index: index(value)?,
            },
            ["res", "gen", id, value] => CallbackAction::GenerateOne {
                expansion: expansion(id)?,
                index: index(value)?,
            },
            ["res", "batch", id] => CallbackAction::GenerateBatch(expansion(id)?),
            ["res", "all", id] => CallbackAction::GenerateAll(expansion(id)?),
            ["res", "rest", id] => CallbackAction::GenerateRemaining(expansion(id)?),
            ["res", "more", id] => CallbackAction::GenerateMore(expansion(id)?),
            ["res", "show"] => CallbackAction::ShowPrompts,
            ["res", "menu"] => CallbackAction::MainMenu,
            ["noop"] => CallbackAction::Ignore,
            ["adm", "add"] => CallbackAction::AdminAdd,
            ["adm", "list"] => CallbackAction::AdminList,
            ["adm", "del"] => CallbackAction::AdminDeleteMenu,
            ["adm", "del", value] => CallbackAction::AdminDelete(index(value)?),
            ["adm", "alias"] => CallbackAction::AdminAliases,
            ["adm", "alias", value] => CallbackAction::AdminAlias(index(value)?),
            ["adm", "back"] => CallbackAction::AdminBack,
            ["adm", "close"] => CallbackAction::AdminClose,
            _ => return None,
        };
        Some(action)
    }

    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            CallbackAction::AdminAdd
                | CallbackAction::AdminList
                | CallbackAction::AdminDeleteMenu
                | CallbackAction::AdminDelete(_)
                | CallbackAction::AdminAliases
                | CallbackAction::AdminAlias(_)
                | CallbackAction::AdminBack
                | CallbackAction::AdminClose
        )
    }
}

fn button(text: impl Into<String>, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.into(), action.to_data())
}

fn single_column(buttons: Vec<InlineKeyboardButton>) -> Vec<Vec<InlineKeyboardButton>> {
    buttons.into_iter().map(|button| vec![button]).collect()
}

/// `characters` is `(id, display name)` in catalog order.
pub fn character_selection_keyboard(
    characters: &[(String, String)],
    selected: &[String],
) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        characters
            .iter()
            .enumerate()
            .map(|(index, (id, name))| {
                let text = if selected.contains(id) {
                    format!("✅ {name}")
                } else {
                    name.clone()
                };
                button(text, CallbackAction::ToggleCharacter(index))
            })
            .collect(),
    );
    if !selected.is_empty() {
        rows.push(vec![button("✅ Done", CallbackAction::CharactersDone)]);
    }
    InlineKeyboardMarkup::new(rows)
}

pub fn saved_prompts_keyboard(saved_prompts: &[String]) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        saved_prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| {
                button(
                    format!("📋 {}", truncate_chars(prompt, BUTTON_PROMPT_PREVIEW)),
                    CallbackAction::UsePrompt(index),
                )
            })
            .collect(),
    );

    let mut actions = Vec::new();
    if !saved_prompts.is_empty() {
        actions.push(button("🗑️ Delete a prompt", CallbackAction::DeletePromptMode));
    }
    actions.push(button("⌨️ Type a new prompt", CallbackAction::NewPrompt));
    rows.push(actions);
    rows.push(vec![button("⚙️ Settings", CallbackAction::OpenSettings)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn delete_prompts_keyboard(saved_prompts: &[String]) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        saved_prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| {
                button(
                    format!("❌ {}", truncate_chars(prompt, BUTTON_PROMPT_PREVIEW)),
                    CallbackAction::DeletePrompt(index),
                )
            })
            .collect(),
    );
    rows.push(vec![button("⬅️ Back", CallbackAction::PromptMenu)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn settings_keyboard(
    settings: &GenerationSettings,
    aliases: &IndexMap<String, String>,
    continue_to_prompt: bool,
) -> InlineKeyboardMarkup {
    let model_label = match settings.model_name.as_deref() {
        Some(model) => truncate_chars(display_model_name(model, aliases), BUTTON_MODEL_PREVIEW),
        None => "backend default".to_string(),
    };
    let done_label = if continue_to_prompt {
        "✅ Done, enter a prompt"
    } else {
        "✅ Done"
    };

    let field_button = |field: SettingField, value: String| {
        button(format!("{field}: {value}"), CallbackAction::EditField(field))
    };

    InlineKeyboardMarkup::new(vec![
        vec![button(format!("Model: {model_label}"), CallbackAction::ChooseModel)],
        vec![
            button(
                format!("Sampler: {}", settings.sampler_name),
                CallbackAction::ChooseSampler,
            ),
            field_button(SettingField::Steps, settings.steps.to_string()),
        ],
        vec![
            field_button(SettingField::CfgScale, settings.cfg_scale.to_string()),
            field_button(SettingField::Width, settings.width.to_string()),
        ],
        vec![field_button(SettingField::Height, settings.height.to_string())],
        vec![button(done_label, CallbackAction::SettingsDone)],
    ])
}

pub fn model_selection_keyboard(
    models: &[SdModel],
    aliases: &IndexMap<String, String>,
) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        models
            .iter()
            .enumerate()
            .map(|(index, model)| {
                button(
                    display_model_name(&model.title, aliases).to_string(),
                    CallbackAction::SetModel(index),
                )
            })
            .collect(),
    );
    rows.push(vec![button("Backend default", CallbackAction::ClearModel)]);
    rows.push(vec![button("⬅️ Back to settings", CallbackAction::OpenSettings)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn sampler_keyboard() -> InlineKeyboardMarkup {
    let buttons = SAMPLERS
        .iter()
        .enumerate()
        .map(|(index, sampler)| button(*sampler, CallbackAction::SetSampler(index)))
        .collect::<Vec<_>>();
    let mut rows = buttons
        .chunks(2)
        .map(|chunk| chunk.to_vec())
        .collect::<Vec<_>>();
    rows.push(vec![button("⬅️ Back to settings", CallbackAction::OpenSettings)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn results_keyboard(results: &ResultSet) -> InlineKeyboardMarkup {
    let index = results.index;
    let expansion = results.expansion;
    let navigate = |index| CallbackAction::Navigate { expansion, index };
    InlineKeyboardMarkup::new(vec![
        vec![
            button("⬅️", navigate(results.prev_index(index))),
            button(
                format!("{}/{}", index + 1, results.len()),
                CallbackAction::Ignore,
            ),
            button("➡️", navigate(results.next_index(index))),
        ],
        vec![button(
            "🖼️ Generate this",
            CallbackAction::GenerateOne { expansion, index },
        )],
        vec![
            button("🔢 Generate N…", CallbackAction::GenerateBatch(expansion)),
            button("💥 Generate all", CallbackAction::GenerateAll(expansion)),
        ],
    ])
}

pub fn post_generation_keyboard(results: &ResultSet) -> InlineKeyboardMarkup {
    let remaining = results.remaining();
    let mut rows = vec![vec![button(
        "📖 Choose another prompt",
        CallbackAction::ShowPrompts,
    )]];
    if remaining > 0 {
        rows.push(vec![button(
            format!("💥 Generate the rest ({remaining})"),
            CallbackAction::GenerateRemaining(results.expansion),
        )]);
        rows.push(vec![button(
            "🔢 Generate N more…",
            CallbackAction::GenerateMore(results.expansion),
        )]);
    }
    rows.push(vec![button("🏠 Main menu", CallbackAction::MainMenu)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn admin_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(single_column(vec![
        button("➕ Add character", CallbackAction::AdminAdd),
        button("📜 List characters", CallbackAction::AdminList),
        button("🗑️ Delete character", CallbackAction::AdminDeleteMenu),
        button("🖼️ Model names", CallbackAction::AdminAliases),
        button("❌ Close", CallbackAction::AdminClose),
    ]))
}

pub fn admin_delete_keyboard(characters: &[(String, String)]) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        characters
            .iter()
            .enumerate()
            .map(|(index, (id, name))| {
                button(format!("❌ {name} ({id})"), CallbackAction::AdminDelete(index))
            })
            .collect(),
    );
    rows.push(vec![button("⬅️ Back", CallbackAction::AdminBack)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn alias_management_keyboard(
    models: &[SdModel],
    aliases: &IndexMap<String, String>,
) -> InlineKeyboardMarkup {
    let mut rows = single_column(
        models
            .iter()
            .enumerate()
            .map(|(index, model)| {
                let alias = aliases
                    .get(&model.title)
                    .map(String::as_str)
                    .unwrap_or("not set");
                button(
                    format!("{} -> {}", truncate_chars(&model.model_name, 20), alias),
                    CallbackAction::AdminAlias(index),
                )
            })
            .collect(),
    );
    rows.push(vec![button("⬅️ Back", CallbackAction::AdminBack)]);
    InlineKeyboardMarkup::new(rows)
}

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::handlers::generate::character_labels;
use crate::handlers::keyboards::{
    admin_delete_keyboard, admin_keyboard, alias_management_keyboard, CallbackAction,
};
use crate::handlers::{edit_or_send, escape_html, session_key_for, CallbackContext};
use crate::prompt::{combination_count, CharacterCatalog, CharacterRecord};
use crate::state::{AppState, CharacterDraft, DraftStep, Session, SessionKey};
use crate::storage::characters::{
    insert_character, parse_tag_list, remove_character, validate_character_id,
};
use crate::utils::telegram::truncate_chars;
use crate::utils::timing::start_command_timer;

const ADMIN_MENU_TEXT: &str = "🛠 <b>Admin panel</b>\nManage characters and model display names.";
const ADMIN_ONLY_TEXT: &str = "This command is for administrators only.";

/// Result of feeding one message to the add-character wizard.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftOutcome {
    Continue {
        draft: CharacterDraft,
        step: DraftStep,
    },
    Retry(String),
    Finished(CharacterDraft),
}

fn is_skip(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "skip" | "-")
}

fn is_done(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("done")
}

pub fn step_prompt(step: &DraftStep) -> String {
    match step {
        DraftStep::Id => {
            "Step 1/6: send a unique ID for the character, letters and digits only (e.g. Robot)."
                .to_string()
        }
        DraftStep::Name => "Step 2/6: send the display name.".to_string(),
        DraftStep::MandatoryTags => {
            "Step 3/6: send the tags every prompt must contain, comma separated (e.g. 1boy, robot, glowing eyes). Send skip for none."
                .to_string()
        }
        DraftStep::Poses => {
            "Step 4/6: send the poses, comma separated (e.g. sitting, standing). Send skip for none."
                .to_string()
        }
        DraftStep::Environments => {
            "Step 5/6: send the environments, comma separated (e.g. city, forest). Send skip for none."
                .to_string()
        }
        DraftStep::CategoryName => {
            "Step 6/6: send the name of another tag category (e.g. outfits), or done to save the character."
                .to_string()
        }
        DraftStep::CategoryTags { category } => {
            format!("Send the tags for '{category}', comma separated.")
        }
    }
}

/// Applies one wizard answer. Nothing is persisted here; `Finished` hands the
/// completed draft back to the caller.
pub fn advance_draft(
    mut draft: CharacterDraft,
    step: &DraftStep,
    text: &str,
    catalog: &CharacterCatalog,
) -> DraftOutcome {
    let text = text.trim();
    let next = match step {
        DraftStep::Id => {
            if let Err(err) = validate_character_id(text, catalog) {
                return DraftOutcome::Retry(err.to_string());
            }
            draft.id = text.to_string();
            DraftStep::Name
        }
        DraftStep::Name => {
            if text.is_empty() {
                return DraftOutcome::Retry("The name cannot be empty.".to_string());
            }
            draft.record.name = text.to_string();
            DraftStep::MandatoryTags
        }
        DraftStep::MandatoryTags => {
            draft.record.mandatory_tags = if is_skip(text) {
                Vec::new()
            } else {
                parse_tag_list(text)
            };
            DraftStep::Poses
        }
        DraftStep::Poses => {
            draft.record.poses = if is_skip(text) {
                Vec::new()
            } else {
                parse_tag_list(text)
            };
            DraftStep::Environments
        }
        DraftStep::Environments => {
            draft.record.environments = if is_skip(text) {
                Vec::new()
            } else {
                parse_tag_list(text)
            };
            DraftStep::CategoryName
        }
        DraftStep::CategoryName => {
            if is_done(text) {
                return DraftOutcome::Finished(draft);
            }
            if text.is_empty() {
                return DraftOutcome::Retry("The category name cannot be empty.".to_string());
            }
            if matches!(text, "poses" | "environments") {
                return DraftOutcome::Retry(format!("'{text}' was filled in an earlier step."));
            }
            DraftStep::CategoryTags {
                category: text.to_string(),
            }
        }
        DraftStep::CategoryTags { category } => {
            let tags = parse_tag_list(text);
            if tags.is_empty() {
                return DraftOutcome::Retry("List at least one tag.".to_string());
            }
            draft
                .record
                .optional_categories
                .insert(category.clone(), tags);
            DraftStep::CategoryName
        }
    };
    DraftOutcome::Continue { draft, step: next }
}

/// HTML listing of the catalog split into messages of at most `max_length`
/// characters. A character is only split across messages when its own
/// block is longer than one message.
pub fn describe_catalog(catalog: &CharacterCatalog, max_length: usize) -> Vec<String> {
    if catalog.is_empty() {
        return vec!["No characters yet.".to_string()];
    }
    // Escaping can grow text sixfold; keep every single line below one message.
    let preview = (max_length / 16).max(1);
    let clip = |text: &str| escape_html(&truncate_chars(text, preview));

    let mut blocks = vec![format!("<b>Characters ({})</b>", catalog.len())];
    for (id, record) in catalog {
        let mut lines = vec![format!(
            "<b>{}</b> (<code>{}</code>)",
            clip(&record.name),
            clip(id)
        )];
        if !record.mandatory_tags.is_empty() {
            lines.push(format!(
                "Mandatory: {}",
                clip(&record.mandatory_tags.join(", "))
            ));
        }
        for (category, tags) in record.categories() {
            if !tags.is_empty() {
                lines.push(format!("{}: {}", clip(category), clip(&tags.join(", "))));
            }
        }
        lines.push(format!(
            "Combinations alone: {}",
            combination_count(&[record])
        ));
        blocks.push(lines.join("\n"));
    }
    pack_messages(&blocks, max_length)
}

fn pack_messages(blocks: &[String], max_length: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for block in blocks {
        let pieces: Vec<(&str, &str)> = if block.chars().count() > max_length {
            block
                .lines()
                .enumerate()
                .map(|(index, line)| (if index == 0 { "\n\n" } else { "\n" }, line))
                .collect()
        } else {
            vec![("\n\n", block.as_str())]
        };
        for (separator, piece) in pieces {
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + separator.len() + piece_len > max_length {
                messages.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push_str(separator);
                current_len += separator.len();
            }
            current.push_str(piece);
            current_len += piece_len;
        }
    }
    if !current.is_empty() {
        messages.push(current);
    }
    messages
}

pub async fn admin_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("admin", &message);
    let Some(key) = session_key_for(&message) else {
        timer.complete("no_user");
        return Ok(());
    };
    if !CONFIG.is_admin(key.user_id) {
        bot.send_message(message.chat.id, ADMIN_ONLY_TEXT).await?;
        timer.complete("denied");
        return Ok(());
    }

    bot.send_message(message.chat.id, ADMIN_MENU_TEXT)
        .parse_mode(ParseMode::Html)
        .reply_markup(admin_keyboard())
        .await?;
    state.set_session(key, Session::AdminMenu);
    timer.complete("success");
    Ok(())
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("status", &message);
    let Some(key) = session_key_for(&message) else {
        timer.complete("no_user");
        return Ok(());
    };
    if !CONFIG.is_admin(key.user_id) {
        bot.send_message(message.chat.id, ADMIN_ONLY_TEXT).await?;
        timer.complete("denied");
        return Ok(());
    }

    let database = match state.db.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("error: {err}"),
    };
    let backend = if state.a1111.health_check().await {
        "reachable"
    } else {
        "unreachable"
    };
    let characters = match state.characters.load() {
        Ok(catalog) => catalog.len().to_string(),
        Err(err) => format!("error: {err}"),
    };
    let generations = state
        .db
        .count_generations(None)
        .await
        .map(|count| count.to_string())
        .unwrap_or_else(|err| format!("error: {err}"));

    let text = format!(
        "Status\n\
         Database: {database}\n\
         Image backend ({}): {backend}\n\
         Characters: {characters}\n\
         Generations recorded: {generations}\n\
         Pending records: {}\n\
         Active dialogs: {}",
        CONFIG.a1111_api_url,
        state.db.queue_len(),
        state.active_sessions()
    );
    bot.send_message(message.chat.id, text).await?;
    timer.complete("success");
    Ok(())
}

pub async fn on_callback(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    session: Session,
    action: CallbackAction,
) -> Result<bool> {
    match (action, session) {
        (CallbackAction::AdminAdd, Session::AdminMenu) => {
            let draft = CharacterDraft {
                id: String::new(),
                record: CharacterRecord::new(""),
            };
            edit_or_send(bot, ctx, escape_html(&step_prompt(&DraftStep::Id)), None).await?;
            state.set_session(
                ctx.key,
                Session::AdminCharacter {
                    draft,
                    step: DraftStep::Id,
                },
            );
        }
        (CallbackAction::AdminList, Session::AdminMenu) => {
            let catalog = state.characters.load()?;
            for text in describe_catalog(&catalog, CONFIG.telegram_max_length) {
                bot.send_message(ctx.chat_id, text)
                    .parse_mode(ParseMode::Html)
                    .await?;
            }
        }
        (CallbackAction::AdminDeleteMenu, Session::AdminMenu) => {
            let catalog = state.characters.load()?;
            if catalog.is_empty() {
                bot.send_message(ctx.chat_id, "There are no characters to delete.")
                    .await?;
                return Ok(true);
            }
            let ids: Vec<String> = catalog.keys().cloned().collect();
            edit_or_send(
                bot,
                ctx,
                "Tap a character to delete it:".to_string(),
                Some(admin_delete_keyboard(&character_labels(&catalog, &ids))),
            )
            .await?;
            state.set_session(ctx.key, Session::AdminDeleteCharacter { ids });
        }
        (CallbackAction::AdminDelete(index), Session::AdminDeleteCharacter { ids }) => {
            let Some(id) = ids.get(index) else {
                return Ok(false);
            };
            let removed = remove_character(state.characters.as_ref(), id)?;
            let text = match removed {
                Some(record) => {
                    info!("Admin {} deleted character {}", ctx.key.user_id, id);
                    format!(
                        "Deleted <b>{}</b>.\n\n{ADMIN_MENU_TEXT}",
                        escape_html(&record.name)
                    )
                }
                None => format!("That character was already gone.\n\n{ADMIN_MENU_TEXT}"),
            };
            edit_or_send(bot, ctx, text, Some(admin_keyboard())).await?;
            state.set_session(ctx.key, Session::AdminMenu);
        }
        (CallbackAction::AdminAliases, Session::AdminMenu) => {
            let models = match state.a1111.list_models().await {
                Ok(models) if !models.is_empty() => models,
                Ok(_) => {
                    bot.send_message(ctx.chat_id, "The image backend reports no models.")
                        .await?;
                    return Ok(true);
                }
                Err(err) => {
                    warn!("Failed to list models for aliases: {err}");
                    bot.send_message(ctx.chat_id, format!("Could not load the model list: {err}"))
                        .await?;
                    return Ok(true);
                }
            };
            let aliases = state.bot_settings.load()?.model_aliases;
            edit_or_send(
                bot,
                ctx,
                "Tap a model to set the name users see for it:".to_string(),
                Some(alias_management_keyboard(&models, &aliases)),
            )
            .await?;
            state.set_session(ctx.key, Session::AdminAliasPick { models });
        }
        (CallbackAction::AdminAlias(index), Session::AdminAliasPick { models }) => {
            let Some(model) = models.get(index) else {
                return Ok(false);
            };
            bot.send_message(
                ctx.chat_id,
                format!(
                    "Send the display name for <code>{}</code>, or - to remove it.",
                    escape_html(&model.title)
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
            state.set_session(
                ctx.key,
                Session::AdminAliasValue {
                    model: model.title.clone(),
                },
            );
        }
        (CallbackAction::AdminBack, _) => {
            edit_or_send(bot, ctx, ADMIN_MENU_TEXT.to_string(), Some(admin_keyboard())).await?;
            state.set_session(ctx.key, Session::AdminMenu);
        }
        (CallbackAction::AdminClose, _) => {
            state.clear_session(ctx.key);
            edit_or_send(bot, ctx, "Admin panel closed.".to_string(), None).await?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

pub async fn on_draft_text(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    key: SessionKey,
    draft: CharacterDraft,
    step: DraftStep,
    text: &str,
) -> Result<()> {
    let catalog = state.characters.load()?;
    match advance_draft(draft, &step, text, &catalog) {
        DraftOutcome::Continue { draft, step } => {
            bot.send_message(message.chat.id, step_prompt(&step)).await?;
            state.set_session(key, Session::AdminCharacter { draft, step });
        }
        DraftOutcome::Retry(reason) => {
            bot.send_message(message.chat.id, format!("{reason} {}", step_prompt(&step)))
                .await?;
        }
        DraftOutcome::Finished(draft) => {
            let CharacterDraft { id, record } = draft;
            let name = record.name.clone();
            let combinations = combination_count(&[&record]);
            let reply = match insert_character(state.characters.as_ref(), &id, record) {
                Ok(_) => {
                    info!("Admin {} added character {}", key.user_id, id);
                    format!(
                        "✅ Saved <b>{}</b> (<code>{}</code>), {} combination(s) on its own.\n\n{ADMIN_MENU_TEXT}",
                        escape_html(&name),
                        escape_html(&id),
                        combinations
                    )
                }
                Err(err) => {
                    warn!("Failed to save character {}: {}", id, err);
                    format!("❌ {}\n\n{ADMIN_MENU_TEXT}", escape_html(&err.to_string()))
                }
            };
            bot.send_message(message.chat.id, reply)
                .parse_mode(ParseMode::Html)
                .reply_markup(admin_keyboard())
                .await?;
            state.set_session(key, Session::AdminMenu);
        }
    }
    Ok(())
}

pub async fn on_alias_text(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    key: SessionKey,
    model: String,
    text: &str,
) -> Result<()> {
    let alias = if text.trim() == "-" { "" } else { text };
    state.bot_settings.set_alias(&model, alias)?;
    let reply = if alias.trim().is_empty() {
        format!("Removed the display name of <code>{}</code>.", escape_html(&model))
    } else {
        format!(
            "<code>{}</code> is now shown as <b>{}</b>.",
            escape_html(&model),
            escape_html(alias.trim())
        )
    };
    info!("Admin {} updated alias for {}", key.user_id, model);
    bot.send_message(message.chat.id, format!("{reply}\n\n{ADMIN_MENU_TEXT}"))
        .parse_mode(ParseMode::Html)
        .reply_markup(admin_keyboard())
        .await?;
    state.set_session(key, Session::AdminMenu);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_draft() -> CharacterDraft {
        CharacterDraft {
            id: String::new(),
            record: CharacterRecord::new(""),
        }
    }

    fn feed(
        catalog: &CharacterCatalog,
        answers: &[&str],
    ) -> (CharacterDraft, DraftStep, Vec<DraftOutcome>) {
        let mut draft = empty_draft();
        let mut step = DraftStep::Id;
        let mut outcomes = Vec::new();
        for answer in answers {
            let outcome = advance_draft(draft.clone(), &step, answer, catalog);
            match &outcome {
                DraftOutcome::Continue {
                    draft: next,
                    step: next_step,
                } => {
                    draft = next.clone();
                    step = next_step.clone();
                }
                DraftOutcome::Finished(done) => draft = done.clone(),
                DraftOutcome::Retry(_) => {}
            }
            outcomes.push(outcome);
        }
        (draft, step, outcomes)
    }

    #[test]
    fn wizard_builds_a_full_character() {
        let catalog = CharacterCatalog::new();
        let (draft, _, outcomes) = feed(
            &catalog,
            &[
                "Robot",
                "Cool Robot",
                "1boy, robot , glowing eyes",
                "sitting, standing",
                "skip",
                "outfits",
                "armor, cape",
                "done",
            ],
        );
        assert!(matches!(outcomes.last(), Some(DraftOutcome::Finished(_))));
        assert_eq!(draft.id, "Robot");
        assert_eq!(draft.record.name, "Cool Robot");
        assert_eq!(draft.record.mandatory_tags, vec!["1boy", "robot", "glowing eyes"]);
        assert_eq!(draft.record.poses, vec!["sitting", "standing"]);
        assert!(draft.record.environments.is_empty());
        assert_eq!(
            draft.record.optional_categories.get("outfits"),
            Some(&vec!["armor".to_string(), "cape".to_string()])
        );
    }

    #[test]
    fn invalid_and_duplicate_ids_are_retried() {
        let mut catalog = CharacterCatalog::new();
        catalog.insert("Robot".to_string(), CharacterRecord::new("Robot"));

        let (draft, step, outcomes) = feed(&catalog, &["cool robot", "Robot", "Knight"]);
        assert!(matches!(outcomes[0], DraftOutcome::Retry(_)));
        assert!(matches!(outcomes[1], DraftOutcome::Retry(_)));
        assert_eq!(draft.id, "Knight");
        assert_eq!(step, DraftStep::Name);
    }

    #[test]
    fn category_tags_must_not_be_empty() {
        let outcome = advance_draft(
            empty_draft(),
            &DraftStep::CategoryTags {
                category: "outfits".to_string(),
            },
            " , ",
            &CharacterCatalog::new(),
        );
        assert_eq!(outcome, DraftOutcome::Retry("List at least one tag.".to_string()));
    }

    #[test]
    fn builtin_categories_cannot_be_reused() {
        let outcome = advance_draft(
            empty_draft(),
            &DraftStep::CategoryName,
            "poses",
            &CharacterCatalog::new(),
        );
        assert!(matches!(outcome, DraftOutcome::Retry(_)));
    }

    #[test]
    fn catalog_listing_escapes_and_counts() {
        let mut record = CharacterRecord::new("R&D Bot");
        record.mandatory_tags = vec!["1boy".to_string()];
        record.poses = vec!["sitting".to_string(), "standing".to_string()];
        let mut catalog = CharacterCatalog::new();
        catalog.insert("Robot".to_string(), record);

        let messages = describe_catalog(&catalog, 4000);
        assert_eq!(messages.len(), 1);
        let text = &messages[0];
        assert!(text.starts_with("<b>Characters (1)</b>\n\n"));
        assert!(text.contains("<b>R&amp;D Bot</b> (<code>Robot</code>)"));
        assert!(text.contains("poses: sitting, standing"));
        assert!(text.contains("Combinations alone: 3"));
        assert_eq!(
            describe_catalog(&CharacterCatalog::new(), 4000),
            vec!["No characters yet.".to_string()]
        );
    }

    #[test]
    fn large_catalogs_are_split_between_characters() {
        let mut catalog = CharacterCatalog::new();
        for number in 0..60 {
            let mut record = CharacterRecord::new(format!("Character {number}"));
            record.mandatory_tags = vec!["1girl".to_string(), format!("tag{number}")];
            record.poses = vec!["sitting".to_string(), "standing".to_string()];
            catalog.insert(format!("char{number}"), record);
        }

        let messages = describe_catalog(&catalog, 500);
        assert!(messages.len() > 1);
        for message in &messages {
            assert!(message.chars().count() <= 500, "{message}");
        }
        let combined = messages.join("\n\n");
        for number in 0..60 {
            let header = format!("<b>Character {number}</b> (<code>char{number}</code>)");
            assert_eq!(combined.matches(&header).count(), 1);
            let owner = messages
                .iter()
                .find(|message| message.contains(&header))
                .unwrap();
            assert!(owner.contains(&format!("Mandatory: 1girl, tag{number}")));
        }
    }

    #[test]
    fn oversized_characters_are_shortened_to_fit() {
        let mut record = CharacterRecord::new("Tagged & Quoted");
        record.poses = (0..400).map(|number| format!("<pose \"{number}\">")).collect();
        record.environments = (0..400).map(|number| format!("place {number}")).collect();
        let mut catalog = CharacterCatalog::new();
        catalog.insert("Big".to_string(), record);

        let messages = describe_catalog(&catalog, 300);
        for message in &messages {
            assert!(message.chars().count() <= 300, "{message}");
        }
        let combined = messages.concat();
        assert!(combined.contains("poses: &lt;pose &quot;0&quot;&gt;"));
        assert!(combined.contains("&gt;, &lt;pose ..."));
        assert!(combined.contains("Combinations alone: 160801"));
    }

    #[test]
    fn blocks_longer_than_a_message_split_between_lines() {
        let blocks = vec!["head".to_string(), "a\nbbbb\ncc".to_string()];
        assert_eq!(
            pack_messages(&blocks, 6),
            vec!["head".to_string(), "a\nbbbb".to_string(), "cc".to_string()]
        );
        assert_eq!(
            pack_messages(&blocks, 20),
            vec!["head\n\na\nbbbb\ncc".to_string()]
        );
    }
}

use std::ops::Range;

use anyhow::Result;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, ParseMode};
use tracing::{debug, error, info, warn};

use crate::a1111::A1111Error;
use crate::config::CONFIG;
use crate::db::models::GenerationInsert;
use crate::handlers::keyboards::{
    character_selection_keyboard, delete_prompts_keyboard, post_generation_keyboard,
    results_keyboard, saved_prompts_keyboard, CallbackAction,
};
use crate::handlers::{edit_or_send, escape_html, session_key_for, CallbackContext};
use crate::prompt::{
    combination_count, expand, resolve_characters, CharacterCatalog, ExpandError, PromptPair,
};
use crate::state::{AppState, ResultSet, Session, SessionKey};
use crate::utils::media::image_file_name;
use crate::utils::telegram::{start_chat_action_heartbeat, truncate_chars};
use crate::utils::timing::start_command_timer;

const WELCOME_TEXT: &str = "Hi! I build Stable Diffusion prompts from character presets and render them.\n\n\
/generate - pick characters and a base prompt\n\
/settings - steps, CFG, size, sampler and model\n\
/cancel - abandon the current dialog\n\
/help - how combinations work";

const HELP_TEXT: &str = "How it works:\n\
1. /generate and tick one or more characters.\n\
2. Pick a saved base prompt or type a new one.\n\
3. Every combination of each character's optional tags (poses, environments and other categories, each either one tag or nothing) becomes its own prompt. Tags left out of a combination go to its negative prompt.\n\
4. Browse the combinations and render one, a batch, or all of them.\n\n\
With several characters the prompt starts with \"2girls\", \"3girls\" and so on.";

const CHOOSE_CHARACTERS_TEXT: &str = "Choose one or more characters, then press Done:";

enum Expansion {
    Ready(ResultSet),
    Rejected(String),
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    let mut timer = start_command_timer("start", &message);
    bot.send_message(message.chat.id, WELCOME_TEXT).await?;
    timer.complete("success");
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    let mut timer = start_command_timer("help", &message);
    bot.send_message(message.chat.id, HELP_TEXT).await?;
    timer.complete("success");
    Ok(())
}

pub async fn cancel_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("cancel", &message);
    let Some(key) = session_key_for(&message) else {
        timer.complete("no_user");
        return Ok(());
    };

    let reply = match state.session(key) {
        Session::Idle => "Nothing to cancel.",
        Session::Generating => {
            "Images already queued will still be delivered. The dialog closes when they are done."
        }
        _ => {
            state.clear_session(key);
            "Cancelled. Use /generate to start again."
        }
    };
    bot.send_message(message.chat.id, reply).await?;
    timer.complete("success");
    Ok(())
}

pub async fn generate_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("generate", &message);
    let Some(key) = session_key_for(&message) else {
        timer.complete("no_user");
        return Ok(());
    };
    if state.session(key) == Session::Generating {
        bot.send_message(message.chat.id, "Please wait until the current images are done.")
            .await?;
        timer.complete("busy");
        return Ok(());
    }

    let catalog = state.characters.load()?;
    if catalog.is_empty() {
        bot.send_message(
            message.chat.id,
            "No characters are configured yet. An administrator can add some with /admin.",
        )
        .await?;
        timer.complete("empty_catalog");
        return Ok(());
    }

    let available: Vec<String> = catalog.keys().cloned().collect();
    bot.send_message(message.chat.id, CHOOSE_CHARACTERS_TEXT)
        .reply_markup(character_selection_keyboard(
            &character_labels(&catalog, &available),
            &[],
        ))
        .await?;
    state.set_session(
        key,
        Session::ChoosingCharacters {
            available,
            selected: Vec::new(),
        },
    );
    timer.complete("success");
    Ok(())
}

pub(crate) fn character_labels(catalog: &CharacterCatalog, ids: &[String]) -> Vec<(String, String)> {
    ids.iter()
        .map(|id| {
            let name = catalog
                .get(id)
                .map(|record| record.name.trim())
                .filter(|name| !name.is_empty())
                .unwrap_or(id.as_str());
            (id.clone(), name.to_string())
        })
        .collect()
}

fn toggle_selection(selected: &mut Vec<String>, id: &str) {
    if let Some(position) = selected.iter().position(|existing| existing == id) {
        selected.remove(position);
    } else {
        selected.push(id.to_string());
    }
}

/// Puts the selection back into catalog order so the same set of characters
/// always expands to the same sequence.
fn ordered_selection(available: &[String], selected: &[String]) -> Vec<String> {
    available
        .iter()
        .filter(|id| selected.contains(id))
        .cloned()
        .collect()
}

pub async fn on_callback(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    session: Session,
    action: CallbackAction,
) -> Result<bool> {
    match (action, session) {
        (
            CallbackAction::ToggleCharacter(index),
            Session::ChoosingCharacters {
                available,
                mut selected,
            },
        ) => {
            let Some(id) = available.get(index) else {
                return Ok(false);
            };
            toggle_selection(&mut selected, id);
            let catalog = state.characters.load()?;
            let markup =
                character_selection_keyboard(&character_labels(&catalog, &available), &selected);
            if let Err(err) = bot
                .edit_message_reply_markup(ctx.chat_id, ctx.message_id)
                .reply_markup(markup)
                .await
            {
                debug!("edit_message_reply_markup failed: {err}");
            }
            state.set_session(ctx.key, Session::ChoosingCharacters { available, selected });
        }
        (CallbackAction::CharactersDone, Session::ChoosingCharacters { available, selected }) => {
            let character_ids = ordered_selection(&available, &selected);
            if character_ids.is_empty() {
                return Ok(true);
            }
            show_prompt_menu(bot, state, ctx, character_ids).await?;
        }
        (CallbackAction::UsePrompt(index), Session::ChoosingPrompt { character_ids }) => {
            let prompts = state.db.saved_prompts(ctx.key.user_id).await?;
            match prompts.get(index) {
                Some(prompt) => {
                    start_results_from_menu(bot, state, ctx, character_ids, prompt).await?
                }
                None => show_prompt_menu(bot, state, ctx, character_ids).await?,
            }
        }
        (CallbackAction::DeletePromptMode, Session::ChoosingPrompt { character_ids }) => {
            let prompts = state.db.saved_prompts(ctx.key.user_id).await?;
            if prompts.is_empty() {
                show_prompt_menu(bot, state, ctx, character_ids).await?;
                return Ok(true);
            }
            edit_or_send(
                bot,
                ctx,
                "Tap a prompt to delete it:".to_string(),
                Some(delete_prompts_keyboard(&prompts)),
            )
            .await?;
            state.set_session(ctx.key, Session::DeletingPrompt { character_ids });
        }
        (CallbackAction::DeletePrompt(index), Session::DeletingPrompt { character_ids }) => {
            if state.db.remove_saved_prompt(ctx.key.user_id, index).await? {
                info!("User {} deleted saved prompt #{}", ctx.key.user_id, index);
            }
            let prompts = state.db.saved_prompts(ctx.key.user_id).await?;
            if prompts.is_empty() {
                show_prompt_menu(bot, state, ctx, character_ids).await?;
            } else {
                edit_or_send(
                    bot,
                    ctx,
                    "Tap a prompt to delete it:".to_string(),
                    Some(delete_prompts_keyboard(&prompts)),
                )
                .await?;
            }
        }
        (
            CallbackAction::PromptMenu,
            Session::ChoosingPrompt { character_ids }
            | Session::DeletingPrompt { character_ids }
            | Session::WaitingBasePrompt { character_ids },
        ) => {
            show_prompt_menu(bot, state, ctx, character_ids).await?;
        }
        (CallbackAction::NewPrompt, Session::ChoosingPrompt { character_ids }) => {
            edit_or_send(
                bot,
                ctx,
                "Send the base prompt, for example <code>masterpiece, best quality, detailed background</code>."
                    .to_string(),
                None,
            )
            .await?;
            state.set_session(ctx.key, Session::WaitingBasePrompt { character_ids });
        }
        (
            CallbackAction::Navigate { expansion, index },
            Session::ViewingResults { mut results } | Session::WaitingBatchCount { mut results, .. },
        ) => {
            if expansion != results.expansion || index >= results.len() {
                return Ok(false);
            }
            results.index = index;
            show_results(bot, ctx, &results).await?;
            state.set_session(ctx.key, Session::ViewingResults { results });
        }
        (
            CallbackAction::GenerateOne { expansion, index },
            Session::ViewingResults { results } | Session::WaitingBatchCount { results, .. },
        ) => {
            let range = results.batch_range(index, 1);
            if expansion != results.expansion || range.is_empty() {
                return Ok(false);
            }
            spawn_generation(bot.clone(), state.clone(), ctx.key, results, range);
        }
        (
            CallbackAction::GenerateAll(expansion),
            Session::ViewingResults { results } | Session::WaitingBatchCount { results, .. },
        ) if expansion == results.expansion => {
            let range = 0..results.len();
            spawn_generation(bot.clone(), state.clone(), ctx.key, results, range);
        }
        (CallbackAction::GenerateRemaining(expansion), Session::ViewingResults { results })
            if expansion == results.expansion =>
        {
            let range = results.batch_range(results.next, usize::MAX);
            if range.is_empty() {
                bot.send_message(ctx.chat_id, "Every combination has been rendered already.")
                    .await?;
                return Ok(true);
            }
            spawn_generation(bot.clone(), state.clone(), ctx.key, results, range);
        }
        (
            CallbackAction::GenerateBatch(expansion),
            Session::ViewingResults { results } | Session::WaitingBatchCount { results, .. },
        ) if expansion == results.expansion => {
            let start = results.index;
            ask_batch_count(bot, state, ctx, results, start).await?;
        }
        (CallbackAction::GenerateMore(expansion), Session::ViewingResults { results })
            if expansion == results.expansion =>
        {
            let start = results.next;
            if results.remaining() == 0 {
                bot.send_message(ctx.chat_id, "Every combination has been rendered already.")
                    .await?;
                return Ok(true);
            }
            ask_batch_count(bot, state, ctx, results, start).await?;
        }
        (CallbackAction::ShowPrompts, Session::ViewingResults { results }) => {
            show_results(bot, ctx, &results).await?;
        }
        (CallbackAction::MainMenu, _) => {
            state.clear_session(ctx.key);
            edit_or_send(
                bot,
                ctx,
                "Use /generate for new images or /settings to change generation settings."
                    .to_string(),
                None,
            )
            .await?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

pub async fn show_prompt_menu(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    character_ids: Vec<String>,
) -> Result<()> {
    let catalog = state.characters.load()?;
    let names = character_labels(&catalog, &character_ids)
        .into_iter()
        .map(|(_, name)| name)
        .collect::<Vec<_>>()
        .join(", ");
    let prompts = state.db.saved_prompts(ctx.key.user_id).await?;
    let text = format!(
        "Characters: <b>{}</b>\n\nPick a saved base prompt or type a new one.",
        escape_html(&names)
    );
    edit_or_send(bot, ctx, text, Some(saved_prompts_keyboard(&prompts))).await?;
    state.set_session(ctx.key, Session::ChoosingPrompt { character_ids });
    Ok(())
}

async fn prepare_results(
    state: &AppState,
    user_id: i64,
    character_ids: &[String],
    base_prompt: &str,
) -> Result<Expansion> {
    let catalog = state.characters.load()?;
    let characters = resolve_characters(&catalog, character_ids);
    let total = combination_count(&characters);
    if total > CONFIG.max_combinations {
        return Ok(Expansion::Rejected(format!(
            "That selection has {total} combinations, more than the limit of {}. Use /generate and pick fewer characters.",
            CONFIG.max_combinations
        )));
    }

    let prompts = match expand(&characters, base_prompt) {
        Ok(prompts) => prompts,
        Err(ExpandError::EmptySelection) => {
            return Ok(Expansion::Rejected(
                "None of the selected characters exist any more. Use /generate to pick again."
                    .to_string(),
            ))
        }
    };
    let settings = state.db.get_user_data(user_id).await?.settings;
    info!(
        "Expanded {} character(s) into {} combination(s) for user {}",
        characters.len(),
        prompts.len(),
        user_id
    );
    Ok(Expansion::Ready(ResultSet::new(
        prompts,
        settings,
        state.next_expansion_id(),
    )))
}

async fn start_results_from_menu(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    character_ids: Vec<String>,
    base_prompt: &str,
) -> Result<()> {
    match prepare_results(state, ctx.key.user_id, &character_ids, base_prompt).await? {
        Expansion::Ready(results) => {
            show_results(bot, ctx, &results).await?;
            state.set_session(ctx.key, Session::ViewingResults { results });
        }
        Expansion::Rejected(reason) => {
            state.clear_session(ctx.key);
            edit_or_send(bot, ctx, escape_html(&reason), None).await?;
        }
    }
    Ok(())
}

pub async fn on_base_prompt(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    key: SessionKey,
    character_ids: Vec<String>,
    text: &str,
) -> Result<()> {
    let base_prompt = text.trim();
    if base_prompt.is_empty() {
        return Ok(());
    }

    match prepare_results(state, key.user_id, &character_ids, base_prompt).await? {
        Expansion::Ready(results) => {
            let stored = state
                .db
                .add_saved_prompt(key.user_id, base_prompt, CONFIG.max_saved_prompts)
                .await?;
            if !stored {
                bot.send_message(
                    message.chat.id,
                    format!(
                        "You already have {} saved prompts, so this one was used without saving. Delete one from the prompt menu to make room.",
                        CONFIG.max_saved_prompts
                    ),
                )
                .await?;
            }
            bot.send_message(
                message.chat.id,
                format_results_message(&results, CONFIG.telegram_max_length),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(results_keyboard(&results))
            .await?;
            state.set_session(key, Session::ViewingResults { results });
        }
        Expansion::Rejected(reason) => {
            state.clear_session(key);
            bot.send_message(message.chat.id, reason).await?;
        }
    }
    Ok(())
}

async fn show_results(bot: &Bot, ctx: &CallbackContext, results: &ResultSet) -> Result<()> {
    edit_or_send(
        bot,
        ctx,
        format_results_message(results, CONFIG.telegram_max_length),
        Some(results_keyboard(results)),
    )
    .await
}

/// HTML view of the combination at `results.index`. Each prompt is cut so
/// the whole message stays under `max_length` characters.
pub fn format_results_message(results: &ResultSet, max_length: usize) -> String {
    let budget = max_length.saturating_sub(120) / 2;
    let Some(pair) = results.get(results.index) else {
        return "No combinations.".to_string();
    };
    let render = |text: &str| {
        if text.is_empty() {
            "<i>(empty)</i>".to_string()
        } else {
            format!("<code>{}</code>", escape_html(&truncate_chars(text, budget)))
        }
    };
    format!(
        "🎨 Combination {}/{}\n\n<b>Positive:</b>\n{}\n\n<b>Negative:</b>\n{}",
        results.index + 1,
        results.len(),
        render(&pair.positive),
        render(&pair.negative)
    )
}

async fn ask_batch_count(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    results: ResultSet,
    start: usize,
) -> Result<()> {
    let available = results.len().saturating_sub(start);
    bot.send_message(
        ctx.chat_id,
        format!(
            "How many images? Starting from combination {}, up to {} available.",
            start + 1,
            available
        ),
    )
    .await?;
    state.set_session(ctx.key, Session::WaitingBatchCount { results, start });
    Ok(())
}

pub async fn on_batch_count(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    key: SessionKey,
    results: ResultSet,
    start: usize,
    text: &str,
) -> Result<()> {
    let count = match text.trim().parse::<usize>() {
        Ok(count) if count > 0 => count,
        _ => {
            bot.send_message(message.chat.id, "Send a positive whole number, for example 5.")
                .await?;
            return Ok(());
        }
    };
    let range = results.batch_range(start, count);
    if range.is_empty() {
        bot.send_message(message.chat.id, "There are no combinations left in that range.")
            .await?;
        state.set_session(key, Session::ViewingResults { results });
        return Ok(());
    }
    spawn_generation(bot.clone(), state.clone(), key, results, range);
    Ok(())
}

fn spawn_generation(
    bot: Bot,
    state: AppState,
    key: SessionKey,
    results: ResultSet,
    range: Range<usize>,
) {
    state.set_session(key, Session::Generating);
    tokio::spawn(async move {
        if let Err(err) = run_generation(&bot, &state, key, results, range).await {
            error!("Generation run for user {} failed: {err:#}", key.user_id);
            if let Err(send_err) = bot
                .send_message(
                    ChatId(key.chat_id),
                    "Something went wrong while sending images. Use /generate to try again.",
                )
                .await
            {
                warn!("Failed to report generation error: {send_err}");
            }
        }
    });
}

async fn run_generation(
    bot: &Bot,
    state: &AppState,
    key: SessionKey,
    mut results: ResultSet,
    range: Range<usize>,
) -> Result<()> {
    let outcome = render_range(bot, state, key, &mut results, range).await;
    let keyboard = post_generation_keyboard(&results);

    // A new /generate during the run owns the session now.
    if state.session(key) != Session::Generating {
        return outcome.map(|_| ());
    }
    state.set_session(key, Session::ViewingResults { results });

    let summary = outcome?;
    bot.send_message(ChatId(key.chat_id), summary)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn render_range(
    bot: &Bot,
    state: &AppState,
    key: SessionKey,
    results: &mut ResultSet,
    range: Range<usize>,
) -> Result<String> {
    let chat_id = ChatId(key.chat_id);
    let total = results.len();
    let planned = range.len();
    let status = bot
        .send_message(
            chat_id,
            format!("⏳ Generating {planned} image(s). This can take a while..."),
        )
        .await?;
    let _heartbeat = start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadPhoto);

    let mut rendered = 0usize;
    let mut failed = 0usize;
    let mut backend_down = false;
    for (position, index) in range.enumerate() {
        let Some(pair) = results.get(index).cloned() else {
            break;
        };
        if planned > 1 {
            if let Err(err) = bot
                .edit_message_text(
                    chat_id,
                    status.id,
                    format!(
                        "⏳ Generating image {}/{} (combination {}/{})...",
                        position + 1,
                        planned,
                        index + 1,
                        total
                    ),
                )
                .await
            {
                debug!("Progress update failed: {err}");
            }
        }

        match state
            .a1111
            .txt2img(&pair.positive, &pair.negative, &results.settings)
            .await
        {
            Ok(image) => {
                let file_name = image_file_name(&image);
                bot.send_photo(chat_id, InputFile::memory(image).file_name(file_name))
                    .caption(format!("Combination {}/{}", index + 1, total))
                    .await?;
                rendered += 1;
                results.record_attempt(index, true);
                record_generation(state, key, &pair, "success", None).await;
            }
            Err(err) => {
                warn!(
                    "txt2img failed for combination {}/{} (user {}): {}",
                    index + 1,
                    total,
                    key.user_id,
                    err
                );
                failed += 1;
                record_generation(state, key, &pair, "error", Some(err.to_string())).await;
                bot.send_message(
                    chat_id,
                    format!("❌ Combination {}/{} failed: {}", index + 1, total, err),
                )
                .await?;
                let unreachable = matches!(err, A1111Error::Timeout(_) | A1111Error::Transport(_));
                results.record_attempt(index, !unreachable);
                if unreachable {
                    backend_down = true;
                    break;
                }
            }
        }
    }

    if let Err(err) = bot.delete_message(chat_id, status.id).await {
        debug!("Failed to remove progress message: {err}");
    }

    let mut summary = format!("Done: {rendered} of {planned} image(s) generated");
    if failed > 0 {
        summary.push_str(&format!(", {failed} failed"));
    }
    summary.push('.');
    if backend_down {
        summary.push_str(" The image backend is not responding, so the rest was skipped.");
    }
    Ok(summary)
}

async fn record_generation(
    state: &AppState,
    key: SessionKey,
    pair: &PromptPair,
    status: &str,
    detail: Option<String>,
) {
    let insert = GenerationInsert {
        user_id: key.user_id,
        chat_id: key.chat_id,
        positive: pair.positive.clone(),
        negative: pair.negative.clone(),
        status: status.to_string(),
        detail,
        created_at: Utc::now(),
    };
    if let Err(err) = state.db.queue_generation_record(insert).await {
        warn!("{err}");
    }
}

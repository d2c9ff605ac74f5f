use anyhow::Result;
use indexmap::IndexMap;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{info, warn};

use crate::a1111::{SdModel, SAMPLERS};
use crate::db::models::{GenerationSettings, SettingField};
use crate::handlers::generate::show_prompt_menu;
use crate::handlers::keyboards::{
    model_selection_keyboard, sampler_keyboard, settings_keyboard, CallbackAction,
};
use crate::handlers::{edit_or_send, escape_html, session_key_for, CallbackContext};
use crate::state::{AppState, Session, SessionKey};
use crate::storage::bot_settings::display_model_name;
use crate::utils::timing::start_command_timer;

pub async fn settings_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("settings", &message);
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

    let settings = state.db.get_user_data(key.user_id).await?.settings;
    let aliases = state.bot_settings.load()?.model_aliases;
    bot.send_message(message.chat.id, settings_text(&settings, &aliases))
        .parse_mode(ParseMode::Html)
        .reply_markup(settings_keyboard(&settings, &aliases, false))
        .await?;
    state.set_session(
        key,
        Session::EditingSettings {
            character_ids: Vec::new(),
        },
    );
    timer.complete("success");
    Ok(())
}

pub fn settings_text(settings: &GenerationSettings, aliases: &IndexMap<String, String>) -> String {
    let model = match settings.model_name.as_deref() {
        Some(model) => escape_html(display_model_name(model, aliases)),
        None => "backend default".to_string(),
    };
    format!(
        "⚙️ <b>Generation settings</b>\n\n\
         Model: {model}\n\
         Sampler: {}\n\
         Steps: {}\n\
         CFG Scale: {}\n\
         Size: {}x{}\n\n\
         Tap a button to change a value.",
        escape_html(&settings.sampler_name),
        settings.steps,
        settings.cfg_scale,
        settings.width,
        settings.height
    )
}

fn field_value(settings: &GenerationSettings, field: SettingField) -> String {
    match field {
        SettingField::Steps => settings.steps.to_string(),
        SettingField::CfgScale => settings.cfg_scale.to_string(),
        SettingField::Width => settings.width.to_string(),
        SettingField::Height => settings.height.to_string(),
    }
}

/// Settings can be opened from /settings or from the prompt menu; in the
/// latter case the chosen characters ride along so Done can return there.
fn settings_context(session: Session) -> Option<(Vec<String>, Vec<SdModel>)> {
    match session {
        Session::ChoosingModel {
            character_ids,
            models,
        } => Some((character_ids, models)),
        Session::EditingSettings { character_ids }
        | Session::WaitingSettingValue { character_ids, .. }
        | Session::ChoosingPrompt { character_ids }
        | Session::DeletingPrompt { character_ids }
        | Session::WaitingBasePrompt { character_ids } => Some((character_ids, Vec::new())),
        _ => None,
    }
}

pub async fn on_callback(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    session: Session,
    action: CallbackAction,
) -> Result<bool> {
    let Some((character_ids, models)) = settings_context(session) else {
        return Ok(false);
    };
    let user_id = ctx.key.user_id;

    match action {
        CallbackAction::OpenSettings => {
            show_settings(bot, state, ctx, character_ids).await?;
        }
        CallbackAction::ChooseModel => match state.a1111.list_models().await {
            Ok(models) if !models.is_empty() => {
                let aliases = state.bot_settings.load()?.model_aliases;
                edit_or_send(
                    bot,
                    ctx,
                    "Choose a model:".to_string(),
                    Some(model_selection_keyboard(&models, &aliases)),
                )
                .await?;
                state.set_session(
                    ctx.key,
                    Session::ChoosingModel {
                        character_ids,
                        models,
                    },
                );
            }
            Ok(_) => {
                bot.send_message(ctx.chat_id, "The image backend reports no models.")
                    .await?;
            }
            Err(err) => {
                warn!("Failed to list models: {err}");
                bot.send_message(ctx.chat_id, format!("Could not load the model list: {err}"))
                    .await?;
            }
        },
        CallbackAction::SetModel(index) => {
            let Some(model) = models.get(index) else {
                return Ok(false);
            };
            update_settings(state, user_id, |settings| {
                settings.model_name = Some(model.title.clone());
            })
            .await?;
            info!("User {} switched model to {}", user_id, model.title);
            show_settings(bot, state, ctx, character_ids).await?;
        }
        CallbackAction::ClearModel => {
            update_settings(state, user_id, |settings| settings.model_name = None).await?;
            show_settings(bot, state, ctx, character_ids).await?;
        }
        CallbackAction::ChooseSampler => {
            edit_or_send(
                bot,
                ctx,
                "Choose a sampler:".to_string(),
                Some(sampler_keyboard()),
            )
            .await?;
            state.set_session(ctx.key, Session::EditingSettings { character_ids });
        }
        CallbackAction::SetSampler(index) => {
            let Some(sampler) = SAMPLERS.get(index) else {
                return Ok(false);
            };
            update_settings(state, user_id, |settings| {
                settings.sampler_name = sampler.to_string();
            })
            .await?;
            show_settings(bot, state, ctx, character_ids).await?;
        }
        CallbackAction::EditField(field) => {
            let settings = state.db.get_user_data(user_id).await?.settings;
            bot.send_message(
                ctx.chat_id,
                format!(
                    "Send the new {field} value, {}. Current: {}",
                    field.hint(),
                    field_value(&settings, field)
                ),
            )
            .await?;
            state.set_session(
                ctx.key,
                Session::WaitingSettingValue {
                    character_ids,
                    field,
                },
            );
        }
        CallbackAction::SettingsDone => {
            if character_ids.is_empty() {
                state.clear_session(ctx.key);
                edit_or_send(
                    bot,
                    ctx,
                    "Settings saved. Use /generate to create images.".to_string(),
                    None,
                )
                .await?;
            } else {
                show_prompt_menu(bot, state, ctx, character_ids).await?;
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

async fn update_settings<F>(state: &AppState, user_id: i64, change: F) -> Result<GenerationSettings>
where
    F: FnOnce(&mut GenerationSettings),
{
    let mut settings = state.db.get_user_data(user_id).await?.settings;
    change(&mut settings);
    state.db.put_settings(user_id, &settings).await?;
    Ok(settings)
}

async fn show_settings(
    bot: &Bot,
    state: &AppState,
    ctx: &CallbackContext,
    character_ids: Vec<String>,
) -> Result<()> {
    let settings = state.db.get_user_data(ctx.key.user_id).await?.settings;
    let aliases = state.bot_settings.load()?.model_aliases;
    let continue_to_prompt = !character_ids.is_empty();
    edit_or_send(
        bot,
        ctx,
        settings_text(&settings, &aliases),
        Some(settings_keyboard(&settings, &aliases, continue_to_prompt)),
    )
    .await?;
    state.set_session(ctx.key, Session::EditingSettings { character_ids });
    Ok(())
}

pub async fn on_value(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    key: SessionKey,
    character_ids: Vec<String>,
    field: SettingField,
    text: &str,
) -> Result<()> {
    let mut settings = state.db.get_user_data(key.user_id).await?.settings;
    if let Err(err) = settings.apply(field, text) {
        bot.send_message(message.chat.id, format!("{err}. Try again."))
            .await?;
        return Ok(());
    }
    state.db.put_settings(key.user_id, &settings).await?;
    info!(
        "User {} set {} to {}",
        key.user_id,
        field.key(),
        field_value(&settings, field)
    );

    let aliases = state.bot_settings.load()?.model_aliases;
    let continue_to_prompt = !character_ids.is_empty();
    bot.send_message(message.chat.id, settings_text(&settings, &aliases))
        .parse_mode(ParseMode::Html)
        .reply_markup(settings_keyboard(&settings, &aliases, continue_to_prompt))
        .await?;
    state.set_session(key, Session::EditingSettings { character_ids });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_shows_alias_and_size() {
        let mut aliases = IndexMap::new();
        aliases.insert("anything-v5.safetensors".to_string(), "Anything <v5>".to_string());
        let settings = GenerationSettings {
            model_name: Some("anything-v5.safetensors".to_string()),
            ..GenerationSettings::default()
        };
        let text = settings_text(&settings, &aliases);
        assert!(text.contains("Model: Anything &lt;v5&gt;"));
        assert!(text.contains("Size: 512x768"));
        assert!(text.contains("Sampler: DPM++ 2M Karras"));

        let text = settings_text(&GenerationSettings::default(), &IndexMap::new());
        assert!(text.contains("Model: backend default"));
    }

    #[test]
    fn prompt_menu_sessions_carry_characters_into_settings() {
        let ids = vec!["Robot".to_string()];
        let (carried, models) = settings_context(Session::ChoosingPrompt {
            character_ids: ids.clone(),
        })
        .unwrap();
        assert_eq!(carried, ids);
        assert!(models.is_empty());

        assert!(settings_context(Session::Idle).is_none());
        assert!(settings_context(Session::AdminMenu).is_none());
    }

    #[test]
    fn field_values_render_current_settings() {
        let settings = GenerationSettings::default();
        assert_eq!(field_value(&settings, SettingField::Steps), "25");
        assert_eq!(field_value(&settings, SettingField::CfgScale), "7");
        assert_eq!(field_value(&settings, SettingField::Height), "768");
    }
}

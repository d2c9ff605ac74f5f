pub mod admin;
pub mod generate;
pub mod keyboards;
pub mod settings;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, MessageId, ParseMode};
use tracing::{debug, warn};

use crate::config::CONFIG;
use crate::handlers::keyboards::CallbackAction;
use crate::state::{AppState, Session, SessionKey};
use crate::utils::telegram::user_id_of;

const EXPIRED_MENU_TEXT: &str = "This menu has expired. Use /generate to start again.";
const BUSY_TEXT: &str = "Images are still being generated, please wait.";

/// Where a button press came from.
#[derive(Debug, Clone, Copy)]
pub struct CallbackContext {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub key: SessionKey,
}

impl CallbackContext {
    pub fn from_query(query: &CallbackQuery) -> Option<Self> {
        let message = query.message.as_ref()?;
        let chat_id = message.chat().id;
        Some(Self {
            chat_id,
            message_id: message.id(),
            key: SessionKey::new(chat_id.0, user_id_of(&query.from)),
        })
    }
}

pub fn session_key_for(message: &Message) -> Option<SessionKey> {
    let user = message.from.as_ref()?;
    Some(SessionKey::new(message.chat.id.0, user_id_of(user)))
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Replaces the menu message in place, falling back to a fresh message when
/// Telegram refuses the edit (message too old, identical content, ...).
pub async fn edit_or_send(
    bot: &Bot,
    ctx: &CallbackContext,
    html: String,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<()> {
    let mut edit = bot
        .edit_message_text(ctx.chat_id, ctx.message_id, html.clone())
        .parse_mode(ParseMode::Html);
    if let Some(markup) = markup.clone() {
        edit = edit.reply_markup(markup);
    }
    if let Err(err) = edit.await {
        debug!("edit_message_text failed, sending a new message: {err}");
        let mut send = bot.send_message(ctx.chat_id, html).parse_mode(ParseMode::Html);
        if let Some(markup) = markup {
            send = send.reply_markup(markup);
        }
        send.await?;
    }
    Ok(())
}

pub async fn handle_callback(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(ctx) = CallbackContext::from_query(&query) else {
        bot.answer_callback_query(query.id.clone()).await?;
        return Ok(());
    };
    let Some(action) = CallbackAction::parse(data) else {
        warn!("Unknown callback payload '{}'", data);
        bot.answer_callback_query(query.id.clone())
            .text(EXPIRED_MENU_TEXT)
            .await?;
        return Ok(());
    };

    if action.is_admin() && !CONFIG.is_admin(ctx.key.user_id) {
        bot.answer_callback_query(query.id.clone())
            .text("Administrators only.")
            .show_alert(true)
            .await?;
        return Ok(());
    }

    let session = state.session(ctx.key);
    if session == Session::Generating && action != CallbackAction::Ignore {
        bot.answer_callback_query(query.id.clone())
            .text(BUSY_TEXT)
            .await?;
        return Ok(());
    }

    bot.answer_callback_query(query.id.clone()).await?;

    let handled = match action {
        CallbackAction::Ignore => true,
        CallbackAction::AdminAdd
        | CallbackAction::AdminList
        | CallbackAction::AdminDeleteMenu
        | CallbackAction::AdminDelete(_)
        | CallbackAction::AdminAliases
        | CallbackAction::AdminAlias(_)
        | CallbackAction::AdminBack
        | CallbackAction::AdminClose => admin::on_callback(&bot, &state, &ctx, session, action).await?,
        CallbackAction::OpenSettings
        | CallbackAction::ChooseModel
        | CallbackAction::SetModel(_)
        | CallbackAction::ClearModel
        | CallbackAction::ChooseSampler
        | CallbackAction::SetSampler(_)
        | CallbackAction::EditField(_)
        | CallbackAction::SettingsDone => {
            settings::on_callback(&bot, &state, &ctx, session, action).await?
        }
        _ => generate::on_callback(&bot, &state, &ctx, session, action).await?,
    };

    if !handled {
        bot.send_message(ctx.chat_id, EXPIRED_MENU_TEXT).await?;
    }
    Ok(())
}

/// Free text is only meaningful while a wizard step is waiting for it.
pub async fn handle_text(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(text) = message.text() else {
        return Ok(());
    };
    if text.trim_start().starts_with('/') {
        return Ok(());
    }
    let Some(key) = session_key_for(&message) else {
        return Ok(());
    };

    match state.session(key) {
        Session::ChoosingPrompt { character_ids } | Session::WaitingBasePrompt { character_ids } => {
            generate::on_base_prompt(&bot, &state, &message, key, character_ids, text).await
        }
        Session::WaitingBatchCount { results, start } => {
            generate::on_batch_count(&bot, &state, &message, key, results, start, text).await
        }
        Session::WaitingSettingValue {
            character_ids,
            field,
        } => settings::on_value(&bot, &state, &message, key, character_ids, field, text).await,
        Session::AdminCharacter { draft, step } => {
            admin::on_draft_text(&bot, &state, &message, key, draft, step, text).await
        }
        Session::AdminAliasValue { model } => {
            admin::on_alias_text(&bot, &state, &message, key, model, text).await
        }
        Session::Generating => {
            bot.send_message(message.chat.id, BUSY_TEXT).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(
            escape_html("<b>\"tom & jerry's\"</b>"),
            "&lt;b&gt;&quot;tom &amp; jerry&#39;s&quot;&lt;/b&gt;"
        );
        assert_eq!(escape_html("(masterpiece:1.2)"), "(masterpiece:1.2)");
    }
}

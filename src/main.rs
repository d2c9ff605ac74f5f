use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod a1111;
mod config;
mod db;
mod handlers;
mod prompt;
mod state;
mod storage;
mod utils;

use a1111::A1111Client;
use config::CONFIG;
use db::database::Database;
use handlers::{admin, generate, settings};
use state::AppState;
use storage::bot_settings::BotSettingsStore;
use storage::characters::{CharacterRepository, JsonCharacterStore};
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
enum Command {
    #[command(description = "introduction")]
    Start,
    #[command(description = "how prompt combinations work")]
    Help,
    #[command(description = "pick characters and build prompts")]
    Generate,
    #[command(description = "generation settings")]
    Settings,
    #[command(description = "abandon the current dialog")]
    Cancel,
    #[command(description = "character and model management")]
    Admin,
    #[command(description = "bot health")]
    Status,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!("Starting A1111 prompt bot");

    let db = Database::init(&CONFIG.database_url).await?;
    let characters: Arc<dyn CharacterRepository> = Arc::new(JsonCharacterStore::new(
        &CONFIG.characters_file_path,
        &CONFIG.characters_example_file_path,
    ));
    match characters.load() {
        Ok(catalog) => info!("Loaded {} character(s)", catalog.len()),
        Err(err) => warn!("Character catalog is unreadable: {err}"),
    }
    let bot_settings = BotSettingsStore::new(&CONFIG.bot_settings_file_path);
    let a1111 = A1111Client::new(CONFIG.a1111_api_url.clone(), CONFIG.a1111_timeout);
    if !a1111.health_check().await {
        warn!(
            "Image backend at {} is not reachable yet",
            CONFIG.a1111_api_url
        );
    }
    let state = AppState::new(db, characters, bot_settings, a1111);

    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {err}");
    }

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text_message))
        .endpoint(ignore_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    let outcome = match command {
        Command::Start => generate::start_handler(bot, message).await,
        Command::Help => generate::help_handler(bot, message).await,
        Command::Generate => generate::generate_handler(bot, state, message).await,
        Command::Settings => settings::settings_handler(bot, state, message).await,
        Command::Cancel => generate::cancel_handler(bot, state, message).await,
        Command::Admin => admin::admin_handler(bot, state, message).await,
        Command::Status => admin::status_handler(bot, state, message).await,
    };
    if let Err(err) = outcome {
        error!("command handler failed: {err:#}");
    }
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    if let Err(err) = handlers::handle_callback(bot, state, query).await {
        error!("callback handler failed: {err:#}");
    }
    Ok(())
}

async fn handle_text_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    if let Err(err) = handlers::handle_text(bot, state, message).await {
        error!("text handler failed: {err:#}");
    }
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}

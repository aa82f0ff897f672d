use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use journalgpt::chatbot::{BotState, Command, UserLocks, Whisper, schema};
use journalgpt::config::Config;
use journalgpt::openai;
use journalgpt::store::Store;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "journalgpt.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "journalgpt.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting journalgpt...");
    info!("Loaded config from {config_path}");
    info!("Models: {:?}", config.available_text_models);

    let store = match Store::open(&config.database_path, config.default_model()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database {:?}: {e}", config.database_path);
            std::process::exit(1);
        }
    };

    let whisper = match &config.whisper_model_path {
        Some(path) => match Whisper::new(path) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("Voice transcription disabled: {e}");
                None
            }
        },
        None => {
            info!("Voice transcription disabled (no whisper_model_path)");
            None
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);
    let (bot_id, bot_username) = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            (me.id, me.username().to_string())
        }
        Err(e) => {
            error!("Failed to get bot info: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {e}");
    }

    let openai = openai::Client::new(config.openai_api_key.clone(), config.openai_api_base.clone());
    let state = Arc::new(BotState {
        config,
        store,
        openai,
        whisper,
        locks: UserLocks::new(),
        bot_id,
        bot_username,
    });

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("👋 Shut down");
}

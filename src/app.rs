use std::sync::Arc;
use std::time::Duration;

use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::info;
use tracing::warn;

use crate::bot;
use crate::bot::AppContext;
use crate::bot::Command;
use crate::bot::DialogueStorage;
use crate::sync;

pub struct App {
  bot: Bot,
  context: Arc<AppContext>,
  handler: UpdateHandler<anyhow::Error>,
  sync_period: Duration,
}

impl App {
  pub fn new(bot: Bot, context: AppContext, sync_period: Duration) -> Self {
    let handler = bot::build_schema();
    Self {
      bot,
      context: Arc::new(context),
      handler,
      sync_period,
    }
  }

  pub async fn run(self) -> anyhow::Result<()> {
    let storage: Arc<DialogueStorage> = InMemStorage::new();

    let me = self.bot.get_me().await?;
    info!(username = ?me.username, "connected to telegram");
    if let Err(err) = self.bot.set_my_commands(Command::bot_commands()).await {
      warn!(error = %err, "failed to register bot commands");
    }

    if self.context.outbox().is_some() {
      tokio::spawn(sync::run(self.context.clone(), self.sync_period));
    }

    Dispatcher::builder(self.bot.clone(), self.handler)
      .dependencies(dptree::deps![self.context.clone(), storage.clone(), me])
      .error_handler(LoggingErrorHandler::with_custom_text("error while handling update"))
      .enable_ctrlc_handler()
      .build()
      .dispatch()
      .await;

    Ok(())
  }
}

mod app;
mod bot;
mod collector;
mod config;
mod db;
mod form;
mod guard;
mod models;
mod notifier;
mod notion;
mod sync;
mod telemetry;
mod util;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use teloxide::prelude::Bot;
use tracing::info;

use crate::bot::AppContext;
use crate::db::Db;
use crate::form::Form;
use crate::guard::AccessGuard;
use crate::notifier::Notifier;
use crate::notion::NotionClient;

#[tokio::main]
async fn main() -> Result<()> {
  telemetry::init()?;
  let config = config::Config::from_env()?;
  info!(
    allowed_count = config.allowed_users.len(),
    notify_count = config.notify_users.len(),
    outbox = config.database_url.is_some(),
    "starting bot"
  );

  let bot = Bot::new(config.bot_token.clone());
  let writer = NotionClient::new(
    &config.notion_api_url,
    config.notion_token.clone(),
    config.notion_database_id.clone(),
  )?;
  let notifier = Notifier::new(Arc::new(bot.clone()), config.notify_users.clone());
  let mut context = AppContext::new(
    AccessGuard::new(&config.allowed_users),
    Form::organization()?,
    Arc::new(writer),
    notifier,
  )
  .with_session_idle(config.session_idle);

  if let Some(database_url) = &config.database_url {
    let db = Db::connect(database_url)
      .await
      .context("failed to connect to the outbox database")?;
    context = context.with_outbox(Arc::new(db));
  }

  let app = app::App::new(bot, context, config.outbox_sync_period);
  app.run().await
}

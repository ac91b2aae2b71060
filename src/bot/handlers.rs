use std::sync::Arc;

use anyhow::Context;
use teloxide::dispatching::UpdateHandler;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::KeyboardButton;
use teloxide::types::KeyboardMarkup;
use teloxide::types::KeyboardRemove;
use teloxide::types::Message;
use teloxide::types::ReplyMarkup;
use teloxide::types::User;
use teloxide::utils::command::BotCommands;
use tracing::info;
use tracing::instrument;

use crate::bot::Command;
use crate::bot::DialogueStorage;
use crate::bot::HandlerResult;
use crate::bot::context::AppContext;
use crate::bot::flow;
use crate::bot::flow::Input;
use crate::bot::flow::Reply;
use crate::models::Submitter;

type SharedContext = Arc<AppContext>;
type SharedStorage = Arc<DialogueStorage>;

const HELP_FOOTER: &str = "Send /start and answer each question to add an organization, \
or /edit <name> to change one that already exists. Type 'cancel' at any time to stop.";

pub fn build_schema() -> UpdateHandler<anyhow::Error> {
  let message_handler = Update::filter_message()
    .branch(command_branch())
    .branch(dptree::endpoint(handle_message));

  dptree::entry().branch(message_handler)
}

fn command_branch() -> UpdateHandler<anyhow::Error> {
  dptree::entry()
    .filter_command::<Command>()
    .branch(dptree::case![Command::Start].endpoint(handle_start))
    .branch(dptree::case![Command::Edit(query)].endpoint(handle_edit))
    .branch(dptree::case![Command::Help].endpoint(handle_help))
    .branch(dptree::case![Command::Cancel].endpoint(handle_cancel))
    .branch(dptree::case![Command::Retry].endpoint(handle_retry))
}

#[instrument(skip(bot, ctx, storage, msg))]
async fn handle_start(bot: Bot, storage: SharedStorage, ctx: SharedContext, msg: Message) -> HandlerResult {
  info!(chat_id = %msg.chat.id, "received /start command");
  run_flow(&bot, &ctx, storage, &msg, Input::Start).await
}

#[instrument(skip(bot, ctx, storage, msg))]
async fn handle_edit(
  bot: Bot,
  storage: SharedStorage,
  ctx: SharedContext,
  msg: Message,
  query: String,
) -> HandlerResult {
  info!(chat_id = %msg.chat.id, "received /edit command");
  run_flow(&bot, &ctx, storage, &msg, Input::Edit(query)).await
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_help(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user = sender(&msg)?;
  info!(chat_id = %msg.chat.id, "received /help command");
  let text = match flow::deny(&ctx, user.id.0 as i64) {
    Some(denied) => denied.text,
    None => format!("{}\n\n{HELP_FOOTER}", Command::descriptions()),
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, storage, msg))]
async fn handle_cancel(bot: Bot, storage: SharedStorage, ctx: SharedContext, msg: Message) -> HandlerResult {
  run_flow(&bot, &ctx, storage, &msg, Input::Cancel).await
}

#[instrument(skip(bot, ctx, storage, msg))]
async fn handle_retry(bot: Bot, storage: SharedStorage, ctx: SharedContext, msg: Message) -> HandlerResult {
  run_flow(&bot, &ctx, storage, &msg, Input::Retry).await
}

#[instrument(skip(bot, ctx, storage, msg))]
async fn handle_message(bot: Bot, storage: SharedStorage, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user = sender(&msg)?;
  match flow::route(&ctx, user.id.0 as i64, msg.text()) {
    Ok(input) => run_flow(&bot, &ctx, storage, &msg, input).await,
    Err(reply) => send_replies(&bot, msg.chat.id, vec![reply]).await,
  }
}

async fn run_flow(bot: &Bot, ctx: &AppContext, storage: SharedStorage, msg: &Message, input: Input) -> HandlerResult {
  let submitter = submitter_from(sender(msg)?);
  let dialogue = flow::dialogue_for(storage, submitter.user_id);
  let replies = flow::handle(ctx, &dialogue, &submitter, input).await?;
  send_replies(bot, msg.chat.id, replies).await
}

async fn send_replies(bot: &Bot, chat: ChatId, replies: Vec<Reply>) -> HandlerResult {
  for reply in replies {
    bot
      .send_message(chat, reply.text)
      .reply_markup(reply_markup(reply.choices.as_deref()))
      .await?;
  }
  Ok(())
}

fn reply_markup(choices: Option<&[String]>) -> ReplyMarkup {
  match choices {
    Some(choices) => ReplyMarkup::Keyboard(
      KeyboardMarkup::new(
        choices
          .iter()
          .map(|choice| vec![KeyboardButton::new(choice.clone())]),
      )
      .resize_keyboard()
      .one_time_keyboard(),
    ),
    None => ReplyMarkup::KeyboardRemove(KeyboardRemove::new()),
  }
}

fn sender(msg: &Message) -> anyhow::Result<&User> {
  msg.from.as_ref().context("message missing sender")
}

fn submitter_from(user: &User) -> Submitter {
  let label = if let Some(username) = &user.username {
    format!("@{username}")
  } else if let Some(last) = &user.last_name {
    format!("{} {last}", user.first_name)
  } else {
    user.first_name.clone()
  };
  Submitter {
    user_id: user.id.0 as i64,
    label,
  }
}

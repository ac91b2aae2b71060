//! Transport-independent intake conversation.
//!
//! [`handle`] applies the access guard, moves the user's conversation state
//! one step forward and returns the replies the transport should send. On the
//! last field the record is written to Notion and the notify-list is told.
//! `/edit` looks an existing row up by name and saves changed fields back,
//! telling the notify-list what changed.

use std::sync::Arc;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use teloxide::dispatching::dialogue::Dialogue;
use teloxide::types::ChatId;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::DialogueStorage;
use crate::bot::context::AppContext;
use crate::bot::state::ConversationState;
use crate::bot::state::EditSession;
use crate::bot::state::Session;
use crate::collector;
use crate::collector::Step;
use crate::form::FieldSpec;
use crate::form::Form;
use crate::guard::Access;
use crate::models::CompletedRecord;
use crate::models::FoundPage;
use crate::models::PropertyKind;
use crate::models::Submitter;
use crate::models::card_message;
use crate::models::change_message;
use crate::models::completion_message;
use crate::models::preview;
use crate::models::title_of;

pub type BotDialogue = Dialogue<ConversationState, DialogueStorage>;

pub const DENIED_TEXT: &str = "⛔ Your ID is not authorized to use this bot.";
pub const NON_TEXT_TEXT: &str = "✍️ Please answer with a text message.";
pub const UNKNOWN_COMMAND_TEXT: &str = "I did not understand that command. Use /help to see what I can do.";
const INTRO_TEXT: &str = "📝 Let's add a new organization. Send /cancel at any time to stop.";
const EXPIRED_TEXT: &str = "⌛ Your previous form expired. Let's start over.";
const CANCELLED_TEXT: &str = "❌ Organization entry cancelled. Send /start to begin again.";
const EDIT_CANCELLED_TEXT: &str = "❌ Editing cancelled. Nothing was changed in Notion.";
const NOTHING_TO_CANCEL_TEXT: &str = "Nothing to cancel. Send /start to add an organization.";
const NOTHING_TO_RETRY_TEXT: &str = "Nothing to retry. Send /start to add an organization.";
const PENDING_TEXT: &str = "💾 The last organization has not been saved yet. Send /retry to save it or /cancel to discard it.";
const FORM_BUSY_TEXT: &str = "Finish the current form or send /cancel before editing.";
const EDIT_BUSY_TEXT: &str = "You are editing an organization. Send Save to keep the changes or /cancel to drop them.";
const EDIT_USAGE_TEXT: &str = "Send /edit followed by the organization name, e.g. /edit Acme Corp.";
const EDIT_EXPIRED_TEXT: &str = "⌛ Your edit expired and nothing was saved. Send /edit to start again.";
const EDIT_MENU_TEXT: &str = "Choose a field to change, then Save.";
const PICK_TEXT: &str = "Please pick one of the listed organizations.";
const NOTHING_CHANGED_TEXT: &str = "Nothing changed, so Notion was left as it was.";
const SAVE_CHOICE: &str = "Save";
const CANCEL_CHOICE: &str = "Cancel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
  Start,
  Text(String),
  Cancel,
  Retry,
  /// Look up an existing organization by name.
  Edit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  pub text: String,
  /// Offered as a one-time keyboard when present.
  pub choices: Option<Vec<String>>,
}

impl Reply {
  pub fn text(text: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      choices: None,
    }
  }

  fn menu(text: impl Into<String>, choices: Vec<String>) -> Self {
    Self {
      text: text.into(),
      choices: Some(choices),
    }
  }

  fn prompt(field: &FieldSpec) -> Self {
    Self {
      text: field.prompt.clone(),
      choices: field.choices().map(<[String]>::to_vec),
    }
  }
}

/// Sessions belong to a user, so people sharing a group chat never share a form.
pub fn dialogue_for(storage: Arc<DialogueStorage>, user_id: i64) -> BotDialogue {
  Dialogue::new(storage, ChatId(user_id))
}

pub fn deny(ctx: &AppContext, user_id: i64) -> Option<Reply> {
  if ctx.guard().check(user_id) == Access::Granted {
    return None;
  }
  warn!(user_id, "rejected unauthorized user");
  Some(Reply::text(DENIED_TEXT))
}

/// Turns a message that no command matched into flow input, or the reply to send instead.
pub fn route(ctx: &AppContext, user_id: i64, text: Option<&str>) -> Result<Input, Reply> {
  if let Some(denied) = deny(ctx, user_id) {
    return Err(denied);
  }
  let Some(text) = text else {
    return Err(Reply::text(NON_TEXT_TEXT));
  };
  parse_input(text).ok_or_else(|| {
    info!(user_id, "unrecognized command");
    Reply::text(UNKNOWN_COMMAND_TEXT)
  })
}

/// Plain words typed instead of commands still control the form.
fn parse_input(text: &str) -> Option<Input> {
  let trimmed = text.trim();
  if trimmed.eq_ignore_ascii_case("cancel") {
    return Some(Input::Cancel);
  }
  if trimmed.eq_ignore_ascii_case("retry") {
    return Some(Input::Retry);
  }
  if trimmed.starts_with('/') {
    return None;
  }
  Some(Input::Text(text.to_string()))
}

#[instrument(skip(ctx, dialogue, submitter, input), fields(user_id = submitter.user_id))]
pub async fn handle(ctx: &AppContext, dialogue: &BotDialogue, submitter: &Submitter, input: Input) -> Result<Vec<Reply>> {
  if let Some(denied) = deny(ctx, submitter.user_id) {
    return Ok(vec![denied]);
  }

  let now = Utc::now();
  let state = dialogue.get_or_default().await?;
  match (state, input) {
    (ConversationState::Idle, Input::Cancel) => Ok(vec![Reply::text(NOTHING_TO_CANCEL_TEXT)]),
    (ConversationState::Idle, Input::Retry) => Ok(vec![Reply::text(NOTHING_TO_RETRY_TEXT)]),
    (ConversationState::Idle, Input::Start | Input::Text(_)) => {
      start_session(ctx, dialogue, submitter, now, INTRO_TEXT).await
    },
    (ConversationState::Idle | ConversationState::Choosing(_), Input::Edit(query)) => {
      look_up(ctx, dialogue, submitter, &query, now).await
    },
    (ConversationState::Collecting(_) | ConversationState::PendingWrite(_), Input::Cancel) => {
      dialogue.reset().await?;
      info!(user_id = submitter.user_id, "organization entry cancelled");
      Ok(vec![Reply::text(CANCELLED_TEXT)])
    },
    (ConversationState::Choosing(_) | ConversationState::Editing(_), Input::Cancel) => {
      dialogue.reset().await?;
      info!(user_id = submitter.user_id, "edit cancelled");
      Ok(vec![Reply::text(EDIT_CANCELLED_TEXT)])
    },
    (ConversationState::Collecting(session), _) if session.is_expired(now, ctx.session_idle()) => {
      info!(user_id = submitter.user_id, answered = session.cursor(), "session expired");
      start_session(ctx, dialogue, submitter, now, EXPIRED_TEXT).await
    },
    (ConversationState::Collecting(session), Input::Start | Input::Retry) => Ok(
      collector::current_field(ctx.form(), &session)
        .map(Reply::prompt)
        .into_iter()
        .collect(),
    ),
    (ConversationState::Collecting(session), Input::Edit(_)) => {
      let mut replies = vec![Reply::text(FORM_BUSY_TEXT)];
      replies.extend(collector::current_field(ctx.form(), &session).map(Reply::prompt));
      Ok(replies)
    },
    (ConversationState::Collecting(session), Input::Text(text)) => {
      collect(ctx, dialogue, submitter, session, &text, now).await
    },
    (ConversationState::PendingWrite(record), Input::Retry) => {
      info!(user_id = submitter.user_id, title = record.title(), "retrying notion write");
      complete(ctx, dialogue, record).await
    },
    (ConversationState::PendingWrite(_), Input::Start | Input::Text(_) | Input::Edit(_)) => {
      Ok(vec![Reply::text(PENDING_TEXT)])
    },
    (ConversationState::Choosing(_), Input::Start) => start_session(ctx, dialogue, submitter, now, INTRO_TEXT).await,
    (ConversationState::Choosing(pages), Input::Retry) => Ok(vec![pick_reply(ctx.form(), &pages, PICK_TEXT)]),
    (ConversationState::Choosing(pages), Input::Text(text)) => match picked(&pages, &text) {
      Some(page) => begin_edit(ctx, dialogue, page, now).await,
      None => Ok(vec![pick_reply(ctx.form(), &pages, PICK_TEXT)]),
    },
    (ConversationState::Editing(edit), _) if edit.is_expired(now, ctx.session_idle()) => {
      dialogue.reset().await?;
      info!(user_id = submitter.user_id, page_id = %edit.page_id, "edit expired");
      Ok(vec![Reply::text(EDIT_EXPIRED_TEXT)])
    },
    (ConversationState::Editing(edit), Input::Retry) => save(ctx, dialogue, submitter, edit).await,
    (ConversationState::Editing(edit), Input::Start | Input::Edit(_)) => {
      Ok(vec![Reply::text(EDIT_BUSY_TEXT), edit_menu(ctx.form(), &edit)])
    },
    (ConversationState::Editing(edit), Input::Text(text)) => edit_field(ctx, dialogue, submitter, edit, &text, now).await,
  }
}

async fn start_session(
  ctx: &AppContext,
  dialogue: &BotDialogue,
  submitter: &Submitter,
  now: DateTime<Utc>,
  intro: &str,
) -> Result<Vec<Reply>> {
  let session = Session::new(now);
  let mut replies = vec![Reply::text(intro)];
  replies.extend(collector::current_field(ctx.form(), &session).map(Reply::prompt));
  dialogue.update(ConversationState::Collecting(session)).await?;
  info!(user_id = submitter.user_id, "started organization session");
  Ok(replies)
}

async fn collect(
  ctx: &AppContext,
  dialogue: &BotDialogue,
  submitter: &Submitter,
  session: Session,
  text: &str,
  now: DateTime<Utc>,
) -> Result<Vec<Reply>> {
  match collector::advance(ctx.form(), session, submitter, text, now) {
    Step::Rejected { error, field } => {
      info!(user_id = submitter.user_id, field = %field.name, %error, "rejected field value");
      Ok(vec![Reply::text(error.user_message()), Reply::prompt(&field)])
    },
    Step::Next { session, field } => {
      dialogue.update(ConversationState::Collecting(session)).await?;
      Ok(vec![Reply::prompt(&field)])
    },
    Step::Completed(record) => complete(ctx, dialogue, record).await,
  }
}

/// Writes the record, notifies the notify-list and closes the session.
async fn complete(ctx: &AppContext, dialogue: &BotDialogue, record: CompletedRecord) -> Result<Vec<Reply>> {
  let err = match ctx.writer().create_record(&record).await {
    Ok(page) => {
      let report = ctx.notifier().notify_all(&completion_message(&record, &page)).await;
      dialogue.reset().await?;
      info!(
        user_id = record.submitter.user_id,
        page_id = %page.id,
        notified = report.delivered.len(),
        "organization saved"
      );
      let mut text = format!("✅ \"{}\" was saved to Notion.", preview(record.title()));
      push_undelivered(&mut text, report.failed.len());
      return Ok(vec![Reply::text(text)]);
    },
    Err(err) => err,
  };

  error!(error = %err, user_id = record.submitter.user_id, title = record.title(), "notion write failed");

  if let Some(outbox) = ctx.outbox() {
    match outbox.enqueue(&record, &err.to_string()).await {
      Ok(id) => {
        dialogue.reset().await?;
        info!(pending_id = id, "queued record for background sync");
        return Ok(vec![Reply::text(format!(
          "⏳ Notion is unavailable right now ({err}). The organization was queued as #{id} and will be saved automatically."
        ))]);
      },
      Err(queue_err) => warn!(error = %queue_err, "failed to queue record locally"),
    }
  }

  dialogue.update(ConversationState::PendingWrite(record)).await?;
  Ok(vec![Reply::text(format!(
    "❌ Could not save to Notion: {err}\nSend /retry to try again or /cancel to discard."
  ))])
}

async fn look_up(
  ctx: &AppContext,
  dialogue: &BotDialogue,
  submitter: &Submitter,
  query: &str,
  now: DateTime<Utc>,
) -> Result<Vec<Reply>> {
  let query = query.trim();
  if query.is_empty() {
    return Ok(vec![Reply::text(EDIT_USAGE_TEXT)]);
  }

  let title = ctx.form().title_field();
  let mut pages = match ctx.writer().find_records(&title.name, query).await {
    Ok(pages) => pages,
    Err(err) => {
      error!(error = %err, user_id = submitter.user_id, "notion lookup failed");
      return Ok(vec![Reply::text(format!("❌ Could not search Notion: {err}"))]);
    },
  };
  info!(user_id = submitter.user_id, matches = pages.len(), "looked up organization");

  match pages.len() {
    0 => {
      dialogue.update(ConversationState::Idle).await?;
      Ok(vec![Reply::text(format!(
        "🔍 No organization named \"{}\" was found. Send /start to add it.",
        preview(query)
      ))])
    },
    1 => begin_edit(ctx, dialogue, pages.remove(0), now).await,
    _ => {
      let intro = format!(
        "Several organizations are named \"{}\". Choose one:",
        preview(query)
      );
      let reply = pick_reply(ctx.form(), &pages, &intro);
      dialogue.update(ConversationState::Choosing(pages)).await?;
      Ok(vec![reply])
    },
  }
}

async fn begin_edit(ctx: &AppContext, dialogue: &BotDialogue, page: FoundPage, now: DateTime<Utc>) -> Result<Vec<Reply>> {
  let edit = EditSession::new(ctx.form(), &page, now);
  let replies = vec![Reply::text(card_message(&edit.entries)), edit_menu(ctx.form(), &edit)];
  info!(page_id = %edit.page_id, "editing organization");
  dialogue.update(ConversationState::Editing(edit)).await?;
  Ok(replies)
}

async fn edit_field(
  ctx: &AppContext,
  dialogue: &BotDialogue,
  submitter: &Submitter,
  mut edit: EditSession,
  text: &str,
  now: DateTime<Utc>,
) -> Result<Vec<Reply>> {
  let Some(index) = edit.selected else {
    if text.trim().eq_ignore_ascii_case(SAVE_CHOICE) {
      return save(ctx, dialogue, submitter, edit).await;
    }
    let Some(index) = ctx.form().position(text) else {
      return Ok(vec![edit_menu(ctx.form(), &edit)]);
    };
    let Some(field) = ctx.form().field(index) else {
      return Ok(vec![edit_menu(ctx.form(), &edit)]);
    };
    let current = edit.entries.get(index).map(|entry| entry.value.as_str()).unwrap_or("");
    let mut replies = Vec::new();
    if !current.is_empty() {
      replies.push(Reply::text(format!("Current value: {}", preview(current))));
    }
    replies.push(Reply::prompt(field));
    edit.selected = Some(index);
    edit.touched_at = now;
    dialogue.update(ConversationState::Editing(edit)).await?;
    return Ok(replies);
  };

  let Some(field) = ctx.form().field(index) else {
    edit.selected = None;
    let menu = edit_menu(ctx.form(), &edit);
    dialogue.update(ConversationState::Editing(edit)).await?;
    return Ok(vec![menu]);
  };
  match field.validator.apply(text) {
    Ok(value) => {
      if let Some(entry) = edit.entries.get_mut(index) {
        entry.value = value;
      }
      edit.selected = None;
      edit.touched_at = now;
      let replies = vec![Reply::text(card_message(&edit.entries)), edit_menu(ctx.form(), &edit)];
      dialogue.update(ConversationState::Editing(edit)).await?;
      Ok(replies)
    },
    Err(error) => {
      info!(user_id = submitter.user_id, field = %field.name, %error, "rejected edited value");
      Ok(vec![Reply::text(error.user_message()), Reply::prompt(field)])
    },
  }
}

/// Sends only the changed fields; a failed write keeps the edit for another try.
async fn save(ctx: &AppContext, dialogue: &BotDialogue, submitter: &Submitter, edit: EditSession) -> Result<Vec<Reply>> {
  let changed = edit.changed_entries();
  if changed.is_empty() {
    dialogue.reset().await?;
    return Ok(vec![Reply::text(NOTHING_CHANGED_TEXT)]);
  }

  let title = title_of(&edit.entries).to_string();
  match ctx.writer().update_record(&edit.page_id, &changed).await {
    Ok(page) => {
      let url = page.url.as_deref().or(edit.url.as_deref());
      let message = change_message(submitter, &title, &edit.changes(), url);
      let report = ctx.notifier().notify_all(&message).await;
      dialogue.reset().await?;
      info!(
        user_id = submitter.user_id,
        page_id = %page.id,
        changed = changed.len(),
        notified = report.delivered.len(),
        "organization updated"
      );
      let mut text = format!("✅ \"{}\" was updated in Notion.", preview(&title));
      push_undelivered(&mut text, report.failed.len());
      Ok(vec![Reply::text(text)])
    },
    Err(err) => {
      error!(error = %err, user_id = submitter.user_id, page_id = %edit.page_id, "notion update failed");
      let mut edit = edit;
      edit.selected = None;
      let menu = edit_menu(ctx.form(), &edit);
      dialogue.update(ConversationState::Editing(edit)).await?;
      Ok(vec![
        Reply::text(format!(
          "❌ Could not update Notion: {err}\nSend Save or /retry to try again, or /cancel to discard."
        )),
        menu,
      ])
    },
  }
}

fn edit_menu(form: &Form, edit: &EditSession) -> Reply {
  let mut choices: Vec<String> = form.fields().iter().map(|field| field.name.clone()).collect();
  choices.push(SAVE_CHOICE.to_string());
  choices.push(CANCEL_CHOICE.to_string());
  let pending = edit.changed_entries().len();
  let text = if pending == 0 {
    EDIT_MENU_TEXT.to_string()
  } else {
    format!("{EDIT_MENU_TEXT} ({pending} unsaved change(s))")
  };
  Reply::menu(text, choices)
}

fn pick_reply(form: &Form, pages: &[FoundPage], text: &str) -> Reply {
  let choices = pages
    .iter()
    .enumerate()
    .map(|(index, page)| format!("{}. {}", index + 1, describe(form, page)))
    .collect();
  Reply::menu(text, choices)
}

/// The title plus the page's select values, enough to tell namesakes apart.
fn describe(form: &Form, page: &FoundPage) -> String {
  let title = page.value(&form.title_field().name);
  let details: Vec<&str> = form
    .fields()
    .iter()
    .filter(|field| field.property == PropertyKind::Select)
    .map(|field| page.value(&field.name))
    .filter(|value| !value.is_empty())
    .collect();
  if details.is_empty() {
    preview(title)
  } else {
    format!("{} ({})", preview(title), details.join(", "))
  }
}

/// Accepts "2" as well as the "2. Acme Corp (...)" keyboard label.
fn picked(pages: &[FoundPage], text: &str) -> Option<FoundPage> {
  let digits: String = text.trim().chars().take_while(char::is_ascii_digit).collect();
  let number: usize = digits.parse().ok()?;
  pages.get(number.checked_sub(1)?).cloned()
}

fn push_undelivered(text: &mut String, failed: usize) {
  if failed > 0 {
    text.push_str(&format!("\n⚠️ {failed} notification(s) could not be delivered."));
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;
  use std::sync::Arc;

  use chrono::Duration;
  use chrono::Utc;
  use teloxide::dispatching::dialogue::InMemStorage;

  use super::BotDialogue;
  use super::DENIED_TEXT;
  use super::Input;
  use super::NON_TEXT_TEXT;
  use super::Reply;
  use super::UNKNOWN_COMMAND_TEXT;
  use super::dialogue_for;
  use super::handle;
  use super::parse_input;
  use super::route;
  use crate::bot::context::AppContext;
  use crate::bot::state::ConversationState;
  use crate::bot::state::Session;
  use crate::db::tests::MemOutbox;
  use crate::form::FieldSpec;
  use crate::form::Form;
  use crate::guard::AccessGuard;
  use crate::models::FoundPage;
  use crate::models::Submitter;
  use crate::notifier::Notifier;
  use crate::notifier::tests::RecordingSender;
  use crate::notion::tests::FakeWriter;

  const U1: i64 = 1;
  const U2: i64 = 2;
  const U9: i64 = 9;
  const NOTIFY_LIST: [i64; 2] = [100, 200];

  struct Harness {
    ctx: AppContext,
    writer: Arc<FakeWriter>,
    sender: Arc<RecordingSender>,
    storage: Arc<InMemStorage<ConversationState>>,
  }

  fn contact_form() -> Form {
    Form::new(vec![
      FieldSpec::text("name", "Name?"),
      FieldSpec::text("address", "Address?"),
      FieldSpec::text("contact", "Contact?"),
    ])
    .expect("form")
  }

  fn page(id: &str, values: &[(&str, &str)]) -> FoundPage {
    FoundPage {
      id: id.to_string(),
      url: Some(format!("https://notion.so/{id}")),
      properties: values
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect::<BTreeMap<_, _>>(),
    }
  }

  impl Harness {
    fn new(writer: FakeWriter) -> Self {
      Self::with_form(writer, contact_form())
    }

    fn with_form(writer: FakeWriter, form: Form) -> Self {
      let writer = Arc::new(writer);
      let sender = Arc::new(RecordingSender::default());
      let ctx = AppContext::new(
        AccessGuard::new(&[U1, U2]),
        form,
        writer.clone(),
        Notifier::new(sender.clone(), NOTIFY_LIST.to_vec()),
      );
      Self {
        ctx,
        writer,
        sender,
        storage: InMemStorage::new(),
      }
    }

    fn dialogue(&self, user_id: i64) -> BotDialogue {
      dialogue_for(self.storage.clone(), user_id)
    }

    async fn replies(&self, user_id: i64, input: Input) -> Vec<Reply> {
      let submitter = Submitter {
        user_id,
        label: format!("U{user_id}"),
      };
      handle(&self.ctx, &self.dialogue(user_id), &submitter, input)
        .await
        .expect("flow step")
    }

    async fn send(&self, user_id: i64, input: Input) -> Vec<String> {
      self
        .replies(user_id, input)
        .await
        .into_iter()
        .map(|reply| reply.text)
        .collect()
    }

    async fn text(&self, user_id: i64, text: &str) -> Vec<String> {
      self.send(user_id, Input::Text(text.to_string())).await
    }

    async fn state(&self, user_id: i64) -> Option<ConversationState> {
      self.dialogue(user_id).get().await.expect("storage")
    }

    async fn cursor(&self, user_id: i64) -> usize {
      match self.state(user_id).await {
        Some(ConversationState::Collecting(session)) => session.cursor(),
        other => panic!("expected collecting state, got {other:?}"),
      }
    }

    fn notifications(&self) -> usize {
      NOTIFY_LIST
        .iter()
        .map(|chat| self.sender.messages_to(*chat).len())
        .sum()
    }
  }

  #[tokio::test]
  async fn unauthorized_user_gets_denied_without_session() {
    let harness = Harness::new(FakeWriter::default());
    for input in [
      Input::Start,
      Input::Text("hello".to_string()),
      Input::Cancel,
      Input::Retry,
      Input::Edit("Acme Corp".to_string()),
    ] {
      assert_eq!(harness.send(U9, input).await, vec![DENIED_TEXT.to_string()]);
    }
    assert_eq!(harness.state(U9).await, None);
    assert_eq!(harness.writer.calls(), 0);
    assert_eq!(harness.notifications(), 0);
  }

  #[tokio::test]
  async fn unauthorized_media_and_unknown_commands_are_denied() {
    let harness = Harness::new(FakeWriter::default());
    assert_eq!(route(&harness.ctx, U9, None), Err(Reply::text(DENIED_TEXT)));
    assert_eq!(route(&harness.ctx, U9, Some("/foo")), Err(Reply::text(DENIED_TEXT)));
    assert_eq!(route(&harness.ctx, U9, Some("Acme Corp")), Err(Reply::text(DENIED_TEXT)));

    assert_eq!(route(&harness.ctx, U1, None), Err(Reply::text(NON_TEXT_TEXT)));
    assert_eq!(route(&harness.ctx, U1, Some("/foo")), Err(Reply::text(UNKNOWN_COMMAND_TEXT)));
    assert_eq!(
      route(&harness.ctx, U1, Some("Acme Corp")),
      Ok(Input::Text("Acme Corp".to_string()))
    );
  }

  #[test]
  fn maps_plain_words_to_controls() {
    assert_eq!(parse_input(" Cancel "), Some(Input::Cancel));
    assert_eq!(parse_input("RETRY"), Some(Input::Retry));
    assert_eq!(parse_input("/unknown"), None);
    assert_eq!(parse_input("Acme Corp"), Some(Input::Text("Acme Corp".to_string())));
  }

  #[tokio::test]
  async fn completes_form_writes_record_and_notifies() {
    let harness = Harness::new(FakeWriter::default());
    let replies = harness.send(U1, Input::Start).await;
    assert_eq!(replies.last().map(String::as_str), Some("Name?"));

    assert_eq!(harness.text(U1, "Acme Corp").await, vec!["Address?".to_string()]);
    assert_eq!(harness.text(U1, "San José").await, vec!["Contact?".to_string()]);
    let done = harness.text(U1, "+506...").await;
    assert!(done[0].contains("Acme Corp"));

    let written = harness.writer.records();
    assert_eq!(written.len(), 1);
    assert_eq!(
      written[0].pairs(),
      vec![("name", "Acme Corp"), ("address", "San José"), ("contact", "+506...")]
    );
    for chat in NOTIFY_LIST {
      let messages = harness.sender.messages_to(chat);
      assert_eq!(messages.len(), 1);
      assert!(messages[0].contains("address: San José"));
    }
    assert_eq!(harness.state(U1).await, None);
  }

  #[tokio::test]
  async fn organization_form_validates_and_normalizes_through_the_flow() {
    let form = Form::organization().expect("organization form");
    let harness = Harness::with_form(FakeWriter::default(), form);

    let opening = harness.replies(U1, Input::Start).await;
    assert_eq!(opening.last().map(|reply| reply.text.as_str()), Some("🏢 Enter the organization name:"));

    let kind = harness.replies(U1, Input::Text("Café Olé".to_string())).await;
    assert_eq!(
      kind[0].choices,
      Some(vec![
        "Places to eat".to_string(),
        "Adventures".to_string(),
        "Services".to_string()
      ])
    );

    let wrong_kind = harness.text(U1, "Hotels").await;
    assert!(wrong_kind[0].contains("Please choose one of"));
    assert_eq!(harness.cursor(U1).await, 1);

    harness.text(U1, "services").await;
    harness.text(U1, "San José").await;

    let wrong_link = harness.text(U1, "somewhere near the beach").await;
    assert_eq!(wrong_link.len(), 2);
    assert!(wrong_link[0].contains("Invalid link"));
    assert!(wrong_link[1].contains("Google Maps"));
    assert_eq!(harness.cursor(U1).await, 3);

    harness.text(U1, "https://maps.app.goo.gl/AbC123").await;
    let wrong_phone = harness.text(U1, "12-34").await;
    assert!(wrong_phone[0].contains("Invalid phone"));
    assert_eq!(harness.cursor(U1).await, 4);

    harness.text(U1, "8888-1234").await;
    harness.text(U1, "506 7777 1234").await;
    harness.text(U1, "Mon-Fri 8:00-17:00").await;
    let done = harness.text(U1, "+1 415 555 0100").await;
    assert!(done[0].contains("Café Olé"));

    let written = harness.writer.records();
    assert_eq!(written.len(), 1);
    assert_eq!(
      written[0].pairs(),
      vec![
        ("Name", "Café Olé"),
        ("Type", "Services"),
        ("Location", "San José"),
        ("Google Map", "https://maps.app.goo.gl/AbC123"),
        ("Phone Number", "+50688881234"),
        ("WhatsApp Number", "+50677771234"),
        ("Hours of Operation", "Mon-Fri 8:00-17:00"),
        ("Owner / Manager", "14155550100"),
      ]
    );
    assert_eq!(harness.notifications(), 2);
    assert_eq!(harness.state(U1).await, None);
  }

  #[tokio::test]
  async fn first_text_only_opens_the_session() {
    let harness = Harness::new(FakeWriter::default());
    let replies = harness.text(U1, "hi").await;
    assert_eq!(replies.last().map(String::as_str), Some("Name?"));
    assert_eq!(harness.cursor(U1).await, 0);
  }

  #[tokio::test]
  async fn cancel_at_any_field_leaves_no_trace() {
    for answered in 0 .. 3 {
      let harness = Harness::new(FakeWriter::default());
      harness.send(U1, Input::Start).await;
      for value in ["a", "b", "c"].iter().take(answered) {
        harness.text(U1, value).await;
      }
      assert_eq!(harness.send(U1, Input::Cancel).await.len(), 1);
      assert_eq!(harness.state(U1).await, None);
      assert_eq!(harness.writer.calls(), 0);
      assert_eq!(harness.notifications(), 0);
    }
  }

  #[tokio::test]
  async fn empty_input_repeats_the_prompt() {
    let harness = Harness::new(FakeWriter::default());
    harness.send(U1, Input::Start).await;
    harness.text(U1, "Acme Corp").await;
    let before = harness.state(U1).await;

    let replies = harness.text(U1, "   ").await;
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[1], "Address?");
    assert_eq!(harness.state(U1).await, before);
  }

  #[tokio::test]
  async fn failed_write_waits_for_retry() {
    let harness = Harness::new(FakeWriter::failing(1));
    harness.send(U1, Input::Start).await;
    for value in ["Acme Corp", "San José", "+506..."] {
      harness.text(U1, value).await;
    }
    assert!(matches!(harness.state(U1).await, Some(ConversationState::PendingWrite(_))));
    assert_eq!(harness.notifications(), 0);

    let reminder = harness.text(U1, "anything").await;
    assert!(reminder[0].contains("/retry"));

    let saved = harness.send(U1, Input::Retry).await;
    assert!(saved[0].contains("saved to Notion"));
    assert_eq!(harness.writer.calls(), 2);
    assert_eq!(harness.notifications(), 2);
    assert_eq!(harness.state(U1).await, None);
  }

  #[tokio::test]
  async fn cancelled_pending_write_is_never_sent() {
    let harness = Harness::new(FakeWriter::failing(1));
    harness.send(U1, Input::Start).await;
    for value in ["Acme Corp", "San José", "+506..."] {
      harness.text(U1, value).await;
    }
    assert_eq!(harness.writer.calls(), 1);

    let cancelled = harness.send(U1, Input::Cancel).await;
    assert!(cancelled[0].contains("cancelled"));
    assert_eq!(harness.state(U1).await, None);

    let retry = harness.send(U1, Input::Retry).await;
    assert!(retry[0].starts_with("Nothing to retry"));
    harness.text(U1, "hello").await;
    assert_eq!(harness.cursor(U1).await, 0);
    assert_eq!(harness.writer.calls(), 1);
    assert_eq!(harness.notifications(), 0);
  }

  #[tokio::test]
  async fn failed_write_is_queued_when_outbox_exists() {
    let mut harness = Harness::new(FakeWriter::failing(1));
    let outbox = Arc::new(MemOutbox::default());
    harness.ctx = harness.ctx.clone().with_outbox(outbox.clone());

    harness.send(U1, Input::Start).await;
    for value in ["Acme Corp", "San José", "+506..."] {
      harness.text(U1, value).await;
    }
    let rows = outbox.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.get("name"), Some("Acme Corp"));
    assert_eq!(harness.state(U1).await, None);
    assert_eq!(harness.notifications(), 0);
  }

  #[tokio::test]
  async fn expired_session_starts_over() {
    let mut harness = Harness::new(FakeWriter::default());
    harness.ctx = harness.ctx.clone().with_session_idle(Some(Duration::minutes(10)));
    let mut stale = Session::new(Utc::now() - Duration::minutes(30));
    stale.values.push("Old Corp".to_string());
    harness
      .dialogue(U1)
      .update(ConversationState::Collecting(stale))
      .await
      .expect("storage");

    let replies = harness.text(U1, "New Corp").await;
    assert!(replies[0].contains("expired"));
    assert_eq!(harness.cursor(U1).await, 0);
  }

  #[tokio::test]
  async fn users_sharing_a_chat_keep_separate_sessions() {
    let harness = Harness::new(FakeWriter::default());
    harness.send(U1, Input::Start).await;
    harness.send(U2, Input::Start).await;

    harness.text(U1, "Acme Corp").await;
    assert_eq!(harness.text(U2, "Beta Ltd").await, vec!["Address?".to_string()]);
    assert_eq!(harness.cursor(U1).await, 1);
    assert_eq!(harness.cursor(U2).await, 1);

    assert_eq!(harness.send(U2, Input::Cancel).await.len(), 1);
    assert_eq!(harness.cursor(U1).await, 1);
    assert_eq!(harness.state(U2).await, None);
  }

  #[tokio::test]
  async fn others_cannot_cancel_or_retry_a_pending_write() {
    let harness = Harness::new(FakeWriter::failing(1));
    harness.send(U1, Input::Start).await;
    for value in ["Acme Corp", "San José", "+506..."] {
      harness.text(U1, value).await;
    }

    let cancel = harness.send(U2, Input::Cancel).await;
    assert!(cancel[0].starts_with("Nothing to cancel"));
    let retry = harness.send(U2, Input::Retry).await;
    assert!(retry[0].starts_with("Nothing to retry"));
    assert!(matches!(harness.state(U1).await, Some(ConversationState::PendingWrite(_))));
    assert_eq!(harness.writer.calls(), 1);
  }

  #[tokio::test]
  async fn edit_saves_changed_fields_and_notifies_the_difference() {
    let writer = FakeWriter::default().with_pages(vec![page(
      "page-7",
      &[("name", "Acme Corp"), ("address", "Old St"), ("contact", "+506...")],
    )]);
    let harness = Harness::new(writer);

    let opening = harness.replies(U1, Input::Edit(" Acme Corp ".to_string())).await;
    assert!(opening[0].text.contains("address: Old St"));
    let menu = opening[1].choices.clone().expect("field menu");
    assert_eq!(menu, vec!["name", "address", "contact", "Save", "Cancel"]);

    let prompt = harness.text(U1, "Address").await;
    assert_eq!(prompt, vec!["Current value: Old St".to_string(), "Address?".to_string()]);
    let card = harness.text(U1, "New St").await;
    assert!(card[0].contains("address: New St"));
    assert!(card[1].contains("1 unsaved change"));

    let saved = harness.text(U1, "Save").await;
    assert!(saved[0].contains("was updated in Notion"));

    let updates = harness.writer.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "page-7");
    assert_eq!(updates[0].1.len(), 1);
    assert_eq!(updates[0].1[0].value, "New St");
    assert_eq!(harness.writer.calls(), 0);
    for chat in NOTIFY_LIST {
      let messages = harness.sender.messages_to(chat);
      assert_eq!(messages.len(), 1);
      assert!(messages[0].contains("address: Old St → New St"));
      assert!(!messages[0].contains("contact"));
    }
    assert_eq!(harness.state(U1).await, None);
  }

  #[tokio::test]
  async fn edit_asks_which_namesake_to_open() {
    let form = Form::organization().expect("organization form");
    let writer = FakeWriter::default().with_pages(vec![
      page("page-1", &[("Name", "Soda Tica"), ("Type", "Places to eat"), ("Location", "Nosara")]),
      page("page-2", &[("Name", "Soda Tica"), ("Type", "Places to eat"), ("Location", "Samara")]),
      page("page-3", &[("Name", "Other"), ("Location", "Nosara")]),
    ]);
    let harness = Harness::with_form(writer, form);

    let pick = harness.replies(U1, Input::Edit("Soda Tica".to_string())).await;
    assert_eq!(
      pick[0].choices,
      Some(vec![
        "1. Soda Tica (Places to eat, Nosara)".to_string(),
        "2. Soda Tica (Places to eat, Samara)".to_string()
      ])
    );

    let again = harness.text(U1, "7").await;
    assert!(again[0].contains("pick one"));
    assert!(matches!(harness.state(U1).await, Some(ConversationState::Choosing(_))));

    harness.text(U1, "2. Soda Tica (Places to eat, Samara)").await;
    let Some(ConversationState::Editing(edit)) = harness.state(U1).await else {
      panic!("expected editing state");
    };
    assert_eq!(edit.page_id, "page-2");
    assert_eq!(edit.entries[2].value, "Samara");
  }

  #[tokio::test]
  async fn edit_of_unknown_name_points_to_start() {
    let harness = Harness::new(FakeWriter::default());
    let replies = harness.send(U1, Input::Edit("Nobody".to_string())).await;
    assert!(replies[0].contains("No organization named \"Nobody\""));
    assert_eq!(harness.state(U1).await.unwrap_or_default(), ConversationState::Idle);

    let usage = harness.send(U1, Input::Edit("  ".to_string())).await;
    assert!(usage[0].starts_with("Send /edit"));
  }

  #[tokio::test]
  async fn edited_values_are_validated() {
    let form = Form::organization().expect("organization form");
    let writer = FakeWriter::default().with_pages(vec![page("page-1", &[("Name", "Acme Corp")])]);
    let harness = Harness::with_form(writer, form);
    harness.send(U1, Input::Edit("Acme Corp".to_string())).await;
    harness.text(U1, "Google Map").await;
    let before = harness.state(U1).await;

    let rejected = harness.text(U1, "not a link").await;
    assert!(rejected[0].contains("Invalid link"));
    assert_eq!(harness.state(U1).await, before);

    harness.text(U1, "https://maps.app.goo.gl/AbC123").await;
    let Some(ConversationState::Editing(edit)) = harness.state(U1).await else {
      panic!("expected editing state");
    };
    assert_eq!(edit.changed_entries()[0].value, "https://maps.app.goo.gl/AbC123");
  }

  #[tokio::test]
  async fn failed_update_keeps_the_edit_for_retry() {
    let writer = FakeWriter::failing(1).with_pages(vec![page("page-1", &[("name", "Acme Corp")])]);
    let harness = Harness::new(writer);
    harness.send(U1, Input::Edit("Acme Corp".to_string())).await;
    harness.text(U1, "contact").await;
    harness.text(U1, "+50688881234").await;

    let failed = harness.text(U1, "save").await;
    assert!(failed[0].contains("Could not update Notion"));
    assert!(matches!(harness.state(U1).await, Some(ConversationState::Editing(_))));
    assert_eq!(harness.notifications(), 0);

    let saved = harness.send(U1, Input::Retry).await;
    assert!(saved[0].contains("was updated"));
    assert_eq!(harness.writer.updates().len(), 2);
    assert_eq!(harness.notifications(), 2);
  }

  #[tokio::test]
  async fn saving_without_changes_skips_notion() {
    let writer = FakeWriter::default().with_pages(vec![page("page-1", &[("name", "Acme Corp")])]);
    let harness = Harness::new(writer);
    harness.send(U1, Input::Edit("Acme Corp".to_string())).await;

    let replies = harness.text(U1, "Save").await;
    assert!(replies[0].starts_with("Nothing changed"));
    assert!(harness.writer.updates().is_empty());
    assert_eq!(harness.notifications(), 0);
    assert_eq!(harness.state(U1).await, None);
  }

  #[tokio::test]
  async fn edit_waits_while_a_form_is_open() {
    let harness = Harness::new(FakeWriter::default());
    harness.send(U1, Input::Start).await;
    harness.text(U1, "Acme Corp").await;

    let busy = harness.send(U1, Input::Edit("Acme Corp".to_string())).await;
    assert!(busy[0].starts_with("Finish the current form"));
    assert_eq!(busy[1], "Address?");
    assert_eq!(harness.cursor(U1).await, 1);
  }
}

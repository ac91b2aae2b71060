use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Longest value shown in a chat message; Notion keeps the full text.
pub const PREVIEW_CHARS: usize = 200;
/// Telegram rejects messages over 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

/// How a value is stored in the Notion database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
  Title,
  RichText,
  Url,
  Select,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldEntry {
  pub name: String,
  pub value: String,
  pub property: PropertyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submitter {
  pub user_id: i64,
  pub label: String,
}

/// An organization with every required field filled in, in form order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedRecord {
  pub submitter: Submitter,
  pub entries: Vec<FieldEntry>,
}

impl CompletedRecord {
  #[cfg(test)]
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|entry| entry.name == name)
      .map(|entry| entry.value.as_str())
  }

  pub fn pairs(&self) -> Vec<(&str, &str)> {
    self
      .entries
      .iter()
      .map(|entry| (entry.name.as_str(), entry.value.as_str()))
      .collect()
  }

  /// Best-effort display name used in logs and messages.
  pub fn title(&self) -> &str {
    title_of(&self.entries)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPage {
  pub id: String,
  pub url: Option<String>,
}

/// A row already in the Notion database, with its properties as plain text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FoundPage {
  pub id: String,
  pub url: Option<String>,
  pub properties: BTreeMap<String, String>,
}

impl FoundPage {
  pub fn value(&self, name: &str) -> &str {
    self.properties.get(name).map(String::as_str).unwrap_or("")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
  pub name: String,
  pub old: String,
  pub new: String,
}

/// A record parked in the outbox after a failed Notion write.
#[derive(Debug, Clone)]
pub struct PendingRecord {
  pub id: i64,
  pub record: CompletedRecord,
  pub attempts: i32,
}

pub fn title_of(entries: &[FieldEntry]) -> &str {
  entries
    .iter()
    .find(|entry| entry.property == PropertyKind::Title)
    .or_else(|| entries.first())
    .map(|entry| entry.value.as_str())
    .unwrap_or("-")
}

pub fn completion_message(record: &CompletedRecord, page: &CreatedPage) -> String {
  let mut text = format!("✅ New organization saved by {}\n", record.submitter.label);
  for (name, value) in record.pairs() {
    text.push_str(&format!("\n{name}: {}", preview(value)));
  }
  if let Some(url) = &page.url {
    text.push_str(&format!("\n\n🔗 {url}"));
  }
  fit_message(text)
}

/// Old-versus-new summary sent to the notify-list after an edit.
pub fn change_message(editor: &Submitter, title: &str, changes: &[FieldChange], url: Option<&str>) -> String {
  let mut text = format!("✏️ {} updated by {}\n", preview(title), editor.label);
  for change in changes {
    let old = if change.old.is_empty() { "(empty)" } else { change.old.as_str() };
    text.push_str(&format!("\n{}: {} → {}", change.name, preview(old), preview(&change.new)));
  }
  if let Some(url) = url {
    text.push_str(&format!("\n\n🔗 {url}"));
  }
  fit_message(text)
}

/// One card line per field, as shown to the person editing it.
pub fn card_message(entries: &[FieldEntry]) -> String {
  let lines: Vec<String> = entries
    .iter()
    .map(|entry| {
      let value = if entry.value.is_empty() { "-" } else { entry.value.as_str() };
      format!("{}: {}", entry.name, preview(value))
    })
    .collect();
  fit_message(lines.join("\n"))
}

pub fn preview(value: &str) -> String {
  if value.chars().count() <= PREVIEW_CHARS {
    return value.to_string();
  }
  let mut short: String = value.chars().take(PREVIEW_CHARS - 1).collect();
  short.push('…');
  short
}

fn fit_message(text: String) -> String {
  if text.chars().count() <= MAX_MESSAGE_CHARS {
    return text;
  }
  let mut trimmed: String = text.chars().take(MAX_MESSAGE_CHARS - 20).collect();
  trimmed.push_str("\n... (truncated)");
  trimmed
}

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::form::Form;
use crate::models::CompletedRecord;
use crate::models::FieldChange;
use crate::models::FieldEntry;
use crate::models::FoundPage;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum ConversationState {
  #[default]
  Idle,
  Collecting(Session),
  /// The Notion write failed and the record waits for /retry or /cancel.
  PendingWrite(CompletedRecord),
  /// Several rows share the looked-up name.
  Choosing(Vec<FoundPage>),
  Editing(EditSession),
}

/// An in-progress organization draft. `values[i]` answers form field `i`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
  pub values: Vec<String>,
  pub touched_at: DateTime<Utc>,
}

impl Session {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      values: Vec::new(),
      touched_at: now,
    }
  }

  /// Index of the next field the session expects.
  pub fn cursor(&self) -> usize {
    self.values.len()
  }

  pub fn is_expired(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
    idle_too_long(self.touched_at, now, ttl)
  }
}

/// Changes to an existing Notion row, kept until the user saves or cancels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditSession {
  pub page_id: String,
  pub url: Option<String>,
  pub original: Vec<FieldEntry>,
  pub entries: Vec<FieldEntry>,
  /// Form index of the field waiting for a new value.
  pub selected: Option<usize>,
  pub touched_at: DateTime<Utc>,
}

impl EditSession {
  /// Lays the page out in form order; columns the page lacks start empty.
  pub fn new(form: &Form, page: &FoundPage, now: DateTime<Utc>) -> Self {
    let entries: Vec<FieldEntry> = form
      .fields()
      .iter()
      .map(|field| FieldEntry {
        name: field.name.clone(),
        value: page.value(&field.name).to_string(),
        property: field.property,
      })
      .collect();
    Self {
      page_id: page.id.clone(),
      url: page.url.clone(),
      original: entries.clone(),
      entries,
      selected: None,
      touched_at: now,
    }
  }

  pub fn changes(&self) -> Vec<FieldChange> {
    self
      .original
      .iter()
      .zip(&self.entries)
      .filter(|(old, new)| old.value != new.value)
      .map(|(old, new)| FieldChange {
        name: new.name.clone(),
        old: old.value.clone(),
        new: new.value.clone(),
      })
      .collect()
  }

  pub fn changed_entries(&self) -> Vec<FieldEntry> {
    self
      .original
      .iter()
      .zip(&self.entries)
      .filter(|(old, new)| old.value != new.value)
      .map(|(_, new)| new.clone())
      .collect()
  }

  pub fn is_expired(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
    idle_too_long(self.touched_at, now, ttl)
  }
}

fn idle_too_long(touched_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
  ttl.is_some_and(|ttl| now - touched_at > ttl)
}

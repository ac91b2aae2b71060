use std::sync::Arc;

use chrono::Duration;

use crate::db::Outbox;
use crate::form::Form;
use crate::guard::AccessGuard;
use crate::notifier::Notifier;
use crate::notion::RecordWriter;

#[derive(Clone)]
pub struct AppContext {
  guard: AccessGuard,
  form: Form,
  writer: Arc<dyn RecordWriter>,
  notifier: Notifier,
  outbox: Option<Arc<dyn Outbox>>,
  session_idle: Option<Duration>,
}

impl AppContext {
  pub fn new(guard: AccessGuard, form: Form, writer: Arc<dyn RecordWriter>, notifier: Notifier) -> Self {
    Self {
      guard,
      form,
      writer,
      notifier,
      outbox: None,
      session_idle: None,
    }
  }

  pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
    self.outbox = Some(outbox);
    self
  }

  pub fn with_session_idle(mut self, idle: Option<Duration>) -> Self {
    self.session_idle = idle;
    self
  }

  pub fn guard(&self) -> &AccessGuard {
    &self.guard
  }

  pub fn form(&self) -> &Form {
    &self.form
  }

  pub fn writer(&self) -> &dyn RecordWriter {
    self.writer.as_ref()
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  pub fn outbox(&self) -> Option<&dyn Outbox> {
    self.outbox.as_deref()
  }

  pub fn session_idle(&self) -> Option<Duration> {
    self.session_idle
  }
}

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use teloxide::RequestError;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::info;
use tracing::warn;

#[async_trait]
pub trait MessageSender: Send + Sync {
  async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RequestError>;
}

#[async_trait]
impl MessageSender for Bot {
  async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RequestError> {
    self.send_message(ChatId(chat_id), text.to_string()).await?;
    Ok(())
  }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
  pub delivered: Vec<i64>,
  pub failed: Vec<(i64, String)>,
}

/// Best-effort fan-out of completion messages to the notify-list.
#[derive(Clone)]
pub struct Notifier {
  sender: Arc<dyn MessageSender>,
  recipients: Vec<i64>,
}

impl Notifier {
  pub fn new(sender: Arc<dyn MessageSender>, recipients: Vec<i64>) -> Self {
    Self { sender, recipients }
  }

  pub fn sender(&self) -> &dyn MessageSender {
    self.sender.as_ref()
  }

  pub async fn notify_all(&self, message: &str) -> NotifyReport {
    let deliveries = self.recipients.iter().map(|&user_id| async move {
      let result = self.sender.send_text(user_id, message).await;
      (user_id, result)
    });

    let mut report = NotifyReport::default();
    for (user_id, result) in join_all(deliveries).await {
      match result {
        Ok(()) => report.delivered.push(user_id),
        Err(err) => {
          warn!(error = %err, target_user_id = user_id, "failed to deliver notification");
          report.failed.push((user_id, err.to_string()));
        },
      }
    }
    info!(
      delivered = report.delivered.len(),
      failed = report.failed.len(),
      "notification fan-out finished"
    );
    report
  }
}

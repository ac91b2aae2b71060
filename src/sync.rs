use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::bot::AppContext;
use crate::db::Outbox;
use crate::models::PendingRecord;
use crate::models::completion_message;

const SYNC_BATCH: i64 = 20;
/// A record still failing after this many writes is parked.
const MAX_SYNC_ATTEMPTS: i32 = 12;
const BASE_RETRY_SECS: i64 = 30;
const MAX_RETRY_SECS: i64 = 60 * 60;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
  pub parked: usize,
}

/// Replays queued records forever, one batch per tick.
pub async fn run(ctx: Arc<AppContext>, period: Duration) {
  let Some(outbox) = ctx.outbox() else {
    return;
  };
  info!(period_secs = period.as_secs(), "outbox sync started");
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
  loop {
    ticker.tick().await;
    match sync_pending(&ctx, outbox).await {
      Ok(report) if report == SyncReport::default() => debug!("no pending records to sync"),
      Ok(report) => info!(
        synced = report.synced,
        failed = report.failed,
        parked = report.parked,
        "outbox sync pass finished"
      ),
      Err(err) => warn!(error = %err, "outbox sync pass failed"),
    }
  }
}

pub async fn sync_pending(ctx: &AppContext, outbox: &dyn Outbox) -> Result<SyncReport> {
  let mut report = SyncReport::default();
  for pending in outbox.due(SYNC_BATCH).await? {
    match ctx.writer().create_record(&pending.record).await {
      Ok(page) => {
        if let Err(err) = outbox.mark_synced(pending.id).await {
          error!(error = %err, pending_id = pending.id, page_id = %page.id, "failed to mark record synced");
        }
        report.synced += 1;
        info!(pending_id = pending.id, page_id = %page.id, "synced queued record");
        announce(ctx, &pending, &completion_message(&pending.record, &page)).await;
      },
      Err(err) if err.is_permanent() || pending.attempts + 1 >= MAX_SYNC_ATTEMPTS => {
        error!(error = %err, pending_id = pending.id, attempts = pending.attempts + 1, "parking queued record");
        outbox.park(pending.id, &err.to_string()).await?;
        report.parked += 1;
        let notice = format!(
          "⚠️ Queued organization #{} \"{}\" could not be saved to Notion and was set aside: {err}",
          pending.id,
          pending.record.title()
        );
        confirm(ctx, &pending, &notice).await;
      },
      Err(err) => {
        let retry_at = Utc::now() + retry_delay(pending.attempts);
        warn!(
          error = %err,
          pending_id = pending.id,
          attempts = pending.attempts + 1,
          %retry_at,
          "queued record still failing"
        );
        outbox.mark_failed(pending.id, &err.to_string(), retry_at).await?;
        report.failed += 1;
      },
    }
  }
  Ok(report)
}

/// Doubles from 30 s up to an hour.
fn retry_delay(attempts: i32) -> chrono::Duration {
  let exponent = attempts.clamp(0, 16) as u32;
  let secs = BASE_RETRY_SECS.saturating_mul(1_i64 << exponent).min(MAX_RETRY_SECS);
  chrono::Duration::seconds(secs)
}

async fn announce(ctx: &AppContext, pending: &PendingRecord, message: &str) {
  ctx.notifier().notify_all(message).await;
  let confirmation = format!(
    "✅ Queued organization #{} \"{}\" is now saved to Notion.",
    pending.id,
    pending.record.title()
  );
  confirm(ctx, pending, &confirmation).await;
}

async fn confirm(ctx: &AppContext, pending: &PendingRecord, text: &str) {
  let user_id = pending.record.submitter.user_id;
  if let Err(err) = ctx.notifier().sender().send_text(user_id, text).await {
    warn!(error = %err, user_id, "failed to tell submitter about queued record");
  }
}

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;

use crate::notion::DEFAULT_API_URL;

const DEFAULT_OUTBOX_SYNC_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
  pub bot_token: String,
  pub allowed_users: Vec<i64>,
  pub notify_users: Vec<i64>,
  pub notion_token: String,
  pub notion_database_id: String,
  pub notion_api_url: String,
  pub database_url: Option<String>,
  pub outbox_sync_period: Duration,
  pub session_idle: Option<chrono::Duration>,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let bot_token = env::var("BOT_TOKEN")
      .or_else(|_| env::var("TELOXIDE_TOKEN"))
      .context("BOT_TOKEN or TELOXIDE_TOKEN must be set")?;
    let notion_token = env::var("NOTION_TOKEN").context("NOTION_TOKEN must be set")?;
    let notion_database_id = env::var("NOTION_DATABASE_ID").context("NOTION_DATABASE_ID must be set")?;
    let notion_api_url = env::var("NOTION_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());

    let outbox_sync_secs = optional_number("OUTBOX_SYNC_SECS")?.unwrap_or(DEFAULT_OUTBOX_SYNC_SECS);
    let session_idle = idle_duration(optional_number("SESSION_IDLE_MINUTES")?)?;

    Ok(Self {
      bot_token,
      allowed_users: parse_ids("ALLOWED_IDS", &env::var("ALLOWED_IDS").unwrap_or_default()),
      notify_users: parse_ids("NOTIFY_IDS", &env::var("NOTIFY_IDS").unwrap_or_default()),
      notion_token,
      notion_database_id,
      notion_api_url,
      database_url,
      outbox_sync_period: Duration::from_secs(outbox_sync_secs.max(1)),
      session_idle,
    })
  }
}

fn optional_number(key: &str) -> Result<Option<u64>> {
  match env::var(key) {
    Ok(raw) if !raw.trim().is_empty() => {
      let value = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{key} must be a positive integer"))?;
      Ok(Some(value))
    },
    _ => Ok(None),
  }
}

/// Zero or unset disables idle expiry.
fn idle_duration(minutes: Option<u64>) -> Result<Option<chrono::Duration>> {
  let Some(minutes) = minutes.filter(|minutes| *minutes > 0) else {
    return Ok(None);
  };
  let duration = i64::try_from(minutes)
    .ok()
    .and_then(chrono::Duration::try_minutes)
    .with_context(|| format!("SESSION_IDLE_MINUTES={minutes} is too large"))?;
  Ok(Some(duration))
}

fn parse_ids(key: &str, raw: &str) -> Vec<i64> {
  let mut ids: Vec<i64> = raw
    .split(',')
    .filter_map(|id| {
      let trimmed = id.trim();
      if trimmed.is_empty() {
        return None;
      }
      match trimmed.parse::<i64>() {
        Ok(value) => Some(value),
        Err(err) => {
          tracing::warn!(key, value = trimmed, error = %err, "invalid user id entry");
          None
        },
      }
    })
    .collect();
  let mut seen = HashSet::new();
  ids.retain(|id| seen.insert(*id));
  ids
}

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::models::CompletedRecord;
use crate::models::CreatedPage;
use crate::models::FieldEntry;
use crate::models::FoundPage;
use crate::models::PropertyKind;

pub const DEFAULT_API_URL: &str = "https://api.notion.com";
const NOTION_VERSION: &str = "2022-06-28";

#[derive(Debug, Error)]
pub enum WriteError {
  #[error("notion request failed: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("notion returned {status} ({code}): {message}")]
  Api {
    status: u16,
    code: String,
    message: String,
  },
  #[error("unexpected notion response: {0}")]
  Malformed(String),
}

impl WriteError {
  /// Notion refused the request itself; sending it again cannot succeed.
  pub fn is_permanent(&self) -> bool {
    match self {
      Self::Api { status, .. } => (400 .. 500).contains(status) && !matches!(status, 408 | 409 | 429),
      _ => false,
    }
  }
}

/// Reads and writes organization rows in the external database.
#[async_trait]
pub trait RecordWriter: Send + Sync {
  async fn create_record(&self, record: &CompletedRecord) -> Result<CreatedPage, WriteError>;

  /// Rows whose `property` (the title column) equals `title`.
  async fn find_records(&self, property: &str, title: &str) -> Result<Vec<FoundPage>, WriteError>;

  /// Overwrites the given properties of an existing row.
  async fn update_record(&self, page_id: &str, entries: &[FieldEntry]) -> Result<CreatedPage, WriteError>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
  code: Option<String>,
  message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
  id: String,
  url: Option<String>,
  #[serde(default)]
  properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
  results: Vec<PageBody>,
}

#[derive(Clone)]
pub struct NotionClient {
  http: reqwest::Client,
  api_url: String,
  token: String,
  database_id: String,
}

impl NotionClient {
  pub fn new(api_url: &str, token: String, database_id: String) -> Result<Self, WriteError> {
    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(20))
      .user_agent(concat!("org-intake-bot/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self {
      http,
      api_url: api_url.trim_end_matches('/').to_string(),
      token,
      database_id,
    })
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, WriteError> {
    let response = request
      .bearer_auth(&self.token)
      .header("Notion-Version", NOTION_VERSION)
      .send()
      .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
      return Err(api_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| WriteError::Malformed(err.to_string()))
  }
}

#[async_trait]
impl RecordWriter for NotionClient {
  #[instrument(skip(self, record), fields(title = record.title()))]
  async fn create_record(&self, record: &CompletedRecord) -> Result<CreatedPage, WriteError> {
    let request = self
      .http
      .post(format!("{}/v1/pages", self.api_url))
      .json(&page_payload(&self.database_id, record));
    let page: PageBody = self.send(request).await?;
    info!(page_id = %page.id, "created notion page");
    Ok(CreatedPage {
      id: page.id,
      url: page.url,
    })
  }

  #[instrument(skip(self))]
  async fn find_records(&self, property: &str, title: &str) -> Result<Vec<FoundPage>, WriteError> {
    let request = self
      .http
      .post(format!("{}/v1/databases/{}/query", self.api_url, self.database_id))
      .json(&title_query(property, title));
    let body: QueryBody = self.send(request).await?;
    debug!(matches = body.results.len(), "queried notion database");
    Ok(body.results.into_iter().map(found_page).collect())
  }

  #[instrument(skip(self, entries), fields(changed = entries.len()))]
  async fn update_record(&self, page_id: &str, entries: &[FieldEntry]) -> Result<CreatedPage, WriteError> {
    let request = self
      .http
      .patch(format!("{}/v1/pages/{page_id}", self.api_url))
      .json(&json!({ "properties": properties(entries) }));
    let page: PageBody = self.send(request).await?;
    info!(page_id = %page.id, "updated notion page");
    Ok(CreatedPage {
      id: page.id,
      url: page.url,
    })
  }
}

fn page_payload(database_id: &str, record: &CompletedRecord) -> Value {
  json!({
    "parent": { "database_id": database_id },
    "properties": properties(&record.entries),
  })
}

fn properties(entries: &[FieldEntry]) -> Map<String, Value> {
  entries
    .iter()
    .map(|entry| (entry.name.clone(), property_value(entry.property, &entry.value)))
    .collect()
}

fn property_value(kind: PropertyKind, value: &str) -> Value {
  let text = json!([{ "type": "text", "text": { "content": value } }]);
  match kind {
    PropertyKind::Title => json!({ "title": text }),
    PropertyKind::RichText => json!({ "rich_text": text }),
    PropertyKind::Url => json!({ "url": value }),
    // notion rejects commas in select option names
    PropertyKind::Select => json!({ "select": { "name": value.replace(',', " ") } }),
  }
}

fn title_query(property: &str, title: &str) -> Value {
  json!({
    "filter": { "property": property, "title": { "equals": title } },
    "page_size": 10,
  })
}

fn found_page(page: PageBody) -> FoundPage {
  let properties = page
    .properties
    .iter()
    .filter_map(|(name, property)| plain_value(property).map(|value| (name.clone(), value)))
    .collect();
  FoundPage {
    id: page.id,
    url: page.url,
    properties,
  }
}

/// Flattens the property types the form writes; anything else is skipped.
fn plain_value(property: &Value) -> Option<String> {
  let kind = property.get("type")?.as_str()?;
  match kind {
    "title" | "rich_text" => Some(
      property
        .get(kind)?
        .as_array()?
        .iter()
        .filter_map(|part| part.get("plain_text").and_then(Value::as_str))
        .collect(),
    ),
    "url" => Some(property.get("url").and_then(Value::as_str).unwrap_or_default().to_string()),
    "select" => Some(
      property
        .get("select")
        .and_then(|select| select.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    ),
    _ => None,
  }
}

fn api_error(status: u16, body: &str) -> WriteError {
  match serde_json::from_str::<ApiErrorBody>(body) {
    Ok(parsed) => WriteError::Api {
      status,
      code: parsed.code.unwrap_or_else(|| "unknown".to_string()),
      message: parsed.message.unwrap_or_default(),
    },
    Err(_) => WriteError::Api {
      status,
      code: "unknown".to_string(),
      message: body.chars().take(200).collect(),
    },
  }
}

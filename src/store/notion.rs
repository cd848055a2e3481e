//! Notion-shaped store backend.
//!
//! Speaks the database/pages/blocks HTTP API: property JSON in both
//! directions, cursor pagination, and 429 recognition with the
//! Retry-After hint surfaced to the resilience layer. Only properties
//! present on a draft are written, so partial records stay partial.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{
    Category, EntryKind, Priority, Provenance, TITLE_MAX, TaskDraft, TaskRecord, TaskStatus,
};
use crate::store::backend::{SortDir, SortKey, StoreBackend, TaskFilter, TaskQuery, TaskSort};

const API_VERSION: &str = "2022-06-28";
/// Safety-net client timeout; real deadlines are imposed per operation
/// by the resilience layer.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// Flattened page bodies are capped here; presentation truncates further.
const BODY_MAX: usize = 4000;

const P_TITLE: &str = "Name";
const P_STATUS: &str = "Status";
const P_KIND: &str = "Kind";
const P_IMPORTANCE: &str = "Importance";
const P_URGENCY: &str = "Urgency";
const P_CATEGORY: &str = "Category";
const P_TAGS: &str = "Tags";
const P_TARGET_DATE: &str = "Target Date";
const P_LINK: &str = "Link";
const P_SOURCE: &str = "Source";

pub struct NotionBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    database_id: String,
}

impl NotionBackend {
    pub fn new(config: &StoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        NotionBackend {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            database_id: config.database_id.clone(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, StoreError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(self.api_key.expose_secret())
            .header("Notion-Version", API_VERSION);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout(HTTP_TIMEOUT)
            } else {
                StoreError::Unavailable {
                    reason: format!("transport error: {e}"),
                }
            }
        })?;

        let status = response.status();
        tracing::debug!(%status, %url, "store response");

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64);
            return Err(StoreError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(StoreError::AuthFailed);
        }

        let text = response.text().await.map_err(|e| StoreError::InvalidResponse {
            reason: format!("body read failed: {e}"),
        })?;

        if status.is_client_error() {
            let reason = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| text.chars().take(200).collect());
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable {
                reason: format!("status {status}"),
            });
        }

        serde_json::from_str(&text).map_err(|e| StoreError::InvalidResponse {
            reason: format!("json parse failed: {e}"),
        })
    }
}

#[async_trait]
impl StoreBackend for NotionBackend {
    async fn create_task(
        &self,
        draft: &TaskDraft,
        provenance: Provenance,
    ) -> Result<TaskRecord, StoreError> {
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": build_properties(draft, provenance),
        });
        let page = self.request(Method::POST, "/v1/pages", Some(&body)).await?;
        parse_page(&page)
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let body = json!({
            "properties": {
                P_STATUS: { "select": { "name": status.as_str() } },
            },
        });
        let path = format!("/v1/pages/{id}");
        match self.request(Method::PATCH, &path, Some(&body)).await {
            Ok(_) => Ok(()),
            Err(StoreError::Rejected { status: 404, .. }) => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_task(&self, id: &str) -> Result<TaskRecord, StoreError> {
        let path = format!("/v1/pages/{id}");
        match self.request(Method::GET, &path, None).await {
            Ok(page) => parse_page(&page),
            Err(StoreError::Rejected { status: 404, .. }) => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_body(&self, id: &str) -> Result<String, StoreError> {
        let mut lines: Vec<String> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut total = 0usize;
        loop {
            let mut path = format!("/v1/blocks/{id}/children?page_size=100");
            if let Some(c) = &cursor {
                path.push_str(&format!("&start_cursor={c}"));
            }
            let page = match self.request(Method::GET, &path, None).await {
                Ok(page) => page,
                Err(StoreError::Rejected { status: 404, .. }) => {
                    return Err(StoreError::NotFound { id: id.to_string() });
                }
                Err(e) => return Err(e),
            };
            for block in page["results"].as_array().into_iter().flatten() {
                if let Some(text) = block_text(block) {
                    total += text.len();
                    lines.push(text);
                }
            }
            if total >= BODY_MAX || !page["has_more"].as_bool().unwrap_or(false) {
                break;
            }
            cursor = page["next_cursor"].as_str().map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        let mut body = lines.join("\n");
        if body.len() > BODY_MAX {
            body = body.chars().take(BODY_MAX).collect();
        }
        Ok(body)
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let path = format!("/v1/databases/{}/query", self.database_id);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = serde_json::Map::new();
            if let Some(filter) = &query.filter {
                body.insert("filter".to_string(), serialize_filter(filter));
            }
            if !query.sorts.is_empty() {
                body.insert(
                    "sorts".to_string(),
                    Value::Array(query.sorts.iter().map(serialize_sort).collect()),
                );
            }
            body.insert("page_size".to_string(), json!(query.page_size));
            if let Some(c) = &cursor {
                body.insert("start_cursor".to_string(), json!(c));
            }

            let page = self
                .request(Method::POST, &path, Some(&Value::Object(body)))
                .await?;
            for result in page["results"].as_array().into_iter().flatten() {
                records.push(parse_page(result)?);
                if let Some(limit) = query.limit {
                    if records.len() >= limit {
                        return Ok(records);
                    }
                }
            }
            if !page["has_more"].as_bool().unwrap_or(false) {
                break;
            }
            cursor = page["next_cursor"].as_str().map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(records)
    }
}

fn build_properties(draft: &TaskDraft, provenance: Provenance) -> Value {
    let title: String = draft.title.chars().take(TITLE_MAX).collect();
    let mut props = serde_json::Map::new();
    props.insert(
        P_TITLE.to_string(),
        json!({ "title": [ { "text": { "content": title } } ] }),
    );
    if let Some(status) = draft.status {
        props.insert(P_STATUS.to_string(), select(status.as_str()));
    }
    if let Some(kind) = draft.kind {
        props.insert(P_KIND.to_string(), select(kind.as_str()));
    }
    if let Some(importance) = draft.importance {
        props.insert(P_IMPORTANCE.to_string(), select(importance.as_str()));
    }
    if let Some(urgency) = draft.urgency {
        props.insert(P_URGENCY.to_string(), select(urgency.as_str()));
    }
    if let Some(category) = draft.category {
        props.insert(P_CATEGORY.to_string(), select(category.as_str()));
    }
    if !draft.tags.is_empty() {
        let tags: Vec<Value> = draft.tags.iter().map(|t| json!({ "name": t })).collect();
        props.insert(P_TAGS.to_string(), json!({ "multi_select": tags }));
    }
    if let Some(date) = draft.target_date {
        props.insert(
            P_TARGET_DATE.to_string(),
            json!({ "date": { "start": date.format("%Y-%m-%d").to_string() } }),
        );
    }
    if let Some(link) = &draft.link {
        props.insert(P_LINK.to_string(), json!({ "url": link }));
    }
    props.insert(P_SOURCE.to_string(), select(provenance.as_str()));
    Value::Object(props)
}

fn select(name: &str) -> Value {
    json!({ "select": { "name": name } })
}

fn serialize_filter(filter: &TaskFilter) -> Value {
    match filter {
        TaskFilter::StatusIs(status) => {
            json!({ "property": P_STATUS, "select": { "equals": status.as_str() } })
        }
        TaskFilter::StatusIsNot(status) => {
            json!({ "property": P_STATUS, "select": { "does_not_equal": status.as_str() } })
        }
        TaskFilter::TargetDateBefore(date) => {
            json!({ "property": P_TARGET_DATE, "date": { "before": ymd(date) } })
        }
        TaskFilter::TargetDateOnOrAfter(date) => {
            json!({ "property": P_TARGET_DATE, "date": { "on_or_after": ymd(date) } })
        }
        TaskFilter::TargetDateOnOrBefore(date) => {
            json!({ "property": P_TARGET_DATE, "date": { "on_or_before": ymd(date) } })
        }
        TaskFilter::TitleContains(term) => {
            json!({ "property": P_TITLE, "title": { "contains": term } })
        }
        TaskFilter::EditedBefore(ts) => {
            json!({ "timestamp": "last_edited_time", "last_edited_time": { "before": ts.to_rfc3339() } })
        }
        TaskFilter::CreatedBefore(ts) => {
            json!({ "timestamp": "created_time", "created_time": { "before": ts.to_rfc3339() } })
        }
        TaskFilter::And(parts) => {
            json!({ "and": parts.iter().map(serialize_filter).collect::<Vec<_>>() })
        }
        TaskFilter::Or(parts) => {
            json!({ "or": parts.iter().map(serialize_filter).collect::<Vec<_>>() })
        }
    }
}

fn serialize_sort(sort: &TaskSort) -> Value {
    let direction = match sort.dir {
        SortDir::Ascending => "ascending",
        SortDir::Descending => "descending",
    };
    match sort.key {
        SortKey::TargetDate => json!({ "property": P_TARGET_DATE, "direction": direction }),
        SortKey::CreatedTime => json!({ "timestamp": "created_time", "direction": direction }),
        SortKey::EditedTime => json!({ "timestamp": "last_edited_time", "direction": direction }),
    }
}

fn ymd(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_page(page: &Value) -> Result<TaskRecord, StoreError> {
    let id = page["id"]
        .as_str()
        .ok_or_else(|| StoreError::InvalidResponse {
            reason: "page without id".to_string(),
        })?
        .to_string();
    let props = &page["properties"];

    Ok(TaskRecord {
        id,
        title: prop_title(props),
        status: prop_select(props, P_STATUS).and_then(|s| TaskStatus::parse(&s)),
        kind: prop_select(props, P_KIND).and_then(|s| EntryKind::parse(&s)),
        importance: prop_select(props, P_IMPORTANCE).and_then(|s| Priority::parse(&s)),
        urgency: prop_select(props, P_URGENCY).and_then(|s| Priority::parse(&s)),
        category: prop_select(props, P_CATEGORY).and_then(|s| Category::parse(&s)),
        tags: prop_multi_select(props, P_TAGS),
        target_date: prop_date(props, P_TARGET_DATE),
        link: props[P_LINK]["url"].as_str().map(str::to_string),
        url: page["url"].as_str().map(str::to_string),
        created_at: parse_ts(page["created_time"].as_str()),
        edited_at: parse_ts(page["last_edited_time"].as_str()),
        provenance: prop_select(props, P_SOURCE).and_then(|s| Provenance::parse(&s)),
    })
}

fn prop_title(props: &Value) -> String {
    props[P_TITLE]["title"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["plain_text"].as_str().or_else(|| p["text"]["content"].as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn prop_select(props: &Value, name: &str) -> Option<String> {
    props[name]["select"]["name"].as_str().map(str::to_string)
}

fn prop_multi_select(props: &Value, name: &str) -> Vec<String> {
    props[name]["multi_select"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn prop_date(props: &Value, name: &str) -> Option<NaiveDate> {
    let start = props[name]["date"]["start"].as_str()?;
    // Date properties may carry a time component; the calendar day is
    // always the first ten characters.
    let day: String = start.chars().take(10).collect();
    NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()
}

fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn block_text(block: &Value) -> Option<String> {
    let kind = block["type"].as_str()?;
    let rich = block[kind]["rich_text"].as_array()?;
    let text: String = rich
        .iter()
        .filter_map(|r| r["plain_text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() { None } else { Some(text) }
}

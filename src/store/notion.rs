use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;
use ulid::Ulid;

use crate::limits::STORE_PAGE_SIZE;
use crate::model::*;

use super::{RecordStore, StatusFilter, StoreError};

/// Database property names for each persisted field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PropertyMap {
    pub title: String,
    pub room: String,
    pub start: String,
    pub end: String,
    pub organizer: String,
    pub attendees: String,
    pub team: String,
    pub status: String,
    pub group_id: String,
    pub recurrence: String,
}

impl Default for PropertyMap {
    fn default() -> Self {
        Self {
            title: "Name".into(),
            room: "Room".into(),
            start: "Start".into(),
            end: "End".into(),
            organizer: "Organizer".into(),
            attendees: "Attendees".into(),
            team: "Team".into(),
            status: "Status".into(),
            group_id: "Group".into(),
            recurrence: "Recurrence".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotionSettings {
    pub base_url: String,
    pub token: SecretString,
    pub database_id: String,
    pub api_version: String,
    pub timeout: Duration,
    pub properties: PropertyMap,
}

/// Reservation records kept as pages of a Notion database.
///
/// Cancelled occurrences keep their page with `Status = Cancelled`; `delete`
/// archives the page.
pub struct NotionStore {
    client: Client,
    settings: NotionSettings,
}

impl NotionStore {
    pub fn new(settings: NotionSettings) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| StoreError::Rejected(format!("http client: {e}")))?;
        Ok(Self { client, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, req: RequestBuilder, record: Option<&RecordId>) -> Result<Value, StoreError> {
        let resp = req
            .bearer_auth(self.settings.token.expose_secret())
            .header("Notion-Version", &self.settings.api_version)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|e| StoreError::Rejected(format!("malformed response: {e}")));
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(%status, body = %body, "notion request failed");
        Err(match (status, record) {
            (StatusCode::NOT_FOUND, Some(id)) => StoreError::NotFound(id.clone()),
            _ => status_error(status, &body),
        })
    }

    async fn query(&self, filter: Value) -> Result<Vec<ReservationOccurrence>, StoreError> {
        let url = self.url(&format!("databases/{}/query", self.settings.database_id));
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({
                "filter": filter,
                "page_size": STORE_PAGE_SIZE,
                "sorts": [{ "property": self.settings.properties.start, "direction": "ascending" }],
            });
            if let Some(c) = &cursor {
                body["start_cursor"] = Value::String(c.clone());
            }
            let page = self.send(self.client.post(&url).json(&body), None).await?;
            let results = page["results"]
                .as_array()
                .ok_or_else(|| StoreError::Rejected("query response has no results".into()))?;
            for result in results {
                out.push(self.parse_page(result)?);
            }
            match (page["has_more"].as_bool(), page["next_cursor"].as_str()) {
                (Some(true), Some(next)) => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(out)
    }

    fn properties(&self, booking: &Booking) -> Value {
        let p = &self.settings.properties;
        let mut props = Map::new();
        props.insert(p.title.clone(), json!({ "title": [text(&booking.title)] }));
        props.insert(p.room.clone(), rich_text(booking.room.as_str()));
        props.insert(p.start.clone(), json!({ "date": { "start": booking.span.start.to_rfc3339() } }));
        props.insert(p.end.clone(), json!({ "date": { "start": booking.span.end.to_rfc3339() } }));
        props.insert(p.organizer.clone(), rich_text(&booking.organizer));
        props.insert(p.attendees.clone(), rich_text(&booking.attendees.join(", ")));
        props.insert(p.team.clone(), rich_text(booking.team.as_deref().unwrap_or("")));
        props.insert(p.status.clone(), json!({ "select": { "name": booking.status.label() } }));
        props.insert(p.group_id.clone(), rich_text(&booking.group_id.to_string()));
        let weeks = match booking.recurrence {
            Recurrence::None => Value::Null,
            Recurrence::Weekly { count } => json!(count),
        };
        props.insert(p.recurrence.clone(), json!({ "number": weeks }));
        Value::Object(props)
    }

    fn parse_page(&self, page: &Value) -> Result<ReservationOccurrence, StoreError> {
        let p = &self.settings.properties;
        let id = page["id"]
            .as_str()
            .ok_or_else(|| StoreError::Rejected("page without id".into()))?;
        let props = &page["properties"];

        let start = date_prop(&props[&p.start], &p.start)?;
        let end = date_prop(&props[&p.end], &p.end)?;
        let span = Span::try_new(start, end)
            .ok_or_else(|| StoreError::Rejected(format!("page {id} has start >= end")))?;

        let status = props[&p.status]["select"]["name"]
            .as_str()
            .and_then(OccurrenceStatus::from_label)
            .unwrap_or(OccurrenceStatus::Active);

        // Pages created by hand carry no group; derive a stable one from the page id.
        let group_id = plain_text(&props[&p.group_id]["rich_text"])
            .parse::<GroupId>()
            .unwrap_or_else(|_| group_from_page_id(id));

        let recurrence = match props[&p.recurrence]["number"].as_u64() {
            Some(count) => Recurrence::Weekly {
                count: u32::try_from(count).unwrap_or(u32::MAX),
            },
            None => Recurrence::None,
        };

        let attendees = plain_text(&props[&p.attendees]["rich_text"])
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();

        let team = Some(plain_text(&props[&p.team]["rich_text"])).filter(|t| !t.is_empty());

        Ok(ReservationOccurrence {
            record_id: RecordId::new(id),
            booking: Booking {
                group_id,
                room: RoomId::new(plain_text(&props[&p.room]["rich_text"])),
                span,
                title: plain_text(&props[&p.title]["title"]),
                organizer: plain_text(&props[&p.organizer]["rich_text"]),
                attendees,
                team,
                status,
                recurrence,
            },
        })
    }

    /// A page without a `Group` value is a group of its own, keyed by its page id.
    async fn page_as_group(&self, group_id: GroupId) -> Result<Vec<ReservationOccurrence>, StoreError> {
        let page_id = RecordId::new(page_id_from_group(group_id));
        let url = self.url(&format!("pages/{page_id}"));
        let page = match self.send(self.client.get(url), Some(&page_id)).await {
            Ok(page) => page,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if page["archived"].as_bool() == Some(true) || !self.in_database(&page) {
            return Ok(Vec::new());
        }
        let occ = self.parse_page(&page)?;
        if occ.booking.group_id != group_id {
            return Ok(Vec::new());
        }
        Ok(vec![occ])
    }

    fn in_database(&self, page: &Value) -> bool {
        match page["parent"]["database_id"].as_str() {
            Some(parent) => strip_dashes(parent).eq_ignore_ascii_case(&strip_dashes(&self.settings.database_id)),
            None => true,
        }
    }
}

#[async_trait]
impl RecordStore for NotionStore {
    async fn query_by_room_and_range(
        &self,
        room: &RoomId,
        range: &Span,
        filter: StatusFilter,
    ) -> Result<Vec<ReservationOccurrence>, StoreError> {
        let p = &self.settings.properties;
        let mut clauses = vec![
            json!({ "property": p.room, "rich_text": { "equals": room.as_str() } }),
            // existing.start < range.end AND existing.end > range.start
            json!({ "property": p.start, "date": { "before": range.end.to_rfc3339() } }),
            json!({ "property": p.end, "date": { "after": range.start.to_rfc3339() } }),
        ];
        if filter == StatusFilter::ActiveOnly {
            clauses.push(json!({
                "property": p.status,
                "select": { "does_not_equal": OccurrenceStatus::Cancelled.label() }
            }));
        }
        let records = self.query(json!({ "and": clauses })).await?;
        // The store compares at its own precision; re-check the half-open overlap.
        Ok(records
            .into_iter()
            .filter(|r| r.span().overlaps(range) && filter.admits(r.booking.status))
            .collect())
    }

    async fn query_by_group(&self, group_id: GroupId) -> Result<Vec<ReservationOccurrence>, StoreError> {
        let p = &self.settings.properties;
        let filter = json!({
            "property": p.group_id,
            "rich_text": { "equals": group_id.to_string() }
        });
        let records = self.query(filter).await?;
        if !records.is_empty() {
            return Ok(records);
        }
        self.page_as_group(group_id).await
    }

    async fn create(&self, booking: &Booking) -> Result<RecordId, StoreError> {
        let body = json!({
            "parent": { "database_id": self.settings.database_id },
            "properties": self.properties(booking),
        });
        let page = self.send(self.client.post(self.url("pages")).json(&body), None).await?;
        page["id"]
            .as_str()
            .map(RecordId::new)
            .ok_or_else(|| StoreError::Rejected("create response has no page id".into()))
    }

    async fn update(&self, id: &RecordId, booking: &Booking) -> Result<(), StoreError> {
        let body = json!({ "properties": self.properties(booking) });
        let url = self.url(&format!("pages/{id}"));
        self.send(self.client.patch(url).json(&body), Some(id)).await?;
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        let url = self.url(&format!("pages/{id}"));
        self.send(self.client.patch(url).json(&json!({ "archived": true })), Some(id))
            .await?;
        Ok(())
    }
}

fn text(content: &str) -> Value {
    json!({ "text": { "content": content } })
}

fn rich_text(content: &str) -> Value {
    if content.is_empty() {
        return json!({ "rich_text": [] });
    }
    json!({ "rich_text": [text(content)] })
}

/// Concatenated text of a title/rich_text array.
fn plain_text(fragments: &Value) -> String {
    fragments
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|f| f["plain_text"].as_str().or_else(|| f["text"]["content"].as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn date_prop(prop: &Value, name: &str) -> Result<Ts, StoreError> {
    let raw = prop["date"]["start"]
        .as_str()
        .ok_or_else(|| StoreError::Rejected(format!("property `{name}` has no date")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Rejected(format!("property `{name}` date `{raw}`: {e}")))
}

fn strip_dashes(id: &str) -> String {
    id.chars().filter(|c| *c != '-').collect()
}

fn group_from_page_id(page_id: &str) -> GroupId {
    let bits = u128::from_str_radix(&strip_dashes(page_id), 16).unwrap_or(0);
    GroupId(Ulid::from(bits))
}

/// Inverse of [`group_from_page_id`], in Notion's dashed UUID form.
fn page_id_from_group(group_id: GroupId) -> String {
    let hex = format!("{:032x}", u128::from(group_id.0));
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_builder() {
        StoreError::Rejected(format!("request build: {e}"))
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    let msg = format!("{status}: {body}");
    // 409 is Notion's transient write-conflict signal.
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::CONFLICT || status.is_server_error() {
        StoreError::Unavailable(msg)
    } else {
        StoreError::Rejected(msg)
    }
}

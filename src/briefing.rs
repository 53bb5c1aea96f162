//! Daily room briefing: every active reservation touching one local calendar
//! day, grouped by room in configured order, then by start time.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::engine::{Engine, EngineError, Listing};
use crate::model::*;
use crate::recurrence::day_bounds;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Briefing {
    pub date: NaiveDate,
    pub timezone: String,
    pub rooms: Vec<RoomBriefing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomBriefing {
    pub room: RoomId,
    pub room_name: String,
    pub entries: Vec<BriefingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BriefingEntry {
    pub group_id: GroupId,
    pub record_id: RecordId,
    pub start: Ts,
    pub end: Ts,
    pub title: String,
    pub organizer: String,
    pub team: Option<String>,
    pub attendees: Vec<String>,
}

impl Briefing {
    pub fn from_listing(date: NaiveDate, tz: Tz, listing: Listing) -> Self {
        let rooms = listing
            .rooms
            .into_iter()
            .map(|r| RoomBriefing {
                room: r.room.id,
                room_name: r.room.name,
                entries: r
                    .occurrences
                    .into_iter()
                    .map(|o| BriefingEntry {
                        group_id: o.booking.group_id,
                        record_id: o.record_id,
                        start: o.booking.span.start,
                        end: o.booking.span.end,
                        title: o.booking.title,
                        organizer: o.booking.organizer,
                        team: o.booking.team,
                        attendees: o.booking.attendees,
                    })
                    .collect(),
            })
            .collect();
        Self {
            date,
            timezone: tz.name().to_string(),
            rooms,
        }
    }

    pub fn total(&self) -> usize {
        self.rooms.iter().map(|r| r.entries.len()).sum()
    }

    /// Plain-text rendering with times in the briefing's zone. Times on
    /// another day than the briefing date carry their month and day.
    pub fn render(&self) -> String {
        let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local = |t: Ts| {
            let l = t.with_timezone(&tz);
            if l.date_naive() == self.date {
                l.format("%H:%M").to_string()
            } else {
                l.format("%m-%d %H:%M").to_string()
            }
        };

        let mut out = format!("Room reservations for {} ({})\n", self.date.format("%Y-%m-%d"), self.timezone);
        if self.total() == 0 {
            out.push_str("No reservations.\n");
            return out;
        }
        for room in &self.rooms {
            let _ = write!(out, "\n{}\n", room.room_name);
            if room.entries.is_empty() {
                out.push_str("  (free)\n");
            }
            for e in &room.entries {
                let _ = write!(out, "  {}-{}  {}", local(e.start), local(e.end), e.title);
                if let Some(team) = &e.team {
                    let _ = write!(out, " [{team}]");
                }
                let _ = writeln!(out, " - {}", e.organizer);
            }
        }
        out
    }
}

impl Engine {
    /// Briefing for the local calendar day `date` in the configured zone.
    pub async fn generate_briefing(&self, date: NaiveDate) -> Result<Briefing, EngineError> {
        let tz = self.timezone();
        let listing = self.list_reservations(&day_bounds(date, tz)).await?;
        Ok(Briefing::from_listing(date, tz, listing))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("could not build briefing: {0}")]
    Engine(#[from] EngineError),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Destination for a rendered briefing.
#[async_trait]
pub trait BriefingSink: Send + Sync {
    async fn deliver(&self, briefing: &Briefing) -> Result<(), DeliveryError>;
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
pub struct WebhookSink {
    client: Client,
    url: SecretString,
}

impl WebhookSink {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl BriefingSink for WebhookSink {
    async fn deliver(&self, briefing: &Briefing) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.url.expose_secret())
            .json(&json!({ "text": briefing.render() }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes the briefing to the log. Used when no destination is configured.
pub struct LogSink;

#[async_trait]
impl BriefingSink for LogSink {
    async fn deliver(&self, briefing: &Briefing) -> Result<(), DeliveryError> {
        info!(date = %briefing.date, reservations = briefing.total(), "daily briefing\n{}", briefing.render());
        Ok(())
    }
}

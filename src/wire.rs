//! Newline-delimited JSON over TCP: one request per line, one reply per line.
//! A connection that sent `listen` also receives its organizer's notices.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::briefing::Briefing;
use crate::engine::{CancelOutcome, ConflictReport, Engine, EngineError, ErrorKind, Listing, ReservationRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::MutationNotice;
use crate::observability;
use crate::recurrence::{QueryWindow, local_date};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundRequest {
    Create {
        actor: String,
        #[serde(flatten)]
        request: ReservationRequest,
    },
    Edit {
        actor: String,
        group_id: GroupId,
        #[serde(flatten)]
        request: ReservationRequest,
    },
    Cancel {
        actor: String,
        group_id: GroupId,
    },
    CancelOccurrence {
        actor: String,
        group_id: GroupId,
        record_id: RecordId,
    },
    Show {
        group_id: GroupId,
    },
    Briefing {
        #[serde(default)]
        date: Option<NaiveDate>,
    },
    Query {
        #[serde(default)]
        when: String,
    },
    Listen {
        actor: String,
    },
}

impl InboundRequest {
    fn label(&self) -> &'static str {
        match self {
            InboundRequest::Create { .. } => "create",
            InboundRequest::Edit { .. } => "edit",
            InboundRequest::Cancel { .. } => "cancel",
            InboundRequest::CancelOccurrence { .. } => "cancel_occurrence",
            InboundRequest::Show { .. } => "show",
            InboundRequest::Briefing { .. } => "briefing",
            InboundRequest::Query { .. } => "query",
            InboundRequest::Listen { .. } => "listen",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Accepted {
        result: Accepted,
    },
    Rejected {
        kind: ErrorKind,
        reason: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        conflicts: Vec<ConflictReport>,
    },
    Notice {
        notice: MutationNotice,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Accepted {
    Group { group: ReservationGroup },
    Cancelled { group: ReservationGroup, already_cancelled: bool },
    Briefing { briefing: Briefing, text: String },
    Listing { listing: Listing },
    Listening { actor: String },
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        let kind = e.kind();
        let reason = e.to_string();
        let conflicts = match e {
            EngineError::Conflict(reports) => reports,
            _ => Vec::new(),
        };
        Reply::Rejected {
            kind,
            reason,
            conflicts,
        }
    }
}

impl Reply {
    fn malformed(reason: impl Into<String>) -> Self {
        Reply::Rejected {
            kind: ErrorKind::InvalidRequest,
            reason: reason.into(),
            conflicts: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serve one connection until the peer closes it.
pub async fn process_connection<S>(io: S, engine: Arc<Engine>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut listener: Option<broadcast::Receiver<MutationNotice>> = None;

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&engine, &line, &mut listener).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Reply::malformed(format!("request line longer than {MAX_LINE_LEN} bytes"))
                    }
                    Some(Err(e)) => break Err(e.into()),
                };
                if let Err(e) = send(&mut framed, &reply).await {
                    break Err(e);
                }
            }
            notice = next_notice(&mut listener) => {
                match notice {
                    Some(notice) => {
                        if let Err(e) = send(&mut framed, &Reply::Notice { notice }).await {
                            break Err(e);
                        }
                    }
                    None => listener = None,
                }
            }
        }
    };

    if listener.is_some() {
        metrics::gauge!(observability::LISTENERS_ACTIVE).decrement(1.0);
    }
    result
}

async fn send<S>(framed: &mut Framed<S, LinesCodec>, reply: &Reply) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(reply)?;
    framed.send(text).await?;
    Ok(())
}

async fn next_notice(listener: &mut Option<broadcast::Receiver<MutationNotice>>) -> Option<MutationNotice> {
    let Some(rx) = listener else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notice) => return Some(notice),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "listener fell behind, notices dropped"),
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn handle_line(
    engine: &Engine,
    line: &str,
    listener: &mut Option<broadcast::Receiver<MutationNotice>>,
) -> Reply {
    let request: InboundRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "malformed request");
            metrics::counter!(observability::REQUESTS_TOTAL, "action" => "unknown", "status" => "malformed")
                .increment(1);
            return Reply::malformed(format!("malformed request: {e}"));
        }
    };

    let action = request.label();
    let started = Instant::now();
    let reply = match execute(engine, request, listener).await {
        Ok(result) => Reply::Accepted { result },
        Err(e) => {
            metrics::counter!(observability::REJECTIONS_TOTAL, "kind" => observability::rejection_label(e.kind()))
                .increment(1);
            debug!(action, error = %e, "request rejected");
            Reply::from(e)
        }
    };
    let status = match &reply {
        Reply::Accepted { .. } => "accepted",
        _ => "rejected",
    };
    metrics::counter!(observability::REQUESTS_TOTAL, "action" => action, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "action" => action)
        .record(started.elapsed().as_secs_f64());
    reply
}

async fn execute(
    engine: &Engine,
    request: InboundRequest,
    listener: &mut Option<broadcast::Receiver<MutationNotice>>,
) -> Result<Accepted, EngineError> {
    let tz = engine.timezone();
    match request {
        InboundRequest::Create { actor, request } => {
            let group = engine.create_reservation(&actor, request).await?;
            Ok(Accepted::Group { group })
        }
        InboundRequest::Edit {
            actor,
            group_id,
            request,
        } => {
            let group = engine.edit_reservation(&actor, group_id, request).await?;
            Ok(Accepted::Group { group })
        }
        InboundRequest::Cancel { actor, group_id } => {
            let outcome = engine.cancel_reservation(&actor, group_id).await?;
            let already_cancelled = matches!(outcome, CancelOutcome::AlreadyCancelled(_));
            let group = match outcome {
                CancelOutcome::Cancelled(g) | CancelOutcome::AlreadyCancelled(g) => g,
            };
            Ok(Accepted::Cancelled {
                group,
                already_cancelled,
            })
        }
        InboundRequest::CancelOccurrence {
            actor,
            group_id,
            record_id,
        } => {
            let group = engine.cancel_occurrence(&actor, group_id, &record_id).await?;
            Ok(Accepted::Group { group })
        }
        InboundRequest::Show { group_id } => {
            let group = engine.get_group(group_id).await?;
            Ok(Accepted::Group { group })
        }
        InboundRequest::Briefing { date } => {
            let date = date.unwrap_or_else(|| local_date(Utc::now(), tz));
            let briefing = engine.generate_briefing(date).await?;
            let text = briefing.render();
            Ok(Accepted::Briefing { briefing, text })
        }
        InboundRequest::Query { when } => {
            let window = QueryWindow::parse(&when, local_date(Utc::now(), tz))?;
            let listing = engine.reservations_in(window).await?;
            Ok(Accepted::Listing { listing })
        }
        InboundRequest::Listen { actor } => {
            if actor.trim().is_empty() {
                return Err(EngineError::invalid("actor", "identity must not be empty"));
            }
            if listener.is_none() {
                metrics::gauge!(observability::LISTENERS_ACTIVE).increment(1.0);
            }
            *listener = Some(engine.notify.subscribe(&actor));
            Ok(Accepted::Listening { actor })
        }
    }
}

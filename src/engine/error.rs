use serde::Serialize;
use thiserror::Error;

use crate::model::{GroupId, RecordId, RoomId};
use crate::store::StoreError;

use super::conflict::ConflictReport;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid recurrence: {count} occurrences requested, allowed 1..={max}")]
    InvalidRecurrence { count: u32, max: u32 },
    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },
    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),
    #[error("{} occurrence(s) overlap existing reservations", .0.len())]
    Conflict(Vec<ConflictReport>),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("record store rejected the request: {0}")]
    StoreRejected(String),
    #[error("commit failed after {committed} of {requested} occurrences: {cause}")]
    PartialCommitFailure {
        committed: usize,
        requested: usize,
        cause: String,
        /// Records the compensating rollback could not remove.
        orphaned: Vec<RecordId>,
    },
    #[error("reservation not found: {0}")]
    NotFound(GroupId),
    #[error("occurrence {record_id} is not part of reservation {group_id}")]
    OccurrenceNotFound { group_id: GroupId, record_id: RecordId },
    #[error("{actor} is not the organizer of reservation {group_id}")]
    NotOrganizer { group_id: GroupId, actor: String },
    #[error("reservation {0} is cancelled")]
    GroupCancelled(GroupId),
}

/// Machine-readable error category returned to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInterval,
    InvalidRecurrence,
    InvalidRequest,
    UnknownRoom,
    Conflict,
    StoreUnavailable,
    StoreRejected,
    PartialCommitFailure,
    NotFound,
    NotOrganizer,
    GroupCancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInterval => "invalid_interval",
            ErrorKind::InvalidRecurrence => "invalid_recurrence",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnknownRoom => "unknown_room",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::StoreRejected => "store_rejected",
            ErrorKind::PartialCommitFailure => "partial_commit_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotOrganizer => "not_organizer",
            ErrorKind::GroupCancelled => "group_cancelled",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInterval(_) => ErrorKind::InvalidInterval,
            EngineError::InvalidRecurrence { .. } => ErrorKind::InvalidRecurrence,
            EngineError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            EngineError::UnknownRoom(_) => ErrorKind::UnknownRoom,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            EngineError::StoreRejected(_) => ErrorKind::StoreRejected,
            EngineError::PartialCommitFailure { .. } => ErrorKind::PartialCommitFailure,
            EngineError::NotFound(_) | EngineError::OccurrenceNotFound { .. } => ErrorKind::NotFound,
            EngineError::NotOrganizer { .. } => ErrorKind::NotOrganizer,
            EngineError::GroupCancelled(_) => ErrorKind::GroupCancelled,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            StoreError::Rejected(msg) => EngineError::StoreRejected(msg),
            StoreError::NotFound(id) => EngineError::StoreRejected(format!("record {id} not found")),
            // Conflict reports are built where the candidate is known.
            StoreError::SlotTaken(existing) => {
                EngineError::StoreRejected(format!("slot already taken by record {}", existing.record_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;

    #[test]
    fn store_errors_map_to_kinds() {
        let unavailable = EngineError::from(StoreError::Unavailable("timeout".into()));
        assert_eq!(unavailable.kind(), ErrorKind::StoreUnavailable);
        let missing = EngineError::from(StoreError::NotFound(RecordId::new("rec_1")));
        assert_eq!(missing.kind(), ErrorKind::StoreRejected);
    }

    #[test]
    fn slot_taken_without_candidate_is_not_a_conflict_report() {
        let holder = occurrence("rec_holder", "room_1", span(10, 0, 11, 0));
        let err = EngineError::from(StoreError::SlotTaken(Box::new(holder)));
        assert_eq!(err.kind(), ErrorKind::StoreRejected);
        assert!(err.to_string().contains("rec_holder"));
    }
}

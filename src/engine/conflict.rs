use std::collections::HashSet;

use serde::Serialize;

use crate::model::*;
use crate::store::StatusFilter;

use super::{Engine, EngineError};

/// One candidate occurrence and the existing reservations it overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    /// Position of the candidate in the requested (expanded) sequence.
    pub candidate_index: usize,
    pub candidate: Span,
    pub existing: Vec<ReservationOccurrence>,
}

/// Pure overlap test of every candidate against `existing`.
///
/// Records in `excluding` and non-active records are ignored. The result is
/// ordered by candidate index and does not depend on the order of `existing`.
pub fn find_conflicts(
    candidates: &[Span],
    existing: &[ReservationOccurrence],
    excluding: &HashSet<RecordId>,
) -> Vec<ConflictReport> {
    let mut relevant: Vec<&ReservationOccurrence> = existing
        .iter()
        .filter(|r| r.is_active() && !excluding.contains(&r.record_id))
        .collect();
    relevant.sort_by(|a, b| {
        a.span()
            .start
            .cmp(&b.span().start)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });

    candidates
        .iter()
        .enumerate()
        .filter_map(|(i, candidate)| {
            // Records sorted by start: none starting at or after candidate.end can overlap.
            let upper = relevant.partition_point(|r| r.span().start < candidate.end);
            let hits: Vec<ReservationOccurrence> = relevant[..upper]
                .iter()
                .filter(|r| r.span().overlaps(candidate))
                .map(|r| (*r).clone())
                .collect();
            (!hits.is_empty()).then(|| ConflictReport {
                candidate_index: i,
                candidate: *candidate,
                existing: hits,
            })
        })
        .collect()
}

impl Engine {
    /// Conflicts between `candidates` and the active reservations of `room`.
    ///
    /// Issues exactly one store query covering all candidates, regardless of
    /// how many there are. Store errors propagate unchanged.
    pub async fn check_conflicts(
        &self,
        room: &RoomId,
        candidates: &[Span],
        excluding: &HashSet<RecordId>,
    ) -> Result<Vec<ConflictReport>, EngineError> {
        let Some(cover) = Span::cover(candidates) else {
            return Ok(Vec::new());
        };
        let existing = self
            .store
            .query_by_room_and_range(room, &cover, StatusFilter::ActiveOnly)
            .await?;
        Ok(find_conflicts(candidates, &existing, excluding))
    }
}

use std::collections::HashSet;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::limits::*;
use crate::model::*;
use crate::notify::{MutationNotice, NoticeKind};
use crate::observability;
use crate::recurrence::expand_occurrences;
use crate::store::StoreError;

use super::{Engine, EngineError};

/// Fields a user supplies when creating or editing a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReservationRequest {
    /// Falls back to the default room on create, or the group's room on edit.
    #[serde(default)]
    pub room: Option<RoomId>,
    pub title: String,
    pub start: Ts,
    pub end: Ts,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub team: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(ReservationGroup),
    /// The group was already cancelled; nothing was written.
    AlreadyCancelled(ReservationGroup),
}

impl CancelOutcome {
    pub fn group(&self) -> &ReservationGroup {
        match self {
            CancelOutcome::Cancelled(g) | CancelOutcome::AlreadyCancelled(g) => g,
        }
    }
}

impl Engine {
    /// Expand, conflict-check and commit a new reservation group.
    ///
    /// Either every occurrence is committed or none is: a conflict on any
    /// occurrence rejects the whole request, and a store failure midway
    /// deletes the occurrences already written before the error surfaces.
    pub async fn create_reservation(
        &self,
        actor: &str,
        req: ReservationRequest,
    ) -> Result<ReservationGroup, EngineError> {
        let room = self.resolve_room(req.room.as_ref())?;
        let req = self.validate_request(actor, req)?;
        let spans = self.expand(&req)?;

        let conflicts = self.check_conflicts(&room, &spans, &HashSet::new()).await?;
        if !conflicts.is_empty() {
            info!(room = %room, conflicting = conflicts.len(), "reservation rejected: conflict");
            return Err(EngineError::Conflict(conflicts));
        }

        let group_id = GroupId::new();
        let bookings = build_bookings(group_id, &room, actor, &req, &spans);
        let committed = self.commit_all(&bookings, &HashSet::new()).await?;
        let group = ReservationGroup::from_records(group_id, committed).ok_or(EngineError::NotFound(group_id))?;

        info!(
            group_id = %group_id,
            room = %room,
            occurrences = group.occurrences.len(),
            "reservation created"
        );
        self.notify.send(&MutationNotice::for_group(NoticeKind::Created, &group));
        Ok(group)
    }

    /// Replace a group's occurrences with a new time/title/attendee set.
    ///
    /// The new set is checked against everything except the group's own
    /// records and committed before the old records are removed. On any
    /// failure the original reservation is what remains.
    pub async fn edit_reservation(
        &self,
        actor: &str,
        group_id: GroupId,
        req: ReservationRequest,
    ) -> Result<ReservationGroup, EngineError> {
        let current = self.get_group(group_id).await?;
        ensure_organizer(&current, actor)?;
        if current.status == GroupStatus::Cancelled {
            return Err(EngineError::GroupCancelled(group_id));
        }

        let room = match &req.room {
            Some(r) => self.resolve_room(Some(r))?,
            None => current.room.clone(),
        };
        let req = self.validate_request(actor, req)?;
        let spans = self.expand(&req)?;

        let own: HashSet<RecordId> = current.record_ids().into_iter().collect();
        let conflicts = self.check_conflicts(&room, &spans, &own).await?;
        if !conflicts.is_empty() {
            info!(group_id = %group_id, room = %room, "edit rejected: conflict");
            return Err(EngineError::Conflict(conflicts));
        }

        let bookings = build_bookings(group_id, &room, &current.organizer, &req, &spans);
        let replacement = self.commit_all(&bookings, &own).await?;

        self.retire(&current, &replacement).await?;

        let group = ReservationGroup::from_records(group_id, replacement).ok_or(EngineError::NotFound(group_id))?;
        info!(
            group_id = %group_id,
            room = %room,
            occurrences = group.occurrences.len(),
            "reservation edited"
        );
        self.notify.send(&MutationNotice::for_group(NoticeKind::Edited, &group));
        Ok(group)
    }

    /// Mark every active occurrence of the group Cancelled.
    ///
    /// Idempotent: an already-cancelled group is returned without writing.
    /// A store failure midway leaves the group partially cancelled and the
    /// same call can be repeated to finish it.
    pub async fn cancel_reservation(&self, actor: &str, group_id: GroupId) -> Result<CancelOutcome, EngineError> {
        let group = self.get_group(group_id).await?;
        ensure_organizer(&group, actor)?;
        if group.status == GroupStatus::Cancelled {
            return Ok(CancelOutcome::AlreadyCancelled(group));
        }

        let mut records = Vec::with_capacity(group.occurrences.len());
        for occ in group.occurrences {
            if occ.is_active() {
                let cancelled = occ.booking.with_status(OccurrenceStatus::Cancelled);
                match self.store.update(&occ.record_id, &cancelled).await {
                    // Removed underneath us by a concurrent edit.
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(group_id = %group_id, record_id = %occ.record_id, error = %e, "cancel interrupted");
                        return Err(e.into());
                    }
                }
                records.push(ReservationOccurrence {
                    record_id: occ.record_id,
                    booking: cancelled,
                });
            } else {
                records.push(occ);
            }
        }

        let group = ReservationGroup::from_records(group_id, records).ok_or(EngineError::NotFound(group_id))?;
        info!(group_id = %group_id, room = %group.room, "reservation cancelled");
        self.notify.send(&MutationNotice::for_group(NoticeKind::Cancelled, &group));
        Ok(CancelOutcome::Cancelled(group))
    }

    /// Cancel one occurrence; the group becomes PartiallyCancelled (or
    /// Cancelled if it was the last active one). Repeating it is a no-op.
    pub async fn cancel_occurrence(
        &self,
        actor: &str,
        group_id: GroupId,
        record_id: &RecordId,
    ) -> Result<ReservationGroup, EngineError> {
        let group = self.get_group(group_id).await?;
        ensure_organizer(&group, actor)?;

        let Some(pos) = group.occurrences.iter().position(|o| &o.record_id == record_id) else {
            return Err(EngineError::OccurrenceNotFound {
                group_id,
                record_id: record_id.clone(),
            });
        };
        if !group.occurrences[pos].is_active() {
            return Ok(group);
        }

        let cancelled = group.occurrences[pos].booking.with_status(OccurrenceStatus::Cancelled);
        self.store.update(record_id, &cancelled).await?;

        let mut records = group.occurrences;
        records[pos].booking = cancelled;
        let group = ReservationGroup::from_records(group_id, records).ok_or(EngineError::NotFound(group_id))?;
        info!(group_id = %group_id, record_id = %record_id, status = ?group.status, "occurrence cancelled");
        self.notify
            .send(&MutationNotice::for_group(NoticeKind::OccurrenceCancelled, &group));
        Ok(group)
    }

    // ── Helpers ──────────────────────────────────────────────

    fn expand(&self, req: &ReservationRequest) -> Result<Vec<Span>, EngineError> {
        expand_occurrences(
            req.start,
            req.end,
            req.recurrence,
            self.policy.timezone,
            self.policy.max_duration,
        )
    }

    /// Check limits and return the request with title, attendees and team normalised.
    pub(super) fn validate_request(&self, actor: &str, req: ReservationRequest) -> Result<ReservationRequest, EngineError> {
        check_identity("actor", actor)?;

        let title = req.title.trim().to_string();
        if title.is_empty() {
            return Err(EngineError::invalid("title", "must not be empty"));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(EngineError::invalid(
                "title",
                format!("longer than {MAX_TITLE_LEN} characters"),
            ));
        }

        let mut seen = HashSet::new();
        let mut attendees = Vec::with_capacity(req.attendees.len());
        for a in req.attendees {
            let a = a.trim().to_string();
            check_identity("attendees", &a)?;
            if seen.insert(a.clone()) {
                attendees.push(a);
            }
        }
        if attendees.len() > MAX_ATTENDEES {
            return Err(EngineError::invalid(
                "attendees",
                format!("more than {MAX_ATTENDEES} attendees"),
            ));
        }

        let team = req.team.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        if let Some(t) = &team {
            if t.chars().count() > MAX_TEAM_LEN {
                return Err(EngineError::invalid("team", format!("longer than {MAX_TEAM_LEN} characters")));
            }
            if !self.policy.teams.is_empty() && !self.policy.teams.contains(t) {
                return Err(EngineError::invalid("team", format!("unknown team `{t}`")));
            }
        }

        Ok(ReservationRequest {
            title,
            attendees,
            team,
            ..req
        })
    }

    /// Create every booking in order. On failure, delete what was written and
    /// report the failure.
    ///
    /// `keep` holds records of the group that predate this commit; a retried
    /// create may hand one of them back, and they are never rolled back.
    async fn commit_all(
        &self,
        bookings: &[Booking],
        keep: &HashSet<RecordId>,
    ) -> Result<Vec<ReservationOccurrence>, EngineError> {
        let requested = bookings.len();
        let mut committed: Vec<ReservationOccurrence> = Vec::with_capacity(requested);
        for (k, booking) in bookings.iter().enumerate() {
            match self.store.create(booking).await {
                Ok(record_id) => committed.push(ReservationOccurrence {
                    record_id,
                    booking: booking.clone(),
                }),
                Err(e) => {
                    warn!(
                        group_id = %booking.group_id,
                        committed = k,
                        requested,
                        error = %e,
                        "commit failed, rolling back"
                    );
                    let written: Vec<RecordId> = committed
                        .iter()
                        .map(|o| o.record_id.clone())
                        .filter(|id| !keep.contains(id))
                        .collect();
                    let mut orphaned = self.rollback(&written).await;

                    let mut known = keep.clone();
                    known.extend(written);
                    orphaned.extend(self.sweep_unacknowledged(booking.group_id, &known).await);
                    return Err(commit_failure(e, k, requested, booking.span, orphaned));
                }
            }
        }
        metrics::counter!(observability::OCCURRENCES_COMMITTED_TOTAL).increment(requested as u64);
        Ok(committed)
    }

    /// Delete `ids` newest first. Returns the ids that could not be removed.
    async fn rollback(&self, ids: &[RecordId]) -> Vec<RecordId> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut orphaned = Vec::new();
        for id in ids.iter().rev() {
            match self.store.delete(id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    error!(record_id = %id, error = %e, "rollback could not delete record");
                    orphaned.push(id.clone());
                }
            }
        }
        let outcome = if orphaned.is_empty() { "clean" } else { "orphaned" };
        metrics::counter!(observability::ROLLBACKS_TOTAL, "outcome" => outcome).increment(1);
        orphaned
    }

    /// Delete records of `group_id` missing from `known`: writes that were
    /// applied although their create reported failure. Returns the ids that
    /// could not be removed.
    async fn sweep_unacknowledged(&self, group_id: GroupId, known: &HashSet<RecordId>) -> Vec<RecordId> {
        let members = match self.store.query_by_group(group_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "could not check group for unacknowledged writes");
                return Vec::new();
            }
        };
        let strays: Vec<RecordId> = members
            .into_iter()
            .map(|o| o.record_id)
            .filter(|id| !known.contains(id))
            .collect();
        if strays.is_empty() {
            return Vec::new();
        }
        warn!(group_id = %group_id, strays = strays.len(), "removing unacknowledged records");
        self.rollback(&strays).await
    }

    /// Remove the records of `current` after `replacement` has been committed.
    /// If that fails, undo: drop the replacement and re-create what was removed.
    ///
    /// Re-created originals get new record ids; the error names them.
    async fn retire(&self, current: &ReservationGroup, replacement: &[ReservationOccurrence]) -> Result<(), EngineError> {
        let reused: HashSet<&RecordId> = replacement.iter().map(|o| &o.record_id).collect();
        let mut removed: Vec<&ReservationOccurrence> = Vec::new();
        for old in current.occurrences.iter().filter(|o| !reused.contains(&o.record_id)) {
            match self.store.delete(&old.record_id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => removed.push(old),
                Err(e) => {
                    warn!(group_id = %current.id, record_id = %old.record_id, error = %e, "edit could not retire old record, compensating");
                    let own: HashSet<&RecordId> = current.occurrences.iter().map(|o| &o.record_id).collect();
                    let new_ids: Vec<RecordId> = replacement
                        .iter()
                        .map(|o| o.record_id.clone())
                        .filter(|id| !own.contains(id))
                        .collect();
                    let orphaned = self.rollback(&new_ids).await;

                    let mut lost = Vec::new();
                    let mut reissued = Vec::new();
                    for occ in removed {
                        match self.store.create(&occ.booking).await {
                            Ok(new_id) => {
                                info!(group_id = %current.id, old = %occ.record_id, new = %new_id, "original occurrence restored");
                                reissued.push(new_id);
                            }
                            Err(restore_err) => {
                                error!(
                                    group_id = %current.id,
                                    record_id = %occ.record_id,
                                    error = %restore_err,
                                    "could not restore original occurrence"
                                );
                                lost.push(occ.record_id.clone());
                            }
                        }
                    }

                    if orphaned.is_empty() && lost.is_empty() {
                        return Err(with_reissued_ids(e.into(), &reissued));
                    }
                    return Err(EngineError::PartialCommitFailure {
                        committed: replacement.len(),
                        requested: replacement.len(),
                        cause: format!("{e}; {} original occurrence(s) not restored", lost.len()),
                        orphaned,
                    });
                }
            }
        }
        Ok(())
    }
}

fn build_bookings(
    group_id: GroupId,
    room: &RoomId,
    organizer: &str,
    req: &ReservationRequest,
    spans: &[Span],
) -> Vec<Booking> {
    spans
        .iter()
        .map(|span| Booking {
            group_id,
            room: room.clone(),
            span: *span,
            title: req.title.clone(),
            organizer: organizer.to_string(),
            attendees: req.attendees.clone(),
            team: req.team.clone(),
            status: OccurrenceStatus::Active,
            recurrence: req.recurrence,
        })
        .collect()
}

fn commit_failure(cause: StoreError, k: usize, requested: usize, candidate: Span, orphaned: Vec<RecordId>) -> EngineError {
    match cause {
        // The write-time slot check caught a booking the pre-check missed.
        StoreError::SlotTaken(existing) if orphaned.is_empty() => EngineError::Conflict(vec![super::ConflictReport {
            candidate_index: k,
            candidate,
            existing: vec![*existing],
        }]),
        e if k == 0 && orphaned.is_empty() => e.into(),
        e => EngineError::PartialCommitFailure {
            committed: k,
            requested,
            cause: e.to_string(),
            orphaned,
        },
    }
}

/// Note the new ids of restored occurrences on a store error.
fn with_reissued_ids(err: EngineError, ids: &[RecordId]) -> EngineError {
    if ids.is_empty() {
        return err;
    }
    let ids = ids.iter().map(RecordId::as_str).collect::<Vec<_>>().join(", ");
    let note = format!("original occurrences restored under new record ids: {ids}");
    match err {
        EngineError::StoreUnavailable(msg) => EngineError::StoreUnavailable(format!("{msg}; {note}")),
        EngineError::StoreRejected(msg) => EngineError::StoreRejected(format!("{msg}; {note}")),
        other => other,
    }
}

pub(super) fn ensure_organizer(group: &ReservationGroup, actor: &str) -> Result<(), EngineError> {
    if group.organizer != actor {
        return Err(EngineError::NotOrganizer {
            group_id: group.id,
            actor: actor.to_string(),
        });
    }
    Ok(())
}

fn check_identity(field: &'static str, id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::invalid(field, "identity must not be empty"));
    }
    if id.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::invalid(
            field,
            format!("identity longer than {MAX_IDENTITY_LEN} bytes"),
        ));
    }
    Ok(())
}

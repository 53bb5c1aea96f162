use chrono::TimeDelta;
use serde::Serialize;

use crate::limits::*;
use crate::model::*;
use crate::recurrence::QueryWindow;
use crate::store::StatusFilter;

use super::{Engine, EngineError};

/// Active reservations of one room within a listing range, ordered by start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomListing {
    pub room: Room,
    pub occurrences: Vec<ReservationOccurrence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub range: Span,
    /// Every configured room in configured order, including empty ones.
    pub rooms: Vec<RoomListing>,
}

impl Listing {
    pub fn total(&self) -> usize {
        self.rooms.iter().map(|r| r.occurrences.len()).sum()
    }
}

impl Engine {
    /// A reservation group with all its members (any status) and derived status.
    pub async fn get_group(&self, group_id: GroupId) -> Result<ReservationGroup, EngineError> {
        let records = self.store.query_by_group(group_id).await?;
        ReservationGroup::from_records(group_id, records).ok_or(EngineError::NotFound(group_id))
    }

    /// Active reservations intersecting `range`, across all rooms.
    ///
    /// Rooms are queried concurrently; any store failure fails the listing.
    pub async fn list_reservations(&self, range: &Span) -> Result<Listing, EngineError> {
        // A local "day" can be 25h; allow one extra day of slack over the cap.
        if range.duration() > TimeDelta::days(MAX_QUERY_DAYS + 1) {
            return Err(EngineError::invalid(
                "range",
                format!("listing range longer than {MAX_QUERY_DAYS} days"),
            ));
        }

        let queries = self
            .rooms()
            .iter()
            .map(|room| self.store.query_by_room_and_range(&room.id, range, StatusFilter::ActiveOnly));
        let results = futures::future::try_join_all(queries).await?;

        let rooms = self
            .rooms()
            .iter()
            .zip(results)
            .map(|(room, mut occurrences)| {
                occurrences.retain(|o| o.is_active() && o.span().overlaps(range));
                occurrences.sort_by(|a, b| {
                    a.span()
                        .start
                        .cmp(&b.span().start)
                        .then_with(|| a.record_id.cmp(&b.record_id))
                });
                RoomListing {
                    room: room.clone(),
                    occurrences,
                }
            })
            .collect();

        Ok(Listing { range: *range, rooms })
    }

    /// Listing for a `today` / `tomorrow` / `weekly` / date window in the
    /// configured zone.
    pub async fn reservations_in(&self, window: QueryWindow) -> Result<Listing, EngineError> {
        let range = window.span(self.timezone());
        self.list_reservations(&range).await
    }
}

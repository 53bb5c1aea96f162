mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{ConflictReport, find_conflicts};
pub use error::{EngineError, ErrorKind};
pub use mutations::{CancelOutcome, ReservationRequest};
pub use queries::{Listing, RoomListing};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::TimeDelta;
use chrono_tz::Tz;

use crate::limits::DEFAULT_MAX_DURATION_MINUTES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::RecordStore;

/// Booking rules that come from configuration rather than the store.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Zone for recurrence arithmetic and calendar days.
    pub timezone: Tz,
    pub max_duration: TimeDelta,
    /// Allowed organizing teams. Empty means any team is accepted.
    pub teams: HashSet<String>,
    pub default_room: Option<RoomId>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            max_duration: TimeDelta::minutes(DEFAULT_MAX_DURATION_MINUTES),
            teams: HashSet::new(),
            default_room: None,
        }
    }
}

/// Reservation engine. Holds only reference data; every decision about
/// reservations re-reads the record store.
pub struct Engine {
    pub(super) store: Arc<dyn RecordStore>,
    rooms: Vec<Room>,
    room_index: HashMap<RoomId, usize>,
    pub(super) policy: BookingPolicy,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>, rooms: Vec<Room>, policy: BookingPolicy, notify: Arc<NotifyHub>) -> Self {
        let room_index = rooms
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            store,
            rooms,
            room_index,
            policy,
            notify,
        }
    }

    /// Rooms in configured order.
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room> {
        self.room_index.get(id).map(|&i| &self.rooms[i])
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn timezone(&self) -> Tz {
        self.policy.timezone
    }

    /// The requested room, or the default room when none was named.
    pub(super) fn resolve_room(&self, requested: Option<&RoomId>) -> Result<RoomId, EngineError> {
        let id = match requested {
            Some(id) => id,
            None => self
                .policy
                .default_room
                .as_ref()
                .ok_or_else(|| EngineError::invalid("room", "no room given and no default room configured"))?,
        };
        if self.room(id).is_none() {
            return Err(EngineError::UnknownRoom(id.clone()));
        }
        Ok(id.clone())
    }
}

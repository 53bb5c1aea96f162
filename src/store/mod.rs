//! Record store gateway: the only path to durable reservation state.

mod memory;
mod notion;
mod retry;

pub use memory::{InMemoryStore, StoreOp};
pub use notion::{NotionSettings, NotionStore, PropertyMap};
pub use retry::{RetryPolicy, RetryingStore};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient: the caller may retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Permanent: retrying cannot help.
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("record not found: {0}")]
    NotFound(RecordId),
    /// Write-time uniqueness constraint: an active record already holds the slot.
    #[error("slot already taken by record {}", .0.record_id)]
    SlotTaken(Box<ReservationOccurrence>),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    ActiveOnly,
    /// Include cancelled records (history/audit).
    IncludeCancelled,
}

impl StatusFilter {
    pub fn admits(&self, status: OccurrenceStatus) -> bool {
        match self {
            StatusFilter::ActiveOnly => status == OccurrenceStatus::Active,
            StatusFilter::IncludeCancelled => true,
        }
    }
}

/// Narrow read/query/write interface to the external record store.
///
/// Implementations hold no reservation state between calls; every engine
/// decision re-reads through this trait.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records in `room` whose span overlaps `range`.
    async fn query_by_room_and_range(
        &self,
        room: &RoomId,
        range: &Span,
        filter: StatusFilter,
    ) -> Result<Vec<ReservationOccurrence>, StoreError>;

    /// Every record (any status) carrying `group_id`.
    async fn query_by_group(&self, group_id: GroupId) -> Result<Vec<ReservationOccurrence>, StoreError>;

    async fn create(&self, booking: &Booking) -> Result<RecordId, StoreError>;

    async fn update(&self, id: &RecordId, booking: &Booking) -> Result<(), StoreError>;

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError>;
}

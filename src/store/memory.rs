use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{RecordStore, StatusFilter, StoreError};

/// All records of one room, sorted by `span.start`.
#[derive(Debug, Default)]
struct RoomRecords {
    records: Vec<ReservationOccurrence>,
}

impl RoomRecords {
    fn insert(&mut self, occ: ReservationOccurrence) {
        let pos = self
            .records
            .binary_search_by_key(&occ.span().start, |r| r.span().start)
            .unwrap_or_else(|e| e);
        self.records.insert(pos, occ);
    }

    fn remove(&mut self, id: &RecordId) -> Option<ReservationOccurrence> {
        let pos = self.records.iter().position(|r| &r.record_id == id)?;
        Some(self.records.remove(pos))
    }

    /// Records overlapping `query`. Binary search skips everything starting at
    /// or after `query.end`.
    fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationOccurrence> {
        let right_bound = self.records.partition_point(|r| r.span().start < query.end);
        self.records[..right_bound]
            .iter()
            .filter(move |r| r.span().end > query.start)
    }

    /// First active record of another group overlapping `span`.
    fn slot_holder(&self, span: &Span, group_id: GroupId, except: Option<&RecordId>) -> Option<&ReservationOccurrence> {
        self.overlapping(span).find(|r| {
            r.is_active() && r.booking.group_id != group_id && Some(&r.record_id) != except
        })
    }
}

/// Gateway operations, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Query,
    QueryGroup,
    Create,
    Update,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    skip: usize,
    times: usize,
    error: StoreError,
    /// Fires after the write is applied, like a response lost in transit.
    after_write: bool,
}

/// Process-local record store.
///
/// Serves development deployments and tests. Enforces the room/slot
/// uniqueness constraint atomically under the room's write lock, and can
/// inject faults into specific operations.
pub struct InMemoryStore {
    rooms: DashMap<RoomId, Arc<RwLock<RoomRecords>>>,
    /// Reverse lookup: record id → room.
    record_to_room: DashMap<RecordId, RoomId>,
    /// Group → member record ids.
    groups: DashMap<GroupId, Vec<RecordId>>,
    enforce_unique_slots: bool,
    faults: Mutex<Vec<Fault>>,
    mutations: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            record_to_room: DashMap::new(),
            groups: DashMap::new(),
            enforce_unique_slots: true,
            faults: Mutex::new(Vec::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// A store without the write-time slot constraint, like a plain document store.
    pub fn without_slot_constraint() -> Self {
        Self {
            enforce_unique_slots: false,
            ..Self::new()
        }
    }

    /// Fail the call to `op` that follows `successes` successful ones.
    pub fn fail_after(&self, op: StoreOp, successes: usize, error: StoreError) {
        self.push_fault(Fault {
            op,
            skip: successes,
            times: 1,
            error,
            after_write: false,
        });
    }

    /// Fail the next `times` calls to `op`.
    pub fn fail_times(&self, op: StoreOp, times: usize, error: StoreError) {
        self.push_fault(Fault {
            op,
            skip: 0,
            times,
            error,
            after_write: false,
        });
    }

    /// Apply the next `times` writes to `op`, then report `error` instead of
    /// the result.
    pub fn fail_after_write(&self, op: StoreOp, times: usize, error: StoreError) {
        self.push_fault(Fault {
            op,
            skip: 0,
            times,
            error,
            after_write: true,
        });
    }

    /// Successful creates, updates and deletes so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        self.record_to_room.len()
    }

    fn push_fault(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault);
    }

    fn check_fault(&self, op: StoreOp) -> Result<(), StoreError> {
        self.take_fault(op, false)
    }

    fn check_ack(&self, op: StoreOp) -> Result<(), StoreError> {
        self.take_fault(op, true)
    }

    fn take_fault(&self, op: StoreOp, after_write: bool) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = faults
            .iter()
            .position(|f| f.op == op && f.after_write == after_write)
        else {
            return Ok(());
        };
        let fault = &mut faults[pos];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.times -= 1;
        let error = fault.error.clone();
        if fault.times == 0 {
            faults.remove(pos);
        }
        Err(error)
    }

    fn room(&self, id: &RoomId) -> Arc<RwLock<RoomRecords>> {
        self.rooms.entry(id.clone()).or_default().value().clone()
    }

    fn existing_room(&self, id: &RoomId) -> Option<Arc<RwLock<RoomRecords>>> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn query_by_room_and_range(
        &self,
        room: &RoomId,
        range: &Span,
        filter: StatusFilter,
    ) -> Result<Vec<ReservationOccurrence>, StoreError> {
        self.check_fault(StoreOp::Query)?;
        let Some(records) = self.existing_room(room) else {
            return Ok(Vec::new());
        };
        let guard = records.read().await;
        Ok(guard
            .overlapping(range)
            .filter(|r| filter.admits(r.booking.status))
            .cloned()
            .collect())
    }

    async fn query_by_group(&self, group_id: GroupId) -> Result<Vec<ReservationOccurrence>, StoreError> {
        self.check_fault(StoreOp::QueryGroup)?;
        let ids = self
            .groups
            .get(&group_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(room_id) = self.record_to_room.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let Some(room) = self.existing_room(&room_id) else {
                continue;
            };
            let guard = room.read().await;
            if let Some(r) = guard.records.iter().find(|r| r.record_id == id) {
                out.push(r.clone());
            }
        }
        Ok(out)
    }

    async fn create(&self, booking: &Booking) -> Result<RecordId, StoreError> {
        self.check_fault(StoreOp::Create)?;
        let room = self.room(&booking.room);
        let mut guard = room.write().await;

        if self.enforce_unique_slots
            && booking.is_active()
            && let Some(holder) = guard.slot_holder(&booking.span, booking.group_id, None)
        {
            return Err(StoreError::SlotTaken(Box::new(holder.clone())));
        }

        let record_id = RecordId::new(format!("rec_{}", Ulid::new()));
        guard.insert(ReservationOccurrence {
            record_id: record_id.clone(),
            booking: booking.clone(),
        });
        self.record_to_room.insert(record_id.clone(), booking.room.clone());
        self.groups
            .entry(booking.group_id)
            .or_default()
            .push(record_id.clone());
        self.record_mutation();
        self.check_ack(StoreOp::Create)?;
        Ok(record_id)
    }

    async fn update(&self, id: &RecordId, booking: &Booking) -> Result<(), StoreError> {
        self.check_fault(StoreOp::Update)?;
        let old_room_id = self
            .record_to_room
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let updated = ReservationOccurrence {
            record_id: id.clone(),
            booking: booking.clone(),
        };

        if old_room_id == booking.room {
            let room = self.room(&old_room_id);
            let mut guard = room.write().await;
            if self.enforce_unique_slots
                && booking.is_active()
                && let Some(holder) = guard.slot_holder(&booking.span, booking.group_id, Some(id))
            {
                return Err(StoreError::SlotTaken(Box::new(holder.clone())));
            }
            let same_group = guard
                .records
                .iter()
                .find(|r| &r.record_id == id)
                .map(|r| r.booking.group_id == booking.group_id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if !same_group {
                return Err(StoreError::Rejected("group id of a record is immutable".into()));
            }
            guard.remove(id);
            guard.insert(updated);
        } else {
            // Lock the destination first so the slot check and insert are atomic.
            let dest = self.room(&booking.room);
            let mut dest_guard = dest.write().await;
            if self.enforce_unique_slots
                && booking.is_active()
                && let Some(holder) = dest_guard.slot_holder(&booking.span, booking.group_id, Some(id))
            {
                return Err(StoreError::SlotTaken(Box::new(holder.clone())));
            }
            let src = self.room(&old_room_id);
            src.write()
                .await
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            dest_guard.insert(updated);
            self.record_to_room.insert(id.clone(), booking.room.clone());
        }
        self.record_mutation();
        self.check_ack(StoreOp::Update)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.check_fault(StoreOp::Delete)?;
        let (_, room_id) = self
            .record_to_room
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let room = self.room(&room_id);
        let removed = room.write().await.remove(id);
        if let Some(occ) = removed
            && let Some(mut members) = self.groups.get_mut(&occ.booking.group_id)
        {
            members.retain(|m| m != id);
        }
        self.record_mutation();
        self.check_ack(StoreOp::Delete)
    }
}

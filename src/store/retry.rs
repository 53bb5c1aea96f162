use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::*;
use crate::observability;

use super::{RecordStore, StatusFilter, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt + 1` (1-based `attempt`).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Gateway decorator: bounded exponential backoff on transient failures.
///
/// Permanent errors (`Rejected`, `NotFound`, `SlotTaken`) pass through on the
/// first attempt. A create that failed transiently may still have been
/// applied, so before posting again the group is searched for an identical
/// record and its id is returned instead.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: RecordStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Id of a record equal to `booking`, if an earlier attempt wrote one.
    async fn find_applied(&self, booking: &Booking) -> Result<Option<RecordId>, StoreError> {
        let members = self.inner.query_by_group(booking.group_id).await?;
        Ok(members
            .into_iter()
            .find(|r| r.booking == *booking)
            .map(|r| r.record_id))
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        let result = loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(op, attempt, ?delay, error = %e, "retrying store call");
                    metrics::counter!(observability::STORE_RETRIES_TOTAL, "op" => op).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_transient() => {
                warn!(op, attempts = attempt, error = %e, "store unavailable, giving up");
                "unavailable"
            }
            Err(StoreError::Rejected(_)) => "rejected",
            Err(StoreError::NotFound(_)) => "not_found",
            Err(_) => "slot_taken",
        };
        metrics::counter!(observability::STORE_CALLS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::STORE_CALL_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for RetryingStore<S> {
    async fn query_by_room_and_range(
        &self,
        room: &RoomId,
        range: &Span,
        filter: StatusFilter,
    ) -> Result<Vec<ReservationOccurrence>, StoreError> {
        self.run("query", || self.inner.query_by_room_and_range(room, range, filter))
            .await
    }

    async fn query_by_group(&self, group_id: GroupId) -> Result<Vec<ReservationOccurrence>, StoreError> {
        self.run("query_group", || self.inner.query_by_group(group_id)).await
    }

    async fn create(&self, booking: &Booking) -> Result<RecordId, StoreError> {
        let retrying = &AtomicBool::new(false);
        self.run("create", move || async move {
            if retrying.swap(true, Ordering::Relaxed)
                && let Some(id) = self.find_applied(booking).await?
            {
                debug!(group_id = %booking.group_id, record_id = %id, "earlier create attempt was applied");
                return Ok(id);
            }
            self.inner.create(booking).await
        })
        .await
    }

    async fn update(&self, id: &RecordId, booking: &Booking) -> Result<(), StoreError> {
        self.run("update", || self.inner.update(id, booking)).await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.run("delete", || self.inner.delete(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;
    use crate::store::{InMemoryStore, StoreOp};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(4), Duration::from_millis(500));
        assert_eq!(p.delay_after(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mem = InMemoryStore::new();
        mem.fail_times(StoreOp::Create, 2, StoreError::Unavailable("503".into()));
        let store = RetryingStore::new(mem, fast());

        let b = booking(GroupId::new(), "room_1", span(10, 0, 11, 0));
        store.create(&b).await.unwrap();
        assert_eq!(store.inner().record_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_create_is_not_written_twice() {
        let mem = InMemoryStore::new();
        mem.fail_after_write(StoreOp::Create, 1, StoreError::Unavailable("timeout".into()));
        let store = RetryingStore::new(mem, fast());

        let b = booking(GroupId::new(), "room_1", span(10, 0, 11, 0));
        let id = store.create(&b).await.unwrap();
        let members = store.inner().query_by_group(b.group_id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].record_id, id);
        assert_eq!(store.inner().mutation_count(), 1);
    }

    #[tokio::test]
    async fn retry_after_lost_write_ignores_other_members() {
        let mem = InMemoryStore::new();
        let gid = GroupId::new();
        let sibling = mem.create(&booking(gid, "room_1", span(9, 0, 10, 0))).await.unwrap();
        mem.fail_times(StoreOp::Create, 1, StoreError::Unavailable("503".into()));
        let store = RetryingStore::new(mem, fast());

        let id = store.create(&booking(gid, "room_1", span(10, 0, 11, 0))).await.unwrap();
        assert_ne!(id, sibling);
        assert_eq!(store.inner().record_count(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mem = InMemoryStore::new();
        mem.fail_times(StoreOp::Query, 5, StoreError::Unavailable("timeout".into()));
        let store = RetryingStore::new(mem, fast());

        let err = store
            .query_by_room_and_range(&RoomId::new("room_1"), &span(9, 0, 12, 0), StatusFilter::ActiveOnly)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mem = InMemoryStore::new();
        mem.fail_times(StoreOp::Create, 1, StoreError::Rejected("bad property".into()));
        let store = RetryingStore::new(mem, fast());

        let b = booking(GroupId::new(), "room_1", span(10, 0, 11, 0));
        let err = store.create(&b).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        // The fault was consumed by the single attempt; a second call succeeds.
        store.create(&b).await.unwrap();
        assert_eq!(store.inner().record_count(), 1);
    }
}

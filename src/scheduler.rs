use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{error, info};

use crate::briefing::{BriefingSink, DeliveryError};
use crate::engine::Engine;
use crate::model::Ts;
use crate::observability;
use crate::recurrence::{local_date, resolve_local};

/// First instant strictly after `now` whose local time in `tz` is `at`.
pub fn next_fire_after(now: Ts, at: NaiveTime, tz: Tz) -> Ts {
    let mut day = local_date(now, tz);
    loop {
        let candidate = resolve_local(day.and_time(at), tz);
        if candidate > now {
            return candidate;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => return candidate,
        }
    }
}

/// Fire time after the one at `fired`. `now` only moves it forward, so a
/// wall clock that lags the timer never yields `fired` again.
pub fn following_fire(fired: Ts, now: Ts, at: NaiveTime, tz: Tz) -> Ts {
    next_fire_after(fired.max(now), at, tz)
}

/// Build and deliver the briefing for `date`. Returns the number of
/// reservations delivered.
pub async fn deliver_briefing(engine: &Engine, sink: &dyn BriefingSink, date: NaiveDate) -> Result<usize, DeliveryError> {
    let result = async {
        let briefing = engine.generate_briefing(date).await?;
        sink.deliver(&briefing).await?;
        Ok::<_, DeliveryError>(briefing.total())
    }
    .await;
    let outcome = if result.is_ok() { "delivered" } else { "failed" };
    metrics::counter!(observability::BRIEFINGS_TOTAL, "outcome" => outcome).increment(1);
    result
}

/// Background task that delivers the daily briefing at local time `at`.
/// Failures are logged and counted; the loop keeps running.
pub async fn run_briefing_scheduler(engine: Arc<Engine>, sink: Arc<dyn BriefingSink>, at: NaiveTime) {
    let tz = engine.timezone();
    let mut next = next_fire_after(Utc::now(), at, tz);
    loop {
        info!(next = %next.with_timezone(&tz), "next briefing scheduled");
        // The timer runs on the monotonic clock; wait until the wall clock agrees.
        while let Ok(remaining) = (next - Utc::now()).to_std() {
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(remaining).await;
        }

        let date = local_date(next, tz);
        match deliver_briefing(&engine, sink.as_ref(), date).await {
            Ok(n) => info!(%date, reservations = n, "briefing delivered"),
            Err(e) => error!(%date, error = %e, "briefing delivery failed"),
        }
        next = following_fire(next, Utc::now(), at, tz);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::briefing::Briefing;
    use crate::engine::BookingPolicy;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::{InMemoryStore, StoreError, StoreOp};

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn fires_later_today_or_tomorrow() {
        let tz = chrono_tz::Asia::Seoul;
        // 2024-01-15 07:00 KST
        let now = Utc.with_ymd_and_hms(2024, 1, 14, 22, 0, 0).unwrap();
        let next = next_fire_after(now, hm(8, 30), tz);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap());

        // Exactly at the fire time: next day.
        let next2 = next_fire_after(next, hm(8, 30), tz);
        assert_eq!(next2 - next, chrono::TimeDelta::days(1));
    }

    #[test]
    fn fire_time_follows_dst() {
        let tz = chrono_tz::Europe::Berlin;
        // Saturday 2024-03-30 09:00 CET; next 08:00 is Sunday in CEST.
        let now = Utc.with_ymd_and_hms(2024, 3, 30, 8, 0, 0).unwrap();
        let next = next_fire_after(now, hm(8, 0), tz);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 31, 6, 0, 0).unwrap());
    }

    #[test]
    fn lagging_wall_clock_does_not_refire() {
        let tz = chrono_tz::Asia::Seoul;
        let fired = Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap();
        let lagging = fired - chrono::TimeDelta::milliseconds(1);
        let next = following_fire(fired, lagging, hm(8, 30), tz);
        assert_eq!(next - fired, chrono::TimeDelta::days(1));
    }

    #[test]
    fn missed_days_are_skipped_not_replayed() {
        let tz = chrono_tz::Asia::Seoul;
        let fired = Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap();
        // Host suspended for three days.
        let woke = fired + chrono::TimeDelta::days(3) + chrono::TimeDelta::hours(2);
        let next = following_fire(fired, woke, hm(8, 30), tz);
        assert_eq!(next, fired + chrono::TimeDelta::days(4));
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<Briefing>>);

    #[async_trait]
    impl BriefingSink for Recording {
        async fn deliver(&self, briefing: &Briefing) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(briefing.clone());
            Ok(())
        }
    }

    fn engine() -> (Engine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let rooms = vec![Room {
            id: RoomId::new("room_1"),
            name: "Orion".into(),
            capacity: None,
        }];
        (
            Engine::new(store.clone(), rooms, BookingPolicy::default(), Arc::new(NotifyHub::new())),
            store,
        )
    }

    #[tokio::test]
    async fn delivers_to_sink() {
        let (engine, _) = engine();
        let sink = Recording::default();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let n = deliver_briefing(&engine, &sink, date).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(sink.0.lock().unwrap()[0].date, date);
    }

    #[tokio::test]
    async fn store_outage_is_reported_not_delivered() {
        let (engine, store) = engine();
        store.fail_times(StoreOp::Query, 1, StoreError::Unavailable("down".into()));
        let sink = Recording::default();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let err = deliver_briefing(&engine, &sink, date).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Engine(_)));
        assert!(sink.0.lock().unwrap().is_empty());
    }
}

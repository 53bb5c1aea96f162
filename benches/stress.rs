use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeDelta, TimeZone, Utc};

use roomkeeper::engine::{BookingPolicy, Engine, ErrorKind, ReservationRequest};
use roomkeeper::model::{Recurrence, Room, RoomId, Ts};
use roomkeeper::notify::NotifyHub;
use roomkeeper::recurrence::QueryWindow;
use roomkeeper::store::InMemoryStore;

const ROOMS: usize = 10;

fn base() -> Ts {
    Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn room_id(i: usize) -> RoomId {
    RoomId::new(format!("room_{i}"))
}

fn setup() -> Arc<Engine> {
    let rooms = (0..ROOMS)
        .map(|i| Room {
            id: room_id(i),
            name: format!("Room {i}"),
            capacity: Some(8),
        })
        .collect();
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(store, rooms, BookingPolicy::default(), Arc::new(NotifyHub::new()));
    println!("  created {ROOMS} rooms");
    Arc::new(engine)
}

fn request(room: usize, slot: i64, recurrence: Recurrence) -> ReservationRequest {
    let start = base() + TimeDelta::hours(slot);
    ReservationRequest {
        room: Some(room_id(room)),
        title: format!("bench {slot}"),
        start,
        end: start + TimeDelta::hours(1),
        recurrence,
        attendees: vec![],
        team: None,
    }
}

async fn phase1_sequential(engine: &Engine) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .create_reservation("U_seq", request(0, i as i64, Recurrence::None))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_contention(engine: Arc<Engine>) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let accepted = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    // Every task races for the same slots in room 1.
    for t in 0..n_tasks {
        let engine = engine.clone();
        let accepted = accepted.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let actor = format!("U_race_{t}");
            for j in 0..n_per_task {
                match engine.create_reservation(&actor, request(1, j, Recurrence::None)).await {
                    Ok(_) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.kind() == ErrorKind::Conflict => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected rejection: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ok = accepted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_per_task} attempts = {total} total in {:.2}s: {ok} accepted, {} conflicts",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(ok, n_per_task as usize, "each slot must be won exactly once");
}

async fn phase3_read_under_load(engine: Arc<Engine>) {
    // Pre-fill
    for room in 2..ROOMS {
        for i in 0..100 {
            engine
                .create_reservation("U_fill", request(room, i * 2, Recurrence::None))
                .await
                .unwrap();
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let room = 2 + (w % (ROOMS - 2));
                let _ = engine
                    .create_reservation("U_writer", request(room, 10_000 + w as i64 * 100_000 + i, Recurrence::None))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let from = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine
                    .reservations_in(QueryWindow::Days { from, days: 7 })
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("weekly listing", &mut all_latencies);
}

async fn phase4_recurring_churn(engine: &Engine) {
    let n = 500;
    let mut create = Vec::with_capacity(n);
    let mut cancel = Vec::with_capacity(n);

    for i in 0..n {
        let t = Instant::now();
        let group = engine
            .create_reservation("U_churn", request(0, 50_000 + i as i64 % 24, Recurrence::Weekly { count: 4 }))
            .await
            .unwrap();
        create.push(t.elapsed());

        let t = Instant::now();
        engine.cancel_reservation("U_churn", group.id).await.unwrap();
        cancel.push(t.elapsed());
    }

    print_latency("weekly x4 create", &mut create);
    print_latency("group cancel", &mut cancel);
}

#[tokio::main]
async fn main() {
    println!("=== roomkeeper stress benchmark ===");
    println!("store: in-memory\n");

    println!("[setup]");
    let engine = setup();

    println!("\n[phase 1] sequential create throughput");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] concurrent creates on contended slots");
    phase2_contention(engine.clone()).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(engine.clone()).await;

    println!("\n[phase 4] recurring create/cancel churn");
    phase4_recurring_churn(&engine).await;

    println!("\n=== benchmark complete ===");
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use npr_relay::buffer::BufferResult;
use npr_relay::{
    BufferCounts, BufferError, BufferRecord, BufferStore, Cancellation, ConnectivityProbe,
    DedupEngine, DeliveryError, DeliveryOutcome, DeliveryWorker, DurableBuffer, Event,
    InMemoryBufferStore, ReconcileOutcome, ReconcileReport, ReconcileState, Reconciler,
    RecordHandle, Relay, Retention, SinkConnector, SkipReason,
};

const QUEUE_CAPACITY: usize = 4;

#[derive(Default)]
struct ToggleProbe(AtomicBool);

impl ToggleProbe {
    fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for ToggleProbe {
    fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Records delivered events; plates listed in `failing` are rejected.
#[derive(Default)]
struct RecordingSink {
    attempts: AtomicUsize,
    delivered: Mutex<Vec<Event>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
}

impl RecordingSink {
    fn fail_plate(&self, plate: &str) {
        self.failing.lock().unwrap().insert(plate.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn plates(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.plate_number.clone().unwrap_or_default())
            .collect()
    }
}

impl SinkConnector for RecordingSink {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let plate = event.plate_number.clone().unwrap_or_default();
        if self.failing.lock().unwrap().contains(&plate) {
            return Err(DeliveryError::Rejected(format!("constraint violation for {plate}")));
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// In-memory store whose writes can be made to fail like a full or broken disk.
#[derive(Default)]
struct FailingStore {
    inner: InMemoryBufferStore,
    fail_append: bool,
    fail_mark_pending: bool,
}

fn disk_error() -> BufferError {
    BufferError::Store(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
        Some("disk I/O error".to_string()),
    ))
}

impl BufferStore for FailingStore {
    fn append(&mut self, event: &Event, pending: bool) -> BufferResult<RecordHandle> {
        if self.fail_append {
            return Err(disk_error());
        }
        self.inner.append(event, pending)
    }

    fn scan(&mut self) -> BufferResult<Vec<(RecordHandle, BufferRecord)>> {
        self.inner.scan()
    }

    fn remove(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        self.inner.remove(handle)
    }

    fn mark_pending(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        if self.fail_mark_pending {
            return Err(disk_error());
        }
        self.inner.mark_pending(handle)
    }

    fn truncate_all(&mut self) -> BufferResult<usize> {
        self.inner.truncate_all()
    }

    fn counts(&mut self) -> BufferResult<BufferCounts> {
        self.inner.counts()
    }
}

struct Harness {
    buffer: Arc<DurableBuffer>,
    probe: Arc<ToggleProbe>,
    sink: Arc<RecordingSink>,
    relay: Relay,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(InMemoryBufferStore::default())
    }

    fn with_store(store: impl BufferStore + 'static) -> Self {
        let buffer = Arc::new(DurableBuffer::new(store));
        let probe = Arc::new(ToggleProbe::default());
        probe.set(true);
        let sink = Arc::new(RecordingSink::default());
        let delivery = Arc::new(
            DeliveryWorker::spawn(sink.clone(), QUEUE_CAPACITY).expect("spawn delivery worker"),
        );
        let relay = Relay::new(
            buffer.clone(),
            DedupEngine::default(),
            probe.clone(),
            delivery.clone(),
        )
        .with_delivery_timeout(Duration::from_millis(200));
        let reconciler = Reconciler::new(buffer.clone(), probe.clone(), delivery)
            .with_delivery_timeout(Duration::from_millis(200));
        Self {
            buffer,
            probe,
            sink,
            relay,
            reconciler,
        }
    }

    fn send(&self, serial: &str, plate: &str) -> DeliveryOutcome {
        self.relay
            .on_event(Event::new(serial, Some(plate)))
            .expect("buffer append")
    }

    fn pending_plates(&self) -> Vec<String> {
        self.buffer
            .scan()
            .unwrap()
            .into_iter()
            .filter(|(_, r)| r.pending_delivery)
            .map(|(_, r)| r.event.plate_number.unwrap_or_default())
            .collect()
    }

    fn reconcile(&self) -> ReconcileOutcome {
        self.reconciler.run_once(&Cancellation::new()).unwrap()
    }
}

#[test]
fn end_to_end_scenario() {
    let h = Harness::new();

    assert_eq!(h.send("S1", "ABC123"), DeliveryOutcome::Delivered);
    assert_eq!(
        h.send("S1", "ABC123"),
        DeliveryOutcome::Skipped(SkipReason::SameSourceDuplicate)
    );
    assert_eq!(
        h.send("S2", "ABC123"),
        DeliveryOutcome::Skipped(SkipReason::CrossSourceDuplicate)
    );

    h.probe.set(false);
    assert_eq!(h.send("S1", "XYZ999"), DeliveryOutcome::Buffered);
    assert_eq!(h.relay.dedup().history("S1"), vec!["ABC123".to_string()]);
    assert_eq!(h.pending_plates(), vec!["XYZ999".to_string()]);
    assert_eq!(h.buffer.scan().unwrap().len(), 4);

    h.probe.set(true);
    let outcome = h.reconcile();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed(ReconcileReport {
            scanned: 1,
            delivered: 1,
            failed: 0,
            deferred: 0,
        })
    );
    assert_eq!(h.sink.plates(), vec!["ABC123", "XYZ999"]);
    assert!(h.pending_plates().is_empty());
    // Audit records of the live-path events stay until retention.
    assert_eq!(h.buffer.scan().unwrap().len(), 3);
    // Replay bypasses dedup history.
    assert_eq!(h.relay.dedup().history("S1"), vec!["ABC123".to_string()]);
}

#[test]
fn outage_buffers_everything_without_touching_sink_or_history() {
    let h = Harness::new();
    h.probe.set(false);
    for (serial, plate) in [("S1", "AAA111"), ("S1", "AAA111"), ("S2", "unknown")] {
        assert_eq!(h.send(serial, plate), DeliveryOutcome::Buffered);
    }
    assert!(h.sink.plates().is_empty());
    assert!(h.relay.dedup().history("S1").is_empty());
    assert_eq!(h.pending_plates(), vec!["AAA111", "AAA111", "unknown"]);
}

#[test]
fn invalid_plate_is_buffered_for_audit_only() {
    let h = Harness::new();
    let outcome = h.relay.on_event(Event::new("S1", None)).unwrap();
    assert_eq!(outcome, DeliveryOutcome::Skipped(SkipReason::InvalidPlate));
    let records = h.buffer.scan().unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].1.pending_delivery);
    assert!(h.sink.plates().is_empty());
}

#[test]
fn reconciliation_replays_in_order_and_keeps_failures_pending() {
    let h = Harness::new();
    h.probe.set(false);
    for plate in ["P1AAA", "P2BBB", "P3CCC", "P4DDD"] {
        h.send("S1", plate);
    }

    h.probe.set(true);
    h.sink.fail_plate("P2BBB");
    let outcome = h.reconcile();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed(ReconcileReport {
            scanned: 4,
            delivered: 3,
            failed: 1,
            deferred: 0,
        })
    );
    assert_eq!(h.sink.plates(), vec!["P1AAA", "P3CCC", "P4DDD"]);
    assert_eq!(h.pending_plates(), vec!["P2BBB"]);

    h.sink.heal();
    h.reconcile();
    assert_eq!(h.sink.plates(), vec!["P1AAA", "P3CCC", "P4DDD", "P2BBB"]);
    assert!(h.buffer.scan().unwrap().is_empty());
}

#[test]
fn reconciliation_waits_for_connectivity() {
    let h = Harness::new();
    h.probe.set(false);
    h.send("S1", "AAA111");
    assert_eq!(h.reconcile(), ReconcileOutcome::Unreachable);
    assert_eq!(h.pending_plates(), vec!["AAA111"]);
    assert!(h.sink.plates().is_empty());
}

#[test]
fn cancelled_reconciliation_defers_remaining_records() {
    let h = Harness::new();
    h.probe.set(false);
    h.send("S1", "AAA111");
    h.send("S1", "BBB222");
    h.probe.set(true);

    let cancel = Cancellation::new();
    cancel.cancel();
    let outcome = h.reconciler.run_once(&cancel).unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed(ReconcileReport {
            scanned: 2,
            delivered: 0,
            failed: 0,
            deferred: 2,
        })
    );
    assert_eq!(h.pending_plates(), vec!["AAA111", "BBB222"]);
}

#[test]
fn live_failure_falls_back_to_pending_and_releases_plate() {
    let h = Harness::new();
    h.sink.fail_plate("ABC123");
    assert_eq!(h.send("S1", "ABC123"), DeliveryOutcome::Buffered);
    assert_eq!(h.pending_plates(), vec!["ABC123"]);
    assert!(h.relay.dedup().history("S1").is_empty());

    h.sink.heal();
    assert_eq!(h.send("S2", "ABC123"), DeliveryOutcome::Delivered);
}

#[test]
fn slow_sink_times_out_to_buffer() {
    let h = Harness::new();
    h.sink.set_delay(Duration::from_secs(1));
    assert_eq!(h.send("S1", "SLOW01"), DeliveryOutcome::Buffered);
    assert_eq!(h.pending_plates(), vec!["SLOW01"]);
}

#[test]
fn overlapping_reconciliation_is_skipped() {
    let h = Arc::new(Harness::new());
    h.probe.set(false);
    h.send("S1", "AAA111");
    h.probe.set(true);
    h.sink.set_delay(Duration::from_millis(150));

    let barrier = Arc::new(Barrier::new(2));
    let first = {
        let h = h.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            barrier.wait();
            h.reconcile()
        })
    };
    barrier.wait();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while h.reconciler.state() != ReconcileState::Running && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert_eq!(h.reconcile(), ReconcileOutcome::Overlapping);
    assert!(matches!(first.join().unwrap(), ReconcileOutcome::Completed(_)));
    assert_eq!(h.reconciler.state(), ReconcileState::Idle);
}

#[test]
fn retention_clears_pending_records_and_later_appends_survive() {
    let h = Harness::new();
    h.probe.set(false);
    h.send("S1", "AAA111");
    h.send("S1", "BBB222");

    let retention = Retention::new(h.buffer.clone());
    assert_eq!(retention.run_once().unwrap(), 2);
    assert_eq!(retention.run_once().unwrap(), 0);

    h.send("S1", "CCC333");
    h.probe.set(true);
    h.reconcile();
    assert_eq!(h.sink.plates(), vec!["CCC333"]);
}

#[test]
fn concurrent_intake_delivers_each_plate_once() {
    let h = Arc::new(Harness::new());
    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let h = h.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                h.send(&format!("S{}", i % 3), "DUP001")
            })
        })
        .collect();
    let delivered = handles
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|o| *o == DeliveryOutcome::Delivered)
        .count();
    assert_eq!(delivered, 1);
    assert_eq!(h.sink.plates(), vec!["DUP001"]);
    assert_eq!(h.buffer.scan().unwrap().len(), 6);
}

#[test]
fn hung_sink_does_not_pile_up_deliveries() {
    let h = Harness::new();
    h.sink.set_delay(Duration::from_secs(2));
    let plates: Vec<String> = (0..20).map(|i| format!("HUNG{:02}", i)).collect();
    for plate in &plates {
        assert_eq!(h.send("S1", plate), DeliveryOutcome::Buffered);
    }
    // Only the first delivery ever reached the sink; the rest queued or were refused.
    assert_eq!(h.sink.attempts(), 1);
    assert_eq!(h.pending_plates(), plates);
}

#[test]
fn append_failure_is_reported_and_nothing_is_delivered() {
    let h = Harness::with_store(FailingStore {
        fail_append: true,
        ..FailingStore::default()
    });
    let result = h.relay.on_event(Event::new("S1", Some("ABC123")));
    assert!(matches!(result, Err(BufferError::Store(_))));
    assert_eq!(h.sink.attempts(), 0);
    assert!(h.relay.dedup().history("S1").is_empty());
}

#[test]
fn mark_pending_failure_after_failed_delivery_is_reported() {
    let h = Harness::with_store(FailingStore {
        fail_mark_pending: true,
        ..FailingStore::default()
    });
    h.sink.fail_plate("ABC123");
    let result = h.relay.on_event(Event::new("S1", Some("ABC123")));
    assert!(matches!(result, Err(BufferError::Store(_))));

    let records = h.buffer.scan().unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].1.pending_delivery);

    h.sink.heal();
    assert_eq!(h.send("S2", "ABC123"), DeliveryOutcome::Delivered);
}

#[test]
fn retention_waits_for_running_reconciliation() {
    let h = Arc::new(Harness::new());
    assert_eq!(h.send("S1", "AUDIT1"), DeliveryOutcome::Delivered);
    h.probe.set(false);
    h.send("S1", "AAA111");
    h.send("S1", "BBB222");
    h.probe.set(true);
    h.sink.set_delay(Duration::from_millis(100));

    let run = {
        let h = h.clone();
        std::thread::spawn(move || h.reconcile())
    };
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while h.sink.attempts() < 2 && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert!(h.sink.attempts() >= 2, "reconciliation never reached the sink");

    let removed = Retention::new(h.buffer.clone()).run_once().unwrap();
    let outcome = run.join().unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Completed(ReconcileReport {
            scanned: 2,
            delivered: 2,
            failed: 0,
            deferred: 0,
        })
    );
    // Truncation ran after both replays had removed their records.
    assert_eq!(removed, 1);
    assert!(h.buffer.scan().unwrap().is_empty());

    h.sink.set_delay(Duration::ZERO);
    assert_eq!(
        h.reconcile(),
        ReconcileOutcome::Completed(ReconcileReport::default())
    );
    assert_eq!(h.sink.plates(), vec!["AUDIT1", "AAA111", "BBB222"]);
}

//! Replays pending buffered records to the sink once it is reachable again.
//!
//! Records are replayed in append order, each independently: a failure
//! leaves that record pending and the scan moves on. Replayed records bypass
//! plate validation and deduplication.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::DurableBuffer;
use crate::connectivity::ConnectivityProbe;
use crate::error::BufferError;
use crate::scheduler::Cancellation;
use crate::sink::DeliveryWorker;

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_RUN: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ReconcileState {
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending records seen by the scan.
    pub scanned: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Left for the next run because of the run deadline or cancellation.
    pub deferred: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    /// Another run was still in progress.
    Overlapping,
    Unreachable,
}

pub struct Reconciler {
    buffer: Arc<DurableBuffer>,
    probe: Arc<dyn ConnectivityProbe>,
    delivery: Arc<DeliveryWorker>,
    max_run: Duration,
    delivery_timeout: Duration,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        buffer: Arc<DurableBuffer>,
        probe: Arc<dyn ConnectivityProbe>,
        delivery: Arc<DeliveryWorker>,
    ) -> Self {
        Self {
            buffer,
            probe,
            delivery,
            max_run: DEFAULT_MAX_RUN,
            delivery_timeout: crate::relay::DEFAULT_DELIVERY_TIMEOUT,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_max_run(mut self, max_run: Duration) -> Self {
        self.max_run = max_run;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn state(&self) -> ReconcileState {
        if self.running.load(Ordering::SeqCst) {
            ReconcileState::Running
        } else {
            ReconcileState::Idle
        }
    }

    pub fn run_once(&self, cancel: &Cancellation) -> Result<ReconcileOutcome, BufferError> {
        let Some(_run) = RunGuard::enter(&self.running) else {
            log::warn!("reconciliation still running; skipping this tick");
            return Ok(ReconcileOutcome::Overlapping);
        };

        if !self.probe.is_reachable() {
            log::debug!("reconciliation skipped: sink unreachable");
            return Ok(ReconcileOutcome::Unreachable);
        }

        let _maintenance = self.buffer.maintenance();
        let started = Instant::now();
        let pending: Vec<_> = self
            .buffer
            .scan()?
            .into_iter()
            .filter(|(_, record)| record.pending_delivery)
            .collect();

        let mut report = ReconcileReport {
            scanned: pending.len(),
            ..ReconcileReport::default()
        };

        for (idx, (handle, record)) in pending.iter().enumerate() {
            if cancel.is_cancelled() || started.elapsed() >= self.max_run {
                report.deferred = pending.len() - idx;
                log::warn!(
                    "reconciliation stopped early ({}); {} records deferred",
                    if cancel.is_cancelled() { "cancelled" } else { "run deadline" },
                    report.deferred
                );
                break;
            }

            match self.delivery.deliver_within(&record.event, self.delivery_timeout) {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(e) = self.buffer.remove(*handle) {
                        log::error!(
                            "record {} delivered but not removed: {}; it will be replayed",
                            handle.0,
                            e
                        );
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "replay of record {} (sn={}) failed: {}",
                        handle.0,
                        record.event.source_serial,
                        e
                    );
                }
            }
        }

        log::info!(
            "reconciliation done: scanned={} delivered={} failed={} deferred={}",
            report.scanned,
            report.delivered,
            report.failed,
            report.deferred
        );
        Ok(ReconcileOutcome::Completed(report))
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

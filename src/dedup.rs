//! Plate deduplication.
//!
//! Each device serial keeps its last [`HISTORY_DEPTH`] delivered plates,
//! oldest first. A plate is suppressed when it appears in the history of the
//! same device or of any other device. History lives in memory only and
//! starts empty after a restart.
//!
//! The live path uses [`DedupEngine::reserve`], which checks and marks the
//! plate as in flight under one lock acquisition. A concurrent duplicate sees
//! the reservation and is skipped. The reservation turns into history on
//! [`Reservation::commit`] and disappears if dropped uncommitted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::event::{Event, SkipReason};
use crate::plate::PlatePolicy;

pub const HISTORY_DEPTH: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    SkipInvalidPlate,
    SkipSameSourceDuplicate,
    SkipCrossSourceDuplicate,
}

impl Verdict {
    pub fn skip_reason(self) -> Option<SkipReason> {
        match self {
            Verdict::Admit => None,
            Verdict::SkipInvalidPlate => Some(SkipReason::InvalidPlate),
            Verdict::SkipSameSourceDuplicate => Some(SkipReason::SameSourceDuplicate),
            Verdict::SkipCrossSourceDuplicate => Some(SkipReason::CrossSourceDuplicate),
        }
    }
}

#[derive(Debug, Default)]
struct DedupState {
    history: HashMap<String, VecDeque<String>>,
    /// plate -> serial of the delivery currently holding it
    in_flight: HashMap<String, String>,
}

impl DedupState {
    fn verdict(&self, policy: &PlatePolicy, serial: &str, plate: Option<&str>) -> Verdict {
        let Some(plate) = plate.filter(|p| policy.is_valid(p)) else {
            return Verdict::SkipInvalidPlate;
        };

        let own_history = self
            .history
            .get(serial)
            .is_some_and(|h| h.iter().any(|p| p == plate));
        let own_in_flight = self.in_flight.get(plate).is_some_and(|s| s == serial);
        if own_history || own_in_flight {
            return Verdict::SkipSameSourceDuplicate;
        }

        let other_history = self
            .history
            .iter()
            .any(|(other, h)| other != serial && h.iter().any(|p| p == plate));
        if other_history || self.in_flight.contains_key(plate) {
            return Verdict::SkipCrossSourceDuplicate;
        }

        Verdict::Admit
    }

    fn record(&mut self, serial: &str, plate: &str) {
        let history = self.history.entry(serial.to_string()).or_default();
        history.push_back(plate.to_string());
        while history.len() > HISTORY_DEPTH {
            history.pop_front();
        }
    }
}

#[derive(Debug, Default)]
pub struct DedupEngine {
    policy: PlatePolicy,
    state: Mutex<DedupState>,
}

impl DedupEngine {
    pub fn new(policy: PlatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(DedupState::default()),
        }
    }

    /// Decide whether `event` should be delivered, without changing any state.
    pub fn admit(&self, event: &Event) -> Verdict {
        self.lock()
            .verdict(&self.policy, &event.source_serial, event.plate_number.as_deref())
    }

    /// Append a successfully delivered plate to the device history.
    pub fn record_accepted(&self, serial: &str, plate: &str) {
        self.lock().record(serial, plate);
    }

    /// Atomically decide and, on admit, hold the plate until the delivery settles.
    pub fn reserve(&self, event: &Event) -> Result<Reservation<'_>, SkipReason> {
        let mut state = self.lock();
        let verdict = state.verdict(
            &self.policy,
            &event.source_serial,
            event.plate_number.as_deref(),
        );
        if let Some(reason) = verdict.skip_reason() {
            return Err(reason);
        }
        // Admit implies a valid plate.
        let plate = event.plate_number.clone().unwrap_or_default();
        state
            .in_flight
            .insert(plate.clone(), event.source_serial.clone());
        Ok(Reservation {
            engine: self,
            serial: event.source_serial.clone(),
            plate,
            settled: false,
        })
    }

    /// Snapshot of one device's history, oldest first.
    pub fn history(&self, serial: &str) -> Vec<String> {
        self.lock()
            .history
            .get(serial)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        // History is rebuildable; recover from poisoning.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A plate held by one in-flight live delivery.
#[derive(Debug)]
pub struct Reservation<'a> {
    engine: &'a DedupEngine,
    serial: String,
    plate: String,
    settled: bool,
}

impl Reservation<'_> {
    pub fn plate(&self) -> &str {
        &self.plate
    }

    /// The delivery succeeded: move the plate into the device history.
    pub fn commit(mut self) {
        let mut state = self.engine.lock();
        state.in_flight.remove(&self.plate);
        state.record(&self.serial, &self.plate);
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.engine.lock().in_flight.remove(&self.plate);
        }
    }
}

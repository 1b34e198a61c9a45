use std::sync::Arc;
use std::time::Duration;

use crate::buffer::DurableBuffer;
use crate::connectivity::ConnectivityProbe;
use crate::dedup::DedupEngine;
use crate::error::BufferError;
use crate::event::{DeliveryOutcome, Event};
use crate::sink::DeliveryWorker;

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Live intake path shared by every request handler.
pub struct Relay {
    buffer: Arc<DurableBuffer>,
    dedup: DedupEngine,
    probe: Arc<dyn ConnectivityProbe>,
    delivery: Arc<DeliveryWorker>,
    delivery_timeout: Duration,
}

impl Relay {
    pub fn new(
        buffer: Arc<DurableBuffer>,
        dedup: DedupEngine,
        probe: Arc<dyn ConnectivityProbe>,
        delivery: Arc<DeliveryWorker>,
    ) -> Self {
        Self {
            buffer,
            dedup,
            probe,
            delivery,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn buffer(&self) -> &Arc<DurableBuffer> {
        &self.buffer
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    /// Record `event` and deliver it if the sink is reachable and the plate is new.
    ///
    /// Only a buffer failure is reported as an error and the caller must not
    /// acknowledge the event. A failed append leaves nothing recorded. A failed
    /// `mark_pending` after a failed delivery leaves the record in the buffer
    /// as non-pending, so reconciliation will not replay it.
    pub fn on_event(&self, event: Event) -> Result<DeliveryOutcome, BufferError> {
        let reachable = self.probe.is_reachable();
        let handle = self.buffer.append(&event, !reachable).map_err(|e| {
            log::error!("buffer append failed for sn={}: {}", event.source_serial, e);
            e
        })?;

        if !reachable {
            log::info!(
                "sink unreachable; buffered sn={} plate={:?}",
                event.source_serial,
                event.plate_number
            );
            return Ok(DeliveryOutcome::Buffered);
        }

        let reservation = match self.dedup.reserve(&event) {
            Ok(reservation) => reservation,
            Err(reason) => {
                log::debug!(
                    "skipping sn={} plate={:?}: {}",
                    event.source_serial,
                    event.plate_number,
                    reason
                );
                return Ok(DeliveryOutcome::Skipped(reason));
            }
        };

        match self.delivery.deliver_within(&event, self.delivery_timeout) {
            Ok(()) => {
                reservation.commit();
                log::info!(
                    "delivered sn={} plate={}",
                    event.source_serial,
                    event.plate_number.as_deref().unwrap_or_default()
                );
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) => {
                drop(reservation);
                log::warn!(
                    "live delivery failed for sn={} plate={:?}: {}; deferring to reconciliation",
                    event.source_serial,
                    event.plate_number,
                    e
                );
                self.buffer.mark_pending(handle).map_err(|e| {
                    log::error!(
                        "record {} (sn={}) could not be marked pending: {}; it will not be replayed",
                        handle.0,
                        event.source_serial,
                        e
                    );
                    e
                })?;
                Ok(DeliveryOutcome::Buffered)
            }
        }
    }
}

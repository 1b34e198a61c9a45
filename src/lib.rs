//! NPR relay
//!
//! Relays license-plate detections from network cameras to a relational sink
//! without losing or duplicating data across sink outages.
//!
//! # Flow
//!
//! 1. Every detection is appended to the durable buffer before anything else.
//! 2. If the sink is unreachable the record is left pending.
//! 3. Otherwise the plate is checked against the recent history of every
//!    device and, if new, delivered; history records only successful deliveries.
//! 4. A periodic reconciliation job replays pending records in arrival order.
//! 5. A daily retention job truncates the buffer.
//!
//! # Module Structure
//!
//! - `event`: detection and buffer record types, delivery outcomes
//! - `dedup`, `plate`: duplicate suppression and plate format policy
//! - `buffer`: durable local log (`SqliteBufferStore`, `InMemoryBufferStore`)
//! - `connectivity`, `sink`: reachability probe and sink connector
//! - `relay`, `reconcile`, `retention`, `scheduler`: live path and background jobs
//! - `intake`, `config`: HTTP/XML adapter and configuration loading

pub mod buffer;
pub mod config;
pub mod connectivity;
pub mod dedup;
pub mod error;
pub mod event;
pub mod intake;
pub mod plate;
pub mod reconcile;
pub mod relay;
pub mod retention;
pub mod scheduler;
pub mod sink;

pub use buffer::{BufferCounts, BufferStore, DurableBuffer, InMemoryBufferStore, SqliteBufferStore};
pub use connectivity::{AlwaysReachable, ConnectivityProbe, TcpProbe};
pub use dedup::{DedupEngine, Reservation, Verdict, HISTORY_DEPTH};
pub use error::{BufferError, DecodeError, DeliveryError};
pub use event::{BufferRecord, DeliveryOutcome, Event, RecordHandle, SkipReason};
pub use plate::PlatePolicy;
pub use reconcile::{ReconcileOutcome, ReconcileReport, ReconcileState, Reconciler};
pub use relay::Relay;
pub use retention::Retention;
pub use scheduler::{Cancellation, PeriodicTask, Schedule};
pub use sink::{DeliveryWorker, SinkConnector, SqliteSink};

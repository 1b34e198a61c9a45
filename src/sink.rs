//! Sink connector: the durable store of record for delivered detections.
//!
//! The relay owns no retry logic at this layer. A failed delivery is reported
//! once; the reconciliation job decides when to try again.

use rusqlite::{params, Connection};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::DeliveryError;
use crate::event::Event;

pub const DEFAULT_SINK_TABLE: &str = "npr_data";

pub trait SinkConnector: Send + Sync {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Insert-only relational sink. No uniqueness is enforced at this layer.
pub struct SqliteSink {
    conn: Mutex<Connection>,
    insert_sql: String,
}

impl SqliteSink {
    pub fn open(db_path: &str, table: &str) -> Result<Self, DeliveryError> {
        if !is_plain_identifier(table) {
            return Err(DeliveryError::Rejected(format!(
                "sink table name {:?} is not a plain identifier",
                table
            )));
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS {table} (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              mac TEXT,
              sn TEXT,
              device_name TEXT,
              plate_number TEXT,
              target_type TEXT,
              delivered_at INTEGER NOT NULL
            );
            "#,
        ))?;
        let insert_sql = format!(
            "INSERT INTO {table} (mac, sn, device_name, plate_number, target_type, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s','now'))"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            insert_sql,
        })
    }
}

impl SinkConnector for SqliteSink {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DeliveryError::Rejected("sink connection lock poisoned".to_string()))?;
        conn.execute(
            &self.insert_sql,
            params![
                event.source_mac,
                event.source_serial,
                event.device_name,
                event.plate_number,
                event.target_type
            ],
        )?;
        Ok(())
    }
}

pub const DEFAULT_DELIVERY_QUEUE: usize = 16;

struct DeliveryJob {
    event: Event,
    deadline: Instant,
    reply: mpsc::Sender<Result<(), DeliveryError>>,
}

/// One long-lived thread that owns every call into a sink.
///
/// Callers wait at most `timeout` for a result. A hung sink holds only the
/// worker thread; once `capacity` jobs are queued behind it, further
/// deliveries fail immediately with [`DeliveryError::QueueFull`]. Jobs whose
/// caller already gave up are dropped unsent. A delivery that times out
/// while running may still complete, so a timed-out event can reach the sink
/// twice once it is replayed.
pub struct DeliveryWorker {
    queue: mpsc::SyncSender<DeliveryJob>,
    capacity: usize,
}

impl DeliveryWorker {
    pub fn spawn(sink: Arc<dyn SinkConnector>, capacity: usize) -> std::io::Result<Self> {
        let (queue, jobs) = mpsc::sync_channel::<DeliveryJob>(capacity);
        std::thread::Builder::new()
            .name("sink-delivery".to_string())
            .spawn(move || {
                for job in jobs {
                    if Instant::now() >= job.deadline {
                        log::debug!(
                            "dropping stale delivery for sn={}",
                            job.event.source_serial
                        );
                        continue;
                    }
                    let _ = job.reply.send(sink.deliver(&job.event));
                }
                log::debug!("sink delivery worker exiting");
            })?;
        Ok(Self { queue, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliver through the worker and stop waiting after `timeout`.
    pub fn deliver_within(&self, event: &Event, timeout: Duration) -> Result<(), DeliveryError> {
        let (reply, result) = mpsc::channel();
        let deadline = Instant::now() + timeout;
        let job = DeliveryJob {
            event: event.clone(),
            deadline,
            reply,
        };
        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                return Err(DeliveryError::QueueFull(self.capacity))
            }
            Err(mpsc::TrySendError::Disconnected(_)) => return Err(DeliveryError::WorkerLost),
        }

        match result.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DeliveryError::Timeout(timeout)),
            // Dropped as stale right at the deadline.
            Err(mpsc::RecvTimeoutError::Disconnected) if Instant::now() >= deadline => {
                Err(DeliveryError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeliveryError::WorkerLost),
        }
    }
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

//! Durable local buffer of every observed detection.
//!
//! Records are kept in append order with a pending-delivery flag. Handles are
//! row ids from an AUTOINCREMENT column, so a handle removed by truncation is
//! never handed out again and a late `remove` cannot hit a newer record.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::error::BufferError;
use crate::event::{BufferRecord, Event, RecordHandle};

pub type BufferResult<T> = std::result::Result<T, BufferError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounts {
    pub total: u64,
    pub pending: u64,
}

pub trait BufferStore: Send {
    /// Durably append one record. Returns once the write is committed.
    fn append(&mut self, event: &Event, pending: bool) -> BufferResult<RecordHandle>;

    /// All records in append order.
    fn scan(&mut self) -> BufferResult<Vec<(RecordHandle, BufferRecord)>>;

    /// Delete one record. Returns false if it was already gone.
    fn remove(&mut self, handle: RecordHandle) -> BufferResult<bool>;

    /// Flag one record for reconciliation. Returns false if it was already gone.
    fn mark_pending(&mut self, handle: RecordHandle) -> BufferResult<bool>;

    /// Delete every record, pending or not. Returns the number removed.
    fn truncate_all(&mut self) -> BufferResult<usize>;

    fn counts(&mut self) -> BufferResult<BufferCounts>;
}

pub struct SqliteBufferStore {
    conn: Connection,
}

impl SqliteBufferStore {
    pub fn open(db_path: &str) -> BufferResult<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> BufferResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS buffer_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              mac TEXT,
              sn TEXT NOT NULL,
              device_name TEXT,
              plate_number TEXT,
              target_type TEXT,
              pending_delivery INTEGER NOT NULL CHECK (pending_delivery IN (0, 1))
            );

            CREATE INDEX IF NOT EXISTS idx_buffer_pending ON buffer_records(pending_delivery);
            "#,
        )?;
        Ok(())
    }
}

impl BufferStore for SqliteBufferStore {
    fn append(&mut self, event: &Event, pending: bool) -> BufferResult<RecordHandle> {
        self.conn.execute(
            r#"
            INSERT INTO buffer_records(mac, sn, device_name, plate_number, target_type, pending_delivery)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.source_mac,
                event.source_serial,
                event.device_name,
                event.plate_number,
                event.target_type,
                pending
            ],
        )?;
        Ok(RecordHandle(self.conn.last_insert_rowid()))
    }

    fn scan(&mut self) -> BufferResult<Vec<(RecordHandle, BufferRecord)>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, mac, sn, device_name, plate_number, target_type, pending_delivery
                FROM buffer_records ORDER BY id ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let event = Event {
                    source_mac: row.get(1)?,
                    source_serial: row.get(2)?,
                    device_name: row.get(3)?,
                    plate_number: row.get(4)?,
                    target_type: row.get(5)?,
                };
                let flag: i64 = row.get(6)?;
                out.push((id, event, flag));
            }
            out
        };

        rows.into_iter()
            .map(|(id, event, flag)| {
                let pending_delivery = match flag {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(BufferError::Corrupt {
                            handle: id,
                            reason: format!("pending_delivery = {}", other),
                        })
                    }
                };
                Ok((
                    RecordHandle(id),
                    BufferRecord {
                        event,
                        pending_delivery,
                    },
                ))
            })
            .collect()
    }

    fn remove(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM buffer_records WHERE id = ?1", params![handle.0])?;
        Ok(n > 0)
    }

    fn mark_pending(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        let n = self.conn.execute(
            "UPDATE buffer_records SET pending_delivery = 1 WHERE id = ?1",
            params![handle.0],
        )?;
        Ok(n > 0)
    }

    fn truncate_all(&mut self) -> BufferResult<usize> {
        Ok(self.conn.execute("DELETE FROM buffer_records", [])?)
    }

    fn counts(&mut self) -> BufferResult<BufferCounts> {
        let (total, pending): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(pending_delivery), 0) FROM buffer_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(BufferCounts {
            total: total.max(0) as u64,
            pending: pending.max(0) as u64,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryBufferStore {
    records: Vec<(RecordHandle, BufferRecord)>,
    next_id: i64,
}

impl BufferStore for InMemoryBufferStore {
    fn append(&mut self, event: &Event, pending: bool) -> BufferResult<RecordHandle> {
        self.next_id += 1;
        let handle = RecordHandle(self.next_id);
        self.records.push((
            handle,
            BufferRecord {
                event: event.clone(),
                pending_delivery: pending,
            },
        ));
        Ok(handle)
    }

    fn scan(&mut self) -> BufferResult<Vec<(RecordHandle, BufferRecord)>> {
        Ok(self.records.clone())
    }

    fn remove(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        let before = self.records.len();
        self.records.retain(|(h, _)| *h != handle);
        Ok(self.records.len() != before)
    }

    fn mark_pending(&mut self, handle: RecordHandle) -> BufferResult<bool> {
        match self.records.iter_mut().find(|(h, _)| *h == handle) {
            Some((_, record)) => {
                record.pending_delivery = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn truncate_all(&mut self) -> BufferResult<usize> {
        let n = self.records.len();
        self.records.clear();
        Ok(n)
    }

    fn counts(&mut self) -> BufferResult<BufferCounts> {
        Ok(BufferCounts {
            total: self.records.len() as u64,
            pending: self.records.iter().filter(|(_, r)| r.pending_delivery).count() as u64,
        })
    }
}

/// Shared buffer: one exclusive lock for every store operation, plus a
/// maintenance lock that reconciliation and retention hold for a whole run so
/// they never interleave. Intake only takes the store lock.
pub struct DurableBuffer {
    store: Mutex<Box<dyn BufferStore>>,
    maintenance: Mutex<()>,
}

impl DurableBuffer {
    pub fn new(store: impl BufferStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
            maintenance: Mutex::new(()),
        }
    }

    pub fn open_sqlite(db_path: &str) -> BufferResult<Self> {
        Ok(Self::new(SqliteBufferStore::open(db_path)?))
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryBufferStore::default())
    }

    pub fn append(&self, event: &Event, pending: bool) -> BufferResult<RecordHandle> {
        self.store()?.append(event, pending)
    }

    pub fn scan(&self) -> BufferResult<Vec<(RecordHandle, BufferRecord)>> {
        self.store()?.scan()
    }

    pub fn remove(&self, handle: RecordHandle) -> BufferResult<bool> {
        self.store()?.remove(handle)
    }

    pub fn mark_pending(&self, handle: RecordHandle) -> BufferResult<bool> {
        self.store()?.mark_pending(handle)
    }

    pub fn truncate_all(&self) -> BufferResult<usize> {
        self.store()?.truncate_all()
    }

    pub fn counts(&self) -> BufferResult<BufferCounts> {
        self.store()?.counts()
    }

    /// Held by scheduled jobs for the duration of a run.
    pub fn maintenance(&self) -> MutexGuard<'_, ()> {
        self.maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self) -> BufferResult<MutexGuard<'_, Box<dyn BufferStore>>> {
        self.store.lock().map_err(|_| BufferError::Poisoned)
    }
}

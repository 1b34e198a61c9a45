use chrono::NaiveTime;
use std::sync::Arc;

use crate::buffer::DurableBuffer;
use crate::error::BufferError;

pub fn default_retention_time() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default()
}

/// Daily unconditional clear of the buffer, pending records included.
pub struct Retention {
    buffer: Arc<DurableBuffer>,
}

impl Retention {
    pub fn new(buffer: Arc<DurableBuffer>) -> Self {
        Self { buffer }
    }

    /// Waits for any reconciliation run to finish, then truncates.
    pub fn run_once(&self) -> Result<usize, BufferError> {
        let _maintenance = self.buffer.maintenance();
        let removed = self.buffer.truncate_all()?;
        if removed > 0 {
            log::info!("retention: truncated buffer ({} records)", removed);
        } else {
            log::info!("retention: buffer already empty");
        }
        Ok(removed)
    }
}

use std::time::Duration;
use thiserror::Error;

/// Local buffer failure. Fatal for the operation that hit it, never for the process.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("buffer lock poisoned")]
    Poisoned,

    #[error("corrupt buffer record {handle}: {reason}")]
    Corrupt { handle: i64, reason: String },
}

/// Sink delivery failure. The record stays pending for the next reconciliation pass.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sink rejected event: {0}")]
    Rejected(String),

    #[error("sink delivery exceeded {0:?}")]
    Timeout(Duration),

    #[error("sink delivery queue full ({0} waiting)")]
    QueueFull(usize),

    #[error("sink delivery worker exited without a result")]
    WorkerLost,
}

impl From<rusqlite::Error> for DeliveryError {
    fn from(err: rusqlite::Error) -> Self {
        DeliveryError::Rejected(err.to_string())
    }
}

/// Intake body could not be turned into an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed xml: {0}")]
    Malformed(&'static str),

    #[error("body is not valid utf-8")]
    Utf8,

    #[error("missing device serial (sn)")]
    MissingSerial,
}

use serde::{Deserialize, Serialize};

/// A single plate detection as reported by one camera.
///
/// Arrival order is the only ordering signal; events carry no timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Camera MAC address (`mac` on the wire).
    pub source_mac: Option<String>,
    /// Camera serial (`sn` on the wire). Groups detections per device.
    pub source_serial: String,
    pub device_name: Option<String>,
    /// Detected plate. Absent or malformed plates are buffered but never delivered.
    pub plate_number: Option<String>,
    pub target_type: Option<String>,
}

impl Event {
    pub fn new(source_serial: impl Into<String>, plate_number: Option<&str>) -> Self {
        Self {
            source_mac: None,
            source_serial: source_serial.into(),
            device_name: None,
            plate_number: plate_number.map(str::to_string),
            target_type: None,
        }
    }
}

/// An event as held in the durable buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub event: Event,
    pub pending_delivery: bool,
}

/// Stable identifier of one buffered record. Never reused, even after truncation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordHandle(pub i64);

/// Why the live path declined to deliver an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    InvalidPlate,
    SameSourceDuplicate,
    CrossSourceDuplicate,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::InvalidPlate => "invalid_plate",
            SkipReason::SameSourceDuplicate => "same_source_duplicate",
            SkipReason::CrossSourceDuplicate => "cross_source_duplicate",
        };
        f.write_str(s)
    }
}

/// Result of handing one event to the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeliveryOutcome {
    /// Persisted at the sink on the live path.
    Delivered,
    /// Held in the buffer with `pending_delivery = true` for reconciliation.
    Buffered,
    /// Recorded for audit only.
    Skipped(SkipReason),
}

//! Slot allocation: how many new calls a campaign may start right now.
//!
//! The snapshot must be taken inside the same store transaction that claims
//! contacts, otherwise two overlapping ticks can both see the same free slots.
//! Occupancy comes from the in-flight index the store keeps next to the
//! calls table, so taking a snapshot never scans call history.

/// Concurrency budget and current occupancy of one campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub concurrency: u32,
    pub in_flight: u32,
}

impl SlotSnapshot {
    pub fn new(concurrency: u32, in_flight: u64) -> Self {
        Self {
            concurrency,
            in_flight: u32::try_from(in_flight).unwrap_or(u32::MAX),
        }
    }

    pub fn free(&self) -> u32 {
        free_slots(self.concurrency, self.in_flight)
    }
}

/// `max(concurrency - in_flight, 0)`
pub fn free_slots(concurrency: u32, in_flight: u32) -> u32 {
    concurrency.saturating_sub(in_flight)
}

//! ============================================================================
//! Dispatch Module - Slot allocation and the dispatch tick
//! ============================================================================
//! - SlotSnapshot: per-campaign concurrency budget vs. in-flight calls
//! - Dispatcher: claims pending contacts into free slots and places calls
//! ============================================================================

mod slots;
mod tick;

pub use slots::{free_slots, SlotSnapshot};
pub use tick::Dispatcher;

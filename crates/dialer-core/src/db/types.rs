//! ============================================================================
//! Database Types - Results of multi-row store operations
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dispatch::SlotSnapshot;
use crate::reconcile::Transition;
use crate::types::{Call, CallEvent, CallStatus};

/// One contact claimed for dialing: its call row already exists as `created`
/// and the contact is already `calling`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchClaim {
    pub call_id: String,
    pub contact_id: String,
    pub campaign_id: String,
    pub phone: String,
}

/// Result of reserving slots for one campaign
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchBatch {
    /// Occupancy observed inside the claiming transaction
    pub snapshot: SlotSnapshot,
    pub claims: Vec<DispatchClaim>,
}

/// How a gateway identifier got attached to a dispatched call
#[derive(Debug, Clone, PartialEq)]
pub enum AttachOutcome {
    Linked,
    /// A webhook got there first; the placeholder's history was replayed
    /// onto the dispatched call
    AdoptedPlaceholder {
        placeholder_id: String,
        status: CallStatus,
    },
    /// Another dispatched call already owns this identifier
    Conflict { existing_call_id: String },
}

/// A webhook delivery as written to the audit log
#[derive(Debug, Clone)]
pub struct ArchivedEvent {
    pub event: CallEvent,
    /// Call matched by external id at archive time
    pub call: Option<Call>,
}

#[derive(Debug, Clone)]
pub struct PlaceholderOutcome {
    pub call: Call,
    /// False when the identifier was linked to a call in the meantime
    pub created: bool,
}

/// Effect of applying a webhook event to a call
#[derive(Debug, Clone)]
pub struct AppliedEvent {
    pub call_id: String,
    pub transition: Transition,
    /// Contact marked `done` by this event
    pub completed_contact: Option<String>,
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub total_campaigns: usize,
    pub campaign_counts: HashMap<String, usize>,
    pub total_contacts: usize,
    pub contact_counts: HashMap<String, usize>,
    pub total_calls: usize,
    pub call_counts: HashMap<String, usize>,
    pub total_events: usize,
}

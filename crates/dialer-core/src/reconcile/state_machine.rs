//! ============================================================================
//! Call State Machine
//! ============================================================================
//! Vendor event types are canonicalized into a closed set before any
//! transition logic sees them. Transitions are idempotent and never move a
//! call backwards, so replays and out-of-order deliveries are harmless.
//!
//!   created ──answered──▶ answered ──transferred──▶ transferred
//!      │                     │                          │
//!      └──────────────── finished ◀─────────────────────┘
//!
//! `failed` is only ever set by the dispatch path.
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::extract::{self, CallOutcome};
use crate::types::{Call, CallStatus};

/// Canonical event kinds understood by the state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallEventKind {
    Answered,
    Transferred,
    Finished,
    Unknown,
}

impl CallEventKind {
    /// Map a normalized event type (name or numeric code) to its kind
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type.trim().to_lowercase().as_str() {
            "answered" | "2000" => Self::Answered,
            "transferred" | "2001" => Self::Transferred,
            "finished" | "completed" | "2002" => Self::Finished,
            _ => Self::Unknown,
        }
    }

    /// Kind of a whole delivery: each event-type field is tried in preference
    /// order and the first one that maps to a known kind wins, so a free-text
    /// description never hides the numeric code next to it.
    pub fn from_payload(doc: &serde_json::Value) -> Self {
        extract::texts(doc, extract::EVENT_TYPE_RULES)
            .map(|text| Self::from_event_type(&text))
            .find(|kind| *kind != Self::Unknown)
            .unwrap_or(Self::Unknown)
    }
}

/// Progress order used to keep transitions monotonic
fn rank(status: CallStatus) -> u8 {
    match status {
        CallStatus::Created => 0,
        CallStatus::Answered => 1,
        CallStatus::Transferred => 2,
        CallStatus::Finished | CallStatus::Failed => 3,
    }
}

/// Target status for an event, or None when the event leaves the call alone
pub fn next_status(current: CallStatus, kind: CallEventKind) -> Option<CallStatus> {
    let target = match kind {
        CallEventKind::Answered => CallStatus::Answered,
        CallEventKind::Transferred => CallStatus::Transferred,
        CallEventKind::Finished => CallStatus::Finished,
        CallEventKind::Unknown => return None,
    };

    match current {
        // A replayed finish may refresh the outcome fields
        CallStatus::Finished if target == CallStatus::Finished => Some(target),
        CallStatus::Finished | CallStatus::Failed => None,
        _ if rank(target) >= rank(current) => Some(target),
        _ => None,
    }
}

/// What applying an event did to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallStatus,
    pub to: CallStatus,
    /// The call row changed and must be written back
    pub changed: bool,
    /// The linked contact should be marked done
    pub completes_contact: bool,
}

/// Apply an event to a call in place
pub fn apply_event(call: &mut Call, kind: CallEventKind, outcome: &CallOutcome, now: i64) -> Transition {
    let from = call.status;
    let Some(to) = next_status(from, kind) else {
        return Transition {
            from,
            to: from,
            changed: false,
            completes_contact: false,
        };
    };

    let before = call.clone();
    call.status = to;
    if to == CallStatus::Finished {
        merge_outcome(call, outcome);
        call.finished_at.get_or_insert(now);
    }

    Transition {
        from,
        to,
        changed: *call != before,
        completes_contact: to == CallStatus::Finished && call.contact_id.is_some(),
    }
}

/// Overwrite outcome fields that the event actually carried
fn merge_outcome(call: &mut Call, outcome: &CallOutcome) {
    if let Some(duration) = outcome.duration {
        call.duration = Some(duration);
    }
    if let Some(cost) = outcome.cost {
        call.cost = Some(cost);
    }
    if let Some(url) = &outcome.recording_url {
        call.recording_url = Some(url.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(status: CallStatus) -> Call {
        Call {
            id: "call-1".into(),
            campaign_id: Some("camp-1".into()),
            contact_id: Some("contact-1".into()),
            external_call_id: Some("abc".into()),
            status,
            duration: None,
            cost: None,
            recording_url: None,
            created_at: 100,
            finished_at: None,
            superseded_by: None,
        }
    }

    #[test]
    fn test_event_kind_canonicalization() {
        assert_eq!(CallEventKind::from_event_type("answered"), CallEventKind::Answered);
        assert_eq!(CallEventKind::from_event_type("ANSWERED"), CallEventKind::Answered);
        assert_eq!(CallEventKind::from_event_type("2001"), CallEventKind::Transferred);
        assert_eq!(CallEventKind::from_event_type("completed"), CallEventKind::Finished);
        assert_eq!(CallEventKind::from_event_type("2002"), CallEventKind::Finished);
        assert_eq!(CallEventKind::from_event_type("ringing"), CallEventKind::Unknown);
        assert_eq!(CallEventKind::from_event_type("unknown"), CallEventKind::Unknown);
    }

    #[test]
    fn test_kind_from_payload_looks_past_description() {
        let finished = serde_json::json!({"type": 2002, "description": "Call finished"});
        assert_eq!(CallEventKind::from_payload(&finished), CallEventKind::Finished);

        let described = serde_json::json!({"description": "Answered", "code": "9999"});
        assert_eq!(CallEventKind::from_payload(&described), CallEventKind::Answered);

        let generic = serde_json::json!({"description": "ringing", "event": "transferred"});
        assert_eq!(CallEventKind::from_payload(&generic), CallEventKind::Transferred);

        let unknown = serde_json::json!({"description": "ringing", "type": 1999});
        assert_eq!(CallEventKind::from_payload(&unknown), CallEventKind::Unknown);
    }

    #[test]
    fn test_forward_transitions() {
        use CallStatus::*;
        assert_eq!(next_status(Created, CallEventKind::Answered), Some(Answered));
        assert_eq!(next_status(Created, CallEventKind::Transferred), Some(Transferred));
        assert_eq!(next_status(Answered, CallEventKind::Transferred), Some(Transferred));
        assert_eq!(next_status(Transferred, CallEventKind::Finished), Some(Finished));
        assert_eq!(next_status(Created, CallEventKind::Finished), Some(Finished));
    }

    #[test]
    fn test_no_backward_or_terminal_transitions() {
        use CallStatus::*;
        assert_eq!(next_status(Transferred, CallEventKind::Answered), None);
        assert_eq!(next_status(Finished, CallEventKind::Answered), None);
        assert_eq!(next_status(Failed, CallEventKind::Finished), None);
        assert_eq!(next_status(Created, CallEventKind::Unknown), None);
        assert_eq!(next_status(Finished, CallEventKind::Finished), Some(Finished));
    }

    #[test]
    fn test_finish_sets_outcome_and_completes_contact() {
        let mut c = call(CallStatus::Answered);
        let outcome = CallOutcome {
            duration: Some(42),
            cost: Some(0.5),
            recording_url: Some("https://rec/abc.mp3".into()),
        };

        let t = apply_event(&mut c, CallEventKind::Finished, &outcome, 500);
        assert_eq!(t.from, CallStatus::Answered);
        assert_eq!(t.to, CallStatus::Finished);
        assert!(t.changed);
        assert!(t.completes_contact);
        assert_eq!(c.duration, Some(42));
        assert_eq!(c.cost, Some(0.5));
        assert_eq!(c.finished_at, Some(500));
    }

    #[test]
    fn test_replayed_finish_is_idempotent() {
        let mut c = call(CallStatus::Created);
        let outcome = CallOutcome {
            duration: Some(42),
            cost: Some(0.5),
            recording_url: None,
        };

        apply_event(&mut c, CallEventKind::Finished, &outcome, 500);
        let once = c.clone();

        let t = apply_event(&mut c, CallEventKind::Finished, &outcome, 900);
        assert!(!t.changed);
        assert_eq!(c, once);
        assert_eq!(c.finished_at, Some(500));
    }

    #[test]
    fn test_late_answer_after_finish_is_ignored() {
        let mut c = call(CallStatus::Finished);
        c.finished_at = Some(10);
        let t = apply_event(&mut c, CallEventKind::Answered, &CallOutcome::default(), 20);
        assert!(!t.changed);
        assert_eq!(c.status, CallStatus::Finished);
    }

    #[test]
    fn test_placeholder_call_does_not_complete_contact() {
        let mut c = call(CallStatus::Created);
        c.contact_id = None;
        let t = apply_event(&mut c, CallEventKind::Finished, &CallOutcome::default(), 5);
        assert!(t.changed);
        assert!(!t.completes_contact);
    }
}

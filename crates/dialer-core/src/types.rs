//! ============================================================================
//! Core Types for the Campaign Dialer
//! ============================================================================
//! Records persisted in the store (campaigns, contacts, calls, call events),
//! the per-tick and per-webhook reports returned over HTTP, and the error
//! taxonomy shared by the dispatch and reconciliation paths.
//! ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Campaigns
// ============================================================================

/// A batch of outbound-dial work with a concurrency budget.
/// Written by the operator tooling, read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: String,
    pub status: CampaignStatus,
    /// Maximum number of in-flight calls at any instant
    pub concurrency: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

// ============================================================================
// Contacts
// ============================================================================

/// A phone number targeted by a campaign, with its dispatch progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: String,
    pub campaign_id: String,
    /// E.164 formatted number, e.g. "+5511999999999"
    pub phone: String,
    pub status: ContactStatus,
    /// Number of dispatch attempts made for this contact
    pub attempts: u32,
    /// Most recent call placed for this contact (weak reference)
    pub last_call_id: Option<String>,
    /// Position in the campaign's dial order
    pub queue_seq: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Calling,
    Done,
    Failed,
}

impl ContactStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "calling" => Some(Self::Calling),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Calling => "calling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

/// One outbound dial attempt and its lifecycle as tracked locally.
/// Append-only: rows are never deleted, terminal statuses are `finished`/`failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub id: String,
    /// None only for placeholder calls bootstrapped from an unknown webhook
    pub campaign_id: Option<String>,
    /// None only for placeholder calls bootstrapped from an unknown webhook
    pub contact_id: Option<String>,
    /// Gateway-assigned identifier, unique once known
    pub external_call_id: Option<String>,
    pub status: CallStatus,
    /// Billed duration in seconds
    pub duration: Option<u64>,
    pub cost: Option<f64>,
    pub recording_url: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    /// Set on a placeholder once a dispatched call adopted its external id
    pub superseded_by: Option<String>,
}

impl Call {
    /// Whether this call was bootstrapped from a webhook rather than dispatched
    pub fn is_placeholder(&self) -> bool {
        self.contact_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Created,
    Answered,
    Transferred,
    Finished,
    Failed,
}

impl CallStatus {
    /// In-flight calls occupy one of their campaign's concurrency slots
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Created | Self::Answered | Self::Transferred)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Answered => "answered",
            Self::Transferred => "transferred",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Call Events
// ============================================================================

/// Immutable audit row, one per webhook delivery (including undecodable and
/// orphan deliveries) plus one per failed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallEvent {
    pub id: String,
    pub call_id: Option<String>,
    /// Normalized, vendor-defined event type
    pub event_type: String,
    /// Raw delivered document (JSON text when decodable)
    pub payload: String,
    pub received_at: i64,
}

// ============================================================================
// Engine Reports
// ============================================================================

/// Per-campaign outcome of one dispatch tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignTickResult {
    pub campaign_id: String,
    pub started: u32,
    pub errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CampaignTickResult {
    pub fn new(campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            started: 0,
            errors: 0,
            reason: None,
        }
    }

    pub fn skipped(campaign_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(campaign_id)
        }
    }
}

/// Response body of `POST /tick`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickReport {
    pub ok: bool,
    pub results: Vec<CampaignTickResult>,
}

/// Response body of `POST /webhooks/<gateway>`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error taxonomy for the dialer engine
#[derive(Debug, thiserror::Error)]
pub enum DialerError {
    /// Missing gateway credential, endpoint or transfer destination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Gateway unreachable, timed out, non-2xx, or unusable response
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Store failures
    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),

    /// Webhook shared-secret mismatch
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type DialerResult<T> = std::result::Result<T, DialerError>;

/// Check a phone number is E.164: a leading '+' and 8 to 15 digits
pub fn is_valid_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && !digits.starts_with('0')
        && digits.chars().all(|c| c.is_ascii_digit())
}

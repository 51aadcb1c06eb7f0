//! ============================================================================
//! Voice Gateway - Call placement interface
//! ============================================================================
//! The dispatch loop only talks to `VoiceGateway`; `HttpVoiceGateway` is the
//! production client, tests substitute a scripted fake.
//! ============================================================================

mod http;

pub use http::HttpVoiceGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::DialerResult;

/// One outbound call to place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceCallRequest {
    /// Our call id, for log correlation only
    pub call_id: String,
    /// Destination in E.164
    pub to: String,
}

/// Gateway acknowledgement of a placed call
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedCall {
    pub external_call_id: String,
    /// Response document as returned by the gateway
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Ask the gateway to dial `request.to` and bridge it to the transfer
    /// destination. Errors are `Configuration` or `Gateway`.
    async fn place_call(&self, request: &PlaceCallRequest) -> DialerResult<PlacedCall>;
}

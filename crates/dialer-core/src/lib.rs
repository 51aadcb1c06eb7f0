//! ============================================================================
//! DIALER-CORE: Campaign dispatch and reconciliation engine
//! ============================================================================
//! This crate handles all backend logic for the campaign dialer:
//! - Slot allocation against each campaign's concurrency budget
//! - The dispatch tick that places calls through the voice gateway
//! - Webhook reconciliation through a monotonic call state machine
//! - Embedded storage via redb
//! ============================================================================

pub mod config;
pub mod db;
pub mod dispatch;
pub mod extract;
pub mod gateway;
pub mod reconcile;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use config::{DialerConfig, GatewayConfig, SipTrunk};
pub use db::DialerDb;
pub use dispatch::Dispatcher;
pub use gateway::{HttpVoiceGateway, PlaceCallRequest, PlacedCall, VoiceGateway};
pub use reconcile::Reconciler;

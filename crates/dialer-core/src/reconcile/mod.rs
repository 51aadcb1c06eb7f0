//! ============================================================================
//! Webhook Reconciler
//! ============================================================================
//! Turns at-least-once, possibly reordered gateway deliveries into call and
//! contact state:
//! - every delivery is archived before anything else is touched
//! - unknown gateway ids bootstrap a placeholder call
//! - known calls advance through the monotonic state machine
//!
//! Once a delivery is archived the gateway gets a 200, even if the
//! downstream update failed; the failure is reported as a warning instead.
//! ============================================================================

mod state_machine;

pub use state_machine::{apply_event, next_status, CallEventKind, Transition};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::{self, DialerDb};
use crate::extract::{self, CallOutcome};
use crate::types::{DialerError, DialerResult, WebhookAck};

/// Event type stored for deliveries that are not JSON
pub const UNDECODABLE_EVENT: &str = "undecodable";

pub struct Reconciler {
    db: Arc<DialerDb>,
    secret: Option<String>,
}

impl Reconciler {
    pub fn new(db: Arc<DialerDb>, secret: Option<String>) -> Self {
        Self { db, secret }
    }

    /// Check the shared secret header. Passes when no secret is configured.
    pub fn verify_secret(&self, presented: Option<&str>) -> DialerResult<()> {
        match (&self.secret, presented) {
            (None, _) => Ok(()),
            (Some(expected), Some(given)) if constant_time_eq(expected.as_bytes(), given.as_bytes()) => {
                Ok(())
            }
            (Some(_), Some(_)) => Err(DialerError::Authentication("webhook secret mismatch".into())),
            (Some(_), None) => Err(DialerError::Authentication("webhook secret missing".into())),
        }
    }

    /// Ingest one delivery from `gateway`.
    ///
    /// Errors: `Authentication` before any write, `InvalidInput` for an empty
    /// body, `Persistence` only when the delivery could not be archived.
    pub async fn ingest(
        &self,
        gateway: &str,
        presented_secret: Option<&str>,
        body: &[u8],
    ) -> DialerResult<WebhookAck> {
        self.verify_secret(presented_secret)?;

        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(DialerError::InvalidInput("empty webhook body".into()));
        }

        let now = chrono::Utc::now().timestamp();
        let text = String::from_utf8_lossy(body).into_owned();

        let doc: serde_json::Value = match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Webhook from {}: undecodable payload ({})", gateway, e);
                db::blocking(&self.db, move |db| {
                    db.archive_event(None, UNDECODABLE_EVENT, text, now)
                })
                .await?;
                return Ok(WebhookAck {
                    ok: true,
                    call_id: None,
                    warning: Some("undecodable payload archived".into()),
                });
            }
        };

        let event_type = extract::event_type(&doc);
        let kind = CallEventKind::from_payload(&doc);
        let external_id = extract::webhook_call_id(&doc);
        let outcome = CallOutcome::from_payload(&doc);

        info!(
            "Webhook from {}: {} for {}",
            gateway,
            event_type,
            external_id.as_deref().unwrap_or("<no call id>")
        );

        let archived = {
            let external_id = external_id.clone();
            let event_type = event_type.clone();
            db::blocking(&self.db, move |db| {
                db.archive_event(external_id.as_deref(), &event_type, text, now)
            })
            .await?
        };

        let Some(external_id) = external_id else {
            return Ok(WebhookAck {
                ok: true,
                call_id: None,
                warning: Some("no call id in payload".into()),
            });
        };

        let call = match archived.call {
            Some(call) => call,
            None => {
                let ext = external_id.clone();
                match db::blocking(&self.db, move |db| db.create_placeholder_call(&ext, now)).await {
                    Ok(placeholder) if placeholder.created => {
                        warn!(
                            "Webhook from {}: unknown call id {}, created placeholder {}",
                            gateway, external_id, placeholder.call.id
                        );
                        return Ok(WebhookAck {
                            ok: true,
                            call_id: Some(placeholder.call.id),
                            warning: Some(format!("unknown call id {}", external_id)),
                        });
                    }
                    // Linked by the dispatch loop between archive and now
                    Ok(placeholder) => placeholder.call,
                    Err(e) => {
                        warn!("Webhook from {}: placeholder for {} failed: {}", gateway, external_id, e);
                        return Ok(WebhookAck {
                            ok: true,
                            call_id: None,
                            warning: Some(format!("event archived, call not updated: {}", e)),
                        });
                    }
                }
            }
        };

        let call_id = call.id.clone();
        let applied = {
            let call_id = call_id.clone();
            db::blocking(&self.db, move |db| db.apply_call_event(&call_id, kind, &outcome, now)).await
        };

        match applied {
            Ok(applied) => {
                if applied.transition.changed {
                    info!(
                        "Call {}: {} -> {}",
                        call_id,
                        applied.transition.from.as_str(),
                        applied.transition.to.as_str()
                    );
                } else {
                    debug!("Call {}: {} left state unchanged", call_id, event_type);
                }
                if let Some(contact_id) = &applied.completed_contact {
                    info!("Contact {} done", contact_id);
                }
                Ok(WebhookAck {
                    ok: true,
                    call_id: Some(call_id),
                    warning: None,
                })
            }
            Err(e) => {
                warn!("Webhook from {}: call {} not updated: {}", gateway, call_id, e);
                Ok(WebhookAck {
                    ok: true,
                    call_id: Some(call_id),
                    warning: Some(format!("event archived, call not updated: {}", e)),
                })
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

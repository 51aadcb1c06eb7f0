//! ============================================================================
//! Dispatch Tick
//! ============================================================================
//! One invocation walks the running campaigns (or a single requested one):
//!   claim contacts into free slots -> place each call -> record the result.
//! Slots are reserved inside the claiming store transaction, so overlapping
//! ticks can never push a campaign past its concurrency.
//! ============================================================================

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tracing::{error, info, warn};

use crate::config::DEFAULT_CAMPAIGN_PARALLELISM;
use crate::db::{self, AttachOutcome, DialerDb, DispatchClaim};
use crate::gateway::{PlaceCallRequest, VoiceGateway};
use crate::types::{CampaignStatus, CampaignTickResult, DialerError, DialerResult, TickReport};

/// Per-claim result that decides whether the campaign keeps going
enum ClaimOutcome {
    Started,
    Failed,
}

/// Drives outbound dialing for running campaigns
pub struct Dispatcher {
    db: Arc<DialerDb>,
    gateway: Arc<dyn VoiceGateway>,
    parallelism: usize,
}

impl Dispatcher {
    pub fn new(db: Arc<DialerDb>, gateway: Arc<dyn VoiceGateway>) -> Self {
        Self {
            db,
            gateway,
            parallelism: DEFAULT_CAMPAIGN_PARALLELISM,
        }
    }

    /// How many campaigns are dispatched concurrently within one tick
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Run one dispatch pass.
    ///
    /// Fails only when the campaign listing itself cannot be read; every
    /// per-campaign and per-contact problem is reported inside the results.
    pub async fn tick(&self, campaign_id: Option<&str>) -> DialerResult<TickReport> {
        let campaign_ids = match campaign_id {
            Some(id) => {
                let requested = id.to_string();
                let campaign = db::blocking(&self.db, move |db| db.get_campaign(&requested)).await?;
                match campaign {
                    None => {
                        return Ok(single(CampaignTickResult::skipped(id, "campaign not found")));
                    }
                    Some(c) if c.status != CampaignStatus::Running => {
                        return Ok(single(CampaignTickResult::skipped(id, "campaign not running")));
                    }
                    Some(c) => vec![c.id],
                }
            }
            None => db::blocking(&self.db, |db| db.list_campaigns(Some(CampaignStatus::Running)))
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect(),
        };

        info!("Dispatch tick over {} campaign(s)", campaign_ids.len());

        let results: Vec<CampaignTickResult> = stream::iter(campaign_ids)
            .map(|id| async move { self.run_campaign(id).await })
            .buffered(self.parallelism)
            .collect()
            .await;

        let started: u32 = results.iter().map(|r| r.started).sum();
        let errors: u32 = results.iter().map(|r| r.errors).sum();
        info!("Dispatch tick done: {} started, {} errors", started, errors);

        Ok(TickReport { ok: true, results })
    }

    async fn run_campaign(&self, campaign_id: String) -> CampaignTickResult {
        let mut result = CampaignTickResult::new(campaign_id.clone());
        let now = chrono::Utc::now().timestamp();

        let id = campaign_id.clone();
        let batch = match db::blocking(&self.db, move |db| db.claim_dispatch_batch(&id, now)).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                result.reason = Some("campaign not running".into());
                return result;
            }
            Err(e) => {
                error!("Campaign {}: failed to claim contacts: {}", campaign_id, e);
                result.reason = Some(store_reason(&e));
                return result;
            }
        };

        if batch.claims.is_empty() {
            result.reason = Some(if batch.snapshot.free() == 0 {
                "no slots".into()
            } else {
                "no pending contacts".into()
            });
            return result;
        }

        info!(
            "Campaign {}: {} free slot(s), dialing {} contact(s)",
            campaign_id,
            batch.snapshot.free(),
            batch.claims.len()
        );

        for claim in batch.claims {
            match self.dispatch_claim(claim).await {
                Ok(ClaimOutcome::Started) => result.started += 1,
                Ok(ClaimOutcome::Failed) => result.errors += 1,
                Err(e) => {
                    error!("Campaign {}: aborting tick after store failure: {}", campaign_id, e);
                    result.reason = Some(store_reason(&e));
                    break;
                }
            }
        }

        result
    }

    /// Place one claimed call. Only store failures come back as errors.
    async fn dispatch_claim(&self, claim: DispatchClaim) -> DialerResult<ClaimOutcome> {
        let request = PlaceCallRequest {
            call_id: claim.call_id.clone(),
            to: claim.phone.clone(),
        };

        let failure = match self.gateway.place_call(&request).await {
            Ok(placed) => {
                let call_id = claim.call_id.clone();
                let external_id = placed.external_call_id.clone();
                let attached = db::blocking(&self.db, move |db| {
                    db.attach_external_call_id(&call_id, &external_id)
                })
                .await?;

                match attached {
                    AttachOutcome::Linked => return Ok(ClaimOutcome::Started),
                    AttachOutcome::AdoptedPlaceholder { placeholder_id, status } => {
                        info!(
                            "Call {} adopted early webhook state from {} ({})",
                            claim.call_id,
                            placeholder_id,
                            status.as_str()
                        );
                        return Ok(ClaimOutcome::Started);
                    }
                    AttachOutcome::Conflict { existing_call_id } => format!(
                        "external call id {} already linked to call {}",
                        placed.external_call_id, existing_call_id
                    ),
                }
            }
            Err(e) => e.to_string(),
        };

        warn!("Call {} to {} failed: {}", claim.call_id, claim.phone, failure);

        let now = chrono::Utc::now().timestamp();
        db::blocking(&self.db, move |db| db.record_dispatch_failure(&claim, &failure, now)).await?;
        Ok(ClaimOutcome::Failed)
    }
}

fn single(result: CampaignTickResult) -> TickReport {
    TickReport {
        ok: true,
        results: vec![result],
    }
}

fn store_reason(err: &DialerError) -> String {
    match err {
        DialerError::Persistence(inner) => format!("store error: {:#}", inner),
        other => format!("store error: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PlacedCall;
    use crate::types::{CallStatus, Campaign, ContactStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers every placement with `ext-<phone>` unless scripted otherwise
    #[derive(Default)]
    struct ScriptedGateway {
        scripted: Mutex<HashMap<String, DialerResult<String>>>,
        dialed: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        fn script(&self, phone: &str, outcome: DialerResult<String>) {
            self.scripted.lock().unwrap().insert(phone.to_string(), outcome);
        }

        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoiceGateway for ScriptedGateway {
        async fn place_call(&self, request: &PlaceCallRequest) -> DialerResult<PlacedCall> {
            self.dialed.lock().unwrap().push(request.to.clone());
            tokio::task::yield_now().await;

            let outcome = self
                .scripted
                .lock()
                .unwrap()
                .remove(&request.to)
                .unwrap_or_else(|| Ok(format!("ext-{}", request.to)));

            outcome.map(|external_call_id| PlacedCall {
                raw: serde_json::json!({ "call_id": external_call_id }),
                external_call_id,
            })
        }
    }

    fn seed(db: &DialerDb, id: &str, status: CampaignStatus, concurrency: u32, phones: &[&str]) {
        db.put_campaign(&Campaign {
            id: id.into(),
            status,
            concurrency,
            created_at: 0,
        })
        .unwrap();
        for phone in phones {
            db.add_contact(id, phone, 0).unwrap();
        }
    }

    fn setup() -> (Arc<DialerDb>, Arc<ScriptedGateway>, Dispatcher) {
        let db = Arc::new(DialerDb::in_memory().unwrap());
        let gateway = Arc::new(ScriptedGateway::default());
        let dispatcher = Dispatcher::new(db.clone(), gateway.clone());
        (db, gateway, dispatcher)
    }

    #[tokio::test]
    async fn test_tick_fills_free_slots_only() {
        let (db, gateway, dispatcher) = setup();
        seed(
            &db,
            "camp-1",
            CampaignStatus::Running,
            2,
            &["+5511999999999", "+5511999999998", "+5511999999997"],
        );

        let report = dispatcher.tick(None).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].started, 2);
        assert_eq!(report.results[0].errors, 0);
        assert_eq!(gateway.dialed(), vec!["+5511999999999", "+5511999999998"]);

        let pending = db.list_contacts("camp-1", Some(ContactStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            db.find_call_by_external_id("ext-+5511999999999").unwrap().unwrap().status,
            CallStatus::Created
        );

        // Both slots are still held
        let report = dispatcher.tick(Some("camp-1")).await.unwrap();
        assert_eq!(report.results[0].started, 0);
        assert_eq!(report.results[0].reason.as_deref(), Some("no slots"));
        assert_eq!(gateway.dialed().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_isolated_per_contact() {
        let (db, gateway, dispatcher) = setup();
        seed(&db, "camp-1", CampaignStatus::Running, 3, &["+5511999999901", "+5511999999902"]);
        gateway.script(
            "+5511999999901",
            Err(DialerError::Gateway("Voice gateway returned 500".into())),
        );

        let report = dispatcher.tick(None).await.unwrap();
        assert_eq!(report.results[0].started, 1);
        assert_eq!(report.results[0].errors, 1);
        assert!(report.results[0].reason.is_none());

        let failed = db.list_contacts("camp-1", Some(ContactStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].phone, "+5511999999901");

        let call_id = failed[0].last_call_id.clone().unwrap();
        let call = db.get_call(&call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);
        assert!(call.finished_at.is_some());

        let events = db.list_events(Some(&call_id)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, db::START_FAILED_EVENT);
        assert!(events[0].payload.contains("returned 500"));

        // The failed call released its slot, the contact is not retried
        let report = dispatcher.tick(None).await.unwrap();
        assert_eq!(report.results[0].reason.as_deref(), Some("no pending contacts"));
    }

    #[tokio::test]
    async fn test_configuration_error_fails_the_call() {
        let (db, gateway, dispatcher) = setup();
        seed(&db, "camp-1", CampaignStatus::Running, 1, &["+5511999999901"]);
        gateway.script(
            "+5511999999901",
            Err(DialerError::Configuration("TRANSFER_DESTINATION is not set".into())),
        );

        let report = dispatcher.tick(None).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.results[0].errors, 1);

        let calls = db.list_calls(Some("camp-1")).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_external_id_is_a_dispatch_failure() {
        let (db, gateway, dispatcher) = setup();
        seed(&db, "camp-1", CampaignStatus::Running, 2, &["+5511999999901", "+5511999999902"]);
        gateway.script("+5511999999901", Ok("same".into()));
        gateway.script("+5511999999902", Ok("same".into()));

        let report = dispatcher.tick(None).await.unwrap();
        assert_eq!(report.results[0].started, 1);
        assert_eq!(report.results[0].errors, 1);

        let failed = db.list_contacts("camp-1", Some(ContactStatus::Failed)).unwrap();
        assert_eq!(failed[0].phone, "+5511999999902");
        let events = db.list_events(failed[0].last_call_id.as_deref()).unwrap();
        assert!(events[0].payload.contains("already linked"));
    }

    #[tokio::test]
    async fn test_explicit_campaign_reasons() {
        let (db, _gateway, dispatcher) = setup();
        seed(&db, "paused", CampaignStatus::Paused, 1, &["+5511999999901"]);

        let report = dispatcher.tick(Some("missing")).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].campaign_id, "missing");
        assert_eq!(report.results[0].reason.as_deref(), Some("campaign not found"));

        let report = dispatcher.tick(Some("paused")).await.unwrap();
        assert_eq!(report.results[0].reason.as_deref(), Some("campaign not running"));

        // Paused campaigns are not part of a full tick
        let report = dispatcher.tick(None).await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_results_keep_campaign_order() {
        let (db, _gateway, dispatcher) = setup();
        seed(&db, "a", CampaignStatus::Running, 1, &["+5511999999901"]);
        seed(&db, "b", CampaignStatus::Running, 1, &[]);
        seed(&db, "c", CampaignStatus::Running, 1, &["+5511999999903"]);
        let dispatcher = dispatcher.with_parallelism(3);

        let report = dispatcher.tick(None).await.unwrap();
        let ids: Vec<&str> = report.results.iter().map(|r| r.campaign_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(report.results[0].started, 1);
        assert_eq!(report.results[1].reason.as_deref(), Some("no pending contacts"));
        assert_eq!(report.results[2].started, 1);
    }

    #[tokio::test]
    async fn test_store_failure_stops_campaign_but_not_tick() {
        let (db, gateway, dispatcher) = setup();
        seed(&db, "a", CampaignStatus::Running, 2, &["+5511999999901", "+5511999999902"]);
        seed(&db, "b", CampaignStatus::Running, 1, &["+5511999999903"]);
        gateway.script(
            "+5511999999901",
            Err(DialerError::Gateway("Voice gateway returned 503".into())),
        );
        db.fail_next("record_dispatch_failure");

        let report = dispatcher.tick(None).await.unwrap();
        assert!(report.ok);

        let a = &report.results[0];
        assert_eq!(a.campaign_id, "a");
        assert_eq!(a.started, 0);
        assert_eq!(a.errors, 0);
        let reason = a.reason.as_deref().unwrap();
        assert!(reason.starts_with("store error"), "{reason}");
        assert!(reason.contains("record_dispatch_failure"), "{reason}");

        let b = &report.results[1];
        assert_eq!(b.campaign_id, "b");
        assert_eq!(b.started, 1);
        assert!(b.reason.is_none());

        // The rest of campaign a's batch was never placed
        let dialed = gateway.dialed();
        assert!(!dialed.contains(&"+5511999999902".to_string()));
        assert!(dialed.contains(&"+5511999999903".to_string()));
    }

    #[tokio::test]
    async fn test_claim_failure_reports_store_error() {
        let (db, gateway, dispatcher) = setup();
        seed(&db, "a", CampaignStatus::Running, 1, &["+5511999999901"]);
        db.fail_next("claim_dispatch_batch");

        let report = dispatcher.tick(Some("a")).await.unwrap();
        assert!(report.results[0].reason.as_deref().unwrap().starts_with("store error"));
        assert!(gateway.dialed().is_empty());

        let pending = db.list_contacts("a", Some(ContactStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_ticks_never_exceed_concurrency() {
        let (db, gateway, dispatcher) = setup();
        let phones: Vec<String> = (0..10).map(|i| format!("+55119999990{:02}", i)).collect();
        let phone_refs: Vec<&str> = phones.iter().map(String::as_str).collect();
        seed(&db, "camp-1", CampaignStatus::Running, 3, &phone_refs);

        let (first, second, third) = tokio::join!(
            dispatcher.tick(None),
            dispatcher.tick(None),
            dispatcher.tick(Some("camp-1"))
        );
        let started: u32 = [first, second, third]
            .into_iter()
            .map(|r| r.unwrap().results[0].started)
            .sum();

        assert_eq!(started, 3);
        assert_eq!(gateway.dialed().len(), 3);

        let in_flight = db
            .list_calls(Some("camp-1"))
            .unwrap()
            .into_iter()
            .filter(|c| c.status.is_in_flight())
            .count();
        assert_eq!(in_flight, 3);

        // No contact was dialed twice
        let mut dialed = gateway.dialed();
        dialed.sort();
        dialed.dedup();
        assert_eq!(dialed.len(), 3);
    }
}

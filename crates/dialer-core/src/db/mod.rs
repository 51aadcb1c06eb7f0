// ============================================================================
// DialerDb - Embedded Database (redb)
// ============================================================================
// Single source of truth for campaigns, contacts, calls and call events.
// Default path: ~/.campaign-dialer/dialer.redb (override via DIALER_DB_PATH)
//
// redb serializes write transactions, so every operation that must be atomic
// (slot reservation, dispatch failure bookkeeping, state transitions) runs in
// exactly one write transaction.
//
// Two indexes keep the dispatch path off the full tables:
// - in_flight_calls holds the non-terminal calls of each campaign and is
//   updated in the same transaction that moves a call's status
// - pending_contacts holds only the contacts still waiting to be dialed
// ============================================================================

pub mod types;

pub use types::{
    AppliedEvent, ArchivedEvent, AttachOutcome, DbStats, DispatchBatch, DispatchClaim,
    PlaceholderOutcome,
};

use anyhow::{anyhow, Result};
use redb::{
    Database, Key, MultimapTable, MultimapTableDefinition, MultimapTableHandle, ReadOnlyMultimapTable, ReadOnlyTable, ReadTransaction,
    ReadableMultimapTable, ReadableTable, Table, TableDefinition, TableHandle, Value,
    WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::SlotSnapshot;
use crate::extract::{self, CallOutcome};
use crate::reconcile::{apply_event, CallEventKind};
use crate::types::{
    is_valid_e164, Call, CallEvent, CallStatus, Campaign, CampaignStatus, Contact, ContactStatus,
    DialerError, DialerResult,
};

// Table definitions
const CAMPAIGNS: TableDefinition<&str, &[u8]> = TableDefinition::new("campaigns");
const CONTACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("contacts");
/// (campaign_id, insertion seq) -> contact_id
const CAMPAIGN_CONTACTS: TableDefinition<(&str, u64), &str> =
    TableDefinition::new("campaign_contacts");
/// Dial queue: (campaign_id, insertion seq) -> contact_id, pending contacts only
const PENDING_CONTACTS: TableDefinition<(&str, u64), &str> =
    TableDefinition::new("pending_contacts");
const CALLS: TableDefinition<&str, &[u8]> = TableDefinition::new("calls");
/// campaign_id -> call_id for every call holding a slot
const IN_FLIGHT: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("in_flight_calls");
/// external_call_id -> call_id (unique)
const CALLS_BY_EXTERNAL_ID: TableDefinition<&str, &str> =
    TableDefinition::new("calls_by_external_id");
/// append-only audit log keyed by arrival sequence
const CALL_EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("call_events");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const CONTACT_SEQ: &str = "seq:contacts";
const EVENT_SEQ: &str = "seq:call_events";

/// Event type recorded when the gateway refused or could not place a call
pub const START_FAILED_EVENT: &str = "start_failed";
/// Event type recorded when a claimed call never reached the gateway
pub const DISPATCH_ABANDONED_EVENT: &str = "dispatch_abandoned";

/// Shortest age a claimed call must reach before it can be reaped
pub const MIN_REAP_AGE_SECS: i64 = 60;

/// Embedded database for the campaign dialer
pub struct DialerDb {
    db: Database,
    path: PathBuf,
    #[cfg(test)]
    faults: std::sync::Mutex<Vec<&'static str>>,
}

impl DialerDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses DIALER_DB_PATH env var or ~/.campaign-dialer/dialer.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("DIALER_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let dialer_dir = home.join(".campaign-dialer");
            std::fs::create_dir_all(&dialer_dir)
                .map_err(|e| anyhow!("Failed to create .campaign-dialer directory: {}", e))?;
            dialer_dir.join("dialer.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;
        Self::initialize(db, db_path)
    }

    /// Ephemeral database backed by memory, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?;
        Self::initialize(db, PathBuf::from(":memory:"))
    }

    fn initialize(db: Database, path: PathBuf) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            open_write(&write_txn, CAMPAIGNS)?;
            open_write(&write_txn, CONTACTS)?;
            open_write(&write_txn, CAMPAIGN_CONTACTS)?;
            open_write(&write_txn, PENDING_CONTACTS)?;
            open_write(&write_txn, CALLS)?;
            open_multimap_write(&write_txn, IN_FLIGHT)?;
            open_write(&write_txn, CALLS_BY_EXTERNAL_ID)?;
            open_write(&write_txn, CALL_EVENTS)?;
            open_write(&write_txn, META)?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self {
            db,
            path,
            #[cfg(test)]
            faults: Default::default(),
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        self.db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))
    }

    fn begin_read(&self) -> Result<ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))
    }

    /// Cheap liveness check: one read transaction, one table open
    pub fn ping(&self) -> Result<()> {
        let read_txn = self.begin_read()?;
        open_read(&read_txn, CAMPAIGNS)?;
        Ok(())
    }

    /// Make the next call of the named store operation fail
    #[cfg(test)]
    pub(crate) fn fail_next(&self, operation: &'static str) {
        self.faults.lock().unwrap().push(operation);
    }

    #[cfg(test)]
    fn check_fault(&self, operation: &'static str) -> Result<()> {
        let mut faults = self.faults.lock().map_err(|_| anyhow!("Fault list poisoned"))?;
        match faults.iter().position(|f| *f == operation) {
            Some(pos) => {
                faults.remove(pos);
                Err(anyhow!("Injected failure in {}", operation))
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    #[inline]
    fn check_fault(&self, _operation: &'static str) -> Result<()> {
        Ok(())
    }

    // ========================================================================
    // Campaign Operations
    // ========================================================================

    pub fn put_campaign(&self, campaign: &Campaign) -> Result<()> {
        if campaign.id.trim().is_empty() {
            return Err(anyhow!("Campaign id must not be empty"));
        }
        if campaign.concurrency == 0 {
            return Err(anyhow!("Campaign concurrency must be positive"));
        }

        let write_txn = self.begin_write()?;
        {
            let mut table = open_write(&write_txn, CAMPAIGNS)?;
            put_record(&mut table, &campaign.id, campaign, "campaign")?;
        }
        commit(write_txn)?;

        debug!("Stored campaign: {}", campaign.id);
        Ok(())
    }

    pub fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CAMPAIGNS)?;
        get_record(&table, campaign_id, "campaign")
    }

    pub fn list_campaigns(&self, status_filter: Option<CampaignStatus>) -> Result<Vec<Campaign>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CAMPAIGNS)?;
        let campaigns: Vec<Campaign> = all_records(&table, "campaign")?;

        Ok(campaigns
            .into_iter()
            .filter(|c| status_filter.map_or(true, |s| c.status == s))
            .collect())
    }

    pub fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<Campaign> {
        let write_txn = self.begin_write()?;
        let campaign = {
            let mut table = open_write(&write_txn, CAMPAIGNS)?;
            let mut campaign: Campaign = get_record(&table, campaign_id, "campaign")?
                .ok_or_else(|| anyhow!("Campaign not found: {}", campaign_id))?;
            campaign.status = status;
            put_record(&mut table, campaign_id, &campaign, "campaign")?;
            campaign
        };
        commit(write_txn)?;

        info!("Campaign {} is now {}", campaign_id, status.as_str());
        Ok(campaign)
    }

    // ========================================================================
    // Contact Operations
    // ========================================================================

    /// Append a pending contact to a campaign's dial queue
    pub fn add_contact(&self, campaign_id: &str, phone: &str, now: i64) -> Result<Contact> {
        let phone = phone.trim();
        if !is_valid_e164(phone) {
            return Err(anyhow!("Invalid E.164 phone number: {}", phone));
        }

        let write_txn = self.begin_write()?;
        let contact = {
            let campaigns = open_write(&write_txn, CAMPAIGNS)?;
            if get_record::<Campaign, _>(&campaigns, campaign_id, "campaign")?.is_none() {
                return Err(anyhow!("Campaign not found: {}", campaign_id));
            }

            let mut meta = open_write(&write_txn, META)?;
            let seq = next_seq(&mut meta, CONTACT_SEQ)?;

            let contact = Contact {
                id: Uuid::new_v4().to_string(),
                campaign_id: campaign_id.to_string(),
                phone: phone.to_string(),
                status: ContactStatus::Pending,
                attempts: 0,
                last_call_id: None,
                queue_seq: seq,
                created_at: now,
            };

            let mut contacts = open_write(&write_txn, CONTACTS)?;
            put_record(&mut contacts, &contact.id, &contact, "contact")?;

            let mut queue = open_write(&write_txn, CAMPAIGN_CONTACTS)?;
            queue
                .insert((campaign_id, seq), contact.id.as_str())
                .map_err(|e| anyhow!("Failed to enqueue contact: {}", e))?;

            let mut pending = open_write(&write_txn, PENDING_CONTACTS)?;
            enqueue_pending(&mut pending, &contact)?;
            contact
        };
        commit(write_txn)?;

        debug!("Added contact {} to campaign {}", contact.id, campaign_id);
        Ok(contact)
    }

    pub fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CONTACTS)?;
        get_record(&table, contact_id, "contact")
    }

    /// Contacts of a campaign in insertion order
    pub fn list_contacts(
        &self,
        campaign_id: &str,
        status_filter: Option<ContactStatus>,
    ) -> Result<Vec<Contact>> {
        let read_txn = self.begin_read()?;
        let queue = open_read(&read_txn, CAMPAIGN_CONTACTS)?;
        let contacts = open_read(&read_txn, CONTACTS)?;

        let mut results = Vec::new();
        for contact_id in queued_contact_ids(&queue, campaign_id)? {
            let Some(contact) = get_record::<Contact, _>(&contacts, &contact_id, "contact")? else {
                warn!("Queue entry points at missing contact {}", contact_id);
                continue;
            };
            if status_filter.map_or(true, |s| contact.status == s) {
                results.push(contact);
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Dispatch Operations
    // ========================================================================

    /// Reserve slots for a campaign and claim pending contacts into them.
    ///
    /// In one write transaction: re-read the campaign, count its in-flight
    /// calls, pop up to `free` contacts off the pending queue in insertion
    /// order, insert a `created` call for each and mark the contact `calling`.
    /// Returns None if the campaign is missing or no longer running.
    pub fn claim_dispatch_batch(&self, campaign_id: &str, now: i64) -> Result<Option<DispatchBatch>> {
        self.check_fault("claim_dispatch_batch")?;
        let write_txn = self.begin_write()?;
        let batch = {
            let campaigns = open_write(&write_txn, CAMPAIGNS)?;
            let campaign = match get_record::<Campaign, _>(&campaigns, campaign_id, "campaign")? {
                Some(c) if c.status == CampaignStatus::Running => c,
                _ => return Ok(None),
            };

            let mut in_flight = open_multimap_write(&write_txn, IN_FLIGHT)?;
            let occupied = in_flight
                .get(campaign_id)
                .map_err(|e| anyhow!("Failed to read in-flight index: {}", e))?
                .len();
            let snapshot = SlotSnapshot::new(campaign.concurrency, occupied);
            let free = snapshot.free() as usize;

            let mut claims = Vec::new();
            if free > 0 {
                let mut calls = open_write(&write_txn, CALLS)?;
                let mut pending = open_write(&write_txn, PENDING_CONTACTS)?;
                let mut contacts = open_write(&write_txn, CONTACTS)?;

                while claims.len() < free {
                    let head = pending_head(&pending, campaign_id, free - claims.len())?;
                    if head.is_empty() {
                        break;
                    }
                    for (seq, contact_id) in head {
                        pending
                            .remove((campaign_id, seq))
                            .map_err(|e| anyhow!("Failed to dequeue contact: {}", e))?;
                        let Some(mut contact) =
                            get_record::<Contact, _>(&contacts, &contact_id, "contact")?
                        else {
                            warn!("Pending queue points at missing contact {}", contact_id);
                            continue;
                        };
                        if contact.status != ContactStatus::Pending {
                            continue;
                        }

                        let call = Call {
                            id: Uuid::new_v4().to_string(),
                            campaign_id: Some(campaign_id.to_string()),
                            contact_id: Some(contact.id.clone()),
                            external_call_id: None,
                            status: CallStatus::Created,
                            duration: None,
                            cost: None,
                            recording_url: None,
                            created_at: now,
                            finished_at: None,
                            superseded_by: None,
                        };
                        put_record(&mut calls, &call.id, &call, "call")?;
                        in_flight
                            .insert(campaign_id, call.id.as_str())
                            .map_err(|e| anyhow!("Failed to index in-flight call: {}", e))?;

                        contact.status = ContactStatus::Calling;
                        contact.attempts += 1;
                        contact.last_call_id = Some(call.id.clone());
                        put_record(&mut contacts, &contact.id, &contact, "contact")?;

                        claims.push(DispatchClaim {
                            call_id: call.id,
                            contact_id: contact.id,
                            campaign_id: campaign_id.to_string(),
                            phone: contact.phone,
                        });
                    }
                }
            }

            DispatchBatch { snapshot, claims }
        };
        commit(write_txn)?;

        debug!(
            "Campaign {}: {} in flight of {}, claimed {}",
            campaign_id,
            batch.snapshot.in_flight,
            batch.snapshot.concurrency,
            batch.claims.len()
        );
        Ok(Some(batch))
    }

    /// Record the gateway's identifier on a dispatched call.
    ///
    /// If a webhook already bootstrapped a placeholder for this identifier,
    /// the dispatched call adopts it: the index moves over, the placeholder is
    /// marked superseded, and the archived deliveries for the identifier are
    /// replayed through the state machine onto the dispatched call.
    pub fn attach_external_call_id(&self, call_id: &str, external_id: &str) -> Result<AttachOutcome> {
        self.check_fault("attach_external_call_id")?;
        let write_txn = self.begin_write()?;
        let outcome = {
            let mut index = open_write(&write_txn, CALLS_BY_EXTERNAL_ID)?;
            let mut calls = open_write(&write_txn, CALLS)?;

            let mut call: Call = get_record(&calls, call_id, "call")?
                .ok_or_else(|| anyhow!("Call not found: {}", call_id))?;

            let owner = index
                .get(external_id)
                .map_err(|e| anyhow!("Failed to read external id index: {}", e))?
                .map(|guard| guard.value().to_string());

            let placeholder = match owner {
                None => None,
                Some(owner_id) if owner_id == call_id => None,
                Some(owner_id) => {
                    let existing: Option<Call> = get_record(&calls, &owner_id, "call")?;
                    match existing {
                        Some(p) if p.is_placeholder() => Some(p),
                        _ => {
                            return Ok(AttachOutcome::Conflict {
                                existing_call_id: owner_id,
                            })
                        }
                    }
                }
            };

            index
                .insert(external_id, call_id)
                .map_err(|e| anyhow!("Failed to index external id: {}", e))?;
            call.external_call_id = Some(external_id.to_string());

            match placeholder {
                None => {
                    put_record(&mut calls, call_id, &call, "call")?;
                    AttachOutcome::Linked
                }
                Some(mut placeholder) => {
                    let events = open_write(&write_txn, CALL_EVENTS)?;
                    let history = deliveries_for(&events, external_id, &placeholder.id)?;

                    let mut completes_contact = false;
                    for (kind, outcome, received_at) in &history {
                        let transition = apply_event(&mut call, *kind, outcome, *received_at);
                        completes_contact |= transition.completes_contact;
                    }
                    put_record(&mut calls, call_id, &call, "call")?;
                    if call.status.is_terminal() {
                        let mut in_flight = open_multimap_write(&write_txn, IN_FLIGHT)?;
                        release_slot(&mut in_flight, &call)?;
                    }

                    placeholder.superseded_by = Some(call_id.to_string());
                    put_record(&mut calls, &placeholder.id, &placeholder, "call")?;

                    if completes_contact {
                        if let Some(contact_id) = &call.contact_id {
                            let mut contacts = open_write(&write_txn, CONTACTS)?;
                            mark_contact_done(&mut contacts, contact_id)?;
                        }
                    }

                    info!(
                        "Call {} adopted placeholder {} for external id {} ({} deliveries replayed)",
                        call_id,
                        placeholder.id,
                        external_id,
                        history.len()
                    );
                    AttachOutcome::AdoptedPlaceholder {
                        placeholder_id: placeholder.id,
                        status: call.status,
                    }
                }
            }
        };
        commit(write_txn)?;

        debug!("Attached external id {} to call {}", external_id, call_id);
        Ok(outcome)
    }

    /// Mark a claimed call and its contact failed and archive the reason
    pub fn record_dispatch_failure(&self, claim: &DispatchClaim, detail: &str, now: i64) -> Result<()> {
        let payload = serde_json::json!({
            "error": detail,
            "phone": claim.phone,
            "campaign_id": claim.campaign_id,
            "contact_id": claim.contact_id,
        });

        self.check_fault("record_dispatch_failure")?;
        let write_txn = self.begin_write()?;
        {
            let mut calls = open_write(&write_txn, CALLS)?;
            let mut call: Call = get_record(&calls, &claim.call_id, "call")?
                .ok_or_else(|| anyhow!("Call not found: {}", claim.call_id))?;
            call.status = CallStatus::Failed;
            call.finished_at = Some(now);
            put_record(&mut calls, &call.id, &call, "call")?;

            let mut in_flight = open_multimap_write(&write_txn, IN_FLIGHT)?;
            release_slot(&mut in_flight, &call)?;

            let mut contacts = open_write(&write_txn, CONTACTS)?;
            let mut contact: Contact = get_record(&contacts, &claim.contact_id, "contact")?
                .ok_or_else(|| anyhow!("Contact not found: {}", claim.contact_id))?;
            contact.status = ContactStatus::Failed;
            put_record(&mut contacts, &contact.id, &contact, "contact")?;

            let mut meta = open_write(&write_txn, META)?;
            let mut events = open_write(&write_txn, CALL_EVENTS)?;
            append_event(
                &mut meta,
                &mut events,
                Some(&claim.call_id),
                START_FAILED_EVENT,
                payload.to_string(),
                now,
            )?;
        }
        commit(write_txn)?;

        debug!("Recorded dispatch failure for call {}", claim.call_id);
        Ok(())
    }

    /// Fail claimed calls that never got a gateway identifier and return their
    /// contacts to the queue. Covers a process dying between the claim and
    /// the gateway response. With `dry_run` nothing is written.
    ///
    /// Rejects cutoffs shorter than `MIN_REAP_AGE_SECS`, which would fail
    /// calls whose placement is still in progress.
    pub fn reap_unplaced_calls(&self, older_than_secs: i64, dry_run: bool, now: i64) -> Result<Vec<Call>> {
        if older_than_secs < MIN_REAP_AGE_SECS {
            return Err(anyhow!(
                "Reap cutoff must be at least {}s, got {}s",
                MIN_REAP_AGE_SECS,
                older_than_secs
            ));
        }
        let cutoff = now.saturating_sub(older_than_secs);

        if dry_run {
            let read_txn = self.begin_read()?;
            let in_flight = open_multimap_read(&read_txn, IN_FLIGHT)?;
            let calls = open_read(&read_txn, CALLS)?;
            return stale_unplaced_calls(&in_flight, &calls, cutoff);
        }

        let write_txn = self.begin_write()?;
        let reaped = {
            let mut in_flight = open_multimap_write(&write_txn, IN_FLIGHT)?;
            let mut calls = open_write(&write_txn, CALLS)?;
            let mut contacts = open_write(&write_txn, CONTACTS)?;
            let mut pending = open_write(&write_txn, PENDING_CONTACTS)?;
            let mut meta = open_write(&write_txn, META)?;
            let mut events = open_write(&write_txn, CALL_EVENTS)?;

            let stale = stale_unplaced_calls(&in_flight, &calls, cutoff)?;
            let mut reaped = Vec::new();
            for mut call in stale {
                call.status = CallStatus::Failed;
                call.finished_at = Some(now);
                put_record(&mut calls, &call.id, &call, "call")?;
                release_slot(&mut in_flight, &call)?;

                let contact_id = call.contact_id.clone().unwrap_or_default();
                if let Some(mut contact) = get_record::<Contact, _>(&contacts, &contact_id, "contact")? {
                    if contact.status == ContactStatus::Calling
                        && contact.last_call_id.as_deref() == Some(call.id.as_str())
                    {
                        contact.status = ContactStatus::Pending;
                        put_record(&mut contacts, &contact.id, &contact, "contact")?;
                        enqueue_pending(&mut pending, &contact)?;
                    }
                }

                let payload = serde_json::json!({ "contact_id": contact_id, "created_at": call.created_at });
                append_event(
                    &mut meta,
                    &mut events,
                    Some(&call.id),
                    DISPATCH_ABANDONED_EVENT,
                    payload.to_string(),
                    now,
                )?;
                reaped.push(call);
            }
            reaped
        };
        commit(write_txn)?;

        if !reaped.is_empty() {
            info!("Reaped {} unplaced calls older than {}s", reaped.len(), older_than_secs);
        }
        Ok(reaped)
    }

    // ========================================================================
    // Reconciliation Operations
    // ========================================================================

    /// Append a webhook delivery to the audit log, linked to the call that
    /// currently owns `external_id` (if any)
    pub fn archive_event(
        &self,
        external_id: Option<&str>,
        event_type: &str,
        payload: String,
        now: i64,
    ) -> Result<ArchivedEvent> {
        let write_txn = self.begin_write()?;
        let archived = {
            let call = match external_id {
                Some(ext) => {
                    let index = open_write(&write_txn, CALLS_BY_EXTERNAL_ID)?;
                    let calls = open_write(&write_txn, CALLS)?;
                    lookup_by_external_id(&index, &calls, ext)?
                }
                None => None,
            };

            let mut meta = open_write(&write_txn, META)?;
            let mut events = open_write(&write_txn, CALL_EVENTS)?;
            let event = append_event(
                &mut meta,
                &mut events,
                call.as_ref().map(|c| c.id.as_str()),
                event_type,
                payload,
                now,
            )?;
            ArchivedEvent { event, call }
        };
        commit(write_txn)?;

        debug!("Archived {} event {}", archived.event.event_type, archived.event.id);
        Ok(archived)
    }

    /// Bootstrap a call for an identifier no dispatched call owns yet.
    /// If the identifier was linked in the meantime, returns that call instead.
    pub fn create_placeholder_call(&self, external_id: &str, now: i64) -> Result<PlaceholderOutcome> {
        let write_txn = self.begin_write()?;
        let outcome = {
            let mut index = open_write(&write_txn, CALLS_BY_EXTERNAL_ID)?;
            let mut calls = open_write(&write_txn, CALLS)?;

            if let Some(existing) = lookup_by_external_id(&index, &calls, external_id)? {
                PlaceholderOutcome {
                    call: existing,
                    created: false,
                }
            } else {
                let call = Call {
                    id: Uuid::new_v4().to_string(),
                    campaign_id: None,
                    contact_id: None,
                    external_call_id: Some(external_id.to_string()),
                    status: CallStatus::Created,
                    duration: None,
                    cost: None,
                    recording_url: None,
                    created_at: now,
                    finished_at: None,
                    superseded_by: None,
                };
                put_record(&mut calls, &call.id, &call, "call")?;
                index
                    .insert(external_id, call.id.as_str())
                    .map_err(|e| anyhow!("Failed to index external id: {}", e))?;
                PlaceholderOutcome { call, created: true }
            }
        };
        commit(write_txn)?;

        if outcome.created {
            debug!("Created placeholder call {} for {}", outcome.call.id, external_id);
        }
        Ok(outcome)
    }

    /// Run one canonical event through the state machine and propagate a
    /// finish to the owning contact, in one transaction
    pub fn apply_call_event(
        &self,
        call_id: &str,
        kind: CallEventKind,
        outcome: &CallOutcome,
        now: i64,
    ) -> Result<AppliedEvent> {
        self.check_fault("apply_call_event")?;
        let write_txn = self.begin_write()?;
        let applied = {
            let mut calls = open_write(&write_txn, CALLS)?;
            let mut call: Call = get_record(&calls, call_id, "call")?
                .ok_or_else(|| anyhow!("Call not found: {}", call_id))?;

            let transition = apply_event(&mut call, kind, outcome, now);
            if transition.changed {
                put_record(&mut calls, call_id, &call, "call")?;
                if transition.to.is_terminal() {
                    let mut in_flight = open_multimap_write(&write_txn, IN_FLIGHT)?;
                    release_slot(&mut in_flight, &call)?;
                }
            }

            let mut completed_contact = None;
            if transition.completes_contact {
                if let Some(contact_id) = &call.contact_id {
                    let mut contacts = open_write(&write_txn, CONTACTS)?;
                    if mark_contact_done(&mut contacts, contact_id)? {
                        completed_contact = Some(contact_id.clone());
                    }
                }
            }

            AppliedEvent {
                call_id: call_id.to_string(),
                transition,
                completed_contact,
            }
        };
        commit(write_txn)?;

        Ok(applied)
    }

    // ========================================================================
    // Call & Event Queries
    // ========================================================================

    pub fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CALLS)?;
        get_record(&table, call_id, "call")
    }

    pub fn find_call_by_external_id(&self, external_id: &str) -> Result<Option<Call>> {
        let read_txn = self.begin_read()?;
        let index = open_read(&read_txn, CALLS_BY_EXTERNAL_ID)?;
        let calls = open_read(&read_txn, CALLS)?;
        lookup_by_external_id(&index, &calls, external_id)
    }

    /// Calls ordered by creation time, optionally for one campaign
    pub fn list_calls(&self, campaign_filter: Option<&str>) -> Result<Vec<Call>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CALLS)?;
        let mut calls: Vec<Call> = all_records(&table, "call")?;
        if let Some(campaign_id) = campaign_filter {
            calls.retain(|c| c.campaign_id.as_deref() == Some(campaign_id));
        }
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(calls)
    }

    /// Audit log in arrival order, optionally for one call
    pub fn list_events(&self, call_filter: Option<&str>) -> Result<Vec<CallEvent>> {
        let read_txn = self.begin_read()?;
        let table = open_read(&read_txn, CALL_EVENTS)?;

        let mut results = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| anyhow!("Failed to iterate call events: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let event: CallEvent = decode(value.value(), "call event")?;
            if call_filter.map_or(true, |id| event.call_id.as_deref() == Some(id)) {
                results.push(event);
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let read_txn = self.begin_read()?;

        let campaigns: Vec<Campaign> = all_records(&open_read(&read_txn, CAMPAIGNS)?, "campaign")?;
        let contacts: Vec<Contact> = all_records(&open_read(&read_txn, CONTACTS)?, "contact")?;
        let calls: Vec<Call> = all_records(&open_read(&read_txn, CALLS)?, "call")?;
        let total_events = open_read(&read_txn, CALL_EVENTS)?
            .iter()
            .map_err(|e| anyhow!("Failed to iterate call events: {}", e))?
            .count();

        let mut stats = DbStats {
            total_campaigns: campaigns.len(),
            total_contacts: contacts.len(),
            total_calls: calls.len(),
            total_events,
            ..Default::default()
        };
        for campaign in &campaigns {
            *stats.campaign_counts.entry(campaign.status.as_str().to_string()).or_insert(0) += 1;
        }
        for contact in &contacts {
            *stats.contact_counts.entry(contact.status.as_str().to_string()).or_insert(0) += 1;
        }
        for call in &calls {
            *stats.call_counts.entry(call.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Run a store operation on the blocking pool so redb's file I/O and write
/// lock never stall the async executor
pub async fn blocking<T, F>(db: &Arc<DialerDb>, op: F) -> DialerResult<T>
where
    T: Send + 'static,
    F: FnOnce(&DialerDb) -> Result<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| DialerError::Persistence(anyhow!("Store task failed: {}", e)))?
        .map_err(DialerError::from)
}

// ============================================================================
// Table Helpers
// ============================================================================

fn open_write<'txn, K: Key + 'static, V: Value + 'static>(
    txn: &'txn WriteTransaction,
    definition: TableDefinition<K, V>,
) -> Result<Table<'txn, K, V>> {
    txn.open_table(definition)
        .map_err(|e| anyhow!("Failed to open {} table: {}", definition.name(), e))
}

fn open_read<K: Key + 'static, V: Value + 'static>(
    txn: &ReadTransaction,
    definition: TableDefinition<K, V>,
) -> Result<ReadOnlyTable<K, V>> {
    txn.open_table(definition)
        .map_err(|e| anyhow!("Failed to open {} table: {}", definition.name(), e))
}

fn open_multimap_write<'txn, K: Key + 'static, V: Key + 'static>(
    txn: &'txn WriteTransaction,
    definition: MultimapTableDefinition<K, V>,
) -> Result<MultimapTable<'txn, K, V>> {
    txn.open_multimap_table(definition)
        .map_err(|e| anyhow!("Failed to open {} table: {}", definition.name(), e))
}

fn open_multimap_read<K: Key + 'static, V: Key + 'static>(
    txn: &ReadTransaction,
    definition: MultimapTableDefinition<K, V>,
) -> Result<ReadOnlyMultimapTable<K, V>> {
    txn.open_multimap_table(definition)
        .map_err(|e| anyhow!("Failed to open {} table: {}", definition.name(), e))
}

fn commit(txn: WriteTransaction) -> Result<()> {
    txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

fn get_record<T, R>(table: &R, key: &str, what: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table
        .get(key)
        .map_err(|e| anyhow!("Failed to get {}: {}", what, e))?
    {
        Some(value) => Ok(Some(decode(value.value(), what)?)),
        None => Ok(None),
    }
}

fn put_record<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &T,
    what: &str,
) -> Result<()> {
    let value = encode(record, what)?;
    table
        .insert(key, value.as_slice())
        .map_err(|e| anyhow!("Failed to insert {}: {}", what, e))?;
    Ok(())
}

fn all_records<T, R>(table: &R, what: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    let iter = table
        .iter()
        .map_err(|e| anyhow!("Failed to iterate {} records: {}", what, e))?;
    for entry in iter {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        results.push(decode(value.value(), what)?);
    }
    Ok(results)
}

fn next_seq(meta: &mut Table<'_, &'static str, u64>, name: &str) -> Result<u64> {
    let current = meta
        .get(name)
        .map_err(|e| anyhow!("Failed to read sequence {}: {}", name, e))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(name, next)
        .map_err(|e| anyhow!("Failed to advance sequence {}: {}", name, e))?;
    Ok(next)
}

fn queued_contact_ids<R>(queue: &R, campaign_id: &str) -> Result<Vec<String>>
where
    R: ReadableTable<(&'static str, u64), &'static str>,
{
    let iter = queue
        .range((campaign_id, 0u64)..=(campaign_id, u64::MAX))
        .map_err(|e| anyhow!("Failed to iterate contact queue: {}", e))?;

    let mut ids = Vec::new();
    for entry in iter {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        ids.push(value.value().to_string());
    }
    Ok(ids)
}

/// Up to `limit` entries from the front of a campaign's pending queue
fn pending_head<R>(pending: &R, campaign_id: &str, limit: usize) -> Result<Vec<(u64, String)>>
where
    R: ReadableTable<(&'static str, u64), &'static str>,
{
    let iter = pending
        .range((campaign_id, 0u64)..=(campaign_id, u64::MAX))
        .map_err(|e| anyhow!("Failed to iterate pending queue: {}", e))?;

    let mut head = Vec::with_capacity(limit);
    for entry in iter.take(limit) {
        let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        head.push((key.value().1, value.value().to_string()));
    }
    Ok(head)
}

fn enqueue_pending(pending: &mut Table<'_, (&'static str, u64), &'static str>, contact: &Contact) -> Result<()> {
    pending
        .insert((contact.campaign_id.as_str(), contact.queue_seq), contact.id.as_str())
        .map_err(|e| anyhow!("Failed to enqueue pending contact: {}", e))?;
    Ok(())
}

/// Drop a call from its campaign's in-flight index
fn release_slot(in_flight: &mut MultimapTable<'_, &'static str, &'static str>, call: &Call) -> Result<()> {
    if let Some(campaign_id) = &call.campaign_id {
        in_flight
            .remove(campaign_id.as_str(), call.id.as_str())
            .map_err(|e| anyhow!("Failed to release slot of call {}: {}", call.id, e))?;
    }
    Ok(())
}

/// In-flight calls still waiting for a gateway identifier, created before `cutoff`
fn stale_unplaced_calls<I, C>(in_flight: &I, calls: &C, cutoff: i64) -> Result<Vec<Call>>
where
    I: ReadableMultimapTable<&'static str, &'static str>,
    C: ReadableTable<&'static str, &'static [u8]>,
{
    let mut call_ids = Vec::new();
    let iter = in_flight
        .iter()
        .map_err(|e| anyhow!("Failed to iterate in-flight index: {}", e))?;
    for entry in iter {
        let (_campaign, values) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        for value in values {
            let value = value.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            call_ids.push(value.value().to_string());
        }
    }

    let mut stale = Vec::new();
    for call_id in call_ids {
        let Some(call) = get_record::<Call, _>(calls, &call_id, "call")? else {
            warn!("In-flight index points at missing call {}", call_id);
            continue;
        };
        if call.status == CallStatus::Created
            && call.external_call_id.is_none()
            && call.contact_id.is_some()
            && call.created_at < cutoff
        {
            stale.push(call);
        }
    }
    Ok(stale)
}

fn lookup_by_external_id<I, C>(index: &I, calls: &C, external_id: &str) -> Result<Option<Call>>
where
    I: ReadableTable<&'static str, &'static str>,
    C: ReadableTable<&'static str, &'static [u8]>,
{
    let call_id = index
        .get(external_id)
        .map_err(|e| anyhow!("Failed to read external id index: {}", e))?
        .map(|guard| guard.value().to_string());

    match call_id {
        Some(id) => get_record(calls, &id, "call"),
        None => Ok(None),
    }
}

fn append_event(
    meta: &mut Table<'_, &'static str, u64>,
    events: &mut Table<'_, u64, &'static [u8]>,
    call_id: Option<&str>,
    event_type: &str,
    payload: String,
    now: i64,
) -> Result<CallEvent> {
    let event = CallEvent {
        id: Uuid::new_v4().to_string(),
        call_id: call_id.map(String::from),
        event_type: event_type.to_string(),
        payload,
        received_at: now,
    };
    let seq = next_seq(meta, EVENT_SEQ)?;
    let value = encode(&event, "call event")?;
    events
        .insert(seq, value.as_slice())
        .map_err(|e| anyhow!("Failed to insert call event: {}", e))?;
    Ok(event)
}

/// Returns true when the contact changed
fn mark_contact_done(contacts: &mut Table<'_, &'static str, &'static [u8]>, contact_id: &str) -> Result<bool> {
    let Some(mut contact) = get_record::<Contact, _>(&*contacts, contact_id, "contact")? else {
        warn!("Finished call references missing contact {}", contact_id);
        return Ok(false);
    };
    if contact.status == ContactStatus::Done {
        return Ok(false);
    }
    contact.status = ContactStatus::Done;
    put_record(contacts, contact_id, &contact, "contact")?;
    debug!("Contact {} done", contact_id);
    Ok(true)
}

/// Archived webhook deliveries for an identifier that were matched to the
/// placeholder or to nothing, canonicalized for replay in arrival order
fn deliveries_for<R>(
    events: &R,
    external_id: &str,
    placeholder_id: &str,
) -> Result<Vec<(CallEventKind, CallOutcome, i64)>>
where
    R: ReadableTable<u64, &'static [u8]>,
{
    let iter = events
        .iter()
        .map_err(|e| anyhow!("Failed to iterate call events: {}", e))?;

    let mut history = Vec::new();
    for entry in iter {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        let event: CallEvent = decode(value.value(), "call event")?;
        if event.call_id.as_deref().is_some_and(|id| id != placeholder_id) {
            continue;
        }
        let Ok(doc) = serde_json::from_str::<serde_json::Value>(&event.payload) else {
            continue;
        };
        if extract::webhook_call_id(&doc).as_deref() != Some(external_id) {
            continue;
        }
        let kind = CallEventKind::from_payload(&doc);
        history.push((kind, CallOutcome::from_payload(&doc), event.received_at));
    }
    Ok(history)
}

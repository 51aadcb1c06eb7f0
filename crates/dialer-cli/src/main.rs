// ============================================================================
// dialer-db - CLI database tool for the campaign dialer
// ============================================================================
// Usage:
//   dialer-db stats                                   Show database statistics
//   dialer-db put-campaign --id ID --concurrency N    Create or update a campaign
//   dialer-db set-status --id ID running              Start/pause/complete a campaign
//   dialer-db import-contacts --campaign ID --file F  Load phone numbers (one per line)
//   dialer-db list-campaigns                          List campaigns
//   dialer-db list-contacts --campaign ID             List a campaign's contacts
//   dialer-db list-calls [--campaign ID]              List calls
//   dialer-db events [--call ID]                      Show the webhook/dispatch audit log
//   dialer-db export --format json                    Export full database as JSON
//   dialer-db reap --older-than-mins 10               Release calls that never reached the gateway
// ============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use dialer_core::db::MIN_REAP_AGE_SECS;
use dialer_core::{Campaign, CampaignStatus, ContactStatus, DialerConfig, DialerDb};
use std::time::Duration;

/// Campaign dialer database tool
#[derive(Parser)]
#[command(name = "dialer-db", version, about = "Seed and inspect the campaign dialer database")]
struct Cli {
    /// Path to the database file (default: ~/.campaign-dialer/dialer.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (campaigns, contacts, calls, events)
    Stats,

    /// Create a campaign, or update an existing one's concurrency and status
    PutCampaign {
        #[arg(long)]
        id: String,

        /// Maximum simultaneous in-flight calls
        #[arg(long)]
        concurrency: u32,

        /// draft, running, paused, completed
        #[arg(long, default_value = "draft")]
        status: String,
    },

    /// Change a campaign's status
    SetStatus {
        #[arg(long)]
        id: String,

        /// draft, running, paused, completed
        status: String,
    },

    /// Import E.164 phone numbers, one per line (blank lines and # comments skipped)
    ImportContacts {
        #[arg(long)]
        campaign: String,

        #[arg(long)]
        file: String,
    },

    /// List campaigns
    ListCampaigns,

    /// List a campaign's contacts in dial order
    ListContacts {
        #[arg(long)]
        campaign: String,

        /// Filter by status: pending, calling, done, failed
        #[arg(long)]
        status: Option<String>,
    },

    /// List calls, oldest first
    ListCalls {
        #[arg(long)]
        campaign: Option<String>,
    },

    /// Show archived call events in arrival order
    Events {
        #[arg(long)]
        call: Option<String>,
    },

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Fail calls that were claimed but never placed, and requeue their contacts
    Reap {
        /// Minimum age of a claimed call, at least the gateway timeout
        #[arg(long, default_value = "10", value_parser = clap::value_parser!(i64).range(1..))]
        older_than_mins: i64,

        /// Show what would be reaped without writing
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_campaign_status(s: &str) -> Result<CampaignStatus> {
    CampaignStatus::from_str(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown status '{}'. Valid values: draft, running, paused, completed",
            s
        )
    })
}

fn parse_contact_status(s: &str) -> Result<ContactStatus> {
    ContactStatus::from_str(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown status '{}'. Valid values: pending, calling, done, failed",
            s
        )
    })
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = DialerDb::open(cli.db_path.as_deref())?;

    match cli.command {
        Commands::Stats => cmd_stats(&db),
        Commands::PutCampaign {
            id,
            concurrency,
            status,
        } => cmd_put_campaign(&db, &id, concurrency, &status),
        Commands::SetStatus { id, status } => cmd_set_status(&db, &id, &status),
        Commands::ImportContacts { campaign, file } => cmd_import_contacts(&db, &campaign, &file),
        Commands::ListCampaigns => cmd_list_campaigns(&db),
        Commands::ListContacts { campaign, status } => cmd_list_contacts(&db, &campaign, status),
        Commands::ListCalls { campaign } => cmd_list_calls(&db, campaign.as_deref()),
        Commands::Events { call } => cmd_events(&db, call.as_deref()),
        Commands::Export { format } => cmd_export(&db, &format),
        Commands::Reap {
            older_than_mins,
            dry_run,
        } => cmd_reap(&db, older_than_mins, dry_run),
    }
}

fn cmd_stats(db: &DialerDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Campaign Dialer Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Campaigns: {} total", stats.total_campaigns);
    for (status, count) in &stats.campaign_counts {
        println!("  {:12} {}", status, count);
    }
    println!("Contacts:  {} total", stats.total_contacts);
    for (status, count) in &stats.contact_counts {
        println!("  {:12} {}", status, count);
    }
    println!("Calls:     {} total", stats.total_calls);
    for (status, count) in &stats.call_counts {
        println!("  {:12} {}", status, count);
    }
    println!("Events:    {}", stats.total_events);

    Ok(())
}

fn cmd_put_campaign(db: &DialerDb, id: &str, concurrency: u32, status: &str) -> Result<()> {
    let status = parse_campaign_status(status)?;
    let created_at = db
        .get_campaign(id)?
        .map(|c| c.created_at)
        .unwrap_or_else(|| Utc::now().timestamp());

    db.put_campaign(&Campaign {
        id: id.to_string(),
        status,
        concurrency,
        created_at,
    })?;

    println!(
        "Campaign {} saved (concurrency {}, {})",
        id,
        concurrency,
        status.as_str()
    );
    Ok(())
}

fn cmd_set_status(db: &DialerDb, id: &str, status: &str) -> Result<()> {
    let campaign = db.set_campaign_status(id, parse_campaign_status(status)?)?;
    println!("Campaign {} is now {}", campaign.id, campaign.status.as_str());
    Ok(())
}

fn cmd_import_contacts(db: &DialerDb, campaign: &str, file: &str) -> Result<()> {
    if db.get_campaign(campaign)?.is_none() {
        anyhow::bail!("Campaign '{}' does not exist. Create it with put-campaign first.", campaign);
    }

    let content = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let now = Utc::now().timestamp();

    let mut imported = 0;
    let mut rejected = 0;
    for (line_no, line) in content.lines().enumerate() {
        let phone = line.trim();
        if phone.is_empty() || phone.starts_with('#') {
            continue;
        }
        match db.add_contact(campaign, phone, now) {
            Ok(_) => imported += 1,
            Err(e) => {
                rejected += 1;
                eprintln!("line {}: {}", line_no + 1, e);
            }
        }
    }

    println!("Imported {} contacts into {} ({} rejected)", imported, campaign, rejected);
    Ok(())
}

fn cmd_list_campaigns(db: &DialerDb) -> Result<()> {
    let campaigns = db.list_campaigns(None)?;

    if campaigns.is_empty() {
        println!("No campaigns found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<10}  {:>11}  {:>8}  {}",
        "CAMPAIGN", "STATUS", "CONCURRENCY", "PENDING", "CREATED AT"
    );
    println!("{}", "-".repeat(84));

    for campaign in &campaigns {
        let pending = db
            .list_contacts(&campaign.id, Some(ContactStatus::Pending))?
            .len();
        println!(
            "{:<24}  {:<10}  {:>11}  {:>8}  {}",
            campaign.id,
            campaign.status.as_str(),
            campaign.concurrency,
            pending,
            format_timestamp(campaign.created_at)
        );
    }

    println!("\nTotal: {} campaigns", campaigns.len());
    Ok(())
}

fn cmd_list_contacts(db: &DialerDb, campaign: &str, status_filter: Option<String>) -> Result<()> {
    let filter = status_filter.as_deref().map(parse_contact_status).transpose()?;
    let contacts = db.list_contacts(campaign, filter)?;

    if contacts.is_empty() {
        println!("No contacts found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<8}  {:>8}  {}",
        "CONTACT ID", "PHONE", "STATUS", "ATTEMPTS", "LAST CALL"
    );
    println!("{}", "-".repeat(110));

    for contact in &contacts {
        println!(
            "{:<36}  {:<16}  {:<8}  {:>8}  {}",
            contact.id,
            contact.phone,
            contact.status.as_str(),
            contact.attempts,
            contact.last_call_id.as_deref().unwrap_or("-")
        );
    }

    println!("\nTotal: {} contacts", contacts.len());
    Ok(())
}

fn cmd_list_calls(db: &DialerDb, campaign: Option<&str>) -> Result<()> {
    let calls = db.list_calls(campaign)?;

    if calls.is_empty() {
        println!("No calls found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<11}  {:>8}  {:>8}  {}",
        "CALL ID", "EXTERNAL ID", "STATUS", "DURATION", "COST", "CREATED AT"
    );
    println!("{}", "-".repeat(120));

    for call in &calls {
        let external = call
            .external_call_id
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(24)
            .collect::<String>();
        let status = match (&call.superseded_by, call.is_placeholder()) {
            (Some(_), _) => "superseded".to_string(),
            (None, true) => format!("{}*", call.status.as_str()),
            (None, false) => call.status.as_str().to_string(),
        };
        println!(
            "{:<36}  {:<24}  {:<11}  {:>8}  {:>8}  {}",
            call.id,
            external,
            status,
            call.duration.map(|d| format!("{}s", d)).unwrap_or_else(|| "-".into()),
            call.cost.map(|c| format!("{:.4}", c)).unwrap_or_else(|| "-".into()),
            format_timestamp(call.created_at)
        );
    }

    println!("\nTotal: {} calls (* = webhook placeholder)", calls.len());
    Ok(())
}

fn cmd_events(db: &DialerDb, call: Option<&str>) -> Result<()> {
    let events = db.list_events(call)?;

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    for event in &events {
        println!(
            "{}  {:<18}  call={}",
            format_timestamp(event.received_at),
            event.event_type,
            event.call_id.as_deref().unwrap_or("-")
        );
        println!("    {}", event.payload.chars().take(200).collect::<String>());
    }

    println!("\nTotal: {} events", events.len());
    Ok(())
}

fn cmd_export(db: &DialerDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let campaigns = db.list_campaigns(None)?;
    let mut contacts = Vec::new();
    for campaign in &campaigns {
        contacts.extend(db.list_contacts(&campaign.id, None)?);
    }
    let calls = db.list_calls(None)?;
    let events = db.list_events(None)?;
    let stats = db.stats()?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "campaigns": campaigns,
        "contacts": contacts,
        "calls": calls,
        "events": events,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_reap(db: &DialerDb, older_than_mins: i64, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("=== DRY RUN: nothing will be written ===\n");
    }

    let gateway_timeout = DialerConfig::from_env().gateway.timeout;
    let older_than_secs = reap_cutoff_secs(older_than_mins, gateway_timeout)?;
    let reaped = db.reap_unplaced_calls(older_than_secs, dry_run, Utc::now().timestamp())?;

    for call in &reaped {
        println!(
            "{}  contact={}  created {}",
            call.id,
            call.contact_id.as_deref().unwrap_or("-"),
            format_timestamp(call.created_at)
        );
    }

    let verb = if dry_run { "Would reap" } else { "Reaped" };
    println!(
        "{} {} unplaced calls older than {} minutes",
        verb,
        reaped.len(),
        older_than_mins
    );
    Ok(())
}

/// Reap cutoff in seconds. A call younger than the gateway timeout may still
/// be waiting on its placement response.
fn reap_cutoff_secs(older_than_mins: i64, gateway_timeout: Duration) -> Result<i64> {
    let secs = older_than_mins
        .checked_mul(60)
        .context("--older-than-mins is too large")?;
    let floor = i64::try_from(gateway_timeout.as_secs())
        .unwrap_or(i64::MAX)
        .max(MIN_REAP_AGE_SECS);
    if secs < floor {
        anyhow::bail!(
            "--older-than-mins {} is shorter than the {}s gateway timeout floor",
            older_than_mins,
            floor
        );
    }
    Ok(secs)
}

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::app::{field_values, App, InstantOutcome, QueueNotice};
use crate::config::AppConfig;
use crate::error::SaveError;
use crate::journaling::DraftSnapshot;
use crate::model::{allowed_values, EditableRecord, Field, FieldValue, RecordId};
use crate::storage::StorageHandle;
use crate::sync::{conflict, NetworkStatus, PendingOperation, QueueReport};

/// Upper bound on records loaded into the displayed set for one command.
const DISPLAY_LIMIT: usize = 1000;

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Maximum number of records printed
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

impl Default for ListArgs {
    fn default() -> Self {
        Self { limit: 50 }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Record identifier
    pub id: RecordId,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    /// Record identifier
    pub id: RecordId,
    /// Field to change (category, urgency, action)
    pub field: Field,
    /// New value, case-insensitive
    pub value: String,
    /// Version the change is based on (defaults to the stored version)
    #[arg(long)]
    pub expect_version: Option<i64>,
    /// Queue the change instead of contacting the store
    #[arg(long)]
    pub offline: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueCommand {
    /// Print queued writes in replay order
    List,
    /// Replay queued writes now
    Drain,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DraftCommand {
    /// Print the stored draft, if any
    Show,
    /// Delete the stored draft
    Discard,
}

pub fn list_records(storage: &StorageHandle, args: ListArgs) -> Result<()> {
    let records = storage
        .fetch_records(args.limit)
        .context("loading records")?;
    print!("{}", format_records(&records));
    Ok(())
}

pub fn show_record(storage: &StorageHandle, args: ShowArgs) -> Result<()> {
    let record = storage
        .fetch_record(args.id)?
        .with_context(|| format!("record {} not found", args.id))?;
    print!("{}", format_record_detail(&record));
    Ok(())
}

pub async fn set_field(config: Arc<AppConfig>, storage: StorageHandle, args: SetArgs) -> Result<()> {
    let app = open_app(config, &storage, !args.offline)?;
    let output = apply_set(&app, &args).await?;
    print!("{output}");
    Ok(())
}

pub async fn handle_queue_command(
    config: Arc<AppConfig>,
    storage: StorageHandle,
    command: QueueCommand,
) -> Result<()> {
    let app = open_app(config, &storage, true)?;
    let output = match command {
        QueueCommand::List => format_queue(&app.pending_operations()),
        QueueCommand::Drain => drain_queue(&app).await?,
    };
    print!("{output}");
    Ok(())
}

pub fn handle_draft_command(
    config: Arc<AppConfig>,
    storage: StorageHandle,
    command: DraftCommand,
) -> Result<()> {
    let app = open_app(config, &storage, true)?;
    match command {
        DraftCommand::Show => match app.load_draft()? {
            Some(draft) => print!("{}", format_draft(&draft)),
            None => println!("No draft stored."),
        },
        DraftCommand::Discard => {
            app.discard_draft()?;
            println!("Draft discarded.");
        }
    }
    Ok(())
}

fn open_app(config: Arc<AppConfig>, storage: &StorageHandle, online: bool) -> Result<App> {
    let network = Arc::new(NetworkStatus::new(online));
    let app = App::new(
        config,
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        network,
    )?;
    app.show_records(storage.fetch_records(DISPLAY_LIMIT)?);
    Ok(app)
}

async fn apply_set(app: &App, args: &SetArgs) -> Result<String> {
    let coordinator = app.coordinator();
    let shown = coordinator
        .displayed(args.id)
        .with_context(|| format!("record {} not found", args.id))?;
    if let Some(version) = args.expect_version {
        if version != shown.version {
            let mut stale = shown.clone();
            stale.version = version;
            coordinator.display(stale);
        }
    }
    let value = FieldValue::parse(args.field, &args.value).map_err(|message| anyhow!(message))?;
    let previous = shown.fields.get(args.field);

    let mut out = String::new();
    match app.instant_save(args.id, args.field, value, previous).await {
        Ok(InstantOutcome::Applied(change)) => {
            let version = coordinator
                .displayed(args.id)
                .map_or(shown.version, |record| record.version);
            let _ = writeln!(
                &mut out,
                "Updated #{} {}: {} -> {} (version {version})",
                change.record_id, change.field, change.previous_value, change.new_value
            );
        }
        Ok(InstantOutcome::Unchanged) => {
            let _ = writeln!(
                &mut out,
                "#{} {} is already {value}; nothing to save",
                args.id, args.field
            );
        }
        Ok(InstantOutcome::Queued(op)) => {
            let _ = writeln!(
                &mut out,
                "Queued {} for #{} ({}); {} write(s) pending",
                op.payload,
                op.record_id,
                op.reason,
                app.queue_size()
            );
        }
        Err(SaveError::Conflict(descriptor)) => {
            bail!(
                "record {} changed on the server (version {} -> {}); nothing written\n\n{}",
                descriptor.record_id,
                descriptor.baseline.version,
                descriptor.server.version,
                conflict::format_rows(&conflict::diff(&descriptor))
            );
        }
        Err(err) => {
            return Err(err).with_context(|| format!("saving {} on record {}", args.field, args.id))
        }
    }
    Ok(out)
}

async fn drain_queue(app: &App) -> Result<String> {
    if app.queue_size() == 0 {
        return Ok("Queue is empty.\n".to_string());
    }
    let report = app
        .process_queue()
        .await
        .context("another drain is already running")?;
    let mut out = String::new();
    for notice in app.take_queue_notices() {
        out.push_str(&format_notice(&notice));
    }
    out.push_str(&format_report(&report));
    Ok(out)
}

fn format_records(records: &[EditableRecord]) -> String {
    if records.is_empty() {
        return "No records.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "{:<4} {:<4} {:<12} {:<9} {:<10} {}",
        "ID", "VER", "CATEGORY", "URGENCY", "ACTION", "CORRECTED"
    );
    for record in records {
        let corrected = match (&record.corrected_by, record.corrected_at) {
            (Some(by), Some(at)) => format!("{by} {}", format_timestamp(at)),
            (Some(by), None) => by.clone(),
            _ => "-".to_string(),
        };
        let _ = writeln!(
            &mut out,
            "{:<4} {:<4} {:<12} {:<9} {:<10} {}",
            record.id,
            record.version,
            record.fields.category.to_string(),
            record.fields.urgency.to_string(),
            record.fields.action.to_string(),
            corrected
        );
    }
    out
}

fn format_record_detail(record: &EditableRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "#{}  version {}", record.id, record.version);
    for (field, value) in field_values(&record.fields) {
        let _ = writeln!(
            &mut out,
            "    {:<9} {:<12} [{}]",
            field.to_string(),
            value.to_string(),
            allowed_values(field).join(" ")
        );
    }
    if let Some(by) = &record.corrected_by {
        let when = record
            .corrected_at
            .map(format_timestamp)
            .unwrap_or_else(|| "unknown time".to_string());
        let _ = writeln!(&mut out, "    corrected by {by} at {when}");
    }
    out
}

fn format_queue(ops: &[PendingOperation]) -> String {
    if ops.is_empty() {
        return "Queue is empty.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "{:<8} {:<9} {:<9} {:<14} {}",
        "RECORD", "EXPECTED", "ATTEMPTS", "REASON", "PAYLOAD"
    );
    for op in ops {
        let _ = writeln!(
            &mut out,
            "{:<8} {:<9} {:<9} {:<14} {}",
            op.record_id,
            op.expected_version,
            op.attempts,
            op.reason.to_string(),
            op.payload
        );
    }
    out
}

fn format_notice(notice: &QueueNotice) -> String {
    match notice {
        QueueNotice::Applied { record_id, version } => {
            format!("applied   #{record_id} -> version {version}\n")
        }
        QueueNotice::Conflict(descriptor) => format!(
            "conflict  #{}: server is at version {}, queued change discarded\n{}",
            descriptor.record_id,
            descriptor.server.version,
            conflict::format_rows(&conflict::diff(descriptor))
        ),
        QueueNotice::Dropped { record_id, message } => {
            format!("dropped   #{record_id}: {message}\n")
        }
    }
}

fn format_report(report: &QueueReport) -> String {
    let mut out = format!(
        "{} applied, {} conflicted, {} dropped, {} remaining\n",
        report.applied, report.conflicts, report.dropped, report.remaining
    );
    if let Some(delay) = report.retry_in {
        let _ = writeln!(&mut out, "store unreachable; retry in {}s", delay.as_secs().max(1));
    }
    out
}

fn format_draft(draft: &DraftSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "Draft for #{} based on version {}, saved {}",
        draft.record_id,
        draft.base_version,
        draft
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| draft.timestamp.unix_timestamp().to_string())
    );
    for (field, value) in field_values(&draft.fields) {
        let _ = writeln!(&mut out, "    {:<9} {}", field.to_string(), value);
    }
    out
}

fn format_timestamp(epoch: i64) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .map(|dt| dt.format(&Rfc3339).unwrap_or_else(|_| epoch.to_string()))
        .unwrap_or_else(|_| epoch.to_string())
}

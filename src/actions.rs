use crate::{
    analytics::{self, AttributionField, LeadFilter},
    clients,
    config::{ClientConfig, Config},
    events::ChangeOrigin,
    integrations::{
        sheets::{HttpSheetSource, SheetSource},
        webapp::http_transports,
    },
    models::{Lead, display_label},
    outbox::DeliveryStatus,
    runtime::{self, TickReport, scheduler::SyncScheduler},
    storage::{FileBackend, StateHandle},
    tenant::{TenantContext, purge_tenant},
    tracker::{LabelChangeTracker, TrackOutcome, TrackRequest},
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate};
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

pub fn open_state(config: &Config) -> StateHandle {
    let backend = Arc::new(FileBackend::new(&config.data.dir));
    StateHandle::new(backend, config.sync.persist_delay())
}

fn open_tenant(config: &Config, client: &str) -> Result<TenantContext> {
    TenantContext::open(config, client, open_state(config))
}

pub fn list_clients(config: &Config, config_path: &Path) {
    if config.clients.is_empty() {
        println!(
            "No clients configured. Run `leadsync clients add` or add [[clients]] to {}.",
            config_path.display()
        );
        return;
    }
    println!(
        "{}  {}  {}  {}",
        cell("ID", 18),
        cell("NAME", 24),
        cell("SHEET", 20),
        "HISTORY"
    );
    for client in &config.clients {
        let history = match (client.has_history_sheet(), client.has_history_sink()) {
            (true, true) => "sheet+endpoint",
            (true, false) => "sheet",
            (false, true) => "endpoint",
            (false, false) => "-",
        };
        println!(
            "{}  {}  {}  {}",
            cell(&client.id, 18),
            cell(&client.name, 24),
            cell(&client.sheet_id, 20),
            history
        );
    }
}

pub fn import_clients(config: &mut Config, config_path: &Path, url_or_id: &str) -> Result<()> {
    let sheet_id = clients::extract_sheet_id(url_or_id)
        .ok_or_else(|| anyhow!("Invalid configuration sheet URL: {url_or_id}"))?;
    let source = HttpSheetSource::new(&config.sheets.export_base_url, config.sync.request_timeout())?;
    let csv = source
        .fetch_csv(&sheet_id, 0)
        .map_err(|e| anyhow!(e.message()))?;
    let imported = clients::parse_client_sheet(&csv).map_err(|e| anyhow!(e.message()))?;

    let count = imported.len();
    config.upsert_clients(imported);
    config.sheets.clients_sheet_id = sheet_id;
    config
        .save_to_path(config_path)
        .context("failed to save config")?;
    println!("Imported {count} client(s) from the configuration sheet.");
    Ok(())
}

/// Optional fields for a client added from the command line.
#[derive(Debug, Default)]
pub struct NewClient {
    pub sheet: Option<String>,
    pub history_sheet: Option<String>,
    pub webapp_url: Option<String>,
    pub labels: Vec<String>,
}

pub fn add_client(config: &mut Config, config_path: &Path, name: &str, fields: NewClient) -> Result<()> {
    let mut client = clients::create_client(&config.clients, name, fields.sheet.as_deref())
        .map_err(|e| anyhow!(e.message()))?;
    if let Some(history) = fields.history_sheet.as_deref() {
        client.history_sheet_id =
            clients::extract_sheet_id(history).unwrap_or_else(|| history.trim().to_string());
    }
    client.history_webapp_url = fields.webapp_url.unwrap_or_default().trim().to_string();
    client.conversion_labels = fields
        .labels
        .iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect();

    println!("Added client {} ({}).", client.name, client.id);
    config.clients.push(client);
    config
        .save_to_path(config_path)
        .context("failed to save config")?;
    sync_registry(config);
    Ok(())
}

pub fn remove_client(config: &mut Config, config_path: &Path, client: &str, keep_data: bool) -> Result<()> {
    let removed = clients::remove_client(&mut config.clients, client)
        .map_err(|e| anyhow!(e.message()))?;
    config
        .save_to_path(config_path)
        .context("failed to save config")?;
    if !keep_data {
        let state = open_state(config);
        purge_tenant(&state, &removed.id);
        state.flush();
    }
    println!("Removed client {} ({}).", removed.name, removed.id);
    sync_registry(config);
    Ok(())
}

pub fn export_clients(config: &Config, sheet: Option<&str>, endpoint: Option<&str>) -> Result<()> {
    let sheet_id = match sheet {
        Some(sheet) => clients::extract_sheet_id(sheet)
            .ok_or_else(|| anyhow!("Invalid configuration sheet URL: {sheet}"))?,
        None => config.sheets.clients_sheet_id.trim().to_string(),
    };
    if sheet_id.is_empty() {
        bail!("No configuration sheet known. Pass --sheet or import clients first.");
    }
    let endpoint = endpoint.unwrap_or_else(|| config.clients_endpoint());

    match write_registry(config, &config.clients, &sheet_id, endpoint)? {
        Some(strategy) => println!(
            "Exported {} client(s) to the configuration sheet via {strategy}.",
            config.clients.len()
        ),
        None => println!("No clients to export."),
    }
    Ok(())
}

fn write_registry(
    config: &Config,
    registry: &[ClientConfig],
    sheet_id: &str,
    endpoint: &str,
) -> Result<Option<&'static str>> {
    let transports =
        http_transports(config.sync.request_timeout()).context("failed to create HTTP client")?;
    clients::export_clients(registry, sheet_id, endpoint, &transports)
        .map_err(|e| anyhow!("Could not export clients: {e}"))
}

/// Best-effort write-back after the local registry changed.
fn sync_registry(config: &Config) {
    let sheet_id = config.sheets.clients_sheet_id.trim();
    let endpoint = config.clients_endpoint();
    if sheet_id.is_empty() || endpoint.is_empty() {
        return;
    }
    if let Err(e) = write_registry(config, &config.clients, sheet_id, endpoint) {
        warn!(error = %e, "client registry not synced");
        eprintln!("{e}");
    }
}

pub fn import_leads(
    config: &mut Config,
    config_path: &Path,
    client: &str,
    sheet: Option<&str>,
) -> Result<()> {
    if let Some(sheet) = sheet {
        let sheet_id = clients::extract_sheet_id(sheet)
            .ok_or_else(|| anyhow!("Invalid spreadsheet URL: {sheet}"))?;
        let id = config
            .client(client)
            .map(|c| c.id.clone())
            .ok_or_else(|| anyhow!("unknown client: {client}"))?;
        if let Some(entry) = config.clients.iter_mut().find(|c| c.id == id) {
            entry.sheet_id = sheet_id;
        }
        config
            .save_to_path(config_path)
            .context("failed to save config")?;
    }

    let ctx = open_tenant(config, client)?;
    let report = runtime::tick(&ctx, ChangeOrigin::Import).map_err(|e| anyhow!(e.message()))?;
    ctx.flush();
    println!(
        "Imported {} lead(s): {} new, {} label change(s) recorded.",
        report.fetched, report.inserted, report.appended
    );
    print_tick_problems(&report);
    Ok(())
}

pub fn sync(config: &Config, client: &str) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let scheduler = SyncScheduler::new(ctx.clone());
    let report = match scheduler.run_now() {
        Some(result) => result.map_err(|e| anyhow!(e.message()))?,
        None => bail!("a sync is already running"),
    };
    ctx.flush();

    println!(
        "Synced {}: {} change(s), {} row(s) sent, {} confirmed.",
        ctx.client.name,
        report.changes.len(),
        report.transmitted + report.reconcile.resent,
        report.reconcile.confirmed
    );
    for change in &report.changes {
        println!(
            "  {}  {} -> {}",
            cell(&change.lead_name, 28),
            change.previous_label,
            change.new_label
        );
    }
    print_tick_problems(&report);
    Ok(())
}

fn print_tick_problems(report: &TickReport) {
    for (lead_id, message) in &report.transmit_failures {
        eprintln!("warning: {lead_id}: {message}");
    }
    for ambiguity in &report.ambiguities {
        eprintln!(
            "warning: \"{}\" matched {} leads; used {}",
            ambiguity.fetched_name,
            ambiguity.candidates.len(),
            ambiguity.chosen
        );
    }
    if let Some(error) = &report.reconcile.error {
        eprintln!("warning: remote history: {error}");
    }
}

/// Polls until Enter or end of input, printing every change notification.
pub fn watch(config: &Config, client: &str, interval_secs: Option<u64>) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let interval = interval_secs
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(ctx.settings.interval);
    let notifications = ctx.events.subscribe();
    let mut scheduler = SyncScheduler::new(ctx.clone());
    scheduler.start(interval);
    println!(
        "Watching {} every {}s. Press Enter to stop.",
        ctx.client.name,
        interval.as_secs()
    );

    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = quit_tx.send(());
    });

    loop {
        match notifications.recv_timeout(Duration::from_millis(250)) {
            Ok(notification) => {
                let at = notification.timestamp.with_timezone(&Local);
                for change in &notification.changes {
                    println!(
                        "[{}] {}  {} -> {}",
                        at.format("%H:%M:%S"),
                        cell(&change.lead_name, 28),
                        change.previous_label,
                        change.new_label
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if quit_rx.try_recv().is_ok() {
            break;
        }
    }

    scheduler.stop();
    let status = scheduler.status();
    if status.degraded {
        eprintln!(
            "warning: background sync is degraded ({} failures in a row): {}",
            status.consecutive_failures,
            status.last_error.unwrap_or_default()
        );
    }
    ctx.flush();
    info!(tenant = ctx.tenant_id(), "watch ended");
    Ok(())
}

pub fn track(
    config: &Config,
    client: &str,
    lead: &str,
    label: &str,
    reason: Option<String>,
    actor: Option<String>,
) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let (lead_id, previous) = {
        let store = ctx.lock();
        let found = store
            .history
            .find_lead(lead)
            .ok_or_else(|| anyhow!("Lead not found: {lead}"))?;
        (found.id.clone(), found.current_label.clone())
    };

    let tracker = LabelChangeTracker::new(ctx.clone());
    let outcome = tracker
        .track(TrackRequest {
            lead_id,
            previous_label: previous,
            new_label: label.to_string(),
            reason,
            actor,
        })
        .recv()
        .context("label tracker stopped unexpectedly")?;
    tracker.wait_idle();
    ctx.flush();

    match outcome {
        TrackOutcome::Applied(entry) => println!(
            "{}: {} -> {} (by {})",
            entry.lead_name, entry.previous_label, entry.new_label, entry.actor
        ),
        TrackOutcome::Unchanged => println!("Label unchanged; nothing recorded."),
        TrackOutcome::Duplicate => println!("The same change was just recorded; skipped."),
        TrackOutcome::Superseded => println!("A newer change for this lead replaced this one."),
        TrackOutcome::UnknownLead => bail!("Lead not found: {lead}"),
    }
    Ok(())
}

pub fn history(config: &Config, client: &str, lead: &str, refresh: bool) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    if refresh {
        let report = runtime::reconcile(&ctx);
        if let Some(error) = report.error {
            eprintln!("warning: remote history: {error}");
        }
        ctx.flush();
    }

    let store = ctx.lock();
    let found = store
        .history
        .find_lead(lead)
        .ok_or_else(|| anyhow!("Lead not found: {lead}"))?;
    let entries = store.history.get_history(&found.id);
    println!("{} ({}), current label: {}", found.name, found.id, found.display_label());
    if entries.is_empty() {
        println!("  no label history");
    }
    for entry in entries {
        let status = store
            .outbox
            .record(&entry.history_id)
            .map(|r| delivery_label(r.status))
            .unwrap_or("local");
        println!(
            "  {}  {} -> {}  {}  {}{}",
            entry.timestamp.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S"),
            cell(&entry.previous_label, 18),
            cell(&entry.new_label, 18),
            cell(&entry.actor, 12),
            status,
            entry
                .reason
                .as_deref()
                .map(|r| format!("  ({r})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn dedupe(config: &Config, client: &str, lead: Option<&str>, dry_run: bool) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let mut store = ctx.lock();

    let report = store.history.duplicate_report();
    if report.is_empty() {
        println!("No duplicate history entries.");
        return Ok(());
    }
    for summary in &report {
        println!(
            "  {}  {} duplicate(s)",
            cell(&summary.lead_name, 28),
            summary.duplicates
        );
    }
    if dry_run {
        return Ok(());
    }

    let removed = match lead {
        Some(lead) => {
            let id = store
                .history
                .find_lead(lead)
                .map(|l| l.id.clone())
                .ok_or_else(|| anyhow!("Lead not found: {lead}"))?;
            store.dedupe(&id)
        }
        None => store.dedupe_all(),
    };
    drop(store);
    ctx.flush();
    println!("Removed {removed} duplicate entr{}.", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

pub fn stats(config: &Config, client: &str, filter: &LeadFilter) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let store = ctx.lock();
    let leads = filter.apply(store.history.leads());
    let labels = &ctx.client.conversion_labels;

    let summary = analytics::dashboard_stats(&leads, labels);
    println!("Leads: {}", summary.total);
    println!("  new (unlabeled): {}", summary.unlabeled);
    println!("  qualified:       {}", summary.qualified);
    println!(
        "  converted:       {} ({:.1}%)",
        summary.converted, summary.conversion_rate
    );
    println!("By source:");
    for (source, count) in &summary.by_source {
        println!("  {}  {count}", cell(source, 24));
    }

    for (title, field) in [
        ("Top campaigns", AttributionField::Campaign),
        ("Top ad sets", AttributionField::AdSet),
        ("Top ads", AttributionField::Ad),
        ("Top ad links", AttributionField::AdLink),
    ] {
        let rows = analytics::top_attribution(&leads, field, 10);
        if rows.is_empty() {
            continue;
        }
        println!("{title}:");
        for row in rows {
            println!("  {}  {:>4}  {:>5.1}%", cell(&row.value, 32), row.count, row.percentage);
        }
    }

    println!("Weekly conversion:");
    let today = Local::now().date_naive();
    for week in analytics::weekly_conversion(&leads, today, labels) {
        println!(
            "  {} - {}  {:>4} lead(s)  {:>5.1}%",
            week.start.format("%d/%m"),
            week.end.format("%d/%m"),
            week.leads,
            week.rate
        );
    }
    Ok(())
}

pub fn kanban(config: &Config, client: &str) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let store = ctx.lock();
    let leads: Vec<&Lead> = store.history.leads().iter().collect();
    for column in analytics::kanban_columns(&leads) {
        println!("{} ({})", display_label(&column.label), column.lead_ids.len());
        for id in &column.lead_ids {
            if let Some(lead) = store.history.lead(id) {
                println!("  - {}  {}", cell(&lead.name, 28), lead.phone);
            }
        }
    }
    Ok(())
}

pub fn status(config: &Config, client: &str) -> Result<()> {
    let ctx = open_tenant(config, client)?;
    let scheduler = SyncScheduler::new(ctx.clone());
    let status = scheduler.status();
    let store = ctx.lock();
    let counts = store.outbox.counts();

    println!("Client: {} ({})", ctx.client.name, ctx.client.id);
    println!(
        "Last sync: {}",
        status
            .last_sync
            .map(|at| at.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(error) = &status.last_error {
        println!("Last error: {error}");
    }
    println!("Leads: {}", store.history.leads().len());
    println!("Leads with unsent history: {}", store.leads_with_pending().len());
    println!(
        "Outbox: {} pending, {} sent (unconfirmed), {} confirmed, {} failed",
        counts.pending, counts.sent_unconfirmed, counts.confirmed, counts.failed
    );
    println!(
        "History endpoint: {}",
        ctx.writer
            .as_ref()
            .map(|w| w.endpoint().to_string())
            .unwrap_or_else(|| "not configured".to_string())
    );
    Ok(())
}

fn delivery_label(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::SentUnconfirmed => "sent",
        DeliveryStatus::Confirmed => "confirmed",
        DeliveryStatus::Failed => "failed",
    }
}

pub fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .map_err(|_| format!("expected yyyy-mm-dd or dd/mm/yyyy, got {value}"))
}

/// Pads or truncates to a display width, counting wide characters as two columns.
fn cell(text: &str, width: usize) -> String {
    let text = text.trim();
    if text.width() <= width {
        return format!("{text}{}", " ".repeat(width - text.width()));
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    used += 1;
    out.push_str(&" ".repeat(width.saturating_sub(used)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_pad_and_truncate_by_display_width() {
        assert_eq!(cell("Ana", 5), "Ana  ");
        assert_eq!(cell("Fernanda Costa", 6), "Ferna…");
        assert_eq!(cell("日本語テキスト", 5).width(), 5);
    }

    #[test]
    fn date_arguments_accept_both_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 1);
        assert_eq!(parse_date_arg("2025-03-01").ok(), expected);
        assert_eq!(parse_date_arg("01/03/2025").ok(), expected);
        assert!(parse_date_arg("March").is_err());
    }
}

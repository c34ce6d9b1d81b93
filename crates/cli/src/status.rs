//! `status` and `log` views over the state store.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use vcsmirror_core::db::Database;
use vcsmirror_core::{Config, SyncState};

use super::style;

pub fn run_status(config: &Config, db: &Database, json: bool) -> Result<()> {
    let snapshot = db.snapshot().context("failed to read state store")?;
    let state = snapshot
        .sync_state
        .as_deref()
        .map(SyncState::from_str_val)
        .unwrap_or(SyncState::Idle);
    let cursor = snapshot.cursor;
    let pending = db.pending().context("failed to list pending changesets")?;

    if json {
        let queue: Vec<serde_json::Value> = pending
            .iter()
            .map(|p| {
                serde_json::json!({
                    "seq": p.seq,
                    "revision": p.changeset.revision(),
                    "author": p.changeset.author(),
                    "date": p.changeset.date().to_rfc3339(),
                    "entries": p.changeset.entries().len(),
                    "queued_at": p.queued_at,
                })
            })
            .collect();
        let status = serde_json::json!({
            "project": config.project.name,
            "source": config.source.kind.to_string(),
            "state": state,
            "cursor": cursor,
            "pending_count": pending.len(),
            "pending": queue,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("vcsmirror: {}", config.project.name)));
    println!("{}", "═".repeat(30));
    println!();
    println!("  Source     {} {}{}", config.source.kind, config.source.repository, config.source.module);
    println!("  Root       {}", config.project.root.display());
    println!("  State      {}", state);
    println!(
        "  Cursor     {}",
        cursor.as_deref().unwrap_or("not bootstrapped")
    );
    println!("  Pending    {}", pending.len());

    if !pending.is_empty() {
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["#", "Revision", "Author", "Date", "Entries"]);
        for p in &pending {
            table.add_row(vec![
                Cell::new(p.seq),
                Cell::new(p.changeset.revision()),
                Cell::new(p.changeset.author()),
                Cell::new(p.changeset.date().format("%Y-%m-%d %H:%M:%S")),
                Cell::new(p.changeset.entries().len()),
            ]);
        }
        println!("{table}");
    }
    println!();
    Ok(())
}

pub fn run_log(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_apply_log(limit)
        .context("failed to list apply log")?;

    if entries.is_empty() {
        println!("No apply history found.");
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("Apply log (last {limit})")));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Event", "Revision", "Detail", "Run"]);

    for entry in &entries {
        let event = match entry.event.as_str() {
            "applied" => Cell::new("✓ applied").fg(Color::Green),
            "failed" => Cell::new("✗ failed").fg(Color::Red),
            "conflict" => Cell::new("⚠ conflict").fg(Color::Yellow),
            other => Cell::new(other),
        };
        let run = &entry.run_id[..8.min(entry.run_id.len())];
        table.add_row(vec![
            Cell::new(&entry.created_at[..19.min(entry.created_at.len())]),
            event,
            Cell::new(entry.revision.as_deref().unwrap_or("-")),
            Cell::new(entry.detail.as_deref().unwrap_or("")),
            Cell::new(style::dim(run)),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

//! Cache CLI commands

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;

use super::output::Output;
use crate::domain::UnitId;
use crate::storage::Workspace;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache status
    Status,

    /// Drop entries unused for longer than the retention window
    Prune {
        /// Retention in days (defaults to cache_retention_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Drop every cached entry
    Clear,

    /// Drop the entry of one unit
    Invalidate {
        /// Unit ID
        id: String,
    },
}

pub fn run(cmd: CacheCommands, workspace: &Workspace, output: &Output) -> Result<()> {
    match cmd {
        CacheCommands::Status => status(workspace, output),
        CacheCommands::Prune { days } => prune(workspace, output, days),
        CacheCommands::Clear => clear(workspace, output),
        CacheCommands::Invalidate { id } => invalidate(workspace, output, &id),
    }
}

fn status(workspace: &Workspace, output: &Output) -> Result<()> {
    let store = workspace.metadata_store()?;
    let stats = store.stats()?;
    let path = store
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(in memory)".to_string());

    if output.is_json() {
        output.data(&serde_json::json!({
            "path": path,
            "entries": stats.entries,
            "oldest_use": stats.oldest_use.and_then(format_timestamp),
            "newest_use": stats.newest_use.and_then(format_timestamp),
        }));
    } else {
        println!("Cache Status");
        println!("{}", "=".repeat(40));
        println!("Path: {}", path);
        println!("Entries: {}", stats.entries);
        if let Some(oldest) = stats.oldest_use.and_then(format_timestamp) {
            println!("Oldest use: {}", oldest);
        }
        if let Some(newest) = stats.newest_use.and_then(format_timestamp) {
            println!("Newest use: {}", newest);
        }
    }

    Ok(())
}

fn prune(workspace: &Workspace, output: &Output, days: Option<u32>) -> Result<()> {
    let retention = match days {
        Some(days) => Duration::from_secs(u64::from(days) * 24 * 60 * 60),
        None => workspace.config().settings.cache_retention(),
    };
    let store = workspace.metadata_store()?;
    let removed = store.prune(retention)?;

    if output.is_json() {
        output.data(&serde_json::json!({ "pruned": removed }));
    } else {
        output.success(&format!("Pruned {} cache entries", removed));
    }
    Ok(())
}

fn clear(workspace: &Workspace, output: &Output) -> Result<()> {
    let store = workspace.metadata_store()?;
    let removed = store.clear()?;

    if output.is_json() {
        output.data(&serde_json::json!({ "cleared": removed }));
    } else {
        output.success(&format!("Cleared {} cache entries", removed));
    }
    Ok(())
}

fn invalidate(workspace: &Workspace, output: &Output, id: &str) -> Result<()> {
    let unit_id = UnitId::new(id)?;
    let store = workspace.metadata_store()?;
    let removed = store.invalidate(&unit_id)?;

    if output.is_json() {
        output.data(&serde_json::json!({ "unit": unit_id, "invalidated": removed }));
    } else if removed {
        output.success(&format!("Invalidated cache entry for {}", unit_id));
    } else {
        output.success(&format!("No cache entry for {}", unit_id));
    }
    Ok(())
}

fn format_timestamp(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
}

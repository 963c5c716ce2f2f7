//! Refresh command - apply changes since the last build.

use crate::app::App;
use metacache_core::{refresh_cache, Config, LoggingProgress, RefreshSummary};

/// Run the refresh command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let store = app.store()?;
    let progress = LoggingProgress::new("refresh");

    let refreshed = app.with_cache(Some(&store), &progress, |cache| {
        refresh_cache(cache, &store, &progress)
    })?;
    match refreshed {
        None => println!("Cache is already current."),
        Some(summary) => print_summary(&summary),
    }

    Ok(())
}

pub(crate) fn print_summary(summary: &RefreshSummary) {
    match summary.previous {
        Some(ref previous) => {
            println!(
                "Refreshed {} -> {}",
                short(previous.as_str()),
                short(summary.revision.as_str())
            );
            println!("  Changed:   {}", summary.changed);
            println!("  Updated:   {}", summary.updated);
            println!("  Removed:   {}", summary.removed);
        }
        None => {
            println!("Built cache at {}", short(summary.revision.as_str()));
            println!("  Items:     {}", summary.updated);
        }
    }
    println!("  Warnings:  {}", summary.warnings);
    println!("  Time:      {:.2}s", summary.duration.as_secs_f64());
}

/// Abbreviate a commit id for display.
pub(crate) fn short(revision: &str) -> &str {
    revision.get(..10).unwrap_or(revision)
}

//! Build command - bring the cache up to date.

use crate::app::App;
use metacache_core::{build_cache, refresh_cache, Config, LoggingProgress};

/// Run the build command.
pub fn run(config: Config, force: bool) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let store = app.store()?;
    let progress = LoggingProgress::new("build");

    if !force {
        let refreshed = app.with_cache(Some(&store), &progress, |cache| {
            refresh_cache(cache, &store, &progress)
        })?;
        match refreshed {
            None => println!("Cache is already current."),
            Some(summary) => super::refresh::print_summary(&summary),
        }
        return Ok(());
    }

    println!("Building metadata cache...");
    let summary = app.with_cache(Some(&store), &progress, |cache| {
        build_cache(cache, &store, &progress)
    })?;

    println!();
    println!("Build complete!");
    println!("  Items:     {}", summary.item_count);
    println!("  Revision:  {}", summary.revision);
    println!("  Warnings:  {}", summary.warnings);
    println!("  Time:      {:.2}s", summary.duration.as_secs_f64());

    Ok(())
}

//! Status command - show cache status.

use crate::app::App;
use crate::commands::refresh::short;
use metacache_core::{Config, LogStore, NoProgress};

/// Run the status command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let store = app.store();

    println!("metacache Status");
    println!("================");
    println!();
    match store {
        Ok(ref store) => {
            println!("Repository:  {}", store.work_tree().display());
            println!("Branch:      {}", store.branch());
        }
        Err(ref e) => {
            println!("Repository:  unavailable ({:#})", e);
        }
    }
    println!("Cache file:  {}", app.cache_path.display());
    println!();

    if !app.cache_path.exists() {
        println!("No cache found. Run 'metacache build' to create it.");
        return Ok(());
    }

    let summary = app.with_cache(None, &NoProgress, |cache| match cache.build_state()? {
        Some(state) => Ok(Some((state, cache.item_count()?))),
        None => Ok(None),
    })?;
    let Some((state, item_count)) = summary else {
        println!("Cache has never been built. Run 'metacache build'.");
        return Ok(());
    };

    println!("Summary:");
    println!("  Items:         {}", item_count);
    println!("  Revision:      {}", short(state.revision.as_str()));
    println!(
        "  Last built:    {}",
        state.built_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    match store.and_then(|store| store.current_revision()) {
        Ok(current) if current == state.revision => {
            println!("  State:         current");
        }
        Ok(current) => {
            println!(
                "  State:         out of date (branch is at {}); run 'metacache refresh'",
                short(current.as_str())
            );
        }
        Err(e) => {
            println!("  State:         unknown ({:#})", e);
        }
    }

    Ok(())
}

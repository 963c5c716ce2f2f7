//! Clear command - delete the cache.

use crate::app::App;
use metacache_core::{CacheStore, Config};
use std::io::{self, Write};

/// Run the clear command.
pub fn run(config: Config, skip_confirm: bool) -> anyhow::Result<()> {
    let app = App::new(config)?;

    if !app.cache_path.exists() {
        println!("No cache found. Nothing to clear.");
        return Ok(());
    }

    if !skip_confirm {
        print!(
            "This will delete {}. Are you sure? [y/N] ",
            app.cache_path.display()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    CacheStore::remove_files(&app.cache_path)?;
    println!("Cache cleared.");

    Ok(())
}

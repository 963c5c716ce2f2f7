//! Query command - search the cache.

use crate::app::App;
use crate::OutputFormat;
use metacache_core::{
    count_matches, execute_search_limited, parse_query, refresh_cache, Config, Item,
    MetacacheError, NoProgress,
};
use std::time::Instant;
use tracing::warn;

/// Run the query command.
pub fn run(
    config: Config,
    pattern: &str,
    limit: Option<usize>,
    present_only: bool,
    refresh: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let mut query = match parse_query(pattern) {
        Ok(query) => query,
        Err(e) => {
            if let Some(marker) = error_marker(pattern, &e) {
                eprintln!("  {}", pattern);
                eprintln!("  {}", marker);
            }
            return Err(e.into());
        }
    };
    if present_only {
        query = query.require_present();
    }

    let app = App::new(config)?;
    let store = if refresh {
        match app.store() {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(
                    error = %format!("{:#}", e),
                    "Could not open repository, results may be stale"
                );
                None
            }
        }
    } else {
        None
    };

    let limit = limit.unwrap_or(app.config.general.max_results);
    let limit = (limit > 0).then_some(limit);
    let want_total = output == OutputFormat::Text;

    let outcome = app.with_cache(store.as_ref(), &NoProgress, |cache| {
        if let Some(ref store) = store {
            match refresh_cache(cache, store, &NoProgress) {
                Ok(_) => {}
                Err(e @ MetacacheError::StoreUnavailable { .. }) => {
                    warn!(error = %e, "Could not refresh cache, results may be stale");
                }
                Err(e) => return Err(e),
            }
        }

        if cache.build_state()?.is_none() {
            return Ok(None);
        }

        let start = Instant::now();
        let results = execute_search_limited(cache, &query, limit)?;
        let elapsed = start.elapsed();

        let total = match limit {
            Some(limit) if want_total && results.len() >= limit => count_matches(cache, &query)?,
            _ => results.len() as u64,
        };
        Ok(Some((results, total, elapsed)))
    })?;

    let Some((results, total, elapsed)) = outcome else {
        eprintln!("Cache is empty. Run 'metacache build' first.");
        return Ok(());
    };

    match output {
        OutputFormat::Text => {
            for item in &results {
                println!("{}", format_item(item));
            }

            eprintln!();
            if total > results.len() as u64 {
                eprintln!(
                    "Showing {} of {} results ({:.3}ms)",
                    results.len(),
                    total,
                    elapsed.as_secs_f64() * 1000.0
                );
            } else {
                eprintln!(
                    "Found {} results in {:.3}ms",
                    results.len(),
                    elapsed.as_secs_f64() * 1000.0
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}

/// One line of text output: the path, then artist and title when known.
fn format_item(item: &Item) -> String {
    let mut line = item.path.clone();

    let artist = item.values(metacache_core::Field::Artist).join(", ");
    let title = item.values(metacache_core::Field::Title).join(", ");
    match (artist.is_empty(), title.is_empty()) {
        (false, false) => line.push_str(&format!("  [{} - {}]", artist, title)),
        (false, true) => line.push_str(&format!("  [{}]", artist)),
        (true, false) => line.push_str(&format!("  [{}]", title)),
        (true, true) => {}
    }

    if !item.present {
        line.push_str("  (not present)");
    }
    line
}

/// A caret under the character a query error points at.
fn error_marker(pattern: &str, err: &MetacacheError) -> Option<String> {
    let position = match err {
        MetacacheError::QueryParse { position, .. } => *position,
        MetacacheError::UnknownField { position, .. } => *position,
        _ => return None,
    };
    let column = pattern.get(..position)?.chars().count();
    Some(format!("{}^", " ".repeat(column)))
}

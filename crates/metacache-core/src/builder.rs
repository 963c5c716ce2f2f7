//! Cache building: full builds and incremental refreshes.
//!
//! Both entry points read everything they need from the log store before the
//! cache transaction starts, then stage all writes in a single SQLite
//! transaction. A store failure therefore aborts before anything is written,
//! and an interrupted build leaves the previously committed cache intact.

use crate::backend::{BuildProgress, LogStore};
use crate::cache::{self, CacheStore, ItemRecord, ScalarValue};
use crate::decode::{decode_log, DecodedLog};
use crate::error::{MetacacheError, Result};
use crate::types::{
    BuildState, BuildSummary, Field, FieldKind, ItemLocation, Key, LogBlob, RefreshSummary,
    RevisionId,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// How often (in items) progress is reported while decoding
const PROGRESS_INTERVAL: usize = 1000;

/// Open the cache at `path` and run `op` against it.
///
/// A cache found corrupt on open or while `op` runs has its files deleted and
/// is rebuilt from `store` (left empty without one); `op` then runs once more
/// against the fresh cache. Other errors are returned unchanged.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn with_cache<T>(
    path: &Path,
    store: Option<&dyn LogStore>,
    progress: &dyn BuildProgress,
    mut op: impl FnMut(&mut CacheStore) -> Result<T>,
) -> Result<T> {
    let (mut cache, _) = CacheStore::open_or_reset(path)?;

    match op(&mut cache) {
        Err(e) if e.requires_rebuild() => {
            warn!(error = %e, "Cache unusable mid-operation, rebuilding");
            drop(cache);
            CacheStore::remove_files(path)?;

            let mut cache = CacheStore::open(path)?;
            if let Some(store) = store {
                build_cache(&mut cache, store, progress)?;
            }
            op(&mut cache)
        }
        result => result,
    }
}

/// Rebuild the whole cache from the store's current revision.
///
/// Every item is upserted (keeping row ids of items already cached), items no
/// longer in the store are deleted, and the text index is rebuilt.
#[instrument(skip_all, fields(store = store.name()))]
pub fn build_cache(
    cache: &mut CacheStore,
    store: &dyn LogStore,
    progress: &dyn BuildProgress,
) -> Result<BuildSummary> {
    let started = Instant::now();

    let revision = store
        .current_revision()
        .map_err(|e| MetacacheError::store("current_revision", e))?;
    info!(revision = %revision, "Starting full cache build");

    let blobs = store
        .list_items(&revision)
        .map_err(|e| MetacacheError::store("list_items", e))?;
    let keys: BTreeSet<Key> = blobs.iter().map(|b| b.key.clone()).collect();
    let locations = store
        .resolve_paths(&keys)
        .map_err(|e| MetacacheError::store("resolve_paths", e))?;

    debug!(
        blobs = blobs.len(),
        located = locations.len(),
        "Store read complete"
    );

    let now = Utc::now();
    let outcome = write_full(
        cache.connection_mut(),
        &revision,
        &blobs,
        &keys,
        &locations,
        now,
        progress,
    )
    .map_err(|e| cache.classify(e))?;

    progress.on_complete(outcome.item_count);

    let summary = BuildSummary {
        revision,
        item_count: outcome.item_count,
        warnings: outcome.warnings,
        duration: started.elapsed(),
    };

    info!(
        revision = %summary.revision,
        items = summary.item_count,
        removed = outcome.removed,
        warnings = summary.warnings,
        elapsed_ms = summary.duration.as_millis() as u64,
        "Full cache build complete"
    );

    Ok(summary)
}

/// Bring the cache up to the store's current revision, touching only the
/// items whose logs changed.
///
/// Returns `Ok(None)` without writing anything if the cache is already
/// current. A cache that was never built gets a full build.
#[instrument(skip_all, fields(store = store.name()))]
pub fn refresh_cache(
    cache: &mut CacheStore,
    store: &dyn LogStore,
    progress: &dyn BuildProgress,
) -> Result<Option<RefreshSummary>> {
    let started = Instant::now();

    let Some(state) = cache.build_state()? else {
        info!("No build state recorded, performing full build");
        let built = build_cache(cache, store, progress)?;
        return Ok(Some(RefreshSummary {
            previous: None,
            revision: built.revision,
            changed: built.item_count,
            updated: built.item_count,
            removed: 0,
            warnings: built.warnings,
            duration: started.elapsed(),
        }));
    };

    let current = store
        .current_revision()
        .map_err(|e| MetacacheError::store("current_revision", e))?;

    if current == state.revision {
        debug!(revision = %current, "Cache already current");
        return Ok(None);
    }

    let changed = store
        .changed_items(&state.revision, &current)
        .map_err(|e| MetacacheError::store("changed_items", e))?;

    info!(
        from = %state.revision,
        to = %current,
        changed = changed.len(),
        "Refreshing cache"
    );

    let (blobs, locations) = if changed.is_empty() {
        (Vec::new(), HashMap::new())
    } else {
        let blobs = store
            .fetch_items(&current, &changed)
            .map_err(|e| MetacacheError::store("fetch_items", e))?;
        let locations = store
            .resolve_paths(&changed)
            .map_err(|e| MetacacheError::store("resolve_paths", e))?;
        (blobs, locations)
    };

    let now = Utc::now();
    let outcome = write_incremental(
        cache.connection_mut(),
        &current,
        &changed,
        &blobs,
        &locations,
        now,
        progress,
    )
    .map_err(|e| cache.classify(e))?;

    progress.on_complete(outcome.updated + outcome.removed);

    let summary = RefreshSummary {
        previous: Some(state.revision),
        revision: current,
        changed: changed.len() as u64,
        updated: outcome.updated,
        removed: outcome.removed,
        warnings: outcome.warnings,
        duration: started.elapsed(),
    };

    info!(
        revision = %summary.revision,
        updated = summary.updated,
        removed = summary.removed,
        warnings = summary.warnings,
        items = outcome.item_count,
        "Cache refresh complete"
    );

    Ok(Some(summary))
}

#[derive(Debug, Default)]
struct WriteOutcome {
    item_count: u64,
    updated: u64,
    removed: u64,
    warnings: u64,
}

fn write_full(
    conn: &mut Connection,
    revision: &RevisionId,
    blobs: &[LogBlob],
    keys: &BTreeSet<Key>,
    locations: &HashMap<Key, ItemLocation>,
    now: DateTime<Utc>,
    progress: &dyn BuildProgress,
) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let now_millis = now.timestamp_millis();
    let total = blobs.len() as u64;

    let tx = conn.transaction()?;
    cache::clear_text_index(&tx)?;

    for (i, blob) in blobs.iter().enumerate() {
        let (record, warnings) = build_record(blob, locations.get(&blob.key));
        outcome.warnings += warnings;
        cache::upsert_item(&tx, &record, now_millis)?;
        outcome.updated += 1;

        if (i + 1) % PROGRESS_INTERVAL == 0 {
            progress.on_progress((i + 1) as u64, total);
        }
    }

    for key in cache::cached_keys(&tx)? {
        if !keys.contains(&key) && cache::delete_item(&tx, &key)? {
            debug!(key = %key, "Item vanished from store");
            outcome.removed += 1;
        }
    }

    outcome.item_count = keys.len() as u64;
    cache::write_build_state(
        &tx,
        &BuildState {
            revision: revision.clone(),
            built_at: now,
            item_count: outcome.item_count,
        },
    )?;

    tx.commit()?;
    Ok(outcome)
}

fn write_incremental(
    conn: &mut Connection,
    revision: &RevisionId,
    changed: &BTreeSet<Key>,
    blobs: &[LogBlob],
    locations: &HashMap<Key, ItemLocation>,
    now: DateTime<Utc>,
    progress: &dyn BuildProgress,
) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let now_millis = now.timestamp_millis();
    let total = changed.len() as u64;

    let by_key: HashMap<&Key, &LogBlob> = blobs.iter().map(|b| (&b.key, b)).collect();

    let tx = conn.transaction()?;

    for (i, key) in changed.iter().enumerate() {
        match by_key.get(key) {
            Some(blob) => {
                let (record, warnings) = build_record(blob, locations.get(key));
                outcome.warnings += warnings;
                cache::upsert_item(&tx, &record, now_millis)?;
                outcome.updated += 1;
            }
            None => {
                if cache::delete_item(&tx, key)? {
                    debug!(key = %key, "Item vanished from store");
                    outcome.removed += 1;
                }
            }
        }

        if (i + 1) % PROGRESS_INTERVAL == 0 {
            progress.on_progress((i + 1) as u64, total);
        }
    }

    let count: i64 = tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
    outcome.item_count = count.max(0) as u64;

    cache::write_build_state(
        &tx,
        &BuildState {
            revision: revision.clone(),
            built_at: now,
            item_count: outcome.item_count,
        },
    )?;

    tx.commit()?;
    Ok(outcome)
}

/// Decode one blob and map it onto the cache's columns.
///
/// Returns the record and the number of warnings logged for it.
fn build_record(blob: &LogBlob, location: Option<&ItemLocation>) -> (ItemRecord, u64) {
    let decoded = decode_log(&blob.content);
    let mut warnings = decoded.warnings.len() as u64;

    for warning in &decoded.warnings {
        warn!(key = %blob.key, warning = %warning, "Skipped malformed log entry");
    }

    let mut record = ItemRecord {
        key: blob.key.clone(),
        path: location.map(|l| l.path.clone()),
        present: location.map_or(false, |l| l.present),
        ..Default::default()
    };

    for (field, values) in collect_fields(&blob.key, &decoded) {
        if values.is_empty() {
            record.empty_fields.push(field);
        } else if field.kind() == FieldKind::Group || values.len() > 1 {
            record
                .memberships
                .extend(values.into_iter().map(|v| (field, v)));
        } else if let Some(value) = values.into_iter().next() {
            match parse_scalar(field, &value) {
                Some(scalar) => {
                    record.scalars.insert(field, scalar);
                }
                None => {
                    warn!(
                        key = %blob.key,
                        field = %field,
                        value = %value,
                        "Unparseable numeric value"
                    );
                    warnings += 1;
                }
            }
        }
    }

    (record, warnings)
}

/// Group decoded log fields by the cache field they map to, merging aliases.
fn collect_fields(key: &Key, decoded: &DecodedLog) -> BTreeMap<Field, BTreeSet<String>> {
    let mut fields: BTreeMap<Field, BTreeSet<String>> = BTreeMap::new();

    for (name, values) in &decoded.fields {
        match Field::from_name(name).filter(|f| Field::METADATA.contains(f)) {
            Some(field) => fields.entry(field).or_default().extend(values.iter().cloned()),
            None => trace!(key = %key, field = %name, "Ignoring unmapped log field"),
        }
    }

    fields
}

fn parse_scalar(field: Field, value: &str) -> Option<ScalarValue> {
    match field.kind() {
        FieldKind::Real => value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(ScalarValue::Real),
        FieldKind::Integer => parse_integer(value).map(ScalarValue::Integer),
        _ => Some(ScalarValue::Text(value.to_string())),
    }
}

/// Parse an integer field, accepting the `3/12` track form.
fn parse_integer(value: &str) -> Option<i64> {
    let leading = value.split('/').next().unwrap_or(value).trim();
    leading.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoProgress;
    use crate::memory::MemoryLogStore;
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn seeded_store() -> MemoryLogStore {
        let store = MemoryLogStore::new();
        store.put(
            "k1",
            "1000s artist +Alpha genre +Dark +Ambient\n2000s genre -Dark\n",
            "music/alpha.flac",
            true,
        );
        store.put(
            "k2",
            "1000s artist +Beta bpm +145 track +3/12 crate +warmup +peak\n",
            "music/beta.mp3",
            false,
        );
        store.put("k3", "1000s title +Gamma\n", "music/gamma.mp3", true);
        store
    }

    #[test]
    fn test_full_build() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();

        let summary = build_cache(&mut cache, &store, &NoProgress).unwrap();
        assert_eq!(summary.item_count, 3);
        assert_eq!(summary.warnings, 0);
        assert_eq!(summary.revision, store.current_revision().unwrap());

        let state = cache.build_state().unwrap().unwrap();
        assert_eq!(state.revision, summary.revision);
        assert_eq!(state.item_count, 3);

        let alpha = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        assert_eq!(alpha.artist.as_deref(), Some("Alpha"));
        assert_eq!(alpha.genre.as_deref(), Some("Ambient"));
        assert!(alpha.present);

        let beta = cache.get_item(&Key::new("k2")).unwrap().unwrap();
        assert_eq!(beta.bpm, Some(145.0));
        assert_eq!(beta.track_number, Some(3));
        assert_eq!(beta.crates(), ["peak".to_string(), "warmup".to_string()]);
        assert!(!beta.present);
        assert_eq!(beta.path, "music/beta.mp3");
    }

    #[test]
    fn test_multi_value_fields_go_to_memberships() {
        let store = MemoryLogStore::new();
        store.put("k1", "1000s genre +psy +progressive\n", "a.mp3", true);
        let mut cache = CacheStore::open_in_memory().unwrap();

        build_cache(&mut cache, &store, &NoProgress).unwrap();

        let item = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        assert_eq!(item.genre, None);
        assert_eq!(
            item.values(Field::Genre),
            vec!["progressive".to_string(), "psy".to_string()]
        );
    }

    #[test]
    fn test_path_never_null_after_build() {
        let store = seeded_store();
        store.forget_location("k3");
        let mut cache = CacheStore::open_in_memory().unwrap();

        build_cache(&mut cache, &store, &NoProgress).unwrap();

        let gamma = cache.get_item(&Key::new("k3")).unwrap().unwrap();
        assert_eq!(gamma.path, "k3");
        assert!(!gamma.present);
    }

    #[test]
    fn test_absent_item_keeps_last_known_path() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();

        store.forget_location("k3");
        store.append("k3", "3000s title -Gamma +Gamma2");
        refresh_cache(&mut cache, &store, &NoProgress).unwrap();

        let gamma = cache.get_item(&Key::new("k3")).unwrap().unwrap();
        assert_eq!(gamma.path, "music/gamma.mp3");
        assert_eq!(gamma.title.as_deref(), Some("Gamma2"));
        assert!(!gamma.present);
    }

    #[test]
    fn test_rebuild_removes_vanished_items_and_keeps_ids() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();
        let alpha_id = cache.get_item(&Key::new("k1")).unwrap().unwrap().id;

        store.remove("k2");
        let summary = build_cache(&mut cache, &store, &NoProgress).unwrap();

        assert_eq!(summary.item_count, 2);
        assert_eq!(cache.item_count().unwrap(), 2);
        assert!(cache.get_item(&Key::new("k2")).unwrap().is_none());
        assert_eq!(
            cache.get_item(&Key::new("k1")).unwrap().unwrap().id,
            alpha_id
        );
    }

    #[test]
    fn test_refresh_noop_when_current() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();
        let before = cache.build_state().unwrap();

        let result = refresh_cache(&mut cache, &store, &NoProgress).unwrap();
        assert!(result.is_none());
        assert_eq!(cache.build_state().unwrap(), before);
    }

    #[test]
    fn test_refresh_without_state_builds() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();

        let summary = refresh_cache(&mut cache, &store, &NoProgress)
            .unwrap()
            .unwrap();
        assert_eq!(summary.previous, None);
        assert_eq!(summary.updated, 3);
        assert_eq!(cache.item_count().unwrap(), 3);
    }

    #[test]
    fn test_refresh_touches_only_changed_items() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();

        let alpha_before = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        let gamma_before = cache.get_item(&Key::new("k3")).unwrap().unwrap();
        let beta_id = cache.get_item(&Key::new("k2")).unwrap().unwrap().id;

        store.append("k2", "5000s crate -warmup");
        let summary = refresh_cache(&mut cache, &store, &NoProgress)
            .unwrap()
            .unwrap();

        assert_eq!(summary.changed, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.removed, 0);

        assert_eq!(
            cache.get_item(&Key::new("k1")).unwrap().unwrap(),
            alpha_before
        );
        assert_eq!(
            cache.get_item(&Key::new("k3")).unwrap().unwrap(),
            gamma_before
        );

        let beta = cache.get_item(&Key::new("k2")).unwrap().unwrap();
        assert_eq!(beta.id, beta_id);
        assert_eq!(beta.crates(), ["peak".to_string()]);
        assert_eq!(
            cache.build_state().unwrap().unwrap().revision,
            store.current_revision().unwrap()
        );
    }

    #[test]
    fn test_refresh_removes_vanished_item() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();

        store.remove("k1");
        let summary = refresh_cache(&mut cache, &store, &NoProgress)
            .unwrap()
            .unwrap();

        assert_eq!(summary.removed, 1);
        assert!(cache.get_item(&Key::new("k1")).unwrap().is_none());
        assert_eq!(cache.build_state().unwrap().unwrap().item_count, 2);
    }

    #[test]
    fn test_store_unavailable_leaves_cache_intact() {
        let store = seeded_store();
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();
        let before = cache.build_state().unwrap();

        store.append("k1", "9000s artist +Changed");
        store.set_available(false);

        let err = build_cache(&mut cache, &store, &NoProgress).unwrap_err();
        assert!(matches!(err, MetacacheError::StoreUnavailable { .. }));

        let err = refresh_cache(&mut cache, &store, &NoProgress).unwrap_err();
        assert!(matches!(err, MetacacheError::StoreUnavailable { .. }));

        assert_eq!(cache.build_state().unwrap(), before);
        let alpha = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        assert_eq!(alpha.artist.as_deref(), Some("Alpha"));
    }

    #[test]
    fn test_malformed_entries_do_not_block_build() {
        let store = MemoryLogStore::new();
        store.put(
            "k1",
            "garbage artist +Nope\n1000s artist +Fine bpm +fast\n",
            "a.mp3",
            true,
        );
        store.put("k2", "1000s title +Other\n", "b.mp3", true);
        let mut cache = CacheStore::open_in_memory().unwrap();

        let summary = build_cache(&mut cache, &store, &NoProgress).unwrap();
        assert_eq!(summary.item_count, 2);
        // One skipped entry plus one unparseable bpm
        assert_eq!(summary.warnings, 2);

        let item = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        assert_eq!(item.artist.as_deref(), Some("Fine"));
        assert_eq!(item.bpm, None);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("3/12"), Some(3));
        assert_eq!(parse_integer(" 7 "), Some(7));
        assert_eq!(parse_integer("1999"), Some(1999));
        assert_eq!(parse_integer("x/12"), None);
    }

    #[test]
    fn test_aliases_merge_into_one_field() {
        let store = MemoryLogStore::new();
        store.put(
            "k1",
            "1000s initialkey +8A lastchanged +1000s\n",
            "a.mp3",
            true,
        );
        let mut cache = CacheStore::open_in_memory().unwrap();
        build_cache(&mut cache, &store, &NoProgress).unwrap();

        let item = cache.get_item(&Key::new("k1")).unwrap().unwrap();
        assert_eq!(item.musical_key.as_deref(), Some("8A"));
    }

    #[test]
    fn test_with_cache_rebuilds_after_page_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metacache.sqlite");

        let store = MemoryLogStore::new();
        for i in 0..400 {
            store.put(
                &format!("k{:03}", i),
                &format!("1000s artist +Artist{} title +Track{} bpm +{}\n", i, i, 100 + i % 80),
                &format!("music/{:03}.mp3", i),
                true,
            );
        }

        {
            let mut cache = CacheStore::open(&path).unwrap();
            build_cache(&mut cache, &store, &NoProgress).unwrap();
        }

        // Keep the header page, trash everything after it
        let len = fs::metadata(&path).unwrap().len();
        assert!(len > 4096);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(4096)).unwrap();
        file.write_all(&vec![0xA5; (len - 4096) as usize]).unwrap();
        drop(file);

        let mut attempts = 0;
        let count = with_cache(&path, Some(&store as &dyn LogStore), &NoProgress, |cache| {
            attempts += 1;
            refresh_cache(cache, &store, &NoProgress)?;
            cache.item_count()
        })
        .unwrap();

        assert_eq!(count, 400);
        assert!(attempts <= 2);

        let cache = CacheStore::open(&path).unwrap();
        assert_eq!(cache.item_count().unwrap(), 400);
        let state = cache.build_state().unwrap().unwrap();
        assert_eq!(state.revision, store.current_revision().unwrap());
    }

    #[test]
    fn test_with_cache_passes_through_other_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metacache.sqlite");
        let store = seeded_store();
        store.set_available(false);

        let mut attempts = 0;
        let err = with_cache(&path, Some(&store as &dyn LogStore), &NoProgress, |cache| {
            attempts += 1;
            refresh_cache(cache, &store, &NoProgress)
        })
        .unwrap_err();

        assert!(matches!(err, MetacacheError::StoreUnavailable { .. }));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_with_cache_without_store_leaves_cache_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metacache.sqlite");
        fs::write(&path, vec![0x42u8; 8192]).unwrap();

        let state = with_cache(&path, None, &NoProgress, |cache| cache.build_state()).unwrap();
        assert!(state.is_none());
    }
}

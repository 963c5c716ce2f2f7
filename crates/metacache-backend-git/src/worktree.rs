//! Mapping keys to working-tree paths.
//!
//! Annexed files appear in the index in two forms:
//!
//! - locked: a symlink whose target ends in `annex/objects/.../<key>`;
//!   the content is present when the link resolves
//! - unlocked: a regular file whose committed blob is a pointer
//!   `/annex/objects/<key>`; the content is present when the working-tree
//!   file is no longer the pointer itself
//!
//! The whole index is read with one `ls-files` call and the candidate blobs
//! with one `cat-file` batch per form, independent of how many keys are asked
//! for.

use crate::error::GitError;
use crate::git::{BatchMode, Git};
use metacache_core::types::{ItemLocation, Key};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Largest blob considered as a possible pointer file
const MAX_POINTER_SIZE: u64 = 32 * 1024;

const OBJECTS_DIR: &str = "annex/objects/";
const POINTER_PREFIX: &str = "/annex/objects/";

const MODE_SYMLINK: &str = "120000";
const MODE_FILE: &str = "100644";
const MODE_EXECUTABLE: &str = "100755";

/// One `git ls-files -s -z` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub mode: String,
    pub oid: String,
    pub path: String,
}

/// Parse `<mode> SP <object> SP <stage> TAB <path> NUL` records.
pub(crate) fn parse_ls_files(output: &[u8]) -> Result<Vec<IndexEntry>, GitError> {
    let mut entries = Vec::new();

    for record in output.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        let Some((meta, path)) = record.split_once('\t') else {
            return Err(GitError::malformed("git ls-files", format!("no path in {:?}", record)));
        };

        let mut fields = meta.split(' ');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(mode), Some(oid), Some(_stage), None) => entries.push(IndexEntry {
                mode: mode.to_string(),
                oid: oid.to_string(),
                path: path.to_string(),
            }),
            _ => {
                return Err(GitError::malformed(
                    "git ls-files",
                    format!("bad entry {:?}", record),
                ))
            }
        }
    }

    Ok(entries)
}

fn key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Z0-9]+(?:-[a-zA-Z][0-9]+)*--.+$").ok())
        .as_ref()
}

fn parse_key(candidate: &str) -> Option<Key> {
    if key_pattern()?.is_match(candidate) {
        Some(Key::new(candidate))
    } else {
        None
    }
}

/// Key named by a locked file's symlink target.
pub(crate) fn key_from_link_target(target: &str) -> Option<Key> {
    let (_, tail) = target.rsplit_once(OBJECTS_DIR)?;
    parse_key(tail.rsplit('/').next()?)
}

/// Key named by an unlocked file's pointer content.
pub(crate) fn key_from_pointer(content: &[u8]) -> Option<Key> {
    if content.len() as u64 > MAX_POINTER_SIZE {
        return None;
    }
    let text = std::str::from_utf8(content).ok()?;
    let first = text.lines().next()?.trim_end();
    let rest = first.strip_prefix(POINTER_PREFIX)?;
    parse_key(rest.rsplit('/').next()?)
}

/// Whether an unlocked file's content is in the working tree.
fn unlocked_content_present(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if metadata.len() > MAX_POINTER_SIZE {
        return true;
    }
    match fs::read(path) {
        Ok(content) => key_from_pointer(&content).is_none(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Locked,
    Unlocked,
}

/// Resolve the working-tree location of each wanted key.
///
/// When a key is checked out at several paths, a path with content present
/// wins, then the first path in index order.
pub(crate) fn resolve_locations(
    git: &Git,
    wanted: &BTreeSet<Key>,
) -> Result<HashMap<Key, ItemLocation>, GitError> {
    let mut locations: HashMap<Key, ItemLocation> = HashMap::new();
    if wanted.is_empty() {
        return Ok(locations);
    }

    let entries = parse_ls_files(&git.run(&["ls-files", "-s", "-z"])?)?;

    let links: Vec<&IndexEntry> = entries.iter().filter(|e| e.mode == MODE_SYMLINK).collect();
    let files: Vec<&IndexEntry> = entries
        .iter()
        .filter(|e| e.mode == MODE_FILE || e.mode == MODE_EXECUTABLE)
        .collect();

    let mut candidates: Vec<(&IndexEntry, Key, Form)> = Vec::new();

    let targets = git.cat_file(
        BatchMode::Contents,
        links.iter().map(|e| e.oid.clone()).collect(),
    )?;
    for (entry, object) in links.iter().zip(targets) {
        let key = object
            .and_then(|o| String::from_utf8(o.content).ok())
            .and_then(|target| key_from_link_target(&target));
        if let Some(key) = key {
            candidates.push((*entry, key, Form::Locked));
        }
    }

    // Only small blobs can be pointers; avoid reading large regular files.
    let sizes = git.cat_file(
        BatchMode::Check,
        files.iter().map(|e| e.oid.clone()).collect(),
    )?;
    let small: Vec<&IndexEntry> = files
        .iter()
        .zip(sizes)
        .filter(|(_, o)| o.as_ref().map_or(false, |o| o.size <= MAX_POINTER_SIZE))
        .map(|(e, _)| *e)
        .collect();

    let pointers = git.cat_file(
        BatchMode::Contents,
        small.iter().map(|e| e.oid.clone()).collect(),
    )?;
    for (entry, object) in small.iter().zip(pointers) {
        if let Some(key) = object.and_then(|o| key_from_pointer(&o.content)) {
            candidates.push((*entry, key, Form::Unlocked));
        }
    }

    for (entry, key, form) in candidates {
        if !wanted.contains(&key) {
            continue;
        }

        let full_path = git.work_tree().join(&entry.path);
        let present = match form {
            Form::Locked => full_path.exists(),
            Form::Unlocked => unlocked_content_present(&full_path),
        };
        trace!(key = %key, path = %entry.path, present, "Resolved key");

        let better = match locations.get(&key) {
            None => true,
            Some(existing) => present && !existing.present,
        };
        if better {
            locations.insert(key, ItemLocation::new(entry.path.clone(), present));
        }
    }

    debug!(
        index_entries = entries.len(),
        wanted = wanted.len(),
        resolved = locations.len(),
        "Resolved working tree locations"
    );

    Ok(locations)
}

//! Reading the metadata branch.
//!
//! git-annex stores one metadata log per key on its branch, hashed into two
//! directory levels: `e4a/9c1/SHA256E-s1024--abc.mp3.log.met`. The key is the
//! file name without the log suffix.

use crate::error::GitError;
use metacache_core::types::Key;

/// One `git ls-tree -r -z` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeEntry {
    pub mode: String,
    pub object_type: String,
    pub oid: String,
    pub path: String,
}

/// Parse `<mode> SP <type> SP <object> TAB <path> NUL` records.
pub(crate) fn parse_ls_tree(output: &[u8]) -> Result<Vec<TreeEntry>, GitError> {
    let mut entries = Vec::new();

    for record in output.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        let Some((meta, path)) = record.split_once('\t') else {
            return Err(GitError::malformed("git ls-tree", format!("no path in {:?}", record)));
        };

        let mut fields = meta.split(' ');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(mode), Some(object_type), Some(oid), None) => entries.push(TreeEntry {
                mode: mode.to_string(),
                object_type: object_type.to_string(),
                oid: oid.to_string(),
                path: path.to_string(),
            }),
            _ => {
                return Err(GitError::malformed(
                    "git ls-tree",
                    format!("bad entry {:?}", record),
                ))
            }
        }
    }

    Ok(entries)
}

/// Split NUL-separated path output (`--name-only -z`).
pub(crate) fn parse_paths(output: &[u8]) -> Vec<String> {
    output
        .split(|b| *b == 0)
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

/// The key a metadata log path belongs to, if it is a metadata log.
pub(crate) fn key_from_log_path(path: &str, suffix: &str) -> Option<Key> {
    let file_name = path.rsplit('/').next()?;
    let key = file_name.strip_suffix(suffix)?;
    if key.is_empty() {
        None
    } else {
        Some(Key::new(key))
    }
}

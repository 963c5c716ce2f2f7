//! `LogStore` implementation over a git-annex repository.

use crate::branch::{key_from_log_path, parse_ls_tree, parse_paths};
use crate::error::GitError;
use crate::git::{BatchMode, Git};
use crate::worktree::resolve_locations;
use metacache_core::backend::LogStore;
use metacache_core::types::{ItemLocation, Key, LogBlob, RevisionId};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reads metadata logs from a git-annex branch and resolves keys against the
/// repository's working tree.
///
/// Only git plumbing is used, so git-annex itself need not be installed.
#[derive(Debug, Clone)]
pub struct GitAnnexStore {
    git: Git,
    branch: String,
    log_suffix: String,
}

impl GitAnnexStore {
    /// Open the repository containing `repository`.
    pub fn open(
        repository: &Path,
        branch: impl Into<String>,
        log_suffix: impl Into<String>,
    ) -> Result<Self, GitError> {
        let store = GitAnnexStore {
            git: Git::discover(repository)?,
            branch: branch.into(),
            log_suffix: log_suffix.into(),
        };
        info!(
            work_tree = %store.git.work_tree().display(),
            branch = %store.branch,
            "Opened git-annex repository"
        );
        Ok(store)
    }

    /// Root of the working tree
    pub fn work_tree(&self) -> &Path {
        self.git.work_tree()
    }

    /// Directory for per-repository state (`<git-dir>/annex`)
    pub fn metadata_dir(&self) -> PathBuf {
        self.git.git_dir().join("annex")
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn check_revision(revision: &RevisionId) -> Result<&str, GitError> {
        let id = revision.as_str();
        if id.is_empty() || id.starts_with('-') {
            return Err(GitError::MissingRef {
                reference: id.to_string(),
            });
        }
        Ok(id)
    }

    /// Every metadata log on the branch at `revision`: (key, blob id).
    fn log_entries(&self, revision: &RevisionId) -> Result<Vec<(Key, String)>, GitError> {
        let id = Self::check_revision(revision)?;
        let output = self.git.run(&["ls-tree", "-r", "-z", "--full-tree", id])?;

        let entries: Vec<(Key, String)> = parse_ls_tree(&output)?
            .into_iter()
            .filter(|e| e.object_type == "blob")
            .filter_map(|e| {
                key_from_log_path(&e.path, &self.log_suffix).map(|key| (key, e.oid))
            })
            .collect();

        debug!(revision = %revision, logs = entries.len(), "Listed metadata logs");
        Ok(entries)
    }

    /// Fetch log contents for (key, blob id) pairs in one batch.
    fn read_logs(&self, entries: Vec<(Key, String)>) -> Result<Vec<LogBlob>, GitError> {
        let oids = entries.iter().map(|(_, oid)| oid.clone()).collect();
        let objects = self.git.cat_file(BatchMode::Contents, oids)?;

        let mut blobs = Vec::with_capacity(entries.len());
        for ((key, oid), object) in entries.into_iter().zip(objects) {
            match object {
                Some(object) => blobs.push(LogBlob {
                    key,
                    content: String::from_utf8_lossy(&object.content).into_owned(),
                }),
                None => warn!(key = %key, oid = %oid, "Metadata log blob missing"),
            }
        }
        Ok(blobs)
    }
}

impl LogStore for GitAnnexStore {
    fn current_revision(&self) -> anyhow::Result<RevisionId> {
        let reference = self.branch_ref();
        let id = self
            .git
            .resolve_commit(&reference)?
            .ok_or(GitError::MissingRef { reference })?;
        Ok(RevisionId::new(id))
    }

    fn list_items(&self, revision: &RevisionId) -> anyhow::Result<Vec<LogBlob>> {
        let entries = self.log_entries(revision)?;
        Ok(self.read_logs(entries)?)
    }

    fn changed_items(&self, old: &RevisionId, new: &RevisionId) -> anyhow::Result<BTreeSet<Key>> {
        let old = Self::check_revision(old)?;
        let new = Self::check_revision(new)?;

        let output = self.git.run(&[
            "diff-tree",
            "-r",
            "-z",
            "--name-only",
            "--no-renames",
            old,
            new,
        ])?;

        let keys: BTreeSet<Key> = parse_paths(&output)
            .iter()
            .filter_map(|path| key_from_log_path(path, &self.log_suffix))
            .collect();

        debug!(from = old, to = new, changed = keys.len(), "Diffed metadata branch");
        Ok(keys)
    }

    fn fetch_items(
        &self,
        revision: &RevisionId,
        keys: &BTreeSet<Key>,
    ) -> anyhow::Result<Vec<LogBlob>> {
        let entries = self
            .log_entries(revision)?
            .into_iter()
            .filter(|(key, _)| keys.contains(key))
            .collect();
        Ok(self.read_logs(entries)?)
    }

    fn resolve_paths(&self, keys: &BTreeSet<Key>) -> anyhow::Result<HashMap<Key, ItemLocation>> {
        Ok(resolve_locations(&self.git, keys)?)
    }

    fn name(&self) -> &'static str {
        "git"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::process::Command;
    use tempfile::TempDir;

    const KEY_A: &str = "SHA256E-s3--aaa.mp3";
    const KEY_B: &str = "SHA256E-s4--bbb.flac";

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args([
                "-c",
                "user.name=metacache",
                "-c",
                "user.email=metacache@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn log_path(root: &Path, key: &str) -> PathBuf {
        root.join("e4a").join("9c1").join(format!("{}.log.met", key))
    }

    #[test]
    fn test_git_annex_store_end_to_end() {
        if Command::new("git").arg("--version").output().is_err() {
            eprintln!("skipping git backend test: git not found");
            return;
        }

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        git(root, &["init", "-q"]);

        // Metadata branch with two revisions
        git(root, &["symbolic-ref", "HEAD", "refs/heads/git-annex"]);
        fs::create_dir_all(root.join("e4a").join("9c1")).unwrap();
        fs::write(log_path(root, KEY_A), "1000s artist +Alpha\n").unwrap();
        let location_log = root.join("e4a").join("9c1").join(format!("{}.log", KEY_A));
        fs::write(location_log, "1000s 1 uuid\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "first"]);
        let first = git(root, &["rev-parse", "HEAD"]);

        fs::write(log_path(root, KEY_A), "1000s artist +Alpha\n2000s genre +psy\n").unwrap();
        fs::write(log_path(root, KEY_B), "1000s title +Beta\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "second"]);
        let second = git(root, &["rev-parse", "HEAD"]);

        // Working branch with one locked file
        git(root, &["checkout", "-q", "--orphan", "main"]);
        git(root, &["rm", "-r", "-q", "--cached", "."]);
        fs::remove_dir_all(root.join("e4a")).unwrap();
        fs::create_dir_all(root.join("music")).unwrap();
        let target = format!("../.git/annex/objects/Xx/Yy/{}/{}", KEY_A, KEY_A);
        symlink(&target, root.join("music").join("a.mp3")).unwrap();
        git(root, &["add", "music"]);
        git(root, &["commit", "-q", "-m", "music"]);

        let store = GitAnnexStore::open(root, "git-annex", ".log.met").unwrap();
        let revision = store.current_revision().unwrap();
        assert_eq!(revision.as_str(), second);

        let mut blobs = store.list_items(&revision).unwrap();
        blobs.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].key, Key::new(KEY_A));
        assert_eq!(blobs[0].content, "1000s artist +Alpha\n2000s genre +psy\n");

        let changed = store
            .changed_items(&RevisionId::new(first.clone()), &revision)
            .unwrap();
        assert_eq!(changed, BTreeSet::from([Key::new(KEY_A), Key::new(KEY_B)]));

        let wanted = BTreeSet::from([Key::new(KEY_B)]);
        let fetched = store.fetch_items(&RevisionId::new(first), &wanted).unwrap();
        assert!(fetched.is_empty());

        let keys = BTreeSet::from([Key::new(KEY_A), Key::new(KEY_B)]);
        let locations = store.resolve_paths(&keys).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[&Key::new(KEY_A)], ItemLocation::new("music/a.mp3", false));

        let object = root
            .join(".git/annex/objects/Xx/Yy")
            .join(KEY_A)
            .join(KEY_A);
        fs::create_dir_all(object.parent().unwrap()).unwrap();
        fs::write(&object, "abc").unwrap();
        let locations = store.resolve_paths(&keys).unwrap();
        assert!(locations[&Key::new(KEY_A)].present);

        assert!(store.metadata_dir().ends_with("annex"));
    }

    #[test]
    fn test_missing_branch() {
        if Command::new("git").arg("--version").output().is_err() {
            eprintln!("skipping git backend test: git not found");
            return;
        }

        let temp_dir = TempDir::new().unwrap();
        git(temp_dir.path(), &["init", "-q"]);

        let store = GitAnnexStore::open(temp_dir.path(), "git-annex", ".log.met").unwrap();
        let err = store.current_revision().unwrap_err();
        assert!(err.to_string().contains("refs/heads/git-annex"));
    }
}

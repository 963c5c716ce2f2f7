//! # metacache git backend
//!
//! Implements `LogStore` for git-annex repositories by shelling out to the
//! `git` binary. Metadata logs are read from the `git-annex` branch, and keys
//! are mapped back to working-tree paths through the index.
//!
//! Only read-only plumbing commands are used (`rev-parse`, `ls-tree`,
//! `diff-tree`, `ls-files`, `cat-file`), so git-annex itself does not have to
//! be installed and the repository is never modified.

mod branch;
pub mod error;
mod git;
mod store;
mod worktree;

pub use error::GitError;
pub use store::GitAnnexStore;

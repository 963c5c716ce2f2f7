//! Error types for the git backend.

use thiserror::Error;

/// Errors specific to reading a git repository.
#[derive(Error, Debug)]
pub enum GitError {
    /// The git binary could not be started
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// git ran but reported failure
    #[error("{command} failed ({}): {stderr}", describe_status(.status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The metadata branch does not exist
    #[error("reference {reference} not found (is this a git-annex repository?)")]
    MissingRef { reference: String },

    /// git produced output we could not parse
    #[error("unexpected output from {command}: {reason}")]
    MalformedOutput { command: String, reason: String },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub(crate) fn malformed(command: &str, reason: impl Into<String>) -> Self {
        GitError::MalformedOutput {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// True if git exited with the given code
    pub fn exited_with(&self, code: i32) -> bool {
        matches!(self, GitError::CommandFailed { status: Some(c), .. } if *c == code)
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

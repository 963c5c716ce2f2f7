//! Thin wrapper around the `git` binary.
//!
//! Only plumbing commands are used. Bulk object reads go through a single
//! `git cat-file --batch` process per call: a writer thread feeds object ids
//! on stdin while the caller parses the framed responses from stdout.

use crate::error::GitError;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, trace};

/// Which `cat-file` batch flavour to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchMode {
    /// Headers and contents
    Contents,
    /// Headers only
    Check,
}

impl BatchMode {
    fn flag(self) -> &'static str {
        match self {
            BatchMode::Contents => "--batch",
            BatchMode::Check => "--batch-check",
        }
    }
}

/// One object returned by `cat-file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchObject {
    pub object_type: String,
    pub size: u64,
    /// Empty in `BatchMode::Check`
    pub content: Vec<u8>,
}

/// A repository located by `git rev-parse`.
#[derive(Debug, Clone)]
pub(crate) struct Git {
    work_tree: PathBuf,
    git_dir: PathBuf,
}

impl Git {
    /// Locate the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self, GitError> {
        let args = ["rev-parse", "--show-toplevel", "--absolute-git-dir"];
        let output = run_git(path, &args)?;
        let text = String::from_utf8_lossy(&output);
        let mut lines = text.lines();

        match (lines.next(), lines.next()) {
            (Some(top), Some(dir)) => {
                let git = Git {
                    work_tree: PathBuf::from(top),
                    git_dir: PathBuf::from(dir),
                };
                debug!(
                    work_tree = %git.work_tree.display(),
                    git_dir = %git.git_dir.display(),
                    "Found repository"
                );
                Ok(git)
            }
            _ => Err(GitError::malformed(
                &command_line(&args),
                "expected work tree and git directory",
            )),
        }
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Run a git command in the work tree and return its stdout.
    pub fn run(&self, args: &[&str]) -> Result<Vec<u8>, GitError> {
        run_git(&self.work_tree, args)
    }

    /// Resolve a reference to a commit id, or `None` if it does not exist.
    pub fn resolve_commit(&self, reference: &str) -> Result<Option<String>, GitError> {
        let spec = format!("{}^{{commit}}", reference);
        match self.run(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(output) => {
                let id = String::from_utf8_lossy(&output).trim().to_string();
                if id.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(id))
                }
            }
            Err(e) if e.exited_with(1) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read many objects through one `cat-file` process.
    ///
    /// Results are in request order; objects git does not have are `None`.
    pub fn cat_file(
        &self,
        mode: BatchMode,
        objects: Vec<String>,
    ) -> Result<Vec<Option<BatchObject>>, GitError> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let command = format!("git cat-file {}", mode.flag());
        let count = objects.len();
        debug!(command = %command, objects = count, "Starting batch read");

        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(["cat-file", mode.flag()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GitError::malformed(&command, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitError::malformed(&command, "stdout was not captured"))?;

        let writer = thread::spawn(move || -> std::io::Result<()> {
            let mut stdin = BufWriter::new(stdin);
            for object in &objects {
                writeln!(stdin, "{}", object)?;
            }
            stdin.flush()
        });

        let mut reader = BufReader::new(stdout);
        let result = read_batch(&mut reader, mode, count, &command);

        // Closing stdout unblocks git (and so the writer) if we stopped early.
        drop(reader);
        if result.is_err() {
            let _ = child.kill();
        }

        let written = writer.join();
        let status = child.wait()?;
        let objects = result?;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GitError::Io(e)),
            Err(_) => return Err(GitError::malformed(&command, "stdin writer panicked")),
        }

        if !status.success() {
            return Err(GitError::CommandFailed {
                command,
                status: status.code(),
                stderr: String::new(),
            });
        }

        Ok(objects)
    }
}

fn command_line(args: &[&str]) -> String {
    format!("git {}", args.join(" "))
}

fn run_git(dir: &Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
    let command = command_line(args);
    trace!(command = %command, dir = %dir.display(), "Running git");

    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

/// Parse `count` framed responses from `cat-file --batch[-check]`.
///
/// Each response is `<oid> <type> <size>\n` (followed by `<size>` bytes and a
/// newline in contents mode) or `<object> missing\n`.
pub(crate) fn read_batch<R: BufRead>(
    reader: &mut R,
    mode: BatchMode,
    count: usize,
    command: &str,
) -> Result<Vec<Option<BatchObject>>, GitError> {
    let mut results = Vec::with_capacity(count);
    let mut header = Vec::new();

    for _ in 0..count {
        header.clear();
        if reader.read_until(b'\n', &mut header)? == 0 {
            return Err(GitError::malformed(command, "output ended early"));
        }

        let line = String::from_utf8_lossy(&header);
        let line = line.trim_end_matches('\n');

        if line.ends_with(" missing") || line.ends_with(" ambiguous") {
            results.push(None);
            continue;
        }

        let mut parts = line.split(' ');
        let (Some(_oid), Some(object_type), Some(size), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(GitError::malformed(command, format!("bad header {:?}", line)));
        };
        let size: u64 = size
            .parse()
            .map_err(|_| GitError::malformed(command, format!("bad object size {:?}", size)))?;
        let object_type = object_type.to_string();

        let mut content = Vec::new();
        if mode == BatchMode::Contents {
            reader.by_ref().take(size).read_to_end(&mut content)?;
            if content.len() as u64 != size {
                return Err(GitError::malformed(command, "object content truncated"));
            }
            let mut terminator = [0u8; 1];
            reader.read_exact(&mut terminator)?;
            if terminator[0] != b'\n' {
                return Err(GitError::malformed(command, "missing object terminator"));
            }
        }

        results.push(Some(BatchObject {
            object_type,
            size,
            content,
        }));
    }

    Ok(results)
}

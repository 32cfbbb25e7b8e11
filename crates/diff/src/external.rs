//! Optional diff through an external program (e.g. `git diff --no-index`).
//!
//! Each call writes its inputs to freshly named scratch files so concurrent
//! diffs never share a path; the files are removed when the call returns.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::DiffError;

/// Scratch file removed on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub async fn create(dir: &Path, label: &str, contents: &str) -> Result<Self, DiffError> {
        let path = dir.join(format!("kwatch-{}-{}.yaml", label, Uuid::new_v4()));
        tokio::fs::write(&path, contents).await.map_err(DiffError::Scratch)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove diff scratch file");
        }
    }
}

/// Program plus leading arguments; the two scratch paths are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }

    pub fn git() -> Self {
        Self::new("git", ["--no-pager", "diff", "--no-index", "--no-color"])
    }

    /// Parse a whitespace-separated command line such as `diff -u`.
    pub fn parse(cmdline: &str) -> Option<Self> {
        let mut parts = cmdline.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

/// Run `tool` on the canonical YAML of both inputs and return its stdout.
///
/// Exit status 1 means "inputs differ" for diff-like tools and is accepted.
pub async fn diff_with_tool(tool: &ExternalTool, old: &str, new: &str) -> Result<String, DiffError> {
    let dir = std::env::temp_dir();
    let a = ScratchFile::create(&dir, "old", old).await?;
    let b = ScratchFile::create(&dir, "new", new).await?;
    debug!(program = %tool.program, old = %a.path().display(), new = %b.path().display(), "running external diff");

    let out = tokio::process::Command::new(&tool.program)
        .args(&tool.args)
        .arg(a.path())
        .arg(b.path())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DiffError::Spawn { program: tool.program.clone(), source })?;

    match out.status.code() {
        Some(0) | Some(1) => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        _ => Err(DiffError::ToolFailed {
            program: tool.program.clone(),
            status: out.status.to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }),
    }
}

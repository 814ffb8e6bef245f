//! Container filesystem access over one-shot execs.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use thiserror::Error;

use crate::{
    run::{CommandRunner, ExecError, ExecOutput},
    shell::{self, QuoteError},
};

/// Directory listed when none is given.
pub const DEFAULT_ROOT: &str = "/workspace";

/// Paths `delete` refuses to touch.
pub const PROTECTED_PATHS: [&str; 3] = ["/", "/workspace", "/home"];

/// Raw bytes per write command; base64 expands this by a third.
const WRITE_CHUNK_LEN: usize = 48 * 1024;

/// Filesystem operation error.
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error("Command exited with status {code}: {stderr}")]
    CommandFailed { code: i64, stderr: String },
    #[error("Cannot delete protected path: {0}")]
    ProtectedPath(String),
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    pub path: String,
}

/// Result of listing a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirListing {
    pub items: Vec<DirEntry>,
    pub path: String,
}

/// Filesystem of one container, reached through a command runner.
#[derive(Clone)]
pub struct RemoteFs {
    runner: Arc<dyn CommandRunner>,
    target: String,
}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl RemoteFs {
    /// Create a filesystem handle for `target`.
    pub fn new(runner: Arc<dyn CommandRunner>, target: impl Into<String>) -> Self {
        Self {
            runner,
            target: target.into(),
        }
    }

    /// Target container.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run argv and fail on a non-zero exit code.
    pub(crate) async fn exec(&self, command: Vec<String>) -> Result<ExecOutput, FsError> {
        let output = self.runner.run(&self.target, command).await?;
        match output.exit_code {
            Some(code) if code != 0 => Err(FsError::CommandFailed {
                code,
                stderr: output.stderr.trim().to_string(),
            }),
            _ => Ok(output),
        }
    }

    /// List a directory, directories first.
    ///
    /// # Errors
    /// Returns error if `ls` fails.
    pub async fn list_directory(
        &self,
        path: Option<&str>,
        show_hidden: bool,
    ) -> Result<DirListing, FsError> {
        let path = path.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_ROOT);
        let mut command: Vec<String> = ["ls", "-F", "-1", "--group-directories-first"]
            .into_iter()
            .map(String::from)
            .collect();
        if show_hidden {
            command.push("-a".to_string());
        }
        command.push(path.to_string());

        let output = self.exec(command).await?;
        Ok(DirListing {
            items: parse_listing(&output.stdout, path),
            path: path.to_string(),
        })
    }

    /// Read a file as text.
    ///
    /// # Errors
    /// Returns error if `cat` fails.
    pub async fn read_file(&self, path: &str) -> Result<String, FsError> {
        let output = self
            .exec(vec!["cat".to_string(), path.to_string()])
            .await?;
        Ok(output.stdout)
    }

    /// Write bytes to a file, replacing its contents.
    ///
    /// # Errors
    /// Returns error if any chunk fails to write.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        for script in write_scripts(path, content)? {
            self.exec(shell::sh_c(script)).await?;
        }
        tracing::debug!(container = %self.target, path, bytes = content.len(), "Wrote file");
        Ok(())
    }

    /// Move or rename a path.
    ///
    /// # Errors
    /// Returns error if `mv` fails.
    pub async fn rename(&self, path: &str, destination: &str) -> Result<(), FsError> {
        self.exec(vec!["mv".into(), path.into(), destination.into()])
            .await?;
        Ok(())
    }

    /// Recursively delete a path.
    ///
    /// # Errors
    /// Returns `ProtectedPath` for `/`, `/workspace` and `/home`, or error if
    /// `rm` fails.
    pub async fn delete(&self, path: &str) -> Result<(), FsError> {
        if is_protected(path) {
            return Err(FsError::ProtectedPath(path.to_string()));
        }
        self.exec(vec!["rm".into(), "-rf".into(), path.into()])
            .await?;
        Ok(())
    }

    /// Create a directory and its parents.
    ///
    /// # Errors
    /// Returns error if `mkdir` fails.
    pub async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.exec(vec!["mkdir".into(), "-p".into(), path.into()])
            .await?;
        Ok(())
    }
}

fn is_protected(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    let normalized = if trimmed.is_empty() { "/" } else { trimmed };
    PROTECTED_PATHS.contains(&normalized)
}

/// Parse `ls -F -1` output into entries under `base`.
#[must_use]
pub fn parse_listing(output: &str, base: &str) -> Vec<DirEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (name, is_directory) = match line.strip_suffix('/') {
                Some(name) => (name, true),
                None => (
                    line.strip_suffix(['*', '@', '=', '|']).unwrap_or(line),
                    false,
                ),
            };
            if name == "." || name == ".." {
                return None;
            }
            Some(DirEntry {
                name: name.to_string(),
                is_directory,
                path: join_path(base, name),
            })
        })
        .collect()
}

/// Join with single slashes.
#[must_use]
pub fn join_path(base: &str, name: &str) -> String {
    let joined = format!("{base}/{name}");
    let mut out = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Shell scripts that write `content` to `path` chunk by chunk.
fn write_scripts(path: &str, content: &[u8]) -> Result<Vec<String>, QuoteError> {
    let quoted = shell::quote(path)?;
    if content.is_empty() {
        return Ok(vec![format!(": > {quoted}")]);
    }
    Ok(content
        .chunks(WRITE_CHUNK_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let redirect = if i == 0 { ">" } else { ">>" };
            format!(
                "printf '%s' {} | base64 -d {redirect} {quoted}",
                STANDARD.encode(chunk)
            )
        })
        .collect())
}

//! Handler discovery and matching.
//!
//! Any executable file under the handlers root is a handler. A handler fires
//! for a request when the directory it lives in is an ancestor of (or equal
//! to) the directory the request path names, so a handler at the root fires
//! for every write and one at `a/b` fires for `a/b` and `a/b/c` only.
//!
//! The filesystem is rescanned on every call; nothing is cached.

pub mod describe;

pub use describe::{extract_description, read_description, HandlerDescriptor};

use sparcus_common::RequestPath;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors from scanning the handlers tree.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot read handlers directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Any of the owner, group or other execute bits.
const EXECUTE_BITS: u32 = 0o111;

/// Scans a handlers root for executables.
#[derive(Debug, Clone)]
pub struct HandlerResolver {
    root: PathBuf,
}

impl HandlerResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every executable under the root, sorted by path.
    ///
    /// Fails only when the root itself cannot be read. Unreadable
    /// subdirectories are skipped with a warning. Symlinks to files are
    /// followed; symlinks to directories are not descended into.
    pub fn executables(&self) -> Result<Vec<PathBuf>, ResolveError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| ResolveError::Unreadable {
            path: self.root.clone(),
            source: e,
        })?;

        let mut found = Vec::new();
        let mut pending: Vec<std::fs::ReadDir> = vec![entries];

        while let Some(dir) = pending.pop() {
            for entry in dir {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable handler entry");
                        continue;
                    }
                };
                let path = entry.path();

                let is_real_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_real_dir {
                    match std::fs::read_dir(&path) {
                        Ok(sub) => pending.push(sub),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable handler directory")
                        }
                    }
                    continue;
                }

                if is_executable(&path) {
                    trace!(path = %path.display(), "found handler");
                    found.push(path);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Handlers that fire for `request`, sorted by path.
    pub fn resolve(&self, request: &RequestPath) -> Result<Vec<PathBuf>, ResolveError> {
        let request_dir = request
            .segments()
            .fold(self.root.clone(), |dir, segment| dir.join(segment));

        let matched: Vec<PathBuf> = self
            .executables()?
            .into_iter()
            .filter(|handler| {
                handler
                    .parent()
                    .is_some_and(|dir| request_dir.starts_with(dir))
            })
            .collect();

        debug!(path = %request, count = matched.len(), "resolved handlers");
        Ok(matched)
    }

    /// One descriptor per executable under the root, independent of any
    /// request.
    pub fn describe(&self) -> Result<Vec<HandlerDescriptor>, ResolveError> {
        let descriptors = self
            .executables()?
            .into_iter()
            .map(|handler| self.descriptor(&handler))
            .collect();
        Ok(descriptors)
    }

    fn descriptor(&self, handler: &Path) -> HandlerDescriptor {
        let relative_dir = handler
            .parent()
            .and_then(|dir| dir.strip_prefix(&self.root).ok())
            .map(|rel| rel.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = if relative_dir.is_empty() {
            String::new()
        } else {
            format!("/{relative_dir}")
        };

        HandlerDescriptor {
            full_path: handler.display().to_string(),
            path,
            script: handler
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            description: read_description(handler),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & EXECUTE_BITS != 0)
        .unwrap_or(false)
}

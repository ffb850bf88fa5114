//! File transfer engine.
//!
//! Directory-aware operations built on top of a [`DataChannel`]: existence
//! probes, listing, recursive directory creation, and single-file or
//! recursive transfers with include/exclude glob filtering.

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ports::{DataChannel, FileKind};

/// Include/exclude filter applied to files during recursive transfers.
///
/// Patterns match the path of a file relative to the transfer root, with
/// `/` separators. Directories are always traversed and created; only file
/// payloads are filtered. Exclusion wins over inclusion.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    include: Option<Pattern>,
    exclude: Option<Pattern>,
}

impl TransferFilter {
    /// Build a filter from optional glob pattern strings.
    ///
    /// # Errors
    ///
    /// Fails if either pattern is not a valid glob.
    pub fn from_patterns(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let parse = |field: &'static str, pattern: &str| {
            Pattern::new(pattern).map_err(|e| Error::ConfigInvalid {
                field: field.to_string(),
                reason: format!("invalid glob pattern '{pattern}': {e}"),
            })
        };
        Ok(Self {
            include: include.map(|p| parse("include", p)).transpose()?,
            exclude: exclude.map(|p| parse("exclude", p)).transpose()?,
        })
    }

    #[must_use]
    pub fn accepts(&self, relative: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.matches(relative) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.matches(relative) {
                return false;
            }
        }
        true
    }
}

/// Totals for one recursive transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: u64,
    pub bytes: u64,
    pub dirs: u64,
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(unix)]
fn local_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn local_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Transfer operations over one open data channel.
///
/// The engine borrows its channel; callers open exactly one channel per
/// operation and close it when the engine is done.
pub struct TransferEngine<'a> {
    channel: &'a dyn DataChannel,
}

impl<'a> TransferEngine<'a> {
    #[must_use]
    pub fn new(channel: &'a dyn DataChannel) -> Self {
        Self { channel }
    }

    /// Whether `path` exists and is a directory. A missing path is `false`,
    /// not an error.
    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        match self.channel.stat(path).await {
            Ok(stat) => Ok(stat.is_dir()),
            Err(Error::NoSuchPath { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether `path` exists and is a regular file. A missing path is
    /// `false`, not an error.
    pub async fn is_file(&self, path: &str) -> Result<bool> {
        match self.channel.stat(path).await {
            Ok(stat) => Ok(stat.is_file()),
            Err(Error::NoSuchPath { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List `path`: a directory yields its entry names, a non-directory
    /// yields its own basename, a missing path yields an empty list.
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        match self.channel.stat(path).await {
            Ok(stat) if stat.is_dir() => {
                let entries = self.channel.read_dir(path).await?;
                Ok(entries.into_iter().map(|e| e.name).collect())
            }
            Ok(_) => Ok(vec![basename(path).to_string()]),
            Err(Error::NoSuchPath { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Create `path` and any missing ancestors.
    ///
    /// The missing suffix is found by probing upward with `real_path` until
    /// an existing ancestor resolves, then the missing components are
    /// created downward from it. A concurrent creation of the same
    /// directory is tolerated.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` if `path` or an ancestor exists as a
    /// non-directory.
    pub async fn mkdir_p(&self, path: &str) -> Result<()> {
        match self.channel.stat(path).await {
            Ok(stat) if stat.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(Error::AlreadyExists {
                    path: path.to_string(),
                })
            }
            Err(Error::NoSuchPath { .. }) => {}
            Err(e) => return Err(e),
        }

        // Walk upward collecting missing components until an ancestor
        // resolves.
        let mut missing = vec![basename(path).to_string()];
        let mut current = parent(path);
        let base = loop {
            match self.channel.real_path(&current).await {
                Ok(resolved) => {
                    if !self.channel.stat(&resolved).await?.is_dir() {
                        return Err(Error::MustBeDirectory { path: resolved });
                    }
                    break resolved;
                }
                Err(Error::NoSuchPath { .. }) => {
                    let next = parent(&current);
                    if next == current {
                        return Err(Error::NoSuchPath { path: current });
                    }
                    missing.push(basename(&current).to_string());
                    current = next;
                }
                Err(e) => return Err(e),
            }
        };

        // Create the missing suffix downward, parent before child.
        let mut built = base;
        for name in missing.iter().rev() {
            built = join_remote(&built, name);
            match self.channel.mkdir(&built).await {
                Ok(()) => debug!(path = %built, "Created remote directory"),
                Err(e) => {
                    // Another writer may have created it first.
                    match self.channel.stat(&built).await {
                        Ok(stat) if stat.is_dir() => {}
                        Ok(_) => {
                            return Err(Error::AlreadyExists { path: built });
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Upload one local file. If `remote` is an existing directory, the
    /// file lands inside it under its local basename. Returns bytes sent.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<u64> {
        let metadata = tokio::fs::metadata(local).await.map_err(|_| Error::NoSuchPath {
            path: local.display().to_string(),
        })?;
        if !metadata.is_file() {
            return Err(Error::MustBeFile {
                path: local.display().to_string(),
            });
        }

        let destination = if self.is_dir(remote).await? {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::MustBeFile {
                    path: local.display().to_string(),
                })?;
            join_remote(remote, &name)
        } else {
            remote.to_string()
        };

        let bytes = self
            .channel
            .stream_put(local, &destination, local_mode(&metadata))
            .await?;
        info!(local = %local.display(), remote = %destination, bytes, "Uploaded file");
        Ok(bytes)
    }

    /// Download one remote file. If `local` is an existing directory, the
    /// file lands inside it under its remote basename. Returns bytes read.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<u64> {
        let stat = self.channel.stat(remote).await?;
        if !stat.is_file() {
            return Err(Error::MustBeFile {
                path: remote.to_string(),
            });
        }

        let destination: PathBuf = match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_dir() => local.join(basename(remote)),
            _ => local.to_path_buf(),
        };
        if let Some(dir) = destination.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let bytes = self.channel.stream_get(remote, &destination).await?;
        info!(remote = %remote, local = %destination.display(), bytes, "Downloaded file");
        Ok(bytes)
    }

    /// Upload a local directory tree under `remote`, creating directories
    /// as needed. Symlinks are skipped; files failing the filter are
    /// skipped but their directories are still created.
    pub async fn put_recursive(
        &self,
        local: &Path,
        remote: &str,
        filter: &TransferFilter,
    ) -> Result<TransferSummary> {
        let metadata = tokio::fs::metadata(local).await.map_err(|_| Error::NoSuchPath {
            path: local.display().to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(Error::MustBeDirectory {
                path: local.display().to_string(),
            });
        }

        self.mkdir_p(remote).await?;

        let mut summary = TransferSummary::default();
        let mut stack: Vec<(PathBuf, String, String)> =
            vec![(local.to_path_buf(), remote.to_string(), String::new())];

        while let Some((local_dir, remote_dir, relative)) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&local_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_relative = if relative.is_empty() {
                    name.clone()
                } else {
                    format!("{relative}/{name}")
                };
                let file_type = entry.file_type().await?;

                if file_type.is_symlink() {
                    debug!(path = %entry.path().display(), "Skipping symlink");
                    continue;
                }
                if file_type.is_dir() {
                    let remote_child = join_remote(&remote_dir, &name);
                    match self.channel.mkdir(&remote_child).await {
                        Ok(()) => {}
                        Err(Error::AlreadyExists { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    summary.dirs += 1;
                    stack.push((entry.path(), remote_child, child_relative));
                    continue;
                }
                if !filter.accepts(&child_relative) {
                    debug!(path = %child_relative, "Skipping filtered file");
                    continue;
                }
                let entry_meta = entry.metadata().await?;
                let bytes = self
                    .channel
                    .stream_put(
                        &entry.path(),
                        &join_remote(&remote_dir, &name),
                        local_mode(&entry_meta),
                    )
                    .await?;
                summary.files += 1;
                summary.bytes += bytes;
            }
        }

        info!(
            local = %local.display(),
            remote = %remote,
            files = summary.files,
            bytes = summary.bytes,
            "Uploaded directory"
        );
        Ok(summary)
    }

    /// Download a remote directory tree under `local`, creating local
    /// directories as needed. Symlinks are skipped; files failing the
    /// filter are skipped but their directories are still created.
    pub async fn get_recursive(
        &self,
        remote: &str,
        local: &Path,
        filter: &TransferFilter,
    ) -> Result<TransferSummary> {
        if !self.channel.stat(remote).await?.is_dir() {
            return Err(Error::MustBeDirectory {
                path: remote.to_string(),
            });
        }

        tokio::fs::create_dir_all(local).await?;

        let mut summary = TransferSummary::default();
        let mut stack: Vec<(String, PathBuf, String)> =
            vec![(remote.to_string(), local.to_path_buf(), String::new())];

        while let Some((remote_dir, local_dir, relative)) = stack.pop() {
            for entry in self.channel.read_dir(&remote_dir).await? {
                let child_relative = if relative.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{relative}/{}", entry.name)
                };
                match entry.stat.kind {
                    FileKind::Symlink => {
                        debug!(path = %child_relative, "Skipping symlink");
                    }
                    FileKind::Dir => {
                        let local_child = local_dir.join(&entry.name);
                        tokio::fs::create_dir_all(&local_child).await?;
                        summary.dirs += 1;
                        stack.push((
                            join_remote(&remote_dir, &entry.name),
                            local_child,
                            child_relative,
                        ));
                    }
                    FileKind::File => {
                        if !filter.accepts(&child_relative) {
                            debug!(path = %child_relative, "Skipping filtered file");
                            continue;
                        }
                        let bytes = self
                            .channel
                            .stream_get(
                                &join_remote(&remote_dir, &entry.name),
                                &local_dir.join(&entry.name),
                            )
                            .await?;
                        summary.files += 1;
                        summary.bytes += bytes;
                    }
                    FileKind::Other => {
                        debug!(path = %child_relative, "Skipping special file");
                    }
                }
            }
        }

        info!(
            remote = %remote,
            local = %local.display(),
            files = summary.files,
            bytes = summary.bytes,
            "Downloaded directory"
        );
        Ok(summary)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Atomic replacement of destination files.
//!
//! Rendered output is written to a temporary file in the destination's
//! directory, given its final mode and owner, flushed, and renamed over the
//! destination. Readers only ever see the old file or the new one.
//!
//! The backup slot is only rotated once everything that can fail before the
//! final rename has succeeded.

use std::fs::{self, File, Metadata, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::CommitError;
use crate::owner;
use crate::spec::{DEFAULT_FILE_MODE, TemplateSpec, backup_path};

/// Fingerprint of the content last written to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    /// Content hash.
    pub hash: blake3::Hash,
    /// Content length in bytes.
    pub len: u64,
    /// When the content was written or first observed.
    pub recorded_at: DateTime<Utc>,
}

impl RenderedArtifact {
    /// Fingerprints `contents`.
    pub fn of(contents: &[u8]) -> Self {
        Self {
            hash: blake3::hash(contents),
            len: contents.len() as u64,
            recorded_at: Utc::now(),
        }
    }

    /// Fingerprints whatever is currently at `path`, if anything.
    pub fn load(path: &Path) -> io::Result<Option<Self>> {
        match fs::read(path) {
            Ok(contents) => Ok(Some(Self::of(&contents))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether `contents` is byte-identical to the fingerprinted content.
    pub fn matches(&self, contents: &[u8]) -> bool {
        self.len == contents.len() as u64 && self.hash == blake3::hash(contents)
    }
}

/// What a commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The content matched what is already on disk; nothing was touched.
    Unchanged,
    /// The destination was replaced.
    Written {
        /// Where the previous content was preserved, if backups are on.
        backup: Option<PathBuf>,
    },
}

/// Writes rendered output to destination files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCommitter;

impl FileCommitter {
    /// Creates a committer.
    pub const fn new() -> Self {
        Self
    }

    /// Commits `contents` to `spec.destination`.
    ///
    /// `artifact` is the fingerprint of the current destination content. It
    /// is consulted to skip identical writes and updated after a successful
    /// write. On error the destination and its backup are left untouched.
    pub fn commit(
        &self,
        spec: &TemplateSpec,
        contents: &[u8],
        artifact: &mut Option<RenderedArtifact>,
    ) -> Result<CommitOutcome, CommitError> {
        if artifact.as_ref().is_some_and(|current| current.matches(contents)) {
            debug!(destination = %spec.destination.display(), "content unchanged");
            return Ok(CommitOutcome::Unchanged);
        }

        let backup = self.stage(spec, contents)?.publish()?;
        *artifact = Some(RenderedArtifact::of(contents));
        Ok(CommitOutcome::Written { backup })
    }

    /// Prepares a commit without making anything visible.
    ///
    /// The new content is written to a temporary file next to the
    /// destination with its final mode and owner, and synced. When backups
    /// are on, a copy of the current destination is staged the same way.
    /// Dropping the result discards both.
    pub fn stage(
        &self,
        spec: &TemplateSpec,
        contents: &[u8],
    ) -> Result<StagedCommit, CommitError> {
        let destination = spec.destination.as_path();
        let directory = parent_dir(destination);
        ensure_directory(directory, spec.create_dest_dirs)?;

        let existing = match fs::metadata(destination) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(CommitError::Write {
                    path: destination.to_path_buf(),
                    source,
                });
            }
        };

        let mode = spec
            .perms
            .map(|perms| perms.bits())
            .or_else(|| existing.as_ref().map(|meta| meta.mode() & 0o7777))
            .unwrap_or(DEFAULT_FILE_MODE);
        let owner = resolve_owner(spec, existing.as_ref())?;

        let mut staged = stage_contents(destination, directory, contents)?;
        fs::set_permissions(staged.path(), Permissions::from_mode(mode)).map_err(|source| {
            CommitError::Permissions {
                path: destination.to_path_buf(),
                mode,
                source,
            }
        })?;
        apply_owner(&staged, destination, owner)?;
        staged
            .as_file_mut()
            .sync_all()
            .map_err(|source| CommitError::Write {
                path: destination.to_path_buf(),
                source,
            })?;

        let backup = match &existing {
            Some(meta) if spec.backup => Some(stage_backup(destination, directory, meta)?),
            _ => None,
        };

        Ok(StagedCommit {
            destination: destination.to_path_buf(),
            directory: directory.to_path_buf(),
            contents: staged,
            backup,
        })
    }
}

/// A fully written commit that is not yet visible at the destination.
#[derive(Debug)]
pub struct StagedCommit {
    destination: PathBuf,
    directory: PathBuf,
    contents: NamedTempFile,
    backup: Option<NamedTempFile>,
}

impl StagedCommit {
    /// Renames the staged backup into the backup slot, then the new content
    /// over the destination. Returns the backup path, if one was staged.
    pub fn publish(self) -> Result<Option<PathBuf>, CommitError> {
        let backup = match self.backup {
            Some(staged) => {
                let target = backup_path(&self.destination);
                staged.persist(&target).map_err(|e| CommitError::Backup {
                    path: self.destination.clone(),
                    source: e.error,
                })?;
                debug!(backup = %target.display(), "previous content backed up");
                Some(target)
            }
            None => None,
        };

        self.contents
            .persist(&self.destination)
            .map_err(|e| CommitError::Rename {
                path: self.destination.clone(),
                source: e.error,
            })?;
        sync_directory(&self.directory);
        Ok(backup)
    }
}

/// Owner to apply to the staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerChange {
    /// Configured explicitly; failures are errors.
    Required { uid: Option<u32>, gid: Option<u32> },
    /// Carried over from the replaced file; failures are logged.
    Preserve { uid: u32, gid: u32 },
    None,
}

fn resolve_owner(
    spec: &TemplateSpec,
    existing: Option<&Metadata>,
) -> Result<OwnerChange, CommitError> {
    if spec.ownership.is_unset() {
        return Ok(existing.map_or(OwnerChange::None, |meta| OwnerChange::Preserve {
            uid: meta.uid(),
            gid: meta.gid(),
        }));
    }
    let uid = spec.ownership.user.as_deref().map(owner::resolve_user).transpose()?;
    let gid = spec.ownership.group.as_deref().map(owner::resolve_group).transpose()?;
    Ok(OwnerChange::Required { uid, gid })
}

fn apply_owner(
    staged: &NamedTempFile,
    destination: &Path,
    owner: OwnerChange,
) -> Result<(), CommitError> {
    match owner {
        OwnerChange::None => Ok(()),
        OwnerChange::Required { uid, gid } => {
            std::os::unix::fs::chown(staged.path(), uid, gid).map_err(|source| {
                CommitError::Ownership {
                    path: destination.to_path_buf(),
                    source,
                }
            })
        }
        OwnerChange::Preserve { uid, gid } => {
            let staged_meta = staged.as_file().metadata().ok();
            let already = staged_meta.is_some_and(|meta| meta.uid() == uid && meta.gid() == gid);
            if !already {
                if let Err(e) = std::os::unix::fs::chown(staged.path(), Some(uid), Some(gid)) {
                    warn!(
                        destination = %destination.display(),
                        uid,
                        gid,
                        error = %e,
                        "could not preserve owner of replaced file"
                    );
                }
            }
            Ok(())
        }
    }
}

fn parent_dir(destination: &Path) -> &Path {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn ensure_directory(directory: &Path, create: bool) -> Result<(), CommitError> {
    if directory.is_dir() {
        return Ok(());
    }
    if !create {
        return Err(CommitError::MissingDirectory(directory.to_path_buf()));
    }
    fs::create_dir_all(directory).map_err(|source| CommitError::CreateDirectory {
        path: directory.to_path_buf(),
        source,
    })
}

fn temp_builder(prefix: &str) -> tempfile::Builder<'_, 'static> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(".tmp");
    builder
}

fn stage_contents(
    destination: &Path,
    directory: &Path,
    contents: &[u8],
) -> Result<NamedTempFile, CommitError> {
    let write_err = |source| CommitError::Write {
        path: destination.to_path_buf(),
        source,
    };
    let prefix = format!(".{}.", file_name(destination));
    let mut staged = temp_builder(&prefix).tempfile_in(directory).map_err(write_err)?;
    staged.write_all(contents).map_err(write_err)?;
    Ok(staged)
}

/// Copies the current destination into a temporary file bound for the
/// backup slot, keeping its mode and, where possible, its owner.
fn stage_backup(
    destination: &Path,
    directory: &Path,
    meta: &Metadata,
) -> Result<NamedTempFile, CommitError> {
    let backup_err = |source| CommitError::Backup {
        path: destination.to_path_buf(),
        source,
    };
    let prefix = format!(".{}.bak.", file_name(destination));
    let mut staged = temp_builder(&prefix).tempfile_in(directory).map_err(backup_err)?;

    let mut current = File::open(destination).map_err(backup_err)?;
    io::copy(&mut current, staged.as_file_mut()).map_err(backup_err)?;
    fs::set_permissions(staged.path(), Permissions::from_mode(meta.mode() & 0o7777))
        .map_err(backup_err)?;
    if let Err(e) = std::os::unix::fs::chown(staged.path(), Some(meta.uid()), Some(meta.gid())) {
        debug!(
            destination = %destination.display(),
            error = %e,
            "could not copy owner to backup"
        );
    }
    staged.as_file_mut().sync_all().map_err(backup_err)?;
    Ok(staged)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "ward".to_string(), |name| name.to_string_lossy().into_owned())
}

fn sync_directory(directory: &Path) {
    if let Err(e) = File::open(directory).and_then(|dir| dir.sync_all()) {
        debug!(directory = %directory.display(), error = %e, "directory sync failed");
    }
}

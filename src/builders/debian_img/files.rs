use log::{info, trace, warn};
use std::fmt;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Error in [`TargetRoot`] adapter.
#[derive(Error, Debug)]
pub enum TargetFsError {
    /// Failed to read file.
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Failed to write file.
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    /// Failed to create directory.
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    /// Failed to remove file.
    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    /// Failed to create symlink.
    #[error("failed to create symlink {path} -> {target}: {source}")]
    Symlink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    /// Failed to copy file from host.
    #[error("failed to copy {src_path} -> {dst_path}: {source}")]
    Copy {
        src_path: PathBuf,
        dst_path: PathBuf,
        source: io::Error,
    },
}

/// Target system root adapter.
///
/// All paths given to its methods are interpreted relative to the root,
/// e.g. `/etc/hostname` means `<root>/etc/hostname`.
///
/// Writes are not atomic: a failure in the middle of a write may leave a truncated file.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct TargetRoot<'a> {
    root: &'a Path,
}

impl<'a> TargetRoot<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    /// Host path of a path inside target root.
    pub fn path<P>(&self, path: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        let relative = path
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<PathBuf>();
        self.root.join(relative)
    }

    /// Replace file content.
    pub fn write<P>(&self, path: P, contents: &str) -> Result<(), TargetFsError>
    where
        P: AsRef<Path>,
    {
        self.write_inner(path.as_ref(), contents, false)
    }

    /// Append content to the end of the file, creating it if needed.
    pub fn append<P>(&self, path: P, contents: &str) -> Result<(), TargetFsError>
    where
        P: AsRef<Path>,
    {
        self.write_inner(path.as_ref(), contents, true)
    }

    fn write_inner(&self, path: &Path, contents: &str, append: bool) -> Result<(), TargetFsError> {
        info!("writing {}", path.display());
        let full_path = self.path(path);
        let result = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&full_path)
            .and_then(|mut file| file.write_all(contents.as_bytes()));
        result.map_err(|source| {
            warn!("error writing {}: {}", full_path.display(), source);
            TargetFsError::Write {
                path: full_path,
                source,
            }
        })
    }

    /// Read file content.
    pub fn read<P>(&self, path: P) -> Result<String, TargetFsError>
    where
        P: AsRef<Path>,
    {
        let full_path = self.path(path.as_ref());
        trace!("reading {}", full_path.display());
        fs::read_to_string(&full_path).map_err(|source| {
            warn!("error reading {}: {}", full_path.display(), source);
            TargetFsError::Read {
                path: full_path,
                source,
            }
        })
    }

    /// Create directory with all parents using given permissions.
    pub fn create_dir_all<P>(&self, path: P, mode: u32) -> Result<(), TargetFsError>
    where
        P: AsRef<Path>,
    {
        let full_path = self.path(path);
        trace!("mkdir: {}", full_path.display());
        DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(&full_path)
            .map_err(|source| TargetFsError::CreateDir {
                path: full_path,
                source,
            })
    }

    /// Remove file or symlink. Returns `false` if there was nothing to remove.
    pub fn remove_file<P>(&self, path: P) -> Result<bool, TargetFsError>
    where
        P: AsRef<Path>,
    {
        let full_path = self.path(path);
        match fs::remove_file(&full_path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(TargetFsError::Remove {
                path: full_path,
                source,
            }),
        }
    }

    /// Create symlink at `path` pointing to `target`.
    ///
    /// `target` is stored as is, so absolute targets resolve inside the target system.
    pub fn symlink<T, P>(&self, target: T, path: P) -> Result<(), TargetFsError>
    where
        T: AsRef<Path>,
        P: AsRef<Path>,
    {
        let full_path = self.path(path);
        trace!(
            "symlink {} -> {}",
            full_path.display(),
            target.as_ref().display()
        );
        symlink(target.as_ref(), &full_path).map_err(|source| TargetFsError::Symlink {
            path: full_path,
            target: target.as_ref().to_path_buf(),
            source,
        })
    }

    /// Copy file from host into target root.
    pub fn copy_from_host<P1, P2>(&self, host_path: P1, path: P2) -> Result<(), TargetFsError>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        let full_path = self.path(path);
        trace!(
            "copy: {} -> {}",
            host_path.as_ref().display(),
            full_path.display()
        );
        fs::copy(host_path.as_ref(), &full_path)
            .map(|_| ())
            .map_err(|source| TargetFsError::Copy {
                src_path: host_path.as_ref().to_path_buf(),
                dst_path: full_path,
                source,
            })
    }

    /// Whether path exists inside target root. Dangling symlinks count as existing.
    pub fn exists<P>(&self, path: P) -> bool
    where
        P: AsRef<Path>,
    {
        fs::symlink_metadata(self.path(path)).is_ok()
    }
}

impl<'a> fmt::Debug for TargetRoot<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

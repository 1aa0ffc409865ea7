//! Scoped in-process root switching.
//!
//! ```ignore
//! {
//!     let _guard = ChrootGuard::enter("/mnt")?;
//!     // everything here sees /mnt as /
//! }
//! // original root and working directory are back
//! ```

use log::{debug, error};
use nix::unistd;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error of root switching.
#[derive(Error, Debug)]
pub enum ChrootError {
    /// Cannot remember current root or working directory.
    #[error("failed to save current root: {0}")]
    Save(#[source] std::io::Error),

    /// Cannot enter new root.
    #[error("failed to chroot into {path}: {source}")]
    Enter { path: PathBuf, source: nix::Error },
}

/// Process root switched to a directory until dropped.
///
/// Holds a descriptor of the original root, so it can be restored from inside the new one.
#[derive(Debug)]
pub struct ChrootGuard {
    root: PathBuf,
    old_root: File,
    old_cwd: PathBuf,
}

impl ChrootGuard {
    /// Switch process root to `root`.
    ///
    /// If switching fails, the process is left in its original root and working directory.
    pub fn enter<P>(root: P) -> Result<Self, ChrootError>
    where
        P: AsRef<Path>,
    {
        let root = root.as_ref().to_path_buf();
        let old_cwd = std::env::current_dir().map_err(ChrootError::Save)?;
        let old_root = File::open("/").map_err(ChrootError::Save)?;

        let enter_error = |source| ChrootError::Enter {
            path: root.clone(),
            source,
        };
        unistd::chdir(&root).map_err(enter_error)?;
        if let Err(err) = unistd::chroot(".") {
            let _ = unistd::chdir(&old_cwd);
            return Err(enter_error(err));
        }
        debug!("entered chroot {}", root.display());

        Ok(Self {
            root,
            old_root,
            old_cwd,
        })
    }

    fn restore(&self) -> nix::Result<()> {
        unistd::fchdir(self.old_root.as_raw_fd())?;
        unistd::chroot(".")?;
        unistd::chdir(&self.old_cwd)
    }
}

impl Drop for ChrootGuard {
    fn drop(&mut self) {
        match self.restore() {
            Ok(()) => debug!("left chroot {}", self.root.display()),
            Err(err) => error!(
                "failed to leave chroot {}: {}; process root is left switched",
                self.root.display(),
                err
            ),
        }
    }
}

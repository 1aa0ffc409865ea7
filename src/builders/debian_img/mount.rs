use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::builders::Stage;

use super::partition::{BOOT_PARTITION, ROOT_PARTITION};
use super::utils::{Command, ExecError, Executor};
use super::{ImageBuildContext, BOOT_FIRMWARE_DIR};

/// Host filesystems bind-mounted into target root while packages are installed.
const BIND_MOUNTS: [&str; 4] = ["/proc", "/sys", "/dev", "/dev/pts"];

fn mount(exec: &dyn Executor, source: &Path, target: &Path) -> Result<(), ExecError> {
    exec.run(
        Command::new("mount")
            .args(["-o", "exec,dev"])
            .arg(source)
            .arg(target),
    )
}

fn umount(exec: &dyn Executor, target: &Path) -> Result<(), ExecError> {
    exec.run(Command::new("umount").arg(target))
}

/// Host filesystems bind-mounted into target root.
///
/// Filesystems are unmounted in reverse order when dropped. Unmount errors are logged only.
pub struct BindMounts<'a> {
    exec: &'a dyn Executor,
    mounted: Vec<PathBuf>,
}

impl<'a> BindMounts<'a> {
    /// Bind-mount `/proc`, `/sys`, `/dev` and `/dev/pts` under `root`.
    ///
    /// If some mount fails, already mounted ones are unmounted.
    pub fn mount(exec: &'a dyn Executor, root: &Path) -> Result<Self> {
        let mut mounts = Self {
            exec,
            mounted: Vec::with_capacity(BIND_MOUNTS.len()),
        };
        for source in BIND_MOUNTS {
            let target = root.join(source.trim_start_matches('/'));
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            exec.run(Command::new("mount").arg("--bind").arg(source).arg(&target))
                .with_context(|| format!("failed to bind-mount {}", source))?;
            mounts.mounted.push(target);
        }
        Ok(mounts)
    }
}

impl Drop for BindMounts<'_> {
    fn drop(&mut self) {
        while let Some(target) = self.mounted.pop() {
            debug!("unmounting {}", target.display());
            if let Err(err) = umount(self.exec, &target) {
                warn!("failed to unmount {}: {}", target.display(), err);
            }
        }
    }
}

/// Mount root partition at the mountpoint.
///
/// # Context variables required
/// - `loop_dev`
pub struct MountRoot;

impl MountRoot {
    pub const NAME: &'static str = "root-mounted";
}

impl Stage<ImageBuildContext> for MountRoot {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let source = ctx.loop_dev("mount root partition")?.part(ROOT_PARTITION)?;
        let mountpoint = ctx.mountpoint();
        fs::create_dir_all(mountpoint)
            .with_context(|| format!("failed to create {}", mountpoint.display()))?;
        info!("mounting {} at {}", source.display(), mountpoint.display());
        mount(ctx.exec(), &source, mountpoint).context("failed to mount root partition")?;
        Ok(None)
    }
}

/// Mount boot partition at `/boot/firmware` of target root.
///
/// Mountpoint directory is created on every run, even if the stage itself is skipped.
///
/// # Context variables required
/// - `loop_dev`
pub struct MountBoot;

impl MountBoot {
    pub const NAME: &'static str = "boot-mounted";
}

impl Stage<ImageBuildContext> for MountBoot {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare(&mut self, ctx: &mut ImageBuildContext) -> Result<()> {
        ctx.target().create_dir_all(BOOT_FIRMWARE_DIR, 0o755)?;
        Ok(())
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let source = ctx.loop_dev("mount boot partition")?.part(BOOT_PARTITION)?;
        let target = ctx.target().path(BOOT_FIRMWARE_DIR);
        info!("mounting {} at {}", source.display(), target.display());
        mount(ctx.exec(), &source, &target).context("failed to mount boot partition")?;
        Ok(None)
    }
}

/// Unmount boot partition.
///
/// Releases [`MountBoot`] marker.
pub struct UnmountBoot;

impl UnmountBoot {
    pub const NAME: &'static str = "boot-unmounted";
}

impl Stage<ImageBuildContext> for UnmountBoot {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn releases(&self) -> &'static [&'static str] {
        &[MountBoot::NAME]
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let target = ctx.target().path(BOOT_FIRMWARE_DIR);
        info!("unmounting {}", target.display());
        umount(ctx.exec(), &target).context("failed to unmount boot partition")?;
        Ok(None)
    }
}

/// Unmount root partition.
///
/// Releases [`MountRoot`] marker.
pub struct UnmountRoot;

impl UnmountRoot {
    pub const NAME: &'static str = "root-unmounted";
}

impl Stage<ImageBuildContext> for UnmountRoot {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn releases(&self) -> &'static [&'static str] {
        &[MountRoot::NAME]
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        info!("unmounting {}", ctx.mountpoint().display());
        umount(ctx.exec(), ctx.mountpoint()).context("failed to unmount root partition")?;
        Ok(None)
    }
}

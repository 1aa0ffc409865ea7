use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::builders::{Stage, StatusValue};

use super::utils::{Command, Executor};
use super::{ImageBuildContext, ImageBuilderError};

/// Loop device manipulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopDev {
    path: PathBuf,
}

impl LoopDev {
    /// Setup loop device for file, scanning its partitions.
    pub fn setup<P>(exec: &dyn Executor, file: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let loopdev = exec
            .output(
                Command::new("losetup")
                    .args(["--find", "--partscan", "--show"])
                    .arg(file.as_ref()),
            )
            .context("set up loop device")?;
        if loopdev.is_empty() {
            return Err(anyhow!("losetup returned no device"));
        }
        Ok(Self {
            path: PathBuf::from(loopdev),
        })
    }

    /// Use loop device attached before.
    pub fn from_existing<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Detach loop device.
    pub fn detach(self, exec: &dyn Executor) -> Result<()> {
        exec.run(Command::new("losetup").arg("-d").arg(&self.path))
            .context("detach loop device")
    }

    /// Get partitioned device, e.g. `/dev/loop1p1`.
    pub fn part(&self, n: u32) -> Result<PathBuf> {
        let mut path = self.path.clone();
        let mut name = path
            .file_name()
            .ok_or(anyhow!("bad loop device"))?
            .to_os_string();
        name.push(format!("p{}", n));
        path.set_file_name(name);
        Ok(path)
    }

    /// Path to loop device.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl fmt::Display for LoopDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}

/// Attach image file to a free loop device.
///
/// Marker value is the loop device path, so later stages of a resumed run can use it.
///
/// # Context variables required
/// - `image_file`
///
/// # Context variables set
/// - `loop_dev`
pub struct AttachLoopDevice;

impl AttachLoopDevice {
    pub const NAME: &'static str = "loop-device-attached";
}

impl Stage<ImageBuildContext> for AttachLoopDevice {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn restore(&mut self, ctx: &mut ImageBuildContext, marker: &StatusValue) -> Result<()> {
        let path = marker
            .as_str()
            .ok_or(ImageBuilderError::MissingValue { stage: Self::NAME })?;
        debug!("using loop device {} from previous run", path);
        ctx.loop_dev = Some(LoopDev::from_existing(path));
        Ok(())
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let image_file = ctx.image_file("attach loop device")?;
        let loop_dev = LoopDev::setup(ctx.exec(), image_file.path())?;
        info!("loop device attached: {}", &loop_dev);
        let value = loop_dev.to_string();
        ctx.loop_dev = Some(loop_dev);
        Ok(Some(value))
    }
}

/// Detach loop device.
///
/// Releases [`AttachLoopDevice`] marker.
pub struct DetachLoopDevice;

impl DetachLoopDevice {
    pub const NAME: &'static str = "loop-device-detached";
}

impl Stage<ImageBuildContext> for DetachLoopDevice {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn releases(&self) -> &'static [&'static str] {
        &[AttachLoopDevice::NAME]
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        match ctx.loop_dev.take() {
            Some(loop_dev) => {
                info!("detaching loop device {}", &loop_dev);
                loop_dev.detach(ctx.exec())?;
            }
            None => warn!("no loop device attached, nothing to detach"),
        }
        Ok(None)
    }
}

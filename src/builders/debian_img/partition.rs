use anyhow::{bail, Context, Result};
use bytesize::ByteSize;
use log::info;

use crate::builders::Stage;

use super::utils::{Command, Executor};
use super::{ImageBuildContext, LoopDev};

/// Boot partition number.
pub const BOOT_PARTITION: u32 = 1;

/// Root partition number.
pub const ROOT_PARTITION: u32 = 2;

/// Write msdos partition table with FAT32 boot and EXT4 root partitions.
fn partition(exec: &dyn Executor, loop_dev: &LoopDev, boot_size: ByteSize) -> Result<()> {
    let boot_end_mib = boot_size.as_u64() / ByteSize::mib(1).as_u64();
    if boot_end_mib == 0 {
        bail!("boot partition size must be at least 1 MiB");
    }
    let boot_end = format!("{}MiB", boot_end_mib);

    let parted = |args: &[&str]| {
        exec.run(
            Command::new("parted")
                .arg("-s")
                .arg(loop_dev.path())
                .args(args),
        )
    };
    parted(&["mklabel", "msdos"]).context("failed to create partition table")?;
    parted(&["mkpart", "primary", "fat32", "0%", &boot_end])
        .context("failed to create boot partition")?;
    parted(&["mkpart", "primary", "ext4", &boot_end, "100%"])
        .context("failed to create root partition")?;
    Ok(())
}

/// Create filesystems on both partitions.
fn format(exec: &dyn Executor, loop_dev: &LoopDev) -> Result<()> {
    exec.run(
        Command::new("mkfs.vfat")
            .args(["-F", "32"])
            .arg(loop_dev.part(BOOT_PARTITION)?),
    )
    .context("failed to format boot partition")?;
    exec.run(
        Command::new("mkfs.ext4")
            .arg("-F")
            .arg(loop_dev.part(ROOT_PARTITION)?),
    )
    .context("failed to format root partition")?;
    Ok(())
}

/// Partition and format the disk.
///
/// # Context variables required
/// - `loop_dev`
pub struct FormatPartitions;

impl FormatPartitions {
    pub const NAME: &'static str = "partitions-formatted";
}

impl Stage<ImageBuildContext> for FormatPartitions {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let loop_dev = ctx.loop_dev("format partitions")?;
        info!("partitioning {}", loop_dev);
        partition(ctx.exec(), loop_dev, ctx.opts().partition_opts.boot_size)?;
        format(ctx.exec(), loop_dev)?;
        Ok(None)
    }
}

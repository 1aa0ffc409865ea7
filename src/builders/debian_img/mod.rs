//! Debian disk image builder for ARM single-board computers.
//!
//! Image is built by a resumable pipeline (see [`crate::builders::Pipeline`]):
//! image file → loop device → partitions → mounts → debootstrap → configuration
//! → unmounts → loop device detach.
//!
//! Only one build may run on a host at a time: loop devices and mountpoints are
//! shared host resources and no locking is performed.

use anyhow::{Context as _, Result};
use bytesize::ByteSize;
use log::{info, warn};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::builders::{Outcome, Pipeline, StageState, StatusSnapshot, StatusStore, Stages};

mod bootstrap;
mod chroot;
mod files;
mod image_file;
mod loopdev;
mod mount;
mod network;
mod partition;
pub mod preflight;
mod system;
#[cfg(test)]
mod testing;
mod utils;

pub use files::TargetRoot;
pub use image_file::ImageFile;
pub use loopdev::LoopDev;
pub use utils::{Executor, HostExecutor};

/// Image file options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageFileOpts {
    /// Output disk image file.
    pub path: PathBuf,

    /// Image size.
    pub size: ByteSize,

    /// Overwrite existing image file.
    pub force: bool,
}

/// Partition layout options.
///
/// Disk gets msdos partition table with FAT32 boot partition followed by EXT4 root
/// partition taking the rest of the disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionOpts {
    /// Size of the boot partition.
    pub boot_size: ByteSize,
}

/// Debootstrap options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOpts {
    /// Bootstrap executable, e.g. `debootstrap` or `qemu-debootstrap`.
    pub tool: String,

    /// Target architecture.
    pub arch: String,

    /// Debian suite (stable, bookworm etc.).
    pub suite: String,

    /// Debian mirror. Also used for `/etc/apt/sources.list`.
    pub mirror: String,

    /// Archive keyring.
    pub keyring: Option<PathBuf>,

    /// Debian components.
    pub components: Vec<String>,

    /// Debootstrap variant.
    pub variant: String,

    /// Packages to include.
    pub include: Vec<String>,
}

/// Keyboard configuration (`/etc/default/keyboard`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyboardOpts {
    pub model: String,
    pub layout: String,
    pub variant: String,
    pub options: String,
    pub backspace: String,
}

/// Target system configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct SystemOpts {
    pub hostname: String,
    pub locale: String,
    pub keyboard: KeyboardOpts,

    /// Kernel package to install.
    pub kernel_package: String,

    /// New root password. Password is left untouched if not set.
    pub root_password: Option<String>,

    /// Install vim configuration.
    pub vimrc: bool,
}

impl fmt::Debug for SystemOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemOpts")
            .field("hostname", &self.hostname)
            .field("locale", &self.locale)
            .field("keyboard", &self.keyboard)
            .field("kernel_package", &self.kernel_package)
            .field(
                "root_password",
                &self.root_password.as_ref().map(|_| "<redacted>"),
            )
            .field("vimrc", &self.vimrc)
            .finish()
    }
}

/// User-defined build options.
///
/// These options should be used as read-only during build.
/// Mutable variables are stored in [`ImageBuildContext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOpts {
    pub image_file_opts: ImageFileOpts,
    pub partition_opts: PartitionOpts,

    /// Where target root filesystem is mounted on the host.
    pub mountpoint: PathBuf,

    pub bootstrap_opts: BootstrapOpts,
    pub system_opts: SystemOpts,

    /// Status file to resume from.
    pub status_file: PathBuf,

    /// Ignore status of previous runs.
    pub fresh: bool,

    /// Tear down mounts and loop device if some stage fails.
    pub cleanup_on_failure: bool,
}

/// Mountpoint of the boot partition inside target root.
pub const BOOT_FIRMWARE_DIR: &str = "/boot/firmware";

/// Image build context.
///
/// Holds build options, command executor and resources acquired during the build.
pub struct ImageBuildContext {
    opts: BuildOpts,
    executor: Box<dyn Executor>,

    /// Image file, set by image file stage.
    pub image_file: Option<ImageFile>,

    /// Attached loop device, set by loop device stage.
    pub loop_dev: Option<LoopDev>,
}

impl ImageBuildContext {
    /// Create context running commands on the host.
    pub fn from_opts(opts: BuildOpts) -> Self {
        Self::with_executor(opts, Box::new(HostExecutor))
    }

    /// Create context with custom command executor.
    pub fn with_executor(opts: BuildOpts, executor: Box<dyn Executor>) -> Self {
        Self {
            opts,
            executor,
            image_file: None,
            loop_dev: None,
        }
    }

    /// Get build options.
    pub fn opts(&self) -> &BuildOpts {
        &self.opts
    }

    /// Command executor.
    pub fn exec(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Target system root.
    pub fn target(&self) -> TargetRoot<'_> {
        TargetRoot::new(&self.opts.mountpoint)
    }

    /// Mountpoint of target root filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.opts.mountpoint
    }

    /// Attached loop device or error if there is none.
    pub fn loop_dev(&self, action: &str) -> Result<&LoopDev, ImageBuilderError> {
        self.loop_dev
            .as_ref()
            .ok_or_else(|| ImageBuilderError::invalid_context(action, "loop device"))
    }

    /// Image file or error if there is none.
    pub fn image_file(&self, action: &str) -> Result<&ImageFile, ImageBuilderError> {
        self.image_file
            .as_ref()
            .ok_or_else(|| ImageBuilderError::invalid_context(action, "image file"))
    }
}

/// This error should be treated as internal builder error.
#[derive(thiserror::Error, Debug)]
pub enum ImageBuilderError {
    /// Cannot perform action because required element in the context wasn't found.
    #[error("internal builder error: cannot {action}: {context_elem} not found")]
    InvalidContext {
        action: String,
        context_elem: String,
    },

    /// Marker from previous run doesn't carry expected value.
    #[error("status of stage '{stage}' has no recorded value; rerun with --fresh")]
    MissingValue { stage: &'static str },

    /// Image file recorded by previous run is gone.
    #[error("image file {path} from previous run not found; rerun with --fresh")]
    MissingImage { path: PathBuf },
}

impl ImageBuilderError {
    pub fn invalid_context(action: &str, context_elem: &str) -> Self {
        Self::InvalidContext {
            action: action.to_string(),
            context_elem: context_elem.to_string(),
        }
    }
}

/// Setup pipeline stages depending on build options.
fn setup_pipeline(ctx: &mut ImageBuildContext) -> Pipeline<'_, ImageBuildContext> {
    let mut stages: Stages<_> = vec![
        Box::new(image_file::CreateImageFile),
        Box::new(loopdev::AttachLoopDevice),
        Box::new(partition::FormatPartitions),
        Box::new(mount::MountRoot),
        Box::new(mount::MountBoot),
        Box::new(bootstrap::Bootstrap),
        Box::new(system::ConfigureHostname),
        Box::new(system::ConfigureLocale),
        Box::new(system::ConfigureKeyboard),
        Box::new(system::ConfigureApt),
        Box::new(network::ConfigureNetwork::new()),
        Box::new(system::WriteFstab),
        Box::new(system::InstallKernel),
    ];

    if ctx.opts().system_opts.root_password.is_some() {
        stages.push(Box::new(system::ChangeRootPassword));
    }
    if ctx.opts().system_opts.vimrc {
        stages.push(Box::new(system::ConfigureVim));
    }

    stages.push(Box::new(mount::UnmountBoot));
    stages.push(Box::new(mount::UnmountRoot));
    stages.push(Box::new(loopdev::DetachLoopDevice));

    let cleanup_on_failure = ctx.opts().cleanup_on_failure;
    Pipeline::from_stages(ctx, stages).cleanup_on_failure(cleanup_on_failure)
}

/// Names of all stages which would run with given options.
pub fn stage_names(opts: &BuildOpts) -> Vec<&'static str> {
    let mut ctx = ImageBuildContext::from_opts(opts.clone());
    setup_pipeline(&mut ctx).stage_names()
}

/// Build disk image.
///
/// Status of the run is always saved to the status file, even if the build fails.
pub fn build(ctx: &mut ImageBuildContext) -> Result<serde_json::Value> {
    let store = StatusStore::new(&ctx.opts().status_file);
    let fresh = ctx.opts().fresh;
    let image_path = ctx.opts().image_file_opts.path.clone();

    let pipeline = setup_pipeline(ctx);
    let result = if fresh {
        info!("ignoring status of previous runs");
        pipeline.run_with_prior(&StatusSnapshot::new(), &store)
    } else {
        pipeline.run(&store)
    };
    info!(
        "stages: {} completed, {} skipped, {} failed",
        result.count(StageState::Completed),
        result.count(StageState::Skipped),
        result.count(StageState::Failed),
    );
    if !result.is_success() {
        if let Some(stage) = result.failed_stage() {
            info!("rerun after fixing the problem to resume from stage '{}'", stage);
        }
    }

    let stages = serde_json::to_value(&result.stages)?;
    match result.outcome {
        Outcome::Completed => {
            if let Some(err) = result.save_error {
                return Err(err).context("image was built, but status was not saved");
            }
            let image = ctx
                .image_file
                .as_ref()
                .map(|image_file| image_file.path().to_path_buf())
                .unwrap_or(image_path);
            Ok(serde_json::json!({
                "message": format!("Created {}", image.display()),
                "image": image,
                "stages": stages,
            }))
        }
        Outcome::Failed { stage, error } => {
            if result.save_error.is_some() {
                warn!("status was not saved, next run will start over");
            }
            Err(error.context(format!("stage '{}' failed", stage)))
                .context("image build failed")
        }
        Outcome::Aborted { stage, error } => {
            if result.save_error.is_some() {
                warn!("status was not saved, next run will start over");
            }
            Err(error.context(format!("setup of stage '{}' failed", stage)))
                .context("image build aborted")
        }
    }
}

use anyhow::{bail, Context, Result};
use bytesize::ByteSize;
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use crate::builders::{Stage, StatusValue};

use super::utils::{Command, Executor};
use super::{ImageBuildContext, ImageBuilderError};

/// Image file adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageFile {
    /// Path to the file.
    path: PathBuf,
}

impl ImageFile {
    /// Create new sparse image file with given size (rounded up to whole MiB).
    pub fn create<P>(exec: &dyn Executor, path: P, size: ByteSize, overwrite: bool) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if path.exists() {
            if overwrite {
                fs::remove_file(path).context("failed to remove image file")?;
            } else {
                bail!(
                    "output file '{}' already exists (use --force to overwrite)",
                    path.display()
                );
            }
        }

        let size_mib = size.as_u64().div_ceil(ByteSize::mib(1).as_u64());
        if size_mib == 0 {
            bail!("image size must not be zero");
        }

        let mut output = OsString::from("of=");
        output.push(path.as_os_str());
        exec.run(Command::new("dd").args([
            OsStr::new("if=/dev/zero"),
            output.as_os_str(),
            OsStr::new("bs=1M"),
            OsStr::new("count=0"),
            OsStr::new(&format!("seek={}", size_mib)),
            OsStr::new("status=none"),
        ]))
        .context("failed to create image file")?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Use image file created before.
    pub fn from_existing<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path to file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

/// Create new disk image file.
///
/// Marker value is the path to the image file.
///
/// # Context variables set
/// - `image_file`
pub struct CreateImageFile;

impl CreateImageFile {
    pub const NAME: &'static str = "image-file-created";
}

impl Stage<ImageBuildContext> for CreateImageFile {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn restore(&mut self, ctx: &mut ImageBuildContext, marker: &StatusValue) -> Result<()> {
        let path = match marker.as_str() {
            Some(path) => PathBuf::from(path),
            None => {
                warn!("no image path recorded, assuming configured one");
                ctx.opts().image_file_opts.path.clone()
            }
        };
        if path != ctx.opts().image_file_opts.path {
            warn!(
                "continuing with image file {} from the previous run",
                path.display()
            );
        }
        if !path.exists() {
            return Err(ImageBuilderError::MissingImage { path }.into());
        }
        debug!("using existing image file {}", path.display());
        ctx.image_file = Some(ImageFile::from_existing(path));
        Ok(())
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let opts = &ctx.opts().image_file_opts;
        info!("creating image file {} ({})", opts.path.display(), opts.size);
        let image_file = ImageFile::create(ctx.exec(), &opts.path, opts.size, opts.force)?;
        let value = image_file.path().to_string_lossy().to_string();
        ctx.image_file = Some(image_file);
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::{CreateImageFile, ImageFile};
    use crate::builders::debian_img::testing::{test_opts, RecordingExecutor};
    use crate::builders::debian_img::ImageBuildContext;
    use crate::builders::{Stage, StatusValue};
    use anyhow::Result;
    use bytesize::ByteSize;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn test_create_sparse_file_command() -> Result<()> {
        let tmp = TempDir::new("test-image")?;
        let path = tmp.path().join("disk.img");
        let exec = RecordingExecutor::default();
        let image = ImageFile::create(&exec, &path, ByteSize::gib(1), false)?;
        assert_eq!(image.path(), path);
        assert_eq!(
            exec.calls(),
            vec![format!(
                "dd if=/dev/zero of={} bs=1M count=0 seek=1024 status=none",
                path.display()
            )]
        );
        Ok(())
    }

    #[test]
    fn test_size_is_rounded_up() -> Result<()> {
        let tmp = TempDir::new("test-image")?;
        let exec = RecordingExecutor::default();
        ImageFile::create(&exec, tmp.path().join("disk.img"), ByteSize::kib(1500), false)?;
        assert!(exec.calls()[0].contains("seek=2 "));
        Ok(())
    }

    #[test]
    fn test_existing_file_is_kept_without_force() -> Result<()> {
        let tmp = TempDir::new("test-image")?;
        let path = tmp.path().join("disk.img");
        fs::write(&path, "data")?;
        let exec = RecordingExecutor::default();

        assert!(ImageFile::create(&exec, &path, ByteSize::mib(8), false).is_err());
        assert!(exec.calls().is_empty());
        assert_eq!(fs::read_to_string(&path)?, "data");

        ImageFile::create(&exec, &path, ByteSize::mib(8), true)?;
        assert!(!path.exists());
        assert_eq!(exec.calls().len(), 1);
        Ok(())
    }

    #[test]
    fn test_stage_records_path() -> Result<()> {
        let tmp = TempDir::new("test-image")?;
        let opts = test_opts(tmp.path());
        let mut ctx =
            ImageBuildContext::with_executor(opts.clone(), Box::new(RecordingExecutor::default()));
        let value = CreateImageFile.run(&mut ctx)?;
        assert_eq!(value.as_deref(), opts.image_file_opts.path.to_str());
        assert!(ctx.image_file.is_some());
        Ok(())
    }

    #[test]
    fn test_restore_requires_existing_file() -> Result<()> {
        let tmp = TempDir::new("test-image")?;
        let opts = test_opts(tmp.path());
        let path = opts.image_file_opts.path.clone();
        let mut ctx =
            ImageBuildContext::with_executor(opts, Box::new(RecordingExecutor::default()));
        let marker = StatusValue::from(path.to_string_lossy().to_string());

        assert!(CreateImageFile.restore(&mut ctx, &marker).is_err());
        assert!(ctx.image_file.is_none());

        fs::write(&path, "")?;
        CreateImageFile.restore(&mut ctx, &marker)?;
        assert_eq!(ctx.image_file, Some(ImageFile::from_existing(&path)));
        Ok(())
    }
}

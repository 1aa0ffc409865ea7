use bytesize::ByteSize;
use clap::ValueHint;
use log::info;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::builders::debian_img::{
    self, preflight, BootstrapOpts, BuildOpts, ImageBuildContext, ImageFileOpts, KeyboardOpts,
    PartitionOpts, SystemOpts,
};
use crate::builders::DEFAULT_STATUS_FILE;
use crate::{print_object, read_file, OutputFormat};

const DEFAULT_OUTPUT: &str = "debian-arm64.img";
const DEFAULT_SIZE: &str = "1GiB";
const DEFAULT_BOOT_SIZE: &str = "256MiB";
const DEFAULT_MOUNTPOINT: &str = "/mnt";
const DEFAULT_HOSTNAME: &str = "raspberrypi";
const DEFAULT_LOCALE: &str = "en_US.UTF-8";
const DEFAULT_KEYBOARD_LAYOUT: &str = "us";
const DEFAULT_SUITE: &str = "stable";
const DEFAULT_ARCH: &str = "arm64";
const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";
const DEFAULT_KEYRING: &str = "/usr/share/keyrings/debian-archive-keyring.gpg";
const DEFAULT_BOOTSTRAP_TOOL: &str = "debootstrap";
const DEFAULT_KERNEL_PACKAGE: &str = "linux-image-arm64";
const DEFAULT_COMPONENTS: &[&str] = &["main", "contrib", "non-free", "non-free-firmware"];
const DEFAULT_PACKAGES: &[&str] = &[
    "dbus",
    "dosfstools",
    "firmware-brcm80211",
    "firmware-realtek",
    "haveged",
    "iproute2",
    "locales",
    "parted",
    "raspi-firmware",
    "ssh",
    "systemd",
    "systemd-resolved",
    "systemd-sysv",
    "wireless-tools",
    "wpasupplicant",
];

/// Build command.
///
/// Options given on the command line take precedence over the image profile (`--config`),
/// which takes precedence over built-in defaults.
#[derive(Clone, Debug, clap::Parser)]
pub struct BuildArgs {
    /// Output disk image file.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Size of the disk image (e.g., 2GiB, 1024MiB) [default: 1GiB].
    #[arg(long, short = 's', value_name = "SIZE")]
    pub size: Option<String>,

    /// Size of the boot partition [default: 256MiB].
    #[arg(long, value_name = "SIZE")]
    pub boot_size: Option<String>,

    /// Directory where target root filesystem is mounted during build [default: /mnt].
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub mountpoint: Option<PathBuf>,

    /// Hostname of the target system [default: raspberrypi].
    #[arg(long)]
    pub hostname: Option<String>,

    /// Default locale of the target system [default: en_US.UTF-8].
    #[arg(long)]
    pub locale: Option<String>,

    /// Keyboard layout of the target system [default: us].
    #[arg(long, value_name = "LAYOUT")]
    pub keyboard_layout: Option<String>,

    /// Debian suite to install [default: stable].
    #[arg(long)]
    pub suite: Option<String>,

    /// Debian mirror [default: http://deb.debian.org/debian].
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    pub mirror: Option<String>,

    /// Target architecture [default: arm64].
    #[arg(long)]
    pub arch: Option<String>,

    /// Additional package to install. Can be passed multiple times.
    #[arg(long = "include", value_name = "PACKAGE", value_delimiter = ',')]
    pub include: Vec<String>,

    /// Kernel package to install [default: linux-image-arm64].
    #[arg(long, value_name = "PACKAGE")]
    pub kernel_package: Option<String>,

    /// Bootstrap tool, e.g. qemu-debootstrap on older hosts [default: debootstrap].
    #[arg(long, value_name = "PROGRAM")]
    pub bootstrap_tool: Option<String>,

    /// New root password of the target system.
    ///
    /// Root password is left untouched if not set.
    #[arg(long, env = "DEBIMG_ROOT_PASSWORD", hide_env_values = true)]
    pub root_password: Option<String>,

    /// Install vim configuration.
    #[arg(long)]
    pub vimrc: bool,

    /// Status file used to resume interrupted builds.
    #[arg(
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        env = "DEBIMG_STATUS_FILE",
        default_value = DEFAULT_STATUS_FILE
    )]
    pub status_file: PathBuf,

    /// Ignore status of previous runs and build from scratch.
    #[arg(long)]
    pub fresh: bool,

    /// Overwrite existing image file.
    #[arg(long)]
    pub force: bool,

    /// Unmount filesystems and detach loop device if the build fails.
    ///
    /// By default resources are left in place, so the next run can resume.
    #[arg(long)]
    pub cleanup_on_failure: bool,

    /// Image profile (YAML).
    #[arg(long, short = 'c', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Log errors only. The build result is still printed.
    #[arg(long, short)]
    pub quiet: bool,
}

/// Image profile loaded from YAML file.
///
/// ```yaml
/// output: rpi4.img
/// size: 4GiB
/// hostname: rpi4
/// keyboard:
///   layout: de
/// packages: [vim, curl]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ImageProfile {
    pub output: Option<PathBuf>,
    pub size: Option<String>,
    pub boot_size: Option<String>,
    pub mountpoint: Option<PathBuf>,
    pub hostname: Option<String>,
    pub locale: Option<String>,
    pub keyboard: KeyboardProfile,
    pub suite: Option<String>,
    pub mirror: Option<String>,
    pub arch: Option<String>,
    pub keyring: Option<PathBuf>,
    pub components: Option<Vec<String>>,
    pub variant: Option<String>,

    /// Packages installed in addition to the default set.
    pub packages: Vec<String>,

    pub kernel_package: Option<String>,
    pub bootstrap_tool: Option<String>,
    pub vimrc: bool,
}

/// Keyboard section of [`ImageProfile`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyboardProfile {
    pub model: Option<String>,
    pub layout: Option<String>,
    pub variant: Option<String>,
    pub options: Option<String>,
    pub backspace: Option<String>,
}

impl BuildArgs {
    /// Run build subcommand.
    pub fn run(&self, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
        let value = build(self)?;
        print_object(format, &value)
    }

    /// Load image profile if specified.
    fn profile(&self) -> Result<ImageProfile, Box<dyn std::error::Error>> {
        match &self.config {
            Some(path) => {
                info!("loading image profile {}", path.display());
                read_file(Some(path.as_path()))
            }
            None => Ok(ImageProfile::default()),
        }
    }

    /// Merge arguments with image profile into build options.
    fn to_opts(&self, profile: ImageProfile) -> anyhow::Result<BuildOpts> {
        let pick = |arg: &Option<String>, value: Option<String>, default: &str| {
            arg.clone()
                .or(value)
                .unwrap_or_else(|| default.to_string())
        };

        let image_file_opts = ImageFileOpts {
            path: self
                .output
                .clone()
                .or(profile.output)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            size: parse_size("image", &pick(&self.size, profile.size, DEFAULT_SIZE))?,
            force: self.force,
        };

        let partition_opts = PartitionOpts {
            boot_size: parse_size(
                "boot partition",
                &pick(&self.boot_size, profile.boot_size, DEFAULT_BOOT_SIZE),
            )?,
        };
        if partition_opts.boot_size >= image_file_opts.size {
            anyhow::bail!(
                "boot partition ({}) must be smaller than the image ({})",
                partition_opts.boot_size,
                image_file_opts.size
            );
        }

        let mut include: Vec<String> = DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect();
        if profile.vimrc || self.vimrc {
            include.push("vim".to_string());
        }
        for package in profile.packages.into_iter().chain(self.include.iter().cloned()) {
            if !include.contains(&package) {
                include.push(package);
            }
        }

        let bootstrap_opts = BootstrapOpts {
            tool: pick(
                &self.bootstrap_tool,
                profile.bootstrap_tool,
                DEFAULT_BOOTSTRAP_TOOL,
            ),
            arch: pick(&self.arch, profile.arch, DEFAULT_ARCH),
            suite: pick(&self.suite, profile.suite, DEFAULT_SUITE),
            mirror: pick(&self.mirror, profile.mirror, DEFAULT_MIRROR),
            keyring: profile.keyring.or_else(|| {
                let keyring = Path::new(DEFAULT_KEYRING);
                keyring.exists().then(|| keyring.to_path_buf())
            }),
            components: profile.components.unwrap_or_else(|| {
                DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect()
            }),
            variant: profile.variant.unwrap_or_else(|| "minbase".to_string()),
            include,
        };

        let keyboard = KeyboardOpts {
            model: profile.keyboard.model.unwrap_or_else(|| "pc105".to_string()),
            layout: pick(
                &self.keyboard_layout,
                profile.keyboard.layout,
                DEFAULT_KEYBOARD_LAYOUT,
            ),
            variant: profile.keyboard.variant.unwrap_or_default(),
            options: profile.keyboard.options.unwrap_or_default(),
            backspace: profile
                .keyboard
                .backspace
                .unwrap_or_else(|| "guess".to_string()),
        };

        let system_opts = SystemOpts {
            hostname: pick(&self.hostname, profile.hostname, DEFAULT_HOSTNAME),
            locale: pick(&self.locale, profile.locale, DEFAULT_LOCALE),
            keyboard,
            kernel_package: pick(
                &self.kernel_package,
                profile.kernel_package,
                DEFAULT_KERNEL_PACKAGE,
            ),
            root_password: self.root_password.clone().filter(|p| !p.is_empty()),
            vimrc: profile.vimrc || self.vimrc,
        };

        Ok(BuildOpts {
            image_file_opts,
            partition_opts,
            mountpoint: self
                .mountpoint
                .clone()
                .or(profile.mountpoint)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNTPOINT)),
            bootstrap_opts,
            system_opts,
            status_file: self.status_file.clone(),
            fresh: self.fresh,
            cleanup_on_failure: self.cleanup_on_failure,
        })
    }
}

fn parse_size(what: &str, size: &str) -> anyhow::Result<ByteSize> {
    size.parse::<ByteSize>()
        .map_err(|_| anyhow::anyhow!("invalid {} size '{}'", what, size))
}

impl TryFrom<&BuildArgs> for ImageBuildContext {
    type Error = Box<dyn std::error::Error>;

    fn try_from(args: &BuildArgs) -> Result<Self, Self::Error> {
        let opts = args.to_opts(args.profile()?)?;
        Ok(Self::from_opts(opts))
    }
}

fn build(build_args: &BuildArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut build_context = ImageBuildContext::try_from(build_args)?;
    preflight::check(build_context.opts())?;
    let value = debian_img::build(&mut build_context)?;
    Ok(value)
}

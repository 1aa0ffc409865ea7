//! Target system configuration stages.

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use regex::{NoExpand, Regex};

use crate::builders::Stage;

use super::mount::BindMounts;
use super::partition::{BOOT_PARTITION, ROOT_PARTITION};
use super::utils::{Command, Executor};
use super::{ImageBuildContext, KeyboardOpts, LoopDev};

const FILE_HOSTNAME: &str = "/etc/hostname";
const FILE_HOSTS: &str = "/etc/hosts";
const FILE_LOCALE: &str = "/etc/default/locale";
const FILE_LOCALE_GEN: &str = "/etc/locale.gen";
const FILE_KEYBOARD: &str = "/etc/default/keyboard";
const FILE_APT_CONFIG: &str = "/etc/apt/apt.conf.d/99disable-suggested";
const FILE_APT_SOURCES: &str = "/etc/apt/sources.list";
const FILE_FSTAB: &str = "/etc/fstab";
const FILE_SHADOW: &str = "/etc/shadow";
const DIR_VIM: &str = "/etc/vim";
const FILE_VIMRC: &str = "/etc/vim/vimrc";

const CONFIG_APT: &str = "\
APT::Install-Recommends \"false\";
APT::Install-Suggests \"false\";
";

const CONFIG_VIM: &str = "\
syntax on
set number
set ts=4
set sts=4
set sw=4
set expandtab

autocmd FileType make setlocal noexpandtab
autocmd FileType yaml setlocal ts=2 sts=2 sw=2 expandtab
";

fn hosts(hostname: &str) -> String {
    format!("127.0.0.1    localhost\n127.0.1.1    {}\n", hostname)
}

fn keyboard(opts: &KeyboardOpts) -> String {
    format!(
        "XKBMODEL=\"{}\"\nXKBLAYOUT=\"{}\"\nXKBVARIANT=\"{}\"\nXKBOPTIONS=\"{}\"\nBACKSPACE=\"{}\"\n",
        opts.model, opts.layout, opts.variant, opts.options, opts.backspace
    )
}

fn apt_sources(mirror: &str, suite: &str, components: &[String]) -> String {
    format!("deb {} {} {}\n", mirror, suite, components.join(" "))
}

/// Enable `locale` in `locale.gen` contents, uncommenting its line or appending a new one.
fn enable_locale(locale_gen: &str, locale: &str) -> Result<String> {
    let charset = locale.split_once('.').map_or("UTF-8", |(_, charset)| charset);
    let entry = format!("{} {}", locale, charset);
    let pattern = Regex::new(&format!(r"(?m)^#[ \t]*{}[ \t]*$", regex::escape(&entry)))?;

    let contents = if locale_gen.lines().any(|line| line.trim() == entry) {
        locale_gen.to_string()
    } else if pattern.is_match(locale_gen) {
        pattern.replace(locale_gen, NoExpand(&entry)).into_owned()
    } else {
        let mut contents = locale_gen.to_string();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&entry);
        contents.push('\n');
        contents
    };
    Ok(contents)
}

fn fstab(boot_uuid: &str, root_uuid: &str) -> String {
    format!(
        "UUID={:<20} /boot/firmware  vfat    defaults            0 2\n\
         UUID={:<20} /               ext4    defaults,noatime    0 1\n\
         proc                      /proc           proc    defaults            0 0\n",
        boot_uuid, root_uuid
    )
}

/// Replace root password hash in `/etc/shadow` contents.
fn replace_root_hash(shadow: &str, hash: &str) -> Result<String> {
    let root_entry = Regex::new(r"(?m)^root:[^:\n]*:")?;
    if !root_entry.is_match(shadow) {
        bail!("no root entry in {}", FILE_SHADOW);
    }
    let replacement = format!("root:{}:", hash);
    Ok(root_entry
        .replace(shadow, NoExpand(&replacement))
        .into_owned())
}

/// Filesystem UUID of a partition.
fn partition_uuid(exec: &dyn Executor, loop_dev: &LoopDev, n: u32) -> Result<String> {
    let part = loop_dev.part(n)?;
    let uuid = exec
        .output(Command::new("lsblk").args(["-n", "-o", "UUID"]).arg(&part))
        .with_context(|| format!("failed to get UUID of {}", part.display()))?;
    if uuid.is_empty() {
        return Err(anyhow!("{} has no filesystem UUID", part.display()));
    }
    Ok(uuid)
}

/// Hash password with SHA-512 crypt.
fn hash_password(exec: &dyn Executor, password: &str) -> Result<String> {
    let hash = exec
        .output(
            Command::new("openssl")
                .args(["passwd", "-6", "-stdin"])
                .stdin(password),
        )
        .context("failed to hash password")?;
    if !hash.starts_with('$') || hash.contains(':') || hash.contains('\n') {
        bail!("unexpected password hash format");
    }
    Ok(hash)
}

/// Write `/etc/hostname` and `/etc/hosts`.
pub struct ConfigureHostname;

impl ConfigureHostname {
    pub const NAME: &'static str = "hostname-configured";
}

impl Stage<ImageBuildContext> for ConfigureHostname {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let hostname = &ctx.opts().system_opts.hostname;
        let target = ctx.target();
        target.write(FILE_HOSTNAME, &format!("{}\n", hostname))?;
        target.write(FILE_HOSTS, &hosts(hostname))?;
        Ok(None)
    }
}

/// Set default locale and generate it.
pub struct ConfigureLocale;

impl ConfigureLocale {
    pub const NAME: &'static str = "locale-configured";
}

impl Stage<ImageBuildContext> for ConfigureLocale {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let locale = &ctx.opts().system_opts.locale;
        let target = ctx.target();
        target.write(FILE_LOCALE, &format!("LANG=\"{}\"\n", locale))?;

        let locale_gen = if target.exists(FILE_LOCALE_GEN) {
            target.read(FILE_LOCALE_GEN)?
        } else {
            String::new()
        };
        target.write(FILE_LOCALE_GEN, &enable_locale(&locale_gen, locale)?)?;

        ctx.exec()
            .run(Command::new("locale-gen").chroot(ctx.mountpoint()))
            .context("failed to generate locales")?;
        Ok(None)
    }
}

/// Write `/etc/default/keyboard`.
pub struct ConfigureKeyboard;

impl ConfigureKeyboard {
    pub const NAME: &'static str = "keyboard-configured";
}

impl Stage<ImageBuildContext> for ConfigureKeyboard {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        ctx.target()
            .write(FILE_KEYBOARD, &keyboard(&ctx.opts().system_opts.keyboard))?;
        Ok(None)
    }
}

/// Disable recommended packages, write package sources and refresh package index.
pub struct ConfigureApt;

impl ConfigureApt {
    pub const NAME: &'static str = "apt-configured";
}

impl Stage<ImageBuildContext> for ConfigureApt {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let opts = &ctx.opts().bootstrap_opts;
        let target = ctx.target();
        target.write(FILE_APT_CONFIG, CONFIG_APT)?;
        target.write(
            FILE_APT_SOURCES,
            &apt_sources(&opts.mirror, &opts.suite, &opts.components),
        )?;

        let _mounts = BindMounts::mount(ctx.exec(), ctx.mountpoint())?;
        ctx.exec()
            .run(
                Command::new("apt-get")
                    .arg("update")
                    .chroot(ctx.mountpoint()),
            )
            .context("failed to update package index")?;
        Ok(None)
    }
}

/// Write `/etc/fstab` referencing partitions by filesystem UUID.
///
/// # Context variables required
/// - `loop_dev`
pub struct WriteFstab;

impl WriteFstab {
    pub const NAME: &'static str = "fstab-written";
}

impl Stage<ImageBuildContext> for WriteFstab {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let loop_dev = ctx.loop_dev("write fstab")?;
        let boot_uuid = partition_uuid(ctx.exec(), loop_dev, BOOT_PARTITION)?;
        let root_uuid = partition_uuid(ctx.exec(), loop_dev, ROOT_PARTITION)?;
        ctx.target().write(FILE_FSTAB, &fstab(&boot_uuid, &root_uuid))?;
        Ok(None)
    }
}

/// Install kernel package.
pub struct InstallKernel;

impl InstallKernel {
    pub const NAME: &'static str = "kernel-installed";
}

impl Stage<ImageBuildContext> for InstallKernel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let package = &ctx.opts().system_opts.kernel_package;
        info!("installing {}", package);
        let _mounts = BindMounts::mount(ctx.exec(), ctx.mountpoint())?;
        ctx.exec()
            .run(
                Command::new("env")
                    .args(["DEBIAN_FRONTEND=noninteractive", "apt-get", "install", "-y"])
                    .arg(package)
                    .chroot(ctx.mountpoint()),
            )
            .context("failed to install kernel")?;
        Ok(None)
    }
}

/// Set root password.
///
/// Password itself never appears in logs or status file.
pub struct ChangeRootPassword;

impl ChangeRootPassword {
    pub const NAME: &'static str = "root-password-changed";
}

impl Stage<ImageBuildContext> for ChangeRootPassword {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let password = ctx
            .opts()
            .system_opts
            .root_password
            .as_deref()
            .ok_or(anyhow!("no root password given"))?;
        let hash = hash_password(ctx.exec(), password)?;
        let target = ctx.target();
        let shadow = target.read(FILE_SHADOW)?;
        target.write(FILE_SHADOW, &replace_root_hash(&shadow, &hash)?)?;
        Ok(None)
    }
}

/// Install vim configuration.
pub struct ConfigureVim;

impl ConfigureVim {
    pub const NAME: &'static str = "vim-configured";
}

impl Stage<ImageBuildContext> for ConfigureVim {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let target = ctx.target();
        target.create_dir_all(DIR_VIM, 0o755)?;
        target.write(FILE_VIMRC, CONFIG_VIM)?;
        Ok(None)
    }
}

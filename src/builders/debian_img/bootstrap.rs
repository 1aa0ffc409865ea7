use anyhow::{Context, Result};
use log::info;
use std::ffi::OsString;
use std::path::Path;

use crate::builders::Stage;

use super::utils::Command;
use super::{BootstrapOpts, ImageBuildContext};

/// Build debootstrap command installing base system into `target`.
fn bootstrap_command(opts: &BootstrapOpts, target: &Path) -> Command {
    let mut command = Command::new(&opts.tool).arg(format!("--arch={}", opts.arch));
    if let Some(keyring) = &opts.keyring {
        let mut arg = OsString::from("--keyring=");
        arg.push(keyring.as_os_str());
        command = command.arg(arg);
    }
    if !opts.components.is_empty() {
        command = command.arg(format!("--components={}", opts.components.join(",")));
    }
    if !opts.include.is_empty() {
        command = command.arg(format!("--include={}", opts.include.join(",")));
    }
    command
        .arg(format!("--variant={}", opts.variant))
        .arg(&opts.suite)
        .arg(target)
        .arg(&opts.mirror)
}

/// Install Debian base system into mounted root.
pub struct Bootstrap;

impl Bootstrap {
    pub const NAME: &'static str = "bootstrapped";
}

impl Stage<ImageBuildContext> for Bootstrap {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let opts = &ctx.opts().bootstrap_opts;
        info!(
            "bootstrapping Debian {} ({}) from {}",
            opts.suite, opts.arch, opts.mirror
        );
        ctx.exec()
            .run(bootstrap_command(opts, ctx.mountpoint()))
            .context("failed to bootstrap base system")?;
        Ok(None)
    }
}

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use std::path::PathBuf;

use crate::builders::Stage;

use super::utils::Command;
use super::ImageBuildContext;

const FILE_NETWORK: &str = "/etc/systemd/network/99-default.network";
const DIR_NETWORK: &str = "/etc/systemd/network";
const DIR_RESOLVE: &str = "/run/systemd/resolve";
const FILE_RESOLVED_CONF: &str = "/run/systemd/resolve/resolv.conf";
const FILE_RESOLV_CONF: &str = "/etc/resolv.conf";
const FILE_SSHD: &str = "/etc/ssh/sshd_config";

const CONFIG_NETWORK: &str = "\
[Match]
Name=*

[Network]
DHCP=ipv4
";

/// Set `PermitRootLogin yes` in sshd configuration, uncommenting or appending the option.
fn permit_root_login(sshd_config: &str) -> Result<String> {
    let option = Regex::new(r"(?m)^#?[ \t]*PermitRootLogin[ \t]+.*$")?;
    let contents = if option.is_match(sshd_config) {
        option
            .replace(sshd_config, "PermitRootLogin yes")
            .into_owned()
    } else {
        let mut contents = sshd_config.to_string();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str("PermitRootLogin yes\n");
        contents
    };
    Ok(contents)
}

/// Configure DHCP networking with systemd-networkd and systemd-resolved, enable ssh
/// with root login.
pub struct ConfigureNetwork {
    host_resolv_conf: PathBuf,
}

impl ConfigureNetwork {
    pub const NAME: &'static str = "network-configured";

    pub fn new() -> Self {
        Self {
            host_resolv_conf: PathBuf::from(FILE_RESOLVED_CONF),
        }
    }

    fn enable(ctx: &ImageBuildContext, service: &str) -> Result<()> {
        ctx.exec()
            .run(
                Command::new("systemctl")
                    .args(["enable", service])
                    .chroot(ctx.mountpoint()),
            )
            .with_context(|| format!("failed to enable {}", service))
    }
}

impl Default for ConfigureNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage<ImageBuildContext> for ConfigureNetwork {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &mut ImageBuildContext) -> Result<Option<String>> {
        let target = ctx.target();

        Self::enable(ctx, "dbus")?;

        target.create_dir_all(DIR_NETWORK, 0o755)?;
        target.write(FILE_NETWORK, CONFIG_NETWORK)?;
        Self::enable(ctx, "systemd-networkd")?;

        target.create_dir_all(DIR_RESOLVE, 0o755)?;
        target.remove_file(FILE_RESOLV_CONF)?;
        if self.host_resolv_conf.exists() {
            target.copy_from_host(&self.host_resolv_conf, FILE_RESOLVED_CONF)?;
        } else {
            warn!(
                "{} not found on host, target has no resolver until systemd-resolved starts",
                self.host_resolv_conf.display()
            );
        }
        target.symlink(FILE_RESOLVED_CONF, FILE_RESOLV_CONF)?;
        Self::enable(ctx, "systemd-resolved")?;

        info!("allowing root login over ssh");
        let sshd_config = target.read(FILE_SSHD)?;
        target.write(FILE_SSHD, &permit_root_login(&sshd_config)?)?;
        Self::enable(ctx, "ssh")?;
        Ok(None)
    }
}

//! Host checks performed before the build starts.

use log::debug;
use nix::unistd::geteuid;
use std::fmt;
use thiserror::Error;

use super::BuildOpts;

/// Single failed preflight check.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreflightIssue {
    /// Build is not running as root.
    #[error("image build requires root privileges (try running with sudo)")]
    NotRoot,

    /// Required host tools are not installed.
    #[error("required tools not found in PATH: {}", .0.join(", "))]
    MissingTools(Vec<String>),
}

/// Error of preflight checks, carrying every failed check.
#[derive(Debug, PartialEq, Eq)]
pub struct PreflightError {
    pub issues: Vec<PreflightIssue>,
}

impl fmt::Display for PreflightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("preflight checks failed")?;
        for (idx, issue) in self.issues.iter().enumerate() {
            f.write_str(if idx == 0 { ": " } else { "; " })?;
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for PreflightError {}

/// Host tools used by the build.
pub fn required_tools(opts: &BuildOpts) -> Vec<&str> {
    let mut tools = vec![
        "dd",
        "losetup",
        "parted",
        "mkfs.vfat",
        "mkfs.ext4",
        "mount",
        "umount",
        "lsblk",
        opts.bootstrap_opts.tool.as_str(),
    ];
    if opts.system_opts.root_password.is_some() {
        tools.push("openssl");
    }
    tools
}

/// Tools from `tools` which cannot be found in PATH.
pub fn missing_tools<'a>(tools: &[&'a str]) -> Vec<&'a str> {
    tools
        .iter()
        .filter(|tool| match which::which(tool) {
            Ok(path) => {
                debug!("found {}: {}", tool, path.display());
                false
            }
            Err(_) => true,
        })
        .copied()
        .collect()
}

/// Check that the build can run on this host.
pub fn check(opts: &BuildOpts) -> Result<(), PreflightError> {
    let mut issues = Vec::new();
    if !geteuid().is_root() {
        issues.push(PreflightIssue::NotRoot);
    }
    let missing = missing_tools(&required_tools(opts));
    if !missing.is_empty() {
        issues.push(PreflightIssue::MissingTools(
            missing.into_iter().map(String::from).collect(),
        ));
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(PreflightError { issues })
    }
}

#[cfg(test)]
mod tests {
    use super::{missing_tools, required_tools, PreflightError, PreflightIssue};
    use crate::builders::debian_img::testing::test_opts;
    use tempdir::TempDir;

    #[test]
    fn test_required_tools() -> anyhow::Result<()> {
        let tmp = TempDir::new("test-preflight")?;
        let mut opts = test_opts(tmp.path());
        opts.bootstrap_opts.tool = "qemu-debootstrap".to_string();
        assert!(required_tools(&opts).contains(&"qemu-debootstrap"));
        assert!(!required_tools(&opts).contains(&"openssl"));

        opts.system_opts.root_password = Some("secret".to_string());
        assert!(required_tools(&opts).contains(&"openssl"));
        Ok(())
    }

    #[test]
    fn test_missing_tools() {
        assert_eq!(
            missing_tools(&["sh", "debimg-no-such-tool"]),
            vec!["debimg-no-such-tool"]
        );
    }

    #[test]
    fn test_error_lists_every_issue() {
        let err = PreflightError {
            issues: vec![
                PreflightIssue::NotRoot,
                PreflightIssue::MissingTools(vec!["parted".to_string(), "lsblk".to_string()]),
            ],
        };
        assert_eq!(
            err.to_string(),
            "preflight checks failed: image build requires root privileges (try running with sudo); \
             required tools not found in PATH: parted, lsblk"
        );
    }
}

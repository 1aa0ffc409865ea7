//! Test helpers: build options in a temporary directory and recording command executor.

use bytesize::ByteSize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use super::utils::{Command, ExecError, Executor};
use super::{BootstrapOpts, BuildOpts, ImageFileOpts, KeyboardOpts, PartitionOpts, SystemOpts};

/// Build options with every path inside `dir`.
pub fn test_opts(dir: &Path) -> BuildOpts {
    let mountpoint = dir.join("mnt");
    std::fs::create_dir_all(&mountpoint).expect("failed to create test mountpoint");
    BuildOpts {
        image_file_opts: ImageFileOpts {
            path: dir.join("disk.img"),
            size: ByteSize::gib(1),
            force: false,
        },
        partition_opts: PartitionOpts {
            boot_size: ByteSize::mib(256),
        },
        mountpoint,
        bootstrap_opts: BootstrapOpts {
            tool: "debootstrap".to_string(),
            arch: "arm64".to_string(),
            suite: "stable".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
            keyring: None,
            components: vec!["main".to_string(), "contrib".to_string()],
            variant: "minbase".to_string(),
            include: vec!["systemd".to_string(), "ssh".to_string()],
        },
        system_opts: SystemOpts {
            hostname: "rpi".to_string(),
            locale: "en_US.UTF-8".to_string(),
            keyboard: KeyboardOpts {
                model: "pc105".to_string(),
                layout: "us".to_string(),
                variant: String::new(),
                options: String::new(),
                backspace: "guess".to_string(),
            },
            kernel_package: "linux-image-arm64".to_string(),
            root_password: None,
            vimrc: false,
        },
        status_file: dir.join(".status"),
        fresh: false,
        cleanup_on_failure: false,
    }
}

/// Executor recording command lines instead of running them.
///
/// Clones share the record, so a test can keep one and hand the other to the context.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    calls: Rc<RefCell<Vec<String>>>,
    stdin: Rc<RefCell<Vec<String>>>,
    outputs: HashMap<String, String>,
    failing: Vec<String>,
}

impl RecordingExecutor {
    /// Return `output` from every captured call of `program`.
    pub fn with_output(mut self, program: &str, output: &str) -> Self {
        self.outputs.insert(program.to_string(), output.to_string());
        self
    }

    /// Fail every call of `program`.
    pub fn failing(mut self, program: &str) -> Self {
        self.failing.push(program.to_string());
        self
    }

    /// Recorded command lines.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Recorded stdin payloads.
    pub fn stdin(&self) -> Vec<String> {
        self.stdin.borrow().clone()
    }

    /// Whether some recorded command line contains `pattern`.
    pub fn called(&self, pattern: &str) -> bool {
        self.calls.borrow().iter().any(|call| call.contains(pattern))
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, command: &Command) -> Result<String, ExecError> {
        let program = command.program().to_string_lossy().to_string();
        self.calls.borrow_mut().push(command.to_string());
        if let Some(input) = command.get_stdin() {
            self.stdin.borrow_mut().push(input.to_string());
        }
        if self.failing.contains(&program) {
            return Err(ExecError::Failed {
                program,
                status: "exit status: 1".to_string(),
                stderr: "recorded failure".to_string(),
            });
        }
        if command.is_captured() {
            Ok(self.outputs.get(&program).cloned().unwrap_or_default())
        } else {
            Ok(String::new())
        }
    }
}

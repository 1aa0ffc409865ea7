use log::{debug, error, trace};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

use super::chroot::{ChrootError, ChrootGuard};

/// Error of external command execution.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Command could not be started (not found, permission denied etc.).
    #[error("failed to spawn child process for `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Command failed to communicate.
    #[error("failed to communicate with `{program}`: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },

    /// Command exited with non-zero status.
    #[error("child process `{program}` failed with {status}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Cannot switch root for the command.
    #[error(transparent)]
    Chroot(#[from] ChrootError),
}

/// External command description.
///
/// Command is always executed as an argument vector, no shell is involved.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    chroot: Option<PathBuf>,
    capture: bool,
    stdin: Option<String>,
}

impl Command {
    /// New command for given program.
    pub fn new<S>(program: S) -> Self
    where
        S: AsRef<OsStr>,
    {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            chroot: None,
            capture: false,
            stdin: None,
        }
    }

    /// Add argument.
    pub fn arg<S>(mut self, arg: S) -> Self
    where
        S: AsRef<OsStr>,
    {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Run command with `root` as filesystem root.
    pub fn chroot<P>(mut self, root: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.chroot = Some(root.as_ref().to_path_buf());
        self
    }

    /// Return stdout to the caller instead of logging it.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Feed `input` to stdin of the command. Input is never logged.
    pub fn stdin<S>(mut self, input: S) -> Self
    where
        S: Into<String>,
    {
        self.stdin = Some(input.into());
        self
    }

    /// Program name.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments.
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Root to run command in, if any.
    pub fn get_chroot(&self) -> Option<&Path> {
        self.chroot.as_deref()
    }

    /// Whether stdout is captured.
    pub fn is_captured(&self) -> bool {
        self.capture
    }

    /// Stdin payload.
    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(root) = &self.chroot {
            write!(f, "[chroot {}] ", root.display())?;
        }
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stdin is deliberately left out: it may contain secrets.
        write!(f, "Command({})", self)
    }
}

/// Executor of external commands.
pub trait Executor {
    /// Execute command returning its trimmed stdout.
    ///
    /// If the command is not captured, stdout is logged and an empty string is returned.
    fn execute(&self, command: &Command) -> Result<String, ExecError>;

    /// Execute command discarding its output.
    fn run(&self, command: Command) -> Result<(), ExecError> {
        self.execute(&command).map(|_| ())
    }

    /// Execute command returning its trimmed stdout.
    fn output(&self, command: Command) -> Result<String, ExecError> {
        self.execute(&command.capture())
    }
}

/// Executor running commands on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostExecutor;

impl Executor for HostExecutor {
    fn execute(&self, command: &Command) -> Result<String, ExecError> {
        debug!("running command: '{}'", command);
        let _guard = command
            .get_chroot()
            .map(ChrootGuard::enter)
            .transpose()?;
        let (stdout, _) = run_command(command)?;
        if command.is_captured() {
            Ok(stdout.trim().to_string())
        } else {
            Ok(String::new())
        }
    }
}

/// Run command returning decoded stdout and stderr.
fn run_command(command: &Command) -> Result<(String, String), ExecError> {
    let program = command.program().to_string_lossy().to_string();

    let mut child = process::Command::new(command.program())
        .args(command.get_args())
        .stdin(if command.get_stdin().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let io_error = |source| ExecError::Io {
        program: program.clone(),
        source,
    };
    let missing_pipe = |name: &str| {
        io_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("failed to capture {}", name),
        ))
    };

    if let Some(input) = command.get_stdin() {
        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        stdin.write_all(input.as_bytes()).map_err(io_error)?;
        // Dropping stdin closes the pipe, so the child sees EOF.
    }

    // Log stdout and stderr of child process from separate threads
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let (stdout_tx, stdout_rx) = mpsc::channel::<String>();
    let (stderr_tx, stderr_rx) = mpsc::channel::<String>();
    let stdout_log_target = program.clone();
    let stderr_log_target = program.clone();
    let log_stdout = !command.is_captured();

    let stdout_thread = thread::spawn(move || {
        BufReader::new(stdout)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                if log_stdout {
                    debug!(target: stdout_log_target.as_str(), "{}", line);
                }
                let _ = stdout_tx.send(line);
            });
    });

    let stderr_thread = thread::spawn(move || {
        BufReader::new(stderr)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                trace!(target: stderr_log_target.as_str(), "{}", line);
                let _ = stderr_tx.send(line);
            });
    });

    let exit_status = child.wait().map_err(io_error)?;

    // Reader threads only end when pipes are closed, panics there are not expected.
    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let stdout = stdout_rx.into_iter().collect::<Vec<String>>().join("\n");
    let stderr = stderr_rx.into_iter().collect::<Vec<String>>().join("\n");

    if exit_status.success() {
        Ok((stdout, stderr))
    } else {
        stderr
            .lines()
            .for_each(|line| error!(target: program.as_str(), "{}", line));
        Err(ExecError::Failed {
            program,
            status: exit_status.to_string(),
            stderr,
        })
    }
}

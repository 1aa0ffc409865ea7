use clap::{CommandFactory as _, Parser as _};
use clap_complete::Shell;
use env_logger::Env;
use patharg::OutputArg;
use std::fs::File;
use std::io;
use std::path::PathBuf;

mod builders;
mod commands;
mod utils;
mod version;

use commands::*;
use utils::*;
use version::get_long_version;

/// Build Debian disk images for ARM single-board computers.
#[derive(Clone, Debug, clap::Parser)]
#[command(version, long_version = get_long_version(), about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Sets the output format.
    #[arg(
        global = true,
        short = 'F',
        long,
        default_value_t,
        env = "DEBIMG_FORMAT"
    )]
    format: OutputFormat,
}

impl Cli {
    /// Match the command and run it.
    pub fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            Command::Build(build_args) => build_args.run(self.format),
            Command::Status(status_args) => status_args.show(self.format),
            Command::Reset(status_args) => status_args.reset(self.format),
            Command::GenerateCompletion { shell, file } => {
                generate_completion(*shell, file.path_ref())
            }
        }
    }

    /// Default log level for this invocation.
    fn log_level(&self) -> &'static str {
        match &self.command {
            Command::Build(build_args) if build_args.quiet => "error",
            _ => "info",
        }
    }
}

/// Main commands of debimg.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Build a disk image, resuming from the previous run if possible.
    Build(build::BuildArgs),

    /// Show stages recorded as done.
    Status(status::StatusArgs),

    /// Forget the previous runs by deleting the status file.
    Reset(status::StatusArgs),

    /// Generate shell completion scripts.
    GenerateCompletion {
        /// The shell to generate the completion scripts for.
        shell: clap_complete::Shell,

        /// The file to write the completion scripts to or '-' to write to stdout.
        #[arg(short, long, default_value_t)]
        file: OutputArg,
    },
}

/// Main entry point for debimg.
///
/// Logging is controlled with `RUST_LOG`, e.g. `RUST_LOG=debug` shows every executed command.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level())).init();
    cli.run()
}

/// Generates shell completion scripts for the debimg command-line tool.
fn generate_completion(
    shell: Shell,
    path: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Generating completion file for {shell}...");
    let mut cmd = Cli::command();
    if let Some(file) = path {
        let mut file = File::create(file)?;
        clap_complete::generate(shell, &mut cmd, "debimg", &mut file);
    } else {
        clap_complete::generate(shell, &mut cmd, "debimg", &mut io::stdout());
    }
    Ok(())
}

//! Command-line options for `filesyncd` and `filesync`, plus tracing setup.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ClientConfig, ServerConfig};

/// Install the fmt subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Remote file store daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "filesyncd", version)]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding tmp/, files/ and files.db
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Fix namespace/content disagreements found at startup
    #[arg(long)]
    pub repair: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(dir) = &self.base_dir {
            config.base_dir = dir.clone();
        }
        if self.repair {
            config.repair_on_start = true;
        }
        config
    }
}

/// Remote file store client
#[derive(Clone, Debug, Parser)]
#[command(name = "filesync", version)]
pub struct ClientOpts {
    /// TOML configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Directory holding tmp/ and downloads/
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Hide transfer progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl ClientOpts {
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(dir) = &self.base_dir {
            config.base_dir = dir.clone();
        }
        if self.no_progress {
            config.progress = false;
        }
        config
    }
}

#[derive(Clone, Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// List a remote folder
    Ls {
        #[arg(default_value = "/")]
        folder: String,
    },
    /// Upload a local file into a remote folder
    Upload { file: PathBuf, folder: String },
    /// Download a remote file into the downloads directory
    Download {
        filename: String,
        #[arg(default_value = "/")]
        folder: String,
    },
    /// Create a remote folder
    Mkdir { folder: String },
    /// Remove a remote file
    Rm { filename: String, folder: String },
    /// Remove an empty remote folder
    Rmdir { folder: String },
    /// Interactive session with cd/pwd
    Shell,
}

/// One line of the interactive shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Ls(Option<String>),
    Cd(String),
    Pwd,
    Upload(PathBuf, Option<String>),
    Download(String, Option<String>),
    Mkdir(String),
    Rm(String, Option<String>),
    Rmdir(String),
    Help,
    Exit,
}

pub const SHELL_USAGE: &str = "\
commands:
  ls [folder]                  list a folder (default: current)
  cd <folder>                  change the working folder
  pwd                          print the working folder
  upload <file> [folder]       upload a local file
  download <name> [folder]     download into the downloads directory
  mkdir <folder>               create a folder
  rm <name> [folder]           remove a file
  rmdir <folder>               remove an empty folder
  exit                         leave the shell";

impl ShellCommand {
    /// Parse a whitespace-separated shell line. Empty lines give `None`.
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let mut words = line.split_whitespace();
        let cmd = words.next()?;
        let args: Vec<String> = words.map(str::to_string).collect();
        let arg = |i: usize| args.get(i).cloned();
        let need = |i: usize, usage: &str| arg(i).ok_or_else(|| format!("usage: {usage}"));
        let parsed = match cmd {
            "ls" => Ok(ShellCommand::Ls(arg(0))),
            "cd" => need(0, "cd <folder>").map(ShellCommand::Cd),
            "pwd" => Ok(ShellCommand::Pwd),
            "upload" => need(0, "upload <file> [folder]")
                .map(|f| ShellCommand::Upload(PathBuf::from(f), arg(1))),
            "download" => need(0, "download <name> [folder]").map(|n| ShellCommand::Download(n, arg(1))),
            "mkdir" => need(0, "mkdir <folder>").map(ShellCommand::Mkdir),
            "rm" => need(0, "rm <name> [folder]").map(|n| ShellCommand::Rm(n, arg(1))),
            "rmdir" => need(0, "rmdir <folder>").map(ShellCommand::Rmdir),
            "help" | "?" => Ok(ShellCommand::Help),
            "exit" | "quit" => Ok(ShellCommand::Exit),
            other => Err(format!("unknown command {other:?}; try help")),
        };
        Some(parsed)
    }
}

//! Command-line interface definitions for the `prevue` binary.
//!
//! The parser structures live here so the build script can render the
//! manual page from the same definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `prevue` binary.
#[derive(Debug, Parser)]
#[command(
    name = "prevue",
    version,
    about = "Provision, expose and tear down ephemeral preview environments",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Output format for listings and reports.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub(crate) output: OutputFormat,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// How results are written to stdout.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Aligned columns for people.
    Text,
    /// JSON for scripts.
    Json,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision the environment and expose its service ports.
    Up(UpCommand),
    /// Close the tunnel and delete the environment's machines.
    Down(DownCommand),
    /// List machines, snapshots and key pairs.
    Ls(LsCommand),
    /// Delete every resource of the selected kinds.
    Purge(PurgeCommand),
    /// Run a command on the environment's machine.
    Exec(ExecCommand),
    /// Snapshot the environment's machine.
    Snapshot(SnapshotCommand),
}

/// How the environment id is chosen.
#[derive(Debug, Args)]
pub(crate) struct EnvironmentArgs {
    /// Explicit environment id; normalized before use.
    #[arg(long = "id", value_name = "ID")]
    pub(crate) id: Option<String>,
    /// Compose file declaring the project name and ports.
    #[arg(long, value_name = "PATH")]
    pub(crate) compose_file: Option<String>,
    /// Append the current git branch to the derived id.
    #[arg(long)]
    pub(crate) include_branch: bool,
}

/// Arguments for `prevue up`.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    /// Environment selection.
    #[command(flatten)]
    pub(crate) environment: EnvironmentArgs,
    /// Override the instance type for this environment.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the image label for this environment.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Extra `service:port` to expose; may be repeated.
    #[arg(long = "port", value_name = "SERVICE:PORT")]
    pub(crate) ports: Vec<String>,
    /// Command run on the machine before ports are exposed; may be repeated.
    #[arg(long = "setup", value_name = "COMMAND")]
    pub(crate) setup: Vec<String>,
    /// Return once the machine is ready. Refused while a relay is
    /// configured and ports are exposed, because the tunnel lives in this
    /// process.
    #[arg(long)]
    pub(crate) detach: bool,
}

/// Arguments for `prevue down`.
#[derive(Debug, Args)]
pub(crate) struct DownCommand {
    /// Environment selection.
    #[command(flatten)]
    pub(crate) environment: EnvironmentArgs,
    /// Succeed when the environment does not exist.
    #[arg(long)]
    pub(crate) force: bool,
    /// Do not wait for the provider to confirm deletions.
    #[arg(long)]
    pub(crate) no_wait: bool,
}

/// Resource kinds selected on the command line.
#[derive(Debug, Args)]
pub(crate) struct KindArgs {
    /// Select machines.
    #[arg(long)]
    pub(crate) machines: bool,
    /// Select snapshots.
    #[arg(long)]
    pub(crate) snapshots: bool,
    /// Select key pairs.
    #[arg(long)]
    pub(crate) key_pairs: bool,
    /// Select every kind.
    #[arg(long)]
    pub(crate) all: bool,
}

/// Arguments for `prevue ls`.
#[derive(Debug, Args)]
pub(crate) struct LsCommand {
    /// Kinds to list; machines when none is given.
    #[command(flatten)]
    pub(crate) kinds: KindArgs,
}

/// Arguments for `prevue purge`.
#[derive(Debug, Args)]
pub(crate) struct PurgeCommand {
    /// Kinds to delete; nothing is deleted when none is given.
    #[command(flatten)]
    pub(crate) kinds: KindArgs,
    /// Treat resources that vanished meanwhile as deleted.
    #[arg(long)]
    pub(crate) force: bool,
    /// Do not wait for the provider to confirm deletions.
    #[arg(long)]
    pub(crate) no_wait: bool,
}

/// Arguments for `prevue exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Environment selection.
    #[command(flatten)]
    pub(crate) environment: EnvironmentArgs,
    /// Capture output instead of streaming stdin and stdout.
    #[arg(long)]
    pub(crate) batch: bool,
    /// Overall deadline in seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Command to run on the machine (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `prevue snapshot`.
#[derive(Debug, Args)]
pub(crate) struct SnapshotCommand {
    /// Environment selection.
    #[command(flatten)]
    pub(crate) environment: EnvironmentArgs,
}

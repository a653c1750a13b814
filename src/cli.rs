use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "watchback",
    version = env!("WATCHBACK_VERSION"),
    about = "Directory replication with versioned history and periodic snapshots",
    after_help = "Examples:\n  watchback run home\n  watchback sync home\n  watchback snapshot home\n  watchback profiles"
)]
pub struct Cli {
    /// Profile document location; defaults to ~/.watchback/watchback.json.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        about = "Replicate a profile continuously",
        long_about = "Run the full engine for one profile: initial sweeps of every mirror, then live change following and scheduled snapshots until interrupted.\n\nExample:\n  watchback run home"
    )]
    Run(ProfileArgs),
    #[command(
        about = "One-shot full sweep of every mirror",
        long_about = "Reconcile every mirror once, record a terminal snapshot and apply retention, then exit.\n\nExample:\n  watchback sync home"
    )]
    Sync(ProfileArgs),
    #[command(about = "Record a snapshot now and apply retention")]
    Snapshot(ProfileArgs),
    #[command(about = "List configured profiles")]
    Profiles,
}

#[derive(Args, Debug)]
pub struct ProfileArgs {
    #[arg(value_name = "PROFILE")]
    pub profile: String,
}

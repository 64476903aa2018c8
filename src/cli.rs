//! The command-line interface to the tunnel agent.

use {std::path::PathBuf, structopt::StructOpt};

/// Expose a local service through a burrow tunnel server.
#[derive(Debug, StructOpt)]
#[structopt(name = "burrow")]
#[non_exhaustive]
pub struct Cli {
    /// Path to the configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    Run(Run),
    Info(Info),
    Id(Id),
}

/// Open the tunnel and keep it up until interrupted.
#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Run {}

/// Query the remote's status endpoint for this tunnel and print the record.
#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Info {}

/// Print the tunnel id and public URL without connecting.
#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Id {
    /// Also print the URL form for this alias.
    #[structopt(long)]
    pub alias: Option<String>,
}

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fleetsync", version, about = "Fleet device and geospatial sync agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Run sync cycles until interrupted (default if no subcommand given).
    Run,

    /// Run a single sync cycle and exit.
    Once,
}

//! tugboat CLI library

pub mod commands;
pub mod config;
pub mod error;
pub mod repository;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// tugboat - Cluster API management cluster lifecycle
#[derive(Parser, Debug)]
#[command(name = "tugboat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install providers into a management cluster
    Init(commands::init::InitArgs),
    /// Delete providers from a management cluster
    Delete(commands::delete::DeleteArgs),
    /// Move providers and Cluster API objects to another management cluster
    Pivot(commands::pivot::PivotArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Init(args) => commands::init::run(args).await,
            Commands::Delete(args) => commands::delete::run(args).await,
            Commands::Pivot(args) => commands::pivot::run(args).await,
        }
    }
}

use clap::{Parser, Subcommand};

use crate::commands;

/// Monday - run local applications against remote services as if they were
/// all on the workstation
#[derive(Parser)]
#[command(name = "monday")]
#[command(version)]
#[command(about = "Monday - local development orchestrator for apps, tunnels and hostname rewrites")]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Enable the terminal UI
    #[arg(long, global = true)]
    pub ui: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a project: applications, forwards and watchers
    Run {
        /// Project name (optional when a single project is configured)
        project: Option<String>,
    },

    /// Scaffold a monday.toml configuration file
    Init {
        /// Overwrite an existing monday.toml
        #[arg(long)]
        force: bool,
    },

    /// Open the configuration in $MONDAY_EDITOR / $EDITOR
    Edit,
}

impl Cli {
    /// Dispatch the selected command and return the process exit code.
    pub fn run(self) -> Result<i32, Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;

        match self.command {
            None => rt.block_on(commands::run::run(None, self.ui)),
            Some(Commands::Run { project }) => {
                rt.block_on(commands::run::run(project.as_deref(), self.ui))
            }
            Some(Commands::Init { force }) => {
                commands::init::run(force)?;
                Ok(0)
            }
            Some(Commands::Edit) => {
                rt.block_on(commands::edit::run())?;
                Ok(0)
            }
        }
    }
}

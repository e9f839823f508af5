// Some view/runner accessors exist for the external UI layer and are
// exercised only in tests.
#![allow(dead_code)]

mod build;
mod cli;
mod commands;
mod config;
mod forward;
mod hostfile;
mod proxy;
mod run;
mod view;
mod watch;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("info")
            } else {
                EnvFilter::new("warn")
            }
        }))
        .with_target(false)
        .init();

    match cli.run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("monday: {e}");
            std::process::exit(1);
        }
    }
}

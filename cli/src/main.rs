use std::{process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use env_logger::Env;

use cache::*;
use error::CliError;
use flash::*;
use list::*;

mod cache;
mod error;
mod flash;
mod list;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// show debug output
    #[clap(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices and their alt settings
    List {
        /// vendor ID (ex: "0451")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "6165")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// send the boot chain and, optionally, a system image
    Flash(FlashArgs),
    /// inspect or manage the downloaded image cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn seconds(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => {
            list_dfu_devices(*vendor, *product)
        }
        Commands::Flash(args) => flash(args),
        Commands::Cache { action } => cache_cmd(action),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

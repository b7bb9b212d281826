mod app;
mod audit;
mod cli;
mod config;
mod model;
mod providers;
mod sync;

use anyhow::Result;
use env_logger::Env;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let args = match cli::parse_args(&raw_args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n");
            cli::print_help();
            std::process::exit(2);
        }
    };

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Sync { dry_run } => app::run_sync(&config, dry_run).await,
        Command::Rank => app::run_rank(&config).await,
        Command::Help => {
            cli::print_help();
            Ok(())
        }
    }
}

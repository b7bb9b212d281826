use std::path::PathBuf;

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconcile the board against the tracker.
    Sync { dry_run: bool },
    /// Print the review queue in priority order.
    Rank,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub command: Command,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

/// Parse everything after the binary name.
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut command: Option<Command> = None;
    let mut config: Option<PathBuf> = None;
    let mut verbose = false;
    let mut dry_run = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "sync" | "rank" | "help" if command.is_none() => {
                command = Some(match args[i].as_str() {
                    "sync" => Command::Sync { dry_run: false },
                    "rank" => Command::Rank,
                    _ => Command::Help,
                });
            }
            "--dry-run" => dry_run = true,
            "-v" | "--verbose" => verbose = true,
            "--config" => {
                i += 1;
                if i < args.len() {
                    config = Some(PathBuf::from(&args[i]));
                } else {
                    bail!("Missing value for --config");
                }
            }
            "-h" | "--help" => command = Some(Command::Help),
            other => bail!("Unknown argument '{other}'. Try 'workboard help'."),
        }
        i += 1;
    }

    let mut command = command.unwrap_or(Command::Help);
    if let Command::Sync { dry_run: ref mut d } = command {
        *d = dry_run;
    } else if dry_run {
        bail!("--dry-run only makes sense with 'sync'");
    }

    Ok(CliArgs {
        command,
        config,
        verbose,
    })
}

pub fn print_help() {
    println!("workboard — keep a kanban board in step with its tracker\n");
    println!("USAGE:");
    println!("  workboard sync [--dry-run]   Reconcile the board with the tracker");
    println!("  workboard rank               Print the review queue by priority");
    println!();
    println!("OPTIONS:");
    println!("  --config <path>   Use this config instead of ~/.workboard/config.toml");
    println!("  --dry-run         Show the operations without applying them");
    println!("  -v, --verbose     More logging");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_sync() {
        let parsed = parse_args(&args(&["sync"])).unwrap();
        assert_eq!(parsed.command, Command::Sync { dry_run: false });
        assert!(!parsed.verbose);
    }

    #[test]
    fn parse_sync_dry_run() {
        let parsed = parse_args(&args(&["sync", "--dry-run"])).unwrap();
        assert_eq!(parsed.command, Command::Sync { dry_run: true });
    }

    #[test]
    fn flag_order_does_not_matter() {
        let parsed = parse_args(&args(&["--dry-run", "sync", "-v"])).unwrap();
        assert_eq!(parsed.command, Command::Sync { dry_run: true });
        assert!(parsed.verbose);
    }

    #[test]
    fn parse_rank_with_config() {
        let parsed = parse_args(&args(&["rank", "--config", "/tmp/x.toml"])).unwrap();
        assert_eq!(parsed.command, Command::Rank);
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/x.toml")));
    }

    #[test]
    fn dry_run_without_sync_fails() {
        assert!(parse_args(&args(&["rank", "--dry-run"])).is_err());
    }

    #[test]
    fn missing_config_value_fails() {
        let result = parse_args(&args(&["sync", "--config"]));
        assert!(result.unwrap_err().to_string().contains("Missing value"));
    }

    #[test]
    fn no_command_means_help() {
        assert_eq!(parse_args(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn unknown_argument_is_rejected() {
        assert!(parse_args(&args(&["sync", "--frobnicate"])).is_err());
    }
}

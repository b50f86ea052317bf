use std::{
    fs::OpenOptions,
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::{EnvFilter, fmt};

mod changer;
mod commands;
mod config;
mod error;
mod notify;
mod session;
mod utils;

use commands::Cmd;
use crate::config::{Config, LogConfig};
use error::ChangerError;

pub struct AppCtx {
    pub cfg: Config,
}

#[derive(Parser, Debug)]
#[command(
    name = "vchanger",
    about = "Virtual disk autochanger for Bacula: removable-disk magazines as tape slots",
    arg_required_else_help = true,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Changer configuration file (TOML).
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

/// Logs go to stderr or the configured file; stdout carries command output.
fn init_tracing(debug: bool, log: &LogConfig) -> Result<()> {
    let default = if debug {
        "trace".to_string()
    } else {
        log.level.to_string().to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug);

    match &log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).without_time().try_init();
        }
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<ChangerError>())
        .map_or(1, ChangerError::exit_code)
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load(&cli.config)?;
    init_tracing(cli.debug, &cfg.log)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let ctx = AppCtx { cfg };
    cmd.run(&ctx)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn exit_code_finds_changer_error_in_chain() {
        let e = anyhow::Error::from(ChangerError::Conflict("busy".into()));
        assert_eq!(exit_code(&e), 16);

        let e = Err::<(), _>(ChangerError::io(
            "read",
            io::Error::from_raw_os_error(13),
        ))
        .context("load drive 0")
        .unwrap_err();
        assert_eq!(exit_code(&e), 13);

        assert_eq!(exit_code(&anyhow::anyhow!("bad config")), 1);
    }

    #[test]
    fn cli_takes_config_then_command() {
        let cli = Cli::try_parse_from(["vchanger", "/etc/vchanger/vc.conf", "LOADED", "0", "/dev/null", "0"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/vchanger/vc.conf"));
        assert!(matches!(cli.command, Some(Cmd::Loaded(_))));

        let cli = Cli::try_parse_from(["vchanger", "--check-config", "vc.conf"]).unwrap();
        assert!(cli.check_config && cli.command.is_none());
    }
}

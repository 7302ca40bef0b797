//! tarpipe - first-time bulk copy of a directory tree over one TCP socket
//!
//! `tarpipe receive 0.0.0.0:6969` on the destination, then
//! `tarpipe send dest-host:6969 dir...` on the source. Both ends must pass
//! the same `--secure` / `--gzip` flags.

use anyhow::{Context, Result};
use clap::Parser;

use tarpipe::cli::{Cli, Command, PASSPHRASE_ENV};
use tarpipe::config::{load_file_config, FileConfig};
use tarpipe::kdf::StdinPrompt;
use tarpipe::logger::{Logger, MultiLogger, TextLogger};
use tarpipe::progress::TransferProgress;
use tarpipe::session;

fn init_diagnostics(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// Choose loggers once; an empty MultiLogger costs nothing per event
fn build_logger(cli: &Cli, file: &FileConfig, stage: &'static str) -> Result<MultiLogger> {
    let mut loggers: Vec<Box<dyn Logger>> = Vec::new();
    if let Some(path) = cli.log_file(file) {
        let text = TextLogger::new(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        loggers.push(Box::new(text));
    }
    if cli.progress {
        loggers.push(Box::new(TransferProgress::new(stage, cli.verbose(file))));
    }
    Ok(MultiLogger::new(loggers))
}

fn main() -> Result<()> {
    // Exit immediately with 130 (128 + SIGINT)
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let cli = Cli::parse();
    let file = load_file_config(cli.config.as_deref()).context("Failed to load config")?;
    init_diagnostics(cli.verbose(&file));

    let env_passphrase = std::env::var(PASSPHRASE_ENV).ok();
    let cfg = cli
        .resolve(&file, env_passphrase, &mut StdinPrompt)
        .context("Invalid configuration")?;

    match &cli.command {
        Command::Send { addr, paths } => {
            let logger = build_logger(&cli, &file, "Sending")?;
            let stats = session::send(addr, paths, &cfg, &logger)
                .with_context(|| format!("send to {} failed", addr))?;
            if !cli.progress {
                eprintln!(
                    "sent {} entries, {} bytes ({} skipped)",
                    stats.entries, stats.bytes, stats.skipped
                );
            }
        }
        Command::Receive { bind, dest } => {
            let logger = build_logger(&cli, &file, "Receiving")?;
            let stats = session::receive(bind, dest, &cfg, &logger)
                .with_context(|| format!("receive on {} failed", bind))?;
            if !cli.progress {
                eprintln!("received {} entries, {} bytes", stats.entries, stats.bytes);
            }
        }
    }
    Ok(())
}

mod commands;
mod config;
mod error;
mod git_funcs;
mod locator;
mod pr;
mod prompt;
mod review_funcs;
mod servers;
mod url_parser;
mod utils;

use clap::Parser;
use colored::Colorize;
use std::io;
use std::process;
use tracing::{debug, info, Level};
use utils::{Args, Command};

use config::{ConfigStore, LoadOutcome, OsFs, Session};
use error::{Error, Result};
use prompt::TerminalPrompter;

fn exit_err(err: Error) -> ! {
    eprintln!("{}", format!("Error: {err}").red());
    process::exit(err.exit_code());
}

fn init_logging(debug: bool) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time();
    if debug {
        builder.with_max_level(Level::DEBUG).init();
    } else {
        builder.with_max_level(Level::INFO).with_level(false).init();
    }
}

async fn run(command: Command) -> Result<()> {
    let store = ConfigStore::new(ConfigStore::<OsFs>::default_path()?, OsFs);
    debug!("Configuration file: {}", store.path().display());
    let prompter = TerminalPrompter::new();

    let document = match store.load()? {
        LoadOutcome::Existing(document) => document,
        LoadOutcome::Empty(document) => {
            info!("No configuration found, let's set up a first server");
            let mut session = Session::open(store, document)?;
            let flags = match &command {
                Command::Config(args) => Some(args),
                _ => None,
            };
            commands::add_server(&mut session, flags, &prompter)?;
            info!("Configuration saved, please run the command again");
            return Ok(());
        }
    };
    let mut session = Session::open(store, document)?;

    match command {
        Command::Pr(args) => commands::run_pr(&mut session, &args, &prompter).await,
        Command::Config(args) => commands::run_config(&mut session, &args, &prompter),
        Command::Remote(args) => commands::run_remote(&mut session, &args).await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let Some(command) = args.command else {
        if let Err(err) = utils::write_usage(&mut io::stderr()) {
            exit_err(err.into());
        }
        return;
    };

    if let Err(err) = run(command).await {
        exit_err(err);
    }
}

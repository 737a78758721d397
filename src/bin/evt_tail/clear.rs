use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use evt::Session;
use evt::session::default_backup_path;

use std::path::PathBuf;

pub fn command() -> Command {
    Command::new("clear")
        .about("Clear a log, optionally backing it up first")
        .arg(crate::log_root_arg())
        .arg(
            Arg::new("provider")
                .long("provider")
                .short('p')
                .required(true)
                .value_name("NAME")
                .help("Provider (log or source name) whose log is cleared."),
        )
        .arg(
            Arg::new("backup")
                .long("backup")
                .short('b')
                .value_name("FILE")
                .conflicts_with("auto-backup")
                .help("Copy the log here before clearing it. Must not exist."),
        )
        .arg(
            Arg::new("auto-backup")
                .long("auto-backup")
                .action(ArgAction::SetTrue)
                .help("Back up next to the log, as `<log>-<timestamp>.evt`."),
        )
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    let registry = crate::registry_from(matches)?;
    let provider = matches
        .get_one::<String>("provider")
        .expect("This is a required argument");

    let mut session = Session::open(&registry, provider, 0)?;
    let count = session.record_count()?;

    let backup = match matches.get_one::<String>("backup") {
        Some(path) => Some(PathBuf::from(path)),
        None if matches.get_flag("auto-backup") => default_backup_path(&session),
        None => None,
    };

    session
        .clear(backup.as_deref())
        .with_context(|| format!("failed to clear log `{}`", session.log_name()))?;

    match backup {
        Some(path) => println!(
            "cleared {} record(s) from `{}`, backup at `{}`",
            count,
            session.log_name(),
            path.display()
        ),
        None => println!("cleared {} record(s) from `{}`", count, session.log_name()),
    }
    Ok(())
}

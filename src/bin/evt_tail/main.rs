use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use encoding::EncodingRef;
use encoding::all::encodings;
use encoding::types::Encoding;
use indoc::indoc;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use evt::Registry;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;

#[cfg(all(feature = "fast-alloc", not(windows)))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "fast-alloc", windows))]
#[global_allocator]
static ALLOC: rpmalloc::RpMalloc = rpmalloc::RpMalloc;

mod clear;
mod dump;
mod install_source;
mod report;
mod tail;

/// `--log-root`, shared by every subcommand that works on a log store.
fn log_root_arg() -> Arg {
    Arg::new("log-root")
        .long("log-root")
        .short('r')
        .value_name("DIR")
        .env("EVT_LOG_ROOT")
        .help("Directory holding `registry.json` and the log files.")
}

fn registry_from(matches: &ArgMatches) -> Result<Registry> {
    let root = matches
        .get_one::<String>("log-root")
        .context("`--log-root` (or `EVT_LOG_ROOT`) is required")?;
    Ok(Registry::new(PathBuf::from(root)))
}

fn ansi_codec_arg() -> Arg {
    Arg::new("ansi-codec")
        .long("ansi-codec")
        .value_name("CODEC")
        .default_value(encoding::all::WINDOWS_1252.name())
        .value_parser(encodings().iter().map(|e| e.name()).collect::<Vec<&'static str>>())
        .help("Codec used to decode ANSI message table entries.")
}

fn ansi_codec_from(matches: &ArgMatches) -> EncodingRef {
    matches
        .get_one::<String>("ansi-codec")
        .and_then(|name| encodings().iter().find(|c| c.name() == name.as_str()))
        .copied()
        .unwrap_or(encoding::all::WINDOWS_1252)
}

/// Stdout for publishers running on several threads. Output is buffered until `flush`, which
/// writes it under the stdout lock, so batches from different providers never interleave.
#[derive(Debug, Default)]
struct StdoutLines {
    buf: Vec<u8>,
}

impl Write for StdoutLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(&self.buf)?;
        out.flush()?;
        self.buf.clear();
        Ok(())
    }
}

fn try_to_initialize_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3 => LevelFilter::Trace,
        _ => {
            eprintln!("using more than -vvv does not affect verbosity level");
            LevelFilter::Trace
        }
    };

    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Off)
        .build();

    if let Err(e) = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto) {
        eprintln!("failed to initialize logging: {e:?}");
    }
}

fn cli() -> Command {
    Command::new("evt_tail")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tail event logs and resolve their messages")
        .long_about(indoc!(
            r#"
            Tail event logs and resolve their messages.

            Logs live in a log store: a directory with a `registry.json` describing logs,
            event sources and their message files, plus one `.evt` file per log.
            `tail` follows providers continuously and prints one JSON object per event,
            resuming after the last delivered record on restart.
        "#
        ))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help(indoc!(r#"
                Sets debug prints level for the application:
                    -v   - info
                    -vv  - debug
                    -vvv - trace
                NOTE: trace output is only available in debug builds, as it is extremely verbose."#)),
        )
        .subcommand(tail::command())
        .subcommand(dump::command())
        .subcommand(report::command())
        .subcommand(install_source::command())
        .subcommand(clear::command())
}

fn main() {
    let matches = cli().get_matches();
    try_to_initialize_logging(matches.get_count("verbose"));

    let result = match matches.subcommand() {
        Some(("tail", sub)) => tail::run(sub),
        Some(("dump", sub)) => dump::run(sub),
        Some(("report", sub)) => report::run(sub),
        Some(("install-source", sub)) => install_source::run(sub),
        Some(("clear", sub)) => clear::run(sub),
        _ => unreachable!("clap requires a subcommand"),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        exit(1);
    }
}

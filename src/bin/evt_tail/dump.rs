use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};

use evt::{
    Checkpoint, CheckpointStore, EngineSettings, EngineState, JsonLinesPublisher,
    MemoryCheckpointStore, Session, StopSignal, TailingEngine,
};

use crate::StdoutLines;

pub fn command() -> Command {
    Command::new("dump")
        .about("Print the events currently in a log as JSON lines, then exit")
        .arg(crate::log_root_arg())
        .arg(
            Arg::new("provider")
                .long("provider")
                .short('p')
                .required(true)
                .value_name("NAME")
                .help("Provider (log or source name) to dump."),
        )
        .arg(
            Arg::new("after")
                .long("after")
                .value_parser(clap::value_parser!(u32))
                .default_value("0")
                .value_name("RECORD")
                .help("Only dump records with a higher record number."),
        )
        .arg(
            Arg::new("language-id")
                .long("language-id")
                .value_parser(clap::value_parser!(u32))
                .default_value("0")
                .value_name("LANGID")
                .help("Preferred message table language, e.g. 1033 for en-US."),
        )
        .arg(crate::ansi_codec_arg())
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    let registry = crate::registry_from(matches)?;
    let provider = matches
        .get_one::<String>("provider")
        .expect("This is a required argument");
    let after = *matches.get_one::<u32>("after").expect("has default");

    let settings = EngineSettings::new()
        .language_id(*matches.get_one::<u32>("language-id").expect("has default"))
        .ansi_codec(crate::ansi_codec_from(matches));

    let mut session = Session::open(&registry, provider, 0)?;
    let newest = session.newest_record_number()?;
    session.close();
    if after > newest {
        bail!(
            "record {after} is past the end of log `{}` (newest record is {newest})",
            session.log_name()
        );
    }

    // Seed a throwaway checkpoint so the engine starts right after `--after`.
    let checkpoints = MemoryCheckpointStore::new();
    if after > 0 {
        checkpoints.save(&Checkpoint {
            provider: provider.clone(),
            last_record_number: after,
            log_created: None,
        })?;
    }

    let mut engine = TailingEngine::new(
        registry,
        provider.clone(),
        settings,
        JsonLinesPublisher::new(StdoutLines::default()),
        checkpoints,
    );

    let stop = StopSignal::never();
    engine.start();
    loop {
        match engine.step(&stop)? {
            EngineState::Waiting | EngineState::Idle => break,
            _ => {}
        }
    }

    let stats = engine.stats();
    eprintln!(
        "{} events ({} unresolved, {} skipped)",
        stats.emitted, stats.unresolved, stats.skipped
    );
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use evt::{EventLogWriter, EventType, UserSid};

pub fn command() -> Command {
    Command::new("report")
        .about("Write an event to the log of a source")
        .arg(crate::log_root_arg())
        .arg(
            Arg::new("source")
                .long("source")
                .short('s')
                .required(true)
                .value_name("NAME")
                .help("Event source. Unregistered sources write to the `Application` log."),
        )
        .arg(
            Arg::new("type")
                .long("type")
                .short('t')
                .value_parser(clap::value_parser!(EventType))
                .default_value("info")
                .value_name("TYPE")
                .help("success, error, warning, info, audit-success or audit-failure."),
        )
        .arg(
            Arg::new("event-id")
                .long("event-id")
                .short('e')
                .required(true)
                .value_parser(parse_event_id)
                .value_name("ID")
                .help("32-bit event id, decimal or 0x-prefixed hex."),
        )
        .arg(
            Arg::new("category")
                .long("category")
                .value_parser(clap::value_parser!(u16))
                .default_value("0")
                .value_name("N"),
        )
        .arg(
            Arg::new("sid")
                .long("sid")
                .value_parser(clap::value_parser!(UserSid))
                .value_name("SID")
                .help("User SID, e.g. S-1-5-18."),
        )
        .arg(
            Arg::new("computer")
                .long("computer")
                .value_name("NAME")
                .help("Computer name to record (default: this machine)."),
        )
        .arg(
            Arg::new("strings")
                .action(ArgAction::Append)
                .value_name("STRING")
                .help("Insert strings, %1 onwards."),
        )
}

fn parse_event_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid event id `{value}`: {e}"))
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    let registry = crate::registry_from(matches)?;
    let source = matches
        .get_one::<String>("source")
        .expect("This is a required argument");

    let mut writer = EventLogWriter::open(&registry, source)?;
    if let Some(computer) = matches.get_one::<String>("computer") {
        writer = writer.with_computer_name(computer.clone());
    }

    let strings: Vec<&String> = matches
        .get_many::<String>("strings")
        .into_iter()
        .flatten()
        .collect();

    let record_number = writer
        .report_with(
            *matches.get_one::<EventType>("type").expect("has default"),
            *matches.get_one::<u16>("category").expect("has default"),
            *matches.get_one::<u32>("event-id").expect("This is a required argument"),
            matches.get_one::<UserSid>("sid").cloned(),
            &strings,
            &[],
        )
        .with_context(|| format!("failed to write to log `{}`", writer.log_name()))?;

    println!("{} {}", writer.log_name(), record_number);
    Ok(())
}

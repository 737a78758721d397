use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indoc::indoc;

use evt::SourceRegistration;

pub fn command() -> Command {
    Command::new("install-source")
        .about("Register (or remove) an event source and its message files")
        .long_about(indoc!(
            r#"
            Register an event source under a log, creating the log registration if needed.

            Message file values are `;`-separated lists of paths and may reference
            environment variables as `%NAME%`, exactly like the registry values
            `EventMessageFile`, `ParameterMessageFile` and `CategoryMessageFile`.
        "#
        ))
        .arg(crate::log_root_arg())
        .arg(
            Arg::new("log")
                .long("log")
                .short('l')
                .default_value("Application")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .short('s')
                .required(true)
                .value_name("NAME"),
        )
        .arg(
            Arg::new("event-message-file")
                .long("event-message-file")
                .value_name("PATHS"),
        )
        .arg(
            Arg::new("parameter-message-file")
                .long("parameter-message-file")
                .value_name("PATHS"),
        )
        .arg(
            Arg::new("category-message-file")
                .long("category-message-file")
                .value_name("PATHS"),
        )
        .arg(
            Arg::new("category-count")
                .long("category-count")
                .value_parser(clap::value_parser!(u32))
                .default_value("0")
                .value_name("N"),
        )
        .arg(
            Arg::new("types-supported")
                .long("types-supported")
                .value_parser(clap::value_parser!(u16))
                .default_value("7")
                .value_name("MASK"),
        )
        .arg(
            Arg::new("remove")
                .long("remove")
                .action(ArgAction::SetTrue)
                .conflicts_with_all([
                    "event-message-file",
                    "parameter-message-file",
                    "category-message-file",
                ])
                .help("Remove the source instead of registering it."),
        )
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    let registry = crate::registry_from(matches)?;
    let log = matches.get_one::<String>("log").expect("has default");
    let source = matches
        .get_one::<String>("source")
        .expect("This is a required argument");

    if matches.get_flag("remove") {
        registry.remove_source(log, source)?;
        println!("removed `{source}` from `{log}`");
        return Ok(());
    }

    let registration = SourceRegistration {
        event_message_file: matches.get_one::<String>("event-message-file").cloned(),
        parameter_message_file: matches.get_one::<String>("parameter-message-file").cloned(),
        category_message_file: matches.get_one::<String>("category-message-file").cloned(),
        category_count: *matches.get_one::<u32>("category-count").expect("has default"),
        types_supported: *matches.get_one::<u16>("types-supported").expect("has default"),
    };

    let replaced = registry.install_source(log, source, registration)?;
    if replaced {
        println!("updated `{source}` in `{log}`");
    } else {
        println!("installed `{source}` in `{log}`");
    }
    Ok(())
}

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indoc::indoc;
use log::{error, info};

use evt::err::EngineError;
use evt::{
    Config, EngineStats, FileCheckpointStore, JsonLinesPublisher, ProviderConfig,
    ProviderOptions, Registry, StartPosition, TailingEngine, stop_signal,
};

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread;

use crate::StdoutLines;

pub fn command() -> Command {
    Command::new("tail")
        .about("Follow providers and print their events as JSON lines")
        .long_about(indoc!(
            r#"
            Follow one or more providers and print their events as JSON lines.

            Providers come either from a config file (`--config`) or from `--provider`
            arguments together with `--log-root`. Each provider resumes after its last
            checkpoint. Stop with Ctrl-C.
        "#
        ))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .conflicts_with("provider")
                .help("JSON config file."),
        )
        .arg(crate::log_root_arg())
        .arg(
            Arg::new("provider")
                .long("provider")
                .short('p')
                .action(ArgAction::Append)
                .value_name("NAME")
                .help("Provider to follow. May be repeated."),
        )
        .arg(
            Arg::new("start")
                .long("start")
                .value_name("POSITION")
                .value_parser(clap::value_parser!(StartPosition))
                .help("Where to start when a provider has no checkpoint (`beginning` or `end`)."),
        )
        .arg(
            Arg::new("checkpoint-dir")
                .long("checkpoint-dir")
                .value_name("DIR")
                .help("Directory for checkpoint files (default: <log-root>/checkpoints)."),
        )
}

fn config_from(matches: &ArgMatches) -> Result<Config> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load config `{path}`"))?,
        None => {
            let registry = crate::registry_from(matches)?;
            let providers: Vec<ProviderConfig> = matches
                .get_many::<String>("provider")
                .into_iter()
                .flatten()
                .map(|name| ProviderConfig {
                    name: name.clone(),
                    options: ProviderOptions::default(),
                })
                .collect();
            if providers.is_empty() {
                bail!("either `--config` or at least one `--provider` is required");
            }
            Config {
                log_root: registry.root().to_path_buf(),
                checkpoint_dir: None,
                defaults: ProviderOptions::default(),
                providers,
            }
        }
    };

    if let Some(start) = matches.get_one::<StartPosition>("start") {
        config.defaults.start_position = Some(*start);
    }
    if let Some(dir) = matches.get_one::<String>("checkpoint-dir") {
        config.checkpoint_dir = Some(PathBuf::from(dir));
    }
    config.validate()?;
    Ok(config)
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    let config = config_from(matches)?;
    let registry = Registry::new(&config.log_root);
    let checkpoints = FileCheckpointStore::new(config.checkpoint_dir());

    let (handle, stop) = stop_signal();
    let ctrlc_handle = handle.clone();
    ctrlc::set_handler(move || ctrlc_handle.stop()).context("failed to set Ctrl-C handler")?;

    let mut engines = Vec::with_capacity(config.providers.len());
    for provider in &config.providers {
        let settings = config.engine_settings(provider)?;
        engines.push(TailingEngine::new(
            registry.clone(),
            provider.name.clone(),
            settings,
            JsonLinesPublisher::new(StdoutLines::default()),
            &checkpoints,
        ));
    }

    info!("tailing {} provider(s)", engines.len());
    let results: Vec<(String, EngineOutcome)> = thread::scope(|scope| {
        let workers: Vec<_> = engines
            .into_iter()
            .map(|mut engine| {
                let provider = engine.provider().to_string();
                let stop = stop.clone();
                let handle = handle.clone();
                let worker = scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.run(&stop)));
                    if !matches!(outcome, Ok(Ok(_))) {
                        // One dead provider stops the rest.
                        handle.stop();
                    }
                    outcome
                });
                (provider, worker)
            })
            .collect();

        workers
            .into_iter()
            .map(|(provider, worker)| (provider, worker.join().and_then(|outcome| outcome)))
            .collect()
    });

    summarize(results)
}

/// What an engine thread ended with: stats, an engine error, or a panic.
type EngineOutcome = thread::Result<Result<EngineStats, EngineError>>;

fn summarize(results: Vec<(String, EngineOutcome)>) -> Result<()> {
    let mut failed = 0;
    for (provider, outcome) in results {
        match outcome {
            Ok(Ok(stats)) => info!(
                "`{provider}`: {} events, {} skipped, {} unresolved",
                stats.emitted, stats.skipped, stats.unresolved
            ),
            Ok(Err(e)) => {
                error!("`{provider}`: {e}");
                failed += 1;
            }
            Err(_) => {
                error!("`{provider}`: engine thread panicked");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} provider(s) stopped with an error");
    }
    Ok(())
}

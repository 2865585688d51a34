//! neodock entry point.

use std::process;
use std::sync::Arc;

use log::{error, LevelFilter};
use tokio::io::BufReader;

mod app;
mod cli;
mod config;
mod console;
mod container_spec;
mod error;
mod images;
mod lifecycle;
mod runtime;
mod service;
mod signal;
mod topology;
mod types;

use cli::Cli;
use config::{log_level, RunConfig, Settings};
use error::ServiceError;
use runtime::{ContainerEngine, DockerEngine};
use signal::Interrupt;

enum Mode {
    Run(RunConfig),
    /// `--cleanup`: clap guarantees the name is present.
    Cleanup(String),
}

fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_target(false)
        .init();
}

fn report(err: &ServiceError) {
    eprintln!("neodock: {}", err);
    if let Some(explanation) = err.explanation() {
        eprintln!("{}", explanation);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::from_args();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            init_logging(log_level(cli.verbose));
            error!("{:#}", e);
            process::exit(app::EXIT_FAILURE);
        }
    };

    let mode = if cli.cleanup {
        init_logging(log_level(cli.verbose));
        Mode::Cleanup(cli.name.clone().unwrap_or_default())
    } else {
        match cli.into_run_config(settings.clone()) {
            Ok(run) => {
                init_logging(run.log_level);
                Mode::Run(run)
            }
            Err(e) => {
                report(&e.into());
                process::exit(app::EXIT_FAILURE);
            }
        }
    };

    let engine: Arc<dyn ContainerEngine> = match DockerEngine::connect(settings.stop_timeout_secs) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            report(&e.into());
            process::exit(app::EXIT_FAILURE);
        }
    };

    let result = match mode {
        Mode::Cleanup(name) => app::cleanup(engine, &name).await,
        Mode::Run(run) => {
            app::run_service(
                engine,
                &run,
                Interrupt::install(),
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        }
    };

    match &result {
        Err(e) if e.is_interrupt() => {
            if let Some(explanation) = e.explanation() {
                eprintln!("{}", explanation);
            }
        }
        Err(e) => report(e),
        Ok(()) => {}
    }
    process::exit(app::exit_code(&result));
}

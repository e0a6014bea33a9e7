//! # shotline_cli
//!
//! Part of the shotline crate family.
//!
//! Runs the shotline pipeline from the command line on synthetic events, showing the fill
//! and processing rates in a progress bar.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! shotline_cli -p config.yml new
//! ```
//!
//! and run the pipeline with
//!
//! ```bash
//! shotline_cli -p config.yml -n 10000 -r 120
//! ```
//!
//! where `-n` is the number of events to generate (unlimited if omitted) and `-r` the
//! repetition rate in Hz (as fast as possible if omitted). Editing the configuration file
//! while the pipeline runs reloads it. The log is written to `./shotline.log`.
use clap::{Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use libshotline::config::Config;
use libshotline::pipeline::{Pipeline, PipelineState};
use libshotline::source::SyntheticSource;

fn init_logging() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./shotline.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    // Only warnings reach the terminal so the progress bar stays readable
    let term_sink = Arc::new(
        spdlog::sink::StdStreamSink::builder()
            .std_stream(spdlog::sink::StdStream::Stderr)
            .level_filter(spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Warn))
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .level_filter(spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Info))
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .sink(term_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => println!("Made a template config at {}", path.display()),
        Err(e) => eprintln!("Could not make template config: {e}"),
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn main() {
    // Create a cli
    let matches = Command::new("shotline_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("events")
                .short('n')
                .long("events")
                .value_parser(clap::value_parser!(u64))
                .help("Number of events to generate"),
        )
        .arg(
            Arg::new("rate")
                .short('r')
                .long("rate")
                .value_parser(clap::value_parser!(f64))
                .help("Event repetition rate in Hz"),
        )
        .get_matches();

    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("A configuration path is required");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        make_template_config(&config_path);
        return;
    }

    if let Err(e) = init_logging() {
        eprintln!("Could not create logging: {e}");
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.display());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!(
        "Ring capacity: {} Backpressure: {:?}",
        config.ring_capacity,
        config.backpressure
    );
    spdlog::info!("Number of workers: {}", config.n_workers);
    spdlog::info!("Number of processors: {}", config.processors.len());

    let n_events = matches.get_one::<u64>("events").copied();
    let mut source = SyntheticSource::new();
    if let Some(n) = n_events {
        source = source.with_limit(n);
    }
    if let Some(rate) = matches.get_one::<f64>("rate").copied() {
        if rate > 0.0 {
            source = source.with_delay(Duration::from_secs_f64(1.0 / rate));
        }
    }

    let mut pipeline = match Pipeline::new(config, Box::new(source)) {
        Ok(p) => p,
        Err(e) => {
            spdlog::error!("Could not create pipeline: {e}");
            return;
        }
    };
    let mut rates = pipeline.take_rates();
    if let Err(e) = pipeline.start() {
        spdlog::error!("Could not start pipeline: {e}");
        return;
    }

    // Setup the progress bar
    let pb = match n_events {
        Some(n) => ProgressBar::new(n),
        None => ProgressBar::new_spinner(),
    };
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_msg}") {
        pb.set_style(style);
    }

    let mut last_modified = modified_time(&config_path);
    let mut failed = false;
    loop {
        // Without a UI we sleep ~1 sec before each update
        std::thread::sleep(Duration::from_secs(1));
        if let Some(rates) = rates.as_mut() {
            let snapshot = rates.snapshot();
            pb.set_position(snapshot.source_total.count);
            pb.set_message(snapshot.summary());
        }

        let modified = modified_time(&config_path);
        if modified.is_some() && modified != last_modified {
            last_modified = modified;
            match Config::read_config_file(&config_path) {
                Ok(new_config) => match pipeline.reload(new_config) {
                    Ok(()) => spdlog::info!("Reloaded config from {}", config_path.display()),
                    Err(e) => spdlog::error!("Could not reload config: {e}"),
                },
                Err(e) => spdlog::warn!("Ignoring config change: {e}"),
            }
        }

        match pipeline.poll() {
            Ok(PipelineState::Running) => (),
            Ok(PipelineState::SourceExhausted) => break,
            Err(e) => {
                spdlog::error!("Pipeline failed with error: {e}");
                failed = true;
                break;
            }
        }
    }

    if !failed {
        match pipeline.finish() {
            Ok(()) => spdlog::info!("Successfully processed all events!"),
            Err(e) => spdlog::error!("Pipeline failed with error: {e}"),
        }
    }
    if let Some(rates) = rates.as_mut() {
        pb.set_message(rates.snapshot().summary());
    }
    pb.finish();

    for (processor, record) in pipeline.graph().data_errors() {
        spdlog::warn!(
            "Processor {} had {} data errors, last at event {}: {}",
            processor,
            record.count,
            record.last_event,
            record.last_message
        );
    }
    spdlog::info!("Ring statistics: {:?}", pipeline.statistics());
    spdlog::info!("Done.");
}

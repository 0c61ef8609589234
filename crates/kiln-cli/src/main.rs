use anyhow::Result;
use clap::Parser;
use kiln_cache::Cache;
use kiln_config::{Config, LogLevel};
use kiln_pool::{IoWorker, PoolMode};
use kiln_wrappers::{find_wrapper, handle_command};
use std::process::Command;

/// Exit code when kiln itself failed and the wrapped compiler was never run.
/// Distinguishable from any ordinary compiler exit.
const EXIT_INTERNAL_ERROR: i32 = 112;

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Compiler invocation cache: kiln <compiler> <args...>"
)]
struct Cli {
    /// Clear the cache (remove all entries, reset statistics)
    #[arg(short = 'C', long = "clear")]
    clear: bool,

    /// Print cache statistics
    #[arg(short = 's', long = "show-stats")]
    show_stats: bool,

    /// Zero cache statistics
    #[arg(short = 'z', long = "zero-stats")]
    zero_stats: bool,

    /// The compiler command line to wrap
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("kiln: {err}");
            return EXIT_INTERNAL_ERROR;
        }
    };
    init_tracing(&config);

    if cli.clear || cli.show_stats || cli.zero_stats {
        return match administrate(&cli, &config) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("kiln: {err}");
                EXIT_INTERNAL_ERROR
            }
        };
    }

    if cli.command.is_empty() {
        eprintln!("kiln: no command given (see --help)");
        return EXIT_INTERNAL_ERROR;
    }

    wrap(&cli.command, &config)
}

fn administrate(cli: &Cli, config: &Config) -> Result<()> {
    let cache = Cache::new(config, IoWorker::disabled(), PoolMode::SingleThreaded)?;

    if cli.clear {
        cache.clear()?;
        println!("Cache cleared.");
    }
    if cli.zero_stats {
        cache.zero_stats()?;
        println!("Statistics cleared.");
    }
    if cli.show_stats {
        let stats = cache.stats()?;
        let entries = cache.local().entry_count()?;
        let resident = cache.local().resident_size()?;
        println!("Cache directory: {}", config.cache_dir.display());
        println!("  Entries:       {entries}");
        println!(
            "  Resident size: {resident} bytes (budget {} bytes)",
            config.max_cache_size
        );
        println!(
            "  Local:         {} hits, {} misses",
            stats.local_hits, stats.local_misses
        );
        println!(
            "  Remote:        {} hits, {} misses",
            stats.remote_hits, stats.remote_misses
        );
    }
    Ok(())
}

/// Wrap mode: try the cache pipeline, and on any wrapper or cache failure
/// fall back to running the command directly — the cache is always optional,
/// and no failure of kiln may change the compiler's observed behavior.
fn wrap(command: &[String], config: &Config) -> i32 {
    let io = IoWorker::start(1);

    let cached_outcome = (|| -> Option<i32> {
        let mut wrapper = find_wrapper(command, config)?;

        let cache = match Cache::new(config, io.clone(), PoolMode::AllHwThreads) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::error!(
                    target = "kiln.cli",
                    error = %err,
                    "failed to open the cache, running directly"
                );
                return None;
            }
        };

        match handle_command(wrapper.as_mut(), &cache) {
            Ok(return_code) => {
                cache.flush();
                Some(return_code)
            }
            Err(err) => {
                tracing::debug!(
                    target = "kiln.cli",
                    error = %err,
                    "wrapper aborted, falling back to a direct run"
                );
                cache.flush();
                None
            }
        }
    })();
    io.stop();

    match cached_outcome {
        Some(return_code) => return_code,
        None => run_direct(command),
    }
}

/// Run the command with inherited stdio, exactly as if kiln weren't there.
fn run_direct(command: &[String]) -> i32 {
    let (program, args) = match command.split_first() {
        Some(split) => split,
        None => return EXIT_INTERNAL_ERROR,
    };

    match Command::new(program).args(args).status() {
        Ok(status) => status.code().unwrap_or(EXIT_INTERNAL_ERROR),
        Err(err) => {
            eprintln!("kiln: failed to run {program}: {err}");
            EXIT_INTERNAL_ERROR
        }
    }
}

fn init_tracing(config: &Config) {
    let directive = match config.log_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Error | LogLevel::Fatal => "error",
        LogLevel::None => "off",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .init();
}

//! ldata-watch: print data-availability triggers for one location
//!
//! Each trigger is written to stdout as one JSON line. Realtime sessions run
//! until SIGINT/SIGTERM; archive sessions stop once the interval is done.

use anyhow::{Context, Result};
use ldata_logging::{init_logging, LogConfig};
use ldata_trigger::cli::{parse_args, CliArgs, CliCommand, USAGE};
use ldata_trigger::{CancelToken, TriggerConfig, TriggerEngine};
use std::io::Write;
use std::process::ExitCode;
use tracing::{debug, info};

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(CliCommand::Help) => {
            print!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Ok(CliCommand::Run(args)) => args,
        Err(err) => {
            eprintln!("Error: {}\n\n{}", err, USAGE);
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_logging(LogConfig {
        app_name: "ldata-watch",
        verbose: args.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    let config = match args.to_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}\n\n{}", err, USAGE);
            return ExitCode::from(2);
        }
    };

    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn run(args: &CliArgs, config: TriggerConfig) -> Result<()> {
    let mut engine = TriggerEngine::new(config).context("Failed to start trigger session")?;
    if args.nowait {
        engine.set_nowait()?;
    }

    let token = CancelToken::new();
    install_signal_handlers(token.clone())?;
    engine.set_cancel_token(token.clone());
    engine.set_heartbeat(|label: &str| debug!("Waiting: {}", label));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut count = 0u64;
    while let Some(event) = engine.next_event() {
        let line = serde_json::to_string(&event).context("Failed to encode trigger")?;
        writeln!(out, "{}", line).context("Failed to write trigger")?;
        out.flush()?;
        count += 1;
    }

    if token.is_cancelled() {
        info!(count, "Shutdown requested, stopping");
    } else if engine.is_exhausted() {
        info!(count, "Archive interval complete");
    } else {
        info!(count, "No new data");
    }
    if let Some(stats) = engine.bundle_stats() {
        info!(
            created = stats.created,
            fired = stats.fired,
            expired = stats.expired,
            "Bundle summary"
        );
    }
    Ok(())
}

fn install_signal_handlers(token: CancelToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signals")?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, finishing current poll...", sig);
                token.cancel();
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, finishing current poll...");
            token.cancel();
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    Ok(())
}

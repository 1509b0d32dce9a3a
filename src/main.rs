use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ruuvitag_fanout::app::{self, LoopSettings, Options, RealScanner, RunError};
use ruuvitag_fanout::{Config, Dispatcher, HttpInflux, MessagingSink, MqttPublisher, StorageSink};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Initialize logging; `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Only fails when a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Build the sinks from `config` and run until a termination signal.
async fn run(options: Options) -> Result<(), RunError> {
    let config = Config::from_options(&options)?;

    info!(
        host = %config.storage.host,
        user = config.storage.username.as_deref().unwrap_or("-"),
        "Connecting to InfluxDB"
    );

    let influx = HttpInflux::new(&config.storage, config.write_timeout)?;
    let dispatcher = Dispatcher::new(config.write_timeout)
        .with_sink(StorageSink::new(&config.storage, influx))
        .with_sink(MessagingSink::new(&config.messaging, MqttPublisher));

    let settings = LoopSettings {
        device_timeout: config.device_timeout,
        verbose: config.verbose,
    };
    app::run(settings, &RealScanner, &dispatcher, shutdown_signal()).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}

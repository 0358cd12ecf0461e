//! keyboard-midi - computer keyboards as JACK MIDI controllers

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyboard_midi::audio::{JackSink, PortSink};
use keyboard_midi::config::{KeyMapStore, KeyMapWatcher};
use keyboard_midi::dispatch;
use keyboard_midi::input::registry::{DEFAULT_DEVICES_FILE, DEFAULT_INPUT_DIR};
use keyboard_midi::input::ProcRegistry;
use keyboard_midi::monitor::{DeviceMonitor, MonitorSettings};
use keyboard_midi::session::{Session, SessionTimeouts};
use keyboard_midi::sniffer;
use keyboard_midi::status::{self, StatusFormat};

/// keyboard-midi - play computer keyboards as MIDI instruments through JACK
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the YAML key maps
    #[arg(short, long, env = "KEYBOARD_MIDI_MAPS", default_value = "maps")]
    maps: PathBuf,

    /// JACK client name
    #[arg(long, env = "KEYBOARD_MIDI_CLIENT", default_value = "keyboard-midi")]
    client_name: String,

    /// Kernel input device listing
    #[arg(long, default_value = DEFAULT_DEVICES_FILE)]
    devices_file: PathBuf,

    /// Directory of the eventN device nodes
    #[arg(long, default_value = DEFAULT_INPUT_DIR)]
    input_dir: PathBuf,

    /// Device poll interval
    #[arg(long, default_value_t = 200)]
    poll_interval_ms: u64,

    /// Attempts to open a newly plugged device
    #[arg(long, default_value_t = 20)]
    open_attempts: u32,

    /// Delay between open attempts
    #[arg(long, default_value_t = 50)]
    open_backoff_ms: u64,

    /// Events queued between devices and the JACK callback
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Bound for each teardown step (worker exit, queue drain)
    #[arg(long, default_value_t = 500)]
    shutdown_timeout_ms: u64,

    /// Status report interval, 0 disables
    #[arg(long, default_value_t = 5)]
    status_interval_secs: u64,

    /// Print status reports as JSON lines on stdout
    #[arg(long)]
    status_json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long, env = "KEYBOARD_MIDI_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// List input devices and their key maps, then exit
    #[arg(long)]
    list_devices: bool,

    /// Print key codes of one event device (e.g. /dev/input/event3)
    #[arg(long, value_name = "EVENT_PATH")]
    sniff: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _log_guard = init_logging(&args.log_level, args.log_file.as_deref())?;

    let result = async_main(args).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn async_main(args: Args) -> Result<()> {
    let registry = ProcRegistry::new(&args.devices_file, &args.input_dir);

    if args.list_devices {
        let keymaps = KeyMapStore::load(&args.maps).await?;
        let devices = registry
            .list_all_devices()
            .await
            .context("Failed to list input devices")?;
        sniffer::list_devices_formatted(&devices, &keymaps);
        return Ok(());
    }

    if let Some(path) = &args.sniff {
        let keymaps = KeyMapStore::load(&args.maps).await?;
        return sniffer::run_cli_sniffer(path, &registry, &keymaps).await;
    }

    info!("Starting keyboard-midi v{}...", env!("CARGO_PKG_VERSION"));
    info!("Key maps: {}", args.maps.display());

    run_app(args, registry).await
}

async fn run_app(args: Args, registry: ProcRegistry) -> Result<()> {
    let keymaps = KeyMapStore::load(&args.maps).await?;
    let mut keymap_watcher = match KeyMapWatcher::new(args.maps.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Key map hot-reload disabled: {:#}", e);
            None
        }
    };

    let (dispatch_tx, dispatcher) = dispatch::channel(args.queue_capacity);
    let (jack, mut backend_down) =
        JackSink::open(&args.client_name, dispatcher).context("Failed to start JACK client")?;
    let jack = Arc::new(jack);
    let sink: Arc<dyn PortSink> = jack.clone();

    let timeout = Duration::from_millis(args.shutdown_timeout_ms);
    let session = Arc::new(Session::new(
        sink,
        dispatch_tx,
        keymaps,
        SessionTimeouts {
            close: timeout,
            drain: timeout,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = DeviceMonitor::new(
        registry,
        session.clone(),
        MonitorSettings {
            poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
            open_attempts: args.open_attempts,
            open_backoff: Duration::from_millis(args.open_backoff_ms),
            ..MonitorSettings::default()
        },
    );
    let monitor_rx = shutdown_rx.clone();
    let mut monitor_task = tokio::spawn(async move { monitor.run(monitor_rx).await });
    let mut monitor_done = false;

    let reporter = (args.status_interval_secs > 0).then(|| {
        let format = if args.status_json {
            StatusFormat::Json
        } else {
            StatusFormat::Text
        };
        tokio::spawn(status::run_reporter(
            session.clone(),
            Duration::from_secs(args.status_interval_secs),
            format,
            shutdown_rx.clone(),
        ))
    });

    info!("Ready, waiting for keyboards");

    let signals = shutdown_signal();
    tokio::pin!(signals);

    // Main event loop
    let outcome: Result<()> = loop {
        tokio::select! {
            signal = &mut signals => {
                match signal {
                    Ok(name) => info!("{} received, shutting down", name),
                    Err(e) => warn!("Signal handling failed ({:#}), shutting down", e),
                }
                break Ok(());
            }

            reason = backend_down.recv() => {
                warn!("JACK server went away ({}), shutting down", reason.unwrap_or_default());
                break Ok(());
            }

            result = &mut monitor_task => {
                monitor_done = true;
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("Device monitor stopped")),
                    Err(e) => Err(anyhow::anyhow!("Device monitor task failed: {}", e)),
                };
            }

            Some(store) = next_keymaps(&mut keymap_watcher) => {
                session.replace_keymaps(store);
            }
        }
    };

    // Cleanup
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    if !monitor_done {
        let _ = monitor_task.await;
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    if let Err(e) = session.close_all().await {
        warn!("Device teardown incomplete: {}", e);
    }
    jack.close();
    info!("keyboard-midi shutdown complete");

    outcome
}

async fn next_keymaps(watcher: &mut Option<KeyMapWatcher>) -> Option<KeyMapStore> {
    match watcher {
        Some(watcher) => watcher.next_store().await,
        None => std::future::pending().await,
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

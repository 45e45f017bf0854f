use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use framecast::config::{ConfigStore, EndpointConfig};
use framecast::state::AppState;
use framecast::video::enumerate_devices;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// framecast command line arguments
#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(version, about = "Capture video sources and republish them as MJPEG over HTTP", long_about = None)]
struct CliArgs {
    /// JSON configuration file (default: $FRAMECAST_CONFIG or ./framecast.json)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Scan for capture devices at startup and serve each one that opens at /video<N>
    #[arg(long)]
    scan: bool,

    /// Stop the scan at the first index that cannot deliver a frame
    #[arg(long, requires = "scan")]
    probe: bool,

    /// Print the V4L2 devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Serve SOURCE (device index, file path or URL) at PATH
    #[arg(short = 'e', long = "endpoint", value_name = "PATH=SOURCE")]
    endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    if args.list_devices {
        return list_devices();
    }

    tracing::info!("Starting framecast v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(get_config_path);
    tracing::info!("Config file: {}", config_path.display());
    let file_store = ConfigStore::new(&config_path).await?;

    // CLI overrides apply to this run only and are not written back
    let mut config = (*file_store.get()).clone();
    if let Some(address) = args.address {
        config.server.bind = address;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.scan {
        config.scan.on_startup = true;
        config.scan.probe = args.probe;
    }
    for raw in &args.endpoints {
        let endpoint = EndpointConfig::parse_mapping(raw)?;
        config
            .endpoints
            .retain(|e| !e.path.trim().eq_ignore_ascii_case(endpoint.path.trim()));
        config.endpoints.push(endpoint);
    }
    config.validate()?;

    let state = AppState::new(ConfigStore::with_config(&config_path, config));

    match state.start().await {
        Ok(Some(addr)) => {
            tracing::info!("Serving {} endpoint(s) on http://{}", state.server.endpoints().len(), addr);
            for path in state.server.endpoints() {
                tracing::info!("  http://{}{}", addr, path);
            }
        }
        Ok(None) => tracing::info!("Capturing without HTTP server"),
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            state.shutdown().await;
            return Err(e.into());
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");

    state.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = enumerate_devices()?;
    if devices.is_empty() {
        println!("No video capture devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "{} [{}] {} ({}, {})",
            device.path.display(),
            device.source_id(),
            device.card,
            device.driver,
            device.bus_info
        );
        for format in device.formats.iter().filter(|f| f.supported) {
            println!("    {} - {}", format.fourcc, format.description);
        }
    }
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "framecast=error",
        LogLevel::Warn => "framecast=warn",
        LogLevel::Info => "framecast=info",
        LogLevel::Verbose => "framecast=debug,reqwest=info",
        LogLevel::Debug => "framecast=debug,reqwest=debug",
        LogLevel::Trace => "framecast=trace,reqwest=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FRAMECAST_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("framecast.json")
}

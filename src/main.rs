use clap::{Parser, ValueEnum};
use inverter2http::{
    config::{Overrides, TransportKind},
    registers::validate_catalogue,
    ConnectionManager, Dispatcher, ModbusConnector, PollingPolicy, PollingScheduler, ServiceConfig, TelemetryReader,
};
use log::{error, info, warn};
use std::{path::PathBuf, process::ExitCode};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConnectionType {
    /// USB/RS485
    Rtu,
    /// Network
    Tcp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "inverter2http", version, about = "Huawei SUN2000 inverter telemetry service")]
struct Args {
    /// Config file, defaults to config/inverter2http.yaml or inverter2http.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 't', long, value_enum)]
    connection_type: Option<ConnectionType>,

    /// Serial port device
    #[arg(short = 'p', long)]
    serial_port: Option<String>,

    #[arg(short, long)]
    baudrate: Option<u32>,

    /// Modbus slave id
    #[arg(short, long)]
    slave_id: Option<u8>,

    /// TCP host, enables the network transport
    #[arg(long)]
    tcp_host: Option<String>,

    #[arg(long)]
    tcp_port: Option<u16>,

    /// Polling interval in seconds
    #[arg(short = 'i', long)]
    poll_interval: Option<u64>,

    /// Collector base url
    #[arg(short = 'u', long)]
    backend_url: Option<String>,

    /// Collector request timeout in seconds
    #[arg(long)]
    backend_timeout: Option<u64>,

    #[arg(short, long, value_enum, ignore_case = true)]
    log_level: Option<LogLevel>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            transport: self.connection_type.map(|t| match t {
                ConnectionType::Rtu => TransportKind::Serial,
                ConnectionType::Tcp => TransportKind::Network,
            }),
            serial_port: self.serial_port.clone(),
            baudrate: self.baudrate,
            slave_id: self.slave_id,
            tcp_host: self.tcp_host.clone(),
            tcp_port: self.tcp_port,
            poll_interval: self.poll_interval,
            backend_url: self.backend_url.clone(),
            backend_timeout: self.backend_timeout,
            log_level: self.log_level.map(|l| l.as_str().to_string()),
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = term.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match ServiceConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("CRITICAL: Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply(args.overrides());

    // Initialize logging
    let default_filter = std::env::var("I2H_LOG_LEVEL").unwrap_or(config.logging.filter().unwrap_or("info").to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    if args.show_config {
        print!("{}", config.describe());
        return ExitCode::SUCCESS;
    }

    let transport = match config.validate() {
        Ok(t) => t,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    validate_catalogue();

    let dispatcher = match Dispatcher::new(&config.collector) {
        Ok(d) => d,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Huawei SUN2000 inverter service starting");
    if dispatcher.ping().await {
        info!("Collector is reachable at {}", config.collector.base_url);
    } else {
        warn!("Collector not reachable at {}", config.collector.base_url);
        warn!("Service will continue but data may not be sent");
    }

    let (tx, rx) = Dispatcher::channel();
    let dispatch_task = tokio::spawn(async move {
        dispatcher.start_thread(rx).await;
    });

    let reader = TelemetryReader::new(transport.kind());
    let connection = ConnectionManager::new(Box::new(ModbusConnector), transport, config.device.expected_model.clone());
    let scheduler = PollingScheduler::new(connection, reader, tx, PollingPolicy::from(&config.polling));

    let shutdown = CancellationToken::new();
    let poll_task = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_signal().await;
    info!("Shutting down...");
    shutdown.cancel();

    /* The scheduler owns the only sender, once it is gone the dispatcher drains and exits */
    if let Err(e) = poll_task.await {
        error!("Polling task failed: {e}");
    }
    if let Err(e) = dispatch_task.await {
        error!("Dispatch task failed: {e}");
    }

    info!("Service stopped");
    ExitCode::SUCCESS
}

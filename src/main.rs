use clap::{Parser, Subcommand, ValueEnum};
use pktring::capture::AfPacketFactory;
use pktring::config::{self, ConfigLock, Mode};
use pktring::engine::{
    cpu_count, fanout_group_id, plan_queues, EngineGroup, EngineSettings, LogSink, Orchestrator,
    QueueReport, StaticPayload, TransmitSettings, Workload,
};
use pktring::telemetry::{init_logging, LogConfig, MetricsRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pktring")]
#[command(about = "Zero-copy packet capture and transmission over AF_PACKET rings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Capture from or transmit on an interface
    Run(RunArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml; defaults only when missing
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum CliMode {
    Receive,
    Send,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Network interface, e.g. eth0
    interface: String,

    /// RECEIVE or SEND
    #[arg(value_enum, ignore_case = true)]
    mode: CliMode,

    /// config.toml or a generated config.lock
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of queues (default: one per logical CPU)
    #[arg(short, long)]
    queues: Option<usize>,

    #[arg(long)]
    batch_size: Option<u64>,

    #[arg(long)]
    frame_size: Option<u32>,

    #[arg(long)]
    block_size: Option<u32>,

    #[arg(long)]
    block_count: Option<u32>,

    #[arg(long)]
    poll_timeout_ms: Option<u64>,

    /// Frames to send per queue before stopping
    #[arg(long)]
    count: Option<u64>,

    /// Raw Ethernet frame to send instead of the built-in TCP SYN
    #[arg(long)]
    payload: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => {
            init_logging(None);
            match action {
                ConfigAction::Generate {
                    config: config_path,
                    output,
                } => cmd_config_generate(&config_path, &output),
                ConfigAction::Validate {
                    config: config_path,
                } => cmd_config_validate(&config_path),
            }
        }
        Commands::Run(args) => cmd_run(args),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_config_generate(config_path: &Path, output: &Path) -> Result<(), String> {
    let config = if config_path.exists() {
        println!("Loading {}...", config_path.display());
        config::load(config_path).map_err(|e| e.to_string())?
    } else {
        println!("{} not found, using defaults", config_path.display());
        config::Config::default()
    };

    let lock = config::generate_lock(&config);
    let result = config::validate(&lock);
    result.print_diagnostics();
    if result.has_errors() {
        return Err("Validation failed".to_string());
    }

    let content = config::render_lock(&lock).map_err(|e| e.to_string())?;
    std::fs::write(output, content)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;

    println!("Generated {}", output.display());
    Ok(())
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    println!("Validating {}...", config_path.display());

    let config = config::load(config_path).map_err(|e| e.to_string())?;
    let result = config::validate(&config::generate_lock(&config));
    result.print_diagnostics();

    if result.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("Configuration is valid");
        Ok(())
    }
}

/// Reads config.toml or config.lock, whichever the file turns out to be.
fn load_settings(path: Option<&Path>) -> Result<ConfigLock, String> {
    let Some(path) = path else {
        return Ok(config::generate_lock(&config::Config::default()));
    };
    match config::load_lock(path) {
        Ok(lock) => Ok(lock),
        Err(_) => config::load(path)
            .map(|c| config::generate_lock(&c))
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e)),
    }
}

fn apply_overrides(lock: &mut ConfigLock, args: &RunArgs) {
    lock.engine.interface = args.interface.clone();
    lock.engine.mode = match args.mode {
        CliMode::Receive => Mode::Receive,
        CliMode::Send => Mode::Send,
    };
    if let Some(queues) = args.queues {
        lock.engine.queues = queues;
    }
    if let Some(batch_size) = args.batch_size {
        lock.transmit.batch_size = batch_size;
    }
    if let Some(frame_size) = args.frame_size {
        lock.ring.frame_size = frame_size;
    }
    if let Some(block_size) = args.block_size {
        lock.ring.block_size = block_size;
    }
    if let Some(block_count) = args.block_count {
        lock.ring.block_count = block_count;
    }
    if let Some(timeout) = args.poll_timeout_ms {
        lock.engine.poll_timeout_ms = timeout;
    }
    if let Some(count) = args.count {
        lock.transmit.packet_limit = count;
    }
    if let Some(payload) = &args.payload {
        lock.transmit.payload_file = payload.display().to_string();
    }
}

fn cmd_run(args: RunArgs) -> Result<(), String> {
    let mut lock = load_settings(args.config.as_deref())?;
    apply_overrides(&mut lock, &args);

    // RUST_LOG still wins over the [logging] section.
    init_logging(Some(&LogConfig::from(&lock.logging)));

    let result = config::validate(&lock);
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if result.has_errors() {
        result.print_diagnostics();
        return Err("Invalid configuration".to_string());
    }

    let geometry = lock.ring.geometry().map_err(|e| e.to_string())?;
    let payload = match lock.payload_file() {
        Some(path) => StaticPayload::from_file(path).map_err(|e| e.to_string())?,
        None => StaticPayload::tcp_syn(),
    };

    let fanout_group = fanout_group_id();
    let plans = plan_queues(lock.queues(), cpu_count(), lock.engine.max_queues, fanout_group);
    info!(
        "{} on {}: {} queues, fanout group {}, {} x {} byte blocks of {} byte frames",
        match lock.engine.mode {
            Mode::Receive => "Capturing",
            Mode::Send => "Transmitting",
        },
        lock.engine.interface,
        plans.len(),
        fanout_group,
        geometry.block_count(),
        geometry.block_size(),
        geometry.frame_size()
    );

    let poll_timeout = Duration::from_millis(lock.engine.poll_timeout_ms);
    let settings = EngineSettings {
        poll_timeout,
        transmit: TransmitSettings {
            batch_size: lock.transmit.batch_size,
            poll_timeout,
            packet_limit: lock.packet_limit(),
            flush_retries: lock.transmit.flush_retries,
            flush_retry_delay: Duration::from_millis(lock.transmit.flush_retry_delay_ms),
        },
        setup_policy: lock.engine.on_setup_failure,
    };

    let mut factory = AfPacketFactory {
        ifname: lock.engine.interface.clone(),
        protocol: lock.engine.protocol,
        promiscuous: lock.engine.promiscuous,
        fanout: lock.engine.fanout,
        geometry,
        map_both: lock.ring.map_both,
        lock_pages: lock.ring.lock_pages,
    };

    let metrics = Arc::new(MetricsRegistry::new());
    let orchestrator = Orchestrator::new(settings, metrics.clone());
    let mode = lock.engine.mode;
    let mut group = orchestrator
        .start(&plans, &mut factory, |plan| match mode {
            Mode::Receive => Workload::Capture(Box::new(LogSink::new(plan.queue))),
            Mode::Send => Workload::Transmit(Box::new(payload.clone())),
        })
        .map_err(|e| format!("{}. Run with root privileges (CAP_NET_RAW).", e))?;

    wait_for_shutdown(&mut group)?;

    let reports = group.join();
    print_reports(&reports, &metrics);
    Ok(())
}

/// Blocks until Ctrl-C or until every worker has ended on its own.
fn wait_for_shutdown(group: &mut EngineGroup) -> Result<(), String> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    let interrupted = rt.block_on(async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received, stopping queues..."),
                    Err(e) => warn!("Signal handler failed ({}), stopping queues...", e),
                }
                true
            }
            _ = group.wait_all_exited() => {
                info!("All queues finished");
                false
            }
        }
    });
    if interrupted {
        group.stop_all();
    }
    Ok(())
}

fn print_reports(reports: &[QueueReport], metrics: &MetricsRegistry) {
    for report in reports {
        info!(
            "queue {} (cpu {}): rx {} pkts / {} bytes, tx {} pkts / {} bytes, {} flushes, {} dropped, {} lost, {} corrupt blocks",
            report.queue,
            report.cpu,
            report.rx_packets,
            report.rx_bytes,
            report.tx_packets,
            report.tx_bytes,
            report.flushes,
            report.tx_dropped,
            report.lost,
            report.corrupt_blocks
        );
        if let Some(error) = &report.error {
            warn!("queue {} ended with error: {}", report.queue, error);
        }
    }

    let totals = metrics.totals();
    let summary: Vec<String> = totals
        .iter()
        .filter(|(_, value)| *value > 0)
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    info!("Totals: {}", summary.join(" "));

    for (name, value) in metrics.export() {
        debug!("{} = {}", name, value);
    }
}

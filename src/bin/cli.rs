//! Tracewait CLI - Command-line interface
//!
//! Captures device traces over a serial port and waits for patterns, for use
//! from shell scripts and CI jobs.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracewait_core::cli::{format_result, pipe, print_exit_codes, StdinLineReader};
use tracewait_core::core::transport::list_ports;
use tracewait_core::{
    AppConfig, CaptureSession, CliResult, CollectionPolicy, EventQuery, ExitCodes, ResponseFormat, SerialConfig,
    SerialFlowControl, SerialParity, SerialTransport, TraceQuery, WaitOptions,
};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

impl From<OutputFormat> for pipe::OutputFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => Self::Text,
            OutputFormat::Json => Self::Json,
        }
    }
}

/// Which lines a wait reports
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Collect {
    /// Only the last line examined
    Last,
    /// Lines that matched a pattern
    Matching,
    /// Every line examined
    All,
}

impl From<Collect> for CollectionPolicy {
    fn from(collect: Collect) -> Self {
        match collect {
            Collect::Last => Self::LastOnly,
            Collect::Matching => Self::Matching,
            Collect::All => Self::All,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Flow {
    None,
    Hw,
    Sw,
}

/// Tracewait CLI
#[derive(Parser, Debug)]
#[command(
    name = "tracewait",
    version,
    about = "Capture device traces and wait for expected output",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, env = "TRACEWAIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SerialArgs {
    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Parity
    #[arg(long, value_enum)]
    parity: Option<Parity>,

    /// Flow control
    #[arg(long, value_enum)]
    flow: Option<Flow>,
}

impl SerialArgs {
    /// Command line values over the config file's `[serial]` section
    fn resolve(&self, config: &AppConfig) -> SerialConfig {
        let mut serial = config.serial.clone().unwrap_or_default();
        if let Some(port) = &self.port {
            serial.port.clone_from(port);
        }
        if let Some(baud) = self.baud {
            serial.baud_rate = baud;
        }
        if let Some(parity) = self.parity {
            serial.parity = match parity {
                Parity::None => SerialParity::None,
                Parity::Odd => SerialParity::Odd,
                Parity::Even => SerialParity::Even,
            };
        }
        if let Some(flow) = self.flow {
            serial.flow_control = match flow {
                Flow::None => SerialFlowControl::None,
                Flow::Hw => SerialFlowControl::Hardware,
                Flow::Sw => SerialFlowControl::Software,
            };
        }
        serial
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    Ports {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Wait for patterns or events in the device output
    Wait {
        #[command(flatten)]
        serial: SerialArgs,

        /// Pattern that must appear (repeatable)
        #[arg(short, long)]
        expect: Vec<String>,

        /// Pattern that must not appear (repeatable)
        #[arg(short, long)]
        avoid: Vec<String>,

        /// Event from the config's event map that must appear (repeatable)
        #[arg(long)]
        event: Vec<String>,

        /// Event that must not appear (repeatable)
        #[arg(long)]
        avoid_event: Vec<String>,

        /// Command to send once capture is running (repeatable)
        #[arg(short, long)]
        send: Vec<String>,

        /// Wait budget in milliseconds (0 waits forever)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Succeed on the first required match
        #[arg(long)]
        first: bool,

        /// Discard output captured before the commands are sent
        #[arg(long)]
        no_backlog: bool,

        /// Which lines to report
        #[arg(long, value_enum)]
        collect: Option<Collect>,

        /// Report structured records instead of raw lines
        #[arg(long)]
        records: bool,
    },

    /// Stream device output, forwarding stdin lines as commands
    Monitor {
        #[command(flatten)]
        serial: SerialArgs,

        /// Exit after timeout (seconds)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show exit codes
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Ports { detailed } => match list(&cli, *detailed) {
            Ok(()) => CliResult::success(),
            Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
        },
        Commands::Wait { .. } => wait(&cli).await,
        Commands::Monitor { serial, timeout } => monitor(&cli, serial, *timeout),
        Commands::ExitCodes => {
            print_exit_codes();
            CliResult::success()
        }
    };

    if let Some(msg) = result.message() {
        if result.is_success() {
            if !cli.quiet {
                eprintln!("{msg}");
            }
        } else {
            eprintln!("error: {msg}");
        }
    }

    result.to_exit_code()
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig, CliResult> {
    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    loaded.map_err(CliResult::from)
}

fn list(cli: &Cli, detailed: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {} [{:?}]", port.port_name, port.port_type);
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(())
}

fn open_session(config: &AppConfig, serial: &SerialArgs) -> Result<CaptureSession, CliResult> {
    let serial = serial.resolve(config);
    let session = CaptureSession::new(SerialTransport::new(serial), config.capture.clone());
    session.set_event_map(config.event_pairs()).map_err(CliResult::from)?;
    session.start_capture().map_err(CliResult::from)?;
    Ok(session)
}

async fn wait(cli: &Cli) -> CliResult {
    let Commands::Wait {
        serial,
        expect,
        avoid,
        event,
        avoid_event,
        send,
        timeout,
        first,
        no_backlog,
        collect,
        records,
    } = &cli.command
    else {
        return CliResult::error(ExitCodes::INTERNAL_ERROR, "not a wait command");
    };

    let by_event = !event.is_empty() || !avoid_event.is_empty();
    if by_event && (!expect.is_empty() || !avoid.is_empty()) {
        return CliResult::error(ExitCodes::INVALID_ARGS, "patterns and events cannot be mixed");
    }

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let mut options = WaitOptions {
        return_on_first_match: *first,
        ..config.wait.clone()
    };
    if let Some(timeout) = timeout {
        options.timeout_ms = *timeout;
    }
    if let Some(collect) = collect {
        options.collection = (*collect).into();
    }
    if *records {
        options.format = ResponseFormat::Processed;
    }

    let session = match open_session(&config, serial) {
        Ok(session) => session,
        Err(result) => return result,
    };

    if *no_backlog {
        let dropped = session.dump_traces();
        tracing::debug!("Discarded {} queued traces", dropped);
    }
    for command in send {
        session.send_command(command.as_str());
    }

    let outcome = if by_event {
        let query = EventQuery::new()
            .require_all(event.iter().cloned())
            .avoid_all(avoid_event.iter().cloned())
            .with_options(options);
        session.wait_for_event_async(query).await
    } else {
        let query = TraceQuery::new()
            .require_all(expect.iter().cloned())
            .avoid_all(avoid.iter().cloned())
            .with_options(options);
        session.wait_for_trace_async(query).await
    };

    let stopped = session.stop_capture();

    let result = match outcome {
        Ok(result) => result,
        Err(e) => return CliResult::from(e),
    };

    print!("{}", format_result(&result, cli.format.into()));

    if let Err(e) = stopped {
        return CliResult::from(e);
    }

    if result.success {
        CliResult::success()
    } else {
        CliResult::pattern_not_found(format!("wait failed on {}", session.describe()))
    }
}

fn monitor(cli: &Cli, serial: &SerialArgs, timeout: Option<u64>) -> CliResult {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        return CliResult::error(ExitCodes::ERROR, e.to_string());
    }

    let session = match open_session(&config, serial) {
        Ok(session) => session,
        Err(result) => return result,
    };

    if !cli.quiet {
        eprintln!("Capturing {}. Press Ctrl+C to exit.", session.describe());
    }

    let deadline = timeout.map(|t| Instant::now() + Duration::from_secs(t));
    let stdin = StdinLineReader::new();
    let tick = Duration::from_millis(config.capture.poll_interval_ms.max(1));

    while running.load(Ordering::SeqCst) && session.is_capturing() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        while let Some(command) = stdin.try_recv_line() {
            session.send_command(command);
        }

        if let Some(line) = session.next_trace(tick) {
            let rendered = match cli.format {
                OutputFormat::Text => line,
                OutputFormat::Json => serde_json::json!({ "line": line }).to_string(),
            };
            if let Err(e) = pipe::write_line(&rendered) {
                tracing::warn!("stdout closed: {}", e);
                break;
            }
        }
    }

    let lost = !session.is_capturing();

    if let Err(e) = session.stop_capture() {
        return CliResult::from(e);
    }

    if lost {
        CliResult::error(ExitCodes::CONNECTION_FAILED, "capture stopped unexpectedly")
    } else {
        CliResult::success_with_message("Capture stopped.")
    }
}

//! CLI Entry Point for cn0503
//!
//! Drives a CN0503 board from the command line:
//! - Listing serial ports
//! - Reading the device configuration
//! - Staging, programming and saving configuration files
//! - Collecting ratio data, optionally to CSV
//! - Sending raw commands
//!
//! # Usage
//!
//! ```bash
//! cn0503 ports
//! cn0503 --port /dev/ttyUSB0 config
//! cn0503 --port /dev/ttyUSB0 load board.cfg --program
//! cn0503 --port /dev/ttyUSB0 stream --samples 50 --mode ARAT --csv run.csv
//! cn0503 --port /dev/ttyUSB0 send "REG? 10B"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cn0503::config::{Settings, DEFAULT_CONFIG_PATH};
use cn0503::model::device::Mode;
use cn0503::tracing_init::{self, OutputFormat, TracingConfig};
use cn0503::transport::{SerialConnector, SystemSerial};
use cn0503::Session;
use std::fs::File;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// How long to let replies arrive before printing the model.
const REPLY_WINDOW: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "cn0503")]
#[command(about = "Host control for the CN0503 optical liquid measurement board", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    settings: PathBuf,

    /// Serial port, overrides `serial.port`
    #[arg(long, short, global = true)]
    port: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports present on this host
    Ports,

    /// Read and print the device configuration
    Config {
        /// Write the default ratio expressions first
        #[arg(long)]
        apply_default: bool,
    },

    /// Stage a configuration file into the flash buffer
    Load {
        /// .cfg, .dcfg or .lcfg file
        file: PathBuf,

        /// Program flash afterwards
        #[arg(long)]
        program: bool,
    },

    /// Dump flash and save it as a configuration file
    Save { file: PathBuf },

    /// Print the flash contents
    Dump {
        /// Quiet time that ends the dump
        #[arg(long, default_value_t = 1000)]
        settle_ms: u64,

        #[arg(long, default_value_t = 30)]
        timeout_s: u64,
    },

    /// Collect ratio samples
    Stream {
        #[arg(long)]
        samples: usize,

        /// CODE, ARAT, RRAT, INS1 or INS2
        #[arg(long)]
        mode: Option<String>,

        /// Write the samples to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long, default_value_t = 60)]
        timeout_s: u64,
    },

    /// Send a command as typed
    Send {
        #[arg(trailing_var_arg = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Print the effective settings as TOML
    Settings,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    let tracing_config = TracingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Settings => print_settings(&settings),
        command => {
            let session = open_session(settings, cli.port)?;
            let result = run(&session, command);
            print_diagnostics(&session);
            session.disconnect();
            result
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = SystemSerial.scan().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn print_settings(settings: &Settings) -> Result<()> {
    let text = toml::to_string_pretty(settings).context("Failed to render settings")?;
    print!("{text}");
    Ok(())
}

fn open_session(settings: Settings, port: Option<String>) -> Result<Session> {
    let port = port
        .or_else(|| settings.serial.port.clone())
        .context("No serial port given. Use --port or set serial.port")?;
    let session = Session::new(settings)?;
    session
        .connect(&port)
        .with_context(|| format!("Failed to connect to {port}"))?;
    Ok(session)
}

fn run(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Config { apply_default } => {
            session.get_config(apply_default)?;
            thread::sleep(REPLY_WINDOW);
            print_model(session);
        }
        Commands::Load { file, program } => {
            let count = session
                .load_config(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            println!("Staged {count} commands from {}", file.display());
            if program {
                session.program_flash()?;
                println!("Flash programmed");
            }
        }
        Commands::Save { file } => {
            session.flash_dump(Duration::from_secs(1), Duration::from_secs(30))?;
            session
                .save_config(&file)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!("Saved configuration to {}", file.display());
        }
        Commands::Dump {
            settle_ms,
            timeout_s,
        } => {
            let lines = session.flash_dump(
                Duration::from_millis(settle_ms),
                Duration::from_secs(timeout_s),
            )?;
            for line in lines {
                println!("{line}");
            }
        }
        Commands::Stream {
            samples,
            mode,
            csv,
            timeout_s,
        } => {
            if let Some(mode) = mode {
                let mode: Mode = mode.parse()?;
                session.set_mode(mode)?;
            }
            let columns = session.read_data(samples, Duration::from_secs(timeout_s))?;
            for (i, column) in columns.iter().enumerate() {
                let mean = cn0503::calibration::mean(column).unwrap_or(f64::NAN);
                println!("Ratio {}: {} samples, mean {mean:.6}", i + 1, column.len());
            }
            if let Some(path) = csv {
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                session.stream_snapshot().write_csv(file)?;
                println!("Samples written to {}", path.display());
            }
        }
        Commands::Send { command } => {
            session.send_raw(&command.join(" "))?;
            thread::sleep(REPLY_WINDOW);
        }
        Commands::Ports | Commands::Settings => {}
    }
    Ok(())
}

fn print_model(session: &Session) {
    let model = session.model();
    println!("Mode: {}", model.mode().as_str());
    println!("ODR: {} Hz", model.odr());
    println!("State: {:?}", model.state);
    for channel in &model.channels {
        println!(
            "Channel {} ({}, {}): ARAT {} RATB {} LPF {} Hz SUBE {}",
            channel.number,
            channel.name,
            channel.measurement_type,
            channel.ratio_expression,
            channel.baseline_ratio,
            channel.lpf_cutoff(),
            channel.subtract_enabled
        );
        println!("    INS1 {:?}", channel.ins1_polynomial);
        println!("    INS2 {:?}", channel.ins2_polynomial);
    }
}

fn print_diagnostics(session: &Session) {
    let errors = session.diagnostics().errors();
    if !errors.is_empty() {
        eprintln!("{} problem(s) reported:", errors.len());
    }
    for entry in errors {
        eprintln!("  {} {}", entry.timestamp.format("%H:%M:%S%.3f"), entry.message);
    }
}

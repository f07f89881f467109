use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use pm8121::config::Settings;
use pm8121::transport::available_ports;
use pm8121::{PowerMaster, SerialTransport, Simulator};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "zif_cli", version, about = "PowerMaster-8121 ZIF socket tool")]
struct Cli {
    /// JSON settings file
    #[arg(short, long, env = "ZIF_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long, env = "ZIF_PORT")]
    port: Option<String>,

    #[arg(short, long)]
    baud_rate: Option<u32>,

    /// Per-byte read timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Wiring file replacing the builtin table
    #[arg(short, long)]
    wiring: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Firmware version
    Version,
    /// Serial number
    Serial,
    /// Active, meter and error flags
    Status,
    /// Switch the socket on or off
    Activate {
        #[arg(value_enum)]
        state: OnOff,
    },
    /// Configure the relays for a meter
    SetMeter { meter_form: String, service_type: String },
    /// Print the wiring table
    Wiring,
    /// Answer as a simulated socket on the serial port
    Simulate {
        #[arg(long, default_value_t = 27370)]
        serial: u16,
        /// Report a meter as present
        #[arg(long)]
        meter: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnOff {
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{e:#}");
        eprintln!("[ERROR] {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(port) = &cli.port {
        settings.port = Some(port.clone());
    }
    if let Some(baud_rate) = cli.baud_rate {
        settings.baud_rate = baud_rate;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        settings.timeout_ms = timeout_ms;
    }
    if let Some(wiring) = &cli.wiring {
        settings.wiring = Some(wiring.clone());
    }
    Ok(settings)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = settings(&cli)?;

    match cli.command {
        Command::Ports => {
            let ports = available_ports()?;
            if ports.is_empty() {
                bail!("no serial ports found");
            }
            for (i, port) in ports.iter().enumerate() {
                println!("  {}: {}", i, port);
            }
        }
        Command::Wiring => {
            let table = settings.wiring_table()?;
            for (key, config) in table.iter() {
                println!(
                    "{:<6} {:<12} {}",
                    key.meter_form,
                    key.service_type,
                    hex::encode_upper(config.values())
                );
            }
        }
        Command::Simulate { serial, meter } => {
            let mut simulator = Simulator::new(serial);
            simulator.meter_present = meter;
            run_simulator(&settings, &mut simulator)?;
        }
        Command::Version => println!("{}", connect(&settings)?.get_version()?),
        Command::Serial => println!("{}", connect(&settings)?.get_serial()?),
        Command::Status => {
            let driver = connect(&settings)?;
            println!("active:    {}", driver.get_active()?);
            println!("has meter: {}", driver.get_has_meter()?);
            println!("has error: {}", driver.get_has_error()?);
        }
        Command::Activate { state } => {
            connect(&settings)?.set_active(matches!(state, OnOff::On))?;
            println!("OK");
        }
        Command::SetMeter { meter_form, service_type } => {
            connect(&settings)?
                .set_meter(&meter_form, &service_type)
                .with_context(|| format!("configuring {meter_form}/{service_type}"))?;
            println!("OK");
        }
    }
    Ok(())
}

fn connect(settings: &Settings) -> anyhow::Result<PowerMaster> {
    let name = settings.port_name()?;
    let transport = SerialTransport::open(name, settings.baud_rate, settings.timeout())?;
    let wiring = settings.wiring_table()?;
    Ok(PowerMaster::new(Arc::new(transport)).with_wiring(wiring))
}

// Answers frames arriving on the serial port until the process is stopped.
fn run_simulator(settings: &Settings, simulator: &mut Simulator) -> anyhow::Result<()> {
    let name = settings.port_name()?;
    let mut port = serialport::new(name, settings.baud_rate)
        .timeout(settings.timeout())
        .open()
        .with_context(|| format!("failed to open port '{name}'"))?;

    info!(
        port = name,
        baud_rate = settings.baud_rate,
        serial = simulator.serial,
        "simulating socket"
    );
    println!("Listening on {} at {} baud. Press Ctrl+C to exit.", name, settings.baud_rate);

    let mut serial_buf: Vec<u8> = vec![0; 128];
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) => {
                for reply in simulator.process_bytes(&serial_buf[..bytes_read]) {
                    println!("< {}", hex::encode_upper(&reply));
                    if let Err(e) = port.write_all(&reply) {
                        error!("failed to write to serial port: {e}");
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => error!("serial port error: {e}"),
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tof_core::firmware::encode_image;
use tof_core::session::format_register_dump;
use tof_core::{
    CaptureMode, DeviceSession, DirectorySource, FirmwareSource, FrameKind, IoMode, MemorySource,
    SessionConfig, SimulatedSensor, TimingConfig, TracingObserver,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Time-of-flight sensor session tool", long_about = None)]
struct Args {
    /// Session configuration (TOML). Defaults suit the simulated sensor.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding firmware candidates. A built-in image is used
    /// when omitted.
    #[arg(long)]
    firmware_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision firmware, capture and print frames
    Demo {
        /// Number of frames to print
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Service the device from a poller instead of interrupts
        #[arg(long)]
        polled: bool,
    },
    /// Run factory calibration and print the blob
    Calibrate,
    /// Print the running application version
    Version,
    /// Dump all registers
    Dump,
    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::InitConfig { path } = &args.command {
        SessionConfig::default().save_to_file(path)?;
        info!(path = %path.display(), "Configuration written");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig {
            timing: TimingConfig::for_simulation(),
            ..SessionConfig::default()
        },
    };
    config.provision_on_boot = false;
    if let Command::Demo { polled: true, .. } = args.command {
        config.io_mode = IoMode::Polled { period_us: 1000 };
    }

    let firmware = firmware_source(&args, &config);
    let sim = SimulatedSensor::default();
    let session = DeviceSession::bring_up(sim.clone(), config, firmware, Arc::new(TracingObserver))?;

    match args.command {
        Command::Demo { frames, .. } => demo(&session, &sim, frames)?,
        Command::Calibrate => {
            session.request_firmware()?;
            let result = session.run_factory_calibration()?;
            if result.data.is_empty() {
                warn!(crosstalk = result.crosstalk, "No usable calibration");
            }
            println!("crosstalk: {}", result.crosstalk);
            println!("calibration: {}", hex(&result.data));
        }
        Command::Version => {
            println!("{}", session.version_string()?);
            session.request_firmware()?;
            println!("{}", session.version_string()?);
        }
        Command::Dump => {
            session.request_firmware()?;
            print!("{}", format_register_dump(&session.dump_registers()?));
        }
        Command::InitConfig { .. } => {}
    }

    session.shutdown()?;
    Ok(())
}

fn firmware_source(args: &Args, config: &SessionConfig) -> Arc<dyn FirmwareSource> {
    match &args.firmware_dir {
        Some(dir) => Arc::new(DirectorySource::new(dir)),
        None => {
            let image: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
            let mut source = MemorySource::new();
            if let Some(name) = config.firmware_candidates.first() {
                source = source.with_blob(name, encode_image(0x2000_0000, &image, 16));
            }
            Arc::new(source)
        }
    }
}

fn demo(session: &DeviceSession<SimulatedSensor>, sim: &SimulatedSensor, frames: usize) -> Result<()> {
    session.request_firmware()?;
    let calibration = session.run_factory_calibration()?;
    if calibration.data.is_empty() {
        bail!("calibration produced no usable baseline");
    }
    session.start(CaptureMode::MEASURE)?;
    let poller = session.start_dispatcher()?;

    let mut printed = 0;
    let mut distance = 300u16;
    while printed < frames {
        distance = 300 + (distance + 37) % 900;
        sim.push_result(distance, 63);
        if poller.is_none() {
            session.handle_interrupt()?;
        }
        let Some(frame) = session.wait_frame(Duration::from_millis(500)) else {
            warn!("No frame within 500ms");
            thread::sleep(Duration::from_millis(10));
            continue;
        };
        match frame.kind {
            FrameKind::Results => {
                if let Some(record) = frame.result() {
                    println!(
                        "#{:3} distance {:4} mm  confidence {:2}  temp {} C",
                        record.result_number, record.distance_mm, record.reliability, record.temperature
                    );
                }
            }
            FrameKind::Diagnostic => println!("diagnostic {:02x?}", frame.payload),
            FrameKind::Error => println!("error {:?}", frame.error_report()),
        }
        printed += 1;
    }

    drop(poller);
    session.stop()?;
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

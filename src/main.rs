//! CLI entry point for camctl.
//!
//! Small operator tool over the library: discover interface boards, query
//! status, run controller setup, take single or continuous exposures and
//! read or set the array temperature.
//!
//! Every subcommand accepts `--mock` to run against the register-level
//! controller simulator instead of a PCIe board, which is useful for
//! development and for exercising a configuration before hardware is
//! attached.
//!
//! # Usage
//!
//! ```bash
//! camctl list
//! camctl --mock status
//! camctl --mock expose --exp-time 0.5 --output frame.raw
//! camctl --mock temp get
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use camctl::acquisition::{self, ContinuousOptions, ExposeEvent, ExposureOptions};
use camctl::config::Settings;
use camctl::controller::Controller;
use camctl::deinterlace::{Algorithm, Deinterlacer};
use camctl::device::sim::SimTransport;
use camctl::device::{find_devices, Fiber, PcieDevice};
use camctl::{logging, proto};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "camctl")]
#[command(about = "Camera controller access over PCIe", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "camctl.toml")]
    config: PathBuf,

    /// Run against the controller simulator instead of hardware
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List PCIe interface board device nodes
    List,

    /// Show the board status word and its named predicates
    Status,

    /// Show the board and controller ids
    Id,

    /// Run controller setup (reset, data-link test, firmware, power-on)
    Setup,

    /// Take a single exposure and write the frame to a file
    Expose {
        /// Exposure time in seconds
        #[arg(long, default_value_t = 0.1)]
        exp_time: f32,

        /// Output file for the raw 16-bit little-endian frame
        #[arg(long, default_value = "frame.raw")]
        output: PathBuf,

        /// Keep the shutter closed (dark frame)
        #[arg(long)]
        dark: bool,

        /// Deinterlace algorithm to apply (none, parallel, serial,
        /// quad_ccd, quad_ir, quad_ir_cds, hawaii_rg, sta1600)
        #[arg(long, default_value = "none")]
        deinterlace: String,

        /// Readout channel count for hawaii_rg deinterlacing
        #[arg(long, default_value_t = 0)]
        channels: u32,
    },

    /// Run continuous readout for a number of frames
    Cont {
        /// Exposure time per frame in seconds
        #[arg(long, default_value_t = 0.1)]
        exp_time: f32,

        /// Number of frames to take
        #[arg(long, default_value_t = 10)]
        frames: u32,
    },

    /// Array temperature control
    Temp {
        #[command(subcommand)]
        command: TempCommands,
    },
}

#[derive(Subcommand)]
enum TempCommands {
    /// Read the average array temperature
    Get,
    /// Set the regulation target in Celsius
    Set {
        /// Target temperature in Celsius
        celsius: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config).context("loading configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    logging::init_from_settings(&settings).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::List => list_devices(),
        Commands::Status => show_status(&settings, cli.mock),
        Commands::Id => show_ids(&settings, cli.mock),
        Commands::Setup => run_setup(&settings, cli.mock).map(|_| ()),
        Commands::Expose {
            exp_time,
            output,
            dark,
            deinterlace,
            channels,
        } => run_expose(&settings, cli.mock, exp_time, output, dark, &deinterlace, channels).await,
        Commands::Cont { exp_time, frames } => {
            run_continuous(&settings, cli.mock, exp_time, frames).await
        }
        Commands::Temp { command } => run_temp(&settings, cli.mock, command),
    }
}

fn open_device(settings: &Settings, mock: bool) -> Result<PcieDevice> {
    let mut device = if mock {
        let sim = SimTransport::new();
        sim.handle().set_noise_seed(Some(0x5EED));
        PcieDevice::with_transport(Box::new(sim))
    } else {
        open_hardware(settings)?
    };

    device.set_reply_timeout(settings.device.reply_timeout);
    device.set_log_commands(settings.device.log_commands);
    Ok(device)
}

#[cfg(feature = "pcie_hardware")]
fn open_hardware(settings: &Settings) -> Result<PcieDevice> {
    Ok(PcieDevice::open(settings.device.device_number)?)
}

#[cfg(not(feature = "pcie_hardware"))]
fn open_hardware(_settings: &Settings) -> Result<PcieDevice> {
    anyhow::bail!(
        "hardware access is not enabled. Rebuild with --features pcie_hardware, or pass --mock"
    )
}

fn open_controller(settings: &Settings, mock: bool) -> Result<Controller> {
    let device = open_device(settings, mock)?;
    let mut controller = Controller::new(device);

    if let Some(path) = &settings.temperature.constants_file {
        controller
            .load_temperature_data(path)
            .context("loading temperature constants")?;
    }

    Ok(controller)
}

fn list_devices() -> Result<()> {
    let devices = find_devices()?;
    for (i, path) in devices.iter().enumerate() {
        println!("PCIe Device {i}: {}", path.display());
    }
    Ok(())
}

fn show_status(settings: &Settings, mock: bool) -> Result<()> {
    let mut device = open_device(settings, mock)?;
    let status = device.status()?;

    println!("status word:        {status}");
    println!("  idle:             {}", status.idle());
    println!("  command sent:     {}", status.command_sent());
    println!("  reply received:   {}", status.reply_received());
    println!("  readout:          {}", status.readout());
    println!("  controller reset: {}", status.controller_reset());
    println!("  header error:     {}", status.header_error());
    println!("  read timeout:     {}", status.image_read_timeout());
    println!("  fiber A:          {}", status.fiber_a_connected());
    println!("  fiber B:          {}", status.fiber_b_connected());
    println!("  fiber 2x:         {}", status.fiber_2x_receiver());
    Ok(())
}

fn show_ids(settings: &Settings, mock: bool) -> Result<()> {
    let mut device = open_device(settings, mock)?;

    let board = device.id()?;
    println!("board id:      {} ({board:#X})", proto::word_name(board));

    let controller = device.controller_id()?;
    if controller == 0 {
        println!("controller id: none (Gen III systems do not reply)");
    } else {
        println!(
            "controller id: {} ({controller:#X})",
            proto::word_name(controller)
        );
    }

    println!("fiber A connected: {}", device.is_fiber_connected(Fiber::A)?);
    Ok(())
}

fn run_setup(settings: &Settings, mock: bool) -> Result<Controller> {
    let mut controller = open_controller(settings, mock)?;
    let options = settings.setup_options();

    println!(
        "setting up controller: reset={} tdl={} power={} image={}x{}",
        options.reset, options.test_data_link, options.power_on, options.rows, options.cols
    );

    controller.setup(&options, None)?;

    if let Some(target) = settings.temperature.target_celsius {
        println!("setting array temperature target: {target} C");
        controller.set_array_temperature(target)?;
    }

    println!("setup complete");
    Ok(controller)
}

#[allow(clippy::too_many_arguments)]
async fn run_expose(
    settings: &Settings,
    mock: bool,
    exp_time: f32,
    output: PathBuf,
    dark: bool,
    deinterlace: &str,
    channels: u32,
) -> Result<()> {
    let algorithm = Algorithm::from_name(deinterlace, channels)
        .ok_or_else(|| anyhow::anyhow!("unknown deinterlace algorithm: {deinterlace}"))?;

    let controller = run_setup(settings, mock)?;
    let rows = settings.device.rows;
    let cols = settings.device.cols;

    let options = ExposureOptions {
        exp_time_secs: exp_time,
        rows,
        cols,
        open_shutter: !dark,
    };

    println!("exposing {exp_time}s, {rows}x{cols}");
    let (mut events, guard, handle) = acquisition::start_exposure(controller, options);

    while let Some(event) = events.recv().await {
        match event {
            ExposeEvent::Elapsed(secs) => println!("  exposure: {secs:.1}s remaining"),
            ExposeEvent::PixelCount(count) => {
                println!("  readout: {count}/{} pixels", rows * cols);
            }
        }
    }

    let (_, mut frame) = handle.await??;
    guard.disarm();

    if algorithm != Algorithm::None {
        Deinterlacer::new().run(&mut frame.data, cols, rows, algorithm)?;
    }

    let bytes: Vec<u8> = frame.data.iter().flat_map(|p| p.to_le_bytes()).collect();
    std::fs::write(&output, bytes)?;
    println!(
        "wrote {}x{} frame ({} pixels) to {}",
        rows,
        cols,
        frame.data.len(),
        output.display()
    );
    Ok(())
}

async fn run_continuous(settings: &Settings, mock: bool, exp_time: f32, frames: u32) -> Result<()> {
    let controller = run_setup(settings, mock)?;
    let rows = settings.device.rows;
    let cols = settings.device.cols;

    let options = ContinuousOptions {
        exp_time_secs: exp_time,
        rows,
        cols,
        num_frames: frames,
        open_shutter: true,
    };

    println!("continuous readout: {frames} frames of {rows}x{cols} at {exp_time}s");
    let (mut frame_rx, guard, handle) = acquisition::start_continuous(controller, options);

    while let Some(frame) = frame_rx.recv().await {
        let mean: f64 =
            frame.data.iter().map(|&p| f64::from(p)).sum::<f64>() / frame.data.len() as f64;
        println!(
            "  frame {}/{frames} at {}: mean {mean:.1} ADU",
            frame.frame_number,
            frame.timestamp.format("%H:%M:%S%.3f")
        );
    }

    handle.await??;
    guard.disarm();
    println!("continuous readout complete");
    Ok(())
}

fn run_temp(settings: &Settings, mock: bool, command: TempCommands) -> Result<()> {
    let mut controller = open_controller(settings, mock)?;

    match command {
        TempCommands::Get => {
            let celsius = controller.array_temperature()?;
            let dn = controller.array_temperature_dn()?;
            println!("array temperature: {celsius:.2} C ({dn:.0} DN)");
        }
        TempCommands::Set { celsius } => {
            controller.set_array_temperature(celsius)?;
            println!("array temperature target set to {celsius:.2} C");
        }
    }
    Ok(())
}

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use spimctrl_backend::*;

/// Runs a short acquisition from a TOML file: a few frames per channel, then teardown.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Acquisition file
    #[arg(default_value = "spimctrl_backend/config/acquisition.toml")]
    config: PathBuf,

    /// Frames to wait for on each channel
    #[arg(short, long, default_value_t = 3)]
    frames: usize,

    /// Channels to visit, in order (default: every channel of the file)
    #[arg(short, long)]
    channels: Vec<String>,

    /// Timeout of one frame wait, in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Timeouts tolerated per frame before giving up
    #[arg(long, default_value_t = 3)]
    attempts: usize,

    /// Print a downsampled preview of each channel's cycle
    #[arg(long)]
    preview: bool,
}

fn backend(device: &config::DeviceConfig) -> Arc<dyn DaqBackend> {
    #[cfg(feature = "nidaqmx")]
    if !device.simulated {
        return Arc::new(NiDaq::new(&device.name, spimcompiler_backend::DeviceLimits::pcie_6738()));
    }
    if !device.simulated {
        tracing::warn!("Built without the nidaqmx feature; simulating {}", device.name);
    }
    Arc::new(SimulatedDaq::new(&device.name))
}

fn run(args: &Args, manager: &TaskManager, plan: &AcquisitionPlan) -> DaqResult<()> {
    let channels: Vec<String> = if args.channels.is_empty() {
        plan.registry.channels().iter().map(|c| c.to_string()).collect()
    } else {
        args.channels.clone()
    };
    let timeout = Duration::from_millis(args.timeout_ms);

    let mut acquisition = Acquisition::setup(manager, plan)?;
    for (i, channel) in channels.iter().enumerate() {
        if args.preview {
            for (port, samples) in acquisition.preview(channel, 16)? {
                info!("{channel} {port}: {:?}", samples.to_vec());
            }
        }
        if i == 0 {
            acquisition.start(channel)?;
        } else {
            acquisition.switch_channel(channel)?;
        }
        for _ in 0..args.frames {
            acquisition.wait_frame(timeout, args.attempts)?;
        }
        info!("Channel {}: {} frames so far", channel, acquisition.frames_acquired());
    }
    acquisition.stop()?;
    acquisition.close().into_result()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let plan = match AcquisitionConfig::from_file(&args.config).and_then(|c| c.build()) {
        Ok(plan) => plan,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let manager = TaskManager::new(backend(&plan.device));
    let result = run(&args, &manager, &plan);
    let report = manager.shutdown();
    if let Err(e) = result.and(report.into_result()) {
        error!("{}", e);
        std::process::exit(1);
    }
}

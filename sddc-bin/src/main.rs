mod config;
mod info;
mod os_signal;
mod rx;

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, eyre};
use sddc::acquisition::StreamConfig;
use sddc::{RadioModel, Sddc, SimulatedDevice};
use tracing_subscriber::EnvFilter;

/// Board to pretend to be when running without hardware.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SimModel {
    Bbrf103,
    Hf103,
    Rx888,
    Rx888r2,
    Rx888r3,
    Rx999,
    Lucy,
}

impl From<SimModel> for RadioModel {
    fn from(value: SimModel) -> Self {
        match value {
            SimModel::Bbrf103 => RadioModel::Bbrf103,
            SimModel::Hf103 => RadioModel::Hf103,
            SimModel::Rx888 => RadioModel::Rx888,
            SimModel::Rx888r2 => RadioModel::Rx888r2,
            SimModel::Rx888r3 => RadioModel::Rx888r3,
            SimModel::Rx999 => RadioModel::Rx999,
            SimModel::Lucy => RadioModel::RxLucy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Open one specific receiver, chosen by serial number
    #[arg(short = 'd', long)]
    serial: Option<String>,
    /// Open the receiver at this position in the device list
    #[arg(short = 'i', long, default_value_t = 0, conflicts_with = "serial")]
    index: usize,
    /// Run against a simulated receiver instead of hardware
    #[arg(long, value_enum)]
    simulate: Option<SimModel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Info(info::Cmd),
    Rx(rx::Cmd),
}

impl Cli {
    fn open(&self, config: StreamConfig) -> color_eyre::Result<Sddc> {
        if let Some(model) = self.simulate {
            // Real-time pacing at the default ADC clock, two bytes a sample.
            let sim = SimulatedDevice::new(model.into())
                .with_pacing(2 * sddc::consts::DEFAULT_ADC_FREQ as u64);
            return Sddc::with_config(Arc::new(sim), config, false)
                .wrap_err("Failed to open simulated receiver");
        }
        let index = match self.serial.as_deref() {
            Some(serial) => sddc::index_by_serial(serial)
                .wrap_err_with(|| format!("Couldn't locate receiver with serial {serial}"))?,
            None => self.index,
        };
        if index >= sddc::device_count() {
            return Err(eyre!("No receiver at index {index}"));
        }
        let transport = sddc::usb::open_sddc_by_index(index).wrap_err("Failed to open receiver")?;
        Sddc::with_config(Arc::new(transport), config, false)
            .wrap_err("Failed to initialize receiver")
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Cli::parse();

    match &args.command {
        Commands::Info(c) => c.cmd(&args).await,
        Commands::Rx(c) => {
            let rf = args.open(c.stream_config()?)?;
            c.cmd(rf).await
        }
    }
}

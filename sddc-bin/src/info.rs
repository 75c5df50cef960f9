use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::Context;
use sddc::acquisition::StreamConfig;
use sddc::{Sddc, list_sddc_devices};

use crate::Cli;

/// Retrieve as much info as possible from each attached receiver.
#[derive(Args, Debug)]
pub struct Cmd {}

fn steps_summary(steps: &[f32]) -> String {
    match (steps.first(), steps.last()) {
        (Some(lo), Some(hi)) => format!("{} steps, {lo} to {hi} dB", steps.len()),
        _ => String::from("not available"),
    }
}

fn print_radio(rf: &Sddc) {
    let info = rf.info();
    match (info.name(), info.model()) {
        (Ok(name), Ok(model)) => println!("Board: {name} (model {model})"),
        _ => println!("Board: ❌ Failed to retrieve"),
    }
    match info.firmware_version() {
        Ok(v) => println!("Firmware Version: {v}"),
        Err(_) => println!("Firmware Version: ❌ Failed to retrieve"),
    }
    if let Ok(g) = info.gain_factor() {
        println!("Gain factor: {g:e}");
    }
    if let Ok(adc) = rf.adc_freq() {
        println!("ADC clock: {} MHz", adc as f64 / 1e6);
    }
    if let Ok(rates) = info.sample_rates() {
        let rates: Vec<String> = rates.iter().map(|r| format!("{}", r / 1e6)).collect();
        println!("Sample rates: {} MHz", rates.join(", "));
    }

    // The step tables follow the RF path, so show both where there are both.
    for (label, freq) in [("HF", 10_000_000u64), ("VHF", 100_000_000)] {
        let Ok(plan) = rf.set_center_freq(freq) else {
            continue;
        };
        println!("{label} path ({}):", plan.mode);
        match info.rf_steps() {
            Ok(s) => println!("    RF attenuation: {}", steps_summary(&s)),
            Err(_) => println!("    RF attenuation: ❌ Failed to retrieve"),
        }
        match info.if_steps() {
            Ok(s) => println!("    IF gain: {}", steps_summary(&s)),
            Err(_) => println!("    IF gain: ❌ Failed to retrieve"),
        }
    }
}

impl Cmd {
    pub async fn cmd(&self, cli: &Cli) -> color_eyre::Result<()> {
        println!("Binary release {}", env!("CARGO_PKG_VERSION"));

        if cli.simulate.is_some() {
            let rf = cli.open(StreamConfig::default())?;
            println!();
            println!("Simulated receiver");
            print_radio(&rf);
            return Ok(());
        }

        let mut found = false;
        for dev in list_sddc_devices().wrap_err("Couldn't enumerate SDDC devices")? {
            let serial = dev
                .serial()
                .map(|s| s.to_owned())
                .unwrap_or_else(|| String::from("Unknown"));

            if let Some(s) = cli.serial.as_ref() {
                if s != &serial {
                    continue;
                }
            }
            found = true;

            println!();
            println!(
                "Found {}, USB serial {serial}",
                dev.product().unwrap_or(dev.manufacturer())
            );

            let rf = match dev
                .open()
                .and_then(|t| Sddc::from_transport(Arc::new(t)))
            {
                Ok(rf) => rf,
                Err(e) => {
                    println!("Couldn't open receiver, serial {serial}: {e}");
                    continue;
                }
            };
            print_radio(&rf);
        }

        if !found {
            if let Some(serial) = cli.serial.as_ref() {
                println!("Unable to locate receiver with serial number {serial}");
            } else {
                println!("Couldn't find any SDDC receivers");
            }
        }
        Ok(())
    }
}

use std::sync::{Arc, atomic};

use anyhow::Result;
use num_complex::Complex32;
use sddc::{RadioModel, Sddc, SimulatedDevice};
use tokio::io::AsyncWriteExt;
#[tokio::main]
async fn main() -> Result<()> {
    // Set up the ctrl-c handler
    let ctrlc_rx = Arc::new(atomic::AtomicBool::new(false));
    let ctrlc_tx = ctrlc_rx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.unwrap();
        ctrlc_tx.store(true, atomic::Ordering::Release);
    });

    // Open up a file for buffered writing. Passing "sim" as the second
    // argument runs against a simulated receiver instead of hardware.
    let mut args = std::env::args();
    args.next();
    let file_name = args.next().unwrap_or_else(|| String::from("./rx.cf32"));
    let simulate = args.next().as_deref() == Some("sim");
    let mut file = tokio::fs::File::create(&file_name).await?;

    let sddc = if simulate {
        let sim = SimulatedDevice::new(RadioModel::Rx888r2).with_pacing(128_000_000);
        Sddc::from_transport(Arc::new(sim))?
    } else {
        Sddc::open(0)?
    };
    println!("Opened {} ({})", sddc.name()?, sddc.info().firmware_version()?);

    // Configure: 2 MHz output, no RF attenuation, 10 dB IF gain, and tune to
    // the 31 m broadcast band.
    sddc.set_sample_rate(2_000_000)?;
    sddc.set_rf_attenuation(0.0)?;
    sddc.set_if_gain(10.0)?;
    sddc.set_center_freq(9_650_000)?;

    // Separate the file writer from the streaming thread with a separate task
    let (data_send, mut data_recv) = tokio::sync::mpsc::unbounded_channel::<Vec<Complex32>>();
    let file_writer = tokio::spawn(async move {
        while let Some(block) = data_recv.recv().await {
            file.write_all(bytemuck::cast_slice(&block)).await?;
        }
        file.flush().await?;
        Ok::<(), anyhow::Error>(())
    });

    // The callback runs on the delivery thread. Dropping it at the end of the
    // stream closes the channel.
    sddc.read_async(move |block| {
        let _ = data_send.send(block.to_vec());
    })?;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    while !ctrlc_rx.load(atomic::Ordering::Acquire) {
        ticker.tick().await;
        let stats = sddc.stats();
        println!(
            "{:.2} MB/s in, {:.0} samples/s out",
            stats.bytes_per_sec / 1e6,
            stats.samples_per_sec
        );
    }

    // Stop receiving
    let stats = sddc.cancel_async()?;
    println!("Received {} samples", stats.samples);

    // Wait for file writer task to close up shop
    file_writer.await??;

    Ok(())
}

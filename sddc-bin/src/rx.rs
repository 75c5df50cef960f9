use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::{Section, eyre::Context};
use num_complex::Complex32;
use sddc::Sddc;
use sddc::acquisition::{SessionState, StreamConfig};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Stream baseband samples to a file as interleaved 32-bit float I/Q.
#[derive(Args, Debug)]
pub struct Cmd {
    #[command(flatten)]
    params: crate::config::Cmd,

    /// Number of samples to record (default is unlimited).
    #[arg(short = 'n', long = "samples")]
    num_samples: Option<u64>,

    /// Seconds between throughput reports.
    #[arg(long = "stats", default_value_t = 1.0)]
    stats_secs: f64,

    /// Record data to a file. Omit for stdout.
    #[arg(default_value_t)]
    filename: String,
}

impl Cmd {
    pub fn stream_config(&self) -> color_eyre::Result<StreamConfig> {
        self.params.stream_config()
    }

    pub async fn cmd(&self, rf: Sddc) -> color_eyre::Result<()> {
        // Configure
        self.params
            .configure(&rf)
            .wrap_err("Failed configuring the receiver")?;
        let rf = Arc::new(rf);

        // Set up a task manager
        let mut tracker = tokio::task::JoinSet::new();

        // The callback runs on the library's delivery thread and hands blocks
        // over without waiting. The channel closes once streaming stops and
        // the callback is dropped.
        let (buf_tx, buf_rx) = mpsc::channel::<Vec<Complex32>>(64);
        rf.read_async(move |block| match buf_tx.try_send(block.to_vec()) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!("Receiver to file buffer overflow");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => (),
        })
        .wrap_err("Failed to start streaming")?;
        info!(
            "Streaming {:.0} samples/s in blocks of {}",
            rf.sample_rate(),
            rf.block_len()
        );

        // Run the file writer and the stats reporter in separate tasks
        tracker.spawn(write_file(buf_rx, self.filename.clone(), self.num_samples));
        let period = Duration::from_secs_f64(self.stats_secs.max(0.05));
        tracker.spawn(report_stats(rf.clone(), period));

        let quit = crate::os_signal::quit_watch().await;
        quit.quit().await;

        // Stopping joins the streaming threads, so keep it off the runtime.
        let stopper = rf.clone();
        match tokio::task::spawn_blocking(move || stopper.stop_async()).await? {
            Ok(stats) => info!(
                "Received {} samples ({} bytes), {} failed reads, {} overruns",
                stats.samples, stats.bytes, stats.read_failures, stats.overruns
            ),
            Err(e) => warn!("Stopping the stream: {e}"),
        }

        let results =
            tokio::time::timeout(tokio::time::Duration::from_secs(1), tracker.join_all()).await?;

        // Check for errors and compile them together if needed
        let err_count = results.iter().fold(0, |cnt, res| res.is_err() as u32 + cnt);
        if err_count == 0 {
            return Ok(());
        }
        if err_count == 1 {
            for r in results {
                r?;
            }
            return Ok(());
        }

        let err = results
            .into_iter()
            .filter_map(Result::err)
            .fold(
                color_eyre::eyre::eyre!("encountered multiple errors"),
                |report, e| report.section(e),
            );
        Err(err)
    }
}

/// Log throughput until told to quit, and quit if the stream fails.
async fn report_stats(rf: Arc<Sddc>, period: Duration) -> color_eyre::Result<()> {
    let quit = crate::os_signal::quit_watch().await;
    quit.run_until_cancelled(async {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if rf.state() == SessionState::Error {
                error!("Streaming failed, stopping");
                quit.cancel();
                break;
            }
            let stats = rf.stats();
            info!(
                "{:.2} MB/s in, {:.0} samples/s out, {} failed reads, {} overruns",
                stats.bytes_per_sec / 1e6,
                stats.samples_per_sec,
                stats.read_failures,
                stats.overruns
            );
        }
    })
    .await;
    Ok(())
}

async fn write_file(
    buf_rx: mpsc::Receiver<Vec<Complex32>>,
    filename: String,
    max_samples: Option<u64>,
) -> color_eyre::Result<()> {
    if filename.is_empty() {
        write_samples(buf_rx, tokio::io::stdout(), max_samples).await
    } else {
        let writer = tokio::fs::File::create(&filename)
            .await
            .wrap_err_with(|| format!("Couldn't create {filename}"))?;
        write_samples(buf_rx, writer, max_samples).await
    }
}

/// Write every block until the stream ends or `max_samples` were written.
/// Hitting the limit asks the whole program to quit.
async fn write_samples<W>(
    mut buf_rx: mpsc::Receiver<Vec<Complex32>>,
    writer: W,
    max_samples: Option<u64>,
) -> color_eyre::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let quit = crate::os_signal::quit_watch().await;
    let mut writer = tokio::io::BufWriter::new(writer);
    let mut sample_count = 0u64;
    while let Some(block) = buf_rx.recv().await {
        let take = match max_samples {
            Some(max) => (max - sample_count).min(block.len() as u64) as usize,
            None => block.len(),
        };
        writer.write_all(bytemuck::cast_slice(&block[..take])).await?;
        sample_count += take as u64;
        if max_samples.is_some_and(|max| sample_count >= max) {
            quit.cancel();
            break;
        }
    }
    writer.flush().await?;
    Ok(())
}

use clap::Args;
use color_eyre::eyre::Context;
use sddc::acquisition::StreamConfig;
use sddc::{BIAS_TEE_HF, BIAS_TEE_VHF, Sddc};
use tracing::info;

#[derive(Args, Debug)]
pub struct Cmd {
    /// Center frequency in Hz. HF is received directly up to half the ADC
    /// clock, boards with a tuner go up to 1750 MHz.
    #[arg(short, long)]
    freq_hz: Option<u64>,

    /// Output sample rate in Hz: 32, 16, 8, 4 or 2 MHz at the default ADC
    /// clock, or 1 MHz and below for extra software decimation.
    #[arg(short, long = "rate", default_value_t = 2_000_000)]
    sample_rate_hz: u32,

    /// RF attenuation in dB. Picks the nearest step at or above the value.
    #[arg(short = 'a', long = "att")]
    rf_attenuation: Option<f32>,

    /// IF gain in dB. Picks the nearest step at or above the value.
    #[arg(short = 'g', long = "gain")]
    if_gain: Option<f32>,

    /// HF antenna bias tee
    #[arg(long = "bias_hf")]
    bias_hf: bool,

    /// VHF antenna bias tee
    #[arg(long = "bias_vhf")]
    bias_vhf: bool,

    /// Always use the HF input, whatever the frequency
    #[arg(short = 'D', long = "direct")]
    direct_sampling: bool,

    /// ADC sampling clock in Hz
    #[arg(short = 'c', long = "adc_clock")]
    adc_freq_hz: Option<u32>,

    /// ADC dither
    #[arg(long)]
    dither: Option<bool>,

    /// ADC programmable gain amplifier
    #[arg(long)]
    pga: Option<bool>,

    /// ADC output randomizer
    #[arg(long)]
    randomizer: Option<bool>,

    /// Size of USB transfers, in ADC samples. Must be a multiple of 512.
    #[arg(short = 'S', long, default_value_t = 65536)]
    transfer_samples: usize,

    /// Number of USB transfers kept in flight.
    #[arg(long, default_value_t = 16)]
    transfers: usize,

    /// Drop raw blocks instead of stalling USB when processing falls behind.
    #[arg(long)]
    drop_on_overrun: bool,
}

impl Cmd {
    /// Buffering settings, validated.
    pub fn stream_config(&self) -> color_eyre::Result<StreamConfig> {
        let config = StreamConfig {
            transfer_samples: self.transfer_samples,
            transfers_in_flight: self.transfers,
            drop_on_overrun: self.drop_on_overrun,
            ..Default::default()
        };
        config.validate().wrap_err("Invalid transfer settings")?;
        Ok(config)
    }

    pub fn configure(&self, rf: &Sddc) -> color_eyre::Result<()> {
        if let Some(adc) = self.adc_freq_hz {
            rf.set_adc_freq(adc).wrap_err("Failed setting ADC clock")?;
        }

        rf.set_sample_rate(self.sample_rate_hz)
            .wrap_err("Failed setting sample rate")?;

        rf.set_direct_sampling(self.direct_sampling)
            .wrap_err("Failed setting direct sampling")?;

        if let Some(freq_hz) = self.freq_hz {
            let plan = rf
                .set_center_freq(freq_hz)
                .wrap_err("Failed setting frequency")?;
            info!(
                "Tuned to {} Hz in the {} path (LO {} Hz)",
                plan.requested, plan.mode, plan.lo
            );
        }

        if let Some(att) = self.rf_attenuation {
            let applied = rf
                .set_rf_attenuation(att)
                .wrap_err("Failed setting RF attenuation")?;
            info!("RF attenuation {applied} dB");
        }

        if let Some(gain) = self.if_gain {
            let applied = rf.set_if_gain(gain).wrap_err("Failed setting IF gain")?;
            info!("IF gain {applied} dB");
        }

        let mut bias = 0;
        if self.bias_hf {
            bias |= BIAS_TEE_HF;
        }
        if self.bias_vhf {
            bias |= BIAS_TEE_VHF;
        }
        rf.set_bias_tee(bias).wrap_err("Failed setting bias tee")?;

        if let Some(on) = self.dither {
            rf.set_dither(on).wrap_err("Failed setting dither")?;
        }
        if let Some(on) = self.pga {
            rf.set_pga(on).wrap_err("Failed setting PGA")?;
        }
        if let Some(on) = self.randomizer {
            rf.set_randomizer(on).wrap_err("Failed setting randomizer")?;
        }

        Ok(())
    }
}

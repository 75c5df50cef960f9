use std::f64::consts::TAU;

use num_complex::{Complex32, Complex64};

const PHASE_SCALE: f64 = 4_294_967_296.0;

fn phasor(phase: u32) -> Complex64 {
    Complex64::from_polar(1.0, TAU * phase as f64 / PHASE_SCALE)
}

/// Phase-continuous complex mixer for the residual tuning offset.
///
/// Phase is a 32-bit accumulator, so the frequency resolution is the sample
/// rate divided by 2^32 and the phase never drifts between blocks.
#[derive(Clone, Debug)]
pub struct FineTuner {
    sample_rate: f64,
    phase: u32,
    step: u32,
}

impl FineTuner {
    /// Create a mixer at 0 Hz for the given sample rate.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            phase: 0,
            step: 0,
        }
    }

    /// Smallest frequency change the mixer can make.
    pub fn resolution(&self) -> f64 {
        self.sample_rate / PHASE_SCALE
    }

    /// Set the mixing frequency. Negative values shift the spectrum down.
    pub fn set_freq(&mut self, hz: f64) {
        let turns = (hz / self.sample_rate).rem_euclid(1.0);
        self.step = (turns * PHASE_SCALE).round() as u64 as u32;
    }

    /// The mixing frequency actually in use.
    pub fn freq(&self) -> f64 {
        self.step as i32 as f64 * self.resolution()
    }

    /// Current phase, in units of 2^-32 turns.
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Zero the phase accumulator.
    pub fn reset(&mut self) {
        self.phase = 0;
    }

    /// Mix a block of samples in place, continuing from where the last block
    /// ended.
    pub fn mix(&mut self, buf: &mut [Complex32]) {
        if self.step == 0 && self.phase == 0 {
            return;
        }
        let rot = phasor(self.step);
        let mut p = phasor(self.phase);
        for s in buf.iter_mut() {
            *s *= Complex32::new(p.re as f32, p.im as f32);
            p *= rot;
        }
        self.phase = self
            .phase
            .wrapping_add(self.step.wrapping_mul(buf.len() as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_within_resolution() {
        let mut nco = FineTuner::new(8_000_000.0);
        for f in [-3906.25, -123.0, 0.0, 0.3, 1234.567, 3906.0] {
            nco.set_freq(f);
            assert!((nco.freq() - f).abs() <= nco.resolution(), "{f}");
        }
    }

    #[test]
    fn phase_is_continuous() {
        let mut a = FineTuner::new(1_000.0);
        let mut b = FineTuner::new(1_000.0);
        a.set_freq(37.0);
        b.set_freq(37.0);
        let mut whole = vec![Complex32::new(1.0, 0.0); 300];
        a.mix(&mut whole);
        let mut split = vec![Complex32::new(1.0, 0.0); 300];
        let (first, second) = split.split_at_mut(113);
        b.mix(first);
        b.mix(second);
        for (x, y) in whole.iter().zip(split.iter()) {
            assert!((x - y).norm() < 1e-4);
        }
        assert_eq!(a.phase(), b.phase());
    }

    #[test]
    fn mixes_tone_to_dc() {
        let fs = 2_000_000.0;
        let f = 1_500.0;
        let mut tone: Vec<Complex32> = (0..1000)
            .map(|n| {
                let t = TAU * f * n as f64 / fs;
                Complex32::new(t.cos() as f32, t.sin() as f32)
            })
            .collect();
        let mut nco = FineTuner::new(fs);
        nco.set_freq(-f);
        nco.mix(&mut tone);
        for s in &tone {
            assert!((s - Complex32::new(1.0, 0.0)).norm() < 1e-3);
        }
    }
}

use num_complex::Complex32;

use super::filter;
use crate::Error;

const TAPS_PER_PHASE: usize = 16;
const STOPBAND_DB: f64 = 70.0;

/// Integer-factor FIR decimator for output rates below what the
/// downconverter produces on its own.
pub struct SoftDecimator {
    factor: usize,
    taps: Vec<f32>,
    history: Vec<Complex32>,
    phase: usize,
}

impl SoftDecimator {
    /// Decimate by `factor`. Factors of 1 pass samples through.
    pub fn new(factor: usize) -> Result<Self, Error> {
        if factor == 0 {
            return Err(Error::InvalidParameter("decimation factor must be non-zero"));
        }
        let taps = if factor == 1 {
            vec![1.0]
        } else {
            filter::lowpass(TAPS_PER_PHASE * factor + 1, 0.4 / factor as f64, STOPBAND_DB)
        };
        Ok(Self {
            factor,
            history: vec![Complex32::default(); taps.len() - 1],
            taps,
            phase: 0,
        })
    }

    /// Decimation factor.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Clear the filter state.
    pub fn reset(&mut self) {
        self.history.fill(Complex32::default());
        self.phase = 0;
    }

    /// Filter `input` and append every `factor`-th result to `out`.
    pub fn process(&mut self, input: &[Complex32], out: &mut Vec<Complex32>) {
        if self.factor == 1 {
            out.extend_from_slice(input);
            return;
        }
        let ntaps = self.taps.len();
        self.history.extend_from_slice(input);
        let mut pos = self.phase;
        while pos < input.len() {
            // Newest sample of this output sits at history[pos + ntaps - 1].
            let window = &self.history[pos..pos + ntaps];
            let acc = window
                .iter()
                .rev()
                .zip(self.taps.iter())
                .fold(Complex32::default(), |acc, (x, &h)| acc + *x * h);
            out.push(acc);
            pos += self.factor;
        }
        self.phase = pos - input.len();
        self.history.drain(..input.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_count_across_calls() {
        let mut d = SoftDecimator::new(4).unwrap();
        let mut out = Vec::new();
        d.process(&vec![Complex32::new(1.0, 0.0); 10], &mut out);
        d.process(&vec![Complex32::new(1.0, 0.0); 10], &mut out);
        d.process(&vec![Complex32::new(1.0, 0.0); 12], &mut out);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn dc_passes_at_unity() {
        let mut d = SoftDecimator::new(3).unwrap();
        let mut out = Vec::new();
        d.process(&vec![Complex32::new(0.5, -0.25); 600], &mut out);
        let last = out.last().copied().unwrap();
        assert!((last - Complex32::new(0.5, -0.25)).norm() < 1e-4);
    }

    #[test]
    fn passthrough_and_zero() {
        assert!(SoftDecimator::new(0).is_err());
        let mut d = SoftDecimator::new(1).unwrap();
        let mut out = Vec::new();
        d.process(&[Complex32::new(2.0, 1.0)], &mut out);
        assert_eq!(out, vec![Complex32::new(2.0, 1.0)]);
    }
}

use std::f64::consts::PI;

/// Modified Bessel function of the first kind, order 0.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let x_sq_over_4 = x * x / 4.0;
    for k in 1..=40 {
        term *= x_sq_over_4 / (k * k) as f64;
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

/// Kaiser window shape parameter for a stopband attenuation in dB.
fn kaiser_beta(atten_db: f64) -> f64 {
    if atten_db > 50.0 {
        0.1102 * (atten_db - 8.7)
    } else if atten_db > 21.0 {
        0.5842 * (atten_db - 21.0).powf(0.4) + 0.07886 * (atten_db - 21.0)
    } else {
        0.0
    }
}

fn kaiser(n: usize, beta: f64) -> Vec<f64> {
    let denom = bessel_i0(beta);
    (0..n)
        .map(|i| {
            let x = 2.0 * i as f64 / (n as f64 - 1.0) - 1.0;
            bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / denom
        })
        .collect()
}

/// Kaiser-windowed sinc lowpass of odd length `len`, with `cutoff` in cycles
/// per sample. Taps are scaled for unity gain at DC.
pub(crate) fn lowpass(len: usize, cutoff: f64, atten_db: f64) -> Vec<f32> {
    let win = kaiser(len, kaiser_beta(atten_db));
    let half = (len as f64 - 1.0) / 2.0;
    let taps: Vec<f64> = win
        .iter()
        .enumerate()
        .map(|(n, w)| {
            let t = n as f64 - half;
            let sinc = if t.abs() < 1e-12 {
                1.0
            } else {
                let x = 2.0 * cutoff * t;
                (PI * x).sin() / (PI * x)
            };
            sinc * w
        })
        .collect();
    let dc: f64 = taps.iter().sum();
    taps.iter().map(|t| (t / dc) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(taps: &[f32], freq: f64) -> f64 {
        let (re, im) = taps.iter().enumerate().fold((0.0, 0.0), |(re, im), (n, &h)| {
            let w = -2.0 * PI * freq * n as f64;
            (re + h as f64 * w.cos(), im + h as f64 * w.sin())
        });
        (re * re + im * im).sqrt()
    }

    #[test]
    fn unity_dc_and_symmetric() {
        let h = lowpass(129, 0.1, 80.0);
        let sum: f32 = h.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        for i in 0..64 {
            assert!((h[i] - h[128 - i]).abs() < 1e-7);
        }
    }

    #[test]
    fn passes_passband_rejects_stopband() {
        let h = lowpass(257, 0.1, 80.0);
        assert!((response(&h, 0.05) - 1.0).abs() < 0.01);
        assert!(response(&h, 0.2) < 1e-3);
    }
}

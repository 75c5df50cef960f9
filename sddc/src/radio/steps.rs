use crate::Error;

/// An ascending table of gain or attenuation settings, in dB.
///
/// Index 0 is always the lowest setting. Radios expose one table for RF
/// attenuation and one for IF gain, and the contents change with the radio
/// model and the current [`RfMode`][super::RfMode].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepTable {
    steps: Vec<f32>,
}

static EMPTY: StepTable = StepTable { steps: Vec::new() };

impl StepTable {
    /// Build a table, checking that it is strictly increasing.
    pub fn new(steps: Vec<f32>) -> Result<Self, Error> {
        if steps.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(Error::InvalidParameter(
                "step table must be strictly increasing",
            ));
        }
        Ok(Self { steps })
    }

    /// A shared empty table, for radios without a given control.
    pub fn empty() -> &'static Self {
        &EMPTY
    }

    fn from_fn(len: usize, f: impl Fn(usize) -> f32) -> Self {
        Self {
            steps: (0..len).map(f).collect(),
        }
    }

    /// All settings, lowest first.
    pub fn as_slice(&self) -> &[f32] {
        &self.steps
    }

    /// Number of settings.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the table has no settings at all.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Setting at `idx`.
    pub fn get(&self, idx: usize) -> Option<f32> {
        self.steps.get(idx).copied()
    }

    /// Lowest and highest settings.
    pub fn range(&self) -> Option<(f32, f32)> {
        Some((*self.steps.first()?, *self.steps.last()?))
    }

    /// Pick the index for a requested value: the first setting at or above
    /// it, or the top setting if the request is beyond the table.
    pub fn select(&self, value: f32) -> Result<usize, Error> {
        if self.steps.is_empty() {
            return Err(Error::InvalidParameter("no settings available"));
        }
        Ok(self
            .steps
            .iter()
            .position(|&s| s >= value)
            .unwrap_or(self.steps.len() - 1))
    }
}

/// Gain at which the AD8370 switches from its low to its high range.
const AD8370_SWEET_POINT: usize = 18;
const AD8370_HIGH_RATIO: f32 = 0.409;
const AD8370_LOW_RATIO: f32 = 0.059;
const AD8370_HIGH_MODE: u16 = 0x80;
const AD8370_STEPS: usize = 127;

/// R820T/R828D LNA gain settings.
pub(crate) fn r82xx_rf() -> StepTable {
    StepTable {
        steps: vec![
            0.0, 0.9, 1.4, 2.7, 3.7, 7.7, 8.7, 12.5, 14.4, 15.7, 16.6, 19.7, 20.7, 22.9, 25.4,
            28.0, 29.7, 32.8, 33.8, 36.4, 37.2, 38.6, 40.2, 42.1, 43.4, 43.9, 44.5, 48.0, 49.6,
        ],
    }
}

/// R820T/R828D VGA gain settings.
pub(crate) fn r82xx_if() -> StepTable {
    StepTable {
        steps: vec![
            -4.7, -2.1, 0.5, 3.5, 7.7, 11.2, 13.6, 14.9, 16.3, 19.5, 23.1, 26.5, 30.0, 33.7, 37.2,
            40.8,
        ],
    }
}

/// Three-position HF attenuator switched by GPIO.
pub(crate) fn switched_attenuator() -> StepTable {
    StepTable {
        steps: vec![-20.0, -10.0, 0.0],
    }
}

/// DAT-31 style step attenuator in 0.5 dB steps, ending at 0 dB.
pub(crate) fn dat31(len: usize) -> StepTable {
    StepTable::from_fn(len, |i| -((len - 1 - i) as f32) * 0.5)
}

/// Attenuator in 1 dB steps, ending at 0 dB.
pub(crate) fn whole_db_attenuator(len: usize) -> StepTable {
    StepTable::from_fn(len, |i| -((len - 1 - i) as f32))
}

/// AD8370 variable gain amplifier, low range then high range.
pub(crate) fn ad8370() -> StepTable {
    StepTable::from_fn(AD8370_STEPS, |i| {
        if i > AD8370_SWEET_POINT {
            20.0 * (AD8370_HIGH_RATIO * (i - AD8370_SWEET_POINT + 3) as f32).log10()
        } else {
            20.0 * (AD8370_LOW_RATIO * (i + 1) as f32).log10()
        }
    })
}

/// AD8370 register code for a gain index from [`ad8370`].
pub(crate) fn ad8370_code(idx: usize) -> u16 {
    let idx = idx.min(AD8370_STEPS - 1);
    if idx > AD8370_SWEET_POINT {
        AD8370_HIGH_MODE | (idx - AD8370_SWEET_POINT + 3) as u16
    } else {
        (idx + 1) as u16
    }
}

/// Gain in 0.5 dB steps starting at 0 dB.
pub(crate) fn half_db_gain(len: usize) -> StepTable {
    StepTable::from_fn(len, |i| i as f32 * 0.5)
}

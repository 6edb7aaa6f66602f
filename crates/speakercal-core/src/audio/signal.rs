//! MLS (Maximum Length Sequence) excitation signal generation
//!
//! Generates pseudo-random binary sequences with period 2^order - 1 from an
//! N-stage delay line. The sequences have a flat spectrum and an impulse-like
//! periodic autocorrelation, which is what makes impulse response extraction
//! by correlation possible.

use std::sync::Arc;

use super::module::ExcitationError;
use crate::{MAX_MLS_ORDER, MIN_MLS_ORDER};

/// Number of stages in the widest supported delay line
const MAX_TAPS: usize = 18;

/// Feedback taps per order. Row `MAX_TAPS - order` holds the taps for `order`;
/// only the first `order` entries of a row are used.
const TAPS_TABLE: [[u8; MAX_TAPS]; 16] = [
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 1],
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 0],
    [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 1, 0, 0],
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 0, 0],
    [0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 1, 1, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 1, 1, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 1, 1, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
];

/// Period of an MLS of the given order
pub fn period(order: u32) -> usize {
    (1usize << order) - 1
}

/// Check an order against the taps table
pub fn check_order(order: u32) -> Result<(), ExcitationError> {
    if (MIN_MLS_ORDER..=MAX_MLS_ORDER).contains(&order) {
        Ok(())
    } else {
        Err(ExcitationError::InvalidOrder {
            order,
            min: MIN_MLS_ORDER,
            max: MAX_MLS_ORDER,
        })
    }
}

/// Feedback taps for an order, one flag per delay line stage
pub fn taps(order: u32) -> Result<&'static [u8], ExcitationError> {
    check_order(order)?;
    let row = &TAPS_TABLE[MAX_TAPS - order as usize];
    Ok(&row[..order as usize])
}

/// Binary maximum length sequence of one period
///
/// # Example
/// ```
/// use speakercal_core::audio::signal::MlsSequence;
///
/// let mls = MlsSequence::new(4).unwrap();
/// assert_eq!(mls.len(), 15);
/// ```
#[derive(Debug, Clone)]
pub struct MlsSequence {
    order: u32,
    bits: Vec<u8>,
}

impl MlsSequence {
    /// Generate one period of the sequence for `order`
    ///
    /// The delay line starts with all stages set; the output is the last
    /// stage and the feedback is the modulo-2 sum of the tapped stages.
    pub fn new(order: u32) -> Result<Self, ExcitationError> {
        let taps = taps(order)?;
        let n = order as usize;
        let length = period(order);

        let mut delay_line = [1u8; MAX_TAPS];
        let mut bits = Vec::with_capacity(length);

        for _ in 0..length {
            let feedback = taps
                .iter()
                .zip(&delay_line[..n])
                .fold(0u8, |acc, (&t, &d)| acc ^ (t & d));

            bits.push(delay_line[n - 1]);
            delay_line.copy_within(0..n - 1, 1);
            delay_line[0] = feedback;
        }

        Ok(Self { order, bits })
    }

    /// Order of the sequence
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Sequence length (2^order - 1)
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Always false for a generated sequence
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Raw bits (0 or 1)
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Bipolar excitation: bit 1 maps to -1.0, bit 0 to +1.0
    pub fn to_signal(&self) -> ExcitationSignal {
        let samples: Vec<f32> = self
            .bits
            .iter()
            .map(|&b| if b == 1 { -1.0 } else { 1.0 })
            .collect();

        ExcitationSignal {
            order: self.order,
            samples: samples.into(),
        }
    }
}

/// Immutable MLS excitation of one period
///
/// Cheap to clone: the samples are shared.
#[derive(Debug, Clone, PartialEq)]
pub struct ExcitationSignal {
    order: u32,
    samples: Arc<[f32]>,
}

impl ExcitationSignal {
    /// Order the signal was generated for
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Number of samples (2^order - 1)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a generated signal
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Signal samples, each either -1.0 or +1.0
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Playback duration at the given sample rate
    pub fn duration(&self, sample_rate: u32) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.len() as f64 / sample_rate.max(1) as f64)
    }
}

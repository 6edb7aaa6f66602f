//! Impulse response extraction by fast Hadamard transform
//!
//! Circular cross-correlation of a recorded MLS period against the excitation
//! is computed as a permutation, an in-place fast Hadamard transform over
//! `P + 1` points and a second permutation. Cost is O(P log P) with no
//! floating point rounding beyond additions.
//!
//! ```text
//! perm[0]          = -sum(recorded)
//! perm[tag_s[i]]   = recorded[i]
//! perm             = FHT(perm)
//! response[i]      = perm[tag_l[i]] / (P + 1)      for i < P
//! response[P]      = 0
//! ```

use super::module::ExcitationError;
use super::signal::{period, ExcitationSignal, MlsSequence};

/// Permutation tables for one MLS order
///
/// Building the tables is O(P * order); [`super::module::MlsModule`] caches
/// them per order so repeated sessions pay the cost once.
#[derive(Debug)]
pub struct MlsTables {
    order: u32,
    signal: ExcitationSignal,
    tag_s: Vec<usize>,
    tag_l: Vec<usize>,
}

impl MlsTables {
    /// Build sequence and permutation tables for `order`
    pub fn build(order: u32) -> Result<Self, ExcitationError> {
        let mls = MlsSequence::new(order)?;
        let n = order as usize;
        let p = period(order);
        let bits = mls.bits();

        // Column sums of the delayed-sequence matrix; these are the signal
        // permutation and locate the unit columns for the response permutation
        let mut tag_s = vec![0usize; p];
        let mut index = vec![0usize; n];
        for (i, tag) in tag_s.iter_mut().enumerate() {
            for j in 0..n {
                *tag += (bits[(p + i - j) % p] as usize) << (n - 1 - j);
            }
            for (j, idx) in index.iter_mut().enumerate() {
                if *tag == 1 << j {
                    *idx = i;
                }
            }
        }

        let tag_l: Vec<usize> = (0..p)
            .map(|i| {
                index
                    .iter()
                    .enumerate()
                    .map(|(j, &idx)| (bits[(p + idx - i) % p] as usize) << j)
                    .sum()
            })
            .collect();

        tracing::debug!(order, period = p, "Built MLS permutation tables");

        Ok(Self {
            order,
            signal: mls.to_signal(),
            tag_s,
            tag_l,
        })
    }

    /// Order of the tables
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Period P = 2^order - 1
    pub fn period(&self) -> usize {
        self.tag_s.len()
    }

    /// Excitation the tables were built for
    pub fn signal(&self) -> &ExcitationSignal {
        &self.signal
    }

    /// Correlate one period of recorded signal against the excitation
    ///
    /// `recorded` must hold exactly P samples. Returns P + 1 samples scaled
    /// by 1 / (P + 1); the last one is always zero.
    pub fn impulse_response(&self, recorded: &[f64]) -> Vec<f64> {
        let p = self.period();
        debug_assert_eq!(recorded.len(), p);

        let mut perm = vec![0.0f64; p + 1];
        perm[0] = -recorded.iter().sum::<f64>();
        for (&tag, &sample) in self.tag_s.iter().zip(recorded) {
            perm[tag] = sample;
        }

        fast_hadamard(&mut perm, self.order);

        let scale = 1.0 / (p + 1) as f64;
        let mut response: Vec<f64> = self.tag_l.iter().map(|&tag| perm[tag] * scale).collect();
        response.push(0.0);
        response
    }
}

/// In-place fast Hadamard transform over 2^order points
pub fn fast_hadamard(data: &mut [f64], order: u32) {
    let len = data.len();
    debug_assert_eq!(len, 1 << order);

    let mut k1 = len;
    for _ in 0..order {
        let k2 = k1 >> 1;
        for j in 0..k2 {
            let mut i = j;
            while i < len {
                let i1 = i + k2;
                let sum = data[i] + data[i1];
                data[i1] = data[i] - data[i1];
                data[i] = sum;
                i += k1;
            }
        }
        k1 >>= 1;
    }
}

//! Low-complexity masking of target residues before seeding.
//!
//! A sliding window of [`MASK_WINDOW`] residues is scored by its Shannon
//! entropy; windows below the alphabet-dependent threshold are replaced by
//! the unknown residue so that no seed overlaps them.

use serde::{Deserialize, Serialize};

pub const MASK_WINDOW: usize = 12;

/// Fraction of the maximal window entropy under which a window is masked.
const ENTROPY_FRACTION: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum MaskMode {
    None,
    LowComplexity,
}

fn entropy_threshold(alphabet: usize) -> f64 {
    let letters = alphabet.min(MASK_WINDOW).max(2) as f64;
    ENTROPY_FRACTION * letters.log2()
}

/// Mask low-complexity windows in place; returns the number of residues masked.
/// `alphabet` is the seeding alphabet, `unknown` the code written over masked residues.
pub fn mask_low_complexity(residues: &mut [u8], alphabet: usize, unknown: u8) -> usize {
    let n = residues.len();
    if n < MASK_WINDOW {
        return 0;
    }
    let threshold = entropy_threshold(alphabet);
    let mut counts = vec![0u32; alphabet + 1];
    let mut masked = vec![false; n];

    let bucket = |r: u8| (r as usize).min(alphabet);
    for &r in &residues[..MASK_WINDOW] {
        counts[bucket(r)] += 1;
    }
    for start in 0..=(n - MASK_WINDOW) {
        if start > 0 {
            counts[bucket(residues[start - 1])] -= 1;
            counts[bucket(residues[start + MASK_WINDOW - 1])] += 1;
        }
        let known: u32 = counts[..alphabet].iter().sum();
        if (known as usize) * 2 < MASK_WINDOW {
            continue;
        }
        let total = known as f64;
        let entropy: f64 = counts[..alphabet]
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / total;
                -p * p.log2()
            })
            .sum();
        if entropy < threshold {
            masked[start..start + MASK_WINDOW].iter_mut().for_each(|m| *m = true);
        }
    }

    let mut n_masked = 0usize;
    for (r, m) in residues.iter_mut().zip(&masked) {
        if *m && *r != unknown {
            *r = unknown;
            n_masked += 1;
        }
    }
    n_masked
}

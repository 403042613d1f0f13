use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::seqtype::SeedStrategy;

/// 种子模式：连续窗口或带间隔（spaced）的窗口。
///
/// `offsets` 记录窗口内参与编码的位置，`span` 为窗口总长度（即有效 k-mer 长度）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedPattern {
    offsets: Vec<usize>,
    span: usize,
}

impl SeedPattern {
    pub fn contiguous(k: usize) -> Self {
        Self { offsets: (0..k).collect(), span: k }
    }

    /// Parse a 0/1 mask such as `"11011"`. It must start and end with `1`.
    pub fn parse(mask: &str) -> Result<Self> {
        let bytes = mask.as_bytes();
        if bytes.is_empty() {
            bail!("empty seed pattern");
        }
        if bytes.iter().any(|&b| b != b'0' && b != b'1') {
            bail!("seed pattern '{}' may only contain 0 and 1", mask);
        }
        if bytes[0] != b'1' || bytes[bytes.len() - 1] != b'1' {
            bail!("seed pattern '{}' must start and end with 1", mask);
        }
        let offsets = bytes
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == b'1')
            .map(|(i, _)| i)
            .collect();
        Ok(Self { offsets, span: bytes.len() })
    }

    /// Built-in spaced patterns for the k-mer sizes the threshold table covers.
    pub fn default_spaced(k: usize) -> Result<Self> {
        match k {
            5 => Self::parse("1101011"),
            6 => Self::parse("11011011"),
            7 => Self::parse("1101011101"),
            _ => bail!("no default spaced seed pattern for k = {}", k),
        }
    }

    /// Number of residues that enter the code.
    #[inline]
    pub fn kmer_size(&self) -> usize {
        self.offsets.len()
    }

    /// Window length covered on the sequence.
    #[inline]
    pub fn span(&self) -> usize {
        self.span
    }

    #[inline]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn is_spaced(&self) -> bool {
        self.span != self.offsets.len()
    }

    /// Gather the pattern positions of the window starting at `pos`.
    #[inline]
    pub fn gather(&self, residues: &[u8], pos: usize, out: &mut Vec<u8>) {
        out.clear();
        out.extend(self.offsets.iter().map(|&o| residues[pos + o]));
    }
}

impl fmt::Display for SeedPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mask = vec![b'0'; self.span];
        for &o in &self.offsets {
            mask[o] = b'1';
        }
        f.write_str(&String::from_utf8_lossy(&mask))
    }
}

/// Number of distinct codes for `k` letters over `alphabet`, if it fits in `u32`.
pub fn code_space(alphabet: usize, k: usize) -> Option<u32> {
    let mut n: u64 = 1;
    for _ in 0..k {
        n = n.checked_mul(alphabet as u64)?;
        if n > u32::MAX as u64 {
            return None;
        }
    }
    Some(n as u32)
}

/// 遍历序列上所有合法种子，产出 `(起始位置, 编码)`。
/// 含未知残基（或被掩码）的窗口被跳过。
pub struct SeedIter<'a> {
    residues: &'a [u8],
    pattern: &'a SeedPattern,
    strategy: &'a dyn SeedStrategy,
    alphabet: usize,
    pos: usize,
    window: Vec<u8>,
}

impl<'a> SeedIter<'a> {
    pub fn new(
        residues: &'a [u8],
        pattern: &'a SeedPattern,
        strategy: &'a dyn SeedStrategy,
        alphabet: usize,
    ) -> Self {
        Self {
            residues,
            pattern,
            strategy,
            alphabet,
            pos: 0,
            window: Vec::with_capacity(pattern.kmer_size()),
        }
    }
}

impl Iterator for SeedIter<'_> {
    type Item = (usize, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.pattern.span();
        while self.pos + span <= self.residues.len() {
            let pos = self.pos;
            self.pos += 1;
            self.pattern.gather(self.residues, pos, &mut self.window);
            if let Some(code) = self.strategy.encode_seed(&self.window, self.alphabet) {
                return Some((pos, code));
            }
        }
        None
    }
}

/// Decode a seed code back into its letters (first letter most significant).
pub fn decode_seed(mut code: u32, k: usize, alphabet: usize, out: &mut Vec<u8>) {
    out.clear();
    out.resize(k, 0);
    for i in (0..k).rev() {
        out[i] = (code % alphabet as u32) as u8;
        code /= alphabet as u32;
    }
}

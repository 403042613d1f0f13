use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// 查找表中的无效标记，解码时回落到未知残基。
const INVALID: u8 = u8::MAX;

/// 替换打分矩阵。
///
/// - 字母以 `[0, alphabet_size)` 编码，最后一个字母固定为未知残基（蛋白 X，核酸 N）。
/// - 分数按行优先展平存储：`scores[a * alphabet_size + b]`。
/// - 矩阵的构造（从概率模型推导）不在本 crate 范围内，这里只提供内置矩阵和自定义入口。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubstitutionMatrix {
    pub name: String,
    letters: Vec<u8>,
    lut: Vec<u8>,
    scores: Vec<i16>,
}

// BLOSUM62, order ARNDCQEGHILKMFPSTWYV (half-bit units)
#[rustfmt::skip]
const BLOSUM62: [i8; 400] = [
     4, -1, -2, -2,  0, -1, -1,  0, -2, -1, -1, -1, -1, -2, -1,  1,  0, -3, -2,  0,
    -1,  5,  0, -2, -3,  1,  0, -2,  0, -3, -2,  2, -1, -3, -2, -1, -1, -3, -2, -3,
    -2,  0,  6,  1, -3,  0,  0,  0,  1, -3, -3,  0, -2, -3, -2,  1,  0, -4, -2, -3,
    -2, -2,  1,  6, -3,  0,  2, -1, -1, -3, -4, -1, -3, -3, -1,  0, -1, -4, -3, -3,
     0, -3, -3, -3,  9, -3, -4, -3, -3, -1, -1, -3, -1, -2, -3, -1, -1, -2, -2, -1,
    -1,  1,  0,  0, -3,  5,  2, -2,  0, -3, -2,  1,  0, -3, -1,  0, -1, -2, -1, -2,
    -1,  0,  0,  2, -4,  2,  5, -2,  0, -3, -3,  1, -2, -3, -1,  0, -1, -3, -2, -2,
     0, -2,  0, -1, -3, -2, -2,  6, -2, -4, -4, -2, -3, -3, -2,  0, -2, -2, -3, -3,
    -2,  0,  1, -1, -3,  0,  0, -2,  8, -3, -3, -1, -2, -1, -2, -1, -2, -2,  2, -3,
    -1, -3, -3, -3, -1, -3, -3, -4, -3,  4,  2, -3,  1,  0, -3, -2, -1, -3, -1,  3,
    -1, -2, -3, -4, -1, -2, -3, -4, -3,  2,  4, -2,  2,  0, -3, -2, -1, -2, -1,  1,
    -1,  2,  0, -1, -3,  1,  1, -2, -1, -3, -2,  5, -1, -3, -1,  0, -1, -3, -2, -2,
    -1, -1, -2, -3, -1,  0, -2, -3, -2,  1,  2, -1,  5,  0, -2, -1, -1, -1, -1,  1,
    -2, -3, -3, -3, -2, -3, -3, -3, -1,  0,  0, -3,  0,  6, -4, -2, -2,  1,  3, -1,
    -1, -2, -2, -1, -3, -1, -1, -2, -2, -3, -3, -1, -2, -4,  7, -1, -1, -4, -3, -2,
     1, -1,  1,  0, -1,  0,  0,  0, -1, -2, -2,  0, -1, -2, -1,  4,  1, -3, -2, -2,
     0, -1,  0, -1, -1, -1, -1, -2, -2, -1, -1, -1, -1, -2, -1,  1,  5, -2, -2,  0,
    -3, -3, -4, -4, -2, -2, -3, -2, -2, -3, -2, -3, -1,  1, -4, -3, -2, 11,  2, -3,
    -2, -2, -2, -3, -2, -1, -2, -3,  2, -1, -1, -2, -1,  3, -3, -2, -2,  2,  7, -1,
     0, -3, -3, -3, -1, -2, -2, -3, -3,  3,  1, -2,  1, -1, -2, -2,  0, -3, -1,  4,
];

/// half-bit -> 1/8 bit, the scale the k-mer threshold table is fitted on
const BLOSUM62_BIT_FACTOR: i16 = 4;

impl SubstitutionMatrix {
    /// 自定义矩阵。`letters` 的最后一个字母被视为未知残基。
    pub fn new(name: &str, letters: &[u8], scores: Vec<i16>) -> Result<Self> {
        let n = letters.len();
        if n < 2 {
            bail!("substitution matrix '{}' needs at least two letters", name);
        }
        if scores.len() != n * n {
            bail!(
                "substitution matrix '{}' has {} scores, expected {}",
                name,
                scores.len(),
                n * n
            );
        }
        Ok(Self::from_parts(name, letters, scores))
    }

    fn from_parts(name: &str, letters: &[u8], scores: Vec<i16>) -> Self {
        let mut lut = vec![INVALID; 256];
        for (i, &c) in letters.iter().enumerate() {
            lut[c.to_ascii_uppercase() as usize] = i as u8;
            lut[c.to_ascii_lowercase() as usize] = i as u8;
        }
        Self { name: name.to_string(), letters: letters.to_vec(), lut, scores }
    }

    /// BLOSUM62 scaled to 1/8 bit, 21 letters (20 amino acids + X).
    pub fn blosum62() -> Self {
        let letters = b"ARNDCQEGHILKMFPSTWYVX";
        let n = letters.len();
        let mut scores = vec![-BLOSUM62_BIT_FACTOR; n * n];
        for a in 0..20 {
            for b in 0..20 {
                scores[a * n + b] = BLOSUM62[a * 20 + b] as i16 * BLOSUM62_BIT_FACTOR;
            }
        }
        // U/O/B/Z/J etc. are folded into X by the lookup table
        Self::from_parts("blosum62", letters, scores)
    }

    /// 核酸矩阵：ACGT + N，N 对任何字母记 0 分。
    pub fn nucleotide(match_score: i16, mismatch_penalty: i16) -> Self {
        let letters = b"ACGTN";
        let n = letters.len();
        let mut scores = vec![0i16; n * n];
        for a in 0..4 {
            for b in 0..4 {
                scores[a * n + b] = if a == b { match_score } else { -mismatch_penalty };
            }
        }
        let mut m = Self::from_parts("nucleotide", letters, scores);
        // U behaves like T
        m.lut[b'U' as usize] = 3;
        m.lut[b'u' as usize] = 3;
        m
    }

    #[inline]
    pub fn alphabet_size(&self) -> usize {
        self.letters.len()
    }

    /// 未知残基编码（最后一个字母）。
    #[inline]
    pub fn unknown(&self) -> u8 {
        (self.letters.len() - 1) as u8
    }

    #[inline]
    pub fn score(&self, a: u8, b: u8) -> i16 {
        self.scores[a as usize * self.letters.len() + b as usize]
    }

    /// ASCII -> 字母编码，无法识别的字符映射为未知残基。
    #[inline]
    pub fn encode(&self, c: u8) -> u8 {
        match self.lut[c as usize] {
            INVALID => self.unknown(),
            v => v,
        }
    }

    pub fn encode_seq(&self, seq: &[u8]) -> Vec<u8> {
        seq.iter().map(|&c| self.encode(c)).collect()
    }

    #[inline]
    pub fn decode(&self, code: u8) -> u8 {
        self.letters.get(code as usize).copied().unwrap_or(b'X')
    }

    /// Highest score in row `a` restricted to the first `alphabet` letters.
    pub fn row_max(&self, a: u8, alphabet: usize) -> i16 {
        (0..alphabet as u8).map(|b| self.score(a, b)).max().unwrap_or(0)
    }
}

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::util::matrix::SubstitutionMatrix;
use crate::util::seed::decode_seed;

/// 短 k-mer（长度 2 或 3）之间的扩展打分表。
///
/// 对每个短编码 `row`，`scores[row * n..(row + 1) * n]` 按分数降序（同分按编码升序）存放
/// 与所有短编码的得分之和，`codes` 同序存放对应编码。邻域枚举因此可以在分数
/// 低于剩余预算时提前终止。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedScoreTable {
    len: usize,
    alphabet: usize,
    n: usize,
    scores: Vec<i16>,
    codes: Vec<u32>,
}

impl ExtendedScoreTable {
    pub fn build(matrix: &SubstitutionMatrix, alphabet: usize, len: usize) -> Self {
        let n = alphabet.pow(len as u32);
        let rows: Vec<Vec<(i16, u32)>> = (0..n)
            .into_par_iter()
            .map_init(
                || (Vec::with_capacity(len), Vec::with_capacity(len)),
                |(a, b), row| {
                    decode_seed(row as u32, len, alphabet, a);
                    let mut entries: Vec<(i16, u32)> = (0..n)
                        .map(|col| {
                            decode_seed(col as u32, len, alphabet, b);
                            let s: i16 = a.iter().zip(b.iter()).map(|(&x, &y)| matrix.score(x, y)).sum();
                            (s, col as u32)
                        })
                        .collect();
                    entries.sort_unstable_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)));
                    entries
                },
            )
            .collect();

        let mut scores = Vec::with_capacity(n * n);
        let mut codes = Vec::with_capacity(n * n);
        for row in rows {
            for (s, c) in row {
                scores.push(s);
                codes.push(c);
            }
        }
        Self { len, alphabet, n, scores, codes }
    }

    /// Length of the short codes.
    pub fn code_len(&self) -> usize {
        self.len
    }

    pub fn alphabet(&self) -> usize {
        self.alphabet
    }

    /// Number of short codes (`alphabet ^ len`).
    pub fn size(&self) -> usize {
        self.n
    }

    /// Sorted `(scores, codes)` of one row.
    #[inline]
    pub fn row(&self, code: u32) -> (&[i16], &[u32]) {
        let s = code as usize * self.n;
        (&self.scores[s..s + self.n], &self.codes[s..s + self.n])
    }

    /// Best score reachable from `code` (the first entry of its row).
    #[inline]
    pub fn row_max(&self, code: u32) -> i16 {
        self.scores[code as usize * self.n]
    }
}

/// 2-mer 与 3-mer 两张扩展表，仅氨基酸查询使用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedTables {
    pub two: ExtendedScoreTable,
    pub three: ExtendedScoreTable,
}

impl ExtendedTables {
    pub fn build(matrix: &SubstitutionMatrix, alphabet: usize) -> Self {
        Self {
            two: ExtendedScoreTable::build(matrix, alphabet, 2),
            three: ExtendedScoreTable::build(matrix, alphabet, 3),
        }
    }

    pub fn table(&self, len: usize) -> &ExtendedScoreTable {
        if len == 3 {
            &self.three
        } else {
            &self.two
        }
    }

    pub fn approx_bytes(&self) -> usize {
        let per = std::mem::size_of::<i16>() + std::mem::size_of::<u32>();
        (self.two.scores.len() + self.three.scores.len()) * per
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_sorted_descending() {
        let m = SubstitutionMatrix::nucleotide(2, 3);
        let t = ExtendedScoreTable::build(&m, 4, 2);
        assert_eq!(t.size(), 16);
        for code in 0..16u32 {
            let (scores, codes) = t.row(code);
            assert!(scores.windows(2).all(|w| w[0] >= w[1]));
            // identity is the unique best pair for a match/mismatch matrix
            assert_eq!(codes[0], code);
            assert_eq!(t.row_max(code), 4);
        }
    }

    #[test]
    fn table_pair_size() {
        let m = SubstitutionMatrix::nucleotide(2, 3);
        let t = ExtendedTables::build(&m, 4);
        assert_eq!(t.table(3).size(), 64);
        // 16 x 16 and 64 x 64 entries of (i16, u32)
        assert_eq!(t.approx_bytes(), (256 + 4096) * 6);
    }

    #[test]
    fn scores_sum_over_positions() {
        let m = SubstitutionMatrix::blosum62();
        let t = ExtendedScoreTable::build(&m, 20, 2);
        let w = m.encode(b'W') as u32;
        let a = m.encode(b'A') as u32;
        let ww = w * 20 + w;
        let aw = a * 20 + w;
        let (scores, codes) = t.row(ww);
        let i = codes.iter().position(|&c| c == aw).unwrap();
        assert_eq!(scores[i], m.score(w as u8, a as u8) + m.score(w as u8, w as u8));
        // ties keep ascending code order
        for pair in scores.windows(2).zip(codes.windows(2)) {
            if pair.0[0] == pair.0[1] {
                assert!(pair.1[0] < pair.1[1]);
            }
        }
    }
}

use crate::index::ext::{ExtendedScoreTable, ExtendedTables};

/// Upper bound on similar seeds generated for one query position.
pub const MAX_NEIGHBORS_PER_POSITION: usize = 16_384;

/// Split a k-mer into parts of 3 and 2 (3s first): 4 = 2+2, 5 = 3+2, 6 = 3+3, 7 = 3+2+2.
pub fn split_parts(k: usize) -> Vec<usize> {
    let (threes, twos) = match k % 3 {
        0 => (k / 3, 0),
        1 => ((k / 3).saturating_sub(1), 2),
        _ => (k / 3, 1),
    };
    let mut parts = vec![3; threes];
    parts.extend(std::iter::repeat(2).take(twos));
    parts
}

/// 相似 k-mer 邻域生成器。
///
/// 把查询种子拆成若干 2/3-mer 片段，逐片段按扩展表的降序行做深度优先组合；
/// 当「已累计分数 + 当前片段分数 + 其余片段的最大可能分数」低于阈值时剪枝。
pub struct NeighborGenerator<'a> {
    tables: &'a ExtendedTables,
    alphabet: usize,
    threshold: i32,
    cap: usize,
    parts: Vec<usize>,
    part_codes: Vec<u32>,
    rest_max: Vec<i32>,
    out: Vec<(u32, i32)>,
}

impl<'a> NeighborGenerator<'a> {
    pub fn new(tables: &'a ExtendedTables, kmer_size: usize, threshold: i32) -> Self {
        let parts = split_parts(kmer_size);
        let n = parts.len();
        Self {
            tables,
            alphabet: tables.two.alphabet(),
            threshold,
            cap: MAX_NEIGHBORS_PER_POSITION,
            parts,
            part_codes: vec![0; n],
            rest_max: vec![0; n + 1],
            out: Vec::new(),
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self
    }

    /// All codes whose summed score against `letters` reaches the threshold, with that score.
    pub fn generate(&mut self, letters: &[u8]) -> &[(u32, i32)] {
        self.out.clear();
        let mut at = 0;
        for (i, &len) in self.parts.iter().enumerate() {
            let mut code = 0u32;
            for &r in &letters[at..at + len] {
                code = code * self.alphabet as u32 + r as u32;
            }
            self.part_codes[i] = code;
            at += len;
        }
        let tables = self.tables;
        for i in (0..self.parts.len()).rev() {
            let best = tables.table(self.parts[i]).row_max(self.part_codes[i]) as i32;
            self.rest_max[i] = self.rest_max[i + 1] + best;
        }
        if self.rest_max[0] >= self.threshold {
            self.expand(0, 0, 0);
        }
        &self.out
    }

    fn expand(&mut self, depth: usize, prefix: u32, score: i32) {
        let tables = self.tables;
        let table: &ExtendedScoreTable = tables.table(self.parts[depth]);
        let (scores, codes) = table.row(self.part_codes[depth]);
        let needed = self.threshold - score - self.rest_max[depth + 1];
        let last = depth + 1 == self.parts.len();
        let shift = table.size() as u32;
        for (&s, &c) in scores.iter().zip(codes) {
            if (s as i32) < needed || self.out.len() >= self.cap {
                break;
            }
            let code = prefix * shift + c;
            if last {
                self.out.push((code, score + s as i32));
            } else {
                self.expand(depth + 1, code, score + s as i32);
            }
        }
    }
}

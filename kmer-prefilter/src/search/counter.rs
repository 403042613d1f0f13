/// 一次种子命中：目标（分片内编号）与对角线。`count` 在压缩后可大于 1。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiagonalHit {
    target: u32,
    diagonal: i32,
    count: u16,
}

/// Best-supported diagonal of one target after a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagonalCandidate {
    pub target: u32,
    pub diagonal: i32,
    pub count: u16,
}

/// 有界的 `(target, diagonal)` 累加器，按查询复用。
///
/// 写满时先合并相同键并丢弃只有一个种子的条目；若压缩后仍接近写满，
/// 本查询后续的命中直接丢弃。每次写满都记为一次 overflow。
#[derive(Debug)]
pub struct DiagonalCounter {
    capacity: usize,
    hits: Vec<DiagonalHit>,
    saturated: bool,
    overflows: u64,
    dropped: u64,
}

impl DiagonalCounter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self { capacity, hits: Vec::with_capacity(capacity), saturated: false, overflows: 0, dropped: 0 }
    }

    /// Forget the previous query; keeps the allocation.
    pub fn reset(&mut self) {
        self.hits.clear();
        self.saturated = false;
        self.overflows = 0;
        self.dropped = 0;
    }

    #[inline]
    pub fn add(&mut self, target: u32, diagonal: i32) {
        if self.hits.len() == self.capacity {
            if self.saturated {
                self.dropped += 1;
                return;
            }
            self.compact();
            if self.hits.len() >= self.capacity - self.capacity / 4 {
                self.saturated = true;
            }
            if self.hits.len() == self.capacity {
                self.dropped += 1;
                return;
            }
        }
        self.hits.push(DiagonalHit { target, diagonal, count: 1 });
    }

    /// Overflow events of the current query.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Hits discarded because the counter stayed full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn merge_runs(&mut self) {
        self.hits.sort_unstable_by_key(|h| (h.target, h.diagonal));
        let mut w = 0usize;
        for r in 0..self.hits.len() {
            let h = self.hits[r];
            if w > 0 && self.hits[w - 1].target == h.target && self.hits[w - 1].diagonal == h.diagonal {
                self.hits[w - 1].count = self.hits[w - 1].count.saturating_add(h.count);
            } else {
                self.hits[w] = h;
                w += 1;
            }
        }
        self.hits.truncate(w);
    }

    fn compact(&mut self) {
        self.overflows += 1;
        self.merge_runs();
        self.hits.retain(|h| h.count > 1);
    }

    /// 每个目标取种子数最多的对角线（同数取较小对角线），按目标编号升序输出。
    pub fn finish(&mut self, out: &mut Vec<DiagonalCandidate>) {
        out.clear();
        self.merge_runs();
        for h in &self.hits {
            match out.last_mut() {
                Some(last) if last.target == h.target => {
                    // runs are sorted by diagonal, so a tie keeps the smaller one
                    if h.count > last.count {
                        last.diagonal = h.diagonal;
                        last.count = h.count;
                    }
                }
                _ => out.push(DiagonalCandidate { target: h.target, diagonal: h.diagonal, count: h.count }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_diagonal_per_target() {
        let mut c = DiagonalCounter::new(64);
        for (t, d) in [(3, 5), (1, -2), (3, 5), (3, 1), (1, 4), (1, -2), (1, 4)] {
            c.add(t, d);
        }
        let mut out = Vec::new();
        c.finish(&mut out);
        assert_eq!(
            out,
            vec![
                DiagonalCandidate { target: 1, diagonal: -2, count: 2 },
                DiagonalCandidate { target: 3, diagonal: 5, count: 2 },
            ]
        );
        assert_eq!(c.overflows(), 0);
    }

    #[test]
    fn overflow_discards_singletons() {
        let mut c = DiagonalCounter::new(8);
        // four repeated hits on target 0, then singletons
        for _ in 0..4 {
            c.add(0, 0);
        }
        for t in 1..=4 {
            c.add(t, 0);
        }
        // full: the next add compacts away the singletons
        c.add(9, 1);
        assert_eq!(c.overflows(), 1);
        let mut out = Vec::new();
        c.finish(&mut out);
        assert_eq!(out[0], DiagonalCandidate { target: 0, diagonal: 0, count: 4 });
        assert_eq!(out.last().map(|h| h.target), Some(9));
        assert!(out.iter().all(|h| !(1..=4).contains(&h.target)));
    }

    #[test]
    fn saturated_counter_drops_hits() {
        let mut c = DiagonalCounter::new(4);
        for t in 0..4 {
            c.add(t, 0);
            c.add(t, 0);
        }
        // compaction frees too little room, later hits are dropped
        c.add(7, 0);
        c.add(8, 0);
        assert!(c.dropped() >= 2);
        let mut out = Vec::new();
        c.finish(&mut out);
        assert_eq!(out.len(), 4);
        c.reset();
        assert_eq!(c.overflows(), 0);
        c.finish(&mut out);
        assert!(out.is_empty());
    }
}

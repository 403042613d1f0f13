use log::info;

/// 每个工作线程独立累加的匹配统计，分片结束时合并一次。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub queries: u64,
    pub query_residues: u64,
    /// Query seed positions that were looked up.
    pub seeds: u64,
    /// Codes looked up (seeds plus generated neighbours).
    pub lookups: u64,
    /// Postings visited.
    pub db_matches: u64,
    /// Targets with at least two seeds on one diagonal.
    pub double_matches: u64,
    pub diagonal_overflows: u64,
    pub dropped_hits: u64,
    pub result_lengths: Vec<u32>,
    pub empty_results: u64,
}

impl RunStats {
    pub fn merge(&mut self, other: &RunStats) {
        self.queries += other.queries;
        self.query_residues += other.query_residues;
        self.seeds += other.seeds;
        self.lookups += other.lookups;
        self.db_matches += other.db_matches;
        self.double_matches += other.double_matches;
        self.diagonal_overflows += other.diagonal_overflows;
        self.dropped_hits += other.dropped_hits;
        self.result_lengths.extend_from_slice(&other.result_lengths);
        self.empty_results += other.empty_results;
    }

    pub fn record_result(&mut self, len: usize) {
        self.result_lengths.push(len as u32);
        if len == 0 {
            self.empty_results += 1;
        }
    }

    fn per_position(&self, n: u64) -> f64 {
        if self.query_residues == 0 {
            0.0
        } else {
            n as f64 / self.query_residues as f64
        }
    }

    pub fn lookups_per_position(&self) -> f64 {
        self.per_position(self.lookups)
    }

    pub fn matches_per_position(&self) -> f64 {
        self.per_position(self.db_matches)
    }

    pub fn mean_result_len(&self) -> f64 {
        if self.result_lengths.is_empty() {
            return 0.0;
        }
        self.result_lengths.iter().map(|&l| l as f64).sum::<f64>() / self.result_lengths.len() as f64
    }

    pub fn median_result_len(&self) -> u32 {
        if self.result_lengths.is_empty() {
            return 0;
        }
        let mut v = self.result_lengths.clone();
        let mid = v.len() / 2;
        *v.select_nth_unstable(mid).1
    }

    pub fn log_summary(&self, label: &str) {
        info!(
            "{}: {} queries, {:.2} k-mers per position, {:.2} DB matches per position, {} double matches, {} overflows",
            label,
            self.queries,
            self.lookups_per_position(),
            self.matches_per_position(),
            self.double_matches,
            self.diagonal_overflows
        );
        info!(
            "{}: {:.1} hits per query on average, median {}, {} queries without hits",
            label,
            self.mean_result_len(),
            self.median_result_len(),
            self.empty_results
        );
    }
}

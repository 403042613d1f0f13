use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::PrefilterError;
use crate::plan::SplitAxis;
use crate::util::mask::MaskMode;
use crate::util::seed::SeedPattern;

/// Positions are stored as `u16` in postings.
pub const MAX_SEQ_LEN_LIMIT: usize = u16::MAX as usize + 1;

/// 覆盖度模式：候选目标是否可能满足最小覆盖度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum CovMode {
    /// Both query and target must be coverable.
    Bidirectional,
    /// Only the target coverage counts; never rejects before alignment.
    Target,
    /// Only the query coverage counts.
    Query,
    /// Target length relative to query length.
    Length,
}

impl CovMode {
    /// Length-only check: can an alignment between these lengths reach `threshold`?
    pub fn can_be_covered(self, threshold: f32, query_len: f32, target_len: f32) -> bool {
        match self {
            CovMode::Bidirectional => {
                query_len / target_len >= threshold && target_len / query_len >= threshold
            }
            CovMode::Query => target_len / query_len >= threshold,
            CovMode::Length => target_len / query_len >= threshold && target_len / query_len <= 1.0,
            CovMode::Target => true,
        }
    }
}

/// 一次 prefilter 运行的全部参数，构造后不可变，以引用方式传入各组件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefilterConfig {
    /// k-mer size, `0` chooses it from the target residue count.
    pub kmer_size: usize,
    /// Explicit spaced seed mask (e.g. `"1101011"`), overrides `spaced_kmer`.
    pub spaced_pattern: Option<String>,
    /// Use the built-in spaced pattern for the chosen k.
    pub spaced_kmer: bool,
    pub sensitivity: f32,
    /// Fixed k-mer score threshold instead of the sensitivity table.
    pub kmer_score: Option<i32>,
    pub max_results: usize,
    /// Number of best hits skipped before `max_results` are reported.
    pub result_offset: usize,
    pub coverage: f32,
    pub cov_mode: CovMode,
    /// `0` lets the planner decide.
    pub split: usize,
    /// `None` lets the planner decide.
    pub split_axis: Option<SplitAxis>,
    /// `0` uses every core.
    pub threads: usize,
    /// Bytes, `0` uses the total system memory.
    pub memory_limit: u64,
    pub diagonal_scoring: bool,
    pub min_diag_score: i32,
    /// Report each query as a hit of itself when its key exists in the target set.
    pub include_identical: bool,
    pub mask_mode: MaskMode,
    pub exact_kmer_matching: bool,
    pub max_seq_len: usize,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            kmer_size: 0,
            spaced_pattern: None,
            spaced_kmer: false,
            sensitivity: 4.0,
            kmer_score: None,
            max_results: 300,
            result_offset: 0,
            coverage: 0.0,
            cov_mode: CovMode::Bidirectional,
            split: 0,
            split_axis: None,
            threads: 0,
            memory_limit: 0,
            diagonal_scoring: true,
            min_diag_score: 15,
            include_identical: false,
            mask_mode: MaskMode::None,
            exact_kmer_matching: false,
            max_seq_len: MAX_SEQ_LEN_LIMIT,
        }
    }
}

impl PrefilterConfig {
    pub fn validate(&self) -> Result<(), PrefilterError> {
        if !(1.0..=9.0).contains(&self.sensitivity) {
            return Err(PrefilterError::config(format!(
                "sensitivity {} outside [1, 9]",
                self.sensitivity
            )));
        }
        if self.max_results == 0 {
            return Err(PrefilterError::config("max results must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.coverage) {
            return Err(PrefilterError::config(format!("coverage {} outside [0, 1]", self.coverage)));
        }
        if self.max_seq_len == 0 || self.max_seq_len > MAX_SEQ_LEN_LIMIT {
            return Err(PrefilterError::config(format!(
                "max sequence length {} outside [1, {}]",
                self.max_seq_len, MAX_SEQ_LEN_LIMIT
            )));
        }
        if self.kmer_size == 1 || self.kmer_size > 15 {
            return Err(PrefilterError::config(format!("invalid k-mer size {}", self.kmer_size)));
        }
        if let Some(p) = &self.spaced_pattern {
            let pattern = SeedPattern::parse(p).map_err(|e| PrefilterError::config(e.to_string()))?;
            if self.kmer_size != 0 && pattern.kmer_size() != self.kmer_size {
                return Err(PrefilterError::config(format!(
                    "seed pattern '{}' has weight {}, k-mer size is {}",
                    p,
                    pattern.kmer_size(),
                    self.kmer_size
                )));
            }
        }
        Ok(())
    }

    /// k fixed by the configuration (explicit size or spaced mask weight), `0` if automatic.
    pub fn requested_kmer_size(&self) -> usize {
        match (&self.spaced_pattern, self.kmer_size) {
            (_, k) if k != 0 => k,
            (Some(p), _) => SeedPattern::parse(p).map(|s| s.kmer_size()).unwrap_or(0),
            (None, _) => 0,
        }
    }

    /// Seed pattern for the resolved k-mer size.
    pub fn seed_pattern(&self, kmer_size: usize) -> Result<SeedPattern> {
        if let Some(p) = &self.spaced_pattern {
            return SeedPattern::parse(p);
        }
        if self.spaced_kmer {
            return SeedPattern::default_spaced(kmer_size);
        }
        Ok(SeedPattern::contiguous(kmer_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PrefilterConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let c = PrefilterConfig { sensitivity: 12.0, ..Default::default() };
        assert!(c.validate().is_err());
        let c = PrefilterConfig { max_results: 0, ..Default::default() };
        assert!(c.validate().is_err());
        let c = PrefilterConfig { kmer_size: 1, ..Default::default() };
        assert!(c.validate().is_err());
        let c = PrefilterConfig {
            kmer_size: 6,
            spaced_pattern: Some("11011".into()),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn pattern_fixes_kmer_size() {
        let c = PrefilterConfig { spaced_pattern: Some("110111".into()), ..Default::default() };
        assert_eq!(c.requested_kmer_size(), 5);
        assert_eq!(c.seed_pattern(5).unwrap().span(), 6);
        let c = PrefilterConfig { spaced_kmer: true, ..Default::default() };
        assert!(c.seed_pattern(6).unwrap().is_spaced());
        assert!(!PrefilterConfig::default().seed_pattern(6).unwrap().is_spaced());
    }

    #[test]
    fn coverage_modes() {
        assert!(CovMode::Bidirectional.can_be_covered(0.8, 100.0, 90.0));
        assert!(!CovMode::Bidirectional.can_be_covered(0.8, 100.0, 50.0));
        assert!(!CovMode::Query.can_be_covered(0.8, 100.0, 50.0));
        assert!(CovMode::Query.can_be_covered(0.8, 50.0, 100.0));
        assert!(CovMode::Target.can_be_covered(0.8, 100.0, 1.0));
        assert!(!CovMode::Length.can_be_covered(0.5, 100.0, 150.0));
        assert!(CovMode::Length.can_be_covered(0.5, 100.0, 60.0));
    }
}

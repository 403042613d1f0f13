//! k-mer 阈值与背景匹配概率的校准。

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::PrefilterError;
use crate::io::store::SequenceStore;
use crate::search::matcher::{Query, QueryMatcher, SearchContext};
use crate::search::stats::RunStats;

/// Queries sampled to estimate the match probability.
pub const CALIBRATION_SAMPLE: usize = 1000;
/// Fixed seed so every run samples the same queries.
pub const CALIBRATION_SEED: u64 = 1;
/// Result cap while calibrating; only the statistics are used.
const CALIBRATION_MAX_RESULTS: usize = 150_000;
/// Extra threshold for profile queries.
const PROFILE_BONUS: f64 = 17.0;

/// 经验拟合的 k-mer 阈值：`base - slope * sensitivity`，按 k 分段，截断为整数。
pub fn kmer_threshold_table(sensitivity: f32, kmer_size: usize, profile_bonus: bool) -> Result<i32, PrefilterError> {
    let (base, slope) = match kmer_size {
        5 => (123.75, 8.75),
        6 => (138.75, 8.75),
        7 => (154.75, 9.75),
        k => {
            return Err(PrefilterError::config(format!(
                "no k-mer threshold for k-mer size {}, use 5, 6 or 7 or set a k-mer score",
                k
            )))
        }
    };
    let base = if profile_bonus { base + PROFILE_BONUS } else { base };
    Ok((base - sensitivity as f64 * slope) as i32)
}

/// Deterministic sample of `min(n, 1000)` query ids (with replacement).
pub fn sample_query_ids(n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(CALIBRATION_SEED);
    (0..n.min(CALIBRATION_SAMPLE)).map(|_| rng.gen_range(0..n)).collect()
}

/// 背景匹配概率：对抽样查询取反向序列（保证与真实同源无关），以概率 1 匹配，
/// `p = doubleMatches / (Σ qLen · Σ (tLen - effK)) / 256`，下限为最小正 double。
pub fn calibrate_match_probability(ctx: &SearchContext<'_>, queries: &dyn SequenceStore) -> f64 {
    let mut settings = ctx.settings.clone();
    settings.match_probability = 1.0;
    settings.include_identical = false;
    settings.diagonal_scoring = false;
    settings.max_results = CALIBRATION_MAX_RESULTS;
    let cal = SearchContext {
        index: ctx.index,
        tables: ctx.tables,
        matrix: ctx.matrix,
        pattern: ctx.pattern,
        query_type: ctx.query_type,
        targets: ctx.targets,
        target_offset: ctx.target_offset,
        settings,
    };

    let ids = sample_query_ids(queries.len());
    let stats = ids
        .par_iter()
        .map_init(
            || (QueryMatcher::new(&cal), Vec::new()),
            |(matcher, reversed), &id| {
                reversed.clear();
                reversed.extend(queries.data(id).iter().rev());
                let mut st = RunStats::default();
                matcher.match_query(Query { key: u32::MAX, residues: &reversed[..], profile: None }, &mut st);
                st.result_lengths.clear();
                st
            },
        )
        .reduce(RunStats::default, |mut a, b| {
            a.merge(&b);
            a
        });

    let eff_k = ctx.pattern.span();
    let target_sum: u64 = (0..ctx.index.n_targets() as usize)
        .map(|i| ctx.targets.seq_len(ctx.target_offset + i).saturating_sub(eff_k) as u64)
        .sum();

    let pairs = stats.query_residues as f64 * target_sum as f64;
    let p = if pairs > 0.0 { stats.double_matches as f64 / pairs / 256.0 } else { 0.0 };
    let p = p.max(f64::MIN_POSITIVE);
    let per_query = if ids.is_empty() { 0.0 } else { stats.lookups as f64 / ids.len() as f64 };
    info!(
        "calibration: {} sampled queries, {:.2} k-mers per query, {} double matches, k-mer match probability {:e}",
        ids.len(),
        per_query,
        stats.double_matches,
        p
    );
    p
}

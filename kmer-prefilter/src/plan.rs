//! 内存预算下的切分规划：选择 k-mer 大小、分片数与切分轴。

use std::ops::Range;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::PrefilterError;
use crate::util::seqtype::SeqType;

/// Residues per split up to which k = 6 is used.
pub const KMER6_RESIDUE_BOUND: u64 = 3_350_000_000;
/// Largest split count the optimizer tries (exclusive).
pub const MAX_SPLITS: usize = 100;
/// A plan fits when its estimate stays below this share of the budget.
pub const BUDGET_FRACTION: f64 = 0.9;

// per-item sizes of the memory model
const RESIDUE_BYTES: u64 = 7;
const TABLE_SLOT_BYTES: u64 = 8;
const POSTING_BYTES: u64 = 8;
const COUNTER_BYTES: u64 = 8;
const HIT_BYTES: u64 = 16;
const EXT_ENTRY_BYTES: u64 = 8;
const BACKGROUND_BYTES: u64 = 22;
/// Approximate bytes of one hit in the result files.
const RESULT_ENTRY_BYTES: u64 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum SplitAxis {
    /// Partition the targets; one index per split, partial results are merged.
    Target,
    /// Partition the queries; one index for all splits.
    Query,
}

/// 一个运行单元：切分轴、编号与其覆盖的编号区间。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDescriptor {
    pub axis: SplitAxis,
    pub index: usize,
    pub total: usize,
    pub range: Range<usize>,
}

/// 规划所需的集合规模与运行参数。
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub n_targets: usize,
    pub target_residues: u64,
    pub n_queries: usize,
    /// Seeding alphabet.
    pub alphabet: usize,
    pub query_type: SeqType,
    pub threads: usize,
    pub max_results: usize,
    /// `0` = automatic.
    pub kmer_size: usize,
    /// `0` = automatic.
    pub split: usize,
    pub axis: Option<SplitAxis>,
    /// Bytes; `0` = derive from the system memory.
    pub memory_limit: u64,
    pub world_size: usize,
    /// A prebuilt index covering the whole target set is available.
    pub prebuilt_index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub kmer_size: usize,
    pub split_count: usize,
    pub axis: SplitAxis,
    pub estimate: u64,
    pub budget: u64,
}

impl SplitPlan {
    /// Number of target splits, i.e. how many indexes are built.
    pub fn target_splits(&self) -> usize {
        match self.axis {
            SplitAxis::Target => self.split_count,
            SplitAxis::Query => 1,
        }
    }
}

/// Estimated bytes of the matching phase for one split.
pub fn estimate_memory(
    split: usize,
    n_entries: usize,
    residues: u64,
    max_hits: usize,
    alphabet: usize,
    kmer_size: usize,
    query_type: SeqType,
    threads: usize,
) -> u64 {
    let split = split.max(1) as u64;
    let entries_split = n_entries as u64 / split;
    let residue_bytes = residues / split * RESIDUE_BYTES;
    let table = (alphabet as u64).saturating_pow(kmer_size as u32).saturating_mul(TABLE_SLOT_BYTES);
    let per_thread = entries_split * 2 * POSTING_BYTES
        + entries_split * COUNTER_BYTES
        + max_hits as u64 * HIT_BYTES
        + entries_split * 2 * COUNTER_BYTES * 2;
    let threads_bytes = (threads as u64).saturating_mul(per_thread);
    let ext = if query_type == SeqType::AminoAcid {
        EXT_ENTRY_BYTES * ((alphabet as u64).pow(6) + (alphabet as u64).pow(4))
    } else {
        0
    };
    let background = n_entries as u64 * BACKGROUND_BYTES;
    residue_bytes
        .saturating_add(table)
        .saturating_add(threads_bytes)
        .saturating_add(background)
        .saturating_add(ext)
}

/// Bytes the result files may need (partials plus merged output).
pub fn estimate_disk(n_queries: usize, max_results: usize) -> u64 {
    2 * RESULT_ENTRY_BYTES * n_queries as u64 * max_results as u64
}

pub fn residue_upper_bound(kmer_size: usize) -> u64 {
    if kmer_size <= 6 {
        KMER6_RESIDUE_BOUND
    } else {
        u64::MAX
    }
}

/// k-mer size chosen from the residues one index has to hold.
pub fn auto_kmer_size(residues: u64) -> usize {
    if residues < KMER6_RESIDUE_BOUND {
        6
    } else {
        7
    }
}

fn fits(estimate: u64, budget: u64) -> bool {
    (estimate as f64) < BUDGET_FRACTION * budget as f64
}

/// 第一个满足预算的 (k, split) 组合；`fixed_kmer` 非零时只尝试该 k。
pub fn optimize_split(input: &PlanInput, budget: u64) -> Option<(usize, usize)> {
    let candidates: Vec<usize> = if input.kmer_size == 0 { vec![6, 7] } else { vec![input.kmer_size] };
    for split in 1..MAX_SPLITS {
        for &k in &candidates {
            if input.target_residues / split as u64 >= residue_upper_bound(k) {
                continue;
            }
            let need = estimate_memory(
                split,
                input.n_targets,
                input.target_residues,
                0,
                input.alphabet,
                k,
                input.query_type,
                input.threads,
            );
            if fits(need, budget) {
                return Some((k, split));
            }
        }
    }
    None
}

/// Explicit limit, or 90 % of the system memory.
pub fn resolve_budget(memory_limit: u64) -> u64 {
    if memory_limit > 0 {
        return memory_limit;
    }
    match crate::util::sys::total_memory() {
        Some(total) => (total as f64 * BUDGET_FRACTION) as u64,
        None => {
            warn!("cannot determine the system memory, planning without a memory limit");
            u64::MAX
        }
    }
}

/// 规划：单分片能放下则不切分；否则按分片数递增搜索。
pub fn plan_splits(input: &PlanInput) -> Result<SplitPlan, PrefilterError> {
    let budget = resolve_budget(input.memory_limit);
    let single_k = if input.kmer_size == 0 { auto_kmer_size(input.target_residues) } else { input.kmer_size };
    let single = estimate_memory(
        1,
        input.n_targets,
        input.target_residues,
        input.max_results,
        input.alphabet,
        single_k,
        input.query_type,
        input.threads,
    );

    let (mut kmer_size, mut split, mut axis) = (input.kmer_size, input.split, input.axis);
    if !fits(single, budget) {
        let (k, s) = optimize_split(input, budget).ok_or(PrefilterError::InsufficientMemory {
            needed: single,
            budget,
        })?;
        if kmer_size == 0 {
            kmer_size = k;
        }
        if split == 0 {
            split = s;
        }
        axis = axis.or(Some(SplitAxis::Target));
    } else {
        if kmer_size == 0 {
            let per_split = input.target_residues / split.max(1) as u64;
            kmer_size = auto_kmer_size(per_split);
        }
        if split == 0 {
            split = 1;
        }
        if axis.is_none() {
            axis = Some(if input.prebuilt_index && split > 1 {
                SplitAxis::Target
            } else if input.world_size > 1 {
                SplitAxis::Query
            } else {
                SplitAxis::Target
            });
        }
    }
    let axis = axis.unwrap_or(SplitAxis::Target);
    if axis == SplitAxis::Query && split < input.world_size {
        split = input.world_size;
    }

    let index_splits = if axis == SplitAxis::Target { split } else { 1 };
    let estimate = estimate_memory(
        index_splits,
        input.n_targets,
        input.target_residues,
        input.max_results,
        input.alphabet,
        kmer_size,
        input.query_type,
        input.threads,
    );
    info!(
        "k-mer size {}, {} split(s) along the {:?} axis, estimated memory {} of {} bytes",
        kmer_size, split, axis, estimate, budget
    );
    if !fits(estimate, budget) {
        warn!(
            "the run needs more memory than the budget allows; raise the split count or set it to 0 for automatic splitting"
        );
        if input.prebuilt_index {
            warn!("a prebuilt index always covers the whole target set, rebuild it to split the targets");
        }
    }
    Ok(SplitPlan { kmer_size, split_count: split, axis, estimate, budget })
}

/// Warn when the output directory is unlikely to hold the results.
pub fn check_disk_space(dir: &std::path::Path, n_queries: usize, max_results: usize) {
    let needed = estimate_disk(n_queries, max_results);
    match crate::util::sys::free_space(dir) {
        Some(free) if free < needed => warn!(
            "results may need {} bytes but only {} bytes are free in '{}'",
            needed,
            free,
            dir.display()
        ),
        Some(_) => {}
        None => warn!("cannot determine free disk space of '{}'", dir.display()),
    }
}

/// 按残基数把 `lengths` 切成 `parts` 段，返回第 `rank` 段的编号区间。
///
/// - `parts == 1`：全部
/// - 条目数不超过 `parts`：第 `rank` 段至多一条
/// - 否则顺序累加，当前段残基数达到 `ceil(R / parts)` 后换下一段
pub fn decompose_by_residues(lengths: &[usize], rank: usize, parts: usize) -> Result<Range<usize>, PrefilterError> {
    let n = lengths.len();
    let total: u64 = lengths.iter().map(|&l| l as u64).sum();
    if parts == 1 {
        return Ok(0..n);
    }
    if parts == 0 || parts as u64 > total {
        return Err(PrefilterError::config(format!(
            "cannot split {} residues into {} parts",
            total, parts
        )));
    }
    if n <= parts {
        return Ok(if rank < n { rank..rank + 1 } else { n..n });
    }
    let chunk = total.div_ceil(parts as u64);
    let mut counts = vec![0usize; parts];
    let mut current = 0usize;
    let mut assigned = 0u64;
    for &len in lengths {
        if assigned >= chunk && current + 1 < parts {
            assigned = 0;
            current += 1;
        }
        assigned += len as u64;
        counts[current] += 1;
    }
    let start: usize = counts[..rank.min(parts)].iter().sum();
    let len = counts.get(rank).copied().unwrap_or(0);
    Ok(start..start + len)
}

/// All ranges of a residue-based decomposition, in order.
pub fn split_ranges(lengths: &[usize], parts: usize) -> Result<Vec<Range<usize>>, PrefilterError> {
    (0..parts).map(|r| decompose_by_residues(lengths, r, parts)).collect()
}

/// Contiguous block of `total` items owned by `rank` (counts differ by at most one).
pub fn static_range(total: usize, rank: usize, world: usize) -> Range<usize> {
    let world = world.max(1);
    let base = total / world;
    let extra = total % world;
    let start = rank * base + rank.min(extra);
    let len = base + usize::from(rank < extra);
    start..start + len
}

/// Result cap of one of `splits` target splits.
pub fn per_split_max_results(max_results: usize, splits: usize) -> usize {
    if splits <= 1 {
        return max_results;
    }
    let share = max_results / splits;
    let spread = (4.0 * (max_results as f64 / splits as f64).sqrt()) as usize;
    share + spread.max(1)
}

//! prefilter 运行流程：规划 → 每个分片（建索引 → 校准 → 匹配 → 写出）→ 合并。
//!
//! 多进程运行时每个 rank 只处理静态分配给它的分片，rank 0 负责最终合并。

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use log::{debug, info, warn};
use rayon::ThreadPool;

use crate::config::PrefilterConfig;
use crate::dist::{Communicator, RankStatus};
use crate::error::PrefilterError;
use crate::index::builder::{IndexBuilder, IndexParams};
use crate::index::ext::ExtendedTables;
use crate::index::snapshot::{IndexMeta, IndexSnapshot};
use crate::index::table::SeedIndex;
use crate::io::result::{write_result_file, ResultEntry, ResultHeader};
use crate::io::store::SequenceStore;
use crate::merge::{merge_and_cleanup, merge_into, write_resolved, MergeSummary, ResultWindow};
use crate::plan::{
    auto_kmer_size, check_disk_space, per_split_max_results, plan_splits, split_ranges, static_range, PlanInput,
    SplitAxis, SplitDescriptor, SplitPlan,
};
use crate::search::calibrate::calibrate_match_probability;
use crate::search::matcher::{MatchSettings, Query, QueryMatcher, SearchContext};
use crate::search::stats::RunStats;
use crate::util::mask::MaskMode;
use crate::util::matrix::SubstitutionMatrix;
use crate::util::seed::SeedPattern;
use crate::util::seqtype::{check_pairing, takes_only_best_kmer, SeqType};
use crate::util::sys::resolve_threads;

/// Queries a worker claims from the shared cursor at a time.
pub const QUERY_CHUNK: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Config,
    Memory,
    NoResults,
    RankFailed,
    Io,
}

impl AbortReason {
    pub fn of(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<PrefilterError>() {
            Some(PrefilterError::IncompatibleConfig(_)) => AbortReason::Config,
            Some(PrefilterError::InsufficientMemory { .. }) => AbortReason::Memory,
            Some(PrefilterError::NoResults { .. }) => AbortReason::NoResults,
            Some(PrefilterError::RankFailed { .. }) => AbortReason::RankFailed,
            None => AbortReason::Io,
        }
    }
}

/// 运行阶段。任何阶段出错都直接进入 `Aborted`，不会重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Planned,
    BuildingIndex { split: usize },
    Matching { split: usize },
    Writing { split: usize },
    Merging,
    Done,
    Aborted(AbortReason),
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Planned => write!(f, "planned"),
            RunPhase::BuildingIndex { split } => write!(f, "building index of split {}", split),
            RunPhase::Matching { split } => write!(f, "matching split {}", split),
            RunPhase::Writing { split } => write!(f, "writing split {}", split),
            RunPhase::Merging => write!(f, "merging"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Aborted(r) => write!(f, "aborted ({:?})", r),
        }
    }
}

/// 由序列类型与配置推导出的种子参数。
#[derive(Debug, Clone)]
pub struct Seeding {
    pub pattern: SeedPattern,
    pub alphabet: usize,
    /// Neighbor score threshold while matching.
    pub kmer_threshold: i32,
    /// Self-score filter of indexed seeds.
    pub index_threshold: i32,
    pub exact: bool,
    pub with_tables: bool,
    pub with_lookup: bool,
    pub mask_mode: MaskMode,
}

impl Seeding {
    pub fn resolve(
        config: &PrefilterConfig,
        matrix: &SubstitutionMatrix,
        query_type: SeqType,
        target_type: SeqType,
        kmer_size: usize,
    ) -> Result<Self, PrefilterError> {
        let pattern = config.seed_pattern(kmer_size).map_err(|e| PrefilterError::config(e.to_string()))?;
        if pattern.kmer_size() != kmer_size {
            return Err(PrefilterError::config(format!(
                "seed pattern {} has weight {}, expected {}",
                pattern,
                pattern.kmer_size(),
                kmer_size
            )));
        }
        let alphabet = target_type.strategy().seed_alphabet(matrix.alphabet_size());
        let exact = takes_only_best_kmer(query_type, target_type, config.exact_kmer_matching);
        let threshold_type = if target_type == SeqType::Profile { target_type } else { query_type };
        let kmer_threshold =
            threshold_type.strategy().inclusion_threshold(config.sensitivity, kmer_size, config.kmer_score)?;
        let index_threshold = if query_type.is_profile()
            || query_type == SeqType::Nucleotide
            || (exact && target_type != SeqType::Profile)
        {
            0
        } else {
            kmer_threshold
        };
        let mask_mode = if target_type.is_profile() { MaskMode::None } else { config.mask_mode };
        Ok(Self {
            pattern,
            alphabet,
            kmer_threshold,
            index_threshold,
            exact,
            with_tables: query_type.strategy().expands_neighbors() && !exact,
            with_lookup: config.diagonal_scoring,
            mask_mode,
        })
    }

    pub fn meta(&self, matrix: &SubstitutionMatrix, target_type: SeqType, n_targets: usize) -> IndexMeta {
        IndexMeta {
            kmer_size: self.pattern.kmer_size(),
            alphabet_size: self.alphabet,
            seed_pattern: self.pattern.to_string(),
            kmer_threshold: self.index_threshold,
            mask_mode: self.mask_mode,
            matrix_name: matrix.name.clone(),
            target_type,
            n_targets: n_targets as u32,
            has_lookup: self.with_lookup,
        }
    }

    fn index_params<'a>(
        &'a self,
        matrix: &'a SubstitutionMatrix,
        target_type: SeqType,
        max_seq_len: usize,
    ) -> IndexParams<'a> {
        IndexParams {
            matrix,
            pattern: &self.pattern,
            target_type,
            threshold: self.index_threshold,
            mask_mode: self.mask_mode,
            with_lookup: self.with_lookup,
            max_seq_len,
        }
    }
}

fn log_index_size(index: &SeedIndex, tables: Option<&ExtendedTables>) {
    info!(
        "index built: {} targets, ~{} MiB; extended tables ~{} MiB",
        index.n_targets(),
        index.approx_bytes() >> 20,
        tables.map_or(0, ExtendedTables::approx_bytes) >> 20
    );
}

fn build_pool(threads: usize) -> Result<ThreadPool> {
    let n = resolve_threads(threads);
    debug!("using {} worker threads", n);
    Ok(rayon::ThreadPoolBuilder::new().num_threads(n).build()?)
}

/// 为整个目标库构建可复用的索引快照。
pub fn build_snapshot(
    config: &PrefilterConfig,
    matrix: &SubstitutionMatrix,
    targets: &dyn SequenceStore,
    query_type: SeqType,
) -> Result<IndexSnapshot> {
    config.validate()?;
    check_pairing(query_type, targets.seq_type())?;
    let k = match config.requested_kmer_size() {
        0 => auto_kmer_size(targets.total_residues()),
        k => k,
    };
    let seeding = Seeding::resolve(config, matrix, query_type, targets.seq_type(), k)?;
    let pool = build_pool(config.threads)?;
    let (index, tables) = pool.install(|| -> Result<_> {
        let builder = IndexBuilder::new(seeding.index_params(matrix, targets.seq_type(), config.max_seq_len))?;
        let (index, _) = builder.build(targets, 0..targets.len())?;
        let tables = seeding.with_tables.then(|| ExtendedTables::build(matrix, seeding.alphabet));
        Ok((index, tables))
    })?;
    log_index_size(&index, tables.as_ref());
    let meta = seeding.meta(matrix, targets.seq_type(), targets.len());
    Ok(IndexSnapshot::new(meta, index, tables))
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub plan: SplitPlan,
    pub stats: RunStats,
    /// This rank wrote a result file.
    pub has_result: bool,
    /// Set on the rank that produced the final output.
    pub merged: Option<MergeSummary>,
}

/// 一次 prefilter 运行。
pub struct Prefilter<'a> {
    config: &'a PrefilterConfig,
    matrix: &'a SubstitutionMatrix,
    queries: &'a dyn SequenceStore,
    targets: &'a dyn SequenceStore,
    snapshot: Option<IndexSnapshot>,
    phase: RunPhase,
}

impl<'a> Prefilter<'a> {
    pub fn new(
        config: &'a PrefilterConfig,
        matrix: &'a SubstitutionMatrix,
        queries: &'a dyn SequenceStore,
        targets: &'a dyn SequenceStore,
    ) -> Result<Self, PrefilterError> {
        config.validate()?;
        check_pairing(queries.seq_type(), targets.seq_type())?;
        Ok(Self { config, matrix, queries, targets, snapshot: None, phase: RunPhase::Idle })
    }

    /// Offer a prebuilt index; it is used only when it matches the run.
    pub fn with_snapshot(mut self, snapshot: IndexSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    pub fn plan(&self, world_size: usize) -> Result<SplitPlan, PrefilterError> {
        let seed_alphabet = self.targets.seq_type().strategy().seed_alphabet(self.matrix.alphabet_size());
        plan_splits(&PlanInput {
            n_targets: self.targets.len(),
            target_residues: self.targets.total_residues(),
            n_queries: self.queries.len(),
            alphabet: seed_alphabet,
            query_type: self.queries.seq_type(),
            threads: resolve_threads(self.config.threads),
            max_results: self.config.max_results,
            kmer_size: self.config.requested_kmer_size(),
            split: self.config.split,
            axis: self.config.split_axis,
            memory_limit: self.config.memory_limit,
            world_size: world_size.max(1),
            prebuilt_index: self.snapshot.is_some(),
        })
    }

    /// Run to completion, writing the final result to `output` (on the root rank).
    pub fn run(&mut self, output: &Path, comm: &dyn Communicator) -> Result<RunSummary> {
        let result = self.run_phases(output, comm);
        match &result {
            Ok(_) => self.enter(RunPhase::Done),
            Err(e) => self.enter(RunPhase::Aborted(AbortReason::of(e))),
        }
        result
    }

    fn run_phases(&mut self, output: &Path, comm: &dyn Communicator) -> Result<RunSummary> {
        let (rank, world) = (comm.rank(), comm.size().max(1));
        let window = ResultWindow::new(self.config.result_offset, self.config.max_results);
        if world == 1 {
            let (plan, stats, partials) = self.run_rank_splits(output, comm)?;
            self.enter(RunPhase::Merging);
            if partials.is_empty() {
                return Err(PrefilterError::NoResults { ranks: 1 }.into());
            }
            let merged = merge_and_cleanup(&partials, output, plan.axis, self.targets, window)?;
            return Ok(RunSummary { plan, stats, has_result: true, merged: Some(merged) });
        }

        // every rank reaches the gather, also after a local failure
        let rank_file = scratch_path(output, &format!("rank_{}", rank));
        let local = self.run_rank_splits(output, comm).and_then(|(plan, stats, partials)| {
            if partials.is_empty() {
                return Ok((plan, stats, false));
            }
            // intermediate files of a distributed target split are merged once more at the root
            let local_window = if plan.axis == SplitAxis::Target { window.widened() } else { window };
            merge_and_cleanup(&partials, &rank_file, plan.axis, self.targets, local_window)?;
            Ok((plan, stats, true))
        });
        let status = match &local {
            Ok((_, _, true)) => RankStatus::Ready,
            Ok(_) => RankStatus::Empty,
            Err(_) => RankStatus::Failed,
        };
        let gathered = comm.gather_status(status);
        let overall = match &gathered {
            Ok(Some(all)) => RankStatus::combine(all),
            Ok(None) => status,
            Err(_) => RankStatus::Failed,
        };
        let overall = comm.broadcast_status(overall);
        if let (Ok(Some(all)), Ok(RankStatus::Failed)) = (&gathered, &overall) {
            // rank files of the ranks that did finish are not merged
            for r in (0..world).filter(|&r| all[r] == RankStatus::Ready) {
                let _ = std::fs::remove_file(scratch_path(output, &format!("rank_{}", r)));
            }
        }

        let (plan, stats, has_result) = local?;
        let gathered = gathered?;
        self.enter(RunPhase::Merging);
        let mut summary = RunSummary { plan, stats, has_result, merged: None };
        match overall? {
            RankStatus::Ready => {}
            RankStatus::Empty => return Err(PrefilterError::NoResults { ranks: world }.into()),
            RankStatus::Failed => {
                let failed: Vec<usize> = gathered
                    .map(|all| (0..world).filter(|&r| all[r] == RankStatus::Failed).collect())
                    .unwrap_or_default();
                return Err(PrefilterError::RankFailed { ranks: failed }.into());
            }
        }
        if let Some(all) = gathered {
            let files: Vec<PathBuf> = (0..world)
                .filter(|&r| all[r] == RankStatus::Ready)
                .map(|r| scratch_path(output, &format!("rank_{}", r)))
                .collect();
            info!("{} of {} ranks produced results", files.len(), world);
            summary.merged = Some(merge_into(&files, output, summary.plan.axis, self.targets, window)?);
        }
        Ok(summary)
    }

    /// 规划并处理本 rank 分到的分片，返回写出的分片文件。
    fn run_rank_splits(
        &mut self,
        output: &Path,
        comm: &dyn Communicator,
    ) -> Result<(SplitPlan, RunStats, Vec<PathBuf>)> {
        let (rank, world) = (comm.rank(), comm.size().max(1));
        let plan = self.plan(world)?;
        let seeding = Seeding::resolve(
            self.config,
            self.matrix,
            self.queries.seq_type(),
            self.targets.seq_type(),
            plan.kmer_size,
        )?;
        self.enter(RunPhase::Planned);

        if comm.is_root() {
            let dir = match output.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            check_disk_space(dir, self.queries.len(), self.config.max_results);
        }

        let pool = build_pool(self.config.threads)?;
        let window = ResultWindow::new(self.config.result_offset, self.config.max_results);
        let window = if world > 1 && plan.axis == SplitAxis::Target { window.widened() } else { window };
        let mine = static_range(plan.split_count, rank, world);
        info!(
            "rank {}/{}: splits {:?} of {} ({:?} axis)",
            rank,
            world,
            mine,
            plan.split_count,
            plan.axis
        );

        let mut stats = RunStats::default();
        let partials = match plan.axis {
            SplitAxis::Target => self.run_target_splits(&pool, &plan, &seeding, mine, output, window, &mut stats)?,
            SplitAxis::Query => self.run_query_splits(&pool, &plan, &seeding, mine, output, window, &mut stats)?,
        };
        stats.log_summary(&format!("rank {}", rank));
        Ok((plan, stats, partials))
    }

    fn take_snapshot(&mut self, requested: &IndexMeta, split_count: usize) -> Option<IndexSnapshot> {
        let snap = self.snapshot.take()?;
        match snap.meta.rebuild_reason(requested, self.queries.seq_type(), split_count) {
            None => {
                info!("using prebuilt index ({} targets)", snap.meta.n_targets);
                Some(snap)
            }
            Some(reason) => {
                info!("prebuilt index not usable, rebuilding: {}", reason);
                None
            }
        }
    }

    /// 索引与扩展表：优先复用快照，否则按 `range` 构建。
    fn prepare_index(
        &mut self,
        pool: &ThreadPool,
        seeding: &Seeding,
        range: Range<usize>,
        target_splits: usize,
        split: usize,
    ) -> Result<(SeedIndex, Option<ExtendedTables>)> {
        self.enter(RunPhase::BuildingIndex { split });
        let requested = seeding.meta(self.matrix, self.targets.seq_type(), self.targets.len());
        if let Some(snap) = self.take_snapshot(&requested, target_splits) {
            let tables = match (seeding.with_tables, snap.tables) {
                (false, _) => None,
                (true, Some(t)) => Some(t),
                (true, None) => Some(pool.install(|| ExtendedTables::build(self.matrix, seeding.alphabet))),
            };
            return Ok((snap.index, tables));
        }
        let params = seeding.index_params(self.matrix, self.targets.seq_type(), self.config.max_seq_len);
        let targets = self.targets;
        let matrix = self.matrix;
        let (index, tables) = pool.install(|| -> Result<_> {
            let (index, _) = IndexBuilder::new(params)?.build(targets, range)?;
            let tables = seeding.with_tables.then(|| ExtendedTables::build(matrix, seeding.alphabet));
            Ok((index, tables))
        })?;
        log_index_size(&index, tables.as_ref());
        Ok((index, tables))
    }

    fn match_settings(&self, seeding: &Seeding, target_splits: usize) -> MatchSettings {
        let keep = self.config.result_offset.saturating_add(self.config.max_results);
        MatchSettings {
            kmer_threshold: seeding.kmer_threshold,
            exact: seeding.exact,
            diagonal_scoring: self.config.diagonal_scoring,
            min_diag_score: self.config.min_diag_score,
            max_results: per_split_max_results(keep, target_splits),
            coverage: self.config.coverage,
            cov_mode: self.config.cov_mode,
            include_identical: self.config.include_identical,
            match_probability: 0.0,
            max_seq_len: self.config.max_seq_len,
        }
    }

    fn calibrate(&self, pool: &ThreadPool, ctx: &mut SearchContext<'_>) {
        if !ctx.settings.diagonal_scoring {
            let queries = self.queries;
            let p = pool.install(|| calibrate_match_probability(ctx, queries));
            ctx.settings.match_probability = p;
        }
    }

    fn run_target_splits(
        &mut self,
        pool: &ThreadPool,
        plan: &SplitPlan,
        seeding: &Seeding,
        mine: Range<usize>,
        output: &Path,
        window: ResultWindow,
        stats: &mut RunStats,
    ) -> Result<Vec<PathBuf>> {
        let total = plan.split_count;
        let lengths: Vec<usize> = (0..self.targets.len()).map(|i| self.targets.seq_len(i)).collect();
        let ranges = split_ranges(&lengths, total)?;
        let mut partials = Vec::new();
        for index in mine {
            let split = SplitDescriptor { axis: SplitAxis::Target, index, total, range: ranges[index].clone() };
            info!("target split {}/{}: targets {:?}", index + 1, total, split.range);
            let (seed_index, tables) = self.prepare_index(pool, seeding, split.range.clone(), total, index)?;

            self.enter(RunPhase::Matching { split: index });
            let mut ctx = SearchContext {
                index: &seed_index,
                tables: tables.as_ref(),
                matrix: self.matrix,
                pattern: &seeding.pattern,
                query_type: self.queries.seq_type(),
                targets: self.targets,
                target_offset: split.range.start,
                settings: self.match_settings(seeding, total),
            };
            self.calibrate(pool, &mut ctx);
            let (mut entries, split_stats) = self.match_queries(pool, &ctx, 0..self.queries.len());
            stats.merge(&split_stats);

            self.enter(RunPhase::Writing { split: index });
            let path = scratch_path(output, &format!("split_{}", index));
            let header = ResultHeader::partial(SplitAxis::Target, index, total, split.range.start);
            if total == 1 {
                write_resolved(&path, header, &mut entries, self.targets, window)?;
            } else {
                write_result_file(&path, header, &mut entries)?;
            }
            partials.push(path);
        }
        Ok(partials)
    }

    fn run_query_splits(
        &mut self,
        pool: &ThreadPool,
        plan: &SplitPlan,
        seeding: &Seeding,
        mine: Range<usize>,
        output: &Path,
        window: ResultWindow,
        stats: &mut RunStats,
    ) -> Result<Vec<PathBuf>> {
        let total = plan.split_count;
        let mut partials = Vec::new();
        if mine.is_empty() {
            return Ok(partials);
        }
        let lengths: Vec<usize> = (0..self.queries.len()).map(|i| self.queries.seq_len(i)).collect();
        let ranges = if self.queries.is_empty() {
            vec![0..0; total]
        } else {
            split_ranges(&lengths, total)?
        };
        let (seed_index, tables) = self.prepare_index(pool, seeding, 0..self.targets.len(), 1, mine.start)?;
        let mut ctx = SearchContext {
            index: &seed_index,
            tables: tables.as_ref(),
            matrix: self.matrix,
            pattern: &seeding.pattern,
            query_type: self.queries.seq_type(),
            targets: self.targets,
            target_offset: 0,
            settings: self.match_settings(seeding, 1),
        };
        self.calibrate(pool, &mut ctx);

        for index in mine {
            let split = SplitDescriptor { axis: SplitAxis::Query, index, total, range: ranges[index].clone() };
            info!("query split {}/{}: queries {:?}", index + 1, total, split.range);
            self.enter(RunPhase::Matching { split: index });
            let (mut entries, split_stats) = self.match_queries(pool, &ctx, split.range.clone());
            stats.merge(&split_stats);

            self.enter(RunPhase::Writing { split: index });
            let path = scratch_path(output, &format!("split_{}", index));
            let header = ResultHeader::partial(SplitAxis::Query, index, total, 0);
            write_resolved(&path, header, &mut entries, self.targets, window)?;
            partials.push(path);
        }
        Ok(partials)
    }

    /// 线程池中每个线程持有一个匹配器，从共享游标按块领取查询。
    fn match_queries(
        &self,
        pool: &ThreadPool,
        ctx: &SearchContext<'_>,
        range: Range<usize>,
    ) -> (Vec<ResultEntry>, RunStats) {
        let cursor = AtomicUsize::new(range.start);
        let end = range.end;
        let queries = self.queries;
        let outputs = pool.broadcast(|_| {
            let mut matcher = QueryMatcher::new(ctx);
            let mut entries = Vec::new();
            let mut stats = RunStats::default();
            loop {
                let start = cursor.fetch_add(QUERY_CHUNK, Ordering::Relaxed);
                if start >= end {
                    break;
                }
                for id in start..(start + QUERY_CHUNK).min(end) {
                    let query = Query { key: queries.key(id), residues: queries.data(id), profile: queries.profile(id) };
                    let hits = matcher.match_query(query, &mut stats);
                    entries.push(ResultEntry { query_key: query.key, hits: hits.to_vec() });
                }
            }
            (entries, stats)
        });

        let mut entries = Vec::with_capacity(range.len());
        let mut stats = RunStats::default();
        for (mut e, s) in outputs {
            entries.append(&mut e);
            stats.merge(&s);
        }
        if stats.diagonal_overflows > 0 {
            warn!(
                "diagonal accumulator overflowed {} times, {} hits dropped",
                stats.diagonal_overflows, stats.dropped_hits
            );
        }
        (entries, stats)
    }
}

/// Sibling of `output` named `<output>.<tag>`.
pub fn scratch_path(output: &Path, tag: &str) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}", tag));
    output.with_file_name(name)
}

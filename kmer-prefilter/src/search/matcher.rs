//! 单条查询的匹配流程：
//!
//! 1. 枚举查询种子（连续或 spaced）
//! 2. 精确查表，或经扩展表生成相似种子后查表
//! 3. 将每条命中的 `(target, qpos - tpos)` 写入有界累加器
//! 4. 对每个目标的最佳对角线打分（无间隙片段或计数概率）
//! 5. 覆盖度过滤、自身命中、排序截断

use serde::{Deserialize, Serialize};

use crate::config::CovMode;
use crate::index::ext::ExtendedTables;
use crate::index::table::SeedIndex;
use crate::io::store::SequenceStore;
use crate::search::counter::{DiagonalCandidate, DiagonalCounter};
use crate::search::neighbors::NeighborGenerator;
use crate::search::stats::RunStats;
use crate::util::matrix::SubstitutionMatrix;
use crate::util::seed::{SeedIter, SeedPattern};
use crate::util::seqtype::SeqType;

/// Score given to a query's own entry so it ranks above every other hit.
pub const SELF_HIT_SCORE: i32 = i32::MAX;

/// 一条候选命中。`target` 在分片内为局部编号，合并后为全局 key。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub target: u32,
    pub score: i32,
    pub diagonal: i32,
    pub seed_count: u16,
}

/// Ranking order of result lists: score descending, target ascending.
pub fn sort_hits(hits: &mut [Hit]) {
    hits.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.target.cmp(&b.target)));
}

/// 匹配阶段的数值参数（由配置与校准结果解析得到）。
#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub kmer_threshold: i32,
    /// Look up only the query's own seeds.
    pub exact: bool,
    pub diagonal_scoring: bool,
    pub min_diag_score: i32,
    pub max_results: usize,
    pub coverage: f32,
    pub cov_mode: CovMode,
    pub include_identical: bool,
    pub match_probability: f64,
    pub max_seq_len: usize,
}

/// Immutable state shared by every worker of one split.
pub struct SearchContext<'a> {
    pub index: &'a SeedIndex,
    pub tables: Option<&'a ExtendedTables>,
    pub matrix: &'a SubstitutionMatrix,
    pub pattern: &'a SeedPattern,
    pub query_type: SeqType,
    pub targets: &'a dyn SequenceStore,
    /// Global id of the first target of the split.
    pub target_offset: usize,
    pub settings: MatchSettings,
}

impl SearchContext<'_> {
    fn expands(&self) -> bool {
        !self.settings.exact && self.tables.is_some() && self.query_type.strategy().expands_neighbors()
    }

    /// Accumulator size for one worker: two slots per target, within sane bounds.
    pub fn counter_capacity(&self) -> usize {
        (self.index.n_targets() as usize * 2).clamp(1 << 12, 1 << 22)
    }
}

/// A query as the matcher sees it.
#[derive(Debug, Clone, Copy)]
pub struct Query<'q> {
    pub key: u32,
    pub residues: &'q [u8],
    pub profile: Option<&'q [i16]>,
}

/// 每个工作线程持有一个匹配器，缓冲区在查询之间复用。
pub struct QueryMatcher<'a> {
    ctx: &'a SearchContext<'a>,
    counter: DiagonalCounter,
    neighbors: Option<NeighborGenerator<'a>>,
    window: Vec<u8>,
    candidates: Vec<DiagonalCandidate>,
    hits: Vec<Hit>,
}

impl<'a> QueryMatcher<'a> {
    pub fn new(ctx: &'a SearchContext<'a>) -> Self {
        Self::with_capacity(ctx, ctx.counter_capacity())
    }

    pub fn with_capacity(ctx: &'a SearchContext<'a>, capacity: usize) -> Self {
        let neighbors = match ctx.tables {
            Some(t) if ctx.expands() => {
                Some(NeighborGenerator::new(t, ctx.pattern.kmer_size(), ctx.settings.kmer_threshold))
            }
            _ => None,
        };
        Self {
            ctx,
            counter: DiagonalCounter::new(capacity),
            neighbors,
            window: Vec::with_capacity(ctx.pattern.kmer_size()),
            candidates: Vec::new(),
            hits: Vec::new(),
        }
    }

    /// Ranked, bounded hit list of one query; valid until the next call.
    pub fn match_query(&mut self, query: Query<'_>, stats: &mut RunStats) -> &[Hit] {
        let ctx = self.ctx;
        let s = &ctx.settings;
        let residues = &query.residues[..query.residues.len().min(s.max_seq_len)];
        self.counter.reset();
        self.hits.clear();

        stats.queries += 1;
        stats.query_residues += residues.len() as u64;

        let alphabet = ctx.index.alphabet();
        let strategy = ctx.query_type.strategy();
        for (qpos, code) in SeedIter::new(residues, ctx.pattern, strategy, alphabet) {
            stats.seeds += 1;
            match self.neighbors.as_mut() {
                Some(generator) => {
                    ctx.pattern.gather(residues, qpos, &mut self.window);
                    for &(ncode, _) in generator.generate(&self.window) {
                        stats.lookups += 1;
                        let postings = ctx.index.postings(ncode);
                        stats.db_matches += postings.len() as u64;
                        for p in postings {
                            self.counter.add(p.target_id, qpos as i32 - p.pos as i32);
                        }
                    }
                }
                None => {
                    stats.lookups += 1;
                    let postings = ctx.index.postings(code);
                    stats.db_matches += postings.len() as u64;
                    for p in postings {
                        self.counter.add(p.target_id, qpos as i32 - p.pos as i32);
                    }
                }
            }
        }
        stats.diagonal_overflows += self.counter.overflows();
        stats.dropped_hits += self.counter.dropped();

        self.counter.finish(&mut self.candidates);
        stats.double_matches += self.candidates.iter().filter(|c| c.count >= 2).count() as u64;

        let eff_k = ctx.pattern.span();
        let qlen = residues.len();
        for i in 0..self.candidates.len() {
            let c = self.candidates[i];
            let global = ctx.target_offset + c.target as usize;
            let tlen = ctx.targets.seq_len(global).min(s.max_seq_len);
            if s.coverage > 0.0 && !s.cov_mode.can_be_covered(s.coverage, qlen as f32, tlen as f32) {
                continue;
            }
            let score = if s.diagonal_scoring {
                let score = self.ungapped_score(residues, query.profile, global, c);
                if score < s.min_diag_score {
                    continue;
                }
                score
            } else {
                if c.count < 2 {
                    continue;
                }
                poisson_score(s.match_probability, qlen, tlen, eff_k, c.count)
            };
            self.hits.push(Hit { target: c.target, score, diagonal: c.diagonal, seed_count: c.count });
        }

        if s.include_identical {
            self.add_self_hit(query.key);
        }

        sort_hits(&mut self.hits);
        self.hits.truncate(s.max_results);
        stats.record_result(self.hits.len());
        &self.hits
    }

    fn add_self_hit(&mut self, key: u32) {
        let ctx = self.ctx;
        let Some(global) = ctx.targets.id_of_key(key) else {
            return;
        };
        if global < ctx.target_offset || global >= ctx.target_offset + ctx.index.n_targets() as usize {
            return;
        }
        let local = (global - ctx.target_offset) as u32;
        match self.hits.iter_mut().find(|h| h.target == local) {
            Some(h) => {
                h.score = SELF_HIT_SCORE;
                h.diagonal = 0;
            }
            None => {
                let seed_count = self
                    .candidates
                    .binary_search_by_key(&local, |c| c.target)
                    .map(|i| self.candidates[i].count)
                    .unwrap_or(0);
                self.hits.push(Hit { target: local, score: SELF_HIT_SCORE, diagonal: 0, seed_count });
            }
        }
    }

    /// 沿对角线的最大无间隙片段得分（Kadane），受两条序列长度约束。
    fn ungapped_score(&self, query: &[u8], profile: Option<&[i16]>, global: usize, c: DiagonalCandidate) -> i32 {
        let ctx = self.ctx;
        let target = match ctx.index.lookup() {
            Some(l) => l.sequence(c.target as usize),
            None => {
                let t = ctx.targets.data(global);
                &t[..t.len().min(ctx.settings.max_seq_len)]
            }
        };
        let (qstart, tstart) = if c.diagonal >= 0 {
            (c.diagonal as usize, 0)
        } else {
            (0, c.diagonal.unsigned_abs() as usize)
        };
        if qstart >= query.len() || tstart >= target.len() {
            return 0;
        }
        let len = (query.len() - qstart).min(target.len() - tstart);
        let strategy = ctx.query_type.strategy();
        let mut best = 0;
        let mut cur = 0;
        for i in 0..len {
            let s = strategy.score_lookup(ctx.matrix, query, profile, qstart + i, target[tstart + i]);
            cur = (cur + s).max(0);
            best = best.max(cur);
        }
        best
    }
}

/// `-ln P[Poisson(lambda) >= count]`, leading term, `lambda = p * Lq * Lt`.
/// Zero once the expected count reaches `count`.
pub fn poisson_score(p: f64, qlen: usize, tlen: usize, eff_k: usize, count: u16) -> i32 {
    let lq = qlen.saturating_sub(eff_k).max(1) as f64;
    let lt = tlen.saturating_sub(eff_k).max(1) as f64;
    let lambda = (p * lq * lt).max(f64::MIN_POSITIVE);
    let c = count as f64;
    if lambda >= c {
        return 0;
    }
    let ln_fact: f64 = (2..=count as u32).map(|i| (i as f64).ln()).sum();
    let log_p = c * lambda.ln() - lambda - ln_fact;
    let score = (-log_p).round();
    score.clamp(i32::MIN as f64 + 1.0, i32::MAX as f64 - 1.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builder::{IndexBuilder, IndexParams};
    use crate::io::store::MemoryStore;
    use crate::util::mask::MaskMode;

    fn settings() -> MatchSettings {
        MatchSettings {
            kmer_threshold: 0,
            exact: true,
            diagonal_scoring: true,
            min_diag_score: 6,
            max_results: 10,
            coverage: 0.0,
            cov_mode: CovMode::Bidirectional,
            include_identical: false,
            match_probability: 1e-6,
            max_seq_len: 65536,
        }
    }

    fn nucleotide_db(seqs: &[&[u8]]) -> (SubstitutionMatrix, MemoryStore) {
        let m = SubstitutionMatrix::nucleotide(2, 3);
        let mut s = MemoryStore::new(SeqType::Nucleotide, &m.name);
        for (i, q) in seqs.iter().enumerate() {
            s.push(i as u32, "t", &m.encode_seq(q)).unwrap();
        }
        (m, s)
    }

    fn index(m: &SubstitutionMatrix, p: &SeedPattern, s: &MemoryStore) -> SeedIndex {
        let params = IndexParams {
            matrix: m,
            pattern: p,
            target_type: SeqType::Nucleotide,
            threshold: 0,
            mask_mode: MaskMode::None,
            with_lookup: true,
            max_seq_len: 65536,
        };
        IndexBuilder::new(params).unwrap().build(s, 0..s.len()).unwrap().0
    }

    #[test]
    fn finds_shifted_copy_on_its_diagonal() {
        let (m, s) = nucleotide_db(&[b"TTTTTTTTTT", b"GGACGTACGATCAG"]);
        let p = SeedPattern::contiguous(4);
        let idx = index(&m, &p, &s);
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::Nucleotide,
            targets: &s,
            target_offset: 0,
            settings: settings(),
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let q = m.encode_seq(b"ACGTACGATC");
        let hits = matcher.match_query(Query { key: 99, residues: &q, profile: None }, &mut stats).to_vec();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target, 1);
        // query starts at target position 2
        assert_eq!(hits[0].diagonal, -2);
        assert_eq!(hits[0].score, 20);
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.query_residues, 10);
    }

    #[test]
    fn self_hit_is_promoted_and_inserted() {
        let (m, s) = nucleotide_db(&[b"ACGTACGATC", b"ACGTACGATC", b"CCCCCCCC"]);
        let p = SeedPattern::contiguous(4);
        let idx = index(&m, &p, &s);
        let mut st = settings();
        st.include_identical = true;
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::Nucleotide,
            targets: &s,
            target_offset: 0,
            settings: st,
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let q = s.data(1).to_vec();
        let hits = matcher.match_query(Query { key: 1, residues: &q, profile: None }, &mut stats).to_vec();
        assert_eq!(hits[0], Hit { target: 1, score: SELF_HIT_SCORE, diagonal: 0, seed_count: hits[0].seed_count });
        assert_eq!(hits[1].target, 0);

        // no seed shared with target 2, still reported as its own hit
        let q = s.data(2).to_vec();
        let hits = matcher.match_query(Query { key: 2, residues: &q, profile: None }, &mut stats).to_vec();
        assert_eq!(hits[0].target, 2);
        assert_eq!(hits[0].score, SELF_HIT_SCORE);
    }

    #[test]
    fn results_are_truncated_and_ordered() {
        let (m, s) = nucleotide_db(&[b"ACGTACGATC", b"ACGTACGATC", b"ACGTACGATC", b"ACGTAC"]);
        let p = SeedPattern::contiguous(4);
        let idx = index(&m, &p, &s);
        let mut st = settings();
        st.max_results = 2;
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::Nucleotide,
            targets: &s,
            target_offset: 0,
            settings: st,
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let q = s.data(0).to_vec();
        let hits = matcher.match_query(Query { key: 0, residues: &q, profile: None }, &mut stats).to_vec();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].target, 0);
        assert_eq!(hits[1].target, 1);
        assert_eq!(hits[0].score, hits[1].score);
    }

    #[test]
    fn coverage_filters_short_targets() {
        let (m, s) = nucleotide_db(&[b"ACGTACGATCGGATCCATGC", b"ACGTACGATC"]);
        let p = SeedPattern::contiguous(4);
        let idx = index(&m, &p, &s);
        let mut st = settings();
        st.coverage = 0.8;
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::Nucleotide,
            targets: &s,
            target_offset: 0,
            settings: st,
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let q = s.data(0).to_vec();
        let hits = matcher.match_query(Query { key: 0, residues: &q, profile: None }, &mut stats).to_vec();
        assert_eq!(hits.iter().map(|h| h.target).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn count_mode_needs_double_matches() {
        let (m, s) = nucleotide_db(&[b"ACGTACGATCGG", b"TTTTACGTTTTT"]);
        let p = SeedPattern::contiguous(4);
        let idx = index(&m, &p, &s);
        let mut st = settings();
        st.diagonal_scoring = false;
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::Nucleotide,
            targets: &s,
            target_offset: 0,
            settings: st,
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let q = m.encode_seq(b"ACGTACGATC");
        let hits = matcher.match_query(Query { key: 7, residues: &q, profile: None }, &mut stats).to_vec();
        // target 1 shares only ACGT
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target, 0);
        assert!(hits[0].seed_count >= 2);
        assert_eq!(stats.double_matches, 1);
    }

    fn protein(len: usize, seed: u32) -> Vec<u8> {
        let letters = b"ACDEFGHIKLMNPQRSTVWY";
        let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(3);
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                letters[(x >> 16) as usize % 20]
            })
            .collect()
    }

    /// Every third residue swapped for a similar one, so no 5-mer survives unchanged.
    fn diverged(seq: &[u8]) -> Vec<u8> {
        let similar = |c: u8| match c {
            b'I' => b'V',
            b'V' => b'I',
            b'L' => b'M',
            b'M' => b'L',
            b'K' => b'R',
            b'R' => b'K',
            b'E' => b'D',
            b'D' => b'E',
            b'S' => b'T',
            b'T' => b'S',
            b'F' => b'Y',
            b'Y' => b'F',
            b'N' => b'D',
            b'Q' => b'E',
            b'A' => b'S',
            _ => b'A',
        };
        seq.iter().enumerate().map(|(i, &c)| if i % 3 == 2 { similar(c) } else { c }).collect()
    }

    #[test]
    fn similar_seeds_reach_a_diverged_protein() {
        let m = SubstitutionMatrix::blosum62();
        let base = protein(120, 1);
        let mut s = MemoryStore::new(SeqType::AminoAcid, &m.name);
        s.push(0, "homologue", &m.encode_seq(&diverged(&base))).unwrap();
        s.push(1, "unrelated", &m.encode_seq(&protein(120, 2))).unwrap();
        let p = SeedPattern::contiguous(5);
        let params = IndexParams {
            matrix: &m,
            pattern: &p,
            target_type: SeqType::AminoAcid,
            threshold: 0,
            mask_mode: MaskMode::None,
            with_lookup: true,
            max_seq_len: 65536,
        };
        let idx = IndexBuilder::new(params).unwrap().build(&s, 0..s.len()).unwrap().0;
        assert_eq!(idx.alphabet(), 20);
        let tables = ExtendedTables::build(&m, 20);
        let q = m.encode_seq(&base);
        let mut st = settings();
        st.kmer_threshold = 80;
        st.min_diag_score = 400;
        let query = Query { key: 9, residues: &q, profile: None };

        // identical seeds alone never hit the homologue
        st.exact = true;
        let ctx = SearchContext {
            index: &idx,
            tables: None,
            matrix: &m,
            pattern: &p,
            query_type: SeqType::AminoAcid,
            targets: &s,
            target_offset: 0,
            settings: st.clone(),
        };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        assert!(matcher.match_query(query, &mut stats).iter().all(|h| h.target != 0));
        assert_eq!(stats.lookups, stats.seeds);

        st.exact = false;
        let ctx = SearchContext { tables: Some(&tables), settings: st, ..ctx };
        let mut matcher = QueryMatcher::new(&ctx);
        let mut stats = RunStats::default();
        let hits = matcher.match_query(query, &mut stats).to_vec();
        assert_eq!(stats.seeds, 116);
        assert!(stats.lookups > stats.seeds);
        assert_eq!(hits[0].target, 0);
        assert_eq!(hits[0].diagonal, 0);
        assert!(hits[0].seed_count >= 2);
        assert!(hits[0].score > 1000, "{:?}", hits[0]);
    }

    #[test]
    fn poisson_score_grows_with_evidence() {
        let weak = poisson_score(1e-4, 100, 100, 6, 2);
        let strong = poisson_score(1e-4, 100, 100, 6, 5);
        assert!(strong > weak);
        assert!(weak > 0);
        let common = poisson_score(1e-4, 100, 100_000, 6, 2);
        assert!(common < weak);
    }
}

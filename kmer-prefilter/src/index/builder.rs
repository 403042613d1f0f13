use std::ops::Range;

use anyhow::Result;
use log::{debug, info};
use rayon::prelude::*;

use crate::error::PrefilterError;
use crate::index::table::{PostingEntry, SeedIndex, SequenceLookup};
use crate::io::store::SequenceStore;
use crate::util::mask::{mask_low_complexity, MaskMode};
use crate::util::matrix::SubstitutionMatrix;
use crate::util::seed::{code_space, SeedIter, SeedPattern};
use crate::util::seqtype::SeqType;

/// Targets processed per parallel batch.
const BUILD_BATCH: usize = 4096;

/// 构建倒排索引所需的参数。
#[derive(Debug, Clone, Copy)]
pub struct IndexParams<'a> {
    pub matrix: &'a SubstitutionMatrix,
    pub pattern: &'a SeedPattern,
    pub target_type: SeqType,
    /// Seeds whose self score is below this are not indexed; `0` keeps everything.
    pub threshold: i32,
    pub mask_mode: MaskMode,
    pub with_lookup: bool,
    pub max_seq_len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub targets: usize,
    pub targets_without_seeds: usize,
    pub seeds: usize,
    pub masked_residues: usize,
}

pub struct IndexBuilder<'a> {
    params: IndexParams<'a>,
    alphabet: usize,
    table_size: usize,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(params: IndexParams<'a>) -> Result<Self, PrefilterError> {
        let strategy = params.target_type.strategy();
        let alphabet = strategy.seed_alphabet(params.matrix.alphabet_size());
        let k = params.pattern.kmer_size();
        let table_size = code_space(alphabet, k).ok_or_else(|| {
            PrefilterError::config(format!(
                "k-mer size {} over an alphabet of {} does not fit a 32-bit code",
                k, alphabet
            ))
        })?;
        Ok(Self { params, alphabet, table_size: table_size as usize })
    }

    pub fn alphabet(&self) -> usize {
        self.alphabet
    }

    /// 两遍构建：第一遍统计各编码的出现次数得到 offsets，第二遍按目标编号顺序填充。
    pub fn build(&self, store: &dyn SequenceStore, range: Range<usize>) -> Result<(SeedIndex, BuildStats)> {
        let n_targets = range.len();
        let mut stats = BuildStats { targets: n_targets, ..Default::default() };

        let mut counts = vec![0u64; self.table_size + 1];
        self.for_each_batch(store, range.clone(), |_, batch| {
            for (seeds, masked) in batch {
                if seeds.is_empty() {
                    stats.targets_without_seeds += 1;
                }
                stats.seeds += seeds.len();
                stats.masked_residues += masked;
                for &(code, _) in seeds {
                    counts[code as usize] += 1;
                }
            }
        });

        // exclusive prefix sum
        let mut offsets = counts;
        let mut acc = 0u64;
        for o in offsets.iter_mut() {
            let c = *o;
            *o = acc;
            acc += c;
        }

        let mut cursor = offsets.clone();
        let mut entries = vec![PostingEntry { target_id: 0, pos: 0 }; acc as usize];
        self.for_each_batch(store, range.clone(), |first, batch| {
            for (i, (seeds, _)) in batch.iter().enumerate() {
                let target_id = (first + i - range.start) as u32;
                for &(code, pos) in seeds {
                    let slot = &mut cursor[code as usize];
                    entries[*slot as usize] = PostingEntry { target_id, pos };
                    *slot += 1;
                }
            }
        });

        let lookup = self.params.with_lookup.then(|| {
            let residues: usize = range.clone().map(|id| self.truncated(store.data(id)).len()).sum();
            let mut l = SequenceLookup::with_capacity(n_targets, residues);
            for id in range.clone() {
                l.push(self.truncated(store.data(id)));
            }
            l
        });

        info!(
            "seed index: {} targets, {} seeds, {} codes, {} targets without seeds, {} residues masked",
            stats.targets,
            stats.seeds,
            self.table_size,
            stats.targets_without_seeds,
            stats.masked_residues
        );

        let index = SeedIndex::from_parts(
            self.alphabet,
            self.params.pattern.kmer_size(),
            n_targets as u32,
            offsets,
            entries,
            lookup,
        );
        Ok((index, stats))
    }

    fn for_each_batch<F>(&self, store: &dyn SequenceStore, range: Range<usize>, mut f: F)
    where
        F: FnMut(usize, &[(Vec<(u32, u16)>, usize)]),
    {
        let mut start = range.start;
        while start < range.end {
            let end = (start + BUILD_BATCH).min(range.end);
            let batch: Vec<(Vec<(u32, u16)>, usize)> =
                (start..end).into_par_iter().map(|id| self.target_seeds(store, id)).collect();
            f(start, &batch);
            start = end;
        }
    }

    fn truncated<'s>(&self, residues: &'s [u8]) -> &'s [u8] {
        &residues[..residues.len().min(self.params.max_seq_len)]
    }

    /// Distinct admissible seeds of one target at their first position, plus masked residue count.
    pub fn target_seeds(&self, store: &dyn SequenceStore, id: usize) -> (Vec<(u32, u16)>, usize) {
        let p = &self.params;
        let original = self.truncated(store.data(id));
        let profile = store.profile(id);

        let mut masked = 0;
        let mut owned;
        let residues = if p.mask_mode == MaskMode::LowComplexity && !p.target_type.is_profile() {
            owned = original.to_vec();
            masked = mask_low_complexity(&mut owned, self.alphabet, p.matrix.unknown());
            &owned[..]
        } else {
            original
        };

        let strategy = p.target_type.strategy();
        let mut seeds: Vec<(u32, u16)> = SeedIter::new(residues, p.pattern, strategy, self.alphabet)
            .filter(|&(pos, _)| {
                p.threshold <= 0 || {
                    let self_score: i32 = p
                        .pattern
                        .offsets()
                        .iter()
                        .map(|&o| {
                            strategy.score_lookup(p.matrix, residues, profile, pos + o, residues[pos + o])
                        })
                        .sum();
                    self_score >= p.threshold
                }
            })
            .map(|(pos, code)| (code, pos as u16))
            .collect();
        seeds.sort_unstable();
        seeds.dedup_by_key(|s| s.0);
        if seeds.is_empty() {
            debug!("target {} has no admissible seeds", store.key(id));
        }
        (seeds, masked)
    }
}

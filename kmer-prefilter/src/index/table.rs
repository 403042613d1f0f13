use serde::{Deserialize, Serialize};

/// 倒排表中的一条记录：种子在目标序列中的出现位置。
/// `target_id` 为分片内的局部编号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingEntry {
    pub target_id: u32,
    pub pos: u16,
}

/// 种子倒排索引（CSR 布局）：
/// - `offsets[code]..offsets[code + 1]` 为该编码在 `entries` 中的桶
/// - 桶内按目标编号升序，构建后不再重排
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedIndex {
    alphabet: usize,
    kmer_size: usize,
    n_targets: u32,
    offsets: Vec<u64>,
    entries: Vec<PostingEntry>,
    lookup: Option<SequenceLookup>,
}

impl SeedIndex {
    pub(crate) fn from_parts(
        alphabet: usize,
        kmer_size: usize,
        n_targets: u32,
        offsets: Vec<u64>,
        entries: Vec<PostingEntry>,
        lookup: Option<SequenceLookup>,
    ) -> Self {
        Self { alphabet, kmer_size, n_targets, offsets, entries, lookup }
    }

    /// Occurrences of `code`; empty for codes outside the table.
    #[inline]
    pub fn postings(&self, code: u32) -> &[PostingEntry] {
        let c = code as usize;
        if c + 1 >= self.offsets.len() {
            return &[];
        }
        let s = self.offsets[c] as usize;
        let e = self.offsets[c + 1] as usize;
        &self.entries[s..e]
    }

    /// Number of seed codes (`alphabet ^ k`).
    pub fn table_size(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn alphabet(&self) -> usize {
        self.alphabet
    }

    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    /// Targets in the slice the index was built from, including those without seeds.
    pub fn n_targets(&self) -> u32 {
        self.n_targets
    }

    pub fn lookup(&self) -> Option<&SequenceLookup> {
        self.lookup.as_ref()
    }

    pub(crate) fn set_lookup(&mut self, lookup: Option<SequenceLookup>) {
        self.lookup = lookup;
    }

    /// Iterate `(code, bucket)` over non-empty buckets.
    pub fn buckets(&self) -> impl Iterator<Item = (u32, &[PostingEntry])> + '_ {
        (0..self.table_size())
            .map(move |c| (c as u32, self.postings(c as u32)))
            .filter(|(_, b)| !b.is_empty())
    }

    pub fn approx_bytes(&self) -> usize {
        self.offsets.len() * std::mem::size_of::<u64>()
            + self.entries.len() * std::mem::size_of::<PostingEntry>()
            + self.lookup.as_ref().map_or(0, |l| l.approx_bytes())
    }
}

/// 分片内目标序列的残基副本，供对角线打分使用。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceLookup {
    offsets: Vec<u64>,
    residues: Vec<u8>,
}

impl SequenceLookup {
    pub fn with_capacity(n_seqs: usize, n_residues: usize) -> Self {
        let mut offsets = Vec::with_capacity(n_seqs + 1);
        offsets.push(0);
        Self { offsets, residues: Vec::with_capacity(n_residues) }
    }

    pub fn push(&mut self, residues: &[u8]) {
        self.residues.extend_from_slice(residues);
        self.offsets.push(self.residues.len() as u64);
    }

    #[inline]
    pub fn sequence(&self, local_id: usize) -> &[u8] {
        let s = self.offsets[local_id] as usize;
        let e = self.offsets[local_id + 1] as usize;
        &self.residues[s..e]
    }

    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn approx_bytes(&self) -> usize {
        self.offsets.len() * std::mem::size_of::<u64>() + self.residues.len()
    }
}

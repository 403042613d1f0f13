use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

use crate::io::fasta::FastaReader;
use crate::util::matrix::SubstitutionMatrix;
use crate::util::seqtype::SeqType;

/// 序列库的只读访问接口。
///
/// - `id` 为库内连续编号 `[0, len)`，`key` 为外部稳定标识。
/// - 残基已按当前打分矩阵编码。
/// - profile 类型的序列额外提供逐位置打分行（`seq_len * alphabet` 个 `i16`）。
pub trait SequenceStore: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self, id: usize) -> &[u8];

    fn key(&self, id: usize) -> u32;

    fn seq_len(&self, id: usize) -> usize {
        self.data(id).len()
    }

    fn id_of_key(&self, key: u32) -> Option<usize>;

    fn total_residues(&self) -> u64;

    fn seq_type(&self) -> SeqType;

    fn profile(&self, _id: usize) -> Option<&[i16]> {
        None
    }
}

/// 内存中的序列库，可由 FASTA 构建并以 bincode 持久化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStore {
    seq_type: SeqType,
    matrix_name: String,
    names: Vec<String>,
    /// 严格递增，保证 `id_of_key` 可二分查找
    keys: Vec<u32>,
    offsets: Vec<u64>,
    residues: Vec<u8>,
    profiles: Vec<Option<Vec<i16>>>,
}

impl MemoryStore {
    pub fn new(seq_type: SeqType, matrix_name: &str) -> Self {
        Self {
            seq_type,
            matrix_name: matrix_name.to_string(),
            names: Vec::new(),
            keys: Vec::new(),
            offsets: vec![0],
            residues: Vec::new(),
            profiles: Vec::new(),
        }
    }

    /// Append an already encoded sequence. Keys must be pushed in ascending order.
    pub fn push(&mut self, key: u32, name: &str, residues: &[u8]) -> Result<()> {
        if let Some(&last) = self.keys.last() {
            if key <= last {
                bail!("sequence key {} is not greater than the previous key {}", key, last);
            }
        }
        self.keys.push(key);
        self.names.push(name.to_string());
        self.residues.extend_from_slice(residues);
        self.offsets.push(self.residues.len() as u64);
        self.profiles.push(None);
        Ok(())
    }

    /// Append a profile: consensus residues plus one score row per position.
    pub fn push_profile(
        &mut self,
        key: u32,
        name: &str,
        residues: &[u8],
        rows: Vec<i16>,
        alphabet: usize,
    ) -> Result<()> {
        if rows.len() != residues.len() * alphabet {
            bail!(
                "profile '{}' has {} scores, expected {} x {}",
                name,
                rows.len(),
                residues.len(),
                alphabet
            );
        }
        self.push(key, name, residues)?;
        if let Some(last) = self.profiles.last_mut() {
            *last = Some(rows);
        }
        Ok(())
    }

    /// 读取 FASTA，残基经 `matrix` 编码，key 为记录序号（从 0 开始）。
    pub fn from_fasta<R: BufRead>(
        reader: R,
        matrix: &SubstitutionMatrix,
        seq_type: SeqType,
    ) -> Result<Self> {
        let mut store = Self::new(seq_type, &matrix.name);
        let mut fasta = FastaReader::new(reader);
        let mut key = 0u32;
        while let Some(rec) = fasta.next_record()? {
            let encoded = matrix.encode_seq(&rec.seq);
            store.push(key, &rec.id, &encoded)?;
            key += 1;
        }
        Ok(store)
    }

    pub fn name(&self, id: usize) -> &str {
        &self.names[id]
    }

    pub fn matrix_name(&self) -> &str {
        &self.matrix_name
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let f = std::fs::File::create(path)?;
        let mut w = std::io::BufWriter::new(f);
        bincode::serialize_into(&mut w, self)?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let store: Self = bincode::deserialize_from(std::io::BufReader::new(f))?;
        Ok(store)
    }
}

impl SequenceStore for MemoryStore {
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn data(&self, id: usize) -> &[u8] {
        let s = self.offsets[id] as usize;
        let e = self.offsets[id + 1] as usize;
        &self.residues[s..e]
    }

    fn key(&self, id: usize) -> u32 {
        self.keys[id]
    }

    fn seq_len(&self, id: usize) -> usize {
        (self.offsets[id + 1] - self.offsets[id]) as usize
    }

    fn id_of_key(&self, key: u32) -> Option<usize> {
        self.keys.binary_search(&key).ok()
    }

    fn total_residues(&self) -> u64 {
        self.residues.len() as u64
    }

    fn seq_type(&self) -> SeqType {
        self.seq_type
    }

    fn profile(&self, id: usize) -> Option<&[i16]> {
        self.profiles[id].as_deref()
    }
}

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::index::ext::ExtendedTables;
use crate::index::table::SeedIndex;
use crate::util::mask::MaskMode;
use crate::util::seqtype::SeqType;

pub const SNAPSHOT_VERSION: u32 = 1;

/// 索引的构建参数。只有与当前运行完全一致（或阈值更宽松）时快照才可复用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub kmer_size: usize,
    pub alphabet_size: usize,
    pub seed_pattern: String,
    pub kmer_threshold: i32,
    pub mask_mode: MaskMode,
    pub matrix_name: String,
    pub target_type: SeqType,
    pub n_targets: u32,
    pub has_lookup: bool,
}

impl IndexMeta {
    /// Why an index with these parameters cannot serve `requested`, `None` if it can.
    pub fn rebuild_reason(&self, requested: &IndexMeta, query_type: SeqType, split_count: usize) -> Option<String> {
        if split_count != 1 {
            return Some(format!("the run needs {} target splits, the index covers the whole database", split_count));
        }
        if self.kmer_size != requested.kmer_size {
            return Some(format!("k-mer size {} != requested {}", self.kmer_size, requested.kmer_size));
        }
        if self.alphabet_size != requested.alphabet_size {
            return Some(format!(
                "alphabet size {} != requested {}",
                self.alphabet_size, requested.alphabet_size
            ));
        }
        if self.seed_pattern != requested.seed_pattern {
            return Some(format!(
                "seed pattern {} != requested {}",
                self.seed_pattern, requested.seed_pattern
            ));
        }
        if self.matrix_name != requested.matrix_name {
            return Some(format!("matrix {} != requested {}", self.matrix_name, requested.matrix_name));
        }
        if self.target_type != requested.target_type {
            return Some(format!(
                "target type {} != requested {}",
                self.target_type.name(),
                requested.target_type.name()
            ));
        }
        if self.n_targets != requested.n_targets {
            return Some(format!(
                "index holds {} targets, database has {}",
                self.n_targets, requested.n_targets
            ));
        }
        if self.mask_mode != requested.mask_mode {
            return Some(format!("mask mode {:?} != requested {:?}", self.mask_mode, requested.mask_mode));
        }
        if requested.kmer_threshold < self.kmer_threshold {
            return Some(format!(
                "requested k-mer threshold {} is lower than the index threshold {}",
                requested.kmer_threshold, self.kmer_threshold
            ));
        }
        if query_type.is_profile() && self.kmer_threshold != 0 {
            return Some(format!(
                "profile queries need an unfiltered index, index threshold is {}",
                self.kmer_threshold
            ));
        }
        if requested.has_lookup && !self.has_lookup {
            return Some("diagonal scoring needs a sequence lookup the index does not contain".to_string());
        }
        None
    }
}

/// 预构建索引文件：元数据 + 倒排表 + 可选扩展表。
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub meta: IndexMeta,
    pub build_args: Option<String>,
    pub build_timestamp: Option<String>,
    pub index: SeedIndex,
    pub tables: Option<ExtendedTables>,
}

impl IndexSnapshot {
    pub fn new(meta: IndexMeta, index: SeedIndex, tables: Option<ExtendedTables>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            meta,
            build_args: Some(std::env::args().collect::<Vec<_>>().join(" ")),
            build_timestamp: Some(chrono::Utc::now().to_rfc3339()),
            index,
            tables,
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let f = std::fs::File::create(path)?;
        let mut w = std::io::BufWriter::new(f);
        bincode::serialize_into(&mut w, self)?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let snap: Self = bincode::deserialize_from(std::io::BufReader::new(f))?;
        if snap.version != SNAPSHOT_VERSION {
            bail!(
                "index '{}' has format version {}, expected {}",
                path,
                snap.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(snap)
    }
}

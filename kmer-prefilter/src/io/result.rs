//! prefilter 结果文件。
//!
//! 布局（bincode 定长编码，小端）：
//! - `ResultHeader`：magic `KPRF`、版本、切分轴、分片编号、总分片数、目标偏移、
//!   是否已解析为全局 key、条目数
//! - `entries` 个 `ResultEntry`，按 `query_key` 升序
//!
//! 分片输出（`resolved == false`）中的 `target` 是分片内局部编号，合并时加上
//! `target_offset` 并解析为目标 key。

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::plan::SplitAxis;
use crate::search::matcher::Hit;

pub const RESULT_MAGIC: [u8; 4] = *b"KPRF";
pub const RESULT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub axis: SplitAxis,
    pub split: u32,
    pub total_splits: u32,
    pub target_offset: u64,
    pub resolved: bool,
    pub entries: u64,
}

impl ResultHeader {
    pub fn partial(axis: SplitAxis, split: usize, total_splits: usize, target_offset: usize) -> Self {
        Self {
            magic: RESULT_MAGIC,
            version: RESULT_VERSION,
            axis,
            split: split as u32,
            total_splits: total_splits as u32,
            target_offset: target_offset as u64,
            resolved: false,
            entries: 0,
        }
    }

    pub fn merged(axis: SplitAxis, total_splits: usize) -> Self {
        Self { resolved: true, ..Self::partial(axis, 0, total_splits, 0) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub query_key: u32,
    pub hits: Vec<Hit>,
}

/// Write `entries` (sorted here by query key) behind `header`.
pub fn write_result_file(path: &Path, mut header: ResultHeader, entries: &mut [ResultEntry]) -> Result<()> {
    entries.sort_by_key(|e| e.query_key);
    header.entries = entries.len() as u64;
    let f = File::create(path).with_context(|| format!("cannot create result file '{}'", path.display()))?;
    let mut w = BufWriter::new(f);
    bincode::serialize_into(&mut w, &header)?;
    for e in entries.iter() {
        bincode::serialize_into(&mut w, e)?;
    }
    w.flush()?;
    Ok(())
}

/// 顺序读取结果文件中的条目。
pub struct ResultReader<R: Read> {
    reader: R,
    header: ResultHeader,
    remaining: u64,
}

impl ResultReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("cannot open result file '{}'", path.display()))?;
        Self::new(BufReader::new(f))
    }
}

impl<R: Read> ResultReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let header: ResultHeader = bincode::deserialize_from(&mut reader)?;
        if header.magic != RESULT_MAGIC {
            bail!("not a prefilter result file");
        }
        if header.version != RESULT_VERSION {
            bail!("result file version {} is not supported (expected {})", header.version, RESULT_VERSION);
        }
        let remaining = header.entries;
        Ok(Self { reader, header, remaining })
    }

    pub fn header(&self) -> &ResultHeader {
        &self.header
    }

    pub fn next_entry(&mut self) -> Result<Option<ResultEntry>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let e: ResultEntry = bincode::deserialize_from(&mut self.reader)?;
        Ok(Some(e))
    }

    pub fn read_all(mut self) -> Result<(ResultHeader, Vec<ResultEntry>)> {
        let mut entries = Vec::with_capacity(self.remaining as usize);
        while let Some(e) = self.next_entry()? {
            entries.push(e);
        }
        Ok((self.header, entries))
    }
}

pub fn read_result_file(path: &Path) -> Result<(ResultHeader, Vec<ResultEntry>)> {
    ResultReader::open(path)?.read_all()
}

/// Render a result file as TSV: `query  target  score  diagonal  seeds`.
pub fn write_tsv<W: Write>(path: &Path, out: &mut W) -> Result<()> {
    let mut reader = ResultReader::open(path)?;
    if !reader.header().resolved {
        writeln!(
            out,
            "# partial result of split {}/{}, target ids are local (offset {})",
            reader.header().split + 1,
            reader.header().total_splits,
            reader.header().target_offset
        )?;
    }
    while let Some(e) = reader.next_entry()? {
        for h in &e.hits {
            writeln!(out, "{}\t{}\t{}\t{}\t{}", e.query_key, h.target, h.score, h.diagonal, h.seed_count)?;
        }
    }
    Ok(())
}

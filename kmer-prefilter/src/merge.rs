//! 分片结果合并。
//!
//! - 目标切分：各分片的局部编号加上分片偏移、解析为目标 key，按查询归并后
//!   重新排序，再套用结果窗口（跳过 `offset` 条，保留 `max` 条）
//! - 查询切分：各分片覆盖不相交的查询，按 key 顺序拼接
//! - 只有一个已解析的分片时直接改名，不做合并（见 [`merge_and_cleanup`]）

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::io::result::{read_result_file, write_result_file, ResultEntry, ResultHeader};
use crate::io::store::SequenceStore;
use crate::plan::SplitAxis;
use crate::search::matcher::{sort_hits, Hit};

/// Slice of a ranked hit list that is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultWindow {
    pub offset: usize,
    pub max: usize,
}

impl ResultWindow {
    pub fn new(offset: usize, max: usize) -> Self {
        Self { offset, max }
    }

    /// Everything a later window with the same bounds could still need.
    pub fn widened(self) -> Self {
        Self { offset: 0, max: self.offset.saturating_add(self.max) }
    }

    pub fn apply(self, hits: &mut Vec<Hit>) {
        hits.drain(..self.offset.min(hits.len()));
        hits.truncate(self.max);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inputs: usize,
    pub entries: usize,
    pub hits: usize,
    /// Hits whose target id lies outside the target set.
    pub unresolved: usize,
}

/// Replace split-local target ids by target keys; hits that cannot be resolved are dropped.
pub fn resolve_hits(entry: &mut ResultEntry, target_offset: usize, targets: &dyn SequenceStore) -> usize {
    let before = entry.hits.len();
    entry.hits.retain_mut(|h| {
        let global = target_offset + h.target as usize;
        if global >= targets.len() {
            warn!(
                "query {}: target id {} (offset {}) is outside the {} targets, hit dropped",
                entry.query_key,
                h.target,
                target_offset,
                targets.len()
            );
            return false;
        }
        h.target = targets.key(global);
        true
    });
    before - entry.hits.len()
}

/// 将一个分片的结果解析为 key 并套用窗口后写出（单目标分片或查询切分时使用）。
pub fn write_resolved(
    path: &Path,
    header: ResultHeader,
    entries: &mut [ResultEntry],
    targets: &dyn SequenceStore,
    window: ResultWindow,
) -> Result<usize> {
    let offset = header.target_offset as usize;
    let mut unresolved = 0;
    for e in entries.iter_mut() {
        unresolved += resolve_hits(e, offset, targets);
        window.apply(&mut e.hits);
    }
    let header = ResultHeader { resolved: true, target_offset: 0, ..header };
    write_result_file(path, header, entries)?;
    Ok(unresolved)
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)
            .with_context(|| format!("cannot move '{}' to '{}'", from.display(), to.display()))?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

/// 合并分片结果到 `out`。
///
/// `window` 只作用于目标切分：同一查询在多个分片中的命中需要重新排序后截断。
/// 输入文件不会被删除。
pub fn merge_results(
    partials: &[PathBuf],
    out: &Path,
    axis: SplitAxis,
    targets: &dyn SequenceStore,
    window: ResultWindow,
) -> Result<MergeSummary> {
    let mut summary = MergeSummary { inputs: partials.len(), ..Default::default() };
    let mut by_query: BTreeMap<u32, Vec<Hit>> = BTreeMap::new();
    let mut total_splits = 0usize;
    for path in partials {
        let (header, entries) = read_result_file(path)?;
        total_splits = total_splits.max(header.total_splits as usize);
        for mut e in entries {
            if !header.resolved {
                summary.unresolved += resolve_hits(&mut e, header.target_offset as usize, targets);
            }
            by_query.entry(e.query_key).or_default().append(&mut e.hits);
        }
    }

    let mut entries: Vec<ResultEntry> = by_query
        .into_iter()
        .map(|(query_key, mut hits)| {
            if axis == SplitAxis::Target {
                sort_hits(&mut hits);
                window.apply(&mut hits);
            }
            ResultEntry { query_key, hits }
        })
        .collect();
    summary.entries = entries.len();
    summary.hits = entries.iter().map(|e| e.hits.len()).sum();

    write_result_file(out, ResultHeader::merged(axis, total_splits.max(partials.len())), &mut entries)?;
    info!(
        "merged {} result file(s) into '{}': {} queries, {} hits",
        partials.len(),
        out.display(),
        summary.entries,
        summary.hits
    );
    if summary.unresolved > 0 {
        warn!("{} hit(s) referenced unknown targets and were dropped", summary.unresolved);
    }
    Ok(summary)
}

/// Merge, then move the merged file into place and delete the inputs.
pub fn merge_and_cleanup(
    partials: &[PathBuf],
    out: &Path,
    axis: SplitAxis,
    targets: &dyn SequenceStore,
    window: ResultWindow,
) -> Result<MergeSummary> {
    if let [single] = partials {
        let (header, entries) = read_result_file(single)?;
        if header.resolved {
            move_file(single, out)?;
            return Ok(MergeSummary {
                inputs: 1,
                entries: entries.len(),
                hits: entries.iter().map(|e| e.hits.len()).sum(),
                unresolved: 0,
            });
        }
    }
    merge_into(partials, out, axis, targets, window)
}

/// Always merge (even a single input), then move into place and delete the inputs.
pub fn merge_into(
    partials: &[PathBuf],
    out: &Path,
    axis: SplitAxis,
    targets: &dyn SequenceStore,
    window: ResultWindow,
) -> Result<MergeSummary> {
    let tmp = out.with_extension("merging");
    let summary = merge_results(partials, &tmp, axis, targets, window)?;
    move_file(&tmp, out)?;
    for p in partials {
        if let Err(e) = std::fs::remove_file(p) {
            warn!("cannot remove temporary file '{}': {}", p.display(), e);
        }
    }
    Ok(summary)
}

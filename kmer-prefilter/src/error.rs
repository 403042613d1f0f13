use thiserror::Error;

/// Fatal conditions of a prefilter run.
///
/// Every variant terminates the run; none of them is retried. Snapshot
/// incompatibility is deliberately absent: it only triggers a rebuild.
#[derive(Debug, Error)]
pub enum PrefilterError {
    /// Query/target type pairing, k-mer size, seed pattern or split layout is unusable.
    #[error("incompatible configuration: {0}")]
    IncompatibleConfig(String),
    /// No (k-mer size, split count) combination fits the memory budget.
    #[error("insufficient memory for any split: {needed} bytes needed for one split, budget {budget} bytes")]
    InsufficientMemory { needed: u64, budget: u64 },
    /// Every cooperating process finished with an empty result.
    #[error("no results were computed by any of the {ranks} process(es)")]
    NoResults { ranks: usize },
    /// Another cooperating process failed before the result gather.
    #[error("run aborted, rank(s) {ranks:?} failed")]
    RankFailed { ranks: Vec<usize> },
}

impl PrefilterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::IncompatibleConfig(msg.into())
    }
}

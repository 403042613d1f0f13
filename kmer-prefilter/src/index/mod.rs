//! 种子索引：CSR 倒排表、构建器、扩展打分表与快照。

pub mod builder;
pub mod ext;
pub mod snapshot;
pub mod table;

pub use builder::{BuildStats, IndexBuilder, IndexParams};
pub use ext::{ExtendedScoreTable, ExtendedTables};
pub use snapshot::{IndexMeta, IndexSnapshot};
pub use table::{PostingEntry, SeedIndex, SequenceLookup};

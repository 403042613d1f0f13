//! 查询匹配：邻域生成、对角线累加、打分与校准。

pub mod calibrate;
pub mod counter;
pub mod matcher;
pub mod neighbors;
pub mod stats;

pub use matcher::{Hit, MatchSettings, Query, QueryMatcher, SearchContext, SELF_HIT_SCORE};
pub use stats::RunStats;

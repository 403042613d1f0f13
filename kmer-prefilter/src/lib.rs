//! # kmer-prefilter
//!
//! 序列相似性搜索的 k-mer 预过滤器：对每条查询序列，快速给出一个按分数排序、
//! 长度有界的候选目标列表，供后续比对阶段使用。
//!
//! - **种子索引**：目标序列的（连续或 spaced）k-mer 倒排表，按自身得分过滤
//! - **扩展打分表**：2-mer / 3-mer 的全部替换及得分，用于生成相似 k-mer
//! - **查询匹配**：查表 → 对角线累加 → 无间隙打分或计数概率打分 → 排序截断
//! - **切分规划**：在内存预算内选择 k-mer 大小、分片数与切分轴
//! - **结果合并**：目标分片的结果重新定位、排序并截断；查询分片直接拼接
//! - **多进程协作**：每个 rank 处理自己的分片，rank 0 收集并合并
//!
//! ## 快速示例
//!
//! ```rust,no_run
//! use kmer_prefilter::dist::LocalCommunicator;
//! use kmer_prefilter::io::MemoryStore;
//! use kmer_prefilter::util::matrix::SubstitutionMatrix;
//! use kmer_prefilter::util::seqtype::SeqType;
//! use kmer_prefilter::{Prefilter, PrefilterConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let matrix = SubstitutionMatrix::blosum62();
//! let fasta = std::io::BufReader::new(std::fs::File::open("proteins.fa")?);
//! let db = MemoryStore::from_fasta(fasta, &matrix, SeqType::AminoAcid)?;
//!
//! let config = PrefilterConfig { sensitivity: 5.7, ..Default::default() };
//! let mut run = Prefilter::new(&config, &matrix, &db, &db)?;
//! let summary = run.run(std::path::Path::new("result.kpr"), &LocalCommunicator)?;
//! println!("{} queries searched", summary.stats.queries);
//! # Ok(())
//! # }
//! ```
//!
//! ## 模块说明
//!
//! - [`config`] — 运行参数与覆盖度模式
//! - [`util`] — 打分矩阵、序列类型策略、种子模式、低复杂度屏蔽
//! - [`io`] — FASTA 解析、序列库、结果文件
//! - [`index`] — 种子索引构建、扩展打分表、索引快照
//! - [`search`] — 邻域生成、对角线累加、单查询匹配、校准
//! - [`plan`] — 内存估计与切分规划
//! - [`merge`] — 分片结果合并
//! - [`dist`] — 多进程通信接口
//! - [`prefilter`] — 完整的运行流程

pub mod config;
pub mod dist;
pub mod error;
pub mod index;
pub mod io;
pub mod merge;
pub mod plan;
pub mod prefilter;
pub mod search;
pub mod util;

pub use config::{CovMode, PrefilterConfig};
pub use error::PrefilterError;
pub use prefilter::{Prefilter, RunPhase, RunSummary};

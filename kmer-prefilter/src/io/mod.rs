//! 输入输出：FASTA 解析、序列库与结果文件。

pub mod fasta;
pub mod result;
pub mod store;

pub use result::{ResultEntry, ResultHeader, ResultReader};
pub use store::{MemoryStore, SequenceStore};

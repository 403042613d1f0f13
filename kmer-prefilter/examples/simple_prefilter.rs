//! 演示如何在 library 模式下对一个小核酸库做全库自比 prefilter。
//!
//! 运行方式：
//! ```bash
//! cargo run --example simple_prefilter
//! ```

use kmer_prefilter::dist::LocalCommunicator;
use kmer_prefilter::io::result::read_result_file;
use kmer_prefilter::io::{MemoryStore, SequenceStore};
use kmer_prefilter::util::matrix::SubstitutionMatrix;
use kmer_prefilter::util::seqtype::SeqType;
use kmer_prefilter::{Prefilter, PrefilterConfig};

fn main() -> anyhow::Result<()> {
    // 1. 构建序列库
    let fasta = b">r1\nACGTACGTAGCTGATCGTAGCTAGCTAGCTGATCGTAG\n\
                  >r2\nACGTACGTAGCTGATCGTAGCTAGGTAGCTGATCGTAG\n\
                  >r3\nTTGACCATGCAAGTCCGATGGCATTACGGATCCAAGT\n";
    let matrix = SubstitutionMatrix::nucleotide(2, 3);
    let db = MemoryStore::from_fasta(&fasta[..], &matrix, SeqType::Nucleotide)?;
    println!("序列数: {}, 残基数: {}", db.len(), db.total_residues());

    // 2. 运行 prefilter
    let config = PrefilterConfig { kmer_size: 5, min_diag_score: 12, threads: 2, ..Default::default() };
    let out = std::env::temp_dir().join("simple_prefilter.kpr");
    let mut run = Prefilter::new(&config, &matrix, &db, &db)?;
    let summary = run.run(&out, &LocalCommunicator)?;
    println!(
        "k = {}, {} 个分片，平均每条查询 {:.1} 个候选",
        summary.plan.kmer_size,
        summary.plan.split_count,
        summary.stats.mean_result_len()
    );

    // 3. 读取结果
    let (_, entries) = read_result_file(&out)?;
    for e in &entries {
        for h in &e.hits {
            println!("{} -> {}  score={} diag={}", db.name(e.query_key as usize), h.target, h.score, h.diagonal);
        }
    }
    std::fs::remove_file(&out)?;
    Ok(())
}

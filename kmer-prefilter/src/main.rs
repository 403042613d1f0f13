use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use kmer_prefilter::config::{CovMode, PrefilterConfig, MAX_SEQ_LEN_LIMIT};
use kmer_prefilter::dist::{ChannelCommunicator, Communicator, LocalCommunicator};
use kmer_prefilter::index::IndexSnapshot;
use kmer_prefilter::io::result::write_tsv;
use kmer_prefilter::io::{MemoryStore, SequenceStore};
use kmer_prefilter::plan::SplitAxis;
use kmer_prefilter::prefilter::{build_snapshot, Prefilter};
use kmer_prefilter::util::mask::MaskMode;
use kmer_prefilter::util::matrix::SubstitutionMatrix;
use kmer_prefilter::util::seqtype::SeqType;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(
    name = "kmer-prefilter",
    author,
    version,
    about = "k-mer prefilter for sequence similarity search",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// 种子与索引相关参数（createindex 与 prefilter 共用）。
#[derive(Args, Debug)]
struct SeedArgs {
    /// k-mer size, 0 = choose from the target residue count
    #[arg(short = 'k', long = "kmer-size", default_value_t = 0)]
    kmer_size: usize,
    /// Spaced seed mask such as 1101011
    #[arg(long = "spaced-pattern")]
    spaced_pattern: Option<String>,
    /// Use the built-in spaced seed for the chosen k
    #[arg(long = "spaced-kmer")]
    spaced_kmer: bool,
    #[arg(short = 's', long = "sensitivity", default_value_t = 4.0)]
    sensitivity: f32,
    /// Fixed k-mer score threshold instead of the sensitivity table
    #[arg(long = "kmer-score")]
    kmer_score: Option<i32>,
    #[arg(long = "mask", value_enum, default_value_t = MaskMode::None)]
    mask_mode: MaskMode,
    /// Look up only identical k-mers
    #[arg(long = "exact-kmer-matching")]
    exact_kmer_matching: bool,
    /// Score by seed counts instead of ungapped diagonal alignment
    #[arg(long = "no-diagonal-scoring")]
    no_diagonal_scoring: bool,
    #[arg(long = "max-seq-len", default_value_t = MAX_SEQ_LEN_LIMIT)]
    max_seq_len: usize,
    /// Worker threads, 0 = all cores
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode a FASTA file into a sequence database
    Createdb {
        fasta: PathBuf,
        /// Output database path
        output: PathBuf,
        #[arg(long = "seq-type", value_enum, default_value_t = SeqType::AminoAcid)]
        seq_type: SeqType,
    },
    /// Build a reusable seed index of a target database
    Createindex {
        target_db: PathBuf,
        /// Output index path
        output: PathBuf,
        /// Type of the queries the index will serve
        #[arg(long = "query-type", value_enum, default_value_t = SeqType::AminoAcid)]
        query_type: SeqType,
        #[command(flatten)]
        seed: SeedArgs,
    },
    /// Compute ranked candidate lists for every query
    Prefilter {
        query_db: PathBuf,
        target_db: PathBuf,
        /// Output result path
        output: PathBuf,
        /// Prebuilt index of the target database
        #[arg(short = 'i', long = "index")]
        index: Option<PathBuf>,
        #[command(flatten)]
        seed: SeedArgs,
        #[arg(long = "max-results", default_value_t = 300)]
        max_results: usize,
        /// Skip this many best hits per query
        #[arg(long = "result-offset", default_value_t = 0)]
        result_offset: usize,
        #[arg(short = 'c', long = "coverage", default_value_t = 0.0)]
        coverage: f32,
        #[arg(long = "cov-mode", value_enum, default_value_t = CovMode::Bidirectional)]
        cov_mode: CovMode,
        #[arg(long = "min-diag-score", default_value_t = 15)]
        min_diag_score: i32,
        /// Report each query as a hit of itself
        #[arg(long = "include-identical")]
        include_identical: bool,
        /// Number of splits, 0 = plan from the memory budget
        #[arg(long = "split", default_value_t = 0)]
        split: usize,
        #[arg(long = "split-axis", value_enum)]
        split_axis: Option<SplitAxis>,
        /// Memory budget in MiB, 0 = derive from the system memory
        #[arg(long = "memory-limit", default_value_t = 0)]
        memory_limit_mib: u64,
        /// Cooperating ranks simulated inside this process
        #[arg(long = "ranks", default_value_t = 1)]
        ranks: usize,
    },
    /// Print a result file as TSV (query, target, score, diagonal, seeds)
    View { result: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Createdb { fasta, output, seq_type } => run_createdb(&fasta, &output, seq_type),
        Commands::Createindex { target_db, output, query_type, seed } => {
            let config = seed.into_config();
            run_createindex(&target_db, &output, query_type, &config)
        }
        Commands::Prefilter {
            query_db,
            target_db,
            output,
            index,
            seed,
            max_results,
            result_offset,
            coverage,
            cov_mode,
            min_diag_score,
            include_identical,
            split,
            split_axis,
            memory_limit_mib,
            ranks,
        } => {
            let config = PrefilterConfig {
                max_results,
                result_offset,
                coverage,
                cov_mode,
                min_diag_score,
                include_identical,
                split,
                split_axis,
                memory_limit: memory_limit_mib.saturating_mul(1 << 20),
                ..seed.into_config()
            };
            run_prefilter(&query_db, &target_db, &output, index.as_deref(), &config, ranks)
        }
        Commands::View { result } => {
            let stdout = std::io::stdout();
            let mut out = std::io::BufWriter::new(stdout.lock());
            write_tsv(&result, &mut out)?;
            out.flush()?;
            Ok(())
        }
    }
}

impl SeedArgs {
    fn into_config(self) -> PrefilterConfig {
        PrefilterConfig {
            kmer_size: self.kmer_size,
            spaced_pattern: self.spaced_pattern,
            spaced_kmer: self.spaced_kmer,
            sensitivity: self.sensitivity,
            kmer_score: self.kmer_score,
            mask_mode: self.mask_mode,
            exact_kmer_matching: self.exact_kmer_matching,
            diagonal_scoring: !self.no_diagonal_scoring,
            max_seq_len: self.max_seq_len,
            threads: self.threads,
            ..Default::default()
        }
    }
}

fn matrix_for(seq_type: SeqType) -> SubstitutionMatrix {
    match seq_type {
        SeqType::Nucleotide => SubstitutionMatrix::nucleotide(2, 3),
        _ => SubstitutionMatrix::blosum62(),
    }
}

fn load_db(path: &std::path::Path) -> Result<MemoryStore> {
    let p = path.to_string_lossy();
    MemoryStore::load_from_file(&p).with_context(|| format!("cannot load sequence database '{}'", p))
}

fn run_createdb(fasta: &std::path::Path, output: &std::path::Path, seq_type: SeqType) -> Result<()> {
    if seq_type.is_profile() {
        bail!("profiles cannot be read from FASTA, use --seq-type nucleotide or amino-acid");
    }
    let matrix = matrix_for(seq_type);
    let fh = std::fs::File::open(fasta).with_context(|| format!("cannot open FASTA file '{}'", fasta.display()))?;
    let store = MemoryStore::from_fasta(std::io::BufReader::new(fh), &matrix, seq_type)?;
    if store.is_empty() {
        bail!("FASTA file '{}' contains no sequences", fasta.display());
    }
    store.save_to_file(&output.to_string_lossy())?;
    info!(
        "database saved: {} ({} sequences, {} residues)",
        output.display(),
        store.len(),
        store.total_residues()
    );
    Ok(())
}

fn run_createindex(
    target_db: &std::path::Path,
    output: &std::path::Path,
    query_type: SeqType,
    config: &PrefilterConfig,
) -> Result<()> {
    let targets = load_db(target_db)?;
    let matrix = matrix_for(targets.seq_type());
    let snapshot = build_snapshot(config, &matrix, &targets, query_type)?;
    snapshot
        .save_to_file(&output.to_string_lossy())
        .with_context(|| format!("cannot write index to '{}'", output.display()))?;
    info!(
        "index saved: {} (k = {}, pattern {}, threshold {})",
        output.display(),
        snapshot.meta.kmer_size,
        snapshot.meta.seed_pattern,
        snapshot.meta.kmer_threshold
    );
    Ok(())
}

fn run_prefilter(
    query_db: &std::path::Path,
    target_db: &std::path::Path,
    output: &std::path::Path,
    index: Option<&std::path::Path>,
    config: &PrefilterConfig,
    ranks: usize,
) -> Result<()> {
    let queries = load_db(query_db)?;
    let targets = if target_db == query_db { None } else { Some(load_db(target_db)?) };
    let targets = targets.as_ref().unwrap_or(&queries);
    let matrix = matrix_for(targets.seq_type());
    if queries.matrix_name() != targets.matrix_name() {
        bail!(
            "query database is encoded with '{}', target database with '{}'",
            queries.matrix_name(),
            targets.matrix_name()
        );
    }

    let run_rank = |comm: &dyn Communicator| -> Result<()> {
        let mut run = Prefilter::new(config, &matrix, &queries, targets)?;
        if let Some(path) = index {
            let snapshot = IndexSnapshot::load_from_file(&path.to_string_lossy())?;
            run = run.with_snapshot(snapshot);
        }
        let summary = run.run(output, comm)?;
        if let Some(m) = summary.merged {
            info!("result saved: {} ({} queries, {} hits)", output.display(), m.entries, m.hits);
        }
        Ok(())
    };

    if ranks <= 1 {
        return run_rank(&LocalCommunicator);
    }
    let comms = ChannelCommunicator::group(ranks);
    let run_rank = &run_rank;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.into_iter().map(|c| s.spawn(move || run_rank(&c))).collect();
        let mut first_err = None;
        for h in handles {
            let res = h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("a rank panicked")));
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    })
}

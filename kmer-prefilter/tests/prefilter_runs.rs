//! End-to-end prefilter runs on small nucleotide databases.

use std::path::Path;

use kmer_prefilter::dist::{ChannelCommunicator, Communicator, LocalCommunicator};
use kmer_prefilter::io::result::{read_result_file, ResultEntry};
use kmer_prefilter::io::{MemoryStore, SequenceStore};
use kmer_prefilter::plan::SplitAxis;
use kmer_prefilter::prefilter::build_snapshot;
use kmer_prefilter::search::SELF_HIT_SCORE;
use kmer_prefilter::util::matrix::SubstitutionMatrix;
use kmer_prefilter::util::seqtype::SeqType;
use kmer_prefilter::prefilter::AbortReason;
use kmer_prefilter::{Prefilter, PrefilterConfig, PrefilterError, RunPhase, RunSummary};

fn random_dna(len: usize, seed: u32) -> Vec<u8> {
    let bases = [b'A', b'C', b'G', b'T'];
    let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            bases[(x >> 16) as usize % 4]
        })
        .collect()
}

/// Copy with every `every`-th base replaced.
fn mutate(seq: &[u8], every: usize) -> Vec<u8> {
    seq.iter()
        .enumerate()
        .map(|(i, &b)| if i % every == every - 1 { if b == b'A' { b'C' } else { b'A' } } else { b })
        .collect()
}

fn store(seqs: &[Vec<u8>]) -> (SubstitutionMatrix, MemoryStore) {
    let m = SubstitutionMatrix::nucleotide(2, 3);
    let mut s = MemoryStore::new(SeqType::Nucleotide, &m.name);
    for (i, q) in seqs.iter().enumerate() {
        s.push(i as u32, &format!("seq{}", i), &m.encode_seq(q)).unwrap();
    }
    (m, s)
}

/// Three families of four related sequences each.
fn families() -> Vec<Vec<u8>> {
    let mut seqs = Vec::new();
    for f in 0..3 {
        let base = random_dna(90 + 10 * f, f as u32 + 7);
        seqs.push(base.clone());
        seqs.push(mutate(&base, 9));
        seqs.push(mutate(&base, 6));
        seqs.push(base[5..].to_vec());
    }
    seqs
}

fn config() -> PrefilterConfig {
    PrefilterConfig {
        kmer_size: 3,
        threads: 2,
        memory_limit: 8 << 30,
        min_diag_score: 10,
        max_results: 100,
        ..Default::default()
    }
}

fn run_local(config: &PrefilterConfig, m: &SubstitutionMatrix, db: &MemoryStore, out: &Path) -> Vec<ResultEntry> {
    let mut run = Prefilter::new(config, m, db, db).unwrap();
    run.run(out, &LocalCommunicator).unwrap();
    assert_eq!(run.phase(), RunPhase::Done);
    read_result_file(out).unwrap().1
}

fn only_output_left(dir: &Path) {
    let names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["out.kpr".to_string()], "temporary files left: {:?}", names);
}

#[test]
fn count_mode_reports_every_query_with_its_self_hit_first() {
    let base = random_dna(80, 1);
    let seqs = vec![base.clone(), mutate(&base, 10), random_dna(70, 2), random_dna(60, 3)];
    let (m, db) = store(&seqs);
    let c = PrefilterConfig { diagonal_scoring: false, include_identical: true, ..config() };
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let entries = run_local(&c, &m, &db, &out);

    assert_eq!(entries.iter().map(|e| e.query_key).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    for e in &entries {
        assert_eq!(e.hits[0].target, e.query_key);
        assert_eq!(e.hits[0].score, SELF_HIT_SCORE);
        assert_eq!(e.hits[0].diagonal, 0);
    }
    let related = entries[0].hits.iter().find(|h| h.target == 1).unwrap();
    assert!(related.seed_count >= 2);
    assert_eq!(related.diagonal, 0);
    only_output_left(dir.path());
}

#[test]
fn target_without_seeds_only_matches_itself() {
    let base = random_dna(60, 4);
    let seqs = vec![base.clone(), mutate(&base, 8), vec![b'N'; 30]];
    let (m, db) = store(&seqs);
    let c = PrefilterConfig { include_identical: true, ..config() };
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let entries = run_local(&c, &m, &db, &out);

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].hits.len(), 1);
    assert_eq!(entries[2].hits[0].target, 2);
    assert!(entries[..2].iter().all(|e| e.hits.iter().all(|h| h.target != 2)));
}

#[test]
fn splitting_does_not_change_the_result() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let single = run_local(&config(), &m, &db, &out);
    assert_eq!(single.len(), db.len());
    // every sequence finds at least its family
    for e in &single {
        let family = e.query_key / 4;
        assert!(e.hits.iter().filter(|h| h.target / 4 == family).count() >= 2);
    }

    for (split, axis) in [(3, SplitAxis::Target), (2, SplitAxis::Target), (3, SplitAxis::Query)] {
        let c = PrefilterConfig { split, split_axis: Some(axis), ..config() };
        let split_result = run_local(&c, &m, &db, &out);
        assert_eq!(split_result, single, "{} splits along {:?}", split, axis);
        only_output_left(dir.path());
    }
}

#[test]
fn result_window_skips_best_hits() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let full = run_local(&config(), &m, &db, &out);

    for split in [1, 3] {
        let c = PrefilterConfig {
            result_offset: 1,
            max_results: 2,
            split,
            split_axis: Some(SplitAxis::Target),
            ..config()
        };
        let windowed = run_local(&c, &m, &db, &out);
        for (w, f) in windowed.iter().zip(&full) {
            let expected: Vec<_> = f.hits.iter().skip(1).take(2).copied().collect();
            assert_eq!(w.hits, expected, "query {} with {} split(s)", w.query_key, split);
        }
    }
}

#[test]
fn repeated_runs_are_identical() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let c = PrefilterConfig { threads: 4, diagonal_scoring: false, ..config() };
    let a = run_local(&c, &m, &db, &out);
    let b = run_local(&c, &m, &db, &out);
    assert_eq!(a, b);
}

/// Run one `Prefilter` per rank, each on its own thread and endpoint.
fn run_ranks_with(
    config: &PrefilterConfig,
    m: &SubstitutionMatrix,
    db: &MemoryStore,
    out: &Path,
    ranks: usize,
) -> Vec<Result<RunSummary, (anyhow::Error, RunPhase)>> {
    let comms = ChannelCommunicator::group(ranks);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                s.spawn(move || {
                    let mut run = Prefilter::new(config, m, db, db).unwrap();
                    run.run(out, &c as &dyn Communicator).map_err(|e| (e, run.phase()))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn run_ranks(config: &PrefilterConfig, m: &SubstitutionMatrix, db: &MemoryStore, out: &Path, ranks: usize) {
    let merged: Vec<bool> = run_ranks_with(config, m, db, out, ranks)
        .into_iter()
        .map(|r| r.map_err(|(e, _)| e).unwrap().merged.is_some())
        .collect();
    let mut expected = vec![false; ranks];
    expected[0] = true;
    assert_eq!(merged, expected);
}

#[test]
fn cooperating_ranks_match_a_single_process() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let single = run_local(&config(), &m, &db, &out);

    let c = PrefilterConfig { threads: 1, split: 3, split_axis: Some(SplitAxis::Target), ..config() };
    run_ranks(&c, &m, &db, &out, 3);
    assert_eq!(read_result_file(&out).unwrap().1, single);
    only_output_left(dir.path());

    // without an explicit axis, several ranks split the queries
    let c = PrefilterConfig { threads: 1, ..config() };
    run_ranks(&c, &m, &db, &out, 2);
    assert_eq!(read_result_file(&out).unwrap().1, single);
    only_output_left(dir.path());
}

#[test]
fn failing_rank_aborts_every_rank() {
    let (m, db) = store(&families());
    let c = PrefilterConfig { threads: 1, split: 2, split_axis: Some(SplitAxis::Target), ..config() };

    for failing in [1usize, 0] {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.kpr");
        // the split file of the failing rank cannot be created
        std::fs::create_dir(dir.path().join(format!("out.kpr.split_{}", failing))).unwrap();

        let results = run_ranks_with(&c, &m, &db, &out, 2);
        for (rank, r) in results.iter().enumerate() {
            let (err, phase) = r.as_ref().map(|_| ()).unwrap_err();
            assert!(matches!(phase, RunPhase::Aborted(_)), "rank {}: {}", rank, phase);
            if rank == failing {
                assert_eq!(*phase, RunPhase::Aborted(AbortReason::Io), "rank {}: {}", rank, err);
            } else {
                let e = err.downcast_ref::<PrefilterError>();
                match e {
                    Some(PrefilterError::RankFailed { ranks }) if rank == 0 => assert_eq!(ranks, &vec![failing]),
                    Some(PrefilterError::RankFailed { .. }) => {}
                    _ => panic!("rank {}: unexpected error {}", rank, err),
                }
            }
        }
        assert!(!out.exists());
        assert!(!dir.path().join("out.kpr.rank_0").exists());
        assert!(!dir.path().join("out.kpr.rank_1").exists());
    }
}

#[test]
fn prebuilt_index_gives_the_same_result() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let c = config();
    let fresh = run_local(&c, &m, &db, &out);

    let snapshot = build_snapshot(&c, &m, &db, SeqType::Nucleotide).unwrap();
    assert_eq!(snapshot.meta.kmer_size, 3);
    let mut run = Prefilter::new(&c, &m, &db, &db).unwrap().with_snapshot(snapshot);
    run.run(&out, &LocalCommunicator).unwrap();
    assert_eq!(read_result_file(&out).unwrap().1, fresh);

    // an index with another k-mer size is rebuilt instead of used
    let k4 = PrefilterConfig { kmer_size: 4, ..config() };
    let snapshot = build_snapshot(&k4, &m, &db, SeqType::Nucleotide).unwrap();
    let mut run = Prefilter::new(&c, &m, &db, &db).unwrap().with_snapshot(snapshot);
    run.run(&out, &LocalCommunicator).unwrap();
    assert_eq!(read_result_file(&out).unwrap().1, fresh);
}

fn random_protein(len: usize, seed: u32) -> Vec<u8> {
    let letters = b"ACDEFGHIKLMNPQRSTVWY";
    let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(5);
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            letters[(x >> 16) as usize % 20]
        })
        .collect()
}

/// Every `every`-th residue swapped for a similar one.
fn conserve(seq: &[u8], every: usize) -> Vec<u8> {
    let similar = |c: u8| match c {
        b'I' => b'V',
        b'V' => b'L',
        b'L' => b'I',
        b'K' => b'R',
        b'R' => b'K',
        b'E' => b'Q',
        b'Q' => b'E',
        b'D' => b'N',
        b'N' => b'D',
        b'S' => b'T',
        b'T' => b'S',
        b'F' => b'Y',
        b'Y' => b'F',
        b'M' => b'L',
        b'A' => b'S',
        _ => b'A',
    };
    seq.iter().enumerate().map(|(i, &c)| if i % every == every - 1 { similar(c) } else { c }).collect()
}

#[test]
fn amino_acid_queries_expand_into_similar_seeds() {
    let m = SubstitutionMatrix::blosum62();
    let mut db = MemoryStore::new(SeqType::AminoAcid, &m.name);
    let mut key = 0;
    for f in 0..2u32 {
        let base = random_protein(150, f + 11);
        for seq in [base.clone(), conserve(&base, 3), conserve(&base, 4)] {
            db.push(key, &format!("fam{}_{}", f, key), &m.encode_seq(&seq)).unwrap();
            key += 1;
        }
    }
    let c = PrefilterConfig { kmer_size: 5, include_identical: true, min_diag_score: 200, ..config() };
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let mut run = Prefilter::new(&c, &m, &db, &db).unwrap();
    let summary = run.run(&out, &LocalCommunicator).unwrap();
    assert_eq!(summary.plan.kmer_size, 5);
    assert!(summary.stats.lookups > summary.stats.seeds);

    let entries = read_result_file(&out).unwrap().1;
    assert_eq!(entries.len(), 6);
    for e in &entries {
        assert_eq!(e.hits[0].target, e.query_key);
        assert_eq!(e.hits[0].score, SELF_HIT_SCORE);
        let family = e.query_key / 3;
        let relatives = e.hits[1..].iter().filter(|h| h.target / 3 == family).count();
        assert!(relatives >= 1, "query {} hits {:?}", e.query_key, e.hits);
        assert!(e.hits.iter().all(|h| h.target / 3 == family), "query {} hits {:?}", e.query_key, e.hits);
    }
    only_output_left(dir.path());
}

#[test]
fn impossible_memory_budget_aborts() {
    let (m, db) = store(&families());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.kpr");
    let c = PrefilterConfig { memory_limit: 1, ..config() };
    let mut run = Prefilter::new(&c, &m, &db, &db).unwrap();
    let err = run.run(&out, &LocalCommunicator).unwrap_err();
    assert!(matches!(err.downcast_ref::<PrefilterError>(), Some(PrefilterError::InsufficientMemory { .. })));
    assert!(matches!(run.phase(), RunPhase::Aborted(_)));
    assert!(!out.exists());
}

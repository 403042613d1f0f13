//! 序列类型及其种子策略。
//!
//! 每种序列类型对应一个策略实现，负责三件事：
//! - `encode_seed`：把一个窗口编码为种子（拒绝未知残基）
//! - `inclusion_threshold`：索引 / 邻域扩展所用的 k-mer 阈值
//! - `score_lookup`：查询位置对目标残基的打分（矩阵或 profile）

use serde::{Deserialize, Serialize};

use crate::error::PrefilterError;
use crate::search::calibrate::kmer_threshold_table;
use crate::util::matrix::SubstitutionMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum SeqType {
    Nucleotide,
    AminoAcid,
    /// HMM-style profile: consensus residues plus a per-position score row.
    Profile,
    /// Sequence over a profile-state alphabet.
    ProfileState,
}

impl SeqType {
    pub fn strategy(self) -> &'static dyn SeedStrategy {
        match self {
            SeqType::Nucleotide => &NucleotideSeeds,
            SeqType::AminoAcid => &AminoAcidSeeds,
            SeqType::Profile => &ProfileSeeds,
            SeqType::ProfileState => &ProfileStateSeeds,
        }
    }

    pub fn is_profile(self) -> bool {
        matches!(self, SeqType::Profile | SeqType::ProfileState)
    }

    pub fn name(self) -> &'static str {
        match self {
            SeqType::Nucleotide => "nucleotide",
            SeqType::AminoAcid => "amino acid",
            SeqType::Profile => "profile",
            SeqType::ProfileState => "profile state",
        }
    }
}

/// Reject query/target pairings the matcher cannot score.
pub fn check_pairing(query: SeqType, target: SeqType) -> Result<(), PrefilterError> {
    use SeqType::*;
    match (query, target) {
        (Nucleotide, Nucleotide)
        | (AminoAcid, AminoAcid)
        | (AminoAcid, Profile)
        | (Profile, AminoAcid)
        | (ProfileState, ProfileState) => Ok(()),
        (Profile, Profile) => Err(PrefilterError::config(
            "query profiles cannot be searched against a target profile database",
        )),
        (q, t) => Err(PrefilterError::config(format!(
            "{} queries cannot be searched against a {} target database",
            q.name(),
            t.name()
        ))),
    }
}

/// Best-k-mer (exact) policy: only identical seed codes are looked up.
pub fn takes_only_best_kmer(query: SeqType, target: SeqType, exact_kmer_matching: bool) -> bool {
    exact_kmer_matching
        || (target == SeqType::Profile && query == SeqType::AminoAcid)
        || (target == SeqType::Nucleotide && query == SeqType::Nucleotide)
}

pub trait SeedStrategy: Sync {
    /// Number of letters that may appear in a seed, given the matrix alphabet.
    fn seed_alphabet(&self, matrix_alphabet: usize) -> usize {
        matrix_alphabet - 1
    }

    /// Whether queries of this type are expanded into similar seeds.
    fn expands_neighbors(&self) -> bool {
        false
    }

    /// Encode a gathered window, first residue most significant.
    fn encode_seed(&self, window: &[u8], alphabet: usize) -> Option<u32> {
        let mut code = 0u32;
        for &r in window {
            if r as usize >= alphabet {
                return None;
            }
            code = code * alphabet as u32 + r as u32;
        }
        Some(code)
    }

    /// Minimum seed-pair score for this query type.
    fn inclusion_threshold(
        &self,
        sensitivity: f32,
        kmer_size: usize,
        kmer_score: Option<i32>,
    ) -> Result<i32, PrefilterError>;

    /// Score of query position `qpos` against target residue `t_res`.
    fn score_lookup(
        &self,
        matrix: &SubstitutionMatrix,
        residues: &[u8],
        _profile: Option<&[i16]>,
        qpos: usize,
        t_res: u8,
    ) -> i32 {
        matrix.score(residues[qpos], t_res) as i32
    }
}

pub struct NucleotideSeeds;
pub struct AminoAcidSeeds;
pub struct ProfileSeeds;
pub struct ProfileStateSeeds;

impl SeedStrategy for NucleotideSeeds {
    fn inclusion_threshold(&self, _: f32, _: usize, _: Option<i32>) -> Result<i32, PrefilterError> {
        Ok(0)
    }
}

impl SeedStrategy for AminoAcidSeeds {
    fn expands_neighbors(&self) -> bool {
        true
    }

    fn inclusion_threshold(
        &self,
        sensitivity: f32,
        kmer_size: usize,
        kmer_score: Option<i32>,
    ) -> Result<i32, PrefilterError> {
        match kmer_score {
            Some(s) => Ok(s),
            None => kmer_threshold_table(sensitivity, kmer_size, false),
        }
    }
}

fn profile_row_score(
    matrix: &SubstitutionMatrix,
    residues: &[u8],
    profile: Option<&[i16]>,
    qpos: usize,
    t_res: u8,
) -> i32 {
    let a = matrix.alphabet_size();
    match profile {
        Some(p) if p.len() >= (qpos + 1) * a => p[qpos * a + t_res as usize] as i32,
        _ => matrix.score(residues[qpos], t_res) as i32,
    }
}

impl SeedStrategy for ProfileSeeds {
    fn seed_alphabet(&self, matrix_alphabet: usize) -> usize {
        matrix_alphabet
    }

    fn inclusion_threshold(
        &self,
        sensitivity: f32,
        kmer_size: usize,
        kmer_score: Option<i32>,
    ) -> Result<i32, PrefilterError> {
        match kmer_score {
            Some(s) => Ok(s),
            None => kmer_threshold_table(sensitivity, kmer_size, true),
        }
    }

    fn score_lookup(
        &self,
        matrix: &SubstitutionMatrix,
        residues: &[u8],
        profile: Option<&[i16]>,
        qpos: usize,
        t_res: u8,
    ) -> i32 {
        profile_row_score(matrix, residues, profile, qpos, t_res)
    }
}

impl SeedStrategy for ProfileStateSeeds {
    fn seed_alphabet(&self, matrix_alphabet: usize) -> usize {
        matrix_alphabet
    }

    fn inclusion_threshold(
        &self,
        sensitivity: f32,
        kmer_size: usize,
        kmer_score: Option<i32>,
    ) -> Result<i32, PrefilterError> {
        match kmer_score {
            Some(s) => Ok(s),
            None => kmer_threshold_table(sensitivity, kmer_size, false),
        }
    }

    fn score_lookup(
        &self,
        matrix: &SubstitutionMatrix,
        residues: &[u8],
        profile: Option<&[i16]>,
        qpos: usize,
        t_res: u8,
    ) -> i32 {
        profile_row_score(matrix, residues, profile, qpos, t_res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_rules() {
        assert!(check_pairing(SeqType::AminoAcid, SeqType::AminoAcid).is_ok());
        assert!(check_pairing(SeqType::Profile, SeqType::AminoAcid).is_ok());
        assert!(check_pairing(SeqType::Profile, SeqType::Profile).is_err());
        assert!(check_pairing(SeqType::Nucleotide, SeqType::AminoAcid).is_err());
        assert!(check_pairing(SeqType::AminoAcid, SeqType::Nucleotide).is_err());
    }

    #[test]
    fn best_kmer_policy() {
        assert!(takes_only_best_kmer(SeqType::Nucleotide, SeqType::Nucleotide, false));
        assert!(takes_only_best_kmer(SeqType::AminoAcid, SeqType::Profile, false));
        assert!(!takes_only_best_kmer(SeqType::AminoAcid, SeqType::AminoAcid, false));
        assert!(takes_only_best_kmer(SeqType::AminoAcid, SeqType::AminoAcid, true));
    }

    #[test]
    fn encode_seed_rejects_unknown() {
        let s = SeqType::Nucleotide.strategy();
        assert_eq!(s.seed_alphabet(5), 4);
        assert_eq!(s.encode_seed(&[0, 1, 2], 4), Some(6));
        assert_eq!(s.encode_seed(&[3, 3, 3], 4), Some(63));
        assert_eq!(s.encode_seed(&[0, 4, 2], 4), None);
    }

    #[test]
    fn thresholds_per_type() {
        assert_eq!(SeqType::Nucleotide.strategy().inclusion_threshold(4.0, 3, None).unwrap(), 0);
        let aa = SeqType::AminoAcid.strategy().inclusion_threshold(4.0, 6, None).unwrap();
        let prof = SeqType::Profile.strategy().inclusion_threshold(4.0, 6, None).unwrap();
        assert_eq!(prof - aa, 17);
        assert_eq!(SeqType::AminoAcid.strategy().inclusion_threshold(4.0, 6, Some(90)).unwrap(), 90);
        assert!(SeqType::AminoAcid.strategy().inclusion_threshold(4.0, 4, None).is_err());
    }

    #[test]
    fn profile_score_uses_profile_row() {
        let m = SubstitutionMatrix::nucleotide(2, 3);
        let residues = [0u8, 1];
        let profile: Vec<i16> = vec![10, 11, 12, 13, 0, 20, 21, 22, 23, 0];
        let s = SeqType::Profile.strategy();
        assert_eq!(s.score_lookup(&m, &residues, Some(&profile), 1, 2), 22);
        assert_eq!(s.score_lookup(&m, &residues, None, 1, 1), 2);
        assert_eq!(SeqType::AminoAcid.strategy().score_lookup(&m, &residues, Some(&profile), 1, 2), -3);
    }
}

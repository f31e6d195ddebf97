use std::fmt::{Display, Formatter};

use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use itertools::Itertools;

// Scoring chosen so that the fraction of equal-length alignments containing
// indels stays within an order of magnitude of the expected double-indel rate.
pub(crate) const MATCH_SCORE: i32 = 4;
pub(crate) const MISMATCH_SCORE: i32 = -2;
pub(crate) const GAP_OPEN: i32 = -5;
pub(crate) const GAP_EXTEND: i32 = -2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CigarOp {
    Match,
    Mismatch,
    /// base present in the guide but not the observed target
    Insertion,
    /// base present in the observed target but not the guide
    Deletion,
}

impl CigarOp {
    pub fn symbol(&self) -> char {
        match self {
            Self::Match => '=',
            Self::Mismatch => 'X',
            Self::Insertion => 'I',
            Self::Deletion => 'D',
        }
    }

    fn is_indel(&self) -> bool {
        matches!(self, Self::Insertion | Self::Deletion)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CigarRun {
    pub op: CigarOp,
    pub len: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cigar(pub Vec<CigarRun>);

impl Display for Cigar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for run in self.0.iter() {
            write!(f, "{}{}", run.len, run.op.symbol())?;
        }
        Ok(())
    }
}

/// Global alignment of a guide (query) against an observed target, scored
/// with the fixed BLT scheme where a length-k gap costs
/// `GAP_OPEN + k * GAP_EXTEND`.
pub fn align(guide: &[u8], target: &[u8]) -> Cigar {
    let score =
        |a: u8, b: u8| if a == b { MATCH_SCORE } else { MISMATCH_SCORE };
    let mut aligner = Aligner::with_capacity(
        guide.len(),
        target.len(),
        GAP_OPEN,
        GAP_EXTEND,
        &score,
    );
    let alignment = aligner.global(guide, target);
    let runs = alignment
        .operations
        .iter()
        .filter_map(|op| match op {
            AlignmentOperation::Match => Some(CigarOp::Match),
            AlignmentOperation::Subst => Some(CigarOp::Mismatch),
            AlignmentOperation::Ins => Some(CigarOp::Insertion),
            AlignmentOperation::Del => Some(CigarOp::Deletion),
            _ => None,
        })
        .group_by(|&op| op)
        .into_iter()
        .map(|(op, group)| CigarRun { op, len: group.count() })
        .collect::<Vec<CigarRun>>();
    Cigar(runs)
}

/// Mismatch and indel annotation for one guide/target pair, derived from the
/// alignment operations. Mismatch positions are 1-based and counted from the
/// PAM-proximal end for a 3'-PAM enzyme.
#[derive(Debug, Clone)]
pub struct TargetAnnotation {
    pub cigar: Cigar,
    pub pam_is_5prime_of_target: bool,
    pub mismatches: usize,
    pub indel_bases: usize,
    pub mismatch_positions: Vec<usize>,
    /// (position, guide base, target base) per mismatch, same order as
    /// `mismatch_positions`
    pub mismatch_tuples: Vec<(usize, char, char)>,
    pub padded_guide: String,
    pub alignment: String,
    pub padded_target: String,
}

impl TargetAnnotation {
    pub fn new(
        guide: &[u8],
        target: &[u8],
        pam_is_5prime_of_target: bool,
    ) -> Self {
        let cigar = align(guide, target);
        let mismatches = cigar
            .0
            .iter()
            .filter(|r| r.op == CigarOp::Mismatch)
            .map(|r| r.len)
            .sum::<usize>();
        let indel_bases = cigar
            .0
            .iter()
            .filter(|r| r.op.is_indel())
            .map(|r| r.len)
            .sum::<usize>();

        let mut padded_guide = String::new();
        let mut alignment = String::new();
        let mut padded_target = String::new();
        let mut raw_positions = Vec::new();
        let mut raw_tuples = Vec::new();
        let mut guide_pos = 0usize;
        let mut target_pos = 0usize;
        for run in cigar.0.iter() {
            for _ in 0..run.len {
                match run.op {
                    CigarOp::Match | CigarOp::Mismatch => {
                        let g = guide[guide_pos] as char;
                        let t = target[target_pos] as char;
                        padded_guide.push(g);
                        padded_target.push(t);
                        if run.op == CigarOp::Match {
                            alignment.push('|');
                        } else {
                            alignment.push('.');
                            raw_positions.push(guide_pos + 1);
                            raw_tuples.push((guide_pos + 1, g, t));
                        }
                        guide_pos += 1;
                        target_pos += 1;
                    }
                    CigarOp::Insertion => {
                        padded_guide.push(guide[guide_pos] as char);
                        alignment.push(' ');
                        padded_target.push('-');
                        guide_pos += 1;
                    }
                    CigarOp::Deletion => {
                        padded_guide.push('-');
                        alignment.push(' ');
                        padded_target.push(target[target_pos] as char);
                        target_pos += 1;
                    }
                }
            }
        }
        assert!(
            padded_guide.len() == alignment.len()
                && alignment.len() == padded_target.len(),
            "padded guide/alignment/target must have equal lengths"
        );

        // positions are only meaningful when the alignment is gap-free
        let (mismatch_positions, mismatch_tuples) = if indel_bases > 0 {
            (Vec::new(), Vec::new())
        } else if pam_is_5prime_of_target {
            (raw_positions, raw_tuples)
        } else {
            let n = guide.len();
            let positions = raw_positions
                .iter()
                .rev()
                .map(|p| n - p + 1)
                .collect::<Vec<usize>>();
            let tuples = raw_tuples
                .iter()
                .rev()
                .map(|&(p, g, t)| (n - p + 1, g, t))
                .collect::<Vec<(usize, char, char)>>();
            (positions, tuples)
        };

        Self {
            cigar,
            pam_is_5prime_of_target,
            mismatches,
            indel_bases,
            mismatch_positions,
            mismatch_tuples,
            padded_guide,
            alignment,
            padded_target,
        }
    }

    pub fn mean_mismatch_position(&self) -> Option<f64> {
        if self.mismatch_positions.is_empty() {
            None
        } else {
            let total = self.mismatch_positions.iter().sum::<usize>();
            Some(total as f64 / self.mismatch_positions.len() as f64)
        }
    }

    pub fn mismatch_tuples_string(&self) -> String {
        let inner = self
            .mismatch_tuples
            .iter()
            .map(|(p, g, t)| format!("({p},{g},{t})"))
            .join(",");
        format!("[{inner}]")
    }
}

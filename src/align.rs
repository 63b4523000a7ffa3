use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use std::ops::Range;

use crate::mutation::{MutationCode, MutationKind};
use crate::string_util::N_CODE;

/// Returns the number of mismatching positions between two equal length slices.
/// # Arguments
/// * `v1` - the first slice
/// * `v2` - the second slice, must be the same length as `v1`
/// # Examples
/// ```rust
/// use migcall::align::hamming_distance;
/// let v1: Vec<u8> = vec![0, 1, 2, 3, 0];
/// let v2: Vec<u8> = vec![0, 1, 3, 3, 1];
/// assert_eq!(hamming_distance(&v1, &v1), 0);
/// assert_eq!(hamming_distance(&v1, &v2), 2);
/// ```
#[inline]
pub fn hamming_distance(v1: &[u8], v2: &[u8]) -> usize {
    debug_assert_eq!(v1.len(), v2.len());
    v1.iter()
        .zip(v2.iter())
        .filter(|(a, b)| a != b)
        .count()
}

/// Contains the mismatch profile of one sequence laid against another
#[derive(Debug, PartialEq)]
pub struct MismatchProfile {
    /// The total number of mismatches
    pub total: usize,
    /// The longest run of adjacent mismatches
    pub max_consecutive: usize
}

/// Counts total and longest consecutive mismatches between two equal length slices.
/// # Examples
/// ```rust
/// use migcall::align::{mismatch_profile, MismatchProfile};
/// let v1: Vec<u8> = vec![0, 1, 2, 3, 0, 1];
/// let v2: Vec<u8> = vec![1, 1, 3, 0, 1, 1];
/// assert_eq!(mismatch_profile(&v1, &v2), MismatchProfile {
///     total: 4,
///     max_consecutive: 3
/// });
/// ```
pub fn mismatch_profile(v1: &[u8], v2: &[u8]) -> MismatchProfile {
    let mut total: usize = 0;
    let mut run: usize = 0;
    let mut max_consecutive: usize = 0;
    for (a, b) in v1.iter().zip(v2.iter()) {
        if a != b {
            total += 1;
            run += 1;
            max_consecutive = std::cmp::max(max_consecutive, run);
        } else {
            run = 0;
        }
    }
    MismatchProfile {
        total,
        max_consecutive
    }
}

/// Scoring scheme for local alignment, gaps are affine
#[derive(Clone, Copy, Debug)]
pub struct Scoring {
    pub match_score: i32,
    pub mismatch_score: i32,
    pub gap_open: i32,
    pub gap_extend: i32
}

impl Default for Scoring {
    fn default() -> Self {
        Self {
            match_score: 1,
            mismatch_score: -3,
            gap_open: -5,
            gap_extend: -1
        }
    }
}

/// Result of a local alignment between a reference (e.g. a consensus) and a query (e.g. a read)
#[derive(Clone, Debug, PartialEq)]
pub struct LocalAlignment {
    /// The alignment score
    pub score: i32,
    /// Mutations of the query relative to the reference, in reference coordinates
    pub mutations: Vec<MutationCode>,
    /// The aligned range in the reference
    pub reference_range: Range<usize>,
    /// The aligned range in the query
    pub query_range: Range<usize>,
    /// Every (reference, query) position pair joined by a match or substitution
    pub aligned_pairs: Vec<(usize, usize)>
}

impl LocalAlignment {
    /// Returns the number of aligned query bases that are not part of any mutation.
    pub fn matched_bases(&self) -> usize {
        let mutated_query_bases: usize = self.mutations.iter()
            .filter(|m| m.kind() != MutationKind::Deletion)
            .count();
        self.query_range.len().saturating_sub(mutated_query_bases)
    }

    /// Returns true if the alignment contains no insertions or deletions.
    pub fn is_ungapped(&self) -> bool {
        self.mutations.iter().all(|m| m.is_substitution())
    }
}

/// Thin wrapper around the rust-bio pairwise aligner that reports results in mutation space.
pub struct LocalAligner {
    scoring: Scoring
}

impl Default for LocalAligner {
    fn default() -> Self {
        LocalAligner::new(Default::default())
    }
}

impl LocalAligner {
    pub fn new(scoring: Scoring) -> LocalAligner {
        LocalAligner {
            scoring
        }
    }

    /// Locally aligns `query` against `reference`, both in integer nucleotide format.
    /// Returns `None` if there is no positively scoring alignment.
    /// # Arguments
    /// * `reference` - the sequence mutations are reported against
    /// * `query` - the sequence being placed
    /// # Examples
    /// ```rust
    /// use migcall::align::LocalAligner;
    /// use migcall::string_util::convert_stoi;
    /// let reference = convert_stoi("ACGTTGCAAGGCTTACGATCG");
    /// let query = convert_stoi("TGCAAGTCTTAC");
    /// let aln = LocalAligner::default().align(&reference, &query).unwrap();
    /// assert_eq!(aln.reference_range, 4..16);
    /// assert_eq!(aln.query_range, 0..12);
    /// assert_eq!(aln.mutations.len(), 1);
    /// assert_eq!(aln.mutations[0].to_string(), "S10:G>T");
    /// ```
    pub fn align(&self, reference: &[u8], query: &[u8]) -> Option<LocalAlignment> {
        if reference.is_empty() || query.is_empty() {
            return None;
        }

        let match_score = self.scoring.match_score;
        let mismatch_score = self.scoring.mismatch_score;
        let score_fn = |a: u8, b: u8| {
            //N never scores as a match
            if a == b && a != N_CODE {
                match_score
            } else {
                mismatch_score
            }
        };
        let mut aligner = Aligner::with_capacity(
            reference.len(),
            query.len(),
            self.scoring.gap_open,
            self.scoring.gap_extend,
            score_fn
        );
        let alignment = aligner.local(reference, query);
        if alignment.score <= 0 {
            return None;
        }

        //walk the operations and convert them into reference-space mutations
        let mut mutations: Vec<MutationCode> = Vec::<MutationCode>::new();
        let mut aligned_pairs: Vec<(usize, usize)> = Vec::<(usize, usize)>::with_capacity(query.len());
        let mut x: usize = alignment.xstart;
        let mut y: usize = alignment.ystart;
        for op in alignment.operations.iter() {
            match op {
                AlignmentOperation::Match => {
                    aligned_pairs.push((x, y));
                    x += 1;
                    y += 1;
                },
                AlignmentOperation::Subst => {
                    aligned_pairs.push((x, y));
                    if reference[x] < N_CODE && query[y] < N_CODE {
                        mutations.push(MutationCode::substitution(x, reference[x], query[y]));
                    }
                    x += 1;
                    y += 1;
                },
                AlignmentOperation::Del => {
                    //base present in the query only
                    if query[y] < N_CODE {
                        mutations.push(MutationCode::insertion(x, query[y]));
                    }
                    y += 1;
                },
                AlignmentOperation::Ins => {
                    //base present in the reference only
                    if reference[x] < N_CODE {
                        mutations.push(MutationCode::deletion(x, reference[x]));
                    }
                    x += 1;
                },
                AlignmentOperation::Xclip(_) | AlignmentOperation::Yclip(_) => {}
            }
        }

        Some(LocalAlignment {
            score: alignment.score,
            mutations,
            reference_range: alignment.xstart..alignment.xend,
            query_range: alignment.ystart..alignment.yend,
            aligned_pairs
        })
    }
}

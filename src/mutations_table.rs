
use crate::assembler::Consensus;
use crate::mutation::MutationCode;
use crate::string_util::{self, NT_COUNT};

/// A reference sequence that consensus reads are placed on
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    /// The record name from the reference file
    pub name: String,
    /// The contig this reference lies on, defaults to the name
    pub contig: String,
    /// Genomic coordinate of the first reference base
    pub genomic_start: usize,
    /// The reference bases in integer format
    pub sequence: Vec<u8>
}

impl Reference {
    /// Creates a reference from a FASTA style record.
    /// Record names of the form `contig:start` are split into contig and 0-based genomic start.
    /// # Examples
    /// ```rust
    /// use migcall::mutations_table::Reference;
    /// let r = Reference::new("chr7:55241600", b"ACGT");
    /// assert_eq!(r.contig, "chr7");
    /// assert_eq!(r.genomic_start, 55241600);
    /// let r = Reference::new("amplicon_1", b"ACGT");
    /// assert_eq!(r.contig, "amplicon_1");
    /// assert_eq!(r.genomic_start, 0);
    /// ```
    pub fn new(name: &str, seq: &[u8]) -> Reference {
        let (contig, genomic_start) = match name.rsplit_once(':') {
            Some((contig, start)) if !contig.is_empty() => match start.parse::<usize>() {
                Ok(start) => (contig.to_string(), start),
                Err(_) => (name.to_string(), 0)
            },
            _ => (name.to_string(), 0)
        };
        Reference {
            name: name.to_string(),
            contig,
            genomic_start,
            sequence: string_util::convert_btoi(seq)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Per-position tallies over every consensus placed on one reference.
#[derive(Clone, Debug)]
pub struct MutationsTable {
    reference: Reference,
    coverage: Vec<u32>,
    majors: Vec<[u32; NT_COUNT]>,
    minors: Vec<[u32; NT_COUNT]>,
    quality_sum: Vec<u64>,
    migs_appended: u64
}

impl MutationsTable {
    pub fn new(reference: Reference) -> MutationsTable {
        let len: usize = reference.len();
        MutationsTable {
            reference,
            coverage: vec![0; len],
            majors: vec![[0; NT_COUNT]; len],
            minors: vec![[0; NT_COUNT]; len],
            quality_sum: vec![0; len],
            migs_appended: 0
        }
    }

    #[inline]
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    /// Adds an ungapped consensus placement; consensus position `i` lands on reference position `i + offset`.
    /// Bases hanging off either end of the reference are ignored, as are `N` bases.
    /// Every covered base counts towards the major table, every minor of the consensus towards the minor table.
    /// # Arguments
    /// * `offset` - reference position of the first consensus base, may be negative
    /// * `consensus` - the assembled consensus
    pub fn append(&mut self, offset: isize, consensus: &Consensus) {
        let ref_len: isize = self.len() as isize;
        let mut placed: bool = false;
        for (i, (&base, &q)) in consensus.seq.iter().zip(consensus.qual.iter()).enumerate() {
            let pos: isize = i as isize + offset;
            if pos < 0 || pos >= ref_len || (base as usize) >= NT_COUNT {
                continue;
            }
            let pos: usize = pos as usize;
            self.coverage[pos] += 1;
            self.majors[pos][base as usize] += 1;
            self.quality_sum[pos] += q as u64;
            placed = true;
        }

        let mut minor_seen: Vec<MutationCode> = Vec::<MutationCode>::with_capacity(consensus.minors.len());
        for code in consensus.minor_codes() {
            let shifted: MutationCode = match code.shift(offset) {
                Some(c) => c,
                None => continue
            };
            if shifted.position() >= self.len() {
                continue;
            }
            //one MIG counts once per minor base
            if minor_seen.contains(&shifted) {
                continue;
            }
            minor_seen.push(shifted);
            self.minors[shifted.position()][shifted.to() as usize] += 1;
        }

        if placed {
            self.migs_appended += 1;
        }
    }

    /// The number of consensus reads covering `pos`.
    #[inline]
    pub fn coverage(&self, pos: usize) -> u32 {
        self.coverage[pos]
    }

    /// The number of consensus reads carrying `base` at `pos`.
    #[inline]
    pub fn major_count(&self, pos: usize, base: u8) -> u32 {
        self.majors[pos][base as usize]
    }

    /// The number of consensus reads with a minor `base` at `pos`.
    #[inline]
    pub fn minor_count(&self, pos: usize, base: u8) -> u32 {
        self.minors[pos][base as usize]
    }

    /// The mean consensus quality at `pos`, 0 if nothing covers it.
    pub fn mean_quality(&self, pos: usize) -> f64 {
        if self.coverage[pos] == 0 {
            0.0
        } else {
            self.quality_sum[pos] as f64 / self.coverage[pos] as f64
        }
    }

    /// The reference base at `pos`.
    #[inline]
    pub fn reference_base(&self, pos: usize) -> u8 {
        self.reference.sequence[pos]
    }

    /// The most supported base at `pos`; ties and uncovered positions resolve to the reference base.
    pub fn ancestral_base(&self, pos: usize) -> u8 {
        let ref_base: u8 = self.reference_base(pos);
        let mut best: u8 = ref_base;
        let mut best_count: u32 = if (ref_base as usize) < NT_COUNT { self.majors[pos][ref_base as usize] } else { 0 };
        for base in 0..NT_COUNT as u8 {
            if self.majors[pos][base as usize] > best_count {
                best = base;
                best_count = self.majors[pos][base as usize];
            }
        }
        best
    }

    /// Returns true if any consensus read carries the reference base at `pos`.
    pub fn has_reference_base(&self, pos: usize) -> bool {
        let ref_base: u8 = self.reference_base(pos);
        (ref_base as usize) < NT_COUNT && self.majors[pos][ref_base as usize] > 0
    }

    /// The number of consensus reads placed on this reference.
    #[inline]
    pub fn migs_appended(&self) -> u64 {
        self.migs_appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string_util::convert_stoi;
    use std::collections::BTreeMap;

    fn consensus(seq: &str, minors: Vec<(MutationCode, u32)>) -> Consensus {
        let seq = convert_stoi(seq);
        let len = seq.len();
        Consensus {
            mig_index: 0,
            umi: "ACGT".to_string(),
            seq,
            qual: vec![30; len],
            minors: minors.into_iter().collect::<BTreeMap<_, _>>(),
            assembled_size: 10,
            mig_size: 10
        }
    }

    #[test]
    fn test_append() {
        let reference = Reference::new("ref", b"AACCGGTTAACCGGTT");
        let mut table = MutationsTable::new(reference);
        table.append(2, &consensus("CCGGTTAA", vec![]));
        table.append(2, &consensus("CCGATTAA", vec![(MutationCode::substitution(0, 1, 0), 3)]));
        assert_eq!(table.migs_appended(), 2);
        assert_eq!(table.coverage(1), 0);
        assert_eq!(table.coverage(2), 2);
        assert_eq!(table.coverage(9), 2);
        assert_eq!(table.coverage(10), 0);
        assert_eq!(table.major_count(5, 0), 1);
        assert_eq!(table.major_count(5, 2), 1);
        //minor coordinates are shifted onto the reference
        assert_eq!(table.minor_count(2, 0), 1);
        assert_eq!(table.mean_quality(4), 30.0);
        assert_eq!(table.mean_quality(0), 0.0);
    }

    #[test]
    fn test_overhang() {
        let reference = Reference::new("ref", b"ACGTACGT");
        let mut table = MutationsTable::new(reference);
        table.append(-2, &consensus("GTACGTACGTAC", vec![(MutationCode::substitution(1, 3, 0), 2)]));
        assert_eq!(table.coverage(0), 1);
        assert_eq!(table.coverage(7), 1);
        //the minor fell before the reference start
        for pos in 0..8 {
            for base in 0..4 {
                assert_eq!(table.minor_count(pos, base), 0);
            }
        }
    }

    #[test]
    fn test_ancestral_base() {
        let reference = Reference::new("ref", b"ACGT");
        let mut table = MutationsTable::new(reference);
        assert_eq!(table.ancestral_base(2), 2);
        assert!(!table.has_reference_base(2));

        table.append(0, &consensus("ACTT", vec![]));
        //tie between G and T goes to the reference
        table.append(0, &consensus("ACGT", vec![]));
        assert_eq!(table.ancestral_base(2), 2);
        table.append(0, &consensus("ACTT", vec![]));
        assert_eq!(table.ancestral_base(2), 3);
        assert!(table.has_reference_base(2));
    }
}

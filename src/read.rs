
use crate::stats_util::{DEFAULT_GOOD_QUAL, PHRED_OFFSET};
use crate::string_util;

/// A single sequencing read in integer nucleotide space with raw phred qualities.
#[derive(Clone, Debug, PartialEq)]
pub struct Read {
    seq: Vec<u8>,
    qual: Vec<u8>,
    good_mask: Vec<bool>
}

impl Read {
    /// Creates a read from integer bases and raw (not ASCII offset) phred scores using the default
    /// good quality threshold.
    /// # Arguments
    /// * `seq` - the bases in integer format, see `string_util`
    /// * `qual` - the raw phred qualities, must be the same length as `seq`
    /// # Examples
    /// ```rust
    /// use migcall::read::Read;
    /// let read = Read::new(vec![0, 1, 2, 3], vec![40, 40, 10, 40]);
    /// assert_eq!(read.len(), 4);
    /// assert!(read.good_quality(1));
    /// assert!(!read.good_quality(2));
    /// ```
    pub fn new(seq: Vec<u8>, qual: Vec<u8>) -> Read {
        Read::with_quality_threshold(seq, qual, DEFAULT_GOOD_QUAL)
    }

    /// Same as `new(...)`, but with a custom threshold for the good quality mask.
    pub fn with_quality_threshold(seq: Vec<u8>, qual: Vec<u8>, threshold: u8) -> Read {
        assert_eq!(seq.len(), qual.len(), "read sequence and quality lengths differ");
        let good_mask: Vec<bool> = seq.iter()
            .zip(qual.iter())
            .map(|(&b, &q)| b < string_util::N_CODE && q >= threshold)
            .collect();
        Read {
            seq,
            qual,
            good_mask
        }
    }

    /// Creates a read from ASCII bases and phred+33 encoded qualities as found in a FASTQ file.
    /// # Examples
    /// ```rust
    /// use migcall::read::Read;
    /// let read = Read::from_ascii(b"ACGT", b"II+I");
    /// assert_eq!(read.seq(), &[0, 1, 2, 3]);
    /// assert_eq!(read.qual(), &[40, 40, 10, 40]);
    /// ```
    pub fn from_ascii(seq: &[u8], qual: &[u8]) -> Read {
        let qual: Vec<u8> = qual.iter().map(|&q| q.saturating_sub(PHRED_OFFSET)).collect();
        Read::new(string_util::convert_btoi(seq), qual)
    }

    /// Creates a read where every base has the same quality, mostly useful for FASTA input and tests.
    pub fn with_uniform_quality(seq: Vec<u8>, q: u8) -> Read {
        let qual = vec![q; seq.len()];
        Read::new(seq, qual)
    }

    #[inline]
    pub fn seq(&self) -> &[u8] {
        &self.seq
    }

    #[inline]
    pub fn qual(&self) -> &[u8] {
        &self.qual
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Returns true if the base at `pos` is a called nucleotide with quality at or above the read threshold.
    #[inline]
    pub fn good_quality(&self, pos: usize) -> bool {
        self.good_mask[pos]
    }

    /// Extracts the sub-read in the range `[from, to)`.
    pub fn region(&self, from: usize, to: usize) -> Read {
        Read {
            seq: self.seq[from..to].to_vec(),
            qual: self.qual[from..to].to_vec(),
            good_mask: self.good_mask[from..to].to_vec()
        }
    }
}

/// A molecular identifier group: every read that shares the same UMI.
#[derive(Clone, Debug)]
pub struct Mig {
    /// The submission index of this group, used to keep output ordered
    pub index: u64,
    /// The UMI sequence as ASCII
    pub umi: String,
    /// The reads in the order they were observed
    pub reads: Vec<Read>
}

impl Mig {
    pub fn new(index: u64, umi: String, reads: Vec<Read>) -> Mig {
        Mig {
            index,
            umi,
            reads
        }
    }

    /// The number of reads in the group.
    #[inline]
    pub fn size(&self) -> usize {
        self.reads.len()
    }
}

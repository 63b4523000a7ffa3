
use crate::stats_util;
use crate::string_util::NT_COUNT;

/// Position weight matrix with two parallel count tables: every contributing base, and only the bases
/// that passed the read's good quality predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionWeightMatrix {
    all: Vec<[u32; NT_COUNT]>,
    good: Vec<[u32; NT_COUNT]>
}

/// The consensus read out of a PWM, before any trimming
#[derive(Clone, Debug, PartialEq)]
pub struct RawConsensus {
    /// majority base per column
    pub seq: Vec<u8>,
    /// consensus quality score per column
    pub qual: Vec<u8>
}

impl PositionWeightMatrix {
    /// Allocates an empty matrix with `len` columns.
    pub fn new(len: usize) -> PositionWeightMatrix {
        PositionWeightMatrix {
            all: vec![[0; NT_COUNT]; len],
            good: vec![[0; NT_COUNT]; len]
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.all.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Adds one observation of `base` at column `pos`; `N` bases are ignored.
    /// # Arguments
    /// * `pos` - the column
    /// * `base` - the integer base
    /// * `good` - if true, the quality-filtered table is incremented as well
    #[inline]
    pub fn add(&mut self, pos: usize, base: u8, good: bool) {
        if (base as usize) < NT_COUNT {
            self.all[pos][base as usize] += 1;
            if good {
                self.good[pos][base as usize] += 1;
            }
        }
    }

    /// Reverses a previous `add(...)` with the same arguments, decrementing both tables symmetrically.
    #[inline]
    pub fn remove(&mut self, pos: usize, base: u8, good: bool) {
        if (base as usize) < NT_COUNT {
            debug_assert!(self.all[pos][base as usize] > 0);
            self.all[pos][base as usize] = self.all[pos][base as usize].saturating_sub(1);
            if good {
                debug_assert!(self.good[pos][base as usize] > 0);
                self.good[pos][base as usize] = self.good[pos][base as usize].saturating_sub(1);
            }
        }
    }

    /// Count of `base` at `pos` over all reads.
    #[inline]
    pub fn count(&self, pos: usize, base: u8) -> u32 {
        self.all[pos][base as usize]
    }

    /// Count of `base` at `pos` over quality-filtered bases only.
    #[inline]
    pub fn good_count(&self, pos: usize, base: u8) -> u32 {
        self.good[pos][base as usize]
    }

    /// The number of bases contributed to a column.
    #[inline]
    pub fn column_sum(&self, pos: usize) -> u32 {
        self.all[pos].iter().sum()
    }

    /// Returns the majority base of a column and its count; on ties the first base in `ACGT` order wins.
    /// # Examples
    /// ```rust
    /// use migcall::pwm::PositionWeightMatrix;
    /// let mut pwm = PositionWeightMatrix::new(1);
    /// pwm.add(0, 2, true);
    /// pwm.add(0, 1, true);
    /// assert_eq!(pwm.majority(0), (1, 1));
    /// pwm.add(0, 2, false);
    /// assert_eq!(pwm.majority(0), (2, 2));
    /// ```
    #[inline]
    pub fn majority(&self, pos: usize) -> (u8, u32) {
        let column = &self.all[pos];
        let mut max_pos: usize = 0;
        for x in 1..NT_COUNT {
            if column[x] > column[max_pos] {
                max_pos = x;
            }
        }
        (max_pos as u8, column[max_pos])
    }

    /// Builds the untrimmed consensus: majority base and CQS per column.
    /// # Arguments
    /// * `total_reads` - the number of reads assembled, the denominator for the agreement fraction
    pub fn consensus(&self, total_reads: usize) -> RawConsensus {
        let mut seq: Vec<u8> = Vec::<u8>::with_capacity(self.len());
        let mut qual: Vec<u8> = Vec::<u8>::with_capacity(self.len());
        for pos in 0..self.len() {
            let (base, count) = self.majority(pos);
            seq.push(base);
            qual.push(stats_util::consensus_quality(count, total_reads));
        }
        RawConsensus {
            seq,
            qual
        }
    }
}

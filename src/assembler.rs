
extern crate log;

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::align::{self, LocalAligner};
use crate::errors::{self, ConfigError};
use crate::minor_caller::MinorCaller;
use crate::mutation::MutationCode;
use crate::pwm::{PositionWeightMatrix, RawConsensus};
use crate::read::{Mig, Read};
use crate::stats_util::{self, BAD_QUAL, PHRED_OFFSET};
use crate::string_util::{self, NT_COUNT};

/// stores options for running the MIG assembly algorithms
#[derive(Clone, Debug)]
pub struct AssemblerParameters {
    /// Reads are searched for the anchor at offsets in `[-offset_range, offset_range]` around their midpoint
    pub offset_range: usize,
    /// Half-width of the anchor window, the window spans `2*anchor_region+1` bases
    pub anchor_region: usize,
    /// Maximum mismatches against the anchor for a read to be accepted
    pub max_mms: usize,
    /// Maximum run of adjacent mismatches against the raw consensus before rescue removes a read
    pub max_consequent_mms: usize,
    /// Maximum fraction of reads that can be dropped before the MIG is rejected
    pub max_dropped_reads_ratio: f64,
    /// Maximum fraction of reads that can be lost after rescue before the MIG is rejected
    pub max_dropped_reads_ratio_after_rescue: f64,
    /// Maximum fraction of PWM columns removed by trimming before the MIG is rejected
    pub max_trimmed_consensus_bases_ratio: f64,
    /// Minimum fraction of a realigned read's bases that must be aligned without mutation for it to be rescued
    pub min_matched_bases_in_realigned_read_ratio: f64,
    /// P-value threshold for the PCR minor test performed by the minor caller
    pub pcr_minor_test_p_value: f64,
    /// Phred value of the background error rate used to set the minor detection floor
    pub minor_quality_threshold: u8,
    /// Reads at or below this length are never anchored
    pub min_read_size: usize,
    /// Enables realignment-based rescue of dropped reads
    pub cqs_rescue: bool,
    /// Enables trimming of low quality consensus ends
    pub quality_trimming: bool,
    /// If true the PWM spans the largest read extents, otherwise the average extents
    pub greedy_extend: bool
}

impl Default for AssemblerParameters {
    fn default() -> Self {
        Self {
            offset_range: 4,
            anchor_region: 8,
            max_mms: 4,
            max_consequent_mms: 2,
            max_dropped_reads_ratio: 0.3,
            max_dropped_reads_ratio_after_rescue: 0.3,
            max_trimmed_consensus_bases_ratio: 0.3,
            min_matched_bases_in_realigned_read_ratio: 0.0,
            pcr_minor_test_p_value: 1e-3,
            minor_quality_threshold: stats_util::DEFAULT_GOOD_QUAL,
            min_read_size: 0,
            cqs_rescue: false,
            quality_trimming: true,
            greedy_extend: true
        }
    }
}

impl AssemblerParameters {
    /// Checks every ratio and threshold, returning the first problem found.
    /// # Examples
    /// ```rust
    /// use migcall::assembler::AssemblerParameters;
    /// let mut params: AssemblerParameters = Default::default();
    /// assert!(params.validate().is_ok());
    /// params.max_dropped_reads_ratio = 1.5;
    /// assert!(params.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        errors::check_range("max_dropped_reads_ratio", self.max_dropped_reads_ratio, 0.0, 1.0)?;
        errors::check_range("max_dropped_reads_ratio_after_rescue", self.max_dropped_reads_ratio_after_rescue, 0.0, 1.0)?;
        errors::check_range("max_trimmed_consensus_bases_ratio", self.max_trimmed_consensus_bases_ratio, 0.0, 1.0)?;
        errors::check_range("min_matched_bases_in_realigned_read_ratio", self.min_matched_bases_in_realigned_read_ratio, 0.0, 1.0)?;
        errors::check_range("pcr_minor_test_p_value", self.pcr_minor_test_p_value, 0.0, 1.0)?;
        if self.anchor_region == 0 {
            return Err(ConfigError::Invalid("anchor_region must be at least 1".to_string()));
        }
        if self.max_mms > 2 * self.anchor_region + 1 {
            return Err(ConfigError::Invalid(format!(
                "max_mms ({}) cannot exceed the anchor window size ({})", self.max_mms, 2 * self.anchor_region + 1
            )));
        }
        Ok(())
    }

    /// The length of the anchor window.
    #[inline]
    pub fn core_len(&self) -> usize {
        2 * self.anchor_region + 1
    }
}

/// The product of a successful assembly
#[derive(Clone, Debug, PartialEq)]
pub struct Consensus {
    /// The submission index of the source MIG
    pub mig_index: u64,
    /// The UMI of the source MIG
    pub umi: String,
    /// The trimmed consensus sequence in integer format
    pub seq: Vec<u8>,
    /// The consensus quality score per base
    pub qual: Vec<u8>,
    /// Minor mutations in trimmed-consensus coordinates, mapped to their quality-filtered read count
    pub minors: BTreeMap<MutationCode, u32>,
    /// The number of reads that contributed to the PWM
    pub assembled_size: usize,
    /// The number of reads in the source MIG
    pub mig_size: usize
}

impl Consensus {
    #[inline]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Iterates over the minor mutation codes.
    pub fn minor_codes(&self) -> impl Iterator<Item = &MutationCode> {
        self.minors.keys()
    }

    /// The FASTQ record description for this consensus, the record id is always `MIG`.
    pub fn fastq_description(&self) -> String {
        format!("UMI:{}:{}", self.umi, self.mig_size)
    }

    /// The consensus sequence as an ASCII string.
    pub fn seq_string(&self) -> String {
        string_util::convert_itos(&self.seq)
    }

    /// Returns the consensus of the opposite strand, minors included.
    /// # Examples
    /// ```rust
    /// use std::collections::BTreeMap;
    /// use migcall::assembler::Consensus;
    /// use migcall::mutation::MutationCode;
    /// let mut minors = BTreeMap::new();
    /// minors.insert(MutationCode::substitution(0, 0, 2), 3);
    /// let c = Consensus {
    ///     mig_index: 0,
    ///     umi: "ACGT".to_string(),
    ///     seq: vec![0, 0, 1],
    ///     qual: vec![40, 35, 30],
    ///     minors,
    ///     assembled_size: 5,
    ///     mig_size: 5
    /// };
    /// let rc = c.reverse_complement();
    /// assert_eq!(rc.seq, vec![2, 3, 3]);
    /// assert_eq!(rc.qual, vec![30, 35, 40]);
    /// assert_eq!(rc.minors[&MutationCode::substitution(2, 3, 1)], 3);
    /// ```
    pub fn reverse_complement(&self) -> Consensus {
        let len: usize = self.seq.len();
        let minors: BTreeMap<MutationCode, u32> = self.minors.iter()
            .map(|(code, &count)| {
                let from: u8 = string_util::COMPLEMENT_INT[code.from() as usize];
                let to: u8 = string_util::COMPLEMENT_INT[code.to() as usize];
                (MutationCode::substitution(len - 1 - code.position(), from, to), count)
            })
            .collect();
        Consensus {
            mig_index: self.mig_index,
            umi: self.umi.clone(),
            seq: string_util::reverse_complement_i(&self.seq),
            qual: self.qual.iter().rev().cloned().collect(),
            minors,
            assembled_size: self.assembled_size,
            mig_size: self.mig_size
        }
    }

    /// The consensus qualities in phred+33 ASCII.
    pub fn qual_ascii(&self) -> Vec<u8> {
        self.qual.iter().map(|&q| q + PHRED_OFFSET).collect()
    }
}

/// Running totals over every MIG submitted to an `Assembler`, safe to update from any worker
#[derive(Debug, Default)]
pub struct AssemblerStats {
    migs_total: AtomicU64,
    migs_assembled: AtomicU64,
    reads_total: AtomicU64,
    reads_assembled: AtomicU64,
    reads_dropped_short: AtomicU64,
    reads_dropped_error: AtomicU64,
    reads_rescued: AtomicU64,
    reads_removed: AtomicU64
}

impl AssemblerStats {
    pub fn migs_total(&self) -> u64 {
        self.migs_total.load(Ordering::Relaxed)
    }

    pub fn migs_assembled(&self) -> u64 {
        self.migs_assembled.load(Ordering::Relaxed)
    }

    pub fn reads_total(&self) -> u64 {
        self.reads_total.load(Ordering::Relaxed)
    }

    pub fn reads_assembled(&self) -> u64 {
        self.reads_assembled.load(Ordering::Relaxed)
    }

    pub fn reads_dropped_short(&self) -> u64 {
        self.reads_dropped_short.load(Ordering::Relaxed)
    }

    pub fn reads_dropped_error(&self) -> u64 {
        self.reads_dropped_error.load(Ordering::Relaxed)
    }

    pub fn reads_rescued(&self) -> u64 {
        self.reads_rescued.load(Ordering::Relaxed)
    }

    pub fn reads_removed(&self) -> u64 {
        self.reads_removed.load(Ordering::Relaxed)
    }

    /// Tab-separated header matching `body()`.
    pub fn header() -> &'static str {
        "migs_total\tmigs_assembled\treads_total\treads_assembled\treads_dropped_short\treads_dropped_error\treads_rescued\treads_removed"
    }

    pub fn body(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.migs_total(), self.migs_assembled(), self.reads_total(), self.reads_assembled(),
            self.reads_dropped_short(), self.reads_dropped_error(), self.reads_rescued(), self.reads_removed()
        )
    }
}

/// what happened to each read of the MIG
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReadStatus {
    Accepted,
    DroppedShort,
    DroppedError,
    Removed,
    Rescued
}

/// per-MIG working state; never shared between threads
#[derive(Clone, Debug)]
pub(crate) struct AssemblyState<'a> {
    reads: &'a [Read],
    statuses: Vec<ReadStatus>,
    /// where the anchor window starts in each accepted read
    anchor_starts: Vec<usize>,
    /// the PWM column of the anchor window start
    left: usize,
    pwm: PositionWeightMatrix,
    rescue_done: bool,
    rescued: usize,
    removed: usize
}

impl<'a> AssemblyState<'a> {
    /// The number of reads currently contributing to the PWM.
    fn contributing(&self) -> usize {
        self.statuses.iter()
            .filter(|&&s| s == ReadStatus::Accepted || s == ReadStatus::Rescued)
            .count()
    }

    fn count_status(&self, status: ReadStatus) -> usize {
        self.statuses.iter().filter(|&&s| s == status).count()
    }

    /// Returns the range of read positions that land inside the PWM and the shift from read to PWM coordinates.
    fn read_span(&self, read_index: usize) -> (usize, usize, isize) {
        let shift: isize = self.left as isize - self.anchor_starts[read_index] as isize;
        let read_len: isize = self.reads[read_index].len() as isize;
        let p_from: isize = std::cmp::max(0, -shift);
        let p_to: isize = std::cmp::min(read_len, self.pwm.len() as isize - shift);
        (p_from as usize, std::cmp::max(p_from, p_to) as usize, shift)
    }

    /// Adds or removes every base an anchored read contributes.
    fn apply_read(&mut self, read_index: usize, add: bool) {
        let (p_from, p_to, shift) = self.read_span(read_index);
        let read: &Read = &self.reads[read_index];
        for p in p_from..p_to {
            let col: usize = (p as isize + shift) as usize;
            if add {
                self.pwm.add(col, read.seq()[p], read.good_quality(p));
            } else {
                self.pwm.remove(col, read.seq()[p], read.good_quality(p));
            }
        }
    }
}

/// Assembles MIGs into consensus sequences. The assembler is immutable apart from its atomic statistics, so a
/// single instance can be shared by every worker.
pub struct Assembler {
    params: AssemblerParameters,
    aligner: LocalAligner,
    offsets: Vec<isize>,
    stats: AssemblerStats
}

impl Assembler {
    /// Creates an assembler after validating the parameters.
    pub fn new(params: AssemblerParameters) -> Result<Assembler, ConfigError> {
        params.validate()?;

        //unshifted first so that exact matches prefer the smallest offset
        let mut offsets: Vec<isize> = vec![0];
        for o in 1..=params.offset_range as isize {
            offsets.push(-o);
            offsets.push(o);
        }

        Ok(Assembler {
            params,
            aligner: Default::default(),
            offsets,
            stats: Default::default()
        })
    }

    #[inline]
    pub fn params(&self) -> &AssemblerParameters {
        &self.params
    }

    #[inline]
    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// Assembles one MIG; returns `None` when any quality gate rejects it.
    /// # Arguments
    /// * `mig` - the group of reads sharing a UMI
    /// # Examples
    /// ```rust
    /// use migcall::assembler::Assembler;
    /// use migcall::read::{Mig, Read};
    /// use migcall::string_util::convert_stoi;
    /// let seq = convert_stoi("ACGTTGCAAGGCTTACGATCGATCGGATCCATGCATGCATTTACAGGACT");
    /// let reads: Vec<Read> = (0..5).map(|_| Read::with_uniform_quality(seq.clone(), 40)).collect();
    /// let mig = Mig::new(0, "AACCGGTT".to_string(), reads);
    /// let assembler = Assembler::new(Default::default()).unwrap();
    /// let consensus = assembler.assemble(&mig).unwrap();
    /// assert_eq!(consensus.seq, seq);
    /// assert_eq!(consensus.assembled_size, 5);
    /// ```
    pub fn assemble(&self, mig: &Mig) -> Option<Consensus> {
        self.stats.migs_total.fetch_add(1, Ordering::Relaxed);
        self.stats.reads_total.fetch_add(mig.size() as u64, Ordering::Relaxed);

        let mut state: AssemblyState = match self.anchor_reads(&mig.reads) {
            Some(state) => state,
            None => {
                debug!("MIG {}: no anchor could be established", mig.umi);
                self.stats.reads_dropped_short.fetch_add(mig.size() as u64, Ordering::Relaxed);
                return None;
            }
        };

        self.stats.reads_dropped_short.fetch_add(state.count_status(ReadStatus::DroppedShort) as u64, Ordering::Relaxed);
        self.stats.reads_dropped_error.fetch_add(state.count_status(ReadStatus::DroppedError) as u64, Ordering::Relaxed);

        let accepted: usize = state.count_status(ReadStatus::Accepted);
        if (accepted as f64) < (1.0 - self.params.max_dropped_reads_ratio) * mig.size() as f64 {
            debug!("MIG {}: too many reads dropped ({} of {} accepted)", mig.umi, accepted, mig.size());
            return None;
        }

        if self.params.cqs_rescue {
            self.rescue(&mut state);
            self.stats.reads_rescued.fetch_add(state.rescued as u64, Ordering::Relaxed);
            self.stats.reads_removed.fetch_add(state.removed as u64, Ordering::Relaxed);

            let retained: usize = state.contributing();
            if (retained as f64) < (1.0 - self.params.max_dropped_reads_ratio_after_rescue) * mig.size() as f64 {
                debug!("MIG {}: too many reads lost after rescue ({} of {} retained)", mig.umi, retained, mig.size());
                return None;
            }
        }

        let assembled_size: usize = state.contributing();
        let raw: RawConsensus = state.pwm.consensus(assembled_size);
        let max_read_len: usize = state.statuses.iter()
            .zip(state.reads.iter())
            .filter(|&(&s, _)| s == ReadStatus::Accepted || s == ReadStatus::Rescued)
            .map(|(_, r)| r.len())
            .max()
            .unwrap_or(0);
        let (trim_from, trim_to) = match self.trim_bounds(&raw, max_read_len) {
            Some(bounds) => bounds,
            None => {
                debug!("MIG {}: too many consensus bases trimmed", mig.umi);
                return None;
            }
        };

        let minors: BTreeMap<MutationCode, u32> = self.detect_minors(&state.pwm, trim_from, trim_to, assembled_size);

        self.stats.migs_assembled.fetch_add(1, Ordering::Relaxed);
        self.stats.reads_assembled.fetch_add(assembled_size as u64, Ordering::Relaxed);

        Some(Consensus {
            mig_index: mig.index,
            umi: mig.umi.clone(),
            seq: raw.seq[trim_from..trim_to].to_vec(),
            qual: raw.qual[trim_from..trim_to].to_vec(),
            minors,
            assembled_size,
            mig_size: mig.size()
        })
    }

    /// Returns true if the read is long enough for every candidate anchor window to fit.
    #[inline]
    fn is_long_enough(&self, read_len: usize) -> bool {
        read_len > self.params.min_read_size &&
            read_len >= 2 * (self.params.anchor_region + self.params.offset_range) + 2
    }

    /// Returns the start of the anchor window for a given offset from the read midpoint.
    #[inline]
    fn window_start(&self, read_len: usize, offset: isize) -> usize {
        ((read_len / 2) as isize + offset - self.params.anchor_region as isize) as usize
    }

    /// Finds the most frequent core window across all offsets of all reads.
    /// Ties go to the window with the smallest cumulative offset, then to the lexicographically smallest window.
    pub(crate) fn find_core<'r>(&self, reads: &'r [Read]) -> Option<&'r [u8]> {
        let core_len: usize = self.params.core_len();
        let mut core_counts: HashMap<&[u8], (usize, usize)> = HashMap::new();
        for read in reads.iter() {
            if !self.is_long_enough(read.len()) {
                continue;
            }
            for &offset in self.offsets.iter() {
                let start: usize = self.window_start(read.len(), offset);
                let entry = core_counts.entry(&read.seq()[start..start + core_len]).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += offset.unsigned_abs();
            }
        }

        let mut best: Option<(&[u8], usize, usize)> = None;
        for (&window, &(count, weight)) in core_counts.iter() {
            let better: bool = match best {
                None => true,
                Some((b_window, b_count, b_weight)) => {
                    count > b_count ||
                        (count == b_count && weight < b_weight) ||
                        (count == b_count && weight == b_weight && window < b_window)
                }
            };
            if better {
                best = Some((window, count, weight));
            }
        }
        best.map(|(window, _, _)| window)
    }

    /// Anchors every read against the core window and builds the initial PWM from the accepted ones.
    /// Returns `None` if no core could be found or no read was accepted.
    pub(crate) fn anchor_reads<'a>(&self, reads: &'a [Read]) -> Option<AssemblyState<'a>> {
        let core: &[u8] = self.find_core(reads)?;
        let core_len: usize = self.params.core_len();

        let mut statuses: Vec<ReadStatus> = vec![ReadStatus::DroppedShort; reads.len()];
        let mut anchor_starts: Vec<usize> = vec![0; reads.len()];
        for (i, read) in reads.iter().enumerate() {
            if !self.is_long_enough(read.len()) {
                continue;
            }

            let mut best: Option<(usize, usize)> = None;
            for &offset in self.offsets.iter() {
                let start: usize = self.window_start(read.len(), offset);
                let window: &[u8] = &read.seq()[start..start + core_len];
                if window == core {
                    best = Some((0, start));
                    break;
                }
                let mms: usize = align::hamming_distance(window, core);
                if best.map_or(true, |(b_mms, _)| mms < b_mms) {
                    best = Some((mms, start));
                }
            }

            match best {
                Some((mms, start)) if mms <= self.params.max_mms => {
                    statuses[i] = ReadStatus::Accepted;
                    anchor_starts[i] = start;
                },
                _ => {
                    statuses[i] = ReadStatus::DroppedError;
                }
            };
        }

        //figure out the PWM bounds relative to the anchor start
        let mut max_left: usize = 0;
        let mut max_right: usize = 0;
        let mut sum_left: usize = 0;
        let mut sum_right: usize = 0;
        let mut accepted: usize = 0;
        for (i, read) in reads.iter().enumerate() {
            if statuses[i] == ReadStatus::Accepted {
                let x: usize = anchor_starts[i];
                let y: usize = read.len() - anchor_starts[i];
                max_left = std::cmp::max(max_left, x);
                max_right = std::cmp::max(max_right, y);
                sum_left += x;
                sum_right += y;
                accepted += 1;
            }
        }
        if accepted == 0 {
            return None;
        }

        let (left, right) = if self.params.greedy_extend {
            (max_left, max_right)
        } else {
            (sum_left / accepted, sum_right / accepted)
        };

        let mut state = AssemblyState {
            reads,
            statuses,
            anchor_starts,
            left,
            pwm: PositionWeightMatrix::new(left + right),
            rescue_done: false,
            rescued: 0,
            removed: 0
        };
        for i in 0..reads.len() {
            if state.statuses[i] == ReadStatus::Accepted {
                state.apply_read(i, true);
            }
        }
        Some(state)
    }

    /// Re-examines reads against the raw consensus: removes accepted reads that disagree with it and
    /// realigns reads dropped while anchoring. Only runs once per state.
    pub(crate) fn rescue(&self, state: &mut AssemblyState) {
        if state.rescue_done {
            return;
        }
        state.rescue_done = true;

        let raw: RawConsensus = state.pwm.consensus(state.contributing());

        //first pass: take out accepted reads that do not agree with the consensus
        for i in 0..state.reads.len() {
            if state.statuses[i] != ReadStatus::Accepted {
                continue;
            }
            let (p_from, p_to, shift) = state.read_span(i);
            if p_to == p_from {
                continue;
            }
            let c_from: usize = (p_from as isize + shift) as usize;
            let c_to: usize = (p_to as isize + shift) as usize;
            let profile = align::mismatch_profile(&state.reads[i].seq()[p_from..p_to], &raw.seq[c_from..c_to]);
            if profile.max_consecutive > self.params.max_consequent_mms || profile.total as f64 > 0.5 * (p_to - p_from) as f64 {
                state.apply_read(i, false);
                state.statuses[i] = ReadStatus::Removed;
                state.removed += 1;
            }
        }

        //second pass: local realignment of previously dropped reads
        for i in 0..state.reads.len() {
            if state.statuses[i] != ReadStatus::DroppedShort && state.statuses[i] != ReadStatus::DroppedError {
                continue;
            }
            let read: &Read = &state.reads[i];
            let alignment = match self.aligner.align(&raw.seq, read.seq()) {
                Some(aln) => aln,
                None => continue
            };
            let matched_ratio: f64 = alignment.matched_bases() as f64 / read.len() as f64;
            if matched_ratio < self.params.min_matched_bases_in_realigned_read_ratio {
                continue;
            }

            let substitutions: HashMap<usize, u8> = alignment.mutations.iter()
                .filter(|m| m.is_substitution())
                .map(|m| (m.position(), m.to()))
                .collect();
            for &(x, y) in alignment.aligned_pairs.iter() {
                //matches support the consensus base, substitutions the alternate one
                let base: u8 = match substitutions.get(&x) {
                    Some(&alt) => alt,
                    None => raw.seq[x]
                };
                state.pwm.add(x, base, read.good_quality(y));
            }
            state.statuses[i] = ReadStatus::Rescued;
            state.rescued += 1;
        }
    }

    /// Determines the retained `[from, to)` consensus range, or `None` if too much would be trimmed.
    /// The range is also narrowed until it is no longer than the longest assembled read.
    fn trim_bounds(&self, raw: &RawConsensus, max_read_len: usize) -> Option<(usize, usize)> {
        let total_len: usize = raw.seq.len();
        if total_len == 0 {
            return None;
        }

        let (mut from, mut to) = if self.params.quality_trimming {
            let first_good = raw.qual.iter().position(|&q| q > BAD_QUAL)?;
            let last_good = raw.qual.iter().rposition(|&q| q > BAD_QUAL)?;
            (first_good, last_good + 1)
        } else {
            (0, total_len)
        };

        //shrink from the weaker end
        while to - from > max_read_len {
            if raw.qual[from] <= raw.qual[to - 1] {
                from += 1;
            } else {
                to -= 1;
            }
        }

        let trimmed: usize = total_len - (to - from);
        if trimmed as f64 > self.params.max_trimmed_consensus_bases_ratio * total_len as f64 || to == from {
            None
        } else {
            Some((from, to))
        }
    }

    /// Flags every non-majority base whose quality-filtered count exceeds the background error expectation.
    fn detect_minors(&self, pwm: &PositionWeightMatrix, from: usize, to: usize, assembled_size: usize) -> BTreeMap<MutationCode, u32> {
        let threshold: f64 = stats_util::phred_to_error(self.params.minor_quality_threshold as f64) * assembled_size as f64;
        let mut minors: BTreeMap<MutationCode, u32> = BTreeMap::new();
        for col in from..to {
            let (major, _) = pwm.majority(col);
            for base in 0..NT_COUNT as u8 {
                if base == major {
                    continue;
                }
                let count: u32 = pwm.good_count(col, base);
                if count > 0 && count as f64 > threshold {
                    minors.insert(MutationCode::substitution(col - from, major, base), count);
                }
            }
        }
        minors
    }
}

/// The result of one assembly job, a missing consensus means the MIG was rejected
#[derive(Clone, Debug)]
pub struct AssemblyResult {
    pub mig_index: u64,
    pub consensus: Option<Consensus>
}

/// This will run an assembly "job" on a single MIG using shared resources, reporting any minors to the caller.
/// Minors rejected by the caller are removed from the returned consensus.
/// # Arguments
/// * `arc_assembler` - the shared assembler
/// * `mig` - the MIG to assemble
/// * `arc_minor_caller` - the shared minor caller for this sample
pub fn assembly_job(arc_assembler: Arc<Assembler>, mig: Mig, arc_minor_caller: Arc<MinorCaller>) -> AssemblyResult {
    let assembler: &Assembler = &*arc_assembler;
    let minor_caller: &MinorCaller = &*arc_minor_caller;

    let mut consensus: Option<Consensus> = assembler.assemble(&mig);
    if let Some(c) = consensus.as_mut() {
        minor_caller.update_from_consensus(c);
    }
    AssemblyResult {
        mig_index: mig.index,
        consensus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations_table::{MutationsTable, Reference};
    use crate::string_util::convert_stoi;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const BASE_SEQ: &str = "ACGTTGCAAGGCTTACGATCGATCGGATCCATGCATGCATTTACAGGACT";

    fn random_seq(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen_range(0..4) as u8).collect()
    }

    fn uniform_mig(seqs: Vec<Vec<u8>>, q: u8) -> Mig {
        let reads: Vec<Read> = seqs.into_iter().map(|s| Read::with_uniform_quality(s, q)).collect();
        Mig::new(0, "ACGTACGT".to_string(), reads)
    }

    /// 20 reads of length 50 where two carry a substitution at position 25
    fn substitution_mig(q: u8) -> (Mig, Vec<u8>) {
        let seq = convert_stoi(BASE_SEQ);
        let mut mutant = seq.clone();
        mutant[25] = (seq[25] + 1) % 4;
        let mut seqs: Vec<Vec<u8>> = vec![seq.clone(); 18];
        seqs.push(mutant.clone());
        seqs.push(mutant);
        (uniform_mig(seqs, q), seq)
    }

    #[test]
    fn test_identical_reads() {
        let seq = convert_stoi(BASE_SEQ);
        let mig = uniform_mig(vec![seq.clone(); 10], 40);
        let assembler = Assembler::new(Default::default()).unwrap();
        let consensus = assembler.assemble(&mig).unwrap();
        assert_eq!(consensus.seq, seq);
        assert!(consensus.qual.iter().all(|&q| q == 40));
        assert!(consensus.minors.is_empty());
        assert_eq!(assembler.stats().migs_assembled(), 1);
        assert_eq!(assembler.stats().reads_assembled(), 10);
    }

    #[test]
    fn test_substitution_scenario() {
        for &q in [40u8, 20].iter() {
            let (mig, seq) = substitution_mig(q);
            let assembler = Assembler::new(Default::default()).unwrap();
            let consensus = assembler.assemble(&mig).unwrap();
            assert_eq!(consensus.len(), 50);
            assert_eq!(consensus.seq, seq);
            assert_eq!(consensus.assembled_size, 20);
            assert_eq!(consensus.mig_size, 20);

            //the detection floor depends on the configured background quality
            let threshold = stats_util::phred_to_error(assembler.params().minor_quality_threshold as f64) * 20.0;
            //bases only count towards minors if they pass the read quality mask
            let good_count: u32 = if q >= stats_util::DEFAULT_GOOD_QUAL { 2 } else { 0 };
            let expected_flag = good_count > 0 && good_count as f64 > threshold;
            let code = MutationCode::substitution(25, seq[25], (seq[25] + 1) % 4);
            assert_eq!(consensus.minors.contains_key(&code), expected_flag);
            if expected_flag {
                assert_eq!(consensus.minors[&code], 2);
                assert_eq!(consensus.minors.len(), 1);
            }
        }
    }

    #[test]
    fn test_majority_correctness() {
        let mut rng = StdRng::seed_from_u64(0);
        let known = random_seq(&mut rng, 60);
        let mut seqs: Vec<Vec<u8>> = vec![known.clone(); 12];
        for _ in 0..8 {
            seqs.push(random_seq(&mut rng, 60));
        }
        let mig = uniform_mig(seqs, 35);
        let params = AssemblerParameters {
            max_dropped_reads_ratio: 0.5,
            ..Default::default()
        };
        let assembler = Assembler::new(params).unwrap();
        let consensus = assembler.assemble(&mig).unwrap();
        assert_eq!(consensus.seq, known);
    }

    #[test]
    fn test_length_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = random_seq(&mut rng, 80);
        for trial in 0..20 {
            //staggered reads of varying length cut out of the same molecule
            let mut seqs: Vec<Vec<u8>> = vec![];
            for _ in 0..10 {
                let start: usize = rng.gen_range(0..6);
                let len: usize = rng.gen_range(40..(80 - start));
                seqs.push(base[start..start + len].to_vec());
            }
            let max_len = seqs.iter().map(|s| s.len()).max().unwrap();
            let mig = uniform_mig(seqs, 30);
            let params = AssemblerParameters {
                greedy_extend: trial % 2 == 0,
                max_trimmed_consensus_bases_ratio: 1.0,
                max_dropped_reads_ratio: 1.0,
                ..Default::default()
            };
            let assembler = Assembler::new(params).unwrap();
            if let Some(consensus) = assembler.assemble(&mig) {
                assert!(consensus.len() <= max_len);
                assert_eq!(consensus.qual.len(), consensus.len());
            }
        }
    }

    #[test]
    fn test_monotone_rejection() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut migs: Vec<Mig> = vec![];
        for _ in 0..30 {
            let known = random_seq(&mut rng, 50);
            let good: usize = rng.gen_range(1..10);
            let mut seqs: Vec<Vec<u8>> = vec![known; good];
            for _ in good..10 {
                seqs.push(random_seq(&mut rng, 50));
            }
            migs.push(uniform_mig(seqs, 35));
        }

        let mut previous: usize = 0;
        for step in 0..=10 {
            let params = AssemblerParameters {
                max_dropped_reads_ratio: step as f64 / 10.0,
                ..Default::default()
            };
            let assembler = Assembler::new(params).unwrap();
            let assembled = migs.iter().filter(|m| assembler.assemble(m).is_some()).count();
            assert!(assembled >= previous);
            previous = assembled;
        }
    }

    #[test]
    fn test_short_reads_dropped() {
        let seq = convert_stoi(BASE_SEQ);
        let mut seqs: Vec<Vec<u8>> = vec![seq.clone(); 4];
        seqs.push(seq[0..20].to_vec());
        let mig = uniform_mig(seqs, 40);

        //1 of 5 dropped is within the default 30%
        let assembler = Assembler::new(Default::default()).unwrap();
        assert!(assembler.assemble(&mig).is_some());
        assert_eq!(assembler.stats().reads_dropped_short(), 1);

        let strict = Assembler::new(AssemblerParameters {
            max_dropped_reads_ratio: 0.1,
            ..Default::default()
        }).unwrap();
        assert!(strict.assemble(&mig).is_none());
        assert_eq!(strict.stats().migs_total(), 1);
        assert_eq!(strict.stats().migs_assembled(), 0);
    }

    #[test]
    fn test_offset_correction() {
        let long = convert_stoi(BASE_SEQ);
        //same molecule, reads start one and two bases later
        let mut seqs: Vec<Vec<u8>> = vec![];
        for shift in [0usize, 0, 0, 1, 2].iter() {
            seqs.push(long[*shift..*shift + 46].to_vec());
        }
        let mig = uniform_mig(seqs, 40);
        let assembler = Assembler::new(Default::default()).unwrap();
        let state = assembler.anchor_reads(&mig.reads).unwrap();
        assert_eq!(state.count_status(ReadStatus::Accepted), 5);
        //the anchor start moves left as reads start later
        assert_eq!(state.anchor_starts[3] + 1, state.anchor_starts[0]);
        assert_eq!(state.anchor_starts[4] + 2, state.anchor_starts[0]);
        //greedy extension covers every read
        assert_eq!(state.pwm.len(), 48);
        for col in 0..state.pwm.len() {
            assert!(state.pwm.column_sum(col) as usize <= state.contributing());
        }
    }

    #[test]
    fn test_average_extend() {
        let long = convert_stoi(BASE_SEQ);
        let mut seqs: Vec<Vec<u8>> = vec![];
        for shift in [0usize, 0, 0, 1, 2].iter() {
            seqs.push(long[*shift..*shift + 46].to_vec());
        }
        let mig = uniform_mig(seqs, 40);
        let assembler = Assembler::new(AssemblerParameters {
            greedy_extend: false,
            ..Default::default()
        }).unwrap();
        let state = assembler.anchor_reads(&mig.reads).unwrap();
        assert!(state.pwm.len() <= 46);
        let consensus = assembler.assemble(&mig).unwrap();
        assert!(consensus.len() <= 46);
    }

    #[test]
    fn test_quality_trimming_rejects() {
        let seq = convert_stoi(BASE_SEQ);
        //reads agree from base 20 on, the prefix cycles so no column has a clear majority
        let mut seqs: Vec<Vec<u8>> = vec![];
        for i in 0..10 {
            let mut s = seq.clone();
            for (p, b) in s.iter_mut().enumerate().take(20) {
                *b = ((p + i) % 4) as u8;
            }
            seqs.push(s);
        }
        let mig = uniform_mig(seqs, 40);
        let assembler = Assembler::new(Default::default()).unwrap();
        assert!(assembler.assemble(&mig).is_none());

        let lenient = Assembler::new(AssemblerParameters {
            quality_trimming: false,
            ..Default::default()
        }).unwrap();
        let consensus = lenient.assemble(&mig).unwrap();
        assert_eq!(consensus.len(), 50);
        assert_eq!(&consensus.seq[20..], &seq[20..]);
    }

    #[test]
    fn test_rescue() {
        let seq = convert_stoi(BASE_SEQ);
        let mut seqs: Vec<Vec<u8>> = vec![seq.clone(); 8];
        //too short to be anchored, but it matches the consensus
        seqs.push(seq[5..25].to_vec());
        //anchor window destroyed, but the rest of the read is fine
        let mut broken = seq.clone();
        for p in 17..33 {
            broken[p] = (broken[p] + 2) % 4;
        }
        seqs.push(broken);
        let mig = uniform_mig(seqs, 40);

        let params = AssemblerParameters {
            cqs_rescue: true,
            ..Default::default()
        };
        let assembler = Assembler::new(params).unwrap();
        let mut state = assembler.anchor_reads(&mig.reads).unwrap();
        assert_eq!(state.count_status(ReadStatus::Accepted), 8);

        assembler.rescue(&mut state);
        assert_eq!(state.statuses[8], ReadStatus::Rescued);
        assert_eq!(state.contributing(), 8 + state.count_status(ReadStatus::Rescued));
        //rescued short read adds coverage at its columns
        assert!(state.pwm.column_sum(10) >= 9);
        assert!(state.pwm.count(20, seq[20]) >= 9);

        //running it again changes nothing
        let snapshot = state.pwm.clone();
        let statuses = state.statuses.clone();
        assembler.rescue(&mut state);
        assert_eq!(state.pwm, snapshot);
        assert_eq!(state.statuses, statuses);

        let consensus = assembler.assemble(&mig).unwrap();
        assert_eq!(consensus.seq, seq);
        assert!(consensus.assembled_size >= 9);
    }

    #[test]
    fn test_rescue_substitution() {
        let seq = convert_stoi(BASE_SEQ);
        let alt: u8 = (seq[15] + 1) % 4;
        for &q in [40u8, 10].iter() {
            let mut reads: Vec<Read> = (0..8).map(|_| Read::with_uniform_quality(seq.clone(), 40)).collect();
            //short read covering columns 5..25 with a substitution at column 15
            let mut short = seq[5..25].to_vec();
            short[10] = alt;
            reads.push(Read::with_uniform_quality(short, q));
            let mig = Mig::new(0, "ACGTACGT".to_string(), reads);

            let assembler = Assembler::new(AssemblerParameters {
                cqs_rescue: true,
                ..Default::default()
            }).unwrap();
            let mut state = assembler.anchor_reads(&mig.reads).unwrap();
            assert_eq!(state.count_status(ReadStatus::DroppedShort), 1);
            assert_eq!(state.pwm.count(15, alt), 0);
            let good_before = state.pwm.good_count(15, alt);

            assembler.rescue(&mut state);
            assert_eq!(state.statuses[8], ReadStatus::Rescued);
            //the alternate base gets the read, the consensus base does not
            assert_eq!(state.pwm.count(15, alt), 1);
            assert_eq!(state.pwm.count(15, seq[15]), 8);
            assert_eq!(state.pwm.column_sum(15), 9);
            //neighbouring matches support the consensus
            assert_eq!(state.pwm.count(14, seq[14]), 9);

            //only good quality bases reach the filtered table
            let expected_good = if q >= stats_util::DEFAULT_GOOD_QUAL { good_before + 1 } else { good_before };
            assert_eq!(state.pwm.good_count(15, alt), expected_good);
        }
    }

    #[test]
    fn test_assembly_job_drops_rejected_minors() {
        let (mig, seq) = substitution_mig(40);
        let alt: u8 = (seq[25] + 1) % 4;
        let code = MutationCode::substitution(25, seq[25], alt);
        let assembler = Arc::new(Assembler::new(Default::default()).unwrap());
        let seq_error_rate = stats_util::phred_to_error(assembler.params().minor_quality_threshold as f64);

        //2 of 20 reads is not enough evidence for the Poisson test
        let poisson = Arc::new(MinorCaller::poisson(1e-3, seq_error_rate));
        let result = assembly_job(assembler.clone(), mig.clone(), poisson.clone());
        let consensus = result.consensus.unwrap();
        assert_eq!(poisson.total_calls(seq[25], alt), 1);
        assert_eq!(poisson.passed_calls(seq[25], alt), 0);
        assert!(!consensus.minors.contains_key(&code));

        let mut table = MutationsTable::new(Reference::new("ref", BASE_SEQ.as_bytes()));
        table.append(0, &consensus);
        assert_eq!(table.coverage(25), 1);
        assert_eq!(table.minor_count(25, alt), 0);

        //the dummy caller keeps every observed minor
        let dummy = Arc::new(MinorCaller::Dummy);
        let consensus = assembly_job(assembler, mig, dummy).consensus.unwrap();
        assert_eq!(consensus.minors.get(&code), Some(&2));
        let mut table = MutationsTable::new(Reference::new("ref", BASE_SEQ.as_bytes()));
        table.append(0, &consensus);
        assert_eq!(table.minor_count(25, alt), 1);
    }

    #[test]
    fn test_rescue_removes_bad_reads() {
        let seq = convert_stoi(BASE_SEQ);
        let mut seqs: Vec<Vec<u8>> = vec![seq.clone(); 9];
        //anchor intact, but a run of mismatches near the end
        let mut bad = seq.clone();
        for p in 40..44 {
            bad[p] = (bad[p] + 1) % 4;
        }
        seqs.push(bad);
        let mig = uniform_mig(seqs, 40);
        let assembler = Assembler::new(AssemblerParameters {
            cqs_rescue: true,
            ..Default::default()
        }).unwrap();

        let mut state = assembler.anchor_reads(&mig.reads).unwrap();
        assert_eq!(state.count_status(ReadStatus::Accepted), 10);
        assembler.rescue(&mut state);
        assert_eq!(state.statuses[9], ReadStatus::Removed);
        assert_eq!(state.pwm.column_sum(41), 9);
        assert_eq!(state.pwm.good_count(41, seq[41]), 9);

        let consensus = assembler.assemble(&mig).unwrap();
        assert_eq!(consensus.assembled_size, 9);
        assert!(consensus.minors.is_empty());
        assert_eq!(assembler.stats().reads_removed(), 1);
    }

    #[test]
    fn test_fastq_fields() {
        let seq = convert_stoi(BASE_SEQ);
        let mig = Mig::new(3, "GATTACA".to_string(), vec![Read::with_uniform_quality(seq, 40); 3]);
        let assembler = Assembler::new(Default::default()).unwrap();
        let consensus = assembler.assemble(&mig).unwrap();
        assert_eq!(consensus.mig_index, 3);
        assert_eq!(consensus.fastq_description(), "UMI:GATTACA:3");
        assert_eq!(consensus.seq_string(), BASE_SEQ);
        assert!(consensus.qual_ascii().iter().all(|&q| q == b'I'));
    }

    #[test]
    fn test_bad_params() {
        let params = AssemblerParameters {
            anchor_region: 0,
            ..Default::default()
        };
        assert!(Assembler::new(params).is_err());
        let params = AssemblerParameters {
            max_trimmed_consensus_bases_ratio: -0.1,
            ..Default::default()
        };
        assert!(Assembler::new(params).is_err());
    }
}


extern crate log;

use log::warn;
use statrs::function::gamma::checked_gamma_lr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::assembler::Consensus;
use crate::stats_util;
use crate::string_util::{base_to_char, NT_COUNT};

/// A 64-bit float that can be accumulated from many threads, stored as raw bits in an `AtomicU64`
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64
}

impl AtomicF64 {
    pub fn new(value: f64) -> AtomicF64 {
        AtomicF64 {
            bits: AtomicU64::new(value.to_bits())
        }
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Adds `delta` with a compare-and-swap loop and returns the previous value.
    /// # Examples
    /// ```rust
    /// use migcall::minor_caller::AtomicF64;
    /// let x = AtomicF64::new(1.5);
    /// assert_eq!(x.fetch_add(2.0), 1.5);
    /// assert_eq!(x.load(), 3.5);
    /// ```
    pub fn fetch_add(&self, delta: f64) -> f64 {
        let mut current: u64 = self.bits.load(Ordering::Relaxed);
        loop {
            let new_value: f64 = f64::from_bits(current) + delta;
            match self.bits.compare_exchange_weak(current, new_value.to_bits(), Ordering::AcqRel, Ordering::Relaxed) {
                Ok(previous) => return f64::from_bits(previous),
                Err(actual) => current = actual
            }
        }
    }
}

type CountMatrix = [[AtomicU64; NT_COUNT]; NT_COUNT];
type SumMatrix = [[AtomicF64; NT_COUNT]; NT_COUNT];

/// Decides whether minors reported by the assembler are real PCR errors, using a one-sided Poisson test
/// against the sequencing error rate, and keeps the per-substitution statistics needed to estimate the FDR.
#[derive(Debug)]
pub struct PoissonTestMinorCaller {
    p_value_threshold: f64,
    seq_error_rate: f64,
    total_calls: CountMatrix,
    passed_calls: CountMatrix,
    p_value_sum: SumMatrix,
    log_coverage_sum: AtomicF64,
    coverage_count: AtomicU64
}

impl PoissonTestMinorCaller {
    /// Creates an empty caller.
    /// # Arguments
    /// * `p_value_threshold` - calls pass when the Poisson tail probability falls below this
    /// * `seq_error_rate` - the per-base sequencing error rate expected within a MIG
    pub fn new(p_value_threshold: f64, seq_error_rate: f64) -> PoissonTestMinorCaller {
        PoissonTestMinorCaller {
            p_value_threshold,
            seq_error_rate,
            total_calls: Default::default(),
            passed_calls: Default::default(),
            p_value_sum: Default::default(),
            log_coverage_sum: Default::default(),
            coverage_count: Default::default()
        }
    }

    fn call_and_update(&self, from: u8, to: u8, k: u32, n: usize) -> bool {
        let (f, t) = (from as usize, to as usize);
        let p: f64 = if k == 0 {
            1.0
        } else {
            match checked_gamma_lr(k as f64, n as f64 * self.seq_error_rate) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Poisson test failed for {}>{} with k={}, n={}: {}", base_to_char(from), base_to_char(to), k, n, e);
                    f64::NAN
                }
            }
        };

        //NaN never passes
        let passed: bool = p < self.p_value_threshold;
        self.total_calls[f][t].fetch_add(1, Ordering::Relaxed);
        if passed {
            self.passed_calls[f][t].fetch_add(1, Ordering::Relaxed);
        }
        if !p.is_nan() {
            self.p_value_sum[f][t].fetch_add(2.0 * p.min(1.0 - p));
        }
        if n > 0 {
            self.log_coverage_sum.fetch_add((n as f64).log10());
            self.coverage_count.fetch_add(1, Ordering::Relaxed);
        }
        passed
    }

    fn compute_fdr(&self, from: u8, to: u8) -> Option<f64> {
        let (f, t) = (from as usize, to as usize);
        let total: u64 = self.total_calls[f][t].load(Ordering::Relaxed);
        let passed: u64 = self.passed_calls[f][t].load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        if passed == 0 {
            return Some(f64::INFINITY);
        }
        let avg_p: f64 = self.p_value_sum[f][t].load() / total as f64;
        Some(self.p_value_threshold * (2.0 * avg_p).min(1.0) * total as f64 / passed as f64)
    }

    fn combine(&self, other: &PoissonTestMinorCaller) -> PoissonTestMinorCaller {
        let combined = PoissonTestMinorCaller::new(self.p_value_threshold, self.seq_error_rate);
        for f in 0..NT_COUNT {
            for t in 0..NT_COUNT {
                combined.total_calls[f][t].store(
                    self.total_calls[f][t].load(Ordering::Relaxed) + other.total_calls[f][t].load(Ordering::Relaxed),
                    Ordering::Relaxed
                );
                combined.passed_calls[f][t].store(
                    self.passed_calls[f][t].load(Ordering::Relaxed) + other.passed_calls[f][t].load(Ordering::Relaxed),
                    Ordering::Relaxed
                );
                combined.p_value_sum[f][t].fetch_add(self.p_value_sum[f][t].load() + other.p_value_sum[f][t].load());
            }
        }
        combined.log_coverage_sum.fetch_add(self.log_coverage_sum.load() + other.log_coverage_sum.load());
        combined.coverage_count.store(
            self.coverage_count.load(Ordering::Relaxed) + other.coverage_count.load(Ordering::Relaxed),
            Ordering::Relaxed
        );
        combined
    }
}

/// The minor caller used for a sample, either a pass-through or the Poisson test
#[derive(Debug)]
pub enum MinorCaller {
    /// Calls every observed minor and reports an FDR of 0
    Dummy,
    PoissonTest(PoissonTestMinorCaller)
}

impl MinorCaller {
    /// Creates a Poisson test caller.
    pub fn poisson(p_value_threshold: f64, seq_error_rate: f64) -> MinorCaller {
        MinorCaller::PoissonTest(PoissonTestMinorCaller::new(p_value_threshold, seq_error_rate))
    }

    /// Tests one minor and records the outcome.
    /// # Arguments
    /// * `from` - the consensus base
    /// * `to` - the minor base
    /// * `k` - the number of reads carrying the minor base
    /// * `n` - the number of reads in the MIG
    /// # Examples
    /// ```rust
    /// use migcall::minor_caller::MinorCaller;
    /// let caller = MinorCaller::poisson(1e-3, 1e-3);
    /// assert!(caller.call_and_update(0, 2, 5, 20));
    /// assert!(!caller.call_and_update(0, 2, 1, 20));
    /// assert_eq!(caller.total_calls(0, 2), 2);
    /// assert_eq!(caller.passed_calls(0, 2), 1);
    /// ```
    pub fn call_and_update(&self, from: u8, to: u8, k: u32, n: usize) -> bool {
        match self {
            MinorCaller::Dummy => k > 0,
            MinorCaller::PoissonTest(caller) => caller.call_and_update(from, to, k, n)
        }
    }

    /// Estimates the FDR among passed calls for one substitution.
    /// `None` when nothing was recorded for it, infinite when calls were recorded but none passed.
    pub fn compute_fdr(&self, from: u8, to: u8) -> Option<f64> {
        match self {
            MinorCaller::Dummy => Some(0.0),
            MinorCaller::PoissonTest(caller) => caller.compute_fdr(from, to)
        }
    }

    /// Merges two independently accumulated callers (e.g. the two mates of a sample) into a new one.
    /// Both must be the same variant with the same settings.
    pub fn combine(&self, other: &MinorCaller) -> MinorCaller {
        match (self, other) {
            (MinorCaller::Dummy, MinorCaller::Dummy) => MinorCaller::Dummy,
            (MinorCaller::PoissonTest(a), MinorCaller::PoissonTest(b)) => {
                assert!(
                    a.p_value_threshold == b.p_value_threshold && a.seq_error_rate == b.seq_error_rate,
                    "cannot combine minor callers with different settings"
                );
                MinorCaller::PoissonTest(a.combine(b))
            },
            _ => panic!("cannot combine a dummy minor caller with a Poisson test minor caller")
        }
    }

    /// Runs every minor of an assembled consensus through `call_and_update(...)` and drops the minors that fail.
    /// Returns the number of minors that passed.
    pub fn update_from_consensus(&self, consensus: &mut Consensus) -> usize {
        let assembled_size: usize = consensus.assembled_size;
        consensus.minors.retain(|code, count| self.call_and_update(code.from(), code.to(), *count, assembled_size));
        consensus.minors.len()
    }

    pub fn total_calls(&self, from: u8, to: u8) -> u64 {
        match self {
            MinorCaller::Dummy => 0,
            MinorCaller::PoissonTest(caller) => caller.total_calls[from as usize][to as usize].load(Ordering::Relaxed)
        }
    }

    pub fn passed_calls(&self, from: u8, to: u8) -> u64 {
        match self {
            MinorCaller::Dummy => 0,
            MinorCaller::PoissonTest(caller) => caller.passed_calls[from as usize][to as usize].load(Ordering::Relaxed)
        }
    }

    /// The accumulated `2*min(p, 1-p)` sum for one substitution.
    pub fn p_value_sum(&self, from: u8, to: u8) -> f64 {
        match self {
            MinorCaller::Dummy => 0.0,
            MinorCaller::PoissonTest(caller) => caller.p_value_sum[from as usize][to as usize].load()
        }
    }

    /// Geometric mean of the MIG sizes seen by `call_and_update(...)`, 0 if nothing was tested.
    pub fn geometric_mean_mig_size(&self) -> f64 {
        match self {
            MinorCaller::Dummy => 0.0,
            MinorCaller::PoissonTest(caller) => stats_util::geometric_mean_from_log10(
                caller.log_coverage_sum.load(),
                caller.coverage_count.load(Ordering::Relaxed)
            )
        }
    }

    pub fn header() -> &'static str {
        "from\tto\ttotal_calls\tpassed_calls\tfdr\tgeom_mean_mig_size"
    }

    /// One tab-separated line per substitution, FDR is `NA` when undefined.
    pub fn body(&self) -> String {
        let geom_mean: f64 = self.geometric_mean_mig_size();
        let mut lines: Vec<String> = vec![];
        for from in 0..NT_COUNT as u8 {
            for to in 0..NT_COUNT as u8 {
                if from == to {
                    continue;
                }
                let fdr: String = match self.compute_fdr(from, to) {
                    Some(fdr) => format!("{:.6}", fdr),
                    None => "NA".to_string()
                };
                lines.push(format!(
                    "{}\t{}\t{}\t{}\t{}\t{:.2}",
                    base_to_char(from), base_to_char(to), self.total_calls(from, to), self.passed_calls(from, to), fdr, geom_mean
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationCode;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    fn counts(caller: &MinorCaller) -> Vec<(u64, u64)> {
        let mut ret = vec![];
        for f in 0..4 {
            for t in 0..4 {
                ret.push((caller.total_calls(f, t), caller.passed_calls(f, t)));
            }
        }
        ret
    }

    #[test]
    fn test_poisson_call() {
        let caller = MinorCaller::poisson(1e-3, 1e-3);
        //P(X >= 3 | lambda = 0.02) is about 1.3e-6
        assert!(caller.call_and_update(1, 3, 3, 20));
        //P(X >= 1 | lambda = 0.02) is about 0.02
        assert!(!caller.call_and_update(1, 3, 1, 20));
        //zero counts are never significant
        assert!(!caller.call_and_update(1, 3, 0, 20));
        assert_eq!(caller.total_calls(1, 3), 3);
        assert_eq!(caller.passed_calls(1, 3), 1);
        assert_eq!(caller.total_calls(3, 1), 0);
        assert!(caller.p_value_sum(1, 3) > 0.0);
        assert!((caller.geometric_mean_mig_size() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_gamma_failure_is_not_a_pass() {
        //a negative error rate is an invalid gamma argument
        let caller = MinorCaller::poisson(1e-3, -1e-3);
        assert!(!caller.call_and_update(0, 1, 2, 20));
        assert_eq!(caller.total_calls(0, 1), 1);
        assert_eq!(caller.passed_calls(0, 1), 0);
    }

    #[test]
    fn test_fdr() {
        let caller = MinorCaller::poisson(1e-3, 1e-3);
        assert_eq!(caller.compute_fdr(0, 2), None);
        //recorded calls without a single pass are all false discoveries
        caller.call_and_update(0, 2, 1, 20);
        assert_eq!(caller.compute_fdr(0, 2), Some(f64::INFINITY));
        let caller = MinorCaller::poisson(1e-3, 1e-3);
        caller.call_and_update(0, 2, 4, 20);
        caller.call_and_update(0, 2, 1, 20);
        let fdr = caller.compute_fdr(0, 2).unwrap();
        let avg_p = caller.p_value_sum(0, 2) / 2.0;
        let expected = 1e-3 * (2.0 * avg_p).min(1.0) * 2.0 / 1.0;
        assert!((fdr - expected).abs() < 1e-15);
    }

    #[test]
    fn test_fdr_monotone_in_p_values() {
        //same pass count, increasingly weak failing calls
        let mut previous: f64 = 0.0;
        for n in [20usize, 40, 80, 160, 320].iter() {
            let caller = MinorCaller::poisson(1e-3, 1e-3);
            caller.call_and_update(2, 0, 6, 20);
            caller.call_and_update(2, 0, 1, *n);
            let fdr = caller.compute_fdr(2, 0).unwrap();
            assert!(fdr >= previous);
            previous = fdr;
        }
    }

    #[test]
    fn test_dummy() {
        let caller = MinorCaller::Dummy;
        assert!(caller.call_and_update(0, 1, 1, 10));
        assert!(!caller.call_and_update(0, 1, 0, 10));
        assert_eq!(caller.compute_fdr(0, 1), Some(0.0));
        assert!(matches!(caller.combine(&MinorCaller::Dummy), MinorCaller::Dummy));
    }

    #[test]
    fn test_combine_commutative() {
        let a = MinorCaller::poisson(1e-3, 1e-3);
        let b = MinorCaller::poisson(1e-3, 1e-3);
        a.call_and_update(0, 1, 5, 30);
        a.call_and_update(2, 3, 1, 30);
        b.call_and_update(0, 1, 1, 12);
        b.call_and_update(3, 0, 7, 50);

        let ab = a.combine(&b);
        let ba = b.combine(&a);
        assert_eq!(counts(&ab), counts(&ba));
        assert_eq!(ab.total_calls(0, 1), 2);
        assert_eq!(ab.passed_calls(0, 1), 1);
        assert!((ab.p_value_sum(0, 1) - ba.p_value_sum(0, 1)).abs() < 1e-12);
        assert!((ab.geometric_mean_mig_size() - ba.geometric_mean_mig_size()).abs() < 1e-9);

        //inputs are left untouched
        assert_eq!(a.total_calls(0, 1), 1);
    }

    #[test]
    #[should_panic]
    fn test_combine_mismatched() {
        let a = MinorCaller::poisson(1e-3, 1e-3);
        a.combine(&MinorCaller::Dummy);
    }

    #[test]
    fn test_concurrent_updates() {
        let caller = Arc::new(MinorCaller::poisson(1e-3, 1e-3));
        let mut handles = vec![];
        for _ in 0..4 {
            let c = caller.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    c.call_and_update(1, 2, 5, 20);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(caller.total_calls(1, 2), 1000);
        assert_eq!(caller.passed_calls(1, 2), 1000);
    }

    #[test]
    fn test_update_from_consensus() {
        let mut minors = BTreeMap::new();
        minors.insert(MutationCode::substitution(3, 0, 2), 6);
        minors.insert(MutationCode::substitution(9, 1, 3), 1);
        let mut consensus = Consensus {
            mig_index: 0,
            umi: "ACGT".to_string(),
            seq: vec![0; 20],
            qual: vec![40; 20],
            minors,
            assembled_size: 20,
            mig_size: 22
        };
        let caller = MinorCaller::poisson(1e-3, 1e-3);
        assert_eq!(caller.update_from_consensus(&mut consensus), 1);
        assert_eq!(caller.passed_calls(0, 2), 1);
        assert_eq!(caller.total_calls(1, 3), 1);
        assert_eq!(caller.passed_calls(1, 3), 0);

        //only the minor that passed the test is kept on the consensus
        assert_eq!(consensus.minors.len(), 1);
        assert_eq!(consensus.minors.get(&MutationCode::substitution(3, 0, 2)), Some(&6));
        assert!(consensus.minors.get(&MutationCode::substitution(9, 1, 3)).is_none());

        let report = caller.body();
        assert_eq!(report.lines().count(), 12);
        assert!(report.contains("A\tG\t1\t1\t"));
        assert!(MinorCaller::header().starts_with("from\tto"));
    }
}

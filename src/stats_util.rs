
/// lowest quality value a consensus base can carry
pub const MIN_QUAL: u8 = 2;
/// highest quality value a consensus base can carry
pub const MAX_QUAL: u8 = 40;
/// consensus columns at or below this quality are trimmed from the ends
pub const BAD_QUAL: u8 = 10;
/// reads bases at or above this quality count towards the quality-filtered tables
pub const DEFAULT_GOOD_QUAL: u8 = 25;
/// offset for converting ASCII encoded qualities
pub const PHRED_OFFSET: u8 = 33;

/// Converts a phred score into an error probability.
/// # Examples
/// ```rust
/// use migcall::stats_util::phred_to_error;
/// assert!((phred_to_error(20.0) - 0.01).abs() < 1e-12);
/// ```
#[inline]
pub fn phred_to_error(q: f64) -> f64 {
    10.0_f64.powf(-q / 10.0)
}

/// Converts an error probability into a phred score.
/// # Examples
/// ```rust
/// use migcall::stats_util::error_to_phred;
/// assert!((error_to_phred(0.001) - 30.0).abs() < 1e-9);
/// ```
#[inline]
pub fn error_to_phred(p: f64) -> f64 {
    -10.0 * p.log10()
}

/// Clamps a raw quality value into `[MIN_QUAL, MAX_QUAL]` and rounds it down to a byte.
/// NaN values are treated as the minimum quality.
/// # Examples
/// ```rust
/// use migcall::stats_util::clamp_quality;
/// assert_eq!(clamp_quality(-5.0), 2);
/// assert_eq!(clamp_quality(31.7), 31);
/// assert_eq!(clamp_quality(100.0), 40);
/// ```
#[inline]
pub fn clamp_quality(q: f64) -> u8 {
    if q.is_nan() {
        return MIN_QUAL;
    }
    q.max(MIN_QUAL as f64).min(MAX_QUAL as f64) as u8
}

/// Calculates the consensus quality score (CQS) of a PWM column.
/// The fraction of reads agreeing with the majority base is rescaled so that a uniform column (0.25) maps
/// to zero and a unanimous column maps to `MAX_QUAL`, then clamped.
/// # Arguments
/// * `max_count` - the count of the majority base in the column
/// * `total` - the number of reads assembled
/// # Examples
/// ```rust
/// use migcall::stats_util::consensus_quality;
/// assert_eq!(consensus_quality(20, 20), 40);
/// assert_eq!(consensus_quality(18, 20), 34);
/// assert_eq!(consensus_quality(1, 4), 2);
/// ```
#[inline]
pub fn consensus_quality(max_count: u32, total: usize) -> u8 {
    if total == 0 {
        return MIN_QUAL;
    }
    let freq: f64 = max_count as f64 / total as f64;
    clamp_quality(MAX_QUAL as f64 * ((freq - 0.25) / 0.75))
}

/// Returns the geometric mean given a running sum of log10 values and the number of values summed.
/// Returns 0 when nothing was summed.
/// # Examples
/// ```rust
/// use migcall::stats_util::geometric_mean_from_log10;
/// let sum = 10f64.log10() + 1000f64.log10();
/// assert!((geometric_mean_from_log10(sum, 2) - 100.0).abs() < 1e-9);
/// ```
#[inline]
pub fn geometric_mean_from_log10(log_sum: f64, count: u64) -> f64 {
    match count {
        0 => 0.0,
        c => 10.0_f64.powf(log_sum / c as f64)
    }
}


extern crate log;

use log::debug;
use statrs::distribution::{Binomial, Discrete, DiscreteCDF, NegativeBinomial};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error_model::{ErrorModel, ErrorModelParameters, MinorMatrix};
use crate::errors::{self, ConfigError};
use crate::mutation::MutationCode;
use crate::mutations_table::MutationsTable;
use crate::string_util::{base_to_char, NT_COUNT};

/// score reported when the error rate or the fitted distribution is undefined
pub const UNDEF_QUAL: f64 = -1.0;
/// score reported for an infinitely significant call
pub const MAX_QUAL: f64 = 10000.0;

//linear fit of the latent error rate mean and variance against the expected error count
pub const MEAN_A: f64 = 0.93;
pub const MEAN_B: f64 = 0.12;
pub const VAR_A: f64 = 0.21;
pub const VAR_B: f64 = 0.04;

/// How the background error distribution is modeled when scoring
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorModelType {
    /// Binomial over the coverage with the modeled error rate
    Binomial,
    /// Negative binomial fitted to the expected minor-based error count
    MinorBased
}

impl FromStr for ErrorModelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binomial" => Ok(ErrorModelType::Binomial),
            "minor" | "minorbased" | "minor-based" => Ok(ErrorModelType::MinorBased),
            _ => Err(ConfigError::Invalid(format!("unknown error model type '{}'", s)))
        }
    }
}

/// stores options for variant calling
#[derive(Clone, Debug)]
pub struct VariantCallerParameters {
    /// Minimum score for the quality filter
    pub quality_threshold: f64,
    /// Singleton variants pass only if `frequency * singleton_frequency_threshold >= 1`
    pub singleton_frequency_threshold: f64,
    /// Minimum coverage for the coverage filter
    pub coverage_threshold: u32,
    /// PCR cycles assumed by the error model
    pub model_cycles: u32,
    /// PCR efficiency assumed by the error model, within `(1, 2]`
    pub model_efficiency: f64,
    /// Tuning exponent of the error model
    pub model_order: f64,
    pub error_model_type: ErrorModelType
}

impl Default for VariantCallerParameters {
    fn default() -> Self {
        Self {
            quality_threshold: 20.0,
            singleton_frequency_threshold: 10000.0,
            coverage_threshold: 100,
            model_cycles: 20,
            model_efficiency: 1.8,
            model_order: 1.0,
            error_model_type: ErrorModelType::MinorBased
        }
    }
}

impl VariantCallerParameters {
    /// The PCR efficiency minus one.
    #[inline]
    pub fn lambda(&self) -> f64 {
        self.model_efficiency - 1.0
    }

    /// Checks the thresholds and builds the matching error model parameters.
    pub fn error_model_parameters(&self) -> Result<ErrorModelParameters, ConfigError> {
        errors::check_non_negative("quality_threshold", self.quality_threshold)?;
        errors::check_non_negative("singleton_frequency_threshold", self.singleton_frequency_threshold)?;
        if !(self.model_efficiency > 1.0 && self.model_efficiency <= 2.0) {
            return Err(ConfigError::Invalid(format!("model_efficiency must be within (1, 2], got {}", self.model_efficiency)));
        }
        ErrorModelParameters::new(self.model_order, self.model_cycles, self.lambda())
    }
}

/// A called substitution at one reference position
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    pub reference_name: String,
    pub contig: String,
    /// Genomic coordinate of the variant
    pub genomic_position: usize,
    /// The substitution in reference coordinates
    pub mutation: MutationCode,
    /// Consensus reads carrying the substituted base
    pub major_count: u32,
    /// Consensus reads with the substituted base as a minor
    pub minor_count: u32,
    pub coverage: u32,
    /// `major_count / coverage`
    pub frequency: f64,
    pub score: f64,
    /// Mean consensus quality at the position
    pub mean_quality: f64,
    /// The modeled error rate, may be NaN
    pub error_rate: f64,
    pub ancestral_base: u8,
    pub has_reference: bool,
    /// `PASS` or the `;` separated ids of failed filters
    pub filter_summary: String
}

impl Variant {
    pub const HEADER: &'static str = "#REFERENCE\tCONTIG\tPOS\tMUTATION\tANCESTRAL\tHAS_REF\tMAJOR\tMINOR\tCOVERAGE\tFREQ\tQUAL\tMEAN_CQS\tERROR_RATE\tFILTER";

    /// Renders the variant as a tab-separated row matching `HEADER`.
    pub fn to_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{:.1}\t{:.1}\t{:.3e}\t{}",
            self.reference_name, self.contig, self.genomic_position, self.mutation, base_to_char(self.ancestral_base),
            self.has_reference, self.major_count, self.minor_count, self.coverage, self.frequency, self.score,
            self.mean_quality, self.error_rate, self.filter_summary
        )
    }
}

/// Filters annotate variants but never remove them
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VariantFilter {
    Quality(f64),
    Singleton(f64),
    Coverage(u32)
}

impl VariantFilter {
    /// Short id used in the filter summary, e.g. `q20`.
    pub fn id(&self) -> String {
        match self {
            VariantFilter::Quality(t) => format!("q{}", t),
            VariantFilter::Singleton(t) => format!("si{}", t),
            VariantFilter::Coverage(t) => format!("c{}", t)
        }
    }

    pub fn passes(&self, variant: &Variant) -> bool {
        match self {
            VariantFilter::Quality(t) => variant.score >= *t,
            VariantFilter::Singleton(t) => variant.major_count > 1 || variant.frequency * t >= 1.0,
            VariantFilter::Coverage(t) => variant.coverage >= *t
        }
    }
}

impl fmt::Display for VariantFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Orders variants by contig, then genomic position, then mutation code.
pub fn sort_variants(variants: &mut Vec<Variant>) {
    variants.sort_by(|a, b| {
        match a.contig.cmp(&b.contig) {
            Ordering::Equal => {},
            ord => return ord
        };
        match a.genomic_position.cmp(&b.genomic_position) {
            Ordering::Equal => {},
            ord => return ord
        };
        a.mutation.cmp(&b.mutation)
    });
}

/// Scores the substitutions recorded in mutations tables against the modeled background error
pub struct VariantCaller {
    params: VariantCallerParameters,
    error_model: ErrorModel,
    filters: Vec<VariantFilter>
}

impl VariantCaller {
    /// Creates a caller after validating the parameters.
    pub fn new(params: VariantCallerParameters) -> Result<VariantCaller, ConfigError> {
        let model_params: ErrorModelParameters = params.error_model_parameters()?;
        let filters: Vec<VariantFilter> = vec![
            VariantFilter::Quality(params.quality_threshold),
            VariantFilter::Singleton(params.singleton_frequency_threshold),
            VariantFilter::Coverage(params.coverage_threshold)
        ];
        Ok(VariantCaller {
            params,
            error_model: ErrorModel::new(model_params),
            filters
        })
    }

    #[inline]
    pub fn params(&self) -> &VariantCallerParameters {
        &self.params
    }

    #[inline]
    pub fn filters(&self) -> &[VariantFilter] {
        &self.filters
    }

    /// Calls every substitution away from the ancestral base that at least one consensus read carries.
    /// The result is annotated by the filters and sorted.
    pub fn call(&self, table: &MutationsTable, minor_matrix: &MinorMatrix) -> Vec<Variant> {
        let reference = table.reference();
        let mut variants: Vec<Variant> = vec![];
        for pos in 0..table.len() {
            let ancestral: u8 = table.ancestral_base(pos);
            if ancestral as usize >= NT_COUNT {
                continue;
            }
            let coverage: u32 = table.coverage(pos);
            for to in 0..NT_COUNT as u8 {
                let major_count: u32 = table.major_count(pos, to);
                if to == ancestral || major_count == 0 {
                    continue;
                }
                let minor_count: u32 = table.minor_count(pos, to);
                let error_rate: f64 = self.error_model.error_rate(minor_count, coverage, ancestral, to, minor_matrix);
                let score: f64 = self.score(major_count, coverage, error_rate);
                let mut variant = Variant {
                    reference_name: reference.name.clone(),
                    contig: reference.contig.clone(),
                    genomic_position: reference.genomic_start + pos,
                    mutation: MutationCode::substitution(pos, ancestral, to),
                    major_count,
                    minor_count,
                    coverage,
                    frequency: major_count as f64 / coverage as f64,
                    score,
                    mean_quality: table.mean_quality(pos),
                    error_rate,
                    ancestral_base: ancestral,
                    has_reference: table.has_reference_base(pos),
                    filter_summary: String::new()
                };
                variant.filter_summary = self.filter_summary(&variant);
                variants.push(variant);
            }
        }
        debug!("{}: called {} variants", reference.name, variants.len());
        sort_variants(&mut variants);
        variants
    }

    /// Runs the filter chain, returning `PASS` or the ids of every failed filter.
    pub fn filter_summary(&self, variant: &Variant) -> String {
        let failed: Vec<String> = self.filters.iter()
            .filter(|f| !f.passes(variant))
            .map(|f| f.id())
            .collect();
        if failed.is_empty() {
            "PASS".to_string()
        } else {
            failed.join(";")
        }
    }

    /// Scores a substitution seen in `major_count` of `coverage` consensus reads.
    /// # Examples
    /// ```rust
    /// use migcall::variant::{VariantCaller, UNDEF_QUAL};
    /// let caller = VariantCaller::new(Default::default()).unwrap();
    /// assert_eq!(caller.score(0, 1000, 1e-4), 0.0);
    /// assert_eq!(caller.score(5, 1000, f64::NAN), UNDEF_QUAL);
    /// assert!(caller.score(50, 1000, 1e-4) > 20.0);
    /// ```
    pub fn score(&self, major_count: u32, coverage: u32, error_rate: f64) -> f64 {
        if major_count == 0 {
            return 0.0;
        }
        if error_rate.is_nan() {
            return UNDEF_QUAL;
        }
        let score: f64 = match self.params.error_model_type {
            ErrorModelType::Binomial => binomial_score(major_count, coverage, error_rate),
            ErrorModelType::MinorBased => negative_binomial_score(major_count, coverage, error_rate)
        };
        if score.is_nan() {
            UNDEF_QUAL
        } else if score.is_infinite() {
            MAX_QUAL
        } else {
            score
        }
    }
}

/// Transforms the mid-p upper tail probability into a phred-like score.
#[inline]
fn tail_score(cdf: f64, pmf: f64) -> f64 {
    -10.0 * (1.0 - cdf + 0.5 * pmf).log10()
}

fn binomial_score(major_count: u32, coverage: u32, error_rate: f64) -> f64 {
    match Binomial::new(error_rate, coverage as u64) {
        Ok(dist) => {
            let k: u64 = major_count as u64;
            tail_score(dist.cdf(k), dist.pmf(k))
        },
        Err(_) => UNDEF_QUAL
    }
}

fn negative_binomial_score(major_count: u32, coverage: u32, error_rate: f64) -> f64 {
    let expected_errors: f64 = error_rate * coverage as f64;
    let mean: f64 = MEAN_A * expected_errors + MEAN_B;
    let var: f64 = VAR_A * expected_errors + VAR_B;
    let r: f64 = (mean * mean / var).round();
    if r == 0.0 || !r.is_finite() {
        return UNDEF_QUAL;
    }
    let p: f64 = mean / (mean + var);
    match NegativeBinomial::new(r, p) {
        Ok(dist) => {
            let k: u64 = major_count as u64;
            tail_score(dist.cdf(k), dist.pmf(k))
        },
        Err(_) => UNDEF_QUAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Consensus;
    use crate::mutations_table::Reference;
    use std::collections::BTreeMap;

    fn variant(contig: &str, pos: usize, major: u32, coverage: u32, score: f64) -> Variant {
        Variant {
            reference_name: "ref".to_string(),
            contig: contig.to_string(),
            genomic_position: pos,
            mutation: MutationCode::substitution(pos, 0, 2),
            major_count: major,
            minor_count: 0,
            coverage,
            frequency: major as f64 / coverage as f64,
            score,
            mean_quality: 40.0,
            error_rate: 1e-4,
            ancestral_base: 0,
            has_reference: true,
            filter_summary: String::new()
        }
    }

    #[test]
    fn test_score_sanity() {
        for &model in [ErrorModelType::Binomial, ErrorModelType::MinorBased].iter() {
            let caller = VariantCaller::new(VariantCallerParameters {
                error_model_type: model,
                ..Default::default()
            }).unwrap();
            for &cov in [1u32, 10, 1000].iter() {
                assert_eq!(caller.score(0, cov, 0.01), 0.0);
                assert_eq!(caller.score(0, cov, f64::NAN), 0.0);
                assert_eq!(caller.score(1, cov, f64::NAN), UNDEF_QUAL);
            }
        }
    }

    #[test]
    fn test_binomial_score() {
        let caller = VariantCaller::new(VariantCallerParameters {
            error_model_type: ErrorModelType::Binomial,
            ..Default::default()
        }).unwrap();
        let weak = caller.score(1, 1000, 1e-3);
        let strong = caller.score(20, 1000, 1e-3);
        assert!(strong > weak);
        assert!(weak >= 0.0);
        //the tail underflows to zero
        assert_eq!(caller.score(1000, 1000, 1e-6), MAX_QUAL);
        //not a probability
        assert_eq!(caller.score(5, 100, 2.0), UNDEF_QUAL);
    }

    #[test]
    fn test_negative_binomial_score() {
        let caller = VariantCaller::new(Default::default()).unwrap();
        let weak = caller.score(10, 1000, 1e-2);
        let strong = caller.score(60, 1000, 1e-2);
        assert!(strong > weak);
        assert!(strong > 20.0);
    }

    #[test]
    fn test_negative_binomial_rounding() {
        //with no expected errors the fitted shape is 0.36, which rounds to zero
        let caller = VariantCaller::new(Default::default()).unwrap();
        assert_eq!(caller.score(3, 1000, 0.0), UNDEF_QUAL);
        //the shape crosses 0.5 between these rates and the score jumps from undefined to defined
        let r = |e: f64| {
            let mean = MEAN_A * e + MEAN_B;
            let var = VAR_A * e + VAR_B;
            mean * mean / var
        };
        assert!(r(0.0) < 0.5 && r(0.1) > 0.5);
        assert!(caller.score(3, 1000, 1e-4) > 0.0);
    }

    #[test]
    fn test_filters() {
        let caller = VariantCaller::new(Default::default()).unwrap();
        assert_eq!(caller.filter_summary(&variant("chr1", 10, 50, 500, 35.0)), "PASS");
        assert_eq!(caller.filter_summary(&variant("chr1", 10, 50, 50, 35.0)), "c100");
        assert_eq!(caller.filter_summary(&variant("chr1", 10, 50, 500, 12.0)), "q20");
        //singleton at 1e-5 frequency fails both the singleton and quality filters
        assert_eq!(caller.filter_summary(&variant("chr1", 10, 1, 100000, UNDEF_QUAL)), "q20;si10000");
        //singleton at 2e-4 frequency is fine
        assert!(VariantFilter::Singleton(10000.0).passes(&variant("chr1", 1, 1, 5000, 30.0)));
    }

    #[test]
    fn test_sort() {
        let mut variants = vec![
            variant("chr2", 5, 2, 200, 30.0),
            variant("chr1", 100, 2, 200, 30.0),
            variant("chr1", 7, 2, 200, 30.0),
            variant("chr10", 1, 2, 200, 30.0)
        ];
        sort_variants(&mut variants);
        let keys: Vec<(String, usize)> = variants.iter().map(|v| (v.contig.clone(), v.genomic_position)).collect();
        assert_eq!(keys, vec![
            ("chr1".to_string(), 7),
            ("chr1".to_string(), 100),
            ("chr10".to_string(), 1),
            ("chr2".to_string(), 5)
        ]);
        for pair in variants.windows(2) {
            assert!((&pair[0].contig, pair[0].genomic_position) <= (&pair[1].contig, pair[1].genomic_position));
        }
    }

    #[test]
    fn test_call() {
        let mut table = MutationsTable::new(Reference::new("chr3:1000", b"ACGTACGTAC"));
        for i in 0..150 {
            let mut seq = vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1];
            let mut minors = BTreeMap::new();
            if i < 30 {
                seq[4] = 2;
            }
            if i % 50 == 0 {
                minors.insert(MutationCode::substitution(6, 2, 0), 4);
            }
            table.append(0, &Consensus {
                mig_index: i,
                umi: "ACGT".to_string(),
                seq,
                qual: vec![38; 10],
                minors,
                assembled_size: 10,
                mig_size: 10
            });
        }
        let matrix = MinorMatrix::from_table(&table, None);
        let caller = VariantCaller::new(VariantCallerParameters {
            error_model_type: ErrorModelType::Binomial,
            ..Default::default()
        }).unwrap();
        let variants = caller.call(&table, &matrix);
        assert_eq!(variants.len(), 1);
        let v = &variants[0];
        assert_eq!(v.contig, "chr3");
        assert_eq!(v.genomic_position, 1004);
        assert_eq!(v.mutation.to_string(), "S4:A>G");
        assert_eq!(v.major_count, 30);
        assert_eq!(v.coverage, 150);
        assert!((v.frequency - 0.2).abs() < 1e-12);
        assert!(v.has_reference);
        assert_eq!(v.filter_summary, "PASS");
        assert!(v.to_row().starts_with("chr3:1000\tchr3\t1004\tS4:A>G\tA\ttrue\t30\t0\t150\t"));
        assert_eq!(Variant::HEADER.split('\t').count(), v.to_row().split('\t').count());
    }

    #[test]
    fn test_bad_params() {
        assert!(VariantCaller::new(VariantCallerParameters {
            model_efficiency: 2.5,
            ..Default::default()
        }).is_err());
        assert!(VariantCaller::new(VariantCallerParameters {
            model_cycles: 0,
            ..Default::default()
        }).is_err());
        assert!("binomial".parse::<ErrorModelType>().is_ok());
        assert!("poisson".parse::<ErrorModelType>().is_err());
    }
}


use crate::errors::{self, ConfigError};
use crate::minor_caller::MinorCaller;
use crate::mutations_table::MutationsTable;
use crate::string_util::NT_COUNT;

/// below this coverage the observed minor count is too noisy and the floor falls back to one MIG
pub const COVERAGE_THRESHOLD: u32 = 100;

/// Parameters of the PCR error propagation model. `propagate_prob` is kept in sync by the setters.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorModelParameters {
    order: f64,
    cycles: u32,
    lambda: f64,
    propagate_prob: f64
}

impl ErrorModelParameters {
    /// Creates validated model parameters.
    /// # Arguments
    /// * `order` - the tuning exponent of the propagation probability, non-negative
    /// * `cycles` - the number of PCR cycles, within `[1, 100]`
    /// * `lambda` - PCR efficiency minus one, within `(0, 1]`
    /// # Examples
    /// ```rust
    /// use migcall::error_model::ErrorModelParameters;
    /// let params = ErrorModelParameters::new(1.0, 20, 0.8).unwrap();
    /// assert!((params.propagate_prob() - 0.2 * 0.8 * 0.8).abs() < 1e-12);
    /// assert!(ErrorModelParameters::new(1.0, 200, 0.8).is_err());
    /// assert!(ErrorModelParameters::new(1.0, 20, 0.0).is_err());
    /// ```
    pub fn new(order: f64, cycles: u32, lambda: f64) -> Result<ErrorModelParameters, ConfigError> {
        let mut params = ErrorModelParameters {
            order: 0.0,
            cycles: 1,
            lambda: 1.0,
            propagate_prob: 0.0
        };
        params.set_order(order)?;
        params.set_cycles(cycles)?;
        params.set_lambda(lambda)?;
        Ok(params)
    }

    pub fn set_order(&mut self, order: f64) -> Result<(), ConfigError> {
        errors::check_non_negative("order", order)?;
        self.order = order;
        self.update_propagate_prob();
        Ok(())
    }

    pub fn set_cycles(&mut self, cycles: u32) -> Result<(), ConfigError> {
        errors::check_range("cycles", cycles as f64, 1.0, 100.0)?;
        self.cycles = cycles;
        Ok(())
    }

    pub fn set_lambda(&mut self, lambda: f64) -> Result<(), ConfigError> {
        if !(lambda > 0.0 && lambda <= 1.0) {
            return Err(ConfigError::Invalid(format!("lambda must be within (0, 1], got {}", lambda)));
        }
        self.lambda = lambda;
        self.update_propagate_prob();
        Ok(())
    }

    fn update_propagate_prob(&mut self) {
        self.propagate_prob = (1.0 - self.lambda).powf(self.order) * self.lambda.powf(self.order + 1.0);
    }

    #[inline]
    pub fn order(&self) -> f64 {
        self.order
    }

    #[inline]
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    #[inline]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    #[inline]
    pub fn propagate_prob(&self) -> f64 {
        self.propagate_prob
    }
}

/// Per-substitution background minor rates pooled over every position of one or more mutations tables
#[derive(Clone, Debug, PartialEq)]
pub struct MinorMatrix {
    minor_sums: [[f64; NT_COUNT]; NT_COUNT],
    coverage: [u64; NT_COUNT]
}

impl MinorMatrix {
    /// Pools one table, see `from_tables(...)`.
    pub fn from_table(table: &MutationsTable, minor_caller: Option<&MinorCaller>) -> MinorMatrix {
        MinorMatrix::from_tables(std::slice::from_ref(table), minor_caller)
    }

    /// Sums minor counts by (ancestral base, minor base) and coverage by ancestral base.
    /// If a minor caller is supplied and has recorded calls for a substitution, its minor sum is discounted by
    /// the estimated false discovery rate. A substitution with calls but no passes gets a weight of 0.
    pub fn from_tables(tables: &[MutationsTable], minor_caller: Option<&MinorCaller>) -> MinorMatrix {
        let mut minor_counts: [[u64; NT_COUNT]; NT_COUNT] = [[0; NT_COUNT]; NT_COUNT];
        let mut coverage: [u64; NT_COUNT] = [0; NT_COUNT];
        for table in tables.iter() {
            for pos in 0..table.len() {
                let from: u8 = table.ancestral_base(pos);
                if from as usize >= NT_COUNT {
                    continue;
                }
                coverage[from as usize] += table.coverage(pos) as u64;
                for to in 0..NT_COUNT as u8 {
                    if to != from {
                        minor_counts[from as usize][to as usize] += table.minor_count(pos, to) as u64;
                    }
                }
            }
        }

        let mut minor_sums: [[f64; NT_COUNT]; NT_COUNT] = [[0.0; NT_COUNT]; NT_COUNT];
        for from in 0..NT_COUNT {
            for to in 0..NT_COUNT {
                let mut weight: f64 = 1.0;
                if let Some(caller) = minor_caller {
                    if caller.total_calls(from as u8, to as u8) > 0 {
                        if let Some(fdr) = caller.compute_fdr(from as u8, to as u8) {
                            weight = 1.0 - fdr.max(0.0).min(1.0);
                        }
                    }
                }
                minor_sums[from][to] = minor_counts[from][to] as f64 * weight;
            }
        }

        MinorMatrix {
            minor_sums,
            coverage
        }
    }

    /// The pooled minor rate for a substitution, 0 when nothing with that ancestral base was covered.
    pub fn rate(&self, from: u8, to: u8) -> f64 {
        let cov: u64 = self.coverage[from as usize];
        if cov == 0 {
            0.0
        } else {
            self.minor_sums[from as usize][to as usize] / cov as f64
        }
    }
}

/// Converts observed minor rates into a modeled per-MIG error rate
#[derive(Clone, Debug)]
pub struct ErrorModel {
    params: ErrorModelParameters
}

impl ErrorModel {
    pub fn new(params: ErrorModelParameters) -> ErrorModel {
        ErrorModel {
            params
        }
    }

    #[inline]
    pub fn params(&self) -> &ErrorModelParameters {
        &self.params
    }

    /// Estimates the error rate of a substitution at one position. The result is NaN or infinite for
    /// degenerate inputs, callers must treat that as an undefined rate.
    /// # Arguments
    /// * `minor_count` - MIGs with a minor of this substitution at the position
    /// * `total_coverage` - MIGs covering the position
    /// * `from` - the ancestral base
    /// * `to` - the substituted base
    /// * `minor_matrix` - the pooled background rates
    pub fn error_rate(&self, minor_count: u32, total_coverage: u32, from: u8, to: u8, minor_matrix: &MinorMatrix) -> f64 {
        let floor: f64 = if total_coverage < COVERAGE_THRESHOLD {
            1.0 / total_coverage as f64
        } else {
            std::cmp::max(minor_count, 1) as f64 / total_coverage as f64
        };
        let rate: f64 = floor.max(minor_matrix.rate(from, to));
        let per_cycle_rate: f64 = (1.0 - rate).powf(1.0 / self.params.cycles as f64);
        let lambda: f64 = self.params.lambda;
        (lambda.ln() - ((1.0 + lambda) * per_cycle_rate - 1.0).ln()) * self.params.propagate_prob
    }
}

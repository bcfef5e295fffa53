//! Complex survey design: stratification, clustering, and weighting.
//!
//! `SurveyDesign` carries the metadata needed to estimate sampling variances
//! under a stratified, clustered, weighted design via Taylor linearization:
//! per-row score contributions are totaled within each primary sampling unit
//! (PSU), and the between-PSU scatter within each stratum estimates the
//! variance of the corresponding weighted total. Every downstream statistic
//! (model covariance, marginal-effect intervals) must route through this
//! object; treating the rows as i.i.d. would bias point estimates toward
//! over-represented subgroups and understate sampling variance.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Survey design requires at least one respondent")]
    Empty,
    #[error(
        "Design columns have mismatched lengths: {strata} strata, {psus} PSUs, {weights} weights"
    )]
    LengthMismatch {
        strata: usize,
        psus: usize,
        weights: usize,
    },
    #[error("Non-positive survey weight {weight} at row {row}; all weights must be > 0")]
    NonPositiveWeight { row: usize, weight: f64 },
    #[error(
        "Stratum {stratum} contains a single sampling unit and no lonely-PSU adjustment is enabled; \
         enable LonelyPsu::Adjust or merge the stratum"
    )]
    UnadjustedLonelyStratum { stratum: i64 },
    #[error("Score matrix has {rows} rows but the design describes {expected} respondents")]
    ScoreLengthMismatch { rows: usize, expected: usize },
}

/// Policy for strata that contain exactly one PSU, where the within-stratum
/// variance is undefined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LonelyPsu {
    /// Refuse to estimate a variance. The ecosystem default, kept here so
    /// library callers must opt in to the adjustment explicitly.
    #[default]
    Fail,
    /// Substitute the squared deviation of the lonely PSU total from the
    /// grand mean of all PSU totals, a conservative contribution.
    Adjust,
}

/// Immutable view over the respondent set's sampling metadata. Construction
/// validates the weights and indexes rows by (stratum, PSU); the underlying
/// data columns are never copied or mutated.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    weights: Array1<f64>,
    /// Row indices grouped per PSU, keyed by (stratum, psu). BTreeMap keeps
    /// stratum iteration order deterministic.
    clusters: BTreeMap<(i64, i64), Vec<usize>>,
    n_strata: usize,
    n_psus: usize,
    lonely: LonelyPsu,
}

impl SurveyDesign {
    pub fn new(
        strata: &[i64],
        psus: &[i64],
        weights: Array1<f64>,
        lonely: LonelyPsu,
    ) -> Result<Self, DesignError> {
        if strata.is_empty() {
            return Err(DesignError::Empty);
        }
        if strata.len() != psus.len() || strata.len() != weights.len() {
            return Err(DesignError::LengthMismatch {
                strata: strata.len(),
                psus: psus.len(),
                weights: weights.len(),
            });
        }
        for (row, &w) in weights.iter().enumerate() {
            if !(w > 0.0) || !w.is_finite() {
                return Err(DesignError::NonPositiveWeight { row, weight: w });
            }
        }

        let mut clusters: BTreeMap<(i64, i64), Vec<usize>> = BTreeMap::new();
        for (row, (&h, &j)) in strata.iter().zip(psus.iter()).enumerate() {
            clusters.entry((h, j)).or_default().push(row);
        }
        let n_psus = clusters.len();
        let n_strata = {
            let mut last = None;
            let mut count = 0;
            for &(h, _) in clusters.keys() {
                if last != Some(h) {
                    count += 1;
                    last = Some(h);
                }
            }
            count
        };

        Ok(Self {
            weights,
            clusters,
            n_strata,
            n_psus,
            lonely,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn n_strata(&self) -> usize {
        self.n_strata
    }

    pub fn n_psus(&self) -> usize {
        self.n_psus
    }

    pub fn lonely_psu_policy(&self) -> LonelyPsu {
        self.lonely
    }

    /// Design degrees of freedom: PSUs minus strata, the conventional df for
    /// design-based inference.
    pub fn degrees_of_freedom(&self) -> f64 {
        (self.n_psus as f64 - self.n_strata as f64).max(1.0)
    }

    /// Design-weighted mean of a per-row column.
    pub fn weighted_mean(&self, values: ArrayView1<f64>) -> f64 {
        let total: f64 = self.weights.dot(&values);
        total / self.weights.sum()
    }

    /// Taylor-linearization variance of a vector of weighted score totals.
    ///
    /// `scores` holds one row per respondent; each row is that respondent's
    /// contribution (already weight-multiplied by the caller) to a p-vector of
    /// estimating-equation totals. Rows are summed within each PSU; for a
    /// stratum h with n_h > 1 PSUs the contribution is
    /// (n_h / (n_h - 1)) * sum_j (z_hj - zbar_h)(z_hj - zbar_h)'. A lonely
    /// stratum (n_h = 1) either fails or, under `LonelyPsu::Adjust`,
    /// contributes its squared deviation from the grand mean of all PSU
    /// totals.
    pub fn taylor_variance(&self, scores: ArrayView2<f64>) -> Result<Array2<f64>, DesignError> {
        let n = self.len();
        if scores.nrows() != n {
            return Err(DesignError::ScoreLengthMismatch {
                rows: scores.nrows(),
                expected: n,
            });
        }
        let p = scores.ncols();

        // PSU totals, grouped per stratum in key order.
        let mut strata: BTreeMap<i64, Vec<Array1<f64>>> = BTreeMap::new();
        for (&(h, _), rows) in &self.clusters {
            let mut total = Array1::<f64>::zeros(p);
            for &row in rows {
                total += &scores.row(row);
            }
            strata.entry(h).or_default().push(total);
        }

        // Grand mean of all PSU totals, used by the lonely-PSU adjustment.
        let mut grand_mean = Array1::<f64>::zeros(p);
        for totals in strata.values() {
            for z in totals {
                grand_mean += z;
            }
        }
        grand_mean /= self.n_psus as f64;

        let mut variance = Array2::<f64>::zeros((p, p));
        for (&stratum, totals) in &strata {
            let n_h = totals.len();
            if n_h == 1 {
                match self.lonely {
                    LonelyPsu::Fail => {
                        return Err(DesignError::UnadjustedLonelyStratum { stratum });
                    }
                    LonelyPsu::Adjust => {
                        let d = &totals[0] - &grand_mean;
                        accumulate_outer(&mut variance, &d, 1.0);
                    }
                }
                continue;
            }
            let mut stratum_mean = Array1::<f64>::zeros(p);
            for z in totals {
                stratum_mean += z;
            }
            stratum_mean /= n_h as f64;
            let scale = n_h as f64 / (n_h as f64 - 1.0);
            for z in totals {
                let d = z - &stratum_mean;
                accumulate_outer(&mut variance, &d, scale);
            }
        }
        Ok(variance)
    }
}

fn accumulate_outer(acc: &mut Array2<f64>, d: &Array1<f64>, scale: f64) {
    let p = d.len();
    for i in 0..p {
        for j in 0..p {
            acc[[i, j]] += scale * d[i] * d[j];
        }
    }
}

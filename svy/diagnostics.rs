//! Goodness-of-fit diagnostics over (observed, fitted, residual).
//!
//! Three independent checks:
//! 1. Pearson correlation between fitted values and residuals, with a t-based
//!    two-sided p-value (n - 2 df). Under a correct specification the
//!    correlation is indistinguishable from zero.
//! 2. A Pregibon-style link test: OLS of the observed response on the fitted
//!    value and its square. A significant squared term signals a misspecified
//!    link or omitted nonlinearity.
//! 3. A grouped fit test in the Hosmer-Lemeshow style, generalized to a
//!    continuous response: observations are ranked by fitted value into `g`
//!    groups (stable sort on fitted value then row order, so group assignment
//!    is reproducible), and the weighted observed and expected group totals
//!    are compared. Group deviations are normalized by the estimated variance
//!    of the group total (dispersion times the family variance), giving a
//!    chi-squared statistic with g - 2 degrees of freedom.

use crate::family::Tweedie;
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;
use statrs::distribution::{ChiSquared, ContinuousCDF, StudentsT};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("Diagnostics require at least {required} observations, found {found}")]
    TooFewObservations { found: usize, required: usize },
    #[error("Fitted values are degenerate (zero variance); the link test is undefined")]
    DegenerateFittedValues,
    #[error("Grouped fit test requires at least 3 groups, requested {0}")]
    TooFewGroups(usize),
    #[error("Grouped fit test is undefined: group {group} has non-positive variance {variance}")]
    GroupedFitUndefined { group: usize, variance: f64 },
    #[error("Input columns have mismatched lengths: {0} vs {1}")]
    LengthMismatch(usize, usize),
}

/// Pearson correlation between fitted values and residuals.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationTest {
    pub correlation: f64,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

/// One coefficient of the link-test regression.
#[derive(Debug, Clone, Copy)]
pub struct LinkTestTerm {
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub p_value: f64,
}

/// Pregibon-style specification test: response on fitted and fitted squared.
#[derive(Debug, Clone, Copy)]
pub struct LinkTest {
    pub linear: LinkTestTerm,
    pub quadratic: LinkTestTerm,
}

/// Grouped (decile) fit test.
#[derive(Debug, Clone)]
pub struct GroupedFitTest {
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
    pub groups: usize,
    /// Weighted observed and expected totals per group, in fitted-value order.
    pub observed: Vec<f64>,
    pub expected: Vec<f64>,
}

/// Correlation between fitted values and raw residuals, with a two-sided
/// t-test on n - 2 degrees of freedom.
pub fn correlation_test(
    fitted: ArrayView1<f64>,
    residuals: ArrayView1<f64>,
) -> Result<CorrelationTest, DiagnosticsError> {
    let n = fitted.len();
    if n != residuals.len() {
        return Err(DiagnosticsError::LengthMismatch(n, residuals.len()));
    }
    if n < 3 {
        return Err(DiagnosticsError::TooFewObservations {
            found: n,
            required: 3,
        });
    }
    let r = pearson_correlation(fitted, residuals);
    let df = (n - 2) as f64;
    // Clamp away from |r| = 1 so the statistic stays finite.
    let r_clamped = r.clamp(-1.0 + 1e-12, 1.0 - 1e-12);
    let statistic = r_clamped * (df / (1.0 - r_clamped * r_clamped)).sqrt();
    let p_value = two_sided_t(statistic, df);
    Ok(CorrelationTest {
        correlation: r,
        statistic,
        df,
        p_value,
    })
}

/// OLS of the observed response on the fitted value and its square.
pub fn link_test(
    observed: ArrayView1<f64>,
    fitted: ArrayView1<f64>,
) -> Result<LinkTest, DiagnosticsError> {
    let n = observed.len();
    if n != fitted.len() {
        return Err(DiagnosticsError::LengthMismatch(n, fitted.len()));
    }
    if n < 4 {
        return Err(DiagnosticsError::TooFewObservations {
            found: n,
            required: 4,
        });
    }

    let mut x = Array2::<f64>::zeros((n, 3));
    for i in 0..n {
        x[[i, 0]] = 1.0;
        x[[i, 1]] = fitted[i];
        x[[i, 2]] = fitted[i] * fitted[i];
    }
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&observed);
    let beta = xtx
        .solve_into(xty)
        .map_err(|_| DiagnosticsError::DegenerateFittedValues)?;
    let xtx_inv = invert_3x3_via_solves(&xtx)?;

    let residuals = &observed - &x.dot(&beta);
    let df = (n - 3) as f64;
    let sigma2 = residuals.dot(&residuals) / df;

    let term = |j: usize| {
        let se = (sigma2 * xtx_inv[[j, j]]).max(0.0).sqrt();
        let statistic = if se > 0.0 { beta[j] / se } else { f64::INFINITY };
        LinkTestTerm {
            estimate: beta[j],
            std_error: se,
            statistic,
            p_value: two_sided_t(statistic, df),
        }
    };
    Ok(LinkTest {
        linear: term(1),
        quadratic: term(2),
    })
}

/// Grouped fit test over `g` groups of ranked fitted values. `unit_variances`
/// holds the estimated variance of each observation's weighted contribution,
/// dispersion * V(mu_i); weights enter the totals as w_i y_i vs w_i mu_i and
/// the variance as w_i^2 * unit variance.
pub fn grouped_fit_test(
    observed: ArrayView1<f64>,
    fitted: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    family: &Tweedie,
    dispersion: f64,
    groups: usize,
) -> Result<GroupedFitTest, DiagnosticsError> {
    let n = observed.len();
    if n != fitted.len() || n != weights.len() {
        return Err(DiagnosticsError::LengthMismatch(n, fitted.len()));
    }
    if groups < 3 {
        return Err(DiagnosticsError::TooFewGroups(groups));
    }
    if n < groups {
        return Err(DiagnosticsError::TooFewObservations {
            found: n,
            required: groups,
        });
    }

    // Deterministic group assignment: stable sort by fitted value, ties kept
    // in row order.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        fitted[a]
            .partial_cmp(&fitted[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut observed_totals = vec![0.0; groups];
    let mut expected_totals = vec![0.0; groups];
    let mut variance_totals = vec![0.0; groups];
    for (rank, &row) in order.iter().enumerate() {
        let group = rank * groups / n;
        let w = weights[row];
        observed_totals[group] += w * observed[row];
        expected_totals[group] += w * fitted[row];
        variance_totals[group] += w * w * dispersion * family.variance(fitted[row]);
    }

    let mut statistic = 0.0;
    for (group, (&o, &e, &v)) in
        izip!(&observed_totals, &expected_totals, &variance_totals).enumerate()
    {
        if v <= 0.0 {
            return Err(DiagnosticsError::GroupedFitUndefined { group, variance: v });
        }
        let d = o - e;
        statistic += d * d / v;
    }

    let df = (groups - 2) as f64;
    let p_value = chi_squared_survival(statistic, df);
    Ok(GroupedFitTest {
        statistic,
        df,
        p_value,
        groups,
        observed: observed_totals,
        expected: expected_totals,
    })
}

fn pearson_correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        0.0
    } else {
        cov / (var_a.sqrt() * var_b.sqrt())
    }
}

fn invert_3x3_via_solves(a: &Array2<f64>) -> Result<Array2<f64>, DiagnosticsError> {
    let p = a.nrows();
    let mut inv = Array2::<f64>::zeros((p, p));
    for j in 0..p {
        let mut e = Array1::<f64>::zeros(p);
        e[j] = 1.0;
        let col = a
            .solve_into(e)
            .map_err(|_| DiagnosticsError::DegenerateFittedValues)?;
        for i in 0..p {
            inv[[i, j]] = col[i];
        }
    }
    Ok(inv)
}

fn two_sided_t(statistic: f64, df: f64) -> f64 {
    if !statistic.is_finite() {
        return 0.0;
    }
    let dist = StudentsT::new(0.0, 1.0, df).expect("positive degrees of freedom");
    (2.0 * dist.cdf(-statistic.abs())).clamp(0.0, 1.0)
}

fn chi_squared_survival(statistic: f64, df: f64) -> f64 {
    let dist = ChiSquared::new(df).expect("positive degrees of freedom");
    (1.0 - dist.cdf(statistic)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn correlation_of_orthogonal_residuals_is_near_zero() {
        // Residuals alternate sign independently of the fitted trend.
        let fitted = Array1::from_iter((0..100).map(|i| i as f64));
        let residuals = Array1::from_iter((0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }));
        let test = correlation_test(fitted.view(), residuals.view()).unwrap();
        assert!(test.correlation.abs() < 0.05);
        assert!(test.p_value > 0.05);
    }

    #[test]
    fn correlation_detects_a_linear_trend() {
        let fitted = Array1::from_iter((0..50).map(|i| i as f64));
        let residuals = fitted.mapv(|f| 0.5 * f - 10.0);
        let test = correlation_test(fitted.view(), residuals.view()).unwrap();
        assert!(test.correlation > 0.99);
        assert!(test.p_value < 1e-6);
    }

    #[test]
    fn link_test_flags_quadratic_misfit() {
        // Observed response is a strongly curved function of the fitted value.
        let fitted = Array1::from_iter((1..=60).map(|i| i as f64 / 10.0));
        let observed = fitted.mapv(|f| 2.0 + 0.5 * f + 3.0 * f * f);
        let test = link_test(observed.view(), fitted.view()).unwrap();
        assert_abs_diff_eq!(test.quadratic.estimate, 3.0, epsilon = 1e-8);
        assert!(test.quadratic.p_value < 1e-6);
    }

    #[test]
    fn link_test_passes_a_linear_relationship() {
        let fitted = Array1::from_iter((1..=60).map(|i| i as f64 / 10.0));
        // y = mu exactly: the quadratic term estimate is zero.
        let test = link_test(fitted.view(), fitted.view()).unwrap();
        assert_abs_diff_eq!(test.quadratic.estimate, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn grouped_fit_assignment_is_deterministic_under_ties() {
        // All fitted values identical: ties broken by row order, every run.
        let n = 30;
        let fitted = Array1::from_elem(n, 5.0);
        let observed = Array1::from_iter((0..n).map(|i| 4.0 + (i % 3) as f64));
        let weights = Array1::ones(n);
        let family = Tweedie::gamma_identity();
        let a = grouped_fit_test(observed.view(), fitted.view(), weights.view(), &family, 1.0, 10)
            .unwrap();
        let b = grouped_fit_test(observed.view(), fitted.view(), weights.view(), &family, 1.0, 10)
            .unwrap();
        assert_eq!(a.observed, b.observed);
        assert_eq!(a.expected, b.expected);
        assert_abs_diff_eq!(a.statistic, b.statistic);
        // 30 rows into 10 groups of 3, in row order.
        assert_abs_diff_eq!(a.observed[0], 4.0 + 5.0 + 6.0, epsilon = 1e-12);
    }

    #[test]
    fn grouped_fit_requires_enough_groups() {
        let fitted = Array1::from_elem(10, 1.0);
        let weights = Array1::ones(10);
        let family = Tweedie::gamma_identity();
        let err = grouped_fit_test(fitted.view(), fitted.view(), weights.view(), &family, 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::TooFewGroups(2)));
    }

    #[test]
    fn grouped_fit_is_small_for_a_perfect_fit() {
        let fitted = Array1::from_iter((1..=50).map(|i| i as f64));
        let weights = Array1::ones(50);
        let family = Tweedie::gamma_identity();
        let test = grouped_fit_test(
            fitted.view(),
            fitted.view(),
            weights.view(),
            &family,
            1.0,
            10,
        )
        .unwrap();
        assert_abs_diff_eq!(test.statistic, 0.0, epsilon = 1e-12);
        assert!(test.p_value > 0.99);
        assert_abs_diff_eq!(test.df, 8.0);
    }
}

//! Human-facing tabulation of the fit, diagnostics, and marginal effects.
//!
//! Rendering is plain text; the interaction plot of the governing analysis is
//! represented by its tabular equivalent (predicted expenditure per
//! poverty-by-gender cell with design-based error bars).

use crate::diagnostics::{CorrelationTest, GroupedFitTest, LinkTest};
use crate::margins::MarginalEffects;
use crate::model::{counterfactual_row, FittedModel, ModelError};
use crate::recode::{Gender, PovertyCategory};
use ndarray::Array2;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt::Write as _;

/// Significance stars in the conventional coding.
pub fn significance_stars(p_value: f64) -> &'static str {
    if p_value < 0.001 {
        "***"
    } else if p_value < 0.01 {
        "**"
    } else if p_value < 0.05 {
        "*"
    } else if p_value < 0.1 {
        "."
    } else {
        ""
    }
}

/// Coefficient table: term, estimate, design SE, 95% CI, z, p, stars.
pub fn coefficient_table(model: &FittedModel) -> String {
    let se = model.standard_errors();
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    let z975 = normal.inverse_cdf(0.975);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:>12} {:>11} {:>12} {:>12} {:>8} {:>9}  ",
        "Term", "Estimate", "Std.Error", "CI lower", "CI upper", "z", "Pr(>|z|)"
    );
    for (j, term) in model.terms.iter().enumerate() {
        let b = model.coefficients[j];
        let s = se[j];
        let z = if s > 0.0 { b / s } else { f64::NAN };
        let p = if z.is_finite() {
            2.0 * normal.cdf(-z.abs())
        } else {
            f64::NAN
        };
        let _ = writeln!(
            out,
            "{:<24} {:>12.2} {:>11.2} {:>12.2} {:>12.2} {:>8.3} {:>9.4} {}",
            term,
            b,
            s,
            b - z975 * s,
            b + z975 * s,
            z,
            p,
            significance_stars(p)
        );
    }
    let _ = writeln!(
        out,
        "\nDeviance: {:.2}   Dispersion: {:.4}   Iterations: {}   Design df: {:.0}",
        model.deviance, model.dispersion, model.iterations, model.design_df
    );
    out
}

/// The three goodness-of-fit reports.
pub fn diagnostics_report(
    correlation: &CorrelationTest,
    link: &LinkTest,
    grouped: &GroupedFitTest,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Goodness-of-fit diagnostics");
    let _ = writeln!(
        out,
        "  Fitted-residual correlation: r = {:.4}, t = {:.3} (df {:.0}), p = {:.4}",
        correlation.correlation, correlation.statistic, correlation.df, correlation.p_value
    );
    let _ = writeln!(
        out,
        "  Link test: fitted {:.4} (p = {:.4}), fitted^2 {:.6} (p = {:.4})",
        link.linear.estimate, link.linear.p_value, link.quadratic.estimate, link.quadratic.p_value
    );
    let _ = writeln!(
        out,
        "  Grouped fit ({} groups): chi2 = {:.3} (df {:.0}), p = {:.4}",
        grouped.groups, grouped.statistic, grouped.df, grouped.p_value
    );
    out
}

/// Marginal-effects table: level vs reference, gender stratum, AME, CI.
pub fn marginal_effects_table(margins: &MarginalEffects, reference: PovertyCategory) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Average marginal effects vs {} ({:.0}% CI)",
        reference.label(),
        margins.confidence_level * 100.0
    );
    let _ = writeln!(
        out,
        "{:<14} {:<8} {:>12} {:>11} {:>12} {:>12}",
        "Level", "Gender", "AME", "Std.Error", "CI lower", "CI upper"
    );
    for effect in &margins.effects {
        let _ = writeln!(
            out,
            "{:<14} {:<8} {:>12.2} {:>11.2} {:>12.2} {:>12.2}",
            effect.level.label(),
            effect.gender.label(),
            effect.estimate,
            effect.std_error,
            effect.ci_lower,
            effect.ci_upper
        );
    }
    out
}

/// Predicted expenditure per (poverty, gender) cell with design SEs: the
/// tabular form of the interaction plot.
pub fn interaction_profile(model: &FittedModel) -> Result<String, ModelError> {
    let mut out = String::new();
    let _ = writeln!(out, "Predicted expenditure by poverty category and gender");
    let _ = writeln!(
        out,
        "{:<14} {:<8} {:>12} {:>11}",
        "Level", "Gender", "Predicted", "Std.Error"
    );
    for gender in [Gender::Male, Gender::Female] {
        for level in PovertyCategory::ALL {
            let row = counterfactual_row(level, gender, model.spec.reference);
            let p = row.len();
            let x = Array2::from_shape_vec((1, p), row.to_vec()).expect("row-shaped matrix");
            let (mu, se) = model.predict_with_se(x.view())?;
            let _ = writeln!(
                out,
                "{:<14} {:<8} {:>12.2} {:>11.2}",
                level.label(),
                gender.label(),
                mu[0],
                se[0]
            );
        }
    }
    Ok(out)
}

//! Model specification, model-matrix expansion, and the fitted-model object.
//!
//! The linear predictor is fixed by the analysis design:
//! `totexp ~ gender + povcat + gender:povcat`, expanded into an intercept,
//! the gender indicator, one dummy per non-reference poverty level, and one
//! interaction dummy per non-reference level. The reference level is
//! configurable so the reparameterization-invariance of downstream contrasts
//! can be exercised.

use crate::family::Tweedie;
use crate::recode::{Gender, PovertyCategory};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read/write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction matrix has {found} columns but the model has {expected} coefficients")]
    CoefficientMismatch { found: usize, expected: usize },
}

/// Configuration of a single model fit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Reference level for the poverty factor; contributes no dummy column.
    pub reference: PovertyCategory,
    pub max_iterations: usize,
    /// Convergence tolerance on the relative coefficient change.
    pub tolerance: f64,
    pub family: Tweedie,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            family: Tweedie::gamma_identity(),
            reference: PovertyCategory::Poor,
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

/// A model matrix with its column names, aligned index-for-index.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub x: Array2<f64>,
    pub terms: Vec<String>,
}

/// Non-reference poverty levels in declaration order, for a given reference.
pub fn non_reference_levels(reference: PovertyCategory) -> Vec<PovertyCategory> {
    PovertyCategory::ALL
        .into_iter()
        .filter(|&level| level != reference)
        .collect()
}

/// Expand gender and poverty category into the interaction model matrix:
/// intercept, gender, 4 poverty dummies, 4 gender x poverty dummies.
pub fn build_design_matrix(
    gender: ArrayView1<f64>,
    poverty: &[PovertyCategory],
    reference: PovertyCategory,
) -> DesignMatrix {
    let n = gender.len();
    debug_assert_eq!(n, poverty.len());
    let levels = non_reference_levels(reference);
    let p = 2 + 2 * levels.len();

    let mut x = Array2::<f64>::zeros((n, p));
    for i in 0..n {
        x[[i, 0]] = 1.0;
        x[[i, 1]] = gender[i];
        for (k, &level) in levels.iter().enumerate() {
            if poverty[i] == level {
                x[[i, 2 + k]] = 1.0;
                x[[i, 2 + levels.len() + k]] = gender[i];
            }
        }
    }

    let mut terms = Vec::with_capacity(p);
    terms.push("(Intercept)".to_string());
    terms.push("gender".to_string());
    for &level in &levels {
        terms.push(format!("povcat{}", level.label()));
    }
    for &level in &levels {
        terms.push(format!("gender:povcat{}", level.label()));
    }
    DesignMatrix { x, terms }
}

/// A single counterfactual model-matrix row: every respondent assigned the
/// given poverty level and gender value. Used by the marginal-effects
/// estimator and the interaction profile.
pub fn counterfactual_row(
    level: PovertyCategory,
    gender: Gender,
    reference: PovertyCategory,
) -> Array1<f64> {
    let levels = non_reference_levels(reference);
    let p = 2 + 2 * levels.len();
    let g = gender.indicator();
    let mut row = Array1::<f64>::zeros(p);
    row[0] = 1.0;
    row[1] = g;
    for (k, &l) in levels.iter().enumerate() {
        if l == level {
            row[2 + k] = 1.0;
            row[2 + levels.len() + k] = g;
        }
    }
    row
}

/// The result of a design-weighted GLM fit. Created once by the fitter and
/// read-only thereafter; the covariance is the design-adjusted (Taylor
/// linearized) one, never the naive IRLS covariance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub terms: Vec<String>,
    /// Quasi-deviance at convergence.
    pub deviance: f64,
    /// Pearson dispersion estimate.
    pub dispersion: f64,
    pub iterations: usize,
    pub converged: bool,
    pub n_obs: usize,
    /// Design degrees of freedom (PSUs minus strata).
    pub design_df: f64,
    pub spec: ModelSpec,
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl FittedModel {
    pub fn n_params(&self) -> usize {
        self.coefficients.len()
    }

    /// Design-based standard errors, from the diagonal of the covariance.
    pub fn standard_errors(&self) -> Array1<f64> {
        Array1::from_iter((0..self.n_params()).map(|j| self.covariance[[j, j]].max(0.0).sqrt()))
    }

    pub fn linear_predictor(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.n_params() {
            return Err(ModelError::CoefficientMismatch {
                found: x.ncols(),
                expected: self.n_params(),
            });
        }
        Ok(x.dot(&self.coefficients))
    }

    /// Fitted means for the given model-matrix rows.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let eta = self.linear_predictor(x)?;
        Ok(eta.mapv(|e| self.spec.family.inverse_link(e)))
    }

    /// Fitted means with delta-method standard errors propagated through the
    /// design-adjusted coefficient covariance.
    pub fn predict_with_se(
        &self,
        x: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), ModelError> {
        let eta = self.linear_predictor(x)?;
        let mu = eta.mapv(|e| self.spec.family.inverse_link(e));
        let mut se = Array1::<f64>::zeros(x.nrows());
        for i in 0..x.nrows() {
            let xi = x.row(i);
            let var_eta = xi.dot(&self.covariance.dot(&xi));
            se[i] = self.spec.family.mu_eta(eta[i]).abs() * var_eta.max(0.0).sqrt();
        }
        Ok((mu, se))
    }

    /// Saves the fitted model as a TOML document.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

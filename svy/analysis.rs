//! The ordered analysis pipeline: recode -> design -> fit -> diagnostics ->
//! marginal effects.
//!
//! Each stage is a pure function consuming the previous stage's typed output;
//! there is no shared mutable state and a failure at any stage aborts the run.

use crate::data::SurveyData;
use crate::design::{DesignError, LonelyPsu, SurveyDesign};
use crate::diagnostics::{
    correlation_test, grouped_fit_test, link_test, CorrelationTest, DiagnosticsError,
    GroupedFitTest, LinkTest,
};
use crate::family::Tweedie;
use crate::fit::{fit_glm, FitError};
use crate::margins::{average_marginal_effects, MarginalEffects, MarginsError};
use crate::model::{build_design_matrix, FittedModel, ModelError, ModelSpec};
use crate::recode::{recode, DomainViolation, PovertyCategory};
use ndarray::Array1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Domain(#[from] DomainViolation),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Margins(#[from] MarginsError),
}

/// Configuration of a full pipeline run.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisOptions {
    pub family: Tweedie,
    pub reference: PovertyCategory,
    /// Public-use survey extracts routinely contain single-PSU strata, so
    /// this pipeline defaults to `Adjust`.
    pub lonely_psu: LonelyPsu,
    /// Group count for the grouped fit test.
    pub groups: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            family: Tweedie::gamma_identity(),
            reference: PovertyCategory::Poor,
            lonely_psu: LonelyPsu::Adjust,
            groups: 10,
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

/// Everything a pipeline run produces. All entities are created once and
/// read-only thereafter.
#[derive(Debug)]
pub struct Analysis {
    pub model: FittedModel,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub correlation: CorrelationTest,
    pub link: LinkTest,
    pub grouped: GroupedFitTest,
    pub margins: MarginalEffects,
}

/// Run the whole pipeline over a validated survey extract.
pub fn run_analysis(
    data: &SurveyData,
    options: &AnalysisOptions,
) -> Result<Analysis, AnalysisError> {
    log::info!("Recoding variables for {} respondents.", data.n_rows());
    let recoded = recode(&data.sex, &data.povcat)?;

    let design = SurveyDesign::new(
        &data.stratum,
        &data.psu,
        data.weight.clone(),
        options.lonely_psu,
    )?;
    log::info!(
        "Survey design: {} strata, {} PSUs, design df {:.0}.",
        design.n_strata(),
        design.n_psus(),
        design.degrees_of_freedom()
    );

    let dm = build_design_matrix(
        recoded.gender_indicator.view(),
        &recoded.poverty,
        options.reference,
    );
    let spec = ModelSpec {
        family: options.family,
        reference: options.reference,
        max_iterations: options.max_iterations,
        tolerance: options.tolerance,
    };
    let model = fit_glm(&design, &dm, data.totexp.view(), &spec)?;

    let fitted = model.predict(dm.x.view())?;
    let residuals = &data.totexp - &fitted;

    let correlation = correlation_test(fitted.view(), residuals.view())?;
    let link = link_test(data.totexp.view(), fitted.view())?;
    let grouped = grouped_fit_test(
        data.totexp.view(),
        fitted.view(),
        design.weights(),
        &model.spec.family,
        model.dispersion,
        options.groups,
    )?;

    let margins = average_marginal_effects(&model, &design)?;

    Ok(Analysis {
        model,
        fitted,
        residuals,
        correlation,
        link,
        grouped,
        margins,
    })
}

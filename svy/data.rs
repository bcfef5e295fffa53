//! # Data Loading and Validation
//!
//! Exclusive entry point for the survey extract. Reads a tab-separated file,
//! validates it against the fixed schema (`id`, `weight`, `stratum`, `psu`,
//! `totexp`, `sex`, `povcat` — column names are not configurable), and
//! converts it into the `ndarray` structures consumed by the statistical
//! core. Failures are assumed to be user-input errors and each failure mode
//! has its own `DataError` variant with actionable wording.

use ndarray::Array1;
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const REQUIRED_COLUMNS: [&str; 7] = ["id", "weight", "stratum", "psu", "totexp", "sex", "povcat"];
const MINIMUM_ROWS: usize = 20;

/// A container for validated respondent data, one entry per row across all
/// fields. Created once and read-only thereafter.
#[derive(Debug, Clone)]
pub struct SurveyData {
    pub id: Vec<i64>,
    /// Final survey weights, strictly positive.
    pub weight: Array1<f64>,
    /// Stratum identifiers.
    pub stratum: Vec<i64>,
    /// Primary sampling unit identifiers, nested within stratum.
    pub psu: Vec<i64>,
    /// Total annual expenditure, >= 0.
    pub totexp: Array1<f64>,
    /// Raw sex code (1/2); recoded downstream.
    pub sex: Array1<f64>,
    /// Raw poverty category code (1..5); recoded downstream.
    pub povcat: Array1<f64>,
}

impl SurveyData {
    pub fn n_rows(&self) -> usize {
        self.id.len()
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This pipeline requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'."
    )]
    NonFiniteValuesFound(String),
    #[error(
        "Input file contains only {found} data rows, but at least {required} are required for a stable fit."
    )]
    InsufficientRows { found: usize, required: usize },
    #[error("Non-positive survey weight {value} at row {row}; weights must be > 0.")]
    NonPositiveWeight { row: usize, value: f64 },
    #[error("Negative expenditure {value} at row {row}; 'totexp' must be >= 0.")]
    NegativeExpenditure { row: usize, value: f64 },
    #[error(
        "The column '{column_name}' must contain integer identifiers; found non-integral value {value} at row {row}."
    )]
    NonIntegralIdentifier {
        column_name: &'static str,
        row: usize,
        value: f64,
    },
}

/// Loads and validates the survey extract from a tab-separated file.
pub fn load_survey_data(path: &str) -> Result<SurveyData, DataError> {
    log::info!("Loading survey data from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    if df.height() < MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: MINIMUM_ROWS,
        });
    }

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for col_name in REQUIRED_COLUMNS {
        if !columns_set.contains(col_name) {
            return Err(DataError::ColumnNotFound(col_name.to_string()));
        }
    }

    let id = extract_integer_column(&df, "id")?;
    let stratum = extract_integer_column(&df, "stratum")?;
    let psu = extract_integer_column(&df, "psu")?;
    let weight_vec = extract_numeric_column(&df, "weight")?;
    let totexp_vec = extract_numeric_column(&df, "totexp")?;
    let sex = Array1::from_vec(extract_numeric_column(&df, "sex")?);
    let povcat = Array1::from_vec(extract_numeric_column(&df, "povcat")?);

    for (row, &w) in weight_vec.iter().enumerate() {
        if w <= 0.0 {
            return Err(DataError::NonPositiveWeight { row, value: w });
        }
    }
    for (row, &e) in totexp_vec.iter().enumerate() {
        if e < 0.0 {
            return Err(DataError::NegativeExpenditure { row, value: e });
        }
    }

    log::info!(
        "Loaded {} respondents; all required columns validated.",
        df.height()
    );

    Ok(SurveyData {
        id,
        weight: Array1::from_vec(weight_vec),
        stratum,
        psu,
        totexp: Array1::from_vec(totexp_vec),
        sex,
        povcat,
    })
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    // A cast that fails outright, or that smuggles in nulls, both mean the
    // column was never numeric.
    let casted = series
        .cast(&DataType::Float64)
        .ok()
        .filter(|c| c.null_count() == 0)
        .ok_or_else(|| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;

    let chunked = casted.f64()?.rechunk();
    let mut values = Vec::with_capacity(chunked.len());
    for v in chunked.into_no_null_iter() {
        if !v.is_finite() {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        values.push(v);
    }
    Ok(values)
}

fn extract_integer_column(df: &DataFrame, column_name: &'static str) -> Result<Vec<i64>, DataError> {
    let values = extract_numeric_column(df, column_name)?;
    values
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            if v.fract() == 0.0 {
                Ok(v as i64)
            } else {
                Err(DataError::NonIntegralIdentifier {
                    column_name,
                    row,
                    value: v,
                })
            }
        })
        .collect()
}

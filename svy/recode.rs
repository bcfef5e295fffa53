//! Variable recoding with explicit enumerated domains.
//!
//! The source survey codes sex as 1/2 and poverty category as 1..5. Rather
//! than relying on runtime factor inference, both variables get a declared
//! domain here and any out-of-range code is rejected with a `DomainViolation`
//! naming the column, row, and offending value. Recoding is a pure per-row
//! transformation with no cross-row dependency.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "Out-of-domain value {value} in column '{column}' at row {row} (expected one of {expected})"
)]
pub struct DomainViolation {
    pub column: &'static str,
    pub row: usize,
    pub value: f64,
    pub expected: &'static str,
}

/// Binary gender indicator derived from the survey `sex` code (1 -> Male = 0,
/// 2 -> Female = 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn from_sex_code(code: f64) -> Option<Self> {
        if code == 1.0 {
            Some(Gender::Male)
        } else if code == 2.0 {
            Some(Gender::Female)
        } else {
            None
        }
    }

    /// The 0/1 indicator used in the model matrix.
    pub fn indicator(self) -> f64 {
        match self {
            Gender::Male => 0.0,
            Gender::Female => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
        }
    }
}

/// The five-level poverty category of the survey extract, coded 1..5.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PovertyCategory {
    Poor,
    NearPoor,
    LowIncome,
    MiddleIncome,
    HighIncome,
}

impl PovertyCategory {
    pub const ALL: [PovertyCategory; 5] = [
        PovertyCategory::Poor,
        PovertyCategory::NearPoor,
        PovertyCategory::LowIncome,
        PovertyCategory::MiddleIncome,
        PovertyCategory::HighIncome,
    ];

    pub fn from_code(code: f64) -> Option<Self> {
        match code as i64 {
            1 if code == 1.0 => Some(PovertyCategory::Poor),
            2 if code == 2.0 => Some(PovertyCategory::NearPoor),
            3 if code == 3.0 => Some(PovertyCategory::LowIncome),
            4 if code == 4.0 => Some(PovertyCategory::MiddleIncome),
            5 if code == 5.0 => Some(PovertyCategory::HighIncome),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PovertyCategory::Poor => 1,
            PovertyCategory::NearPoor => 2,
            PovertyCategory::LowIncome => 3,
            PovertyCategory::MiddleIncome => 4,
            PovertyCategory::HighIncome => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PovertyCategory::Poor => "Poor",
            PovertyCategory::NearPoor => "NearPoor",
            PovertyCategory::LowIncome => "LowIncome",
            PovertyCategory::MiddleIncome => "MiddleIncome",
            PovertyCategory::HighIncome => "HighIncome",
        }
    }
}

/// The derived categorical columns consumed by the model matrix builder.
#[derive(Debug, Clone)]
pub struct RecodedVariables {
    pub gender: Vec<Gender>,
    /// 0/1 indicator form of `gender`, aligned row-for-row.
    pub gender_indicator: Array1<f64>,
    pub poverty: Vec<PovertyCategory>,
}

/// Recode the raw sex and poverty-category codes into their declared domains.
pub fn recode(sex: &Array1<f64>, povcat: &Array1<f64>) -> Result<RecodedVariables, DomainViolation> {
    let gender = recode_gender(sex)?;
    let poverty = recode_poverty(povcat)?;
    let gender_indicator = Array1::from_iter(gender.iter().map(|g| g.indicator()));
    Ok(RecodedVariables {
        gender,
        gender_indicator,
        poverty,
    })
}

/// sex 1 -> gender 0, sex 2 -> gender 1. Anything else is rejected.
pub fn recode_gender(sex: &Array1<f64>) -> Result<Vec<Gender>, DomainViolation> {
    sex.iter()
        .enumerate()
        .map(|(row, &code)| {
            Gender::from_sex_code(code).ok_or(DomainViolation {
                column: "sex",
                row,
                value: code,
                expected: "{1, 2}",
            })
        })
        .collect()
}

/// povcat codes 1..5 into the five named levels. Anything else is rejected.
pub fn recode_poverty(povcat: &Array1<f64>) -> Result<Vec<PovertyCategory>, DomainViolation> {
    povcat
        .iter()
        .enumerate()
        .map(|(row, &code)| {
            PovertyCategory::from_code(code).ok_or(DomainViolation {
                column: "povcat",
                row,
                value: code,
                expected: "{1, 2, 3, 4, 5}",
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sex_codes_map_to_gender_indicator() {
        let sex = array![1.0, 2.0, 2.0, 1.0];
        let povcat = array![1.0, 2.0, 3.0, 5.0];
        let recoded = recode(&sex, &povcat).unwrap();
        assert_eq!(recoded.gender_indicator, array![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(recoded.gender[0], Gender::Male);
        assert_eq!(recoded.gender[1], Gender::Female);
        assert!(recoded
            .gender_indicator
            .iter()
            .all(|&g| g == 0.0 || g == 1.0));
    }

    #[test]
    fn out_of_domain_sex_is_rejected() {
        let sex = array![1.0, 3.0];
        let err = recode_gender(&sex).unwrap_err();
        assert_eq!(err.column, "sex");
        assert_eq!(err.row, 1);
        assert_eq!(err.value, 3.0);
    }

    #[test]
    fn out_of_domain_povcat_is_rejected() {
        let povcat = array![1.0, 2.0, 0.0];
        let err = recode_poverty(&povcat).unwrap_err();
        assert_eq!(err.column, "povcat");
        assert_eq!(err.row, 2);
    }

    #[test]
    fn fractional_codes_are_rejected() {
        let povcat = array![1.5];
        assert!(recode_poverty(&povcat).is_err());
        let sex = array![1.2];
        assert!(recode_gender(&sex).is_err());
    }

    #[test]
    fn poverty_levels_round_trip_codes() {
        for level in PovertyCategory::ALL {
            assert_eq!(
                PovertyCategory::from_code(level.code() as f64),
                Some(level)
            );
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of RIF extract file, in load order.
///
/// Declaration order is the tie-break ordinal used when sorting a data set.
/// Claims reference beneficiaries by foreign key, so [`Beneficiary`] files
/// always load first.
///
/// [`Beneficiary`]: RifFileType::Beneficiary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RifFileType {
    Beneficiary,
    BeneficiaryHistory,
    MedicareBeneficiaryIdHistory,
    Pde,
    Carrier,
    Inpatient,
    Outpatient,
    Hospice,
    Hha,
    Dme,
    Snf,
}

impl RifFileType {
    pub const ALL: [RifFileType; 11] = [
        RifFileType::Beneficiary,
        RifFileType::BeneficiaryHistory,
        RifFileType::MedicareBeneficiaryIdHistory,
        RifFileType::Pde,
        RifFileType::Carrier,
        RifFileType::Inpatient,
        RifFileType::Outpatient,
        RifFileType::Hospice,
        RifFileType::Hha,
        RifFileType::Dme,
        RifFileType::Snf,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Whether files of this type must load before any other type.
    pub fn must_process_first(self) -> bool {
        self == RifFileType::Beneficiary
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RifFileType::Beneficiary => "BENEFICIARY",
            RifFileType::BeneficiaryHistory => "BENEFICIARY_HISTORY",
            RifFileType::MedicareBeneficiaryIdHistory => "MEDICARE_BENEFICIARY_ID_HISTORY",
            RifFileType::Pde => "PDE",
            RifFileType::Carrier => "CARRIER",
            RifFileType::Inpatient => "INPATIENT",
            RifFileType::Outpatient => "OUTPATIENT",
            RifFileType::Hospice => "HOSPICE",
            RifFileType::Hha => "HHA",
            RifFileType::Dme => "DME",
            RifFileType::Snf => "SNF",
        }
    }
}

impl fmt::Display for RifFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown RIF file type: {0}")]
pub struct UnknownFileType(pub String);

impl FromStr for RifFileType {
    type Err = UnknownFileType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RifFileType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownFileType(s.to_string()))
    }
}

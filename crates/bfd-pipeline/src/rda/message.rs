use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Claim families carried by the change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    /// Fiscal Intermediary Shared System (institutional claims)
    Fiss,
    /// Multi-Carrier System (professional claims)
    Mcs,
}

impl ClaimType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimType::Fiss => "fiss",
            ClaimType::Mcs => "mcs",
        }
    }
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fiss" => Ok(ClaimType::Fiss),
            "mcs" => Ok(ClaimType::Mcs),
            other => Err(format!("unknown claim type: {other}")),
        }
    }
}

/// One decoded message from the claims-change stream.
///
/// `claim_type` stays a string so unknown families reach the transformer and
/// are rejected there rather than failing the whole stream decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimChange {
    pub sequence: i64,
    pub change_type: ChangeType,
    pub claim_type: String,
    #[serde(default)]
    pub claim_id: Option<String>,
    /// Medicare beneficiary identifier, hashed before it is stored
    #[serde(default)]
    pub mbi: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_minimal_change() {
        let change: ClaimChange = serde_json::from_value(json!({
            "sequence": 12,
            "change_type": "UPDATE",
            "claim_type": "fiss",
            "claim_id": "F-1"
        }))
        .unwrap();

        assert_eq!(change.sequence, 12);
        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(change.mbi, None);
        assert_eq!(change.payload, Value::Null);
    }

    #[test]
    fn test_claim_type_parse() {
        assert_eq!("FISS".parse::<ClaimType>().unwrap(), ClaimType::Fiss);
        assert_eq!(" mcs ".parse::<ClaimType>().unwrap(), ClaimType::Mcs);
        assert!("dme".parse::<ClaimType>().is_err());
    }
}

use super::message::{ChangeType, ClaimChange, ClaimType};
use bfd_common::hashing::CachedIdHasher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("unsupported claim change at sequence {sequence}: {reason}")]
    Unsupported { sequence: i64, reason: String },

    #[error("failed to hash beneficiary identifier at sequence {sequence}: {message}")]
    Hashing { sequence: i64, message: String },
}

/// A claim ready for the destination store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedClaim {
    pub sequence: i64,
    pub claim_type: ClaimType,
    pub claim_id: String,
    pub change_type: ChangeType,
    /// Pseudonymised MBI; the raw value never leaves the transformer
    pub mbi_hash: Option<String>,
    /// Taken from the change; absent when the stream did not say
    pub last_updated: Option<DateTime<Utc>>,
    pub payload: Value,
}

#[derive(Clone)]
pub struct ClaimTransformer {
    hasher: Arc<CachedIdHasher>,
}

impl ClaimTransformer {
    pub fn new(hasher: Arc<CachedIdHasher>) -> Self {
        Self { hasher }
    }

    pub fn hasher(&self) -> &CachedIdHasher {
        &self.hasher
    }

    pub fn transform(&self, change: &ClaimChange) -> Result<TransformedClaim, TransformError> {
        let unsupported = |reason: String| TransformError::Unsupported {
            sequence: change.sequence,
            reason,
        };

        let claim_type: ClaimType = change.claim_type.parse().map_err(unsupported)?;
        let claim_id = change
            .claim_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| unsupported("missing claim id".to_string()))?;

        let mbi_hash = match change.mbi.as_deref().map(str::trim) {
            Some(mbi) if !mbi.is_empty() => {
                Some(self.hasher.hash(mbi).map_err(|e| TransformError::Hashing {
                    sequence: change.sequence,
                    message: e.to_string(),
                })?)
            },
            _ => None,
        };

        Ok(TransformedClaim {
            sequence: change.sequence,
            claim_type,
            claim_id: claim_id.to_string(),
            change_type: change.change_type,
            mbi_hash,
            last_updated: change.timestamp,
            payload: change.payload.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bfd_common::hashing::IdHasher;
    use serde_json::json;

    fn transformer() -> ClaimTransformer {
        let hasher = IdHasher::new(b"test-pepper".to_vec(), 10).unwrap();
        ClaimTransformer::new(Arc::new(CachedIdHasher::new(hasher, 100)))
    }

    fn change(claim_type: &str, claim_id: Option<&str>, mbi: Option<&str>) -> ClaimChange {
        ClaimChange {
            sequence: 7,
            change_type: ChangeType::Insert,
            claim_type: claim_type.to_string(),
            claim_id: claim_id.map(String::from),
            mbi: mbi.map(String::from),
            timestamp: None,
            payload: json!({"amount": 10}),
        }
    }

    #[test]
    fn test_mbi_is_hashed() {
        let t = transformer();
        let claim = t.transform(&change("fiss", Some("F-1"), Some("1S00E00AA00"))).unwrap();

        let hash = claim.mbi_hash.unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("1S00E00AA00"));
        assert!(!serde_json::to_string(&claim.payload).unwrap().contains("1S00E00AA00"));
        assert_eq!(claim.claim_type, ClaimType::Fiss);
    }

    #[test]
    fn test_same_mbi_same_hash_and_cached() {
        let t = transformer();
        let a = t.transform(&change("mcs", Some("M-1"), Some("MBI1"))).unwrap();
        let b = t.transform(&change("mcs", Some("M-2"), Some("MBI1"))).unwrap();

        assert_eq!(a.mbi_hash, b.mbi_hash);
        assert_eq!(t.hasher().stats().computations, 1);
    }

    #[test]
    fn test_unknown_claim_type_unsupported() {
        let err = transformer()
            .transform(&change("dme", Some("X"), None))
            .unwrap_err();
        assert!(matches!(err, TransformError::Unsupported { sequence: 7, .. }));
    }

    #[test]
    fn test_missing_claim_id_unsupported() {
        let t = transformer();
        assert!(t.transform(&change("fiss", None, None)).is_err());
        assert!(t.transform(&change("fiss", Some("  "), None)).is_err());
    }

    #[test]
    fn test_last_updated_comes_from_the_change() {
        let t = transformer();
        let claim = t.transform(&change("fiss", Some("F-1"), None)).unwrap();
        assert_eq!(claim.last_updated, None);

        let at: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let stamped = ClaimChange {
            timestamp: Some(at),
            ..change("fiss", Some("F-1"), None)
        };
        assert_eq!(t.transform(&stamped).unwrap().last_updated, Some(at));
    }

    #[test]
    fn test_no_mbi_leaves_hash_empty() {
        let claim = transformer().transform(&change("fiss", Some("F-1"), None)).unwrap();
        assert_eq!(claim.mbi_hash, None);
    }
}

//! Data-set manifest parser
//!
//! Every CCW extract arrives with an XML manifest listing its files:
//!
//! ```xml
//! <dataSetManifest timestamp="2024-03-01T12:00:00Z" sequenceId="0" syntheticData="false">
//!   <entry name="beneficiaries.txt" type="BENEFICIARY"/>
//!   <entry name="carrier.txt" type="CARRIER"/>
//! </dataSetManifest>
//! ```
//!
//! Manifests live at `<Incoming|Synthetic/Incoming>/<timestamp>/<seq>_manifest.xml`
//! and their entries sit next to them.

use super::file_type::RifFileType;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::LazyLock;

pub const INCOMING_PREFIX: &str = "Incoming";
pub const SYNTHETIC_INCOMING_PREFIX: &str = "Synthetic/Incoming";
pub const DONE_PREFIX: &str = "Done";
pub const SYNTHETIC_DONE_PREFIX: &str = "Synthetic/Done";

#[allow(clippy::expect_used)]
static MANIFEST_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Incoming|Synthetic/Incoming)/(.*)/([0-9]+)_manifest\.xml$")
        .expect("Invalid manifest key regex")
});

#[derive(Debug, Deserialize)]
struct ManifestXml {
    #[serde(rename = "@timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "@sequenceId", default)]
    sequence_id: u32,
    #[serde(rename = "@syntheticData", default)]
    synthetic_data: bool,
    #[serde(rename = "entry", default)]
    entries: Vec<EntryXml>,
}

#[derive(Debug, Deserialize)]
struct EntryXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    file_type: RifFileType,
}

/// Identity and processing order of a manifest.
///
/// Ordering is by timestamp, then sequence id: the oldest data set loads
/// first and multi-part sets load in part order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestId {
    pub timestamp: DateTime<Utc>,
    pub sequence_id: u32,
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.timestamp.to_rfc3339(), self.sequence_id)
    }
}

/// Location of a manifest, parsed from its object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestKey {
    pub key: String,
    /// `Incoming` or `Synthetic/Incoming`
    pub prefix: String,
    /// Timestamp directory exactly as it appears in the key
    pub timestamp_text: String,
    pub sequence_id: u32,
}

impl ManifestKey {
    /// `None` if `key` is not a manifest.
    pub fn parse(key: &str) -> Option<Self> {
        let caps = MANIFEST_KEY_REGEX.captures(key)?;
        Some(Self {
            key: key.to_string(),
            prefix: caps[1].to_string(),
            timestamp_text: caps[2].to_string(),
            sequence_id: caps[3].parse().ok()?,
        })
    }

    pub fn is_synthetic(&self) -> bool {
        self.prefix == SYNTHETIC_INCOMING_PREFIX
    }

    /// Parsed timestamp directory, if it is a valid instant.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp_text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn entry_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.timestamp_text, name)
    }

    /// Where this manifest's data set is moved once loaded.
    pub fn done_prefix(&self) -> &'static str {
        if self.is_synthetic() {
            SYNTHETIC_DONE_PREFIX
        } else {
            DONE_PREFIX
        }
    }

    /// Key of `name` under the done location.
    pub fn done_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.done_prefix(), self.timestamp_text, name)
    }

    pub fn manifest_file_name(&self) -> String {
        format!("{}_manifest.xml", self.sequence_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub file_type: RifFileType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifest {
    pub id: ManifestId,
    pub synthetic: bool,
    pub entries: Vec<ManifestEntry>,
}

impl DataSetManifest {
    pub fn parse(xml: &str) -> Result<Self> {
        let parsed: ManifestXml =
            quick_xml::de::from_str(xml).context("Failed to parse data set manifest")?;

        if parsed.entries.is_empty() {
            anyhow::bail!("Data set manifest {} lists no entries", parsed.timestamp);
        }

        Ok(Self {
            id: ManifestId {
                timestamp: parsed.timestamp,
                sequence_id: parsed.sequence_id,
            },
            synthetic: parsed.synthetic_data,
            entries: parsed
                .entries
                .into_iter()
                .map(|e| ManifestEntry {
                    name: e.name,
                    file_type: e.file_type,
                })
                .collect(),
        })
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let xml = std::str::from_utf8(bytes).context("Manifest is not valid UTF-8")?;
        Self::parse(xml)
    }
}

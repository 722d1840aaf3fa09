//! Data-set events handed to the RIF loader
//!
//! A [`RifFilesEvent`] is one arrival of extract files. On construction it
//! fixes the order its files will be processed in; that order never changes.

use super::file_type::RifFileType;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_CHARSET: &str = "UTF-8";

/// One extract file, ready to be read.
pub trait RifFile: Send + Sync + fmt::Debug {
    fn display_name(&self) -> &str;

    fn file_type(&self) -> RifFileType;

    fn charset(&self) -> &str {
        DEFAULT_CHARSET
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>>;

    /// Release any local copy. Called once the file has been processed.
    fn cleanup(&self) {}
}

/// A downloaded file in the local temp directory.
#[derive(Debug, Clone)]
pub struct LocalRifFile {
    display_name: String,
    file_type: RifFileType,
    path: PathBuf,
}

impl LocalRifFile {
    pub fn new(display_name: impl Into<String>, file_type: RifFileType, path: impl Into<PathBuf>) -> Self {
        Self {
            display_name: display_name.into(),
            file_type,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RifFile for LocalRifFile {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn file_type(&self) -> RifFileType {
        self.file_type
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

/// File contents held in memory, for tests and small local runs.
#[derive(Debug, Clone)]
pub struct InMemoryRifFile {
    display_name: String,
    file_type: RifFileType,
    contents: Arc<[u8]>,
}

impl InMemoryRifFile {
    pub fn new(display_name: impl Into<String>, file_type: RifFileType, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            display_name: display_name.into(),
            file_type,
            contents: contents.into().into(),
        }
    }
}

impl RifFile for InMemoryRifFile {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn file_type(&self) -> RifFileType {
        self.file_type
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.contents))))
    }
}

/// Processing of one file within a [`RifFilesEvent`].
#[derive(Debug, Clone)]
pub struct RifFileEvent {
    timestamp: DateTime<Utc>,
    synthetic: bool,
    file: Arc<dyn RifFile>,
}

impl RifFileEvent {
    /// Timestamp of the data set this file arrived with.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn file(&self) -> &Arc<dyn RifFile> {
        &self.file
    }
}

/// An arrival of RIF files, ordered for loading.
///
/// Files of the must-process-first type come before all others; otherwise
/// files are ordered by type ordinal, keeping discovery order within a type.
#[derive(Debug, Clone)]
pub struct RifFilesEvent {
    timestamp: DateTime<Utc>,
    synthetic: bool,
    files: Vec<Arc<dyn RifFile>>,
    events: Vec<RifFileEvent>,
}

impl RifFilesEvent {
    pub fn new(timestamp: DateTime<Utc>, synthetic: bool, files: Vec<Arc<dyn RifFile>>) -> Self {
        let mut ordered = files.clone();
        ordered.sort_by_key(|f| load_order_key(f.file_type()));

        let events = ordered
            .into_iter()
            .map(|file| RifFileEvent {
                timestamp,
                synthetic,
                file,
            })
            .collect();

        Self {
            timestamp,
            synthetic,
            files,
            events,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Files as discovered.
    pub fn files(&self) -> &[Arc<dyn RifFile>] {
        &self.files
    }

    /// Files in the order they must be processed.
    pub fn events(&self) -> &[RifFileEvent] {
        &self.events
    }
}

fn load_order_key(file_type: RifFileType) -> (u8, usize) {
    (u8::from(!file_type.must_process_first()), file_type.ordinal())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn file(name: &str, file_type: RifFileType) -> Arc<dyn RifFile> {
        Arc::new(InMemoryRifFile::new(name, file_type, name.as_bytes().to_vec()))
    }

    fn names(event: &RifFilesEvent) -> Vec<&str> {
        event.events().iter().map(|e| e.file().display_name()).collect()
    }

    #[test]
    fn test_beneficiary_then_claims_by_ordinal() {
        let event = RifFilesEvent::new(
            Utc::now(),
            false,
            vec![
                file("claims_b", RifFileType::Inpatient),
                file("bene", RifFileType::Beneficiary),
                file("claims_a", RifFileType::Carrier),
            ],
        );
        assert_eq!(names(&event), vec!["bene", "claims_a", "claims_b"]);
        // discovery order is kept separately
        assert_eq!(event.files()[0].display_name(), "claims_b");
    }

    #[test]
    fn test_beneficiary_precedes_everything() {
        let mut files: Vec<_> = RifFileType::ALL
            .into_iter()
            .rev()
            .map(|t| file(t.as_str(), t))
            .collect();
        files.push(file("late_bene", RifFileType::Beneficiary));

        let event = RifFilesEvent::new(Utc::now(), false, files);
        let types: Vec<_> = event.events().iter().map(|e| e.file().file_type()).collect();

        assert_eq!(&types[..2], &[RifFileType::Beneficiary, RifFileType::Beneficiary]);
        assert!(types[2..].windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_without_beneficiary_ordinal_only_and_stable() {
        let input = vec![
            file("snf", RifFileType::Snf),
            file("pde_1", RifFileType::Pde),
            file("carrier", RifFileType::Carrier),
            file("pde_2", RifFileType::Pde),
        ];
        let first = RifFilesEvent::new(Utc::now(), false, input.clone());
        let second = RifFilesEvent::new(Utc::now(), false, input);

        assert_eq!(names(&first), vec!["pde_1", "pde_2", "carrier", "snf"]);
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_events_carry_group_timestamp() {
        let ts = Utc::now();
        let event = RifFilesEvent::new(ts, true, vec![file("bene", RifFileType::Beneficiary)]);
        assert!(event.events().iter().all(|e| e.timestamp() == ts && e.is_synthetic()));
    }

    #[test]
    fn test_in_memory_file_reads_back() {
        let f = InMemoryRifFile::new("bene.txt", RifFileType::Beneficiary, b"A|B|C".to_vec());
        let mut contents = String::new();
        f.open().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "A|B|C");
        assert_eq!(f.charset(), DEFAULT_CHARSET);
    }

    #[test]
    fn test_local_file_cleanup_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bene.txt");
        std::fs::write(&path, b"data").unwrap();

        let f = LocalRifFile::new("bene.txt", RifFileType::Beneficiary, &path);
        assert!(f.open().is_ok());
        f.cleanup();
        assert!(!path.exists());
        // second cleanup is quiet
        f.cleanup();
    }
}

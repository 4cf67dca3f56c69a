//! Calibration records and the JSON calibration file.
//!
//! The motion engine only ever reads the file ([`CalibrationStore::load`]);
//! creating defaults and writing changes belongs to the `calibrate` tool.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DEFAULT_CENTER_DUTY, DEFAULT_MAX_DUTY, DEFAULT_MIN_DUTY};

/// Errors raised while loading, validating or saving calibration data.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Cannot access the calibration file: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot read the calibration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No calibration found for servo '{0}'")]
    MissingActuator(String),

    #[error(
        "Calibration for servo '{id}' must satisfy min < center < max \
        (min {min_duty:.2}, center {center_duty:.2}, max {max_duty:.2})"
    )]
    NonMonotonic {
        id: String,
        min_duty: f64,
        center_duty: f64,
        max_duty: f64,
    },
}

/// Three reference duty cycles (percent) for one servo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub min_duty: f64,
    pub center_duty: f64,
    pub max_duty: f64,
}

impl Default for CalibrationRecord {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DUTY, DEFAULT_CENTER_DUTY, DEFAULT_MAX_DUTY)
    }
}

impl CalibrationRecord {
    pub fn new(min_duty: f64, center_duty: f64, max_duty: f64) -> Self {
        Self {
            min_duty,
            center_duty,
            max_duty,
        }
    }

    /// Check the record describes a monotonic mapping.
    pub fn validate(&self, id: &str) -> Result<(), CalibrationError> {
        let finite =
            self.min_duty.is_finite() && self.center_duty.is_finite() && self.max_duty.is_finite();

        if finite && self.min_duty < self.center_duty && self.center_duty < self.max_duty {
            Ok(())
        } else {
            Err(CalibrationError::NonMonotonic {
                id: id.to_string(),
                min_duty: self.min_duty,
                center_duty: self.center_duty,
                max_duty: self.max_duty,
            })
        }
    }

    /// True when either half of the mapping has zero width.
    pub fn is_degenerate(&self) -> bool {
        self.max_duty == self.center_duty || self.center_duty == self.min_duty
    }
}

/// Servo id to calibration record, as persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationStore {
    records: BTreeMap<String, CalibrationRecord>,
}

impl CalibrationStore {
    /// Load an existing calibration file. Missing or corrupt files are errors.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let store: Self = serde_json::from_str(&contents)?;
        info!(
            "Loaded calibration for {} servo(s) from {}",
            store.records.len(),
            path.as_ref().display()
        );
        Ok(store)
    }

    /// Load the calibration file, creating defaults where anything is missing.
    ///
    /// A missing or corrupt file is replaced with a fresh default file. Ids in
    /// `ids` that the file does not mention get default records.
    pub fn load_or_default<P, I, S>(path: P, ids: I) -> Result<Self, CalibrationError>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = path.as_ref();
        let loaded = match Self::load(path) {
            Ok(store) => Some(store),
            Err(CalibrationError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(CalibrationError::Json(e)) => {
                warn!("{} is corrupt ({}), starting from defaults", path.display(), e);
                None
            }
            Err(e) => return Err(e),
        };

        let created = loaded.is_none();
        let mut store = loaded.unwrap_or_default();
        for id in ids {
            store
                .records
                .entry(id.as_ref().to_string())
                .or_insert_with(CalibrationRecord::default);
        }

        if created {
            info!("Creating default calibration file {}", path.display());
            store.save(path)?;
        }

        Ok(store)
    }

    /// Write the store as pretty-printed JSON. Invalid records are refused.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        for (id, record) in &self.records {
            record.validate(id)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json + "\n")?;
        info!("Saved calibration to {}", path.as_ref().display());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&CalibrationRecord> {
        self.records.get(id)
    }

    /// Look up a record the engine needs, validating it on the way out.
    pub fn require(&self, id: &str) -> Result<CalibrationRecord, CalibrationError> {
        let record = self
            .records
            .get(id)
            .copied()
            .ok_or_else(|| CalibrationError::MissingActuator(id.to_string()))?;
        record.validate(id)?;
        Ok(record)
    }

    pub fn set(&mut self, id: &str, record: CalibrationRecord) {
        self.records.insert(id.to_string(), record);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_validate() {
        assert!(CalibrationRecord::default().validate("s0").is_ok());
        assert!(CalibrationRecord::new(7.5, 7.5, 12.5).validate("s0").is_err());
        assert!(CalibrationRecord::new(2.5, 12.5, 7.5).validate("s0").is_err());
        assert!(CalibrationRecord::new(f64::NAN, 7.5, 12.5).validate("s0").is_err());
    }

    #[test]
    fn test_load_reads_python_layout() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("servo_calibration.json");
        fs::write(
            &path,
            r#"{
  "s0": { "min_duty": 3.0, "center_duty": 7.0, "max_duty": 11.5 },
  "s1": { "min_duty": 2.5, "center_duty": 7.5, "max_duty": 12.5 }
}"#,
        )?;

        let store = CalibrationStore::load(&path)?;
        assert_eq!(store.get("s0"), Some(&CalibrationRecord::new(3.0, 7.0, 11.5)));
        assert_eq!(store.ids().collect::<Vec<_>>(), vec!["s0", "s1"]);
        Ok(())
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CalibrationStore::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(CalibrationError::Io(_))));
    }

    #[test]
    fn test_load_corrupt_file_is_error() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("servo_calibration.json");
        fs::write(&path, "{ not json")?;
        assert!(matches!(
            CalibrationStore::load(&path),
            Err(CalibrationError::Json(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_or_default_creates_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("servo_calibration.json");

        let store = CalibrationStore::load_or_default(&path, ["s0", "s1"])?;
        assert_eq!(store.get("s1"), Some(&CalibrationRecord::default()));
        assert!(path.exists());

        let reloaded = CalibrationStore::load(&path)?;
        assert_eq!(reloaded, store);
        Ok(())
    }

    #[test]
    fn test_load_or_default_fills_missing_ids() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("servo_calibration.json");
        let mut existing = CalibrationStore::default();
        existing.set("s0", CalibrationRecord::new(3.0, 7.0, 11.0));
        existing.save(&path)?;

        let store = CalibrationStore::load_or_default(&path, ["s0", "s3"])?;
        assert_eq!(store.get("s0"), Some(&CalibrationRecord::new(3.0, 7.0, 11.0)));
        assert_eq!(store.get("s3"), Some(&CalibrationRecord::default()));
        Ok(())
    }

    #[test]
    fn test_require() {
        let mut store = CalibrationStore::default();
        store.set("s0", CalibrationRecord::default());
        store.set("s1", CalibrationRecord::new(8.0, 7.5, 12.5));

        assert!(store.require("s0").is_ok());
        assert!(matches!(
            store.require("s1"),
            Err(CalibrationError::NonMonotonic { .. })
        ));
        assert!(matches!(
            store.require("s9"),
            Err(CalibrationError::MissingActuator(_))
        ));
    }

    #[test]
    fn test_save_refuses_invalid_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CalibrationStore::default();
        store.set("s0", CalibrationRecord::new(12.0, 7.5, 2.5));
        assert!(store.save(dir.path().join("c.json")).is_err());
    }
}

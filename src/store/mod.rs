//! Durable local record of every measurement taken
//!
//! One JSON file per measurement, named by its UTC timestamp in a
//! filesystem-safe compact form whose lexicographic order is chronological
//! order. Writes go through a temp file and an atomic rename, so a crash
//! mid-write can never corrupt more than the single in-flight record, and a
//! half-written temp file is invisible to readers.
//!
//! Records are never deleted here; retention is a deployment concern.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::protocol::frame::Reading;
use crate::protocol::messages::MeasurementPayload;

/// Timestamp layout used for record file names, e.g. `20240101T120000026Z`.
const FILE_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// The durable, uploadable record derived from a [`Reading`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    /// Stable de-duplication key: `{device_id}-{unix_seconds}`
    pub measurement_id: String,
    pub device_id: String,
    /// Exact decimal weight, stored as a string in the JSON record
    pub value: Decimal,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// Flips to true only after the broker acknowledged the publish
    pub uploaded: bool,
}

impl Measurement {
    /// Build the persisted form of a reading, not yet uploaded.
    pub fn from_reading(device_id: impl Into<String>, reading: &Reading) -> Self {
        let device_id = device_id.into();
        Self {
            measurement_id: format!("{device_id}-{}", reading.acquired_at.timestamp()),
            device_id,
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: reading.acquired_at,
            uploaded: false,
        }
    }

    /// The wire payload published on the telemetry topic.
    pub fn payload(&self) -> MeasurementPayload {
        MeasurementPayload {
            measurement_id: self.measurement_id.clone(),
            device_id: self.device_id.clone(),
            weight: self.value,
            timestamp: self.timestamp,
            unit: self.unit.clone(),
        }
    }
}

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode measurement record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no measurement record for {0}")]
    NotFound(DateTime<Utc>),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Append-mostly measurement store over a directory of JSON records.
///
/// Methods take `&self` and every mutation is a whole-file replace through an
/// atomic rename, so the store is safe to share between the acquisition cycle
/// and a concurrent retry flush.
#[derive(Debug, Clone)]
pub struct MeasurementStore {
    dir: PathBuf,
}

impl MeasurementStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a record lives in, derived from its timestamp.
    pub fn record_path(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}.json", timestamp.format(FILE_STAMP_FORMAT)))
    }

    /// Write one durable record. Creates the store directory on demand.
    pub async fn append(&self, measurement: &Measurement) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let path = self.record_path(measurement.timestamp);
        self.write_atomic(&path, measurement).await
    }

    /// Flip the `uploaded` flag of a previously stored record.
    ///
    /// Idempotent: re-marking an already uploaded record is a no-op, so a
    /// replayed flush after a crash cannot fail here.
    pub async fn mark_uploaded(&self, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let path = self.record_path(timestamp);
        let mut measurement = match self.read_record(&path).await {
            Ok(m) => m,
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(timestamp));
            }
            Err(e) => return Err(e),
        };

        if measurement.uploaded {
            return Ok(());
        }

        measurement.uploaded = true;
        self.write_atomic(&path, &measurement).await
    }

    /// Unsent records, oldest first, at most `limit` of them.
    ///
    /// A record that fails to parse is logged and skipped rather than wedging
    /// delivery of everything behind it.
    pub async fn pending_unsent(&self, limit: usize) -> Result<Vec<Measurement>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }

        // File names sort chronologically by construction.
        paths.sort();

        let mut pending = Vec::new();
        for path in paths {
            if pending.len() == limit {
                break;
            }
            match self.read_record(&path).await {
                Ok(m) if !m.uploaded => pending.push(m),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable measurement record");
                }
            }
        }

        Ok(pending)
    }

    async fn read_record(&self, path: &Path) -> Result<Measurement, StoreError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_atomic(&self, path: &Path, measurement: &Measurement) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(measurement)?;
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(path, e))
    }
}

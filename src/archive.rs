//! Session archive written at teardown.
//!
//! Three YAML documents per session, named after the session id:
//!
//! - `metadata_<id>.yaml`: identity, timestamps, counts and the baseline
//! - `commands_<id>.yaml`: every command exchange
//! - `telemetry_<id>.yaml`: every stored telemetry snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::history::{HistoryKind, HistoryStore};
use crate::telemetry::TelemetryBaseline;
use crate::yaml_utils;
use crate::{DroneError, Result};

/// Identity and counts of an archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub name: String,
    /// Network the session joined, if it got that far
    pub ssid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub command_count: usize,
    pub telemetry_count: usize,
    pub frame_count: usize,
    pub baseline: Option<TelemetryBaseline>,
}

/// Paths of the documents written for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub metadata: PathBuf,
    pub commands: PathBuf,
    pub telemetry: PathBuf,
}

impl ArchiveReport {
    pub fn paths(&self) -> [&Path; 3] {
        [&self.metadata, &self.commands, &self.telemetry]
    }
}

/// Writes session archives into one directory.
#[derive(Debug, Clone)]
pub struct SessionArchive {
    dir: PathBuf,
}

impl SessionArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the three documents, creating the directory if needed.
    ///
    /// History is serialized from point-in-time snapshots, so listeners that
    /// are still winding down do not block the write.
    pub async fn write(
        &self,
        metadata: &SessionMetadata,
        history: &HistoryStore,
    ) -> Result<ArchiveReport> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| DroneError::Archive { path: self.dir.clone(), source })?;

        let report = ArchiveReport {
            metadata: self.path_for("metadata", &metadata.id),
            commands: self.path_for("commands", &metadata.id),
            telemetry: self.path_for("telemetry", &metadata.id),
        };

        write_file(&report.metadata, yaml_utils::to_yaml_bytes(metadata)?).await?;
        write_file(&report.commands, history.flush(HistoryKind::Commands)?).await?;
        write_file(&report.telemetry, history.flush(HistoryKind::Telemetry)?).await?;

        info!(
            id = %metadata.id,
            dir = %self.dir.display(),
            commands = metadata.command_count,
            telemetry = metadata.telemetry_count,
            "Session archived"
        );
        Ok(report)
    }

    fn path_for(&self, kind: &str, id: &str) -> PathBuf {
        self.dir.join(format!("{kind}_{id}.yaml"))
    }
}

async fn write_file(path: &Path, bytes: Vec<u8>) -> Result<()> {
    debug!(path = %path.display(), bytes = bytes.len(), "Writing archive document");
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| DroneError::Archive { path: path.to_path_buf(), source })
}

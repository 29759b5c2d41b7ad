//! Round snapshots on disk.
//!
//! The persister rewrites the snapshot after every transition. Each write
//! goes to a sibling `.tmp` file that is then renamed over the snapshot, so
//! an interrupted write leaves the previous snapshot readable.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::lottery::Round;

pub const DEFAULT_STATE_FILE: &str = "lottery_state.json";

#[derive(Debug, Clone)]
pub struct RoundStore {
    path: PathBuf,
}

impl Default for RoundStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_FILE)
    }
}

impl RoundStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Replace the snapshot with `round`.
    pub fn save(&self, round: &Round) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(round).context("Failed to encode round snapshot")?;
        let staging = self.staging_path();
        std::fs::write(&staging, &bytes)
            .with_context(|| format!("Failed to stage snapshot at {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to move snapshot into {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            state = %round.state,
            players = round.entrants.len(),
            "Round snapshot written"
        );
        Ok(())
    }

    /// The last snapshot, or `None` when nothing has been saved yet. A stray
    /// staging file from an interrupted write is ignored.
    pub fn load(&self) -> Result<Option<Round>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No round snapshot, starting fresh");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read snapshot {}", self.path.display()))
            }
        };
        let round: Round = serde_json::from_slice(&bytes)
            .with_context(|| format!("Snapshot {} is not a valid round", self.path.display()))?;

        info!(
            path = %self.path.display(),
            state = %round.state,
            players = round.entrants.len(),
            balance = %round.balance,
            rounds_completed = round.rounds_completed,
            "Round snapshot loaded"
        );
        Ok(Some(round))
    }

    /// Remove the snapshot and any staging leftover.
    pub fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), self.staging_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

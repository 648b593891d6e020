//! Temporary profiling artifact: collision-avoiding names and guarded cleanup.

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::Serialize;

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::InterruptFlag;

/// Candidate names tried before giving up on the temp directory.
pub const MAX_NAME_ATTEMPTS: usize = 10;

/// Produces `perf_<pid>_<secs>_<random>.dat` names in a shared directory.
///
/// The generator owns its RNG state so naming never touches randomness that
/// other threads in the process (the telemetry agent's TLS stack, say) may be
/// drawing from.
#[derive(Debug)]
pub struct ArtifactNamer {
    dir: PathBuf,
    pid: u32,
    epoch_secs: u64,
    rng: ChaCha8Rng,
}

impl ArtifactNamer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_identity(dir, std::process::id(), unix_now_secs())
    }

    pub fn with_identity(dir: impl Into<PathBuf>, pid: u32, epoch_secs: u64) -> Self {
        let seed = 17u64.wrapping_mul(u64::from(pid)).wrapping_add(epoch_secs);
        Self {
            dir: dir.into(),
            pid,
            epoch_secs,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Returns a path that did not exist when checked, or `None` when every
    /// attempt collided or the session was interrupted.
    pub fn generate(&mut self, interrupt: &InterruptFlag) -> Option<ArtifactPath> {
        self.generate_with(interrupt, |p| p.symlink_metadata().is_ok())
    }

    pub fn generate_with(
        &mut self,
        interrupt: &InterruptFlag,
        mut exists: impl FnMut(&Path) -> bool,
    ) -> Option<ArtifactPath> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            if interrupt.is_set() {
                tracing::debug!("interrupted while naming the artifact");
                return None;
            }
            let candidate = self.dir.join(format!(
                "perf_{}_{}_{}.dat",
                self.pid,
                self.epoch_secs,
                self.rng.next_u32() >> 1
            ));
            if !exists(&candidate) {
                return Some(ArtifactPath::new(candidate));
            }
            tracing::debug!(attempt, "artifact name {} already taken", candidate.display());
        }
        tracing::warn!(
            "no free artifact name in {} after {MAX_NAME_ATTEMPTS} attempts",
            self.dir.display()
        );
        None
    }
}

/// Outcome of [`ArtifactPath::remove_if_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Cleanup {
    Missing,
    Stale { age: Duration },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ArtifactPath {
    path: PathBuf,
}

impl ArtifactPath {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn remove_if_fresh(&self, window: Duration) -> io::Result<Cleanup> {
        self.remove_if_fresh_at(window, SystemTime::now())
    }

    /// Deletes the artifact only when it was modified less than `window`
    /// before `now`. An older file at this path may belong to a concurrent
    /// session that picked the same name; this is a heuristic, not a lock.
    ///
    /// The path itself is inspected, never a symlink target, so the entry
    /// checked is the entry removed.
    pub fn remove_if_fresh_at(&self, window: Duration, now: SystemTime) -> io::Result<Cleanup> {
        let metadata = match std::fs::symlink_metadata(&self.path) {
            Ok(m) => m,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!("cannot stat {}: {err}", self.path.display());
                }
                return Ok(Cleanup::Missing);
            }
        };
        // Clock skew can put the mtime in the future; that still counts as fresh.
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or(Duration::ZERO);
        if age >= window {
            tracing::info!(
                "leaving {} in place: last modified {}s ago",
                self.path.display(),
                age.as_secs()
            );
            return Ok(Cleanup::Stale { age });
        }
        std::fs::remove_file(&self.path)?;
        tracing::debug!("removed {}", self.path.display());
        Ok(Cleanup::Removed)
    }
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

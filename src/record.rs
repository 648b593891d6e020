//! Recording phase: run the target program under `<profiler> record`.

use serde::Serialize;
use thiserror::Error;

use std::io;
use std::time::{Duration, Instant};

use crate::{ArtifactPath, InterruptFlag, Profiler};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("could not find a free temp name for the profiling artifact")]
    ArtifactUnavailable,

    #[error("could not prepare the record command: {0}")]
    SetupFailed(String),

    #[error("interrupted by a signal")]
    Interrupted,

    #[error("could not launch the profiler: {0}")]
    LaunchFailed(#[source] io::Error),
}

impl RecordError {
    /// Stable label used when the failure is reported to the telemetry agent.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArtifactUnavailable => "artifact_unavailable",
            Self::SetupFailed(_) => "setup_failed",
            Self::Interrupted => "interrupted",
            Self::LaunchFailed(_) => "launch_failed",
        }
    }
}

/// Source of the instants bracketing the record command.
pub trait Clock {
    fn now(&mut self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    /// Exit code of the record command; always non-negative.
    pub exit_code: i32,
    /// Wall-clock time the record command ran for.
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedArgs {
    pub forwarded: Vec<String>,
    pub dropped: Vec<String>,
}

/// Strips output-path options the caller passed for the record command.
///
/// Options are only inspected until the first token that does not start with
/// `-`; that token and everything after it belong to the target program and
/// are copied verbatim, however option-like they look.
pub fn sanitize_record_args(args: &[String]) -> SanitizedArgs {
    let mut out = SanitizedArgs::default();
    let mut in_record_options = true;
    let mut tokens = args.iter();
    while let Some(token) = tokens.next() {
        if in_record_options {
            let takes_separate_value = token == "-o" || token == "--output";
            if takes_separate_value || token.starts_with("--output=") || token.starts_with("-o") {
                tracing::warn!("ignoring record option {token}");
                out.dropped.push(token.clone());
                if takes_separate_value && let Some(value) = tokens.next() {
                    out.dropped.push(value.clone());
                }
                continue;
            }
        }
        if !token.starts_with('-') {
            in_record_options = false;
        }
        out.forwarded.push(token.clone());
    }
    out
}

/// Full argument vector following `record`: the artifact output option, then
/// the sanitized caller arguments.
pub fn record_command_args(
    artifact: &ArtifactPath,
    args: &[String],
) -> Result<Vec<String>, RecordError> {
    let path = artifact.as_path().to_str().ok_or_else(|| {
        RecordError::SetupFailed(format!(
            "artifact path {} is not valid UTF-8",
            artifact.as_path().display()
        ))
    })?;
    let sanitized = sanitize_record_args(args);
    let mut argv = Vec::with_capacity(sanitized.forwarded.len() + 1);
    argv.push(format!("--output={path}"));
    argv.extend(sanitized.forwarded);
    Ok(argv)
}

/// Runs the record command and waits for it.
///
/// The interrupt flag is checked right before launching and again once the
/// command has exited; in the latter case the completed run is reported as
/// interrupted so the caller skips the report phase.
pub fn run_record(
    profiler: &mut dyn Profiler,
    artifact: &ArtifactPath,
    args: &[String],
    interrupt: &InterruptFlag,
    clock: &mut dyn Clock,
) -> Result<RecordOutcome, RecordError> {
    let argv = record_command_args(artifact, args)?;

    if interrupt.is_set() {
        return Err(RecordError::Interrupted);
    }

    let started = clock.now();
    let exit_code = profiler.record(&argv).map_err(RecordError::LaunchFailed)?;
    let duration = clock.now().saturating_duration_since(started);

    if interrupt.is_set() {
        return Err(RecordError::Interrupted);
    }

    tracing::info!(
        exit_code,
        "record finished in {}.{:09}s",
        duration.as_secs(),
        duration.subsec_nanos()
    );
    Ok(RecordOutcome {
        exit_code,
        duration,
    })
}

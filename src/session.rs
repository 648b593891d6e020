//! One profiling session: record, report, emit, clean up.
//!
//! ```text
//! Init -> TransactionOpen -> RecordingSegment -> Recorded
//!      -> ReportingSegment -> Reported -> Cleanup -> Closed
//! ```
//!
//! Any state before `Closed` may divert to `Aborted` on interruption or a
//! fatal phase error; an aborted session still cleans up and closes its
//! transaction. Only a transaction that never opened ends in `Aborted`.

use serde::Serialize;
use time::OffsetDateTime;

use std::time::Duration;

use crate::{
    ArtifactNamer, ArtifactPath, Cleanup, Clock, Config, Emission, InterruptFlag, Profiler,
    RecordError, RecordOutcome, ReportError, ROOT_SEGMENT, SegmentId, SystemClock,
    TelemetryAgent, TransactionId, emit_sample, open_report, run_record,
};

/// Host reported for both external segments.
pub const SEGMENT_HOST: &str = "localhost";
pub const RECORD_SEGMENT: &str = "perf record";
pub const REPORT_SEGMENT: &str = "perf report";
pub const START_TIME_ATTRIBUTE: &str = "ct_tx_start_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    TransactionOpen,
    RecordingSegment,
    Recorded,
    ReportingSegment,
    Reported,
    Cleanup,
    Closed,
    Aborted,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::TransactionOpen => "transaction_open",
            Self::RecordingSegment => "recording_segment",
            Self::Recorded => "recorded",
            Self::ReportingSegment => "reporting_segment",
            Self::Reported => "reported",
            Self::Cleanup => "cleanup",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }
}

/// What happened during [`Session::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    /// Every state entered, in order, starting with `Init`.
    pub transitions: Vec<SessionState>,
    pub aborted: bool,
    pub interrupted: bool,
    pub artifact: Option<ArtifactPath>,
    pub record: Option<RecordOutcome>,
    pub samples_emitted: usize,
    pub samples_discarded: usize,
    pub emission_failures: usize,
    pub malformed_lines: usize,
    pub cleanup: Option<Cleanup>,
    /// Notice-error kinds raised, in order.
    pub errors: Vec<&'static str>,
}

impl SessionReport {
    fn new() -> Self {
        Self {
            state: SessionState::Init,
            transitions: vec![SessionState::Init],
            aborted: false,
            interrupted: false,
            artifact: None,
            record: None,
            samples_emitted: 0,
            samples_discarded: 0,
            emission_failures: 0,
            malformed_lines: 0,
            cleanup: None,
            errors: Vec::new(),
        }
    }
}

pub struct Session<'a> {
    config: &'a Config,
    agent: &'a mut dyn TelemetryAgent,
    profiler: &'a mut dyn Profiler,
    interrupt: InterruptFlag,
    namer: ArtifactNamer,
    clock: Box<dyn Clock>,
    report: SessionReport,
}

impl<'a> Session<'a> {
    pub fn new(
        config: &'a Config,
        agent: &'a mut dyn TelemetryAgent,
        profiler: &'a mut dyn Profiler,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            config,
            agent,
            profiler,
            interrupt,
            namer: ArtifactNamer::new(&config.artifact_dir),
            clock: Box::new(SystemClock),
            report: SessionReport::new(),
        }
    }

    pub fn with_namer(mut self, namer: ArtifactNamer) -> Self {
        self.namer = namer;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Profiles `args` (record options followed by the target program) and
    /// forwards the per-symbol breakdown to the telemetry agent.
    pub fn run(mut self, args: &[String]) -> SessionReport {
        let tx = match self.agent.transaction_begin() {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!("could not start a transaction: {err}");
                self.abort();
                return self.report;
            }
        };
        self.enter(SessionState::TransactionOpen);
        self.describe_transaction(tx);

        let (artifact, recorded) = self.record_phase(tx, args);
        self.report.artifact = artifact.clone();
        match recorded {
            Ok(outcome) if !self.interrupted() => {
                self.report.record = Some(outcome);
                self.enter(SessionState::Recorded);
                if let Some(artifact) = &artifact {
                    self.report_phase(tx, artifact, outcome.duration);
                }
            }
            Ok(outcome) => {
                self.report.record = Some(outcome);
                self.abort();
            }
            Err(RecordError::Interrupted) => {
                tracing::info!("interrupted before the report phase");
                self.abort();
            }
            Err(err) => {
                self.notice_error(tx, "record_phase", err.kind(), &err.to_string());
                self.abort();
            }
        }

        self.cleanup(tx, artifact.as_ref());
        self.close(tx);
        self.report
    }

    fn record_phase(
        &mut self,
        tx: TransactionId,
        args: &[String],
    ) -> (Option<ArtifactPath>, Result<RecordOutcome, RecordError>) {
        let segment = self.begin_segment(tx, RECORD_SEGMENT);
        self.enter(SessionState::RecordingSegment);

        let artifact = self.namer.generate(&self.interrupt);
        let result = match &artifact {
            Some(path) => run_record(
                &mut *self.profiler,
                path,
                args,
                &self.interrupt,
                self.clock.as_mut(),
            ),
            None if self.interrupted() => Err(RecordError::Interrupted),
            None => Err(RecordError::ArtifactUnavailable),
        };

        self.end_segment(tx, segment);
        (artifact, result)
    }

    fn report_phase(&mut self, tx: TransactionId, artifact: &ArtifactPath, total: Duration) {
        let segment = self.begin_segment(tx, REPORT_SEGMENT);
        self.enter(SessionState::ReportingSegment);

        let result = self.emit_report(tx, artifact, total);
        match result {
            Ok(()) => {}
            Err(ReportError::Interrupted) => self.report.interrupted = true,
            Err(err) => self.notice_error(tx, "report_phase", err.kind(), &err.to_string()),
        }

        self.end_segment(tx, segment);
        if self.interrupted() {
            tracing::info!("interrupted during the report phase");
            self.abort();
        } else {
            self.enter(SessionState::Reported);
        }
    }

    fn emit_report(
        &mut self,
        tx: TransactionId,
        artifact: &ArtifactPath,
        total: Duration,
    ) -> Result<(), ReportError> {
        let mut reader = open_report(&mut *self.profiler, artifact, &self.interrupt)?;
        for sample in reader.by_ref() {
            match emit_sample(
                &mut *self.agent,
                tx,
                &sample,
                total,
                &self.config.attribute_prefix,
            ) {
                Emission::Sent => self.report.samples_emitted += 1,
                Emission::Discarded => self.report.samples_discarded += 1,
                Emission::Failed => self.report.emission_failures += 1,
            }
        }
        self.report.malformed_lines = reader.stats().malformed;
        let stats = reader.close()?;
        tracing::info!(
            lines = stats.lines,
            samples = stats.samples,
            malformed = stats.malformed,
            "report processed"
        );
        Ok(())
    }

    fn cleanup(&mut self, tx: TransactionId, artifact: Option<&ArtifactPath>) {
        self.enter(SessionState::Cleanup);
        let Some(artifact) = artifact else {
            return;
        };
        match artifact.remove_if_fresh(self.config.freshness_window()) {
            Ok(outcome) => self.report.cleanup = Some(outcome),
            Err(err) => {
                let message = format!("cannot remove {}: {err}", artifact.as_path().display());
                self.notice_error(tx, "artifact_cleanup", "io", &message);
            }
        }
    }

    fn close(&mut self, tx: TransactionId) {
        if let Err(err) = self.agent.transaction_end(tx) {
            tracing::warn!("{err}");
        }
        self.enter(SessionState::Closed);
    }

    fn describe_transaction(&mut self, tx: TransactionId) {
        let started = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let results = [
            self.agent.transaction_set_type_other(tx),
            self.agent
                .transaction_set_name(tx, &self.config.transaction_name),
            self.agent
                .transaction_set_category(tx, &self.config.transaction_category),
            self.agent
                .transaction_add_attribute(tx, START_TIME_ATTRIBUTE, &started),
        ];
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!("{err}");
        }
    }

    fn begin_segment(&mut self, tx: TransactionId, name: &str) -> Option<SegmentId> {
        match self
            .agent
            .segment_external_begin(tx, ROOT_SEGMENT, SEGMENT_HOST, name)
        {
            Ok(segment) => Some(segment),
            Err(err) => {
                tracing::warn!("no `{name}` segment: {err}");
                None
            }
        }
    }

    fn end_segment(&mut self, tx: TransactionId, segment: Option<SegmentId>) {
        if let Some(segment) = segment
            && let Err(err) = self.agent.segment_end(tx, segment)
        {
            tracing::warn!("{err}");
        }
    }

    fn notice_error(&mut self, tx: TransactionId, kind: &'static str, class: &str, message: &str) {
        tracing::error!("{kind}: {message}");
        self.report.errors.push(kind);
        if let Err(err) = self
            .agent
            .transaction_notice_error(tx, kind, message, class, "")
        {
            tracing::warn!("{err}");
        }
    }

    fn interrupted(&mut self) -> bool {
        if self.interrupt.is_set() {
            self.report.interrupted = true;
        }
        self.report.interrupted
    }

    fn abort(&mut self) {
        self.report.aborted = true;
        self.enter(SessionState::Aborted);
    }

    fn enter(&mut self, state: SessionState) {
        tracing::debug!(
            "session {} -> {}",
            self.report.state.as_str(),
            state.as_str()
        );
        self.report.state = state;
        self.report.transitions.push(state);
    }
}

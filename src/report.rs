//! Report phase: turn `<profiler> report` output into samples.
//!
//! The report is a human-oriented table. Every data row looks like
//!
//! ```text
//!     16.67%  prog  libc-2.17.so       [.] __fxstat64
//! ```
//!
//! i.e. percentage, command, shared object, privilege marker, symbol. Lines
//! starting with `#` and blank lines may appear anywhere.

use thiserror::Error;

use std::io::{self, BufRead};

use crate::{ArtifactPath, InterruptFlag, Profiler, ReportPipe};

/// One symbol's share of the recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Relative weight, 0 to 100.
    pub percent: f64,
    pub object: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("expected at least 5 fields, found {0}")]
    TooFewFields(usize),

    #[error("percentage field {0:?} does not end in '%'")]
    MissingPercentSign(String),

    #[error("invalid percentage {0:?}")]
    InvalidPercent(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("interrupted by a signal")]
    Interrupted,

    #[error("could not start the report command: {0}")]
    PipeOpen(#[source] io::Error),

    #[error("could not close the report pipe: {0}")]
    PipeClose(#[source] io::Error),
}

impl ReportError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::PipeOpen(_) => "pipe_open",
            Self::PipeClose(_) => "pipe_close",
        }
    }
}

/// Parses one report line. `Ok(None)` for blank and comment lines.
pub fn parse_report_line(line: &str) -> Result<Option<Sample>, LineError> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let too_few = || LineError::TooFewFields(line.split_whitespace().count());
    let (percent, rest) = next_field(line).ok_or_else(too_few)?;
    let (_command, rest) = next_field(rest).ok_or_else(too_few)?;
    let (object, rest) = next_field(rest).ok_or_else(too_few)?;
    let (_privilege, rest) = next_field(rest).ok_or_else(too_few)?;
    // Anything after the symbol field is ignored.
    let (symbol, _) = next_field(rest).ok_or_else(too_few)?;

    let number = percent
        .strip_suffix('%')
        .ok_or_else(|| LineError::MissingPercentSign(percent.to_string()))?;
    let percent = match number.parse::<f64>() {
        Ok(p) if p.is_finite() && p >= 0.0 => p,
        _ => return Err(LineError::InvalidPercent(percent.to_string())),
    };

    Ok(Some(Sample {
        percent,
        object: object.to_string(),
        symbol: symbol.to_string(),
    }))
}

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some(s.split_at(end))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportStats {
    pub lines: usize,
    pub samples: usize,
    pub malformed: usize,
    pub interrupted: bool,
}

/// Starts the report command for `artifact`, unless the session was already
/// interrupted.
pub fn open_report(
    profiler: &mut dyn Profiler,
    artifact: &ArtifactPath,
    interrupt: &InterruptFlag,
) -> Result<ReportReader, ReportError> {
    if interrupt.is_set() {
        return Err(ReportError::Interrupted);
    }
    let pipe = profiler
        .report(artifact.as_path())
        .map_err(ReportError::PipeOpen)?;
    Ok(ReportReader::new(pipe, interrupt.clone()))
}

/// Lazily yields samples from a report pipe. Reading stops at end of output,
/// on a read error, or once the interrupt flag is seen between two lines.
pub struct ReportReader {
    pipe: Box<dyn ReportPipe>,
    interrupt: InterruptFlag,
    buf: Vec<u8>,
    stats: ReportStats,
    done: bool,
}

impl ReportReader {
    pub fn new(pipe: Box<dyn ReportPipe>, interrupt: InterruptFlag) -> Self {
        Self {
            pipe,
            interrupt,
            buf: Vec::new(),
            stats: ReportStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> ReportStats {
        self.stats
    }

    pub fn close(self) -> Result<ReportStats, ReportError> {
        let stats = self.stats;
        self.pipe.close().map_err(ReportError::PipeClose)?;
        Ok(stats)
    }
}

impl Iterator for ReportReader {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        while !self.done {
            if self.interrupt.is_set() {
                tracing::info!(
                    "interrupted after {} report lines; stopping",
                    self.stats.lines
                );
                self.stats.interrupted = true;
                self.done = true;
                break;
            }

            self.buf.clear();
            match self.pipe.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.stats.lines += 1;
                    let line = String::from_utf8_lossy(&self.buf);
                    match parse_report_line(&line) {
                        Ok(Some(sample)) => {
                            self.stats.samples += 1;
                            return Some(sample);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.stats.malformed += 1;
                            tracing::debug!(line = self.stats.lines, "skipping report line: {err}");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to read report output: {err}");
                    self.done = true;
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{BufRead, Cursor, Read};
    use std::path::Path;
    use std::rc::Rc;

    /// Report pipe over canned output.
    pub(crate) struct CannedPipe {
        pub(crate) output: Cursor<Vec<u8>>,
        pub(crate) fail_close: bool,
        pub(crate) closed: Rc<Cell<bool>>,
    }

    impl CannedPipe {
        pub(crate) fn new(output: &str) -> Self {
            Self {
                output: Cursor::new(output.as_bytes().to_vec()),
                fail_close: false,
                closed: Rc::new(Cell::new(false)),
            }
        }
    }

    impl Read for CannedPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.output.read(buf)
        }
    }

    impl BufRead for CannedPipe {
        fn fill_buf(&mut self) -> io::Result<&[u8]> {
            self.output.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            self.output.consume(amt)
        }
    }

    impl ReportPipe for CannedPipe {
        fn close(self: Box<Self>) -> io::Result<()> {
            self.closed.set(true);
            if self.fail_close {
                return Err(io::Error::other("wait failed"));
            }
            Ok(())
        }
    }

    struct ReportOnly {
        output: Option<CannedPipe>,
        report_calls: usize,
    }

    impl Profiler for ReportOnly {
        fn record(&mut self, _args: &[String]) -> io::Result<i32> {
            panic!("record is not part of the report phase");
        }

        fn report(&mut self, _artifact: &Path) -> io::Result<Box<dyn ReportPipe>> {
            self.report_calls += 1;
            match self.output.take() {
                Some(pipe) => Ok(Box::new(pipe)),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "perf not found")),
            }
        }
    }

    fn artifact() -> ArtifactPath {
        ArtifactPath::new("/tmp/perf_1_2_3.dat".into())
    }

    fn sample(percent: f64, object: &str, symbol: &str) -> Sample {
        Sample {
            percent,
            object: object.to_string(),
            symbol: symbol.to_string(),
        }
    }

    #[test]
    fn parses_report_rows() {
        assert_eq!(
            parse_report_line("50.00%  prog  libfoo.so  [.] symA\n"),
            Ok(Some(sample(50.0, "libfoo.so", "symA")))
        );
        assert_eq!(
            parse_report_line("    16.67%  prog  [kernel.kallsyms]  [k] vm_normal_page\n"),
            Ok(Some(sample(16.67, "[kernel.kallsyms]", "vm_normal_page")))
        );
    }

    #[test]
    fn symbol_is_a_single_field() {
        assert_eq!(
            parse_report_line("10.00%  prog  libfoo.so  [.] symA  trailing\n"),
            Ok(Some(sample(10.0, "libfoo.so", "symA")))
        );
        assert_eq!(
            parse_report_line("1.50%  prog  libstdc++.so.6  [.] operator new(unsigned long)\n"),
            Ok(Some(sample(1.5, "libstdc++.so.6", "operator")))
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert_eq!(parse_report_line("# Samples: 6  of event 'cycles'\n"), Ok(None));
        assert_eq!(parse_report_line("#\n"), Ok(None));
        assert_eq!(parse_report_line("\n"), Ok(None));
        assert_eq!(parse_report_line("   \t\n"), Ok(None));
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert_eq!(
            parse_report_line("garbage\n"),
            Err(LineError::TooFewFields(1))
        );
        assert_eq!(
            parse_report_line("12.5 prog lib.so [.] sym\n"),
            Err(LineError::MissingPercentSign("12.5".to_string()))
        );
        assert_eq!(
            parse_report_line("abc% prog lib.so [.] sym\n"),
            Err(LineError::InvalidPercent("abc%".to_string()))
        );
        assert_eq!(
            parse_report_line("-1.0% prog lib.so [.] sym\n"),
            Err(LineError::InvalidPercent("-1.0%".to_string()))
        );
        assert_eq!(
            parse_report_line("10.00% prog lib.so [.]\n"),
            Err(LineError::TooFewFields(4))
        );
    }

    #[test]
    fn reader_streams_samples_and_counts_noise() {
        let pipe = CannedPipe::new(
            "# Overhead  Command  Shared Object  Symbol\n\
             #\n\
             50.00%  prog  libfoo.so  [.] symA\n\
             not a row\n\
             \n\
             10.00%  prog  libfoo.so  [.] symB\n",
        );
        let closed = pipe.closed.clone();
        let mut profiler = ReportOnly {
            output: Some(pipe),
            report_calls: 0,
        };
        let mut reader =
            open_report(&mut profiler, &artifact(), &InterruptFlag::new()).expect("open");
        let samples: Vec<Sample> = reader.by_ref().collect();
        assert_eq!(
            samples,
            vec![
                sample(50.0, "libfoo.so", "symA"),
                sample(10.0, "libfoo.so", "symB")
            ]
        );
        let stats = reader.close().expect("close");
        assert_eq!(
            stats,
            ReportStats {
                lines: 6,
                samples: 2,
                malformed: 1,
                interrupted: false
            }
        );
        assert!(closed.get());
    }

    #[test]
    fn interrupt_between_lines_stops_reading() {
        let interrupt = InterruptFlag::new();
        let mut reader = ReportReader::new(
            Box::new(CannedPipe::new(
                "50.00%  prog  libfoo.so  [.] symA\n10.00%  prog  libfoo.so  [.] symB\n",
            )),
            interrupt.clone(),
        );
        assert_eq!(reader.next(), Some(sample(50.0, "libfoo.so", "symA")));
        interrupt.raise();
        assert_eq!(reader.next(), None);
        let stats = reader.close().expect("close");
        assert!(stats.interrupted);
        assert_eq!(stats.samples, 1);
    }

    #[test]
    fn preset_interrupt_never_opens_the_pipe() {
        let mut profiler = ReportOnly {
            output: Some(CannedPipe::new("")),
            report_calls: 0,
        };
        let interrupt = InterruptFlag::new();
        interrupt.raise();
        let err = open_report(&mut profiler, &artifact(), &interrupt)
            .err()
            .expect("must be interrupted");
        assert!(matches!(err, ReportError::Interrupted));
        assert_eq!(profiler.report_calls, 0);
    }

    #[test]
    fn open_and_close_failures_are_distinct() {
        let mut profiler = ReportOnly {
            output: None,
            report_calls: 0,
        };
        let err = open_report(&mut profiler, &artifact(), &InterruptFlag::new())
            .err()
            .expect("open must fail");
        assert_eq!(err.kind(), "pipe_open");

        let mut pipe = CannedPipe::new("1.00% a b c d\n");
        pipe.fail_close = true;
        let mut reader = ReportReader::new(Box::new(pipe), InterruptFlag::new());
        assert!(reader.next().is_some());
        let err = reader.close().expect_err("close must fail");
        assert_eq!(err.kind(), "pipe_close");
    }
}

//! The sampling profiler as an external collaborator.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

/// Line-oriented output of a running report command.
pub trait ReportPipe: BufRead {
    /// Closes the read end and reaps the producer.
    fn close(self: Box<Self>) -> io::Result<()>;
}

pub trait Profiler {
    /// Runs `record <args...>` to completion and returns its exit code.
    fn record(&mut self, args: &[String]) -> io::Result<i32>;

    /// Starts `report --input=<artifact>` with its standard output piped back.
    fn report(&mut self, artifact: &Path) -> io::Result<Box<dyn ReportPipe>>;
}

/// `perf` (or a compatible binary) driven through its command line.
#[derive(Debug, Clone)]
pub struct PerfCli {
    program: PathBuf,
}

impl PerfCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Profiler for PerfCli {
    fn record(&mut self, args: &[String]) -> io::Result<i32> {
        tracing::debug!("exec {} record {}", self.program.display(), args.join(" "));
        let status = Command::new(&self.program)
            .arg("record")
            .args(args)
            .status()?;
        Ok(exit_code(status))
    }

    fn report(&mut self, artifact: &Path) -> io::Result<Box<dyn ReportPipe>> {
        let mut input = OsString::from("--input=");
        input.push(artifact.as_os_str());
        let mut child = Command::new(&self.program)
            .arg("report")
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("report stdout was not captured"))?;
        Ok(Box::new(ChildReport {
            child,
            stdout: BufReader::new(stdout),
        }))
    }
}

/// Plain exit code, with death-by-signal mapped to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 128,
    }
}

struct ChildReport {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl Read for ChildReport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl BufRead for ChildReport {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.stdout.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.stdout.consume(amt)
    }
}

impl ReportPipe for ChildReport {
    fn close(self: Box<Self>) -> io::Result<()> {
        let ChildReport { mut child, stdout } = *self;
        // Closing our end first lets a producer we stopped reading from exit.
        drop(stdout);
        let status = child.wait()?;
        if !status.success() {
            tracing::warn!("report command exited with status {}", exit_code(status));
        }
        Ok(())
    }
}

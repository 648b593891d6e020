use anyhow::Result;
use perfrelay::{Cleanup, SessionReport, SessionState};

pub const USAGE: &str = "perfrelay [--config <path>] [--json] <license-key> [record-options...] <program> [program-args...]";

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    pub fn print_session_report(&self, report: &SessionReport) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
            return Ok(());
        }

        let status_style = match (report.state, report.interrupted) {
            (SessionState::Closed, false) if !report.aborted => self.style("OK", "32;1"),
            (_, true) => self.style("INTERRUPTED", "33;1"),
            _ => self.style("ABORTED", "31;1"),
        };

        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {}\n",
            self.style("perfrelay", "36;1"),
            self.style(report.state.as_str(), "37;1"),
            status_style
        ));
        if let Some(record) = &report.record {
            out.push_str(&format!(
                "{} exit={} duration={:.6}s\n",
                self.style("record", "90"),
                record.exit_code,
                record.duration.as_secs_f64()
            ));
        }
        out.push_str(&format!(
            "{} emitted={} discarded={} failed={} malformed={}\n",
            self.style("samples", "90"),
            report.samples_emitted,
            report.samples_discarded,
            report.emission_failures,
            report.malformed_lines
        ));
        if let Some(artifact) = &report.artifact {
            let cleanup = match report.cleanup {
                Some(Cleanup::Removed) => "removed".to_string(),
                Some(Cleanup::Missing) => "missing".to_string(),
                Some(Cleanup::Stale { age }) => format!("kept (modified {}s ago)", age.as_secs()),
                None => "not removed".to_string(),
            };
            out.push_str(&format!(
                "{} {} {}\n",
                self.style("artifact", "90"),
                artifact.as_path().display(),
                cleanup
            ));
        }
        if !report.errors.is_empty() {
            out.push_str(&format!("{}\n", self.style("errors", "33;1")));
            for kind in &report.errors {
                out.push_str(&format!("  - {kind}\n"));
            }
        }

        eprintln!("{}", out.trim_end());
        Ok(())
    }

    pub fn print_usage(&self) {
        println!("{} {USAGE}", self.style("usage:", "36;1"));
    }

    pub fn print_error(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "error",
                "code": "error",
                "message": msg,
            });
            println!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}

#![cfg(unix)]

use perfrelay::{ArtifactPath, InterruptFlag, PerfCli, Profiler, ReportReader, Sample};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

const STUB_PERF: &str = r#"#!/bin/sh
cmd="$1"
shift
case "$cmd" in
  record)
    for arg in "$@"; do
      case "$arg" in
        --output=*) out="${arg#--output=}" ;;
      esac
    done
    [ -n "$out" ] || exit 64
    printf 'PERFILE2' > "$out"
    sleep 1
    exit 3
    ;;
  report)
    case "$1" in
      --input=*) [ -f "${1#--input=}" ] || exit 66 ;;
      *) exit 64 ;;
    esac
    printf '# Overhead  Command  Shared Object  Symbol\n'
    printf '50.00%%  prog  libfoo.so  [.] symA\n'
    printf '10.00%%  prog  libfoo.so  [.] symB\n'
    ;;
  *) exit 64 ;;
esac
"#;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("perfrelay-it-{name}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    dir
}

fn install_stub(dir: &Path) -> PathBuf {
    let path = dir.join("perf");
    std::fs::write(&path, STUB_PERF).expect("write stub");
    let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

#[test]
fn perf_cli_drives_record_and_report() {
    let dir = temp_dir("cli");
    let mut perf = PerfCli::new(install_stub(&dir));
    let artifact = ArtifactPath::new(dir.join("perf_1_2_3.dat"));

    let code = perf
        .record(&[
            format!("--output={}", artifact.as_path().display()),
            "true".to_string(),
        ])
        .expect("record");
    assert_eq!(code, 3);
    assert!(artifact.as_path().exists());

    let pipe = perf.report(artifact.as_path()).expect("report");
    let mut reader = ReportReader::new(pipe, InterruptFlag::new());
    let samples: Vec<Sample> = reader.by_ref().collect();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].symbol, "symA");
    assert_eq!(samples[1].percent, 10.0);
    let stats = reader.close().expect("close");
    assert_eq!(stats.lines, 3);
}

#[test]
fn missing_profiler_is_a_launch_error() {
    let mut perf = PerfCli::new("/nonexistent/perfrelay-perf");
    assert!(perf.record(&["true".to_string()]).is_err());
    assert!(perf.report(Path::new("/tmp/none.dat")).is_err());
}

#[test]
fn binary_profiles_and_cleans_up() {
    let dir = temp_dir("bin");
    let artifacts = dir.join("artifacts");
    std::fs::create_dir_all(&artifacts).expect("mkdir artifacts");
    let config = dir.join("perfrelay.toml");
    std::fs::write(
        &config,
        format!(
            "profiler = {:?}\nartifact_dir = {:?}\n",
            install_stub(&dir).display().to_string(),
            artifacts.display().to_string()
        ),
    )
    .expect("write config");

    let out = Command::new(env!("CARGO_BIN_EXE_perfrelay"))
        .args(["--config"])
        .arg(&config)
        .args(["--json", "LICENSE", "-e", "cycles", "myprog", "--flag"])
        .env("RUST_LOG", "info")
        .output()
        .expect("run perfrelay");
    assert_eq!(out.status.code(), Some(0));

    let summary: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("json summary on stdout");
    assert_eq!(summary["state"], "closed");
    assert_eq!(summary["samples_emitted"], 2);
    assert_eq!(summary["record"]["exit_code"], 3);
    assert_eq!(summary["cleanup"]["outcome"], "removed");

    let log = String::from_utf8_lossy(&out.stderr);
    assert!(log.contains("Custom/ct_symA@libfoo.so"), "log: {log}");
    assert!(log.contains("Custom/ct_symB@libfoo.so"), "log: {log}");
    assert_eq!(
        std::fs::read_dir(&artifacts).expect("list artifacts").count(),
        0
    );
}

#[test]
fn help_prints_usage_and_exits_one() {
    for flag in ["-h", "--help"] {
        let out = Command::new(env!("CARGO_BIN_EXE_perfrelay"))
            .arg(flag)
            .output()
            .expect("run perfrelay");
        assert_eq!(out.status.code(), Some(1));
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.contains("<license-key>"), "stdout: {stdout}");
    }
}

#[test]
fn missing_program_prints_usage() {
    let out = Command::new(env!("CARGO_BIN_EXE_perfrelay"))
        .arg("LICENSE")
        .output()
        .expect("run perfrelay");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stdout).contains("<license-key>"));
}

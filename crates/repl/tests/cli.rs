//! CLI tests: run the built binary against script files and check exit
//! codes and output.

use std::path::PathBuf;
use std::process::{Command, Output};

fn run_script(source: &str) -> Output {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("script.jmpl");
    std::fs::write(&path, source).expect("write script");
    Command::new(env!("CARGO_BIN_EXE_jmpl"))
        .arg(&path)
        .output()
        .expect("run jmpl")
}

#[test]
fn test_runs_script_successfully() {
    let output = run_script("let x := 1 + 2 * 3\nprintln(x)\n");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "7\n");
}

#[test]
fn test_compile_error_exits_65() {
    let output = run_script("let := 1\n");
    assert_eq!(output.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error"), "stderr: {stderr}");
}

#[test]
fn test_runtime_error_exits_70() {
    let output = run_script("println(1 / 0)\n");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Runtime error"), "stderr: {stderr}");
    assert!(stderr.contains("in script"), "stderr: {stderr}");
}

#[test]
fn test_missing_file_exits_74() {
    let missing = PathBuf::from("definitely-not-here.jmpl");
    let output = Command::new(env!("CARGO_BIN_EXE_jmpl"))
        .arg(&missing)
        .output()
        .expect("run jmpl");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn test_extra_arguments_exit_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_jmpl"))
        .args(["a.jmpl", "b.jmpl"])
        .output()
        .expect("run jmpl");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_stress_gc_flag_runs_clean() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("script.jmpl");
    std::fs::write(
        &path,
        "let s := {x \u{2208} {1 \u{2026} 30} | x % 2 == 0}\nprintln(#s)\nprintln(\"a\" + \"b\" + \"c\")\n",
    )
    .expect("write script");

    let output = Command::new(env!("CARGO_BIN_EXE_jmpl"))
        .arg("--stress-gc")
        .arg(&path)
        .output()
        .expect("run jmpl");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "15\nabc\n");
}

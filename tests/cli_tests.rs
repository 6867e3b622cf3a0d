//! CLI smoke tests driving the real binary
//!
//! Exit codes: 0 success, 1 verification failure, 2 usage error,
//! 3 OpenPGP failure, 4 I/O error.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn mantree() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mantree"));
    cmd.env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_create_then_verify() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    fs::write(tmp.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
    fs::write(tmp.path().join("README.md"), "# readme\n").unwrap();

    let status = mantree()
        .args(["create", "-H", "SHA256 SHA512", "-t"])
        .arg(tmp.path())
        .status()
        .expect("failed to run create");
    assert!(status.success(), "CLI create failed");

    let manifest = fs::read_to_string(tmp.path().join("Manifest")).unwrap();
    assert!(manifest.contains("DATA src/lib.rs"));
    assert!(manifest.contains("TIMESTAMP "));

    let output = mantree()
        .arg("verify")
        .arg(tmp.path())
        .output()
        .expect("failed to run verify");
    assert!(
        output.status.success(),
        "CLI verify failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("validated in"), "unexpected output: {}", stdout);
}

#[test]
fn test_verify_failure_exits_one() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("data.txt"), "original\n").unwrap();

    let status = mantree()
        .args(["create", "-H", "SHA256"])
        .arg(tmp.path())
        .status()
        .expect("failed to run create");
    assert!(status.success());

    fs::write(tmp.path().join("data.txt"), "tampered\n").unwrap();

    let output = mantree()
        .args(["verify", "--keep-going"])
        .arg(tmp.path())
        .output()
        .expect("failed to run verify");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("data.txt"), "stderr: {}", stderr);
}

#[test]
fn test_update_after_change() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.txt"), "one\n").unwrap();

    assert!(mantree()
        .args(["create", "-H", "SHA256"])
        .arg(tmp.path())
        .status()
        .unwrap()
        .success());

    fs::write(tmp.path().join("a.txt"), "two\n").unwrap();
    fs::write(tmp.path().join("b.txt"), "new\n").unwrap();

    assert!(mantree()
        .args(["update", "-H", "SHA256"])
        .arg(tmp.path())
        .status()
        .unwrap()
        .success());

    assert!(mantree()
        .arg("verify")
        .arg(tmp.path())
        .status()
        .unwrap()
        .success());
}

#[test]
fn test_unknown_profile_is_usage_error() {
    let tmp = TempDir::new().unwrap();
    let output = mantree()
        .args(["create", "-p", "not-a-profile"])
        .arg(tmp.path())
        .output()
        .expect("failed to run create");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unsupported_hash_is_usage_error() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("f.txt"), "x").unwrap();
    let output = mantree()
        .args(["hash", "-H", "GOST"])
        .arg(tmp.path().join("f.txt"))
        .output()
        .expect("failed to run hash");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_hash_command_output() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("hello.txt");
    fs::write(&file, "hello\n").unwrap();

    let output = mantree()
        .args(["hash", "-H", "SHA256 MD5"])
        .arg(&file)
        .output()
        .expect("failed to run hash");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("SIZE 6"));
    assert!(stdout
        .contains("5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"));
    assert!(stdout.contains("b1946ac92492d2347c6235b4d2611184"));
}

#[test]
fn test_missing_file_is_io_error() {
    let output = mantree()
        .args(["hash", "-H", "SHA256", "/nonexistent/missing-file"])
        .output()
        .expect("failed to run hash");
    assert_eq!(output.status.code(), Some(4));
}

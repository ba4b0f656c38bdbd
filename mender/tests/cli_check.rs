//! CLI tests for `mender check`, `mender init` and `mender recall`.
//!
//! Spawns the mender binary in a temp directory and verifies exit codes and
//! the files it leaves behind.

use std::fs;
use std::process::{Command, Output};

use mender::exit_codes;
use mender::io::config::{DEFAULT_CONFIG_PATH, MemoryConfig};
use mender::io::memory_store::{EpisodicMemory, MemoryStore};

fn mender(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mender"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn mender")
}

#[test]
fn check_safe_program_exits_ok() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("prog.py"), "import math\nprint(math.sqrt(16))\n")
        .expect("write program");

    let output = mender(temp.path(), &["check", "prog.py"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "Safe");
}

#[test]
fn check_denylisted_import_exits_unsafe() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("prog.py"), "import os\nos.system('ls')\n")
        .expect("write program");

    let output = mender(temp.path(), &["check", "prog.py"]);

    assert_eq!(output.status.code(), Some(exit_codes::UNSAFE));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Importing 'os' is not allowed."));
}

#[test]
fn check_missing_file_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = mender(temp.path(), &["check", "absent.py"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("absent.py"));
}

#[test]
fn check_honors_configured_denylist() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("strict.toml"),
        "[safety]\nextra_imports = [\"math\"]\n",
    )
    .expect("write config");
    fs::write(temp.path().join("prog.py"), "import math\n").expect("write program");

    let output = mender(temp.path(), &["--config", "strict.toml", "check", "prog.py"]);

    assert_eq!(output.status.code(), Some(exit_codes::UNSAFE));
}

#[test]
fn init_writes_config_and_memory_dir() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = mender(temp.path(), &["init"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(DEFAULT_CONFIG_PATH).is_file());
    assert!(temp.path().join(".mender/memory").is_dir());

    let again = mender(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&again.stdout).contains("config exists"));
}

#[test]
fn recall_lists_stored_solutions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::open(&temp.path().join(".mender/memory"), &MemoryConfig::default())
        .expect("open store");
    store
        .store_success("reverse a string", "print('abc'[::-1])")
        .expect("store success");
    drop(store);

    let output = mender(temp.path(), &["recall", "reverse a string"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("similar solved tasks: 1"));
    assert!(stdout.contains("    print('abc'[::-1])"));
}

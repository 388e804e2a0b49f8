use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn relay() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sqlite-relay"));
    cmd.env_remove("SQLITE_RELAY_AUTH_KEY").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_both_roles() {
    let output = relay().arg("--help").output().expect("Failed to execute command");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("watch"));
    assert!(stdout.contains("sync"));
}

#[test]
fn test_watch_missing_database_fails() {
    let temp_dir = tempdir().unwrap();
    let db = temp_dir.path().join("absent.db");

    let output = relay()
        .arg("watch")
        .arg(&db)
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
}

#[test]
fn test_unreadable_config_file_fails() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("relay.toml");
    fs::write(&config, "bind_port = \"not a number\"\n").unwrap();

    let output = relay()
        .arg("--config-file")
        .arg(&config)
        .arg("watch")
        .arg(temp_dir.path().join("x.db"))
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse config file"), "stderr: {stderr}");
}

#[test]
fn test_sync_without_remote_fails() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("relay.toml");
    fs::write(
        &config,
        format!("sync_file = {:?}\n", temp_dir.path().join("replica.db")),
    )
    .unwrap();

    let output = relay()
        .arg("sync")
        .arg("--config-file")
        .arg(&config)
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No remote given"), "stderr: {stderr}");
}

use std::process::Command;

#[test]
fn cli_produce_publishes_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("cfg.json");
    let cfg = serde_json::json!({
        "shm": {"dir": dir.path(), "name": "smoke"}
    });
    std::fs::write(&cfg_path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();

    let exe = env!("CARGO_BIN_EXE_cubestream");
    let out = Command::new(exe)
        .args(["produce", "--eyes", "1", "--resolution", "16", "--frames", "3", "--fps", "100"])
        .arg("--config")
        .arg(&cfg_path)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "produce failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stderr).contains("published 3 frames"));

    assert!(!dir.path().join("smoke").exists());
    assert!(!dir.path().join("smoke-producer.lock").exists());
}

#[test]
fn cli_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("cfg.json");
    std::fs::write(&cfg_path, r#"{"receiver": {"cubemap-queue-size": 0}}"#).unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_cubestream"))
        .args(["produce", "--frames", "1"])
        .arg("--config")
        .arg(&cfg_path)
        .output()
        .unwrap();
    assert!(!out.status.success());
}

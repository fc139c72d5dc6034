use serde_json::{json, Value};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn ruckd(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ruckd"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env_remove("RUCK_DEBUG_LOG")
        .env("RUST_LOG", "warn")
        .output()
        .expect("run ruckd")
}

fn write_walk(path: &Path, fixes: usize) {
    let locations: Vec<Value> = (0..fixes)
        .map(|i| {
            json!({
                "latitude": 47.0 + (i as f64 * 10.0) / 111_195.08,
                "longitude": 8.0,
                "altitude": 400.0,
                "horizontal_accuracy_m": 5.0,
                "timestamp": format!("2026-03-01T08:{:02}:{:02}Z", (i * 10) / 60, (i * 10) % 60),
            })
        })
        .collect();
    let replay = json!({
        "ruck_weight_kg": 15.0,
        "user_weight_kg": 75.0,
        "locations": locations,
        "heart_rates": [
            { "bpm": 110, "timestamp": "2026-03-01T08:00:05Z" },
            { "bpm": 125, "timestamp": "2026-03-01T08:00:45Z" }
        ],
    });
    std::fs::write(path, serde_json::to_vec_pretty(&replay).unwrap()).unwrap();
}

#[test]
fn replay_completes_and_delivers_everything() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("walk.json");
    write_walk(&file, 10);

    let output = ruckd(
        temp.path(),
        &[
            "replay",
            file.to_str().unwrap(),
            "--outage-from",
            "20",
            "--outage-secs",
            "30",
        ],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["state"], "completed");
    assert_eq!(summary["pending_uploads"], 0);
    assert_eq!(summary["samples_replayed"], 12);
    assert_eq!(summary["delivered"]["locations"], 10);
    assert_eq!(summary["delivered"]["heart_rates"], 2);
    let distance = summary["distance_km"].as_f64().unwrap();
    assert!((distance - 0.09).abs() < 0.001, "distance was {}", distance);
    assert!(summary["delivered"]["completion"].is_object());

    // Completed and drained: nothing left to recover.
    let inspect = ruckd(temp.path(), &["inspect"]);
    assert!(inspect.status.success());
    assert_eq!(String::from_utf8_lossy(&inspect.stdout).trim(), "null");
}

#[test]
fn inspect_and_clear_work_on_an_empty_store() {
    let temp = TempDir::new().unwrap();

    let inspect = ruckd(temp.path(), &["inspect"]);
    assert!(inspect.status.success());
    assert_eq!(String::from_utf8_lossy(&inspect.stdout).trim(), "null");

    let clear = ruckd(temp.path(), &["clear"]);
    assert!(clear.status.success());
}

#[test]
fn replay_of_a_missing_file_fails() {
    let temp = TempDir::new().unwrap();
    let output = ruckd(temp.path(), &["replay", "does-not-exist.json"]);
    assert!(!output.status.success());
}

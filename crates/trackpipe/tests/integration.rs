use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn trackpipe_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("trackpipe");
    path
}

const RAW_CSV: &str = "\
track_id,track_name,artist,duration,danceability,energy,explicit,tempo
t1,Opening,Alpha,3:45,0.81,0.72,false,120
t2,Middle,Beta;Gamma,garbage,0.40,0.91,true,98
t3,Closing,Alpha,1:02:03,55,30,no,140
";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let raw_dir = root.join("objects/raw");
    fs::create_dir_all(&raw_dir).unwrap();
    fs::write(raw_dir.join("tracks.csv"), RAW_CSV).unwrap();

    let config_content = format!(
        r#"[store]
path = "{root}/data/trackpipe.sqlite"

[objects]
backend = "local"
root = "{root}/objects"

[load]
batch_size = 2
retry_base_ms = 1
retry_max_ms = 5

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("trackpipe.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_trackpipe(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = trackpipe_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RAW_BUCKET")
        .env_remove("TRANSFORMED_BUCKET")
        .env_remove("DB_NAME")
        .env_remove("OBJECTS_ROOT")
        .env_remove("BATCH_SIZE")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run trackpipe binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let (stdout, stderr, success) = run_trackpipe(config_path, args);
    assert!(success, "{:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("bad JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_trackpipe(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/trackpipe.sqlite").exists());

    // Idempotent
    let (_, stderr, success) = run_trackpipe(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_transform_load_query() {
    let (tmp, config_path) = setup_test_env();

    let report = run_json(&config_path, &["transform", "tracks.csv"]);
    assert_eq!(report["status"], "ok");
    assert_eq!(report["rows"], 3);
    assert_eq!(report["warnings"], 1);
    assert_eq!(report["warnings_by_field"]["duration"], 1);
    assert_eq!(report["output_key"], "tracks_transformed.csv");

    let transformed =
        fs::read_to_string(tmp.path().join("objects/transformed/tracks_transformed.csv")).unwrap();
    let header = transformed.lines().next().unwrap();
    assert_eq!(
        header,
        "track_id,title,artists,album,genre,duration,popularity,danceability,energy,explicit,\
         duration_seconds,popularity_tier,danceability_label,energy_label,content_label,tempo"
    );

    let load = run_json(&config_path, &["load", "tracks_transformed.csv"]);
    assert_eq!(load["status"], "completed");
    assert_eq!(load["rows_read"], 3);
    assert_eq!(load["rows_committed"], 3);
    assert_eq!(load["batches_attempted"], 2);
    assert_eq!(load["next_batch"], 2);

    let songs = run_json(
        &config_path,
        &["query", r#"{"action": "songs_filtered", "limit": 10}"#],
    );
    assert_eq!(songs["version"], 1);
    let rows = songs["query_result"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    for row in rows {
        assert_eq!(row["popularity"], 0.0);
    }

    let stats = run_json(
        &config_path,
        &["query", "--action", "explicit_vs_clean_stats"],
    );
    let rows = stats["query_result"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["content_label"], "Clean");
    assert_eq!(rows[0]["track_count"], 2);
    assert_eq!(rows[1]["content_label"], "Explicit");
}

#[test]
fn test_reload_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    run_json(&config_path, &["transform", "tracks.csv"]);
    run_json(&config_path, &["load", "tracks_transformed.csv"]);

    let again = run_json(&config_path, &["load", "tracks_transformed.csv"]);
    assert_eq!(again["status"], "completed");
    assert_eq!(again["rows_committed"], 0);
    assert_eq!(again["batches_resumed"], 2);

    let full = run_json(&config_path, &["load", "tracks_transformed.csv", "--full"]);
    assert_eq!(full["rows_committed"], 3);

    let (stdout, stderr, success) = run_trackpipe(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Tracks:      3"));
    assert!(stdout.contains("s3://transformed/tracks_transformed.csv"));
}

#[test]
fn test_batch_size_change_requires_full() {
    let (_tmp, config_path) = setup_test_env();
    run_json(&config_path, &["transform", "tracks.csv"]);
    run_json(&config_path, &["load", "tracks_transformed.csv"]);

    let (_, stderr, success) = run_trackpipe(
        &config_path,
        &["load", "tracks_transformed.csv", "--batch-size", "3"],
    );
    assert!(!success);
    assert!(stderr.contains("batch size 2"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_query_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_trackpipe(&config_path, &["query", r#"{"action": "drop_table"}"#]);
    assert!(!success);
    assert!(stderr.contains("drop_table"), "stderr: {}", stderr);

    let (_, _, success) = run_trackpipe(
        &config_path,
        &["query", "--action", "top_artists", "--metric", "1=1"],
    );
    assert!(!success);
}

#[test]
fn test_missing_object_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_trackpipe(&config_path, &["transform", "absent.csv"]);
    assert!(!success);
    assert!(stderr.contains("absent.csv"), "stderr: {}", stderr);
}

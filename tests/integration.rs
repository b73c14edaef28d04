use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn semsearch_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("semsearch");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let notes_dir = root.join("notes");
    fs::create_dir_all(notes_dir.join("drafts")).unwrap();
    fs::write(
        notes_dir.join("2024-05-01.md"),
        "# Release day\n\nTagged version one of the parser and wrote the changelog.",
    )
    .unwrap();
    fs::write(
        notes_dir.join("2024-05-02.md"),
        "# Garden\n\nPlanted tomatoes and basil along the south fence.",
    )
    .unwrap();
    fs::write(
        notes_dir.join("drafts").join("ideas.txt"),
        "Kubernetes operator for the nightly backup job.\n\nMaybe use a CronJob.",
    )
    .unwrap();
    fs::write(notes_dir.join("image.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/semsearch.sqlite"

[index]
path = "{root}/data/semsearch.index"

[scanner]
root = "{root}/notes"
extensions = ["md", "txt"]

[chunking]
max_tokens = 300
overlap_tokens = 30

[retrieval]
k = 5
"#,
        root = root.display()
    );

    let config_path = config_dir.join("semsearch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_semsearch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = semsearch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run semsearch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_semsearch_in(dir: &Path, config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(semsearch_binary())
        .current_dir(dir)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap();
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn index(config_path: &Path) -> serde_json::Value {
    let (stdout, stderr, success) =
        run_semsearch(config_path, &["index", "--progress", "off", "--json"]);
    assert!(success, "index failed: {}", stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, success) = run_semsearch(&config, &["init"]);
    assert!(success);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("semsearch.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success) = run_semsearch(&config, &["init"]);
    assert!(success);
    let (_, _, success) = run_semsearch(&config, &["init"]);
    assert!(success);
}

#[test]
fn test_index_reports_documents() {
    let (_tmp, config) = setup_test_env();
    let report = index(&config);
    assert_eq!(report["documents_scanned"], 3);
    assert_eq!(report["documents_updated"], 3);
    assert_eq!(report["documents_failed"], 0);
    assert!(report["chunks_written"].as_u64().unwrap() >= 3);
}

#[test]
fn test_index_twice_changes_nothing() {
    let (_tmp, config) = setup_test_env();
    index(&config);
    let report = index(&config);
    assert_eq!(report["documents_updated"], 0);
    assert_eq!(report["documents_unchanged"], 3);
    assert_eq!(report["chunks_written"], 0);
}

#[test]
fn test_index_picks_up_edits_and_removals() {
    let (tmp, config) = setup_test_env();
    index(&config);

    let notes = tmp.path().join("notes");
    fs::write(
        notes.join("2024-05-02.md"),
        "# Garden\n\nThe tomatoes need stakes.",
    )
    .unwrap();
    fs::remove_file(notes.join("drafts").join("ideas.txt")).unwrap();

    let report = index(&config);
    assert_eq!(report["documents_updated"], 1);
    assert_eq!(report["documents_removed"], 1);
    assert_eq!(report["documents_unchanged"], 1);
}

#[test]
fn test_index_missing_root_fails() {
    let (tmp, config) = setup_test_env();
    let missing = tmp.path().join("nowhere");
    let (_, _, success) = run_semsearch(
        &config,
        &["index", missing.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success);
}

#[test]
fn test_search_finds_relevant_note() {
    let (_tmp, config) = setup_test_env();
    index(&config);

    let (stdout, stderr, success) =
        run_semsearch(&config, &["search", "tomatoes basil fence", "--json"]);
    assert!(success, "search failed: {}", stderr);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let top = &results[0]["record"];
    assert!(top["document_path"]
        .as_str()
        .unwrap()
        .ends_with("2024-05-02.md"));
    assert_eq!(top["doc_date"], "2024-05-02");
}

#[test]
fn test_search_relative_path_filter() {
    let (tmp, config) = setup_test_env();
    index(&config);

    let (stdout, stderr, success) = run_semsearch_in(
        tmp.path(),
        &config,
        &["search", "tomatoes kubernetes parser", "--path", "notes/drafts", "--json"],
    );
    assert!(success, "search failed: {}", stderr);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let results = results.as_array().unwrap();
    assert!(!results.is_empty());
    for r in results {
        assert!(r["record"]["document_path"]
            .as_str()
            .unwrap()
            .ends_with("ideas.txt"));
    }

    let notes = tmp.path().join("notes");
    let (stdout, _, success) = run_semsearch_in(
        &notes,
        &config,
        &["search", "tomatoes kubernetes parser", "--path", "./drafts/", "--json"],
    );
    assert!(success);
    let nested: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(nested.as_array().unwrap().len(), results.len());
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config) = setup_test_env();
    index(&config);

    let (first, _, _) = run_semsearch(&config, &["search", "parser release", "--json"]);
    let (second, _, _) = run_semsearch(&config, &["search", "parser release", "--json"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_before_index_is_empty() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_semsearch(&config, &["search", "anything"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_get_chunk_from_search() {
    let (_tmp, config) = setup_test_env();
    index(&config);

    let (stdout, _, _) = run_semsearch(&config, &["search", "changelog", "--json"]);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let id = results[0]["record"]["chunk_id"].as_str().unwrap().to_string();

    let (stdout, _, success) = run_semsearch(&config, &["get", &id]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("changelog"));
}

#[test]
fn test_get_missing_chunk() {
    let (_tmp, config) = setup_test_env();
    index(&config);
    let (_, stderr, success) = run_semsearch(&config, &["get", "no-such-chunk"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_stats_after_index() {
    let (_tmp, config) = setup_test_env();
    index(&config);

    let (stdout, _, success) = run_semsearch(&config, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["store"]["documents"], 3);
    assert_eq!(stats["index"]["vectors"], stats["store"]["chunks"]);

    let (stdout, _, success) = run_semsearch(&config, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Stores consistent."));
}

#[test]
fn test_ask_without_evidence_needs_no_backend() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) =
        run_semsearch(&config, &["ask", "what did I plant?", "--json"]);
    assert!(success, "ask failed: {}", stderr);
    let answer: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(answer["evidence"].as_array().unwrap().is_empty());
    assert!(answer["backend"].is_null());
}

#[test]
fn test_ask_with_unreachable_backend_fails() {
    let (tmp, config) = setup_test_env();
    let mut content = fs::read_to_string(&config).unwrap();
    content.push_str(
        r#"
[inference]
timeout_secs = 5

[inference.local]
provider = "ollama"
model = "llama3"
url = "http://127.0.0.1:9"
"#,
    );
    let config = tmp.path().join("config").join("unreachable.toml");
    fs::write(&config, content).unwrap();
    index(&config);

    let (_, _, success) = run_semsearch(&config, &["ask", "tomatoes basil fence"]);
    assert!(!success);
}

#[test]
fn test_ask_rejects_bad_mode() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_semsearch(&config, &["ask", "hello", "--mode", "poetry"]);
    assert!(!success);
    assert!(stderr.contains("--mode"));
}

#[test]
fn test_config_prints_effective_values() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_semsearch(&config, &["config"]);
    assert!(success);
    assert!(stdout.contains("[retrieval]"));
    assert!(stdout.contains("k = 5"));
    assert!(stdout.contains("agent_max_rounds = 3"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.toml");
    let (_, stderr, success) = run_semsearch(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("config file not found"));
}

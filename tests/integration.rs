use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn hrq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("hrq");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Store layout: one directory per role prefix
    let store = root.join("store");
    fs::create_dir_all(store.join("employee")).unwrap();
    fs::create_dir_all(store.join("executive")).unwrap();
    fs::write(
        store.join("employee").join("Leave-Policy.md"),
        "# Leave Policy\n\nTo apply for leave, submit a request in the HR portal at least two weeks ahead.\n\nYour manager must approve leave before it starts.",
    )
    .unwrap();
    fs::write(
        store.join("employee").join("Expenses.md"),
        "# Expenses\n\nTravel expenses are reimbursed monthly after finance review of receipts.",
    )
    .unwrap();
    fs::write(
        store.join("executive").join("Bonus-Plan.md"),
        "# Bonus Plan\n\nExecutive bonus payouts are approved by the board compensation committee.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"

[store]
kind = "filesystem"
root = "{root}/store"
include_globs = ["**/*.md", "**/*.txt"]

[chunking]
chunk_size = 400
chunk_overlap = 80

[embedding]
provider = "hashed"
dims = 256

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("hrq.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hrq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = hrq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hrq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn line_for<'a>(stdout: &'a str, role: &str) -> &'a str {
    stdout
        .lines()
        .find(|l| l.starts_with(role))
        .unwrap_or_else(|| panic!("no line for {} in: {}", role, stdout))
}

#[test]
fn test_sync_all_roles() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_hrq(&config_path, &["sync", "all"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(line_for(&stdout, "employee").contains("+2 ~0 -0 =0"));
    assert!(line_for(&stdout, "employee").contains("(index rebuilt)"));
    assert!(line_for(&stdout, "executive").contains("+1 ~0 -0 =0"));
    assert!(line_for(&stdout, "master").contains("+0 ~0 -0 =0"));
}

#[test]
fn test_resync_is_incremental() {
    let (tmp, config_path) = setup_test_env();

    let (_, _, success) = run_hrq(&config_path, &["sync", "employee"]);
    assert!(success);

    let (stdout, _, success) = run_hrq(&config_path, &["sync", "employee"]);
    assert!(success);
    let line = line_for(&stdout, "employee");
    assert!(line.contains("+0 ~0 -0 =2"), "unexpected: {}", line);
    assert!(!line.contains("(index rebuilt)"));

    fs::write(
        tmp.path().join("store").join("employee").join("Expenses.md"),
        "# Expenses\n\nExpenses are reimbursed weekly once receipts are uploaded to the portal.",
    )
    .unwrap();
    fs::remove_file(tmp.path().join("store").join("employee").join("Leave-Policy.md")).unwrap();

    let (stdout, _, success) = run_hrq(&config_path, &["sync", "employee"]);
    assert!(success);
    let line = line_for(&stdout, "employee");
    assert!(line.contains("+0 ~1 -1 =0"), "unexpected: {}", line);
    assert!(line.contains("(index rebuilt)"));
}

#[test]
fn test_forced_sync_refetches_and_rebuild_uses_mirror() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_hrq(
        &config_path,
        &["answer", "employee", "How do I apply for leave?"],
    );
    assert!(success);

    let (stdout, stderr, success) = run_hrq(&config_path, &["sync", "employee", "--force"]);
    assert!(success, "forced sync failed: stderr={}", stderr);
    let line = line_for(&stdout, "employee");
    assert!(line.contains("+2 ~0 -0 =0"), "unexpected: {}", line);
    assert!(line.contains("(index rebuilt)"));

    let (stdout, _, _) = run_hrq(&config_path, &["cache", "stats"]);
    assert!(stdout.contains("entries:  0/512"), "stdout={}", stdout);

    let (stdout, stderr, success) = run_hrq(&config_path, &["rebuild", "all"]);
    assert!(success, "rebuild failed: stderr={}", stderr);
    assert!(line_for(&stdout, "employee").contains("over 2 documents"));
    assert!(line_for(&stdout, "executive").contains("over 0 documents"));
}

#[test]
fn test_sync_unknown_role_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_hrq(&config_path, &["sync", "contractor"]);
    assert!(!success);
    assert!(stderr.contains("contractor"), "stderr={}", stderr);
}

#[test]
fn test_query_finds_leave_policy() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_hrq(
        &config_path,
        &["query", "employee", "How do I apply for leave?"],
    );
    assert!(success, "query failed: stderr={}", stderr);
    assert!(stdout.starts_with("1. Leave-Policy.md"), "stdout={}", stdout);
    assert_eq!(stdout.matches("Leave-Policy.md").count(), 1);
}

#[test]
fn test_query_respects_role() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_hrq(
        &config_path,
        &["query", "executive", "executive bonus payouts"],
    );
    assert!(success);
    assert!(stdout.contains("Bonus-Plan.md"));

    let (stdout, _, success) = run_hrq(
        &config_path,
        &["query", "employee", "executive bonus payouts"],
    );
    assert!(success);
    assert!(!stdout.contains("Bonus-Plan.md"));
}

#[test]
fn test_query_no_match() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_hrq(
        &config_path,
        &["query", "employee", "What is the cryptocurrency policy?"],
    );
    assert!(success);
    assert!(stdout.contains("No policy passage matched this question."));
}

#[test]
fn test_query_too_short_fails_with_guidance() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_hrq(&config_path, &["query", "employee", "a"]);
    assert!(!success);
    assert!(stderr.contains("too short"), "stderr={}", stderr);
}

#[test]
fn test_query_json_output() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_hrq(
        &config_path,
        &["query", "employee", "How do I apply for leave?", "--json", "--top-k", "1"],
    );
    assert!(success);
    let body: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(body["role"], "employee");
    assert_eq!(body["status"]["state"], "fresh");
    assert_eq!(body["passages"].as_array().unwrap().len(), 1);
    assert_eq!(body["passages"][0]["title"], "Leave-Policy.md");
}

#[test]
fn test_answer_is_cached_across_runs() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_hrq(
        &config_path,
        &["answer", "employee", "How do I apply for leave?"],
    );
    assert!(success, "answer failed: stderr={}", stderr);
    assert!(stdout.contains("(Source: Leave-Policy.md)"));
    assert!(stdout.contains("Sources:"));
    assert!(!stderr.contains("(cached)"));

    let (_, stderr, success) = run_hrq(
        &config_path,
        &["answer", "employee", "how do I apply for LEAVE?"],
    );
    assert!(success);
    assert!(stderr.contains("(cached)"));

    let (stdout, _, success) = run_hrq(&config_path, &["cache", "stats"]);
    assert!(success);
    assert!(stdout.contains("entries:  1/512"), "stdout={}", stdout);

    let (stdout, _, success) = run_hrq(&config_path, &["cache", "clear", "--role", "employee"]);
    assert!(success);
    assert!(stdout.contains("Removed 1 cached response(s)."));

    let (stdout, _, _) = run_hrq(&config_path, &["cache", "stats"]);
    assert!(stdout.contains("entries:  0/512"));
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_hrq(&config_path, &["stats", "employee"]);
    assert!(success);
    assert!(stdout.contains("last sync:    never"));

    run_hrq(&config_path, &["sync", "employee"]);
    let (stdout, stderr, success) = run_hrq(&config_path, &["stats", "employee"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("role:         employee"));
    assert!(stdout.contains("documents:    2"));
    assert!(!stdout.contains("(stale)"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_hrq(&tmp.path().join("nope.toml"), &["stats", "employee"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config").join("bad.toml");
    fs::write(
        &bad,
        format!(
            "[storage]\ndata_dir = \"{0}/data\"\n\n[store]\nkind = \"filesystem\"\nroot = \"{0}/store\"\n\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_hrq(&bad, &["stats", "employee"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"), "stderr={}", stderr);
}

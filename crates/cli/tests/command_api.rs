use assert_cmd::Command;
use base64::Engine as _;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const BLOCK: usize = 1024;

/// Store with one-block atoms so reuse is predictable
fn setup_store() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("atomstore.toml"),
        "[chunker]\nmin_size = 1024\ntarget_size = 1024\nmax_size = 1024\nwindow_size = 16\n",
    )
    .unwrap();
    temp
}

fn block(seed: u8) -> Vec<u8> {
    (0..BLOCK)
        .map(|i| ((i * 7 + usize::from(seed) * 131) % 251) as u8 ^ seed)
        .collect()
}

fn blocks(seeds: &[u8]) -> Vec<u8> {
    seeds.iter().flat_map(|&seed| block(seed)).collect()
}

#[allow(deprecated)]
fn run_cli_raw(root: &Path, request: &Value) -> (bool, Value) {
    let output = Command::cargo_bin("atomstore")
        .expect("binary")
        .arg("--store")
        .arg(root.join("store"))
        .arg("--config")
        .arg(root.join("atomstore.toml"))
        .arg("command")
        .arg("--json")
        .arg(request.to_string())
        .output()
        .expect("command run");

    let body: Value = serde_json::from_slice(&output.stdout).expect("valid json");
    (output.status.success(), body)
}

fn run_cli(root: &Path, request: Value) -> Value {
    let (ok, body) = run_cli_raw(root, &request);
    assert!(ok, "request: {request}\nresponse: {body}");
    assert_eq!(body["status"], "ok");
    body["data"].clone()
}

fn upload(root: &Path, filename: &str, data: &[u8]) -> Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    run_cli(
        root,
        json!({
            "action": "analyze_file",
            "payload": {"filename": filename, "content_base64": encoded}
        }),
    )
}

#[test]
fn shared_blocks_are_stored_once_across_invocations() {
    let temp = setup_store();
    let root = temp.path();

    let a = upload(root, "a.bin", &blocks(&[1, 2, 3]));
    assert_eq!(a["atoms_created"], 3);
    assert_eq!(a["atoms_reused"], 0);
    assert_eq!(a["size"], 3 * BLOCK);

    let b = upload(root, "b.bin", &blocks(&[1, 2, 4]));
    assert_eq!(b["atoms_created"], 1);
    assert_eq!(b["atoms_reused"], 2);
    assert_eq!(b["storage_saved"], 2 * BLOCK);

    let stats = run_cli(root, json!({"action": "dedup_stats", "payload": {"top": 2}}));
    assert_eq!(stats["total_files"], 2);
    assert_eq!(stats["unique_atoms"], 4);
    assert_eq!(stats["total_atoms"], 6);
    assert_eq!(stats["storage_saved"], 2 * BLOCK);
    let top = stats["top_atoms"].as_array().unwrap();
    assert_eq!(top.len(), 2);
    assert!(top.iter().all(|atom| atom["usage_count"] == 2));

    let atoms = run_cli(
        root,
        json!({"action": "file_atoms", "payload": {"hash": b["hash"]}}),
    );
    let flags: Vec<bool> = atoms["atoms"]
        .as_array()
        .unwrap()
        .iter()
        .map(|atom| atom["is_new"].as_bool().unwrap())
        .collect();
    assert_eq!(flags, vec![false, false, true]);
    assert_eq!(atoms["atoms"][0]["reuse_count"], 2);

    let verify = run_cli(root, json!({"action": "verify"}));
    assert_eq!(verify["ok"], true);
    assert_eq!(verify["orphans"], 0);
}

#[test]
fn atom_detail_and_search() {
    let temp = setup_store();
    let root = temp.path();
    upload(root, "first.txt", &blocks(&[9]));
    upload(root, "second.txt", &blocks(&[9]));

    let hash = atomstore_store::fingerprint(&block(9)).to_string();
    let detail = run_cli(root, json!({"action": "atom_detail", "payload": {"hash": hash}}));
    assert_eq!(detail["hash"], hash.as_str());
    assert_eq!(detail["usage_count"], 2);
    assert_eq!(detail["size"], BLOCK);
    assert_eq!(detail["files"], json!(["first.txt", "second.txt"]));
    assert!(detail["created_at"].as_str().unwrap().ends_with('Z'));

    let two = run_cli(
        root,
        json!({"action": "search_atoms", "payload": {"query": &hash[..2]}}),
    );
    assert_eq!(two, json!({"atoms": [], "total": 0}));

    let three = run_cli(
        root,
        json!({"action": "search_atoms", "payload": {"query": hash[..3].to_uppercase()}}),
    );
    assert_eq!(three["total"], 1);
    assert_eq!(three["atoms"][0]["hash"], hash.as_str());
}

#[test]
fn delete_then_gc_survives_restarts() {
    let temp = setup_store();
    let root = temp.path();
    let a = upload(root, "a.bin", &blocks(&[1, 2]));
    upload(root, "b.bin", &blocks(&[2, 3]));

    let deleted = run_cli(
        root,
        json!({"action": "delete_file", "payload": {"file_id": a["file_id"]}}),
    );
    assert_eq!(deleted["atoms_unlinked"], 2);
    assert_eq!(deleted["orphaned"], 1);

    // The orphan is remembered by the next process.
    let verify = run_cli(root, json!({"action": "verify"}));
    assert_eq!(verify["orphans"], 1);

    let gc = run_cli(root, json!({"action": "gc"}));
    assert_eq!(gc["evicted"], 1);
    assert_eq!(gc["bytes_freed"], BLOCK);

    let gc_again = run_cli(root, json!({"action": "gc"}));
    assert_eq!(gc_again["evicted"], 0);

    let stats = run_cli(root, json!({"action": "dedup_stats"}));
    assert_eq!(stats["total_files"], 1);
    assert_eq!(stats["unique_atoms"], 2);
}

#[test]
fn errors_use_the_envelope() {
    let temp = setup_store();
    let root = temp.path();

    let (ok, body) = run_cli_raw(root, &json!({"action": "drop_everything"}));
    assert!(!ok);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], "invalid_input");

    let (ok, body) = run_cli_raw(
        root,
        &json!({"action": "atom_detail", "payload": {"hash": "0".repeat(64)}}),
    );
    assert!(!ok);
    assert_eq!(body["error"]["code"], "not_found");

    let (ok, body) = run_cli_raw(
        root,
        &json!({"action": "search_atoms", "payload": {"query": "   "}}),
    );
    assert!(!ok);
    assert_eq!(body["error"]["code"], "invalid_input");

    let (ok, body) = run_cli_raw(
        root,
        &json!({"action": "delete_file", "payload": {"file_id": "file-000404"}}),
    );
    assert!(!ok);
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["data"].is_null());
}

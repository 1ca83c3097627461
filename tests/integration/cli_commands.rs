#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn fixture() -> Value {
    json!({
        "keyspaces": [{
            "name": "product",
            "primary_index": "#primary",
            "docs": {
                "p1": {"a": 1, "b": "x"},
                "p2": {"a": 2, "b": "y"},
                "p3": {"a": 3, "b": "z"}
            },
            "indexes": [{"name": "ix_a", "keys": [{"identifier": "a"}]}]
        }],
        "query": {
            "from": {"keyspace": "product", "alias": "p"},
            "where": {"cmp": ["ge", {"field": [{"identifier": "p"}, "a"]}, {"literal": 2}]}
        }
    })
}

fn write_fixture(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("fixture.json");
    fs::write(&path, serde_json::to_vec_pretty(&fixture()).expect("json")).expect("write fixture");
    path
}

#[test]
fn explain_prints_the_plan_tree() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_fixture(&dir);
    let output = cargo_bin_cmd!("docql")
        .arg("explain")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("IndexScan"), "{text}");
    assert!(text.contains("ix_a"), "{text}");
    assert!(text.contains("plan_hash: "), "{text}");
}

#[test]
fn explain_json_is_machine_readable() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_fixture(&dir);
    let output = cargo_bin_cmd!("docql")
        .args(["explain", "--json"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["root"]["op"], "Sequence");
    assert!(json["plan_hash"].is_number());
}

#[test]
fn run_streams_rows_and_summarizes() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_fixture(&dir);
    let assert = cargo_bin_cmd!("docql").arg("run").arg(&path).assert().success();
    let output = assert.get_output();
    let stdout = String::from_utf8(output.stdout.clone()).expect("utf8");
    let mut bs: Vec<String> = stdout
        .lines()
        .map(|line| {
            let row: Value = serde_json::from_str(line).expect("json row");
            row["p"]["b"].as_str().expect("b").to_owned()
        })
        .collect();
    bs.sort();
    assert_eq!(bs, ["y", "z"]);

    let stderr = String::from_utf8(output.stderr.clone()).expect("utf8");
    assert!(stderr.contains("status: success"), "{stderr}");
    assert!(stderr.contains("rows: 2"), "{stderr}");
}

#[test]
fn invalid_config_file_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_fixture(&dir);
    let config = dir.path().join("docql.toml");
    fs::write(&config, "pipeline_cap = 0\n").expect("write config");
    let output = cargo_bin_cmd!("docql")
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("config"), "{stderr}");
}

#[test]
fn missing_fixture_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("docql")
        .arg("explain")
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure();
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

use std::path::PathBuf;
use std::process::Command;

fn host_binary() -> Option<PathBuf> {
    // Locate workspace root via CARGO_MANIFEST_DIR (this file lives in crates/pathfs-fuse-host)
    let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = crate_dir.parent().and_then(|p| p.parent())?.to_path_buf();
    let bin_path = workspace_root.join("target").join("debug").join("pathfs-fuse-host");
    if bin_path.exists() {
        Some(bin_path)
    } else {
        eprintln!("Skipping: binary not found at {}", bin_path.display());
        None
    }
}

#[test]
fn help_runs_without_mounting() {
    let Some(bin_path) = host_binary() else {
        return;
    };
    let output = Command::new(&bin_path)
        .arg("--help")
        .output()
        .expect("able to execute pathfs-fuse-host");

    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("--manual-loop"), "{text}");
    assert!(text.contains("--log-level"), "{text}");
}

#[test]
fn selftest_prints_a_passing_report() {
    let Some(bin_path) = host_binary() else {
        return;
    };
    let output = Command::new(&bin_path)
        .args(["--selftest", "--threads", "2"])
        .env_remove("RUST_LOG")
        .output()
        .expect("able to execute pathfs-fuse-host");

    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["open_handles"], 0);
    assert!(report["steps"].as_array().is_some_and(|steps| !steps.is_empty()));
}

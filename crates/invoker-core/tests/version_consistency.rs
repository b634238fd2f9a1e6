//! Workspace manifest checks: every member inherits the workspace version
//! and every crate directory is a member.

use std::path::{Path, PathBuf};

const CRATES: [&str; 2] = ["crates/invoker-domain", "crates/invoker-core"];

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .expect("workspace root")
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).expect("read manifest");
    text.parse().expect("parse manifest")
}

fn inherits_version(doc: &toml::Value) -> bool {
    doc.get("package")
        .and_then(|p| p.get("version"))
        .and_then(|v| v.get("workspace"))
        .and_then(toml::Value::as_bool)
        == Some(true)
}

#[test]
fn test_all_crates_inherit_workspace_version() {
    let root = workspace_root();
    for krate in CRATES {
        let doc = manifest(&root.join(krate));
        assert!(
            inherits_version(&doc),
            "{krate} should use version.workspace = true"
        );
    }
}

#[test]
fn test_workspace_version_matches_cargo_pkg() {
    let doc = manifest(&workspace_root());
    let version = doc["workspace"]["package"]["version"]
        .as_str()
        .expect("workspace version");
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_members_match_crate_directories() {
    let doc = manifest(&workspace_root());
    let mut members: Vec<&str> = doc["workspace"]["members"]
        .as_array()
        .expect("members")
        .iter()
        .filter_map(toml::Value::as_str)
        .collect();
    members.sort_unstable();

    let mut expected = CRATES.to_vec();
    expected.sort_unstable();
    assert_eq!(members, expected);
}

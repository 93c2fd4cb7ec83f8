#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a repo with a commit on main and uncommitted changes in the
/// working tree, ready for diffing against main.
pub fn setup_repo_with_change() -> tempfile::TempDir {
    let repo = tempfile::TempDir::new().unwrap();
    run_git(repo.path(), &["init"]);
    run_git(repo.path(), &["config", "user.email", "test@test.com"]);
    run_git(repo.path(), &["config", "user.name", "Test"]);
    std::fs::write(repo.path().join("lib.rs"), "fn one() {}\n").unwrap();
    std::fs::write(repo.path().join("auth.rs"), "fn login() {}\n").unwrap();
    run_git(repo.path(), &["add", "."]);
    run_git(repo.path(), &["commit", "-m", "init"]);
    run_git(repo.path(), &["branch", "-M", "main"]);

    // Working-tree edits, left uncommitted
    std::fs::write(repo.path().join("lib.rs"), "fn one() {}\nfn two() {}\n").unwrap();
    std::fs::write(repo.path().join("auth.rs"), "fn login() { todo!() }\n").unwrap();
    repo
}

/// Create a repo with a commit on main and a clean working tree.
pub fn setup_clean_repo() -> tempfile::TempDir {
    let repo = tempfile::TempDir::new().unwrap();
    run_git(repo.path(), &["init"]);
    run_git(repo.path(), &["config", "user.email", "test@test.com"]);
    run_git(repo.path(), &["config", "user.name", "Test"]);
    std::fs::write(repo.path().join("lib.rs"), "fn one() {}\n").unwrap();
    run_git(repo.path(), &["add", "."]);
    run_git(repo.path(), &["commit", "-m", "init"]);
    run_git(repo.path(), &["branch", "-M", "main"]);
    repo
}

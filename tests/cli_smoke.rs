use assert_cmd::Command;
use predicates::prelude::*;

fn depotsync() -> Command {
    Command::cargo_bin("depotsync").expect("binary builds")
}

#[test]
fn help_lists_subcommands() {
    depotsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("clone"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("unshelve"))
        .stdout(predicate::str::contains("branches"));
}

#[test]
fn version_prints() {
    depotsync()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("depotsync"));
}

#[test]
fn no_arguments_is_a_usage_error() {
    depotsync().assert().failure().code(2);
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    depotsync().arg("frobnicate").assert().failure().code(2);
}

#[test]
fn sync_outside_a_repository_fails() {
    let dir = tempfile::tempdir().unwrap();
    depotsync()
        .current_dir(dir.path())
        .args(["sync", "//depot/main/"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("git repository"));
}

#[test]
fn submit_outside_a_repository_fails() {
    let dir = tempfile::tempdir().unwrap();
    depotsync()
        .current_dir(dir.path())
        .arg("submit")
        .assert()
        .failure()
        .stderr(predicate::str::contains("git repository"));
}

#[test]
fn submit_continue_with_empty_queue_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    std::process::Command::new("git")
        .args(["init", "-q"])
        .current_dir(dir.path())
        .status()
        .unwrap();
    let state_file = depotsync::state::StateFile::in_git_dir(&dir.path().join(".git"));
    let mut state = depotsync::state::RunState::default();
    state.depot_paths.push("//depot/main/".to_string());
    state_file.save(&state).unwrap();

    depotsync()
        .current_dir(dir.path())
        .args(["submit", "--continue"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("pending commit queue is empty"));
}

#[test]
fn submit_continue_conflicts_with_dry_run() {
    depotsync()
        .args(["submit", "--continue", "--dry-run"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unshelve_requires_a_change_number() {
    depotsync()
        .args(["unshelve", "not-a-number"])
        .assert()
        .failure()
        .code(2);
}

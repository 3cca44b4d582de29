#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cds(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cds").unwrap();
    cmd.current_dir(dir.path())
        .env("CDS_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    cds(dir).arg("init").assert().success();
}

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

const CATALOG: &str = r#"
projects:
  - key: PRJ
    name: Demo
    environments: [prod]
    pipelines:
      - name: build
        stages:
          - name: compile
            actions: [Script]
      - name: deploy
        stages:
          - name: ship
            actions: [Script]
    applications:
      - name: api
        pipelines: [build, deploy]
    triggers:
      - source: { application: api, pipeline: build }
        dest: { application: api, pipeline: deploy }
        parameters:
          - name: script
            value: echo shipped by trigger
"#;

fn init_with_catalog(dir: &TempDir) {
    init_project(dir);
    let file = write(dir, "catalog.yaml", CATALOG);
    cds(dir).args(["catalog", "import", &file]).assert().success();
}

// ---------------------------------------------------------------------------
// cds init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_layout_and_builtins() {
    let dir = TempDir::new().unwrap();
    cds(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .cds/config.yaml"))
        .stdout(predicate::str::contains("action:  Script"));

    assert!(dir.path().join(".cds/config.yaml").exists());
    assert!(dir.path().join(".cds/cds.redb").exists());
    assert!(dir.path().join(".cds/plugins").is_dir());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    cds(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .cds/config.yaml"));
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    cds(&dir)
        .args(["action", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cds init"));
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    cds(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings"));
}

// ---------------------------------------------------------------------------
// cds action
// ---------------------------------------------------------------------------

#[test]
fn action_import_creates_then_updates() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(
        &dir,
        "greet.yaml",
        "name: Greet\ndescription: say hello\nsteps: [Script]\nparameters:\n  - name: token\n    type: password\n    value: s3cret\n",
    );

    cds(&dir)
        .args(["action", "import", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("created action 'Greet'"));
    cds(&dir)
        .args(["action", "import", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("updated action 'Greet'"));

    cds(&dir)
        .args(["action", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Greet"))
        .stdout(predicate::str::contains("Script"));

    cds(&dir)
        .args(["action", "show", "Greet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("**********"))
        .stdout(predicate::str::contains("s3cret").not());
    cds(&dir)
        .args(["action", "show", "Greet", "--show-passwords"])
        .assert()
        .success()
        .stdout(predicate::str::contains("s3cret"));
}

#[test]
fn action_list_json_is_parseable() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let out = cds(&dir)
        .args(["--json", "action", "list"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let actions: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(actions[0]["name"], "Script");
    assert_eq!(actions[0]["type"], "builtin");
}

#[test]
fn action_used_by_pipeline_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["action", "delete", "Script"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("conflict"));

    cds(&dir)
        .args(["action", "usage", "Script"])
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("deploy"));
}

#[test]
fn unused_action_can_be_deleted() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(&dir, "noop.yaml", "name: Noop\n");
    cds(&dir).args(["action", "import", &file]).assert().success();
    cds(&dir)
        .args(["action", "delete", "Noop"])
        .assert()
        .success();
    cds(&dir)
        .args(["action", "show", "Noop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("action 'Noop' not found"));
}

#[test]
fn import_cannot_create_builtin_actions() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(&dir, "foo.yaml", "name: Foo\ntype: builtin\n");
    cds(&dir)
        .args(["action", "import", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("only user and plugin actions"));

    let file = write(&dir, "off.yaml", "name: Off\nenabled: false\n");
    cds(&dir).args(["action", "import", &file]).assert().success();
    cds(&dir)
        .args(["action", "show", "Off"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled").not());
}

#[test]
fn action_audit_survives_delete() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(&dir, "noop.yaml", "name: Noop\ndescription: first\n");
    cds(&dir).args(["action", "import", &file]).assert().success();
    let file = write(&dir, "noop.yaml", "name: Noop\ndescription: second\n");
    cds(&dir).args(["action", "import", &file]).assert().success();

    let out = cds(&dir)
        .args(["--json", "action", "show", "Noop"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let id = serde_json::from_slice::<serde_json::Value>(&out).unwrap()["id"]
        .as_i64()
        .unwrap();

    cds(&dir)
        .args(["action", "audit", "Noop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("update"))
        .stdout(predicate::str::contains("first"));

    cds(&dir).args(["action", "delete", "Noop"]).assert().success();
    let out = cds(&dir)
        .args(["--json", "action", "audit", &format!("#{id}")])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let entries: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(entries[0]["change"], "delete");
    assert_eq!(entries[0]["previous"]["description"], "second");
    assert_eq!(entries[1]["change"], "update");
}

#[test]
fn action_requirements_lists_script_shell() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    cds(&dir)
        .args(["action", "requirements"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sh"))
        .stdout(predicate::str::contains("binary"));
}

// ---------------------------------------------------------------------------
// cds catalog
// ---------------------------------------------------------------------------

#[test]
fn catalog_import_and_show() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["catalog", "show", "PRJ"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api: build, deploy"))
        .stdout(predicate::str::contains("api/build/NoEnv"));
}

#[test]
fn catalog_rejects_unknown_stage_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(
        &dir,
        "bad.yaml",
        "projects:\n  - key: PRJ\n    pipelines:\n      - name: build\n        stages:\n          - name: s\n            actions: [Missing]\n",
    );
    cds(&dir)
        .args(["catalog", "import", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("action 'Missing' not found"));
}

// ---------------------------------------------------------------------------
// cds run
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn run_streams_log_table() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "-p", "script=echo hello from cds"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DATE"))
        .stdout(predicate::str::contains("hello from cds"))
        .stdout(predicate::str::contains("status: Success"));

    cds(&dir)
        .args(["catalog", "builds", "PRJ", "api", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Success"));
}

#[cfg(unix)]
#[test]
fn failing_build_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "-p", "script=exit 4"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("script exited with 4"))
        .stdout(predicate::str::contains("status: Fail"))
        .stderr(predicate::str::contains("build #1 failed"));
}

#[cfg(unix)]
#[test]
fn batch_run_prints_build_number() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "--batch", "-p", "script=true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("build #1 submitted"))
        .stdout(predicate::str::contains("DATE").not());
}

#[cfg(unix)]
#[test]
fn parent_run_inherits_trigger_parameters() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "-p", "script=true"])
        .assert()
        .success();

    cds(&dir)
        .args(["run", "PRJ", "api", "deploy", "--parent", "api/build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shipped by trigger"));
}

#[cfg(unix)]
#[test]
fn composite_parameters_drive_their_steps() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let file = write(
        &dir,
        "greet.yaml",
        "name: Greet\nsteps: [Script]\nparameters:\n  - name: script\n    value: echo greeting from the composite\n",
    );
    cds(&dir).args(["action", "import", &file]).assert().success();
    let catalog = write(
        &dir,
        "catalog.yaml",
        "projects:\n  - key: PRJ\n    pipelines:\n      - name: build\n        stages:\n          - name: s\n            actions: [Greet]\n    applications:\n      - name: api\n        pipelines: [build]\n",
    );
    cds(&dir).args(["catalog", "import", &catalog]).assert().success();
    cds(&dir)
        .args(["run", "PRJ", "api", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("greeting from the composite"))
        .stdout(predicate::str::contains("status: Success"));
}

#[test]
fn parent_without_prior_build_is_an_error() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "deploy", "--parent", "api/build"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("prior build"));
}

#[test]
fn parent_without_link_is_an_error() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "--parent", "api/deploy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("link between parent api/deploy/NoEnv"));
}

#[test]
fn malformed_inputs_are_wrong_usage() {
    let dir = TempDir::new().unwrap();
    init_with_catalog(&dir);
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "-p", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parameter must be name=value"));
    cds(&dir)
        .args(["run", "PRJ", "api", "deploy", "--parent", "build"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("wrong usage"));
    cds(&dir)
        .args([
            "run", "PRJ", "api", "deploy", "--parent", "api/build", "--parent-build", "-3",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must not be negative"));
}

#[test]
fn malformed_parameter_is_reported_before_opening_the_project() {
    let dir = TempDir::new().unwrap();
    cds(&dir)
        .args(["run", "PRJ", "api", "build", "-p", "broken"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parameter must be name=value"))
        .stderr(predicate::str::contains("cds init").not());
    assert!(!dir.path().join(".cds").exists());
}

#[test]
fn unknown_project_is_not_found() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    cds(&dir)
        .args(["run", "NOPE", "api", "build"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("project 'NOPE' not found"));
}

// ---------------------------------------------------------------------------
// cds plugin
// ---------------------------------------------------------------------------

#[test]
fn missing_plugin_is_not_found() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    cds(&dir)
        .args(["plugin", "info", "git"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("plugin 'git' not found"));
}

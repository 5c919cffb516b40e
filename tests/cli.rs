use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn virt_up(dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("virt-up").into();
    cmd.env("VIRTUP_CONFIG_HOME", dir.path().join("config"))
        .env("VIRTUP_DATA_HOME", dir.path().join("data"))
        .env("VIRTUP_SYSTEM_CONFIG", dir.path().join("etc"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_works() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("short-lived libvirt instances"));
}

#[test]
fn show_paths_follows_environment() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    virt_up(&dir)
        .args(["show", "paths"])
        .assert()
        .success()
        .stdout(predicate::str::contains(data.join("inventory.yaml").display().to_string()))
        .stdout(predicate::str::contains(dir.path().join("config").display().to_string()));
}

#[test]
fn show_templates_lists_builtins() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir)
        .args(["show", "templates"])
        .assert()
        .success()
        .stdout(predicate::str::contains("generic-debian-10"))
        .stdout(predicate::str::contains("Ubuntu 18.04"));
}

#[test]
fn show_templates_includes_dropins() {
    let dir = tempfile::tempdir().unwrap();
    let dropins = dir.path().join("config").join("templates.d");
    std::fs::create_dir_all(&dropins).unwrap();
    std::fs::write(
        dropins.join("mine.toml"),
        "[templates.my-alpine]\ndesc = \"My Alpine\"\nos_version = \"alpine-3\"\n",
    )
    .unwrap();

    virt_up(&dir)
        .args(["show", "templates"])
        .assert()
        .success()
        .stdout(predicate::str::contains("my-alpine"))
        .stdout(predicate::str::contains("My Alpine"));
}

#[test]
fn bad_settings_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config");
    std::fs::create_dir_all(&config).unwrap();
    std::fs::write(config.join("settings.toml"), "[site]\nvcpus = 0\n").unwrap();

    virt_up(&dir)
        .args(["show", "templates"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("vcpus"));
}

#[test]
fn init_writes_defaults_then_refuses() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir).arg("init").assert().success();

    // root writes the system directory, everyone else the user one
    let written = ["config", "etc"]
        .iter()
        .map(|d| dir.path().join(d).join("settings.toml"))
        .find(|p| p.exists())
        .expect("settings.toml written");
    let scripts = written.parent().unwrap().join("scripts");
    assert!(scripts.join("fixup-network-interfaces.sh").exists());

    virt_up(&dir)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    virt_up(&dir).args(["init", "--force"]).assert().success();
}

#[test]
fn create_rejects_invalid_name() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir)
        .args(["create", "bad name!", "--template", "generic-debian-10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad name!"));
}

#[test]
fn create_rejects_unknown_template() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir)
        .args(["create", "web1", "--template", "no-such-template"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-template"));
}

#[test]
fn delete_requires_name_or_all() {
    let dir = tempfile::tempdir().unwrap();
    virt_up(&dir).arg("delete").assert().failure();
}

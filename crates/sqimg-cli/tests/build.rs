#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn layer_tar(path: &str, body: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, body.as_bytes())
        .expect("append layer entry");
    builder.into_inner().expect("finish layer tar")
}

/// `docker save` directory for `demo:latest` with two layers and no diff ids,
/// so layer ids fall back to the layer file hashes.
fn write_archive(root: &Path) {
    fs::create_dir_all(root.join("l0")).expect("layer dir");
    fs::create_dir_all(root.join("l1")).expect("layer dir");
    fs::write(root.join("l0/layer.tar"), layer_tar("etc/motd", "hi")).expect("layer");
    fs::write(root.join("l1/layer.tar"), layer_tar("app/run", "run")).expect("layer");
    let config = json!({"config": {"Cmd": ["/app/run"], "WorkingDir": "/app"}});
    fs::write(root.join("demo.json"), config.to_string()).expect("config");
    let manifest = json!([{
        "Config": "demo.json",
        "RepoTags": ["demo:latest"],
        "Layers": ["l0/layer.tar", "l1/layer.tar"],
    }]);
    fs::write(root.join("manifest.json"), manifest.to_string()).expect("manifest");
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

struct Fixture {
    _temp: TempDir,
    archive: PathBuf,
    cache: PathBuf,
    packager: PathBuf,
    broken: PathBuf,
}

fn fixture() -> Fixture {
    let temp = tempfile::Builder::new()
        .prefix("sqimg-build")
        .tempdir()
        .expect("tempdir");
    let archive = temp.path().join("archive");
    write_archive(&archive);
    let packager = script(
        temp.path(),
        "mksquashfs",
        "#!/bin/sh\n[ \"$3\" = \"-noappend\" ] || exit 2\n(cd \"$1\" && ls -R .) > \"$2\"\n",
    );
    let broken = script(
        temp.path(),
        "broken-mksquashfs",
        "#!/bin/sh\necho 'mksquashfs: out of inodes' 1>&2\nexit 1\n",
    );
    Fixture {
        cache: temp.path().join("cache"),
        archive,
        packager,
        broken,
        _temp: temp,
    }
}

fn build(fixture: &Fixture, packager: &Path, extra: &[&str]) -> assert_cmd::assert::Assert {
    cargo_bin_cmd!("sqimg")
        .env("SQIMG_MKSQUASHFS", packager)
        .arg("--cache")
        .arg(&fixture.cache)
        .arg("build")
        .arg("demo")
        .arg("--archive")
        .arg(&fixture.archive)
        .args(extra)
        .assert()
}

fn manifest(assert: &assert_cmd::assert::Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("manifest json")
}

#[test]
fn build_prints_manifest_with_grouped_layers() {
    let fixture = fixture();
    let assert = build(&fixture, &fixture.packager, &[]).success();
    let manifest = manifest(&assert);

    let layers = manifest["rootfs"][0]["layers"].as_array().expect("layers");
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0]["type"], "squashfs");
    assert_eq!(layers[0]["hashes"]["sha512"].as_str().map(str::len), Some(128));
    assert!(layers[0].get("url").is_none());
    assert_eq!(
        manifest["entrypoints"]["_default"]["args"],
        json!(["/app/run"])
    );
}

#[test]
fn each_diff_builds_one_layer_per_diff() {
    let fixture = fixture();
    let assert = build(&fixture, &fixture.packager, &["--each-diff"]).success();
    let layers = manifest(&assert)["rootfs"][0]["layers"]
        .as_array()
        .expect("layers")
        .len();
    assert_eq!(layers, 2);
}

#[test]
fn cached_layers_skip_the_packager() {
    let fixture = fixture();
    let first = manifest(&build(&fixture, &fixture.packager, &[]).success());
    // a broken packager is never invoked on a cache hit
    let second = manifest(&build(&fixture, &fixture.broken, &[]).success());
    assert_eq!(first, second);
}

#[test]
fn each_diff_records_do_not_serve_grouped_builds() {
    let fixture = fixture();
    build(&fixture, &fixture.packager, &["--each-diff"]).success();
    // the grouped top layer spans both diffs, so it must be packaged anew
    build(&fixture, &fixture.broken, &[]).failure();
    let grouped = manifest(&build(&fixture, &fixture.packager, &[]).success());

    let fresh = fixture_with_fresh_cache(&fixture);
    let expected = manifest(&build(&fresh, &fixture.packager, &[]).success());
    assert_eq!(grouped["rootfs"], expected["rootfs"]);
}

fn fixture_with_fresh_cache(fixture: &Fixture) -> Fixture {
    let temp = tempfile::tempdir().expect("tempdir");
    Fixture {
        cache: temp.path().join("cache"),
        archive: fixture.archive.clone(),
        packager: fixture.packager.clone(),
        broken: fixture.broken.clone(),
        _temp: temp,
    }
}

#[test]
fn packager_failure_reports_tool_output() {
    let fixture = fixture();
    let assert = build(&fixture, &fixture.broken, &[]).failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("out of inodes"), "stderr: {stderr}");
}

#[test]
fn unknown_image_fails() {
    let fixture = fixture();
    cargo_bin_cmd!("sqimg")
        .env("SQIMG_MKSQUASHFS", &fixture.packager)
        .arg("--cache")
        .arg(&fixture.cache)
        .args(["build", "missing"])
        .arg("--archive")
        .arg(&fixture.archive)
        .assert()
        .failure();
}

use std::fs;
use std::io::Write;
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use httptest::{matchers::*, responders::*, Expectation, Server};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqimg_core::domain::{Grouping, DEFAULT_ENTRYPOINT};
use sqimg_core::{
    import_image, Builder, ControllerClient, DiffProvider, DockerArchive, FilesystemPackager,
    HttpBlobStore, LayerCache, Services,
};
use url::Url;
use walkdir::WalkDir;

/// Writes the sorted file listing and contents of the tree.
#[derive(Default)]
struct ListingPackager {
    calls: AtomicUsize,
}

impl FilesystemPackager for ListingPackager {
    fn package(&self, source: &Path, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = fs::File::create(dest)?;
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry?;
            writeln!(out, "{}", entry.path().strip_prefix(source)?.display())?;
            if entry.file_type().is_file() {
                out.write_all(&fs::read(entry.path())?)?;
            }
        }
        Ok(())
    }
}

fn layer_tar(files: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, body.as_bytes())?;
    }
    Ok(builder.into_inner()?)
}

/// An unpacked `docker save` of `base:1` (one layer) and `app:latest` (base
/// plus two layers).
fn write_archive(root: &Path) -> Result<()> {
    let layers = [
        layer_tar(&[("etc/os-release", "base")])?,
        layer_tar(&[("srv/app.conf", "port=80")])?,
        layer_tar(&[("srv/app", "#!/bin/sh\n")])?,
    ];
    let mut names = Vec::new();
    let mut diff_ids = Vec::new();
    for (index, layer) in layers.iter().enumerate() {
        let name = format!("layer{index}/layer.tar");
        fs::create_dir_all(root.join(format!("layer{index}")))?;
        fs::write(root.join(&name), layer)?;
        names.push(name);
        diff_ids.push(format!("sha256:{}", hex::encode(Sha256::digest(layer))));
    }
    let base = json!({
        "config": {"Env": ["PATH=/bin"], "Cmd": ["sh"]},
        "rootfs": {"type": "layers", "diff_ids": &diff_ids[..1]},
    });
    let app = json!({
        "config": {
            "Env": ["PATH=/bin", "PORT=80", "JUNK"],
            "Entrypoint": ["/srv/app"],
            "Cmd": ["--serve"],
            "WorkingDir": "/srv",
        },
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
    });
    fs::write(root.join("base.json"), serde_json::to_vec(&base)?)?;
    fs::write(root.join("app.json"), serde_json::to_vec(&app)?)?;
    let manifest = json!([
        {"Config": "base.json", "RepoTags": ["base:1"], "Layers": &names[..1]},
        {"Config": "app.json", "RepoTags": ["app:latest"], "Layers": names},
    ]);
    fs::write(root.join("manifest.json"), serde_json::to_vec(&manifest)?)?;
    Ok(())
}

#[test]
fn tag_grouping_follows_archive_tags() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_archive(dir.path())?;
    let archive = DockerArchive::open(dir.path())?;
    let cache = LayerCache::open(dir.path().join("cache"))?;
    let packager = ListingPackager::default();

    let history = archive.history("app")?;
    assert_eq!(history.len(), 3);
    assert!(history[0].is_tagged());
    assert!(history[2].is_tagged());

    let manifest = Builder::new(&cache, &archive, &packager).build("app", Grouping::ByTag)?;
    // [base] and [app.conf, app]
    assert_eq!(manifest.layers().len(), 2);
    let entry = &manifest.entrypoints[DEFAULT_ENTRYPOINT];
    assert_eq!(entry.args, vec!["/srv/app", "--serve"]);
    assert_eq!(entry.working_dir, "/srv");
    assert_eq!(entry.env.len(), 2);

    // the base image reuses the cached bottom layer
    let base = Builder::new(&cache, &archive, &packager).build("base:1", Grouping::ByTag)?;
    assert_eq!(base.layers(), &manifest.layers()[..1]);
    assert_eq!(packager.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn import_uploads_then_registers() -> Result<()> {
    let server = match panic::catch_unwind(Server::run) {
        Ok(server) => server,
        Err(_) => {
            eprintln!("skipping import test (httptest server unavailable)");
            return Ok(());
        }
    };
    server.expect(
        Expectation::matching(request::method(eq("PUT")))
            .times(4)
            .respond_with(status_code(200)),
    );
    server.expect(
        Expectation::matching(request::method_path("POST", "/artifacts"))
            .respond_with(status_code(200)),
    );

    let dir = tempfile::tempdir()?;
    write_archive(dir.path())?;
    let archive = DockerArchive::open(dir.path())?;
    let cache = LayerCache::open(dir.path().join("cache"))?;
    let packager = ListingPackager::default();
    let blobstore = HttpBlobStore::new(1)?;
    let base = Url::parse(&server.url_str("/"))?;
    let registry = ControllerClient::new(base.clone(), None)?;
    let services = Services {
        cache: &cache,
        packager: &packager,
        blobstore: &blobstore,
        blobstore_url: &base,
        registry: &registry,
    };

    let artifact = import_image(&services, &archive, "app")?;
    assert_eq!(artifact.manifest.layers().len(), 3);
    for layer in artifact.manifest.layers() {
        let url = layer.url.as_deref().unwrap_or_default();
        assert!(url.contains("/docker/layers/"), "{url}");
        assert!(url.ends_with(".squashfs"));
    }
    assert!(artifact.uri.contains("/docker/images/"));
    assert_eq!(artifact.meta["blobstore"], "true");
    assert_eq!(artifact.meta["import.repository"], "app");
    assert_eq!(artifact.meta["import.digest"], archive.image_digest("app")?);
    Ok(())
}

use corral_layers::{assemble, DirectorySource, ImageRef, Layer, LayerError, LayerSource};
use std::fs;
use std::io::Write;
use std::path::Path;

fn header(kind: tar::EntryType, mode: u32, size: usize) -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(kind);
    h.set_mode(mode);
    h.set_size(size as u64);
    h.set_mtime(0);
    h
}

fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut ar = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut h = header(tar::EntryType::Regular, 0o644, content.len());
        ar.append_data(&mut h, path, content.as_bytes()).unwrap();
    }
    ar.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn tree(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    collect(root, root, &mut out);
    out.sort();
    out
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let rel = path.strip_prefix(root).unwrap().display().to_string();
        if path.symlink_metadata().unwrap().is_dir() {
            out.push(format!("{rel}/"));
            collect(root, &path, out);
        } else {
            out.push(format!("{rel}={}", fs::read_to_string(&path).unwrap_or_default()));
        }
    }
}

#[test]
fn whiteout_then_new_file_in_later_layer() {
    let dir = tempfile::tempdir().unwrap();
    let a = Layer::from_bytes(0, tar_of(&[("etc/hostname", "a")]));
    let b = Layer::from_bytes(1, tar_of(&[("etc/.wh.hostname", ""), ("etc/motd", "b")]));

    assemble([a, b], dir.path()).unwrap();

    assert!(!dir.path().join("etc/hostname").exists());
    assert_eq!(fs::read_to_string(dir.path().join("etc/motd")).unwrap(), "b");
    assert!(!dir.path().join("etc/.wh.hostname").exists());
}

#[test]
fn swapping_conflicting_layers_changes_result() {
    let creates = || tar_of(&[("data/file", "v1")]);
    let deletes = || tar_of(&[("data/.wh.file", "")]);

    let forward = tempfile::tempdir().unwrap();
    assemble(
        [Layer::from_bytes(0, creates()), Layer::from_bytes(1, deletes())],
        forward.path(),
    )
    .unwrap();

    let reversed = tempfile::tempdir().unwrap();
    assemble(
        [Layer::from_bytes(0, deletes()), Layer::from_bytes(1, creates())],
        reversed.path(),
    )
    .unwrap();

    assert!(!forward.path().join("data/file").exists());
    assert_eq!(fs::read_to_string(reversed.path().join("data/file")).unwrap(), "v1");
    assert_ne!(tree(forward.path()), tree(reversed.path()));
}

#[test]
fn replaying_same_sequence_from_empty_is_deterministic() {
    let layers = || {
        vec![
            Layer::from_bytes(0, tar_of(&[("a/x", "1"), ("a/y", "2"), ("b", "3")])),
            Layer::from_bytes(1, gzip(&tar_of(&[("a/.wh.x", ""), ("b", "4")]))),
            Layer::from_bytes(2, tar_of(&[("c/d", "5")])),
        ]
    };

    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    assemble(layers(), first.path()).unwrap();
    assemble(layers(), second.path()).unwrap();

    assert_eq!(tree(first.path()), tree(second.path()));
    assert_eq!(
        tree(first.path()),
        vec!["a/", "a/y=2", "b=4", "c/", "c/d=5"]
    );
}

#[test]
fn repeated_whiteout_for_same_path_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let a = Layer::from_bytes(0, tar_of(&[("tmp/junk", "j")]));
    let b = Layer::from_bytes(1, tar_of(&[("tmp/.wh.junk", "")]));
    let c = Layer::from_bytes(2, tar_of(&[("tmp/.wh.junk", "")]));

    let report = assemble([a, b, c], dir.path()).unwrap();
    assert_eq!(report.whiteouts, 2);
    assert!(!dir.path().join("tmp/junk").exists());
}

#[test]
fn unsafe_entry_aborts_with_filesystem_error() {
    let mut h = header(tar::EntryType::Regular, 0o644, 1);
    let name = b"../../outside";
    h.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
    h.set_cksum();
    let mut ar = tar::Builder::new(Vec::new());
    ar.append(&h, &b"x"[..]).unwrap();
    let data = ar.into_inner().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("rootfs");
    let err = assemble([Layer::from_bytes(0, data)], &root).unwrap_err();

    assert!(matches!(err, LayerError::UnsafePath { .. }));
    assert!(!dir.path().join("outside").exists());
}

#[test]
fn directory_source_feeds_assembler() {
    let images = tempfile::tempdir().unwrap();
    let image_dir = images.path().join("busybox").join("latest");
    fs::create_dir_all(&image_dir).unwrap();
    fs::write(
        image_dir.join("manifest.json"),
        r#"{"config":"config.json","layers":["base.tar.gz","app.tar"]}"#,
    )
    .unwrap();
    fs::write(image_dir.join("config.json"), r#"{"Cmd":["sh"]}"#).unwrap();
    fs::write(
        image_dir.join("base.tar.gz"),
        gzip(&tar_of(&[("bin/sh", "shell"), ("etc/issue", "old")])),
    )
    .unwrap();
    fs::write(
        image_dir.join("app.tar"),
        tar_of(&[("etc/.wh.issue", ""), ("srv/app", "app")]),
    )
    .unwrap();

    let source = DirectorySource::new(images.path());
    let fetched = source
        .fetch_layers(&ImageRef::parse("busybox").unwrap())
        .unwrap();
    assert_eq!(fetched.config, br#"{"Cmd":["sh"]}"#);

    let rootfs = tempfile::tempdir().unwrap();
    let report = assemble(fetched.layers, rootfs.path()).unwrap();

    assert_eq!(report.layers, 2);
    assert_eq!(
        tree(rootfs.path()),
        vec!["bin/", "bin/sh=shell", "etc/", "srv/", "srv/app=app"]
    );
}

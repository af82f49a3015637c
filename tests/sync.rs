//! End-to-end push/fetch scenarios over an in-process transport and
//! directory-backed stores.

use std::fs;
use std::path::Path;

use narsync::{
    Compression, LocalStore, MemoryTransport, SecretKey, StoreBackend, StorePath, SyncClient,
    SyncError, TrustedKeys,
};

fn write_subtree(dir: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn add_path(store: &LocalStore, name: &str, files: &[(&str, &str)], refs: &[StorePath]) -> StorePath {
    let subtree = tempfile::tempdir().unwrap();
    write_subtree(subtree.path(), files);
    store.add_path(name, subtree.path(), refs).unwrap()
}

struct Harness {
    _source_root: tempfile::TempDir,
    _dest_root: tempfile::TempDir,
    source: LocalStore,
    dest: LocalStore,
    transport: MemoryTransport,
    signer_public: String,
    signer: Option<SecretKey>,
}

impl Harness {
    fn new() -> Self {
        let source_root = tempfile::tempdir().unwrap();
        let dest_root = tempfile::tempdir().unwrap();
        let signer = SecretKey::generate("test-cache-1");
        Self {
            source: LocalStore::open(source_root.path()).unwrap(),
            dest: LocalStore::open(dest_root.path()).unwrap(),
            transport: MemoryTransport::new(),
            signer_public: signer.public_key().render(),
            signer: Some(signer),
            _source_root: source_root,
            _dest_root: dest_root,
        }
    }

    fn pusher(&self) -> SyncClient<'_> {
        let mut client = SyncClient::new(&self.source, &self.transport)
            .with_compression(Compression::Xz)
            .with_max_jobs(4);
        if let Some(signer) = &self.signer {
            // SecretKey deliberately has no Clone; round-trip through a file.
            let dir = tempfile::tempdir().unwrap();
            let key_file = dir.path().join("key.sec");
            signer.to_file(&key_file).unwrap();
            client = client.with_signer(SecretKey::from_file(&key_file).unwrap());
        }
        client
    }

    fn fetcher(&self) -> SyncClient<'_> {
        let trusted = TrustedKeys::from_rendered(&[self.signer_public.clone()]).unwrap();
        SyncClient::new(&self.dest, &self.transport)
            .with_trusted_keys(trusted)
            .with_max_jobs(4)
    }
}

#[test]
fn push_then_fetch_materializes_dependencies_first() {
    let h = Harness::new();
    let y = add_path(&h.source, "y-1.0", &[("lib/y.so", "y bits")], &[]);
    let x = add_path(&h.source, "x-1.0", &[("bin/x", "x bits")], &[y.clone()]);

    let pushed = h.pusher().push(std::slice::from_ref(&x)).unwrap();
    assert_eq!(pushed.sent.len(), 2, "closure push includes the dependency");
    assert_eq!(pushed.sent[0], y, "dependency uploaded in closure order");

    let fetched = h.fetcher().fetch(std::slice::from_ref(&x)).unwrap();
    assert_eq!(fetched.materialized, vec![y.clone(), x.clone()]);

    assert!(h.dest.contains(&x));
    assert!(h.dest.contains(&y));
    assert_eq!(h.dest.direct_references(&x).unwrap(), vec![y.clone()]);

    let x_dir = h.dest.realize(&x).unwrap();
    assert_eq!(fs::read_to_string(x_dir.join("bin/x")).unwrap(), "x bits");
    let y_dir = h.dest.realize(&y).unwrap();
    assert_eq!(fs::read_to_string(y_dir.join("lib/y.so")).unwrap(), "y bits");
}

#[test]
fn corrupted_dependency_aborts_fetch_without_materializing_dependent() {
    let h = Harness::new();
    let y = add_path(&h.source, "y-1.0", &[("lib/y.so", "y bits")], &[]);
    let x = add_path(&h.source, "x-1.0", &[("bin/x", "x bits")], &[y.clone()]);
    h.pusher().push(std::slice::from_ref(&x)).unwrap();

    // Flip one byte of Y's stored payload.
    h.transport.corrupt_payload(&y, 10);

    let err = h.fetcher().fetch(std::slice::from_ref(&x)).unwrap_err();
    match &err {
        SyncError::IntegrityViolation { path, .. } => assert_eq!(*path, y.render()),
        SyncError::Decompression { path, .. } => assert_eq!(*path, y.render()),
        other => panic!("expected integrity/decompression failure for y, got {}", other),
    }

    assert!(!h.dest.contains(&x), "dependent of a corrupt path must not appear");
    assert!(!h.dest.contains(&y));
}

#[test]
fn truncated_payload_is_a_decompression_failure() {
    let h = Harness::new();
    let p = add_path(&h.source, "pkg-1.0", &[("data", "payload payload payload")], &[]);
    h.pusher().push(std::slice::from_ref(&p)).unwrap();

    h.transport.truncate_payload(&p, 5);

    let err = h.fetcher().fetch(std::slice::from_ref(&p)).unwrap_err();
    assert!(
        matches!(&err, SyncError::Decompression { path, .. } if *path == p.render()),
        "got {}",
        err
    );
    assert!(err.is_retryable(), "truncation should invite a re-download");
    assert!(!h.dest.contains(&p));
}

#[test]
fn unsigned_entries_fail_verification() {
    let mut h = Harness::new();
    h.signer = None;
    let p = add_path(&h.source, "pkg-1.0", &[("data", "bits")], &[]);
    h.pusher().push(std::slice::from_ref(&p)).unwrap();

    let err = h.fetcher().fetch(std::slice::from_ref(&p)).unwrap_err();
    match err {
        SyncError::UntrustedSigner { path, key_name } => {
            assert_eq!(path, p.render());
            assert_eq!(key_name, None);
        }
        other => panic!("expected UntrustedSigner, got {}", other),
    }
    assert!(!h.dest.contains(&p));
}

#[test]
fn entries_signed_by_unknown_key_fail_verification() {
    let mut h = Harness::new();
    h.signer = Some(SecretKey::generate("rogue-key"));
    let p = add_path(&h.source, "pkg-1.0", &[("data", "bits")], &[]);
    h.pusher().push(std::slice::from_ref(&p)).unwrap();

    let err = h.fetcher().fetch(std::slice::from_ref(&p)).unwrap_err();
    match err {
        SyncError::UntrustedSigner { key_name, .. } => {
            assert_eq!(key_name.as_deref(), Some("rogue-key"));
        }
        other => panic!("expected UntrustedSigner, got {}", other),
    }
}

#[test]
fn diamond_closure_pushes_each_path_once_and_fetch_orders_it() {
    let h = Harness::new();
    let base = add_path(&h.source, "base-1.0", &[("b", "base")], &[]);
    let left = add_path(&h.source, "left-1.0", &[("l", "left")], &[base.clone()]);
    let right = add_path(&h.source, "right-1.0", &[("r", "right")], &[base.clone()]);
    let top = add_path(
        &h.source,
        "top-1.0",
        &[("t", "top")],
        &[left.clone(), right.clone()],
    );

    let pushed = h.pusher().push(std::slice::from_ref(&top)).unwrap();
    assert_eq!(pushed.sent.len(), 4);
    assert_eq!(h.transport.upload_calls(), 4, "shared base uploaded exactly once");

    let fetched = h.fetcher().fetch(std::slice::from_ref(&top)).unwrap();
    assert_eq!(fetched.materialized.len(), 4);

    let pos = |p: &StorePath| {
        fetched
            .materialized
            .iter()
            .position(|q| q == p)
            .expect("path materialized")
    };
    assert!(pos(&base) < pos(&left));
    assert!(pos(&base) < pos(&right));
    assert!(pos(&left) < pos(&top));
    assert!(pos(&right) < pos(&top));
}

#[test]
fn pushing_a_dependency_after_its_dependent_is_a_no_op() {
    let h = Harness::new();
    let y = add_path(&h.source, "y-1.0", &[("y", "y")], &[]);
    let x = add_path(&h.source, "x-1.0", &[("x", "x")], &[y.clone()]);

    let pusher = h.pusher();
    pusher.push(std::slice::from_ref(&x)).unwrap();
    let calls = h.transport.upload_calls();

    let again = pusher.push(std::slice::from_ref(&y)).unwrap();
    assert!(again.sent.is_empty());
    assert_eq!(h.transport.upload_calls(), calls);
}

#[test]
fn fetch_into_partially_populated_store_downloads_only_whats_missing() {
    let h = Harness::new();
    let y = add_path(&h.source, "y-1.0", &[("y", "y")], &[]);
    let x = add_path(&h.source, "x-1.0", &[("x", "x")], &[y.clone()]);
    h.pusher().push(std::slice::from_ref(&x)).unwrap();

    let fetcher = h.fetcher();
    fetcher.fetch(std::slice::from_ref(&y)).unwrap();
    assert!(h.dest.contains(&y));

    let summary = fetcher.fetch(std::slice::from_ref(&x)).unwrap();
    assert_eq!(summary.materialized, vec![x.clone()]);
    assert_eq!(summary.already_present, vec![y]);
}

#[test]
fn executable_bits_and_symlinks_survive_the_round_trip() {
    let h = Harness::new();

    let subtree = tempfile::tempdir().unwrap();
    write_subtree(
        subtree.path(),
        &[("bin/tool", "#!/bin/sh\nexit 0\n"), ("share/doc.txt", "doc")],
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            subtree.path().join("bin/tool"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("../bin/tool", subtree.path().join("share/tool")).unwrap();
    }
    let p = h.source.add_path("tool-1.0", subtree.path(), &[]).unwrap();

    h.pusher().push(std::slice::from_ref(&p)).unwrap();
    h.fetcher().fetch(std::slice::from_ref(&p)).unwrap();

    let dir = h.dest.realize(&p).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dir.join("bin/tool")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
        assert_eq!(
            fs::read_link(dir.join("share/tool")).unwrap(),
            std::path::PathBuf::from("../bin/tool")
        );
    }
    assert_eq!(fs::read_to_string(dir.join("share/doc.txt")).unwrap(), "doc");
}

#[test]
fn gzip_and_plain_payloads_round_trip_too() {
    for codec in [Compression::None, Compression::Gzip, Compression::Bzip2] {
        let h = Harness::new();
        let p = add_path(&h.source, "pkg-1.0", &[("data", "bits and bobs")], &[]);

        let pusher = h.pusher().with_compression(codec);
        pusher.push(std::slice::from_ref(&p)).unwrap();

        h.fetcher().fetch(std::slice::from_ref(&p)).unwrap();
        let dir = h.dest.realize(&p).unwrap();
        assert_eq!(fs::read_to_string(dir.join("data")).unwrap(), "bits and bobs");
    }
}

//! Behavior of the local storage backend through its public trait.

mod common;

use std::io::Read;

use common::{Fixture, TEST_KEY_ID};
use stowage_core::{
    StorageBackend,
    crypto::{EncryptionMethod, OVERHEAD, is_encrypted},
    storage::StorageError,
};

fn read_all(fx: &Fixture, path: &str) -> Vec<u8> {
    let mut out = Vec::new();
    fx.backend().open(path).unwrap().read_to_end(&mut out).unwrap();
    out
}

fn names(fx: &Fixture, dir: &str) -> Vec<String> {
    let mut names: Vec<String> = fx
        .backend()
        .list(dir, None)
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    names.sort();
    names
}

#[test]
fn save_then_open_plaintext() {
    let fx = Fixture::new();
    let meta = fx.backend().save("notes.txt", b"hello").unwrap();

    assert_eq!(meta.size, 5);
    assert_eq!(meta.encryption_method, EncryptionMethod::None);
    assert_eq!(meta.encrypted_size, None);
    assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    assert_eq!(read_all(&fx, "notes.txt"), b"hello");
    assert_eq!(std::fs::read(fx.owner_root().join("notes.txt")).unwrap(), b"hello");
}

#[test]
fn save_encrypts_when_enabled() {
    let fx = Fixture::encrypted();
    let meta = fx.backend().save("secret.bin", b"twelve bytes").unwrap();

    assert_eq!(meta.size, 12);
    assert_eq!(meta.encrypted_size, Some(12 + OVERHEAD as u64));
    assert_eq!(meta.encryption_method, EncryptionMethod::Server);
    assert_eq!(meta.encryption_key_id.as_deref(), Some(TEST_KEY_ID));

    let on_disk = std::fs::read(fx.owner_root().join("secret.bin")).unwrap();
    assert!(is_encrypted(&on_disk));
    assert_eq!(on_disk.len(), 12 + OVERHEAD);
    assert!(!on_disk.windows(12).any(|w| w == b"twelve bytes"));
    assert_eq!(read_all(&fx, "secret.bin"), b"twelve bytes");

    let info = fx.backend().info("secret.bin").unwrap();
    assert_eq!(info.size, 12);
    assert_eq!(info.encrypted_size, Some(41));
}

#[test]
fn version_byte_is_content_when_encryption_is_off() {
    let fx = Fixture::new();
    let mut content = vec![0x01];
    content.extend_from_slice(&[b'x'; 40]);
    fx.backend().save("lookalike.bin", &content).unwrap();

    let info = fx.backend().info("lookalike.bin").unwrap();
    assert_eq!(info.size, 41);
    assert_eq!(info.encryption_method, EncryptionMethod::None);
    assert_eq!(info.encrypted_size, None);
    assert_eq!(info.encryption_key_id, None);
    assert_eq!(read_all(&fx, "lookalike.bin"), content);
}

#[test]
fn legacy_plaintext_is_readable_with_encryption_on() {
    let fx = Fixture::encrypted();
    fx.backend().mkdir("old").unwrap();
    std::fs::write(fx.owner_root().join("old/plain.txt"), b"legacy").unwrap();

    assert_eq!(read_all(&fx, "old/plain.txt"), b"legacy");
    let info = fx.backend().info("old/plain.txt").unwrap();
    assert_eq!(info.encryption_method, EncryptionMethod::None);
    assert_eq!(info.size, 6);
}

#[test]
fn save_overwrites_and_needs_parent() {
    let fx = Fixture::new();
    let backend = fx.backend();
    backend.save("a.txt", b"one").unwrap();
    backend.save("a.txt", b"second").unwrap();
    assert_eq!(read_all(&fx, "a.txt"), b"second");

    let err = backend.save("missing/a.txt", b"x").unwrap_err();
    assert!(matches!(err, StorageError::ParentNotFound { .. }), "{err}");

    backend.mkdir("dir").unwrap();
    assert!(matches!(
        backend.save("dir", b"x").unwrap_err(),
        StorageError::IsADirectory { .. }
    ));
    assert!(matches!(
        backend.save("", b"x").unwrap_err(),
        StorageError::IsADirectory { .. }
    ));
}

#[test]
fn no_temp_files_left_after_save() {
    let fx = Fixture::new();
    fx.put("docs/report.pdf", b"%PDF");
    let raw: Vec<_> = std::fs::read_dir(fx.owner_root().join("docs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(raw, vec!["report.pdf".to_string()]);
}

#[test]
fn invalid_paths_are_rejected_everywhere() {
    let fx = Fixture::new();
    let backend = fx.backend();
    for bad in ["../escape.txt", "a/../../b", "nul\0byte", "a/\x07/b"] {
        assert!(matches!(
            backend.save(bad, b"x").unwrap_err(),
            StorageError::InvalidPath(_)
        ));
        assert!(matches!(backend.info(bad).unwrap_err(), StorageError::InvalidPath(_)));
        assert!(!backend.exists(bad));
    }
}

#[test]
fn exists_and_info() {
    let fx = Fixture::new();
    fx.put("docs/a.txt", b"abc");
    let backend = fx.backend();

    assert!(backend.exists(""));
    assert!(backend.exists("docs"));
    assert!(backend.exists("/docs//a.txt"));
    assert!(!backend.exists("docs/b.txt"));

    let dir = backend.info("docs").unwrap();
    assert!(dir.is_directory);
    assert_eq!(dir.size, 0);

    assert!(backend.info("").unwrap().is_directory);
    assert!(backend.info("nope").unwrap_err().is_not_found());
}

#[test]
fn list_with_glob() {
    let fx = Fixture::new();
    fx.put("a.txt", b"1");
    fx.put("b.md", b"2");
    fx.put("sub/c.txt", b"3");

    assert_eq!(names(&fx, ""), vec!["a.txt", "b.md", "sub"]);

    let txt: Vec<String> = fx
        .backend()
        .list("", Some("*.txt"))
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(txt, vec!["a.txt"]);

    let listing = fx.backend().list("sub", None).unwrap();
    assert_eq!(listing.len(), 1);
    let first = listing.iter().next().unwrap();
    assert_eq!(first.path.as_str(), "sub/c.txt");
    // A listing can be walked more than once
    assert_eq!(listing.iter().count(), 1);

    assert!(matches!(
        fx.backend().list("", Some("[")).unwrap_err(),
        StorageError::InvalidGlob { .. }
    ));
}

#[test]
fn delete_file_and_empty_dir() {
    let fx = Fixture::new();
    fx.put("d/f.txt", b"x");
    let backend = fx.backend();

    assert!(matches!(
        backend.delete("d").unwrap_err(),
        StorageError::DirectoryNotEmpty { .. }
    ));
    backend.delete("d/f.txt").unwrap();
    backend.delete("d").unwrap();
    assert!(!backend.exists("d"));
    assert!(backend.delete("d").unwrap_err().is_not_found());
}

#[test]
fn mkdir_is_idempotent() {
    let fx = Fixture::new();
    let backend = fx.backend();
    let meta = backend.mkdir("a/b/c").unwrap();
    assert!(meta.is_directory);
    assert_eq!(meta.path.as_str(), "a/b/c");
    backend.mkdir("a/b/c").unwrap();

    backend.save("a/file", b"x").unwrap();
    assert!(matches!(
        backend.mkdir("a/file/sub").unwrap_err(),
        StorageError::AlreadyExists { .. }
    ));
}

#[test]
fn move_into_directory() {
    let fx = Fixture::new();
    fx.put("src/a.txt", b"abc");
    fx.backend().mkdir("dst").unwrap();
    let backend = fx.backend();

    let meta = backend.move_to("src/a.txt", "dst").unwrap();
    assert_eq!(meta.path.as_str(), "dst/a.txt");
    assert!(!backend.exists("src/a.txt"));
    assert_eq!(read_all(&fx, "dst/a.txt"), b"abc");

    assert!(backend.move_to("src/a.txt", "dst").unwrap_err().is_not_found());

    fx.put("src/a.txt", b"again");
    assert!(matches!(
        backend.move_to("src/a.txt", "dst").unwrap_err(),
        StorageError::AlreadyExists { .. }
    ));
    assert!(matches!(
        backend.move_to("src", "src").unwrap_err(),
        StorageError::IntoItself { .. }
    ));
    assert!(backend.move_to("dst/a.txt", "nowhere").unwrap_err().is_not_found());
}

#[test]
fn copy_picks_free_names() {
    let fx = Fixture::new();
    fx.put("docs/report.txt", b"v1");
    let backend = fx.backend();

    let first = backend.copy("docs/report.txt", "docs", None).unwrap();
    assert_eq!(first.name, "report (copy).txt");
    let second = backend.copy("docs/report.txt", "docs", None).unwrap();
    assert_eq!(second.name, "report (copy 2).txt");

    backend.mkdir("other").unwrap();
    let plain = backend.copy("docs/report.txt", "other", None).unwrap();
    assert_eq!(plain.path.as_str(), "other/report.txt");

    let named = backend
        .copy("docs/report.txt", "other", Some("renamed.txt"))
        .unwrap();
    assert_eq!(named.name, "renamed.txt");
    assert!(matches!(
        backend
            .copy("docs/report.txt", "other", Some("renamed.txt"))
            .unwrap_err(),
        StorageError::AlreadyExists { .. }
    ));
    assert_eq!(read_all(&fx, "other/renamed.txt"), b"v1");
}

#[test]
fn copy_directory_recursively() {
    let fx = Fixture::new();
    fx.put("proj/a.txt", b"a");
    fx.put("proj/nested/b.txt", b"b");
    let backend = fx.backend();

    let meta = backend.copy("proj", "", None).unwrap();
    assert_eq!(meta.name, "proj (copy)");
    assert!(meta.is_directory);
    assert_eq!(read_all(&fx, "proj (copy)/nested/b.txt"), b"b");

    assert!(matches!(
        backend.copy("proj", "proj/nested", None).unwrap_err(),
        StorageError::IntoItself { .. }
    ));
}

#[test]
fn walk_lists_parents_before_children() {
    let fx = Fixture::new();
    fx.put("a/b/c.txt", b"c");
    fx.put("top.txt", b"t");

    let walked: Vec<String> = fx
        .backend()
        .walk("")
        .unwrap()
        .into_iter()
        .map(|m| m.path.as_str().to_string())
        .collect();
    assert_eq!(walked.len(), 4);
    let pos = |p: &str| walked.iter().position(|w| w == p).unwrap();
    assert!(pos("a") < pos("a/b"));
    assert!(pos("a/b") < pos("a/b/c.txt"));
}

#[test]
fn remove_tree() {
    let fx = Fixture::new();
    fx.put("tree/x/y.txt", b"y");
    fx.put("tree/z.txt", b"z");
    let backend = fx.backend();

    let stats = backend.remove_tree("tree").unwrap();
    assert_eq!(stats.files_removed, 2);
    assert_eq!(stats.dirs_removed, 2);
    assert!(!backend.exists("tree"));

    // Missing target is a no-op
    assert_eq!(backend.remove_tree("tree").unwrap().files_removed, 0);
    assert!(matches!(
        backend.remove_tree("").unwrap_err(),
        StorageError::RootPath { .. }
    ));
}

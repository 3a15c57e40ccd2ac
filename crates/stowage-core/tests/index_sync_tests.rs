//! Reconciling storage roots with the index.

mod common;

use chrono::{Duration, Utc};
use common::{Fixture, TEST_KEY_ID, encryption_off};
use stowage_core::{
    StorageBackend, VirtualPath,
    crypto::EncryptionMethod,
    index::NewRecord,
    owner::Owner,
    path::normalize,
    sync::{IndexSync, SyncError, SyncMode, SyncRequest, SyncScope},
};
use uuid::Uuid;

fn vp(path: &str) -> VirtualPath {
    normalize(path).unwrap()
}

fn indexed_paths(fx: &Fixture) -> Vec<String> {
    let mut paths: Vec<String> = fx
        .index
        .list_owner(&fx.owner)
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    paths.sort();
    paths
}

/// Record a path that does not exist on disk.
fn orphan(fx: &Fixture, path: &str) -> i64 {
    fx.index
        .create(&fx.owner, &NewRecord::file(&vp(path), 3))
        .unwrap()
        .id
}

#[test]
fn sync_indexes_every_entry() {
    let fx = Fixture::new();
    fx.put("docs/a.txt", b"hello");
    fx.put("docs/deep/b.md", b"# b");
    fx.put("top.bin", b"");

    let stats = fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(stats.owners_scanned, 1);
    assert_eq!(stats.files_on_disk, 5);
    assert_eq!(stats.files_in_index, 0);
    assert_eq!(stats.missing_in_index, 5);
    assert_eq!(stats.records_created, 5);
    assert!(stats.errors.is_empty());

    assert_eq!(
        indexed_paths(&fx),
        vec!["docs", "docs/a.txt", "docs/deep", "docs/deep/b.md", "top.bin"]
    );
    let a = fx.index.get(&fx.owner, &vp("docs/a.txt")).unwrap().unwrap();
    assert_eq!(a.size, 5);
    assert_eq!(a.parent_path, "docs");
    assert_eq!(a.content_type.as_deref(), Some("text/plain"));
    let dir = fx.index.get(&fx.owner, &vp("docs/deep")).unwrap().unwrap();
    assert!(dir.is_directory);
    assert_eq!(dir.size, 0);
}

#[test]
fn second_sync_is_a_no_op() {
    let fx = Fixture::new();
    fx.put("a/b.txt", b"b");
    fx.sync().run(SyncRequest::new(SyncMode::Full).force(true)).unwrap();

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Full).force(true))
        .unwrap();
    assert_eq!(stats.records_created, 0);
    assert_eq!(stats.records_updated, 0);
    assert_eq!(stats.records_deleted, 0);
    assert_eq!(stats.missing_in_index, 0);
    assert_eq!(stats.orphaned_in_index, 0);
}

#[test]
fn filesystem_wins_on_size() {
    let fx = Fixture::new();
    fx.put("report.txt", b"short");
    fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    let before = fx.index.get(&fx.owner, &vp("report.txt")).unwrap().unwrap();

    fx.backend().save("report.txt", b"a much longer body").unwrap();
    let stats = fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(stats.records_updated, 1);
    assert_eq!(stats.records_created, 0);

    let after = fx.index.get(&fx.owner, &vp("report.txt")).unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.size, 18);
}

#[test]
fn audit_reports_without_writing() {
    let fx = Fixture::new();
    fx.put("new.txt", b"n");
    orphan(&fx, "gone.txt");

    let stats = fx.sync().run(SyncRequest::new(SyncMode::Audit)).unwrap();
    assert_eq!(stats.missing_in_index, 1);
    assert_eq!(stats.orphaned_in_index, 1);
    assert_eq!(stats.records_created, 0);
    assert_eq!(stats.records_deleted, 0);
    assert_eq!(indexed_paths(&fx), vec!["gone.txt"]);
}

#[test]
fn destructive_modes_require_force() {
    let fx = Fixture::new();
    orphan(&fx, "gone.txt");

    for mode in [SyncMode::Clean, SyncMode::Full] {
        let err = fx.sync().run(SyncRequest::new(mode)).unwrap_err();
        assert!(matches!(err, SyncError::ForceRequired { .. }), "{err}");
        // Even a dry run needs the flag
        let err = fx.sync().run(SyncRequest::new(mode).dry_run(true)).unwrap_err();
        assert!(matches!(err, SyncError::ForceRequired { .. }));
    }
    assert_eq!(indexed_paths(&fx), vec!["gone.txt"]);
}

#[test]
fn clean_removes_orphans_only() {
    let fx = Fixture::new();
    fx.put("keep.txt", b"k");
    fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    orphan(&fx, "gone.txt");
    fx.put("unindexed.txt", b"u");

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Clean).force(true))
        .unwrap();
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(stats.records_created, 0);
    assert_eq!(stats.missing_in_index, 1);
    assert_eq!(indexed_paths(&fx), vec!["keep.txt"]);
}

#[test]
fn full_adds_and_removes() {
    let fx = Fixture::new();
    fx.put("on-disk.txt", b"d");
    orphan(&fx, "gone.txt");

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Full).force(true))
        .unwrap();
    assert_eq!(stats.records_created, 1);
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(indexed_paths(&fx), vec!["on-disk.txt"]);
}

#[test]
fn dry_run_changes_nothing() {
    let fx = Fixture::new();
    fx.put("new.txt", b"n");
    orphan(&fx, "gone.txt");

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Full).force(true).dry_run(true))
        .unwrap();
    assert_eq!(stats.records_created, 1);
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(indexed_paths(&fx), vec!["gone.txt"]);
}

#[test]
fn orphans_with_active_dependents_are_kept() {
    let fx = Fixture::new();
    let shared = orphan(&fx, "shared.txt");
    let expired = orphan(&fx, "expired.txt");
    let published = orphan(&fx, "published.txt");
    let draft = orphan(&fx, "draft.txt");

    fx.index.add_share_link(shared, "tok-live", None).unwrap();
    fx.index
        .add_share_link(expired, "tok-old", Some(Utc::now() - Duration::hours(1)))
        .unwrap();
    fx.index.add_managed_content(published, true).unwrap();
    fx.index.add_managed_content(draft, false).unwrap();

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Clean).force(true))
        .unwrap();
    assert_eq!(stats.records_skipped, 2);
    assert_eq!(stats.records_deleted, 2);
    assert_eq!(indexed_paths(&fx), vec!["published.txt", "shared.txt"]);

    // Inactive dependents went with their file
    assert!(fx.index.dependents(expired).unwrap().is_empty());
    assert!(fx.index.dependents(draft).unwrap().is_empty());
}

#[test]
fn revoked_link_does_not_protect() {
    let fx = Fixture::new();
    let id = orphan(&fx, "old.txt");
    let link = fx.index.add_share_link(id, "tok", None).unwrap();
    fx.index.revoke_share_link(link).unwrap();

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Clean).force(true))
        .unwrap();
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(stats.records_skipped, 0);
}

#[test]
fn owners_are_isolated() {
    let fx = Fixture::new();
    let org = Owner::Organization(Uuid::new_v4());
    fx.index.register_owner(&org, 0).unwrap();

    fx.put("mine.txt", b"m");
    let shared = fx.layout.backend(&org).unwrap();
    shared.save("team.txt", b"t").unwrap();

    let stats = fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(stats.owners_scanned, 2);
    assert_eq!(stats.records_created, 2);

    assert_eq!(indexed_paths(&fx), vec!["mine.txt"]);
    let team: Vec<String> = fx
        .index
        .list_owner(&org)
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(team, vec!["team.txt"]);
    assert!(fx.layout.owner_root(&org).starts_with(fx.temp.path().join("shared")));
}

#[test]
fn owner_filter_and_scope() {
    let fx = Fixture::new();
    let org = Owner::Organization(Uuid::new_v4());
    fx.index.register_owner(&org, 0).unwrap();
    fx.put("mine.txt", b"m");
    fx.layout.backend(&org).unwrap().save("team.txt", b"t").unwrap();

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Sync).owner(org.id()))
        .unwrap();
    assert_eq!(stats.owners_scanned, 1);
    assert_eq!(stats.records_created, 1);
    assert!(indexed_paths(&fx).is_empty());

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Audit).scope(SyncScope::Accounts))
        .unwrap();
    assert_eq!(stats.owners_scanned, 1);
    assert_eq!(stats.missing_in_index, 1);

    let stats = fx
        .sync()
        .run(SyncRequest::new(SyncMode::Sync).owner(Uuid::new_v4()))
        .unwrap();
    assert_eq!(stats.owners_scanned, 0);
}

#[test]
fn owner_without_root_is_empty() {
    let fx = Fixture::new();
    let fresh = Owner::Account(Uuid::new_v4());
    fx.index.register_owner(&fresh, 0).unwrap();

    let stats = fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(stats.owners_scanned, 2);
    assert!(stats.errors.is_empty());
    assert!(!fx.layout.has_root(&fresh));
}

#[test]
fn encrypted_files_record_plaintext_size() {
    let fx = Fixture::encrypted();
    fx.put("secure/secret.txt", b"twelve bytes");

    fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    let record = fx
        .index
        .get(&fx.owner, &vp("secure/secret.txt"))
        .unwrap()
        .unwrap();
    assert_eq!(record.size, 12);
    assert_eq!(record.encrypted_size, Some(41));
    assert_eq!(record.encryption_method, EncryptionMethod::Server);
    assert_eq!(record.key_id.as_deref(), Some(TEST_KEY_ID));
}

#[test]
fn encrypted_files_without_key_are_recorded_raw() {
    let fx = Fixture::encrypted();
    fx.put("secret.txt", b"twelve bytes");

    let keyless = IndexSync::new(fx.reopen(encryption_off()), fx.index.clone());
    let stats = keyless.run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(stats.records_created, 1);
    assert!(stats.warnings.is_empty());

    let record = fx.index.get(&fx.owner, &vp("secret.txt")).unwrap().unwrap();
    assert_eq!(record.size, 41);
    assert_eq!(record.encrypted_size, None);
    assert_eq!(record.encryption_method, EncryptionMethod::None);
    assert_eq!(record.key_id, None);

    let again = keyless.run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert_eq!(again.records_updated, 0);
}

#[test]
fn header_byte_is_plain_content_when_encryption_is_off() {
    let fx = Fixture::new();
    let mut content = vec![0x01];
    content.extend_from_slice(&[b'x'; 40]);
    fx.put("data.bin", &content);

    let stats = fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    assert!(stats.warnings.is_empty());
    let record = fx.index.get(&fx.owner, &vp("data.bin")).unwrap().unwrap();
    assert_eq!(record.size, 41);
    assert_eq!(record.encryption_method, EncryptionMethod::None);
    assert_eq!(record.key_id, None);
}

#[test]
fn refresh_clears_custom_ordering() {
    let fx = Fixture::new();
    fx.put("a.txt", b"a");
    let mut record = NewRecord::file(&vp("a.txt"), 99);
    record.sort_position = Some(4);
    fx.index.create(&fx.owner, &record).unwrap();

    fx.sync().run(SyncRequest::new(SyncMode::Sync)).unwrap();
    let refreshed = fx.index.get(&fx.owner, &vp("a.txt")).unwrap().unwrap();
    assert_eq!(refreshed.size, 1);
    assert_eq!(refreshed.sort_position, None);
}

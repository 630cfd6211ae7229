//! End-to-end scenarios over the whole store engine.

use std::io::Cursor;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use coffer_server::{ControlChannel, DaemonCoordinator};
use coffer_store::{
    combine_file, decode_file_payload, encode_diff, CheckConfig, CountingProgressSink, Directory,
    EntryFlags, HousekeepingConfig, HousekeepingRun, NeverStop, ObjectId, StoreCheck,
    StoreContext, StripedReader,
};

use crate::harness::{name, put_file, TestStore, TEST_ACCOUNT};

fn read_object(ctx: &StoreContext, id: ObjectId) -> Vec<u8> {
    let mut reader = ctx.open_object(id).unwrap();
    reader.read_remaining().unwrap()
}

/// Scenario 1: put a file, read it back, verify directory and counters.
#[test]
fn put_and_get_single_file() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    let payload = vec![0x5Au8; 100];
    let id = put_file(&mut ctx, ObjectId::ROOT, "doc", &payload, 100);
    assert_eq!(id, ObjectId(2));

    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    assert_eq!(root.entry_count(), 1);
    let entry = root.find_entry_by_id(id).unwrap();
    assert_eq!(entry.name, name("doc"));
    assert_eq!(entry.size_in_blocks, 1);
    assert!(entry.is_file() && entry.is_live());
    let root_blocks = root.size_in_blocks();

    let mut reader = ctx.open_object(id).unwrap();
    assert_eq!(decode_file_payload(&mut reader).unwrap(), payload);

    let info = ctx.account_info().unwrap();
    assert_eq!(info.blocks_used(), 1 + root_blocks as i64);
    ctx.finish().unwrap();
}

/// Scenario 2: upload a new version as a diff, then reassemble the old one.
#[test]
fn version_then_restore() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    let old_payload: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 253) as u8).collect();
    let old_id = put_file(&mut ctx, ObjectId::ROOT, "doc", &old_payload, 100);
    let old_envelope = read_object(&ctx, old_id);

    let mut new_payload = old_payload.clone();
    new_payload[4096] = !new_payload[4096];
    let mut patch = Vec::new();
    encode_diff(
        &new_payload,
        &mut Cursor::new(&old_envelope),
        ObjectId::ROOT,
        200,
        0,
        b"",
        &mut patch,
    )
    .unwrap();

    let new_id = ctx
        .add_file(
            ObjectId::ROOT,
            &name("doc"),
            200,
            0,
            old_id,
            true,
            &mut Cursor::new(patch),
        )
        .unwrap();

    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    let old_entry = root.find_entry_by_id(old_id).unwrap();
    assert!(old_entry.flags.contains(EntryFlags::OLD_VERSION));
    assert_eq!(old_entry.depends_newer, new_id);
    let new_entry = root.find_entry_by_id(new_id).unwrap();
    assert!(new_entry.is_live());
    assert_eq!(new_entry.depends_older, old_id);

    // The new object is the full new content.
    let mut reader = ctx.open_object(new_id).unwrap();
    assert_eq!(decode_file_payload(&mut reader).unwrap(), new_payload);

    // Combining the stored reverse patch with the new object reproduces the
    // original bytes of the old version.
    let mut old_reader = ctx.open_object(old_id).unwrap();
    let mut new_reader = ctx.open_object(new_id).unwrap();
    let mut restored = Vec::new();
    combine_file(&mut old_reader, &mut new_reader, &mut restored).unwrap();
    assert_eq!(restored, old_envelope);
    assert_eq!(
        decode_file_payload(&mut Cursor::new(restored)).unwrap(),
        old_payload
    );
    ctx.finish().unwrap();
}

/// Scenario 3: delete flips flags and counters; undelete restores both.
#[test]
fn delete_and_undelete() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    let id = put_file(&mut ctx, ObjectId::ROOT, "doc", &[1u8; 300], 100);
    let deleted_before = ctx.account_info().unwrap().blocks_in_deleted_files();

    let found = ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
    assert_eq!(found, id);
    let size = ctx
        .get_directory(ObjectId::ROOT)
        .unwrap()
        .find_entry_by_id(id)
        .unwrap()
        .size_in_blocks as i64;
    assert_eq!(
        ctx.account_info().unwrap().blocks_in_deleted_files(),
        deleted_before + size
    );

    assert!(ctx.undelete_file(ObjectId::ROOT, id).unwrap());
    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    assert!(!root.find_entry_by_id(id).unwrap().is_deleted());
    assert_eq!(
        ctx.account_info().unwrap().blocks_in_deleted_files(),
        deleted_before
    );
    ctx.finish().unwrap();
}

/// Scenario 4: housekeeping reclaims the old version of a patch chain and
/// clears the surviving file's dependency link.
#[test]
fn housekeeping_reclaims_old_version() {
    let store = TestStore::new(2, 1000);
    let mut ctx = store.open_context();

    let old_payload: Vec<u8> = (0..4 * 4096u32).map(|i| (i % 239) as u8).collect();
    let old_id = put_file(&mut ctx, ObjectId::ROOT, "doc", &old_payload, 100);
    let old_envelope = read_object(&ctx, old_id);

    let mut new_payload = old_payload.clone();
    new_payload[0] ^= 1;
    let mut patch = Vec::new();
    encode_diff(
        &new_payload,
        &mut Cursor::new(&old_envelope),
        ObjectId::ROOT,
        200,
        0,
        b"",
        &mut patch,
    )
    .unwrap();
    let new_id = ctx
        .add_file(
            ObjectId::ROOT,
            &name("doc"),
            200,
            0,
            old_id,
            true,
            &mut Cursor::new(patch),
        )
        .unwrap();
    ctx.finish().unwrap();

    let blocks_before = {
        let ctx = store.open_read_only();
        let used = ctx.account_info().unwrap().blocks_used();
        used
    };

    let mut run = HousekeepingRun::new(&store.backend, TEST_ACCOUNT, 0, HousekeepingConfig::default());
    let outcome = run
        .run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
        .unwrap();
    assert!(outcome.files_deleted >= 1);

    let mut ctx = store.open_context();
    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    assert!(root.find_entry_by_id(old_id).is_none());
    let new_entry = root.find_entry_by_id(new_id).unwrap();
    assert!(new_entry.depends_older.is_none());

    assert!(!ctx
        .object_exists(old_id, coffer_store::ObjectKind::Any)
        .unwrap());
    let info = ctx.account_info().unwrap();
    assert!(info.blocks_used() < blocks_before);
    assert_eq!(info.blocks_in_old_files(), 0);

    // The surviving version still decodes.
    let mut reader = ctx.open_object(new_id).unwrap();
    assert_eq!(decode_file_payload(&mut reader).unwrap(), new_payload);
    ctx.finish().unwrap();
}

/// Scenario 5: the checker re-homes an unreferenced directory under
/// lost+found, repairing exactly one error; a second run is clean.
#[test]
fn checker_repairs_lost_directory() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();
    let lost = ctx
        .add_directory(ObjectId::ROOT, &name("orphan"), b"", 0)
        .unwrap()
        .id;
    ctx.finish().unwrap();

    // Sever the root's entry, leaving the directory object on disc.
    {
        let set = store.backend.disc_set(0).unwrap();
        let rel = format!("backup/{TEST_ACCOUNT}/o01");
        let mut reader = StripedReader::open(set, &rel).unwrap();
        let bytes = reader.read_remaining().unwrap();
        let mut root = Directory::read_from(&mut Cursor::new(bytes)).unwrap();
        root.delete_entry(lost).unwrap();
        let mut writer = coffer_store::StripedWriter::open(set, &rel, true).unwrap();
        use std::io::Write;
        let mut buf = Vec::new();
        root.write_to(&mut buf).unwrap();
        writer.write_all(&buf).unwrap();
        writer.commit(true).unwrap();
    }

    let mut check = StoreCheck::new(
        &store.backend,
        TEST_ACCOUNT,
        0,
        CheckConfig {
            fix_errors: true,
            quiet: true,
        },
    );
    let report = check.run(&mut CountingProgressSink::default()).unwrap();
    assert_eq!(report.errors_found, 1);
    assert_eq!(report.orphans_rehomed, 1);
    let lf = report.lost_and_found_id.unwrap();

    let mut ctx = store.open_context();
    let lf_dir = ctx.get_directory(lf).unwrap();
    assert!(lf_dir.find_entry_by_id(lost).unwrap().is_dir());
    let moved = ctx.get_directory(lost).unwrap();
    assert_eq!(moved.container_id(), lf);
    ctx.finish().unwrap();

    let mut again = StoreCheck::new(
        &store.backend,
        TEST_ACCOUNT,
        0,
        CheckConfig {
            fix_errors: true,
            quiet: true,
        },
    );
    let report = again.run(&mut CountingProgressSink::default()).unwrap();
    assert_eq!(report.errors_found, 0);
}

/// Scenario 6: housekeeping yields the account lock when the daemon relays
/// a session's release request over the control channel.
#[test]
fn housekeeping_yields_to_session() {
    let store = TestStore::new(0, 10_000);
    let mut ctx = store.open_context();
    // Plenty of deleted files so the reclaim walk has yield points to hit.
    for i in 0..40 {
        put_file(&mut ctx, ObjectId::ROOT, &format!("f{i}"), &[i as u8; 4096], 100);
        ctx.delete_file(ObjectId::ROOT, &name(&format!("f{i}"))).unwrap();
    }
    ctx.finish().unwrap();

    let (tx, rx) = channel();
    let coordinator = Arc::new(DaemonCoordinator::new(tx));

    let backend = store.backend.clone();
    let worker = std::thread::spawn(move || {
        let mut control = ControlChannel::new(rx);
        let mut run = HousekeepingRun::new(&backend, TEST_ACCOUNT, 0, HousekeepingConfig::default());
        run.run_at(1_000_000, &mut control, &mut CountingProgressSink::default())
            .unwrap()
    });

    // Give housekeeping a moment to take the lock, then open a writing
    // session; its lock attempt sends `r0000000a` through the coordinator.
    std::thread::sleep(Duration::from_millis(50));
    let mut session_ctx = StoreContext::new(store.backend.clone(), coordinator, TEST_ACCOUNT, 0);
    session_ctx.set_lock_retry_sleep(Duration::from_millis(100));
    session_ctx.open(true).unwrap();
    assert!(!session_ctx.is_read_only());

    let outcome = worker.join().unwrap();
    assert!(!outcome.skipped_locked);

    // The session can work normally, and the store stays consistent.
    put_file(&mut session_ctx, ObjectId::ROOT, "after", &[9u8; 100], 300);
    session_ctx.finish().unwrap();

    let mut check = StoreCheck::new(
        &store.backend,
        TEST_ACCOUNT,
        0,
        CheckConfig {
            fix_errors: true,
            quiet: true,
        },
    );
    let report = check.run(&mut CountingProgressSink::default()).unwrap();
    assert_eq!(report.errors_found, 0);
}

/// Creating a directory twice with the same name returns the same id with
/// `already_exists` set.
#[test]
fn add_directory_is_idempotent() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    let first = ctx
        .add_directory(ObjectId::ROOT, &name("photos"), b"a", 1)
        .unwrap();
    let second = ctx
        .add_directory(ObjectId::ROOT, &name("photos"), b"b", 2)
        .unwrap();
    assert_eq!(first.id, second.id);
    assert!(!first.already_exists);
    assert!(second.already_exists);
    ctx.finish().unwrap();
}

/// A full cycle over a striped disc set: everything above also works when
/// objects are split into data + parity stripes.
#[test]
fn striped_store_round_trip() {
    let store = TestStore::with_discs(3, 1000, 2000);
    let mut ctx = store.open_context();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let id = put_file(&mut ctx, ObjectId::ROOT, "striped", &payload, 100);

    let mut reader = ctx.open_object(id).unwrap();
    assert_eq!(decode_file_payload(&mut reader).unwrap(), payload);
    ctx.finish().unwrap();

    let mut check = StoreCheck::new(
        &store.backend,
        TEST_ACCOUNT,
        0,
        CheckConfig {
            fix_errors: true,
            quiet: true,
        },
    );
    let report = check.run(&mut CountingProgressSink::default()).unwrap();
    assert_eq!(report.errors_found, 0);
}

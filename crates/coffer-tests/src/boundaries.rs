//! Boundary behaviors from the store contract.

use std::io::Cursor;

use coffer_store::{ObjectId, StoreError, STORE_INFO_SAVE_DELAY};

use crate::harness::{envelope, name, put_file, TestStore};

/// Crossing the hard limit fails the upload, leaves no new object file and
/// leaves the info record untouched.
#[test]
fn add_file_over_hard_limit() {
    let store = TestStore::new(2, 3);
    let mut ctx = store.open_context();

    let used_before = ctx.account_info().unwrap().blocks_used();
    let err = ctx
        .add_file(
            ObjectId::ROOT,
            &name("big"),
            100,
            0,
            ObjectId::NONE,
            true,
            &mut Cursor::new(envelope(&vec![1u8; 10 * 4096], 100)),
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::StorageLimitExceeded { .. }));

    assert_eq!(ctx.account_info().unwrap().blocks_used(), used_before);
    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    assert_eq!(root.entry_count(), 0);
    assert!(!ctx
        .object_exists(ObjectId(2), coffer_store::ObjectKind::Any)
        .unwrap());
    ctx.finish().unwrap();
}

/// A diff-from id that is not in the target directory fails cleanly.
#[test]
fn add_file_with_missing_diff_from() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    // The object exists, but in a different directory.
    let sub = ctx
        .add_directory(ObjectId::ROOT, &name("sub"), b"", 0)
        .unwrap()
        .id;
    let elsewhere = put_file(&mut ctx, sub, "doc", &[1u8; 100], 100);

    let err = ctx
        .add_file(
            ObjectId::ROOT,
            &name("doc"),
            200,
            0,
            elsewhere,
            true,
            &mut Cursor::new(envelope(&[2u8; 100], 200)),
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::DiffFromMissing(id) if id == elsewhere));
    ctx.finish().unwrap();
}

/// Moving over a live name conflicts; over a deleted name it succeeds only
/// when explicitly allowed.
#[test]
fn move_over_deleted_entry() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    let a = put_file(&mut ctx, ObjectId::ROOT, "a", &[1u8; 50], 100);
    put_file(&mut ctx, ObjectId::ROOT, "b", &[2u8; 50], 100);

    let err = ctx
        .move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), true, false)
        .unwrap_err();
    assert!(matches!(err, StoreError::NameAlreadyExists(_)));

    ctx.delete_file(ObjectId::ROOT, &name("b")).unwrap();

    let err = ctx
        .move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), true, false)
        .unwrap_err();
    assert!(matches!(err, StoreError::NameAlreadyExists(_)));

    ctx.move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), true, true)
        .unwrap();
    ctx.finish().unwrap();
}

/// Implausible object ids fail fast with NotFound, without touching disc.
#[test]
fn open_object_id_bounds() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();
    let id = put_file(&mut ctx, ObjectId::ROOT, "doc", &[1u8; 10], 100);

    assert!(matches!(
        ctx.open_object(ObjectId::NONE),
        Err(StoreError::NotFound(_))
    ));

    let last = ctx.account_info().unwrap().last_object_id().as_u64();
    let beyond = ObjectId(last + 2 * STORE_INFO_SAVE_DELAY as u64 + 1);
    assert!(matches!(
        ctx.open_object(beyond),
        Err(StoreError::NotFound(_))
    ));

    // A plausible-but-absent id also reports NotFound, from the disc probe.
    let absent = ObjectId(last + 1);
    assert!(matches!(
        ctx.open_object(absent),
        Err(StoreError::NotFound(_))
    ));

    assert!(ctx.open_object(id).is_ok());
    ctx.finish().unwrap();
}

/// Deleting a file that only exists as an old version still flags it, but
/// reports no current version.
#[test]
fn delete_reports_current_version_only() {
    let store = TestStore::new(1000, 2000);
    let mut ctx = store.open_context();

    put_file(&mut ctx, ObjectId::ROOT, "doc", &[1u8; 10], 100);
    let v2 = put_file(&mut ctx, ObjectId::ROOT, "doc", &[2u8; 10], 200);

    let found = ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
    assert_eq!(found, v2);

    // Everything with the name is now deleted; a second delete is a no-op.
    let found = ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
    assert_eq!(found, ObjectId::NONE);
    ctx.finish().unwrap();
}

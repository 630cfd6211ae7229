//! Store-wide invariants checked against real on-disc state.

use std::io::Cursor;

use coffer_store::{
    naming, striped, AccountInfo, CheckConfig, CountingProgressSink, EntryFlags,
    HousekeepingConfig, HousekeepingRun, NeverStop, ObjectId, RefCountDatabase, StoreCheck,
};

use crate::harness::{name, put_file, TestStore, TEST_ACCOUNT};

/// Sums the striped storage cost of every object file under the account.
fn sum_object_blocks(store: &TestStore) -> u64 {
    let set = store.backend.disc_set(0).unwrap();
    let account_rel = format!("backup/{TEST_ACCOUNT}");
    let mut total = 0;
    let mut stack = vec![(account_rel.clone(), 0u64, 0u32)];
    while let Some((dir, start, depth)) = stack.pop() {
        for file in striped::read_directory(set, &dir, striped::DirListKind::FilesOnly).unwrap() {
            if let Some(leaf) = naming::parse_object_leaf(&file) {
                let id = ObjectId(start | leaf);
                let rel = format!("{account_rel}/{}", naming::object_filename(id));
                total += striped::object_usage_blocks(set, &rel).unwrap();
            }
        }
        for sub in striped::read_directory(set, &dir, striped::DirListKind::DirsOnly).unwrap() {
            if let Some(n) = naming::parse_segment_dir(&sub) {
                stack.push((
                    format!("{dir}/{sub}"),
                    start | (n << (naming::SEGMENT_BITS * (depth + 1))),
                    depth + 1,
                ));
            }
        }
    }
    total
}

fn busy_account(store: &TestStore) {
    let mut ctx = store.open_context();
    for i in 0..6 {
        put_file(
            &mut ctx,
            ObjectId::ROOT,
            &format!("file{i}"),
            &vec![i as u8 + 1; 600 * (i + 1)],
            100 + i as u64,
        );
    }
    // A couple of versions and deletions to exercise the lifecycle flags.
    put_file(&mut ctx, ObjectId::ROOT, "file0", &[0xEE; 700], 400);
    ctx.delete_file(ObjectId::ROOT, &name("file1")).unwrap();
    let sub = ctx
        .add_directory(ObjectId::ROOT, &name("sub"), b"attr", 7)
        .unwrap()
        .id;
    put_file(&mut ctx, sub, "nested", &[5u8; 1000], 500);
    ctx.finish().unwrap();
}

/// Invariant 1: after housekeeping, the info record's blocks-used equals
/// the sum of object file sizes on disc.
#[test]
fn blocks_used_matches_disc_after_housekeeping() {
    let store = TestStore::new(10_000, 20_000);
    busy_account(&store);

    let mut run =
        HousekeepingRun::new(&store.backend, TEST_ACCOUNT, 0, HousekeepingConfig::default());
    run.run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
        .unwrap();

    let set = store.backend.disc_set(0).unwrap();
    let info = AccountInfo::load(set, &format!("backup/{TEST_ACCOUNT}"), TEST_ACCOUNT, true)
        .unwrap();
    assert_eq!(info.blocks_used(), sum_object_blocks(&store) as i64);
}

/// Invariant 3: every object on disc has refcount >= 1; ids with refcount
/// zero have no object file.
#[test]
fn refcounts_cover_disc_objects() {
    let store = TestStore::new(10_000, 20_000);
    busy_account(&store);

    let mut run =
        HousekeepingRun::new(&store.backend, TEST_ACCOUNT, 0, HousekeepingConfig::default());
    run.run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
        .unwrap();

    let set = store.backend.disc_set(0).unwrap();
    let account_rel = format!("backup/{TEST_ACCOUNT}");
    let db = RefCountDatabase::load(set, &account_rel, TEST_ACCOUNT, true).unwrap();

    for raw in 1..=db.last_object_id().as_u64() {
        let id = ObjectId(raw);
        let rel = format!("{account_rel}/{}", naming::object_filename(id));
        let exists = striped::object_exists(set, &rel).unwrap().is_some();
        let count = db.refcount(id);
        if exists {
            assert!(count >= 1, "object {id} on disc has refcount 0");
        } else {
            assert_eq!(count, 0, "missing object {id} has refcount {count}");
        }
    }
}

/// Invariant 4: dependency links are symmetric within a directory.
#[test]
fn patch_chain_links_are_symmetric() {
    let store = TestStore::new(10_000, 20_000);
    let mut ctx = store.open_context();

    let payload: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 250) as u8).collect();
    let v1 = put_file(&mut ctx, ObjectId::ROOT, "doc", &payload, 100);
    let env1 = {
        let mut r = ctx.open_object(v1).unwrap();
        r.read_remaining().unwrap()
    };
    let mut p2 = payload.clone();
    p2[0] ^= 1;
    let mut patch = Vec::new();
    coffer_store::encode_diff(
        &p2,
        &mut Cursor::new(&env1),
        ObjectId::ROOT,
        200,
        0,
        b"",
        &mut patch,
    )
    .unwrap();
    let v2 = ctx
        .add_file(
            ObjectId::ROOT,
            &name("doc"),
            200,
            0,
            v1,
            true,
            &mut Cursor::new(patch),
        )
        .unwrap();

    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    for entry in root.entries() {
        if !entry.depends_older.is_none() {
            let older = root.find_entry_by_id(entry.depends_older).unwrap();
            assert!(older.is_file());
            assert_eq!(older.depends_newer, entry.object_id);
        }
        if !entry.depends_newer.is_none() {
            let newer = root.find_entry_by_id(entry.depends_newer).unwrap();
            assert!(newer.is_file());
            assert_eq!(newer.depends_older, entry.object_id);
        }
    }
    assert_eq!(root.find_entry_by_id(v1).unwrap().depends_newer, v2);
    ctx.finish().unwrap();
}

/// Invariant 2 (after checker): every directory entry's target directory
/// points back at its containing directory.
#[test]
fn container_ids_consistent_after_check() {
    let store = TestStore::new(10_000, 20_000);
    busy_account(&store);

    let mut check = StoreCheck::new(
        &store.backend,
        TEST_ACCOUNT,
        0,
        CheckConfig {
            fix_errors: true,
            quiet: true,
        },
    );
    check.run(&mut CountingProgressSink::default()).unwrap();

    let mut ctx = store.open_context();
    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    let sub_ids: Vec<ObjectId> = root
        .entries_matching(EntryFlags::DIR, EntryFlags::NONE)
        .map(|e| e.object_id)
        .collect();
    for sub in sub_ids {
        let dir = ctx.get_directory(sub).unwrap();
        assert_eq!(dir.container_id(), ObjectId::ROOT);
    }
    ctx.finish().unwrap();
}

/// Invariant 8: housekeeping never reclaims live entries, however tight the
/// soft limit.
#[test]
fn housekeeping_keeps_live_entries() {
    let store = TestStore::new(0, 20_000);
    busy_account(&store);

    let live_before: Vec<ObjectId> = {
        let mut ctx = store.open_context();
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        let live = root
            .entries_matching(
                EntryFlags::FILE,
                EntryFlags::DELETED | EntryFlags::OLD_VERSION,
            )
            .map(|e| e.object_id)
            .collect();
        ctx.finish().unwrap();
        live
    };
    assert!(!live_before.is_empty());

    let mut run =
        HousekeepingRun::new(&store.backend, TEST_ACCOUNT, 0, HousekeepingConfig::default());
    run.run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
        .unwrap();

    let mut ctx = store.open_context();
    for id in live_before {
        assert!(
            ctx.object_exists(id, coffer_store::ObjectKind::File).unwrap(),
            "live object {id} was reclaimed"
        );
    }
    ctx.finish().unwrap();
}

/// The stack survives a striped disc losing one stripe of every object:
/// reads reconstruct from parity.
#[test]
fn parity_reconstruction_after_disc_loss() {
    let store = TestStore::with_discs(3, 10_000, 20_000);
    let mut ctx = store.open_context();
    let payload: Vec<u8> = (0..9000u32).map(|i| (i % 247) as u8).collect();
    let id = put_file(&mut ctx, ObjectId::ROOT, "doc", &payload, 100);
    ctx.finish().unwrap();

    // Remove one whole disc's files (keep the directories).
    let set = store.backend.disc_set(0).unwrap();
    let victim = &set.dirs[1];
    let mut stack = vec![victim.clone()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('o'))
            {
                std::fs::remove_file(path).unwrap();
            }
        }
    }

    // Reads reconstruct every object from the surviving stripes + parity.
    let mut ctx = store.open_context();
    let mut reader = ctx.open_object(id).unwrap();
    assert_eq!(
        coffer_store::decode_file_payload(&mut reader).unwrap(),
        payload
    );
    let root = ctx.get_directory(ObjectId::ROOT).unwrap();
    assert!(root.find_entry_by_id(id).is_some());
    ctx.finish().unwrap();
}

//! Test fixtures: throwaway stores and accounts.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use coffer_store::backend::single_disc_backend;
use coffer_store::{
    encode_file, AccountDatabase, AccountId, AccountManager, DiscSet, HousekeepingCoordinator,
    NullCoordinator, ObjectId, ObjectName, StoreBackend, StoreContext,
};

/// The account id used by the fixtures, `0xA` as in the protocol examples.
pub const TEST_ACCOUNT: AccountId = AccountId(0xA);

/// A temp-directory store with one created account.
pub struct TestStore {
    /// Keeps the temp directory alive for the fixture's lifetime.
    pub root: TempDir,
    /// The backend over the temp discs.
    pub backend: Arc<StoreBackend>,
    /// Path of the account database file.
    pub account_db: PathBuf,
}

impl TestStore {
    /// Creates a single-disc store with an account using the given limits.
    pub fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self::with_discs(1, soft_limit, hard_limit)
    }

    /// Creates a store striped over `discs` directories.
    pub fn with_discs(discs: usize, soft_limit: u64, hard_limit: u64) -> Self {
        let root = TempDir::new().expect("temp dir");
        let backend = if discs <= 1 {
            let dir = root.path().join("disc0");
            std::fs::create_dir_all(&dir).unwrap();
            Arc::new(single_disc_backend(&dir, 4096))
        } else {
            let dirs = (0..discs)
                .map(|i| {
                    let d = root.path().join(format!("disc{i}"));
                    std::fs::create_dir_all(&d).unwrap();
                    d
                })
                .collect();
            Arc::new(StoreBackend::new(vec![DiscSet::new(dirs, 4096)]))
        };

        let account_db = root.path().join("accounts.txt");
        let db = AccountDatabase::load(&account_db).unwrap();
        let mut mgr = AccountManager::new(&backend, db);
        mgr.create_account(TEST_ACCOUNT, 0, soft_limit, hard_limit)
            .unwrap();

        Self {
            root,
            backend,
            account_db,
        }
    }

    /// Opens a writable context for the test account.
    pub fn open_context(&self) -> StoreContext {
        self.open_context_with(Arc::new(NullCoordinator))
    }

    /// Opens a writable context with a specific coordinator.
    pub fn open_context_with(
        &self,
        coordinator: Arc<dyn HousekeepingCoordinator>,
    ) -> StoreContext {
        let mut ctx = StoreContext::new(self.backend.clone(), coordinator, TEST_ACCOUNT, 0);
        ctx.open(true).unwrap();
        ctx
    }

    /// Opens a read-only context.
    pub fn open_read_only(&self) -> StoreContext {
        let mut ctx = StoreContext::new(
            self.backend.clone(),
            Arc::new(NullCoordinator),
            TEST_ACCOUNT,
            0,
        );
        ctx.open(false).unwrap();
        ctx
    }
}

/// Builds an entry name from a str.
pub fn name(s: &str) -> ObjectName {
    ObjectName::from_bytes(s.as_bytes().to_vec())
}

/// Encodes a payload as a full-file envelope with fixed header fields.
pub fn envelope(payload: &[u8], mtime: u64) -> Vec<u8> {
    let mut out = Vec::new();
    encode_file(payload, ObjectId::ROOT, mtime, 0, b"", &mut out).unwrap();
    out
}

/// Uploads a full file into a directory, returning its id.
pub fn put_file(
    ctx: &mut StoreContext,
    parent: ObjectId,
    file_name: &str,
    payload: &[u8],
    mtime: u64,
) -> ObjectId {
    ctx.add_file(
        parent,
        &name(file_name),
        mtime,
        0,
        ObjectId::NONE,
        true,
        &mut Cursor::new(envelope(payload, mtime)),
    )
    .unwrap()
}

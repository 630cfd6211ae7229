//! Account info record.
//!
//! One small binary record per account holding quotas, usage counters, the
//! last allocated object id and the client store marker. Counters are
//! advisory and healed by housekeeping and the checker; `blocks_used` is
//! what admission control trusts. The record is persisted through the
//! striped layer like any object.
//!
//! ```text
//! [u32 magic 'INFO'][u8 version]
//! [u32 account_id][u64 last_object_id]
//! [u64 soft_limit][u64 hard_limit]
//! [i64 blocks_used][i64 blocks_in_current][i64 blocks_in_old]
//! [i64 blocks_in_deleted][i64 blocks_in_directories]
//! [u64 num_files][u64 num_old_files][u64 num_deleted_files][u64 num_dirs]
//! [u8 enabled][u64 client_store_marker][u32 len][account name utf-8]
//! ```

use std::io::Write;

use tracing::debug;

use crate::backend::DiscSet;
use crate::error::{StoreError, StoreResult};
use crate::naming::INFO_FILENAME;
use crate::striped::{StripedReader, StripedWriter};
use crate::types::{AccountId, ObjectId};
use crate::wire;

/// Magic word of the info record (`INFO`).
pub const INFO_MAGIC: u32 = 0x494e_464f;

const INFO_VERSION: u8 = 1;
const MAX_NAME_LEN: u32 = 4096;

/// Per-account quotas, counters and markers.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    account_id: AccountId,
    last_object_id: u64,
    blocks_soft_limit: u64,
    blocks_hard_limit: u64,
    blocks_used: i64,
    blocks_in_current_files: i64,
    blocks_in_old_files: i64,
    blocks_in_deleted_files: i64,
    blocks_in_directories: i64,
    num_files: u64,
    num_old_files: u64,
    num_deleted_files: u64,
    num_directories: u64,
    account_enabled: bool,
    client_store_marker: u64,
    account_name: String,

    read_only: bool,
    modified: bool,
}

impl AccountInfo {
    /// Creates a fresh record for a new account. The root directory is id 1,
    /// so allocation starts at 2.
    pub fn new(account_id: AccountId, soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            account_id,
            last_object_id: ObjectId::ROOT.as_u64(),
            blocks_soft_limit: soft_limit,
            blocks_hard_limit: hard_limit,
            blocks_used: 0,
            blocks_in_current_files: 0,
            blocks_in_old_files: 0,
            blocks_in_deleted_files: 0,
            blocks_in_directories: 0,
            num_files: 0,
            num_old_files: 0,
            num_deleted_files: 0,
            num_directories: 0,
            account_enabled: true,
            client_store_marker: 0,
            account_name: String::new(),
            read_only: false,
            modified: true,
        }
    }

    /// Loads the record from the account root.
    pub fn load(
        set: &DiscSet,
        account_rel: &str,
        expected_account: AccountId,
        read_only: bool,
    ) -> StoreResult<Self> {
        let rel = format!("{account_rel}/{INFO_FILENAME}");
        let mut reader = StripedReader::open(set, &rel)?;
        let bytes = reader.read_remaining()?;
        let mut r = std::io::Cursor::new(bytes);

        let magic = wire::read_u32(&mut r)?;
        if magic != INFO_MAGIC {
            return Err(StoreError::InfoInvalid(format!(
                "bad info magic {magic:#010x}"
            )));
        }
        let mut version = [0u8; 1];
        std::io::Read::read_exact(&mut r, &mut version)?;
        if version[0] != INFO_VERSION {
            return Err(StoreError::InfoInvalid(format!(
                "unsupported info version {}",
                version[0]
            )));
        }

        let account_id = AccountId(wire::read_u32(&mut r)?);
        if account_id != expected_account {
            return Err(StoreError::InfoInvalid(format!(
                "info is for account {account_id}, expected {expected_account}"
            )));
        }

        let last_object_id = wire::read_u64(&mut r)?;
        let blocks_soft_limit = wire::read_u64(&mut r)?;
        let blocks_hard_limit = wire::read_u64(&mut r)?;
        let blocks_used = wire::read_i64(&mut r)?;
        let blocks_in_current_files = wire::read_i64(&mut r)?;
        let blocks_in_old_files = wire::read_i64(&mut r)?;
        let blocks_in_deleted_files = wire::read_i64(&mut r)?;
        let blocks_in_directories = wire::read_i64(&mut r)?;
        let num_files = wire::read_u64(&mut r)?;
        let num_old_files = wire::read_u64(&mut r)?;
        let num_deleted_files = wire::read_u64(&mut r)?;
        let num_directories = wire::read_u64(&mut r)?;
        let mut enabled = [0u8; 1];
        std::io::Read::read_exact(&mut r, &mut enabled)?;
        let client_store_marker = wire::read_u64(&mut r)?;
        let name_bytes = wire::read_blob(&mut r, MAX_NAME_LEN)?;
        let account_name = String::from_utf8(name_bytes)
            .map_err(|_| StoreError::InfoInvalid("account name is not utf-8".into()))?;

        Ok(Self {
            account_id,
            last_object_id,
            blocks_soft_limit,
            blocks_hard_limit,
            blocks_used,
            blocks_in_current_files,
            blocks_in_old_files,
            blocks_in_deleted_files,
            blocks_in_directories,
            num_files,
            num_old_files,
            num_deleted_files,
            num_directories,
            account_enabled: enabled[0] != 0,
            client_store_marker,
            account_name,
            read_only,
            modified: false,
        })
    }

    /// Writes the record back to the account root.
    pub fn save(&mut self, set: &DiscSet, account_rel: &str) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let rel = format!("{account_rel}/{INFO_FILENAME}");
        let mut writer = StripedWriter::open(set, &rel, true)?;

        let mut buf = Vec::with_capacity(160);
        wire::write_u32(&mut buf, INFO_MAGIC)?;
        buf.push(INFO_VERSION);
        wire::write_u32(&mut buf, self.account_id.as_u32())?;
        wire::write_u64(&mut buf, self.last_object_id)?;
        wire::write_u64(&mut buf, self.blocks_soft_limit)?;
        wire::write_u64(&mut buf, self.blocks_hard_limit)?;
        wire::write_i64(&mut buf, self.blocks_used)?;
        wire::write_i64(&mut buf, self.blocks_in_current_files)?;
        wire::write_i64(&mut buf, self.blocks_in_old_files)?;
        wire::write_i64(&mut buf, self.blocks_in_deleted_files)?;
        wire::write_i64(&mut buf, self.blocks_in_directories)?;
        wire::write_u64(&mut buf, self.num_files)?;
        wire::write_u64(&mut buf, self.num_old_files)?;
        wire::write_u64(&mut buf, self.num_deleted_files)?;
        wire::write_u64(&mut buf, self.num_directories)?;
        buf.push(u8::from(self.account_enabled));
        wire::write_u64(&mut buf, self.client_store_marker)?;
        wire::write_blob(&mut buf, self.account_name.as_bytes())?;

        writer.write_all(&buf)?;
        writer.commit(true)?;
        self.modified = false;
        debug!(account = %self.account_id, "saved account info");
        Ok(())
    }

    /// The account this record belongs to.
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Highest object id handed out so far.
    pub fn last_object_id(&self) -> ObjectId {
        ObjectId(self.last_object_id)
    }

    /// Forces the high-water mark up, used by the checker after a scan.
    pub fn raise_last_object_id(&mut self, id: ObjectId) {
        if id.as_u64() > self.last_object_id {
            self.last_object_id = id.as_u64();
            self.modified = true;
        }
    }

    /// Hands out the next object id.
    pub fn allocate_object_id(&mut self) -> ObjectId {
        self.last_object_id += 1;
        self.modified = true;
        ObjectId(self.last_object_id)
    }

    /// True when a mutation has not yet been flushed.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// True when this copy may not be saved.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Soft quota in blocks.
    pub fn blocks_soft_limit(&self) -> u64 {
        self.blocks_soft_limit
    }

    /// Hard quota in blocks.
    pub fn blocks_hard_limit(&self) -> u64 {
        self.blocks_hard_limit
    }

    /// Replaces both limits.
    pub fn set_limits(&mut self, soft: u64, hard: u64) {
        self.blocks_soft_limit = soft;
        self.blocks_hard_limit = hard;
        self.modified = true;
    }

    /// Blocks currently accounted as used.
    pub fn blocks_used(&self) -> i64 {
        self.blocks_used
    }

    /// Blocks in live file versions.
    pub fn blocks_in_current_files(&self) -> i64 {
        self.blocks_in_current_files
    }

    /// Blocks in superseded file versions.
    pub fn blocks_in_old_files(&self) -> i64 {
        self.blocks_in_old_files
    }

    /// Blocks in deleted entries awaiting housekeeping.
    pub fn blocks_in_deleted_files(&self) -> i64 {
        self.blocks_in_deleted_files
    }

    /// Blocks consumed by directory objects.
    pub fn blocks_in_directories(&self) -> i64 {
        self.blocks_in_directories
    }

    /// Adjusts `blocks_used` by a signed delta.
    pub fn change_blocks_used(&mut self, delta: i64) {
        self.blocks_used += delta;
        self.modified = true;
    }

    /// Adjusts the live-file block counter.
    pub fn change_blocks_in_current_files(&mut self, delta: i64) {
        self.blocks_in_current_files += delta;
        self.modified = true;
    }

    /// Adjusts the old-version block counter.
    pub fn change_blocks_in_old_files(&mut self, delta: i64) {
        self.blocks_in_old_files += delta;
        self.modified = true;
    }

    /// Adjusts the deleted-entry block counter.
    pub fn change_blocks_in_deleted_files(&mut self, delta: i64) {
        self.blocks_in_deleted_files += delta;
        self.modified = true;
    }

    /// Adjusts the directory block counter.
    pub fn change_blocks_in_directories(&mut self, delta: i64) {
        self.blocks_in_directories += delta;
        self.modified = true;
    }

    /// Number of live file versions.
    pub fn num_files(&self) -> u64 {
        self.num_files
    }

    /// Number of superseded file versions.
    pub fn num_old_files(&self) -> u64 {
        self.num_old_files
    }

    /// Number of deleted file entries.
    pub fn num_deleted_files(&self) -> u64 {
        self.num_deleted_files
    }

    /// Number of directories, the root included.
    pub fn num_directories(&self) -> u64 {
        self.num_directories
    }

    /// Adjusts the live-file count.
    pub fn adjust_num_files(&mut self, delta: i64) {
        self.num_files = self.num_files.saturating_add_signed(delta);
        self.modified = true;
    }

    /// Adjusts the old-version count.
    pub fn adjust_num_old_files(&mut self, delta: i64) {
        self.num_old_files = self.num_old_files.saturating_add_signed(delta);
        self.modified = true;
    }

    /// Adjusts the deleted-entry count.
    pub fn adjust_num_deleted_files(&mut self, delta: i64) {
        self.num_deleted_files = self.num_deleted_files.saturating_add_signed(delta);
        self.modified = true;
    }

    /// Adjusts the directory count.
    pub fn adjust_num_directories(&mut self, delta: i64) {
        self.num_directories = self.num_directories.saturating_add_signed(delta);
        self.modified = true;
    }

    /// Replaces every usage counter at once; used by housekeeping and the
    /// checker after a full scan.
    #[allow(clippy::too_many_arguments)]
    pub fn set_usage_counters(
        &mut self,
        blocks_used: i64,
        blocks_in_current_files: i64,
        blocks_in_old_files: i64,
        blocks_in_deleted_files: i64,
        blocks_in_directories: i64,
        num_files: u64,
        num_old_files: u64,
        num_deleted_files: u64,
        num_directories: u64,
    ) {
        self.blocks_used = blocks_used;
        self.blocks_in_current_files = blocks_in_current_files;
        self.blocks_in_old_files = blocks_in_old_files;
        self.blocks_in_deleted_files = blocks_in_deleted_files;
        self.blocks_in_directories = blocks_in_directories;
        self.num_files = num_files;
        self.num_old_files = num_old_files;
        self.num_deleted_files = num_deleted_files;
        self.num_directories = num_directories;
        self.modified = true;
    }

    /// Whether logins are accepted for this account.
    pub fn is_enabled(&self) -> bool {
        self.account_enabled
    }

    /// Enables or disables logins.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.account_enabled = enabled;
        self.modified = true;
    }

    /// The opaque marker the client uses to detect state divergence.
    pub fn client_store_marker(&self) -> u64 {
        self.client_store_marker
    }

    /// Replaces the client store marker.
    pub fn set_client_store_marker(&mut self, marker: u64) {
        self.client_store_marker = marker;
        self.modified = true;
    }

    /// Cosmetic account name.
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Replaces the cosmetic account name.
    pub fn set_account_name(&mut self, name: String) {
        self.account_name = name;
        self.modified = true;
    }
}

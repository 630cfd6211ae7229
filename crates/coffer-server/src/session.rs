//! Session command execution.
//!
//! The wire protocol is a thin typed layer: length-prefixed bincode frames
//! carrying [`Command`] and [`Response`] values. Everything interesting
//! happens in the store engine; this module translates between protocol
//! messages and [`StoreContext`] calls and maps errors onto stable
//! response kinds.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use coffer_store::{ObjectId, ObjectKind, StoreContext, StoreError};

use crate::error::{ServerError, ServerResult};

/// Upper bound on a single frame; a file payload arrives inside one.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Client-to-server operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Store a file object in a directory.
    StoreFile {
        /// Parent directory id.
        parent: u64,
        /// Opaque encrypted filename bytes.
        name: Vec<u8>,
        /// Client modification time.
        modification_time: u64,
        /// Hash of the client-side attributes.
        attributes_hash: u64,
        /// Object to diff from; 0 for a full upload.
        diff_from: u64,
        /// Mark existing same-name entries as old versions.
        mark_old: bool,
        /// The encoded envelope (full file or patch).
        payload: Vec<u8>,
    },
    /// Flag all live versions of a name as deleted.
    DeleteFile {
        /// Parent directory id.
        parent: u64,
        /// Opaque encrypted filename bytes.
        name: Vec<u8>,
    },
    /// Clear the deleted flag on an object's entries.
    UndeleteFile {
        /// Parent directory id.
        parent: u64,
        /// The object to restore.
        id: u64,
    },
    /// Create (or find) a subdirectory.
    CreateDirectory {
        /// Parent directory id.
        parent: u64,
        /// Opaque encrypted filename bytes.
        name: Vec<u8>,
        /// Attribute blob for the new directory.
        attributes: Vec<u8>,
        /// Modification time of the attributes.
        attributes_mod_time: u64,
    },
    /// Recursively delete or undelete a directory.
    DeleteDirectory {
        /// The directory to flag.
        id: u64,
        /// True restores instead of deleting.
        undelete: bool,
    },
    /// Move or rename an object.
    Move {
        /// The object to move.
        id: u64,
        /// Source directory.
        from: u64,
        /// Destination directory.
        to: u64,
        /// New name bytes.
        new_name: Vec<u8>,
        /// Move every entry sharing the object's current name.
        move_all_with_same_name: bool,
        /// Permit a deleted entry of the target name at the destination.
        allow_over_deleted: bool,
    },
    /// Replace a directory object's attributes.
    ChangeDirAttributes {
        /// The directory to change.
        id: u64,
        /// New attribute blob.
        attributes: Vec<u8>,
        /// Modification time of the attributes.
        attributes_mod_time: u64,
    },
    /// Replace the attributes on a live file entry.
    ChangeFileAttributes {
        /// Parent directory id.
        parent: u64,
        /// Name of the live entry.
        name: Vec<u8>,
        /// New attribute blob.
        attributes: Vec<u8>,
        /// Hash of the new attributes.
        attributes_hash: u64,
    },
    /// Fetch a directory listing.
    ListDirectory {
        /// The directory to list.
        id: u64,
    },
    /// Fetch an object's raw bytes.
    GetObject {
        /// The object to read.
        id: u64,
    },
    /// Test for an object's existence and kind.
    ObjectExists {
        /// The object to probe.
        id: u64,
        /// 0 = any, 1 = file, 2 = directory.
        kind: u8,
    },
    /// Read usage and limits.
    GetAccountUsage,
    /// Read the client store marker.
    GetClientStoreMarker,
    /// Replace the client store marker.
    SetClientStoreMarker {
        /// New marker value.
        marker: u64,
    },
    /// End the session cleanly.
    Finish,
}

/// One entry in a [`Response::DirectoryListing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDirEntry {
    /// Opaque encrypted name bytes.
    pub name: Vec<u8>,
    /// Referenced object id.
    pub id: u64,
    /// Client modification time.
    pub modification_time: u64,
    /// Storage cost in blocks.
    pub size_in_blocks: u64,
    /// Raw entry flags.
    pub flags: u16,
    /// Attribute hash.
    pub attributes_hash: u64,
    /// Attribute blob.
    pub attributes: Vec<u8>,
    /// Older patch-chain link.
    pub depends_older: u64,
    /// Newer patch-chain link.
    pub depends_newer: u64,
}

/// Server-to-client replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Generic success.
    Ok,
    /// Success carrying an object id (stores, deletes, lookups).
    ObjectId {
        /// The id in question; 0 when nothing matched.
        id: u64,
        /// For directory creation: the name already existed.
        already_exists: bool,
    },
    /// Directory contents.
    DirectoryListing {
        /// The listed directory.
        id: u64,
        /// Attribute blob of the directory itself.
        attributes: Vec<u8>,
        /// Entries in stored order.
        entries: Vec<WireDirEntry>,
    },
    /// Raw object bytes.
    ObjectData {
        /// The encoded object stream.
        bytes: Vec<u8>,
    },
    /// Existence probe result.
    Exists {
        /// Whether a matching object exists.
        exists: bool,
    },
    /// Usage and limits in blocks.
    AccountUsage {
        /// Blocks used.
        used: u64,
        /// Soft limit.
        soft_limit: u64,
        /// Hard limit.
        hard_limit: u64,
    },
    /// Client store marker value.
    Marker {
        /// Current marker.
        marker: u64,
    },
    /// The operation failed; the session continues.
    Error {
        /// Stable machine-readable kind.
        kind: String,
        /// Human-readable description.
        message: String,
    },
    /// Acknowledges [`Command::Finish`].
    Finished,
}

/// Maps a store error onto its stable wire kind.
fn error_kind(e: &StoreError) -> &'static str {
    match e {
        StoreError::Io(_) => "io",
        StoreError::NotFound(_) => "not-found",
        StoreError::Corrupt(_) => "corrupt",
        StoreError::AlreadyLocked { .. } | StoreError::AccountLocked(_) => "account-locked",
        StoreError::ReadOnly => "read-only",
        StoreError::StorageLimitExceeded { .. } => "storage-limit-exceeded",
        StoreError::NameAlreadyExists(_) => "name-already-exists",
        StoreError::EntryNotFound { .. } => "entry-not-found",
        StoreError::DiffFromMissing(_) => "diff-from-missing",
        StoreError::AddedFileDoesNotVerify => "file-does-not-verify",
        StoreError::InfoInvalid(_) => "info-invalid",
        StoreError::IdAllocationFailed => "id-allocation-failed",
        StoreError::AccountNotFound(_) => "account-not-found",
        StoreError::Timeout => "timeout",
    }
}

fn error_response(e: StoreError) -> Response {
    Response::Error {
        kind: error_kind(&e).to_string(),
        message: e.to_string(),
    }
}

/// Executes commands against a store context.
pub struct Session {
    context: StoreContext,
    finished: bool,
}

impl Session {
    /// Wraps an opened context.
    pub fn new(context: StoreContext) -> Self {
        Self {
            context,
            finished: false,
        }
    }

    /// True after a `Finish` command has been handled.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Flushes and unlocks the underlying context.
    pub fn finish(&mut self) -> ServerResult<()> {
        self.context.finish()?;
        self.finished = true;
        Ok(())
    }

    /// Executes one command. Store failures become [`Response::Error`];
    /// the session itself stays healthy.
    pub fn handle(&mut self, command: Command) -> Response {
        debug!(account = %self.context.account(), ?command, "handling command");
        match command {
            Command::StoreFile {
                parent,
                name,
                modification_time,
                attributes_hash,
                diff_from,
                mark_old,
                payload,
            } => {
                let name = coffer_store::ObjectName::from_bytes(name);
                let mut stream = std::io::Cursor::new(payload);
                match self.context.add_file(
                    ObjectId(parent),
                    &name,
                    modification_time,
                    attributes_hash,
                    ObjectId(diff_from),
                    mark_old,
                    &mut stream,
                ) {
                    Ok(id) => Response::ObjectId {
                        id: id.as_u64(),
                        already_exists: false,
                    },
                    Err(e) => error_response(e),
                }
            }
            Command::DeleteFile { parent, name } => {
                let name = coffer_store::ObjectName::from_bytes(name);
                match self.context.delete_file(ObjectId(parent), &name) {
                    Ok(id) => Response::ObjectId {
                        id: id.as_u64(),
                        already_exists: false,
                    },
                    Err(e) => error_response(e),
                }
            }
            Command::UndeleteFile { parent, id } => {
                match self.context.undelete_file(ObjectId(parent), ObjectId(id)) {
                    Ok(_) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }
            Command::CreateDirectory {
                parent,
                name,
                attributes,
                attributes_mod_time,
            } => {
                let name = coffer_store::ObjectName::from_bytes(name);
                match self.context.add_directory(
                    ObjectId(parent),
                    &name,
                    &attributes,
                    attributes_mod_time,
                ) {
                    Ok(outcome) => Response::ObjectId {
                        id: outcome.id.as_u64(),
                        already_exists: outcome.already_exists,
                    },
                    Err(e) => error_response(e),
                }
            }
            Command::DeleteDirectory { id, undelete } => {
                match self.context.delete_directory(ObjectId(id), undelete) {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }
            Command::Move {
                id,
                from,
                to,
                new_name,
                move_all_with_same_name,
                allow_over_deleted,
            } => {
                let new_name = coffer_store::ObjectName::from_bytes(new_name);
                match self.context.move_object(
                    ObjectId(id),
                    ObjectId(from),
                    ObjectId(to),
                    &new_name,
                    move_all_with_same_name,
                    allow_over_deleted,
                ) {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }
            Command::ChangeDirAttributes {
                id,
                attributes,
                attributes_mod_time,
            } => {
                match self.context.change_dir_attributes(
                    ObjectId(id),
                    &attributes,
                    attributes_mod_time,
                ) {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }
            Command::ChangeFileAttributes {
                parent,
                name,
                attributes,
                attributes_hash,
            } => {
                let name = coffer_store::ObjectName::from_bytes(name);
                match self.context.change_file_attributes(
                    ObjectId(parent),
                    &name,
                    &attributes,
                    attributes_hash,
                ) {
                    Ok(Some(id)) => Response::ObjectId {
                        id: id.as_u64(),
                        already_exists: false,
                    },
                    Ok(None) => Response::ObjectId {
                        id: 0,
                        already_exists: false,
                    },
                    Err(e) => error_response(e),
                }
            }
            Command::ListDirectory { id } => match self.context.get_directory(ObjectId(id)) {
                Ok(dir) => Response::DirectoryListing {
                    id: dir.object_id().as_u64(),
                    attributes: dir.attributes().to_vec(),
                    entries: dir
                        .entries()
                        .map(|e| WireDirEntry {
                            name: e.name.as_bytes().to_vec(),
                            id: e.object_id.as_u64(),
                            modification_time: e.modification_time,
                            size_in_blocks: e.size_in_blocks,
                            flags: e.flags.0,
                            attributes_hash: e.attributes_hash,
                            attributes: e.attributes.clone(),
                            depends_older: e.depends_older.as_u64(),
                            depends_newer: e.depends_newer.as_u64(),
                        })
                        .collect(),
                },
                Err(e) => error_response(e),
            },
            Command::GetObject { id } => match self
                .context
                .open_object(ObjectId(id))
                .and_then(|mut r| r.read_remaining())
            {
                Ok(bytes) => Response::ObjectData { bytes },
                Err(e) => error_response(e),
            },
            Command::ObjectExists { id, kind } => {
                let kind = match kind {
                    1 => ObjectKind::File,
                    2 => ObjectKind::Directory,
                    _ => ObjectKind::Any,
                };
                match self.context.object_exists(ObjectId(id), kind) {
                    Ok(exists) => Response::Exists { exists },
                    Err(e) => error_response(e),
                }
            }
            Command::GetAccountUsage => match self.context.disc_usage() {
                Ok((used, soft_limit, hard_limit)) => Response::AccountUsage {
                    used,
                    soft_limit,
                    hard_limit,
                },
                Err(e) => error_response(e),
            },
            Command::GetClientStoreMarker => match self.context.client_store_marker() {
                Ok(marker) => Response::Marker { marker },
                Err(e) => error_response(e),
            },
            Command::SetClientStoreMarker { marker } => {
                match self.context.set_client_store_marker(marker) {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }
            Command::Finish => match self.finish() {
                Ok(()) => Response::Finished,
                Err(e) => {
                    warn!(error = %e, "failed to finish session cleanly");
                    Response::Error {
                        kind: "io".to_string(),
                        message: e.to_string(),
                    }
                }
            },
        }
    }
}

/// Reads one length-prefixed bincode frame.
pub async fn read_frame<T, R>(stream: &mut R) -> ServerResult<T>
where
    T: serde::de::DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    read_frame_with_body_timeout(stream, None).await
}

/// Reads one frame, waiting indefinitely for it to begin but bounding the
/// time the body (the payload included) may take to arrive.
///
/// A timeout mid-frame desynchronises the stream, so it surfaces as
/// [`ServerError::Timeout`] and ends the session rather than the single
/// operation.
pub async fn read_frame_with_body_timeout<T, R>(
    stream: &mut R,
    body_timeout: Option<std::time::Duration>,
) -> ServerResult<T>
where
    T: serde::de::DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ServerError::Protocol(format!("frame of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    match body_timeout {
        None => stream.read_exact(&mut buf).await.map(|_| ())?,
        Some(limit) => match tokio::time::timeout(limit, stream.read_exact(&mut buf)).await {
            Ok(read) => read.map(|_| ())?,
            Err(_) => return Err(ServerError::Timeout),
        },
    }
    bincode::deserialize(&buf).map_err(|e| ServerError::Protocol(e.to_string()))
}

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<T, W>(stream: &mut W, value: &T) -> ServerResult<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(value).map_err(|e| ServerError::Protocol(e.to_string()))?;
    if bytes.len() as u32 > MAX_FRAME_LEN {
        return Err(ServerError::Protocol(format!(
            "frame of {} bytes",
            bytes.len()
        )));
    }
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

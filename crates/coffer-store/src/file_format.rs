//! File object envelope: framed container for encrypted file payloads.
//!
//! The store never decrypts payload blocks; it frames them so that versions
//! of the same logical file can share blocks through patch references.
//!
//! ```text
//! [u32 magic 'fil1' | 'fil0'(read-only compat)]
//! [u64 container_id][u64 modification_time][u64 attributes_hash][u32 options]
//!   options bit 0 -> [u32 len][attributes]
//! [u32 n_blocks]
//! index entry: [i64 location][u64 size][u32 weak][32-byte strong]
//!   location >= 0: literal block at that offset in this stream's data area
//!   location <  0: block (-location - 1) of the companion file
//! [data area: concatenated literal blocks]
//! ```
//!
//! A *full* file has only literal entries. A *patch* mixes references into a
//! companion object (the diff-from file on upload, the `depends_*` target on
//! disc). [`combine_file`] resolves a patch against its companion into a
//! full file; [`reverse_diff_file`] re-expresses an old full file as a patch
//! against a newer one, which is how the store keeps only one full copy per
//! chain.

use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::types::ObjectId;
use crate::wire;

/// Magic word of current-format file objects (`fil1`).
pub const FILE_MAGIC_V1: u32 = 0x6669_6c31;

/// Magic word of the legacy format (`fil0`), accepted for reads only.
pub const FILE_MAGIC_V0: u32 = 0x6669_6c30;

/// Payload bytes framed into one block by the encoder.
pub const ENCODE_BLOCK_SIZE: usize = 4096;

const OPT_HAS_ATTRIBUTES: u32 = 1 << 0;
const MAX_ATTRIBUTES_LEN: u32 = 1024 * 1024;
const MAX_BLOCKS: u32 = 16 * 1024 * 1024;
const STRONG_HASH_LEN: usize = 32;

/// On-disc format generation of a file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStreamFormat {
    /// Current format.
    V1,
    /// Legacy format; readable, never written.
    V0,
}

/// Rolling Adler-style weak checksum used for cheap block matching.
pub fn weak_checksum(data: &[u8]) -> u32 {
    let mut a: u32 = 0;
    let mut b: u32 = 0;
    let len = data.len() as u32;
    for (i, &byte) in data.iter().enumerate() {
        a = (a + byte as u32) & 0xffff;
        b = (b + (len - i as u32) * byte as u32) & 0xffff;
    }
    (b << 16) | a
}

fn strong_hash(data: &[u8]) -> [u8; STRONG_HASH_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; STRONG_HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

#[derive(Debug, Clone)]
struct FileHeader {
    format: FileStreamFormat,
    container_id: ObjectId,
    modification_time: u64,
    attributes_hash: u64,
    attributes: Vec<u8>,
}

impl FileHeader {
    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_u32(w, FILE_MAGIC_V1)?;
        wire::write_u64(w, self.container_id.as_u64())?;
        wire::write_u64(w, self.modification_time)?;
        wire::write_u64(w, self.attributes_hash)?;
        let options = if self.attributes.is_empty() {
            0
        } else {
            OPT_HAS_ATTRIBUTES
        };
        wire::write_u32(w, options)?;
        if options & OPT_HAS_ATTRIBUTES != 0 {
            wire::write_blob(w, &self.attributes)?;
        }
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> StoreResult<Self> {
        let magic = wire::read_u32(r)?;
        let format = match magic {
            FILE_MAGIC_V1 => FileStreamFormat::V1,
            FILE_MAGIC_V0 => FileStreamFormat::V0,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "bad file magic {other:#010x}"
                )))
            }
        };
        let container_id = ObjectId(wire::read_u64(r)?);
        let modification_time = wire::read_u64(r)?;
        let attributes_hash = wire::read_u64(r)?;
        let options = wire::read_u32(r)?;
        let attributes = if options & OPT_HAS_ATTRIBUTES != 0 {
            wire::read_blob(r, MAX_ATTRIBUTES_LEN)?
        } else {
            Vec::new()
        };
        Ok(Self {
            format,
            container_id,
            modification_time,
            attributes_hash,
            attributes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockIndexEntry {
    location: i64,
    size: u64,
    weak: u32,
    strong: [u8; STRONG_HASH_LEN],
}

impl BlockIndexEntry {
    fn is_reference(&self) -> bool {
        self.location < 0
    }

    fn referenced_block(&self) -> usize {
        debug_assert!(self.is_reference());
        (-(self.location) - 1) as usize
    }

    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_i64(w, self.location)?;
        wire::write_u64(w, self.size)?;
        wire::write_u32(w, self.weak)?;
        w.write_all(&self.strong)
    }

    fn read_from(r: &mut impl Read) -> std::io::Result<Self> {
        let location = wire::read_i64(r)?;
        let size = wire::read_u64(r)?;
        let weak = wire::read_u32(r)?;
        let mut strong = [0u8; STRONG_HASH_LEN];
        r.read_exact(&mut strong)?;
        Ok(Self {
            location,
            size,
            weak,
            strong,
        })
    }
}

/// A parsed envelope: header and index, with the data area left in place.
struct Envelope {
    header: FileHeader,
    index: Vec<BlockIndexEntry>,
    data_offset: u64,
    data_len: u64,
}

fn parse_envelope<R: Read + Seek>(r: &mut R) -> StoreResult<Envelope> {
    let total_len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;

    let header = FileHeader::read_from(r)?;
    let n = wire::read_u32(r)?;
    if n > MAX_BLOCKS {
        return Err(StoreError::Corrupt(format!(
            "block index claims {n} blocks"
        )));
    }
    let mut index = Vec::with_capacity(n as usize);
    for _ in 0..n {
        index.push(BlockIndexEntry::read_from(r)?);
    }
    let data_offset = r.stream_position()?;
    if data_offset > total_len {
        return Err(StoreError::Corrupt("index overruns stream".into()));
    }
    Ok(Envelope {
        header,
        index,
        data_offset,
        data_len: total_len - data_offset,
    })
}

/// Outcome of [`verify_encoded_file_format`].
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    /// The container directory id recorded in the header.
    pub container_id: ObjectId,
    /// Number of blocks in the index.
    pub num_blocks: u32,
    /// True when the stream is a patch (contains reference entries).
    pub has_references: bool,
    /// Format generation found in the magic word.
    pub format: FileStreamFormat,
}

/// Structurally verifies a file envelope.
///
/// Checks the magic word, walks the block index, and confirms that every
/// literal block lies within the data area without overlapping its
/// neighbours. Block contents are opaque and not hashed here.
pub fn verify_encoded_file_format<R: Read + Seek>(r: &mut R) -> StoreResult<VerifiedEnvelope> {
    let envelope = parse_envelope(r)?;

    let mut literals: Vec<(u64, u64)> = Vec::new();
    let mut has_references = false;
    for entry in &envelope.index {
        if entry.is_reference() {
            has_references = true;
            continue;
        }
        let offset = entry.location as u64;
        let end = offset
            .checked_add(entry.size)
            .ok_or_else(|| StoreError::Corrupt("block extent overflows".into()))?;
        if end > envelope.data_len {
            return Err(StoreError::Corrupt(format!(
                "block at {offset} runs past data area ({} > {})",
                end, envelope.data_len
            )));
        }
        literals.push((offset, end));
    }

    literals.sort_unstable();
    for pair in literals.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(StoreError::Corrupt(format!(
                "blocks overlap at offset {}",
                pair[1].0
            )));
        }
    }

    Ok(VerifiedEnvelope {
        container_id: envelope.header.container_id,
        num_blocks: envelope.index.len() as u32,
        has_references,
        format: envelope.header.format,
    })
}

fn read_literal_block<R: Read + Seek>(
    r: &mut R,
    envelope: &Envelope,
    entry: &BlockIndexEntry,
) -> StoreResult<Vec<u8>> {
    debug_assert!(!entry.is_reference());
    r.seek(SeekFrom::Start(envelope.data_offset + entry.location as u64))?;
    let mut buf = vec![0u8; entry.size as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Splits a payload into encode-sized chunks.
fn chunk_payload(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload.chunks(ENCODE_BLOCK_SIZE)
}

fn write_envelope(
    header: &FileHeader,
    index: &[BlockIndexEntry],
    data: &[Vec<u8>],
    out: &mut impl Write,
) -> StoreResult<()> {
    header.write_to(out)?;
    wire::write_u32(out, index.len() as u32)?;
    for entry in index {
        entry.write_to(out)?;
    }
    for block in data {
        out.write_all(block)?;
    }
    Ok(())
}

/// Encodes a payload as a full (all-literal) file object.
///
/// Layout is canonical: blocks appear in payload order at sequential
/// offsets, so identical inputs always produce identical bytes.
pub fn encode_file(
    payload: &[u8],
    container_id: ObjectId,
    modification_time: u64,
    attributes_hash: u64,
    attributes: &[u8],
    out: &mut impl Write,
) -> StoreResult<()> {
    let header = FileHeader {
        format: FileStreamFormat::V1,
        container_id,
        modification_time,
        attributes_hash,
        attributes: attributes.to_vec(),
    };

    let mut index = Vec::new();
    let mut data = Vec::new();
    let mut offset: i64 = 0;
    for chunk in chunk_payload(payload) {
        index.push(BlockIndexEntry {
            location: offset,
            size: chunk.len() as u64,
            weak: weak_checksum(chunk),
            strong: strong_hash(chunk),
        });
        offset += chunk.len() as i64;
        data.push(chunk.to_vec());
    }

    write_envelope(&header, &index, &data, out)
}

/// Encodes a payload as a patch against `other`, reusing any block whose
/// content already exists there.
///
/// This is the client-side half of the diff protocol; the server only ever
/// receives its output. Returns true when at least one block was shared.
pub fn encode_diff<R: Read + Seek>(
    payload: &[u8],
    other: &mut R,
    container_id: ObjectId,
    modification_time: u64,
    attributes_hash: u64,
    attributes: &[u8],
    out: &mut impl Write,
) -> StoreResult<bool> {
    let other_env = parse_envelope(other)?;

    let mut by_strong: std::collections::HashMap<[u8; STRONG_HASH_LEN], usize> =
        std::collections::HashMap::new();
    for (i, entry) in other_env.index.iter().enumerate() {
        if !entry.is_reference() {
            by_strong.entry(entry.strong).or_insert(i);
        }
    }

    let header = FileHeader {
        format: FileStreamFormat::V1,
        container_id,
        modification_time,
        attributes_hash,
        attributes: attributes.to_vec(),
    };

    let mut index = Vec::new();
    let mut data = Vec::new();
    let mut offset: i64 = 0;
    let mut shared = false;
    for chunk in chunk_payload(payload) {
        let strong = strong_hash(chunk);
        match by_strong.get(&strong) {
            Some(&other_idx) if other_env.index[other_idx].size == chunk.len() as u64 => {
                shared = true;
                index.push(BlockIndexEntry {
                    location: -(other_idx as i64) - 1,
                    size: chunk.len() as u64,
                    weak: weak_checksum(chunk),
                    strong,
                });
            }
            _ => {
                index.push(BlockIndexEntry {
                    location: offset,
                    size: chunk.len() as u64,
                    weak: weak_checksum(chunk),
                    strong,
                });
                offset += chunk.len() as i64;
                data.push(chunk.to_vec());
            }
        }
    }

    write_envelope(&header, &index, &data, out)?;
    Ok(shared)
}

/// Resolves a patch against its companion, producing a full file object.
///
/// The output carries the patch's header and attributes with every block
/// literal in canonical layout; combining a freshly encoded full file is the
/// identity.
pub fn combine_file<P, O>(patch: &mut P, other: &mut O, out: &mut impl Write) -> StoreResult<()>
where
    P: Read + Seek,
    O: Read + Seek,
{
    let patch_env = parse_envelope(patch)?;
    let other_env = parse_envelope(other)?;

    let mut index = Vec::with_capacity(patch_env.index.len());
    let mut data = Vec::with_capacity(patch_env.index.len());
    let mut offset: i64 = 0;
    for entry in &patch_env.index {
        let block = if entry.is_reference() {
            let target = entry.referenced_block();
            let other_entry = other_env.index.get(target).ok_or_else(|| {
                StoreError::Corrupt(format!("patch references missing block {target}"))
            })?;
            if other_entry.is_reference() {
                return Err(StoreError::Corrupt(format!(
                    "patch references non-literal block {target}; companion must be combined first"
                )));
            }
            read_literal_block(other, &other_env, other_entry)?
        } else {
            read_literal_block(patch, &patch_env, entry)?
        };

        index.push(BlockIndexEntry {
            location: offset,
            size: block.len() as u64,
            weak: entry.weak,
            strong: entry.strong,
        });
        offset += block.len() as i64;
        data.push(block);
    }

    write_envelope(&patch_env.header, &index, &data, out)
}

/// Re-expresses `old_file` as a patch against `new_file`.
///
/// Every old block whose content also appears in the new file becomes a
/// reference; the rest stay literal. Returns true when *no* block could be
/// shared; the caller then stores both files independently and must not
/// link them.
pub fn reverse_diff_file<N, O>(
    new_file: &mut N,
    old_file: &mut O,
    out: &mut impl Write,
) -> StoreResult<bool>
where
    N: Read + Seek,
    O: Read + Seek,
{
    let new_env = parse_envelope(new_file)?;
    let old_env = parse_envelope(old_file)?;

    let mut by_strong: std::collections::HashMap<[u8; STRONG_HASH_LEN], usize> =
        std::collections::HashMap::new();
    for (i, entry) in new_env.index.iter().enumerate() {
        if !entry.is_reference() {
            by_strong.entry(entry.strong).or_insert(i);
        }
    }

    let mut index = Vec::with_capacity(old_env.index.len());
    let mut data = Vec::new();
    let mut offset: i64 = 0;
    let mut shared_any = false;
    for entry in &old_env.index {
        if entry.is_reference() {
            return Err(StoreError::Corrupt(
                "old file is already a patch; combine it before reverse-diffing".into(),
            ));
        }
        match by_strong.get(&entry.strong) {
            Some(&new_idx) if new_env.index[new_idx].size == entry.size => {
                shared_any = true;
                index.push(BlockIndexEntry {
                    location: -(new_idx as i64) - 1,
                    size: entry.size,
                    weak: entry.weak,
                    strong: entry.strong,
                });
            }
            _ => {
                let block = read_literal_block(old_file, &old_env, entry)?;
                index.push(BlockIndexEntry {
                    location: offset,
                    size: block.len() as u64,
                    weak: entry.weak,
                    strong: entry.strong,
                });
                offset += block.len() as i64;
                data.push(block);
            }
        }
    }

    write_envelope(&old_env.header, &index, &data, out)?;
    Ok(!shared_any)
}

/// Extracts the payload of a full file object.
///
/// Fails on patches: references cannot be resolved without the companion.
pub fn decode_file_payload<R: Read + Seek>(r: &mut R) -> StoreResult<Vec<u8>> {
    let envelope = parse_envelope(r)?;
    let mut out = Vec::new();
    for entry in &envelope.index {
        if entry.is_reference() {
            return Err(StoreError::Corrupt(
                "cannot decode a patch without its companion".into(),
            ));
        }
        out.extend_from_slice(&read_literal_block(r, &envelope, entry)?);
    }
    Ok(out)
}

/// Reads the attribute blob and hash out of an envelope header.
pub fn read_file_attributes<R: Read + Seek>(r: &mut R) -> StoreResult<(Vec<u8>, u64)> {
    let envelope = parse_envelope(r)?;
    Ok((envelope.header.attributes, envelope.header.attributes_hash))
}

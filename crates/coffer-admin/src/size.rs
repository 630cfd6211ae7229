//! Size literal parsing for limits.
//!
//! Limits are stored in blocks; operators write them as `<n>B` (blocks),
//! `<n>M` (MiB) or `<n>G` (GiB), converted through the disc set's block
//! size.

use anyhow::{anyhow, bail, Result};

/// Parses a size literal into blocks.
pub fn parse_size_literal(text: &str, block_size: u64) -> Result<u64> {
    let text = text.trim();
    let mut chars = text.chars();
    let suffix = match chars.next_back() {
        Some(c) => c,
        None => bail!("empty size literal"),
    };
    let number = chars.as_str();
    let value: u64 = number
        .parse()
        .map_err(|_| anyhow!("bad size literal '{text}': expected <n>B, <n>M or <n>G"))?;

    let bytes_per_unit = match suffix {
        'B' | 'b' => return Ok(value),
        'M' | 'm' => 1024 * 1024,
        'G' | 'g' => 1024u64 * 1024 * 1024,
        _ => bail!("bad size suffix in '{text}': expected B, M or G"),
    };
    Ok(value
        .checked_mul(bytes_per_unit)
        .ok_or_else(|| anyhow!("size literal '{text}' overflows"))?
        .div_ceil(block_size))
}

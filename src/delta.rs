//! Block-matching delta encoding for Update payloads.
//!
//! The old content is cut into fixed blocks indexed by a weak rolling
//! checksum; the new content is scanned with a sliding window and every window
//! whose weak and strong (BLAKE3) hashes match an old block becomes a `Copy`.
//! Everything else is emitted as literal `Insert` bytes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// Why a delta could not be replayed against a base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRangeError {
    pub offset: u64,
    pub length: u64,
    pub base_len: usize,
}

impl std::fmt::Display for DeltaRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "copy of {} bytes at {} exceeds base of {} bytes",
            self.length, self.offset, self.base_len
        )
    }
}

const MOD_ADLER: u32 = 65521;

/// Adler-style checksum over a window, updatable in O(1) per byte.
struct WeakHash {
    a: u32,
    b: u32,
    len: u32,
}

impl WeakHash {
    fn over(window: &[u8]) -> Self {
        // Defer the modular reduction to the end of the block.
        let (mut a, mut b) = (1u64, 0u64);
        for &byte in window {
            a += u64::from(byte);
            b += a;
        }
        WeakHash {
            a: (a % u64::from(MOD_ADLER)) as u32,
            b: (b % u64::from(MOD_ADLER)) as u32,
            len: window.len() as u32,
        }
    }

    fn roll(&mut self, out: u8, incoming: u8) {
        let out = u32::from(out);
        let incoming = u32::from(incoming);
        self.a = (self.a + MOD_ADLER - out + incoming) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a - (out * self.len) % MOD_ADLER) % MOD_ADLER;
    }

    fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// Signatures of every block of the base, keyed by weak hash.
struct BlockIndex<'a> {
    base: &'a [u8],
    by_weak: HashMap<u32, Vec<(blake3::Hash, usize)>>,
}

impl<'a> BlockIndex<'a> {
    fn build(base: &'a [u8]) -> Self {
        let mut by_weak: HashMap<u32, Vec<(blake3::Hash, usize)>> =
            HashMap::with_capacity(base.len() / BLOCK_SIZE + 1);
        for (i, block) in base.chunks(BLOCK_SIZE).enumerate() {
            by_weak
                .entry(WeakHash::over(block).value())
                .or_default()
                .push((blake3::hash(block), i * BLOCK_SIZE));
        }
        BlockIndex { base, by_weak }
    }

    /// Locate a base block identical to `window`, returning (offset, length).
    fn find(&self, weak: u32, window: &[u8]) -> Option<(usize, usize)> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .find(|(hash, _)| *hash == strong)
            .map(|&(_, offset)| (offset, (offset + BLOCK_SIZE).min(self.base.len()) - offset))
    }
}

/// Encode `target` as a sequence of operations against `base`.
pub fn encode(base: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    if target.is_empty() {
        return Vec::new();
    }
    if base.is_empty() || target.len() < BLOCK_SIZE {
        return vec![DeltaOp::Insert { data: target.to_vec() }];
    }

    let index = BlockIndex::build(base);
    let mut ops = Vec::new();
    let mut literal = Vec::new();
    let mut pos = 0usize;
    let mut weak = WeakHash::over(&target[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= target.len() {
        let window = &target[pos..pos + BLOCK_SIZE];
        match index.find(weak.value(), window) {
            Some((offset, length)) => {
                if !literal.is_empty() {
                    ops.push(DeltaOp::Insert { data: std::mem::take(&mut literal) });
                }
                push_copy(&mut ops, offset as u64, length as u64);
                pos += length;
                if pos + BLOCK_SIZE <= target.len() {
                    weak = WeakHash::over(&target[pos..pos + BLOCK_SIZE]);
                }
            }
            None => {
                literal.push(target[pos]);
                pos += 1;
                if pos + BLOCK_SIZE <= target.len() {
                    weak.roll(target[pos - 1], target[pos + BLOCK_SIZE - 1]);
                }
            }
        }
    }

    literal.extend_from_slice(&target[pos..]);
    if !literal.is_empty() {
        ops.push(DeltaOp::Insert { data: literal });
    }
    ops
}

/// Merge adjacent copies so sequential runs of old blocks cost one op.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, length: u64) {
    if let Some(DeltaOp::Copy { offset: prev, length: prev_len }) = ops.last_mut() {
        if *prev + *prev_len == offset {
            *prev_len += length;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, length });
}

/// Rebuild the target from `base` and `ops`.
pub fn decode(base: &[u8], ops: &[DeltaOp]) -> Result<Vec<u8>, DeltaRangeError> {
    // Every range is checked before anything is reserved.
    let mut copied: u64 = 0;
    let mut inserted: u64 = 0;
    for op in ops {
        match op {
            DeltaOp::Copy { offset, length } => {
                let range_error = DeltaRangeError {
                    offset: *offset,
                    length: *length,
                    base_len: base.len(),
                };
                offset
                    .checked_add(*length)
                    .filter(|end| *end <= base.len() as u64)
                    .ok_or_else(|| range_error.clone())?;
                copied = copied.checked_add(*length).ok_or(range_error)?;
            }
            DeltaOp::Insert { data } => inserted = inserted.saturating_add(data.len() as u64),
        }
    }
    let capacity = copied.min(base.len() as u64).saturating_add(inserted);
    let mut out = Vec::with_capacity(usize::try_from(capacity).unwrap_or(usize::MAX));

    for op in ops {
        match op {
            DeltaOp::Copy { offset, length } => {
                // Ranges were validated above.
                let start = *offset as usize;
                out.extend_from_slice(&base[start..start + *length as usize]);
            }
            DeltaOp::Insert { data } => out.extend_from_slice(data),
        }
    }
    Ok(out)
}

use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::types::Hash;

pub const BLOCK_PART_SIZE_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("part {index} exceeds the part size")]
    OversizedPart { index: u32 },
    #[error("part set is incomplete ({count}/{total})")]
    Incomplete { count: u32, total: u32 },
    #[error("reassembled payload does not match the part set hash")]
    HashMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

/// A block split into fixed-size parts for gossip. The header hash covers the
/// whole payload and is checked when the set completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    pub fn from_data(data: &[u8]) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(BLOCK_PART_SIZE_BYTES).collect()
        };
        let total = chunks.len() as u32;
        let parts = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Some(Part {
                    index: i as u32,
                    bytes: c.to_vec(),
                })
            })
            .collect();
        Self {
            header: PartSetHeader {
                total,
                hash: sha256(data),
            },
            parts,
            count: total,
        }
    }

    pub fn from_header(header: PartSetHeader) -> Self {
        let parts = vec![None; header.total as usize];
        Self {
            header,
            parts,
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Idempotent: re-adding a known part returns Ok(false).
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfRange {
                index: part.index,
                total: self.header.total,
            });
        }
        if part.bytes.len() > BLOCK_PART_SIZE_BYTES {
            return Err(PartSetError::OversizedPart { index: part.index });
        }
        let slot = &mut self.parts[part.index as usize];
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Reassemble the payload, verifying it against the header hash.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.header.total,
            });
        }
        let mut out = Vec::new();
        for p in &self.parts {
            out.extend_from_slice(&p.as_ref().expect("complete part set").bytes);
        }
        if sha256(&out) != self.header.hash {
            return Err(PartSetError::HashMismatch);
        }
        Ok(out)
    }
}
